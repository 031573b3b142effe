//! Delivering control to a domain's upcall entry: thread creation and
//! termination, brand execution and completion, and bootstrap.

use log::{debug, warn};

use crate::common::measurement::MeasEvent;
use crate::common::structures::{SyscallError, SyscallResult};
use crate::ipc::SchedEvt;
use crate::object::SpdId;
use crate::task_manager::{InvFrame, ThdHandle, ThdId};

use super::Kernel;

/// Why a thread enters a domain at its upcall entry. Passed in the
/// `option` register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum UpcallReason {
    BrandExec = 0,
    BrandComplete = 1,
    Bootstrap = 2,
    Create = 3,
    Destroy = 4,
}

impl Kernel {
    /// Pops every frame of `t`, giving up their composite references.
    /// Returns the domain of the origin frame.
    pub(super) fn release_frames(&mut self, t: ThdHandle) -> Option<SpdId> {
        let mut origin = None;
        while let Some(f) = self.threads.expect_mut(t).stack.pop() {
            origin = Some(f.spd);
            self.mpds.release(f.mpd);
        }
        origin
    }

    /// Restarts `uc` at `dest`'s upcall entry with a single origin frame.
    /// The thread's previous frames must already be released.
    pub(super) fn upcall_setup(&mut self, uc: ThdHandle, dest: SpdId, reason: UpcallReason, args: [usize; 3]) {
        let spd = self.spds.expect_live(dest);
        let (entry, c) = (spd.upcall_entry, spd.composite);
        let r = self.mpds.take(c);
        let thd = self.threads.expect_mut(uc);
        thd.set_upcall_regs(entry, reason as usize, args[0], args[1], args[2]);
        thd.stack.set_origin(InvFrame::origin(dest, r));
    }

    /// Runs `uc`, switching away from `prev` when it is another thread.
    pub(super) fn upcall_execute(&mut self, uc: ThdHandle, prev: Option<ThdHandle>) {
        match prev {
            Some(p) if p != uc => self.switch_thread_context(p, uc),
            _ => {
                if let Some(c) = self.thd_composite(uc) {
                    self.open_composite(c);
                }
            }
        }
    }

    /// A normal thread returned from its origin frame: hand it to its root
    /// scheduler to be reclaimed.
    pub(super) fn thd_ret_term_upcall(&mut self, curr: ThdHandle) -> ThdHandle {
        let origin = self.release_frames(curr);
        let dest = match self.threads.expect(curr).sched_at(0).or(origin) {
            Some(dest) => dest,
            None => panic!("terminating thread {} has nowhere to go", self.thread_id(curr)),
        };
        self.upcall_setup(curr, dest, UpcallReason::Destroy, [0; 3]);
        self.upcall_execute(curr, None);
        curr
    }

    /// Starts serving one pending request of `uc`'s brand. The thread's
    /// frames must already be released.
    pub(super) fn sched_tailcall_pending_upcall(&mut self, uc: ThdHandle) -> ThdHandle {
        let thd = self.threads.expect(uc);
        assert!(thd.is_active_upcall(), "pending upcall on inactive thread {}", thd.id());
        let brand = match thd.upcall() {
            Some(u) => u.brand,
            None => unreachable!(),
        };
        let b = match self.threads.expect(brand).brand() {
            Some(b) => b,
            None => panic!("upcall {} bound to a thread that is not a brand", thd.id()),
        };
        assert!(b.take_pending(), "no pending request on brand {:?}", brand);
        let dest = b.dest;

        self.upcall_setup(uc, dest, UpcallReason::BrandExec, [0; 3]);
        self.upcall_execute(uc, None);
        self.meas.event(MeasEvent::BrandPendExecute);
        self.meas.event(MeasEvent::FinishedBrands);
        uc
    }

    /// An active upcall returned from its origin frame. Serve the next
    /// pending request, go back to the thread it interrupted, or ask the
    /// root scheduler what to do next.
    pub(super) fn brand_execution_completion(&mut self, curr: ThdHandle) -> ThdHandle {
        let thd = self.threads.expect(curr);
        assert!(thd.is_active_upcall());
        let brand = match thd.upcall() {
            Some(u) => u.brand,
            None => unreachable!(),
        };
        let origin = self.release_frames(curr);

        let pending = self.threads.expect(brand).brand().map_or(0, |b| b.pending());
        if pending > 0 {
            return self.sched_tailcall_pending_upcall(curr);
        }

        let prev = match self.threads.expect(curr).interrupted() {
            Some(prev) => prev,
            None => {
                let dest = match self.threads.expect(curr).sched_at(0).or(origin) {
                    Some(dest) => dest,
                    None => panic!("completed upcall {} has no scheduler", self.thread_id(curr)),
                };
                self.upcall_setup(curr, dest, UpcallReason::BrandComplete, [0; 3]);
                self.upcall_execute(curr, None);
                self.meas.event(MeasEvent::BrandCompletionUc);
                return curr;
            }
        };
        self.meas.event(MeasEvent::BrandSchedPreempted);
        self.meas.event(MeasEvent::FinishedBrands);

        self.threads.break_preemption_chain(curr);
        self.threads.expect_mut(curr).ready_upcall();
        self.switch_thread_context(curr, prev);
        self.threads.remove_preempted_status(prev);
        self.update_sched_evts(prev, SchedEvt::Nil, curr, SchedEvt::BrandReady);
        prev
    }

    /// Restarts the running thread in `dest_spd`, which must trust the
    /// calling domain. Used to give new components their first thread.
    pub fn upcall(&mut self, spd_id: SpdId, dest_spd: SpdId) -> SyscallResult<ThdId> {
        let cur = self.current();
        let dest = self.spds.get(dest_spd);
        let curr_spd = self.thd_validate_get_current_spd(cur, spd_id);
        let (dest, curr_spd) = match (dest, curr_spd) {
            (Some(dest), Ok(curr_spd)) => (dest, curr_spd),
            _ => {
                debug!("upcall attempt failed - dest_spd = {}, curr_spd = {}.", dest_spd, spd_id);
                return Err(SyscallError::InvalidSpd);
            }
        };
        if !self.caps.any_cap_to(dest.cap_base, dest.cap_range, curr_spd) {
            warn!("upcall attempted from {} to {} without trust relation.", curr_spd, dest_spd);
            return Err(SyscallError::NoTrust);
        }

        self.release_frames(cur);
        self.upcall_setup(cur, dest_spd, UpcallReason::Bootstrap, [0; 3]);
        self.upcall_execute(cur, None);
        self.meas.event(MeasEvent::Upcalls);
        Ok(self.thread_id(cur))
    }
}
