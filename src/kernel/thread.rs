use bit_field::BitField;
use log::debug;

use crate::common::measurement::MeasEvent;
use crate::common::structures::{SyscallError, SyscallResult};
use crate::common::utils::cpu_id;
use crate::ipc::SchedEvt;
use crate::object::SpdId;
use crate::task_manager::{initialize_sched_info, thd_scheduled_by, ThdHandle, ThdId};

use super::upcall::UpcallReason;
use super::Kernel;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ThdCntlOp {
    /// Domain of the frame at an offset.
    InvFrame = 0,
    /// Instruction at which the frame at an offset resumes.
    InvFrameIp = 1,
}

impl ThdCntlOp {
    pub fn from_raw(op: u16) -> Option<Self> {
        match op {
            0 => Some(Self::InvFrame),
            1 => Some(Self::InvFrameIp),
            _ => None,
        }
    }
}

/// Flags of the thread switch request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchFlags(u16);

impl SwitchFlags {
    const TAILCALL: usize = 0;
    const SYNC_BLOCK: usize = 1;
    const SYNC_UNBLOCK: usize = 2;
    const EXCL_YIELD: usize = 3;

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// The calling upcall is done with its event.
    #[inline]
    pub fn tailcall(&self) -> bool {
        self.0.get_bit(Self::TAILCALL)
    }

    /// Wait for the lock owner named in the request.
    #[inline]
    pub fn sync_block(&self) -> bool {
        self.0.get_bit(Self::SYNC_BLOCK)
    }

    #[inline]
    pub fn sync_unblock(&self) -> bool {
        self.0.get_bit(Self::SYNC_UNBLOCK)
    }

    /// Only a scheduler at least as authoritative may resume the caller.
    #[inline]
    pub fn excl_yield(&self) -> bool {
        self.0.get_bit(Self::EXCL_YIELD)
    }

    #[inline]
    fn sync(&self) -> bool {
        self.sync_block() || self.sync_unblock()
    }

    pub fn with_tailcall(mut self) -> Self {
        self.0.set_bit(Self::TAILCALL, true);
        self
    }

    pub fn with_sync_block(mut self) -> Self {
        self.0.set_bit(Self::SYNC_BLOCK, true);
        self
    }

    pub fn with_sync_unblock(mut self) -> Self {
        self.0.set_bit(Self::SYNC_UNBLOCK, true);
        self
    }

    pub fn with_excl_yield(mut self) -> Self {
        self.0.set_bit(Self::EXCL_YIELD, true);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchOutcome {
    /// Thread now running.
    pub next: ThdId,
    /// `next` resumes from preemption rather than from a switch.
    pub preempted: bool,
}

impl Kernel {
    /// Creates a thread that starts with a `Create` upcall into the calling
    /// scheduler.
    pub fn create_thread(&mut self, spd_id: SpdId, args: [usize; 3]) -> SyscallResult<ThdId> {
        let cur = self.current();
        let spd_id = self.thd_validate_get_current_spd(cur, spd_id)?;
        let sched = self.spds.expect_live(spd_id);
        if !sched.is_scheduler() || !thd_scheduled_by(self.threads.expect(cur), sched) {
            debug!("create_thread: non-scheduler {} attempted to create thread.", spd_id);
            return Err(SyscallError::NotScheduler);
        }
        let h = match self.threads.alloc(cpu_id()) {
            Some(h) => h,
            None => {
                debug!("create_thread: could not allocate thread.");
                return Err(SyscallError::NoFreeThread);
            }
        };

        self.upcall_setup(h, spd_id, UpcallReason::Create, args);
        let spds = &self.spds;
        let thd = self.threads.expect_mut(h);
        thd.cyc_cnt = true;
        initialize_sched_info(thd, spds, spds.expect_live(spd_id));
        Ok(thd.id())
    }

    /// Scheduler-side inspection of a thread's invocation stack.
    pub fn thd_cntl(&self, spd_id: SpdId, op: ThdCntlOp, thd_id: ThdId, offset: usize) -> SyscallResult<usize> {
        let cur = self.current();
        let spd_id = self.thd_validate_get_current_spd(cur, spd_id)?;
        let sched = self.spds.expect_live(spd_id);
        let thd = match self.threads.by_id(thd_id).and_then(|h| self.threads.get(h)) {
            Some(t) => t,
            None => {
                debug!("thd_cntl: invalid thread {}.", thd_id);
                return Err(SyscallError::InvalidThread);
            }
        };
        if !sched.is_scheduler() || !thd_scheduled_by(thd, sched) {
            debug!("thd_cntl: {} not a scheduler of thread {}.", spd_id, thd_id);
            return Err(SyscallError::NoSchedAuthority);
        }

        let frame = match thd.stack.frame(offset) {
            Some(f) => f,
            None => return Ok(0),
        };
        Ok(match op {
            ThdCntlOp::InvFrame => frame.spd as usize,
            ThdCntlOp::InvFrameIp => match thd.stack.frame(offset + 1) {
                Some(above) => above.ip,
                None if thd.is_preempted() => thd.regs.ip,
                None => thd.regs.ret_ip,
            },
        })
    }

    /// Switch from the running thread to the one chosen by the calling
    /// scheduler: `rthd_id` for the synchronisation flags, otherwise the
    /// thread the scheduler left in its shared page.
    pub fn switch_thread(&mut self, spd_id: SpdId, rthd_id: ThdId, flags: SwitchFlags) -> SyscallResult<SwitchOutcome> {
        let cur = self.current();
        let spd_id = self.thd_validate_get_current_spd(cur, spd_id)?;
        assert!(!self.threads.expect(cur).is_preempted(), "running thread marked preempted");

        let next_thd = {
            let area = match self.sched_area_mut(spd_id) {
                Some(area) => area,
                None => {
                    debug!("switch_thread: non-scheduler {} attempting to switch thread.", spd_id);
                    return Err(SyscallError::NotScheduler);
                }
            };
            if flags.sync() {
                rthd_id
            } else {
                area.take_next_thd()
            }
        };
        // an event since the scheduler decided cleared its choice
        if next_thd == 0 {
            self.meas.event(MeasEvent::SwitchOutdated);
            return Err(SyscallError::Outdated);
        }
        let thd = match self.threads.by_id(next_thd) {
            Some(h) if h == cur => {
                self.meas.event(MeasEvent::SwitchSelf);
                return Err(SyscallError::SelfSwitch);
            }
            Some(h) => h,
            None => {
                debug!("switch_thread: no thread with id {}, flags {:#x}.", next_thd, flags.bits());
                return Err(SyscallError::InvalidThread);
            }
        };
        self.check_switch(cur, thd, spd_id, next_thd, flags)?;

        self.threads.break_preemption_chain(cur);

        let mut curr_sched_flags = SchedEvt::Nil;
        if flags.tailcall() {
            self.release_frames(cur);
            let pending = self.upcall_brand_pending(cur);
            if pending > 0 {
                self.meas.event(MeasEvent::BrandCompletionPending);
                let uc = self.sched_tailcall_pending_upcall(cur);
                return Ok(SwitchOutcome { next: self.thread_id(uc), preempted: false });
            }
            self.threads.expect_mut(cur).ready_upcall();
            self.meas.event(MeasEvent::FinishedBrands);
            self.meas.event(MeasEvent::BrandCompletionTailcall);
            curr_sched_flags = SchedEvt::BrandReady;
        }

        self.threads.break_preemption_chain(thd);
        self.threads.expect_mut(thd).sched_excl = false;
        if flags.excl_yield() {
            self.threads.expect_mut(cur).sched_excl = true;
        }
        if flags.sync_block() {
            self.meas.event(MeasEvent::AtomicLock);
            let cur_id = self.thread_id(cur);
            if let Some(area) = self.sched_area_mut(spd_id) {
                area.locks.queued_thd = cur_id;
            }
        } else if flags.sync_unblock() {
            self.meas.event(MeasEvent::AtomicUnlock);
        }

        self.threads.expect_mut(cur).sched_suspended = Some(spd_id);
        self.threads.expect_mut(thd).sched_suspended = None;
        self.switch_thread_context(cur, thd);

        let preempted = self.threads.expect(thd).is_preempted();
        if preempted {
            self.meas.event(MeasEvent::SwitchPreempt);
            self.threads.remove_preempted_status(thd);
        } else {
            self.meas.event(MeasEvent::SwitchCoop);
        }
        self.update_sched_evts(thd, SchedEvt::Nil, cur, curr_sched_flags);
        self.threads.expect_mut(cur).regs.ret = 0;

        Ok(SwitchOutcome { next: next_thd, preempted })
    }

    /// Every reason a switch can be refused, checked before any state
    /// changes.
    fn check_switch(&self, cur: ThdHandle, thd: ThdHandle, spd_id: SpdId, next_thd: ThdId, flags: SwitchFlags) -> SyscallResult<()> {
        let sched = self.spds.expect_live(spd_id);
        let (c, t) = (self.threads.expect(cur), self.threads.expect(thd));
        if !thd_scheduled_by(c, sched) || !thd_scheduled_by(t, sched) {
            debug!(
                "switch_thread: scheduler {} does not have scheduling control over {} or {}.",
                spd_id,
                c.id(),
                t.id()
            );
            return Err(SyscallError::NoSchedAuthority);
        }
        if t.is_ready_upcall() {
            debug!("switch_thread: upcall thd {} not ready to run (current {}).", t.id(), c.id());
            self.meas.event(MeasEvent::UpcallInactive);
            return Err(SyscallError::UpcallNotReady);
        }
        // brands only carry events; they never execute
        if t.brand().is_some() || t.stack.depth() == 0 {
            debug!("switch_thread: thread {} has no context to run in.", t.id());
            return Err(SyscallError::InvalidThread);
        }
        if flags.tailcall() {
            if !(c.is_active_upcall() && c.stack.depth() == 1) {
                debug!("switch_thread: illegal use of tailcall.");
                return Err(SyscallError::IllegalTailcall);
            }
            if flags.excl_yield() || flags.sync() {
                debug!("switch_thread: cannot switch using tailcall and other options {:#x}.", flags.bits());
                return Err(SyscallError::IllegalTailcall);
            }
        }
        if t.sched_excl {
            if let Some(suspender) = t.sched_suspended {
                let depth = self.spds.expect_live(suspender).sched_depth();
                if sched.sched_depth() > depth {
                    debug!(
                        "switch_thread: scheduler {} resuming thread {}, but {} suspended it.",
                        spd_id,
                        t.id(),
                        suspender
                    );
                    return Err(SyscallError::ExclusiveResume);
                }
            }
        }
        if flags.sync_block() {
            let area = match sched.sched.as_ref() {
                Some(role) => &role.area,
                None => unreachable!(),
            };
            // a lock owner other than the one waited on is stale
            if area.locks.owner_thd != next_thd {
                self.meas.event(MeasEvent::AtomicStaleLock);
                return Err(SyscallError::StaleLock);
            }
        }
        Ok(())
    }

    fn upcall_brand_pending(&self, uc: ThdHandle) -> u32 {
        let brand = match self.threads.expect(uc).upcall() {
            Some(u) => u.brand,
            None => panic!("thread {:?} is not an upcall", uc),
        };
        self.threads.expect(brand).brand().map_or(0, |b| b.pending())
    }
}
