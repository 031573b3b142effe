use log::{debug, warn};

use crate::common::measurement::MeasEvent;
use crate::common::structures::{SyscallError, SyscallResult};
use crate::object::SpdId;
use crate::task_manager::{InvFrame, ThdHandle, ThdId};

use super::Kernel;

/// Where the trampoline continues after a successful invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvocationRet {
    pub entry: usize,
    pub thd_id: ThdId,
    /// Owner of the capability, the domain the call was made from.
    pub spd_id: SpdId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetAction {
    /// Resume the caller at the frame's return addresses.
    Return { ip: usize, sp: usize },
    /// The thread finished; restore the saved registers of this thread.
    Restore(ThdId),
}

impl Kernel {
    /// Cross-domain call through capability `cap` by the running thread.
    pub fn invoke(&mut self, cap: usize, sp: usize, ip: usize) -> SyscallResult<InvocationRet> {
        let cur = self.current();
        let resolved = match self.caps.resolve(cap) {
            Ok(r) => r,
            Err(e) => {
                debug!("invoke: capability {}: {}.", cap, e);
                return Err(e);
            }
        };

        let thd = self.threads.expect(cur);
        let frame_mpd = match thd.stack.top() {
            Some(f) => f.mpd.handle(),
            None => {
                debug!("invoke: thread {} has no invocation frame.", thd.id());
                return Err(SyscallError::InvalidThread);
            }
        };
        if !self.mpds.contains(frame_mpd, resolved.owner) {
            warn!(
                "incorrect capability {}: owner spd {}, caller in spd {:?}",
                cap,
                resolved.owner,
                thd.current_spd()
            );
            self.print_stack(cur);
            return Err(SyscallError::CapUntrusted);
        }
        if thd.stack.is_full() {
            debug!("invoke: invocation stack of thread {} full.", thd.id());
            return Err(SyscallError::InvocationStackFull);
        }
        let dest_mpd = match self.spds.get(resolved.destination) {
            Some(dest) => dest.composite,
            None => {
                debug!("invoke: destination spd {} of capability {} missing.", resolved.destination, cap);
                return Err(SyscallError::CapUnallocated);
            }
        };

        if let Some(entry) = self.caps.get(cap) {
            entry.count_invocation();
        }
        self.open_composite(dest_mpd);
        let r = self.mpds.take(dest_mpd);
        let thd = self.threads.expect_mut(cur);
        if thd.stack.push(InvFrame { spd: resolved.destination, mpd: r, sp, ip }).is_err() {
            panic!("invocation stack of thread {} overflowed after capacity check", thd.id());
        }
        self.meas.event(MeasEvent::Invocations);

        Ok(InvocationRet { entry: resolved.entry, thd_id: thd.id(), spd_id: resolved.owner })
    }

    /// Return of the running thread from its latest invocation. A thread
    /// returning from its origin frame is finished instead.
    pub fn ret(&mut self) -> RetAction {
        let cur = self.current();
        let thd = self.threads.expect_mut(cur);
        if thd.stack.depth() <= 1 {
            assert!(!thd.is_ready_upcall(), "ready upcall {} is executing", thd.id());
            let next = if thd.is_active_upcall() {
                self.brand_execution_completion(cur)
            } else {
                self.thd_ret_term_upcall(cur)
            };
            return RetAction::Restore(self.thread_id(next));
        }

        let frame = match thd.stack.pop() {
            Some(f) => f,
            None => unreachable!(),
        };
        let top = match thd.stack.top() {
            Some(f) => f.mpd.handle(),
            None => unreachable!(),
        };
        self.open_composite(top);
        let (ip, sp) = (frame.ip, frame.sp);
        self.mpds.release(frame.mpd);
        RetAction::Return { ip, sp }
    }

    fn print_stack(&self, t: ThdHandle) {
        let thd = self.threads.expect(t);
        warn!("stack trace for thread {}:", thd.id());
        for (i, f) in thd.stack.iter().enumerate() {
            warn!("\t[{}] spd {}, composite {:?}, ip {:#x}, sp {:#x}", i, f.spd, f.mpd.handle(), f.ip, f.sp);
        }
    }
}
