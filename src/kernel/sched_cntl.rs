use log::debug;

use crate::common::structures::{SyscallError, SyscallResult};
use crate::config::{MAX_SCHED_HIER_DEPTH, NUM_SCHED_EVTS};
use crate::object::SpdId;
use crate::task_manager::{copy_sched_info, thd_scheduled_by, SchedInfo, ThdId};

use super::Kernel;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum SchedCntlOp {
    EvtRegion = 0,
    /// Register the thread's notification slot with the caller.
    ThdEvt = 1,
    GrantSched = 2,
    RevokeSched = 3,
    /// Completion of the calling thread goes to its scheduler instead of
    /// the thread it preempted.
    BreakPreemptionChain = 4,
}

impl SchedCntlOp {
    pub fn from_raw(op: usize) -> Option<Self> {
        match op {
            0 => Some(Self::EvtRegion),
            1 => Some(Self::ThdEvt),
            2 => Some(Self::GrantSched),
            3 => Some(Self::RevokeSched),
            4 => Some(Self::BreakPreemptionChain),
            _ => None,
        }
    }
}

impl Kernel {
    pub fn sched_cntl(&mut self, spd_id: SpdId, op: SchedCntlOp, thd_id: ThdId, option: usize) -> SyscallResult<()> {
        let cur = self.current();
        let spd_id = self.thd_validate_get_current_spd(cur, spd_id)?;
        let depth = match self.spds.expect_live(spd_id).sched_depth() {
            Some(depth) => depth,
            None => {
                debug!("sched_cntl: spd {} called sched_cntl, but not a scheduler.", spd_id);
                return Err(SyscallError::NotScheduler);
            }
        };

        match op {
            SchedCntlOp::EvtRegion => Ok(()),
            SchedCntlOp::ThdEvt => self.register_thd_evt(spd_id, depth, thd_id, option),
            SchedCntlOp::GrantSched | SchedCntlOp::RevokeSched => {
                self.delegate_sched(spd_id, op == SchedCntlOp::GrantSched, thd_id, option)
            }
            SchedCntlOp::BreakPreemptionChain => {
                self.threads.break_preemption_chain(cur);
                Ok(())
            }
        }
    }

    fn register_thd_evt(&mut self, sched: SpdId, depth: usize, thd_id: ThdId, idx: usize) -> SyscallResult<()> {
        let t = match self.threads.by_id(thd_id) {
            Some(t) => t,
            None => {
                debug!("sched_cntl: thd id {} passed into register event {} invalid.", thd_id, idx);
                return Err(SyscallError::InvalidThread);
            }
        };
        if self.threads.expect(t).sched_at(depth) != Some(sched) {
            debug!("sched_cntl: spd {} not the scheduler of {} to associate evt {}.", sched, thd_id, idx);
            return Err(SyscallError::NoSchedAuthority);
        }
        if idx == 0 || idx >= NUM_SCHED_EVTS {
            debug!("sched_cntl: invalid thd evt index {} for scheduler {}.", idx, sched);
            return Err(SyscallError::InvalidEventIndex);
        }

        let idx = idx as u16;
        self.threads.expect_mut(t).sched_info[depth].notification = Some(idx);
        if let Some(evt) = self.sched_area_mut(sched).and_then(|a| a.event_mut(idx)) {
            evt.reset();
        }

        // upcalls of a brand share its registrations
        let mut next = self.threads.expect(t).brand().and_then(|b| b.upcalls);
        while let Some(uc) = next {
            let (u, brand) = match self.threads.get2_mut(uc, t) {
                Some(pair) => pair,
                None => panic!("upcall list of brand {} corrupt", thd_id),
            };
            copy_sched_info(u, brand, &self.spds);
            next = u.upcall().and_then(|info| info.next);
        }
        Ok(())
    }

    /// Gives child scheduler `option` authority over `thd_id`, or takes it
    /// back. Either way, no scheduler below the child keeps authority.
    fn delegate_sched(&mut self, sched: SpdId, grant: bool, thd_id: ThdId, option: usize) -> SyscallResult<()> {
        let t = self.threads.by_id(thd_id);
        let child = SpdId::try_from(option).ok().and_then(|id| self.spds.get(id));
        let (t, child) = match (t, child) {
            (Some(t), Some(child)) => (t, child),
            _ => {
                debug!("sched_cntl: could not give privs for sched {} to thd {} from sched {}.", option, thd_id, sched);
                return Err(if t.is_none() { SyscallError::InvalidThread } else { SyscallError::InvalidSpd });
            }
        };
        let child_depth = match child.sched_depth() {
            Some(d) if child.sched_parent() == Some(sched) => d,
            _ => {
                debug!("sched_cntl: spd {} is not a child scheduler of {}.", option, sched);
                return Err(SyscallError::NotSchedChild);
            }
        };
        let child_id = child.id();
        if !thd_scheduled_by(self.threads.expect(t), self.spds.expect_live(sched)) {
            debug!("sched_cntl: sched {} has no authority over thd {}.", sched, thd_id);
            return Err(SyscallError::NoSchedAuthority);
        }

        let thd = self.threads.expect_mut(t);
        if grant {
            thd.sched_info[child_depth] = SchedInfo { scheduler: Some(child_id), notification: None };
        } else {
            if thd.sched_at(child_depth) != Some(child_id) {
                debug!("sched_cntl: cannot remove privs when they aren't had.");
                return Err(SyscallError::PrivilegeNotHeld);
            }
            thd.sched_info[child_depth] = SchedInfo::default();
        }
        for info in thd.sched_info[child_depth + 1..MAX_SCHED_HIER_DEPTH].iter_mut() {
            *info = SchedInfo::default();
        }
        Ok(())
    }
}
