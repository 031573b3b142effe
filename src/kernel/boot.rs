//! Interface used by the boot code to lay out domains, capabilities and
//! the first thread before any user code runs.

use log::{debug, info};

use crate::common::structures::{SyscallError, SyscallResult};
use crate::common::utils::cpu_id;
use crate::config::{COS_INFO_REGION_ADDR, MAX_NUM_SPDS, MAX_SCHED_HIER_DEPTH, PAGE_SIZE};
use crate::cspace::CapOwner;
use crate::object::{SchedRole, SpdId};
use crate::task_manager::{initialize_sched_info, InvFrame, ThdId};

use super::Kernel;

impl Kernel {
    /// Creates a domain in a composite of its own.
    pub fn spd_create(&mut self, cap_base: usize, cap_range: usize, upcall_entry: usize) -> SyscallResult<SpdId> {
        if self.spds.len() >= MAX_NUM_SPDS {
            debug!("spd_create: no free component slot.");
            return Err(SyscallError::NoFreeSpd);
        }
        let c = self.mpds.alloc().ok_or(SyscallError::NoFreeMpd)?;
        let id = match self.spds.create(c, cap_base, cap_range, upcall_entry) {
            Some(id) => id,
            None => panic!("component table full after capacity check"),
        };
        self.mpds.add_member(c, id);
        Ok(id)
    }

    /// Gives `spd` a scheduler role below `parent`, or as the root
    /// scheduler when `parent` is `None`.
    pub fn spd_make_scheduler(&mut self, spd: SpdId, parent: Option<SpdId>) -> SyscallResult<()> {
        let depth = match parent {
            None => 0,
            Some(p) => {
                let p = self.spds.get(p).ok_or(SyscallError::InvalidSpd)?;
                p.sched_depth().ok_or(SyscallError::NotScheduler)? + 1
            }
        };
        if depth >= MAX_SCHED_HIER_DEPTH {
            debug!("spd_make_scheduler: hierarchy depth {} too deep.", depth);
            return Err(SyscallError::SchedDepthExceeded);
        }
        let s = self.spds.get_mut(spd).ok_or(SyscallError::InvalidSpd)?;
        if s.sched.is_some() {
            return Err(SyscallError::IllegalOperation);
        }
        s.sched = Some(SchedRole::new(depth, parent));
        Ok(())
    }

    pub fn cap_install(&mut self, idx: usize, owner: SpdId, destination: SpdId, entry: usize) -> SyscallResult<()> {
        if self.spds.get(owner).is_none() || self.spds.get(destination).is_none() {
            return Err(SyscallError::InvalidSpd);
        }
        if !self.caps.install(idx, owner, destination, entry) {
            return Err(SyscallError::CapOutOfRange);
        }
        Ok(())
    }

    pub fn cap_set_owner(&mut self, idx: usize, owner: CapOwner) -> SyscallResult<()> {
        if let CapOwner::Spd(spd) = owner {
            if self.spds.get(spd).is_none() {
                return Err(SyscallError::InvalidSpd);
            }
        }
        if !self.caps.set_owner(idx, owner) {
            return Err(SyscallError::CapOutOfRange);
        }
        Ok(())
    }

    /// Creates the first thread of this core in `init` and makes it
    /// current.
    pub fn ready_boot_thread(&mut self, init: SpdId) -> SyscallResult<ThdId> {
        if self.core().cur_thread.is_some() {
            return Err(SyscallError::IllegalOperation);
        }
        let c = self.spds.get(init).ok_or(SyscallError::InvalidSpd)?.composite;
        let h = self.threads.alloc(cpu_id()).ok_or(SyscallError::NoFreeThread)?;
        let r = self.mpds.take(c);

        let spds = &self.spds;
        let thd = self.threads.expect_mut(h);
        thd.stack.set_origin(InvFrame::origin(init, r));
        let init_spd = spds.expect_live(init);
        if init_spd.is_scheduler() {
            initialize_sched_info(thd, spds, init_spd);
            thd.cyc_cnt = true;
        }
        let tid = thd.id();

        let now = (self.clock)();
        let core = self.core_mut();
        core.cur_thread = Some(h);
        core.cycle_cnt = now;
        core.shared.current_thread = tid;
        core.shared.argument_region = tid as usize * PAGE_SIZE + COS_INFO_REGION_ADDR;
        self.open_composite(c);
        info!("boot thread {} ready in component {}", tid, init);
        Ok(tid)
    }
}
