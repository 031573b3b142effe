//! Splitting and merging composite protection domains, and the
//! invocation counters read through `cap_cntl`.

use log::{debug, info};

use crate::common::measurement::MeasEvent;
use crate::common::structures::{SyscallError, SyscallResult};
use crate::object::{MpdHandle, SpdId};

use super::Kernel;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum MpdCntlOp {
    /// Move the second domain out of the first domain's composite.
    Split = 0,
    /// Join the composites of both domains.
    Merge = 1,
}

impl MpdCntlOp {
    pub fn from_raw(op: usize) -> Option<Self> {
        match op {
            0 => Some(Self::Split),
            1 => Some(Self::Merge),
            _ => None,
        }
    }
}

impl Kernel {
    fn move_spd(&mut self, spd: SpdId, to: MpdHandle) {
        let from = self.spds.expect_live(spd).composite;
        self.mpds.remove_member(from, spd);
        self.mpds.add_member(to, spd);
        self.spds.expect_live_mut(spd).composite = to;
    }

    fn usable_composite(&self, c: MpdHandle) -> SyscallResult<()> {
        match self.mpds.get(c) {
            Some(comp) if !comp.is_deprecated() && !comp.is_subordinate() => Ok(()),
            _ => {
                debug!("mpd: composite {:?} is deprecated, subordinate or gone.", c);
                Err(SyscallError::CompositeUnavailable)
            }
        }
    }

    /// Moves `s` out of `c` into a composite of its own. Returns the new
    /// composite of `s` and the composite holding the rest of the members,
    /// which is `c` itself when no frame references it.
    pub fn mpd_split(&mut self, c: MpdHandle, s: SpdId) -> SyscallResult<(MpdHandle, MpdHandle)> {
        self.usable_composite(c)?;
        let comp = match self.mpds.get(c) {
            Some(comp) => comp,
            None => unreachable!(),
        };
        if !comp.members().contains(s) {
            debug!("mpd_split: spd {} not in composite {:?}.", s, c);
            return Err(SyscallError::NotMember);
        }
        if comp.num_members() < 2 {
            debug!("mpd_split: composite {:?} has a single member.", c);
            return Err(SyscallError::SingletonSplit);
        }
        let reuse = comp.ref_cnt() == 1;
        let needed = if reuse { 1 } else { 2 };
        if self.mpds.available() < needed {
            debug!("mpd_split: need {} free composites, {} left.", needed, self.mpds.available());
            return Err(SyscallError::NoFreeMpd);
        }

        let alloc = |k: &mut Kernel| match k.mpds.alloc() {
            Some(h) => h,
            None => panic!("composite allocation failed after capacity check"),
        };
        let new1 = alloc(self);
        self.move_spd(s, new1);
        if reuse {
            self.meas.event(MeasEvent::MpdSplitReuse);
            return Ok((new1, c));
        }

        let new2 = alloc(self);
        let rest = match self.mpds.get(c) {
            Some(comp) => comp.members(),
            None => unreachable!(),
        };
        for spd in rest.iter() {
            self.move_spd(spd, new2);
        }
        self.mpds.deprecate(c);
        Ok((new1, new2))
    }

    /// Merges two composites. The one whose teardown is cheaper becomes a
    /// subordinate of the other, which is returned.
    pub fn mpd_merge(&mut self, c1: MpdHandle, c2: MpdHandle) -> SyscallResult<MpdHandle> {
        self.usable_composite(c1)?;
        self.usable_composite(c2)?;
        if c1 == c2 {
            debug!("mpd_merge: composite {:?} merged with itself.", c1);
            return Err(SyscallError::IllegalOperation);
        }
        let (a, b) = match (self.mpds.get(c1), self.mpds.get(c2)) {
            (Some(a), Some(b)) => (a, b),
            _ => unreachable!(),
        };

        // subordinate the unreferenced one, else the one with fewer members
        let (dest, other) = if a.ref_cnt() == 1 && b.ref_cnt() != 1 {
            (c2, c1)
        } else if b.ref_cnt() == 1 && a.ref_cnt() != 1 {
            (c1, c2)
        } else if a.num_members() < b.num_members() {
            (c2, c1)
        } else {
            (c1, c2)
        };

        let members = match self.mpds.get(other) {
            Some(comp) => comp.members(),
            None => unreachable!(),
        };
        for spd in members.iter() {
            self.move_spd(spd, dest);
        }
        self.mpds.make_subordinate(dest, other);
        Ok(dest)
    }

    /// Composite control on behalf of domain `spd_id`: split `spd2` out of
    /// `spd1`'s composite, or merge the composites of both.
    pub fn mpd_cntl(&mut self, spd_id: SpdId, op: MpdCntlOp, spd1: SpdId, spd2: SpdId) -> SyscallResult<()> {
        let cur = self.current();
        self.thd_validate_get_current_spd(cur, spd_id)?;
        let c1 = match self.spds.get(spd1) {
            Some(s) => s.composite,
            None => {
                debug!("mpd_cntl: no spd {}.", spd1);
                return Err(SyscallError::InvalidSpd);
            }
        };
        let c2 = match self.spds.get(spd2) {
            Some(s) => s.composite,
            None => {
                debug!("mpd_cntl: no spd {}.", spd2);
                return Err(SyscallError::InvalidSpd);
            }
        };

        match op {
            MpdCntlOp::Split => {
                let (a, b) = self.mpd_split(c1, spd2)?;
                info!("split spd {} out of composite {:?} into {:?}, rest in {:?}", spd2, c1, a, b);
            }
            MpdCntlOp::Merge => {
                let d = self.mpd_merge(c1, c2)?;
                info!("merged composites {:?} and {:?} into {:?}", c1, c2, d);
            }
        }

        // the current thread keeps running in the composite of its top frame,
        // which may now run on another page table
        if let Some(c) = self.thd_composite(cur) {
            self.open_composite(c);
        }
        Ok(())
    }

    /// Sums and clears the invocation counters of `consumer`'s capabilities
    /// that lead to `supplier`.
    pub fn cap_cntl(&mut self, consumer: SpdId, supplier: SpdId) -> SyscallResult<u32> {
        if self.spds.get(supplier).is_none() {
            debug!("cap_cntl: no supplier spd {}.", supplier);
            return Err(SyscallError::InvalidSpd);
        }
        let (base, range) = match self.spds.get(consumer) {
            Some(s) => (s.cap_base, s.cap_range),
            None => {
                debug!("cap_cntl: no consumer spd {}.", consumer);
                return Err(SyscallError::InvalidSpd);
            }
        };
        Ok(self.caps.read_reset(base, range, supplier))
    }
}
