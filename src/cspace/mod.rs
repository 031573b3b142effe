//! The static invocation capability table. Entries are written by the boot
//! code and only their counters change afterwards.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::common::structures::{SyscallError, SyscallResult};
use crate::config::MAX_STATIC_CAP;
use crate::object::SpdId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapOwner {
    /// Slot never assigned.
    Null,
    Free,
    AllocatedUnused,
    Spd(SpdId),
}

pub struct InvocationCap {
    pub owner: CapOwner,
    pub destination: Option<SpdId>,
    pub dest_entry: usize,
    invocation_cnt: AtomicU32,
}

impl InvocationCap {
    const fn empty() -> Self {
        Self {
            owner: CapOwner::Null,
            destination: None,
            dest_entry: 0,
            invocation_cnt: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn count_invocation(&self) {
        self.invocation_cnt.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn invocation_cnt(&self) -> u32 {
        self.invocation_cnt.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn take_invocation_cnt(&self) -> u32 {
        self.invocation_cnt.swap(0, Ordering::Relaxed)
    }
}

/// Owner and destination of a capability that passed the static checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedCap {
    pub owner: SpdId,
    pub destination: SpdId,
    pub entry: usize,
}

pub struct CapTable {
    caps: [InvocationCap; MAX_STATIC_CAP],
}

impl CapTable {
    pub const fn new() -> Self {
        Self { caps: [const { InvocationCap::empty() }; MAX_STATIC_CAP] }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&InvocationCap> {
        self.caps.get(idx)
    }

    pub fn install(&mut self, idx: usize, owner: SpdId, destination: SpdId, dest_entry: usize) -> bool {
        match self.caps.get_mut(idx) {
            Some(cap) => {
                cap.owner = CapOwner::Spd(owner);
                cap.destination = Some(destination);
                cap.dest_entry = dest_entry;
                cap.invocation_cnt.store(0, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn set_owner(&mut self, idx: usize, owner: CapOwner) -> bool {
        match self.caps.get_mut(idx) {
            Some(cap) => {
                cap.owner = owner;
                true
            }
            None => false,
        }
    }

    /// Checks that `idx` names an assigned capability with a destination.
    /// Trust is checked by the caller, which knows the current composite.
    pub fn resolve(&self, idx: usize) -> SyscallResult<ResolvedCap> {
        let cap = self.caps.get(idx).ok_or(SyscallError::CapOutOfRange)?;
        let owner = match cap.owner {
            CapOwner::Null => return Err(SyscallError::CapNoOwner),
            CapOwner::Free | CapOwner::AllocatedUnused => return Err(SyscallError::CapUnallocated),
            CapOwner::Spd(owner) => owner,
        };
        let destination = cap.destination.ok_or(SyscallError::CapUnallocated)?;
        Ok(ResolvedCap { owner, destination, entry: cap.dest_entry })
    }

    /// Sums and clears the counters of every capability in
    /// `base..base + range` that leads to `destination`.
    pub fn read_reset(&self, base: usize, range: usize, destination: SpdId) -> u32 {
        let end = core::cmp::min(base.saturating_add(range), MAX_STATIC_CAP);
        self.caps
            .get(base..end)
            .unwrap_or(&[])
            .iter()
            .filter(|cap| cap.destination == Some(destination))
            .fold(0u32, |acc, cap| acc.saturating_add(cap.take_invocation_cnt()))
    }

    /// Whether a capability in `base..base + range` leads to `destination`,
    /// that is, whether the slice's owner trusts `destination`.
    pub fn any_cap_to(&self, base: usize, range: usize, destination: SpdId) -> bool {
        let end = core::cmp::min(base.saturating_add(range), MAX_STATIC_CAP);
        self.caps
            .get(base..end)
            .unwrap_or(&[])
            .iter()
            .any(|cap| cap.destination == Some(destination))
    }
}

impl Default for CapTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_classifies_bad_entries() {
        let mut t = CapTable::new();
        assert_eq!(t.resolve(MAX_STATIC_CAP), Err(SyscallError::CapOutOfRange));
        assert_eq!(t.resolve(3), Err(SyscallError::CapNoOwner));
        t.set_owner(3, CapOwner::Free);
        assert_eq!(t.resolve(3), Err(SyscallError::CapUnallocated));
        t.install(4, 1, 2, 0x4000);
        assert_eq!(t.resolve(4), Ok(ResolvedCap { owner: 1, destination: 2, entry: 0x4000 }));
    }

    #[test]
    fn read_reset_sums_matching_destination() {
        let mut t = CapTable::new();
        t.install(10, 1, 2, 0);
        t.install(11, 1, 2, 0);
        t.install(12, 1, 3, 0);
        for idx in [10, 10, 11, 12] {
            t.get(idx).unwrap().count_invocation();
        }
        assert_eq!(t.read_reset(10, 3, 2), 3);
        assert_eq!(t.read_reset(10, 3, 2), 0);
        assert_eq!(t.get(12).unwrap().invocation_cnt(), 1);
    }
}
