//! Composite protection domains (MPDs): reference-counted page-table-backed
//! address spaces shared by one or more member domains.
//!
//! Every live composite holds one reference for its descriptor, dropped
//! when the composite is deprecated by a split or subordinated by a merge.
//! Each invocation frame denoting the composite holds another, as an
//! [`MpdRef`]. A subordinate keeps a reference on its master so the shared
//! page table outlives it. The descriptor is freed when the count drops to
//! zero.

use core::sync::atomic::{AtomicUsize, Ordering};

use bit_field::BitField;
use log::debug;

use crate::config::{MAX_MPD_DESC, MAX_NUM_SPDS};
use crate::vspace::{PgTbl, PgTblPool};

use super::arena::{Arena, Handle};
use super::spd::SpdId;

pub type MpdHandle = Handle<CompositeSpd>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpdState {
    Normal,
    /// Members were merged into the master; only in-flight frames keep it.
    Subordinate(MpdHandle),
    /// Retired by a split; no longer nameable from user level.
    Deprecated,
}

/// Set of member domains, one bit per domain slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpdSet(u64);

const _: () = assert!(MAX_NUM_SPDS <= 64);

impl SpdSet {
    #[inline]
    pub const fn empty() -> Self {
        SpdSet(0)
    }

    #[inline]
    pub fn insert(&mut self, spd: SpdId) {
        self.0.set_bit(spd as usize - 1, true);
    }

    #[inline]
    pub fn remove(&mut self, spd: SpdId) {
        self.0.set_bit(spd as usize - 1, false);
    }

    #[inline]
    pub fn contains(&self, spd: SpdId) -> bool {
        spd != 0 && (spd as usize) <= MAX_NUM_SPDS && self.0.get_bit(spd as usize - 1)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = SpdId> {
        let bits = self.0;
        (0..MAX_NUM_SPDS).filter(move |i| bits.get_bit(*i)).map(|i| i as SpdId + 1)
    }
}

pub struct CompositeSpd {
    state: MpdState,
    ref_cnt: AtomicUsize,
    members: SpdSet,
    pg_tbl: Option<PgTbl>,
}

impl CompositeSpd {
    #[inline]
    pub fn state(&self) -> MpdState {
        self.state
    }

    #[inline]
    pub fn is_deprecated(&self) -> bool {
        self.state == MpdState::Deprecated
    }

    #[inline]
    pub fn is_subordinate(&self) -> bool {
        matches!(self.state, MpdState::Subordinate(_))
    }

    #[inline]
    pub fn ref_cnt(&self) -> usize {
        self.ref_cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn members(&self) -> SpdSet {
        self.members
    }

    #[inline]
    pub fn num_members(&self) -> usize {
        self.members.len()
    }
}

/// A counted reference on a composite, held by an invocation frame.
///
/// It cannot be copied or cloned, and the only way to give it up is
/// [`MpdTable::release`], so each acquisition is released at most once.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct MpdRef(MpdHandle);

impl MpdRef {
    #[inline]
    pub fn handle(&self) -> MpdHandle {
        self.0
    }
}

pub struct MpdTable {
    arena: Arena<CompositeSpd, MAX_MPD_DESC>,
    pg_tbls: PgTblPool,
}

impl MpdTable {
    pub const fn new() -> Self {
        Self { arena: Arena::new(), pg_tbls: PgTblPool::new() }
    }

    /// Number of composites that can still be allocated.
    #[inline]
    pub fn available(&self) -> usize {
        core::cmp::min(MAX_MPD_DESC - self.arena.len(), self.pg_tbls.available())
    }

    /// A fresh, empty composite with its own page table, holding only its
    /// descriptor reference.
    pub fn alloc(&mut self) -> Option<MpdHandle> {
        if self.available() == 0 {
            debug!("mpd: no free composite descriptor.");
            return None;
        }
        let pg_tbl = self.pg_tbls.allocate()?;
        let h = self.arena.alloc(CompositeSpd {
            state: MpdState::Normal,
            ref_cnt: AtomicUsize::new(1),
            members: SpdSet::empty(),
            pg_tbl: Some(pg_tbl),
        });
        if h.is_none() {
            self.pg_tbls.release(pg_tbl);
        }
        h
    }

    #[inline]
    pub fn get(&self, h: MpdHandle) -> Option<&CompositeSpd> {
        self.arena.get(h)
    }

    #[inline]
    fn live(&self, h: MpdHandle) -> &CompositeSpd {
        match self.arena.get(h) {
            Some(c) => c,
            None => panic!("dangling composite handle {:?}", h),
        }
    }

    #[inline]
    fn live_mut(&mut self, h: MpdHandle) -> &mut CompositeSpd {
        match self.arena.get_mut(h) {
            Some(c) => c,
            None => panic!("dangling composite handle {:?}", h),
        }
    }

    /// Takes a reference for an invocation frame.
    pub fn take(&self, h: MpdHandle) -> MpdRef {
        let prev = self.live(h).ref_cnt.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "reference taken on dead composite {:?}", h);
        MpdRef(h)
    }

    pub fn release(&mut self, r: MpdRef) {
        self.put(r.0);
    }

    fn put(&mut self, h: MpdHandle) {
        let prev = self.live(h).ref_cnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "composite {:?} released below zero", h);
        if prev == 1 {
            self.free(h);
        }
    }

    fn free(&mut self, h: MpdHandle) {
        let c = match self.arena.free(h) {
            Some(c) => c,
            None => panic!("freeing dangling composite {:?}", h),
        };
        debug_assert!(c.members.is_empty());
        if let Some(pg) = c.pg_tbl {
            self.pg_tbls.release(pg);
        }
        if let MpdState::Subordinate(master) = c.state {
            self.put(master);
        }
    }

    /// Retires `h`: it can no longer be named, and it is freed once the
    /// frames still denoting it return.
    pub fn deprecate(&mut self, h: MpdHandle) {
        let c = self.live_mut(h);
        assert_eq!(c.state, MpdState::Normal);
        c.state = MpdState::Deprecated;
        self.put(h);
    }

    /// Makes `other` share `master`'s page table until its in-flight
    /// references drain. `other` must already be empty.
    pub fn make_subordinate(&mut self, master: MpdHandle, other: MpdHandle) {
        assert_ne!(master, other);
        assert_eq!(self.live(master).state, MpdState::Normal);
        let prev = self.live(master).ref_cnt.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0);

        let c = self.live_mut(other);
        assert_eq!(c.state, MpdState::Normal);
        assert!(c.members.is_empty(), "subordinating a composite with members");
        c.state = MpdState::Subordinate(master);
        if let Some(pg) = c.pg_tbl.take() {
            self.pg_tbls.release(pg);
        }
        self.put(other);
    }

    #[inline]
    pub fn add_member(&mut self, h: MpdHandle, spd: SpdId) {
        self.live_mut(h).members.insert(spd);
    }

    #[inline]
    pub fn remove_member(&mut self, h: MpdHandle, spd: SpdId) {
        self.live_mut(h).members.remove(spd);
    }

    /// The page table used when `h` is active; a subordinate runs on its
    /// master's.
    pub fn pg_tbl_of(&self, h: MpdHandle) -> PgTbl {
        let c = self.live(h);
        match (c.state, c.pg_tbl) {
            (MpdState::Subordinate(master), _) => match self.live(master).pg_tbl {
                Some(pg) => pg,
                None => panic!("master composite {:?} has no page table", master),
            },
            (_, Some(pg)) => pg,
            (_, None) => panic!("composite {:?} has no page table", h),
        }
    }

    /// Whether `spd` is reachable from `h`, directly or, for a
    /// subordinate, through its master.
    pub fn contains(&self, h: MpdHandle, spd: SpdId) -> bool {
        let c = self.live(h);
        if c.members.contains(spd) {
            return true;
        }
        match c.state {
            MpdState::Subordinate(master) => self.live(master).members.contains(spd),
            _ => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    #[inline]
    pub fn pg_tbls_in_use(&self) -> usize {
        self.pg_tbls.in_use()
    }
}

impl Default for MpdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reference_outlives_deprecation() {
        let mut t = MpdTable::new();
        let c = t.alloc().unwrap();
        t.add_member(c, 1);
        let r = t.take(c);
        assert_eq!(t.get(c).unwrap().ref_cnt(), 2);
        t.remove_member(c, 1);
        t.deprecate(c);
        assert!(t.get(c).unwrap().is_deprecated());
        assert_eq!(t.pg_tbls_in_use(), 1);
        t.release(r);
        assert!(t.get(c).is_none());
        assert_eq!(t.pg_tbls_in_use(), 0);
    }

    #[test]
    fn subordinate_keeps_master_alive() {
        let mut t = MpdTable::new();
        let master = t.alloc().unwrap();
        let other = t.alloc().unwrap();
        t.add_member(master, 1);
        t.add_member(other, 2);
        let pg_master = t.pg_tbl_of(master);
        let r = t.take(other);

        t.remove_member(other, 2);
        t.add_member(master, 2);
        t.make_subordinate(master, other);
        assert_eq!(t.pg_tbls_in_use(), 1);
        assert_eq!(t.pg_tbl_of(other), pg_master);
        assert!(t.contains(other, 1) && t.contains(other, 2));
        assert_eq!(t.get(master).unwrap().ref_cnt(), 2);

        t.release(r);
        assert!(t.get(other).is_none());
        assert_eq!(t.get(master).unwrap().ref_cnt(), 1);
    }

    #[test]
    fn set_tracks_members() {
        let mut s = SpdSet::empty();
        s.insert(1);
        s.insert(64);
        assert!(s.contains(64) && !s.contains(0) && !s.contains(2));
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![1, 64]);
        assert_eq!(s.len(), 2);
    }
}
