use crate::config::MAX_NUM_SPDS;
use crate::ipc::SchedDataArea;

use super::arena::{Arena, Handle};
use super::composite::MpdHandle;

/// Domain ids are slot index + 1, so 0 can stand for "no domain" on the
/// syscall boundary.
pub type SpdId = u16;

/// State of a domain that schedules threads.
pub struct SchedRole {
    /// 0 for the root scheduler.
    pub depth: usize,
    pub parent: Option<SpdId>,
    /// Page shared with the scheduler: next-thread handoff, lock atom and
    /// event slots.
    pub area: SchedDataArea,
    /// Tail of the event list, the last slot the kernel appended.
    pub prev_notification: u16,
}

impl SchedRole {
    pub fn new(depth: usize, parent: Option<SpdId>) -> Self {
        Self { depth, parent, area: SchedDataArea::new(), prev_notification: 0 }
    }
}

pub struct Spd {
    id: SpdId,
    /// Capability table slice owned by the domain.
    pub cap_base: usize,
    pub cap_range: usize,
    pub composite: MpdHandle,
    /// Where upcalls into this domain start executing.
    pub upcall_entry: usize,
    pub sched: Option<SchedRole>,
}

impl Spd {
    #[inline]
    pub fn id(&self) -> SpdId {
        self.id
    }

    #[inline]
    pub fn is_scheduler(&self) -> bool {
        self.sched.is_some()
    }

    #[inline]
    pub fn sched_depth(&self) -> Option<usize> {
        self.sched.as_ref().map(|s| s.depth)
    }

    #[inline]
    pub fn sched_parent(&self) -> Option<SpdId> {
        self.sched.as_ref().and_then(|s| s.parent)
    }

    /// Whether capability `cap` lies in this domain's slice of the table.
    #[inline]
    pub fn owns_cap(&self, cap: usize) -> bool {
        cap >= self.cap_base && cap < self.cap_base + self.cap_range
    }
}

/// Domains live for the whole run of the system; the table never frees.
pub struct SpdTable {
    arena: Arena<Spd, MAX_NUM_SPDS>,
}

impl SpdTable {
    pub const fn new() -> Self {
        Self { arena: Arena::new() }
    }

    pub fn create(&mut self, composite: MpdHandle, cap_base: usize, cap_range: usize, upcall_entry: usize) -> Option<SpdId> {
        let h = self.arena.alloc_with(|h| Spd {
            id: h.index() as SpdId + 1,
            cap_base,
            cap_range,
            composite,
            upcall_entry,
            sched: None,
        })?;
        Some(h.index() as SpdId + 1)
    }

    #[inline]
    fn handle(&self, id: SpdId) -> Option<Handle<Spd>> {
        if id == 0 {
            return None;
        }
        self.arena.handle_at(id as usize - 1)
    }

    #[inline]
    pub fn get(&self, id: SpdId) -> Option<&Spd> {
        self.handle(id).and_then(|h| self.arena.get(h))
    }

    #[inline]
    pub fn get_mut(&mut self, id: SpdId) -> Option<&mut Spd> {
        let h = self.handle(id)?;
        self.arena.get_mut(h)
    }

    /// Looks up a domain the kernel itself recorded. A miss means kernel
    /// state is corrupt.
    #[inline]
    pub fn expect_live(&self, id: SpdId) -> &Spd {
        match self.get(id) {
            Some(spd) => spd,
            None => panic!("dangling domain id {}", id),
        }
    }

    #[inline]
    pub fn expect_live_mut(&mut self, id: SpdId) -> &mut Spd {
        match self.get_mut(id) {
            Some(spd) => spd,
            None => panic!("dangling domain id {}", id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Spd> + '_ {
        self.arena.iter().map(|(_, spd)| spd)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }
}

impl Default for SpdTable {
    fn default() -> Self {
        Self::new()
    }
}
