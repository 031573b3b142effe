//! Layout of the page a scheduler component shares with the kernel: the
//! thread it wants to run next, a synchronisation atom and the event
//! notification slots, which form a singly linked list by slot offset.

use bit_field::BitField;
use log::warn;

use crate::config::NUM_SCHED_EVTS;

/// State reported for a thread in its notification slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedEvt {
    Nil = 0,
    BrandActive = 1,
    BrandReady = 2,
    BrandPend = 4,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedEvent {
    /// next offset in bits 0..8, flags in 8..16, urgency in 16..32
    nfu: u32,
    pub cpu_consumption: u32,
}

impl SchedEvent {
    #[inline]
    pub fn next(&self) -> u16 {
        self.nfu.get_bits(0..8) as u16
    }

    #[inline]
    pub fn set_next(&mut self, next: u16) {
        self.nfu.set_bits(0..8, next as u32);
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.nfu.get_bits(8..16) as u8
    }

    #[inline]
    pub fn set_flags(&mut self, flags: SchedEvt) {
        self.nfu.set_bits(8..16, flags as u32);
    }

    /// Written by the scheduler; lower values are more urgent.
    #[inline]
    pub fn urgency(&self) -> u16 {
        self.nfu.get_bits(16..32) as u16
    }

    #[inline]
    pub fn set_urgency(&mut self, urgency: u16) {
        self.nfu.set_bits(16..32, urgency as u32);
    }

    #[inline]
    pub fn reset(&mut self) {
        self.nfu.set_bits(0..16, 0);
        self.cpu_consumption = 0;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NextThd {
    pub next_thd_id: u16,
    pub next_thd_flags: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncAtom {
    pub owner_thd: u16,
    pub queued_thd: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvtListError {
    OutOfRange { prev: u16, this: u16 },
}

#[repr(C)]
pub struct SchedDataArea {
    pub next: NextThd,
    pub locks: SyncAtom,
    pub events: [SchedEvent; NUM_SCHED_EVTS],
}

impl SchedDataArea {
    pub fn new() -> Self {
        Self {
            next: NextThd::default(),
            locks: SyncAtom::default(),
            events: [SchedEvent::default(); NUM_SCHED_EVTS],
        }
    }

    /// Takes the scheduler's pending decision, leaving the slot empty.
    #[inline]
    pub fn take_next_thd(&mut self) -> u16 {
        core::mem::take(&mut self.next.next_thd_id)
    }

    #[inline]
    pub fn event(&self, idx: u16) -> Option<&SchedEvent> {
        self.events.get(idx as usize)
    }

    #[inline]
    pub fn event_mut(&mut self, idx: u16) -> Option<&mut SchedEvent> {
        self.events.get_mut(idx as usize)
    }

    /// Links slot `this` behind the list tail `*tail`. A slot already in the
    /// list is left where it is, so the list can never close into a cycle.
    /// Any event invalidates the scheduler's pending decision.
    pub fn append(&mut self, tail: &mut u16, this: u16) -> Result<bool, EvtListError> {
        self.next.next_thd_id = 0;

        let prev = *tail;
        if prev as usize >= NUM_SCHED_EVTS || this as usize >= NUM_SCHED_EVTS || this == 0 {
            return Err(EvtListError::OutOfRange { prev, this });
        }
        if prev == this || self.events[this as usize].next() != 0 {
            return Ok(false);
        }
        if self.events[prev as usize].next() != 0 {
            warn!("scheduler not following event protocol for event {}", prev);
        }
        self.events[prev as usize].set_next(this);
        *tail = this;
        Ok(true)
    }

    /// Scheduler side of the protocol: walks the list from `*cursor`,
    /// unlinking each visited slot, and leaves `*cursor` on the last one.
    pub fn drain<F: FnMut(u16, &mut SchedEvent)>(&mut self, cursor: &mut u16, mut f: F) -> usize {
        let mut visited = 0;
        loop {
            let next = self.events[*cursor as usize].next();
            if next == 0 || next as usize >= NUM_SCHED_EVTS {
                break;
            }
            self.events[*cursor as usize].set_next(0);
            *cursor = next;
            f(next, &mut self.events[next as usize]);
            visited += 1;
            if visited >= NUM_SCHED_EVTS {
                break;
            }
        }
        visited
    }
}

impl Default for SchedDataArea {
    fn default() -> Self {
        Self::new()
    }
}
