use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum MeasEvent {
    Invocations = 0,
    Upcalls,
    SwitchCoop,
    SwitchPreempt,
    SwitchOutdated,
    SwitchSelf,
    UpcallInactive,
    BrandPend,
    BrandUc,
    BrandDelayed,
    BrandPendExecute,
    BrandCompletionTailcall,
    BrandCompletionPending,
    BrandCompletionUc,
    BrandSchedPreempted,
    FinishedBrands,
    AtomicLock,
    AtomicUnlock,
    AtomicStaleLock,
    MpdSplitReuse,
    EvtReady,
    EvtActive,
    EvtPending,
}

const NUM_MEAS_EVENTS: usize = MeasEvent::EvtPending as usize + 1;

/// Event counters, updated from every core without a lock.
pub struct Measurements {
    counters: [AtomicUsize; NUM_MEAS_EVENTS],
}

impl Measurements {
    pub const fn new() -> Self {
        Self {
            counters: [const { AtomicUsize::new(0) }; NUM_MEAS_EVENTS],
        }
    }

    #[inline]
    pub fn event(&self, ev: MeasEvent) {
        self.counters[ev as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count(&self, ev: MeasEvent) -> usize {
        self.counters[ev as usize].load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for c in self.counters.iter() {
            c.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Measurements {
    fn default() -> Self {
        Self::new()
    }
}
