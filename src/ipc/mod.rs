mod sched_events;

pub use sched_events::*;
