mod inv_stack;
mod preemption;
mod sched_info;
mod tcb;

pub use inv_stack::*;
pub use sched_info::*;
pub use tcb::*;
