//! Kernel objects that are not threads: protection domains and the
//! composite domains whose page tables they share.

pub mod arena;
pub mod composite;
pub mod spd;

pub use arena::{Arena, Handle};
pub use composite::{CompositeSpd, MpdHandle, MpdRef, MpdState, MpdTable, SpdSet};
pub use spd::{SchedRole, Spd, SpdId, SpdTable};
