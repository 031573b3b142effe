//! Trusted core of a capability-based component microkernel: capability
//! invocation between protection domains, composite domains that merge and
//! split address spaces, scheduler delegation, and brand/upcall event
//! delivery into user-level handlers.

#![cfg_attr(not(test), no_std)]

pub mod common;
pub mod config;
pub mod cspace;
pub mod ipc;
pub mod kernel;
pub mod object;
pub mod syscall;
pub mod task_manager;
pub mod vspace;

#[cfg(target_os = "none")]
mod lang_items;

pub use kernel::Kernel;
