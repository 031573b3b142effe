//! Compile-time configuration of the kernel core.

use crate::BIT;

pub const PAGE_BITS: usize = 12;
pub const PAGE_SIZE: usize = BIT!(PAGE_BITS);

#[cfg(feature = "ENABLE_SMP")]
pub const CONFIG_MAX_NUM_NODES: usize = 4;
#[cfg(not(feature = "ENABLE_SMP"))]
pub const CONFIG_MAX_NUM_NODES: usize = 1;

/// Thread slots. Thread ids start at 1; id 0 never names a thread.
pub const MAX_NUM_THREADS: usize = 64;
/// Protection domains. Domain ids start at 1.
pub const MAX_NUM_SPDS: usize = 64;
/// Composite protection domain descriptors (and their page tables).
pub const MAX_MPD_DESC: usize = 64;
pub const MAX_STATIC_CAP: usize = 1024;
/// Invocation frames per thread, origin frame included.
pub const MAX_SERVICE_DEPTH: usize = 31;
pub const MAX_SCHED_HIER_DEPTH: usize = 4;
/// Event slots in a scheduler's shared page. Slot 0 is the list head.
pub const NUM_SCHED_EVTS: usize = 128;
pub const NUM_NET_BRANDS: usize = 2;

/// Capability indices are passed in the high bits of the invocation word.
pub const CAP_INDEX_SHIFT: usize = 20;

/// Kernel-virtual window the composite page-table roots are carved from.
pub const PGTBL_POOL_BASE: usize = 0x8400_0000;

/// Base of the per-thread argument regions exposed in the shared data page.
pub const COS_INFO_REGION_ADDR: usize = 0x2000_0000;
