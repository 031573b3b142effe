#[macro_export]
macro_rules! BIT {
    ($e:expr) => {
        {
            1usize<<$e
        }
    }
}

/// Source of the monotonic cycle counter used for CPU accounting.
pub type CycleClock = fn() -> u64;

#[cfg(target_arch = "riscv64")]
#[inline]
pub fn read_cycle() -> u64 {
    riscv::register::cycle::read() as u64
}

#[cfg(target_arch = "x86_64")]
#[inline]
pub fn read_cycle() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(any(target_arch = "riscv64", target_arch = "x86_64")))]
#[inline]
pub fn read_cycle() -> u64 {
    use core::sync::atomic::{AtomicU64, Ordering};

    static TICKS: AtomicU64 = AtomicU64::new(0);
    TICKS.fetch_add(1, Ordering::Relaxed)
}

#[cfg(target_arch = "riscv64")]
#[inline]
pub fn cpu_id() -> usize {
    let hart: usize;
    unsafe { core::arch::asm!("mv {}, tp", out(reg) hart) };
    hart % crate::config::CONFIG_MAX_NUM_NODES
}

#[cfg(not(target_arch = "riscv64"))]
#[inline]
pub fn cpu_id() -> usize {
    0
}

#[inline]
pub fn saturating_add_u32(p: u32, consumption: u64) -> u32 {
    let n = (p as u64).saturating_add(consumption);
    if n > u32::MAX as u64 {
        u32::MAX
    } else {
        n as u32
    }
}
