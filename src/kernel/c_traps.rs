//! Entry points called by the assembly trampolines and trap handlers. They
//! lock the kernel instance for the duration of one kernel path.

use log::debug;
use spin::Mutex;

use crate::common::logging;
use crate::common::structures::SyscallError;
use crate::config::CAP_INDEX_SHIFT;
use crate::object::SpdId;
use crate::syscall::{handle_syscall, SyscallRet};

use super::{Kernel, RetAction};

pub static KERNEL: Mutex<Kernel> = Mutex::new(Kernel::new());

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvTrapRet {
    /// 0 if the invocation failed.
    pub entry: usize,
    pub thd_id: usize,
    pub spd_id: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetTrapRet {
    pub ip: usize,
    pub sp: usize,
    /// Non-zero: restore this thread's saved registers instead.
    pub restore_thd: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallTrapRet {
    pub ret: isize,
    /// Non-zero: resume this thread instead of the caller.
    pub next_thd: usize,
    pub preempted: usize,
}

impl From<SyscallRet> for SyscallTrapRet {
    fn from(r: SyscallRet) -> Self {
        Self {
            ret: r.ret,
            next_thd: r.next.map_or(0, |id| id as usize),
            preempted: r.preempt as usize,
        }
    }
}

#[no_mangle]
pub extern "C" fn cos_kernel_init() {
    logging::init();
}

/// Invocation through the capability in the high bits of `cap_word`.
#[no_mangle]
pub extern "C" fn ipc_walk_static_cap(cap_word: usize, sp: usize, ip: usize) -> InvTrapRet {
    match KERNEL.lock().invoke(cap_word >> CAP_INDEX_SHIFT, sp, ip) {
        Ok(r) => InvTrapRet { entry: r.entry, thd_id: r.thd_id as usize, spd_id: r.spd_id as usize },
        Err(_) => InvTrapRet::default(),
    }
}

#[no_mangle]
pub extern "C" fn pop() -> RetTrapRet {
    match KERNEL.lock().ret() {
        RetAction::Return { ip, sp } => RetTrapRet { ip, sp, restore_thd: 0 },
        RetAction::Restore(id) => RetTrapRet { ip: 0, sp: 0, restore_thd: id as usize },
    }
}

#[no_mangle]
pub extern "C" fn cos_syscall(num: usize, spd_id: usize, a0: usize, a1: usize, a2: usize, a3: usize) -> SyscallTrapRet {
    let mut k = KERNEL.lock();
    let spd_id = match SpdId::try_from(spd_id) {
        Ok(id) => id,
        Err(_) => {
            debug!("syscall {}: invalid spd {}.", num, spd_id);
            return SyscallTrapRet { ret: SyscallError::InvalidSpd.errno(), ..SyscallTrapRet::default() };
        }
    };
    handle_syscall(&mut k, num, spd_id, [a0, a1, a2, a3]).into()
}

/// Timer interrupt; returns the thread to resume, or 0 to resume the
/// interrupted one.
#[no_mangle]
pub extern "C" fn cos_timer_tick() -> usize {
    KERNEL.lock().hw_timer_event().map_or(0, |id| id as usize)
}

#[no_mangle]
pub extern "C" fn cos_net_event(port: usize) -> usize {
    match u16::try_from(port) {
        Ok(port) => KERNEL.lock().hw_net_event(port).map_or(0, |id| id as usize),
        Err(_) => 0,
    }
}
