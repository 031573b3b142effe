//! Syscall table: argument decoding and dispatch into the kernel core.
//!
//! Arguments arrive in four machine words. Operations that take an opcode
//! and a thread id pack them into one word, opcode in the high half.

use bit_field::BitField;
use log::debug;

use crate::common::structures::{SyscallError, SyscallResult};
use crate::kernel::{
    BrandCntlOp, BrandWireOp, Kernel, MpdCntlOp, SchedCntlOp, SwitchFlags, SwitchOutcome, ThdCntlOp,
};
use crate::object::SpdId;
use crate::task_manager::ThdId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Syscall {
    Void = 0,
    Stats = 1,
    Print = 2,
    CreateThread = 3,
    SwitchThread = 4,
    KillThd = 5,
    BrandUpcall = 6,
    BrandCntl = 7,
    Upcall = 8,
    SchedCntl = 9,
    MpdCntl = 10,
    MmapCntl = 11,
    BrandWire = 12,
    CapCntl = 13,
    BuffMgmt = 14,
    ThdCntl = 15,
}

impl Syscall {
    pub fn from_raw(num: usize) -> Option<Self> {
        use Syscall::*;
        Some(match num {
            0 => Void,
            1 => Stats,
            2 => Print,
            3 => CreateThread,
            4 => SwitchThread,
            5 => KillThd,
            6 => BrandUpcall,
            7 => BrandCntl,
            8 => Upcall,
            9 => SchedCntl,
            10 => MpdCntl,
            11 => MmapCntl,
            12 => BrandWire,
            13 => CapCntl,
            14 => BuffMgmt,
            15 => ThdCntl,
            _ => return None,
        })
    }
}

/// Result of a syscall as seen by the trap path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallRet {
    /// Value left in the caller's return register. Successful control
    /// transfers write the threads' registers themselves and report 0.
    pub ret: isize,
    /// Thread to resume instead of the caller.
    pub next: Option<ThdId>,
    /// `next` resumes from its full saved context.
    pub preempt: bool,
}

impl SyscallRet {
    fn value(ret: isize) -> Self {
        Self { ret, next: None, preempt: false }
    }
}

/// Splits `(op << 16) | thd_id`.
#[inline]
pub fn decode_op_thd(word: usize) -> (usize, ThdId) {
    (word.get_bits(16..32), word.get_bits(0..16) as ThdId)
}

/// Splits `(thd_id << 16) | flags`.
#[inline]
pub fn decode_thd_flags(word: usize) -> (ThdId, u16) {
    (word.get_bits(16..32) as ThdId, word.get_bits(0..16) as u16)
}

/// Splits `(first << 16) | second` into two domain ids.
#[inline]
pub fn decode_spd_pair(word: usize) -> (SpdId, SpdId) {
    (word.get_bits(16..32) as SpdId, word.get_bits(0..16) as SpdId)
}

fn illegal_op(what: &str, op: usize) -> SyscallError {
    debug!("{}: illegal operation {}.", what, op);
    SyscallError::IllegalOperation
}

/// A domain id passed whole in an argument word.
fn spd_arg(word: usize) -> SyscallResult<SpdId> {
    SpdId::try_from(word).map_err(|_| {
        debug!("spd id {:#x} out of range.", word);
        SyscallError::InvalidSpd
    })
}

fn thd_arg(word: usize) -> SyscallResult<ThdId> {
    ThdId::try_from(word).map_err(|_| {
        debug!("thread id {:#x} out of range.", word);
        SyscallError::InvalidThread
    })
}

fn value_syscall(k: &mut Kernel, num: Syscall, spd_id: SpdId, args: [usize; 4]) -> SyscallResult<isize> {
    match num {
        Syscall::Void => Ok(0),
        Syscall::CreateThread => k.create_thread(spd_id, [args[0], args[1], args[2]]).map(|id| id as isize),
        Syscall::BrandCntl => {
            let (op, thd_id) = decode_op_thd(args[0]);
            let op = BrandCntlOp::from_raw(op).ok_or_else(|| illegal_op("brand_cntl", op))?;
            k.brand_cntl(spd_id, op, thd_id, spd_arg(args[1])?).map(|id| id as isize)
        }
        Syscall::SchedCntl => {
            let (op, thd_id) = decode_op_thd(args[0]);
            let op = SchedCntlOp::from_raw(op).ok_or_else(|| illegal_op("sched_cntl", op))?;
            k.sched_cntl(spd_id, op, thd_id, args[1]).map(|_| 0)
        }
        Syscall::MpdCntl => {
            let op = MpdCntlOp::from_raw(args[0]).ok_or_else(|| illegal_op("mpd_cntl", args[0]))?;
            k.mpd_cntl(spd_id, op, spd_arg(args[1])?, spd_arg(args[2])?).map(|_| 0)
        }
        Syscall::BrandWire => {
            let op = BrandWireOp::from_raw(args[1]).ok_or_else(|| illegal_op("brand_wire", args[1]))?;
            k.brand_wire(spd_id, thd_arg(args[0])?, op, args[2]).map(|_| 0)
        }
        Syscall::CapCntl => {
            let (consumer, supplier) = decode_spd_pair(args[0]);
            k.cap_cntl(consumer, supplier).map(|n| n as isize)
        }
        Syscall::ThdCntl => {
            let (op, thd_id) = decode_op_thd(args[0]);
            let op = ThdCntlOp::from_raw(op as u16).ok_or_else(|| illegal_op("thd_cntl", op))?;
            k.thd_cntl(spd_id, op, thd_id, args[1]).map(|v| v as isize)
        }
        _ => {
            debug!("syscall {:?} not supported by this kernel.", num);
            Err(SyscallError::IllegalOperation)
        }
    }
}

/// Executes syscall `num` for the running thread on behalf of domain
/// `spd_id`.
pub fn handle_syscall(k: &mut Kernel, num: usize, spd_id: SpdId, args: [usize; 4]) -> SyscallRet {
    let num = match Syscall::from_raw(num) {
        Some(num) => num,
        None => {
            debug!("unknown syscall {}.", num);
            let ret = SyscallError::IllegalOperation.errno();
            k.set_syscall_ret(ret);
            return SyscallRet::value(ret);
        }
    };

    let control = match num {
        Syscall::SwitchThread => {
            let (thd_id, flags) = decode_thd_flags(args[0]);
            k.switch_thread(spd_id, thd_id, SwitchFlags::from_bits(flags))
        }
        Syscall::BrandUpcall => {
            let (thd_id, _flags) = decode_thd_flags(args[0]);
            k.brand_upcall(spd_id, thd_id, [args[1], args[2]])
                .map(|next| SwitchOutcome { next, preempted: false })
        }
        Syscall::Upcall => spd_arg(args[0])
            .and_then(|dest| k.upcall(spd_id, dest))
            .map(|next| SwitchOutcome { next, preempted: false }),
        _ => {
            let ret = value_syscall(k, num, spd_id, args).unwrap_or_else(|e| e.errno());
            k.set_syscall_ret(ret);
            return SyscallRet::value(ret);
        }
    };

    // control transfers leave their own return values in the threads
    match control {
        Ok(out) => SyscallRet { ret: 0, next: Some(out.next), preempt: out.preempted },
        Err(e) => {
            let ret = e.errno();
            k.set_syscall_ret(ret);
            SyscallRet::value(ret)
        }
    }
}
