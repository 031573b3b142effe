use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{MAX_NUM_THREADS, MAX_SCHED_HIER_DEPTH};
use crate::object::{Arena, Handle, SpdId};

use super::inv_stack::InvocationStack;

/// Thread ids are slot index + 1; 0 never names a thread.
pub type ThdId = u16;
pub type ThdHandle = Handle<Thread>;

/// Saved user context, in the registers the upcall and syscall return
/// paths use.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    /// Return value of the last syscall, or the thread id on upcall entry.
    pub ret: isize,
    pub arg1: usize,
    pub arg2: usize,
    pub arg3: usize,
    /// Upcall reason.
    pub option: usize,
    /// Instruction the syscall returns to; the upcall entry point.
    pub ret_ip: usize,
    /// Instruction pointer saved when the thread was preempted.
    pub ip: usize,
    pub sp: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    Running,
    /// Interrupted by an upcall; resumes from the full saved context.
    Preempted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpcallState {
    /// Waiting for the next event of its brand.
    Ready,
    /// Delivering an event.
    Active,
}

pub struct BrandInfo {
    /// Wired to a hardware event source.
    pub hw: bool,
    /// Domain upcalls are delivered to, found in the creator's call path.
    pub dest: SpdId,
    /// Frame offset of `dest` in the creator's invocation stack.
    pub inv_depth: usize,
    pending_upcall_requests: AtomicU32,
    /// Head of the list of upcall threads; the head delivers events.
    pub upcalls: Option<ThdHandle>,
}

impl BrandInfo {
    pub fn new(hw: bool, dest: SpdId, inv_depth: usize) -> Self {
        Self {
            hw,
            dest,
            inv_depth,
            pending_upcall_requests: AtomicU32::new(0),
            upcalls: None,
        }
    }

    #[inline]
    pub fn pending(&self) -> u32 {
        self.pending_upcall_requests.load(Ordering::Acquire)
    }

    #[inline]
    pub fn add_pending(&self) {
        self.pending_upcall_requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Consumes one pending request, if any.
    pub fn take_pending(&self) -> bool {
        self.pending_upcall_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct UpcallInfo {
    pub brand: ThdHandle,
    pub state: UpcallState,
    /// Next upcall thread of the same brand.
    pub next: Option<ThdHandle>,
}

pub enum ThreadKind {
    Normal,
    Brand(BrandInfo),
    Upcall(UpcallInfo),
}

/// One level of a thread's scheduler hierarchy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedInfo {
    pub scheduler: Option<SpdId>,
    /// Event slot in the scheduler's shared page.
    pub notification: Option<u16>,
}

pub struct Thread {
    id: ThdId,
    pub cpu_id: usize,
    pub regs: Registers,
    pub stack: InvocationStack,
    pub kind: ThreadKind,
    pub(super) exec: ExecState,
    /// Suspended by a scheduler that asked for exclusivity.
    pub sched_excl: bool,
    /// CPU consumption is reported to the thread's schedulers.
    pub cyc_cnt: bool,
    pub sched_info: [SchedInfo; MAX_SCHED_HIER_DEPTH],
    /// Scheduler that last switched away from this thread.
    pub sched_suspended: Option<SpdId>,
    pub(super) preempter: Option<ThdHandle>,
    pub(super) interrupted: Option<ThdHandle>,
}

impl Thread {
    fn new(id: ThdId, cpu_id: usize) -> Self {
        Self {
            id,
            cpu_id,
            regs: Registers::default(),
            stack: InvocationStack::new(),
            kind: ThreadKind::Normal,
            exec: ExecState::Running,
            sched_excl: false,
            cyc_cnt: false,
            sched_info: [SchedInfo::default(); MAX_SCHED_HIER_DEPTH],
            sched_suspended: None,
            preempter: None,
            interrupted: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ThdId {
        self.id
    }

    #[inline]
    pub fn exec_state(&self) -> ExecState {
        self.exec
    }

    #[inline]
    pub fn is_preempted(&self) -> bool {
        self.exec == ExecState::Preempted
    }

    #[inline]
    pub fn preempter(&self) -> Option<ThdHandle> {
        self.preempter
    }

    #[inline]
    pub fn interrupted(&self) -> Option<ThdHandle> {
        self.interrupted
    }

    #[inline]
    pub fn brand(&self) -> Option<&BrandInfo> {
        match &self.kind {
            ThreadKind::Brand(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn brand_mut(&mut self) -> Option<&mut BrandInfo> {
        match &mut self.kind {
            ThreadKind::Brand(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn upcall(&self) -> Option<&UpcallInfo> {
        match &self.kind {
            ThreadKind::Upcall(u) => Some(u),
            _ => None,
        }
    }

    #[inline]
    pub fn upcall_state(&self) -> Option<UpcallState> {
        self.upcall().map(|u| u.state)
    }

    #[inline]
    pub fn is_active_upcall(&self) -> bool {
        self.upcall_state() == Some(UpcallState::Active)
    }

    #[inline]
    pub fn is_ready_upcall(&self) -> bool {
        self.upcall_state() == Some(UpcallState::Ready)
    }

    /// Ready -> Active, when an event is handed to the thread.
    pub fn activate_upcall(&mut self) {
        match &mut self.kind {
            ThreadKind::Upcall(u) => {
                assert_eq!(u.state, UpcallState::Ready, "activating busy upcall {}", self.id);
                u.state = UpcallState::Active;
            }
            _ => panic!("thread {} is not an upcall", self.id),
        }
    }

    /// Active -> Ready, when the event has been handled.
    pub fn ready_upcall(&mut self) {
        match &mut self.kind {
            ThreadKind::Upcall(u) => {
                assert_eq!(u.state, UpcallState::Active, "completing idle upcall {}", self.id);
                u.state = UpcallState::Ready;
                self.sched_suspended = None;
            }
            _ => panic!("thread {} is not an upcall", self.id),
        }
    }

    /// Domain of the top invocation frame.
    #[inline]
    pub fn current_spd(&self) -> Option<SpdId> {
        self.stack.top().map(|f| f.spd)
    }

    #[inline]
    pub fn sched_at(&self, depth: usize) -> Option<SpdId> {
        self.sched_info.get(depth).and_then(|i| i.scheduler)
    }

    /// Write the entry context of an upcall into the saved registers.
    pub fn set_upcall_regs(&mut self, entry: usize, option: usize, arg1: usize, arg2: usize, arg3: usize) {
        self.regs.arg1 = arg1;
        self.regs.arg2 = arg2;
        self.regs.arg3 = arg3;
        self.regs.option = option;
        self.regs.ip = entry;
        self.regs.ret_ip = entry;
        self.regs.ret = self.id as isize;
    }
}

/// Threads are never freed; a finished thread is handed back to its root
/// scheduler.
pub struct ThreadTable {
    arena: Arena<Thread, MAX_NUM_THREADS>,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self { arena: Arena::new() }
    }

    pub fn alloc(&mut self, cpu_id: usize) -> Option<ThdHandle> {
        self.arena.alloc_with(|h| Thread::new(h.index() as ThdId + 1, cpu_id))
    }

    /// Handle of the thread currently known by `id`.
    #[inline]
    pub fn by_id(&self, id: ThdId) -> Option<ThdHandle> {
        if id == 0 {
            return None;
        }
        self.arena.handle_at(id as usize - 1)
    }

    #[inline]
    pub fn get(&self, h: ThdHandle) -> Option<&Thread> {
        self.arena.get(h)
    }

    #[inline]
    pub fn get_mut(&mut self, h: ThdHandle) -> Option<&mut Thread> {
        self.arena.get_mut(h)
    }

    #[inline]
    pub fn get2_mut(&mut self, a: ThdHandle, b: ThdHandle) -> Option<(&mut Thread, &mut Thread)> {
        self.arena.get2_mut(a, b)
    }

    /// Handles stored by the kernel itself must stay valid.
    #[inline]
    pub fn expect(&self, h: ThdHandle) -> &Thread {
        match self.arena.get(h) {
            Some(t) => t,
            None => panic!("dangling thread handle {:?}", h),
        }
    }

    #[inline]
    pub fn expect_mut(&mut self, h: ThdHandle) -> &mut Thread {
        match self.arena.get_mut(h) {
            Some(t) => t,
            None => panic!("dangling thread handle {:?}", h),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThdHandle, &Thread)> + '_ {
        self.arena.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
