//! The kernel core: invocation and return, thread switching, brand and
//! upcall delivery, composite management, and the event notifications
//! they produce for user-level schedulers.

mod boot;
mod brand;
pub mod c_traps;
mod invocation;
mod mpd;
mod sched_cntl;
mod sched_evt;
mod thread;
mod upcall;

pub use brand::{BrandCntlOp, BrandWireOp, PreemptMode};
pub use invocation::{InvocationRet, RetAction};
pub use mpd::MpdCntlOp;
pub use sched_cntl::SchedCntlOp;
pub use thread::{SwitchFlags, SwitchOutcome, ThdCntlOp};
pub use upcall::UpcallReason;

use log::debug;

use crate::common::measurement::Measurements;
use crate::common::structures::{SyscallError, SyscallResult};
use crate::common::utils::{cpu_id, read_cycle, CycleClock};
use crate::config::{CONFIG_MAX_NUM_NODES, COS_INFO_REGION_ADDR, NUM_NET_BRANDS, PAGE_SIZE};
use crate::cspace::CapTable;
use crate::ipc::SchedDataArea;
use crate::object::{CompositeSpd, MpdHandle, MpdTable, Spd, SpdId, SpdTable};
use crate::task_manager::{hierarchy_consistent, ThdHandle, ThdId, Thread, ThreadTable};
use crate::vspace::{PgTbl, VSpace};

/// Kernel-written part of the page every component can read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SharedUserData {
    pub current_thread: ThdId,
    pub argument_region: usize,
}

struct CoreState {
    cur_thread: Option<ThdHandle>,
    vspace: VSpace,
    /// Cycle counter at the last accounting point.
    cycle_cnt: u64,
    shared: SharedUserData,
}

impl CoreState {
    const fn new() -> Self {
        Self {
            cur_thread: None,
            vspace: VSpace::new(),
            cycle_cnt: 0,
            shared: SharedUserData { current_thread: 0, argument_region: 0 },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NetBrand {
    brand: ThdHandle,
    port: u16,
}

pub struct Kernel {
    threads: ThreadTable,
    spds: SpdTable,
    mpds: MpdTable,
    caps: CapTable,
    meas: Measurements,
    cores: [CoreState; CONFIG_MAX_NUM_NODES],
    clock: CycleClock,
    timer_brand: Option<ThdHandle>,
    net_brands: [Option<NetBrand>; NUM_NET_BRANDS],
    upcall_notif_brand: Option<ThdHandle>,
}

impl Kernel {
    /// Usable as the initialiser of a `static`, so the tables are laid out
    /// in place rather than built on the boot stack.
    pub const fn new() -> Self {
        Self {
            threads: ThreadTable::new(),
            spds: SpdTable::new(),
            mpds: MpdTable::new(),
            caps: CapTable::new(),
            meas: Measurements::new(),
            cores: [const { CoreState::new() }; CONFIG_MAX_NUM_NODES],
            clock: read_cycle,
            timer_brand: None,
            net_brands: [None; NUM_NET_BRANDS],
            upcall_notif_brand: None,
        }
    }

    /// Replaces the cycle counter used for CPU accounting.
    pub fn set_cycle_clock(&mut self, clock: CycleClock) {
        self.clock = clock;
        let now = clock();
        for core in self.cores.iter_mut() {
            core.cycle_cnt = now;
        }
    }

    #[inline]
    fn core(&self) -> &CoreState {
        &self.cores[cpu_id()]
    }

    #[inline]
    fn core_mut(&mut self) -> &mut CoreState {
        &mut self.cores[cpu_id()]
    }

    /// The thread running on this core. Every kernel entry after boot has
    /// one.
    #[inline]
    fn current(&self) -> ThdHandle {
        match self.core().cur_thread {
            Some(h) => h,
            None => panic!("no thread running on core {}", cpu_id()),
        }
    }

    #[inline]
    fn thread_id(&self, h: ThdHandle) -> ThdId {
        self.threads.expect(h).id()
    }

    /// Composite denoted by the top frame of `t`.
    fn thd_composite(&self, t: ThdHandle) -> Option<MpdHandle> {
        self.threads.expect(t).stack.top().map(|f| f.mpd.handle())
    }

    /// Loads the page table of composite `c` unless it is already active.
    fn open_composite(&mut self, c: MpdHandle) {
        let pg = self.mpds.pg_tbl_of(c);
        self.core_mut().vspace.switch_pg_tbls(pg);
    }

    /// `spd_id` as claimed by the running thread, accepted only if the
    /// domain is part of the composite the thread currently executes in.
    fn thd_validate_get_current_spd(&self, t: ThdHandle, spd_id: SpdId) -> SyscallResult<SpdId> {
        if self.spds.get(spd_id).is_none() {
            debug!("component claimed in spd {}, but no such component.", spd_id);
            return Err(SyscallError::InvalidSpd);
        }
        match self.thd_composite(t) {
            Some(c) if self.mpds.contains(c, spd_id) => Ok(spd_id),
            _ => {
                debug!("component claimed in spd {}, but not.", spd_id);
                Err(SyscallError::InvalidSpd)
            }
        }
    }

    /// Makes `next` the running thread and loads its address space.
    fn switch_thread_context(&mut self, curr: ThdHandle, next: ThdHandle) {
        assert_ne!(curr, next, "switching thread {:?} to itself", curr);
        let ntid = self.thread_id(next);
        let core = self.core_mut();
        assert_eq!(core.cur_thread, Some(curr));
        core.cur_thread = Some(next);
        core.shared.current_thread = ntid;
        core.shared.argument_region = ntid as usize * PAGE_SIZE + COS_INFO_REGION_ADDR;
        if let Some(c) = self.thd_composite(next) {
            self.open_composite(c);
        }
    }

    /// Writes the return value of a syscall into the running thread's
    /// saved registers.
    pub fn set_syscall_ret(&mut self, ret: isize) {
        let cur = self.current();
        self.threads.expect_mut(cur).regs.ret = ret;
    }

    pub fn thread(&self, id: ThdId) -> Option<&Thread> {
        self.threads.by_id(id).and_then(|h| self.threads.get(h))
    }

    pub fn current_thread(&self) -> Option<ThdId> {
        self.core().cur_thread.map(|h| self.thread_id(h))
    }

    pub fn spd(&self, id: SpdId) -> Option<&Spd> {
        self.spds.get(id)
    }

    pub fn composite(&self, c: MpdHandle) -> Option<&CompositeSpd> {
        self.mpds.get(c)
    }

    pub fn composite_of(&self, spd: SpdId) -> Option<MpdHandle> {
        self.spds.get(spd).map(|s| s.composite)
    }

    /// Composite the thread `id` currently executes in.
    pub fn thread_composite(&self, id: ThdId) -> Option<MpdHandle> {
        self.threads.by_id(id).and_then(|h| self.thd_composite(h))
    }

    pub fn pg_tbl_of(&self, c: MpdHandle) -> Option<PgTbl> {
        self.mpds.get(c).map(|_| self.mpds.pg_tbl_of(c))
    }

    pub fn active_pg_tbl(&self) -> Option<PgTbl> {
        self.core().vspace.active()
    }

    /// Page-table loads performed on this core.
    pub fn pg_tbl_loads(&self) -> usize {
        self.core().vspace.loads()
    }

    pub fn num_composites(&self) -> usize {
        self.mpds.len()
    }

    pub fn shared_data(&self) -> SharedUserData {
        self.core().shared
    }

    pub fn measurements(&self) -> &Measurements {
        &self.meas
    }

    pub fn sched_area(&self, sched: SpdId) -> Option<&SchedDataArea> {
        self.spds.get(sched).and_then(|s| s.sched.as_ref()).map(|r| &r.area)
    }

    /// The page a scheduler shares with the kernel, as the scheduler sees
    /// it.
    pub fn sched_area_mut(&mut self, sched: SpdId) -> Option<&mut SchedDataArea> {
        self.spds.get_mut(sched).and_then(|s| s.sched.as_mut()).map(|r| &mut r.area)
    }

    /// Brand notified of upcall activity, if one is wired.
    pub fn upcall_notif_brand(&self) -> Option<ThdId> {
        self.upcall_notif_brand.map(|h| self.thread_id(h))
    }

    pub fn preemption_chains_symmetric(&self) -> bool {
        self.threads.chains_symmetric()
    }

    pub fn sched_hierarchy_consistent(&self, id: ThdId) -> bool {
        self.thread(id).map_or(false, |t| hierarchy_consistent(t, &self.spds))
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
