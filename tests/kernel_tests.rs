use std::cell::Cell;

use cos_kernel::common::measurement::MeasEvent;
use cos_kernel::common::structures::SyscallError;
use cos_kernel::config::{MAX_SERVICE_DEPTH, MAX_STATIC_CAP};
use cos_kernel::kernel::{
    BrandCntlOp, BrandWireOp, MpdCntlOp, RetAction, SchedCntlOp, SwitchFlags, SwitchOutcome, ThdCntlOp, UpcallReason,
};
use cos_kernel::object::SpdId;
use cos_kernel::syscall::handle_syscall;
use cos_kernel::task_manager::ThdId;
use cos_kernel::Kernel;

thread_local! {
    static NOW: Cell<u64> = Cell::new(0);
}

fn fake_clock() -> u64 {
    NOW.with(|n| n.get())
}

fn advance(cycles: u64) {
    NOW.with(|n| n.set(n.get() + cycles));
}

const SCHED_ENTRY: usize = 0x1000;
const A_ENTRY: usize = 0x2000;

struct System {
    k: Box<Kernel>,
    sched: SpdId,
    a: SpdId,
    b: SpdId,
    c: SpdId,
    boot: ThdId,
}

/// Root scheduler `sched` with capability 0 to `a` and 1 to `b`; `a` holds
/// capability 8 to `b` and 9 to itself; `b` holds capability 16 to `c`.
fn system() -> System {
    let mut k = Box::new(Kernel::new());
    k.set_cycle_clock(fake_clock);
    let sched = k.spd_create(0, 8, SCHED_ENTRY).unwrap();
    let a = k.spd_create(8, 8, A_ENTRY).unwrap();
    let b = k.spd_create(16, 8, 0x3000).unwrap();
    let c = k.spd_create(24, 8, 0x4000).unwrap();
    k.spd_make_scheduler(sched, None).unwrap();
    k.cap_install(0, sched, a, 0xa000).unwrap();
    k.cap_install(1, sched, b, 0xb000).unwrap();
    k.cap_install(8, a, b, 0xb000).unwrap();
    k.cap_install(9, a, a, 0xa000).unwrap();
    k.cap_install(16, b, c, 0xc000).unwrap();
    let boot = k.ready_boot_thread(sched).unwrap();
    System { k, sched, a, b, c, boot }
}

fn depth(k: &Kernel, t: ThdId) -> usize {
    k.thread(t).unwrap().stack.depth()
}

fn ref_cnt(k: &Kernel, spd: SpdId) -> usize {
    k.composite(k.composite_of(spd).unwrap()).unwrap().ref_cnt()
}

fn drain_events(k: &mut Kernel, sched: SpdId) -> Vec<u16> {
    let mut seen = Vec::new();
    let mut cursor = 0;
    k.sched_area_mut(sched).unwrap().drain(&mut cursor, |idx, _| seen.push(idx));
    seen
}

#[test]
fn invoke_then_return_restores_caller() {
    let System { mut k, sched, a, boot, .. } = system();
    let before = k.active_pg_tbl();
    assert_eq!(before, k.pg_tbl_of(k.composite_of(sched).unwrap()));

    let r = k.invoke(0, 0x7f00, 0x4242).unwrap();
    assert_eq!((r.entry, r.thd_id, r.spd_id), (0xa000, boot, sched));
    assert_eq!(depth(&k, boot), 2);
    assert_eq!(k.thread_composite(boot), k.composite_of(a));
    assert_eq!(k.active_pg_tbl(), k.pg_tbl_of(k.composite_of(a).unwrap()));
    assert_eq!(ref_cnt(&k, a), 2);

    assert_eq!(k.ret(), RetAction::Return { ip: 0x4242, sp: 0x7f00 });
    assert_eq!(k.active_pg_tbl(), before);
    assert_eq!(depth(&k, boot), 1);
    assert_eq!(ref_cnt(&k, a), 1);
    assert_eq!(k.measurements().count(MeasEvent::Invocations), 1);
}

#[test]
fn invocation_in_same_composite_skips_table_load() {
    let System { mut k, sched, a, .. } = system();
    k.mpd_cntl(sched, MpdCntlOp::Merge, sched, a).unwrap();
    let loads = k.pg_tbl_loads();
    k.invoke(0, 0, 0).unwrap();
    assert_eq!(k.pg_tbl_loads(), loads);
    k.ret();
    assert_eq!(k.pg_tbl_loads(), loads);
}

#[test]
fn bad_capabilities_are_rejected_without_effect() {
    let System { mut k, boot, .. } = system();
    assert_eq!(k.invoke(MAX_STATIC_CAP, 0, 0), Err(SyscallError::CapOutOfRange));
    assert_eq!(k.invoke(3, 0, 0), Err(SyscallError::CapNoOwner));
    // owned by a, but the thread runs in the scheduler
    assert_eq!(k.invoke(8, 0, 0), Err(SyscallError::CapUntrusted));
    assert_eq!(depth(&k, boot), 1);
    assert_eq!(k.measurements().count(MeasEvent::Invocations), 0);
}

#[test]
fn stack_overflow_fails_cleanly() {
    let System { mut k, a, boot, .. } = system();
    k.invoke(0, 0, 0).unwrap();
    for i in 2..MAX_SERVICE_DEPTH {
        k.invoke(9, i, i).unwrap();
    }
    assert_eq!(depth(&k, boot), MAX_SERVICE_DEPTH);
    assert_eq!(k.invoke(9, 0, 0), Err(SyscallError::InvocationStackFull));
    assert_eq!(depth(&k, boot), MAX_SERVICE_DEPTH);
    assert_eq!(ref_cnt(&k, a), MAX_SERVICE_DEPTH);

    for i in (2..MAX_SERVICE_DEPTH).rev() {
        assert_eq!(k.ret(), RetAction::Return { ip: i, sp: i });
    }
    assert_eq!(k.ret(), RetAction::Return { ip: 0, sp: 0 });
    assert_eq!(ref_cnt(&k, a), 1);
}

#[test]
fn returning_from_origin_destroys_into_root_scheduler() {
    let System { mut k, sched, a, boot, .. } = system();
    k.cap_install(10, a, sched, 0).unwrap();
    k.upcall(sched, a).unwrap();
    assert_eq!(k.thread(boot).unwrap().current_spd(), Some(a));

    assert_eq!(k.ret(), RetAction::Restore(boot));
    let t = k.thread(boot).unwrap();
    assert_eq!(t.current_spd(), Some(sched));
    assert_eq!(t.regs.option, UpcallReason::Destroy as usize);
    assert_eq!(t.regs.ret_ip, SCHED_ENTRY);
}

#[test]
fn bootstrap_upcall_needs_trust() {
    let System { mut k, sched, a, c, boot, .. } = system();
    assert_eq!(k.upcall(sched, a), Err(SyscallError::NoTrust));

    k.cap_install(10, a, sched, 0).unwrap();
    k.invoke(1, 0, 0).unwrap();
    k.ret();
    assert_eq!(k.upcall(sched, a), Ok(boot));
    let t = k.thread(boot).unwrap();
    assert_eq!(t.stack.depth(), 1);
    assert_eq!(t.current_spd(), Some(a));
    assert_eq!((t.regs.option, t.regs.ip, t.regs.ret), (UpcallReason::Bootstrap as usize, A_ENTRY, boot as isize));
    assert_eq!(k.active_pg_tbl(), k.pg_tbl_of(k.composite_of(a).unwrap()));
    assert_eq!(ref_cnt(&k, sched), 1);

    // c holds no capability to a
    assert_eq!(k.upcall(a, c), Err(SyscallError::NoTrust));
    assert_eq!(k.upcall(sched, c), Err(SyscallError::InvalidSpd));
    assert_eq!(k.measurements().count(MeasEvent::Upcalls), 1);
}

#[test]
fn split_of_unreferenced_composite_reuses_it() {
    let System { mut k, sched, a, b, .. } = system();
    k.mpd_cntl(sched, MpdCntlOp::Merge, a, b).unwrap();
    let merged = k.composite_of(a).unwrap();
    assert_eq!(k.composite_of(b), Some(merged));
    assert_eq!(k.num_composites(), 3);

    k.mpd_cntl(sched, MpdCntlOp::Split, b, a).unwrap();
    assert_eq!(k.composite_of(b), Some(merged));
    assert_ne!(k.composite_of(a), Some(merged));
    let c = k.composite(merged).unwrap();
    assert!(!c.is_deprecated());
    assert_eq!(c.members().iter().collect::<Vec<_>>(), vec![b]);
    assert_eq!(k.num_composites(), 4);
    assert_eq!(k.measurements().count(MeasEvent::MpdSplitReuse), 1);
}

#[test]
fn split_of_referenced_composite_deprecates_it() {
    let System { mut k, sched, a, b, boot, .. } = system();
    k.mpd_cntl(sched, MpdCntlOp::Merge, a, b).unwrap();
    let old = k.composite_of(a).unwrap();
    k.invoke(0, 0x10, 0x20).unwrap();
    assert_eq!(ref_cnt(&k, a), 2);

    k.mpd_cntl(a, MpdCntlOp::Split, a, b).unwrap();
    let c = k.composite(old).unwrap();
    assert!(c.is_deprecated());
    assert!(c.members().is_empty());
    assert_eq!(c.ref_cnt(), 1);
    assert_ne!(k.composite_of(a), Some(old));
    assert_ne!(k.composite_of(b), Some(old));
    assert_ne!(k.composite_of(a), k.composite_of(b));
    assert_eq!(k.thread_composite(boot), Some(old));
    assert_eq!(k.measurements().count(MeasEvent::MpdSplitReuse), 0);

    // the frame still names the retired composite
    assert_eq!(k.invoke(8, 0, 0), Err(SyscallError::CapUntrusted));
    assert_eq!(k.mpd_cntl(a, MpdCntlOp::Merge, a, b), Err(SyscallError::InvalidSpd));

    assert_eq!(k.ret(), RetAction::Return { ip: 0x20, sp: 0x10 });
    assert!(k.composite(old).is_none());
    assert_eq!(k.num_composites(), 4);
}

#[test]
fn split_then_merge_restores_membership() {
    let System { mut k, sched, a, b, c, .. } = system();
    k.mpd_cntl(sched, MpdCntlOp::Merge, a, b).unwrap();
    k.mpd_cntl(sched, MpdCntlOp::Merge, a, c).unwrap();
    let whole = k.composite_of(a).unwrap();
    let mut original = k.composite(whole).unwrap().members().iter().collect::<Vec<_>>();
    original.sort();

    let (alone, rest) = k.mpd_split(whole, b).unwrap();
    assert_eq!(k.composite(alone).unwrap().members().iter().collect::<Vec<_>>(), vec![b]);
    assert_eq!(k.composite(rest).unwrap().num_members(), 2);

    let merged = k.mpd_merge(alone, rest).unwrap();
    let mut members = k.composite(merged).unwrap().members().iter().collect::<Vec<_>>();
    members.sort();
    assert_eq!(members, original);
    // the other side was unreferenced and is gone already
    assert_eq!(k.num_composites(), 2);
}

#[test]
fn merge_keeps_referenced_composite_as_master() {
    let System { mut k, sched, a, b, .. } = system();
    let ca = k.composite_of(a).unwrap();
    let cb = k.composite_of(b).unwrap();
    k.invoke(0, 0, 0).unwrap();

    // b's composite has no frames, so it is the one torn down
    k.mpd_cntl(a, MpdCntlOp::Merge, b, a).unwrap();
    assert_eq!(k.composite_of(b), Some(ca));
    assert!(k.composite(cb).is_none());
    assert_eq!(k.composite(ca).unwrap().ref_cnt(), 2);
    assert_eq!(k.num_composites(), 3);
    k.ret();
    assert_eq!(ref_cnt(&k, sched), 2);
}

#[test]
fn subordinate_composite_drains_through_its_master() {
    let System { mut k, a, b, c, .. } = system();
    let ca = k.composite_of(a).unwrap();
    let cb = k.composite_of(b).unwrap();
    k.invoke(0, 0, 0).unwrap();
    k.invoke(8, 0, 0).unwrap();

    k.mpd_cntl(b, MpdCntlOp::Merge, a, b).unwrap();
    assert_eq!(k.composite_of(b), Some(ca));
    let sub = k.composite(cb).unwrap();
    assert!(sub.is_subordinate());
    assert!(sub.members().is_empty());
    assert_eq!(sub.ref_cnt(), 1);
    assert_eq!(k.pg_tbl_of(cb), k.pg_tbl_of(ca));
    assert_eq!(k.active_pg_tbl(), k.pg_tbl_of(ca));
    // descriptor, frame and subordinate
    assert_eq!(k.composite(ca).unwrap().ref_cnt(), 3);

    // b still validates through the master
    let r = k.invoke(16, 0, 0).unwrap();
    assert_eq!(r.spd_id, b);
    assert_eq!(k.thread_composite(r.thd_id), k.composite_of(c));
    k.ret();
    assert_eq!(k.active_pg_tbl(), k.pg_tbl_of(ca));
    k.ret();
    assert!(k.composite(cb).is_none());
    assert_eq!(k.composite(ca).unwrap().ref_cnt(), 2);
    k.ret();
    assert_eq!(k.composite(ca).unwrap().ref_cnt(), 1);
}

#[test]
fn merge_rejects_same_composite_and_singletons_cannot_split() {
    let System { mut k, sched, a, b, .. } = system();
    assert_eq!(k.mpd_cntl(sched, MpdCntlOp::Split, a, a), Err(SyscallError::SingletonSplit));
    assert_eq!(k.mpd_cntl(sched, MpdCntlOp::Split, a, b), Err(SyscallError::NotMember));
    k.mpd_cntl(sched, MpdCntlOp::Merge, a, b).unwrap();
    assert_eq!(k.mpd_cntl(sched, MpdCntlOp::Merge, a, b), Err(SyscallError::IllegalOperation));
    assert_eq!(k.mpd_cntl(sched, MpdCntlOp::Merge, a, 60), Err(SyscallError::InvalidSpd));
}

#[test]
fn exhausted_split_leaves_composite_untouched() {
    let System { mut k, sched, a, b, .. } = system();
    let err = loop {
        if let Err(e) = k.spd_create(0, 0, 0) {
            break e;
        }
    };
    assert_eq!(err, SyscallError::NoFreeSpd);
    k.mpd_cntl(sched, MpdCntlOp::Merge, a, b).unwrap();
    let c = k.composite_of(a).unwrap();
    let before = k.num_composites();

    k.invoke(0, 0, 0).unwrap();
    assert_eq!(k.mpd_cntl(a, MpdCntlOp::Split, a, b), Err(SyscallError::NoFreeMpd));
    assert_eq!(k.composite_of(a), Some(c));
    assert_eq!(k.composite_of(b), Some(c));
    assert_eq!(k.composite(c).unwrap().num_members(), 2);
    assert!(!k.composite(c).unwrap().is_deprecated());
    assert_eq!(k.num_composites(), before);

    // without the frame the split can reuse the composite
    k.ret();
    k.mpd_cntl(sched, MpdCntlOp::Split, a, b).unwrap();
    assert_eq!(k.composite_of(a), Some(c));
    assert_eq!(k.num_composites(), before + 1);
}

#[test]
fn thread_creation_exhausts_cleanly() {
    let System { mut k, sched, a, .. } = system();
    let mut created = Vec::new();
    let err = loop {
        match k.create_thread(sched, [1, 2, 3]) {
            Ok(id) => created.push(id),
            Err(e) => break e,
        }
    };
    assert_eq!(err, SyscallError::NoFreeThread);
    let t = k.thread(created[0]).unwrap();
    assert_eq!((t.regs.option, t.regs.arg1, t.regs.arg3), (UpcallReason::Create as usize, 1, 3));
    assert_eq!(t.current_spd(), Some(sched));
    assert_eq!(ref_cnt(&k, sched), created.len() + 2);
    assert!(k.sched_hierarchy_consistent(created[0]));

    assert_eq!(k.create_thread(a, [0; 3]), Err(SyscallError::InvalidSpd));
}

#[test]
fn thread_control_reads_frames() {
    let System { mut k, sched, a, boot, .. } = system();
    let x = k.create_thread(sched, [0; 3]).unwrap();
    assert_eq!(k.thd_cntl(sched, ThdCntlOp::InvFrame, x, 0), Ok(sched as usize));
    assert_eq!(k.thd_cntl(sched, ThdCntlOp::InvFrameIp, x, 0), Ok(SCHED_ENTRY));
    assert_eq!(k.thd_cntl(sched, ThdCntlOp::InvFrame, x, 4), Ok(0));
    assert_eq!(k.thd_cntl(sched, ThdCntlOp::InvFrame, 99, 0), Err(SyscallError::InvalidThread));

    k.invoke(0, 0x55, 0x66).unwrap();
    assert_eq!(k.thd_cntl(sched, ThdCntlOp::InvFrame, boot, 0), Err(SyscallError::InvalidSpd));
    assert_eq!(k.thd_cntl(a, ThdCntlOp::InvFrame, boot, 1), Err(SyscallError::NoSchedAuthority));
}

#[test]
fn cooperative_switch_charges_cycles() {
    let System { mut k, sched, boot, .. } = system();
    let x = k.create_thread(sched, [0; 3]).unwrap();
    k.sched_cntl(sched, SchedCntlOp::ThdEvt, boot, 1).unwrap();
    k.sched_cntl(sched, SchedCntlOp::ThdEvt, x, 2).unwrap();

    advance(100);
    k.sched_area_mut(sched).unwrap().next.next_thd_id = x;
    let out = k.switch_thread(sched, 0, SwitchFlags::default()).unwrap();
    assert_eq!(out, SwitchOutcome { next: x, preempted: false });
    assert_eq!(k.current_thread(), Some(x));
    assert_eq!(k.shared_data().current_thread, x);
    assert_eq!(k.thread(boot).unwrap().regs.ret, 0);
    assert_eq!(k.thread(boot).unwrap().sched_suspended, Some(sched));

    let area = k.sched_area(sched).unwrap();
    assert_eq!(area.event(1).unwrap().cpu_consumption, 100);
    assert_eq!(area.event(2).unwrap().cpu_consumption, 0);
    assert_eq!(drain_events(&mut k, sched), vec![1]);

    advance(30);
    k.sched_area_mut(sched).unwrap().next.next_thd_id = boot;
    k.switch_thread(sched, 0, SwitchFlags::default()).unwrap();
    assert_eq!(k.current_thread(), Some(boot));
    assert_eq!(k.sched_area(sched).unwrap().event(2).unwrap().cpu_consumption, 30);
    assert_eq!(k.measurements().count(MeasEvent::SwitchCoop), 2);
}

#[test]
fn stale_or_self_switch_asks_to_recompute() {
    let System { mut k, sched, boot, .. } = system();
    let x = k.create_thread(sched, [0; 3]).unwrap();

    assert_eq!(k.switch_thread(sched, 0, SwitchFlags::default()), Err(SyscallError::Outdated));
    k.sched_area_mut(sched).unwrap().next.next_thd_id = boot;
    assert_eq!(k.switch_thread(sched, 0, SwitchFlags::default()), Err(SyscallError::SelfSwitch));

    // an event after the decision clears it
    k.sched_cntl(sched, SchedCntlOp::ThdEvt, boot, 1).unwrap();
    k.sched_area_mut(sched).unwrap().next.next_thd_id = x;
    let brand = k.brand_cntl(sched, BrandCntlOp::CreateHw, 0, sched).unwrap();
    k.brand_cntl(sched, BrandCntlOp::AddThd, brand, 0).unwrap();
    k.brand_wire(sched, brand, BrandWireOp::Timer, 0).unwrap();
    k.sched_cntl(sched, SchedCntlOp::ThdEvt, brand, 2).unwrap();
    k.sched_area_mut(sched).unwrap().event_mut(2).unwrap().set_urgency(9);
    assert_eq!(k.hw_timer_event(), Some(boot));

    assert_eq!(k.switch_thread(sched, 0, SwitchFlags::default()), Err(SyscallError::Outdated));
    assert_eq!(k.current_thread(), Some(boot));
    assert_eq!(k.measurements().count(MeasEvent::SwitchOutdated), 2);
    assert_eq!(k.measurements().count(MeasEvent::SwitchSelf), 1);
    assert_eq!(SyscallError::Outdated.errno(), 1);
}

#[test]
fn sync_block_checks_lock_owner() {
    let System { mut k, sched, boot, .. } = system();
    let x = k.create_thread(sched, [0; 3]).unwrap();
    let y = k.create_thread(sched, [0; 3]).unwrap();
    let block = SwitchFlags::default().with_sync_block();

    k.sched_area_mut(sched).unwrap().locks.owner_thd = y;
    assert_eq!(k.switch_thread(sched, x, block), Err(SyscallError::StaleLock));
    assert_eq!(k.current_thread(), Some(boot));

    k.sched_area_mut(sched).unwrap().locks.owner_thd = x;
    k.switch_thread(sched, x, block).unwrap();
    assert_eq!(k.current_thread(), Some(x));
    assert_eq!(k.sched_area(sched).unwrap().locks.queued_thd, boot);
    assert_eq!(k.measurements().count(MeasEvent::AtomicStaleLock), 1);
    assert_eq!(k.measurements().count(MeasEvent::AtomicLock), 1);

    k.switch_thread(sched, boot, SwitchFlags::default().with_sync_unblock()).unwrap();
    assert_eq!(k.current_thread(), Some(boot));
    assert_eq!(k.measurements().count(MeasEvent::AtomicUnlock), 1);
}

#[test]
fn tailcall_only_from_active_upcall() {
    let System { mut k, sched, .. } = system();
    let x = k.create_thread(sched, [0; 3]).unwrap();
    let tail = SwitchFlags::default().with_tailcall();
    k.sched_area_mut(sched).unwrap().next.next_thd_id = x;
    assert_eq!(k.switch_thread(sched, 0, tail), Err(SyscallError::IllegalTailcall));
}

#[test]
fn delegation_keeps_hierarchy_prefix() {
    let System { mut k, sched, a, b, .. } = system();
    k.spd_make_scheduler(a, Some(sched)).unwrap();
    k.spd_make_scheduler(b, Some(a)).unwrap();
    assert_eq!(k.spd(b).unwrap().sched_depth(), Some(2));
    let x = k.create_thread(sched, [0; 3]).unwrap();

    k.sched_cntl(sched, SchedCntlOp::GrantSched, x, a as usize).unwrap();
    assert_eq!(k.thread(x).unwrap().sched_at(1), Some(a));
    assert!(k.sched_hierarchy_consistent(x));
    // b is a's child, not the root's
    assert_eq!(k.sched_cntl(sched, SchedCntlOp::GrantSched, x, b as usize), Err(SyscallError::NotSchedChild));

    k.sched_cntl(sched, SchedCntlOp::RevokeSched, x, a as usize).unwrap();
    assert_eq!(k.thread(x).unwrap().sched_at(1), None);
    assert!(k.sched_hierarchy_consistent(x));
    assert_eq!(
        k.sched_cntl(sched, SchedCntlOp::RevokeSched, x, a as usize),
        Err(SyscallError::PrivilegeNotHeld)
    );
    assert_eq!(k.sched_cntl(sched, SchedCntlOp::ThdEvt, x, 0), Err(SyscallError::InvalidEventIndex));
    assert_eq!(k.sched_cntl(sched, SchedCntlOp::EvtRegion, x, 0), Ok(()));
}

#[test]
fn exclusive_yield_bars_less_authoritative_scheduler() {
    let System { mut k, sched, a, boot, .. } = system();
    k.spd_make_scheduler(a, Some(sched)).unwrap();
    let x = k.create_thread(sched, [0; 3]).unwrap();
    k.sched_cntl(sched, SchedCntlOp::GrantSched, x, a as usize).unwrap();
    k.sched_cntl(sched, SchedCntlOp::GrantSched, boot, a as usize).unwrap();

    k.sched_area_mut(sched).unwrap().next.next_thd_id = x;
    k.switch_thread(sched, 0, SwitchFlags::default().with_excl_yield()).unwrap();
    assert!(k.thread(boot).unwrap().sched_excl);

    // x enters the child scheduler and tries to resume the yielder
    k.invoke(0, 0, 0).unwrap();
    k.sched_area_mut(a).unwrap().next.next_thd_id = boot;
    assert_eq!(k.switch_thread(a, 0, SwitchFlags::default()), Err(SyscallError::ExclusiveResume));
    k.ret();

    k.sched_area_mut(sched).unwrap().next.next_thd_id = boot;
    k.switch_thread(sched, 0, SwitchFlags::default()).unwrap();
    assert_eq!(k.current_thread(), Some(boot));
    assert!(!k.thread(boot).unwrap().sched_excl);
}

struct Branded {
    sys: System,
    brand: ThdId,
    upcall: ThdId,
}

/// A hardware timer brand delivering into the root scheduler, the boot
/// thread registered in slot 1 and the brand in slot 2.
fn branded(thread_urgency: u16, upcall_urgency: u16) -> Branded {
    let mut sys = system();
    let (k, sched, boot) = (&mut sys.k, sys.sched, sys.boot);
    let brand = k.brand_cntl(sched, BrandCntlOp::CreateHw, 0, sched).unwrap();
    let upcall = k.brand_cntl(sched, BrandCntlOp::AddThd, brand, 0).unwrap();
    k.brand_wire(sched, brand, BrandWireOp::Timer, 0).unwrap();
    k.sched_cntl(sched, SchedCntlOp::ThdEvt, boot, 1).unwrap();
    k.sched_cntl(sched, SchedCntlOp::ThdEvt, brand, 2).unwrap();
    let area = k.sched_area_mut(sched).unwrap();
    area.event_mut(1).unwrap().set_urgency(thread_urgency);
    area.event_mut(2).unwrap().set_urgency(upcall_urgency);
    Branded { sys, brand, upcall }
}

fn interrupted_id(k: &Kernel, t: ThdId) -> Option<ThdId> {
    k.thread(t).unwrap().interrupted().map(|h| h.index() as ThdId + 1)
}

#[test]
fn brand_creation_checks_call_path() {
    let System { mut k, sched, a, c, .. } = system();
    assert_eq!(k.brand_cntl(sched, BrandCntlOp::Create, 0, c), Err(SyscallError::NotInCallPath));
    let brand = k.brand_cntl(sched, BrandCntlOp::Create, 0, sched).unwrap();
    assert_eq!(k.brand_wire(sched, brand, BrandWireOp::Timer, 0), Err(SyscallError::NotHwBrand));
    assert_eq!(k.brand_upcall(sched, brand, [0, 0]), Err(SyscallError::NotBrand));

    let u1 = k.brand_cntl(sched, BrandCntlOp::AddThd, brand, 0).unwrap();
    let u2 = k.brand_cntl(sched, BrandCntlOp::AddThd, brand, 0).unwrap();
    let b = k.thread(brand).unwrap().brand().unwrap();
    assert_eq!(b.dest, sched);
    assert_eq!(b.upcalls.map(|h| h.index() as ThdId + 1), Some(u2));
    assert!(k.thread(u1).unwrap().is_ready_upcall());
    assert_eq!(k.brand_cntl(sched, BrandCntlOp::AddThd, u1, 0), Err(SyscallError::NotBrand));

    k.invoke(0, 0, 0).unwrap();
    let inner = k.brand_cntl(a, BrandCntlOp::Create, 0, a).unwrap();
    assert_eq!(k.thread(inner).unwrap().brand().unwrap().inv_depth, 1);
}

#[test]
fn brand_threads_cannot_be_switched_to() {
    let System { mut k, sched, boot, .. } = system();
    let brand = k.brand_cntl(sched, BrandCntlOp::Create, 0, sched).unwrap();
    k.sched_area_mut(sched).unwrap().next.next_thd_id = brand;
    assert_eq!(k.switch_thread(sched, 0, SwitchFlags::default()), Err(SyscallError::InvalidThread));
    assert_eq!(k.current_thread(), Some(boot));
    assert_eq!(k.thread(brand).unwrap().stack.depth(), 0);

    // the caller still runs in its own frame
    assert_eq!(k.invoke(0, 0, 0).unwrap().thd_id, boot);
    assert_eq!(depth(&k, boot), 2);
}

#[test]
fn urgent_upcall_preempts_and_returns() {
    let Branded { sys, brand, upcall } = branded(10, 5);
    let System { mut k, sched, boot, .. } = sys;

    assert_eq!(k.hw_timer_event(), Some(upcall));
    assert_eq!(k.current_thread(), Some(upcall));
    assert!(k.thread(boot).unwrap().is_preempted());
    assert_eq!(interrupted_id(&k, upcall), Some(boot));
    assert!(k.preemption_chains_symmetric());
    let u = k.thread(upcall).unwrap();
    assert!(u.is_active_upcall());
    assert_eq!((u.regs.option, u.regs.ip), (UpcallReason::BrandExec as usize, SCHED_ENTRY));
    assert_eq!(k.measurements().count(MeasEvent::BrandUc), 1);
    assert_eq!(drain_events(&mut k, sched), vec![1, 2]);
    assert_eq!(k.sched_area(sched).unwrap().event(2).unwrap().flags(), 1);

    assert_eq!(k.ret(), RetAction::Restore(boot));
    assert_eq!(k.current_thread(), Some(boot));
    assert!(!k.thread(boot).unwrap().is_preempted());
    assert_eq!(k.thread(boot).unwrap().preempter(), None);
    assert_eq!(interrupted_id(&k, upcall), None);
    assert!(k.thread(upcall).unwrap().is_ready_upcall());
    assert_eq!(k.thread(upcall).unwrap().stack.depth(), 0);
    assert_eq!(k.thread(brand).unwrap().brand().unwrap().pending(), 0);
    assert_eq!(k.sched_area(sched).unwrap().event(2).unwrap().flags(), 2);
    assert!(k.preemption_chains_symmetric());
}

#[test]
fn event_on_active_upcall_is_coalesced() {
    let Branded { sys, brand, upcall } = branded(10, 5);
    let System { mut k, boot, .. } = sys;
    k.hw_timer_event();

    assert_eq!(k.hw_timer_event(), Some(upcall));
    assert_eq!(k.current_thread(), Some(upcall));
    assert_eq!(k.thread(brand).unwrap().brand().unwrap().pending(), 1);
    assert_eq!(k.measurements().count(MeasEvent::BrandPend), 1);

    // the pending request is served before going back
    assert_eq!(k.ret(), RetAction::Restore(upcall));
    assert_eq!(k.thread(brand).unwrap().brand().unwrap().pending(), 0);
    assert_eq!(k.thread(upcall).unwrap().stack.depth(), 1);
    assert_eq!(k.measurements().count(MeasEvent::BrandPendExecute), 1);

    assert_eq!(k.ret(), RetAction::Restore(boot));
    assert!(!k.thread(boot).unwrap().is_preempted());
}

#[test]
fn less_urgent_event_is_delayed_and_dispatched_later() {
    let Branded { sys, brand, upcall } = branded(5, 10);
    let System { mut k, sched, boot, .. } = sys;

    assert_eq!(k.hw_timer_event(), Some(boot));
    assert_eq!(k.current_thread(), Some(boot));
    assert!(k.thread(upcall).unwrap().is_active_upcall());
    assert!(!k.thread(boot).unwrap().is_preempted());
    assert_eq!(k.measurements().count(MeasEvent::BrandDelayed), 1);
    assert_eq!(drain_events(&mut k, sched), vec![2]);

    k.sched_area_mut(sched).unwrap().next.next_thd_id = upcall;
    k.switch_thread(sched, 0, SwitchFlags::default()).unwrap();
    assert_eq!(k.current_thread(), Some(upcall));

    // done with the event, hand the core back directly
    k.sched_area_mut(sched).unwrap().next.next_thd_id = boot;
    let out = k.switch_thread(sched, 0, SwitchFlags::default().with_tailcall()).unwrap();
    assert_eq!(out.next, boot);
    assert!(k.thread(upcall).unwrap().is_ready_upcall());
    assert_eq!(k.thread(upcall).unwrap().stack.depth(), 0);
    assert_eq!(k.thread(brand).unwrap().brand().unwrap().pending(), 0);
    assert_eq!(k.measurements().count(MeasEvent::BrandCompletionTailcall), 1);

    // a ready upcall cannot be dispatched
    k.sched_area_mut(sched).unwrap().next.next_thd_id = upcall;
    assert_eq!(k.switch_thread(sched, 0, SwitchFlags::default()), Err(SyscallError::UpcallNotReady));
}

#[test]
fn software_brand_upcall_links_without_marking() {
    let Branded { sys, brand, upcall } = branded(10, 5);
    let System { mut k, sched, boot, .. } = sys;

    assert_eq!(k.brand_upcall(sched, brand, [7, 8]), Ok(upcall));
    assert_eq!(k.current_thread(), Some(upcall));
    let u = k.thread(upcall).unwrap();
    assert_eq!((u.regs.arg1, u.regs.arg2), (7, 8));
    assert_eq!(k.thread(boot).unwrap().regs.ret, 1);
    assert!(!k.thread(boot).unwrap().is_preempted());
    assert_eq!(interrupted_id(&k, upcall), Some(boot));

    // once broken, completion goes to the scheduler
    k.sched_cntl(sched, SchedCntlOp::BreakPreemptionChain, 0, 0).unwrap();
    assert_eq!(interrupted_id(&k, upcall), None);
    assert_eq!(k.ret(), RetAction::Restore(upcall));
    let u = k.thread(upcall).unwrap();
    assert_eq!(u.regs.option, UpcallReason::BrandComplete as usize);
    assert!(u.is_active_upcall());
    assert_eq!(k.measurements().count(MeasEvent::BrandCompletionUc), 1);
}

#[test]
fn net_brands_are_keyed_by_port() {
    let Branded { sys, brand, upcall } = branded(10, 5);
    let System { mut k, sched, .. } = sys;
    k.brand_wire(sched, brand, BrandWireOp::Net, 80).unwrap();
    k.brand_wire(sched, brand, BrandWireOp::Net, 81).unwrap();
    assert_eq!(k.brand_wire(sched, brand, BrandWireOp::Net, 82), Err(SyscallError::TooManyNetBrands));
    assert_eq!(k.hw_net_event(443), None);
    assert_eq!(k.hw_net_event(81), Some(upcall));

    assert_eq!(k.upcall_notif_brand(), None);
    k.brand_wire(sched, brand, BrandWireOp::UpcallNotif, 0).unwrap();
    assert_eq!(k.upcall_notif_brand(), Some(brand));
}

#[test]
fn cap_control_reads_and_resets_counters() {
    let System { mut k, sched, a, b, .. } = system();
    for _ in 0..3 {
        k.invoke(0, 0, 0).unwrap();
        k.ret();
    }
    k.invoke(1, 0, 0).unwrap();
    k.ret();
    assert_eq!(k.cap_cntl(sched, a), Ok(3));
    assert_eq!(k.cap_cntl(sched, a), Ok(0));
    assert_eq!(k.cap_cntl(sched, b), Ok(1));
    assert_eq!(k.cap_cntl(sched, 0), Err(SyscallError::InvalidSpd));
}

#[test]
fn syscall_dispatch_writes_return_values() {
    let System { mut k, sched, boot, .. } = system();
    let r = handle_syscall(&mut k, 3, sched, [0; 4]);
    assert!(r.ret > 0 && r.next.is_none());
    let x = r.ret as ThdId;
    assert_eq!(k.thread(boot).unwrap().regs.ret, r.ret);

    let r = handle_syscall(&mut k, 99, sched, [0; 4]);
    assert_eq!(r.ret, -1);
    let r = handle_syscall(&mut k, 1, sched, [0; 4]);
    assert_eq!(r.ret, -1);
    // switch without a decision
    let r = handle_syscall(&mut k, 4, sched, [0; 4]);
    assert_eq!((r.ret, r.next), (1, None));
    assert_eq!(k.thread(boot).unwrap().regs.ret, 1);

    let r = handle_syscall(&mut k, 4, sched, [(x as usize) << 16 | 0b0100, 0, 0, 0]);
    assert_eq!(r.next, Some(x));
    assert_eq!(k.current_thread(), Some(x));
}
