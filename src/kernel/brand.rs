//! Brands and their upcall threads: creation, wiring to event sources,
//! and the decision whether an event preempts the running thread.

use log::{debug, warn};

use crate::common::measurement::MeasEvent;
use crate::common::structures::{SyscallError, SyscallResult};
use crate::common::utils::cpu_id;
use crate::ipc::SchedEvt;
use crate::object::SpdId;
use crate::task_manager::{
    copy_sched_info, most_common_sched_depth, BrandInfo, ThdHandle, ThdId, ThreadKind, UpcallInfo, UpcallState,
};

use super::upcall::UpcallReason;
use super::{Kernel, NetBrand};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum BrandCntlOp {
    Create = 0,
    CreateHw = 1,
    AddThd = 2,
}

impl BrandCntlOp {
    pub fn from_raw(op: usize) -> Option<Self> {
        match op {
            0 => Some(Self::Create),
            1 => Some(Self::CreateHw),
            2 => Some(Self::AddThd),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum BrandWireOp {
    Timer = 0,
    /// Network brand for the port given as data.
    Net = 1,
    UpcallNotif = 2,
}

impl BrandWireOp {
    pub fn from_raw(op: usize) -> Option<Self> {
        match op {
            0 => Some(Self::Timer),
            1 => Some(Self::Net),
            2 => Some(Self::UpcallNotif),
            _ => None,
        }
    }
}

/// What delivering an upcall does to the thread it interrupts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreemptMode {
    /// No preemption chain; the upcall does not return to it.
    None,
    /// Chain the threads and resume the interrupted one from its full
    /// saved context.
    Full,
    /// Chain the threads only.
    LinkOnly,
}

impl Kernel {
    fn brand_of(&self, id: ThdId) -> SyscallResult<ThdHandle> {
        let h = match self.threads.by_id(id) {
            Some(h) => h,
            None => {
                debug!("brand: could not find thread {}.", id);
                return Err(SyscallError::InvalidThread);
            }
        };
        if self.threads.expect(h).brand().is_none() {
            debug!("brand: thread {} is not a brand.", id);
            return Err(SyscallError::NotBrand);
        }
        Ok(h)
    }

    /// Creates a brand recording the caller's path to `dest`, or adds an
    /// upcall thread to brand `thd_id`.
    pub fn brand_cntl(&mut self, spd_id: SpdId, op: BrandCntlOp, thd_id: ThdId, dest: SpdId) -> SyscallResult<ThdId> {
        let cur = self.current();
        self.thd_validate_get_current_spd(cur, spd_id)?;

        match op {
            BrandCntlOp::Create | BrandCntlOp::CreateHw => {
                if self.spds.get(dest).is_none() {
                    debug!("brand_cntl: spd {} not found.", dest);
                    return Err(SyscallError::InvalidSpd);
                }
                let depth = match self.threads.expect(cur).stack.find_spd(dest) {
                    Some(depth) => depth,
                    None => {
                        debug!("brand_cntl: spd {} not found in stack for thread {}.", dest, self.thread_id(cur));
                        return Err(SyscallError::NotInCallPath);
                    }
                };
                let cpu = self.threads.expect(cur).cpu_id;
                let h = self.threads.alloc(cpu).ok_or(SyscallError::NoFreeThread)?;
                let (new, creator) = match self.threads.get2_mut(h, cur) {
                    Some(pair) => pair,
                    None => unreachable!(),
                };
                new.kind = ThreadKind::Brand(BrandInfo::new(op == BrandCntlOp::CreateHw, dest, depth));
                copy_sched_info(new, creator, &self.spds);
                new.cyc_cnt = true;
                Ok(new.id())
            }
            BrandCntlOp::AddThd => {
                let brand = self.brand_of(thd_id)?;
                let (cpu, head) = match self.threads.expect(brand).brand() {
                    Some(b) => (self.threads.expect(brand).cpu_id, b.upcalls),
                    None => unreachable!(),
                };
                let h = self.threads.alloc(cpu).ok_or(SyscallError::NoFreeThread)?;
                let (new, b) = match self.threads.get2_mut(h, brand) {
                    Some(pair) => pair,
                    None => unreachable!(),
                };
                new.kind = ThreadKind::Upcall(UpcallInfo {
                    brand,
                    state: UpcallState::Ready,
                    next: head,
                });
                copy_sched_info(new, b, &self.spds);
                new.cyc_cnt = true;
                if let Some(info) = b.brand_mut() {
                    info.upcalls = Some(h);
                }
                Ok(new.id())
            }
        }
    }

    /// Binds a hardware brand to an event source.
    pub fn brand_wire(&mut self, spd_id: SpdId, thd_id: ThdId, op: BrandWireOp, data: usize) -> SyscallResult<()> {
        let cur = self.current();
        self.thd_validate_get_current_spd(cur, spd_id)?;
        let brand = self.brand_of(thd_id)?;
        if !self.threads.expect(brand).brand().map_or(false, |b| b.hw) {
            debug!("brand_wire: thread {} not a hardware brand.", thd_id);
            return Err(SyscallError::NotHwBrand);
        }

        match op {
            BrandWireOp::Timer => self.timer_brand = Some(brand),
            BrandWireOp::Net => {
                let port = match u16::try_from(data) {
                    Ok(port) => port,
                    Err(_) => {
                        debug!("brand_wire: port {:#x} out of range.", data);
                        return Err(SyscallError::IllegalOperation);
                    }
                };
                let slot = match self.net_brands.iter_mut().find(|b| b.is_none()) {
                    Some(slot) => slot,
                    None => {
                        debug!("brand_wire: too many network brands.");
                        return Err(SyscallError::TooManyNetBrands);
                    }
                };
                *slot = Some(NetBrand { brand, port });
            }
            BrandWireOp::UpcallNotif => self.upcall_notif_brand = Some(brand),
        }
        Ok(())
    }

    /// Event raised from software by the running thread on brand `thd_id`.
    /// Returns the thread to run.
    pub fn brand_upcall(&mut self, spd_id: SpdId, thd_id: ThdId, args: [usize; 2]) -> SyscallResult<ThdId> {
        let cur = self.current();
        self.thd_validate_get_current_spd(cur, spd_id)?;
        let brand = self.brand_of(thd_id)?;
        let b = self.threads.expect(brand);
        if b.brand().and_then(|i| i.upcalls).is_none() {
            debug!("brand_upcall: brand {} has no upcall threads.", thd_id);
            return Err(SyscallError::NotBrand);
        }
        if b.cpu_id != self.threads.expect(cur).cpu_id {
            debug!("brand_upcall: brand {} on cpu {}, caller on {}.", thd_id, b.cpu_id, cpu_id());
            return Err(SyscallError::WrongCpu);
        }

        let next = self.brand_next_thread(brand, cur, PreemptMode::LinkOnly);
        if next == cur {
            self.threads.expect_mut(cur).regs.ret = 0;
        } else {
            let n = self.threads.expect_mut(next);
            n.regs.arg1 = args[0];
            n.regs.arg2 = args[1];
            self.threads.expect_mut(cur).regs.ret = 1;
        }
        Ok(self.thread_id(next))
    }

    /// Timer interrupt. Returns the thread to run, if a timer brand is
    /// wired.
    pub fn hw_timer_event(&mut self) -> Option<ThdId> {
        let brand = self.timer_brand?;
        self.hw_brand_event(brand)
    }

    /// Packet arrival on `port`.
    pub fn hw_net_event(&mut self, port: u16) -> Option<ThdId> {
        let brand = self.net_brands.iter().flatten().find(|b| b.port == port)?.brand;
        self.hw_brand_event(brand)
    }

    fn hw_brand_event(&mut self, brand: ThdHandle) -> Option<ThdId> {
        let has_upcall = self.threads.get(brand).and_then(|b| b.brand()).and_then(|b| b.upcalls).is_some();
        if !has_upcall {
            debug!("hardware event on brand {:?} without upcall threads.", brand);
            return None;
        }
        let brand_cpu = self.threads.expect(brand).cpu_id;
        if brand_cpu != cpu_id() {
            warn!("hardware event for brand {:?} of cpu {} taken on cpu {}.", brand, brand_cpu, cpu_id());
            return None;
        }
        let cur = self.current();
        let next = self.brand_next_thread(brand, cur, PreemptMode::Full);
        Some(self.thread_id(next))
    }

    /// Whether `upcall` is more urgent than `prev` for the deepest
    /// scheduler they share. Both are reported to that scheduler.
    fn brand_higher_urgency(&mut self, upcall: ThdHandle, prev: ThdHandle) -> bool {
        let (u, p) = (self.threads.expect(upcall), self.threads.expect(prev));
        let depth = match most_common_sched_depth(u, p) {
            Some(depth) => depth,
            None => {
                warn!("upcall {} and thread {} share no root scheduler.", u.id(), p.id());
                return false;
            }
        };
        let (ui, pi) = (u.sched_info[depth], p.sched_info[depth]);
        let (u_slot, p_slot, sched) = match (ui.notification, pi.notification, ui.scheduler) {
            (Some(us), Some(ps), Some(sched)) => (us, ps, sched),
            _ => {
                warn!("skimping on brand metadata maintenance for upcall {} at depth {}.", u.id(), depth);
                return false;
            }
        };
        let (u_urg, p_urg) = match self.sched_area(sched) {
            Some(area) => (
                area.event(u_slot).map_or(u16::MAX, |e| e.urgency()),
                area.event(p_slot).map_or(u16::MAX, |e| e.urgency()),
            ),
            None => panic!("thread registered with non-scheduler {}", sched),
        };

        // lower values are more urgent; ties keep the running thread
        if u_urg < p_urg {
            self.update_sched_evts(upcall, SchedEvt::BrandActive, prev, SchedEvt::Nil);
            true
        } else {
            self.update_thd_evt_state(upcall, SchedEvt::BrandActive, true);
            false
        }
    }

    /// Event on `brand` while `preempted` runs. Returns the thread that
    /// runs next: the brand's upcall if it is delivered now, `preempted`
    /// otherwise.
    pub(super) fn brand_next_thread(&mut self, brand: ThdHandle, preempted: ThdHandle, mode: PreemptMode) -> ThdHandle {
        let (upcall, dest) = match self.threads.expect(brand).brand().map(|b| (b.upcalls, b.dest)) {
            Some((Some(uc), dest)) => (uc, dest),
            _ => panic!("event on brand {:?} without upcall threads", brand),
        };

        if self.threads.expect(upcall).is_active_upcall() {
            self.meas.event(MeasEvent::BrandPend);
            if let Some(b) = self.threads.expect(brand).brand() {
                b.add_pending();
            }
            return preempted;
        }

        self.upcall_setup(upcall, dest, UpcallReason::BrandExec, [0; 3]);
        self.threads.expect_mut(upcall).activate_upcall();

        if self.brand_higher_urgency(upcall, preempted) {
            let p = self.threads.expect(preempted);
            if p.is_preempted() || p.preempter().is_some() {
                warn!("preempted thread {} already preempted, upcall {} waits.", p.id(), self.thread_id(upcall));
                return preempted;
            }
            match mode {
                PreemptMode::Full => self.threads.link_preemption(preempted, upcall, true),
                PreemptMode::LinkOnly => self.threads.link_preemption(preempted, upcall, false),
                PreemptMode::None => {}
            }
            self.upcall_execute(upcall, Some(preempted));
            self.meas.event(MeasEvent::BrandUc);
            return upcall;
        }

        // the upcall we failed to preempt can no longer count on
        // returning to what it interrupted
        if self.threads.expect(preempted).is_active_upcall() {
            self.threads.break_preemption_chain(preempted);
        }
        self.meas.event(MeasEvent::BrandDelayed);
        preempted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SchedCntlOp;

    /// Boot thread in the root scheduler with a timer brand whose upcall
    /// is more urgent than the boot thread.
    fn urgent_timer_brand() -> (Box<Kernel>, SpdId, ThdId, ThdId, ThdId) {
        let mut k = Box::new(Kernel::new());
        let sched = k.spd_create(0, 8, 0x1000).unwrap();
        k.spd_make_scheduler(sched, None).unwrap();
        let boot = k.ready_boot_thread(sched).unwrap();
        let brand = k.brand_cntl(sched, BrandCntlOp::CreateHw, 0, sched).unwrap();
        let upcall = k.brand_cntl(sched, BrandCntlOp::AddThd, brand, 0).unwrap();
        k.brand_wire(sched, brand, BrandWireOp::Timer, 0).unwrap();
        k.sched_cntl(sched, SchedCntlOp::ThdEvt, boot, 1).unwrap();
        k.sched_cntl(sched, SchedCntlOp::ThdEvt, brand, 2).unwrap();
        let area = k.sched_area_mut(sched).unwrap();
        area.event_mut(1).unwrap().set_urgency(10);
        area.event_mut(2).unwrap().set_urgency(5);
        (k, sched, boot, brand, upcall)
    }

    #[test]
    fn hardware_event_from_another_core_is_ignored() {
        let (mut k, _, boot, brand, upcall) = urgent_timer_brand();
        let h = k.threads.by_id(brand).unwrap();
        k.threads.expect_mut(h).cpu_id = cpu_id() + 1;

        assert_eq!(k.hw_timer_event(), None);
        assert_eq!(k.current_thread(), Some(boot));
        let u = k.threads.by_id(upcall).unwrap();
        assert!(k.threads.expect(u).is_ready_upcall());
        assert!(k.preemption_chains_symmetric());

        k.threads.expect_mut(h).cpu_id = cpu_id();
        assert_eq!(k.hw_timer_event(), Some(upcall));
    }

    #[test]
    fn net_port_must_fit_sixteen_bits() {
        let (mut k, sched, _, brand, _) = urgent_timer_brand();
        assert_eq!(k.brand_wire(sched, brand, BrandWireOp::Net, 0x1_0050), Err(SyscallError::IllegalOperation));
        assert_eq!(k.hw_net_event(0x50), None);
    }
}
