//! Feeding thread state changes and CPU consumption into the event lists
//! of the schedulers that own the threads.

use log::warn;

use crate::common::measurement::MeasEvent;
use crate::common::utils::saturating_add_u32;
use crate::ipc::SchedEvt;
use crate::object::{SpdId, SpdTable};
use crate::task_manager::{SchedInfo, ThdHandle};

use super::Kernel;

/// Appends event slot `idx` to `sched`'s list.
fn update_evt_list(spds: &mut SpdTable, sched: SpdId, idx: u16) {
    let role = match spds.expect_live_mut(sched).sched.as_mut() {
        Some(role) => role,
        None => panic!("thread registered with non-scheduler {}", sched),
    };
    if let Err(e) = role.area.append(&mut role.prev_notification, idx) {
        warn!("events out of range for scheduler {}: {:?}", sched, e);
    }
}

fn registered(info: &[SchedInfo]) -> impl Iterator<Item = (SpdId, u16)> + '_ {
    info.iter().filter_map(|i| match (i.scheduler, i.notification) {
        (Some(s), Some(n)) => Some((s, n)),
        _ => None,
    })
}

impl Kernel {
    pub(super) fn update_thd_evt_state(&mut self, t: ThdHandle, flags: SchedEvt, update_list: bool) {
        assert_ne!(flags, SchedEvt::Nil);
        let info = self.threads.expect(t).sched_info;
        for (sched, idx) in registered(&info) {
            self.meas.event(match flags {
                SchedEvt::BrandPend => MeasEvent::EvtPending,
                SchedEvt::BrandReady => MeasEvent::EvtReady,
                _ => MeasEvent::EvtActive,
            });
            if let Some(evt) = self.sched_area_mut(sched).and_then(|a| a.event_mut(idx)) {
                evt.set_flags(flags);
            }
            if update_list {
                update_evt_list(&mut self.spds, sched, idx);
            }
        }
    }

    fn update_thd_evt_cycles(&mut self, t: ThdHandle, consumption: u64) {
        let info = self.threads.expect(t).sched_info;
        for (sched, idx) in registered(&info) {
            if let Some(evt) = self.sched_area_mut(sched).and_then(|a| a.event_mut(idx)) {
                evt.cpu_consumption = saturating_add_u32(evt.cpu_consumption, consumption);
            }
            update_evt_list(&mut self.spds, sched, idx);
        }
    }

    /// Reports a switch from `prev` to `new`: charges the cycles since the
    /// last switch to `prev` and records the given state changes.
    pub(super) fn update_sched_evts(&mut self, new: ThdHandle, new_flags: SchedEvt, prev: ThdHandle, prev_flags: SchedEvt) {
        let mut update_list = true;
        let prev_counted = self.threads.expect(prev).cyc_cnt;
        if self.threads.expect(new).cyc_cnt || prev_counted {
            let now = (self.clock)();
            let core = self.core_mut();
            let last = core.cycle_cnt;
            core.cycle_cnt = now;
            if prev_counted {
                self.update_thd_evt_cycles(prev, now.wrapping_sub(last));
                update_list = false;
            }
        }
        if new_flags != SchedEvt::Nil {
            self.update_thd_evt_state(new, new_flags, true);
        }
        if prev_flags != SchedEvt::Nil {
            self.update_thd_evt_state(prev, prev_flags, update_list);
        }
    }
}
