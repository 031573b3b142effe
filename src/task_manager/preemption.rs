//! Preemption chains: an upcall that interrupted a thread records it, and
//! the interrupted thread records its preempter. Both sides are only ever
//! written together here.

use log::debug;

use super::tcb::{ExecState, ThdHandle, ThreadTable};

impl ThreadTable {
    /// Records that `upcall` interrupted `preempted`. With `mark`, the
    /// preempted thread will be resumed from its full saved context.
    pub fn link_preemption(&mut self, preempted: ThdHandle, upcall: ThdHandle, mark: bool) {
        let (p, u) = match self.get2_mut(preempted, upcall) {
            Some(pair) => pair,
            None => panic!("linking preemption of {:?} by {:?}", preempted, upcall),
        };
        assert!(p.preempter.is_none() && p.exec == ExecState::Running);
        assert!(u.interrupted.is_none());
        if mark {
            p.exec = ExecState::Preempted;
        }
        p.preempter = Some(upcall);
        u.interrupted = Some(preempted);
    }

    /// Drops both links of `t`, and the matching links of the threads on
    /// the other side.
    pub fn break_preemption_chain(&mut self, t: ThdHandle) {
        let (interrupted, preempter) = {
            let thd = self.expect(t);
            (thd.interrupted, thd.preempter)
        };
        if let Some(other) = interrupted {
            let o = self.expect_mut(other);
            assert_eq!(o.preempter, Some(t), "asymmetric preemption chain");
            o.preempter = None;
            self.expect_mut(t).interrupted = None;
        }
        if let Some(other) = preempter {
            let o = self.expect_mut(other);
            assert_eq!(o.interrupted, Some(t), "asymmetric preemption chain");
            o.interrupted = None;
            self.expect_mut(t).preempter = None;
        }
    }

    /// Resuming `t`: it is no longer part of a chain and runs normally.
    pub fn remove_preempted_status(&mut self, t: ThdHandle) {
        if self.expect(t).preempter.is_some() {
            self.break_preemption_chain(t);
        }
        let thd = self.expect_mut(t);
        if thd.exec == ExecState::Preempted {
            debug!("thread {} resumed from preemption", thd.id());
        }
        thd.exec = ExecState::Running;
    }

    /// Whether every link in the table has its counterpart.
    pub fn chains_symmetric(&self) -> bool {
        self.iter().all(|(h, t)| {
            let up = t.preempter.map_or(true, |p| self.get(p).and_then(|p| p.interrupted) == Some(h));
            let down = t.interrupted.map_or(true, |i| self.get(i).and_then(|i| i.preempter) == Some(h));
            up && down
        })
    }
}
