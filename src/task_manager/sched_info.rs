use crate::config::MAX_SCHED_HIER_DEPTH;
use crate::object::{Spd, SpdTable};

use super::tcb::{SchedInfo, Thread};

/// Fills `t`'s hierarchy from `sched` up to the root. Notification slots
/// are registered later by each scheduler.
pub fn initialize_sched_info(t: &mut Thread, spds: &SpdTable, sched: &Spd) {
    let depth = match sched.sched_depth() {
        Some(depth) => depth,
        None => panic!("domain {} is not a scheduler", sched.id()),
    };
    t.sched_info = [SchedInfo::default(); MAX_SCHED_HIER_DEPTH];
    let mut cur = Some(sched.id());
    for i in (0..=depth).rev() {
        let id = match cur {
            Some(id) => id,
            None => panic!("scheduler hierarchy of {} ends above depth {}", sched.id(), i),
        };
        t.sched_info[i].scheduler = Some(id);
        cur = spds.expect_live(id).sched_parent();
    }
    assert!(hierarchy_consistent(t, spds));
}

/// Copies the hierarchy and notification registrations of `old`.
pub fn copy_sched_info(new: &mut Thread, old: &Thread, spds: &SpdTable) {
    assert!(hierarchy_consistent(old, spds), "thread {} has a broken scheduler hierarchy", old.id());
    new.sched_info = old.sched_info;
}

/// Each populated level's scheduler is the child of the level above.
pub fn hierarchy_consistent(t: &Thread, spds: &SpdTable) -> bool {
    let mut prev = None;
    for (i, info) in t.sched_info.iter().enumerate() {
        if let Some(s) = info.scheduler {
            let spd = match spds.get(s) {
                Some(spd) => spd,
                None => return false,
            };
            if spd.sched_depth() != Some(i) || spd.sched_parent() != prev {
                return false;
            }
        }
        prev = info.scheduler;
    }
    true
}

/// Whether `sched` has authority over `t` at its own depth.
#[inline]
pub fn thd_scheduled_by(t: &Thread, sched: &Spd) -> bool {
    match sched.sched_depth() {
        Some(depth) => t.sched_at(depth) == Some(sched.id()),
        None => false,
    }
}

/// Deepest level at which both threads have the same scheduler, or `None`
/// when they do not share a root scheduler.
pub fn most_common_sched_depth(t1: &Thread, t2: &Thread) -> Option<usize> {
    if t1.sched_at(0).is_none() || t1.sched_at(0) != t2.sched_at(0) {
        return None;
    }
    for i in 1..MAX_SCHED_HIER_DEPTH {
        let s = t1.sched_at(i);
        if s.is_none() || s != t2.sched_at(i) {
            return Some(i - 1);
        }
    }
    Some(MAX_SCHED_HIER_DEPTH - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{MpdTable, SchedRole};
    use crate::task_manager::ThreadTable;

    #[test]
    fn common_depth_follows_shared_prefix() {
        let mut mpds = MpdTable::new();
        let c = mpds.alloc().unwrap();
        let mut spds = SpdTable::new();
        let root = spds.create(c, 0, 0, 0).unwrap();
        let left = spds.create(c, 0, 0, 0).unwrap();
        let right = spds.create(c, 0, 0, 0).unwrap();
        spds.get_mut(root).unwrap().sched = Some(SchedRole::new(0, None));
        spds.get_mut(left).unwrap().sched = Some(SchedRole::new(1, Some(root)));
        spds.get_mut(right).unwrap().sched = Some(SchedRole::new(1, Some(root)));

        let mut threads = ThreadTable::new();
        let (h1, h2, h3) = (threads.alloc(0).unwrap(), threads.alloc(0).unwrap(), threads.alloc(0).unwrap());
        let (t1, t2) = threads.get2_mut(h1, h2).unwrap();
        initialize_sched_info(t1, &spds, spds.expect_live(left));
        initialize_sched_info(t2, &spds, spds.expect_live(right));
        assert_eq!(t1.sched_at(0), Some(root));
        assert_eq!(most_common_sched_depth(t1, t2), Some(0));
        assert!(!thd_scheduled_by(t2, spds.expect_live(left)));

        copy_sched_info(t2, t1, &spds);
        assert_eq!(most_common_sched_depth(t1, t2), Some(1));
        assert!(thd_scheduled_by(t2, spds.expect_live(left)));

        // a root scheduler at depth 1 breaks the prefix
        t2.sched_info[1].scheduler = Some(root);
        assert!(!hierarchy_consistent(t2, &spds));

        let (t1, t3) = threads.get2_mut(h1, h3).unwrap();
        assert_eq!(most_common_sched_depth(t1, t3), None);
    }
}
