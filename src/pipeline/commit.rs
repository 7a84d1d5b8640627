use crate::events::Offset;
use std::collections::{BTreeMap, HashMap};

/// Orders commits so that no partition ever commits past unfinished work
///
/// Each pulled offset is registered before its worker starts. When a worker
/// finishes, `complete` returns the highest offset of that partition whose
/// predecessors are all finished, if that moved forward.
#[derive(Debug, Default)]
pub struct CommitTracker {
    partitions: HashMap<i32, BTreeMap<i64, bool>>,
}

impl CommitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, offset: Offset) {
        self.partitions
            .entry(offset.partition)
            .or_default()
            .insert(offset.position, false);
    }

    /// Mark an offset finished and return the new commit point, if any
    pub fn complete(&mut self, offset: Offset) -> Option<Offset> {
        let pending = self.partitions.get_mut(&offset.partition)?;
        let done = pending.get_mut(&offset.position)?;
        *done = true;

        let mut committable = None;
        while let Some(entry) = pending.first_entry() {
            if !*entry.get() {
                break;
            }
            committable = Some(*entry.key());
            entry.remove();
        }

        if pending.is_empty() {
            self.partitions.remove(&offset.partition);
        }

        committable.map(|position| Offset::new(offset.partition, position))
    }

    /// Offsets registered but not yet committable
    pub fn pending(&self) -> usize {
        self.partitions.values().map(BTreeMap::len).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_completion_commits_each() {
        let mut tracker = CommitTracker::new();
        tracker.register(Offset::new(0, 1));
        tracker.register(Offset::new(0, 2));

        assert_eq!(tracker.complete(Offset::new(0, 1)), Some(Offset::new(0, 1)));
        assert_eq!(tracker.complete(Offset::new(0, 2)), Some(Offset::new(0, 2)));
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_out_of_order_completion_waits_for_lower_offset() {
        let mut tracker = CommitTracker::new();
        for position in 10..13 {
            tracker.register(Offset::new(0, position));
        }

        assert_eq!(tracker.complete(Offset::new(0, 12)), None);
        assert_eq!(tracker.complete(Offset::new(0, 11)), None);
        assert_eq!(tracker.pending(), 3);
        assert_eq!(tracker.complete(Offset::new(0, 10)), Some(Offset::new(0, 12)));
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = CommitTracker::new();
        tracker.register(Offset::new(0, 5));
        tracker.register(Offset::new(1, 5));
        tracker.register(Offset::new(1, 6));

        assert_eq!(tracker.complete(Offset::new(1, 6)), None);
        assert_eq!(tracker.complete(Offset::new(0, 5)), Some(Offset::new(0, 5)));
        assert_eq!(tracker.complete(Offset::new(1, 5)), Some(Offset::new(1, 6)));
    }

    #[test]
    fn test_unknown_offset_is_ignored() {
        let mut tracker = CommitTracker::new();
        assert_eq!(tracker.complete(Offset::new(3, 1)), None);

        tracker.register(Offset::new(3, 2));
        assert_eq!(tracker.complete(Offset::new(3, 1)), None);
        assert_eq!(tracker.pending(), 1);
    }
}
