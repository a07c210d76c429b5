use crate::interval::{self, BlockRange};

/// Outcome of merging a freshly completed range into a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointUpdate {
    /// True when the checkpoint advanced past `prev_checkpoint`.
    pub is_updated: bool,
    pub prev_checkpoint: i64,
    pub new_checkpoint: i64,
}

/// Per-source sync progress: a target block range and the canonical set of
/// ranges already synced within it.
///
/// The checkpoint is the highest block `c` such that `[target.start, c]` is
/// fully covered, or `target.start - 1` when the front of the target is still
/// missing. Checkpoints are signed so that a source starting at block 0 can
/// report "nothing covered yet" as `-1`.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    target: BlockRange,
    completed: Vec<BlockRange>,
}

impl ProgressTracker {
    /// `completed` may come straight from the sync store; it is normalized
    /// and clipped to the target here.
    pub fn new(target: BlockRange, completed: Vec<BlockRange>) -> Self {
        let completed = interval::intersection(&interval::normalize(completed), &[target]);
        Self { target, completed }
    }

    pub fn target(&self) -> BlockRange {
        self.target
    }

    /// Sub-ranges of the target not yet synced.
    pub fn required(&self) -> Vec<BlockRange> {
        interval::difference(&[self.target], &self.completed)
    }

    pub fn is_complete(&self) -> bool {
        self.required().is_empty()
    }

    pub fn checkpoint(&self) -> i64 {
        match self.completed.first() {
            Some(first) if first.start == self.target.start => first.end as i64,
            _ => self.target.start as i64 - 1,
        }
    }

    /// Merge `range` into the completed set and report checkpoint movement.
    pub fn add_completed_range(&mut self, range: BlockRange) -> CheckpointUpdate {
        let prev_checkpoint = self.checkpoint();
        let clipped = interval::intersection(&[range], &[self.target]);
        self.completed = interval::union(&self.completed, &clipped);
        let new_checkpoint = self.checkpoint();
        CheckpointUpdate {
            is_updated: new_checkpoint > prev_checkpoint,
            prev_checkpoint,
            new_checkpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end)
    }

    #[test]
    fn fresh_tracker_requires_whole_target() {
        let tracker = ProgressTracker::new(r(10, 100), vec![]);
        assert_eq!(tracker.required(), vec![r(10, 100)]);
        assert_eq!(tracker.checkpoint(), 9);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn fresh_tracker_at_genesis_reports_minus_one() {
        let tracker = ProgressTracker::new(r(0, 50), vec![]);
        assert_eq!(tracker.checkpoint(), -1);
    }

    #[test]
    fn restored_ranges_are_clipped_to_target() {
        let tracker = ProgressTracker::new(r(10, 100), vec![r(0, 30), r(200, 300)]);
        assert_eq!(tracker.required(), vec![r(31, 100)]);
        assert_eq!(tracker.checkpoint(), 30);
    }

    #[test]
    fn checkpoint_only_advances_from_target_start() {
        let mut tracker = ProgressTracker::new(r(0, 100), vec![]);

        // A hole at the front keeps the checkpoint pinned.
        let update = tracker.add_completed_range(r(40, 60));
        assert!(!update.is_updated);
        assert_eq!(tracker.checkpoint(), -1);

        let update = tracker.add_completed_range(r(0, 39));
        assert!(update.is_updated);
        assert_eq!(update.prev_checkpoint, -1);
        assert_eq!(update.new_checkpoint, 60);
        assert_eq!(tracker.required(), vec![r(61, 100)]);
    }

    #[test]
    fn completing_the_target() {
        let mut tracker = ProgressTracker::new(r(5, 9), vec![]);
        let update = tracker.add_completed_range(r(5, 9));
        assert!(update.is_updated);
        assert_eq!(update.new_checkpoint, 9);
        assert!(tracker.is_complete());
        assert_eq!(tracker.required(), vec![]);
    }

    proptest! {
        #[test]
        fn checkpoint_monotone_and_required_shrinks(
            ranges in proptest::collection::vec((0u64..200, 0u64..40), 1..20)
        ) {
            let mut tracker = ProgressTracker::new(r(0, 250), vec![]);
            let mut last_checkpoint = tracker.checkpoint();
            let mut last_required = tracker.required();
            for (start, len) in ranges {
                let update = tracker.add_completed_range(r(start, start + len));
                prop_assert!(update.new_checkpoint >= update.prev_checkpoint);
                prop_assert!(tracker.checkpoint() >= last_checkpoint);
                // Newly required work never appears.
                let required = tracker.required();
                prop_assert_eq!(
                    crate::interval::difference(&required, &last_required),
                    vec![]
                );
                last_checkpoint = tracker.checkpoint();
                last_required = required;
            }
        }
    }
}
