use std::collections::{HashMap, VecDeque};

/// Highest contiguously completed block and its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFrontier {
    pub block_number: u64,
    pub block_timestamp: u64,
}

/// Tracks block-fetch completion across the whole sync run.
///
/// Blocks are added as pending in ascending order when their fetch tasks are
/// enqueued. As fetches complete (in any order, the queue is not fair), the
/// frontier advances across the longest prefix of the pending sequence whose
/// completions are known. The frontier drives checkpoint emission, so it
/// never moves backwards.
#[derive(Debug, Default)]
pub struct BlockProgressTracker {
    pending: VecDeque<u64>,
    completed: HashMap<u64, u64>,
    frontier: Option<BlockFrontier>,
}

impl BlockProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append block numbers awaiting fetch. Callers enqueue strictly above
    /// any block already pending.
    pub fn add_pending_blocks(&mut self, block_numbers: impl IntoIterator<Item = u64>) {
        for number in block_numbers {
            debug_assert!(
                self.pending.back().is_none_or(|last| *last < number),
                "pending blocks must be added in strictly ascending order"
            );
            self.pending.push_back(number);
        }
    }

    /// Record a completed block fetch. Returns the new frontier iff it
    /// advanced.
    pub fn add_completed_block(
        &mut self,
        block_number: u64,
        block_timestamp: u64,
    ) -> Option<BlockFrontier> {
        self.completed.insert(block_number, block_timestamp);

        let mut advanced = None;
        while let Some(front) = self.pending.front() {
            let Some(timestamp) = self.completed.remove(front) else {
                break;
            };
            advanced = Some(BlockFrontier {
                block_number: *front,
                block_timestamp: timestamp,
            });
            self.pending.pop_front();
        }

        if advanced.is_some() {
            self.frontier = advanced;
        }
        advanced
    }

    pub fn frontier(&self) -> Option<BlockFrontier> {
        self.frontier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_waits_for_the_front() {
        let mut tracker = BlockProgressTracker::new();
        tracker.add_pending_blocks([10, 40, 57]);

        // Out-of-order completion does not advance the frontier.
        assert_eq!(tracker.add_completed_block(40, 400), None);
        assert_eq!(tracker.frontier(), None);

        // Completing the front drains the contiguous prefix.
        let frontier = tracker.add_completed_block(10, 100).unwrap();
        assert_eq!(frontier.block_number, 40);
        assert_eq!(frontier.block_timestamp, 400);

        let frontier = tracker.add_completed_block(57, 570).unwrap();
        assert_eq!(frontier.block_number, 57);
    }

    #[test]
    fn later_batches_extend_the_sequence() {
        let mut tracker = BlockProgressTracker::new();
        tracker.add_pending_blocks([5]);
        assert_eq!(
            tracker.add_completed_block(5, 50),
            Some(BlockFrontier {
                block_number: 5,
                block_timestamp: 50
            })
        );

        tracker.add_pending_blocks([8, 9]);
        assert_eq!(tracker.add_completed_block(9, 90), None);
        let frontier = tracker.add_completed_block(8, 80).unwrap();
        assert_eq!(frontier.block_number, 9);
        assert_eq!(tracker.frontier().unwrap().block_number, 9);
    }

    #[test]
    fn frontier_is_monotonic_under_any_completion_order() {
        let blocks: Vec<u64> = (0..32).map(|i| i * 3).collect();
        // A fixed shuffle is enough to exercise every interleaving class.
        let mut order = blocks.clone();
        order.reverse();
        order.swap(3, 17);
        order.swap(0, 25);

        let mut tracker = BlockProgressTracker::new();
        tracker.add_pending_blocks(blocks.iter().copied());

        let mut last = None;
        for number in order {
            if let Some(frontier) = tracker.add_completed_block(number, number * 10) {
                if let Some(prev) = last {
                    assert!(frontier.block_number > prev);
                }
                last = Some(frontier.block_number);
            }
        }
        // Everything completed: frontier is the max pending block.
        assert_eq!(tracker.frontier().unwrap().block_number, 93);
    }
}
