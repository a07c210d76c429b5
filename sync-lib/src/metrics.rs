use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Per-source historical sync counters. Sources are keyed by their unique id
/// rather than contract name, which may repeat across sources.
#[derive(Debug, Default)]
pub struct SourceSyncMetrics {
    /// Blocks in the source's target range.
    pub total_blocks: AtomicU64,
    /// Blocks already covered by the store's interval cache at setup.
    pub cached_blocks: AtomicU64,
    /// Blocks completed by this run, incremented per finished range.
    pub completed_blocks: AtomicU64,
}

impl SourceSyncMetrics {
    pub fn add_completed_blocks(&self, count: u64) {
        self.completed_blocks.fetch_add(count, Ordering::Relaxed);
    }
}

/// Metrics for one network's historical sync run.
#[derive(Debug, Default)]
pub struct HistoricalSyncMetrics {
    /// Epoch milliseconds at which `start()` was called.
    pub start_timestamp_ms: AtomicU64,
    sources: Mutex<BTreeMap<String, Arc<SourceSyncMetrics>>>,
}

impl HistoricalSyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for a source, created on first use.
    pub fn source(&self, source_id: &str) -> Arc<SourceSyncMetrics> {
        self.sources
            .lock()
            .entry(source_id.to_string())
            .or_default()
            .clone()
    }

    pub fn snapshot(&self) -> HistoricalSyncMetricsSnapshot {
        HistoricalSyncMetricsSnapshot {
            start_timestamp_ms: self.start_timestamp_ms.load(Ordering::Relaxed),
            sources: self
                .sources
                .lock()
                .iter()
                .map(|(id, metrics)| {
                    (
                        id.clone(),
                        SourceSyncSnapshot {
                            total_blocks: metrics.total_blocks.load(Ordering::Relaxed),
                            cached_blocks: metrics.cached_blocks.load(Ordering::Relaxed),
                            completed_blocks: metrics.completed_blocks.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSyncSnapshot {
    pub total_blocks: u64,
    pub cached_blocks: u64,
    pub completed_blocks: u64,
}

impl SourceSyncSnapshot {
    /// Fraction of the target range that is durable, cached blocks included.
    pub fn progress(&self) -> f64 {
        if self.total_blocks == 0 {
            return 1.0;
        }
        let done = (self.cached_blocks + self.completed_blocks).min(self.total_blocks);
        done as f64 / self.total_blocks as f64
    }
}

/// A copy of all counters as plain values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoricalSyncMetricsSnapshot {
    pub start_timestamp_ms: u64,
    pub sources: BTreeMap<String, SourceSyncSnapshot>,
}

impl Display for HistoricalSyncMetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Historical Sync Metrics:")?;
        for (id, source) in &self.sources {
            writeln!(
                f,
                "  {id}: {}/{} blocks ({} cached, {:.1}%)",
                source.cached_blocks + source.completed_blocks,
                source.total_blocks,
                source.cached_blocks,
                source.progress() * 100.0,
            )?;
        }
        Ok(())
    }
}

/// Shared metrics instance for use across workers.
pub type SharedMetrics = Arc<HistoricalSyncMetrics>;

pub fn create_shared_metrics() -> SharedMetrics {
    Arc::new(HistoricalSyncMetrics::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = HistoricalSyncMetrics::new();
        let source = metrics.source("uniswap_v3_1");
        source.total_blocks.store(100, Ordering::Relaxed);
        source.cached_blocks.store(40, Ordering::Relaxed);
        source.add_completed_blocks(25);
        source.add_completed_blocks(35);

        let snapshot = metrics.snapshot();
        let source = &snapshot.sources["uniswap_v3_1"];
        assert_eq!(source.completed_blocks, 60);
        assert!((source.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_source_counts_as_done() {
        let snapshot = SourceSyncSnapshot::default();
        assert_eq!(snapshot.progress(), 1.0);
    }
}
