//! Historical sync orchestrator.
//!
//! Owns the per-source progress trackers and the task queue, schedules
//! range-granular fetch tasks, coalesces all per-block work behind a single
//! block fetch, and emits monotonically advancing checkpoints as data
//! becomes durable. One service runs per network; realtime (tip-following)
//! sync is a separate concern layered on top of the same store.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use alloy_primitives::B256;
use anyhow::bail;
use async_trait::async_trait;
use bon::bon;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::block_progress::BlockProgressTracker;
use crate::config::{CHECKPOINT_DEBOUNCE_INTERVAL, NetworkSyncConfig, PROGRESS_LOG_INTERVAL};
use crate::debounce::Debouncer;
use crate::error::SyncError;
use crate::events::{Checkpoint, SyncEvent, SyncEventSender};
use crate::interval::{self, BlockRange};
use crate::metrics::{SharedMetrics, SourceSyncMetrics};
use crate::progress::ProgressTracker;
use crate::rpc::{self, RequestQueue, RpcBlock, RpcLog, RpcTransaction, RpcTransactionReceipt};
use crate::source::{EventSource, Topics};
use crate::store::{
    BlockFilterIntervalInsert, FactoryLogFilterIntervalInsert, LogFilterIntervalInsert, SyncStore,
};
use crate::task_queue::{TaskQueue, TaskWorker};

/// Earlier blocks drain first: priority decreases with the starting block.
fn block_priority(block_number: u64) -> u64 {
    u64::MAX - block_number
}

/// Deferred per-block work produced by a range task. Executed in append
/// order once the block itself has been fetched.
#[derive(Debug)]
pub enum BlockCallback {
    LogFilter {
        source: usize,
        range: BlockRange,
        logs: Vec<RpcLog>,
        tx_hashes: HashSet<B256>,
    },
    /// Marks a discovered child-address range as cached under the factory's
    /// own log filter key.
    FactoryChildAddress {
        source: usize,
        range: BlockRange,
        logs: Vec<RpcLog>,
        tx_hashes: HashSet<B256>,
    },
    FactoryLogFilter {
        source: usize,
        range: BlockRange,
        logs: Vec<RpcLog>,
        tx_hashes: HashSet<B256>,
    },
    BlockFilter { source: usize, range: BlockRange },
}

#[derive(Debug)]
pub enum SyncTask {
    LogFilter { source: usize, range: BlockRange },
    FactoryChildAddress { source: usize, range: BlockRange },
    FactoryLogFilter { source: usize, range: BlockRange },
    BlockFilter { source: usize, range: BlockRange },
    TraceFilter { source: usize, range: BlockRange },
    Block {
        block_number: u64,
        callbacks: Vec<BlockCallback>,
    },
}

impl SyncTask {
    fn priority(&self) -> u64 {
        match self {
            Self::LogFilter { range, .. }
            | Self::FactoryChildAddress { range, .. }
            | Self::FactoryLogFilter { range, .. }
            | Self::BlockFilter { range, .. }
            | Self::TraceFilter { range, .. } => block_priority(range.start),
            Self::Block { block_number, .. } => block_priority(*block_number),
        }
    }
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogFilter { source, range } => write!(f, "log filter (source={source}, range={range})"),
            Self::FactoryChildAddress { source, range } => {
                write!(f, "factory child address (source={source}, range={range})")
            }
            Self::FactoryLogFilter { source, range } => {
                write!(f, "factory log filter (source={source}, range={range})")
            }
            Self::BlockFilter { source, range } => {
                write!(f, "block filter (source={source}, range={range})")
            }
            Self::TraceFilter { source, range } => {
                write!(f, "trace filter (source={source}, range={range})")
            }
            Self::Block { block_number, .. } => write!(f, "block {block_number}"),
        }
    }
}

/// Progress for one configured source. Factories track child-address
/// discovery and child log fetching independently over the same target.
enum SourceProgress {
    Log(ProgressTracker),
    Factory {
        child_address: ProgressTracker,
        log: ProgressTracker,
    },
    Block(ProgressTracker),
    Trace(ProgressTracker),
    /// No historical work (start block above the finalized head, or an
    /// unusable configured range). Reports the finalized block so it never
    /// holds the block-task watermark back.
    Skipped { checkpoint: i64 },
}

struct ProgressState {
    sources: Vec<SourceProgress>,
    /// Pending per-block work, keyed by block number. Drained atomically
    /// into `Block` tasks by `enqueue_block_tasks`.
    block_callbacks: BTreeMap<u64, Vec<BlockCallback>>,
    block_progress: BlockProgressTracker,
    /// Highest block for which `Block` tasks have been enqueued.
    block_tasks_enqueued_checkpoint: i64,
}

struct ServiceInner {
    config: NetworkSyncConfig,
    rpc: Arc<dyn RequestQueue>,
    store: Arc<dyn SyncStore>,
    metrics: SharedMetrics,
    events: SyncEventSender,
    sources: Vec<EventSource>,
    progress: Mutex<ProgressState>,
    is_killed: AtomicBool,
    is_complete: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    progress_log_stop: Mutex<Option<oneshot::Sender<()>>>,
    checkpoint_debouncer: Debouncer<Checkpoint>,
}

impl ServiceInner {
    fn complete(&self) {
        if self.is_killed.load(Ordering::Acquire) {
            return;
        }
        if self.is_complete.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_progress_log();
        let elapsed = self.started_at.lock().map(|started| started.elapsed());
        info!(
            "Historical sync complete (network={}, duration={:.1?})",
            self.config.network_name,
            elapsed.unwrap_or_default()
        );
        let _ = self.events.send(SyncEvent::SyncComplete);
    }

    fn stop_progress_log(&self) {
        if let Some(stop) = self.progress_log_stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

/// A range task's output, regrouped by the block that will carry it.
struct LogInterval {
    range: BlockRange,
    logs: Vec<RpcLog>,
    tx_hashes: HashSet<B256>,
}

/// Partition `range` into contiguous sub-ranges each ending at a block that
/// has logs (or at `range.end`, so a log-free tail still gets cached). Each
/// sub-range carries exactly the logs of its end block.
fn build_log_intervals(range: BlockRange, logs: Vec<RpcLog>) -> Vec<LogInterval> {
    let mut by_block: BTreeMap<u64, Vec<RpcLog>> = BTreeMap::new();
    for log in logs {
        by_block.entry(log.block_number_u64()).or_default().push(log);
    }
    by_block.entry(range.end).or_default();

    let mut out = Vec::with_capacity(by_block.len());
    let mut prev = range.start;
    for (block_number, mut logs) in by_block {
        debug_assert!(range.contains(block_number), "log outside requested range");
        logs.sort_by_key(|log| log.log_index);
        let tx_hashes = logs.iter().map(|log| log.transaction_hash).collect();
        out.push(LogInterval {
            range: BlockRange::new(prev, block_number),
            logs,
            tx_hashes,
        });
        prev = block_number + 1;
    }
    out
}

struct SyncWorker {
    inner: Arc<ServiceInner>,
}

#[async_trait]
impl TaskWorker for SyncWorker {
    type Task = SyncTask;

    async fn work(&self, task: &SyncTask, queue: &TaskQueue<Self>) -> anyhow::Result<()> {
        if self.inner.is_killed.load(Ordering::Acquire) {
            return Ok(());
        }
        match task {
            SyncTask::LogFilter { source, range } => {
                self.log_filter_task(*source, *range, queue).await?
            }
            SyncTask::FactoryChildAddress { source, range } => {
                self.factory_child_address_task(*source, *range, queue).await?
            }
            SyncTask::FactoryLogFilter { source, range } => {
                self.factory_log_filter_task(*source, *range, queue).await?
            }
            SyncTask::BlockFilter { source, range } => {
                self.block_filter_task(*source, *range, queue).await?
            }
            SyncTask::TraceFilter { source, range } => {
                self.trace_filter_task(*source, *range, queue).await?
            }
            SyncTask::Block {
                block_number,
                callbacks,
            } => self.block_task(*block_number, callbacks).await?,
        }
        Ok(())
    }

    // The queue reports the drain atomically with the last task's in-flight
    // decrement, so completion fires exactly once even when several workers
    // finish together.
    async fn on_drained(&self, _queue: &TaskQueue<Self>) {
        self.inner.complete();
    }

    async fn on_error(&self, error: anyhow::Error, task: SyncTask, queue: &TaskQueue<Self>) {
        if self.inner.is_killed.load(Ordering::Acquire) {
            debug!("Suppressing task error after kill: {error:#}");
            return;
        }
        warn!(
            "Historical sync task failed, retrying (network={}, task={task}): {error:#}",
            self.inner.config.network_name
        );
        // Re-enqueue at the original priority. The RPC layer owns backoff;
        // by the time an error reaches this point it is assumed to be
        // transient-but-exhausted, so the task simply goes around again.
        let priority = task.priority();
        queue.add_task(task, priority);
    }
}

impl SyncWorker {
    async fn log_filter_task(
        &self,
        source_index: usize,
        range: BlockRange,
        queue: &TaskQueue<Self>,
    ) -> anyhow::Result<()> {
        let EventSource::Log(source) = &self.inner.sources[source_index] else {
            bail!("log filter task references a non-log source");
        };
        let logs = rpc::get_logs(
            &*self.inner.rpc,
            source.criteria.address.as_deref(),
            &source.criteria.topics,
            range,
        )
        .await?;
        debug!(
            "Fetched {} logs (source={}, range={range})",
            logs.len(),
            source.id
        );

        {
            let mut progress = self.inner.progress.lock();
            for log_interval in build_log_intervals(range, logs) {
                progress
                    .block_callbacks
                    .entry(log_interval.range.end)
                    .or_default()
                    .push(BlockCallback::LogFilter {
                        source: source_index,
                        range: log_interval.range,
                        logs: log_interval.logs,
                        tx_hashes: log_interval.tx_hashes,
                    });
            }
            let SourceProgress::Log(tracker) = &mut progress.sources[source_index] else {
                bail!("log filter task references a non-log tracker");
            };
            tracker.add_completed_range(range);
        }

        self.inner
            .metrics
            .source(&source.id)
            .add_completed_blocks(range.block_count());
        self.enqueue_block_tasks(queue);
        Ok(())
    }

    async fn factory_child_address_task(
        &self,
        source_index: usize,
        range: BlockRange,
        queue: &TaskQueue<Self>,
    ) -> anyhow::Result<()> {
        let EventSource::Factory(source) = &self.inner.sources[source_index] else {
            bail!("factory child address task references a non-factory source");
        };
        let child_topics: Topics = vec![Some(vec![source.criteria.event_selector])];
        let logs = rpc::get_logs(
            &*self.inner.rpc,
            Some(std::slice::from_ref(&source.criteria.address)),
            &child_topics,
            range,
        )
        .await?;
        debug!(
            "Discovered {} child address logs (source={}, range={range})",
            logs.len(),
            source.id
        );
        self.inner
            .store
            .insert_factory_child_address_logs(source.chain_id, logs.clone())
            .await?;

        let max_block_range = source
            .max_block_range
            .unwrap_or(self.inner.config.default_max_block_range);

        // Completing a discovery range may unlock child log fetching for the
        // newly contiguous prefix. This is the only place factory log tasks
        // are enqueued after setup.
        let mut unlocked = Vec::new();
        {
            let mut progress = self.inner.progress.lock();
            for log_interval in build_log_intervals(range, logs) {
                progress
                    .block_callbacks
                    .entry(log_interval.range.end)
                    .or_default()
                    .push(BlockCallback::FactoryChildAddress {
                        source: source_index,
                        range: log_interval.range,
                        logs: log_interval.logs,
                        tx_hashes: log_interval.tx_hashes,
                    });
            }
            let SourceProgress::Factory { child_address, log } =
                &mut progress.sources[source_index]
            else {
                bail!("factory child address task references a non-factory tracker");
            };
            let update = child_address.add_completed_range(range);
            if update.is_updated {
                let discovered = BlockRange::new(
                    (update.prev_checkpoint + 1) as u64,
                    update.new_checkpoint as u64,
                );
                let ready = interval::intersection(&log.required(), &[discovered]);
                unlocked = interval::chunks(&ready, max_block_range);
            }
        }

        for chunk in unlocked {
            queue.add_task(
                SyncTask::FactoryLogFilter {
                    source: source_index,
                    range: chunk,
                },
                block_priority(chunk.start),
            );
        }
        self.enqueue_block_tasks(queue);
        Ok(())
    }

    async fn factory_log_filter_task(
        &self,
        source_index: usize,
        range: BlockRange,
        queue: &TaskQueue<Self>,
    ) -> anyhow::Result<()> {
        let EventSource::Factory(source) = &self.inner.sources[source_index] else {
            bail!("factory log filter task references a non-factory source");
        };

        // Children announced anywhere up to this range's end may emit within
        // it, so the address scan always starts at the factory's own start.
        let mut child_addresses = self
            .inner
            .store
            .get_factory_child_addresses(
                source.chain_id,
                source.criteria.clone(),
                BlockRange::new(source.start_block, range.end),
            )
            .await?;

        let mut logs = Vec::new();
        while let Some(batch) = child_addresses.next().await {
            let batch = batch?;
            if batch.is_empty() {
                continue;
            }
            logs.extend(
                rpc::get_logs(&*self.inner.rpc, Some(&batch), &source.criteria.topics, range)
                    .await?,
            );
        }
        drop(child_addresses);
        debug!(
            "Fetched {} child logs (source={}, range={range})",
            logs.len(),
            source.id
        );

        {
            let mut progress = self.inner.progress.lock();
            for log_interval in build_log_intervals(range, logs) {
                progress
                    .block_callbacks
                    .entry(log_interval.range.end)
                    .or_default()
                    .push(BlockCallback::FactoryLogFilter {
                        source: source_index,
                        range: log_interval.range,
                        logs: log_interval.logs,
                        tx_hashes: log_interval.tx_hashes,
                    });
            }
            let SourceProgress::Factory { log, .. } = &mut progress.sources[source_index] else {
                bail!("factory log filter task references a non-factory tracker");
            };
            log.add_completed_range(range);
        }

        self.inner
            .metrics
            .source(&source.id)
            .add_completed_blocks(range.block_count());
        self.enqueue_block_tasks(queue);
        Ok(())
    }

    async fn block_filter_task(
        &self,
        source_index: usize,
        range: BlockRange,
        queue: &TaskQueue<Self>,
    ) -> anyhow::Result<()> {
        let EventSource::Block(source) = &self.inner.sources[source_index] else {
            bail!("block filter task references a non-block source");
        };
        let criteria = source.criteria;

        let mut numbers = Vec::new();
        let mut number = criteria.first_matching_block(range.start);
        while number <= range.end {
            numbers.push(number);
            number += criteria.interval;
        }
        // The range end always terminates an interval, so a tail without
        // matches is still recorded as cached.
        if numbers.last() != Some(&range.end) {
            numbers.push(range.end);
        }

        // Blocks already in the store (from another source, or a prior run)
        // skip the fetch entirely; their interval is recorded right away.
        let mut callbacks = Vec::new();
        let mut prev = range.start;
        for number in numbers {
            let sub_range = BlockRange::new(prev, number);
            let needs_fetch = criteria.matches(number)
                && !self.inner.store.has_block(source.chain_id, number).await?;
            if needs_fetch {
                callbacks.push((number, sub_range));
            } else {
                self.inner
                    .store
                    .insert_block_filter_interval(BlockFilterIntervalInsert {
                        chain_id: source.chain_id,
                        filter: criteria,
                        block: None,
                        range: sub_range,
                    })
                    .await?;
            }
            prev = number + 1;
        }

        {
            let mut progress = self.inner.progress.lock();
            for (number, sub_range) in callbacks {
                progress
                    .block_callbacks
                    .entry(number)
                    .or_default()
                    .push(BlockCallback::BlockFilter {
                        source: source_index,
                        range: sub_range,
                    });
            }
            let SourceProgress::Block(tracker) = &mut progress.sources[source_index] else {
                bail!("block filter task references a non-block tracker");
            };
            tracker.add_completed_range(range);
        }

        self.inner
            .metrics
            .source(&source.id)
            .add_completed_blocks(range.block_count());
        self.enqueue_block_tasks(queue);
        Ok(())
    }

    async fn trace_filter_task(
        &self,
        source_index: usize,
        range: BlockRange,
        queue: &TaskQueue<Self>,
    ) -> anyhow::Result<()> {
        let EventSource::Trace(source) = &self.inner.sources[source_index] else {
            bail!("trace filter task references a non-trace source");
        };
        // TODO: fetch matching call traces via trace_filter once the store
        // grows a trace table. Progress accounting runs regardless so the
        // checkpoint keeps moving for mixed source sets.
        debug!(
            "Skipping trace fetch (source={}, range={range})",
            source.id
        );

        {
            let mut progress = self.inner.progress.lock();
            let SourceProgress::Trace(tracker) = &mut progress.sources[source_index] else {
                bail!("trace filter task references a non-trace tracker");
            };
            tracker.add_completed_range(range);
        }

        self.inner
            .metrics
            .source(&source.id)
            .add_completed_blocks(range.block_count());
        self.enqueue_block_tasks(queue);
        Ok(())
    }

    async fn block_task(
        &self,
        block_number: u64,
        callbacks: &[BlockCallback],
    ) -> anyhow::Result<()> {
        let block = rpc::get_block_by_number(&*self.inner.rpc, block_number).await?;

        for callback in callbacks {
            self.run_block_callback(callback, &block).await?;
        }

        let frontier = {
            let mut progress = self.inner.progress.lock();
            progress
                .block_progress
                .add_completed_block(block_number, block.timestamp_u64())
        };
        if let Some(frontier) = frontier {
            self.inner.checkpoint_debouncer.call(Checkpoint {
                block_timestamp: frontier.block_timestamp,
                chain_id: self.inner.config.chain_id,
                block_number: frontier.block_number,
            });
        }
        Ok(())
    }

    async fn run_block_callback(
        &self,
        callback: &BlockCallback,
        block: &RpcBlock,
    ) -> anyhow::Result<()> {
        match callback {
            BlockCallback::LogFilter {
                source,
                range,
                logs,
                tx_hashes,
            } => {
                let EventSource::Log(config) = &self.inner.sources[*source] else {
                    bail!("log filter callback references a non-log source");
                };
                let transactions = filter_transactions(block, tx_hashes);
                let receipts = if config.criteria.include_transaction_receipts {
                    self.fetch_receipts(tx_hashes).await?
                } else {
                    Vec::new()
                };
                self.inner
                    .store
                    .insert_log_filter_interval(LogFilterIntervalInsert {
                        chain_id: config.chain_id,
                        filter: config.criteria.clone(),
                        block: block.clone(),
                        transactions,
                        receipts,
                        logs: logs.clone(),
                        range: *range,
                    })
                    .await?;
            }
            BlockCallback::FactoryChildAddress {
                source,
                range,
                logs,
                tx_hashes,
            } => {
                let EventSource::Factory(config) = &self.inner.sources[*source] else {
                    bail!("factory child address callback references a non-factory source");
                };
                self.inner
                    .store
                    .insert_log_filter_interval(LogFilterIntervalInsert {
                        chain_id: config.chain_id,
                        filter: config.criteria.child_address_criteria(),
                        block: block.clone(),
                        transactions: filter_transactions(block, tx_hashes),
                        receipts: Vec::new(),
                        logs: logs.clone(),
                        range: *range,
                    })
                    .await?;
            }
            BlockCallback::FactoryLogFilter {
                source,
                range,
                logs,
                tx_hashes,
            } => {
                let EventSource::Factory(config) = &self.inner.sources[*source] else {
                    bail!("factory log filter callback references a non-factory source");
                };
                let transactions = filter_transactions(block, tx_hashes);
                let receipts = if config.criteria.include_transaction_receipts {
                    self.fetch_receipts(tx_hashes).await?
                } else {
                    Vec::new()
                };
                self.inner
                    .store
                    .insert_factory_log_filter_interval(FactoryLogFilterIntervalInsert {
                        chain_id: config.chain_id,
                        factory: config.criteria.clone(),
                        block: block.clone(),
                        transactions,
                        receipts,
                        logs: logs.clone(),
                        range: *range,
                    })
                    .await?;
            }
            BlockCallback::BlockFilter { source, range } => {
                let EventSource::Block(config) = &self.inner.sources[*source] else {
                    bail!("block filter callback references a non-block source");
                };
                self.inner
                    .store
                    .insert_block_filter_interval(BlockFilterIntervalInsert {
                        chain_id: config.chain_id,
                        filter: config.criteria,
                        block: Some(block.clone()),
                        range: *range,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn fetch_receipts(
        &self,
        tx_hashes: &HashSet<B256>,
    ) -> anyhow::Result<Vec<RpcTransactionReceipt>> {
        let mut hashes: Vec<B256> = tx_hashes.iter().copied().collect();
        hashes.sort();
        let mut receipts = Vec::with_capacity(hashes.len());
        for hash in hashes {
            receipts.push(rpc::get_transaction_receipt(&*self.inner.rpc, hash).await?);
        }
        Ok(receipts)
    }

    /// Convert buffered block callbacks into `Block` fetch tasks, up to the
    /// lowest checkpoint among sources that still have work left. A block is
    /// only fetched once every source that could still contribute a callback
    /// for it has reported completion past it; fetching earlier would drop
    /// the late callback's data.
    ///
    /// The read-compute-drain sequence runs under one lock so concurrent
    /// workers cannot interleave their own callback appends with the drain.
    fn enqueue_block_tasks(&self, queue: &TaskQueue<SyncWorker>) {
        let mut ready = Vec::new();
        {
            let mut progress = self.inner.progress.lock();

            let mut checkpoints = Vec::new();
            for source in &progress.sources {
                match source {
                    SourceProgress::Log(tracker)
                    | SourceProgress::Block(tracker)
                    | SourceProgress::Trace(tracker) => {
                        checkpoints.push((tracker.checkpoint(), !tracker.is_complete()));
                    }
                    SourceProgress::Factory { child_address, log } => {
                        checkpoints.push((child_address.checkpoint(), !child_address.is_complete()));
                        checkpoints.push((log.checkpoint(), !log.is_complete()));
                    }
                    SourceProgress::Skipped { checkpoint } => {
                        checkpoints.push((*checkpoint, false));
                    }
                }
            }

            // Finished trackers would pin the minimum at their end block, so
            // they only participate once nothing has work left.
            let can_enqueue_up_to = checkpoints
                .iter()
                .filter(|(_, has_work)| *has_work)
                .map(|(checkpoint, _)| *checkpoint)
                .min()
                .or_else(|| checkpoints.iter().map(|(checkpoint, _)| *checkpoint).max());
            let Some(can_enqueue_up_to) = can_enqueue_up_to else {
                return;
            };
            if can_enqueue_up_to <= progress.block_tasks_enqueued_checkpoint {
                return;
            }

            let block_numbers: Vec<u64> = progress
                .block_callbacks
                .range(..=can_enqueue_up_to as u64)
                .map(|(number, _)| *number)
                .collect();
            progress
                .block_progress
                .add_pending_blocks(block_numbers.iter().copied());
            for number in block_numbers {
                if let Some(callbacks) = progress.block_callbacks.remove(&number) {
                    ready.push((number, callbacks));
                }
            }
            progress.block_tasks_enqueued_checkpoint = can_enqueue_up_to;
        }

        for (block_number, callbacks) in ready {
            queue.add_task(
                SyncTask::Block {
                    block_number,
                    callbacks,
                },
                block_priority(block_number),
            );
        }
    }
}

fn filter_transactions(block: &RpcBlock, tx_hashes: &HashSet<B256>) -> Vec<RpcTransaction> {
    block
        .transactions
        .iter()
        .filter(|tx| tx_hashes.contains(&tx.hash))
        .cloned()
        .collect()
}

/// Historical sync service for a single network.
///
/// Call [`setup`](Self::setup) once with the latest and finalized block
/// numbers, then [`start`](Self::start). The service never returns an error
/// to its caller after start: failures are logged, retried, and observable
/// through metrics and the periodic progress log.
pub struct HistoricalSyncService {
    inner: Arc<ServiceInner>,
    queue: TaskQueue<SyncWorker>,
}

#[bon]
impl HistoricalSyncService {
    #[builder]
    pub fn new(
        config: NetworkSyncConfig,
        rpc: Arc<dyn RequestQueue>,
        store: Arc<dyn SyncStore>,
        metrics: SharedMetrics,
        events: SyncEventSender,
        sources: Vec<EventSource>,
    ) -> Self {
        let concurrency = config.max_historical_task_concurrency.max(1);

        let checkpoint_events = events.clone();
        let last_emitted: Arc<Mutex<Option<Checkpoint>>> = Arc::new(Mutex::new(None));
        let checkpoint_debouncer =
            Debouncer::new(CHECKPOINT_DEBOUNCE_INTERVAL, move |checkpoint: Checkpoint| {
                let mut last = last_emitted.lock();
                let advances = last.is_none_or(|previous| {
                    checkpoint.block_number > previous.block_number
                        && checkpoint.block_timestamp > previous.block_timestamp
                });
                if advances {
                    *last = Some(checkpoint);
                    let _ = checkpoint_events.send(SyncEvent::HistoricalCheckpoint(checkpoint));
                }
            });

        let inner = Arc::new(ServiceInner {
            config,
            rpc,
            store,
            metrics,
            events,
            sources,
            progress: Mutex::new(ProgressState {
                sources: Vec::new(),
                block_callbacks: BTreeMap::new(),
                block_progress: BlockProgressTracker::new(),
                block_tasks_enqueued_checkpoint: -1,
            }),
            is_killed: AtomicBool::new(false),
            is_complete: AtomicBool::new(false),
            started_at: Mutex::new(None),
            progress_log_stop: Mutex::new(None),
            checkpoint_debouncer,
        });
        let queue = TaskQueue::new(
            SyncWorker {
                inner: inner.clone(),
            },
            concurrency,
        );
        Self { inner, queue }
    }

    /// Restore per-source progress from the store and enqueue the remaining
    /// range tasks. Historical sync only runs up to the finalized block.
    pub async fn setup(
        &self,
        latest_block_number: u64,
        finalized_block_number: u64,
    ) -> anyhow::Result<()> {
        info!(
            "Setting up historical sync (network={}, latest={latest_block_number}, finalized={finalized_block_number})",
            self.inner.config.network_name
        );
        let chain_id = self.inner.config.chain_id;
        let mut built = Vec::with_capacity(self.inner.sources.len());

        for (index, source) in self.inner.sources.iter().enumerate() {
            let source_metrics = self.inner.metrics.source(source.id());
            let start_block = source.start_block();

            if start_block > finalized_block_number {
                warn!(
                    "Start block {start_block} for source {} is above the finalized block \
                     {finalized_block_number}; no historical sync will run for it",
                    source.name()
                );
                built.push(SourceProgress::Skipped {
                    checkpoint: finalized_block_number as i64,
                });
                continue;
            }
            let end_block = source
                .end_block()
                .unwrap_or(finalized_block_number)
                .min(finalized_block_number);
            if end_block < start_block {
                warn!(
                    "{}; no historical sync will run for it",
                    SyncError::InvalidRange {
                        source_name: source.name().to_string(),
                        start_block,
                        end_block,
                    }
                );
                built.push(SourceProgress::Skipped {
                    checkpoint: finalized_block_number as i64,
                });
                continue;
            }

            let target = BlockRange::new(start_block, end_block);
            let max_block_range = source
                .max_block_range()
                .unwrap_or(self.inner.config.default_max_block_range);

            let progress = match source {
                EventSource::Log(config) => {
                    let cached = self
                        .inner
                        .store
                        .get_log_filter_intervals(chain_id, &config.criteria)
                        .await?;
                    let tracker = ProgressTracker::new(target, cached);
                    self.enqueue_range_tasks(&tracker, max_block_range, |range| {
                        SyncTask::LogFilter {
                            source: index,
                            range,
                        }
                    });
                    self.report_setup(source, &tracker, &source_metrics);
                    SourceProgress::Log(tracker)
                }
                EventSource::Factory(config) => {
                    let child_cached = self
                        .inner
                        .store
                        .get_log_filter_intervals(
                            chain_id,
                            &config.criteria.child_address_criteria(),
                        )
                        .await?;
                    let log_cached = self
                        .inner
                        .store
                        .get_factory_log_filter_intervals(chain_id, &config.criteria)
                        .await?;
                    let child_address = ProgressTracker::new(target, child_cached);
                    let log = ProgressTracker::new(target, log_cached);

                    self.enqueue_range_tasks(&child_address, max_block_range, |range| {
                        SyncTask::FactoryChildAddress {
                            source: index,
                            range,
                        }
                    });
                    // Child log fetching is only immediately possible where
                    // discovery already happened in a previous run; the rest
                    // streams in from child-address completions.
                    let ready = interval::difference(&log.required(), &child_address.required());
                    for range in interval::chunks(&ready, max_block_range) {
                        self.queue.add_task(
                            SyncTask::FactoryLogFilter {
                                source: index,
                                range,
                            },
                            block_priority(range.start),
                        );
                    }
                    self.report_setup(source, &log, &source_metrics);
                    SourceProgress::Factory { child_address, log }
                }
                EventSource::Block(config) => {
                    if config.criteria.interval == 0 {
                        warn!(
                            "Block filter interval of 0 for source {} matches nothing; no \
                             historical sync will run for it",
                            source.name()
                        );
                        built.push(SourceProgress::Skipped {
                            checkpoint: finalized_block_number as i64,
                        });
                        continue;
                    }
                    let cached = self
                        .inner
                        .store
                        .get_block_filter_intervals(chain_id, &config.criteria)
                        .await?;
                    let tracker = ProgressTracker::new(target, cached);
                    self.enqueue_range_tasks(&tracker, max_block_range, |range| {
                        SyncTask::BlockFilter {
                            source: index,
                            range,
                        }
                    });
                    self.report_setup(source, &tracker, &source_metrics);
                    SourceProgress::Block(tracker)
                }
                EventSource::Trace(config) => {
                    let cached = self
                        .inner
                        .store
                        .get_trace_filter_intervals(chain_id, &config.criteria)
                        .await?;
                    let tracker = ProgressTracker::new(target, cached);
                    self.enqueue_range_tasks(&tracker, max_block_range, |range| {
                        SyncTask::TraceFilter {
                            source: index,
                            range,
                        }
                    });
                    self.report_setup(source, &tracker, &source_metrics);
                    SourceProgress::Trace(tracker)
                }
            };
            built.push(progress);
        }

        self.inner.progress.lock().sources = built;
        Ok(())
    }

    fn enqueue_range_tasks(
        &self,
        tracker: &ProgressTracker,
        max_block_range: u64,
        make_task: impl Fn(BlockRange) -> SyncTask,
    ) {
        for range in interval::chunks(&tracker.required(), max_block_range) {
            self.queue.add_task(make_task(range), block_priority(range.start));
        }
    }

    fn report_setup(
        &self,
        source: &EventSource,
        tracker: &ProgressTracker,
        metrics: &SourceSyncMetrics,
    ) {
        let total = tracker.target().block_count();
        let required = interval::total_blocks(&tracker.required());
        let cached = total - required;
        metrics.total_blocks.store(total, Ordering::Relaxed);
        metrics.cached_blocks.store(cached, Ordering::Relaxed);
        info!(
            "Restored sync progress for source {} (network={}): {cached}/{total} blocks cached",
            source.name(),
            self.inner.config.network_name
        );
    }

    /// Begin processing. Emits `SyncComplete` immediately when setup left
    /// nothing to do.
    pub fn start(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.inner
            .metrics
            .start_timestamp_ms
            .store(now_ms, Ordering::Relaxed);
        *self.inner.started_at.lock() = Some(Instant::now());
        self.spawn_progress_log();

        if self.queue.size() == 0 && self.queue.pending() == 0 {
            info!(
                "No historical sync required (network={}), all ranges cached",
                self.inner.config.network_name
            );
            self.inner.complete();
            return;
        }
        self.queue.start();
    }

    /// Resolves once every queued and in-flight task has drained.
    pub async fn await_idle(&self) {
        self.queue.on_idle().await;
    }

    /// Cooperative shutdown: queued tasks are dropped, in-flight tasks
    /// finish but their follow-up work and errors are discarded.
    pub fn kill(&self) {
        self.inner.is_killed.store(true, Ordering::Release);
        self.inner.stop_progress_log();
        self.queue.pause();
        self.queue.clear();
        info!(
            "Killed historical sync service (network={})",
            self.inner.config.network_name
        );
    }

    fn spawn_progress_log(&self) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.inner.progress_log_stop.lock() = Some(stop_tx);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);
            // The first tick fires immediately; progress right after start
            // is not worth a log line.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => return,
                    _ = ticker.tick() => {
                        let snapshot = inner.metrics.snapshot();
                        for (id, source) in &snapshot.sources {
                            info!(
                                "Historical sync progress (network={}, source={id}): {}/{} blocks ({:.1}%)",
                                inner.config.network_name,
                                source.cached_blocks + source.completed_blocks,
                                source.total_blocks,
                                source.progress() * 100.0,
                            );
                        }
                    }
                }
            }
        });
    }
}
