use tokio::sync::mpsc;

/// Durable-progress marker emitted to downstream consumers. Monotonic in
/// both `block_timestamp` and `block_number` within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// All historical work drained. Fired exactly once per run.
    SyncComplete,
    /// Data is durable up to this checkpoint.
    HistoricalCheckpoint(Checkpoint),
}

pub type SyncEventSender = mpsc::UnboundedSender<SyncEvent>;
pub type SyncEventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

pub fn sync_event_channel() -> (SyncEventSender, SyncEventReceiver) {
    mpsc::unbounded_channel()
}
