//! Historical sync engine for EVM event indexing.
//!
//! Populates a sync store with every log, block and transaction a set of
//! user-declared event sources needs over their historical block ranges,
//! idempotently and with aggressive reuse of previously synced intervals.
//! The entry point is [`historical::HistoricalSyncService`]; the JSON-RPC
//! transport and the durable store are supplied by the caller through the
//! [`rpc::RequestQueue`] and [`store::SyncStore`] traits.

pub mod block_progress;
pub mod config;
pub mod debounce;
pub mod error;
pub mod events;
pub mod historical;
pub mod interval;
pub mod metrics;
pub mod progress;
pub mod rpc;
pub mod source;
pub mod store;
pub mod task_queue;

pub use config::NetworkSyncConfig;
pub use error::SyncError;
pub use events::{Checkpoint, SyncEvent, sync_event_channel};
pub use historical::HistoricalSyncService;
pub use interval::BlockRange;
