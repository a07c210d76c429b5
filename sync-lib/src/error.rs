use alloy_primitives::B256;
use thiserror::Error;

/// Failure kinds the sync engine distinguishes.
///
/// Anything else bubbling out of the RPC or store collaborators is treated as
/// transient and retried by re-enqueueing the failed task.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A finalized block the node should have returned came back null.
    #[error("block {0} not found")]
    BlockNotFound(u64),

    /// A receipt for a mined transaction came back null.
    #[error("receipt for transaction {0} not found")]
    ReceiptNotFound(B256),

    /// A source's configured block range cannot produce historical work.
    #[error("invalid block range for source {source_name}: start {start_block} is above end {end_block}")]
    InvalidRange {
        source_name: String,
        start_block: u64,
        end_block: u64,
    },
}
