//! Durable sync storage, consumed through [`SyncStore`].
//!
//! Real deployments back this with a database; the engine only relies on the
//! interval queries, idempotent inserts and the child-address stream below.
//! [`memory::MemorySyncStore`] is the reference implementation used by the
//! test suite and ephemeral runs.

pub mod memory;

use alloy_primitives::Address;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::interval::BlockRange;
use crate::rpc::{RpcBlock, RpcLog, RpcTransaction, RpcTransactionReceipt};
use crate::source::{BlockFilterCriteria, FactoryCriteria, LogFilterCriteria, TraceFilterCriteria};

/// A fully synced block range for a log filter, with everything needed to
/// serve that range from the store: the fetched end block, its relevant
/// transactions and receipts, and the logs themselves.
#[derive(Debug, Clone)]
pub struct LogFilterIntervalInsert {
    pub chain_id: u64,
    pub filter: LogFilterCriteria,
    pub block: RpcBlock,
    pub transactions: Vec<RpcTransaction>,
    pub receipts: Vec<RpcTransactionReceipt>,
    pub logs: Vec<RpcLog>,
    pub range: BlockRange,
}

#[derive(Debug, Clone)]
pub struct FactoryLogFilterIntervalInsert {
    pub chain_id: u64,
    pub factory: FactoryCriteria,
    pub block: RpcBlock,
    pub transactions: Vec<RpcTransaction>,
    pub receipts: Vec<RpcTransactionReceipt>,
    pub logs: Vec<RpcLog>,
    pub range: BlockRange,
}

/// `block` is only present when the range's end block had to be fetched;
/// ranges ending on an already-stored or unmatched block carry `None`.
#[derive(Debug, Clone)]
pub struct BlockFilterIntervalInsert {
    pub chain_id: u64,
    pub filter: BlockFilterCriteria,
    pub block: Option<RpcBlock>,
    pub range: BlockRange,
}

/// Keyed, idempotent storage for synced chain data and completed-interval
/// metadata. All insert operations must tolerate repeated calls with the
/// same `(chain_id, criteria, range)` key.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn get_log_filter_intervals(
        &self,
        chain_id: u64,
        filter: &LogFilterCriteria,
    ) -> anyhow::Result<Vec<BlockRange>>;

    async fn get_factory_log_filter_intervals(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
    ) -> anyhow::Result<Vec<BlockRange>>;

    async fn get_block_filter_intervals(
        &self,
        chain_id: u64,
        filter: &BlockFilterCriteria,
    ) -> anyhow::Result<Vec<BlockRange>>;

    async fn get_trace_filter_intervals(
        &self,
        chain_id: u64,
        filter: &TraceFilterCriteria,
    ) -> anyhow::Result<Vec<BlockRange>>;

    async fn insert_log_filter_interval(
        &self,
        insert: LogFilterIntervalInsert,
    ) -> anyhow::Result<()>;

    /// Raw factory events carrying child contract addresses.
    async fn insert_factory_child_address_logs(
        &self,
        chain_id: u64,
        logs: Vec<RpcLog>,
    ) -> anyhow::Result<()>;

    async fn insert_factory_log_filter_interval(
        &self,
        insert: FactoryLogFilterIntervalInsert,
    ) -> anyhow::Result<()>;

    async fn insert_block_filter_interval(
        &self,
        insert: BlockFilterIntervalInsert,
    ) -> anyhow::Result<()>;

    /// Stream the distinct child addresses discovered for `factory` within
    /// `range`, in batches sized for `eth_getLogs` address lists.
    async fn get_factory_child_addresses(
        &self,
        chain_id: u64,
        factory: FactoryCriteria,
        range: BlockRange,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Vec<Address>>>>;

    /// Whether the block is already stored for this chain.
    async fn has_block(&self, chain_id: u64, block_number: u64) -> anyhow::Result<bool>;
}
