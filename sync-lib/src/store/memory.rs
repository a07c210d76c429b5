use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use itertools::Itertools;
use parking_lot::Mutex;

use super::{
    BlockFilterIntervalInsert, FactoryLogFilterIntervalInsert, LogFilterIntervalInsert, SyncStore,
};
use crate::interval::{self, BlockRange};
use crate::rpc::{RpcBlock, RpcLog};
use crate::source::{BlockFilterCriteria, FactoryCriteria, LogFilterCriteria, TraceFilterCriteria};

/// How many child addresses go into a single `eth_getLogs` address list.
const CHILD_ADDRESS_BATCH_SIZE: usize = 500;

#[derive(Default)]
struct MemoryInner {
    /// Completed ranges per `(chain_id, criteria key)`, kept canonical.
    intervals: HashMap<(u64, String), Vec<BlockRange>>,
    /// Every interval insert in call order, for inspection in tests.
    interval_inserts: Vec<(String, BlockRange)>,
    blocks: HashMap<(u64, u64), RpcBlock>,
    child_logs: HashMap<u64, Vec<RpcLog>>,
    seen_child_logs: HashSet<(u64, B256, u64)>,
}

/// In-memory [`SyncStore`]. Complete but unpersisted; backs the test suite.
#[derive(Default, Clone)]
pub struct MemorySyncStore {
    inner: Arc<Mutex<MemoryInner>>,
}

fn log_filter_key(filter: &LogFilterCriteria) -> String {
    format!("log:{}", serde_json::to_string(filter).expect("criteria serialize"))
}

fn factory_key(factory: &FactoryCriteria) -> String {
    format!("factory:{}", serde_json::to_string(factory).expect("criteria serialize"))
}

fn block_filter_key(filter: &BlockFilterCriteria) -> String {
    format!("block:{}", serde_json::to_string(filter).expect("criteria serialize"))
}

fn trace_filter_key(filter: &TraceFilterCriteria) -> String {
    format!("trace:{}", serde_json::to_string(filter).expect("criteria serialize"))
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a completed range, as if a previous run had synced it.
    pub fn seed_log_filter_interval(
        &self,
        chain_id: u64,
        filter: &LogFilterCriteria,
        range: BlockRange,
    ) {
        self.merge_interval(chain_id, log_filter_key(filter), range, false);
    }

    pub fn seed_block(&self, chain_id: u64, block: RpcBlock) {
        let mut inner = self.inner.lock();
        inner.blocks.insert((chain_id, block.number_u64()), block);
    }

    /// Every interval insert observed, in call order.
    pub fn interval_inserts(&self) -> Vec<(String, BlockRange)> {
        self.inner.lock().interval_inserts.clone()
    }

    pub fn has_block_sync(&self, chain_id: u64, block_number: u64) -> bool {
        self.inner.lock().blocks.contains_key(&(chain_id, block_number))
    }

    fn merge_interval(&self, chain_id: u64, key: String, range: BlockRange, record: bool) {
        let mut inner = self.inner.lock();
        if record {
            inner.interval_inserts.push((key.clone(), range));
        }
        let entry = inner.intervals.entry((chain_id, key)).or_default();
        *entry = interval::union(entry, &[range]);
    }

    fn get_intervals(&self, chain_id: u64, key: String) -> Vec<BlockRange> {
        self.inner
            .lock()
            .intervals
            .get(&(chain_id, key))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn get_log_filter_intervals(
        &self,
        chain_id: u64,
        filter: &LogFilterCriteria,
    ) -> anyhow::Result<Vec<BlockRange>> {
        Ok(self.get_intervals(chain_id, log_filter_key(filter)))
    }

    async fn get_factory_log_filter_intervals(
        &self,
        chain_id: u64,
        factory: &FactoryCriteria,
    ) -> anyhow::Result<Vec<BlockRange>> {
        Ok(self.get_intervals(chain_id, factory_key(factory)))
    }

    async fn get_block_filter_intervals(
        &self,
        chain_id: u64,
        filter: &BlockFilterCriteria,
    ) -> anyhow::Result<Vec<BlockRange>> {
        Ok(self.get_intervals(chain_id, block_filter_key(filter)))
    }

    async fn get_trace_filter_intervals(
        &self,
        chain_id: u64,
        filter: &TraceFilterCriteria,
    ) -> anyhow::Result<Vec<BlockRange>> {
        Ok(self.get_intervals(chain_id, trace_filter_key(filter)))
    }

    async fn insert_log_filter_interval(
        &self,
        insert: LogFilterIntervalInsert,
    ) -> anyhow::Result<()> {
        self.seed_block(insert.chain_id, insert.block.clone());
        self.merge_interval(
            insert.chain_id,
            log_filter_key(&insert.filter),
            insert.range,
            true,
        );
        Ok(())
    }

    async fn insert_factory_child_address_logs(
        &self,
        chain_id: u64,
        logs: Vec<RpcLog>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for log in logs {
            let dedupe = (chain_id, log.transaction_hash, log.log_index.to::<u64>());
            if inner.seen_child_logs.insert(dedupe) {
                inner.child_logs.entry(chain_id).or_default().push(log);
            }
        }
        Ok(())
    }

    async fn insert_factory_log_filter_interval(
        &self,
        insert: FactoryLogFilterIntervalInsert,
    ) -> anyhow::Result<()> {
        self.seed_block(insert.chain_id, insert.block.clone());
        self.merge_interval(
            insert.chain_id,
            factory_key(&insert.factory),
            insert.range,
            true,
        );
        Ok(())
    }

    async fn insert_block_filter_interval(
        &self,
        insert: BlockFilterIntervalInsert,
    ) -> anyhow::Result<()> {
        if let Some(block) = &insert.block {
            self.seed_block(insert.chain_id, block.clone());
        }
        self.merge_interval(
            insert.chain_id,
            block_filter_key(&insert.filter),
            insert.range,
            true,
        );
        Ok(())
    }

    async fn get_factory_child_addresses(
        &self,
        chain_id: u64,
        factory: FactoryCriteria,
        range: BlockRange,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<Vec<Address>>>> {
        let inner = self.inner.lock();
        let addresses: Vec<Address> = inner
            .child_logs
            .get(&chain_id)
            .into_iter()
            .flatten()
            .filter(|log| {
                log.address == factory.address
                    && log.topics.first() == Some(&factory.event_selector)
                    && range.contains(log.block_number_u64())
            })
            .filter_map(|log| factory.child_address_location.extract(log))
            .unique()
            .collect();

        let batches: Vec<anyhow::Result<Vec<Address>>> = addresses
            .chunks(CHILD_ADDRESS_BATCH_SIZE)
            .map(|batch| Ok(batch.to_vec()))
            .collect();
        Ok(futures_util::stream::iter(batches).boxed())
    }

    async fn has_block(&self, chain_id: u64, block_number: u64) -> anyhow::Result<bool> {
        Ok(self.has_block_sync(chain_id, block_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChildAddressLocation;
    use alloy_primitives::{U64, address, b256};

    fn child_log(factory: Address, selector: B256, child: Address, block: u64) -> RpcLog {
        let mut topic = [0u8; 32];
        topic[12..].copy_from_slice(child.as_slice());
        RpcLog {
            address: factory,
            topics: vec![selector, B256::from(topic)],
            block_number: U64::from(block),
            transaction_hash: B256::with_last_byte(block as u8),
            log_index: U64::from(block),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn interval_inserts_are_idempotent() {
        let store = MemorySyncStore::new();
        let filter = LogFilterCriteria::default();
        let insert = LogFilterIntervalInsert {
            chain_id: 1,
            filter: filter.clone(),
            block: RpcBlock::default(),
            transactions: vec![],
            receipts: vec![],
            logs: vec![],
            range: BlockRange::new(0, 10),
        };
        store.insert_log_filter_interval(insert.clone()).await.unwrap();
        store.insert_log_filter_interval(insert).await.unwrap();

        let intervals = store.get_log_filter_intervals(1, &filter).await.unwrap();
        assert_eq!(intervals, vec![BlockRange::new(0, 10)]);
    }

    #[tokio::test]
    async fn child_addresses_stream_in_discovery_order() {
        let store = MemorySyncStore::new();
        let factory_address = address!("00000000000000000000000000000000000000f0");
        let selector =
            b256!("00000000000000000000000000000000000000000000000000000000000000aa");
        let factory = FactoryCriteria {
            address: factory_address,
            event_selector: selector,
            child_address_location: ChildAddressLocation::Topic1,
            topics: vec![],
            include_transaction_receipts: false,
        };

        let child_a = address!("00000000000000000000000000000000000000aa");
        let child_b = address!("00000000000000000000000000000000000000bb");
        store
            .insert_factory_child_address_logs(
                1,
                vec![
                    child_log(factory_address, selector, child_a, 5),
                    child_log(factory_address, selector, child_b, 9),
                    // Duplicate announcement of child_a later on.
                    child_log(factory_address, selector, child_a, 12),
                ],
            )
            .await
            .unwrap();

        let mut stream = store
            .get_factory_child_addresses(1, factory, BlockRange::new(0, 100))
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch, vec![child_a, child_b]);
        assert!(stream.next().await.is_none());
    }
}
