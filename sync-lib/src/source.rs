use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::rpc::RpcLog;

/// `eth_getLogs` topic filter: up to four positions, each matching anything
/// (`None`) or any of a list of values.
pub type Topics = Vec<Option<Vec<B256>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilterCriteria {
    #[serde(default)]
    pub address: Option<Vec<Address>>,
    #[serde(default)]
    pub topics: Topics,
    #[serde(default)]
    pub include_transaction_receipts: bool,
}

/// Where a child contract address sits inside the factory event that
/// announced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildAddressLocation {
    Topic1,
    Topic2,
    Topic3,
    /// Byte offset of the 32-byte word in the event data holding the
    /// (right-aligned) address.
    Offset(usize),
}

impl ChildAddressLocation {
    /// Extract the child address from a factory event log. Returns `None`
    /// when the log is too short for the configured location.
    pub fn extract(&self, log: &RpcLog) -> Option<Address> {
        let word: &[u8] = match self {
            Self::Topic1 => log.topics.get(1)?.as_slice(),
            Self::Topic2 => log.topics.get(2)?.as_slice(),
            Self::Topic3 => log.topics.get(3)?.as_slice(),
            Self::Offset(offset) => log.data.get(*offset..*offset + 32)?,
        };
        Some(Address::from_slice(&word[12..32]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryCriteria {
    /// The factory (parent) contract.
    pub address: Address,
    /// Topic0 of the event announcing a new child contract.
    pub event_selector: B256,
    pub child_address_location: ChildAddressLocation,
    /// Topic filter applied to the child contracts' logs.
    #[serde(default)]
    pub topics: Topics,
    #[serde(default)]
    pub include_transaction_receipts: bool,
}

impl FactoryCriteria {
    /// The log filter under which child-address discovery progress is cached
    /// in the sync store. Discovery for `[a, b]` is recorded as a plain log
    /// filter interval for the factory address + event selector, so later
    /// runs see the range as already discovered.
    pub fn child_address_criteria(&self) -> LogFilterCriteria {
        LogFilterCriteria {
            address: Some(vec![self.address]),
            topics: vec![Some(vec![self.event_selector])],
            include_transaction_receipts: false,
        }
    }
}

/// Matches block numbers where `(n - offset) % interval == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFilterCriteria {
    pub interval: u64,
    pub offset: u64,
}

impl BlockFilterCriteria {
    pub fn matches(&self, block_number: u64) -> bool {
        block_number % self.interval == self.offset % self.interval
    }

    /// Smallest matching block number `>= from`.
    pub fn first_matching_block(&self, from: u64) -> u64 {
        let wanted = self.offset % self.interval;
        let have = from % self.interval;
        from + (wanted + self.interval - have) % self.interval
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFilterCriteria {
    #[serde(default)]
    pub from_address: Option<Vec<Address>>,
    #[serde(default)]
    pub to_address: Option<Vec<Address>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSource {
    pub id: String,
    pub chain_id: u64,
    pub contract_name: String,
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub max_block_range: Option<u64>,
    pub criteria: LogFilterCriteria,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorySource {
    pub id: String,
    pub chain_id: u64,
    pub contract_name: String,
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub max_block_range: Option<u64>,
    pub criteria: FactoryCriteria,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSource {
    pub id: String,
    pub chain_id: u64,
    pub source_name: String,
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    pub criteria: BlockFilterCriteria,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSource {
    pub id: String,
    pub chain_id: u64,
    pub contract_name: String,
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub max_block_range: Option<u64>,
    pub criteria: TraceFilterCriteria,
}

/// A user-declared event source over a single network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSource {
    Log(LogSource),
    Factory(FactorySource),
    Block(BlockSource),
    Trace(TraceSource),
}

impl EventSource {
    pub fn id(&self) -> &str {
        match self {
            Self::Log(s) => &s.id,
            Self::Factory(s) => &s.id,
            Self::Block(s) => &s.id,
            Self::Trace(s) => &s.id,
        }
    }

    /// Human-readable name used in log lines. Not necessarily unique.
    pub fn name(&self) -> &str {
        match self {
            Self::Log(s) => &s.contract_name,
            Self::Factory(s) => &s.contract_name,
            Self::Block(s) => &s.source_name,
            Self::Trace(s) => &s.contract_name,
        }
    }

    pub fn start_block(&self) -> u64 {
        match self {
            Self::Log(s) => s.start_block,
            Self::Factory(s) => s.start_block,
            Self::Block(s) => s.start_block,
            Self::Trace(s) => s.start_block,
        }
    }

    pub fn end_block(&self) -> Option<u64> {
        match self {
            Self::Log(s) => s.end_block,
            Self::Factory(s) => s.end_block,
            Self::Block(s) => s.end_block,
            Self::Trace(s) => s.end_block,
        }
    }

    pub fn max_block_range(&self) -> Option<u64> {
        match self {
            Self::Log(s) => s.max_block_range,
            Self::Factory(s) => s.max_block_range,
            Self::Block(_) => None,
            Self::Trace(s) => s.max_block_range,
        }
    }
}
