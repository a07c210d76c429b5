use std::time::Duration;

use serde::Deserialize;

/// Trailing-edge window for `HistoricalCheckpoint` emission.
pub const CHECKPOINT_DEBOUNCE_INTERVAL: Duration = Duration::from_millis(500);

/// Cadence of the sync progress log line.
pub const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Per-network historical sync configuration. One orchestrator runs per
/// network.
#[derive(Deserialize, Debug, Clone)]
pub struct NetworkSyncConfig {
    pub chain_id: u64,
    #[serde(default = "default_network_name")]
    pub network_name: String,
    /// `eth_getLogs` range cap for sources without their own.
    #[serde(default = "default_max_block_range")]
    pub default_max_block_range: u64,
    /// Concurrent in-flight historical sync tasks.
    #[serde(default = "default_task_concurrency")]
    pub max_historical_task_concurrency: usize,
}

fn default_network_name() -> String {
    "mainnet".to_string()
}

fn default_max_block_range() -> u64 {
    2_000
}

fn default_task_concurrency() -> usize {
    20
}

pub fn get_network_sync_config() -> anyhow::Result<NetworkSyncConfig> {
    Ok(envy::from_env::<NetworkSyncConfig>()?)
}
