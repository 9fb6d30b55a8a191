use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Resource usage snapshot of a single container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    /// Cumulative CPU time consumed, in nanoseconds.
    pub cpu_total_usage: u64,
    /// Current memory usage in bytes.
    pub memory_usage: u64,
    /// Peak memory usage in bytes.
    pub memory_max_usage: u64,
    /// Per-interface network counters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkUsage>,
    /// When the snapshot was taken.
    pub collected_at: Timestamp,
}

/// Network counters of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkUsage {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}
