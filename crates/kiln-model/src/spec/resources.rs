use serde::{Deserialize, Serialize};

/// Resource limits applied to the container.
///
/// A zero value means "no explicit limit" for that resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// CPU quota in billionths of a CPU.
    #[serde(default)]
    pub nano_cpus: u64,
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory_bytes: u64,
    /// Memory plus swap limit in bytes.
    #[serde(default)]
    pub memory_swap_bytes: u64,
    /// Writable layer size limit in bytes.
    #[serde(default)]
    pub storage_bytes: u64,
    /// Maximum number of processes.
    #[serde(default)]
    pub pids_limit: u64,
}
