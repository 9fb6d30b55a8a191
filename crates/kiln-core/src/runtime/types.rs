use std::collections::BTreeMap;

use kiln_model::{ContainerId, Resources, Timestamp};
use serde::{Deserialize, Serialize};

/// Host-side container settings that capability tuners write into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    pub devices: Vec<DeviceMapping>,
    pub mounts: Vec<MountConfig>,
    pub resources: Resources,
    pub cgroup_parent: String,
    pub auto_remove: bool,
    pub publish_all_ports: bool,
    pub log_config: LogConfig,
    /// Extra environment injected by tuners (e.g. visible device lists).
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    pub cgroup_permissions: String,
}

impl DeviceMapping {
    /// Maps a device file to the same path inside the container with `rwm` permissions.
    pub fn passthrough(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path_in_container: path.clone(),
            path_on_host: path,
            cgroup_permissions: "rwm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MountKind {
    Bind,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountConfig {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub driver_options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    pub driver: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// Per-network attachment settings, keyed by network name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingConfig {
    pub endpoints: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSettings {
    pub network_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub driver_options: BTreeMap<String, String>,
}

/// Container-side settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: Vec<String>,
}

/// Everything the engine needs to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerCreate {
    pub config: ContainerConfig,
    pub host: HostConfig,
    pub networking: NetworkingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateResponse {
    pub id: ContainerId,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
}

impl ImageSummary {
    /// True when `reference` names this image by id or by one of its tags.
    pub fn matches(&self, reference: &str) -> bool {
        self.id == reference || self.repo_tags.iter().any(|t| t == reference)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInspect {
    pub id: String,
    pub size: u64,
    pub repo_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogsOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub follow: bool,
    pub timestamps: bool,
    pub since: Option<Timestamp>,
    pub tail: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub tty: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkCreate {
    pub name: String,
    pub driver: String,
    pub labels: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
    pub subnet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Die,
    Other(String),
}

impl EventAction {
    pub fn as_str(&self) -> &str {
        match self {
            EventAction::Die => "die",
            EventAction::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Id of the container the event is about.
    pub id: ContainerId,
    pub action: EventAction,
    pub time: Timestamp,
    pub attributes: BTreeMap<String, String>,
}

/// Subscription filter: only events at or after `since`, with one of `actions`,
/// on containers carrying every label in `labels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub since: Timestamp,
    pub actions: Vec<EventAction>,
    pub labels: Vec<String>,
}
