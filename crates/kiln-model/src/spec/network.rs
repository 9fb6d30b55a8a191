use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::UnknownKind;

/// Overlay network driver a network specification asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkKind {
    /// Plain host-local bridge.
    Bridge,
    /// Tinc mesh VPN.
    Tinc,
    /// L2TP tunnel.
    L2tp,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Bridge => "bridge",
            NetworkKind::Tinc => "tinc",
            NetworkKind::L2tp => "l2tp",
        }
    }
}

impl FromStr for NetworkKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bridge" => Ok(NetworkKind::Bridge),
            "tinc" => Ok(NetworkKind::Tinc),
            "l2tp" => Ok(NetworkKind::L2tp),
            _ => Err(UnknownKind::new("network type", s)),
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network a task asks to be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Network type as written by the caller; resolved to a [`NetworkKind`] at tune time.
    #[serde(rename = "type")]
    pub kind: String,
    /// Identifier of the network, shared by every task joining it.
    pub net_id: String,
    /// Subnet in CIDR notation, if the driver needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    /// Egress rate limit in bits per second, `0` for none.
    #[serde(default)]
    pub rate_limit_egress: u64,
    /// Ingress rate limit in bits per second, `0` for none.
    #[serde(default)]
    pub rate_limit_ingress: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl NetworkSpec {
    pub fn new(kind: impl Into<String>, net_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            net_id: net_id.into(),
            subnet: None,
            rate_limit_egress: 0,
            rate_limit_ingress: 0,
            options: BTreeMap::new(),
        }
    }
}
