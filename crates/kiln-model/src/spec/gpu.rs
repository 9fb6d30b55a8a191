use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::UnknownKind;

/// Host-wide identifier of a GPU device (e.g. a PCI bus id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GpuId(String);

impl GpuId {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GpuId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for GpuId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// GPU vendor a tuner is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GpuVendor {
    Nvidia,
    Radeon,
    /// Devices exposed through a remote GPU plugin.
    Remote,
    /// Synthetic devices, for hosts without GPUs.
    Fake,
}

impl GpuVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "nvidia",
            GpuVendor::Radeon => "radeon",
            GpuVendor::Remote => "remote",
            GpuVendor::Fake => "fake",
        }
    }
}

impl FromStr for GpuVendor {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nvidia" => Ok(GpuVendor::Nvidia),
            "radeon" | "amd" => Ok(GpuVendor::Radeon),
            "remote" => Ok(GpuVendor::Remote),
            "fake" => Ok(GpuVendor::Fake),
            _ => Err(UnknownKind::new("gpu vendor", s)),
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GPU a tuner can hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    pub id: GpuId,
    pub vendor: GpuVendor,
    /// Human readable model name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Device nodes that must be mapped into a container using this GPU.
    pub device_files: Vec<String>,
}
