use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::UnknownKind;

/// Volume driver a volume specification asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeDriverKind {
    /// Host directory bound into the container.
    Bind,
    /// SMB/CIFS network share.
    Cifs,
    /// BitTorrent file system.
    Btfs,
}

impl VolumeDriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeDriverKind::Bind => "bind",
            VolumeDriverKind::Cifs => "cifs",
            VolumeDriverKind::Btfs => "btfs",
        }
    }
}

impl FromStr for VolumeDriverKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bind" | "local" => Ok(VolumeDriverKind::Bind),
            "cifs" => Ok(VolumeDriverKind::Cifs),
            "btfs" => Ok(VolumeDriverKind::Btfs),
            _ => Err(UnknownKind::new("volume driver", s)),
        }
    }
}

impl fmt::Display for VolumeDriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume requested by a task.
///
/// The driver is kept as the caller wrote it; it is resolved against the registered
/// drivers only when the volume is tuned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub driver: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// Access mode of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MountMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// Binding of a named volume to a path inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Volume name, as declared in the task's volume map.
    pub source: String,
    /// Absolute path inside the container.
    pub target: String,
    #[serde(default)]
    pub mode: MountMode,
}

impl Mount {
    pub fn new(source: impl Into<String>, target: impl Into<String>, mode: MountMode) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode,
        }
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.mode == MountMode::ReadOnly
    }
}

/// Parses the `SOURCE:TARGET[:MODE]` short form, where `MODE` is `rw` or `ro`.
impl FromStr for Mount {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [source, target] => (*source, *target, MountMode::ReadWrite),
            [source, target, "rw"] => (*source, *target, MountMode::ReadWrite),
            [source, target, "ro"] => (*source, *target, MountMode::ReadOnly),
            _ => return Err(UnknownKind::new("mount", s)),
        };
        if source.is_empty() || !target.starts_with('/') {
            return Err(UnknownKind::new("mount", s));
        }
        Ok(Mount::new(source, target, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_short_form() {
        let m: Mount = "data:/mnt/data".parse().unwrap();
        assert_eq!(m, Mount::new("data", "/mnt/data", MountMode::ReadWrite));

        let m: Mount = "cache:/cache:ro".parse().unwrap();
        assert!(m.is_read_only());
    }

    #[test]
    fn mount_rejects_malformed_input() {
        assert!("data".parse::<Mount>().is_err());
        assert!("data:relative".parse::<Mount>().is_err());
        assert!(":/mnt".parse::<Mount>().is_err());
        assert!("data:/mnt:rx".parse::<Mount>().is_err());
    }

    #[test]
    fn driver_kind_from_str() {
        assert_eq!("cifs".parse::<VolumeDriverKind>().unwrap(), VolumeDriverKind::Cifs);
        assert_eq!("local".parse::<VolumeDriverKind>().unwrap(), VolumeDriverKind::Bind);
        assert!("nfs".parse::<VolumeDriverKind>().is_err());
    }
}
