use std::collections::BTreeMap;

use kiln_core::runtime::{DeviceMapping, HostConfig};
use kiln_core::{CoreError, GpuTuner};
use kiln_model::{GpuDevice, GpuId, GpuVendor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PluginError;

/// Devices handed to a [`StaticGpuTuner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuConfig {
    pub vendor: GpuVendor,
    pub devices: Vec<GpuDevice>,
    /// Device files every GPU container needs regardless of which cards it gets
    /// (e.g. `/dev/nvidiactl`).
    #[serde(default)]
    pub shared_files: Vec<String>,
}

/// GPU backend over a fixed, configured device list.
pub struct StaticGpuTuner {
    vendor: GpuVendor,
    devices: BTreeMap<GpuId, GpuDevice>,
    shared_files: Vec<String>,
}

impl StaticGpuTuner {
    pub fn new(cfg: GpuConfig) -> Result<Self, PluginError> {
        let mut devices = BTreeMap::new();
        for device in cfg.devices {
            if device.vendor != cfg.vendor {
                return Err(PluginError::InvalidSettings(format!(
                    "device {} belongs to {}, not {}",
                    device.id, device.vendor, cfg.vendor
                )));
            }
            if devices.insert(device.id.clone(), device).is_some() {
                return Err(PluginError::InvalidSettings("duplicate GPU id".into()));
            }
        }

        Ok(Self {
            vendor: cfg.vendor,
            devices,
            shared_files: cfg.shared_files,
        })
    }

    #[inline]
    pub fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    fn visible_devices_var(&self) -> Option<&'static str> {
        match self.vendor {
            GpuVendor::Nvidia => Some("NVIDIA_VISIBLE_DEVICES"),
            GpuVendor::Radeon => Some("ROCR_VISIBLE_DEVICES"),
            GpuVendor::Remote | GpuVendor::Fake => None,
        }
    }
}

impl GpuTuner for StaticGpuTuner {
    fn devices(&self) -> Vec<GpuDevice> {
        self.devices.values().cloned().collect()
    }

    fn tune(&self, host: &mut HostConfig, ids: &[GpuId]) -> Result<(), CoreError> {
        let mut files: Vec<&str> = Vec::new();
        for id in ids {
            let device = self
                .devices
                .get(id)
                .ok_or_else(|| PluginError::UnknownDevice(id.to_string()))?;
            files.extend(device.device_files.iter().map(String::as_str));
        }
        if !ids.is_empty() {
            files.extend(self.shared_files.iter().map(String::as_str));
        }

        for file in files {
            if !host.devices.iter().any(|d| d.path_on_host == file) {
                host.devices.push(DeviceMapping::passthrough(file));
            }
        }

        if let Some(var) = self.visible_devices_var() {
            let visible: Vec<&str> = ids.iter().map(GpuId::as_str).collect();
            host.env.push(format!("{var}={}", visible.join(",")));
        }

        debug!(target: "kiln.plugin.gpu", vendor = %self.vendor, count = ids.len(), "GPU devices mapped");
        Ok(())
    }
}
