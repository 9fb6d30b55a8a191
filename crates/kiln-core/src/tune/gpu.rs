use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_model::{GpuDevice, GpuId, GpuVendor, TaskDescriptor};
use tracing::debug;

use super::{GpuTuner, Tune};
use crate::cleanup::{Cleanup, NoopCleanup};
use crate::error::{ConfigError, CoreError, MultiError};
use crate::runtime::{HostConfig, NetworkingConfig};

/// GPU stage: routes each requested device to the backend that owns it.
#[derive(Default, Clone)]
pub struct GpuTuning {
    tuners: BTreeMap<GpuVendor, Arc<dyn GpuTuner>>,
}

impl GpuTuning {
    pub(crate) fn new(tuners: BTreeMap<GpuVendor, Arc<dyn GpuTuner>>) -> Self {
        Self { tuners }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tuners.is_empty()
    }

    /// Every device across all backends, sorted by id.
    pub fn devices(&self) -> Vec<GpuDevice> {
        let mut devices: Vec<GpuDevice> = self.tuners.values().flat_map(|t| t.devices()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub(crate) fn close(&self) -> Result<(), CoreError> {
        let mut errs = MultiError::new();
        for tuner in self.tuners.values() {
            errs.push_result(tuner.close());
        }
        errs.into_result()
    }

    fn plan(&self, ids: &[GpuId]) -> Result<Vec<(&Arc<dyn GpuTuner>, Vec<GpuId>)>, CoreError> {
        let mut plan: BTreeMap<GpuVendor, Vec<GpuId>> = BTreeMap::new();
        for id in ids {
            let owner = self
                .tuners
                .iter()
                .find(|(_, tuner)| tuner.devices().iter().any(|d| &d.id == id))
                .map(|(vendor, _)| *vendor)
                .ok_or_else(|| CoreError::Unavailable(format!("GPU {id} is not available")))?;
            plan.entry(owner).or_default().push(id.clone());
        }

        Ok(plan
            .into_iter()
            .filter_map(|(vendor, ids)| self.tuners.get(&vendor).map(|t| (t, ids)))
            .collect())
    }
}

#[async_trait]
impl Tune for GpuTuning {
    async fn tune(
        &self,
        descriptor: &TaskDescriptor,
        host: &mut HostConfig,
        _net: &mut NetworkingConfig,
    ) -> Result<Box<dyn Cleanup>, CoreError> {
        if !descriptor.is_gpu_required() {
            return Ok(Box::new(NoopCleanup));
        }
        if !self.is_enabled() {
            return Err(ConfigError::GpuUnsupported.into());
        }

        let plan = self.plan(descriptor.gpu_device_ids())?;

        // Backends write into a staged copy so a failing backend leaves `host` untouched.
        let mut staged = host.clone();
        for (tuner, ids) in plan {
            tuner.tune(&mut staged, &ids)?;
        }
        *host = staged;

        debug!(target: "kiln.tune", devices = descriptor.gpu_device_ids().len(), "GPU devices attached");
        Ok(Box::new(NoopCleanup))
    }
}
