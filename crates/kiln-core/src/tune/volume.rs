use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_model::{Mount, TaskDescriptor, VolumeDriverKind, VolumeSpec};
use tracing::{debug, instrument};

use super::{Tune, VolumeDriver, rollback};
use crate::cleanup::{Cleanup, NestedCleanup};
use crate::error::{ConfigError, CoreError, MultiError};
use crate::runtime::{HostConfig, NetworkingConfig};

/// Removes one per-task volume through the driver that created it.
pub struct VolumeCleanup {
    driver: Arc<dyn VolumeDriver>,
    name: String,
}

impl VolumeCleanup {
    pub fn new(driver: Arc<dyn VolumeDriver>, name: impl Into<String>) -> Self {
        Self {
            driver,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Cleanup for VolumeCleanup {
    async fn close(&self) -> Result<(), CoreError> {
        debug!(target: "kiln.tune", volume = %self.name, "removing volume");
        self.driver.remove_volume(&self.name).await
    }
}

/// Per-task volume name: `<task id>/<volume name>`.
pub(crate) fn volume_id(descriptor: &TaskDescriptor, name: &str) -> String {
    format!("{}/{}", descriptor.task_id(), name)
}

struct Planned<'a> {
    name: &'a str,
    spec: &'a VolumeSpec,
    driver: Arc<dyn VolumeDriver>,
    mounts: Vec<&'a Mount>,
}

/// Volume stage: creates every mounted volume and wires its mounts.
#[derive(Default, Clone)]
pub struct VolumeTuning {
    drivers: BTreeMap<VolumeDriverKind, Arc<dyn VolumeDriver>>,
}

impl VolumeTuning {
    pub(crate) fn new(drivers: BTreeMap<VolumeDriverKind, Arc<dyn VolumeDriver>>) -> Self {
        Self { drivers }
    }

    pub(crate) fn driver(&self, name: &str) -> Result<Arc<dyn VolumeDriver>, CoreError> {
        name.parse::<VolumeDriverKind>()
            .ok()
            .and_then(|kind| self.drivers.get(&kind).cloned())
            .ok_or_else(|| ConfigError::UnsupportedVolumeDriver(name.to_string()).into())
    }

    /// Volumes with at least one mount, with their driver resolved.
    ///
    /// Volumes nobody mounts are skipped; a mount naming no volume is rejected.
    fn plan<'a>(&self, descriptor: &'a TaskDescriptor) -> Result<Vec<Planned<'a>>, CoreError> {
        if let Some(mount) = descriptor
            .all_mounts()
            .iter()
            .find(|m| !descriptor.volumes().contains_key(&m.source))
        {
            return Err(ConfigError::UndeclaredVolume {
                volume: mount.source.clone(),
                target: mount.target.clone(),
            }
            .into());
        }

        let mut plan = Vec::new();
        for (name, spec) in descriptor.volumes() {
            let mounts: Vec<&Mount> = descriptor.mounts(name).collect();
            if mounts.is_empty() {
                continue;
            }
            plan.push(Planned {
                name,
                spec,
                driver: self.driver(&spec.driver)?,
                mounts,
            });
        }
        Ok(plan)
    }

    pub(crate) async fn close(&self) -> Result<(), CoreError> {
        let mut errs = MultiError::new();
        for driver in self.drivers.values() {
            errs.push_result(driver.close().await);
        }
        errs.into_result()
    }

    /// Cleanup for the volumes a previously started container would own.
    pub(crate) fn cleanup_for(&self, descriptor: &TaskDescriptor) -> Result<NestedCleanup, CoreError> {
        let cleanup = NestedCleanup::new();
        for planned in self.plan(descriptor)? {
            let id = volume_id(descriptor, planned.name);
            cleanup.add(Box::new(VolumeCleanup::new(planned.driver, id)));
        }
        Ok(cleanup)
    }
}

#[async_trait]
impl Tune for VolumeTuning {
    #[instrument(level = "debug", target = "kiln.tune", skip_all, fields(task = %descriptor.task_id()))]
    async fn tune(
        &self,
        descriptor: &TaskDescriptor,
        host: &mut HostConfig,
        _net: &mut NetworkingConfig,
    ) -> Result<Box<dyn Cleanup>, CoreError> {
        let plan = self.plan(descriptor)?;
        let cleanup = NestedCleanup::new();

        for planned in plan {
            let id = volume_id(descriptor, planned.name);
            debug!(target: "kiln.tune", volume = %id, driver = %planned.spec.driver, "creating volume");

            let volume = match planned.driver.create_volume(&id, &planned.spec.settings).await {
                Ok(v) => v,
                Err(e) => {
                    rollback("volume", &cleanup).await;
                    return Err(e);
                }
            };
            cleanup.add(Box::new(VolumeCleanup::new(planned.driver.clone(), id.clone())));

            for mount in planned.mounts {
                let mount = Mount::new(id.clone(), mount.target.clone(), mount.mode);
                if let Err(e) = volume.configure(&mount, host) {
                    rollback("volume", &cleanup).await;
                    return Err(e);
                }
            }
        }

        Ok(Box::new(cleanup))
    }
}
