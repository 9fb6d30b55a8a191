//! Capability tuning.
//!
//! Before a container is created its host and network configuration pass through
//! three stages in a fixed order: GPU, volumes, networks. Each stage either applies all
//! of its changes and returns a [`Cleanup`] for what it acquired, or fails having
//! released everything it acquired itself.
mod gpu;
pub use gpu::GpuTuning;

mod volume;
pub use volume::{VolumeCleanup, VolumeTuning};

mod network;
pub use network::NetworkTuning;

mod repository;
pub use repository::{Repository, RepositoryBuilder};

use std::collections::BTreeMap;

use async_trait::async_trait;
use kiln_model::{GpuDevice, GpuId, Mount, NetworkSpec, TaskDescriptor};
use tracing::warn;

use crate::cleanup::Cleanup;
use crate::error::CoreError;
use crate::runtime::{HostConfig, NetworkingConfig};

/// One stage of the tuning pipeline.
#[async_trait]
pub trait Tune: Send + Sync {
    async fn tune(
        &self,
        descriptor: &TaskDescriptor,
        host: &mut HostConfig,
        net: &mut NetworkingConfig,
    ) -> Result<Box<dyn Cleanup>, CoreError>;
}

/// Vendor-specific GPU backend.
pub trait GpuTuner: Send + Sync {
    /// Devices this backend can hand out.
    fn devices(&self) -> Vec<GpuDevice>;

    /// Exposes the given devices to the container.
    fn tune(&self, host: &mut HostConfig, ids: &[GpuId]) -> Result<(), CoreError>;

    fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Storage backend creating per-task volumes.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn create_volume(
        &self,
        name: &str,
        settings: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Volume>, CoreError>;

    async fn remove_volume(&self, name: &str) -> Result<(), CoreError>;

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// A created volume, able to describe its mounts to the engine.
pub trait Volume: Send + Sync {
    fn configure(&self, mount: &Mount, host: &mut HostConfig) -> Result<(), CoreError>;
}

/// Network backend attaching containers to overlay or bridge networks.
#[async_trait]
pub trait NetworkTuner: Send + Sync {
    async fn tune(
        &self,
        spec: &NetworkSpec,
        host: &mut HostConfig,
        net: &mut NetworkingConfig,
    ) -> Result<Box<dyn Cleanup>, CoreError>;

    /// Cleanup for a network created earlier, possibly by a previous process.
    async fn cleaner(&self, net_id: &str) -> Result<Box<dyn Cleanup>, CoreError>;
}

/// Closes a stage's partial acquisitions after a failure; the failure itself wins.
pub(crate) async fn rollback(stage: &str, cleanup: &dyn Cleanup) {
    if let Err(e) = cleanup.close().await {
        warn!(target: "kiln.tune", stage, error = %e, "failed to roll back partial tuning");
    }
}
