use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_model::{GpuDevice, GpuVendor, NetworkKind, TaskDescriptor, VolumeDriverKind};
use tracing::{info, instrument};

use super::{
    GpuTuner, GpuTuning, NetworkTuner, NetworkTuning, Tune, VolumeDriver, VolumeTuning, rollback,
};
use crate::cleanup::NestedCleanup;
use crate::error::{CoreError, MultiError};
use crate::runtime::{HostConfig, NetworkingConfig};

/// Registry of the capability backends configured on this node.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct Repository {
    gpu: GpuTuning,
    volumes: VolumeTuning,
    networks: NetworkTuning,
}

impl Repository {
    #[inline]
    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::default()
    }

    /// Runs the GPU, volume and network stages in order.
    ///
    /// On success the returned cleanup releases everything acquired, newest first.
    /// On failure whatever earlier stages acquired has already been released and
    /// the stage's own error is returned.
    #[instrument(level = "debug", target = "kiln.tune", skip_all, fields(task = %descriptor.task_id()))]
    pub async fn tune(
        &self,
        descriptor: &TaskDescriptor,
        host: &mut HostConfig,
        net: &mut NetworkingConfig,
    ) -> Result<NestedCleanup, CoreError> {
        info!(target: "kiln.tune", "tuning container");

        let cleanup = NestedCleanup::new();
        let stages: [(&str, &dyn Tune); 3] = [
            ("gpu", &self.gpu),
            ("volume", &self.volumes),
            ("network", &self.networks),
        ];

        for (stage, tuner) in stages {
            match tuner.tune(descriptor, host, net).await {
                Ok(c) => cleanup.add(c),
                Err(e) => {
                    rollback(stage, &cleanup).await;
                    return Err(e);
                }
            }
        }
        Ok(cleanup)
    }

    /// Reconstructs the cleanup for a container started by an earlier process.
    ///
    /// Acquires nothing: only the removal side of each volume and network is built.
    pub async fn cleanup_for(&self, descriptor: &TaskDescriptor) -> Result<NestedCleanup, CoreError> {
        let cleanup = NestedCleanup::new();
        cleanup.add(Box::new(self.volumes.cleanup_for(descriptor)?));
        cleanup.add(Box::new(self.networks.cleanup_for(descriptor).await?));
        Ok(cleanup)
    }

    /// Every GPU across all configured vendors, sorted by id.
    pub fn gpu_devices(&self) -> Vec<GpuDevice> {
        self.gpu.devices()
    }

    #[inline]
    pub fn has_gpu(&self) -> bool {
        self.gpu.is_enabled()
    }

    /// Closes every backend, reporting all failures.
    pub async fn close(&self) -> Result<(), CoreError> {
        let mut errs = MultiError::new();
        errs.push_result(self.gpu.close());
        errs.push_result(self.volumes.close().await);
        errs.into_result()
    }
}

#[derive(Default)]
pub struct RepositoryBuilder {
    gpu: BTreeMap<GpuVendor, Arc<dyn GpuTuner>>,
    volumes: BTreeMap<VolumeDriverKind, Arc<dyn VolumeDriver>>,
    networks: BTreeMap<NetworkKind, Arc<dyn NetworkTuner>>,
}

impl RepositoryBuilder {
    pub fn gpu(mut self, vendor: GpuVendor, tuner: Arc<dyn GpuTuner>) -> Self {
        self.gpu.insert(vendor, tuner);
        self
    }

    pub fn volume(mut self, kind: VolumeDriverKind, driver: Arc<dyn VolumeDriver>) -> Self {
        self.volumes.insert(kind, driver);
        self
    }

    pub fn network(mut self, kind: NetworkKind, tuner: Arc<dyn NetworkTuner>) -> Self {
        self.networks.insert(kind, tuner);
        self
    }

    pub fn build(self) -> Repository {
        Repository {
            gpu: GpuTuning::new(self.gpu),
            volumes: VolumeTuning::new(self.volumes),
            networks: NetworkTuning::new(self.networks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::Cleanup;
    use crate::error::ConfigError;
    use crate::testing::{FakeGpuTuner, FakeNetworkTuner, FakeVolumeDriver, Journal};
    use kiln_model::{Mount, MountMode, NetworkSpec, VolumeSpec};

    fn repository(journal: &Journal, failing_net: bool) -> Repository {
        let net = if failing_net {
            FakeNetworkTuner::failing(journal)
        } else {
            FakeNetworkTuner::new(journal)
        };
        Repository::builder()
            .gpu(GpuVendor::Fake, Arc::new(FakeGpuTuner::new(&["gpu-1", "gpu-0"])))
            .volume(VolumeDriverKind::Bind, Arc::new(FakeVolumeDriver::new(journal)))
            .network(NetworkKind::Tinc, Arc::new(net))
            .build()
    }

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor::builder("task-1", "app:1")
            .gpu("gpu-0")
            .volume("data", VolumeSpec::new("bind"))
            .volume("unused", VolumeSpec::new("bind"))
            .mount(Mount::new("data", "/mnt/data", MountMode::ReadWrite))
            .mount(Mount::new("data", "/mnt/ro", MountMode::ReadOnly))
            .network(NetworkSpec::new("tinc", "net-1"))
            .build()
    }

    #[tokio::test]
    async fn tunes_all_stages_and_cleans_up_in_reverse() {
        let journal = Journal::new();
        let repo = repository(&journal, false);
        let mut host = HostConfig::default();
        let mut net = NetworkingConfig::default();

        let cleanup = repo.tune(&descriptor(), &mut host, &mut net).await.unwrap();

        assert_eq!(host.devices.len(), 1);
        assert_eq!(host.devices[0].path_on_host, "/dev/fake/gpu-0");
        assert_eq!(host.mounts.len(), 2);
        assert!(host.mounts.iter().all(|m| m.source == "task-1/data"));
        assert!(net.endpoints.contains_key("net-1"));
        assert_eq!(journal.entries(), vec!["volume.create:task-1/data", "network.tune:net-1"]);

        cleanup.close().await.unwrap();
        assert_eq!(
            journal.entries()[2..],
            ["network.remove:net-1", "volume.remove:task-1/data"]
        );
    }

    #[tokio::test]
    async fn network_failure_releases_volumes_and_keeps_its_error() {
        let journal = Journal::new();
        let repo = repository(&journal, true);
        let mut host = HostConfig::default();
        let mut net = NetworkingConfig::default();

        let err = repo.tune(&descriptor(), &mut host, &mut net).await.unwrap_err();

        assert!(matches!(err, CoreError::Unavailable(ref msg) if msg == "net-1 is down"));
        assert_eq!(
            journal.entries(),
            vec!["volume.create:task-1/data", "network.tune:net-1", "volume.remove:task-1/data"]
        );
    }

    #[tokio::test]
    async fn gpu_request_without_gpu_backend_is_config_error() {
        let journal = Journal::new();
        let repo = Repository::builder()
            .volume(VolumeDriverKind::Bind, Arc::new(FakeVolumeDriver::new(&journal)))
            .build();
        let mut host = HostConfig::default();
        let mut net = NetworkingConfig::default();

        let err = repo.tune(&descriptor(), &mut host, &mut net).await.unwrap_err();

        assert!(matches!(err, CoreError::Config(ConfigError::GpuUnsupported)));
        assert!(journal.entries().is_empty());
        assert_eq!(host, HostConfig::default());
    }

    #[tokio::test]
    async fn unknown_gpu_id_is_unavailable() {
        let journal = Journal::new();
        let repo = repository(&journal, false);
        let d = TaskDescriptor::builder("t", "app:1").gpu("gpu-9").build();

        let err = repo
            .tune(&d, &mut HostConfig::default(), &mut NetworkingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unknown_volume_driver_is_config_error() {
        let journal = Journal::new();
        let repo = repository(&journal, false);
        let d = TaskDescriptor::builder("t", "app:1")
            .volume("data", VolumeSpec::new("nfs"))
            .mount(Mount::new("data", "/mnt", MountMode::ReadWrite))
            .build();

        let err = repo
            .tune(&d, &mut HostConfig::default(), &mut NetworkingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(ConfigError::UnsupportedVolumeDriver(ref n)) if n == "nfs"));
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn mount_of_undeclared_volume_is_rejected() {
        let journal = Journal::new();
        let repo = repository(&journal, false);
        let d = TaskDescriptor::builder("t", "app:1")
            .mount(Mount::new("ghost", "/mnt", MountMode::ReadWrite))
            .build();

        let err = repo
            .tune(&d, &mut HostConfig::default(), &mut NetworkingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Config(ConfigError::UndeclaredVolume { ref volume, .. }) if volume == "ghost"
        ));
    }

    #[tokio::test]
    async fn cleanup_for_acquires_nothing() {
        let journal = Journal::new();
        let repo = repository(&journal, false);

        let cleanup = repo.cleanup_for(&descriptor()).await.unwrap();
        assert!(journal.entries().is_empty());

        cleanup.close().await.unwrap();
        assert_eq!(
            journal.entries(),
            vec!["network.remove:net-1", "volume.remove:task-1/data"]
        );
    }

    #[test]
    fn gpu_devices_are_sorted() {
        let journal = Journal::new();
        let repo = repository(&journal, false);
        let ids: Vec<String> = repo.gpu_devices().iter().map(|d| d.id.to_string()).collect();
        assert_eq!(ids, vec!["gpu-0", "gpu-1"]);
        assert!(repo.has_gpu());
        assert!(!Repository::default().has_gpu());
    }
}
