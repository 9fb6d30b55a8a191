//! Node-local container orchestration.
//!
//! The [`Overseer`] pulls images, tunes capabilities, creates and starts containers and
//! tracks each of them until a terminal status is delivered. Two background tasks
//! run for its whole lifetime: the runtime event watcher and the usage collector.
mod handle;
pub use handle::ContainerHandle;
pub(crate) use handle::commit_reference;

mod stats;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kiln_model::{ContainerId, ContainerMetrics, TaskDescriptor, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cleanup::Cleanup;
use crate::config::OverseerConfig;
use crate::error::{CoreError, MultiError};
use crate::runtime::{
    ByteStream, ContainerConfig, ContainerCreate, ContainerRuntime, ExecConfig, ExecSession,
    HostConfig, ImageInspect, LogConfig, LogsOptions, NetworkingConfig, is_running,
};
use crate::state::{ContainerRegistry, StatusReceiver};
use crate::tune::Repository;
use crate::watch::EventWatcher;

pub struct Overseer {
    runtime: Arc<dyn ContainerRuntime>,
    plugins: Arc<Repository>,
    registry: ContainerRegistry,
    config: OverseerConfig,
    token: CancellationToken,
}

impl Overseer {
    /// Validates `config` and starts the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        plugins: Arc<Repository>,
        config: OverseerConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let token = CancellationToken::new();
        let registry = ContainerRegistry::new();

        let watcher = EventWatcher::new(
            runtime.clone(),
            registry.clone(),
            config.label.clone(),
            config.events_backoff.policy(),
        );
        tokio::spawn(watcher.run(token.child_token()));
        tokio::spawn(stats::collect(
            runtime.clone(),
            registry.clone(),
            config.stats_interval(),
            token.child_token(),
        ));

        info!(target: "kiln.overseer", label = %config.label, "overseer is ready");
        Ok(Self {
            runtime,
            plugins,
            registry,
            config,
            token,
        })
    }

    /// Makes the task image available locally, pulling it when absent.
    #[instrument(level = "info", target = "kiln.overseer", skip_all, fields(image = %descriptor.image()))]
    pub async fn spool(&self, descriptor: &TaskDescriptor) -> Result<(), CoreError> {
        let images = self.runtime.image_list().await?;
        if images.iter().any(|i| i.matches(descriptor.image())) {
            info!(target: "kiln.overseer", "image already exists");
            return Ok(());
        }

        info!(target: "kiln.overseer", "pulling image");
        self.runtime
            .image_pull(descriptor.image(), descriptor.auth())
            .await?;
        Ok(())
    }

    /// Tunes, creates and starts a container for `descriptor`.
    ///
    /// Any failure leaves nothing behind: tuned resources are released and a created
    /// container is removed before the error is returned.
    #[instrument(level = "info", target = "kiln.overseer", skip_all, fields(task = %descriptor.task_id()))]
    pub async fn start(
        &self,
        descriptor: TaskDescriptor,
    ) -> Result<(StatusReceiver, Arc<ContainerHandle>), CoreError> {
        let descriptor = Arc::new(descriptor);
        let mut create = self.container_spec(&descriptor);

        let cleanup = self
            .plugins
            .tune(&descriptor, &mut create.host, &mut create.networking)
            .await?;
        create.config.env.append(&mut create.host.env);

        let created = match self.runtime.container_create(&create).await {
            Ok(created) => created,
            Err(e) => {
                let mut rollback = MultiError::new();
                rollback.push_result(cleanup.close().await);
                return Err(CoreError::partial_setup(e.into(), rollback));
            }
        };
        for warning in &created.warnings {
            warn!(target: "kiln.overseer", container = %created.id, "{warning}");
        }

        // Tracked before start so that an immediate death is not mistaken for an orphan.
        let handle = Arc::new(ContainerHandle::new(
            created.id.clone(),
            descriptor.clone(),
            self.runtime.clone(),
            Box::new(cleanup),
            commit_reference(&self.config.commit_repository, &descriptor),
        ));
        let status = match self.registry.insert(handle.clone(), TaskStatus::Spawning) {
            Ok(status) => status,
            Err(e) => {
                let mut rollback = MultiError::new();
                rollback.push_result(self.runtime.container_remove(&created.id).await);
                rollback.push_result(handle.cleanup().await);
                return Err(CoreError::partial_setup(e, rollback));
            }
        };

        if let Err(e) = self.runtime.container_start(&created.id).await {
            let mut rollback = MultiError::new();
            self.registry.take(&created.id, TaskStatus::Broken);
            rollback.push_result(self.runtime.container_remove(&created.id).await);
            rollback.push_result(handle.cleanup().await);
            return Err(CoreError::partial_setup(e.into(), rollback));
        }

        self.registry.set_status(&created.id, TaskStatus::Running);
        info!(target: "kiln.overseer", container = %created.id, "container started");
        Ok((status, handle))
    }

    /// Resumes supervision of a container started before this process.
    ///
    /// The cleanup is rebuilt from `descriptor` without acquiring anything.
    #[instrument(level = "info", target = "kiln.overseer", skip(self, descriptor), fields(task = %descriptor.task_id()))]
    pub async fn attach(
        &self,
        id: &str,
        descriptor: TaskDescriptor,
    ) -> Result<(StatusReceiver, Arc<ContainerHandle>), CoreError> {
        if self.registry.contains(id) || self.registry.is_retiring(id) {
            return Err(CoreError::AlreadyTracked(id.to_string()));
        }
        if !is_running(self.runtime.as_ref(), id).await? {
            return Err(CoreError::UnknownContainer(id.to_string()));
        }

        let descriptor = Arc::new(descriptor);
        let cleanup = self.plugins.cleanup_for(&descriptor).await?;
        let handle = Arc::new(ContainerHandle::new(
            id.to_string(),
            descriptor.clone(),
            self.runtime.clone(),
            Box::new(cleanup),
            commit_reference(&self.config.commit_repository, &descriptor),
        ));
        let status = self.registry.insert(handle.clone(), TaskStatus::Running)?;

        info!(target: "kiln.overseer", "attached to running container");
        Ok((status, handle))
    }

    /// Requests termination: delivers `Finished` if nobody has delivered a status yet,
    /// then kills the container.
    #[instrument(level = "info", target = "kiln.overseer", skip(self))]
    pub async fn stop(&self, id: &str) -> Result<(), CoreError> {
        let Some(handle) = self.registry.get(id) else {
            return Err(CoreError::UnknownContainer(id.to_string()));
        };

        if !self.registry.finish(id, TaskStatus::Finished) {
            debug!(target: "kiln.overseer", "terminal status already delivered");
        }
        handle.kill().await
    }

    /// Tears down a container whose deal has ended.
    ///
    /// Every step is attempted even when an earlier one fails: kill if still running,
    /// upload if requested, release tuned resources, remove the container.
    ///
    /// The id stays marked as retiring until removal, so the death caused by the kill
    /// here is left to this teardown instead of being handled as an orphan.
    #[instrument(level = "info", target = "kiln.overseer", skip(self))]
    pub async fn on_deal_finish(&self, id: &str) -> Result<(), CoreError> {
        let Some(handle) = self.registry.retire(id, TaskStatus::Finished) else {
            return Err(CoreError::UnknownContainer(id.to_string()));
        };

        let mut errs = MultiError::new();

        let running = is_running(self.runtime.as_ref(), handle.id())
            .await
            .unwrap_or_else(|e| {
                warn!(target: "kiln.overseer", error = %e, "failed to inspect container, killing anyway");
                true
            });
        if running {
            errs.push_result(handle.kill().await);
        }
        if handle.descriptor().commit_on_stop() {
            errs.push_result(handle.upload().await);
        }
        errs.push_result(handle.cleanup().await);
        errs.push_result(handle.remove().await);
        self.registry.forget(id);

        errs.into_result()
    }

    /// Latest usage snapshot of every sampled container.
    pub fn info(&self) -> HashMap<ContainerId, ContainerMetrics> {
        self.registry.metrics()
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.registry.status(id)
    }

    pub async fn logs(&self, id: &str, opts: &LogsOptions) -> Result<ByteStream, CoreError> {
        Ok(self.runtime.container_logs(id, opts).await?)
    }

    /// Runs a command inside a tracked container.
    pub async fn exec(&self, id: &str, cfg: &ExecConfig) -> Result<ExecSession, CoreError> {
        if !self.registry.contains(id) {
            return Err(CoreError::UnknownContainer(id.to_string()));
        }
        Ok(self.runtime.container_exec(id, cfg).await?)
    }

    /// Imports an image archive, returning the loaded image id.
    pub async fn load(&self, archive: ByteStream) -> Result<String, CoreError> {
        Ok(self.runtime.image_load(archive).await?)
    }

    pub async fn save(&self, image: &str) -> Result<(ImageInspect, ByteStream), CoreError> {
        Ok(self.runtime.image_save(image).await?)
    }

    /// Capability backends configured on this node.
    pub fn plugins(&self) -> &Repository {
        &self.plugins
    }

    /// Stops the background tasks and closes the capability backends.
    /// Containers keep running.
    pub async fn close(&self) -> Result<(), CoreError> {
        info!(target: "kiln.overseer", "closing overseer");
        self.token.cancel();
        self.plugins.close().await
    }

    fn container_spec(&self, descriptor: &TaskDescriptor) -> ContainerCreate {
        let mut labels = BTreeMap::new();
        labels.insert(self.config.label.clone(), String::new());
        labels.insert(self.config.task_label.clone(), descriptor.task_id().to_string());

        let mut log_options = BTreeMap::new();
        log_options.insert("max-size".to_string(), self.config.log_max_size.clone());

        ContainerCreate {
            config: ContainerConfig {
                image: descriptor.image().to_string(),
                cmd: descriptor.command().to_vec(),
                env: descriptor.env().to_vars(),
                labels,
                exposed_ports: descriptor.expose().to_vec(),
            },
            host: HostConfig {
                resources: *descriptor.resources(),
                cgroup_parent: descriptor.cgroup_parent().to_string(),
                auto_remove: descriptor.auto_remove(),
                publish_all_ports: true,
                log_config: LogConfig {
                    driver: "json-file".to_string(),
                    options: log_options,
                },
                ..HostConfig::default()
            },
            networking: NetworkingConfig::default(),
        }
    }
}

impl Drop for Overseer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
