//! Seam between the orchestrator and the container engine.
//!
//! Everything the overseer and the tuners need from the engine goes through
//! [`ContainerRuntime`]; an adapter for a concrete engine lives outside this crate.
mod types;
pub use types::*;

use async_trait::async_trait;
use kiln_model::ContainerMetrics;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::RuntimeError;

/// Byte stream produced or consumed by the engine (logs, image archives).
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Bidirectional stream attached to an exec session.
pub trait ExecIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ExecIo for T {}

pub type ExecSession = Box<dyn ExecIo>;

/// Lifecycle events in arrival order; an `Err` item ends the subscription.
pub type EventStream = mpsc::Receiver<Result<RuntimeEvent, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn image_list(&self) -> Result<Vec<ImageSummary>, RuntimeError>;

    async fn image_pull(&self, reference: &str, auth: Option<&str>) -> Result<(), RuntimeError>;

    /// Imports an image archive, returning the id of the loaded image.
    async fn image_load(&self, archive: ByteStream) -> Result<String, RuntimeError>;

    async fn image_save(&self, image: &str) -> Result<(ImageInspect, ByteStream), RuntimeError>;

    async fn image_tag(&self, image: &str, reference: &str) -> Result<(), RuntimeError>;

    async fn image_push(&self, reference: &str, auth: Option<&str>) -> Result<(), RuntimeError>;

    async fn image_remove(&self, image: &str) -> Result<(), RuntimeError>;

    async fn container_create(&self, spec: &ContainerCreate) -> Result<CreateResponse, RuntimeError>;

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn container_inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    async fn container_kill(&self, id: &str, signal: &str) -> Result<(), RuntimeError>;

    async fn container_remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Snapshots the container filesystem into a new image, returning its id.
    async fn container_commit(&self, id: &str) -> Result<String, RuntimeError>;

    async fn container_stats(&self, id: &str) -> Result<ContainerMetrics, RuntimeError>;

    async fn container_logs(&self, id: &str, opts: &LogsOptions) -> Result<ByteStream, RuntimeError>;

    async fn container_exec(&self, id: &str, cfg: &ExecConfig) -> Result<ExecSession, RuntimeError>;

    /// Creates a network, returning its engine id.
    async fn network_create(&self, spec: &NetworkCreate) -> Result<String, RuntimeError>;

    async fn network_remove(&self, id: &str) -> Result<(), RuntimeError>;

    async fn events(&self, filter: &EventFilter) -> Result<EventStream, RuntimeError>;
}

/// Whether the container is alive; a container the engine no longer knows is not.
pub(crate) async fn is_running(runtime: &dyn ContainerRuntime, id: &str) -> Result<bool, RuntimeError> {
    match runtime.container_inspect(id).await {
        Ok(state) => Ok(state.running),
        Err(RuntimeError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
