use std::sync::Arc;

use kiln_model::{ContainerId, TaskDescriptor, Timestamp};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cleanup::Cleanup;
use crate::error::{CoreError, MultiError};
use crate::runtime::ContainerRuntime;

/// Signal used to stop containers.
pub(crate) const KILL_SIGNAL: &str = "SIGKILL";

#[derive(Debug, Default)]
struct UploadState {
    /// Image the container was committed to, once committed.
    image: Option<String>,
    pushed: bool,
}

/// A container under supervision.
///
/// Owns the cleanup of everything tuned for the container and knows how to commit,
/// push and remove it. Shared between the registry and whichever path ends up
/// tearing the container down.
pub struct ContainerHandle {
    id: ContainerId,
    descriptor: Arc<TaskDescriptor>,
    runtime: Arc<dyn ContainerRuntime>,
    cleanup: Box<dyn Cleanup>,
    commit_reference: String,
    started_at: Timestamp,
    upload: Mutex<UploadState>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .field("commit_reference", &self.commit_reference)
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    pub(crate) fn new(
        id: ContainerId,
        descriptor: Arc<TaskDescriptor>,
        runtime: Arc<dyn ContainerRuntime>,
        cleanup: Box<dyn Cleanup>,
        commit_reference: String,
    ) -> Self {
        Self {
            id,
            descriptor,
            runtime,
            cleanup,
            commit_reference,
            started_at: Timestamp::now(),
            upload: Mutex::new(UploadState::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Reference the container is pushed to on upload.
    #[inline]
    pub fn commit_reference(&self) -> &str {
        &self.commit_reference
    }

    pub(crate) async fn kill(&self) -> Result<(), CoreError> {
        debug!(target: "kiln.overseer", container = %self.id, "killing container");
        Ok(self.runtime.container_kill(&self.id, KILL_SIGNAL).await?)
    }

    /// Commits the container filesystem and pushes it, at most once per container.
    ///
    /// A failed push may be retried; the commit is reused.
    pub(crate) async fn upload(&self) -> Result<(), CoreError> {
        let mut state = self.upload.lock().await;
        if state.pushed {
            debug!(target: "kiln.overseer", container = %self.id, "container already uploaded");
            return Ok(());
        }

        let image = match &state.image {
            Some(image) => image.clone(),
            None => {
                let image = self.runtime.container_commit(&self.id).await?;
                state.image = Some(image.clone());
                image
            }
        };

        self.runtime.image_tag(&image, &self.commit_reference).await?;
        self.runtime
            .image_push(&self.commit_reference, self.descriptor.auth())
            .await?;
        state.pushed = true;

        info!(target: "kiln.overseer", container = %self.id, reference = %self.commit_reference, "container uploaded");
        Ok(())
    }

    pub(crate) async fn cleanup(&self) -> Result<(), CoreError> {
        self.cleanup.close().await
    }

    /// Removes the container and the image it was committed to, if any.
    pub(crate) async fn remove(&self) -> Result<(), CoreError> {
        let mut errs = MultiError::new();
        errs.push_result(self.runtime.container_remove(&self.id).await);

        let committed = self.upload.lock().await.image.take();
        if let Some(image) = committed {
            errs.push_result(self.runtime.image_remove(&image).await);
        }
        errs.into_result()
    }
}

/// Reference committed containers are pushed to: `<repository>:<group>_<task id>`.
///
/// Without an explicit `repository` the repository of the task image is used; without
/// a cgroup parent the tag is just the task id.
pub(crate) fn commit_reference(repository: &str, descriptor: &TaskDescriptor) -> String {
    let repository = if repository.is_empty() {
        image_repository(descriptor.image())
    } else {
        repository
    };

    let tag = match descriptor.cgroup_parent() {
        "" => descriptor.task_id().to_string(),
        group => format!("{}_{}", group, descriptor.task_id()),
    };
    format!("{repository}:{}", sanitize_tag(&tag))
}

/// Strips digest and tag from an image reference.
fn image_repository(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    match image.rfind(':') {
        Some(i) if !image[i..].contains('/') => &image[..i],
        _ => image,
    }
}

fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '_' })
        .take(128)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRuntime, handle_for};

    #[test]
    fn repository_strips_tag_and_digest() {
        assert_eq!(image_repository("registry:5000/app:1.0"), "registry:5000/app");
        assert_eq!(image_repository("registry:5000/app"), "registry:5000/app");
        assert_eq!(image_repository("app@sha256:abc"), "app");
        assert_eq!(image_repository("app"), "app");
    }

    #[test]
    fn commit_reference_uses_group_and_task() {
        let d = TaskDescriptor::builder("task-1", "registry/app:1.0")
            .cgroup_parent("deal/42")
            .build();
        assert_eq!(commit_reference("", &d), "registry/app:deal_42_task-1");
        assert_eq!(commit_reference("backup/store", &d), "backup/store:deal_42_task-1");

        let d = TaskDescriptor::builder("task-1", "app").build();
        assert_eq!(commit_reference("", &d), "app:task-1");
    }

    #[tokio::test]
    async fn upload_commits_and_pushes_once() {
        let runtime = FakeRuntime::new();
        let d = TaskDescriptor::builder("t1", "app:1").commit_on_stop(true).build();
        let handle = handle_for(&runtime, "c1", d);

        handle.upload().await.unwrap();
        handle.upload().await.unwrap();

        assert_eq!(
            runtime.calls(),
            vec!["commit:c1", "tag:image-c1:app:t1", "push:app:t1"]
        );
    }

    #[tokio::test]
    async fn failed_push_reuses_commit_on_retry() {
        let runtime = FakeRuntime::new();
        runtime.fail_once("push");
        let handle = handle_for(&runtime, "c1", TaskDescriptor::builder("t1", "app:1").build());

        assert!(handle.upload().await.is_err());
        handle.upload().await.unwrap();

        let commits = runtime.calls().iter().filter(|c| c.starts_with("commit:")).count();
        assert_eq!(commits, 1);
    }

    #[tokio::test]
    async fn remove_drops_committed_image() {
        let runtime = FakeRuntime::new();
        let handle = handle_for(&runtime, "c1", TaskDescriptor::builder("t1", "app:1").build());

        handle.upload().await.unwrap();
        handle.remove().await.unwrap();

        let calls = runtime.calls();
        assert_eq!(calls[calls.len() - 2..], ["remove:c1", "rmi:image-c1"]);
    }
}
