//! Per-container status tracking.
//!
//! Each tracked container carries a one-shot status channel. Whoever takes the
//! sender out of the registry delivers the terminal status; every later attempt
//! finds it gone and does nothing.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use kiln_model::{ContainerId, ContainerMetrics, TaskStatus};
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::CoreError;
use crate::overseer::ContainerHandle;

/// Receives the terminal status of one container exactly once.
pub type StatusReceiver = oneshot::Receiver<TaskStatus>;

/// In-memory registry of containers under supervision.
#[derive(Clone, Default)]
pub struct ContainerRegistry {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ContainerId, Entry>,
    /// Ids taken out for teardown whose container may still emit events.
    retiring: HashSet<ContainerId>,
}

struct Entry {
    handle: Arc<ContainerHandle>,
    status: TaskStatus,
    notify: Option<oneshot::Sender<TaskStatus>>,
    metrics: Option<ContainerMetrics>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a container.
    ///
    /// Fails with [`CoreError::AlreadyTracked`] while the id is tracked or retiring; the
    /// existing entry and its status channel stay untouched.
    pub fn insert(&self, handle: Arc<ContainerHandle>, status: TaskStatus) -> Result<StatusReceiver, CoreError> {
        let id = handle.id().to_string();
        let mut inner = self.write();
        if inner.entries.contains_key(&id) || inner.retiring.contains(&id) {
            return Err(CoreError::AlreadyTracked(id));
        }

        let (tx, rx) = oneshot::channel();
        let entry = Entry {
            handle,
            status,
            notify: Some(tx),
            metrics: None,
        };
        inner.entries.insert(id, entry);
        Ok(rx)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ContainerHandle>> {
        self.read().entries.get(id).map(|e| e.handle.clone())
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.read().entries.get(id).map(|e| e.status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ContainerId> {
        self.read().entries.keys().cloned().collect()
    }

    /// Moves a container forward to `status`; backwards moves are ignored.
    pub fn set_status(&self, id: &str, status: TaskStatus) -> bool {
        match self.write().entries.get_mut(id) {
            Some(entry) if entry.status.can_transition_to(status) => {
                entry.status = status;
                true
            }
            _ => false,
        }
    }

    /// Delivers terminal `status` unless some other path already did.
    ///
    /// Returns whether this call delivered it.
    pub fn finish(&self, id: &str, status: TaskStatus) -> bool {
        let sender = {
            let mut inner = self.write();
            let Some(entry) = inner.entries.get_mut(id) else {
                return false;
            };
            let sender = entry.notify.take();
            if sender.is_some() {
                entry.status = status;
            }
            sender
        };
        deliver(id, sender, status)
    }

    /// Stops tracking a container, delivering `status` first if nobody has yet.
    pub fn take(&self, id: &str, status: TaskStatus) -> Option<Arc<ContainerHandle>> {
        let entry = self.write().entries.remove(id)?;
        deliver(id, entry.notify, status);
        Some(entry.handle)
    }

    /// Like [`take`](Self::take), but keeps the id marked as retiring until
    /// [`forget`](Self::forget), so events of the dying container are not mistaken
    /// for an orphan's.
    pub fn retire(&self, id: &str, status: TaskStatus) -> Option<Arc<ContainerHandle>> {
        let entry = {
            let mut inner = self.write();
            let entry = inner.entries.remove(id)?;
            inner.retiring.insert(id.to_string());
            entry
        };
        deliver(id, entry.notify, status);
        Some(entry.handle)
    }

    pub fn is_retiring(&self, id: &str) -> bool {
        self.read().retiring.contains(id)
    }

    /// Drops the retiring mark left by [`retire`](Self::retire).
    pub fn forget(&self, id: &str) {
        self.write().retiring.remove(id);
    }

    pub fn update_metrics(&self, id: &str, metrics: ContainerMetrics) {
        if let Some(entry) = self.write().entries.get_mut(id) {
            entry.metrics = Some(metrics);
        }
    }

    /// Latest usage snapshot of every container that has one.
    pub fn metrics(&self) -> HashMap<ContainerId, ContainerMetrics> {
        self.read()
            .entries
            .iter()
            .filter_map(|(id, e)| e.metrics.clone().map(|m| (id.clone(), m)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn deliver(id: &str, sender: Option<oneshot::Sender<TaskStatus>>, status: TaskStatus) -> bool {
    let Some(tx) = sender else {
        return false;
    };
    // A dropped receiver still counts as delivered: nobody else may send.
    if tx.send(status).is_err() {
        trace!(target: "kiln.state", container = id, %status, "status listener is gone");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRuntime, handle};
    use kiln_model::Timestamp;

    #[tokio::test]
    async fn finish_delivers_exactly_once() {
        let runtime = FakeRuntime::new();
        let registry = ContainerRegistry::new();
        let rx = registry.insert(handle(&runtime, "c1"), TaskStatus::Running).unwrap();

        assert!(registry.finish("c1", TaskStatus::Broken));
        assert!(!registry.finish("c1", TaskStatus::Finished));
        assert!(registry.take("c1", TaskStatus::Finished).is_some());

        assert_eq!(rx.await.unwrap(), TaskStatus::Broken);
    }

    #[tokio::test]
    async fn take_delivers_when_nothing_was_sent() {
        let runtime = FakeRuntime::new();
        let registry = ContainerRegistry::new();
        let rx = registry.insert(handle(&runtime, "c1"), TaskStatus::Running).unwrap();

        let h = registry.take("c1", TaskStatus::Finished).unwrap();
        assert_eq!(h.id(), "c1");
        assert!(!registry.contains("c1"));
        assert!(registry.take("c1", TaskStatus::Finished).is_none());

        assert_eq!(rx.await.unwrap(), TaskStatus::Finished);
    }

    #[test]
    fn concurrent_finishers_have_one_winner() {
        let runtime = FakeRuntime::new();
        let registry = ContainerRegistry::new();
        let mut rx = registry.insert(handle(&runtime, "c1"), TaskStatus::Running).unwrap();

        let winners: usize = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let registry = registry.clone();
                    s.spawn(move || {
                        let status = if i % 2 == 0 { TaskStatus::Broken } else { TaskStatus::Finished };
                        registry.finish("c1", status) as usize
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
        let delivered = rx.try_recv().unwrap();
        assert_eq!(registry.status("c1"), Some(delivered));
    }

    #[test]
    fn finish_on_unknown_id_is_noop() {
        let registry = ContainerRegistry::new();
        assert!(!registry.finish("missing", TaskStatus::Finished));
        assert!(registry.take("missing", TaskStatus::Finished).is_none());
    }

    #[tokio::test]
    async fn dropped_listener_still_consumes_delivery() {
        let runtime = FakeRuntime::new();
        let registry = ContainerRegistry::new();
        drop(registry.insert(handle(&runtime, "c1"), TaskStatus::Running).unwrap());

        assert!(registry.finish("c1", TaskStatus::Broken));
        assert!(!registry.finish("c1", TaskStatus::Broken));
    }

    #[tokio::test]
    async fn status_only_moves_forward() {
        let runtime = FakeRuntime::new();
        let registry = ContainerRegistry::new();
        let _rx = registry.insert(handle(&runtime, "c1"), TaskStatus::Spawning).unwrap();

        assert!(registry.set_status("c1", TaskStatus::Running));
        assert!(!registry.set_status("c1", TaskStatus::Spawning));
        assert_eq!(registry.status("c1"), Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn metrics_snapshot_skips_unsampled_containers() {
        let runtime = FakeRuntime::new();
        let registry = ContainerRegistry::new();
        let _a = registry.insert(handle(&runtime, "a"), TaskStatus::Running).unwrap();
        let _b = registry.insert(handle(&runtime, "b"), TaskStatus::Running).unwrap();

        registry.update_metrics(
            "a",
            ContainerMetrics {
                memory_usage: 42,
                collected_at: Timestamp::from_nanos(1),
                ..Default::default()
            },
        );

        let snapshot = registry.metrics();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["a"].memory_usage, 42);
    }

    #[tokio::test]
    async fn insert_never_replaces_a_live_entry() {
        let runtime = FakeRuntime::new();
        let registry = ContainerRegistry::new();
        let mut first = registry.insert(handle(&runtime, "c1"), TaskStatus::Running).unwrap();

        let err = registry.insert(handle(&runtime, "c1"), TaskStatus::Running).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyTracked(ref id) if id == "c1"));
        assert_eq!(first.try_recv(), Err(oneshot::error::TryRecvError::Empty));

        assert!(registry.finish("c1", TaskStatus::Finished));
        assert_eq!(first.await.unwrap(), TaskStatus::Finished);
    }

    #[tokio::test]
    async fn retired_id_stays_marked_until_forgotten() {
        let runtime = FakeRuntime::new();
        let registry = ContainerRegistry::new();
        let rx = registry.insert(handle(&runtime, "c1"), TaskStatus::Running).unwrap();

        assert!(registry.retire("c1", TaskStatus::Finished).is_some());
        assert_eq!(rx.await.unwrap(), TaskStatus::Finished);
        assert!(!registry.contains("c1"));
        assert!(registry.is_retiring("c1"));
        assert!(registry.insert(handle(&runtime, "c1"), TaskStatus::Running).is_err());

        registry.forget("c1");
        assert!(!registry.is_retiring("c1"));
        assert!(registry.insert(handle(&runtime, "c1"), TaskStatus::Running).is_ok());
    }
}
