//! Task launch path with resource accounting.
//!
//! Resources are reserved before anything touches the engine and released exactly
//! once: either when setup fails or when the container's terminal status arrives.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use kiln_model::{ContainerId, Resources, TaskDescriptor, TaskId, TaskStatus};
use tracing::{info, instrument, warn};

use crate::error::CoreError;
use crate::overseer::{ContainerHandle, Overseer};
use crate::state::StatusReceiver;

/// Bookkeeping of node capacity consumed by tasks.
#[async_trait]
pub trait ResourceAccountant: Send + Sync {
    async fn consume_task(&self, plan_id: &str, task_id: &TaskId, resources: &Resources) -> Result<(), CoreError>;

    async fn release_task(&self, task_id: &TaskId);
}

/// What the launcher knows about one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub container: Option<ContainerId>,
}

/// Finished tasks remembered by default.
const HISTORY: usize = 1024;

/// Task records. Active tasks are always kept; finished ones only up to `history`,
/// oldest evicted first.
struct Records {
    tasks: HashMap<TaskId, TaskRecord>,
    finished: VecDeque<TaskId>,
    history: usize,
}

type SharedRecords = Arc<RwLock<Records>>;

pub struct TaskLauncher {
    overseer: Arc<Overseer>,
    accountant: Arc<dyn ResourceAccountant>,
    tasks: SharedRecords,
}

impl TaskLauncher {
    pub fn new(overseer: Arc<Overseer>, accountant: Arc<dyn ResourceAccountant>) -> Self {
        Self {
            overseer,
            accountant,
            tasks: Arc::new(RwLock::new(Records {
                tasks: HashMap::new(),
                finished: VecDeque::new(),
                history: HISTORY,
            })),
        }
    }

    /// Number of finished tasks whose records are kept.
    pub fn with_history(self, history: usize) -> Self {
        write(&self.tasks).history = history;
        self
    }

    /// Reserves resources, spools the image and starts the task's container.
    #[instrument(level = "info", target = "kiln.overseer", skip(self, descriptor), fields(task = %descriptor.task_id()))]
    pub async fn launch(&self, plan_id: &str, descriptor: TaskDescriptor) -> Result<Arc<ContainerHandle>, CoreError> {
        let task_id = descriptor.task_id().clone();
        if self.status(&task_id).is_some_and(|s| !s.is_terminal()) {
            return Err(CoreError::Unavailable(format!("task {task_id} is already active")));
        }

        self.accountant
            .consume_task(plan_id, &task_id, descriptor.resources())
            .await?;
        set_status(&self.tasks, &task_id, TaskStatus::Spooling, None);

        if let Err(e) = self.overseer.spool(&descriptor).await {
            self.abort(&task_id).await;
            return Err(e);
        }
        set_status(&self.tasks, &task_id, TaskStatus::Spawning, None);

        let (status, handle) = match self.overseer.start(descriptor).await {
            Ok(started) => started,
            Err(e) => {
                self.abort(&task_id).await;
                return Err(e);
            }
        };
        set_status(&self.tasks, &task_id, TaskStatus::Running, Some(handle.id().to_string()));

        self.listen(task_id, status);
        Ok(handle)
    }

    /// Resumes tracking of a task whose container survived a restart.
    ///
    /// The task's resources are assumed to be reserved already.
    pub async fn attach(&self, id: &str, descriptor: TaskDescriptor) -> Result<Arc<ContainerHandle>, CoreError> {
        let task_id = descriptor.task_id().clone();
        let (status, handle) = self.overseer.attach(id, descriptor).await?;
        set_status(&self.tasks, &task_id, TaskStatus::Running, Some(id.to_string()));
        self.listen(task_id, status);
        Ok(handle)
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.record(task_id).map(|r| r.status)
    }

    pub fn record(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .get(task_id)
            .cloned()
    }

    async fn abort(&self, task_id: &TaskId) {
        set_status(&self.tasks, task_id, TaskStatus::Broken, None);
        self.accountant.release_task(task_id).await;
    }

    /// Releases the task's resources once its terminal status arrives.
    fn listen(&self, task_id: TaskId, status: StatusReceiver) {
        let tasks = self.tasks.clone();
        let accountant = self.accountant.clone();

        tokio::spawn(async move {
            let status = status.await.unwrap_or_else(|_| {
                warn!(target: "kiln.overseer", task = %task_id, "status channel dropped without a status");
                TaskStatus::Broken
            });
            set_status(&tasks, &task_id, status, None);
            accountant.release_task(&task_id).await;
            info!(target: "kiln.overseer", task = %task_id, %status, "task resources released");
        });
    }
}

fn write(tasks: &SharedRecords) -> RwLockWriteGuard<'_, Records> {
    tasks.write().unwrap_or_else(|e| e.into_inner())
}

fn set_status(tasks: &SharedRecords, task_id: &TaskId, status: TaskStatus, container: Option<ContainerId>) {
    let mut records = write(tasks);
    let records = &mut *records;
    let finished = match records.tasks.get_mut(task_id) {
        Some(record) if record.status.is_terminal() && status == TaskStatus::Spooling => {
            records.finished.retain(|id| id != task_id);
            *record = TaskRecord { status, container };
            false
        }
        Some(record) => {
            let finished = !record.status.is_terminal() && status.is_terminal();
            if record.status.can_transition_to(status) {
                record.status = status;
            }
            if container.is_some() {
                record.container = container;
            }
            finished && record.status.is_terminal()
        }
        None => {
            records.tasks.insert(task_id.clone(), TaskRecord { status, container });
            status.is_terminal()
        }
    };

    if finished {
        records.finished.push_back(task_id.clone());
        while records.finished.len() > records.history {
            if let Some(oldest) = records.finished.pop_front() {
                records.tasks.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAccountant, FakeRuntime, Journal, overseer, wait_until};

    fn launcher(runtime: &Arc<FakeRuntime>, journal: &Journal) -> (Arc<Overseer>, TaskLauncher) {
        let overseer = Arc::new(overseer(runtime, Default::default()));
        let launcher = TaskLauncher::new(overseer.clone(), Arc::new(FakeAccountant::new(journal)));
        (overseer, launcher)
    }

    #[tokio::test]
    async fn releases_resources_once_after_stop() {
        let runtime = FakeRuntime::new();
        let journal = Journal::new();
        let (overseer, launcher) = launcher(&runtime, &journal);
        let task: TaskId = "t1".into();

        let handle = launcher
            .launch("plan-1", TaskDescriptor::builder("t1", "app:1").build())
            .await
            .unwrap();
        assert_eq!(launcher.status(&task), Some(TaskStatus::Running));

        overseer.stop(handle.id()).await.unwrap();
        overseer.on_deal_finish(handle.id()).await.unwrap();

        wait_until(|| journal.entries().len() == 2).await;
        assert_eq!(journal.entries(), vec!["consume:plan-1:t1", "release:t1"]);
        assert_eq!(launcher.status(&task), Some(TaskStatus::Finished));
    }

    #[tokio::test]
    async fn setup_failure_releases_resources() {
        let runtime = FakeRuntime::new();
        runtime.fail("pull");
        let journal = Journal::new();
        let (_overseer, launcher) = launcher(&runtime, &journal);

        let err = launcher
            .launch("plan-1", TaskDescriptor::builder("t1", "missing:1").build())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Runtime(_)));
        assert_eq!(journal.entries(), vec!["consume:plan-1:t1", "release:t1"]);
        assert_eq!(launcher.status(&"t1".into()), Some(TaskStatus::Broken));
    }

    #[tokio::test]
    async fn refused_reservation_touches_nothing() {
        let runtime = FakeRuntime::new();
        let journal = Journal::new();
        let overseer = Arc::new(overseer(&runtime, Default::default()));
        let launcher = TaskLauncher::new(overseer, Arc::new(FakeAccountant::exhausted(&journal)));

        let err = launcher
            .launch("plan-1", TaskDescriptor::builder("t1", "app:1").build())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Unavailable(_)));
        assert!(runtime.calls().is_empty());
        assert!(launcher.status(&"t1".into()).is_none());
    }

    #[tokio::test]
    async fn finished_records_are_evicted_oldest_first() {
        let runtime = FakeRuntime::new();
        let journal = Journal::new();
        let (overseer, launcher) = launcher(&runtime, &journal);
        let launcher = launcher.with_history(1);

        let first = launcher
            .launch("plan-1", TaskDescriptor::builder("t1", "app:1").build())
            .await
            .unwrap();
        let second = launcher
            .launch("plan-1", TaskDescriptor::builder("t2", "app:1").build())
            .await
            .unwrap();

        overseer.on_deal_finish(first.id()).await.unwrap();
        wait_until(|| launcher.status(&"t1".into()) == Some(TaskStatus::Finished)).await;
        assert_eq!(launcher.status(&"t2".into()), Some(TaskStatus::Running));

        overseer.on_deal_finish(second.id()).await.unwrap();
        wait_until(|| launcher.status(&"t2".into()) == Some(TaskStatus::Finished)).await;
        assert!(launcher.record(&"t1".into()).is_none());
    }

    #[tokio::test]
    async fn active_task_cannot_be_launched_twice() {
        let runtime = FakeRuntime::new();
        let journal = Journal::new();
        let (_overseer, launcher) = launcher(&runtime, &journal);

        launcher
            .launch("plan-1", TaskDescriptor::builder("t1", "app:1").build())
            .await
            .unwrap();
        let err = launcher
            .launch("plan-1", TaskDescriptor::builder("t1", "app:1").build())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }
}
