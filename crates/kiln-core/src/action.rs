//! Reversible setup steps.
//!
//! An [`ActionQueue`] runs [`Action`]s one at a time and remembers the ones that
//! succeeded. When a step fails, the completed ones are undone in reverse order
//! before the failure is reported.
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cleanup::Cleanup;
use crate::error::{CoreError, MultiError};

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&mut self) -> Result<(), CoreError>;

    async fn rollback(&mut self) -> Result<(), CoreError>;
}

/// A step failed and the queue was rolled back.
#[derive(Debug)]
pub struct Aborted {
    /// Name of the step that failed.
    pub action: String,
    pub cause: CoreError,
    /// Errors from undoing the completed steps.
    pub rollback: MultiError,
}

impl Aborted {
    /// The step's own error, dropping any rollback errors.
    pub fn into_cause(self) -> CoreError {
        self.cause
    }

    /// The step's error with rollback errors attached when there are any.
    pub fn into_error(self) -> CoreError {
        if self.rollback.is_empty() {
            self.cause
        } else {
            CoreError::partial_setup(self.cause, self.rollback)
        }
    }
}

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action {} failed: {}", self.action, self.cause)
    }
}

#[derive(Default)]
pub struct ActionQueue {
    done: Vec<Box<dyn Action>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue of steps known to have run already, e.g. by an earlier process.
    ///
    /// Only useful for rolling them back.
    pub fn completed(actions: Vec<Box<dyn Action>>) -> Self {
        Self { done: actions }
    }

    /// Number of completed steps that a rollback would undo.
    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    /// Runs `action`; on failure rolls back everything completed so far.
    pub async fn execute(&mut self, mut action: Box<dyn Action>) -> Result<(), Aborted> {
        debug!(target: "kiln.action", action = action.name(), "executing action");
        match action.execute().await {
            Ok(()) => {
                self.done.push(action);
                Ok(())
            }
            Err(cause) => {
                warn!(target: "kiln.action", action = action.name(), error = %cause, "action failed, rolling back");
                let rollback = match self.rollback().await {
                    Ok(()) => MultiError::new(),
                    Err(CoreError::Multi(errs)) => errs,
                    Err(e) => {
                        let mut errs = MultiError::new();
                        errs.push(e);
                        errs
                    }
                };
                Err(Aborted {
                    action: action.name().to_string(),
                    cause,
                    rollback,
                })
            }
        }
    }

    /// Runs every action in order, stopping at the first failure.
    pub async fn execute_all(
        &mut self,
        actions: impl IntoIterator<Item = Box<dyn Action>>,
    ) -> Result<(), Aborted> {
        for action in actions {
            self.execute(action).await?;
        }
        Ok(())
    }

    /// Undoes completed steps newest first, attempting each of them.
    pub async fn rollback(&mut self) -> Result<(), CoreError> {
        let mut errs = MultiError::new();
        while let Some(mut action) = self.done.pop() {
            debug!(target: "kiln.action", action = action.name(), "rolling back action");
            errs.push_result(action.rollback().await);
        }
        errs.into_result()
    }

    /// Wraps the queue so that closing it rolls back the completed steps.
    pub fn into_cleanup(self) -> QueueCleanup {
        QueueCleanup {
            queue: Mutex::new(self),
        }
    }
}

/// [`Cleanup`] adapter over an [`ActionQueue`].
pub struct QueueCleanup {
    queue: Mutex<ActionQueue>,
}

#[async_trait]
impl Cleanup for QueueCleanup {
    async fn close(&self) -> Result<(), CoreError> {
        self.queue.lock().await.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Journal, RecordingAction};

    #[tokio::test]
    async fn failure_rolls_back_completed_steps_in_reverse() {
        let journal = Journal::new();
        let mut queue = ActionQueue::new();

        let err = queue
            .execute_all(vec![
                RecordingAction::boxed("a", &journal),
                RecordingAction::boxed("b", &journal),
                RecordingAction::failing("c", &journal),
                RecordingAction::boxed("d", &journal),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.action, "c");
        assert!(err.rollback.is_empty());
        assert!(queue.is_empty());
        assert_eq!(
            journal.entries(),
            vec!["execute:a", "execute:b", "execute:c", "rollback:b", "rollback:a"]
        );
    }

    #[tokio::test]
    async fn rollback_errors_do_not_stop_remaining_rollbacks() {
        let journal = Journal::new();
        let mut queue = ActionQueue::new();
        queue.execute(RecordingAction::boxed("a", &journal)).await.unwrap();
        queue
            .execute(RecordingAction::failing_rollback("b", &journal))
            .await
            .unwrap();

        let aborted = queue
            .execute(RecordingAction::failing("c", &journal))
            .await
            .unwrap_err();

        assert_eq!(aborted.rollback.len(), 1);
        assert_eq!(
            journal.entries(),
            vec!["execute:a", "execute:b", "execute:c", "rollback:b", "rollback:a"]
        );
        assert!(matches!(aborted.into_error(), CoreError::PartialSetup { .. }));
    }

    #[tokio::test]
    async fn queue_cleanup_rolls_back_once() {
        let journal = Journal::new();
        let mut queue = ActionQueue::new();
        queue.execute(RecordingAction::boxed("a", &journal)).await.unwrap();
        queue.execute(RecordingAction::boxed("b", &journal)).await.unwrap();

        let cleanup = queue.into_cleanup();
        cleanup.close().await.unwrap();
        cleanup.close().await.unwrap();

        assert_eq!(
            journal.entries(),
            vec!["execute:a", "execute:b", "rollback:b", "rollback:a"]
        );
    }
}
