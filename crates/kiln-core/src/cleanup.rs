//! Deferred release of acquired resources.
//!
//! A [`Cleanup`] is handed out by whatever acquired a resource and closed by whoever
//! ends up owning the container: the start path on failure, the event watcher on
//! death, or the deal-finish path. Closing must be safe to repeat.
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CoreError, MultiError};

#[async_trait]
pub trait Cleanup: Send + Sync {
    async fn close(&self) -> Result<(), CoreError>;
}

impl std::fmt::Debug for dyn Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cleanup")
    }
}

#[async_trait]
impl<T: Cleanup + ?Sized> Cleanup for Arc<T> {
    async fn close(&self) -> Result<(), CoreError> {
        (**self).close().await
    }
}

#[async_trait]
impl<T: Cleanup + ?Sized> Cleanup for Box<T> {
    async fn close(&self) -> Result<(), CoreError> {
        (**self).close().await
    }
}

/// Nothing was acquired.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCleanup;

#[async_trait]
impl Cleanup for NoopCleanup {
    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Ordered composite of child cleanups.
///
/// Children close in reverse registration order. Every child is closed even when an
/// earlier one fails, and the first call drains the list, so later calls are no-ops.
#[derive(Debug, Default)]
pub struct NestedCleanup {
    children: Mutex<Vec<Box<dyn Cleanup>>>,
}

impl NestedCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, child: Box<dyn Cleanup>) {
        self.lock().push(child);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn Cleanup>>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Cleanup for NestedCleanup {
    async fn close(&self) -> Result<(), CoreError> {
        let children = std::mem::take(&mut *self.lock());
        debug!(target: "kiln.cleanup", count = children.len(), "closing nested cleanup");

        let mut errs = MultiError::new();
        for child in children.into_iter().rev() {
            errs.push_result(child.close().await);
        }
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingCleanup, Journal};

    #[tokio::test]
    async fn closes_children_in_reverse_order() {
        let journal = Journal::new();
        let nested = NestedCleanup::new();
        nested.add(Box::new(CountingCleanup::new("gpu", &journal)));
        nested.add(Box::new(CountingCleanup::new("volume", &journal)));
        nested.add(Box::new(CountingCleanup::new("network", &journal)));

        nested.close().await.unwrap();
        assert_eq!(journal.entries(), vec!["close:network", "close:volume", "close:gpu"]);
    }

    #[tokio::test]
    async fn failing_child_does_not_stop_the_rest() {
        let journal = Journal::new();
        let nested = NestedCleanup::new();
        nested.add(Box::new(CountingCleanup::new("a", &journal)));
        nested.add(Box::new(CountingCleanup::failing("b", &journal)));
        nested.add(Box::new(CountingCleanup::failing("c", &journal)));

        let err = nested.close().await.unwrap_err();
        assert!(matches!(err, CoreError::Multi(ref m) if m.len() == 2));
        assert_eq!(journal.entries(), vec!["close:c", "close:b", "close:a"]);
    }

    #[tokio::test]
    async fn second_close_is_a_noop() {
        let journal = Journal::new();
        let counter = Arc::new(CountingCleanup::new("once", &journal));
        let nested = NestedCleanup::new();
        nested.add(Box::new(counter.clone()));

        nested.close().await.unwrap();
        nested.close().await.unwrap();
        assert_eq!(counter.count(), 1);
        assert!(nested.is_empty());
    }

    #[tokio::test]
    async fn single_failure_is_reported_unwrapped() {
        let journal = Journal::new();
        let nested = NestedCleanup::new();
        nested.add(Box::new(CountingCleanup::failing("only", &journal)));

        let err = nested.close().await.unwrap_err();
        assert!(matches!(err, CoreError::Driver(ref msg) if msg == "only failed"));
    }
}
