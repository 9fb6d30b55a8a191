//! Runtime event watcher.
//!
//! Follows `die` events of the containers this node labeled and turns each one into
//! a terminal status, an optional upload and the release of the container's
//! resources. A failing subscription is resumed from the last processed event after
//! an exponential backoff, so a flapping engine never replays or skips a death.
use std::collections::HashSet;
use std::sync::Arc;

use kiln_model::{ContainerId, TaskStatus, Timestamp};
use taskvisor::BackoffPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, EventAction, EventFilter, EventStream, RuntimeEvent};
use crate::state::ContainerRegistry;

/// Position in the event stream that survives resubscription.
///
/// Holds the timestamp of the newest processed event and the ids already processed at
/// exactly that timestamp, since a resubscription from `since` replays them.
#[derive(Debug, Clone)]
pub(crate) struct Watermark {
    since: Timestamp,
    seen: HashSet<ContainerId>,
}

impl Watermark {
    pub(crate) fn new(since: Timestamp) -> Self {
        Self {
            since,
            seen: HashSet::new(),
        }
    }

    #[inline]
    pub(crate) fn since(&self) -> Timestamp {
        self.since
    }

    /// Advances past `event`, returning `false` if it was already processed.
    pub(crate) fn observe(&mut self, event: &RuntimeEvent) -> bool {
        if event.time < self.since {
            return false;
        }
        if event.time > self.since {
            self.since = event.time;
            self.seen.clear();
        }
        self.seen.insert(event.id.clone())
    }
}

/// Why one subscription ended.
enum Ended {
    Cancelled,
    Failed { error: RuntimeError, processed: usize },
}

pub struct EventWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    registry: ContainerRegistry,
    label: String,
    backoff: BackoffPolicy,
    since: Timestamp,
}

impl EventWatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: ContainerRegistry,
        label: impl Into<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            runtime,
            registry,
            label: label.into(),
            backoff,
            since: Timestamp::now(),
        }
    }

    /// Where the first subscription starts.
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = since;
        self
    }

    /// Watches until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut mark = Watermark::new(self.since);
        let mut failures: u32 = 0;

        loop {
            let (error, processed) = match self.follow(&token, &mut mark).await {
                Ended::Cancelled => break,
                Ended::Failed { error, processed } => (error, processed),
            };

            if processed > 0 {
                failures = 0;
            }
            let delay = self.backoff.next(failures);
            failures = failures.saturating_add(1);

            warn!(
                target: "kiln.watch",
                error = %error,
                delay_ms = delay.as_millis() as u64,
                since = mark.since().as_nanos(),
                "event stream failed, resubscribing after backoff"
            );

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(target: "kiln.watch", "event listening has been cancelled");
    }

    async fn follow(&self, token: &CancellationToken, mark: &mut Watermark) -> Ended {
        let filter = EventFilter {
            since: mark.since(),
            actions: vec![EventAction::Die],
            labels: vec![self.label.clone()],
        };
        debug!(target: "kiln.watch", since = filter.since.as_nanos(), "subscribing to runtime events");

        let subscribed = tokio::select! {
            _ = token.cancelled() => return Ended::Cancelled,
            res = self.runtime.events(&filter) => res,
        };
        let mut stream: EventStream = match subscribed {
            Ok(s) => s,
            Err(error) => return Ended::Failed { error, processed: 0 },
        };

        let mut processed = 0;
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Ended::Cancelled,
                next = stream.recv() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(RuntimeError::Cancelled)) => return Ended::Cancelled,
                Some(Err(error)) => return Ended::Failed { error, processed },
                None => {
                    let error = RuntimeError::Stream("event stream closed".into());
                    return Ended::Failed { error, processed };
                }
            };

            if !mark.observe(&event) {
                debug!(target: "kiln.watch", container = %event.id, "skipping replayed event");
                continue;
            }
            processed += 1;

            match event.action {
                EventAction::Die => self.on_death(&event.id).await,
                ref other => warn!(target: "kiln.watch", action = other.as_str(), "received unknown event"),
            }
        }
    }

    async fn on_death(&self, id: &str) {
        info!(target: "kiln.watch", container = id, "container has died");

        let Some(handle) = self.registry.get(id) else {
            if self.registry.is_retiring(id) {
                debug!(target: "kiln.watch", container = id, "container is being torn down, skipping");
                return;
            }
            warn!(target: "kiln.watch", container = id, "unknown container, removing as orphan");
            if let Err(e) = self.runtime.container_remove(id).await {
                warn!(target: "kiln.watch", container = id, error = %e, "failed to remove orphaned container");
            }
            return;
        };

        if self.registry.finish(id, TaskStatus::Broken) {
            debug!(target: "kiln.watch", container = id, "delivered broken status");
        }

        if handle.descriptor().commit_on_stop()
            && let Err(e) = handle.upload().await
        {
            error!(target: "kiln.watch", container = id, error = %e, "failed to commit container");
        }

        if let Err(e) = handle.cleanup().await {
            error!(target: "kiln.watch", container = id, error = %e, "failed to clean up container resources");
        }
    }
}
