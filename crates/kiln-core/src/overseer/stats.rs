use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::runtime::ContainerRuntime;
use crate::state::ContainerRegistry;

/// Samples resource usage of every tracked container each `interval`.
pub(crate) async fn collect(
    runtime: Arc<dyn ContainerRuntime>,
    registry: ContainerRegistry,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for id in registry.ids() {
            match runtime.container_stats(&id).await {
                Ok(metrics) => {
                    trace!(target: "kiln.overseer", container = %id, "collected container metrics");
                    registry.update_metrics(&id, metrics);
                }
                Err(e) => warn!(target: "kiln.overseer", container = %id, error = %e, "failed to collect container metrics"),
            }
        }
    }

    debug!(target: "kiln.overseer", "stats collection stopped");
}
