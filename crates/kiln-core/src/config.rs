use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskvisor::{BackoffPolicy, JitterPolicy};

use crate::error::ConfigError;

/// Settings of the [`Overseer`](crate::Overseer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OverseerConfig {
    /// Label stamped on every container this node creates; the event watcher only follows these.
    pub label: String,
    /// Label carrying the task id.
    pub task_label: String,
    /// Interval between resource usage samples.
    pub stats_interval_ms: u64,
    pub events_backoff: BackoffConfig,
    /// Per-file size cap for container logs, in engine notation (`"100m"`).
    pub log_max_size: String,
    /// Registry repository committed images are pushed to.
    /// Empty means the repository of the task's own image.
    pub commit_repository: String,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            label: "kiln.overseer".to_string(),
            task_label: "kiln.taskid".to_string(),
            stats_interval_ms: 30_000,
            events_backoff: BackoffConfig::default(),
            log_max_size: "100m".to_string(),
            commit_repository: String::new(),
        }
    }
}

impl OverseerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.label.is_empty() {
            return Err(ConfigError::Invalid("overseer label must not be empty".into()));
        }
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::Invalid("stats interval must be positive".into()));
        }
        self.events_backoff.validate()
    }

    #[inline]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

/// Exponential backoff between event stream resubscriptions.
///
/// Attempt `n` (0-indexed) waits `first × 2^n`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    pub first_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            first_ms: 1_000,
            max_ms: 32_000,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.first_ms == 0 || self.first_ms > self.max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff must satisfy 0 < first ({}) <= max ({})",
                self.first_ms, self.max_ms
            )));
        }
        Ok(())
    }

    /// Doubling policy without jitter, so delays depend only on the attempt number.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.first_ms),
            max: Duration::from_millis(self.max_ms),
            factor: 2.0,
            jitter: JitterPolicy::None,
            ..BackoffPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = OverseerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.stats_interval(), Duration::from_secs(30));
        assert_eq!(cfg.events_backoff.first_ms, 1_000);
        assert_eq!(cfg.events_backoff.max_ms, 32_000);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: OverseerConfig =
            serde_json::from_str(r#"{"label":"custom","eventsBackoff":{"maxMs":8000}}"#).unwrap();
        assert_eq!(cfg.label, "custom");
        assert_eq!(cfg.events_backoff.first_ms, 1_000);
        assert_eq!(cfg.events_backoff.max_ms, 8_000);
        assert_eq!(cfg.log_max_size, "100m");
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffConfig::default().policy();
        let delays: Vec<u64> = (0..8).map(|n| policy.next(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32, 32]);
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(32));
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let cfg = BackoffConfig {
            first_ms: 10_000,
            max_ms: 1_000,
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
