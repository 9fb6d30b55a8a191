use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// Transitions only move forward: `Spooling → Spawning → Running → {Finished | Broken}`.
/// Intermediate states may be skipped, terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    /// The image is being made available locally.
    Spooling,
    /// Capabilities are being tuned and the container created.
    Spawning,
    /// The container is running.
    Running,
    /// The task was stopped on request.
    Finished,
    /// The container died on its own.
    Broken,
}

impl TaskStatus {
    /// Returns `true` if the task is in a terminal state (won't transition further).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Broken)
    }

    /// Returns `true` if moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Spooling => 0,
            TaskStatus::Spawning => 1,
            TaskStatus::Running => 2,
            TaskStatus::Finished | TaskStatus::Broken => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Spooling => "spooling",
            TaskStatus::Spawning => "spawning",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Broken => "broken",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Finished.is_terminal());
        assert!(TaskStatus::Broken.is_terminal());

        assert!(!TaskStatus::Spooling.is_terminal());
        assert!(!TaskStatus::Spawning.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn transitions_are_monotonic() {
        assert!(TaskStatus::Spooling.can_transition_to(TaskStatus::Spawning));
        assert!(TaskStatus::Spawning.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Broken));
        assert!(TaskStatus::Spooling.can_transition_to(TaskStatus::Finished));

        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Spawning));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Finished.can_transition_to(TaskStatus::Broken));
        assert!(!TaskStatus::Broken.can_transition_to(TaskStatus::Finished));
    }

    #[test]
    fn serde_uses_camel_case() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, r#""running""#);

        let back: TaskStatus = serde_json::from_str(r#""broken""#).unwrap();
        assert_eq!(back, TaskStatus::Broken);
    }
}
