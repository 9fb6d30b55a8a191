//! Node-local orchestration core.
//!
//! Takes a [`TaskDescriptor`](kiln_model::TaskDescriptor), provisions the GPUs, volumes
//! and networks it asks for, runs it as a container and tracks it until a terminal
//! status is delivered, releasing everything it acquired exactly once.
pub mod action;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod launcher;
pub mod overseer;
pub mod runtime;
pub mod state;
pub mod tune;
pub mod watch;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use action::{Action, ActionQueue, Aborted};
pub use cleanup::{Cleanup, NestedCleanup, NoopCleanup};
pub use config::{BackoffConfig, OverseerConfig};
pub use error::{ConfigError, CoreError, MultiError, RuntimeError};
pub use launcher::{ResourceAccountant, TaskLauncher, TaskRecord};
pub use overseer::{ContainerHandle, Overseer};
pub use runtime::ContainerRuntime;
pub use state::{ContainerRegistry, StatusReceiver};
pub use tune::{GpuTuner, NetworkTuner, Repository, Volume, VolumeDriver};
pub use watch::EventWatcher;
