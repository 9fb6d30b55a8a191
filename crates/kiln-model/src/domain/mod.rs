mod kv;
pub use kv::KeyValue;

mod task_env;
pub use task_env::TaskEnv;

mod task_id;
pub use task_id::TaskId;

mod task_status;
pub use task_status::TaskStatus;

mod timestamp;
pub use timestamp::Timestamp;

/// Identifier assigned to a container by the container runtime.
pub type ContainerId = String;

/// Image reference as understood by the container runtime (e.g. `"registry/app:1.2"`).
pub type ImageRef = String;
