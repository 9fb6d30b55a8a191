//! Plain data model shared by the kiln crates.
//!
//! Nothing here performs I/O: these are the values a caller builds to describe a job
//! and the values the orchestrator reports back.
mod domain;
pub use domain::*;

mod spec;
pub use spec::*;

mod descriptor;
pub use descriptor::{TaskDescriptor, TaskDescriptorBuilder};

mod metrics;
pub use metrics::{ContainerMetrics, NetworkUsage};

mod error;
pub use error::UnknownKind;
