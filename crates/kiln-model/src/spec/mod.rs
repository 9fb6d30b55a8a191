//! Capability requests carried by a [`TaskDescriptor`](crate::TaskDescriptor).
mod gpu;
pub use gpu::{GpuDevice, GpuId, GpuVendor};

mod volume;
pub use volume::{Mount, MountMode, VolumeDriverKind, VolumeSpec};

mod network;
pub use network::{NetworkKind, NetworkSpec};

mod resources;
pub use resources::Resources;
