//! Capability backends for the kiln tuning pipeline.
//!
//! Each backend is behind a cargo feature and plugs into
//! [`Repository::builder`](kiln_core::Repository::builder).
mod error;
pub use error::PluginError;

#[cfg(feature = "gpu")]
pub mod gpu;
#[cfg(feature = "gpu")]
pub use gpu::{GpuConfig, StaticGpuTuner};

#[cfg(feature = "bind")]
pub mod bind;
#[cfg(feature = "bind")]
pub use bind::BindVolumeDriver;

#[cfg(feature = "bridge")]
pub mod bridge;
#[cfg(feature = "bridge")]
pub use bridge::BridgeTuner;

pub mod prelude {
    pub use crate::error::PluginError;

    #[cfg(feature = "bind")]
    pub use crate::BindVolumeDriver;
    #[cfg(feature = "bridge")]
    pub use crate::BridgeTuner;
    #[cfg(feature = "gpu")]
    pub use crate::{GpuConfig, StaticGpuTuner};
}
