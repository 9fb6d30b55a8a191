//! Process-wide logging setup for kiln daemons.
mod logger;
pub use logger::*;
