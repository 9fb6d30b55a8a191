use kiln_core::{ConfigError, CoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        PluginError::Io(e.to_string())
    }
}

impl From<PluginError> for CoreError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::InvalidSettings(msg) => CoreError::Config(ConfigError::Invalid(msg)),
            PluginError::UnknownDevice(id) => CoreError::Unavailable(format!("GPU {id} is not available")),
            other => CoreError::Driver(other.to_string()),
        }
    }
}
