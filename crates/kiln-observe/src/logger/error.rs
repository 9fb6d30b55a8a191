use thiserror::Error;

/// Why the process-wide subscriber could not be installed.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("unknown log format {0:?}, expected text, json or journald")]
    InvalidFormat(String),
    /// Journald output needs a Linux host and the `journald` feature.
    #[error("journald output is not available in this build")]
    JournaldNotSupported,
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
    #[error("cannot connect to journald: {0}")]
    Journald(#[source] std::io::Error),
    #[error("cannot install subscriber: {0}")]
    InitializationFailed(String),
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidLogLevel { filter: String, reason: String },
}
