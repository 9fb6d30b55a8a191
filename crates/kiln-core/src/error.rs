use std::fmt;

use kiln_model::UnknownKind;
use thiserror::Error;

/// The request names a capability this node was not configured with.
///
/// Never retried: the same request fails the same way until the node configuration changes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GPU required but not supported or disabled")]
    GpuUnsupported,
    #[error("volume driver not supported: {0}")]
    UnsupportedVolumeDriver(String),
    #[error("network driver not supported: {0}")]
    UnsupportedNetwork(String),
    #[error("mount {target} references undeclared volume {volume}")]
    UndeclaredVolume { volume: String, target: String },
    #[error(transparent)]
    UnknownKind(#[from] UnknownKind),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure reported by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("event stream error: {0}")]
    Stream(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A specific device, volume or network could not be allocated.
    #[error("resource unavailable: {0}")]
    Unavailable(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// A capability driver failed for a reason of its own.
    #[error("driver error: {0}")]
    Driver(String),

    /// Setup failed midway; everything acquired so far has been rolled back.
    ///
    /// `rollback` holds the errors of that rollback, if any, and never replaces `source`.
    #[error("partial setup failure: {source} ({} rollback errors)", .rollback.len())]
    PartialSetup {
        #[source]
        source: Box<CoreError>,
        rollback: MultiError,
    },

    #[error("unknown container {0}")]
    UnknownContainer(String),

    #[error("container {0} is already tracked")]
    AlreadyTracked(String),

    #[error(transparent)]
    Multi(MultiError),
}

impl CoreError {
    pub fn partial_setup(source: CoreError, rollback: MultiError) -> Self {
        CoreError::PartialSetup {
            source: Box::new(source),
            rollback,
        }
    }

    /// The error that triggered a rollback, looking through [`CoreError::PartialSetup`].
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::PartialSetup { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Ordered collection of errors from steps that were all attempted.
///
/// Nested aggregates are flattened on insertion.
#[derive(Debug, Default)]
pub struct MultiError(Vec<CoreError>);

impl MultiError {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: impl Into<CoreError>) {
        match err.into() {
            CoreError::Multi(inner) => self.0.extend(inner.0),
            other => self.0.push(other),
        }
    }

    /// Records the error of `result`, if any.
    pub fn push_result<E: Into<CoreError>>(&mut self, result: Result<(), E>) {
        if let Err(e) = result {
            self.push(e);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoreError> {
        self.0.iter()
    }

    /// `Ok` when nothing failed, the sole error when one step failed, the aggregate otherwise.
    pub fn into_result(mut self) -> Result<(), CoreError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(CoreError::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
