use thiserror::Error;

/// A string key did not name any known variant of a typed registry key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownKind {
    /// What was being parsed (`"gpu vendor"`, `"volume driver"`, ...).
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl UnknownKind {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
