//! Target error types

use thiserror::Error;

use crate::bio::ReqOp;

/// Target error
#[derive(Error, Debug)]
pub enum TargetError {
    /// Wrong argument count or malformed table line
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Backing device could not be resolved or opened
    #[error("Device lookup failed for {path}: {reason}")]
    DeviceLookupFailed { path: String, reason: String },

    /// Allocation failure while building a target
    #[error("Cannot allocate target context")]
    OutOfMemory,

    /// Request kind the target does not accept
    #[error("Unsupported operation {op}: {reason}")]
    UnsupportedOperation { op: ReqOp, reason: &'static str },

    /// Target type name is already registered
    #[error("Target type already registered: {0}")]
    TargetTypeExists(String),

    /// No target type registered under this name
    #[error("Unknown target type: {0}")]
    UnknownTargetType(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TargetError {
    /// Shorthand for a lookup failure on `path`
    pub fn lookup(path: impl Into<String>, reason: impl ToString) -> Self {
        TargetError::DeviceLookupFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for target operations
pub type TargetResult<T> = Result<T, TargetError>;
