//! Errors raised by the rule store and the rule tables

use std::path::PathBuf;
use std::time::Duration;

/// Rule store / rule table errors
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// Persisted rule data is unreadable or violates a table invariant.
    /// Never coerced into an empty table.
    #[error("Rule data at {path} is corrupt: {reason}")]
    Integrity { path: PathBuf, reason: String },

    /// Malformed or self-referential rule rejected before persistence
    #[error("Invalid rule: {0}")]
    Validation(String),

    /// Underlying filesystem failure
    #[error("Rule store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store I/O did not complete in time
    #[error("Rule store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl RuleError {
    pub fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;
