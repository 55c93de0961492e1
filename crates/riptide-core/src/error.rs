//! Error types shared across the riptide crates.

use thiserror::Error;

/// Errors produced by the core model and filtering.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A filter rule failed to compile.
    #[error("invalid filter rule: {0}")]
    InvalidFilterRule(String),

    /// JSON (de)serialization of a persisted shape failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A raw entry violated the model invariants.
    #[error("invalid raw entry: {0}")]
    InvalidEntry(String),

    /// Cooperative cancellation; not a fault.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Cancellation is not an error for retry/alerting purposes.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_classification() {
        assert!(CoreError::Cancelled.is_cancelled());
        assert!(!CoreError::InvalidFilterRule("x".into()).is_cancelled());
    }
}
