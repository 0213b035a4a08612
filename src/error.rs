//! Error types for the rlaas service.

use thiserror::Error;

use crate::rules::RuleTableError;
use crate::store::StoreError;

/// Main error type for rlaas operations.
///
/// None of these is ever folded into an "allowed" or "blocked" decision; the
/// caller chooses whether to fail open or closed.
#[derive(Error, Debug)]
pub enum RlaasError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Neither the requested rule nor the default rule is enabled
    #[error("No rule found for {0:?} and no default rule is enabled")]
    RuleNotFound(String),

    /// Counter store failure; the admission outcome is unknown
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// Durable rule table failure
    #[error("Rule table error: {0}")]
    RuleTable(#[from] RuleTableError),

    /// Rejected input on a rule write or a limit check
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RlaasError {
    /// True when the request's fate is unknown because a backing service failed.
    pub fn is_indeterminate(&self) -> bool {
        match self {
            RlaasError::Store(_) => true,
            RlaasError::RuleTable(e) => e.is_unavailable(),
            _ => false,
        }
    }

    /// True when the failure comes from rule setup rather than the backends.
    pub fn is_configuration(&self) -> bool {
        matches!(self, RlaasError::Config(_) | RlaasError::RuleNotFound(_))
    }
}

/// Result type alias for rlaas operations.
pub type Result<T> = std::result::Result<T, RlaasError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_indeterminate() {
        let err: RlaasError = StoreError::Unavailable("connection refused".into()).into();
        assert!(err.is_indeterminate());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_missing_rule_is_configuration() {
        let err = RlaasError::RuleNotFound("checkout".into());
        assert!(err.is_configuration());
        assert!(!err.is_indeterminate());
        assert_eq!(
            err.to_string(),
            "No rule found for \"checkout\" and no default rule is enabled"
        );
    }

    #[test]
    fn test_rule_table_errors() {
        let down: RlaasError = RuleTableError::Backend("disk I/O error".into()).into();
        assert!(down.is_indeterminate());

        let conflict: RlaasError = RuleTableError::Conflict("login".into()).into();
        assert!(!conflict.is_indeterminate());
    }
}
