//! Error types for the moderation engine
//!
//! The taxonomy separates request-level failures (invalid input, store
//! outage) from executor failures, which carry their own
//! transient/permanent split so callers know whether a retry can help.

use thiserror::Error;

/// Errors raised by a [`crate::cases::CaseStore`] implementation
#[derive(Debug, Error)]
pub enum StoreError {
    /// Durable write or read failed. Callers must not assume any part of
    /// the operation happened.
    #[error("case store unavailable: {0}")]
    Unavailable(String),

    /// No case with this id exists in the guild's ledger
    #[error("case #{case_id} not found in guild {guild_id}")]
    NotFound { guild_id: u64, case_id: u64 },
}

/// Failure modes of the external action executor
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    /// Rate limit or timeout; retried internally with bounded backoff
    #[error("transient executor failure: {0}")]
    Transient(String),

    /// Missing permission, target not found; never retried
    #[error("permanent executor failure: {0}")]
    Permanent(String),
}

impl ExecutorError {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Errors surfaced by the orchestrator's public API
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected before any mutation (bad duration, system-actor target)
    #[error("invalid moderation request: {0}")]
    InvalidRequest(String),

    /// The ledger could not be read or durably written; the request
    /// failed with no partial mutation left observable
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The action executor failed after bounded retries; the attempt is
    /// still recorded in the ledger with `active = false`
    #[error("action executor failed: {source}")]
    ExecutorFailed {
        #[source]
        source: ExecutorError,
    },
}

impl From<ExecutorError> for EngineError {
    fn from(source: ExecutorError) -> Self {
        Self::ExecutorFailed { source }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::InvalidRequest("duration must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "invalid moderation request: duration must be positive"
        );

        let error = EngineError::from(StoreError::NotFound {
            guild_id: 1,
            case_id: 42,
        });
        assert_eq!(error.to_string(), "case #42 not found in guild 1");

        let error = EngineError::from(ExecutorError::Transient("rate limited".to_string()));
        assert_eq!(
            error.to_string(),
            "action executor failed: transient executor failure: rate limited"
        );
    }

    #[test]
    fn test_permanence() {
        assert!(ExecutorError::Permanent("missing permission".to_string()).is_permanent());
        assert!(!ExecutorError::Transient("rate limited".to_string()).is_permanent());
    }
}
