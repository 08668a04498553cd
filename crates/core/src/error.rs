//! Engine error model.

use thiserror::Error;

use crate::id::JobId;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level error.
///
/// Every failure surfaced by a command run ends up here. Handler failures keep
/// the original `anyhow::Error` so its message and chain can be stamped onto
/// the failed job.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller supplied an unusable argument (wrong execution kind, bad retries, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A conditional write lost against a concurrent modification.
    #[error("optimistic locking failure: {0}")]
    OptimisticLock(String),

    /// A failed-job retry time cycle could not be parsed or evaluated.
    #[error("invalid retry time cycle '{cycle}': {reason}")]
    InvalidRetryCycle { cycle: String, reason: String },

    /// A job handler failed.
    #[error("job {job_id} failed: {cause}")]
    JobExecution { job_id: JobId, cause: anyhow::Error },

    /// The durable store rejected or failed a read/write.
    #[error("storage error: {0}")]
    Store(String),

    /// A command-context close listener failed.
    #[error("close listener failed: {0}")]
    CloseListener(String),

    /// The engine is wired incorrectly (missing session factory, broken chain, ...).
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn optimistic_lock(msg: impl Into<String>) -> Self {
        Self::OptimisticLock(msg.into())
    }

    pub fn invalid_cycle(cycle: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRetryCycle {
            cycle: cycle.into(),
            reason: reason.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the error is a lost concurrent-modification race.
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, EngineError::OptimisticLock(_))
    }
}
