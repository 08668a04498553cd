use core::fmt;

use serde::{Deserialize, Serialize};

/// Kinds of notifications the engine core emits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEventType {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    EntitySuspended,
    EntityActivated,
    JobExecutionSuccess,
    JobExecutionFailure,
    JobRetriesDecremented,
    JobMovedToDeadLetter,
    /// A failed-job retry time cycle could not be evaluated.
    JobRetryConfigurationError,
}

impl EngineEventType {
    /// Stable event name (e.g. "job.execution.success").
    pub fn name(&self) -> &'static str {
        match self {
            EngineEventType::EntityCreated => "entity.created",
            EngineEventType::EntityUpdated => "entity.updated",
            EngineEventType::EntityDeleted => "entity.deleted",
            EngineEventType::EntitySuspended => "entity.suspended",
            EngineEventType::EntityActivated => "entity.activated",
            EngineEventType::JobExecutionSuccess => "job.execution.success",
            EngineEventType::JobExecutionFailure => "job.execution.failure",
            EngineEventType::JobRetriesDecremented => "job.retries.decremented",
            EngineEventType::JobMovedToDeadLetter => "job.moved_to_dead_letter",
            EngineEventType::JobRetryConfigurationError => "job.retry_configuration_error",
        }
    }

    /// Events that should reach an operator.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EngineEventType::JobExecutionFailure
                | EngineEventType::JobMovedToDeadLetter
                | EngineEventType::JobRetryConfigurationError
        )
    }
}

impl fmt::Display for EngineEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
