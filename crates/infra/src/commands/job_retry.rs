//! Failure handling for executed jobs.

use serde_json::json;
use tracing::{debug, error, warn};

use procflow_core::{EngineError, EngineResult, JobEntity, JobId, JobTable};
use procflow_events::{EngineEvent, EngineEventType, EntityRef};

use crate::command::{Command, CommandContext};
use crate::jobs::retry::{RetryPlan, plan_retry};

/// What went wrong, as stamped onto the failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    pub message: String,
    pub stacktrace: String,
}

impl FailureDetails {
    pub fn new(message: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: stacktrace.into(),
        }
    }

    /// Display text as the message, the debug rendering (error chain and
    /// backtrace, when captured) as the stacktrace.
    pub fn from_error(error: &anyhow::Error) -> Self {
        Self::new(error.to_string(), format!("{error:?}"))
    }

    pub fn from_engine_error(error: &EngineError) -> Self {
        match error {
            EngineError::JobExecution { cause, .. } => Self::from_error(cause),
            other => Self::new(other.to_string(), format!("{other:?}")),
        }
    }
}

/// Where a failed job ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in the timer store, due again later.
    Rescheduled { job: JobEntity },
    DeadLettered { job: JobEntity },
    /// The job disappeared before the failure could be recorded.
    Missing,
}

impl RetryOutcome {
    pub fn job(&self) -> Option<&JobEntity> {
        match self {
            RetryOutcome::Rescheduled { job } | RetryOutcome::DeadLettered { job } => Some(job),
            RetryOutcome::Missing => None,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, RetryOutcome::DeadLettered { .. })
    }
}

/// Records a job failure and reschedules or dead-letters the job.
///
/// Retries and the next due date come from the retry policy
/// ([`plan_retry`]). The executable row is replaced by a timer or
/// dead-letter row in the same command. A malformed retry cycle
/// dead-letters the job and reports the configuration error.
#[derive(Debug, Clone)]
pub struct JobRetryCmd {
    pub job_id: JobId,
    pub failure: Option<FailureDetails>,
}

impl JobRetryCmd {
    pub fn new(job_id: JobId, failure: Option<FailureDetails>) -> Self {
        Self { job_id, failure }
    }
}

impl Command for JobRetryCmd {
    type Output = RetryOutcome;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<RetryOutcome> {
        let now = ctx.now();
        let Some(job) = ctx.entities()?.find_job(JobTable::Executable, self.job_id)? else {
            debug!(job_id = %self.job_id, "failed job no longer exists");
            return Ok(RetryOutcome::Missing);
        };

        let execution = match job.execution_id {
            Some(execution_id) => ctx.entities()?.find_execution(execution_id)?,
            None => None,
        };
        let cycle = ctx
            .services()
            .retry_cycles
            .failed_job_retry_time_cycle(&job, execution.as_ref());

        let plan = match plan_retry(&job, cycle.as_deref(), now, ctx.config()) {
            Ok(plan) => plan,
            Err(err @ EngineError::InvalidRetryCycle { .. }) => {
                error!(job_id = %job.id, error = %err, "invalid retry time cycle, moving job to dead letter");
                ctx.dispatch(
                    EngineEvent::new(EngineEventType::JobRetryConfigurationError, EntityRef::job(&job), now)
                        .with_detail(json!({ "cycle": cycle, "error": err.to_string() })),
                );
                RetryPlan {
                    target: JobTable::DeadLetter,
                    retries: 0,
                    due_date: None,
                }
            }
            Err(other) => return Err(other),
        };

        let mut failed = job.clone();
        match &self.failure {
            Some(failure) => failed.record_failure(failure.message.clone(), failure.stacktrace.clone()),
            None => failed.failure_count += 1,
        }
        failed.retries = plan.retries;
        if let Some(due_date) = plan.due_date {
            failed.due_date = Some(due_date);
        }

        let moved = ctx
            .job_manager()
            .move_job(&failed, JobTable::Executable, plan.target)?;

        let entity = EntityRef::job(&moved);
        ctx.dispatch(EngineEvent::new(EngineEventType::EntityUpdated, entity.clone(), now));
        ctx.dispatch(
            EngineEvent::new(EngineEventType::JobRetriesDecremented, entity.clone(), now)
                .with_detail(json!({ "retries": moved.retries, "due_date": moved.due_date })),
        );

        if plan.is_dead_letter() {
            error!(
                job_id = %moved.id,
                handler = %moved.job_handler_type,
                failures = moved.failure_count,
                exception = ?moved.exception_message,
                "job moved to dead letter"
            );
            ctx.dispatch(
                EngineEvent::new(EngineEventType::JobMovedToDeadLetter, entity, now)
                    .with_detail(json!({ "exception_message": moved.exception_message })),
            );
            Ok(RetryOutcome::DeadLettered { job: moved })
        } else {
            warn!(
                job_id = %moved.id,
                retries = moved.retries,
                due_date = ?moved.due_date,
                "job failed, rescheduled"
            );
            Ok(RetryOutcome::Rescheduled { job: moved })
        }
    }
}

/// Produces the command run after a job handler fails.
pub trait FailedJobCommandFactory: Send + Sync {
    fn failed_job_command(
        &self,
        job_id: JobId,
        failure: FailureDetails,
    ) -> Box<dyn Command<Output = RetryOutcome> + Send>;
}

/// Produces a [`JobRetryCmd`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFailedJobCommandFactory;

impl FailedJobCommandFactory for DefaultFailedJobCommandFactory {
    fn failed_job_command(
        &self,
        job_id: JobId,
        failure: FailureDetails,
    ) -> Box<dyn Command<Output = RetryOutcome> + Send> {
        Box::new(JobRetryCmd::new(job_id, Some(failure)))
    }
}
