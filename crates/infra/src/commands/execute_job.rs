use anyhow::anyhow;
use serde_json::json;
use tracing::{debug, warn};

use procflow_core::{EngineError, EngineResult, Entity, JobEntity, JobId, JobTable};
use procflow_events::{EngineEvent, EngineEventType, EntityRef};

use crate::command::{Command, CommandConfig, CommandContext, CommandExecutor};

use super::job_retry::{FailureDetails, RetryOutcome};

/// Runs one executable job by id.
///
/// The job is re-read inside the command; one that has vanished (deleted,
/// suspended, executed elsewhere) or is now locked by another worker is a
/// no-op. Handler failures surface as [`EngineError::JobExecution`] and
/// leave the job untouched; [`run_job`] routes them to the retry command.
#[derive(Debug, Clone)]
pub struct ExecuteAsyncJobCmd {
    pub job_id: JobId,
    /// Worker that acquired the job, if any.
    pub lock_owner: Option<String>,
}

impl ExecuteAsyncJobCmd {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            lock_owner: None,
        }
    }

    pub fn locked_by(job_id: JobId, lock_owner: impl Into<String>) -> Self {
        Self {
            job_id,
            lock_owner: Some(lock_owner.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExecutionOutcome {
    Executed,
    /// The job no longer exists in the executable store.
    Missing,
    /// Another worker holds the lock now.
    LockLost,
}

impl Command for ExecuteAsyncJobCmd {
    type Output = JobExecutionOutcome;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobExecutionOutcome> {
        let now = ctx.now();
        let Some(job) = ctx.entities()?.find_job(JobTable::Executable, self.job_id)? else {
            debug!(job_id = %self.job_id, "job no longer exists, nothing to execute");
            return Ok(JobExecutionOutcome::Missing);
        };

        if let Some(owner) = &self.lock_owner {
            if job.is_locked_by_other(owner, now) {
                debug!(job_id = %job.id, lock_owner = ?job.lock_owner, "job was acquired by another worker");
                return Ok(JobExecutionOutcome::LockLost);
            }
        }

        let handler = ctx
            .services()
            .handlers
            .resolve(&job.job_handler_type)
            .ok_or_else(|| EngineError::JobExecution {
                job_id: job.id,
                cause: anyhow!("no job handler registered for type '{}'", job.job_handler_type),
            })?;

        handler
            .execute(&job, job.job_handler_configuration.as_deref(), ctx)
            .map_err(|cause| EngineError::JobExecution { job_id: job.id, cause })?;

        // The handler may have touched the row; delete whatever this context sees now.
        let current = ctx.entities()?.find_job(JobTable::Executable, job.id)?;
        if let Some(current) = current {
            ctx.job_manager().delete_job(JobTable::Executable, &current)?;
        }

        ctx.dispatch(EngineEvent::new(
            EngineEventType::JobExecutionSuccess,
            EntityRef::job(&job),
            ctx.now(),
        ));
        debug!(job_id = %job.id, handler = %job.job_handler_type, "job executed");
        Ok(JobExecutionOutcome::Executed)
    }
}

/// How one job run ended after failures were handed to the retry command.
#[derive(Debug)]
pub enum JobRunOutcome {
    Completed(JobExecutionOutcome),
    /// The handler failed and the failure was recorded.
    Failed { failure: FailureDetails, retry: RetryOutcome },
    /// The handler failed and recording the failure failed too. The job
    /// stays executable and locked until its lock expires.
    FailureNotRecorded { failure: FailureDetails, error: EngineError },
}

impl JobRunOutcome {
    pub fn retry(&self) -> Option<&RetryOutcome> {
        match self {
            JobRunOutcome::Failed { retry, .. } => Some(retry),
            _ => None,
        }
    }
}

/// Runs `command` and hands any failure to the engine's failed-job command.
///
/// The failed-job command runs in a new context, so nothing the failed
/// execution wrote is part of it. An optimistic-lock conflict on the
/// execution itself is returned as the error: the job changed underneath
/// and belongs to whoever changed it.
pub fn run_job(executor: &CommandExecutor, command: &ExecuteAsyncJobCmd) -> EngineResult<JobRunOutcome> {
    let error = match executor.execute(command) {
        Ok(outcome) => return Ok(JobRunOutcome::Completed(outcome)),
        Err(e) if e.is_optimistic_lock() => return Err(e),
        Err(e) => e,
    };

    let services = executor.services();
    let job_id = command.job_id;
    warn!(job_id = %job_id, error = %error, "job execution failed");
    let failure = FailureDetails::from_engine_error(&error);
    let message = failure.message.clone();

    let retry_command = services
        .failed_job_commands
        .failed_job_command(job_id, failure.clone());
    let outcome = match executor.execute_with(CommandConfig::requires_new(), &retry_command) {
        Ok(retry) => JobRunOutcome::Failed { failure, retry },
        Err(error) => {
            warn!(job_id = %job_id, error = %error, "failed to record job failure");
            JobRunOutcome::FailureNotRecorded { failure, error }
        }
    };

    if services.events.is_enabled() {
        let entity = outcome
            .retry()
            .and_then(RetryOutcome::job)
            .map_or_else(|| job_ref(job_id), EntityRef::job);
        let event = EngineEvent::new(EngineEventType::JobExecutionFailure, entity, services.clock.now())
            .with_detail(json!({ "message": message }));
        services.events.dispatch(event);
    }
    Ok(outcome)
}

fn job_ref(job_id: JobId) -> EntityRef {
    EntityRef::new(JobEntity::SCHEMA.table, job_id, None)
}
