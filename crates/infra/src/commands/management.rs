//! Operator-facing job commands.

use tracing::info;

use procflow_core::{EngineError, EngineResult, JobEntity, JobId, JobTable};
use procflow_events::{EngineEvent, EngineEventType, EntityRef};

use crate::command::{Command, CommandContext};
use crate::persistence::JobQuery;

/// Stores a new job; returns the store it landed in.
#[derive(Debug, Clone)]
pub struct CreateJobCmd {
    pub job: JobEntity,
}

impl Command for CreateJobCmd {
    type Output = JobTable;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobTable> {
        ctx.job_manager().create_job(self.job.clone())
    }
}

/// Resubmits a dead-letter job with fresh retries and cleared failure data.
#[derive(Debug, Clone, Copy)]
pub struct MoveDeadLetterJobToExecutableCmd {
    pub job_id: JobId,
    pub retries: u32,
}

impl Command for MoveDeadLetterJobToExecutableCmd {
    type Output = JobEntity;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobEntity> {
        if self.retries == 0 {
            return Err(EngineError::invalid_argument("retries must be at least 1"));
        }
        let job = ctx
            .entities()?
            .find_job(JobTable::DeadLetter, self.job_id)?
            .ok_or_else(|| EngineError::not_found("dead-letter job", self.job_id))?;

        let suspended = match job.process_instance_id {
            Some(id) => ctx.entities()?.find_execution(id)?.is_some_and(|pi| pi.is_suspended()),
            None => false,
        };

        let mut revived = job;
        revived.retries = self.retries;
        revived.due_date = None;
        revived.clear_failure();

        // A suspended instance gets the job back on activation.
        let target = if suspended {
            revived.suspended_from = Some(JobTable::Executable);
            JobTable::Suspended
        } else {
            JobTable::Executable
        };
        let moved = ctx.job_manager().move_job(&revived, JobTable::DeadLetter, target)?;

        info!(job_id = %moved.id, retries = moved.retries, "dead-letter job resubmitted");
        ctx.dispatch(EngineEvent::new(EngineEventType::EntityUpdated, EntityRef::job(&moved), ctx.now()));
        Ok(moved)
    }
}

/// Sets the retries of a timer, executable or suspended job.
#[derive(Debug, Clone, Copy)]
pub struct SetJobRetriesCmd {
    pub job_id: JobId,
    pub retries: u32,
}

impl Command for SetJobRetriesCmd {
    type Output = JobEntity;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobEntity> {
        let (table, mut job) = ctx
            .job_manager()
            .find_job_anywhere(self.job_id)?
            .ok_or_else(|| EngineError::not_found("job", self.job_id))?;
        if table == JobTable::DeadLetter {
            return Err(EngineError::invalid_argument(format!(
                "job {} is a dead letter; resubmit it instead",
                self.job_id
            )));
        }

        job.retries = self.retries;
        ctx.entities()?.update_job(table, job.clone())?;
        ctx.dispatch(EngineEvent::new(EngineEventType::EntityUpdated, EntityRef::job(&job), ctx.now()));
        Ok(job)
    }
}

/// Deletes a job from whichever store holds it.
///
/// A job locked by a worker is being executed and cannot be deleted.
#[derive(Debug, Clone, Copy)]
pub struct DeleteJobCmd {
    pub job_id: JobId,
}

impl Command for DeleteJobCmd {
    type Output = JobTable;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobTable> {
        let now = ctx.now();
        let (table, job) = ctx
            .job_manager()
            .find_job_anywhere(self.job_id)?
            .ok_or_else(|| EngineError::not_found("job", self.job_id))?;
        if job.is_locked(now) {
            return Err(EngineError::invalid_argument(format!(
                "job {} is locked by {} and cannot be deleted",
                job.id,
                job.lock_owner.as_deref().unwrap_or("unknown")
            )));
        }

        ctx.job_manager().delete_job(table, &job)?;
        info!(job_id = %job.id, table = %table, "job deleted");
        Ok(table)
    }
}

/// Read-only job query over one store, or all four.
#[derive(Debug, Clone, Default)]
pub struct FindJobsCmd {
    pub table: Option<JobTable>,
    pub query: JobQuery,
}

impl FindJobsCmd {
    pub fn new(table: Option<JobTable>, query: JobQuery) -> Self {
        Self { table, query }
    }
}

impl Command for FindJobsCmd {
    type Output = Vec<(JobTable, JobEntity)>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<(JobTable, JobEntity)>> {
        let tables = match self.table {
            Some(table) => vec![table],
            None => JobTable::ALL.to_vec(),
        };
        let entities = ctx.entities()?;
        let mut found = Vec::new();
        for table in tables {
            found.extend(
                entities
                    .find_jobs(table, &self.query)?
                    .into_iter()
                    .map(|job| (table, job)),
            );
        }
        Ok(found)
    }
}
