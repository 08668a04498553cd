//! Acquisition commands used by the async executor.
//!
//! Acquisition is split into one read-only query and one conditional update
//! per candidate: losing a race on one candidate (optimistic-lock conflict
//! at flush) never costs the rest of the batch.

use chrono::Duration;
use tracing::debug;

use procflow_core::{EngineResult, ExecutionId, JobEntity, JobId, JobTable};

use crate::command::{Command, CommandContext};
use crate::persistence::JobQuery;

/// Due, unlocked timers, oldest first.
#[derive(Debug, Clone, Copy)]
pub struct AcquireTimerJobsCmd {
    pub limit: usize,
}

impl Command for AcquireTimerJobsCmd {
    type Output = Vec<JobId>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<JobId>> {
        let now = ctx.now();
        let query = JobQuery::new().due_at(now).lock_free_at(now).limit(self.limit);
        let timers = ctx.entities()?.find_jobs(JobTable::Timer, &query)?;
        Ok(timers.into_iter().map(|job| job.id).collect())
    }
}

/// Locks one due timer for `lock_owner` while it is being promoted.
///
/// Same conditional update as [`LockJobCmd`], on the timer store: of two
/// acquisition threads racing for a timer only one gets `Some`.
#[derive(Debug, Clone)]
pub struct LockTimerJobCmd {
    pub job_id: JobId,
    pub lock_owner: String,
    pub lock_time: Duration,
}

impl Command for LockTimerJobCmd {
    type Output = Option<JobEntity>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Option<JobEntity>> {
        let now = ctx.now();
        let entities = ctx.entities()?;
        let Some(mut timer) = entities.find_job(JobTable::Timer, self.job_id)? else {
            return Ok(None);
        };
        if !timer.is_due(now) || timer.is_locked(now) {
            debug!(job_id = %timer.id, lock_owner = ?timer.lock_owner, "timer not acquirable");
            return Ok(None);
        }

        timer.lock(self.lock_owner.clone(), now + self.lock_time);
        entities.update_job(JobTable::Timer, timer.clone())?;
        Ok(Some(timer))
    }
}

/// Moves one due timer into the executable store.
///
/// `None` when the timer is gone, not yet due, or locked by someone other
/// than `lock_owner`. Without a lock owner any unexpired lock blocks the
/// move. The executable row starts unlocked.
#[derive(Debug, Clone)]
pub struct MoveTimerToExecutableCmd {
    pub job_id: JobId,
    pub lock_owner: Option<String>,
}

impl MoveTimerToExecutableCmd {
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

impl Command for MoveTimerToExecutableCmd {
    type Output = Option<JobEntity>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Option<JobEntity>> {
        let now = ctx.now();
        let Some(timer) = ctx.entities()?.find_job(JobTable::Timer, self.job_id)? else {
            return Ok(None);
        };
        let blocked = match &self.lock_owner {
            Some(owner) => timer.is_locked_by_other(owner, now),
            None => timer.is_locked(now),
        };
        if !timer.is_due(now) || blocked {
            return Ok(None);
        }
        ctx.job_manager().move_timer_to_executable(&timer).map(Some)
    }
}

/// Candidate executable jobs: due, unlocked, with retries left.
#[derive(Debug, Clone, Copy)]
pub struct AcquireJobsCmd {
    pub limit: usize,
}

impl Command for AcquireJobsCmd {
    type Output = Vec<JobId>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<JobId>> {
        let now = ctx.now();
        let jobs = ctx
            .entities()?
            .find_jobs(JobTable::Executable, &JobQuery::acquirable(now, self.limit))?;
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }
}

/// Locks one executable job for `lock_owner`.
///
/// The lock is a conditional update on the job's revision: when two workers
/// race, the loser's flush fails, the retry interceptor re-runs the command,
/// and the re-run sees the winner's lock and returns `None`.
#[derive(Debug, Clone)]
pub struct LockJobCmd {
    pub job_id: JobId,
    pub lock_owner: String,
    pub lock_time: Duration,
}

impl Command for LockJobCmd {
    type Output = Option<JobEntity>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Option<JobEntity>> {
        let now = ctx.now();
        let entities = ctx.entities()?;
        let Some(mut job) = entities.find_job(JobTable::Executable, self.job_id)? else {
            return Ok(None);
        };
        if job.is_locked(now) || !job.is_due(now) || job.retries == 0 {
            debug!(job_id = %job.id, lock_owner = ?job.lock_owner, "job not acquirable");
            return Ok(None);
        }

        job.lock(self.lock_owner.clone(), now + self.lock_time);
        entities.update_job(JobTable::Executable, job.clone())?;
        Ok(Some(job))
    }
}

/// Releases a job lock so the job can be acquired again.
#[derive(Debug, Clone, Copy)]
pub struct UnacquireJobCmd {
    pub job_id: JobId,
}

impl Command for UnacquireJobCmd {
    type Output = bool;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        ctx.job_manager().unacquire(self.job_id)
    }
}

/// Takes the durable exclusive-execution token of a process instance.
///
/// The token lives in the lock fields of the process-instance execution, so
/// exclusive jobs of one instance never overlap even across workers.
/// `false` when another owner holds an unexpired token.
#[derive(Debug, Clone)]
pub struct LockExclusiveJobCmd {
    pub process_instance_id: ExecutionId,
    pub lock_owner: String,
    pub lock_time: Duration,
}

impl Command for LockExclusiveJobCmd {
    type Output = bool;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let now = ctx.now();
        let entities = ctx.entities()?;
        let Some(mut instance) = entities.find_execution(self.process_instance_id)? else {
            // Nothing to serialize against.
            return Ok(true);
        };
        if instance.is_locked_by_other(&self.lock_owner, now) {
            debug!(
                process_instance_id = %self.process_instance_id,
                holder = ?instance.lock_owner,
                "process instance is locked by another worker"
            );
            return Ok(false);
        }

        instance.lock_owner = Some(self.lock_owner.clone());
        instance.lock_expiration_time = Some(now + self.lock_time);
        entities.update_execution(instance)?;
        Ok(true)
    }
}

/// Releases the exclusive token if `lock_owner` holds it.
#[derive(Debug, Clone)]
pub struct UnlockExclusiveJobCmd {
    pub process_instance_id: ExecutionId,
    pub lock_owner: String,
}

impl Command for UnlockExclusiveJobCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let entities = ctx.entities()?;
        if let Some(mut instance) = entities.find_execution(self.process_instance_id)? {
            if instance.lock_owner.as_deref() == Some(self.lock_owner.as_str()) {
                instance.lock_owner = None;
                instance.lock_expiration_time = None;
                entities.update_execution(instance)?;
            }
        }
        Ok(())
    }
}
