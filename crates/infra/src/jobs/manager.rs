//! Job manager: moves jobs between their four stores inside a command.
//!
//! A move is always delete-from-old plus insert-into-new in the same entity
//! session, so it becomes durable atomically when the context flushes. The
//! job id never changes; the new row starts unlocked, one revision past
//! the row it replaces.

use tracing::debug;

use procflow_core::{EngineResult, JobEntity, JobId, JobTable, JobType};
use procflow_events::{EngineEvent, EngineEventType, EntityRef};

use crate::command::CommandContext;

pub struct JobManager<'a> {
    ctx: &'a mut CommandContext,
}

impl<'a> JobManager<'a> {
    pub fn new(ctx: &'a mut CommandContext) -> Self {
        Self { ctx }
    }

    /// Store a new job where it belongs: timers in the timer store, messages
    /// in the executable store, anything of a suspended process instance in
    /// the suspended store.
    pub fn create_job(&mut self, mut job: JobEntity) -> EngineResult<JobTable> {
        let mut table = Self::origin_table(&job);

        if let Some(process_instance_id) = job.process_instance_id {
            let suspended = self
                .ctx
                .entities()?
                .find_execution(process_instance_id)?
                .is_some_and(|instance| instance.is_suspended());
            if suspended {
                job.suspended_from = Some(table);
                table = JobTable::Suspended;
            }
        }

        job.revision = 1;
        debug!(job_id = %job.id, table = %table, handler = %job.job_handler_type, "creating job");
        let event = EngineEvent::new(EngineEventType::EntityCreated, EntityRef::job(&job), self.ctx.now());
        self.ctx.entities()?.insert_job(table, job)?;
        self.ctx.dispatch(event);
        Ok(table)
    }

    /// Promote a due timer into the executable store.
    pub fn move_timer_to_executable(&mut self, timer: &JobEntity) -> EngineResult<JobEntity> {
        self.move_job(timer, JobTable::Timer, JobTable::Executable)
    }

    /// Delete `job` (as read) from `from` and insert a copy into `to`.
    ///
    /// `job` may carry modifications; only its revision must be the one it
    /// was read at.
    pub fn move_job(&mut self, job: &JobEntity, from: JobTable, to: JobTable) -> EngineResult<JobEntity> {
        let entities = self.ctx.entities()?;
        entities.delete_job(from, job)?;

        let mut moved = job.clone();
        moved.revision = job.revision + 1;
        moved.clear_lock();
        if to != JobTable::Suspended {
            moved.suspended_from = None;
        }
        entities.insert_job(to, moved.clone())?;

        debug!(job_id = %job.id, from = %from, to = %to, "moved job");
        Ok(moved)
    }

    pub fn move_to_dead_letter(&mut self, job: &JobEntity, from: JobTable) -> EngineResult<JobEntity> {
        self.move_job(job, from, JobTable::DeadLetter)
    }

    /// Park a timer or executable job, remembering where it came from.
    pub fn suspend_job(&mut self, job: &JobEntity, from: JobTable) -> EngineResult<JobEntity> {
        let mut tagged = job.clone();
        tagged.suspended_from = Some(from);
        self.move_job(&tagged, from, JobTable::Suspended)
    }

    /// Restore a suspended job to the store it was parked from.
    pub fn activate_job(&mut self, job: &JobEntity) -> EngineResult<JobEntity> {
        let target = job.suspended_from.unwrap_or_else(|| Self::origin_table(job));
        self.move_job(job, JobTable::Suspended, target)
    }

    pub fn delete_job(&mut self, table: JobTable, job: &JobEntity) -> EngineResult<()> {
        self.ctx.entities()?.delete_job(table, job)?;
        let event = EngineEvent::new(EngineEventType::EntityDeleted, EntityRef::job(job), self.ctx.now());
        self.ctx.dispatch(event);
        Ok(())
    }

    /// Look a job up in every store.
    pub fn find_job_anywhere(&mut self, id: JobId) -> EngineResult<Option<(JobTable, JobEntity)>> {
        let entities = self.ctx.entities()?;
        for table in JobTable::ALL {
            if let Some(job) = entities.find_job(table, id)? {
                return Ok(Some((table, job)));
            }
        }
        Ok(None)
    }

    /// Release the lock on an executable job so any worker can acquire it.
    pub fn unacquire(&mut self, id: JobId) -> EngineResult<bool> {
        let entities = self.ctx.entities()?;
        let Some(mut job) = entities.find_job(JobTable::Executable, id)? else {
            return Ok(false);
        };
        if job.lock_owner.is_none() {
            return Ok(false);
        }
        job.clear_lock();
        entities.update_job(JobTable::Executable, job)?;
        Ok(true)
    }

    fn origin_table(job: &JobEntity) -> JobTable {
        match job.job_type {
            JobType::Timer => JobTable::Timer,
            JobType::Message => JobTable::Executable,
        }
    }
}
