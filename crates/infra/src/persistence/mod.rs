//! Persistence boundary.
//!
//! The engine never talks to a database directly. Reads go through
//! [`DataStore`] finders; writes are buffered by the per-command
//! [`EntitySession`] and handed to the store as one atomic [`WriteBatch`]
//! when the command context closes.

pub mod in_memory;
pub mod session;

use core::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use procflow_core::entity::PersistentState;
use procflow_core::{
    Entity, EngineResult, ExecutionEntity, ExecutionId, JobEntity, JobId, JobTable, TaskEntity,
    TaskId,
};

pub use in_memory::InMemoryDataStore;
pub use session::EntitySession;

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Job(JobTable, JobEntity),
    Execution(ExecutionEntity),
    Task(TaskEntity),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Job(table, job) => RecordKey::Job(*table, job.id),
            Record::Execution(execution) => RecordKey::Execution(execution.id),
            Record::Task(task) => RecordKey::Task(task.id),
        }
    }

    pub fn revision(&self) -> u32 {
        match self {
            Record::Job(_, job) => job.revision,
            Record::Execution(execution) => execution.revision,
            Record::Task(task) => task.revision,
        }
    }

    pub fn set_revision(&mut self, revision: u32) {
        match self {
            Record::Job(_, job) => job.set_revision(revision),
            Record::Execution(execution) => execution.set_revision(revision),
            Record::Task(task) => task.set_revision(revision),
        }
    }

    pub fn persistent_state(&self) -> PersistentState {
        match self {
            Record::Job(_, job) => job.persistent_state(),
            Record::Execution(execution) => execution.persistent_state(),
            Record::Task(task) => task.persistent_state(),
        }
    }

    pub fn into_job(self) -> Option<JobEntity> {
        match self {
            Record::Job(_, job) => Some(job),
            _ => None,
        }
    }

    pub fn into_execution(self) -> Option<ExecutionEntity> {
        match self {
            Record::Execution(execution) => Some(execution),
            _ => None,
        }
    }

    pub fn into_task(self) -> Option<TaskEntity> {
        match self {
            Record::Task(task) => Some(task),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Record::Job(table, job) => format!("{table}: {}", job.describe()),
            Record::Execution(execution) => execution.describe(),
            Record::Task(task) => task.describe(),
        }
    }
}

/// Primary key of a row, including the job store it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Job(JobTable, JobId),
    Execution(ExecutionId),
    Task(TaskId),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Job(table, id) => write!(f, "{table} {id}"),
            RecordKey::Execution(id) => write!(f, "execution {id}"),
            RecordKey::Task(id) => write!(f, "task {id}"),
        }
    }
}

/// Writes of one command context, applied all-or-nothing.
///
/// Applied in order: inserts, then updates, then deletes. Updates and
/// deletes carry the revision they were read at; a mismatch (or a duplicate
/// insert) rejects the whole batch with an optimistic-lock error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub inserts: Vec<Record>,
    pub updates: Vec<Record>,
    pub deletes: Vec<(RecordKey, u32)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, record: Record) -> Self {
        self.inserts.push(record);
        self
    }

    pub fn update(mut self, record: Record) -> Self {
        self.updates.push(record);
        self
    }

    pub fn delete(mut self, key: RecordKey, revision: u32) -> Self {
        self.deletes.push((key, revision));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// Predicate for job finders. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub process_instance_id: Option<ExecutionId>,
    pub execution_id: Option<ExecutionId>,
    pub handler_type: Option<String>,
    /// Only jobs due at this instant (no due date counts as due).
    pub due_at: Option<DateTime<Utc>>,
    /// Only jobs without an unexpired lock at this instant.
    pub lock_free_at: Option<DateTime<Utc>>,
    /// Only jobs with `retries > 0`.
    pub with_retries: bool,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_process_instance(process_instance_id: ExecutionId) -> Self {
        Self {
            process_instance_id: Some(process_instance_id),
            ..Self::default()
        }
    }

    /// Acquirable at `now`: due, unlocked and not out of retries.
    pub fn acquirable(now: DateTime<Utc>, limit: usize) -> Self {
        Self {
            due_at: Some(now),
            lock_free_at: Some(now),
            with_retries: true,
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn handler_type(mut self, handler_type: impl Into<String>) -> Self {
        self.handler_type = Some(handler_type.into());
        self
    }

    pub fn due_at(mut self, now: DateTime<Utc>) -> Self {
        self.due_at = Some(now);
        self
    }

    pub fn lock_free_at(mut self, now: DateTime<Utc>) -> Self {
        self.lock_free_at = Some(now);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &JobEntity) -> bool {
        self.process_instance_id
            .is_none_or(|id| job.process_instance_id == Some(id))
            && self.execution_id.is_none_or(|id| job.execution_id == Some(id))
            && self
                .handler_type
                .as_deref()
                .is_none_or(|handler| job.job_handler_type == handler)
            && self.due_at.is_none_or(|now| job.is_due(now))
            && self.lock_free_at.is_none_or(|now| !job.is_locked(now))
            && (!self.with_retries || job.retries > 0)
    }

    /// Sort oldest-due-first and apply the limit.
    pub fn finish(&self, mut jobs: Vec<JobEntity>) -> Vec<JobEntity> {
        jobs.sort_by_key(JobEntity::acquisition_key);
        if let Some(limit) = self.limit {
            jobs.truncate(limit);
        }
        jobs
    }
}

/// The durable store behind the engine (the SQL mapping layer in a
/// database-backed deployment).
pub trait DataStore: Send + Sync {
    fn find_job(&self, table: JobTable, id: JobId) -> EngineResult<Option<JobEntity>>;

    /// Jobs of one store matching `query`, oldest-due-first.
    fn find_jobs(&self, table: JobTable, query: &JobQuery) -> EngineResult<Vec<JobEntity>>;

    fn find_execution(&self, id: ExecutionId) -> EngineResult<Option<ExecutionEntity>>;

    /// Every execution of a process instance, the root included.
    fn find_executions_by_process_instance(
        &self,
        process_instance_id: ExecutionId,
    ) -> EngineResult<Vec<ExecutionEntity>>;

    fn find_tasks_by_process_instance(
        &self,
        process_instance_id: ExecutionId,
    ) -> EngineResult<Vec<TaskEntity>>;

    /// Apply a batch atomically.
    fn commit(&self, batch: WriteBatch) -> EngineResult<()>;
}

impl<S> DataStore for Arc<S>
where
    S: DataStore + ?Sized,
{
    fn find_job(&self, table: JobTable, id: JobId) -> EngineResult<Option<JobEntity>> {
        (**self).find_job(table, id)
    }

    fn find_jobs(&self, table: JobTable, query: &JobQuery) -> EngineResult<Vec<JobEntity>> {
        (**self).find_jobs(table, query)
    }

    fn find_execution(&self, id: ExecutionId) -> EngineResult<Option<ExecutionEntity>> {
        (**self).find_execution(id)
    }

    fn find_executions_by_process_instance(
        &self,
        process_instance_id: ExecutionId,
    ) -> EngineResult<Vec<ExecutionEntity>> {
        (**self).find_executions_by_process_instance(process_instance_id)
    }

    fn find_tasks_by_process_instance(
        &self,
        process_instance_id: ExecutionId,
    ) -> EngineResult<Vec<TaskEntity>> {
        (**self).find_tasks_by_process_instance(process_instance_id)
    }

    fn commit(&self, batch: WriteBatch) -> EngineResult<()> {
        (**self).commit(batch)
    }
}
