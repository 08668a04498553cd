//! Job entity and the stores it moves between.
//!
//! A job is one conceptual entity that lives in exactly one of four stores at
//! a time ([`JobTable`]). Moving between stores is always delete-old plus
//! insert-new inside one command; the id stays the same.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntitySchema, FieldDescriptor, opt};
use crate::id::{ExecutionId, JobId, TenantId};

/// Retries a freshly created job starts with.
pub const DEFAULT_JOB_RETRIES: u32 = 3;

/// The store a job currently lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTable {
    /// Scheduled; due date may lie in the future.
    Timer,
    /// Due now and eligible for acquisition.
    Executable,
    /// Parked while the owning process instance is suspended.
    Suspended,
    /// Retries exhausted; waits for operator action.
    DeadLetter,
}

impl JobTable {
    pub const ALL: [JobTable; 4] = [
        JobTable::Executable,
        JobTable::Timer,
        JobTable::Suspended,
        JobTable::DeadLetter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobTable::Timer => "timer job",
            JobTable::Executable => "job",
            JobTable::Suspended => "suspended job",
            JobTable::DeadLetter => "dead-letter job",
        }
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What kind of work created the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Asynchronous continuation; runnable as soon as it is created.
    Message,
    /// Timer; runnable once its due date passes.
    Timer,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Message => f.write_str("message"),
            JobType::Timer => f.write_str("timer"),
        }
    }
}

/// A durable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: JobId,
    pub revision: u32,
    pub job_type: JobType,

    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ExecutionId>,
    pub process_definition_id: Option<String>,

    /// Selects the handler that resumes the job.
    pub job_handler_type: String,
    /// Opaque payload for the handler.
    pub job_handler_configuration: Option<String>,

    /// `None` means "runnable now".
    pub due_date: Option<DateTime<Utc>>,
    pub retries: u32,
    /// Number of failed executions recorded so far.
    pub failure_count: u32,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,

    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,

    pub exclusive: bool,
    /// Store the job was parked from; only set while suspended.
    pub suspended_from: Option<JobTable>,
    pub tenant_id: Option<TenantId>,
    pub create_time: DateTime<Utc>,
}

impl JobEntity {
    /// Create an asynchronous-continuation job, runnable immediately.
    pub fn message(handler_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            revision: 1,
            job_type: JobType::Message,
            execution_id: None,
            process_instance_id: None,
            process_definition_id: None,
            job_handler_type: handler_type.into(),
            job_handler_configuration: None,
            due_date: None,
            retries: DEFAULT_JOB_RETRIES,
            failure_count: 0,
            exception_message: None,
            exception_stacktrace: None,
            lock_owner: None,
            lock_expiration_time: None,
            exclusive: true,
            suspended_from: None,
            tenant_id: None,
            create_time: now,
        }
    }

    /// Create a timer job due at `due`.
    pub fn timer(handler_type: impl Into<String>, due: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            job_type: JobType::Timer,
            due_date: Some(due),
            ..Self::message(handler_type, now)
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.job_handler_configuration = Some(configuration.into());
        self
    }

    /// Attach the job to an execution of a process instance.
    pub fn for_execution(mut self, execution_id: ExecutionId, process_instance_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_process_definition(mut self, process_definition_id: impl Into<String>) -> Self {
        self.process_definition_id = Some(process_definition_id.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Due at `now` (no due date counts as due).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Holds an unexpired lock at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|until| until > now)
    }

    /// Holds an unexpired lock owned by someone other than `owner`.
    pub fn is_locked_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.is_locked(now) && self.lock_owner.as_deref() != Some(owner)
    }

    pub fn lock(&mut self, owner: impl Into<String>, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration_time = Some(until);
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    /// Stamp a failed execution onto the job.
    pub fn record_failure(&mut self, message: impl Into<String>, stacktrace: impl Into<String>) {
        self.failure_count += 1;
        self.exception_message = Some(message.into());
        self.exception_stacktrace = Some(stacktrace.into());
    }

    pub fn clear_failure(&mut self) {
        self.failure_count = 0;
        self.exception_message = None;
        self.exception_stacktrace = None;
    }

    /// Sort key for oldest-due-first acquisition.
    pub fn acquisition_key(&self) -> (DateTime<Utc>, JobId) {
        (self.due_date.unwrap_or(self.create_time), self.id)
    }
}

impl Entity for JobEntity {
    type Id = JobId;

    const SCHEMA: EntitySchema<Self> = EntitySchema {
        table: "job",
        fields: &[
            FieldDescriptor { name: "id", read: |job| job.id.to_string() },
            FieldDescriptor { name: "job_type", read: |job| job.job_type.to_string() },
            FieldDescriptor { name: "execution_id", read: |job| opt(&job.execution_id) },
            FieldDescriptor { name: "process_instance_id", read: |job| opt(&job.process_instance_id) },
            FieldDescriptor { name: "process_definition_id", read: |job| opt(&job.process_definition_id) },
            FieldDescriptor { name: "job_handler_type", read: |job| job.job_handler_type.clone() },
            FieldDescriptor { name: "job_handler_configuration", read: |job| opt(&job.job_handler_configuration) },
            FieldDescriptor { name: "due_date", read: |job| opt(&job.due_date) },
            FieldDescriptor { name: "retries", read: |job| job.retries.to_string() },
            FieldDescriptor { name: "failure_count", read: |job| job.failure_count.to_string() },
            FieldDescriptor { name: "exception_message", read: |job| opt(&job.exception_message) },
            FieldDescriptor { name: "exception_stacktrace", read: |job| opt(&job.exception_stacktrace) },
            FieldDescriptor { name: "lock_owner", read: |job| opt(&job.lock_owner) },
            FieldDescriptor { name: "lock_expiration_time", read: |job| opt(&job.lock_expiration_time) },
            FieldDescriptor { name: "exclusive", read: |job| job.exclusive.to_string() },
            FieldDescriptor { name: "suspended_from", read: |job| opt(&job.suspended_from) },
            FieldDescriptor { name: "tenant_id", read: |job| opt(&job.tenant_id) },
        ],
    };

    fn id(&self) -> JobId {
        self.id
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }
}
