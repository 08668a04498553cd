//! `procflow-core`: engine foundation building blocks.
//!
//! Identifiers, the error model, the clock abstraction, entity schema
//! descriptors and the persistent entities (jobs, executions, tasks) shared by
//! every other crate. Nothing in here performs IO.

pub mod clock;
pub mod cycle;
pub mod entity;
pub mod error;
pub mod execution;
pub mod id;
pub mod job;
pub mod task;

pub use clock::{Clock, FakeClock, SystemClock};
pub use cycle::{DurationCycle, IsoDuration};
pub use entity::{Entity, EntitySchema, FieldDescriptor};
pub use error::{EngineError, EngineResult};
pub use execution::{ExecutionEntity, SuspensionState};
pub use id::{ExecutionId, JobId, TaskId, TenantId};
pub use job::{DEFAULT_JOB_RETRIES, JobEntity, JobTable, JobType};
pub use task::TaskEntity;
