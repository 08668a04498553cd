use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use procflow_core::{Entity, ExecutionEntity, ExecutionId, JobEntity, TaskEntity};

use crate::event::EngineEventType;

/// Reference to the entity an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Schema table name (e.g. "job", "execution").
    pub kind: String,
    pub id: String,
    pub process_instance_id: Option<ExecutionId>,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl ToString, process_instance_id: Option<ExecutionId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
            process_instance_id,
        }
    }

    pub fn job(job: &JobEntity) -> Self {
        Self::new(JobEntity::SCHEMA.table, job.id, job.process_instance_id)
    }

    pub fn execution(execution: &ExecutionEntity) -> Self {
        Self::new(ExecutionEntity::SCHEMA.table, execution.id, Some(execution.process_instance_id))
    }

    pub fn task(task: &TaskEntity) -> Self {
        Self::new(TaskEntity::SCHEMA.table, task.id, Some(task.process_instance_id))
    }
}

/// A notification emitted by a command.
///
/// Events are facts about a state transition that already happened inside
/// the emitting command; they carry a reference to the entity plus a small
/// JSON `detail` payload (retries, due date, failure message, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    event_id: Uuid,
    event_type: EngineEventType,
    entity: EntityRef,
    occurred_at: DateTime<Utc>,
    detail: serde_json::Value,
}

impl EngineEvent {
    pub fn new(event_type: EngineEventType, entity: EntityRef, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            entity,
            occurred_at,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> EngineEventType {
        self.event_type
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn detail(&self) -> &serde_json::Value {
        &self.detail
    }
}
