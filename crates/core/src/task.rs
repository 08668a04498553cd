//! User tasks, as far as suspension is concerned.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntitySchema, FieldDescriptor, opt};
use crate::execution::{ExecutionEntity, SuspensionState};
use crate::id::{ExecutionId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntity {
    pub id: TaskId,
    pub revision: u32,
    pub name: Option<String>,
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    pub suspension_state: SuspensionState,
}

impl TaskEntity {
    pub fn for_execution(execution: &ExecutionEntity, name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            revision: 1,
            name: Some(name.into()),
            execution_id: execution.id,
            process_instance_id: execution.process_instance_id,
            suspension_state: execution.suspension_state,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_state.is_suspended()
    }
}

impl Entity for TaskEntity {
    type Id = TaskId;

    const SCHEMA: EntitySchema<Self> = EntitySchema {
        table: "task",
        fields: &[
            FieldDescriptor { name: "id", read: |t| t.id.to_string() },
            FieldDescriptor { name: "name", read: |t| opt(&t.name) },
            FieldDescriptor { name: "execution_id", read: |t| t.execution_id.to_string() },
            FieldDescriptor { name: "process_instance_id", read: |t| t.process_instance_id.to_string() },
            FieldDescriptor { name: "suspension_state", read: |t| t.suspension_state.to_string() },
        ],
    };

    fn id(&self) -> TaskId {
        self.id
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }
}
