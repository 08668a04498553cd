//! Executions: the runtime tokens of a process instance.
//!
//! The root execution of a tree *is* the process instance
//! (`id == process_instance_id`). Only the fields the engine core touches are
//! modelled here.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntitySchema, FieldDescriptor, opt};
use crate::id::{ExecutionId, TenantId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionState {
    #[default]
    Active,
    Suspended,
}

impl SuspensionState {
    pub fn is_suspended(&self) -> bool {
        matches!(self, SuspensionState::Suspended)
    }
}

impl fmt::Display for SuspensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspensionState::Active => f.write_str("active"),
            SuspensionState::Suspended => f.write_str("suspended"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEntity {
    pub id: ExecutionId,
    pub revision: u32,
    pub process_instance_id: ExecutionId,
    pub parent_id: Option<ExecutionId>,
    pub process_definition_id: Option<String>,
    pub activity_id: Option<String>,
    pub suspension_state: SuspensionState,
    pub tenant_id: Option<TenantId>,
    /// Exclusive-execution lock held on the process instance.
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
}

impl ExecutionEntity {
    /// Create the root execution of a new process instance.
    pub fn process_instance(process_definition_id: impl Into<String>) -> Self {
        let id = ExecutionId::new();
        Self {
            id,
            revision: 1,
            process_instance_id: id,
            parent_id: None,
            process_definition_id: Some(process_definition_id.into()),
            activity_id: None,
            suspension_state: SuspensionState::Active,
            tenant_id: None,
            lock_owner: None,
            lock_expiration_time: None,
        }
    }

    /// Create a child execution below `parent`.
    pub fn child_of(parent: &ExecutionEntity) -> Self {
        Self {
            id: ExecutionId::new(),
            revision: 1,
            process_instance_id: parent.process_instance_id,
            parent_id: Some(parent.id),
            process_definition_id: parent.process_definition_id.clone(),
            activity_id: None,
            suspension_state: parent.suspension_state,
            tenant_id: parent.tenant_id,
            lock_owner: None,
            lock_expiration_time: None,
        }
    }

    pub fn at_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn is_process_instance(&self) -> bool {
        self.id == self.process_instance_id
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_state.is_suspended()
    }

    /// The exclusive lock is held by someone other than `owner` at `now`.
    pub fn is_locked_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(holder), Some(until)) => holder != owner && until > now,
            _ => false,
        }
    }
}

impl Entity for ExecutionEntity {
    type Id = ExecutionId;

    const SCHEMA: EntitySchema<Self> = EntitySchema {
        table: "execution",
        fields: &[
            FieldDescriptor { name: "id", read: |e| e.id.to_string() },
            FieldDescriptor { name: "process_instance_id", read: |e| e.process_instance_id.to_string() },
            FieldDescriptor { name: "parent_id", read: |e| opt(&e.parent_id) },
            FieldDescriptor { name: "process_definition_id", read: |e| opt(&e.process_definition_id) },
            FieldDescriptor { name: "activity_id", read: |e| opt(&e.activity_id) },
            FieldDescriptor { name: "suspension_state", read: |e| e.suspension_state.to_string() },
            FieldDescriptor { name: "tenant_id", read: |e| opt(&e.tenant_id) },
            FieldDescriptor { name: "lock_owner", read: |e| opt(&e.lock_owner) },
            FieldDescriptor { name: "lock_expiration_time", read: |e| opt(&e.lock_expiration_time) },
        ],
    };

    fn id(&self) -> ExecutionId {
        self.id
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn root_execution_is_the_process_instance() {
        let root = ExecutionEntity::process_instance("invoice:1");
        let child = ExecutionEntity::child_of(&root).at_activity("approve");

        assert!(root.is_process_instance());
        assert!(!child.is_process_instance());
        assert_eq!(child.process_instance_id, root.id);
        assert_eq!(child.parent_id, Some(root.id));
    }

    #[test]
    fn instance_lock_respects_owner_and_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut root = ExecutionEntity::process_instance("invoice:1");
        root.lock_owner = Some("worker-a".into());
        root.lock_expiration_time = Some(now + Duration::minutes(1));

        assert!(root.is_locked_by_other("worker-b", now));
        assert!(!root.is_locked_by_other("worker-a", now));
        assert!(!root.is_locked_by_other("worker-b", now + Duration::minutes(2)));
    }
}
