//! Suspend / activate a process instance.

use serde::Serialize;
use tracing::info;

use procflow_core::{EngineError, EngineResult, ExecutionId, JobTable, SuspensionState};
use procflow_events::{EngineEvent, EngineEventType, EntityRef};

use crate::command::{Command, CommandContext};
use crate::persistence::JobQuery;

/// What a suspension-state change touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspensionSummary {
    pub process_instance_id: ExecutionId,
    pub state: SuspensionState,
    /// Executions updated, the root included.
    pub executions: usize,
    pub tasks: usize,
    pub jobs_moved: usize,
}

/// Suspends a process instance and parks its timer and executable jobs.
#[derive(Debug, Clone, Copy)]
pub struct SuspendProcessInstanceCmd {
    pub process_instance_id: ExecutionId,
}

impl Command for SuspendProcessInstanceCmd {
    type Output = SuspensionSummary;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<SuspensionSummary> {
        set_suspension_state(ctx, self.process_instance_id, SuspensionState::Suspended)
    }
}

/// Activates a process instance and restores its parked jobs.
#[derive(Debug, Clone, Copy)]
pub struct ActivateProcessInstanceCmd {
    pub process_instance_id: ExecutionId,
}

impl Command for ActivateProcessInstanceCmd {
    type Output = SuspensionSummary;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<SuspensionSummary> {
        set_suspension_state(ctx, self.process_instance_id, SuspensionState::Active)
    }
}

fn set_suspension_state(
    ctx: &mut CommandContext,
    process_instance_id: ExecutionId,
    target: SuspensionState,
) -> EngineResult<SuspensionSummary> {
    let now = ctx.now();
    let entities = ctx.entities()?;

    // Validate before touching anything.
    let root = entities
        .find_execution(process_instance_id)?
        .ok_or_else(|| EngineError::not_found("process instance", process_instance_id))?;
    if !root.is_process_instance() {
        return Err(EngineError::invalid_argument(format!(
            "execution {process_instance_id} is not a process instance"
        )));
    }
    if root.suspension_state == target {
        return Err(EngineError::invalid_argument(format!(
            "process instance {process_instance_id} is already {target}"
        )));
    }

    let event_type = match target {
        SuspensionState::Suspended => EngineEventType::EntitySuspended,
        SuspensionState::Active => EngineEventType::EntityActivated,
    };
    let mut events = Vec::new();

    // Root first, then every child execution.
    let mut executions = entities.find_executions_by_process_instance(process_instance_id)?;
    executions.sort_by_key(|execution| !execution.is_process_instance());
    let execution_count = executions.len();
    for mut execution in executions {
        execution.suspension_state = target;
        events.push(EntityRef::execution(&execution));
        entities.update_execution(execution)?;
    }

    let tasks = entities.find_tasks_by_process_instance(process_instance_id)?;
    let task_count = tasks.len();
    for mut task in tasks {
        task.suspension_state = target;
        events.push(EntityRef::task(&task));
        entities.update_task(task)?;
    }

    let query = JobQuery::for_process_instance(process_instance_id);
    let mut jobs_moved = 0;
    match target {
        SuspensionState::Suspended => {
            for table in [JobTable::Timer, JobTable::Executable] {
                let jobs = ctx.entities()?.find_jobs(table, &query)?;
                for job in jobs {
                    ctx.job_manager().suspend_job(&job, table)?;
                    jobs_moved += 1;
                }
            }
        }
        SuspensionState::Active => {
            let jobs = ctx.entities()?.find_jobs(JobTable::Suspended, &query)?;
            for job in jobs {
                ctx.job_manager().activate_job(&job)?;
                jobs_moved += 1;
            }
        }
    }

    for entity in events {
        ctx.dispatch(EngineEvent::new(event_type, entity, now));
    }

    info!(
        process_instance_id = %process_instance_id,
        state = %target,
        executions = execution_count,
        tasks = task_count,
        jobs_moved,
        "changed process instance suspension state"
    );

    Ok(SuspensionSummary {
        process_instance_id,
        state: target,
        executions: execution_count,
        tasks: task_count,
        jobs_moved,
    })
}
