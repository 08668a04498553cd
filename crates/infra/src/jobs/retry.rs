//! Failed-job retry policy.
//!
//! Given a failed job and its (optional) retry time cycle, decide where the
//! job goes next and with how many retries left. The decision is a pure
//! function of its inputs; the retry command applies it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use procflow_core::{DurationCycle, EngineResult, ExecutionEntity, JobEntity, JobTable, JobType};

use crate::config::{EngineConfig, chrono_span};

/// Where a failed job's retry time cycle comes from (usually the activity
/// definition that produced the job).
pub trait RetryCycleLookup: Send + Sync {
    fn failed_job_retry_time_cycle(
        &self,
        job: &JobEntity,
        execution: Option<&ExecutionEntity>,
    ) -> Option<String>;
}

#[derive(Debug, Default)]
struct CycleTable {
    by_activity: HashMap<String, String>,
    by_handler: HashMap<String, String>,
    default: Option<String>,
}

/// Retry cycles configured per activity id, per handler type, or globally.
///
/// Lookup order: the activity of the job's execution, then the job handler
/// type, then the default.
#[derive(Debug, Default)]
pub struct RetryCycleRegistry {
    cycles: RwLock<CycleTable>,
}

impl RetryCycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_activity(&self, activity_id: impl Into<String>, cycle: impl Into<String>) -> &Self {
        self.write().by_activity.insert(activity_id.into(), cycle.into());
        self
    }

    pub fn for_handler(&self, handler_type: impl Into<String>, cycle: impl Into<String>) -> &Self {
        self.write().by_handler.insert(handler_type.into(), cycle.into());
        self
    }

    pub fn set_default(&self, cycle: Option<String>) -> &Self {
        self.write().default = cycle;
        self
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CycleTable> {
        self.cycles.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RetryCycleLookup for RetryCycleRegistry {
    fn failed_job_retry_time_cycle(
        &self,
        job: &JobEntity,
        execution: Option<&ExecutionEntity>,
    ) -> Option<String> {
        let cycles = self.cycles.read().unwrap_or_else(PoisonError::into_inner);
        execution
            .and_then(|e| e.activity_id.as_ref())
            .and_then(|activity| cycles.by_activity.get(activity))
            .or_else(|| cycles.by_handler.get(&job.job_handler_type))
            .or(cycles.default.as_ref())
            .cloned()
    }
}

/// Outcome of the retry policy for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    /// `Timer` to try again later, `DeadLetter` when retries are exhausted.
    pub target: JobTable,
    /// Retries stored on the moved job.
    pub retries: u32,
    /// Due date of the rescheduled timer; `None` for dead letters.
    pub due_date: Option<DateTime<Utc>>,
}

impl RetryPlan {
    pub fn is_dead_letter(&self) -> bool {
        self.target == JobTable::DeadLetter
    }
}

/// Decide the fate of `job` after a failure at `now`.
///
/// Retries before the decrement are the cycle's repeat count on the job's
/// first failure and `job.retries` afterwards; at one or less the job is
/// dead-lettered. A malformed `cycle` is returned as an error.
pub fn plan_retry(
    job: &JobEntity,
    cycle: Option<&str>,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> EngineResult<RetryPlan> {
    let cycle = cycle.map(DurationCycle::parse).transpose()?;

    let retries = match &cycle {
        Some(cycle) if job.failure_count == 0 => cycle.repeat,
        _ => job.retries,
    };

    if retries <= 1 {
        return Ok(RetryPlan {
            target: JobTable::DeadLetter,
            retries: retries.saturating_sub(1),
            due_date: None,
        });
    }

    let due_date = match &cycle {
        Some(cycle) => cycle.next_due(now)?,
        None if job.due_date.is_none() || job.job_type == JobType::Message => {
            now + chrono_span(config.async_failed_job_wait_time)
        }
        None => now + chrono_span(config.default_failed_job_wait_time),
    };

    Ok(RetryPlan {
        target: JobTable::Timer,
        retries: retries - 1,
        due_date: Some(due_date),
    })
}
