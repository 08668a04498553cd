//! Runs one acquired job on a worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use procflow_core::{JobEntity, JobId};

use crate::command::CommandExecutor;
use crate::commands::{
    ExecuteAsyncJobCmd, JobExecutionOutcome, JobRunOutcome, LockExclusiveJobCmd, UnacquireJobCmd,
    UnlockExclusiveJobCmd, run_job,
};
use crate::config::chrono_span;

use super::executor::AsyncExecutorStats;

/// Executes acquired jobs through the command pipeline.
#[derive(Clone)]
pub(crate) struct AsyncJobRunner {
    executor: CommandExecutor,
    lock_owner: String,
    stats: Arc<Mutex<AsyncExecutorStats>>,
    stopping: Arc<AtomicBool>,
}

impl AsyncJobRunner {
    pub(crate) fn new(
        executor: CommandExecutor,
        stats: Arc<Mutex<AsyncExecutorStats>>,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        let lock_owner = executor.services().config.lock_owner.clone();
        Self {
            executor,
            lock_owner,
            stats,
            stopping,
        }
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, AsyncExecutorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the job back to the store; errors only mean the lock expires on its own.
    pub(crate) fn unacquire(&self, job_id: JobId) {
        if let Err(e) = self.executor.execute(&UnacquireJobCmd { job_id }) {
            debug!(job_id = %job_id, error = %e, "could not release job lock, it will expire");
        }
    }

    pub(crate) fn run(&self, job: JobEntity) {
        if self.stopping.load(Ordering::SeqCst) {
            self.unacquire(job.id);
            self.stats().jobs_rejected += 1;
            return;
        }

        let exclusive_instance = job.exclusive.then_some(job.process_instance_id).flatten();
        if let Some(process_instance_id) = exclusive_instance {
            let lock = LockExclusiveJobCmd {
                process_instance_id,
                lock_owner: self.lock_owner.clone(),
                lock_time: chrono_span(self.executor.services().config.async_job_lock_time),
            };
            match self.executor.execute(&lock) {
                Ok(true) => {}
                Ok(false) => {
                    self.unacquire(job.id);
                    self.stats().lock_conflicts += 1;
                    return;
                }
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "could not take process instance lock");
                    self.unacquire(job.id);
                    self.stats().lock_conflicts += 1;
                    return;
                }
            }
        }

        self.stats().current_running += 1;
        self.execute(&job);
        {
            let mut stats = self.stats();
            stats.current_running = stats.current_running.saturating_sub(1);
        }

        if let Some(process_instance_id) = exclusive_instance {
            let unlock = UnlockExclusiveJobCmd {
                process_instance_id,
                lock_owner: self.lock_owner.clone(),
            };
            if let Err(e) = self.executor.execute(&unlock) {
                warn!(process_instance_id = %process_instance_id, error = %e, "failed to release process instance lock");
            }
        }
    }

    fn execute(&self, job: &JobEntity) {
        let command = ExecuteAsyncJobCmd::locked_by(job.id, self.lock_owner.clone());
        match run_job(&self.executor, &command) {
            Ok(JobRunOutcome::Completed(JobExecutionOutcome::Executed)) => {
                self.stats().jobs_succeeded += 1;
            }
            Ok(JobRunOutcome::Completed(outcome)) => {
                debug!(job_id = %job.id, ?outcome, "job skipped");
            }
            Ok(JobRunOutcome::Failed { retry, .. }) => {
                let mut stats = self.stats();
                stats.jobs_failed += 1;
                if retry.is_dead_lettered() {
                    stats.jobs_dead_lettered += 1;
                }
            }
            Ok(JobRunOutcome::FailureNotRecorded { .. }) => {
                // The lock expires and the job is retried from scratch.
                self.stats().failure_record_errors += 1;
            }
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "job changed while executing, releasing it");
                self.unacquire(job.id);
            }
        }
    }
}
