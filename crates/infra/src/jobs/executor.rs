//! Background job acquisition and execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use procflow_core::{EngineError, EngineResult, JobEntity};

use crate::command::CommandExecutor;
use crate::commands::{
    AcquireJobsCmd, AcquireTimerJobsCmd, LockJobCmd, LockTimerJobCmd, MoveTimerToExecutableCmd,
};
use crate::config::chrono_span;

use super::exclusive::ExclusiveJobQueue;
use super::pool::WorkerPool;
use super::runnable::AsyncJobRunner;

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AsyncExecutorStats {
    pub jobs_acquired: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    /// Failed jobs whose failure could not be recorded; they run again once
    /// their lock expires.
    pub failure_record_errors: u64,
    /// Acquired jobs handed back without running (full queue, shutdown).
    pub jobs_rejected: u64,
    pub lock_conflicts: u64,
    pub timers_promoted: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to outstanding work during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ShutdownReport {
    /// All in-flight jobs finished before the timeout.
    pub drained: bool,
    /// Acquired jobs released back to the store without running.
    pub unacquired: usize,
}

/// Polls the job stores and runs due jobs on a bounded worker pool.
///
/// Each cycle first promotes due timers into the executable store, then
/// locks executable jobs one conditional update at a time and hands them
/// to the pool. Exclusive jobs of one process instance are chained on a
/// single worker.
pub struct AsyncExecutor {
    executor: CommandExecutor,
}

impl AsyncExecutor {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// Spawn the worker pool and the acquisition thread.
    pub fn start(self) -> EngineResult<AsyncExecutorHandle> {
        let config = self.executor.services().config.clone();
        let pool = Arc::new(WorkerPool::new(
            "procflow-job-worker",
            config.worker_pool_size,
            config.queue_capacity,
        )?);
        let stats = Arc::new(Mutex::new(AsyncExecutorStats::default()));
        let stopping = Arc::new(AtomicBool::new(false));
        let exclusive = Arc::new(ExclusiveJobQueue::new());
        let runner = AsyncJobRunner::new(self.executor.clone(), stats.clone(), stopping.clone());

        let acquisition = Acquisition {
            executor: self.executor,
            runner: runner.clone(),
            pool: pool.clone(),
            exclusive: exclusive.clone(),
            stats: stats.clone(),
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("procflow-job-acquisition".to_string())
            .spawn(move || acquisition.run(shutdown_rx))
            .map_err(|e| EngineError::configuration(format!("failed to spawn job acquisition thread: {e}")))?;

        info!(
            lock_owner = %config.lock_owner,
            workers = config.worker_pool_size,
            queue_capacity = config.queue_capacity,
            "async executor started"
        );

        Ok(AsyncExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            pool,
            exclusive,
            runner,
            stopping,
            stats,
            started: Instant::now(),
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

/// Handle to control a running executor.
pub struct AsyncExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    pool: Arc<WorkerPool>,
    exclusive: Arc<ExclusiveJobQueue>,
    runner: AsyncJobRunner,
    stopping: Arc<AtomicBool>,
    stats: Arc<Mutex<AsyncExecutorStats>>,
    started: Instant,
    shutdown_timeout: Duration,
}

impl AsyncExecutorHandle {
    pub fn stats(&self) -> AsyncExecutorStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop acquiring, release queued jobs and wait for in-flight ones.
    pub fn shutdown(mut self) -> ShutdownReport {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }

        let rejected_before = self.stats().jobs_rejected;
        self.stopping.store(true, Ordering::SeqCst);

        let queued = self.exclusive.drain();
        for job in &queued {
            self.runner.unacquire(job.id);
        }

        let drained = self.pool.shutdown(self.shutdown_timeout);
        let released_by_workers = self.stats().jobs_rejected.saturating_sub(rejected_before);
        let report = ShutdownReport {
            drained,
            unacquired: queued.len() + usize::try_from(released_by_workers).unwrap_or(usize::MAX),
        };

        if drained {
            info!(unacquired = report.unacquired, "async executor stopped");
        } else {
            warn!(
                unacquired = report.unacquired,
                timeout_ms = u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
                "async executor stopped before in-flight jobs finished; their locks will expire"
            );
        }
        report
    }
}

struct Acquisition {
    executor: CommandExecutor,
    runner: AsyncJobRunner,
    pool: Arc<WorkerPool>,
    exclusive: Arc<ExclusiveJobQueue>,
    stats: Arc<Mutex<AsyncExecutorStats>>,
}

impl Acquisition {
    fn run(self, shutdown_rx: mpsc::Receiver<()>) {
        let config = self.executor.services().config.clone();
        let idle_wait = config.async_acquire_wait_time.min(config.timer_acquire_wait_time);

        loop {
            let batch_full = self.cycle();
            let wait = if batch_full { Duration::ZERO } else { idle_wait };
            match shutdown_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("job acquisition stopped");
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, AsyncExecutorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One acquisition round; `true` when either batch came back full.
    fn cycle(&self) -> bool {
        let config = &self.executor.services().config;
        let timers_full = self.promote_timers(config.max_timer_jobs_per_acquisition);
        let jobs_full = self.acquire_jobs(config.max_async_jobs_per_acquisition);
        timers_full || jobs_full
    }

    fn promote_timers(&self, limit: usize) -> bool {
        let candidates = match self.executor.execute(&AcquireTimerJobsCmd { limit }) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "timer acquisition failed");
                return false;
            }
        };

        let config = &self.executor.services().config;
        for job_id in &candidates {
            let lock = LockTimerJobCmd {
                job_id: *job_id,
                lock_owner: config.lock_owner.clone(),
                lock_time: chrono_span(config.timer_lock_time),
            };
            match self.executor.execute(&lock) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) if e.is_optimistic_lock() => {
                    debug!(job_id = %job_id, "timer locked by another worker");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "failed to lock timer");
                    continue;
                }
            }

            let promote = MoveTimerToExecutableCmd::locked_by(*job_id, config.lock_owner.clone());
            match self.executor.execute(&promote) {
                Ok(Some(_)) => self.stats().timers_promoted += 1,
                Ok(None) => {}
                Err(e) if e.is_optimistic_lock() => {
                    debug!(job_id = %job_id, "timer promoted by another worker");
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to promote timer"),
            }
        }
        limit > 0 && candidates.len() >= limit
    }

    fn acquire_jobs(&self, limit: usize) -> bool {
        let candidates = match self.executor.execute(&AcquireJobsCmd { limit }) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "job acquisition failed");
                return false;
            }
        };

        let config = &self.executor.services().config;
        for job_id in &candidates {
            let lock = LockJobCmd {
                job_id: *job_id,
                lock_owner: config.lock_owner.clone(),
                lock_time: chrono_span(config.async_job_lock_time),
            };
            match self.executor.execute(&lock) {
                Ok(Some(job)) => {
                    self.stats().jobs_acquired += 1;
                    self.dispatch(job);
                }
                Ok(None) => self.stats().lock_conflicts += 1,
                Err(e) if e.is_optimistic_lock() => {
                    debug!(job_id = %job_id, "job acquired by another worker");
                    self.stats().lock_conflicts += 1;
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to lock job"),
            }
        }
        limit > 0 && candidates.len() >= limit
    }

    fn dispatch(&self, job: JobEntity) {
        let job_id = job.id;

        if let Some(process_instance_id) = job.exclusive.then_some(job.process_instance_id).flatten() {
            if !self.exclusive.offer(process_instance_id, job) {
                debug!(job_id = %job_id, process_instance_id = %process_instance_id, "queued behind running exclusive job");
                return;
            }
            let runner = self.runner.clone();
            let exclusive = self.exclusive.clone();
            let chain = Box::new(move || {
                while let Some(job) = exclusive.next(process_instance_id) {
                    runner.run(job);
                }
            });
            if self.pool.try_submit(chain).is_err() {
                let abandoned = self.exclusive.abandon(process_instance_id);
                warn!(process_instance_id = %process_instance_id, jobs = abandoned.len(), "worker queue full, releasing exclusive jobs");
                for job in &abandoned {
                    self.runner.unacquire(job.id);
                }
                self.stats().jobs_rejected += u64::try_from(abandoned.len()).unwrap_or(u64::MAX);
            }
            return;
        }

        let runner = self.runner.clone();
        if self.pool.try_submit(Box::new(move || runner.run(job))).is_err() {
            warn!(job_id = %job_id, "worker queue full, releasing job");
            self.runner.unacquire(job_id);
            self.stats().jobs_rejected += 1;
        }
    }
}
