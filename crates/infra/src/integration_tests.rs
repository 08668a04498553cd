//! Integration tests for the command pipeline and the job scheduler.
//!
//! Tests: Command → CommandContext → EntitySession → DataStore, plus the
//! async executor driving jobs through the same pipeline.
//!
//! Verifies:
//! - Failed jobs are rescheduled or dead-lettered atomically, whether run
//!   by a worker or through the engine
//! - Concurrent acquisition never double-locks a job
//! - Suspension parks and restores jobs without touching dead letters
//! - The context close protocol flushes only successful commands

#[cfg(test)]
mod tests {
    use std::marker::PhantomData;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration as StdDuration, Instant};

    use anyhow::anyhow;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use procflow_core::{
        EngineError, EngineResult, ExecutionEntity, ExecutionId, FakeClock, JobEntity, JobId,
        JobTable, SuspensionState, TaskEntity,
    };
    use procflow_events::{
        BusEventDispatcher, EngineEvent, EngineEventType, EventBus, InMemoryEventBus, Subscription,
    };

    use crate::command::{
        Command, CommandConfig, CommandContext, CommandContextCloseListener, CommandInterceptor,
        CommandInvocation, CommandOutput, Next, Session, command_fn,
    };
    use crate::commands::{
        ExecuteAsyncJobCmd, FailedJobCommandFactory, FailureDetails, JobExecutionOutcome,
        JobRetryCmd, JobRunOutcome, LockJobCmd, LockTimerJobCmd, MoveTimerToExecutableCmd,
        RetryOutcome, UnacquireJobCmd,
    };
    use crate::config::EngineConfig;
    use crate::engine::{ProcessEngine, ProcessEngineBuilder};
    use crate::jobs::executor::AsyncExecutorStats;
    use crate::jobs::runnable::AsyncJobRunner;
    use crate::jobs::RetryCycleRegistry;
    use crate::persistence::{DataStore, InMemoryDataStore, JobQuery, WriteBatch};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap()
    }

    fn test_config() -> EngineConfig {
        EngineConfig::default()
            .with_lock_owner("worker-a")
            .with_command_retry(3, StdDuration::from_millis(1))
            .with_failed_job_wait_times(StdDuration::from_secs(10), StdDuration::from_secs(10))
    }

    struct Harness {
        engine: ProcessEngine,
        store: Arc<InMemoryDataStore>,
        clock: FakeClock,
        events: Subscription<EngineEvent>,
    }

    fn setup_with(
        config: EngineConfig,
        configure: impl FnOnce(ProcessEngineBuilder) -> ProcessEngineBuilder,
    ) -> Harness {
        procflow_observability::init_for_tests();
        let store = InMemoryDataStore::arc();
        let clock = FakeClock::new(t0());
        let bus = Arc::new(InMemoryEventBus::<EngineEvent>::new());
        // Subscribe BEFORE anything is published.
        let events = bus.subscribe();

        let builder = ProcessEngine::builder()
            .with_config(config)
            .with_store(store.clone())
            .with_clock(clock.clone())
            .with_event_dispatcher(Arc::new(BusEventDispatcher::new(bus)))
            .with_handler_fn("ok", |_, _, _| Ok(()))
            .with_handler_fn("fail", |_, _, _| Err(anyhow!("boom")));

        Harness {
            engine: configure(builder).build(),
            store,
            clock,
            events,
        }
    }

    fn setup() -> Harness {
        setup_with(test_config(), |builder| builder)
    }

    fn runner(engine: &ProcessEngine) -> AsyncJobRunner {
        AsyncJobRunner::new(
            engine.executor().clone(),
            Arc::new(Mutex::new(AsyncExecutorStats::default())),
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Run an executable job the way a worker does.
    fn run_job(h: &Harness, job_id: JobId) {
        let job = h
            .store
            .find_job(JobTable::Executable, job_id)
            .unwrap()
            .expect("job should be executable");
        runner(&h.engine).run(job);
    }

    fn job_in(h: &Harness, table: JobTable, job_id: JobId) -> JobEntity {
        h.store
            .find_job(table, job_id)
            .unwrap()
            .unwrap_or_else(|| panic!("job {job_id} not in {table}"))
    }

    fn event_types(events: &Subscription<EngineEvent>) -> Vec<EngineEventType> {
        events.drain().iter().map(EngineEvent::event_type).collect()
    }

    struct Instance {
        root: ExecutionEntity,
        child: ExecutionEntity,
        task: TaskEntity,
    }

    fn start_instance(engine: &ProcessEngine) -> Instance {
        let root = ExecutionEntity::process_instance("invoice-approval");
        let child = ExecutionEntity::child_of(&root).at_activity("review");
        let task = TaskEntity::for_execution(&child, "Review invoice");

        let (r, c, t) = (root.clone(), child.clone(), task.clone());
        engine
            .execute(&command_fn("seed-instance", move |ctx: &mut CommandContext| {
                let entities = ctx.entities()?;
                entities.insert_execution(r.clone())?;
                entities.insert_execution(c.clone())?;
                entities.insert_task(t.clone())?;
                Ok(())
            }))
            .unwrap();

        Instance { root, child, task }
    }

    // ---- retry / dead letter ----------------------------------------------

    #[test]
    fn failure_without_cycle_reschedules_as_timer() {
        let h = setup();
        let job = h.engine.new_message_job("fail");
        let id = job.id;
        assert_eq!(h.engine.create_job(job).unwrap(), JobTable::Executable);

        run_job(&h, id);

        assert_eq!(h.store.tables_holding(id), vec![JobTable::Timer]);
        let timer = job_in(&h, JobTable::Timer, id);
        assert_eq!(timer.retries, 2);
        assert_eq!(timer.due_date, Some(t0() + Duration::seconds(10)));
        assert_eq!(timer.exception_message.as_deref(), Some("boom"));
        assert_eq!(timer.failure_count, 1);
        assert!(timer.lock_owner.is_none());

        let types = event_types(&h.events);
        assert!(types.contains(&EngineEventType::JobRetriesDecremented));
        assert!(types.contains(&EngineEventType::JobExecutionFailure));
    }

    #[test]
    fn retry_cycle_reschedules_then_dead_letters() {
        let cycles = Arc::new(RetryCycleRegistry::new());
        cycles.for_handler("fail", "R2/PT1M");
        let h = setup_with(test_config(), |builder| builder.with_retry_cycles(cycles));

        let job = h.engine.new_message_job("fail").with_retries(7);
        let id = job.id;
        h.engine.create_job(job).unwrap();

        run_job(&h, id);
        let timer = job_in(&h, JobTable::Timer, id);
        assert_eq!(timer.retries, 1);
        assert_eq!(timer.due_date, Some(t0() + Duration::minutes(1)));

        // Not due yet.
        assert!(h.engine.execute(&MoveTimerToExecutableCmd::new(id)).unwrap().is_none());

        h.clock.advance(Duration::minutes(1));
        assert!(h.engine.execute(&MoveTimerToExecutableCmd::new(id)).unwrap().is_some());
        run_job(&h, id);

        assert_eq!(h.store.tables_holding(id), vec![JobTable::DeadLetter]);
        let dead = job_in(&h, JobTable::DeadLetter, id);
        assert_eq!(dead.retries, 0);
        assert_eq!(dead.failure_count, 2);
        assert!(dead.exception_stacktrace.is_some());
        assert!(event_types(&h.events).contains(&EngineEventType::JobMovedToDeadLetter));
    }

    #[test]
    fn malformed_cycle_dead_letters_and_reports() {
        let cycles = Arc::new(RetryCycleRegistry::new());
        cycles.for_handler("fail", "R/PT1M");
        let h = setup_with(test_config(), |builder| builder.with_retry_cycles(cycles));

        let job = h.engine.new_message_job("fail");
        let id = job.id;
        h.engine.create_job(job).unwrap();
        run_job(&h, id);

        let dead = job_in(&h, JobTable::DeadLetter, id);
        assert_eq!(dead.retries, 0);
        assert!(event_types(&h.events).contains(&EngineEventType::JobRetryConfigurationError));
    }

    #[test]
    fn missing_handler_fails_the_job() {
        let h = setup();
        let job = h.engine.new_message_job("unknown.type");
        let id = job.id;
        h.engine.create_job(job).unwrap();

        run_job(&h, id);

        let timer = job_in(&h, JobTable::Timer, id);
        assert!(timer.exception_message.unwrap().contains("no job handler"));
    }

    #[test]
    fn engine_execution_reschedules_then_dead_letters_failures() {
        let h = setup();
        let job = h.engine.new_message_job("fail").with_retries(2);
        let id = job.id;
        h.engine.create_job(job).unwrap();

        let outcome = h.engine.execute_job(id).unwrap();
        assert!(matches!(outcome.retry(), Some(RetryOutcome::Rescheduled { .. })));
        assert_eq!(h.store.tables_holding(id), vec![JobTable::Timer]);
        let timer = job_in(&h, JobTable::Timer, id);
        assert_eq!(timer.retries, 1);
        assert_eq!(timer.failure_count, 1);
        assert_eq!(timer.exception_message.as_deref(), Some("boom"));

        h.clock.advance(Duration::seconds(10));
        assert!(h.engine.execute(&MoveTimerToExecutableCmd::new(id)).unwrap().is_some());

        let outcome = h.engine.execute_job(id).unwrap();
        assert!(matches!(outcome.retry(), Some(RetryOutcome::DeadLettered { .. })));
        assert_eq!(h.store.tables_holding(id), vec![JobTable::DeadLetter]);
        let dead = job_in(&h, JobTable::DeadLetter, id);
        assert_eq!(dead.retries, 0);
        assert_eq!(dead.failure_count, 2);

        let types = event_types(&h.events);
        let failures = types
            .iter()
            .filter(|t| **t == EngineEventType::JobExecutionFailure)
            .count();
        assert_eq!(failures, 2);
        assert!(types.contains(&EngineEventType::JobMovedToDeadLetter));
    }

    #[test]
    fn engine_execution_of_a_default_job_leaves_two_retries() {
        let h = setup();
        let job = h.engine.new_message_job("fail");
        let id = job.id;
        h.engine.create_job(job).unwrap();

        h.engine.execute_job(id).unwrap();

        assert_eq!(h.store.tables_holding(id), vec![JobTable::Timer]);
        assert_eq!(job_in(&h, JobTable::Timer, id).retries, 2);
    }

    #[test]
    fn engine_execution_reports_success_and_missing_jobs() {
        let h = setup();
        let job = h.engine.new_message_job("ok");
        let id = job.id;
        h.engine.create_job(job).unwrap();

        let outcome = h.engine.execute_job(id).unwrap();
        assert!(matches!(outcome, JobRunOutcome::Completed(JobExecutionOutcome::Executed)));
        let outcome = h.engine.execute_job(id).unwrap();
        assert!(matches!(outcome, JobRunOutcome::Completed(JobExecutionOutcome::Missing)));
    }

    struct UnrecordableFailures;

    impl FailedJobCommandFactory for UnrecordableFailures {
        fn failed_job_command(
            &self,
            _job_id: JobId,
            _failure: FailureDetails,
        ) -> Box<dyn Command<Output = RetryOutcome> + Send> {
            Box::new(command_fn(
                "record-failure",
                |_: &mut CommandContext| -> EngineResult<RetryOutcome> { Err(EngineError::store("journal offline")) },
            ))
        }
    }

    #[test]
    fn unrecorded_failures_are_counted_apart_from_failed_jobs() {
        let h = setup_with(test_config(), |builder| {
            builder.with_failed_job_command_factory(Arc::new(UnrecordableFailures))
        });
        let job = h.engine.new_message_job("fail");
        let id = job.id;
        h.engine.create_job(job).unwrap();

        let outcome = h.engine.execute_job(id).unwrap();
        assert!(matches!(
            outcome,
            JobRunOutcome::FailureNotRecorded { error: EngineError::Store(_), .. }
        ));

        let stats = Arc::new(Mutex::new(AsyncExecutorStats::default()));
        AsyncJobRunner::new(h.engine.executor().clone(), stats.clone(), Arc::new(AtomicBool::new(false)))
            .run(job_in(&h, JobTable::Executable, id));

        let stats = stats.lock().unwrap();
        assert_eq!(stats.jobs_failed, 0);
        assert_eq!(stats.failure_record_errors, 1);
        let job = job_in(&h, JobTable::Executable, id);
        assert_eq!(job.failure_count, 0);
        assert_eq!(job.retries, 3);
    }

    #[test]
    fn vanished_jobs_are_a_no_op() {
        let h = setup();
        let missing = JobId::new();

        let outcome = h.engine.execute(&ExecuteAsyncJobCmd::new(missing)).unwrap();
        assert_eq!(outcome, JobExecutionOutcome::Missing);

        let retry = h.engine.execute(&JobRetryCmd::new(missing, None)).unwrap();
        assert_eq!(retry, RetryOutcome::Missing);
    }

    #[test]
    fn successful_job_is_deleted_and_announced() {
        let h = setup();
        let job = h.engine.new_message_job("ok");
        let id = job.id;
        h.engine.create_job(job).unwrap();

        run_job(&h, id);

        assert!(h.store.tables_holding(id).is_empty());
        assert_eq!(
            event_types(&h.events),
            vec![
                EngineEventType::EntityCreated,
                EngineEventType::EntityDeleted,
                EngineEventType::JobExecutionSuccess,
            ]
        );
    }

    #[test]
    fn job_locked_by_another_worker_is_left_alone() {
        let h = setup();
        let job = h.engine.new_message_job("fail");
        let id = job.id;
        h.engine.create_job(job).unwrap();
        h.engine
            .execute(&LockJobCmd {
                job_id: id,
                lock_owner: "worker-b".into(),
                lock_time: Duration::minutes(5),
            })
            .unwrap()
            .unwrap();

        let outcome = h.engine.execute(&ExecuteAsyncJobCmd::locked_by(id, "worker-a")).unwrap();
        assert_eq!(outcome, JobExecutionOutcome::LockLost);
        assert_eq!(job_in(&h, JobTable::Executable, id).lock_owner.as_deref(), Some("worker-b"));
    }

    // ---- acquisition races --------------------------------------------------

    #[test]
    fn concurrent_lock_attempts_grant_one_owner() {
        let h = setup();
        let job = h.engine.new_message_job("ok");
        let id = job.id;
        h.engine.create_job(job).unwrap();

        let handles: Vec<_> = ["worker-a", "worker-b"]
            .into_iter()
            .map(|owner| {
                let engine = h.engine.clone();
                thread::spawn(move || {
                    engine
                        .execute(&LockJobCmd {
                            job_id: id,
                            lock_owner: owner.into(),
                            lock_time: Duration::minutes(5),
                        })
                        .unwrap()
                        .map(|job| job.lock_owner)
                })
            })
            .collect();
        let winners: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(winners.len(), 1);
        assert_eq!(job_in(&h, JobTable::Executable, id).lock_owner, winners[0]);
    }

    #[test]
    fn timer_lock_keeps_other_workers_from_promoting() {
        let h = setup();
        let timer = h.engine.new_timer_job("ok", t0() + Duration::minutes(1));
        let id = timer.id;
        h.engine.create_job(timer).unwrap();
        let other = ProcessEngine::builder()
            .with_config(test_config().with_lock_owner("worker-b"))
            .with_store(h.store.clone())
            .with_clock(h.clock.clone())
            .build();
        let lock = |owner: &str| LockTimerJobCmd {
            job_id: id,
            lock_owner: owner.into(),
            lock_time: Duration::minutes(5),
        };

        // Not due yet.
        assert!(h.engine.execute(&lock("worker-a")).unwrap().is_none());

        h.clock.advance(Duration::minutes(1));
        let locked = h.engine.execute(&lock("worker-a")).unwrap().unwrap();
        assert_eq!(locked.lock_owner.as_deref(), Some("worker-a"));

        assert!(other.execute(&lock("worker-b")).unwrap().is_none());
        assert!(other.execute(&MoveTimerToExecutableCmd::locked_by(id, "worker-b")).unwrap().is_none());
        assert!(other.execute(&MoveTimerToExecutableCmd::new(id)).unwrap().is_none());
        assert_eq!(h.store.tables_holding(id), vec![JobTable::Timer]);

        // An expired lock is up for grabs.
        h.clock.advance(Duration::minutes(5));
        assert!(other.execute(&lock("worker-b")).unwrap().is_some());
        assert!(h.engine.execute(&MoveTimerToExecutableCmd::locked_by(id, "worker-a")).unwrap().is_none());

        let promoted = other
            .execute(&MoveTimerToExecutableCmd::locked_by(id, "worker-b"))
            .unwrap()
            .unwrap();
        assert!(promoted.lock_owner.is_none());
        assert_eq!(h.store.tables_holding(id), vec![JobTable::Executable]);
    }

    #[test]
    fn stale_write_is_retried_and_sees_the_winner() {
        let h = setup();
        let job = h.engine.new_message_job("ok");
        let id = job.id;
        h.engine.create_job(job).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let acquired = h
            .engine
            .execute(&command_fn("lock-after-steal", move |ctx: &mut CommandContext| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let mut job = ctx
                    .entities()?
                    .find_job(JobTable::Executable, id)?
                    .ok_or_else(|| EngineError::not_found("job", id))?;
                if attempt == 1 {
                    // Another worker locks the row after we read it.
                    ctx.executor().execute_with(
                        CommandConfig::requires_new(),
                        &LockJobCmd {
                            job_id: id,
                            lock_owner: "worker-b".into(),
                            lock_time: Duration::minutes(5),
                        },
                    )?;
                }
                let now = ctx.now();
                if job.is_locked(now) {
                    return Ok(false);
                }
                job.lock("worker-a", now + Duration::minutes(5));
                ctx.entities()?.update_job(JobTable::Executable, job)?;
                Ok(true)
            }))
            .unwrap();

        assert!(!acquired);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(job_in(&h, JobTable::Executable, id).lock_owner.as_deref(), Some("worker-b"));
    }

    /// Store that fails the next `n` commits with a chosen error.
    struct FlakyStore {
        inner: Arc<InMemoryDataStore>,
        failures: AtomicUsize,
        error: fn() -> EngineError,
    }

    impl DataStore for FlakyStore {
        fn find_job(&self, table: JobTable, id: JobId) -> EngineResult<Option<JobEntity>> {
            self.inner.find_job(table, id)
        }

        fn find_jobs(&self, table: JobTable, query: &JobQuery) -> EngineResult<Vec<JobEntity>> {
            self.inner.find_jobs(table, query)
        }

        fn find_execution(&self, id: ExecutionId) -> EngineResult<Option<ExecutionEntity>> {
            self.inner.find_execution(id)
        }

        fn find_executions_by_process_instance(
            &self,
            process_instance_id: ExecutionId,
        ) -> EngineResult<Vec<ExecutionEntity>> {
            self.inner.find_executions_by_process_instance(process_instance_id)
        }

        fn find_tasks_by_process_instance(
            &self,
            process_instance_id: ExecutionId,
        ) -> EngineResult<Vec<TaskEntity>> {
            self.inner.find_tasks_by_process_instance(process_instance_id)
        }

        fn commit(&self, batch: WriteBatch) -> EngineResult<()> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err((self.error)());
            }
            self.inner.commit(batch)
        }
    }

    fn flaky_engine(failures: usize, error: fn() -> EngineError) -> (ProcessEngine, Arc<InMemoryDataStore>) {
        let inner = InMemoryDataStore::arc();
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures: AtomicUsize::new(failures),
            error,
        });
        let engine = ProcessEngine::builder()
            .with_config(test_config())
            .with_store(store)
            .with_clock(FakeClock::new(t0()))
            .build();
        (engine, inner)
    }

    #[test]
    fn optimistic_conflicts_are_retried_until_the_attempts_run_out() {
        let (engine, store) = flaky_engine(2, || EngineError::optimistic_lock("injected"));
        let job = engine.new_message_job("ok");
        let id = job.id;

        assert_eq!(engine.create_job(job.clone()).unwrap(), JobTable::Executable);
        assert_eq!(store.tables_holding(id), vec![JobTable::Executable]);

        let (engine, _) = flaky_engine(3, || EngineError::optimistic_lock("injected"));
        let err = engine.create_job(job).unwrap_err();
        assert!(err.is_optimistic_lock());
    }

    #[test]
    fn store_failures_are_not_retried() {
        let (engine, store) = flaky_engine(1, || EngineError::store("disk full"));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let err = engine
            .execute(&command_fn("create", move |ctx: &mut CommandContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                let job = JobEntity::message("ok", ctx.now());
                ctx.job_manager().create_job(job)
            }))
            .unwrap_err();

        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(store.count(JobTable::Executable), 0);
    }

    // ---- suspension -----------------------------------------------------------

    fn park_jobs(h: &Harness, instance: &Instance) -> (JobId, JobId, JobId) {
        let root = instance.root.id;
        let child = instance.child.id;

        let timer = h
            .engine
            .new_timer_job("ok", t0() + Duration::hours(1))
            .for_execution(child, root);
        let message = h.engine.new_message_job("ok").for_execution(child, root);
        let mut dead = h.engine.new_message_job("fail").for_execution(child, root).with_retries(0);
        dead.revision = 1;
        let ids = (timer.id, message.id, dead.id);

        assert_eq!(h.engine.create_job(timer).unwrap(), JobTable::Timer);
        assert_eq!(h.engine.create_job(message).unwrap(), JobTable::Executable);
        h.engine
            .execute(&command_fn("seed-dead-letter", move |ctx: &mut CommandContext| {
                ctx.entities()?.insert_job(JobTable::DeadLetter, dead.clone())
            }))
            .unwrap();
        ids
    }

    #[test]
    fn suspend_parks_jobs_and_activate_restores_them() {
        let h = setup();
        let instance = start_instance(&h.engine);
        let (timer_id, message_id, dead_id) = park_jobs(&h, &instance);
        let timer_before = job_in(&h, JobTable::Timer, timer_id);

        let summary = h.engine.suspend_process_instance(instance.root.id).unwrap();
        assert_eq!(summary.state, SuspensionState::Suspended);
        assert_eq!(summary.executions, 2);
        assert_eq!(summary.tasks, 1);
        assert_eq!(summary.jobs_moved, 2);

        assert_eq!(h.store.count(JobTable::Suspended), 2);
        assert_eq!(h.store.count(JobTable::Timer), 0);
        assert_eq!(h.store.count(JobTable::Executable), 0);
        assert_eq!(h.store.tables_holding(dead_id), vec![JobTable::DeadLetter]);
        assert_eq!(job_in(&h, JobTable::Suspended, timer_id).suspended_from, Some(JobTable::Timer));
        assert_eq!(
            job_in(&h, JobTable::Suspended, message_id).suspended_from,
            Some(JobTable::Executable)
        );

        let executions = h
            .store
            .find_executions_by_process_instance(instance.root.id)
            .unwrap();
        assert!(executions.iter().all(ExecutionEntity::is_suspended));
        let tasks = h.store.find_tasks_by_process_instance(instance.root.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].is_suspended());
        assert_eq!(tasks[0].id, instance.task.id);

        // Jobs created while suspended are parked right away.
        let late = h.engine.new_message_job("ok").for_execution(instance.child.id, instance.root.id);
        let late_id = late.id;
        assert_eq!(h.engine.create_job(late).unwrap(), JobTable::Suspended);

        let summary = h.engine.activate_process_instance(instance.root.id).unwrap();
        assert_eq!(summary.state, SuspensionState::Active);
        assert_eq!(summary.jobs_moved, 3);

        let timer_after = job_in(&h, JobTable::Timer, timer_id);
        assert_eq!(timer_after.due_date, timer_before.due_date);
        assert_eq!(timer_after.retries, timer_before.retries);
        assert_eq!(timer_after.suspended_from, None);
        assert_eq!(h.store.tables_holding(message_id), vec![JobTable::Executable]);
        assert_eq!(h.store.tables_holding(late_id), vec![JobTable::Executable]);
        assert_eq!(h.store.tables_holding(dead_id), vec![JobTable::DeadLetter]);
        assert_eq!(h.store.count(JobTable::Suspended), 0);
    }

    #[test]
    fn stale_copies_do_not_survive_a_suspension_round_trip() {
        let h = setup();
        let instance = start_instance(&h.engine);
        let job = h.engine.new_message_job("ok").for_execution(instance.child.id, instance.root.id);
        let id = job.id;
        h.engine.create_job(job).unwrap();
        let stale = job_in(&h, JobTable::Executable, id);

        h.engine.suspend_process_instance(instance.root.id).unwrap();
        h.engine.activate_process_instance(instance.root.id).unwrap();
        assert!(job_in(&h, JobTable::Executable, id).revision > stale.revision);

        let err = h
            .engine
            .execute(&command_fn("stale-lock", move |ctx: &mut CommandContext| {
                let mut job = stale.clone();
                job.lock("worker-b", ctx.now() + Duration::minutes(5));
                ctx.entities()?.update_job(JobTable::Executable, job)
            }))
            .unwrap_err();

        assert!(err.is_optimistic_lock());
        assert!(job_in(&h, JobTable::Executable, id).lock_owner.is_none());
    }

    #[test]
    fn suspension_rejects_bad_targets_without_side_effects() {
        let h = setup();
        let instance = start_instance(&h.engine);

        let err = h.engine.suspend_process_instance(ExecutionId::new()).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let err = h.engine.suspend_process_instance(instance.child.id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let err = h.engine.activate_process_instance(instance.root.id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let executions = h
            .store
            .find_executions_by_process_instance(instance.root.id)
            .unwrap();
        assert!(executions.iter().all(|e| !e.is_suspended()));

        h.engine.suspend_process_instance(instance.root.id).unwrap();
        let err = h.engine.suspend_process_instance(instance.root.id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn suspension_events_cover_executions_and_tasks() {
        let h = setup();
        let instance = start_instance(&h.engine);
        h.events.drain();

        h.engine.suspend_process_instance(instance.root.id).unwrap();
        let suspended = event_types(&h.events)
            .into_iter()
            .filter(|t| *t == EngineEventType::EntitySuspended)
            .count();
        assert_eq!(suspended, 3);
    }

    // ---- operator commands ----------------------------------------------------

    #[test]
    fn dead_letter_jobs_can_be_resubmitted() {
        let h = setup();
        let job = h.engine.new_message_job("fail").with_retries(1);
        let id = job.id;
        h.engine.create_job(job).unwrap();
        run_job(&h, id);
        assert_eq!(h.store.tables_holding(id), vec![JobTable::DeadLetter]);

        let err = h.engine.set_job_retries(id, 5).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        let err = h.engine.move_dead_letter_job_to_executable(id, 0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let revived = h.engine.move_dead_letter_job_to_executable(id, 3).unwrap();
        assert_eq!(revived.retries, 3);
        assert_eq!(revived.failure_count, 0);
        assert!(revived.exception_message.is_none());
        assert_eq!(h.store.tables_holding(id), vec![JobTable::Executable]);

        let updated = h.engine.set_job_retries(id, 5).unwrap();
        assert_eq!(updated.retries, 5);
        assert_eq!(job_in(&h, JobTable::Executable, id).retries, 5);
    }

    #[test]
    fn locked_jobs_cannot_be_deleted() {
        let h = setup();
        let job = h.engine.new_message_job("ok");
        let id = job.id;
        h.engine.create_job(job).unwrap();
        h.engine
            .execute(&LockJobCmd {
                job_id: id,
                lock_owner: "worker-a".into(),
                lock_time: Duration::minutes(5),
            })
            .unwrap()
            .unwrap();

        let err = h.engine.delete_job(id).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        assert!(h.engine.execute(&UnacquireJobCmd { job_id: id }).unwrap());
        assert_eq!(h.engine.delete_job(id).unwrap(), JobTable::Executable);
        assert!(h.store.tables_holding(id).is_empty());

        let err = h.engine.delete_job(id).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn find_jobs_searches_every_store() {
        let h = setup();
        let instance = start_instance(&h.engine);
        park_jobs(&h, &instance);
        h.engine.create_job(h.engine.new_message_job("ok")).unwrap();

        let all = h.engine.find_jobs(None, JobQuery::new()).unwrap();
        assert_eq!(all.len(), 4);

        let of_instance = h
            .engine
            .find_jobs(None, JobQuery::for_process_instance(instance.root.id))
            .unwrap();
        assert_eq!(of_instance.len(), 3);

        let timers = h
            .engine
            .find_jobs(Some(JobTable::Timer), JobQuery::new())
            .unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].0, JobTable::Timer);
    }

    // ---- command context ------------------------------------------------------

    type Log = Arc<Mutex<Vec<String>>>;

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    struct First;
    struct Second;

    struct RecordingSession<M> {
        name: &'static str,
        log: Log,
        fail_flush: bool,
        _marker: PhantomData<fn() -> M>,
    }

    impl<M: 'static> RecordingSession<M> {
        fn new(name: &'static str, log: Log, fail_flush: bool) -> Self {
            Self {
                name,
                log,
                fail_flush,
                _marker: PhantomData,
            }
        }

        fn touch(&mut self) {
            self.log.lock().unwrap().push(format!("write:{}", self.name));
        }
    }

    impl<M: 'static> Session for RecordingSession<M> {
        fn flush(&mut self) -> EngineResult<()> {
            self.log.lock().unwrap().push(format!("flush:{}", self.name));
            if self.fail_flush {
                return Err(EngineError::store(format!("{} unavailable", self.name)));
            }
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().push(format!("close:{}", self.name));
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    struct RecordingListener {
        name: &'static str,
        log: Log,
    }

    impl RecordingListener {
        fn record(&self, hook: &str) {
            self.log.lock().unwrap().push(format!("{hook}:{}", self.name));
        }
    }

    impl CommandContextCloseListener for RecordingListener {
        fn closing(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
            self.record("closing");
            Ok(())
        }

        fn after_session_flush(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
            self.record("after_flush");
            Ok(())
        }

        fn closed(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
            self.record("closed");
            Ok(())
        }

        fn close_failure(&mut self, _ctx: &mut CommandContext) {
            self.record("close_failure");
        }
    }

    fn recording_engine(log: &Log, fail_first_flush: bool) -> ProcessEngine {
        let (first_log, second_log) = (log.clone(), log.clone());
        ProcessEngine::builder()
            .with_config(test_config())
            .with_session_factory(move |_| RecordingSession::<First>::new("a", first_log.clone(), fail_first_flush))
            .with_session_factory(move |_| RecordingSession::<Second>::new("b", second_log.clone(), false))
            .build()
    }

    fn touch_both(
        log: Log,
        result: fn() -> EngineResult<u32>,
    ) -> impl Fn(&mut CommandContext) -> EngineResult<u32> {
        move |ctx: &mut CommandContext| {
            ctx.session::<RecordingSession<First>>()?.touch();
            ctx.session::<RecordingSession<Second>>()?.touch();
            // Same instance on every request.
            ctx.session::<RecordingSession<First>>()?.touch();
            ctx.add_close_listener(RecordingListener { name: "1", log: log.clone() });
            ctx.add_close_listener(RecordingListener { name: "2", log: log.clone() });
            result()
        }
    }

    #[test]
    fn successful_commands_flush_every_session_between_listener_hooks() {
        let log = Log::default();
        let engine = recording_engine(&log, false);

        let value = engine
            .execute(&command_fn("touch", touch_both(log.clone(), || Ok(7))))
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(
            entries(&log),
            vec![
                "write:a",
                "write:b",
                "write:a",
                "closing:1",
                "closing:2",
                "flush:a",
                "flush:b",
                "after_flush:1",
                "after_flush:2",
                "closed:1",
                "closed:2",
                "close:a",
                "close:b",
            ]
        );
    }

    #[test]
    fn failed_commands_never_flush() {
        let log = Log::default();
        let engine = recording_engine(&log, false);

        let err = engine
            .execute(&command_fn(
                "touch",
                touch_both(log.clone(), || Err(EngineError::invalid_argument("nope"))),
            ))
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidArgument(_)));
        let log = entries(&log);
        assert!(!log.iter().any(|entry| entry.starts_with("flush")));
        assert_eq!(
            &log[3..],
            ["close_failure:1", "close_failure:2", "close:a", "close:b"]
        );
    }

    #[test]
    fn flush_failure_aborts_remaining_flushes() {
        let log = Log::default();
        let engine = recording_engine(&log, true);

        let err = engine
            .execute(&command_fn("touch", touch_both(log.clone(), || Ok(1))))
            .unwrap_err();

        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(
            &entries(&log)[3..],
            [
                "closing:1",
                "closing:2",
                "flush:a",
                "close_failure:1",
                "close_failure:2",
                "close:a",
                "close:b",
            ]
        );
    }

    #[test]
    fn unregistered_sessions_are_a_configuration_error() {
        let engine = ProcessEngine::builder().with_config(test_config()).build();
        let err = engine
            .execute(&command_fn("open", |ctx: &mut CommandContext| {
                ctx.session::<RecordingSession<First>>().map(|_| ())
            }))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn nested_commands_share_the_callers_context() {
        let h = setup();
        let store = h.store.clone();
        let job = h.engine.new_message_job("ok");
        let id = job.id;

        let seen = h
            .engine
            .execute(&command_fn("outer", move |ctx: &mut CommandContext| {
                ctx.job_manager().create_job(job.clone())?;
                let store = store.clone();
                ctx.execute(&command_fn("inner", move |ctx: &mut CommandContext| {
                    // Pending in the shared session, not yet in the store.
                    assert_eq!(store.count(JobTable::Executable), 0);
                    ctx.entities()?.find_job(JobTable::Executable, id)
                }))
            }))
            .unwrap();

        assert_eq!(seen.map(|job| job.id), Some(id));
        assert_eq!(h.store.tables_holding(id), vec![JobTable::Executable]);
    }

    #[test]
    fn nested_failure_rolls_back_the_outer_command() {
        let h = setup();
        let job = h.engine.new_message_job("ok");
        let id = job.id;

        let err = h
            .engine
            .execute(&command_fn("outer", move |ctx: &mut CommandContext| {
                ctx.job_manager().create_job(job.clone())?;
                ctx.execute(&command_fn("inner", |_: &mut CommandContext| -> EngineResult<()> {
                    Err(EngineError::invalid_argument("inner failed"))
                }))
            }))
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert!(h.store.tables_holding(id).is_empty());
    }

    struct Tagging {
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CommandInterceptor for Tagging {
        fn name(&self) -> &'static str {
            "tagging"
        }

        fn intercept(&self, invocation: CommandInvocation<'_>, next: Next<'_>) -> EngineResult<CommandOutput> {
            self.seen.lock().unwrap().push(invocation.command_name());
            next.run(invocation)
        }
    }

    #[test]
    fn custom_interceptors_and_profiling_join_the_chain() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = ProcessEngine::builder()
            .with_config(test_config().with_profiling(true))
            .with_clock(FakeClock::new(t0()))
            .with_interceptor(Tagging { seen: seen.clone() })
            .build();

        assert_eq!(
            engine.executor().chain(),
            vec!["log", "profiling", "retry", "tagging", "command-context", "invoker"]
        );

        engine.create_job(engine.new_message_job("ok")).unwrap();
        engine.create_job(engine.new_message_job("ok")).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["CreateJobCmd", "CreateJobCmd"]);
        let stats = engine.profiler().stats_for("CreateJobCmd").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.failures, 0);
    }

    // ---- async executor -------------------------------------------------------

    fn executor_config() -> EngineConfig {
        test_config()
            .with_acquire_wait_time(StdDuration::from_millis(10))
            .with_max_jobs_per_acquisition(4)
            .with_max_timers_per_acquisition(4)
            .with_worker_pool_size(2)
            .with_shutdown_timeout(StdDuration::from_secs(5))
    }

    fn wait_until(deadline: StdDuration, mut condition: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if condition() {
                return true;
            }
            thread::sleep(StdDuration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn executor_runs_due_jobs_and_promotes_timers() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let h = setup_with(executor_config(), move |builder| {
            builder.with_handler_fn("count", move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        for _ in 0..5 {
            h.engine.create_job(h.engine.new_message_job("count")).unwrap();
        }
        let timer = h.engine.new_timer_job("count", t0() + Duration::seconds(30));
        let timer_id = timer.id;
        h.engine.create_job(timer).unwrap();

        let handle = h.engine.async_executor().start().unwrap();
        assert!(wait_until(StdDuration::from_secs(5), || done.load(Ordering::SeqCst) == 5));
        assert_eq!(h.store.tables_holding(timer_id), vec![JobTable::Timer]);

        h.clock.advance(Duration::seconds(31));
        assert!(wait_until(StdDuration::from_secs(5), || done.load(Ordering::SeqCst) == 6));

        let stats = handle.stats();
        assert_eq!(stats.jobs_succeeded, 6);
        assert_eq!(stats.timers_promoted, 1);
        assert_eq!(stats.jobs_failed, 0);

        let report = handle.shutdown();
        assert!(report.drained);
        assert_eq!(report.unacquired, 0);
        assert_eq!(h.store.count(JobTable::Executable), 0);
    }

    #[test]
    fn executor_routes_failures_to_retry() {
        let h = setup_with(executor_config(), |builder| builder);
        let job = h.engine.new_message_job("fail").with_retries(1);
        let id = job.id;
        h.engine.create_job(job).unwrap();

        let handle = h.engine.async_executor().start().unwrap();
        assert!(wait_until(StdDuration::from_secs(5), || {
            h.store.tables_holding(id) == vec![JobTable::DeadLetter]
        }));
        assert!(wait_until(StdDuration::from_secs(5), || handle.stats().jobs_dead_lettered == 1));
        assert_eq!(handle.stats().jobs_failed, 1);
        handle.shutdown();
    }

    #[test]
    fn exclusive_jobs_of_one_instance_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicUsize::new(0));
        let (r, o, d) = (running.clone(), overlapped.clone(), done.clone());

        let config = executor_config().with_worker_pool_size(4).with_max_jobs_per_acquisition(8);
        let h = setup_with(config, move |builder| {
            builder.with_handler_fn("serial", move |_, _, _| {
                if r.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.store(true, Ordering::SeqCst);
                }
                thread::sleep(StdDuration::from_millis(20));
                r.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let instance = start_instance(&h.engine);

        for _ in 0..4 {
            let job = h
                .engine
                .new_message_job("serial")
                .for_execution(instance.child.id, instance.root.id)
                .exclusive(true);
            h.engine.create_job(job).unwrap();
        }

        let handle = h.engine.async_executor().start().unwrap();
        assert!(wait_until(StdDuration::from_secs(5), || done.load(Ordering::SeqCst) == 4));
        handle.shutdown();

        assert!(!overlapped.load(Ordering::SeqCst));
        let root = h.store.find_execution(instance.root.id).unwrap().unwrap();
        assert!(root.lock_owner.is_none());
    }

    #[test]
    fn shutdown_releases_jobs_that_never_started() {
        let release = Arc::new(AtomicBool::new(false));
        let gate = release.clone();
        let config = executor_config()
            .with_worker_pool_size(1)
            .with_max_jobs_per_acquisition(3);
        let h = setup_with(config, move |builder| {
            builder.with_handler_fn("gated", move |_, _, _| {
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(StdDuration::from_millis(5));
                }
                Ok(())
            })
        });
        for _ in 0..3 {
            h.engine.create_job(h.engine.new_message_job("gated")).unwrap();
        }

        let handle = h.engine.async_executor().start().unwrap();
        assert!(wait_until(StdDuration::from_secs(5), || handle.stats().jobs_acquired == 3));

        let opener = {
            let release = release.clone();
            thread::spawn(move || {
                thread::sleep(StdDuration::from_millis(200));
                release.store(true, Ordering::SeqCst);
            })
        };
        let report = handle.shutdown();
        opener.join().unwrap();

        assert!(report.drained);
        assert_eq!(report.unacquired, 2);
        let left = h
            .store
            .find_jobs(JobTable::Executable, &JobQuery::new())
            .unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|job| job.lock_owner.is_none()));
    }
}
