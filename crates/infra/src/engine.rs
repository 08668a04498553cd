//! Engine bootstrap.
//!
//! [`ProcessEngine::builder`] wires configuration, storage, clock, event
//! dispatcher, job handlers, retry cycles and extra interceptors into one
//! [`CommandExecutor`]. Everything not supplied falls back to an in-memory
//! or no-op default.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use procflow_core::{
    Clock, EngineResult, ExecutionId, JobEntity, JobId, JobTable, SystemClock,
};
use procflow_events::{EventDispatcher, NoopEventDispatcher};

use crate::command::interceptor::default_chain;
use crate::command::{
    Command, CommandConfig, CommandContext, CommandExecutor, CommandInterceptor, CommandProfiler,
    RetryInterceptor, Session, SessionFactories,
};
use crate::commands::{
    ActivateProcessInstanceCmd, CreateJobCmd, DefaultFailedJobCommandFactory, DeleteJobCmd,
    ExecuteAsyncJobCmd, FailedJobCommandFactory, FindJobsCmd, JobRunOutcome,
    MoveDeadLetterJobToExecutableCmd, SetJobRetriesCmd, SuspendProcessInstanceCmd,
    SuspensionSummary, run_job,
};
use crate::config::EngineConfig;
use crate::jobs::{AsyncExecutor, JobHandler, JobHandlerRegistry, RetryCycleLookup, RetryCycleRegistry};
use crate::persistence::{DataStore, EntitySession, InMemoryDataStore, JobQuery};

/// Collaborators shared by every command of one engine.
#[derive(Clone)]
pub struct EngineServices {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn DataStore>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventDispatcher>,
    pub handlers: Arc<JobHandlerRegistry>,
    pub retry_cycles: Arc<dyn RetryCycleLookup>,
    pub failed_job_commands: Arc<dyn FailedJobCommandFactory>,
    pub sessions: Arc<SessionFactories>,
    pub profiler: Arc<CommandProfiler>,
}

pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn DataStore>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventDispatcher>>,
    handlers: JobHandlerRegistry,
    retry_cycles: Option<Arc<dyn RetryCycleLookup>>,
    failed_job_commands: Option<Arc<dyn FailedJobCommandFactory>>,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
    sessions: SessionFactories,
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            clock: None,
            events: None,
            handlers: JobHandlerRegistry::new(),
            retry_cycles: None,
            failed_job_commands: None,
            interceptors: Vec::new(),
            sessions: SessionFactories::new(),
        }
    }
}

impl ProcessEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn with_event_dispatcher(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_handler(self, pattern: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.handlers.register(pattern, handler);
        self
    }

    pub fn with_handler_fn<F>(self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobEntity, Option<&str>, &mut CommandContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.register_fn(pattern, handler);
        self
    }

    pub fn with_retry_cycles(mut self, lookup: Arc<dyn RetryCycleLookup>) -> Self {
        self.retry_cycles = Some(lookup);
        self
    }

    pub fn with_failed_job_command_factory(mut self, factory: Arc<dyn FailedJobCommandFactory>) -> Self {
        self.failed_job_commands = Some(factory);
        self
    }

    /// Insert an interceptor just outside the context interceptor.
    pub fn with_interceptor(mut self, interceptor: impl CommandInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_session_factory<S, F>(mut self, factory: F) -> Self
    where
        S: Session,
        F: Fn(&EngineServices) -> S + Send + Sync + 'static,
    {
        self.sessions.register(factory);
        self
    }

    pub fn build(self) -> ProcessEngine {
        let mut sessions = self.sessions;
        if !sessions.contains::<EntitySession>() {
            sessions.register(|services: &EngineServices| EntitySession::new(services.store.clone()));
        }

        let config = Arc::new(self.config);
        let profiler = Arc::new(CommandProfiler::new(config.profiling_enabled));
        let services = EngineServices {
            store: self.store.unwrap_or_else(|| InMemoryDataStore::arc()),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventDispatcher)),
            handlers: Arc::new(self.handlers),
            retry_cycles: self
                .retry_cycles
                .unwrap_or_else(|| Arc::new(RetryCycleRegistry::new())),
            failed_job_commands: self
                .failed_job_commands
                .unwrap_or_else(|| Arc::new(DefaultFailedJobCommandFactory)),
            sessions: Arc::new(sessions),
            profiler: profiler.clone(),
            config: config.clone(),
        };

        let retry = RetryInterceptor::new(config.command_retry_attempts, config.command_retry_wait);
        let profiler = config.profiling_enabled.then_some(profiler);
        let chain = default_chain(retry, profiler, self.interceptors);

        ProcessEngine {
            executor: CommandExecutor::new(services, chain),
        }
    }
}

/// One engine instance: a command executor plus convenience operations.
#[derive(Clone)]
pub struct ProcessEngine {
    executor: CommandExecutor,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::default()
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn services(&self) -> &EngineServices {
        self.executor.services()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services().config
    }

    pub fn handlers(&self) -> &JobHandlerRegistry {
        &self.services().handlers
    }

    pub fn profiler(&self) -> &CommandProfiler {
        &self.services().profiler
    }

    pub fn execute<C: Command>(&self, command: &C) -> EngineResult<C::Output> {
        self.executor.execute(command)
    }

    pub fn execute_with<C: Command>(&self, config: CommandConfig, command: &C) -> EngineResult<C::Output> {
        self.executor.execute_with(config, command)
    }

    /// An executor over this engine's pipeline; call `start()` to run it.
    pub fn async_executor(&self) -> AsyncExecutor {
        AsyncExecutor::new(self.executor.clone())
    }

    /// Message job with the configured default retries, created now.
    pub fn new_message_job(&self, handler_type: impl Into<String>) -> JobEntity {
        let now = self.services().clock.now();
        JobEntity::message(handler_type, now).with_retries(self.config().default_job_retries)
    }

    pub fn new_timer_job(&self, handler_type: impl Into<String>, due: DateTime<Utc>) -> JobEntity {
        let now = self.services().clock.now();
        JobEntity::timer(handler_type, due, now).with_retries(self.config().default_job_retries)
    }

    /// Store a new job; returns the table it landed in.
    pub fn create_job(&self, job: JobEntity) -> EngineResult<JobTable> {
        self.execute(&CreateJobCmd { job })
    }

    /// Run one executable job now. A handler failure is recorded by the
    /// failed-job command: the job is rescheduled or dead-lettered.
    pub fn execute_job(&self, job_id: JobId) -> EngineResult<JobRunOutcome> {
        run_job(&self.executor, &ExecuteAsyncJobCmd::new(job_id))
    }

    pub fn suspend_process_instance(&self, process_instance_id: ExecutionId) -> EngineResult<SuspensionSummary> {
        self.execute(&SuspendProcessInstanceCmd { process_instance_id })
    }

    pub fn activate_process_instance(&self, process_instance_id: ExecutionId) -> EngineResult<SuspensionSummary> {
        self.execute(&ActivateProcessInstanceCmd { process_instance_id })
    }

    pub fn move_dead_letter_job_to_executable(&self, job_id: JobId, retries: u32) -> EngineResult<JobEntity> {
        self.execute(&MoveDeadLetterJobToExecutableCmd { job_id, retries })
    }

    pub fn set_job_retries(&self, job_id: JobId, retries: u32) -> EngineResult<JobEntity> {
        self.execute(&SetJobRetriesCmd { job_id, retries })
    }

    pub fn delete_job(&self, job_id: JobId) -> EngineResult<JobTable> {
        self.execute(&DeleteJobCmd { job_id })
    }

    pub fn find_jobs(&self, table: Option<JobTable>, query: JobQuery) -> EngineResult<Vec<(JobTable, JobEntity)>> {
        self.execute(&FindJobsCmd::new(table, query))
    }
}

impl core::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("lock_owner", &self.config().lock_owner)
            .field("chain", &self.executor.chain())
            .finish()
    }
}
