//! Job scheduling: store transitions, handlers, retry policy and the async executor.

pub mod exclusive;
pub mod executor;
pub mod handler;
pub mod manager;
pub mod pool;
pub mod retry;
pub(crate) mod runnable;

pub use exclusive::ExclusiveJobQueue;
pub use executor::{AsyncExecutor, AsyncExecutorHandle, AsyncExecutorStats, ShutdownReport};
pub use handler::{FnJobHandler, JobHandler, JobHandlerRegistry};
pub use manager::JobManager;
pub use pool::WorkerPool;
pub use retry::{RetryCycleLookup, RetryCycleRegistry, RetryPlan, plan_retry};
