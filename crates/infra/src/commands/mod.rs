//! Engine commands.
//!
//! Each scheduler transition (acquire, execute, fail, suspend, ...) is one
//! command; all job state changes happen inside one of these.

pub mod acquire;
pub mod execute_job;
pub mod job_retry;
pub mod management;
pub mod suspension;

pub use acquire::{
    AcquireJobsCmd, AcquireTimerJobsCmd, LockExclusiveJobCmd, LockJobCmd, LockTimerJobCmd,
    MoveTimerToExecutableCmd, UnacquireJobCmd, UnlockExclusiveJobCmd,
};
pub use execute_job::{ExecuteAsyncJobCmd, JobExecutionOutcome, JobRunOutcome, run_job};
pub use job_retry::{
    DefaultFailedJobCommandFactory, FailedJobCommandFactory, FailureDetails, JobRetryCmd,
    RetryOutcome,
};
pub use management::{
    CreateJobCmd, DeleteJobCmd, FindJobsCmd, MoveDeadLetterJobToExecutableCmd, SetJobRetriesCmd,
};
pub use suspension::{ActivateProcessInstanceCmd, SuspendProcessInstanceCmd, SuspensionSummary};
