//! Command pipeline.
//!
//! Every mutation of engine state is a [`Command`] run through the
//! interceptor chain of a [`CommandExecutor`]. The chain supplies logging,
//! optional profiling, retry on optimistic-lock conflicts and, innermost, a
//! [`CommandContext`] whose sessions are flushed atomically when the command
//! returns.

pub mod context;
pub mod executor;
pub mod interceptor;
pub mod profiler;
pub mod session;

use std::any::Any;
use std::marker::PhantomData;

use procflow_core::EngineResult;

pub use context::{CommandContext, CommandContextCloseListener};
pub use executor::CommandExecutor;
pub use interceptor::{
    CommandContextInterceptor, CommandInterceptor, CommandInvocation, CommandInvoker,
    LogInterceptor, Next, ProfilingInterceptor, RetryInterceptor,
};
pub use profiler::{CommandProfiler, CommandStats};
pub use session::{Session, SessionFactories};

/// Type-erased command result travelling through the interceptor chain.
pub type CommandOutput = Box<dyn Any + Send>;

/// A unit of engine work, executed inside a [`CommandContext`].
pub trait Command {
    type Output: Send + 'static;

    /// Short name used in logs and profiling.
    fn name(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output>;
}

/// Boxed commands (e.g. from a [`FailedJobCommandFactory`]) run like any other.
///
/// [`FailedJobCommandFactory`]: crate::commands::FailedJobCommandFactory
impl<T: Send + 'static> Command for Box<dyn Command<Output = T> + Send> {
    type Output = T;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<T> {
        (**self).execute(ctx)
    }
}

/// Object-safe view of a [`Command`] used by interceptors.
pub trait ErasedCommand {
    fn command_name(&self) -> &'static str;

    fn execute_erased(&self, ctx: &mut CommandContext) -> EngineResult<CommandOutput>;
}

impl<C: Command> ErasedCommand for C {
    fn command_name(&self) -> &'static str {
        self.name()
    }

    fn execute_erased(&self, ctx: &mut CommandContext) -> EngineResult<CommandOutput> {
        self.execute(ctx).map(|output| Box::new(output) as CommandOutput)
    }
}

/// Command defined by a closure.
pub struct FnCommand<F, T> {
    name: &'static str,
    f: F,
    _output: PhantomData<fn() -> T>,
}

/// Wrap a closure as a named command.
pub fn command_fn<F, T>(name: &'static str, f: F) -> FnCommand<F, T>
where
    F: Fn(&mut CommandContext) -> EngineResult<T>,
    T: Send + 'static,
{
    FnCommand {
        name,
        f,
        _output: PhantomData,
    }
}

impl<F, T> Command for FnCommand<F, T>
where
    F: Fn(&mut CommandContext) -> EngineResult<T>,
    T: Send + 'static,
{
    type Output = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<T> {
        (self.f)(ctx)
    }
}

/// How a command is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandConfig {
    /// Reuse the caller's open context instead of opening a new one.
    pub context_reusable: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            context_reusable: true,
        }
    }
}

impl CommandConfig {
    /// Always open (and close) a fresh context.
    pub fn requires_new() -> Self {
        Self {
            context_reusable: false,
        }
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
