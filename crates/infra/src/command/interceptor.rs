//! Interceptor chain.
//!
//! The chain is an ordered slice, outermost first; [`Next`] is an index into
//! it. The last element must be terminal ([`CommandInvoker`]).

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{Level, debug, span, warn};

use procflow_core::{EngineError, EngineResult};

use super::context::CommandContext;
use super::executor::CommandExecutor;
use super::profiler::CommandProfiler;
use super::{CommandConfig, CommandOutput, ErasedCommand};

/// One command run as seen by interceptors.
pub struct CommandInvocation<'a> {
    pub config: CommandConfig,
    pub command: &'a dyn ErasedCommand,
    /// The caller's open context, for nested runs.
    pub context: Option<&'a mut CommandContext>,
    pub executor: &'a CommandExecutor,
}

impl CommandInvocation<'_> {
    /// Shorter-lived copy, for interceptors that call `next` more than once.
    pub fn reborrow(&mut self) -> CommandInvocation<'_> {
        CommandInvocation {
            config: self.config,
            command: self.command,
            context: self.context.as_deref_mut(),
            executor: self.executor,
        }
    }

    pub fn command_name(&self) -> &'static str {
        self.command.command_name()
    }

    /// Not nested inside another command's context.
    pub fn is_outermost(&self) -> bool {
        self.context.is_none()
    }
}

pub trait CommandInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept(&self, invocation: CommandInvocation<'_>, next: Next<'_>) -> EngineResult<CommandOutput>;
}

/// The rest of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn CommandInterceptor>],
    index: usize,
}

impl<'a> Next<'a> {
    pub(crate) fn start(chain: &'a [Arc<dyn CommandInterceptor>]) -> Self {
        Self { chain, index: 0 }
    }

    pub fn run(self, invocation: CommandInvocation<'_>) -> EngineResult<CommandOutput> {
        let interceptor = self.chain.get(self.index).ok_or_else(|| {
            EngineError::configuration("interceptor chain ended without a terminal interceptor")
        })?;
        interceptor.intercept(
            invocation,
            Next {
                chain: self.chain,
                index: self.index + 1,
            },
        )
    }
}

/// Debug span plus timing around every command.
#[derive(Debug, Default)]
pub struct LogInterceptor;

impl CommandInterceptor for LogInterceptor {
    fn name(&self) -> &'static str {
        "log"
    }

    fn intercept(&self, invocation: CommandInvocation<'_>, next: Next<'_>) -> EngineResult<CommandOutput> {
        let command = invocation.command_name();
        let nested = !invocation.is_outermost();
        let span = span!(Level::DEBUG, "command", command, nested);
        let _enter = span.enter();

        let started = Instant::now();
        let result = next.run(invocation);
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(_) => debug!(command, elapsed_ms, "command finished"),
            Err(err) => debug!(command, elapsed_ms, error = %err, "command failed"),
        }
        result
    }
}

/// Feeds the engine's [`CommandProfiler`].
pub struct ProfilingInterceptor {
    profiler: Arc<CommandProfiler>,
}

impl ProfilingInterceptor {
    pub fn new(profiler: Arc<CommandProfiler>) -> Self {
        Self { profiler }
    }
}

impl CommandInterceptor for ProfilingInterceptor {
    fn name(&self) -> &'static str {
        "profiling"
    }

    fn intercept(&self, invocation: CommandInvocation<'_>, next: Next<'_>) -> EngineResult<CommandOutput> {
        let command = invocation.command_name();
        let started = Instant::now();
        let result = next.run(invocation);
        self.profiler.record(command, started.elapsed(), result.is_ok());
        result
    }
}

/// Re-runs an outermost command that lost an optimistic-lock race.
///
/// Nested commands are never retried; their failure belongs to the caller.
#[derive(Debug, Clone)]
pub struct RetryInterceptor {
    attempts: u32,
    wait: Duration,
    wait_increase_factor: u32,
}

impl RetryInterceptor {
    pub fn new(attempts: u32, wait: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            wait,
            wait_increase_factor: 5,
        }
    }

    pub fn with_wait_increase_factor(mut self, factor: u32) -> Self {
        self.wait_increase_factor = factor.max(1);
        self
    }
}

impl CommandInterceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn intercept(&self, mut invocation: CommandInvocation<'_>, next: Next<'_>) -> EngineResult<CommandOutput> {
        if !invocation.is_outermost() {
            return next.run(invocation);
        }

        let command = invocation.command_name();
        let mut wait = self.wait;
        let mut attempt = 1;
        loop {
            match next.run(invocation.reborrow()) {
                Err(err) if err.is_optimistic_lock() && attempt < self.attempts => {
                    debug!(command, attempt, error = %err, "optimistic lock conflict, retrying");
                    thread::sleep(wait);
                    wait = wait.saturating_mul(self.wait_increase_factor);
                    attempt += 1;
                }
                Err(err) if err.is_optimistic_lock() => {
                    warn!(command, attempts = attempt, error = %err, "giving up after repeated optimistic lock conflicts");
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}

/// Opens a fresh [`CommandContext`] unless the caller's may be reused, and
/// closes it with the command's result.
#[derive(Debug, Default)]
pub struct CommandContextInterceptor;

impl CommandInterceptor for CommandContextInterceptor {
    fn name(&self) -> &'static str {
        "command-context"
    }

    fn intercept(&self, invocation: CommandInvocation<'_>, next: Next<'_>) -> EngineResult<CommandOutput> {
        if invocation.config.context_reusable && invocation.context.is_some() {
            return next.run(invocation);
        }

        let CommandInvocation {
            config,
            command,
            executor,
            ..
        } = invocation;
        let mut context = CommandContext::new(executor.clone());
        let result = next.run(CommandInvocation {
            config,
            command,
            context: Some(&mut context),
            executor,
        });
        context.close(result)
    }
}

/// Terminal interceptor: runs the command.
#[derive(Debug, Default)]
pub struct CommandInvoker;

impl CommandInterceptor for CommandInvoker {
    fn name(&self) -> &'static str {
        "invoker"
    }

    fn intercept(&self, invocation: CommandInvocation<'_>, _next: Next<'_>) -> EngineResult<CommandOutput> {
        let context = invocation
            .context
            .ok_or_else(|| EngineError::configuration("command reached the invoker without a context"))?;
        invocation.command.execute_erased(context)
    }
}

/// Default chain, outermost first. `custom` interceptors run just outside
/// the context interceptor.
pub fn default_chain(
    retry: RetryInterceptor,
    profiler: Option<Arc<CommandProfiler>>,
    custom: Vec<Arc<dyn CommandInterceptor>>,
) -> Vec<Arc<dyn CommandInterceptor>> {
    let mut chain: Vec<Arc<dyn CommandInterceptor>> = vec![Arc::new(LogInterceptor)];
    if let Some(profiler) = profiler {
        chain.push(Arc::new(ProfilingInterceptor::new(profiler)));
    }
    chain.push(Arc::new(retry));
    chain.extend(custom);
    chain.push(Arc::new(CommandContextInterceptor));
    chain.push(Arc::new(CommandInvoker));
    chain
}
