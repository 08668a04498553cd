//! Command executor: the entry point into the interceptor chain.

use std::sync::Arc;

use procflow_core::{EngineError, EngineResult};

use crate::engine::EngineServices;

use super::context::CommandContext;
use super::interceptor::{CommandInterceptor, CommandInvocation, Next};
use super::{Command, CommandConfig, ErasedCommand};

struct ExecutorInner {
    services: EngineServices,
    chain: Arc<[Arc<dyn CommandInterceptor>]>,
    default_config: CommandConfig,
}

/// Runs commands through one engine's interceptor chain. Cheap to clone.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<ExecutorInner>,
}

impl CommandExecutor {
    pub fn new(services: EngineServices, chain: Vec<Arc<dyn CommandInterceptor>>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                services,
                chain: chain.into(),
                default_config: CommandConfig::default(),
            }),
        }
    }

    pub fn services(&self) -> &EngineServices {
        &self.inner.services
    }

    /// Interceptor names, outermost first.
    pub fn chain(&self) -> Vec<&'static str> {
        self.inner.chain.iter().map(|i| i.name()).collect()
    }

    /// Run `command` in a fresh context.
    pub fn execute<C: Command>(&self, command: &C) -> EngineResult<C::Output> {
        self.run(self.inner.default_config, command, None)
    }

    pub fn execute_with<C: Command>(&self, config: CommandConfig, command: &C) -> EngineResult<C::Output> {
        self.run(config, command, None)
    }

    pub(crate) fn run<C: Command>(
        &self,
        config: CommandConfig,
        command: &C,
        context: Option<&mut CommandContext>,
    ) -> EngineResult<C::Output> {
        let invocation = CommandInvocation {
            config,
            command: command as &dyn ErasedCommand,
            context,
            executor: self,
        };
        let output = Next::start(&self.inner.chain).run(invocation)?;
        output.downcast::<C::Output>().map(|output| *output).map_err(|_| {
            EngineError::configuration(format!(
                "command {} produced an unexpected output type",
                command.name()
            ))
        })
    }
}

impl core::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("chain", &self.chain())
            .finish()
    }
}
