//! Command context: sessions, close listeners and the close protocol.

use std::any::TypeId;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use procflow_core::{EngineError, EngineResult};
use procflow_events::EngineEvent;

use crate::config::EngineConfig;
use crate::engine::EngineServices;
use crate::jobs::JobManager;
use crate::persistence::EntitySession;

use super::session::Session;
use super::{Command, CommandConfig, CommandExecutor};

/// Hooks into the close of a [`CommandContext`].
///
/// Successful command: `closing`, sessions flush, `after_session_flush`,
/// `closed`. Failed command (or a failure in any step before `closed`):
/// `close_failure`. Listeners run in registration order.
pub trait CommandContextCloseListener: Send {
    /// Last chance to mutate state before the sessions flush.
    fn closing(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
        Ok(())
    }

    fn after_session_flush(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
        Ok(())
    }

    fn closed(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
        Ok(())
    }

    fn close_failure(&mut self, _ctx: &mut CommandContext) {}
}

/// Per-command container of lazily opened sessions.
pub struct CommandContext {
    executor: CommandExecutor,
    sessions: Vec<(TypeId, Box<dyn Session>)>,
    close_listeners: Vec<Box<dyn CommandContextCloseListener>>,
    exception: Option<String>,
}

impl CommandContext {
    pub(crate) fn new(executor: CommandExecutor) -> Self {
        Self {
            executor,
            sessions: Vec::new(),
            close_listeners: Vec::new(),
            exception: None,
        }
    }

    pub fn services(&self) -> &EngineServices {
        self.executor.services()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.executor.services().config
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.executor.services().clock.now()
    }

    /// The session of type `S`, opened on first use.
    pub fn session<S: Session>(&mut self) -> EngineResult<&mut S> {
        let type_id = TypeId::of::<S>();
        let index = match self.sessions.iter().position(|(id, _)| *id == type_id) {
            Some(index) => index,
            None => {
                let services = self.executor.services();
                let session = services
                    .sessions
                    .open(type_id, std::any::type_name::<S>(), services)?;
                self.sessions.push((type_id, session));
                self.sessions.len() - 1
            }
        };
        self.sessions[index]
            .1
            .as_any_mut()
            .downcast_mut::<S>()
            .ok_or_else(|| {
                EngineError::configuration(format!(
                    "session factory for {} produced a different type",
                    std::any::type_name::<S>()
                ))
            })
    }

    pub fn entities(&mut self) -> EngineResult<&mut EntitySession> {
        self.session::<EntitySession>()
    }

    pub fn job_manager(&mut self) -> JobManager<'_> {
        JobManager::new(self)
    }

    /// Fire-and-forget notification.
    pub fn dispatch(&self, event: EngineEvent) {
        let events = &self.executor.services().events;
        if events.is_enabled() {
            events.dispatch(event);
        }
    }

    pub fn add_close_listener(&mut self, listener: impl CommandContextCloseListener + 'static) {
        self.close_listeners.push(Box::new(listener));
    }

    /// Run `command` inside this context (same sessions, flushed with ours).
    pub fn execute<C: Command>(&mut self, command: &C) -> EngineResult<C::Output> {
        let executor = self.executor.clone();
        executor.run(CommandConfig::default(), command, Some(self))
    }

    /// Failure recorded while closing, if any.
    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    /// Finish the context with the command's result.
    pub(crate) fn close<T>(mut self, result: EngineResult<T>) -> EngineResult<T> {
        let outcome = match result {
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
            Ok(value) => match self.flush_all() {
                Err(err) => {
                    self.fail(&err);
                    Err(err)
                }
                Ok(()) => self.notify(|listener, ctx| listener.closed(ctx)).map(|()| value),
            },
        };

        for (_, session) in &mut self.sessions {
            session.close();
        }
        self.sessions.clear();

        outcome
    }

    fn flush_all(&mut self) -> EngineResult<()> {
        self.notify(|listener, ctx| listener.closing(ctx))?;
        for (_, session) in &mut self.sessions {
            session.flush()?;
        }
        self.notify(|listener, ctx| listener.after_session_flush(ctx))
    }

    fn fail(&mut self, err: &EngineError) {
        debug!(error = %err, "closing command context after failure");
        self.exception = Some(err.to_string());

        let mut listeners = std::mem::take(&mut self.close_listeners);
        for listener in &mut listeners {
            listener.close_failure(self);
        }
        self.restore(listeners);
    }

    fn notify<F>(&mut self, mut hook: F) -> EngineResult<()>
    where
        F: FnMut(&mut (dyn CommandContextCloseListener + 'static), &mut CommandContext) -> EngineResult<()>,
    {
        let mut listeners = std::mem::take(&mut self.close_listeners);
        let mut result = Ok(());
        for listener in &mut listeners {
            if let Err(err) = hook(&mut **listener, self) {
                warn!(error = %err, "command context close listener failed");
                result = Err(err);
                break;
            }
        }
        self.restore(listeners);
        result
    }

    /// Put listeners back, keeping any registered while they ran.
    fn restore(&mut self, mut listeners: Vec<Box<dyn CommandContextCloseListener>>) {
        listeners.append(&mut self.close_listeners);
        self.close_listeners = listeners;
    }
}
