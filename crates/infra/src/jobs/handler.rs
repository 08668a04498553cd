//! Job handlers and their registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use procflow_core::JobEntity;

use crate::command::CommandContext;

/// Resumes the work a job stands for.
///
/// Runs inside the job's execute command; everything it writes through
/// `ctx` becomes durable together with the job's deletion. Any error fails
/// the job and routes it to the retry command.
pub trait JobHandler: Send + Sync {
    fn execute(
        &self,
        job: &JobEntity,
        configuration: Option<&str>,
        ctx: &mut CommandContext,
    ) -> anyhow::Result<()>;
}

/// Handler backed by a closure.
pub struct FnJobHandler<F>(pub F);

impl<F> JobHandler for FnJobHandler<F>
where
    F: Fn(&JobEntity, Option<&str>, &mut CommandContext) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(
        &self,
        job: &JobEntity,
        configuration: Option<&str>,
        ctx: &mut CommandContext,
    ) -> anyhow::Result<()> {
        (self.0)(job, configuration, ctx)
    }
}

/// Handlers by job handler type.
///
/// Resolution order: exact type, then the longest matching `prefix.*`
/// pattern, then `*`.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pattern: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.into(), Arc::new(handler));
    }

    pub fn register_fn<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobEntity, Option<&str>, &mut CommandContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(pattern, FnJobHandler(handler));
    }

    pub fn resolve(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(handler) = handlers.get(handler_type) {
            return Some(handler.clone());
        }

        // Category match (e.g. "mail.*" matches "mail.reminder").
        let category = handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                handler_type
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
                    .then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(handler.clone());
        }

        handlers.get("*").cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
