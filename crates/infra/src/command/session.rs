//! Sessions: resource managers opened lazily by a [`CommandContext`].
//!
//! [`CommandContext`]: super::CommandContext

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use procflow_core::{EngineError, EngineResult};

use crate::engine::EngineServices;

/// One category of durable state touched by a command.
///
/// A context opens at most one instance per session type, flushes it once
/// when the command succeeds and closes it in every case.
pub trait Session: Any + Send {
    fn flush(&mut self) -> EngineResult<()>;

    fn close(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

type Factory = Arc<dyn Fn(&EngineServices) -> Box<dyn Session> + Send + Sync>;

/// Registry of session constructors, keyed by session type.
#[derive(Clone, Default)]
pub struct SessionFactories {
    factories: HashMap<TypeId, (&'static str, Factory)>,
}

impl SessionFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S, F>(&mut self, factory: F)
    where
        S: Session,
        F: Fn(&EngineServices) -> S + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |services: &EngineServices| -> Box<dyn Session> {
            Box::new(factory(services))
        });
        self.factories
            .insert(TypeId::of::<S>(), (std::any::type_name::<S>(), factory));
    }

    pub fn contains<S: Session>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<S>())
    }

    pub(crate) fn open(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        services: &EngineServices,
    ) -> EngineResult<Box<dyn Session>> {
        let (_, factory) = self.factories.get(&type_id).ok_or_else(|| {
            EngineError::configuration(format!("no session factory registered for {type_name}"))
        })?;
        Ok(factory(services))
    }

    pub fn registered(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.values().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names
    }
}

impl core::fmt::Debug for SessionFactories {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionFactories")
            .field("sessions", &self.registered())
            .finish()
    }
}
