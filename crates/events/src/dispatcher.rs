//! Fire-and-forget event dispatch used by commands.

use std::sync::Arc;

use tracing::warn;

use crate::bus::EventBus;
use crate::envelope::EngineEvent;

/// Sink for engine notifications.
///
/// Implementations must not fail the caller: anything that goes wrong while
/// delivering is logged and swallowed.
pub trait EventDispatcher: Send + Sync {
    /// Whether anybody listens; lets commands skip building payloads.
    fn is_enabled(&self) -> bool {
        true
    }

    fn dispatch(&self, event: EngineEvent);
}

impl<D> EventDispatcher for Arc<D>
where
    D: EventDispatcher + ?Sized,
{
    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }

    fn dispatch(&self, event: EngineEvent) {
        (**self).dispatch(event)
    }
}

/// Dispatcher that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventDispatcher;

impl EventDispatcher for NoopEventDispatcher {
    fn is_enabled(&self) -> bool {
        false
    }

    fn dispatch(&self, _event: EngineEvent) {}
}

/// Dispatcher that publishes onto an [`EventBus`].
#[derive(Debug)]
pub struct BusEventDispatcher<B> {
    bus: B,
}

impl<B> BusEventDispatcher<B>
where
    B: EventBus<EngineEvent>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> EventDispatcher for BusEventDispatcher<B>
where
    B: EventBus<EngineEvent>,
{
    fn dispatch(&self, event: EngineEvent) {
        let event_type = event.event_type();
        let entity_id = event.entity().id.clone();
        if let Err(e) = self.bus.publish(event) {
            warn!(event_type = %event_type, entity_id = %entity_id, error = %e, "failed to publish engine event");
        }
    }
}
