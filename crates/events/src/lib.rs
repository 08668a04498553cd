//! Engine notification events.
//!
//! Commands dispatch [`EngineEvent`]s (job executed, job dead-lettered,
//! process instance suspended, ...) through an [`EventDispatcher`]. Dispatch
//! is fire-and-forget: a failing listener never aborts the command that
//! produced the event.

pub mod bus;
pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use dispatcher::{BusEventDispatcher, EventDispatcher, NoopEventDispatcher};
pub use envelope::{EngineEvent, EntityRef};
pub use event::EngineEventType;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
