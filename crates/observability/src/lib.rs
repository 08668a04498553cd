//! Process-wide tracing setup for engines and their tests.

pub mod tracing;

pub use crate::tracing::init_for_tests;

/// Install the JSON subscriber for an engine process. Repeat calls are no-ops.
pub fn init() {
    tracing::init();
}
