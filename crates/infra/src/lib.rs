//! Engine runtime: command pipeline, persistence boundary, job scheduling.
//!
//! Every state change runs as a [`Command`](command::Command) through a
//! [`CommandExecutor`](command::CommandExecutor); the commands in
//! [`commands`] implement the job store transitions and the
//! [`AsyncExecutor`](jobs::AsyncExecutor) drives them in the background.

pub mod command;
pub mod commands;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod persistence;

#[cfg(test)]
mod integration_tests;

pub use command::{Command, CommandConfig, CommandContext, CommandExecutor, command_fn};
pub use config::EngineConfig;
pub use engine::{EngineServices, ProcessEngine, ProcessEngineBuilder};
pub use jobs::{AsyncExecutor, AsyncExecutorHandle, JobHandlerRegistry, RetryCycleRegistry};
pub use persistence::{DataStore, EntitySession, InMemoryDataStore, JobQuery};
