//! Per-engine command profiling.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Aggregated timings for one command type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    pub count: u64,
    pub failures: u64,
    pub total_time: Duration,
    pub max_time: Duration,
}

impl CommandStats {
    pub fn average_time(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total_time / self.count as u32
    }
}

/// Collects [`CommandStats`] per command name. Owned by one engine.
#[derive(Debug, Default)]
pub struct CommandProfiler {
    enabled: bool,
    stats: Mutex<HashMap<&'static str, CommandStats>>,
}

impl CommandProfiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, command: &'static str, elapsed: Duration, succeeded: bool) {
        if !self.enabled {
            return;
        }
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(command).or_default();
        entry.count += 1;
        if !succeeded {
            entry.failures += 1;
        }
        entry.total_time += elapsed;
        entry.max_time = entry.max_time.max(elapsed);
    }

    pub fn snapshot(&self) -> HashMap<&'static str, CommandStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stats_for(&self, command: &str) -> Option<CommandStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
    }

    pub fn reset(&self) {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
