use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounds and buffers for the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum nesting of reactively chained events below the trigger.
    pub max_chain_depth: usize,
    /// Maximum number of events flowing through a single dispatch, counting
    /// the trigger, yielded events, side emissions and fault reports.
    pub max_events_per_dispatch: usize,
    /// Upper bound on waiting for one event or checkpoint write.
    pub persist_timeout_ms: u64,
    /// Capacity of the journal's broadcast channel.
    pub stream_buffer: usize,
    /// How many finished runs stay in memory before the oldest are evicted.
    /// Evicted runs are reloaded from their checkpoint on the next trigger.
    pub max_retained_runs: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: 32,
            max_events_per_dispatch: 512,
            persist_timeout_ms: 2_000,
            stream_buffer: 1024,
            max_retained_runs: 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn max_chain_depth(mut self, depth: usize) -> Self {
        self.max_chain_depth = depth;
        self
    }

    pub fn max_events_per_dispatch(mut self, limit: usize) -> Self {
        self.max_events_per_dispatch = limit;
        self
    }

    pub fn persist_timeout_ms(mut self, millis: u64) -> Self {
        self.persist_timeout_ms = millis;
        self
    }

    pub fn max_retained_runs(mut self, limit: usize) -> Self {
        self.max_retained_runs = limit;
        self
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}
