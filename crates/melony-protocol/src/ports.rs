//! Runtime boundary ports.
//!
//! These traits are the only contract between the runtime and external
//! persistence and identity backends. They use `async-trait` so
//! implementations can be held as `Arc<dyn _>`.

use crate::error::MelonyResult;
use crate::event::Event;
use crate::ids::RunId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Append-only event history grouped by run.
#[async_trait]
pub trait EventStorePort: Send + Sync {
    async fn save_event(&self, run_id: &RunId, event: &Event) -> MelonyResult<()>;
    /// Events of `run_id` in save order. Unknown runs yield an empty history.
    async fn get_history(&self, run_id: &RunId) -> MelonyResult<Vec<Event>>;
}

/// Key-value storage used for run checkpoints.
#[async_trait]
pub trait KeyValuePort: Send + Sync {
    async fn get(&self, key: &str) -> MelonyResult<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> MelonyResult<()>;
    async fn delete(&self, key: &str) -> MelonyResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
}

/// Resolves a presented credential to a principal.
#[async_trait]
pub trait AuthPort: Send + Sync {
    async fn authenticate(&self, credential: &str) -> MelonyResult<Principal>;
}
