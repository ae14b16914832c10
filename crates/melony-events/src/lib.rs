//! Event journaling and read-side projections for Melony.
//!
//! - [`EventJournal`] persists (best-effort, bounded wait) and broadcasts
//!   every event flowing through a run.
//! - [`aggregate`] folds an event log into display sets and chat messages.
//! - [`store`] holds reference implementations of the storage ports.

pub mod aggregate;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use melony_protocol::{Event, EventStorePort, RunId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

pub use aggregate::{display_by_surface, filter_by_slots, group_into_messages};
pub use store::{FileEventStore, FileKeyValueStore, InMemoryEventStore, InMemoryKeyValueStore};

/// Predicate selecting which events reach the event store.
pub type PersistFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// An event tagged with the run it flowed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournaledEvent {
    pub run_id: RunId,
    pub event: Event,
}

#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<JournaledEvent>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, entry: JournaledEvent) {
        let _ = self.sender.send(entry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JournaledEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<JournaledEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

/// Outcome of journaling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Saved,
    Skipped,
    Failed,
}

#[derive(Clone)]
pub struct EventJournal {
    store: Arc<dyn EventStorePort>,
    stream: EventStreamHub,
    filter: Option<PersistFilter>,
    persist_timeout: Duration,
}

impl EventJournal {
    pub fn new(store: Arc<dyn EventStorePort>, stream: EventStreamHub) -> Self {
        Self {
            store,
            stream,
            filter: None,
            persist_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_filter(mut self, filter: PersistFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_persist_timeout(mut self, persist_timeout: Duration) -> Self {
        self.persist_timeout = persist_timeout;
        self
    }

    /// Persist then broadcast. Store failures and timeouts are logged and
    /// never returned: persistence is best-effort.
    #[instrument(
        skip(self, event),
        fields(run_id = %run_id, event_type = %event.event_type)
    )]
    pub async fn record(&self, run_id: &RunId, event: &Event) -> Persisted {
        let persisted = if self.filter.as_ref().is_some_and(|keep| !keep(event)) {
            Persisted::Skipped
        } else {
            match tokio::time::timeout(self.persist_timeout, self.store.save_event(run_id, event))
                .await
            {
                Ok(Ok(())) => Persisted::Saved,
                Ok(Err(error)) => {
                    warn!(%error, "event persistence failed; continuing");
                    Persisted::Failed
                }
                Err(_) => {
                    warn!(
                        timeout_ms = self.persist_timeout.as_millis() as u64,
                        "event persistence timed out; continuing"
                    );
                    Persisted::Failed
                }
            }
        };

        self.stream.publish(JournaledEvent {
            run_id: run_id.clone(),
            event: event.clone(),
        });
        debug!(?persisted, "event journaled");
        persisted
    }

    pub async fn history(&self, run_id: &RunId) -> Result<Vec<Event>> {
        self.store
            .get_history(run_id)
            .await
            .with_context(|| format!("failed loading history for run {run_id}"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JournaledEvent> {
        self.stream.subscribe()
    }

    pub fn hub(&self) -> &EventStreamHub {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use melony_protocol::{
        Event, EventStorePort, MelonyError, MelonyResult, RunId, types,
    };

    use super::*;

    struct FailingStore;

    #[async_trait]
    impl EventStorePort for FailingStore {
        async fn save_event(&self, _run_id: &RunId, _event: &Event) -> MelonyResult<()> {
            Err(MelonyError::Storage("disk full".into()))
        }

        async fn get_history(&self, _run_id: &RunId) -> MelonyResult<Vec<Event>> {
            Err(MelonyError::Storage("disk full".into()))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl EventStorePort for StalledStore {
        async fn save_event(&self, _run_id: &RunId, _event: &Event) -> MelonyResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn get_history(&self, _run_id: &RunId) -> MelonyResult<Vec<Event>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_persistence_still_broadcasts() -> Result<()> {
        let journal = EventJournal::new(Arc::new(FailingStore), EventStreamHub::new(8));
        let mut rx = journal.subscribe();
        let run_id = RunId::from_string("r1");

        let outcome = journal.record(&run_id, &Event::text("hi")).await;
        assert_eq!(outcome, Persisted::Failed);
        let entry = rx.recv().await?;
        assert_eq!(entry.run_id, run_id);
        assert!(journal.history(&run_id).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn stalled_store_is_bounded_by_timeout() -> Result<()> {
        let journal = EventJournal::new(Arc::new(StalledStore), EventStreamHub::new(8))
            .with_persist_timeout(Duration::from_millis(20));
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            journal.record(&RunId::from_string("r1"), &Event::text("hi")),
        )
        .await?;
        assert_eq!(outcome, Persisted::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn filter_skips_persistence() -> Result<()> {
        let store = Arc::new(InMemoryEventStore::new());
        let journal = EventJournal::new(store.clone(), EventStreamHub::new(8))
            .with_filter(Arc::new(|event: &Event| event.event_type != types::TEXT_DELTA));
        let run_id = RunId::from_string("r1");

        assert_eq!(
            journal.record(&run_id, &Event::text_delta("x")).await,
            Persisted::Skipped
        );
        assert_eq!(
            journal.record(&run_id, &Event::text("kept")).await,
            Persisted::Saved
        );
        let history = journal.history(&run_id).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, types::TEXT);
        Ok(())
    }
}
