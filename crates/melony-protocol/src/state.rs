//! Run status, suspension and checkpoint records.

use crate::event::{Event, EventType};
use crate::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-run lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Dispatching,
    Suspended,
    Completed,
    Errored,
}

impl RunStatus {
    /// Errored runs accept no further triggers.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Errored)
    }

    /// No dispatch is in flight and none is awaited.
    pub fn is_resting(self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Errored)
    }
}

/// A cooperative pause awaiting a correlated external event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suspension {
    pub reason: String,
    /// Event type that resumes the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_on: Option<EventType>,
    /// Value matched against a resume event's `data.action`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    pub suspended_at: DateTime<Utc>,
}

impl Suspension {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            resume_on: None,
            correlation: None,
            suspended_at: Utc::now(),
        }
    }

    pub fn resume_on(mut self, event_type: impl Into<EventType>) -> Self {
        self.resume_on = Some(event_type.into());
        self
    }

    pub fn correlate(mut self, key: impl Into<String>) -> Self {
        self.correlation = Some(key.into());
        self
    }

    /// Whether `event` may resume a run parked on this suspension.
    pub fn accepts(&self, event: &Event) -> bool {
        if self.resume_on.is_none() && self.correlation.is_none() {
            return true;
        }
        let type_matches = self
            .resume_on
            .as_ref()
            .is_some_and(|expected| *expected == event.event_type);
        type_matches || self.correlates(event)
    }

    /// Whether `event.data.action` equals the correlation key.
    pub fn correlates(&self, event: &Event) -> bool {
        self.correlation
            .as_deref()
            .is_some_and(|key| event.data_str("action") == Some(key))
    }
}

/// Durable snapshot of a run, written to the key-value port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCheckpoint {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    pub updated_at: DateTime<Utc>,
}

impl RunCheckpoint {
    pub fn storage_key(run_id: &RunId) -> String {
        format!("run/{run_id}")
    }
}
