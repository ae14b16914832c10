//! Chat message projection of the event log.

use crate::event::{Event, Role};
use crate::ids::RunId;
use serde::{Deserialize, Serialize};

/// A contiguous run of events sharing role and run id, folded for display.
///
/// Messages are recomputed from the event log on every read and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub content: String,
    #[serde(default)]
    pub ui_events: Vec<Event>,
}

impl Message {
    pub fn new(role: Role, run_id: Option<RunId>) -> Self {
        Self {
            role,
            run_id,
            content: String::new(),
            ui_events: Vec::new(),
        }
    }

    /// Project back into events: one `text` event carrying the accumulated
    /// content and stamped with this message's role and run id, then the ui
    /// events unchanged. Regrouping the projection yields the same message.
    ///
    /// The `text` carrier is emitted even when the content is empty: it is
    /// the only event guaranteed to carry the message boundary.
    pub fn to_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.ui_events.len() + 1);
        events.push(self.stamp(Event::text(self.content.clone())));
        events.extend(self.ui_events.iter().cloned());
        events
    }

    fn stamp(&self, mut event: Event) -> Event {
        let meta = event.meta_mut();
        meta.role = Some(self.role.clone());
        if let Some(run_id) = &self.run_id {
            meta.run_id = Some(run_id.clone());
        }
        event
    }
}
