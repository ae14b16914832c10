//! Read-side projections of an event log.
//!
//! Both projections are pure folds recomputed on every read; the log itself is
//! never modified.

use std::collections::HashMap;

use indexmap::IndexMap;
use melony_protocol::{Event, Message, types};

/// Keep every slot-less event and, per `(surface, slot)`, only the latest
/// event. Survivors keep their original relative order.
pub fn filter_by_slots(events: &[Event]) -> Vec<Event> {
    let mut latest: HashMap<(Option<&str>, &str), usize> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        if let Some(slot) = event.slot() {
            latest.insert((event.surface(), slot), index);
        }
    }

    events
        .iter()
        .enumerate()
        .filter(|(index, event)| match event.slot() {
            Some(slot) => latest.get(&(event.surface(), slot)) == Some(index),
            None => true,
        })
        .map(|(_, event)| event.clone())
        .collect()
}

/// Slot-filtered events grouped by surface in first-seen order. Events
/// without a surface land under `""`.
pub fn display_by_surface(events: &[Event]) -> IndexMap<String, Vec<Event>> {
    let mut surfaces: IndexMap<String, Vec<Event>> = IndexMap::new();
    for event in filter_by_slots(events) {
        let surface = event.surface().unwrap_or_default().to_owned();
        surfaces.entry(surface).or_default().push(event);
    }
    surfaces
}

/// Fold events into chat messages.
///
/// A new message starts when the role changes, or when both the current
/// message and the incoming event carry a run id and they differ. A message
/// adopts the first run id it sees. Missing roles count as `assistant`.
pub fn group_into_messages(events: &[Event]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();

    for event in events {
        let role = event.role().cloned().unwrap_or_default();
        let run_id = event.run_id();

        let starts_new = match messages.last() {
            None => true,
            Some(current) => {
                current.role != role
                    || matches!((&current.run_id, run_id), (Some(open), Some(incoming)) if open != incoming)
            }
        };
        if starts_new {
            messages.push(Message::new(role, run_id.cloned()));
        }

        let Some(current) = messages.last_mut() else {
            continue;
        };
        if current.run_id.is_none() {
            current.run_id = run_id.cloned();
        }
        fold_into(current, event);
    }

    messages
}

fn fold_into(message: &mut Message, event: &Event) {
    match event.event_type.as_str() {
        types::TEXT_DELTA => {
            if let Some(delta) = event.data_str("delta") {
                message.content.push_str(delta);
            }
        }
        types::TEXT => {
            if let Some(content) = event.data_str("content") {
                message.content.push_str(content);
            }
        }
        _ => message.ui_events.push(event.clone()),
    }
}
