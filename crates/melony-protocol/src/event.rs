//! The event envelope flowing through the Melony runtime.
//!
//! An [`Event`] is `{ type, data, meta?, ui? }` on the wire. The `type`
//! discriminant determines the shape of `data`; typed access goes through
//! [`EventPayload`] so a consumer can never decode a payload under the wrong
//! type. Unknown types are first-class: any string is a valid discriminant
//! (typically an action name), only `"*"` is reserved for wildcard
//! registration.

use crate::error::{MelonyError, MelonyResult};
use crate::ids::{ApprovalId, RunId};
use crate::ui::UiNode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Well-known event type discriminants.
pub mod types {
    pub const TEXT: &str = "text";
    pub const TEXT_DELTA: &str = "text-delta";
    pub const UI: &str = "ui";
    pub const ERROR: &str = "error";
    pub const APPROVAL_REQUEST: &str = "approval:request";
    pub const APPROVAL_RESPONSE: &str = "approval:response";
    pub const ACTION_RESULT: &str = "action:result";
    /// Reserved registration marker matching every event.
    pub const WILDCARD: &str = "*";
}

/// String discriminant of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Text-bearing types fold into a message's `content`.
    pub fn is_text(&self) -> bool {
        self.0 == types::TEXT || self.0 == types::TEXT_DELTA
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for EventType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for EventType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// What a handler registers interest in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventPattern {
    Exact(EventType),
    /// Matches every event; consulted after exact matches.
    Any,
}

impl EventPattern {
    pub fn matches(&self, event_type: &EventType) -> bool {
        match self {
            Self::Exact(expected) => expected == event_type,
            Self::Any => true,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(event_type) => f.write_str(event_type.as_str()),
            Self::Any => f.write_str(types::WILDCARD),
        }
    }
}

impl From<&str> for EventPattern {
    fn from(value: &str) -> Self {
        if value == types::WILDCARD {
            Self::Any
        } else {
            Self::Exact(EventType::from(value))
        }
    }
}

impl From<String> for EventPattern {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<EventType> for EventPattern {
    fn from(value: EventType) -> Self {
        Self::from(value.0)
    }
}

/// Logical speaker of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn user() -> Self {
        Self::new("user")
    }

    pub fn assistant() -> Self {
        Self::new("assistant")
    }

    pub fn system() -> Self {
        Self::new("system")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::assistant()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Routing and grouping metadata. Extension fields are preserved verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The typed envelope flowing through the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<EventMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiNode>,
}

impl Event {
    pub fn new(event_type: impl Into<EventType>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Map::new(),
            meta: None,
            ui: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::from_payload(&TextPayload {
            content: content.into(),
        })
    }

    pub fn text_delta(delta: impl Into<String>) -> Self {
        Self::from_payload(&TextDeltaPayload {
            delta: delta.into(),
        })
    }

    pub fn ui(node: UiNode) -> Self {
        Self::new(types::UI).with_ui(node)
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::from_payload(&ErrorPayload {
            message: message.into(),
            kind,
            handler: None,
        })
    }

    /// Build an event from a typed payload. The payload's `TYPE` becomes the
    /// discriminant.
    pub fn from_payload<P: EventPayload>(payload: &P) -> Self {
        let data = match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => map,
            Ok(other) => wrap_value(other),
            Err(error) => wrap_value(Value::String(error.to_string())),
        };
        Self {
            event_type: EventType::from(P::TYPE),
            data,
            meta: None,
            ui: None,
        }
    }

    /// Decode `data` as `P`, refusing events of any other type.
    pub fn payload<P: EventPayload>(&self) -> MelonyResult<P> {
        if self.event_type != P::TYPE {
            return Err(MelonyError::PayloadMismatch {
                expected: P::TYPE.to_owned(),
                actual: self.event_type.to_string(),
            });
        }
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|error| MelonyError::InvalidPayload(format!("{}: {error}", P::TYPE)))
    }

    /// Replace `data`. Objects are used as-is, `null` clears the data, any
    /// other value is stored under `"value"`.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => wrap_value(other),
        };
        self
    }

    pub fn with_role(mut self, role: impl Into<Role>) -> Self {
        self.meta_mut().role = Some(role.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.meta_mut().run_id = Some(run_id.into());
        self
    }

    pub fn with_surface(mut self, surface: impl Into<String>) -> Self {
        self.meta_mut().surface = Some(surface.into());
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.meta_mut().slot = Some(slot.into());
        self
    }

    pub fn with_meta_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta_mut().extra.insert(key.into(), value);
        self
    }

    pub fn with_ui(mut self, node: UiNode) -> Self {
        self.ui = Some(node);
        self
    }

    pub fn meta_mut(&mut self) -> &mut EventMeta {
        self.meta.get_or_insert_with(EventMeta::default)
    }

    pub fn role(&self) -> Option<&Role> {
        self.meta.as_ref().and_then(|meta| meta.role.as_ref())
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.meta.as_ref().and_then(|meta| meta.run_id.as_ref())
    }

    pub fn surface(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.surface.as_deref())
    }

    pub fn slot(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|meta| meta.slot.as_deref())
    }

    /// String field of `data`, used for correlation keys such as `action`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.event_type == types::ERROR
    }
}

fn wrap_value(value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("value".to_owned(), value);
    map
}

// ─── Typed payloads ────────────────────────────────────────────────

/// Binds a payload struct to the event type whose `data` it describes.
pub trait EventPayload: Serialize + DeserializeOwned {
    const TYPE: &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    pub content: String,
}

impl EventPayload for TextPayload {
    const TYPE: &'static str = types::TEXT;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDeltaPayload {
    pub delta: String,
}

impl EventPayload for TextDeltaPayload {
    const TYPE: &'static str = types::TEXT_DELTA;
}

/// Normalized failure category carried by every `error` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    HandlerFault,
    ActionFailed,
    RuntimeOverflow,
    Suspended,
    RunTerminated,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub kind: ErrorKind,
    /// Identity of the handler that faulted, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

impl EventPayload for ErrorPayload {
    const TYPE: &'static str = types::ERROR;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestPayload {
    pub approval_id: ApprovalId,
    pub action: String,
    #[serde(default)]
    pub input: Value,
    pub reason: String,
}

impl EventPayload for ApprovalRequestPayload {
    const TYPE: &'static str = types::APPROVAL_REQUEST;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponsePayload {
    pub approval_id: ApprovalId,
    pub approved: bool,
    /// Action name, used to correlate a response that carries no run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl EventPayload for ApprovalResponsePayload {
    const TYPE: &'static str = types::APPROVAL_RESPONSE;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResultPayload {
    pub action: String,
    #[serde(default)]
    pub output: Value,
}

impl EventPayload for ActionResultPayload {
    const TYPE: &'static str = types::ACTION_RESULT;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_wire_field_names() {
        let event = Event::text_delta("Hel")
            .with_role("assistant")
            .with_run_id("r1")
            .with_surface("chat");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "text-delta",
                "data": { "delta": "Hel" },
                "meta": { "role": "assistant", "runId": "r1", "surface": "chat" },
            })
        );
    }

    #[test]
    fn meta_extension_fields_survive_roundtrip() {
        let json = r#"{"type":"search","data":{"q":"rust"},"meta":{"runId":"r9","traceId":"t-1"}}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.run_id().map(RunId::as_str), Some("r9"));
        let meta = event.meta.as_ref().unwrap();
        assert_eq!(meta.extra["traceId"], "t-1");
        assert!(!meta.extra.contains_key("runId"));

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["meta"]["traceId"], "t-1");
    }

    #[test]
    fn missing_data_defaults_to_empty_object() {
        let event: Event = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(event.data.is_empty());
        assert!(event.meta.is_none());
    }

    #[test]
    fn payload_refuses_other_event_types() {
        let event = Event::text("hello");
        let err = event.payload::<TextDeltaPayload>().unwrap_err();
        assert!(matches!(err, MelonyError::PayloadMismatch { .. }));

        let text: TextPayload = event.payload().unwrap();
        assert_eq!(text.content, "hello");
    }

    #[test]
    fn payload_reports_malformed_data() {
        let event = Event::new(types::TEXT_DELTA).with_data(json!({ "delta": 3 }));
        let err = event.payload::<TextDeltaPayload>().unwrap_err();
        assert!(err.to_string().contains("text-delta"));
    }

    #[test]
    fn wildcard_pattern_is_reserved() {
        assert!(EventPattern::from("*").is_wildcard());
        assert!(EventPattern::from("*").matches(&EventType::from("anything")));
        let exact = EventPattern::from("text");
        assert!(exact.matches(&EventType::from("text")));
        assert!(!exact.matches(&EventType::from("text-delta")));
    }

    #[test]
    fn non_object_data_is_wrapped() {
        let event = Event::new("counter").with_data(json!(7));
        assert_eq!(event.data["value"], 7);
        let cleared = event.with_data(Value::Null);
        assert!(cleared.data.is_empty());
    }

    #[test]
    fn error_payload_kind_defaults_to_other() {
        let event: Event =
            serde_json::from_str(r#"{"type":"error","data":{"message":"boom"}}"#).unwrap();
        let payload: ErrorPayload = event.payload().unwrap();
        assert_eq!(payload.kind, ErrorKind::Other);
        assert_eq!(payload.handler, None);
    }

    #[test]
    fn approval_response_uses_camel_case() {
        let event = Event::from_payload(&ApprovalResponsePayload {
            approval_id: ApprovalId::from_string("a1"),
            approved: true,
            action: Some("send_email".into()),
            actor: None,
        });
        assert_eq!(event.event_type, types::APPROVAL_RESPONSE);
        assert_eq!(event.data["approvalId"], "a1");
        assert_eq!(event.data_str("action"), Some("send_email"));
    }
}
