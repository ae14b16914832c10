//! # melony-protocol: Melony event protocol
//!
//! Shared types and trait interfaces for the Melony event runtime. This crate
//! carries no async runtime.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (RunId, ApprovalId)
//! - [`event`]: Event envelope, EventType/EventPattern, typed payloads
//! - [`ui`]: Opaque serializable UI tree carried by events
//! - [`message`]: Aggregated chat message projection
//! - [`state`]: Run status, suspension and checkpoint records
//! - [`ports`]: Storage and auth boundary ports
//! - [`error`]: MelonyError, MelonyResult

pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod ports;
pub mod state;
pub mod ui;

pub use error::{MelonyError, MelonyResult};
pub use event::{
    ActionResultPayload, ApprovalRequestPayload, ApprovalResponsePayload, ErrorKind, ErrorPayload,
    Event, EventMeta, EventPattern, EventPayload, EventType, Role, TextDeltaPayload, TextPayload,
    types,
};
pub use ids::{ApprovalId, RunId};
pub use message::Message;
pub use ports::{AuthPort, EventStorePort, KeyValuePort, Principal};
pub use state::{RunCheckpoint, RunStatus, Suspension};
pub use ui::UiNode;
