//! Melony runtime: plugin registration and event dispatch.
//!
//! Handlers are registered through [`RuntimeBuilder`] and frozen into an
//! immutable table. [`Runtime::dispatch`] reacts to one triggering event and
//! yields every event the run produces, depth first, as a lazy stream.

mod builder;
mod config;
mod engine;
mod handler;

pub use builder::{HandlerTable, Plugin, PluginBuilder, Registration, RuntimeBuilder};
pub use config::RuntimeConfig;
pub use engine::{DispatchStream, RunOutcome, Runtime};
pub use handler::{Handler, HandlerContext, HandlerStream, RunState, empty, once};
