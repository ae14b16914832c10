//! Handler contract and the per-invocation context.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use melony_protocol::{Event, RunId, Suspension};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Lazily produced reaction to one event. `Err` items are handler faults.
pub type HandlerStream = BoxStream<'static, Result<Event>>;

/// A reaction to an event: zero or more follow-up events.
///
/// Any `Fn(Event, HandlerContext) -> impl Stream<Item = Result<Event>>`
/// closure is a handler.
pub trait Handler: Send + Sync {
    fn handle(&self, event: Event, ctx: HandlerContext) -> HandlerStream;
}

impl<F, S> Handler for F
where
    F: Fn(Event, HandlerContext) -> S + Send + Sync,
    S: Stream<Item = Result<Event>> + Send + 'static,
{
    fn handle(&self, event: Event, ctx: HandlerContext) -> HandlerStream {
        self(event, ctx).boxed()
    }
}

/// A stream yielding exactly `event`.
pub fn once(event: Event) -> HandlerStream {
    stream::once(async move { Ok(event) }).boxed()
}

/// A stream yielding nothing.
pub fn empty() -> HandlerStream {
    stream::empty().boxed()
}

/// Mutable JSON state shared by every handler of a run.
///
/// Cloning yields another handle onto the same map.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    /// Typed read. A missing key is `Ok(None)`; a value of the wrong shape
    /// is an error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_value(key)
            .map(|value| {
                serde_json::from_value(value)
                    .with_context(|| format!("run state key `{key}` has an unexpected shape"))
            })
            .transpose()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("failed serializing run state key `{key}`"))?;
        self.inner.lock().insert(key.to_owned(), value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Run `f` with exclusive access to the map.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.lock().clone()
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchControl {
    pub(crate) suspension: Option<Suspension>,
    pub(crate) emitted: VecDeque<Event>,
}

pub(crate) type SharedControl = Arc<Mutex<DispatchControl>>;

/// What a handler sees of the run it is reacting within.
#[derive(Clone)]
pub struct HandlerContext {
    run_id: RunId,
    handler: Arc<str>,
    state: RunState,
    control: SharedControl,
}

impl HandlerContext {
    pub(crate) fn new(
        run_id: RunId,
        handler: Arc<str>,
        state: RunState,
        control: SharedControl,
    ) -> Self {
        Self {
            run_id,
            handler,
            state,
            control,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Identity of the running handler, `<plugin>/<pattern>#<index>` unless
    /// registered with an explicit name.
    pub fn handler_name(&self) -> &str {
        &self.handler
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Park the run. Events yielded in the same step are still delivered but
    /// no longer dispatched; every in-flight handler is dropped afterwards.
    pub fn suspend(&self, suspension: Suspension) {
        self.control.lock().suspension = Some(suspension);
    }

    pub fn is_suspended(&self) -> bool {
        self.control.lock().suspension.is_some()
    }

    /// Deliver `event` to the consumer without dispatching it to handlers.
    pub fn emit(&self, event: Event) {
        self.control.lock().emitted.push_back(event);
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("run_id", &self.run_id)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}
