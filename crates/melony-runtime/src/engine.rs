//! The dispatch engine.
//!
//! A dispatch is a pull-driven state machine: every event is journaled before
//! it is handed to the consumer, and nothing further is produced until the
//! consumer asks for the next one. Chaining is depth-first over an explicit
//! stack of frames, one per event still being reacted to.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::Result;
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use melony_events::{EventJournal, JournaledEvent};
use melony_protocol::{
    ErrorKind, ErrorPayload, Event, KeyValuePort, RunCheckpoint, RunId, RunStatus, Suspension,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::builder::{HandlerTable, Registration, RuntimeBuilder};
use crate::config::RuntimeConfig;
use crate::handler::{HandlerContext, HandlerStream, RunState, SharedControl};

#[derive(Debug)]
struct RunRecord {
    status: RunStatus,
    state: RunState,
    suspension: Option<Suspension>,
}

impl RunRecord {
    fn fresh() -> Self {
        Self {
            status: RunStatus::Idle,
            state: RunState::new(),
            suspension: None,
        }
    }

    fn from_checkpoint(checkpoint: RunCheckpoint) -> Self {
        // A checkpoint taken mid-dispatch belongs to a process that is gone.
        let status = match checkpoint.status {
            RunStatus::Dispatching => RunStatus::Idle,
            other => other,
        };
        Self {
            status,
            state: RunState::from_map(checkpoint.state),
            suspension: checkpoint.suspension,
        }
    }
}

enum Admission {
    Start(RunState),
    Resume(RunState),
    Reject(Event, RunStatus),
}

struct RuntimeInner {
    table: HandlerTable,
    config: RuntimeConfig,
    journal: EventJournal,
    checkpoints: Arc<dyn KeyValuePort>,
    runs: Mutex<HashMap<RunId, RunRecord>>,
    run_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
    /// Runs that went back to rest, oldest first. Eviction candidates.
    retired: Mutex<VecDeque<RunId>>,
}

impl RuntimeInner {
    fn lock_for(&self, run_id: &RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.run_locks.lock();
        guard
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Called once the run lock guard is gone. Drops the lock entry when no
    /// other dispatch holds or awaits it, and evicts the oldest resting runs
    /// beyond the retention bound.
    fn release(&self, run_id: &RunId) {
        {
            let mut locks = self.run_locks.lock();
            if locks.get(run_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(run_id);
            }
        }

        let mut runs = self.runs.lock();
        if !runs.get(run_id).is_some_and(|record| record.status.is_resting()) {
            return;
        }
        let mut retired = self.retired.lock();
        retired.retain(|retired_id| retired_id != run_id);
        retired.push_back(run_id.clone());
        while retired.len() > self.config.max_retained_runs {
            let Some(oldest) = retired.pop_front() else {
                break;
            };
            if runs.get(&oldest).is_some_and(|record| record.status.is_resting()) {
                runs.remove(&oldest);
                debug!(run_id = %oldest, "run evicted from memory");
            }
        }
    }

    async fn admit(&self, run_id: &RunId, trigger: &Event) -> Admission {
        if !self.runs.lock().contains_key(run_id) {
            let restored = self.load_checkpoint(run_id).await;
            self.runs
                .lock()
                .entry(run_id.clone())
                .or_insert_with(|| restored.unwrap_or_else(RunRecord::fresh));
        }

        let mut runs = self.runs.lock();
        let record = runs.entry(run_id.clone()).or_insert_with(RunRecord::fresh);
        match record.status {
            RunStatus::Errored => Admission::Reject(
                Event::error(
                    ErrorKind::RunTerminated,
                    format!("run {run_id} ended in error and accepts no further events"),
                ),
                RunStatus::Errored,
            ),
            RunStatus::Suspended => {
                let accepted = record
                    .suspension
                    .as_ref()
                    .is_none_or(|suspension| suspension.accepts(trigger));
                if accepted {
                    record.status = RunStatus::Dispatching;
                    record.suspension = None;
                    Admission::Resume(record.state.clone())
                } else {
                    let reason = record
                        .suspension
                        .as_ref()
                        .map(|suspension| suspension.reason.as_str())
                        .unwrap_or("suspended");
                    Admission::Reject(
                        Event::error(
                            ErrorKind::Suspended,
                            format!(
                                "run {run_id} is suspended ({reason}); `{}` does not resume it",
                                trigger.event_type
                            ),
                        ),
                        RunStatus::Suspended,
                    )
                }
            }
            RunStatus::Idle | RunStatus::Dispatching | RunStatus::Completed => {
                record.status = RunStatus::Dispatching;
                Admission::Start(record.state.clone())
            }
        }
    }

    fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        suspension: Option<Suspension>,
    ) -> RunCheckpoint {
        let mut runs = self.runs.lock();
        let record = runs.entry(run_id.clone()).or_insert_with(RunRecord::fresh);
        record.status = status;
        record.suspension = suspension;
        RunCheckpoint {
            run_id: run_id.clone(),
            status,
            state: record.state.snapshot(),
            suspension: record.suspension.clone(),
            updated_at: Utc::now(),
        }
    }

    fn abandon(&self, run_id: &RunId) {
        if let Some(record) = self.runs.lock().get_mut(run_id)
            && record.status == RunStatus::Dispatching
        {
            record.status = RunStatus::Idle;
            info!(run_id = %run_id, "dispatch abandoned by consumer");
        }
    }

    async fn load_checkpoint(&self, run_id: &RunId) -> Option<RunRecord> {
        let key = RunCheckpoint::storage_key(run_id);
        let value = match tokio::time::timeout(
            self.config.persist_timeout(),
            self.checkpoints.get(&key),
        )
        .await
        {
            Ok(Ok(value)) => value?,
            Ok(Err(error)) => {
                warn!(run_id = %run_id, %error, "checkpoint load failed; starting fresh");
                return None;
            }
            Err(_) => {
                warn!(run_id = %run_id, "checkpoint load timed out; starting fresh");
                return None;
            }
        };

        match serde_json::from_value::<RunCheckpoint>(value) {
            Ok(checkpoint) => {
                info!(run_id = %run_id, status = ?checkpoint.status, "run restored from checkpoint");
                Some(RunRecord::from_checkpoint(checkpoint))
            }
            Err(error) => {
                warn!(run_id = %run_id, %error, "checkpoint unreadable; starting fresh");
                None
            }
        }
    }

    async fn save_checkpoint(&self, checkpoint: RunCheckpoint) {
        let key = RunCheckpoint::storage_key(&checkpoint.run_id);
        let value = match serde_json::to_value(&checkpoint) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "failed serializing checkpoint");
                return;
            }
        };
        match tokio::time::timeout(self.config.persist_timeout(), self.checkpoints.set(&key, value))
            .await
        {
            Ok(Ok(())) => debug!(%key, "checkpoint written"),
            Ok(Err(error)) => warn!(%key, %error, "checkpoint write failed; continuing"),
            Err(_) => warn!(%key, "checkpoint write timed out; continuing"),
        }
    }
}

/// Shared handle onto a frozen handler table and the runs it drives.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub(crate) fn new(
        table: HandlerTable,
        config: RuntimeConfig,
        journal: EventJournal,
        checkpoints: Arc<dyn KeyValuePort>,
    ) -> Self {
        info!(
            handlers = table.len(),
            max_chain_depth = config.max_chain_depth,
            max_events_per_dispatch = config.max_events_per_dispatch,
            "runtime built"
        );
        Self {
            inner: Arc::new(RuntimeInner {
                table,
                config,
                journal,
                checkpoints,
                runs: Mutex::new(HashMap::new()),
                run_locks: Mutex::new(HashMap::new()),
                retired: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn journal(&self) -> &EventJournal {
        &self.inner.journal
    }

    pub fn handler_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Start reacting to `event`. Nothing happens until the returned stream
    /// is polled; dropping it cancels the dispatch.
    ///
    /// Events without a run id are routed to the oldest suspended run whose
    /// correlation key equals their `data.action`, or get a fresh run id.
    /// Routing happens here, before the run lock is taken, so two uncorrelated
    /// events dispatched back to back can both be routed to the same
    /// suspended run. The one admitted second is judged against whatever the
    /// first left behind: a run that completed takes it as a new trigger, and
    /// a run suspended again rejects it with `suspended` unless it matches
    /// the new suspension.
    pub fn dispatch(&self, mut event: Event) -> DispatchStream {
        let run_id = match event.run_id() {
            Some(run_id) => run_id.clone(),
            None => self.route_uncorrelated(&event).unwrap_or_default(),
        };
        event.meta_mut().run_id = Some(run_id.clone());

        let span = info_span!("run.dispatch", run_id = %run_id, trigger = %event.event_type);
        let settled = Arc::new(Mutex::new(None));
        let dispatch = Dispatch::new(self.inner.clone(), run_id.clone(), event, settled.clone());
        let events = stream::unfold(dispatch, move |mut dispatch| {
            async move {
                let event = dispatch.next_event().await?;
                Some((event, dispatch))
            }
            .instrument(span.clone())
        });

        DispatchStream {
            run_id,
            settled,
            events: events.boxed(),
        }
    }

    /// Drive a dispatch to its end and report where the run landed.
    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn run(&self, event: Event) -> RunOutcome {
        let dispatch = self.dispatch(event);
        let run_id = dispatch.run_id().clone();
        let settled = dispatch.settled.clone();
        let events: Vec<Event> = dispatch.collect().await;
        let settled = *settled.lock();
        let status = settled.or_else(|| self.status(&run_id)).unwrap_or_default();
        RunOutcome {
            run_id,
            status,
            events,
        }
    }

    /// Status of a run held in memory. Finished runs past the retention
    /// bound are only reachable through [`Runtime::restore`].
    pub fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.inner.runs.lock().get(run_id).map(|record| record.status)
    }

    pub fn suspension(&self, run_id: &RunId) -> Option<Suspension> {
        self.inner
            .runs
            .lock()
            .get(run_id)
            .and_then(|record| record.suspension.clone())
    }

    pub fn state(&self, run_id: &RunId) -> Option<RunState> {
        self.inner
            .runs
            .lock()
            .get(run_id)
            .map(|record| record.state.clone())
    }

    /// Suspended runs, oldest suspension first.
    pub fn suspended_runs(&self) -> Vec<(RunId, Suspension)> {
        let mut suspended: Vec<(RunId, Suspension)> = self
            .inner
            .runs
            .lock()
            .iter()
            .filter(|(_, record)| record.status == RunStatus::Suspended)
            .filter_map(|(run_id, record)| {
                record
                    .suspension
                    .clone()
                    .map(|suspension| (run_id.clone(), suspension))
            })
            .collect();
        suspended.sort_by_key(|(_, suspension)| suspension.suspended_at);
        suspended
    }

    /// Bring a checkpointed run into memory. Returns its status, or `None`
    /// when the run is unknown here and has no checkpoint.
    pub async fn restore(&self, run_id: &RunId) -> Option<RunStatus> {
        if let Some(status) = self.status(run_id) {
            return Some(status);
        }
        let record = self.inner.load_checkpoint(run_id).await?;
        let mut runs = self.inner.runs.lock();
        Some(runs.entry(run_id.clone()).or_insert(record).status)
    }

    pub async fn history(&self, run_id: &RunId) -> Result<Vec<Event>> {
        self.inner.journal.history(run_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JournaledEvent> {
        self.inner.journal.subscribe()
    }

    #[cfg(test)]
    fn tracked(&self) -> (usize, usize) {
        (self.inner.runs.lock().len(), self.inner.run_locks.lock().len())
    }

    fn route_uncorrelated(&self, event: &Event) -> Option<RunId> {
        let routed = self
            .suspended_runs()
            .into_iter()
            .find(|(_, suspension)| suspension.correlates(event))
            .map(|(run_id, _)| run_id);
        if let Some(run_id) = &routed {
            debug!(run_id = %run_id, event_type = %event.event_type, "event routed by action correlation");
        }
        routed
    }
}

/// The lazily produced events of one dispatch.
pub struct DispatchStream {
    run_id: RunId,
    settled: Arc<Mutex<Option<RunStatus>>>,
    events: BoxStream<'static, Event>,
}

impl DispatchStream {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Where the run landed, once the dispatch has ended.
    pub fn status(&self) -> Option<RunStatus> {
        *self.settled.lock()
    }
}

impl Stream for DispatchStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Event>> {
        self.events.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for DispatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchStream")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub events: Vec<Event>,
}

impl RunOutcome {
    pub fn errors(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|event| event.is_error())
    }

    pub fn of_type<'a>(&'a self, event_type: &'a str) -> impl Iterator<Item = &'a Event> {
        self.events
            .iter()
            .filter(move |event| event.event_type == event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Admit,
    Drive,
    Settle,
    Done,
}

struct Frame {
    event: Event,
    depth: usize,
    pending: VecDeque<Arc<Registration>>,
    current: Option<(Arc<Registration>, HandlerStream)>,
    /// The event is a synthesized handler-fault report.
    fault_report: bool,
    /// An exact handler saw the fault report through to the end.
    recovered: bool,
}

struct Dispatch {
    inner: Arc<RuntimeInner>,
    run_id: RunId,
    trigger: Option<Event>,
    phase: Phase,
    guard: Option<OwnedMutexGuard<()>>,
    state: RunState,
    control: SharedControl,
    stack: Vec<Frame>,
    outbox: VecDeque<Event>,
    flowed: usize,
    unrecovered: usize,
    overflowed: bool,
    settled: Arc<Mutex<Option<RunStatus>>>,
}

impl Dispatch {
    fn new(
        inner: Arc<RuntimeInner>,
        run_id: RunId,
        trigger: Event,
        settled: Arc<Mutex<Option<RunStatus>>>,
    ) -> Self {
        Self {
            inner,
            run_id,
            trigger: Some(trigger),
            phase: Phase::Admit,
            guard: None,
            state: RunState::new(),
            control: SharedControl::default(),
            stack: Vec::new(),
            outbox: VecDeque::new(),
            flowed: 0,
            unrecovered: 0,
            overflowed: false,
            settled,
        }
    }

    async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            match self.phase {
                Phase::Admit => self.admit().await,
                Phase::Drive => self.drive().await,
                Phase::Settle => self.settle().await,
                Phase::Done => return None,
            }
        }
    }

    async fn admit(&mut self) {
        let Some(trigger) = self.trigger.take() else {
            self.phase = Phase::Done;
            return;
        };

        let lock = self.inner.lock_for(&self.run_id);
        self.guard = Some(lock.lock_owned().await);

        let state = match self.inner.admit(&self.run_id, &trigger).await {
            Admission::Start(state) => {
                info!(event_type = %trigger.event_type, "dispatch started");
                state
            }
            Admission::Resume(state) => {
                info!(event_type = %trigger.event_type, "suspended run resumed");
                state
            }
            Admission::Reject(error, status) => {
                warn!(event_type = %trigger.event_type, "trigger rejected");
                let error = self.stamp(error);
                self.publish(error).await;
                *self.settled.lock() = Some(status);
                self.release();
                self.phase = Phase::Done;
                return;
            }
        };

        self.state = state;
        self.flowed = 1;
        self.publish(trigger.clone()).await;
        self.push_frame(trigger, 0, false);
        self.phase = Phase::Drive;
    }

    /// Advance the top frame by one handler step.
    async fn drive(&mut self) {
        if self.is_suspended() {
            debug!(frames = self.stack.len(), "suspension requested; dropping in-flight handlers");
            self.stack.clear();
            self.phase = Phase::Settle;
            return;
        }

        let Some(frame) = self.stack.last_mut() else {
            self.phase = Phase::Settle;
            return;
        };

        let (registration, mut handler_stream) = match frame.current.take() {
            Some(current) => current,
            None => {
                let Some(registration) = frame.pending.pop_front() else {
                    if let Some(done) = self.stack.pop() {
                        self.close_frame(done);
                    }
                    return;
                };
                let event = frame.event.clone();
                let ctx = HandlerContext::new(
                    self.run_id.clone(),
                    registration.name.clone(),
                    self.state.clone(),
                    self.control.clone(),
                );
                debug!(handler = %registration.name, event_type = %event.event_type, "handler invoked");
                let handler = registration.handler.clone();
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event, ctx))) {
                    Ok(handler_stream) => (registration, handler_stream),
                    Err(panic) => {
                        self.fault(&registration, panic_message(panic)).await;
                        return;
                    }
                }
            }
        };

        let polled = AssertUnwindSafe(handler_stream.next()).catch_unwind().await;
        self.drain_emitted().await;

        match polled {
            Ok(Some(Ok(event))) => {
                if let Some(frame) = self.stack.last_mut() {
                    frame.current = Some((registration, handler_stream));
                }
                self.on_yield(event).await;
            }
            Ok(Some(Err(error))) => {
                drop(handler_stream);
                self.fault(&registration, format!("{error:#}")).await;
            }
            Ok(None) => {
                debug!(handler = %registration.name, "handler finished");
                if !registration.pattern.is_wildcard()
                    && let Some(frame) = self.stack.last_mut()
                    && frame.fault_report
                {
                    frame.recovered = true;
                }
            }
            Err(panic) => {
                drop(handler_stream);
                self.fault(&registration, panic_message(panic)).await;
            }
        }
    }

    async fn on_yield(&mut self, event: Event) {
        if self.overflowed {
            return;
        }
        let event = self.stamp(event);

        if self.is_suspended() {
            // The suspending step's own output is delivered but not reacted to.
            if self.reserve().await {
                self.publish(event).await;
            }
            return;
        }

        let depth = self.stack.last().map_or(0, |frame| frame.depth) + 1;
        if depth > self.inner.config.max_chain_depth {
            let detail = format!("chain depth exceeded {}", self.inner.config.max_chain_depth);
            self.overflow(detail).await;
            return;
        }
        if !self.reserve().await {
            return;
        }
        self.publish(event.clone()).await;
        self.push_frame(event, depth, false);
    }

    async fn fault(&mut self, registration: &Registration, message: String) {
        if self.overflowed {
            return;
        }
        warn!(handler = %registration.name, %message, "handler fault");

        let (depth, reporting) = self
            .stack
            .last()
            .map_or((0, false), |frame| (frame.depth, frame.fault_report));
        self.unrecovered += 1;

        let error = self.stamp(Event::from_payload(&ErrorPayload {
            message,
            kind: ErrorKind::HandlerFault,
            handler: Some(registration.name.to_string()),
        }));
        if reporting || self.is_suspended() {
            if self.reserve().await {
                self.publish(error).await;
            }
            return;
        }

        if depth + 1 > self.inner.config.max_chain_depth {
            let detail = format!("chain depth exceeded {}", self.inner.config.max_chain_depth);
            self.overflow(detail).await;
            return;
        }
        if !self.reserve().await {
            return;
        }
        self.publish(error.clone()).await;
        self.push_frame(error, depth + 1, true);
    }

    async fn drain_emitted(&mut self) {
        loop {
            let next = self.control.lock().emitted.pop_front();
            let Some(event) = next else {
                break;
            };
            if self.overflowed || !self.reserve().await {
                continue;
            }
            let event = self.stamp(event);
            self.publish(event).await;
        }
    }

    /// Count one more event against the per-dispatch budget.
    async fn reserve(&mut self) -> bool {
        if self.overflowed {
            return false;
        }
        if self.flowed >= self.inner.config.max_events_per_dispatch {
            let detail = format!(
                "more than {} events in one dispatch",
                self.inner.config.max_events_per_dispatch
            );
            self.overflow(detail).await;
            return false;
        }
        self.flowed += 1;
        true
    }

    async fn overflow(&mut self, detail: String) {
        if self.overflowed {
            return;
        }
        self.overflowed = true;
        warn!(%detail, frames = self.stack.len(), "dispatch overflow; dropping in-flight handlers");
        self.stack.clear();
        let error = self.stamp(Event::error(
            ErrorKind::RuntimeOverflow,
            format!("runtime overflow: {detail}"),
        ));
        self.publish(error).await;
        self.phase = Phase::Settle;
    }

    async fn settle(&mut self) {
        self.drain_emitted().await;
        self.stack.clear();

        let suspension = self.control.lock().suspension.take();
        let status = match self.landing(suspension.is_some()) {
            Some(status) => status,
            None if self.unrecovered > 0 => RunStatus::Errored,
            None => RunStatus::Completed,
        };

        let checkpoint = self.inner.finish(&self.run_id, status, suspension);
        info!(
            ?status,
            events = self.flowed,
            unrecovered_faults = self.unrecovered,
            "dispatch settled"
        );
        self.inner.save_checkpoint(checkpoint).await;
        *self.settled.lock() = Some(status);
        self.release();
        self.phase = Phase::Done;
    }

    /// The status a dispatch lands in regardless of how far it got: overflow
    /// errors the run, a requested suspension parks it.
    fn landing(&self, suspended: bool) -> Option<RunStatus> {
        if self.overflowed {
            Some(RunStatus::Errored)
        } else if suspended {
            Some(RunStatus::Suspended)
        } else {
            None
        }
    }

    fn release(&mut self) {
        if self.guard.take().is_some() {
            self.inner.release(&self.run_id);
        }
    }

    fn push_frame(&mut self, event: Event, depth: usize, fault_report: bool) {
        let pending: VecDeque<Arc<Registration>> =
            self.inner.table.matching(&event.event_type).into();
        debug!(event_type = %event.event_type, depth, handlers = pending.len(), "event dispatched");
        self.stack.push(Frame {
            event,
            depth,
            pending,
            current: None,
            fault_report,
            recovered: false,
        });
    }

    fn close_frame(&mut self, frame: Frame) {
        if frame.fault_report && frame.recovered {
            self.unrecovered = self.unrecovered.saturating_sub(1);
            debug!("handler fault recovered by error handler");
        }
    }

    fn is_suspended(&self) -> bool {
        self.control.lock().suspension.is_some()
    }

    fn stamp(&self, mut event: Event) -> Event {
        event.meta_mut().run_id = Some(self.run_id.clone());
        event
    }

    async fn publish(&mut self, event: Event) {
        self.inner.journal.record(&self.run_id, &event).await;
        self.outbox.push_back(event);
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        if self.guard.is_none() {
            return;
        }

        let suspension = self.control.lock().suspension.take();
        match self.landing(suspension.is_some()) {
            Some(status) => {
                let checkpoint = self.inner.finish(&self.run_id, status, suspension);
                info!(run_id = %self.run_id, ?status, "dispatch dropped after it had landed");
                *self.settled.lock() = Some(status);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let inner = self.inner.clone();
                        handle.spawn(async move { inner.save_checkpoint(checkpoint).await });
                    }
                    Err(_) => {
                        warn!(run_id = %self.run_id, "no async runtime; checkpoint not written")
                    }
                }
            }
            None => self.inner.abandon(&self.run_id),
        }
        self.release();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    format!("handler panicked: {detail}")
}
