use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use futures_util::stream;
use melony_protocol::{
    ApprovalId, ApprovalRequestPayload, ApprovalResponsePayload, Event, Role, RunId, Suspension,
    UiNode, types,
};
use melony_runtime::{HandlerContext, Plugin, PluginBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Action-name patterns that need a human decision before running. A trailing
/// `*` matches any suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    #[serde(default)]
    pub gate: Vec<String>,
}

impl ApprovalPolicy {
    pub fn new(gate: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            gate: gate.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(pattern: &str, actual: &str) -> bool {
        if pattern.ends_with('*') {
            let prefix = pattern.trim_end_matches('*');
            prefix.is_empty() || actual.starts_with(prefix)
        } else {
            pattern == actual
        }
    }

    pub fn requires_approval(&self, action: &str) -> bool {
        self.gate
            .iter()
            .any(|pattern| Self::matches(pattern, action))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalTicket {
    pub approval_id: ApprovalId,
    pub run_id: RunId,
    pub action: String,
    pub input: Value,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResolution {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// Resolutions kept for lookup once their ticket is closed.
pub const DEFAULT_RESOLVED_LIMIT: usize = 1024;

#[derive(Debug, Default)]
struct ResolvedLog {
    entries: HashMap<ApprovalId, ApprovalResolution>,
    order: VecDeque<ApprovalId>,
}

/// Open approval tickets plus a bounded record of recent resolutions.
#[derive(Debug, Clone)]
pub struct ApprovalQueue {
    pending: Arc<RwLock<HashMap<ApprovalId, ApprovalTicket>>>,
    resolved: Arc<RwLock<ResolvedLog>>,
    resolved_limit: usize,
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::with_resolved_limit(DEFAULT_RESOLVED_LIMIT)
    }
}

impl ApprovalQueue {
    pub fn with_resolved_limit(resolved_limit: usize) -> Self {
        Self {
            pending: Arc::default(),
            resolved: Arc::default(),
            resolved_limit,
        }
    }

    pub async fn enqueue(
        &self,
        run_id: RunId,
        action: impl Into<String>,
        input: Value,
        reason: impl Into<String>,
    ) -> ApprovalTicket {
        let ticket = ApprovalTicket {
            approval_id: ApprovalId::new_uuid(),
            run_id,
            action: action.into(),
            input,
            reason: reason.into(),
            created_at: Utc::now(),
        };
        self.pending
            .write()
            .await
            .insert(ticket.approval_id.clone(), ticket.clone());
        ticket
    }

    pub async fn get(&self, approval_id: &ApprovalId) -> Option<ApprovalTicket> {
        self.pending.read().await.get(approval_id).cloned()
    }

    /// Close a pending ticket. `None` when it is unknown or already resolved.
    pub async fn resolve(
        &self,
        approval_id: &ApprovalId,
        approved: bool,
        actor: Option<String>,
    ) -> Option<(ApprovalTicket, ApprovalResolution)> {
        let ticket = self.pending.write().await.remove(approval_id)?;
        let resolution = ApprovalResolution {
            approved,
            actor,
            resolved_at: Utc::now(),
        };
        let mut resolved = self.resolved.write().await;
        resolved.entries.insert(approval_id.clone(), resolution.clone());
        resolved.order.push_back(approval_id.clone());
        while resolved.order.len() > self.resolved_limit {
            if let Some(oldest) = resolved.order.pop_front() {
                resolved.entries.remove(&oldest);
            }
        }
        Some((ticket, resolution))
    }

    pub async fn pending_for_run(&self, run_id: &RunId) -> Vec<ApprovalTicket> {
        let mut tickets: Vec<ApprovalTicket> = self
            .pending
            .read()
            .await
            .values()
            .filter(|ticket| ticket.run_id == *run_id)
            .cloned()
            .collect();
        tickets.sort_by_key(|ticket| ticket.created_at);
        tickets
    }

    /// Every open ticket, oldest first.
    pub async fn list_pending(&self) -> Vec<ApprovalTicket> {
        let mut tickets: Vec<ApprovalTicket> =
            self.pending.read().await.values().cloned().collect();
        tickets.sort_by_key(|ticket| ticket.created_at);
        tickets
    }

    pub async fn resolution(&self, approval_id: &ApprovalId) -> Option<ApprovalResolution> {
        self.resolved.read().await.entries.get(approval_id).cloned()
    }
}

#[derive(Debug)]
pub enum GateDecision {
    /// Run the action now.
    Proceed,
    /// The run was suspended; deliver this `approval:request` event.
    Suspended(Event),
}

/// Policy plus queue, consulted by action handlers before they run.
#[derive(Debug, Clone, Default)]
pub struct ApprovalGate {
    policy: ApprovalPolicy,
    queue: ApprovalQueue,
}

fn grant_key(action: &str) -> String {
    format!("approval.grant.{action}")
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy, queue: ApprovalQueue) -> Self {
        Self { policy, queue }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn queue(&self) -> &ApprovalQueue {
        &self.queue
    }

    /// Decide whether `action` may run within the current handler's run.
    ///
    /// A grant left by an approved response is consumed here, so each
    /// approval lets the action through exactly once.
    #[instrument(skip(self, ctx, input), fields(run_id = %ctx.run_id()))]
    pub async fn check(
        &self,
        ctx: &HandlerContext,
        action: &str,
        input: &Value,
    ) -> Result<GateDecision> {
        if !self.policy.requires_approval(action) {
            return Ok(GateDecision::Proceed);
        }
        if ctx.state().remove(&grant_key(action)).is_some() {
            debug!("approval grant consumed");
            return Ok(GateDecision::Proceed);
        }

        let reason = format!("`{action}` requires approval");
        let ticket = self
            .queue
            .enqueue(ctx.run_id().clone(), action, input.clone(), reason.clone())
            .await;
        info!(approval_id = %ticket.approval_id, "approval requested; suspending run");

        ctx.suspend(
            Suspension::new(reason)
                .resume_on(types::APPROVAL_RESPONSE)
                .correlate(action),
        );
        Ok(GateDecision::Suspended(request_event(&ticket)))
    }

    /// Apply an `approval:response` event. An approval records a grant and
    /// re-issues the original action event; a denial reports it as text.
    #[instrument(skip(self, event, ctx), fields(run_id = %ctx.run_id()))]
    pub async fn respond(&self, event: &Event, ctx: &HandlerContext) -> Result<Event> {
        let response: ApprovalResponsePayload = event.payload()?;
        let ticket = self
            .queue
            .get(&response.approval_id)
            .await
            .with_context(|| format!("unknown approval {}", response.approval_id))?;
        if ticket.run_id != *ctx.run_id() {
            bail!(
                "approval {} belongs to run {}, not {}",
                ticket.approval_id,
                ticket.run_id,
                ctx.run_id()
            );
        }

        let (ticket, resolution) = self
            .queue
            .resolve(&response.approval_id, response.approved, response.actor)
            .await
            .with_context(|| format!("approval {} was already resolved", response.approval_id))?;
        info!(
            approval_id = %ticket.approval_id,
            approved = resolution.approved,
            actor = resolution.actor.as_deref().unwrap_or("unknown"),
            "approval resolved"
        );

        if resolution.approved {
            ctx.state()
                .set(&grant_key(&ticket.action), &ticket.approval_id)?;
            return Ok(Event::new(ticket.action.as_str()).with_data(ticket.input));
        }

        let by = resolution
            .actor
            .map(|actor| format!(" by {actor}"))
            .unwrap_or_default();
        Ok(Event::text(format!("`{}` was denied{by}.", ticket.action)).with_role(Role::system()))
    }
}

fn request_event(ticket: &ApprovalTicket) -> Event {
    let card = UiNode::new("approval-card")
        .prop("approvalId", ticket.approval_id.as_str())
        .prop("action", ticket.action.as_str())
        .prop("reason", ticket.reason.as_str())
        .prop("input", ticket.input.clone());
    Event::from_payload(&ApprovalRequestPayload {
        approval_id: ticket.approval_id.clone(),
        action: ticket.action.clone(),
        input: ticket.input.clone(),
        reason: ticket.reason.clone(),
    })
    .with_role(Role::assistant())
    .with_slot(format!("approval:{}", ticket.approval_id))
    .with_ui(card)
}

/// Handles `approval:response` events for a gate.
#[derive(Debug, Clone)]
pub struct ApprovalPlugin {
    gate: ApprovalGate,
}

pub fn approval_plugin(gate: ApprovalGate) -> ApprovalPlugin {
    ApprovalPlugin { gate }
}

impl Plugin for ApprovalPlugin {
    fn name(&self) -> &str {
        "approval"
    }

    fn register(&self, builder: &mut PluginBuilder) {
        let gate = self.gate.clone();
        builder.on_named(
            types::APPROVAL_RESPONSE,
            "approval/response",
            move |event: Event, ctx: HandlerContext| {
                let gate = gate.clone();
                stream::once(async move { gate.respond(&event, &ctx).await })
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use futures_util::stream;
    use melony_protocol::{ErrorKind, ErrorPayload, RunStatus};
    use melony_runtime::Runtime;
    use serde_json::json;

    use super::*;

    async fn gated_send(gate: ApprovalGate, event: Event, ctx: HandlerContext) -> Result<Event> {
        let input = Value::Object(event.data.clone());
        match gate.check(&ctx, "send_email", &input).await? {
            GateDecision::Proceed => Ok(Event::new("sent").with_data(input)),
            GateDecision::Suspended(request) => Ok(request),
        }
    }

    fn runtime_with(gate: &ApprovalGate) -> Runtime {
        let action_gate = gate.clone();
        Runtime::builder()
            .on("send_email", move |event: Event, ctx: HandlerContext| {
                stream::once(gated_send(action_gate.clone(), event, ctx))
            })
            .plugin(approval_plugin(gate.clone()))
            .build()
    }

    fn response(ticket: &ApprovalTicket, approved: bool) -> Event {
        Event::from_payload(&ApprovalResponsePayload {
            approval_id: ticket.approval_id.clone(),
            approved,
            action: Some(ticket.action.clone()),
            actor: Some("ops".into()),
        })
        .with_role(Role::user())
        .with_run_id(ticket.run_id.clone())
    }

    fn types_of(events: &[Event]) -> Vec<String> {
        events.iter().map(|event| event.event_type.to_string()).collect()
    }

    #[test]
    fn policy_matches_exact_and_prefix_patterns() {
        let policy = ApprovalPolicy::new(["deploy*", "send_email"]);
        assert!(policy.requires_approval("deploy"));
        assert!(policy.requires_approval("deploy_prod"));
        assert!(policy.requires_approval("send_email"));
        assert!(!policy.requires_approval("send_sms"));
        assert!(ApprovalPolicy::new(["*"]).requires_approval("anything"));
        assert!(!ApprovalPolicy::default().requires_approval("anything"));
    }

    #[tokio::test]
    async fn queue_resolves_each_ticket_once() {
        let queue = ApprovalQueue::default();
        let run_id = RunId::from_string("r1");
        let ticket = queue
            .enqueue(run_id.clone(), "deploy", json!({ "env": "prod" }), "risky")
            .await;
        queue
            .enqueue(RunId::from_string("r2"), "deploy", Value::Null, "risky")
            .await;

        assert_eq!(queue.pending_for_run(&run_id).await, vec![ticket.clone()]);
        assert_eq!(queue.list_pending().await.len(), 2);

        let resolved = queue
            .resolve(&ticket.approval_id, true, Some("alice".into()))
            .await;
        assert!(resolved.is_some_and(|(closed, resolution)| closed == ticket && resolution.approved));
        assert!(queue.resolve(&ticket.approval_id, false, None).await.is_none());
        assert!(queue.pending_for_run(&run_id).await.is_empty());
        let resolution = queue.resolution(&ticket.approval_id).await;
        assert_eq!(resolution.and_then(|r| r.actor), Some("alice".into()));
    }

    #[tokio::test]
    async fn only_recent_resolutions_are_kept() {
        let queue = ApprovalQueue::with_resolved_limit(3);
        let mut tickets = Vec::new();
        for n in 0..10 {
            let ticket = queue
                .enqueue(RunId::from_string(format!("r{n}")), "deploy", Value::Null, "risky")
                .await;
            queue.resolve(&ticket.approval_id, true, None).await;
            tickets.push(ticket);
        }

        assert!(queue.resolution(&tickets[0].approval_id).await.is_none());
        assert!(queue.resolution(&tickets[6].approval_id).await.is_none());
        for ticket in &tickets[7..] {
            assert!(queue.resolution(&ticket.approval_id).await.is_some());
        }
        assert_eq!(queue.resolved.read().await.entries.len(), 3);
        assert!(queue.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn approved_action_runs_once_after_resume() -> Result<()> {
        let gate = ApprovalGate::new(ApprovalPolicy::new(["send_*"]), ApprovalQueue::default());
        let runtime = runtime_with(&gate);

        let outcome = runtime
            .run(Event::new("send_email").with_data(json!({ "to": "a@example.com" })))
            .await;
        assert_eq!(types_of(&outcome.events), vec!["send_email", "approval:request"]);
        assert_eq!(outcome.status, RunStatus::Suspended);

        let request: ApprovalRequestPayload = outcome.events[1].payload()?;
        assert_eq!(request.input["to"], "a@example.com");
        assert!(outcome.events[1].ui.is_some());
        let pending = gate.queue().pending_for_run(&outcome.run_id).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].approval_id, request.approval_id);

        let resumed = runtime.run(response(&pending[0], true)).await;
        assert_eq!(
            types_of(&resumed.events),
            vec!["approval:response", "send_email", "sent"]
        );
        assert_eq!(resumed.events[2].data["to"], "a@example.com");
        assert_eq!(resumed.status, RunStatus::Completed);
        assert!(gate.queue().list_pending().await.is_empty());

        let again = runtime
            .run(Event::new("send_email").with_run_id(outcome.run_id.clone()))
            .await;
        assert_eq!(again.status, RunStatus::Suspended);
        Ok(())
    }

    #[tokio::test]
    async fn denied_action_reports_and_completes() -> Result<()> {
        let gate = ApprovalGate::new(ApprovalPolicy::new(["send_email"]), ApprovalQueue::default());
        let runtime = runtime_with(&gate);

        let outcome = runtime.run(Event::new("send_email")).await;
        let pending = gate.queue().pending_for_run(&outcome.run_id).await;
        let resumed = runtime.run(response(&pending[0], false)).await;

        assert_eq!(types_of(&resumed.events), vec!["approval:response", "text"]);
        assert_eq!(
            resumed.events[1].data_str("content"),
            Some("`send_email` was denied by ops.")
        );
        assert_eq!(resumed.status, RunStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn ungated_action_proceeds_immediately() -> Result<()> {
        let gate = ApprovalGate::new(ApprovalPolicy::new(["deploy*"]), ApprovalQueue::default());
        let runtime = runtime_with(&gate);

        let outcome = runtime.run(Event::new("send_email")).await;
        assert_eq!(types_of(&outcome.events), vec!["send_email", "sent"]);
        assert_eq!(outcome.status, RunStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_approval_is_a_handler_fault() -> Result<()> {
        let gate = ApprovalGate::default();
        let runtime = runtime_with(&gate);

        let outcome = runtime
            .run(Event::from_payload(&ApprovalResponsePayload {
                approval_id: ApprovalId::from_string("missing"),
                approved: true,
                action: None,
                actor: None,
            }))
            .await;
        let fault: ErrorPayload = outcome.events[1].payload()?;
        assert_eq!(fault.kind, ErrorKind::HandlerFault);
        assert_eq!(fault.handler.as_deref(), Some("approval/response"));
        assert!(fault.message.contains("unknown approval missing"));
        assert_eq!(outcome.status, RunStatus::Errored);
        Ok(())
    }
}
