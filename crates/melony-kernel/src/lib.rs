use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use melony_actions::{Action, ActionDefinition, ActionRegistry};
use melony_events::{
    EventJournal, EventStreamHub, FileEventStore, FileKeyValueStore, InMemoryEventStore,
    InMemoryKeyValueStore, JournaledEvent, PersistFilter, display_by_surface, group_into_messages,
};
use melony_policy::{ApprovalGate, ApprovalPolicy, ApprovalQueue, ApprovalTicket, approval_plugin};
use melony_protocol::{
    ApprovalId, ApprovalResponsePayload, Event, EventStorePort, KeyValuePort, Message, Role,
    RunId, RunStatus, Suspension,
};
use melony_runtime::{DispatchStream, Plugin, RunOutcome, Runtime, RuntimeBuilder, RuntimeConfig};
use tokio::sync::broadcast;
use tracing::{info, instrument};

pub struct KernelBuilder {
    root: Option<PathBuf>,
    config: RuntimeConfig,
    actions: ActionRegistry,
    approval_policy: ApprovalPolicy,
    plugins: Vec<Box<dyn Plugin>>,
    persist_filter: Option<PersistFilter>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            root: None,
            config: RuntimeConfig::default(),
            actions: ActionRegistry::new(),
            approval_policy: ApprovalPolicy::default(),
            plugins: Vec::new(),
            persist_filter: None,
        }
    }

    /// Persist events and run checkpoints under `root`. Without a root both
    /// live in memory.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn action<A: Action>(mut self, action: A) -> Self {
        self.actions.register(action);
        self
    }

    pub fn approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval_policy = policy;
        self
    }

    /// Applied after the built-in approval and action plugins, in call order.
    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn persist_filter(
        mut self,
        filter: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.persist_filter = Some(Arc::new(filter));
        self
    }

    pub fn build(self) -> MelonyKernel {
        let (store, checkpoints): (Arc<dyn EventStorePort>, Arc<dyn KeyValuePort>) =
            match &self.root {
                Some(root) => (
                    Arc::new(FileEventStore::new(root)),
                    Arc::new(FileKeyValueStore::new(root)),
                ),
                None => (
                    Arc::new(InMemoryEventStore::new()),
                    Arc::new(InMemoryKeyValueStore::new()),
                ),
            };

        let mut journal = EventJournal::new(store, EventStreamHub::new(self.config.stream_buffer))
            .with_persist_timeout(self.config.persist_timeout());
        if let Some(filter) = self.persist_filter {
            journal = journal.with_filter(filter);
        }

        let gate = ApprovalGate::new(self.approval_policy, ApprovalQueue::default());
        let mut builder = RuntimeBuilder::new()
            .config(self.config)
            .journal(journal)
            .checkpoints(checkpoints)
            .plugin(approval_plugin(gate.clone()))
            .plugin(self.actions.plugin(gate.clone()));
        for plugin in &self.plugins {
            builder = builder.plugin_dyn(plugin.as_ref());
        }
        let runtime = builder.build();

        info!(
            root = ?self.root,
            actions = self.actions.len(),
            plugins = self.plugins.len(),
            "kernel built"
        );
        MelonyKernel {
            runtime,
            gate,
            actions: self.actions,
        }
    }
}

#[derive(Clone)]
pub struct MelonyKernel {
    runtime: Runtime,
    gate: ApprovalGate,
    actions: ActionRegistry,
}

impl MelonyKernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn dispatch(&self, event: Event) -> DispatchStream {
        self.runtime.dispatch(event)
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn run(&self, event: Event) -> RunOutcome {
        self.runtime.run(event).await
    }

    /// Answer a pending approval by dispatching the matching
    /// `approval:response` into the ticket's run.
    #[instrument(skip(self, actor), fields(approval_id = %approval_id))]
    pub async fn resolve_approval(
        &self,
        approval_id: &ApprovalId,
        approved: bool,
        actor: Option<String>,
    ) -> Result<DispatchStream> {
        let ticket = self
            .gate
            .queue()
            .get(approval_id)
            .await
            .with_context(|| format!("no pending approval {approval_id}"))?;

        let response = Event::from_payload(&ApprovalResponsePayload {
            approval_id: approval_id.clone(),
            approved,
            action: Some(ticket.action.clone()),
            actor,
        })
        .with_role(Role::user())
        .with_run_id(ticket.run_id);
        Ok(self.runtime.dispatch(response))
    }

    pub async fn history(&self, run_id: &RunId) -> Result<Vec<Event>> {
        self.runtime.history(run_id).await
    }

    pub async fn messages(&self, run_id: &RunId) -> Result<Vec<Message>> {
        let history = self.history(run_id).await?;
        Ok(group_into_messages(&history))
    }

    pub async fn display(&self, run_id: &RunId) -> Result<IndexMap<String, Vec<Event>>> {
        let history = self.history(run_id).await?;
        Ok(display_by_surface(&history))
    }

    /// Status of a run, restoring it from its checkpoint when needed.
    pub async fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.runtime.restore(run_id).await
    }

    pub fn suspension(&self, run_id: &RunId) -> Option<Suspension> {
        self.runtime.suspension(run_id)
    }

    pub async fn pending_approvals(&self, run_id: Option<&RunId>) -> Vec<ApprovalTicket> {
        match run_id {
            Some(run_id) => self.gate.queue().pending_for_run(run_id).await,
            None => self.gate.queue().list_pending().await,
        }
    }

    pub fn action_definitions(&self) -> Vec<ActionDefinition> {
        self.actions.definitions()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JournaledEvent> {
        self.runtime.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use async_trait::async_trait;
    use futures_util::{StreamExt, stream};
    use melony_protocol::{ActionResultPayload, UiNode, types};
    use melony_runtime::{HandlerContext, PluginBuilder};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::{Value, json};
    use tokio::fs;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct DeployInput {
        env: String,
    }

    struct Deploy;

    #[async_trait]
    impl Action for Deploy {
        type Input = DeployInput;

        fn name(&self) -> &str {
            "deploy"
        }

        fn description(&self) -> &str {
            "Ship the current build"
        }

        async fn invoke(&self, input: DeployInput, _ctx: &HandlerContext) -> Result<Value> {
            Ok(json!({ "deployed": input.env }))
        }
    }

    /// Streams a reply to every user text and renders a progress slot.
    fn assistant(builder: &mut PluginBuilder) {
        builder.on(types::TEXT, |event: Event, _ctx| {
            let from_user = event.role() == Some(&Role::user());
            let replies = if from_user {
                vec![
                    Ok(Event::text_delta("Hel").with_role(Role::assistant())),
                    Ok(Event::text_delta("lo").with_role(Role::assistant())),
                    Ok(Event::ui(UiNode::new("progress").prop("pct", 50))
                        .with_surface("canvas")
                        .with_slot("progress")),
                    Ok(Event::ui(UiNode::new("progress").prop("pct", 100))
                        .with_surface("canvas")
                        .with_slot("progress")),
                ]
            } else {
                Vec::new()
            };
            stream::iter(replies)
        });
    }

    #[tokio::test]
    async fn file_backed_kernel_projects_history() -> Result<()> {
        let root = unique_test_root("melony-kernel-history");
        let kernel = KernelBuilder::new().root(&root).plugin(assistant).build();

        let outcome = kernel.run(Event::text("hi").with_role(Role::user())).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.events.len(), 5);

        let history = kernel.history(&outcome.run_id).await?;
        assert_eq!(history, outcome.events);

        let messages = kernel.messages(&outcome.run_id).await?;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].content, "Hello");
        assert_eq!(messages[1].ui_events.len(), 2);

        let display = kernel.display(&outcome.run_id).await?;
        assert_eq!(display["canvas"].len(), 1);
        let latest = display["canvas"][0].ui.as_ref().map(|node| node.props["pct"].clone());
        assert_eq!(latest, Some(json!(100)));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn persist_filter_keeps_deltas_out_of_history() -> Result<()> {
        let kernel = KernelBuilder::new()
            .plugin(assistant)
            .persist_filter(|event: &Event| event.event_type != types::TEXT_DELTA)
            .build();

        let outcome = kernel.run(Event::text("hi").with_role(Role::user())).await;
        assert_eq!(outcome.events.len(), 5);
        let history = kernel.history(&outcome.run_id).await?;
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|event| event.event_type != types::TEXT_DELTA));
        Ok(())
    }

    #[tokio::test]
    async fn resolve_approval_resumes_the_gated_action() -> Result<()> {
        let kernel = KernelBuilder::new()
            .action(Deploy)
            .approval_policy(ApprovalPolicy::new(["deploy"]))
            .build();
        let mut subscriber = kernel.subscribe_events();

        let outcome = kernel
            .run(Event::new("deploy").with_data(json!({ "env": "prod" })))
            .await;
        assert_eq!(outcome.status, RunStatus::Suspended);
        assert_eq!(kernel.status(&outcome.run_id).await, Some(RunStatus::Suspended));
        assert!(kernel.suspension(&outcome.run_id).is_some());

        let first = subscriber.recv().await?;
        assert_eq!(first.run_id, outcome.run_id);

        let pending = kernel.pending_approvals(None).await;
        assert_eq!(pending.len(), 1);
        let resumed: Vec<Event> = kernel
            .resolve_approval(&pending[0].approval_id, true, Some("ops".into()))
            .await?
            .collect()
            .await;

        let result = resumed
            .iter()
            .find(|event| event.event_type == types::ACTION_RESULT)
            .map(|event| event.payload::<ActionResultPayload>())
            .transpose()?;
        assert_eq!(result.map(|r| r.output), Some(json!({ "deployed": "prod" })));
        assert_eq!(kernel.status(&outcome.run_id).await, Some(RunStatus::Completed));
        assert!(kernel.pending_approvals(Some(&outcome.run_id)).await.is_empty());
        assert!(
            kernel
                .resolve_approval(&pending[0].approval_id, true, None)
                .await
                .is_err()
        );
        Ok(())
    }

    #[tokio::test]
    async fn suspended_run_survives_a_restart() -> Result<()> {
        let root = unique_test_root("melony-kernel-restart");
        let policy = ApprovalPolicy::new(["deploy"]);
        let run_id = RunId::from_string("r-restart");

        let before = KernelBuilder::new()
            .root(&root)
            .action(Deploy)
            .approval_policy(policy.clone())
            .build();
        let outcome = before
            .run(
                Event::new("deploy")
                    .with_data(json!({ "env": "staging" }))
                    .with_run_id(run_id.clone()),
            )
            .await;
        assert_eq!(outcome.status, RunStatus::Suspended);

        let after = KernelBuilder::new()
            .root(&root)
            .action(Deploy)
            .approval_policy(policy)
            .build();
        assert_eq!(after.status(&run_id).await, Some(RunStatus::Suspended));
        assert_eq!(after.history(&run_id).await?.len(), 2);
        assert_eq!(after.status(&RunId::from_string("unknown")).await, None);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[test]
    fn action_definitions_are_published() {
        let kernel = KernelBuilder::new().action(Deploy).build();
        let definitions = kernel.action_definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "deploy");
        assert_eq!(
            definitions[0].input_schema["properties"]["env"]["type"],
            "string"
        );
    }
}
