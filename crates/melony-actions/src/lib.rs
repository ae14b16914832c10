//! Typed actions: named side-effecting operations invoked by events whose
//! type is the action name and whose `data` is the action input.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream;
use indexmap::IndexMap;
use melony_policy::{ApprovalGate, GateDecision};
use melony_protocol::{ActionResultPayload, ErrorKind, Event, Role};
use melony_runtime::{HandlerContext, Plugin, PluginBuilder};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

#[async_trait]
pub trait Action: Send + Sync + 'static {
    type Input: DeserializeOwned + JsonSchema + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn invoke(&self, input: Self::Input, ctx: &HandlerContext) -> Result<Value>;
}

/// Published description of an action, including its input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[async_trait]
trait ErasedAction: Send + Sync {
    fn name(&self) -> &str;
    fn definition(&self) -> ActionDefinition;
    fn validate(&self, input: &Value) -> Result<(), String>;
    async fn call(&self, input: Value, ctx: &HandlerContext) -> Result<Value>;
}

struct Typed<A>(A);

#[async_trait]
impl<A: Action> ErasedAction for Typed<A> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn definition(&self) -> ActionDefinition {
        ActionDefinition {
            name: self.0.name().to_owned(),
            description: self.0.description().to_owned(),
            input_schema: schemars::schema_for!(A::Input).to_value(),
        }
    }

    fn validate(&self, input: &Value) -> Result<(), String> {
        serde_json::from_value::<A::Input>(input.clone())
            .map(|_| ())
            .map_err(|error| error.to_string())
    }

    async fn call(&self, input: Value, ctx: &HandlerContext) -> Result<Value> {
        let input: A::Input = serde_json::from_value(input)
            .with_context(|| format!("decoding input for `{}`", self.0.name()))?;
        self.0.invoke(input, ctx).await
    }
}

#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: IndexMap<String, Arc<dyn ErasedAction>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action`, replacing any earlier action with the same name.
    pub fn register<A: Action>(&mut self, action: A) {
        let name = action.name().to_owned();
        debug!(action = %name, "action registered");
        self.actions.insert(name, Arc::new(Typed(action)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn definition(&self, name: &str) -> Option<ActionDefinition> {
        self.actions.get(name).map(|action| action.definition())
    }

    /// Definitions in registration order.
    pub fn definitions(&self) -> Vec<ActionDefinition> {
        self.actions
            .values()
            .map(|action| action.definition())
            .collect()
    }

    pub fn plugin(&self, gate: ApprovalGate) -> ActionsPlugin {
        ActionsPlugin {
            registry: self.clone(),
            gate,
        }
    }
}

/// One exact handler per registered action.
#[derive(Debug, Clone)]
pub struct ActionsPlugin {
    registry: ActionRegistry,
    gate: ApprovalGate,
}

impl Plugin for ActionsPlugin {
    fn name(&self) -> &str {
        "actions"
    }

    fn register(&self, builder: &mut PluginBuilder) {
        for (name, action) in &self.registry.actions {
            let action = action.clone();
            let gate = self.gate.clone();
            builder.on_named(
                name.as_str(),
                format!("action/{name}"),
                move |event: Event, ctx: HandlerContext| {
                    stream::once(run_action(action.clone(), gate.clone(), event, ctx))
                },
            );
        }
    }
}

/// Validation and invocation failures are reported as `error` events, not
/// handler faults: the run goes on.
#[instrument(skip_all, fields(action = %action.name(), run_id = %ctx.run_id()))]
async fn run_action(
    action: Arc<dyn ErasedAction>,
    gate: ApprovalGate,
    event: Event,
    ctx: HandlerContext,
) -> Result<Event> {
    let name = action.name().to_owned();
    let input = Value::Object(event.data);

    if let Err(message) = action.validate(&input) {
        warn!(%message, "action input rejected");
        return Ok(Event::error(
            ErrorKind::Validation,
            format!("invalid input for `{name}`: {message}"),
        ));
    }

    if let GateDecision::Suspended(request) = gate.check(&ctx, &name, &input).await? {
        return Ok(request);
    }

    match action.call(input, &ctx).await {
        Ok(output) => {
            debug!("action completed");
            Ok(Event::from_payload(&ActionResultPayload {
                action: name,
                output,
            })
            .with_role(Role::assistant()))
        }
        Err(error) => {
            warn!(error = %format!("{error:#}"), "action failed");
            Ok(Event::error(
                ErrorKind::ActionFailed,
                format!("`{name}` failed: {error:#}"),
            ))
        }
    }
}
