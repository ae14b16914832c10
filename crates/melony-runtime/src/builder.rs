//! Plugin registration and the frozen handler table.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures_util::Stream;
use melony_events::{EventJournal, EventStreamHub, InMemoryEventStore, InMemoryKeyValueStore};
use melony_protocol::{Event, EventPattern, EventType, KeyValuePort};
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::engine::Runtime;
use crate::handler::{Handler, HandlerContext};

/// A named bundle of handler registrations.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str {
        "plugin"
    }

    fn register(&self, builder: &mut PluginBuilder);
}

impl<F> Plugin for F
where
    F: Fn(&mut PluginBuilder) + Send + Sync,
{
    fn register(&self, builder: &mut PluginBuilder) {
        self(builder)
    }
}

/// One handler bound to a pattern.
#[derive(Clone)]
pub struct Registration {
    pub pattern: EventPattern,
    pub name: Arc<str>,
    pub handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("pattern", &self.pattern)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Collects registrations while plugins are applied.
#[derive(Debug, Default)]
pub struct PluginBuilder {
    plugin: String,
    registrations: Vec<Registration>,
}

impl PluginBuilder {
    pub fn on<F, S>(&mut self, pattern: impl Into<EventPattern>, handler: F) -> &mut Self
    where
        F: Fn(Event, HandlerContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Event>> + Send + 'static,
    {
        self.add_handler(pattern, None, Arc::new(handler))
    }

    pub fn on_named<F, S>(
        &mut self,
        pattern: impl Into<EventPattern>,
        name: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Event, HandlerContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Event>> + Send + 'static,
    {
        self.add_handler(pattern, Some(name.into()), Arc::new(handler))
    }

    /// Register a handler object. Without a name the identity is
    /// `<plugin>/<pattern>#<index>`.
    pub fn add_handler(
        &mut self,
        pattern: impl Into<EventPattern>,
        name: Option<String>,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        let pattern = pattern.into();
        let name = name.unwrap_or_else(|| {
            format!("{}/{}#{}", self.plugin, pattern, self.registrations.len())
        });
        self.push(pattern, name, handler)
    }

    fn push(&mut self, pattern: EventPattern, name: String, handler: Arc<dyn Handler>) -> &mut Self {
        debug!(plugin = %self.plugin, handler = %name, %pattern, "handler registered");
        self.registrations.push(Registration {
            pattern,
            name: Arc::from(name),
            handler,
        });
        self
    }
}

/// Immutable routing table: exact-type handlers first, then wildcards, each
/// in registration order.
#[derive(Debug, Default)]
pub struct HandlerTable {
    exact: HashMap<EventType, Vec<Arc<Registration>>>,
    wildcard: Vec<Arc<Registration>>,
}

impl HandlerTable {
    fn from_registrations(registrations: Vec<Registration>) -> Self {
        let mut table = Self::default();
        for registration in registrations {
            match &registration.pattern {
                EventPattern::Exact(event_type) => table
                    .exact
                    .entry(event_type.clone())
                    .or_default()
                    .push(Arc::new(registration)),
                EventPattern::Any => table.wildcard.push(Arc::new(registration)),
            }
        }
        table
    }

    pub fn matching(&self, event_type: &EventType) -> Vec<Arc<Registration>> {
        self.exact
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(self.wildcard.iter())
            .cloned()
            .collect()
    }

    pub fn has_exact(&self, event_type: &EventType) -> bool {
        self.exact.get(event_type).is_some_and(|handlers| !handlers.is_empty())
    }

    pub fn len(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies plugins in caller order and freezes the result into a [`Runtime`].
pub struct RuntimeBuilder {
    plugins: PluginBuilder,
    config: RuntimeConfig,
    journal: Option<EventJournal>,
    checkpoints: Option<Arc<dyn KeyValuePort>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            plugins: PluginBuilder::default(),
            config: RuntimeConfig::default(),
            journal: None,
            checkpoints: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn journal(mut self, journal: EventJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<dyn KeyValuePort>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn plugin(self, plugin: impl Plugin) -> Self {
        self.plugin_dyn(&plugin)
    }

    pub fn plugin_dyn(mut self, plugin: &dyn Plugin) -> Self {
        self.plugins.plugin = plugin.name().to_owned();
        plugin.register(&mut self.plugins);
        self
    }

    /// Apply a closure as a plugin called `name`.
    pub fn plugin_fn(
        mut self,
        name: impl Into<String>,
        register: impl Fn(&mut PluginBuilder),
    ) -> Self {
        self.plugins.plugin = name.into();
        register(&mut self.plugins);
        self
    }

    /// Register a single handler outside any plugin.
    pub fn on<F, S>(mut self, pattern: impl Into<EventPattern>, handler: F) -> Self
    where
        F: Fn(Event, HandlerContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Event>> + Send + 'static,
    {
        self.plugins.plugin = "root".to_owned();
        self.plugins.on(pattern, handler);
        self
    }

    pub fn build(self) -> Runtime {
        let table = HandlerTable::from_registrations(self.plugins.registrations);
        let journal = self.journal.unwrap_or_else(|| {
            EventJournal::new(
                Arc::new(InMemoryEventStore::new()),
                EventStreamHub::new(self.config.stream_buffer),
            )
            .with_persist_timeout(self.config.persist_timeout())
        });
        let checkpoints: Arc<dyn KeyValuePort> = match self.checkpoints {
            Some(checkpoints) => checkpoints,
            None => Arc::new(InMemoryKeyValueStore::new()),
        };
        Runtime::new(table, self.config, journal, checkpoints)
    }
}
