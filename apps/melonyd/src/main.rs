use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use clap::Parser;
use futures_util::StreamExt;
use melony_actions::Action;
use melony_kernel::MelonyKernel;
use melony_policy::ApprovalPolicy;
use melony_protocol::{Event, Role, TextPayload, UiNode, types};
use melony_runtime::{HandlerContext, Plugin, PluginBuilder, RuntimeConfig};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "melonyd")]
#[command(about = "Melony runtime demo daemon")]
struct Cli {
    #[arg(long, default_value = ".melony")]
    root: PathBuf,
    #[arg(long)]
    max_chain_depth: Option<usize>,
    #[arg(long)]
    max_events: Option<usize>,
    #[arg(long)]
    persist_timeout_ms: Option<u64>,
    /// Deny the scripted approval instead of granting it.
    #[arg(long)]
    deny: bool,
}

impl Cli {
    fn runtime_config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        if let Some(depth) = self.max_chain_depth {
            config = config.max_chain_depth(depth);
        }
        if let Some(limit) = self.max_events {
            config = config.max_events_per_dispatch(limit);
        }
        if let Some(millis) = self.persist_timeout_ms {
            config = config.persist_timeout_ms(millis);
        }
        config
    }
}

/// Streams a word-by-word reply to user text, or turns `/publish <note>`
/// into a `publish_note` action.
struct Assistant;

impl Plugin for Assistant {
    fn name(&self) -> &str {
        "assistant"
    }

    fn register(&self, builder: &mut PluginBuilder) {
        builder.on_named(
            types::TEXT,
            "assistant/reply",
            |event: Event, _ctx: HandlerContext| {
                stream! {
                    let from_user = event.role().is_some_and(|role| role.as_str() == "user");
                    let content = event
                        .payload::<TextPayload>()
                        .map(|payload| payload.content)
                        .unwrap_or_default();

                    if from_user {
                        if let Some(note) = content.strip_prefix("/publish ") {
                            yield Ok(Event::new("publish_note")
                                .with_data(json!({ "note": note }))
                                .with_role(Role::assistant()));
                        } else {
                            for word in content.split_whitespace() {
                                yield Ok(Event::text_delta(format!("{word} "))
                                    .with_role(Role::assistant()));
                            }
                            yield Ok(Event::new("word_count").with_data(json!({ "text": content })));
                        }
                    }
                }
            },
        );

        builder.on_named(
            types::ACTION_RESULT,
            "assistant/summary-card",
            |event: Event, _ctx: HandlerContext| {
                stream! {
                    let card = UiNode::new("result-card")
                        .prop("action", event.data_str("action").unwrap_or_default())
                        .prop("output", event.data.get("output").cloned().unwrap_or(Value::Null));
                    yield Ok(Event::ui(card)
                        .with_surface("sidebar")
                        .with_role(Role::assistant()));
                }
            },
        );
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WordCountInput {
    text: String,
}

struct WordCount;

#[async_trait]
impl Action for WordCount {
    type Input = WordCountInput;

    fn name(&self) -> &str {
        "word_count"
    }

    fn description(&self) -> &str {
        "Count the words of a text"
    }

    async fn invoke(&self, input: WordCountInput, ctx: &HandlerContext) -> Result<Value> {
        let words = input.text.split_whitespace().count();
        ctx.state().set("last_word_count", &words)?;
        Ok(json!({ "words": words }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PublishNoteInput {
    note: String,
}

/// Appends a note to `<root>/notes/<run id>.txt`. Gated behind approval.
struct PublishNote {
    dir: PathBuf,
}

#[async_trait]
impl Action for PublishNote {
    type Input = PublishNoteInput;

    fn name(&self) -> &str {
        "publish_note"
    }

    fn description(&self) -> &str {
        "Write a note to the notes directory"
    }

    async fn invoke(&self, input: PublishNoteInput, ctx: &HandlerContext) -> Result<Value> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.txt", ctx.run_id()));
        tokio::fs::write(&path, format!("{}\n", input.note))
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(json!({ "path": path.display().to_string(), "bytes": input.note.len() + 1 }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();

    let kernel = MelonyKernel::builder()
        .root(cli.root.clone())
        .config(cli.runtime_config())
        .approval_policy(ApprovalPolicy::new(["publish_*"]))
        .action(WordCount)
        .action(PublishNote {
            dir: cli.root.join("notes"),
        })
        .plugin(Assistant)
        .build();

    let mut events = kernel.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(entry) = events.recv().await {
            let rendered = serde_json::to_string(&entry.event).unwrap_or_else(|_| "{}".to_owned());
            info!(run_id = %entry.run_id, event = %rendered, "event.journaled");
        }
    });

    let greeting = kernel
        .run(Event::text("hello from the melony demo daemon").with_role(Role::user()))
        .await;
    info!(
        run_id = %greeting.run_id,
        status = ?greeting.status,
        events = greeting.events.len(),
        "greeting run finished"
    );
    for message in kernel.messages(&greeting.run_id).await? {
        info!(role = %message.role.as_str(), content = %message.content.trim_end(), "message");
    }

    let publish = kernel
        .run(Event::text("/publish ship the release notes").with_role(Role::user()))
        .await;
    info!(
        run_id = %publish.run_id,
        status = ?publish.status,
        "publish run parked"
    );

    let pending = kernel.pending_approvals(Some(&publish.run_id)).await;
    if pending.is_empty() {
        warn!(run_id = %publish.run_id, "expected a pending approval");
    }
    for ticket in pending {
        info!(
            approval_id = %ticket.approval_id,
            action = %ticket.action,
            approved = !cli.deny,
            "resolving approval"
        );
        let mut resumed = kernel
            .resolve_approval(&ticket.approval_id, !cli.deny, Some("melonyd".to_owned()))
            .await?;
        while let Some(event) = resumed.next().await {
            info!(event_type = %event.event_type, "resumed event");
        }
    }

    let status = kernel.status(&publish.run_id).await;
    info!(run_id = %publish.run_id, ?status, "publish run settled");
    for (surface, shown) in kernel.display(&publish.run_id).await? {
        info!(%surface, events = shown.len(), "display surface");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    Ok(())
}
