use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use indexmap::IndexMap;
use melony_actions::ActionDefinition;
use melony_kernel::MelonyKernel;
use melony_policy::{ApprovalPolicy, ApprovalTicket};
use melony_protocol::{ApprovalId, AuthPort, Event, Message, RunId, RunStatus, Suspension};
use melony_runtime::{DispatchStream, RuntimeConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

mod auth;

use crate::auth::{StaticTokenAuth, bearer_token};

const RUN_ID_HEADER: &str = "x-melony-run-id";

#[derive(Debug, Parser)]
#[command(name = "melony-api")]
#[command(about = "Melony HTTP/SSE transport")]
struct Cli {
    #[arg(long, default_value = ".melony")]
    root: PathBuf,
    /// Keep events and checkpoints in memory instead of under `--root`.
    #[arg(long)]
    in_memory: bool,
    #[arg(long, default_value = "127.0.0.1:8788")]
    listen: SocketAddr,
    /// Require `Authorization: Bearer <token>` on every route but /healthz.
    #[arg(long)]
    api_token: Option<String>,
    /// Action name patterns that need human approval (trailing `*` allowed).
    #[arg(long = "gate")]
    gates: Vec<String>,
    #[arg(long)]
    max_chain_depth: Option<usize>,
    #[arg(long)]
    max_events: Option<usize>,
    #[arg(long)]
    persist_timeout_ms: Option<u64>,
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

#[derive(Clone)]
struct AppState {
    kernel: MelonyKernel,
    auth: Option<Arc<dyn AuthPort>>,
}

#[derive(Debug, Deserialize)]
struct ResolveApprovalRequest {
    approved: bool,
    actor: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApprovalListQuery {
    run_id: Option<RunId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunStatusResponse {
    run_id: RunId,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    suspension: Option<Suspension>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: error.to_string(),
        }
    }

    fn not_found(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: error.to_string(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

type SseStream = BoxStream<'static, Result<SseEvent, Infallible>>;

type DispatchSse = (HeaderMap, Sse<KeepAliveStream<SseStream>>);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let mut builder = MelonyKernel::builder()
        .config(cli.runtime_config())
        .approval_policy(ApprovalPolicy::new(cli.gates.iter().cloned()));
    if !cli.in_memory {
        builder = builder.root(cli.root.clone());
    }

    let state = AppState {
        kernel: builder.build(),
        auth: cli
            .api_token
            .clone()
            .map(|token| Arc::new(StaticTokenAuth::new(token)) as Arc<dyn AuthPort>),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        listen = %cli.listen,
        root = %cli.root.display(),
        in_memory = cli.in_memory,
        auth = cli.api_token.is_some(),
        "melony-api listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/events", post(post_event))
        .route("/approvals", get(list_approvals))
        .route("/approvals/{approval_id}", post(resolve_approval))
        .route("/actions", get(list_actions))
        .route("/runs/{run_id}", get(run_status))
        .route("/runs/{run_id}/events", get(run_events))
        .route("/runs/{run_id}/events/stream", get(stream_run_events))
        .route("/runs/{run_id}/messages", get(run_messages))
        .route("/runs/{run_id}/display", get(run_display))
        .route_layer(middleware::from_fn_with_state(state.clone(), authorize));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn authorize(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    if let Some(auth) = &state.auth {
        let token = bearer_token(request.headers())
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let principal = auth
            .authenticate(token)
            .await
            .map_err(ApiError::unauthorized)?;
        debug!(subject = %principal.subject, "request authenticated");
    }
    Ok(next.run(request).await)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "melony-api"
    }))
}

/// Dispatch one event and stream everything it produces. Closing the
/// connection abandons the dispatch.
async fn post_event(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> ApiResult<DispatchSse> {
    if event.event_type.as_str().is_empty() {
        return Err(ApiError::bad_request("event type must not be empty"));
    }
    let dispatch = state.kernel.dispatch(event);
    dispatch_sse(state.kernel, dispatch)
}

async fn resolve_approval(
    Path(approval_id): Path<ApprovalId>,
    State(state): State<AppState>,
    Json(request): Json<ResolveApprovalRequest>,
) -> ApiResult<DispatchSse> {
    let actor = request.actor.unwrap_or_else(|| "api".to_owned());
    let dispatch = state
        .kernel
        .resolve_approval(&approval_id, request.approved, Some(actor))
        .await
        .map_err(ApiError::not_found)?;
    dispatch_sse(state.kernel, dispatch)
}

async fn list_approvals(
    Query(query): Query<ApprovalListQuery>,
    State(state): State<AppState>,
) -> Json<Vec<ApprovalTicket>> {
    Json(state.kernel.pending_approvals(query.run_id.as_ref()).await)
}

async fn list_actions(State(state): State<AppState>) -> Json<Vec<ActionDefinition>> {
    Json(state.kernel.action_definitions())
}

async fn run_status(
    Path(run_id): Path<RunId>,
    State(state): State<AppState>,
) -> ApiResult<Json<RunStatusResponse>> {
    let status = state
        .kernel
        .status(&run_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("unknown run {run_id}")))?;
    let suspension = state.kernel.suspension(&run_id);
    Ok(Json(RunStatusResponse {
        run_id,
        status,
        suspension,
    }))
}

async fn run_events(
    Path(run_id): Path<RunId>,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Event>>> {
    let history = state
        .kernel
        .history(&run_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(history))
}

async fn run_messages(
    Path(run_id): Path<RunId>,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Message>>> {
    let messages = state
        .kernel
        .messages(&run_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(messages))
}

async fn run_display(
    Path(run_id): Path<RunId>,
    State(state): State<AppState>,
) -> ApiResult<Json<IndexMap<String, Vec<Event>>>> {
    let display = state
        .kernel
        .display(&run_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(display))
}

/// Stored history of the run followed by its live events.
async fn stream_run_events(
    Path(run_id): Path<RunId>,
    State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let mut subscription = state.kernel.subscribe_events();
    let replay = state
        .kernel
        .history(&run_id)
        .await
        .map_err(ApiError::internal)?;

    let stream = stream! {
        let mut sequence: u64 = 0;
        for event in replay {
            sequence += 1;
            yield Ok(as_sse_event(sequence, &event));
        }

        loop {
            match subscription.recv().await {
                Ok(entry) => {
                    if entry.run_id != run_id {
                        continue;
                    }
                    sequence += 1;
                    yield Ok(as_sse_event(sequence, &entry.event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    let lag_payload = json!({ "skipped": skipped }).to_string();
                    yield Ok(SseEvent::default().event("stream.lagged").data(lag_payload));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

fn dispatch_sse(kernel: MelonyKernel, mut dispatch: DispatchStream) -> ApiResult<DispatchSse> {
    let run_id = dispatch.run_id().clone();
    let mut headers = HeaderMap::new();
    let header_value = HeaderValue::from_str(run_id.as_str())
        .map_err(|error| ApiError::bad_request(format!("run id is not a header value: {error}")))?;
    headers.insert(RUN_ID_HEADER, header_value);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let stream = stream! {
        let mut sequence: u64 = 0;
        while let Some(event) = dispatch.next().await {
            sequence += 1;
            yield Ok(as_sse_event(sequence, &event));
        }
        let settled = json!({
            "runId": run_id,
            "status": dispatch.status().or_else(|| kernel.runtime().status(&run_id)),
            "events": sequence,
        });
        yield Ok(SseEvent::default().event("run.settled").data(settled.to_string()));
    };

    Ok((headers, Sse::new(stream.boxed()).keep_alive(keep_alive())))
}

fn as_sse_event(sequence: u64, event: &Event) -> SseEvent {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    SseEvent::default()
        .id(sequence.to_string())
        .event(event.event_type.as_str())
        .data(payload)
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
