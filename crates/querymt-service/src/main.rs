use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use futures::stream as futures_stream;
use futures::StreamExt;
use querymt::chat::{ChatResponse, FinishReason};
use querymt::dialect::{Dialect, GatewayRequest, GatewayResponse};
use querymt::gateway_error::GatewayError;
use querymt::responses::{ResponseId, ResponsesSessionStore, ResumeOutcome};
use querymt::router::{
    to_chat_messages, to_provider_tools, AdapterHandle, AdapterRouter, ChatStream, FallbackAdapter,
};
use querymt::scheduler::{
    AccountQuota, CapacityLimits, PriorityScheduler, RejectReason, SchedulerConfig, SchedulerEvent,
    SchedulerLease, TimeWindowRule,
};
use querymt::translate::{self, StreamRenderState};
use querymt::{tool_adapter, LLMProvider, Usage};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

mod config;

use config::GatewayConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to
    #[arg(long, env = "QMT_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,
    /// Path to the gateway's TOML config (routes, aliases, fallback chains,
    /// scheduler, quotas, time-window rules). Runs passthrough-only with
    /// defaults if omitted.
    #[arg(long, env = "QMT_CONFIG")]
    config: Option<PathBuf>,
    /// Optional gateway-level auth key required of every inbound request
    /// (checked against `Authorization: Bearer` or `x-api-key`).
    #[arg(long, env = "QMT_AUTH_KEY")]
    auth_key: Option<String>,
    /// Overrides the config's `alias_reload_secs` (spec §6: "hot-reloaded
    /// every `n` seconds (env-overridable)").
    #[arg(long, env = "QMT_ALIAS_RELOAD_SECS")]
    alias_reload_secs: Option<u64>,
}

/// Everything a request handler needs to route, schedule, and translate a
/// call: the Adapter Router, each adapter's native tool-calling dialect (so
/// the Tool Adapter knows which `(source, target)` pair to apply), the
/// optional Priority Scheduler, and the Responses tool-resume store.
#[derive(Clone)]
struct AppState {
    router: Arc<AdapterRouter>,
    adapter_dialect: Arc<HashMap<String, Dialect>>,
    scheduler: Option<Arc<PriorityScheduler>>,
    default_priority: u8,
    responses_store: Arc<ResponsesSessionStore>,
    auth_key: Option<String>,
    model_ids: Arc<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("querymt_service=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();
    let mut cfg: GatewayConfig = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading gateway config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing gateway config {}", path.display()))?
        }
        None => {
            info!("no --config given, starting with the passthrough-only default config");
            GatewayConfig::default()
        }
    };
    if let Some(secs) = args.alias_reload_secs {
        cfg.alias_reload_secs = secs;
    }

    info!(
        addr = %args.addr,
        auth = %args.auth_key.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        "starting gateway"
    );

    let state = config::build_state(cfg, args.auth_key)?;

    let app = Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/responses", post(handle_responses))
        .route(
            "/v1/responses/{id}/submit_tool_outputs",
            post(handle_submit_tool_outputs),
        )
        .route("/v1/embeddings", post(handle_embeddings))
        .route("/v1/models", get(handle_models))
        .route("/healthz", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_models(State(state): State<AppState>) -> impl IntoResponse {
    let data: Vec<Value> = state
        .model_ids
        .iter()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "querymt" }))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Resolves the account id a request is charged/quota-gated under from
/// whichever credential header it carries, and rejects the request if the
/// gateway requires a key and none (or the wrong one) was supplied.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<String, GatewayError> {
    let supplied = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));

    match (&state.auth_key, supplied) {
        (None, Some(token)) => Ok(token.to_string()),
        (None, None) => Ok("anonymous".to_string()),
        (Some(key), Some(token)) if token == key => Ok(token.to_string()),
        (Some(_), _) => Err(GatewayError::Unauthenticated),
    }
}

/// Pulls an optional `priority` field (`0..=9`) out of the raw request
/// body, falling back to the configured default.
fn request_priority(body: &Value, default_priority: u8) -> u8 {
    body.get("priority")
        .and_then(|v| v.as_u64())
        .map(|v| v.min(9) as u8)
        .unwrap_or(default_priority)
}

fn gen_id(dialect: Dialect) -> String {
    match dialect {
        Dialect::OpenAiChat => format!("chatcmpl-{}", Uuid::new_v4()),
        Dialect::Anthropic => format!("msg_{}", Uuid::new_v4()),
        Dialect::Responses => format!("resp_{}", Uuid::new_v4()),
    }
}

fn gateway_error_response(dialect: Dialect, err: GatewayError) -> Response {
    let status = err.http_status();
    let body = err.wire_body(dialect);
    (StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), Json(body))
        .into_response()
}

/// Waits out the scheduler's `Queued -> Scheduled`/`Rejected` handshake,
/// translating a `Rejected` outcome into the matching [`GatewayError`]. A
/// disabled scheduler admits unconditionally and returns no lease.
async fn admit(
    state: &AppState,
    priority: u8,
    account_id: &str,
    est_tokens: u32,
) -> Result<Option<SchedulerLease>, GatewayError> {
    let Some(scheduler) = &state.scheduler else { return Ok(None) };
    let (mut rx, lease) = scheduler.submit(priority, est_tokens, account_id);
    loop {
        match rx.recv().await {
            Some(SchedulerEvent::Scheduled) => return Ok(Some(lease)),
            Some(SchedulerEvent::Queued { .. }) => continue,
            Some(SchedulerEvent::Rejected { reason }) => {
                return Err(match reason {
                    RejectReason::QueueTimeout => GatewayError::QueueTimeout,
                    RejectReason::ShuttingDown => GatewayError::Cancelled,
                    RejectReason::ContextTooLarge { max_context_length } => GatewayError::ContextTooLarge {
                        est_tokens,
                        max_tokens: max_context_length,
                    },
                    RejectReason::QueueFull => GatewayError::QuotaExceeded,
                });
            }
            None => return Err(GatewayError::Internal("scheduler channel closed".into())),
        }
    }
}

/// Resolves the adapter for `req.model`, applies the Tool Adapter across
/// the `(inbound, adapter-native)` dialect pair, and returns the adapter
/// plus the outbound request ready to hand to `chat_with_tools`/
/// `chat_stream_with_tools`.
fn prepare(state: &AppState, inbound: Dialect, req: &GatewayRequest) -> Result<(AdapterHandle, GatewayRequest), GatewayError> {
    let (adapter_name, adapter) = state.router.find_adapter(&req.model)?;
    let outbound_model = state.router.rewrite_alias(&req.model);
    let mut outbound = req.clone();
    outbound.model = outbound_model;
    let native = state
        .adapter_dialect
        .get(&adapter_name)
        .copied()
        .unwrap_or(Dialect::OpenAiChat);
    tool_adapter::adapt_tools(&mut outbound, inbound, native);
    Ok((adapter, outbound))
}

fn stop_reason_of(resp: &dyn ChatResponse) -> String {
    if resp.tool_calls().map(|c| !c.is_empty()).unwrap_or(false) {
        return "tool_calls".to_string();
    }
    match resp.finish_reason() {
        Some(FinishReason::Stop) | None => "stop",
        Some(FinishReason::Length) => "length",
        Some(FinishReason::ContentFilter) => "content_filter",
        Some(FinishReason::ToolCalls) => "tool_calls",
        Some(FinishReason::Error) => "error",
        Some(FinishReason::Other) => "other",
        Some(FinishReason::Unknown) => "unknown",
    }
    .to_string()
}

async fn run_once(id: String, adapter: &AdapterHandle, req: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
    let messages = to_chat_messages(req);
    let tools = to_provider_tools(req);
    let tools_opt = if tools.is_empty() { None } else { Some(tools.as_slice()) };
    let resp = adapter.chat_with_tools(&messages, tools_opt).await?;
    Ok(GatewayResponse {
        id,
        model: req.model.clone(),
        text: resp.text(),
        tool_calls: resp.tool_calls().unwrap_or_default(),
        stop_reason: stop_reason_of(resp.as_ref()),
        usage: resp.usage().unwrap_or_default(),
    })
}

async fn run_stream(adapter: &AdapterHandle, req: &GatewayRequest) -> Result<ChatStream, GatewayError> {
    if !adapter.supports_streaming() {
        return Err(GatewayError::Unsupported("this model does not support streaming".into()));
    }
    let messages = to_chat_messages(req);
    let tools = to_provider_tools(req);
    let tools_opt = if tools.is_empty() { None } else { Some(tools.as_slice()) };
    Ok(adapter.chat_stream_with_tools(&messages, tools_opt).await?)
}

/// Drives a [`ChatStream`] through the dialect's SSE renderer, holding the
/// scheduler lease alive for the stream's lifetime so capacity is released
/// exactly once, whether the stream finishes normally or the client drops
/// the connection mid-flight.
fn sse_response(dialect: Dialect, id: String, model: String, stream: ChatStream, lease: Option<SchedulerLease>) -> Response {
    let render_state = StreamRenderState::new(dialect, id, model);
    let sse_stream = stream
        .scan((render_state, lease), move |(render_state, _lease), item| {
            let events: Vec<(&'static str, Value)> = match item {
                Ok(chunk) => translate::render_stream_chunk(&chunk, render_state),
                Err(e) => vec![translate::synthetic_error_event(dialect, "upstream_error", &e.to_string())],
            };
            futures::future::ready(Some(events))
        })
        .flat_map(|events| {
            let frames: Vec<Event> = events
                .into_iter()
                .map(|(name, data)| Event::default().event(name).data(data.to_string()))
                .collect();
            futures_stream::iter(frames.into_iter().map(Ok::<_, Infallible>))
        })
        .chain(futures_stream::once(
            async { Ok::<_, Infallible>(Event::default().data("[DONE]")) },
        ));

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response()
}

/// Shared pipeline for the two stateless chat dialects (`/v1/chat/completions`,
/// `/v1/messages`): parse -> admit -> resolve/adapt -> call -> render.
#[instrument(skip(state, headers, body), fields(dialect = dialect.as_str()))]
async fn handle_dialect_request(state: AppState, dialect: Dialect, headers: HeaderMap, body: Value) -> Response {
    let account_id = match check_auth(&state, &headers) {
        Ok(a) => a,
        Err(e) => return gateway_error_response(dialect, e),
    };

    let req = match translate::parse_request(dialect, &body) {
        Ok(r) => r,
        Err(e) => return gateway_error_response(dialect, e),
    };

    let priority = request_priority(&body, state.default_priority);
    let est_tokens = req.estimate_tokens();
    let lease = match admit(&state, priority, &account_id, est_tokens).await {
        Ok(l) => l,
        Err(e) => return gateway_error_response(dialect, e),
    };

    let (adapter, outbound) = match prepare(&state, dialect, &req) {
        Ok(v) => v,
        Err(e) => return gateway_error_response(dialect, e),
    };

    if outbound.stream {
        match run_stream(&adapter, &outbound).await {
            Ok(stream) => sse_response(dialect, gen_id(dialect), outbound.model.clone(), stream, lease),
            Err(e) => gateway_error_response(dialect, e),
        }
    } else {
        let result = run_once(gen_id(dialect), &adapter, &outbound).await;
        drop(lease);
        match result {
            Ok(resp) => Json(translate::render_response(dialect, &resp)).into_response(),
            Err(e) => gateway_error_response(dialect, e),
        }
    }
}

async fn handle_chat_completions(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_dialect_request(state, Dialect::OpenAiChat, headers, body).await
}

async fn handle_messages(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_dialect_request(state, Dialect::Anthropic, headers, body).await
}

/// `/v1/responses`: same pipeline as [`handle_dialect_request`], but the
/// session is minted before the call so a paused (tool-calling) turn has
/// somewhere to record its pending calls, and is torn down immediately
/// when the turn completes without pausing.
async fn handle_responses(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let dialect = Dialect::Responses;
    let account_id = match check_auth(&state, &headers) {
        Ok(a) => a,
        Err(e) => return gateway_error_response(dialect, e),
    };

    let req = match translate::parse_request(dialect, &body) {
        Ok(r) => r,
        Err(e) => return gateway_error_response(dialect, e),
    };

    let priority = request_priority(&body, state.default_priority);
    let est_tokens = req.estimate_tokens();
    let lease = match admit(&state, priority, &account_id, est_tokens).await {
        Ok(l) => l,
        Err(e) => return gateway_error_response(dialect, e),
    };

    let session_id = state.responses_store.create(req.clone()).await;

    let (adapter, outbound) = match prepare(&state, dialect, &req) {
        Ok(v) => v,
        Err(e) => {
            state.responses_store.destroy(&session_id).await;
            return gateway_error_response(dialect, e);
        }
    };

    if outbound.stream {
        let stream = match run_stream(&adapter, &outbound).await {
            Ok(s) => s,
            Err(e) => {
                state.responses_store.destroy(&session_id).await;
                return gateway_error_response(dialect, e);
            }
        };
        responses_sse_response(state, session_id, outbound.model.clone(), stream, lease)
    } else {
        let result = run_once(session_id.as_str().to_string(), &adapter, &outbound).await;
        drop(lease);
        match result {
            Ok(resp) => {
                if resp.tool_calls.is_empty() {
                    state.responses_store.destroy(&session_id).await;
                } else {
                    let assistant = querymt::dialect::GatewayMessage {
                        role: querymt::dialect::Role::Assistant,
                        content: querymt::dialect::MessageContent::Text(resp.text.clone().unwrap_or_default()),
                        tool_call_id: None,
                        tool_calls: Some(resp.tool_calls.clone()),
                        cache_control: None,
                    };
                    if let Err(e) = state
                        .responses_store
                        .pause_on_tool_calls(&session_id, assistant, resp.tool_calls.clone())
                        .await
                    {
                        warn!(error = %e, "failed to pause responses session on tool calls");
                    }
                }
                Json(translate::render_response(dialect, &resp)).into_response()
            }
            Err(e) => {
                state.responses_store.destroy(&session_id).await;
                gateway_error_response(dialect, e)
            }
        }
    }
}

/// Streaming variant of the `/v1/responses` pipeline: accumulates the
/// assistant's text and tool calls alongside rendering each chunk so the
/// session can be paused (or destroyed) once the stream's `Done` chunk
/// arrives.
fn responses_sse_response(state: AppState, session_id: ResponseId, model: String, stream: ChatStream, lease: Option<SchedulerLease>) -> Response {
    let render_state = StreamRenderState::new(Dialect::Responses, session_id.as_str().to_string(), model);
    let text = String::new();
    let tool_calls: Vec<querymt::ToolCall> = Vec::new();

    let sse_stream = stream
        .scan(
            (render_state, lease, text, tool_calls, state, session_id),
            move |(render_state, _lease, text, tool_calls, state, session_id), item| {
                let events = match &item {
                    Ok(chunk) => translate::render_stream_chunk(chunk, render_state),
                    Err(e) => vec![translate::synthetic_error_event(Dialect::Responses, "upstream_error", &e.to_string())],
                };
                if let Ok(querymt::chat::StreamChunk::Text(delta)) = &item {
                    text.push_str(delta);
                }
                if let Ok(querymt::chat::StreamChunk::ToolUseComplete { tool_call, .. }) = &item {
                    tool_calls.push(tool_call.clone());
                }
                let done = matches!(item, Ok(querymt::chat::StreamChunk::Done { .. }));
                let (state, session_id, text, tool_calls) = (state.clone(), session_id.clone(), text.clone(), tool_calls.clone());
                async move {
                    if done {
                        if tool_calls.is_empty() {
                            state.responses_store.destroy(&session_id).await;
                        } else {
                            let assistant = querymt::dialect::GatewayMessage {
                                role: querymt::dialect::Role::Assistant,
                                content: querymt::dialect::MessageContent::Text(text),
                                tool_call_id: None,
                                tool_calls: Some(tool_calls.clone()),
                                cache_control: None,
                            };
                            if let Err(e) = state.responses_store.pause_on_tool_calls(&session_id, assistant, tool_calls).await {
                                warn!(error = %e, "failed to pause responses session on tool calls");
                            }
                        }
                    }
                    Some(events)
                }
            },
        )
        .flat_map(|events| {
            let frames: Vec<Event> = events
                .into_iter()
                .map(|(name, data)| Event::default().event(name).data(data.to_string()))
                .collect();
            futures_stream::iter(frames.into_iter().map(Ok::<_, Infallible>))
        })
        .chain(futures_stream::once(
            async { Ok::<_, Infallible>(Event::default().data("[DONE]")) },
        ));

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ToolOutputIn {
    tool_call_id: String,
    output: String,
}

#[derive(Debug, Deserialize)]
struct SubmitToolOutputsRequest {
    tool_outputs: Vec<ToolOutputIn>,
}

/// `POST /v1/responses/{id}/submit_tool_outputs`: validates and appends the
/// submitted tool results, then replays the resumed conversation through
/// the same resolve/adapt/call pipeline.
async fn handle_submit_tool_outputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SubmitToolOutputsRequest>,
) -> Response {
    let dialect = Dialect::Responses;
    if let Err(e) = check_auth(&state, &headers) {
        return gateway_error_response(dialect, e);
    }

    let session_id = ResponseId::from_str(&id);
    let outputs = body.tool_outputs.into_iter().map(|o| (o.tool_call_id, o.output)).collect();

    let outcome = match state.responses_store.submit_tool_outputs(&session_id, outputs).await {
        Ok(o) => o,
        Err(e) => return gateway_error_response(dialect, GatewayError::NotFound(e.to_string())),
    };

    let (resumed, warning) = match outcome {
        ResumeOutcome::Ready(req) => (req, None),
        ResumeOutcome::Warn(req, msg) => (req, Some(msg)),
        ResumeOutcome::Reject(err) => {
            state.responses_store.destroy(&session_id).await;
            return gateway_error_response(dialect, err);
        }
    };

    let mut resumed = resumed;
    if let Some(warning) = warning {
        resumed.messages.push(querymt::dialect::GatewayMessage::system(warning));
    }

    let (adapter, outbound) = match prepare(&state, dialect, &resumed) {
        Ok(v) => v,
        Err(e) => {
            state.responses_store.destroy(&session_id).await;
            return gateway_error_response(dialect, e);
        }
    };

    let result = run_once(session_id.as_str().to_string(), &adapter, &outbound).await;
    match result {
        Ok(resp) => {
            if resp.tool_calls.is_empty() {
                state.responses_store.destroy(&session_id).await;
            } else {
                let assistant = querymt::dialect::GatewayMessage {
                    role: querymt::dialect::Role::Assistant,
                    content: querymt::dialect::MessageContent::Text(resp.text.clone().unwrap_or_default()),
                    tool_call_id: None,
                    tool_calls: Some(resp.tool_calls.clone()),
                    cache_control: None,
                };
                if let Err(e) = state
                    .responses_store
                    .pause_on_tool_calls(&session_id, assistant, resp.tool_calls.clone())
                    .await
                {
                    warn!(error = %e, "failed to pause responses session on tool calls");
                }
            }
            Json(translate::render_response(dialect, &resp)).into_response()
        }
        Err(e) => {
            state.responses_store.destroy(&session_id).await;
            gateway_error_response(dialect, e)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingInput {
    Single(String),
    Multi(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct EmbeddingsHttpRequest {
    model: String,
    input: EmbeddingInput,
}

async fn handle_embeddings(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<EmbeddingsHttpRequest>) -> Response {
    let dialect = Dialect::OpenAiChat;
    if let Err(e) = check_auth(&state, &headers) {
        return gateway_error_response(dialect, e);
    }

    let (_, adapter) = match state.router.find_adapter(&req.model) {
        Ok(v) => v,
        Err(e) => return gateway_error_response(dialect, e),
    };

    let inputs = match req.input {
        EmbeddingInput::Single(s) => vec![s],
        EmbeddingInput::Multi(v) => v,
    };

    match adapter.embed(inputs).await {
        Ok(vectors) => {
            let data: Vec<Value> = vectors
                .into_iter()
                .enumerate()
                .map(|(i, v)| json!({ "object": "embedding", "index": i, "embedding": v }))
                .collect();
            Json(json!({
                "object": "list",
                "data": data,
                "model": req.model,
                "usage": { "prompt_tokens": 0, "total_tokens": 0 },
            }))
            .into_response()
        }
        Err(e) => gateway_error_response(dialect, GatewayError::Provider(e)),
    }
}
