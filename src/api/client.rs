//! Client-facing dialect API — the endpoints an LLM client talks to.
//!
//! Handlers are a thin HTTP shim: body parsing, key-scoped quota
//! enforcement, and usage accounting live here; all routing/selection/
//! transformation logic lives in [`crate::router`], [`crate::dispatch`], and
//! [`crate::transform`].

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde_json::{json, Value};

use crate::api::client_auth::AuthenticatedKey;
use crate::api::request_id::RequestId;
use crate::config::{Dialect, QuotaDefinition};
use crate::dispatch;
use crate::error::GatewayError;
use crate::inspector::{self, DebugEntry, StreamInspector};
use crate::quota::UsageCost;
use crate::router::RouterState;
use crate::selector;
use crate::store::UsageRecord;
use crate::usage::{TrackerSnapshot, UsageSample};

const MULTIPART_BODY_LIMIT_BYTES: usize = 25 * 1024 * 1024;

pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/healthz", get(super::health::healthz))
        .route("/status", get(super::status::status))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/responses", post(responses))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/audio/speech", post(speech))
        .route("/v1/images/generations", post(image_generations))
        .route(
            "/v1/images/edits",
            post(image_edits).layer(DefaultBodyLimit::max(MULTIPART_BODY_LIMIT_BYTES)),
        )
        .route(
            "/v1/audio/transcriptions",
            post(transcriptions).layer(DefaultBodyLimit::max(MULTIPART_BODY_LIMIT_BYTES)),
        )
        .route("/v1beta/models/{model_with_action}", post(gemini))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

async fn chat_completions(
    state: State<Arc<RouterState>>,
    key: Extension<AuthenticatedKey>,
    req_id: Extension<RequestId>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    dispatch_json(state, key, req_id, Dialect::Chat, body).await
}

async fn messages(
    state: State<Arc<RouterState>>,
    key: Extension<AuthenticatedKey>,
    req_id: Extension<RequestId>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    dispatch_json(state, key, req_id, Dialect::Messages, body).await
}

async fn responses(
    state: State<Arc<RouterState>>,
    key: Extension<AuthenticatedKey>,
    req_id: Extension<RequestId>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    dispatch_json(state, key, req_id, Dialect::Responses, body).await
}

async fn embeddings(
    state: State<Arc<RouterState>>,
    key: Extension<AuthenticatedKey>,
    req_id: Extension<RequestId>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    dispatch_json(state, key, req_id, Dialect::Embeddings, body).await
}

async fn speech(
    state: State<Arc<RouterState>>,
    key: Extension<AuthenticatedKey>,
    req_id: Extension<RequestId>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    dispatch_json(state, key, req_id, Dialect::Speech, body).await
}

async fn image_generations(
    state: State<Arc<RouterState>>,
    key: Extension<AuthenticatedKey>,
    req_id: Extension<RequestId>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    dispatch_json(state, key, req_id, Dialect::Images, body).await
}

/// `model:action` where `action` is `generateContent` or `streamGenerateContent`
/// — the alias id is the part before the colon.
async fn gemini(
    state: State<Arc<RouterState>>,
    key: Extension<AuthenticatedKey>,
    req_id: Extension<RequestId>,
    Path(model_with_action): Path<String>,
    Json(mut body): Json<Value>,
) -> impl IntoResponse {
    let alias_id = model_with_action.split(':').next().unwrap_or(&model_with_action).to_string();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), json!(alias_id));
    }
    if model_with_action.ends_with("streamGenerateContent") {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), json!(true));
        }
    }
    dispatch_json(state, key, req_id, Dialect::Gemini, body).await
}

/// Shared implementation for every JSON-bodied dialect: quota check →
/// dispatch (buffered or streaming) → usage/debug accounting.
async fn dispatch_json(
    State(state): State<Arc<RouterState>>,
    Extension(auth): Extension<AuthenticatedKey>,
    Extension(request_id): Extension<RequestId>,
    incoming_dialect: Dialect,
    body: Value,
) -> axum::response::Response {
    let config = state.config();
    let Some(alias_id) = body.get("model").and_then(|m| m.as_str()).map(str::to_string) else {
        return GatewayError::ConfigInvalid("request body missing `model` field".to_string()).into_response();
    };
    let is_stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let quota_def = auth.key.quota.as_deref().and_then(|q| config.user_quotas.get(q));
    if let Some(check) = state.quota.check(&auth.key.name, auth.key.quota.as_deref().unwrap_or(""), quota_def).await {
        if !check.allowed {
            return GatewayError::QuotaExceeded {
                quota_name: auth.key.quota.clone().unwrap_or_default(),
                current_usage: check.current_usage,
                limit: check.limit,
                resets_at: Some(check.resets_at),
            }
            .into_response();
        }
    }

    if is_stream {
        return dispatch_streaming(state, auth, quota_def, request_id, incoming_dialect, alias_id, body).await;
    }

    let snapshot = TrackerSnapshot::capture(&state.usage).await;
    let started = Instant::now();
    let start_time = chrono::Utc::now();
    let result = dispatch::dispatch(&state, &config, &alias_id, incoming_dialect, body.clone(), &snapshot).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            let tokens = inspector::extract_usage(outcome.route_info.dialect, &outcome.body);
            let sample = UsageSample::new(&outcome.route_info.provider, &outcome.route_info.model, latency_ms, true)
                .with_tokens((tokens.input + tokens.output + tokens.reasoning + tokens.cached) as u64);
            state.usage.push(sample);

            let cost = selector::calculate_cost(
                outcome.route_info.pricing.as_ref(),
                outcome.route_info.discount,
                tokens.input,
                tokens.output,
                tokens.cached,
                tokens.cache_write,
                &selector::NullPricingLookup,
            );
            record_quota(
                &state,
                &auth,
                quota_def,
                UsageCost { input: tokens.input, output: tokens.output, reasoning: tokens.reasoning, cached: tokens.cached, cache_write: tokens.cache_write },
            )
            .await;

            state.store.save_usage(UsageRecord {
                request_id: request_id.0.clone(),
                date: start_time,
                source_ip: None,
                api_key: usage_key_name(&auth),
                incoming_api_type: incoming_dialect.as_str().to_string(),
                provider: outcome.route_info.provider.clone(),
                incoming_model_alias: outcome.route_info.canonical_alias.clone(),
                selected_model_name: outcome.route_info.model.clone(),
                outgoing_api_type: outcome.route_info.dialect.as_str().to_string(),
                tokens_input: tokens.input,
                tokens_output: tokens.output,
                tokens_reasoning: tokens.reasoning,
                tokens_cached: tokens.cached,
                start_time,
                duration_ms: latency_ms,
                is_streamed: false,
                response_status: "success".to_string(),
                cost,
            });

            state.debug.insert(
                request_id.0.clone(),
                DebugEntry {
                    raw_request: body,
                    transformed_request: if outcome.bypass_transformation { Value::Null } else { outcome.outgoing_body.clone() },
                    raw_response: outcome.raw_body.clone().unwrap_or_else(|| outcome.body.clone()),
                    transformed_response: outcome.body.clone(),
                    raw_response_snapshot: Value::Null,
                    transformed_response_snapshot: Value::Null,
                    persist: config.gateway.debug_enabled,
                },
            );
            state.debug.flush_now(&request_id.0);

            (StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK), Json(outcome.body)).into_response()
        }
        Err(err) => {
            let sample = UsageSample::new("unknown", &alias_id, latency_ms, false).with_error(&err.to_string());
            state.usage.push(sample);
            record_quota(&state, &auth, quota_def, UsageCost { input: 1.0, ..Default::default() }).await;

            state.store.save_usage(UsageRecord {
                request_id: request_id.0.clone(),
                date: start_time,
                source_ip: None,
                api_key: usage_key_name(&auth),
                incoming_api_type: incoming_dialect.as_str().to_string(),
                provider: "unknown".to_string(),
                incoming_model_alias: alias_id.clone(),
                selected_model_name: alias_id,
                outgoing_api_type: incoming_dialect.as_str().to_string(),
                tokens_input: 0.0,
                tokens_output: 0.0,
                tokens_reasoning: 0.0,
                tokens_cached: 0.0,
                start_time,
                duration_ms: latency_ms,
                is_streamed: false,
                response_status: "error".to_string(),
                cost: 0.0,
            });

            err.into_response()
        }
    }
}

/// Streaming branch of [`dispatch_json`] — forwards upstream
/// SSE bytes to the client as they arrive while teeing them through a
/// [`StreamInspector`] so usage/debug accounting can run once the stream ends.
async fn dispatch_streaming(
    state: Arc<RouterState>,
    auth: AuthenticatedKey,
    quota_def: Option<&QuotaDefinition>,
    request_id: RequestId,
    incoming_dialect: Dialect,
    alias_id: String,
    body: Value,
) -> axum::response::Response {
    let config = state.config();
    let quota_def = quota_def.cloned();
    let snapshot = TrackerSnapshot::capture(&state.usage).await;
    let started = Instant::now();
    let start_time = chrono::Utc::now();

    let outcome = match dispatch::dispatch_stream(&state, &config, &alias_id, incoming_dialect, body.clone(), &snapshot).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            let sample = UsageSample::new("unknown", &alias_id, latency_ms, false).with_error(&err.to_string());
            state.usage.push(sample);
            record_quota(&state, &auth, quota_def.as_ref(), UsageCost { input: 1.0, ..Default::default() }).await;
            return err.into_response();
        }
    };

    let route_info = outcome.route_info.clone();
    let status = StatusCode::from_u16(outcome.response.status().as_u16()).unwrap_or(StatusCode::OK);
    let debug_enabled = config.gateway.debug_enabled;
    let transformed_request =
        if outcome.bypass_transformation { Value::Null } else { outcome.outgoing_body };

    let ctx = StreamCtx {
        upstream: outcome.response,
        inspector: StreamInspector::new(route_info.dialect),
        state,
        auth,
        quota_def,
        request_id,
        incoming_dialect,
        route_info,
        raw_request: body,
        transformed_request,
        started,
        start_time,
        debug_enabled,
        ttft_ms: None,
    };

    let byte_stream = stream::unfold(ctx, |mut ctx| async move {
        match ctx.upstream.chunk().await {
            Ok(Some(bytes)) => {
                if ctx.ttft_ms.is_none() {
                    ctx.ttft_ms = Some(ctx.started.elapsed().as_millis() as u64);
                }
                ctx.inspector.ingest(&bytes);
                Some((Ok::<bytes::Bytes, std::io::Error>(bytes), ctx))
            }
            Ok(None) => {
                finalize_stream(ctx, "success").await;
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "stream read failed mid-response");
                finalize_stream(ctx, "error").await;
                None
            }
        }
    });

    let mut response = axum::response::Response::new(Body::from_stream(byte_stream));
    *response.status_mut() = status;
    response.headers_mut().insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/event-stream"));
    response.headers_mut().insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    response.headers_mut().insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));
    response
}

/// State threaded through the streaming response's byte-by-byte unfold —
/// carries everything [`finalize_stream`] needs once the upstream body ends
/// (normally or mid-read), without spawning a detached task.
struct StreamCtx {
    upstream: reqwest::Response,
    inspector: StreamInspector,
    state: Arc<RouterState>,
    auth: AuthenticatedKey,
    quota_def: Option<QuotaDefinition>,
    request_id: RequestId,
    incoming_dialect: Dialect,
    route_info: dispatch::RouteInfo,
    raw_request: Value,
    transformed_request: Value,
    started: Instant,
    start_time: chrono::DateTime<chrono::Utc>,
    debug_enabled: bool,
    ttft_ms: Option<u64>,
}

/// Runs usage/quota/debug accounting once a streamed response ends — the
/// streaming counterpart of the buffered path's post-dispatch bookkeeping.
async fn finalize_stream(ctx: StreamCtx, response_status: &str) {
    let latency_ms = ctx.started.elapsed().as_millis() as u64;
    let tokens = inspector::extract_usage(ctx.route_info.dialect, ctx.inspector.snapshot());
    if ctx.inspector.is_truncated() {
        tracing::warn!(request_id = %ctx.request_id.0, "stream inspector snapshot truncated at buffer ceiling");
    }
    let mut sample = UsageSample::new(&ctx.route_info.provider, &ctx.route_info.model, latency_ms, response_status == "success")
        .with_tokens((tokens.input + tokens.output + tokens.reasoning + tokens.cached) as u64);
    if let Some(ttft) = ctx.ttft_ms {
        sample = sample.with_ttft(ttft);
    }
    ctx.state.usage.push(sample);

    let cost = selector::calculate_cost(
        ctx.route_info.pricing.as_ref(),
        ctx.route_info.discount,
        tokens.input,
        tokens.output,
        tokens.cached,
        tokens.cache_write,
        &selector::NullPricingLookup,
    );
    record_quota(
        &ctx.state,
        &ctx.auth,
        ctx.quota_def.as_ref(),
        UsageCost {
            input: tokens.input,
            output: tokens.output,
            reasoning: tokens.reasoning,
            cached: tokens.cached,
            cache_write: tokens.cache_write,
        },
    )
    .await;

    ctx.state.store.save_usage(UsageRecord {
        request_id: ctx.request_id.0.clone(),
        date: ctx.start_time,
        source_ip: None,
        api_key: usage_key_name(&ctx.auth),
        incoming_api_type: ctx.incoming_dialect.as_str().to_string(),
        provider: ctx.route_info.provider.clone(),
        incoming_model_alias: ctx.route_info.canonical_alias.clone(),
        selected_model_name: ctx.route_info.model.clone(),
        outgoing_api_type: ctx.route_info.dialect.as_str().to_string(),
        tokens_input: tokens.input,
        tokens_output: tokens.output,
        tokens_reasoning: tokens.reasoning,
        tokens_cached: tokens.cached,
        start_time: ctx.start_time,
        duration_ms: latency_ms,
        is_streamed: true,
        response_status: response_status.to_string(),
        cost,
    });

    let request_id = ctx.request_id.0.clone();
    let persist = ctx.debug_enabled;
    let bypass = ctx.transformed_request.is_null();
    let snapshot = ctx.inspector.into_snapshot();
    ctx.state.debug.insert(
        request_id.clone(),
        DebugEntry {
            raw_request: ctx.raw_request,
            transformed_request: ctx.transformed_request,
            raw_response: Value::Null,
            transformed_response: Value::Null,
            raw_response_snapshot: if bypass { snapshot.clone() } else { Value::Null },
            transformed_response_snapshot: if bypass { Value::Null } else { snapshot },
            persist,
        },
    );
    ctx.state.debug.flush_now(&request_id);
}

/// Identifies the caller in persisted [`UsageRecord`]s by key *name*, not
/// secret — folding in the optional `Bearer secret:attribution` suffix so
/// per-caller cost breakdowns survive a key shared across sub-callers.
fn usage_key_name(auth: &AuthenticatedKey) -> String {
    match &auth.attribution {
        Some(attribution) => format!("{}:{attribution}", auth.key.name),
        None => auth.key.name.clone(),
    }
}

async fn record_quota(
    state: &RouterState,
    auth: &AuthenticatedKey,
    quota_def: Option<&QuotaDefinition>,
    cost: UsageCost,
) {
    if quota_def.is_some() {
        state.quota.record(&auth.key.name, auth.key.quota.as_deref().unwrap_or(""), quota_def, cost).await;
    }
}

/// Multipart dialects (transcription, image edit) bypass the JSON
/// transformer pipeline entirely — the alias is resolved from the `model`
/// form field and the multipart body is forwarded to the provider verbatim,
/// matching the pass-through contract for dialects with no unified
/// schema to translate through.
async fn forward_multipart(
    state: Arc<RouterState>,
    config: &crate::config::Config,
    incoming_dialect: Dialect,
    mut multipart: Multipart,
) -> axum::response::Response {
    let mut alias_id: Option<String> = None;
    let mut form = reqwest::multipart::Form::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(err) => return GatewayError::ConfigInvalid(err.to_string()).into_response(),
        };
        let name = field.name().unwrap_or("").to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = match field.bytes().await {
            Ok(b) => b,
            Err(err) => return GatewayError::ConfigInvalid(err.to_string()).into_response(),
        };

        if name == "model" {
            alias_id = Some(String::from_utf8_lossy(&bytes).to_string());
        }

        let mut part = reqwest::multipart::Part::bytes(bytes.to_vec());
        if let Some(ct) = &content_type {
            part = part.mime_str(ct).unwrap_or_else(|_| reqwest::multipart::Part::bytes(bytes.to_vec()));
        }
        if let Some(fname) = file_name {
            part = part.file_name(fname);
        }
        form = form.part(name, part);
    }

    let Some(alias_id) = alias_id else {
        return GatewayError::ConfigInvalid("multipart body missing `model` field".to_string()).into_response();
    };

    let candidates = match crate::router::resolve(config, &alias_id, incoming_dialect) {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };
    let Some(candidate) = candidates.first() else {
        return GatewayError::NoTargets(alias_id).into_response();
    };
    let provider = candidate.provider_config(config);
    let Some(base) = provider.api_base_url.resolve(incoming_dialect) else {
        return GatewayError::ConfigInvalid(format!("provider `{}` has no base URL", candidate.provider_id))
            .into_response();
    };
    let endpoint = match incoming_dialect {
        Dialect::Transcriptions => "/v1/audio/transcriptions",
        _ => "/v1/images/edits",
    };
    let url = format!("{base}{endpoint}");

    let mut req = state.http_client.post(&url).multipart(form);
    if let Some(key) = &provider.api_key {
        req = req.bearer_auth(key);
    }

    match req.send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            (status, Json(body)).into_response()
        }
        Err(err) => GatewayError::ProviderTransient { provider: candidate.provider_id.clone(), detail: err.to_string() }
            .into_response(),
    }
}

async fn transcriptions(State(state): State<Arc<RouterState>>, multipart: Multipart) -> impl IntoResponse {
    let config = state.config();
    forward_multipart(state.clone(), &config, Dialect::Transcriptions, multipart).await
}

async fn image_edits(State(state): State<Arc<RouterState>>, multipart: Multipart) -> impl IntoResponse {
    let config = state.config();
    forward_multipart(state.clone(), &config, Dialect::Images, multipart).await
}

/// `GET /v1/models` — every alias (canonical + additional) as an OpenAI
/// model object, `owned_by: "plexus"`.
async fn list_models(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let config = state.config();
    let created = chrono::Utc::now().timestamp();

    let mut data: Vec<Value> = Vec::new();
    for alias in &config.models {
        data.push(json!({ "id": alias.id, "object": "model", "created": created, "owned_by": "plexus" }));
        for additional in &alias.additional_aliases {
            data.push(json!({ "id": additional, "object": "model", "created": created, "owned_by": "plexus" }));
        }
    }

    Json(json!({ "object": "list", "data": data }))
}
