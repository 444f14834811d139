//! Management API — operator-facing config and quota control,
//! served on its own port and gated by [`super::admin_auth`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{Config, QuotaDefinition};
use crate::error::GatewayError;
use crate::router::RouterState;

pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/metrics", get(super::metrics::metrics))
        .route("/v0/management/config", get(get_config).post(post_config))
        .route("/v0/management/models", delete(delete_all_models))
        .route("/v0/management/models/{alias_id}", delete(delete_model))
        .route("/v0/management/providers/{id}", delete(delete_provider))
        .route("/v0/management/usage/recent", get(recent_usage))
        .route("/v0/management/quota/clear", post(quota_clear))
        .route("/v0/management/quota/status/{key}", get(quota_status))
        .route("/v0/management/user-quotas", get(list_user_quotas).post(create_user_quota))
        .route(
            "/v0/management/user-quotas/{name}",
            get(get_user_quota).patch(patch_user_quota).delete(delete_user_quota),
        )
        .with_state(state)
}

/// `GET /v0/management/config` — the full config document (secrets are
/// stored in the document itself via `${VAR}` substitution, so unlike the
/// base gateway's redacted view this returns the config as loaded — the
/// management port is trusted/internal-only).
async fn get_config(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json((*state.config()).clone())
}

/// `POST /v0/management/config` — validate, write atomically, reload.
async fn post_config(State(state): State<Arc<RouterState>>, Json(new_config): Json<Config>) -> impl IntoResponse {
    if let Err(err) = new_config.validate() {
        return GatewayError::ConfigInvalid(err.to_string()).into_response();
    }

    let yaml = match serde_yaml::to_string(&new_config) {
        Ok(y) => y,
        Err(err) => return GatewayError::ConfigInvalid(err.to_string()).into_response(),
    };

    let tmp_path = state.config_path.with_extension("yaml.tmp");
    if let Err(err) = std::fs::write(&tmp_path, &yaml) {
        return GatewayError::Other(err.into()).into_response();
    }
    if let Err(err) = std::fs::rename(&tmp_path, &state.config_path) {
        return GatewayError::Other(err.into()).into_response();
    }

    state.replace_config(Arc::new(new_config));
    (StatusCode::OK, Json(json!({ "status": "reloaded" }))).into_response()
}

/// `DELETE /v0/management/models` — drop every alias.
async fn delete_all_models(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let mut config = (*state.config()).clone();
    let removed = config.models.len();
    config.models.clear();
    state.replace_config(Arc::new(config));
    Json(json!({ "removed": removed }))
}

/// `DELETE /v0/management/models/:aliasId` — drop one alias by canonical id.
async fn delete_model(State(state): State<Arc<RouterState>>, Path(alias_id): Path<String>) -> impl IntoResponse {
    let mut config = (*state.config()).clone();
    let before = config.models.len();
    config.models.retain(|a| a.id != alias_id);
    if config.models.len() == before {
        return GatewayError::AliasUnknown(alias_id).into_response();
    }
    state.replace_config(Arc::new(config));
    (StatusCode::OK, Json(json!({ "removed": alias_id }))).into_response()
}

#[derive(Deserialize)]
struct CascadeQuery {
    #[serde(default)]
    cascade: bool,
}

/// `DELETE /v0/management/providers/{id}?cascade=true` — drop a provider;
/// with `cascade=true` also drop any alias target referencing it, and any
/// alias left with zero targets.
async fn delete_provider(
    State(state): State<Arc<RouterState>>,
    Path(id): Path<String>,
    Query(q): Query<CascadeQuery>,
) -> impl IntoResponse {
    let mut config = (*state.config()).clone();
    if config.providers.remove(&id).is_none() {
        return GatewayError::ConfigInvalid(format!("unknown provider `{id}`")).into_response();
    }

    if q.cascade {
        for alias in &mut config.models {
            alias.targets.retain(|t| t.provider != id);
        }
        config.models.retain(|a| !a.targets.is_empty());
    }

    state.replace_config(Arc::new(config));
    (StatusCode::OK, Json(json!({ "removed": id, "cascaded": q.cascade }))).into_response()
}

#[derive(Deserialize)]
struct RecentUsageQuery {
    #[serde(default = "default_recent_usage_limit")]
    limit: usize,
}

fn default_recent_usage_limit() -> usize {
    100
}

/// `GET /v0/management/usage/recent?limit=N` — the last N persisted
/// [`UsageRecord`](crate::store::UsageRecord)s, newest first.
async fn recent_usage(
    State(state): State<Arc<RouterState>>,
    Query(q): Query<RecentUsageQuery>,
) -> impl IntoResponse {
    Json(state.store.recent_usage(q.limit))
}

async fn quota_clear(State(state): State<Arc<RouterState>>, Json(body): Json<Value>) -> impl IntoResponse {
    let Some(key_name) = body.get("keyName").and_then(|v| v.as_str()) else {
        return GatewayError::ConfigInvalid("`keyName` is required".to_string()).into_response();
    };
    state.quota.clear(key_name);
    state.cooldown.clear(None, None, None);
    (StatusCode::OK, Json(json!({ "cleared": key_name }))).into_response()
}

async fn quota_status(State(state): State<Arc<RouterState>>, Path(key): Path<String>) -> impl IntoResponse {
    let config = state.config();
    let Some(key_config) = config.keys.iter().find(|k| k.name == key) else {
        return GatewayError::ConfigInvalid(format!("unknown key `{key}`")).into_response();
    };
    let quota_def = key_config.quota.as_deref().and_then(|q| config.user_quotas.get(q));
    match state.quota.check(&key, key_config.quota.as_deref().unwrap_or(""), quota_def).await {
        Some(result) => Json(json!({
            "key": key,
            "quota": key_config.quota,
            "currentUsage": result.current_usage,
            "limit": result.limit,
            "remaining": result.remaining,
            "resetsAt": result.resets_at,
        }))
        .into_response(),
        None => Json(json!({ "key": key, "quota": Value::Null })).into_response(),
    }
}

async fn list_user_quotas(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(state.config().user_quotas.clone())
}

async fn get_user_quota(State(state): State<Arc<RouterState>>, Path(name): Path<String>) -> impl IntoResponse {
    match state.config().user_quotas.get(&name) {
        Some(q) => Json(q.clone()).into_response(),
        None => GatewayError::ConfigInvalid(format!("unknown quota `{name}`")).into_response(),
    }
}

async fn create_user_quota(
    State(state): State<Arc<RouterState>>,
    Json(body): Json<NamedQuota>,
) -> impl IntoResponse {
    let mut config = (*state.config()).clone();
    config.user_quotas.insert(body.name.clone(), body.definition);
    if let Err(err) = config.validate() {
        return GatewayError::ConfigInvalid(err.to_string()).into_response();
    }
    state.replace_config(Arc::new(config));
    (StatusCode::CREATED, Json(json!({ "name": body.name }))).into_response()
}

async fn patch_user_quota(
    State(state): State<Arc<RouterState>>,
    Path(name): Path<String>,
    Json(definition): Json<QuotaDefinition>,
) -> impl IntoResponse {
    let mut config = (*state.config()).clone();
    if !config.user_quotas.contains_key(&name) {
        return GatewayError::ConfigInvalid(format!("unknown quota `{name}`")).into_response();
    }
    config.user_quotas.insert(name.clone(), definition);
    if let Err(err) = config.validate() {
        return GatewayError::ConfigInvalid(err.to_string()).into_response();
    }
    state.replace_config(Arc::new(config));
    (StatusCode::OK, Json(json!({ "name": name }))).into_response()
}

async fn delete_user_quota(State(state): State<Arc<RouterState>>, Path(name): Path<String>) -> impl IntoResponse {
    let mut config = (*state.config()).clone();
    if config.user_quotas.remove(&name).is_none() {
        return GatewayError::ConfigInvalid(format!("unknown quota `{name}`")).into_response();
    }
    state.replace_config(Arc::new(config));
    (StatusCode::OK, Json(json!({ "removed": name }))).into_response()
}

#[derive(Deserialize)]
struct NamedQuota {
    name: String,
    #[serde(flatten)]
    definition: QuotaDefinition,
}
