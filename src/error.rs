//! The closed error taxonomy for request handling.
//!
//! Every fallible operation in the request path returns `Result<T, GatewayError>`.
//! axum handlers return `Result<_, GatewayError>` directly and `?`-propagate —
//! [`IntoResponse`] maps each variant to the HTTP shape clients are meant to see.
//! Anything that doesn't fit the closed set (startup I/O, unexpected parse
//! failures) falls into `Other` via the blanket [`From`] impl, same as the
//! original single-variant `AppError` did.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Rejected at config load/validate, or by a management-API `POST`.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The client asked for an alias id that doesn't resolve.
    #[error("unknown model alias `{0}`")]
    AliasUnknown(String),

    /// An alias resolved, but none of its targets are enabled.
    #[error("alias `{0}` has no enabled targets")]
    NoTargets(String),

    /// Every target for this alias is presently in cooldown.
    #[error("all targets for alias `{0}` are cooling down")]
    AllTargetsCoolingDown(String),

    /// A dialect transform raised — a bug in the gateway, not the upstream.
    #[error("request/response transform failed: {0}")]
    TransformFailed(String),

    /// Classified as retryable: 5xx, 408, 429, network error, or timeout.
    /// Carries enough to mark a cooldown and move to the next candidate.
    #[error("provider `{provider}` transient failure: {detail}")]
    ProviderTransient { provider: String, detail: String },

    /// Any other 4xx from upstream — passed through verbatim, no failover.
    #[error("provider `{provider}` returned {status}: {body}")]
    ProviderFatal {
        provider: String,
        status: StatusCode,
        body: serde_json::Value,
    },

    /// A quota check rejected the request.
    #[error("quota `{quota_name}` exceeded: {current_usage}/{limit}")]
    QuotaExceeded {
        quota_name: String,
        current_usage: f64,
        limit: f64,
        resets_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Missing or unrecognized client credential.
    #[error("invalid or missing credentials")]
    AuthInvalid,

    /// Catch-all for anything outside the closed taxonomy above — background
    /// I/O, unexpected parse failures at startup, etc.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            Self::ConfigInvalid(detail) => {
                tracing::warn!(%detail, "rejected invalid configuration");
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": { "type": "config_invalid", "message": detail } })),
                )
                    .into_response()
            }
            Self::AliasUnknown(id) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": { "type": "alias_unknown", "message": format!("unknown model alias `{id}`") } })),
            )
                .into_response(),
            Self::NoTargets(id) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": { "type": "no_targets", "message": format!("alias `{id}` has no enabled targets") } })),
            )
                .into_response(),
            Self::AllTargetsCoolingDown(id) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": { "type": "all_targets_cooling_down", "message": format!("all targets for alias `{id}` are cooling down") } })),
            )
                .into_response(),
            Self::TransformFailed(detail) => {
                tracing::error!(%detail, "transform bug");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": { "type": "transform_failed", "message": detail } })),
                )
                    .into_response()
            }
            Self::ProviderTransient { provider, detail } => {
                tracing::warn!(%provider, %detail, "provider transient failure escaped to client");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": { "type": "provider_transient", "provider": provider, "message": detail } })),
                )
                    .into_response()
            }
            Self::ProviderFatal { provider, status, body } => {
                tracing::info!(%provider, %status, "provider fatal error passed through");
                (status, Json(json!({ "error": { "type": "provider_fatal", "provider": provider, "body": body } }))).into_response()
            }
            Self::QuotaExceeded { quota_name, current_usage, limit, resets_at } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": {
                        "type": "quota_exceeded",
                        "quota_name": quota_name,
                        "current_usage": current_usage,
                        "limit": limit,
                        "resets_at": resets_at,
                    }
                })),
            )
                .into_response(),
            Self::AuthInvalid => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": { "type": "auth_invalid", "message": "invalid or missing credentials" } })),
            )
                .into_response(),
            Self::Other(err) => {
                tracing::warn!(error = %err, "unclassified handler error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": { "type": "internal", "message": err.to_string() } })),
                )
                    .into_response()
            }
        }
    }
}
