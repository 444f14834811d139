//! Public status endpoint (`GET /status`, client port).
//!
//! Safe to expose publicly without authentication — gateway liveness and
//! aggregate metrics only. No provider names, model names, or alias ids.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::router::RouterState;

pub async fn status(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();
    let stats = state.usage.stats().await;
    let error_rate =
        if stats.total_requests == 0 { 0.0 } else { stats.error_count as f64 / stats.total_requests as f64 };

    let config = state.config();
    let unconfigured = config
        .providers
        .values()
        .filter(|p| {
            let key_missing = p.api_key.as_deref().map(str::is_empty).unwrap_or(true);
            key_missing && p.oauth_provider.is_none()
        })
        .count();
    let ready = unconfigured == 0;

    Json(json!({
        "status": "ok",
        "ready": ready,
        "uptime_secs": uptime_secs,
        "requests": {
            "total": stats.total_requests,
            "errors": stats.error_count,
            "error_rate": error_rate,
            "avg_latency_ms": stats.avg_latency_ms,
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use crate::config::{Config, GatewayConfig};
    use crate::router::RouterState;
    use crate::store::JsonFileStore;
    use crate::usage::UsageSample;

    fn minimal_state() -> Arc<RouterState> {
        let config = Config {
            gateway: GatewayConfig::default(),
            providers: Default::default(),
            models: vec![],
            keys: vec![],
            admin_key: None,
            user_quotas: Default::default(),
            performance_exploration_rate: 0.05,
            latency_exploration_rate: None,
        };
        let path = std::env::temp_dir().join(format!("plexus-status-test-{}.json", uuid::Uuid::new_v4()));
        let store = Arc::new(JsonFileStore::open(path, 100).unwrap());
        Arc::new(RouterState::new(Arc::new(config), PathBuf::default(), store))
    }

    #[tokio::test]
    async fn status_returns_ok_with_zero_metrics_on_fresh_state() {
        let app = crate::api::client::router(minimal_state());
        let resp = app.oneshot(Request::get("/status").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["requests"]["total"], 0);
        assert_eq!(json["requests"]["error_rate"], 0.0);
    }

    #[tokio::test]
    async fn status_counts_errors_and_computes_error_rate() {
        let state = minimal_state();
        state.usage.push(UsageSample::new("a", "m", 50, true));
        state.usage.push(UsageSample::new("a", "m", 80, false));
        state.usage.push(UsageSample::new("a", "m", 60, false));

        let app = crate::api::client::router(Arc::clone(&state));
        let resp = app.oneshot(Request::get("/status").body(Body::empty()).unwrap()).await.unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["requests"]["total"], 3);
        assert_eq!(json["requests"]["errors"], 2);
        let rate = json["requests"]["error_rate"].as_f64().unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn status_response_contains_no_provider_or_model_names() {
        let state = minimal_state();
        state.usage.push(UsageSample::new("secret-provider", "secret-model", 50, true));

        let app = crate::api::client::router(Arc::clone(&state));
        let resp = app.oneshot(Request::get("/status").body(Body::empty()).unwrap()).await.unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(!body.contains("secret-provider"));
        assert!(!body.contains("secret-model"));
    }
}
