//! Client API key authentication.
//!
//! Every dialect endpoint requires a key, accepted via any of:
//! `Authorization: Bearer <secret>[:<attribution>]`, `x-api-key: <secret>`,
//! `x-goog-api-key: <secret>` (Gemini's native header), or `?key=<secret>`
//! (Gemini's native query param). The resolved [`KeyConfig`] is injected as
//! a request extension so handlers can read the caller's quota assignment
//! without re-parsing credentials.
//!
//! # Security note
//! Keys are compared with `==`. This is intentionally not a constant-time
//! comparison — see `client_auth` in the base gateway for the same call.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::config::KeyConfig;
use crate::router::RouterState;

/// Request extension set by [`client_auth_middleware`] — the matched key,
/// plus an optional free-text attribution suffix (`Bearer secret:attribution`).
#[derive(Clone, Debug)]
pub struct AuthenticatedKey {
    pub key: KeyConfig,
    pub attribution: Option<String>,
}

fn extract_secret(req: &Request) -> Option<(String, Option<String>)> {
    if let Some(bearer) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return match bearer.split_once(':') {
            Some((secret, attribution)) => Some((secret.to_string(), Some(attribution.to_string()))),
            None => Some((bearer.to_string(), None)),
        };
    }
    if let Some(key) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some((key.to_string(), None));
    }
    if let Some(key) = req.headers().get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some((key.to_string(), None));
    }
    let query = req.uri().query().unwrap_or("");
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("key=") {
            return Some((value.to_string(), None));
        }
    }
    None
}

pub async fn client_auth_middleware(State(state): State<Arc<RouterState>>, mut req: Request, next: Next) -> Response {
    let config = state.config();

    let Some((secret, attribution)) = extract_secret(&req) else {
        return unauthorized();
    };

    match config.key_by_secret(&secret) {
        Some(key) => {
            req.extensions_mut().insert(AuthenticatedKey { key: key.clone(), attribution });
            next.run(req).await
        }
        None => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"plexus\"")],
        "valid API key required",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::Request as HttpRequest,
        middleware,
        routing::get,
        Extension, Router,
    };
    use std::path::PathBuf;
    use tower::ServiceExt;

    use crate::config::{Config, GatewayConfig};
    use crate::store::JsonFileStore;

    fn state_with_keys(keys: Vec<KeyConfig>) -> Arc<RouterState> {
        let config = Config {
            gateway: GatewayConfig::default(),
            providers: Default::default(),
            models: vec![],
            keys,
            admin_key: None,
            user_quotas: Default::default(),
            performance_exploration_rate: 0.05,
            latency_exploration_rate: None,
        };
        let path = std::env::temp_dir().join(format!("plexus-client-auth-test-{}.json", uuid::Uuid::new_v4()));
        let store = Arc::new(JsonFileStore::open(path, 10).unwrap());
        Arc::new(RouterState::new(Arc::new(config), PathBuf::default(), store))
    }

    async fn echo_key(key: Option<Extension<AuthenticatedKey>>) -> String {
        key.map(|Extension(AuthenticatedKey { key, .. })| key.name).unwrap_or_else(|| "none".to_owned())
    }

    fn app(state: Arc<RouterState>) -> Router {
        Router::new()
            .route("/", get(echo_key))
            .layer(middleware::from_fn_with_state(state.clone(), client_auth_middleware))
            .with_state(state)
    }

    fn key(name: &str, secret: &str) -> KeyConfig {
        KeyConfig { name: name.into(), secret: secret.into(), quota: None, comment: None }
    }

    #[tokio::test]
    async fn bearer_secret_resolves_key() {
        let state = state_with_keys(vec![key("alice", "sk-1")]);
        let resp = app(state)
            .oneshot(HttpRequest::get("/").header("authorization", "Bearer sk-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 256).await.unwrap();
        assert_eq!(&body[..], b"alice");
    }

    #[tokio::test]
    async fn bearer_with_attribution_suffix_still_resolves() {
        let state = state_with_keys(vec![key("alice", "sk-1")]);
        let resp = app(state)
            .oneshot(
                HttpRequest::get("/")
                    .header("authorization", "Bearer sk-1:agent-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn x_api_key_header_resolves_key() {
        let state = state_with_keys(vec![key("bob", "sk-2")]);
        let resp = app(state)
            .oneshot(HttpRequest::get("/").header("x-api-key", "sk-2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn gemini_query_param_resolves_key() {
        let state = state_with_keys(vec![key("carol", "sk-3")]);
        let resp = app(state).oneshot(HttpRequest::get("/?key=sk-3").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_key_returns_401() {
        let state = state_with_keys(vec![key("alice", "sk-1")]);
        let resp = app(state).oneshot(HttpRequest::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_secret_returns_401() {
        let state = state_with_keys(vec![key("alice", "sk-1")]);
        let resp = app(state)
            .oneshot(HttpRequest::get("/").header("x-api-key", "wrong").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
