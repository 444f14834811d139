//! Bearer-token authentication for the management API.
//!
//! Every `/v0/management/*` route requires `Authorization: Bearer <adminKey>`.
//! Unlike the base gateway's optional admin token, `adminKey` is a required
//! config field — there is no no-auth fallback here.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::router::RouterState;

pub async fn admin_auth_middleware(State(state): State<Arc<RouterState>>, req: Request, next: Next) -> Response {
    let config = state.config();
    let Some(expected) = &config.admin_key else {
        tracing::warn!("no adminKey configured — rejecting all management requests");
        return unauthorized();
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected.as_str() => next.run(req).await,
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"plexus admin\"")],
        "management API requires Authorization: Bearer <adminKey>",
    )
        .into_response()
}
