//! Shared bearer-token middleware (§4.8).
//!
//! Accepts the token from either an `X-Auth-Token` header or a `token`
//! query parameter — the query parameter exists because a browser
//! `EventSource` cannot set request headers, and `/api/stream/:taskId` is
//! consumed that way. Auth is disabled entirely when no token is
//! configured (dev mode, per [`swarm_domain::config::ServerConfig`]).

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn require_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.server.auth_token.as_deref() else {
        return next.run(request).await;
    };

    let header_token = request
        .headers()
        .get("X-Auth-Token")
        .and_then(|v| v.to_str().ok());

    let supplied = header_token.or(query.token.as_deref());
    if supplied == Some(expected) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "invalid or missing auth token").into_response()
    }
}
