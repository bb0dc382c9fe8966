pub mod auth;
pub mod tasks;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router (§4.8): `start_task` and `stream` sit behind
/// the shared bearer-token middleware; `completion` and `health` are
/// public, matching the source's split between session-bearing and
/// diagnostic/utility routes.
pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/api/start_task", post(tasks::start_task))
        .route("/api/stream/:task_id", get(tasks::stream))
        .route_layer(middleware::from_fn_with_state(state, auth::require_token));

    let public = Router::new()
        .route("/api/completion", post(tasks::completion))
        .route("/health", get(tasks::health));

    public.merge(protected)
}
