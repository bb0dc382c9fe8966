//! The four HTTP handlers (C8, §4.8):
//!
//! - `POST /api/start_task`   — admit a task, spawn its background runner
//! - `GET  /api/stream/:id`   — SSE drain of the task's event queue
//! - `POST /api/completion`   — single-shot fast-tier inline completion
//! - `GET  /health`           — liveness probe

use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use swarm_domain::state::{FileContext, Mode};
use swarm_domain::task::TaskId;
use swarm_domain::Error;
use swarm_providers::Complexity;

use crate::runtime::StartTaskRequest;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/start_task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskBody {
    pub user_input: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub file_context: Option<FileContext>,
    #[serde(default)]
    pub workspace_root: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskResponse {
    pub task_id: String,
    pub thread_id: String,
}

pub async fn start_task(
    State(state): State<AppState>,
    Json(body): Json<StartTaskBody>,
) -> impl IntoResponse {
    let req = StartTaskRequest {
        user_input: body.user_input,
        thread_id: body.thread_id,
        file_context: body.file_context,
        workspace_root: body.workspace_root,
        mode: body.mode,
    };

    match state.tasks.start_task(req) {
        Ok((task_id, thread_id)) => Json(StartTaskResponse {
            task_id: task_id.to_string(),
            thread_id,
        })
        .into_response(),
        Err(Error::AdmissionRefused) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "server busy, at capacity"})),
        )
            .into_response(),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/stream/:taskId
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Poll interval for the receiver loop: long enough to avoid busy-spinning,
/// short enough that `touch()` keeps the stale-sweeper's clock current even
/// during a quiet stretch of the workflow.
const STREAM_POLL: Duration = Duration::from_secs(1);

pub async fn stream(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let Ok(task_id) = task_id.parse::<TaskId>() else {
        return (axum::http::StatusCode::BAD_REQUEST, "invalid task id").into_response();
    };
    let Some(mut rx) = state.tasks.take_receiver(task_id) else {
        return (axum::http::StatusCode::NOT_FOUND, "unknown or already-streamed task").into_response();
    };

    let hub = state.tasks.clone();
    let body = async_stream::stream! {
        loop {
            match tokio::time::timeout(STREAM_POLL, rx.recv()).await {
                Ok(Some(Some(event))) => {
                    hub.touch(task_id);
                    let data = serde_json::to_string(&event.data).unwrap_or_default();
                    yield Ok::<_, std::convert::Infallible>(
                        Event::default().event(event.kind).data(data),
                    );
                }
                Ok(Some(None)) | Ok(None) => break,
                Err(_elapsed) => {
                    hub.touch(task_id);
                }
            }
        }
    };

    Sse::new(body)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/completion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionBody {
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    pub file_path: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub completion: String,
}

fn looks_like_secret_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let name = lower.rsplit('/').next().unwrap_or(&lower);
    name == ".env" || name.starts_with(".env.") || name.starts_with("secret")
}

pub async fn completion(
    State(state): State<AppState>,
    Json(body): Json<CompletionBody>,
) -> impl IntoResponse {
    if looks_like_secret_path(&body.file_path) {
        return Json(CompletionResponse { completion: String::new() });
    }

    let prompt = format!(
        "Complete the following {} code. Return only the missing text, \
         no explanation, no fences.\n\n--- PREFIX ---\n{}\n--- SUFFIX ---\n{}",
        body.language.as_deref().unwrap_or("plaintext"),
        body.prefix,
        body.suffix,
    );
    let contents = Value::Array(vec![serde_json::json!({
        "role": "user",
        "parts": [{"text": prompt}],
    })]);

    let completion = match state
        .llm
        .call(&state.config.providers.gemini_model_name, contents, None, Complexity::Simple, None)
        .await
    {
        Ok((text, _usage)) => text,
        Err(e) => {
            tracing::warn!(error = %e, "inline completion call failed");
            String::new()
        }
    };

    Json(CompletionResponse { completion })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_paths_are_refused() {
        assert!(looks_like_secret_path(".env"));
        assert!(looks_like_secret_path("/repo/.env.local"));
        assert!(looks_like_secret_path("config/secrets.yaml"));
        assert!(!looks_like_secret_path("src/main.rs"));
    }
}
