//! `AppState` construction and background-task spawning extracted from
//! `main.rs`, grounded on the source's `build_app_state`/`spawn_background_tasks`
//! split: one function wires every subsystem and returns a ready [`AppState`],
//! the other starts the long-running maintenance loops once the HTTP
//! listener is about to come up.

use std::sync::Arc;
use std::time::Duration;

use swarm_domain::config::Config;
use swarm_providers::{GeminiClient, KeyRotator, LlmClient};
use swarm_sandbox::SandboxRegistry;

use crate::runtime::TaskHub;
use crate::state::AppState;

/// Validate config, initialize every subsystem, and return a fully-wired
/// [`AppState`]. Fatal only on a startup-blocking issue (no credentials) —
/// matches the taxonomy's `FatalStartup` variant and the process exit-code
/// contract (§6): callers of this function translate an `Err` into a
/// non-zero exit.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let rotator = Arc::new(KeyRotator::new(config.providers.gemini_api_keys.clone())?);
    tracing::info!(key_count = rotator.len(), "credential rotator ready");

    let llm: Arc<dyn LlmClient> = Arc::new(GeminiClient::new(config.providers.base_url.clone(), rotator)?);
    tracing::info!(model = %config.providers.gemini_model_name, "LLM client ready");

    let sandboxes = Arc::new(SandboxRegistry::new(config.sandbox.container_name_prefix.clone()));
    sandboxes.cleanup_orphans().await;
    tracing::info!(prefix = %config.sandbox.container_name_prefix, "sandbox registry ready");

    let tasks = TaskHub::new(&config, llm.clone(), sandboxes.clone());
    tracing::info!(
        max_concurrent = config.tasks.clamped().max_concurrent,
        "task hub ready"
    );

    Ok(AppState { config, llm, sandboxes, tasks })
}

/// Spawn the long-running background tokio tasks: the parent-liveness
/// monitor (suicide pact, §6) and the stale-stream sweeper (§4.7). Call
/// this after [`build_app_state`], just before the HTTP listener starts.
pub fn spawn_background_tasks(state: &AppState) {
    spawn_liveness_monitor(state);
    spawn_stale_sweeper(state);
    tracing::info!("background tasks spawned");
}

/// Watch the parent process (`HOST_PID`) every 2s; on its death, force-clean
/// every tracked sandbox and exit the process with code 0 — a clean part of
/// the documented exit-code contract, not a crash.
fn spawn_liveness_monitor(state: &AppState) {
    let host_pid = state.config.server.host_pid;
    if host_pid == 0 {
        tracing::info!("HOST_PID not set, liveness monitor disabled");
        return;
    }

    let sandboxes = state.sandboxes.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            interval.tick().await;
            if !process_is_alive(host_pid) {
                tracing::warn!(host_pid, "parent process gone, shutting down");
                sandboxes.shutdown().await;
                std::process::exit(0);
            }
        }
    });
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs no-op permission/existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    true
}

/// Every 10 minutes, purge event queues idle past an hour and unregister
/// their sandboxes (§4.7's stale-stream sweeper).
fn spawn_stale_sweeper(state: &AppState) {
    let tasks = state.tasks.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            tasks.sweep_stale(Duration::from_secs(3600)).await;
        }
    });
}
