//! Task admission, per-task event queues, and the background runner (C7).
//!
//! Grounded on the source's `EventStreamManager` + `run_workflow_background`
//! (an `asyncio.Queue` per task, `None` end-of-stream sentinel, a background
//! coroutine that streams graph state and turns field changes into typed
//! events): here the queue is a `tokio::sync::mpsc::UnboundedReceiver`
//! guarded so only the stream handler can take it, and admission is a
//! process-wide `Semaphore` rather than an unbounded `asyncio.create_task`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use swarm_domain::config::{Config, SandboxConfig};
use swarm_domain::state::{CostStats, FileContext, Mode, ProjectState, WorkflowState};
use swarm_domain::task::TaskId;
use swarm_domain::Error;
use swarm_providers::LlmClient;
use swarm_sandbox::{Sandbox, SandboxRegistry};

use crate::workflow::{self, nodes, WorkflowDeps};

/// One SSE event frame (`event: <type>\ndata: <json>\n\n`, §4.7/§6).
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    pub data: Value,
}

impl TaskEvent {
    fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}

/// Request body for `POST /api/start_task` (§4.8).
#[derive(Debug, Clone, Default)]
pub struct StartTaskRequest {
    pub user_input: String,
    pub thread_id: Option<String>,
    pub file_context: Option<FileContext>,
    pub workspace_root: Option<String>,
    pub mode: Option<Mode>,
}

struct TaskQueue {
    #[allow(dead_code)]
    tx: mpsc::UnboundedSender<Option<TaskEvent>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Option<TaskEvent>>>>,
    last_activity: Mutex<Instant>,
}

/// Process-wide admission + event-bus hub. One instance shared across all
/// HTTP handlers via [`crate::state::AppState`].
pub struct TaskHub {
    admission: Arc<Semaphore>,
    queues: Mutex<HashMap<TaskId, Arc<TaskQueue>>>,
    llm: Arc<dyn LlmClient>,
    model: String,
    sandboxes: Arc<SandboxRegistry>,
    sandbox_config: SandboxConfig,
}

impl TaskHub {
    pub fn new(config: &Config, llm: Arc<dyn LlmClient>, sandboxes: Arc<SandboxRegistry>) -> Arc<Self> {
        Arc::new(Self {
            admission: Arc::new(Semaphore::new(config.tasks.clamped().max_concurrent)),
            queues: Mutex::new(HashMap::new()),
            llm,
            model: config.providers.gemini_model_name.clone(),
            sandboxes,
            sandbox_config: config.sandbox.clone(),
        })
    }

    /// Admit a task: acquire a permit, allocate its event queue, and spawn
    /// the background runner. Fails with [`Error::AdmissionRefused`] at
    /// capacity rather than queuing (§4.7/§5).
    pub fn start_task(self: &Arc<Self>, req: StartTaskRequest) -> Result<(TaskId, String), Error> {
        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::AdmissionRefused)?;

        let task_id = TaskId::new();
        let thread_id = req.thread_id.clone().unwrap_or_else(|| task_id.to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(TaskQueue {
            tx: tx.clone(),
            rx: Mutex::new(Some(rx)),
            last_activity: Mutex::new(Instant::now()),
        });
        self.queues.lock().insert(task_id, queue);

        let hub = self.clone();
        tokio::spawn(async move {
            run_task(
                task_id,
                req,
                hub.llm.clone(),
                hub.model.clone(),
                hub.sandboxes.clone(),
                hub.sandbox_config.clone(),
                tx,
                permit,
            )
            .await;
            hub.queues.lock().remove(&task_id);
        });

        Ok((task_id, thread_id))
    }

    /// Take the receiving half of a task's event queue. Only the first
    /// caller (the SSE stream handler) gets it; later calls see `None`.
    pub fn take_receiver(&self, task_id: TaskId) -> Option<mpsc::UnboundedReceiver<Option<TaskEvent>>> {
        let queues = self.queues.lock();
        let queue = queues.get(&task_id)?;
        let mut rx = queue.rx.lock();
        rx.take()
    }

    pub fn touch(&self, task_id: TaskId) {
        if let Some(queue) = self.queues.lock().get(&task_id) {
            *queue.last_activity.lock() = Instant::now();
        }
    }

    /// Purge queues idle past `max_idle`, unregistering their sandboxes
    /// (the stale-stream sweeper, §4.7).
    pub async fn sweep_stale(&self, max_idle: Duration) {
        let stale: Vec<TaskId> = {
            let queues = self.queues.lock();
            queues
                .iter()
                .filter(|(_, q)| q.last_activity.lock().elapsed() > max_idle)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale {
            self.queues.lock().remove(&id);
            self.sandboxes.unregister(&id.to_string()).await;
            tracing::info!(task_id = %id, "swept stale task stream");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    task_id: TaskId,
    req: StartTaskRequest,
    llm: Arc<dyn LlmClient>,
    model: String,
    sandboxes: Arc<SandboxRegistry>,
    sandbox_config: SandboxConfig,
    tx: mpsc::UnboundedSender<Option<TaskEvent>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let mut sandbox = Sandbox::new(task_id.to_string(), sandbox_config);
    if let Err(e) = sandbox.start(req.workspace_root.as_deref()).await {
        tracing::error!(task_id = %task_id, error = %e, "sandbox start failed");
        let _ = tx.send(Some(TaskEvent::new("error", serde_json::json!({"message": e.to_string()}))));
        let _ = tx.send(Some(TaskEvent::new("finish", Value::Null)));
        let _ = tx.send(None);
        return;
    }
    let sandbox_arc = sandboxes.register(task_id.to_string(), sandbox);

    let mut project = ProjectState::new(task_id, req.user_input);
    project.file_context = req.file_context;
    project.workspace_root = req.workspace_root.map(std::path::PathBuf::from);
    project.mode = req.mode.unwrap_or_default();
    let state = WorkflowState::new(project);

    let deps = WorkflowDeps { llm, model, sandbox: sandbox_arc, vision: None };
    let observe = build_observer(tx.clone());
    let final_state = workflow::run(state, &deps, observe).await;

    let _ = tx.send(Some(TaskEvent::new(
        "finish",
        serde_json::json!({"finalOutput": final_state.final_output}),
    )));
    let _ = tx.send(None);

    sandboxes.unregister(&task_id.to_string()).await;
}

/// Diff successive [`WorkflowState`] observations and push exactly the
/// typed events the spec pins (§4.7): `code_generated` when `codeBlocks`
/// changes, `tool_proposal`/`image_generated`/`commit_proposal` when the
/// corresponding artifact first appears, `usage_update` on cost change,
/// `error` when a node records a new error.
fn build_observer(tx: mpsc::UnboundedSender<Option<TaskEvent>>) -> impl FnMut(&WorkflowState) {
    let mut prev_code_blocks: HashMap<String, String> = HashMap::new();
    let mut prev_pending = false;
    let mut prev_images = false;
    let mut prev_commit = false;
    let mut prev_cost = CostStats::default();
    let mut prev_error: Option<String> = None;

    move |state: &WorkflowState| {
        if state.project.code_blocks != prev_code_blocks {
            prev_code_blocks = state.project.code_blocks.clone();
            let _ = tx.send(Some(TaskEvent::new(
                "code_generated",
                serde_json::json!({"codeBlocks": prev_code_blocks}),
            )));
        }

        let pending = state.project.artifacts.contains_key(nodes::ARTIFACT_PENDING_TOOL_CALL);
        if pending && !prev_pending {
            if let Some(v) = state.project.artifacts.get(nodes::ARTIFACT_PENDING_TOOL_CALL) {
                let _ = tx.send(Some(TaskEvent::new("tool_proposal", v.clone())));
            }
        }
        prev_pending = pending;

        let images = state.project.artifacts.contains_key(nodes::ARTIFACT_IMAGE_ARTIFACTS);
        if images && !prev_images {
            if let Some(v) = state.project.artifacts.get(nodes::ARTIFACT_IMAGE_ARTIFACTS) {
                let _ = tx.send(Some(TaskEvent::new("image_generated", v.clone())));
            }
        }
        prev_images = images;

        let commit = state.project.artifacts.contains_key(nodes::ARTIFACT_COMMIT_PROPOSAL);
        if commit && !prev_commit {
            if let Some(v) = state.project.artifacts.get(nodes::ARTIFACT_COMMIT_PROPOSAL) {
                let _ = tx.send(Some(TaskEvent::new("commit_proposal", v.clone())));
            }
        }
        prev_commit = commit;

        if state.project.cost_stats != prev_cost {
            prev_cost = state.project.cost_stats;
            let value = serde_json::to_value(prev_cost).unwrap_or(Value::Null);
            let _ = tx.send(Some(TaskEvent::new("usage_update", value)));
        }

        if state.project.last_error.is_some() && state.project.last_error != prev_error {
            prev_error = state.project.last_error.clone();
            let _ = tx.send(Some(TaskEvent::new(
                "error",
                serde_json::json!({"message": prev_error}),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_domain::config::ProvidersConfig;
    use swarm_domain::state::Usage;
    use swarm_providers::Complexity;

    struct StubLlm;

    #[async_trait::async_trait]
    impl LlmClient for StubLlm {
        async fn call(
            &self,
            _model: &str,
            _contents: Value,
            _system_instruction: Option<&str>,
            _complexity: Complexity,
            _max_retries: Option<u32>,
        ) -> swarm_domain::Result<(String, Usage)> {
            Ok(("[\"only step\"]".to_string(), Usage::default()))
        }
    }

    fn test_config() -> Config {
        Config {
            providers: ProvidersConfig {
                gemini_api_keys: vec!["k".into()],
                ..ProvidersConfig::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn admission_refuses_past_capacity() {
        let mut config = test_config();
        config.tasks.max_concurrent = 1;
        let sandboxes = Arc::new(SandboxRegistry::new("swarm_test"));
        let hub = TaskHub::new(&config, Arc::new(StubLlm), sandboxes);

        let first = hub.start_task(StartTaskRequest {
            user_input: "do something".into(),
            ..Default::default()
        });
        assert!(first.is_ok());

        let second = hub.start_task(StartTaskRequest {
            user_input: "do something else".into(),
            ..Default::default()
        });
        assert!(matches!(second, Err(Error::AdmissionRefused)));
    }

    #[test]
    fn take_receiver_is_single_use() {
        let sandboxes = Arc::new(SandboxRegistry::new("swarm_test"));
        let hub = TaskHub::new(&test_config(), Arc::new(StubLlm), sandboxes);
        let task_id = TaskId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.queues.lock().insert(
            task_id,
            Arc::new(TaskQueue {
                tx,
                rx: Mutex::new(Some(rx)),
                last_activity: Mutex::new(Instant::now()),
            }),
        );

        assert!(hub.take_receiver(task_id).is_some());
        assert!(hub.take_receiver(task_id).is_none());
    }

    #[test]
    fn observer_emits_code_generated_once_per_change() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut observe = build_observer(tx);
        let mut state = WorkflowState::new(ProjectState::new(TaskId::new(), "hi".into()));

        state.project.code_blocks.insert("coder".into(), "a".into());
        observe(&state);
        state.project.code_blocks.insert("coder".into(), "a".into());
        observe(&state);

        let first = rx.try_recv().unwrap().unwrap();
        assert_eq!(first.kind, "code_generated");
        assert!(rx.try_recv().is_err());
    }
}
