use std::sync::Arc;

use swarm_domain::config::Config;
use swarm_providers::LlmClient;
use swarm_sandbox::SandboxRegistry;

use crate::runtime::tasks::TaskHub;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmClient>,
    pub sandboxes: Arc<SandboxRegistry>,
    pub tasks: Arc<TaskHub>,
}
