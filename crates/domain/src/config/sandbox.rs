use serde::{Deserialize, Serialize};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox resource limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Pinned base image for per-task containers.
    #[serde(default = "d_image")]
    pub image: String,
    /// Container name prefix; containers are named `<prefix>_<task_id>`.
    #[serde(default = "d_prefix")]
    pub container_name_prefix: String,
    #[serde(default = "d_memory_limit")]
    pub memory_limit_bytes: i64,
    #[serde(default = "d_cpu_quota")]
    pub cpu_quota_micros: i64,
    #[serde(default = "d_true")]
    pub network_disabled: bool,
    #[serde(default = "d_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "d_output_cap_bytes")]
    pub output_cap_bytes: usize,
    /// Mount path for the (read-only) workspace inside the container.
    #[serde(default = "d_workspace_mount")]
    pub workspace_mount: String,
    /// Writable scratch directory inside the container.
    #[serde(default = "d_scratch_dir")]
    pub scratch_dir: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: d_image(),
            container_name_prefix: d_prefix(),
            memory_limit_bytes: d_memory_limit(),
            cpu_quota_micros: d_cpu_quota(),
            network_disabled: true,
            exec_timeout_secs: d_exec_timeout_secs(),
            output_cap_bytes: d_output_cap_bytes(),
            workspace_mount: d_workspace_mount(),
            scratch_dir: d_scratch_dir(),
        }
    }
}

impl SandboxConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn container_name(&self, task_id: &str) -> String {
        format!("{}_{}", self.container_name_prefix, task_id)
    }
}

fn d_image() -> String {
    "python:3.11-slim".into()
}
fn d_prefix() -> String {
    "swarm_session".into()
}
fn d_memory_limit() -> i64 {
    512 * 1024 * 1024
}
fn d_cpu_quota() -> i64 {
    // Docker CPU period is 100_000us by default; 0.5 core == 50_000us quota.
    50_000
}
fn d_true() -> bool {
    true
}
fn d_exec_timeout_secs() -> u64 {
    30
}
fn d_output_cap_bytes() -> usize {
    50 * 1024
}
fn d_workspace_mount() -> String {
    "/workspace".into()
}
fn d_scratch_dir() -> String {
    "/scratch".into()
}
