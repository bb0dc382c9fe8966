//! Process-wide task→sandbox map with an explicit shutdown hook (C4).
//!
//! Rust has no reliable async-aware `atexit`, so unlike a global dict plus
//! an `atexit` callback, shutdown here is an explicit method the gateway's
//! signal handler calls before the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::docker::Sandbox;

/// Guards the process-wide `TaskId -> Sandbox` map.
pub struct SandboxRegistry {
    sandboxes: Mutex<HashMap<String, Arc<AsyncMutex<Sandbox>>>>,
    container_name_prefix: String,
}

impl SandboxRegistry {
    pub fn new(container_name_prefix: impl Into<String>) -> Self {
        Self {
            sandboxes: Mutex::new(HashMap::new()),
            container_name_prefix: container_name_prefix.into(),
        }
    }

    /// Register a sandbox for a task, replacing any previous entry for the
    /// same id (the caller is responsible for closing the old one first).
    pub fn register(&self, task_id: impl Into<String>, sandbox: Sandbox) -> Arc<AsyncMutex<Sandbox>> {
        let arc = Arc::new(AsyncMutex::new(sandbox));
        self.sandboxes.lock().insert(task_id.into(), arc.clone());
        arc
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<AsyncMutex<Sandbox>>> {
        self.sandboxes.lock().get(task_id).cloned()
    }

    /// Close and remove the sandbox for a task.
    pub async fn unregister(&self, task_id: &str) {
        let entry = self.sandboxes.lock().remove(task_id);
        if let Some(arc) = entry {
            arc.lock().await.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.sandboxes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.lock().is_empty()
    }

    /// Close every tracked sandbox. Called from the gateway's top-level
    /// signal handler on shutdown, not from a `Drop` impl — closing a
    /// container is an async operation and futures cannot run inside
    /// `Drop`.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut guard = self.sandboxes.lock();
            guard.drain().collect()
        };
        if entries.is_empty() {
            return;
        }
        tracing::info!(count = entries.len(), "closing active sandboxes on shutdown");
        for (task_id, arc) in entries {
            let mut sandbox = arc.lock().await;
            tracing::info!(task_id = %task_id, "closing sandbox");
            sandbox.close().await;
        }
    }

    /// Force-remove any container whose name matches the canonical prefix
    /// but is not tracked in this registry — defends against orphans left
    /// behind by a previous hard crash.
    pub async fn cleanup_orphans(&self) {
        let Ok(docker) = bollard::Docker::connect_with_local_defaults() else {
            return;
        };
        let tracked: std::collections::HashSet<String> = {
            let guard = self.sandboxes.lock();
            guard.keys().cloned().collect()
        };

        let containers = match docker
            .list_containers(Some(bollard::container::ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
        {
            Ok(c) => c,
            Err(_) => return,
        };

        for container in containers {
            let Some(names) = container.names else { continue };
            let Some(id) = container.id else { continue };
            for name in names {
                let name = name.trim_start_matches('/');
                if !name.starts_with(&self.container_name_prefix) {
                    continue;
                }
                let task_id = name
                    .strip_prefix(&format!("{}_", self.container_name_prefix))
                    .unwrap_or(name);
                if tracked.contains(task_id) {
                    continue;
                }
                tracing::warn!(container = %name, "force-removing orphaned sandbox container");
                let _ = docker
                    .remove_container(
                        &id,
                        Some(bollard::container::RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_domain::config::SandboxConfig;

    fn noop_sandbox(task_id: &str) -> Sandbox {
        Sandbox::new(task_id, SandboxConfig::default())
    }

    #[tokio::test]
    async fn register_then_get_returns_same_entry() {
        let registry = SandboxRegistry::new("swarm_session");
        let sandbox = noop_sandbox("t1");
        registry.register("t1", sandbox);
        assert!(registry.get("t1").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn get_missing_task_returns_none() {
        let registry = SandboxRegistry::new("swarm_session");
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let registry = SandboxRegistry::new("swarm_session");
        registry.register("t1", noop_sandbox("t1"));
        registry.unregister("t1").await;
        assert!(registry.get("t1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_clears_all_entries() {
        let registry = SandboxRegistry::new("swarm_session");
        registry.register("t1", noop_sandbox("t1"));
        registry.register("t2", noop_sandbox("t2"));
        registry.shutdown().await;
        assert!(registry.is_empty());
    }
}
