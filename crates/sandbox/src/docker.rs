//! Stateful per-task container sandbox (C3).
//!
//! One [`Sandbox`] per task: a long-lived container with a read-only mount
//! of the task's workspace, started once and reused for every subsequent
//! `execute_code`/`execute_command` call so that installed packages and
//! written scratch files persist across a task's review/reflect loop.

use std::collections::HashMap;
use std::io::Read;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use regex::Regex;
use uuid::Uuid;

use swarm_domain::config::SandboxConfig;

const ENGINE_UNAVAILABLE_MARKER: &str = "[System] engine unavailable";
const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// An image artifact produced by a sandbox run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageArtifact {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub filename: String,
    pub data: String,
}

/// A single sandbox's state. Constructed per task by the registry.
pub struct Sandbox {
    task_id: String,
    container_name: String,
    config: SandboxConfig,
    docker: Option<Docker>,
    container_id: Option<String>,
    plot_regex: Regex,
}

impl Sandbox {
    /// Connect to the local container engine. Never fails at construction —
    /// a connection failure puts the sandbox directly into degraded mode,
    /// matching the "never silently succeed" contract: callers must still
    /// see the `[System] engine unavailable` marker from `execute_*`.
    pub fn new(task_id: impl Into<String>, config: SandboxConfig) -> Self {
        let task_id = task_id.into();
        let container_name = config.container_name(&task_id);
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| tracing::warn!(error = %e, "container engine unavailable, sandbox degraded"))
            .ok();
        Self {
            task_id,
            container_name,
            config,
            docker,
            container_id: None,
            plot_regex: Regex::new(r"(?m)^\s*(import|from)\s+matplotlib").unwrap(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.docker.is_some() && self.container_id.is_some()
    }

    /// Start a new container, or adopt an existing one with the same
    /// canonical name (resume-by-name).
    pub async fn start(&mut self, workspace_root: Option<&str>) -> swarm_domain::error::Result<()> {
        let Some(docker) = self.docker.clone() else {
            return Ok(());
        };

        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![self.container_name.clone()]);
        let existing = docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await;

        if let Ok(containers) = existing {
            if let Some(c) = containers.into_iter().find(|c| {
                c.names
                    .as_ref()
                    .map(|n| n.iter().any(|n| n.trim_start_matches('/') == self.container_name))
                    .unwrap_or(false)
            }) {
                if let Some(id) = c.id {
                    if c.state.as_deref() != Some("running") {
                        let _ = docker.start_container::<String>(&id, None).await;
                    }
                    tracing::info!(container = %self.container_name, "resumed existing sandbox session");
                    self.container_id = Some(id);
                    return Ok(());
                }
            }
        }

        let mut binds = Vec::new();
        if let Some(root) = workspace_root {
            if std::path::Path::new(root).exists() {
                binds.push(format!("{root}:{}:ro", self.config.workspace_mount));
                tracing::info!(workspace = %root, "mounted workspace read-only");
            }
        }

        let host_config = HostConfig {
            memory: Some(self.config.memory_limit_bytes),
            cpu_period: Some(100_000),
            cpu_quota: Some(self.config.cpu_quota_micros),
            network_mode: Some(if self.config.network_disabled {
                "none".to_string()
            } else {
                "bridge".to_string()
            }),
            binds: if binds.is_empty() { None } else { Some(binds) },
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(self.config.image.clone()),
            entrypoint: Some(vec!["tail".into(), "-f".into(), "/dev/null".into()]),
            tty: Some(true),
            working_dir: Some(self.config.scratch_dir.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        tracing::info!(container = %self.container_name, image = %self.config.image, "starting new sandbox session");
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.container_name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| swarm_domain::error::Error::SandboxUnavailable(e.to_string()))?;

        docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| swarm_domain::error::Error::SandboxUnavailable(e.to_string()))?;

        let container_id = created.id;
        self.container_id = Some(container_id.clone());
        self.exec_raw(&container_id, &format!("mkdir -p {}", self.config.scratch_dir))
            .await
            .ok();
        Ok(())
    }

    /// Run `code` as a Python script in the sandbox, returning combined
    /// stdout/stderr and any image artifacts produced.
    pub async fn execute_code(
        &self,
        code: &str,
    ) -> (String, String, Vec<ImageArtifact>) {
        let Some(docker) = self.docker.clone() else {
            return (String::new(), ENGINE_UNAVAILABLE_MARKER.to_string(), vec![]);
        };
        let Some(container_id) = self.container_id.clone() else {
            return (String::new(), ENGINE_UNAVAILABLE_MARKER.to_string(), vec![]);
        };

        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let scratch = &self.config.scratch_dir;
        let script_path = format!("{scratch}/script_{run_id}.py");
        let plot_path = format!("{scratch}/plot_{run_id}.png");

        let wrapped = self.wrap_code_with_plot_saving(code, &plot_path);
        if let Err(e) = self
            .write_file(&docker, scratch, &format!("script_{run_id}.py"), &wrapped)
            .await
        {
            return (String::new(), format!("System Error: {e}"), vec![]);
        }

        let timeout = self.config.exec_timeout_secs;
        let runner = format!(
            r#"import subprocess, sys
try:
    r = subprocess.run([sys.executable, "{script_path}"], capture_output=True, text=True, timeout={timeout})
    sys.stdout.write(r.stdout)
    sys.stderr.write(r.stderr)
    sys.exit(r.returncode)
except subprocess.TimeoutExpired:
    sys.stderr.write("Execution Timed Out (Limit: {timeout}s)")
    sys.exit(124)
except Exception as e:
    sys.stderr.write(f"Runner Error: {{e}}")
    sys.exit(1)
"#
        );
        let runner_path = format!("runner_{run_id}.py");
        if let Err(e) = self.write_file(&docker, scratch, &runner_path, &runner).await {
            return (String::new(), format!("System Error: {e}"), vec![]);
        }

        let (stdout, stderr) = self
            .exec_split(&container_id, &format!("python3 {scratch}/{runner_path}"))
            .await;

        let images = self.extract_image(&docker, &container_id, &plot_path).await;

        self.exec_raw(
            &container_id,
            &format!("rm -f {script_path} {scratch}/{runner_path} {plot_path}"),
        )
        .await
        .ok();

        (
            truncate_with_marker(&stdout, self.config.output_cap_bytes),
            truncate_with_marker(&stderr, self.config.output_cap_bytes),
            images,
        )
    }

    /// Pre-flight syntax check (§4.6 Executor): write `code` to a scratch
    /// file and run it through `py_compile` via [`execute_command`], then
    /// remove the scratch file. Returns `None` when the source compiles
    /// cleanly, `Some(output)` on a syntax error or engine unavailability.
    ///
    /// [`execute_command`]: Sandbox::execute_command
    pub async fn check_syntax(&self, code: &str) -> Option<String> {
        if !self.is_available() {
            return Some(ENGINE_UNAVAILABLE_MARKER.to_string());
        }
        let docker = self.docker.clone().unwrap();
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let scratch = &self.config.scratch_dir;
        let filename = format!("lint_{run_id}.py");
        if self.write_file(&docker, scratch, &filename, code).await.is_err() {
            return None;
        }

        let output = self
            .execute_command(&format!("python3 -m py_compile {scratch}/{filename} 2>&1"))
            .await;
        self.execute_command(&format!("rm -rf {scratch}/{filename} {scratch}/__pycache__"))
            .await;

        (!output.trim().is_empty()).then_some(output)
    }

    /// Run an arbitrary shell command (linters, package installs).
    pub async fn execute_command(&self, command: &str) -> String {
        let Some(container_id) = self.container_id.clone() else {
            return ENGINE_UNAVAILABLE_MARKER.to_string();
        };
        if self.docker.is_none() {
            return ENGINE_UNAVAILABLE_MARKER.to_string();
        }
        match self.exec_raw(&container_id, command).await {
            Ok(out) => truncate_with_marker(&out, self.config.output_cap_bytes),
            Err(e) => format!("Command failed: {e}"),
        }
    }

    /// Force-remove the container.
    pub async fn close(&mut self) {
        if let (Some(docker), Some(id)) = (self.docker.clone(), self.container_id.take()) {
            tracing::info!(container = %self.container_name, "closing sandbox session");
            let _ = docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    fn wrap_code_with_plot_saving(&self, code: &str, save_path: &str) -> String {
        if self.plot_regex.is_match(code) {
            let header = "import matplotlib\nmatplotlib.use('Agg')\nimport matplotlib.pyplot as plt\n";
            let footer = format!(
                "\ntry:\n    if plt.get_fignums():\n        plt.savefig('{save_path}')\nexcept Exception:\n    pass\n"
            );
            format!("{header}{code}{footer}")
        } else {
            code.to_string()
        }
    }

    async fn write_file(
        &self,
        docker: &Docker,
        dest_dir: &str,
        filename: &str,
        content: &str,
    ) -> swarm_domain::error::Result<()> {
        let Some(container_id) = self.container_id.clone() else {
            return Err(swarm_domain::error::Error::SandboxUnavailable(
                "no container".into(),
            ));
        };

        let mut builder = tar::Builder::new(Vec::new());
        let data = content.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_path(filename).map_err(|e| swarm_domain::error::Error::Io(e))?;
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append(&header, data)
            .map_err(swarm_domain::error::Error::Io)?;
        let archive = builder.into_inner().map_err(swarm_domain::error::Error::Io)?;

        docker
            .upload_to_container(
                &container_id,
                Some(bollard::container::UploadToContainerOptions {
                    path: dest_dir.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| swarm_domain::error::Error::SandboxUnavailable(e.to_string()))
    }

    async fn extract_image(
        &self,
        docker: &Docker,
        container_id: &str,
        filepath: &str,
    ) -> Vec<ImageArtifact> {
        use base64::Engine;

        let mut stream = docker.download_from_container(container_id, Some(bollard::container::DownloadFromContainerOptions { path: filepath.to_string() }));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(_) => return vec![],
            }
        }
        if buf.is_empty() {
            return vec![];
        }

        let mut archive = tar::Archive::new(buf.as_slice());
        let mut images = Vec::new();
        let Ok(entries) = archive.entries() else {
            return vec![];
        };
        for entry in entries.flatten() {
            let mut entry = entry;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .ok()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut data = Vec::new();
            if entry.read_to_end(&mut data).is_err() {
                continue;
            }
            let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
            images.push(ImageArtifact {
                kind: "image",
                filename: name,
                data: format!("data:image/png;base64,{b64}"),
            });
        }
        images
    }

    /// Run a command and return its combined stdout+stderr text (used for
    /// linter/package-op invocations where the two streams aren't
    /// distinguished downstream).
    async fn exec_raw(&self, container_id: &str, command: &str) -> swarm_domain::error::Result<String> {
        let (stdout, stderr) = self.exec_split(container_id, command).await;
        if stdout.is_empty() && !stderr.is_empty() {
            return Ok(stderr);
        }
        Ok(format!("{stdout}{stderr}"))
    }

    /// Run a command, demultiplexing the exec stream's `LogOutput` frames
    /// into separate stdout/stderr strings.
    async fn exec_split(&self, container_id: &str, command: &str) -> (String, String) {
        let Some(docker) = self.docker.clone() else {
            return (String::new(), "no docker client".to_string());
        };
        let exec = match docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".into(), "-c".into(), command.into()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(self.config.scratch_dir.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(exec) => exec,
            Err(e) => return (String::new(), e.to_string()),
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Ok(StartExecResults::Attached { mut output: stream, .. }) =
            docker.start_exec(&exec.id, None).await
        {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(bollard::container::LogOutput::Console { message })
                    | Ok(bollard::container::LogOutput::StdIn { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(_) => break,
                }
            }
        }
        (stdout, stderr)
    }
}

fn truncate_with_marker(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut boundary = limit;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &s[..boundary])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_adds_marker_past_limit() {
        let long = "a".repeat(100);
        let out = truncate_with_marker(&long, 10);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.len(), 10 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn truncation_is_noop_under_limit() {
        assert_eq!(truncate_with_marker("short", 100), "short");
    }

    #[test]
    fn plot_regex_detects_multiline_import() {
        let re = Regex::new(r"(?m)^\s*(import|from)\s+matplotlib").unwrap();
        assert!(re.is_match("x = 1\nimport matplotlib.pyplot as plt\n"));
        assert!(re.is_match("from matplotlib import pyplot"));
        assert!(!re.is_match("import numpy as np"));
    }

    #[tokio::test]
    async fn check_syntax_reports_engine_unavailable_when_degraded() {
        let sandbox = Sandbox::new("task-degraded", SandboxConfig::default());
        assert!(!sandbox.is_available());
        let result = sandbox.check_syntax("def f():\n    pass\n").await;
        assert_eq!(result, Some(ENGINE_UNAVAILABLE_MARKER.to_string()));
    }
}
