mod observability;
mod providers;
mod sandbox;
mod server;
mod tasks;

pub use observability::*;
pub use providers::*;
pub use sandbox::*;
pub use server::*;
pub use tasks::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Data root for the rotating log file and embedding-store subdirectory.
    /// Sourced from `SWARM_DATA_DIR`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("swarm-engine")
}

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Assemble configuration from the process environment, per §6/§11.
    ///
    /// Fails only when a *fatal* issue is present (an empty key list);
    /// non-loopback bind and similar concerns are warnings a caller logs
    /// but does not treat as startup failure.
    pub fn from_env() -> Result<Self, Vec<ConfigIssue>> {
        let mut cfg = Config {
            server: ServerConfig {
                port: std::env::var("PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| ServerConfig::default().port),
                host: std::env::var("HOST").unwrap_or_else(|_| ServerConfig::default().host),
                host_pid: std::env::var("HOST_PID")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                auth_token: std::env::var("GEMINI_AUTH_TOKEN")
                    .ok()
                    .filter(|v| !v.is_empty()),
            },
            data_dir: std::env::var("SWARM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_data_dir()),
            observability: ObservabilityConfig {
                log_level: std::env::var("LOG_LEVEL")
                    .unwrap_or_else(|_| ObservabilityConfig::default().log_level),
            },
            ..Config::default()
        };

        let raw_keys = std::env::var("GEMINI_API_KEYS").unwrap_or_default();
        cfg.providers.gemini_api_keys = parse_api_keys(&raw_keys);
        if let Ok(model) = std::env::var("GEMINI_MODEL_NAME") {
            if !model.is_empty() {
                cfg.providers.gemini_model_name = model;
            }
        }
        cfg.tasks = cfg.tasks.clamped();

        let issues = cfg.validate();
        if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
            return Err(issues);
        }
        for issue in &issues {
            tracing::warn!("{issue}");
        }
        Ok(cfg)
    }

    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.providers.gemini_api_keys.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "providers.gemini_api_keys".into(),
                message: "no GEMINI_API_KEYS resolved; at least one credential is required".into(),
            });
        }

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if !self.server.is_loopback() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "server.host".into(),
                message: format!(
                    "binding to non-loopback address \"{}\" exposes the engine beyond this host",
                    self.server.host
                ),
            });
        }

        if self.server.host_pid == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "server.host_pid".into(),
                message: "HOST_PID not set; the liveness monitor is disabled".into(),
            });
        }

        issues
    }
}
