use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Liveness parent PID ("suicide pact"). `0` disables the monitor.
    #[serde(default)]
    pub host_pid: u32,
    /// Shared bearer token required on `/api/stream` and `/api/start_task`.
    /// `None` disables authentication (dev mode).
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            host_pid: 0,
            auth_token: None,
        }
    }
}

impl ServerConfig {
    /// Whether the configured bind address is loopback-only.
    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "localhost" | "::1")
    }
}

fn d_port() -> u16 {
    8000
}
fn d_host() -> String {
    "127.0.0.1".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loopback() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8000);
        assert!(cfg.is_loopback());
        assert_eq!(cfg.host_pid, 0);
        assert!(cfg.auth_token.is_none());
    }

    #[test]
    fn non_loopback_host_is_detected() {
        let cfg = ServerConfig {
            host: "0.0.0.0".into(),
            ..ServerConfig::default()
        };
        assert!(!cfg.is_loopback());
    }
}
