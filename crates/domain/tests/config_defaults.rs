use swarm_domain::config::Config;

#[test]
fn default_host_is_loopback() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert!(config.server.is_loopback());
}

#[test]
fn default_port_matches_spec() {
    assert_eq!(Config::default().server.port, 8000);
}

#[test]
fn default_sandbox_limits_match_spec() {
    let cfg = Config::default();
    assert_eq!(cfg.sandbox.memory_limit_bytes, 512 * 1024 * 1024);
    assert_eq!(cfg.sandbox.exec_timeout_secs, 30);
}

#[test]
fn default_task_concurrency_is_five() {
    assert_eq!(Config::default().tasks.max_concurrent, 5);
}
