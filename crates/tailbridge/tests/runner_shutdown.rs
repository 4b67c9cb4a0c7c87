#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tailbridge::config::AppConfig;
use tailbridge::runner::{self, BridgeOptions};
use tempfile::TempDir;

/// Executable stand-in for the mesh CLI: logs argv lines to `calls.log` and
/// answers status reads with `services_json`.
fn fake_cli(dir: &TempDir, services_json: &str) -> (PathBuf, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.path().join("calls.log");
    let script = dir.path().join("tailscale");

    let mut contents = String::from("#!/bin/sh\n");
    contents.push_str(&format!("log=\"{}\"\n", log.display()));
    contents.push_str("echo \"$*\" >> \"$log\"\n");
    contents.push_str("case \"$*\" in\n");
    contents.push_str(&format!("  *\"serve status\"*) echo '{services_json}' ;;\n"));
    contents.push_str("  *\"funnel status\"*) echo '{\"AllowFunnel\": {}}' ;;\n");
    contents.push_str("esac\n");
    fs::write(&script, contents).expect("write script");

    let mut perms = fs::metadata(&script).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).expect("chmod script");

    (script, log)
}

fn itest_config(tailscale_bin: String) -> AppConfig {
    AppConfig {
        reconcile_interval_secs: 60,
        cleanup_timeout_secs: 5,
        tailscale_bin,
        tailscale_socket: "/tmp/tailbridge-itest.sock".into(),
        cli_timeout_secs: 5,
        default_tags: vec!["tag:container".into()],
        probe_timeout_ms: 10,
        event_reconnect_backoff_ms: 50,
        event_reconnect_backoff_max_ms: 200,
        metrics_host: "127.0.0.1".into(),
        // Let the OS pick an ephemeral port to avoid collisions in CI.
        metrics_port: 0,
        api_base_url: "https://api.tailscale.com".into(),
        tailnet: "-".into(),
        api_key: None,
        oauth_client_id: None,
        oauth_client_secret: None,
    }
}

#[tokio::test]
async fn embedded_shutdown_finishes_with_metrics_enabled() {
    let dir = TempDir::new().expect("tempdir");
    let (script, log) = fake_cli(&dir, r#"{"Services": {}}"#);

    let bridge = runner::start_bridge(
        itest_config(script.display().to_string()),
        BridgeOptions {
            // Avoid global tracing subscriber conflicts in tests.
            init_tracing: false,
            serve_metrics: true,
            metrics_handle: None,
        },
    )
    .await
    .expect("bridge starts");

    let shutdown = tokio::time::timeout(Duration::from_secs(5), bridge.shutdown()).await;
    let res = shutdown.expect("shutdown should complete within timeout");
    res.expect("shutdown should succeed");

    // The shutdown cleanup always reads the node's serve config.
    let calls = fs::read_to_string(log).unwrap_or_default();
    assert!(
        calls.lines().any(|line| line.contains("serve status --json")),
        "cleanup did not read serve status: {calls}"
    );
}

#[tokio::test]
async fn shutdown_cleanup_removes_services_left_on_the_node() {
    let dir = TempDir::new().expect("tempdir");
    let (script, log) = fake_cli(
        &dir,
        r#"{"Services": {"svc:stale": {"TCP": {"443": {"HTTPS": true}}}}}"#,
    );

    let bridge = runner::start_bridge(
        itest_config(script.display().to_string()),
        BridgeOptions {
            init_tracing: false,
            serve_metrics: false,
            metrics_handle: None,
        },
    )
    .await
    .expect("bridge starts");

    let shutdown = tokio::time::timeout(Duration::from_secs(5), bridge.shutdown()).await;
    shutdown
        .expect("shutdown should complete within timeout")
        .expect("shutdown should succeed");

    let calls = fs::read_to_string(log).unwrap_or_default();
    assert!(
        calls
            .lines()
            .any(|line| line.contains("serve --service=svc:stale off")),
        "cleanup did not clear the stale service: {calls}"
    );
}
