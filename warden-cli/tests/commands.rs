//! The `warden` binary's operator subcommands

use serde_json::Value;
use std::process::{Command, Output};

const WARDEN: &str = env!("CARGO_BIN_EXE_warden");

fn warden(args: &[&str], envs: &[(&str, &str)]) -> Output {
    Command::new(WARDEN)
        .args(args)
        .envs(envs.iter().copied())
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "warden failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

#[test]
fn invoke_prints_the_worker_result() {
    let output = warden(
        &["invoke", "--payload", r#"{"a":1}"#, "--", WARDEN, "worker", "echo"],
        &[],
    );
    let result: Value = serde_json::from_str(stdout(&output).trim()).unwrap();
    assert_eq!(result["echo"]["a"], 1);
}

#[test]
fn invoke_reports_remote_errors() {
    let output = warden(
        &["invoke", "--payload", r#"{"fail":"x"}"#, "--", WARDEN, "worker", "echo"],
        &[],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("echo failed: x"));
}

#[test]
fn lock_status_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let lock_dir = dir.path().to_str().unwrap();
    let env = [("WARDEN_LOCK_DIR", lock_dir)];

    assert_eq!(stdout(&warden(&["lock", "status", "buyer"], &env)).trim(), "free");

    std::fs::write(dir.path().join("buyer"), "4242").unwrap();
    assert_eq!(
        stdout(&warden(&["lock", "status", "buyer"], &env)).trim(),
        "held by 4242"
    );

    assert_eq!(stdout(&warden(&["lock", "release", "buyer"], &env)).trim(), "released");
    assert_eq!(stdout(&warden(&["lock", "release", "buyer"], &env)).trim(), "not held");
    assert!(!dir.path().join("buyer").exists());
}

#[test]
fn lock_rejects_path_like_tags() {
    let dir = tempfile::tempdir().unwrap();
    let output = warden(
        &["lock", "status", "../etc"],
        &[("WARDEN_LOCK_DIR", dir.path().to_str().unwrap())],
    );
    assert!(!output.status.success());
}

#[test]
fn sample_config_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.yaml");
    let path_str = path.to_str().unwrap();

    let sample = stdout(&warden(&["config", "sample"], &[]));
    assert!(sample.contains("watchdog:"));

    stdout(&warden(&["config", "sample", "--output", path_str], &[]));
    let refused = warden(&["config", "sample", "--output", path_str], &[]);
    assert!(!refused.status.success());

    let validated = stdout(&warden(&["config", "validate", "--config-file", path_str], &[]));
    assert!(validated.contains("1 worker categories"));
}

#[test]
fn config_show_applies_env_overrides() {
    let output = warden(
        &["config", "show", "--format", "json"],
        &[("WARDEN_SERVICE_NAME", "bot-eu"), ("WARDEN_WALLET_IDS", "a,b")],
    );
    let shown: Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(shown["session"]["service_name"], "bot-eu");
    assert_eq!(shown["hints"]["wallet_ids"], serde_json::json!(["a", "b"]));
    assert_eq!(shown["watchdog"]["stale_after"], "1m");
}
