//! Supervisor driving real child processes (`/bin/sh` scripts)

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use warden_ipc::ProgressEvent;
use warden_resilience::{ShutdownOptions, Signal};
use warden_runtime::{
    CategorySpec, PidTag, RestartPolicy, SessionManager, SessionOptions, Supervisor,
    SupervisorError, SupervisorOptions, SystemAnchorSource, UnitKey, WorkerStatus,
};
use warden_storage::{InMemorySessionStore, SessionStore};

const SH: &str = "/bin/sh";

const HEARTBEAT_LOOP: &str = r#"while true; do printf '%s\n' '{"protocolVersion":1,"timestamp":"2024-05-01T00:00:00Z","type":"progress","progress":{"kind":"heartbeat","ts":0,"status":"ok"}}'; sleep 0.1; done"#;

const DOMAIN_EVENT_THEN_SLEEP: &str = r#"printf '%s\n' '{"protocolVersion":1,"timestamp":"2024-05-01T00:00:00Z","type":"progress","progress":{"kind":"domain_event","name":"opened","payload":{"mint":"m1"}}}'; exec sleep 30"#;

const SILENT: &str = "exec sleep 30";

const IGNORES_SIGNALS: &str = r#"trap '' TERM USR1; printf '%s\n' '{"protocolVersion":1,"timestamp":"2024-05-01T00:00:00Z","type":"progress","progress":{"kind":"heartbeat","ts":0,"status":"ok"}}'; while true; do sleep 0.1; done"#;

fn options(lock_dir: &Path) -> SupervisorOptions {
    SupervisorOptions {
        tick_interval: Duration::from_millis(100),
        restart_policy: RestartPolicy {
            stale_after_ms: 400,
            restart_cooldown_ms: 0,
            startup_grace_ms: 0,
        },
        lock_dir: lock_dir.to_path_buf(),
        stop_grace: Duration::from_millis(100),
        shutdown: ShutdownOptions {
            grace: Duration::from_millis(100),
            wait: Duration::from_secs(2),
            force_wait: Duration::from_millis(500),
            force_signal: Signal::SIGKILL,
        },
        alert_capacity: 100,
    }
}

fn shell_category(name: &str, script: &str) -> CategorySpec {
    CategorySpec {
        args: vec!["-c".to_string(), script.to_string()],
        ..CategorySpec::new(name, SH)
    }
}

fn alert_messages(supervisor: &Supervisor) -> Vec<String> {
    supervisor
        .alerts()
        .recent(usize::MAX)
        .into_iter()
        .map(|alert| alert.message)
        .collect()
}

async fn wait_for_alert(supervisor: &Supervisor, needle: &str) -> bool {
    for _ in 0..100 {
        if alert_messages(supervisor).iter().any(|m| m.contains(needle)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn stale_unit_is_restarted_and_beating_unit_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::builder(options(dir.path()))
        .category(shell_category("beater", HEARTBEAT_LOOP))
        .category(shell_category("silent", SILENT))
        .build()
        .unwrap();

    supervisor.start().await.unwrap();
    assert!(wait_for_alert(&supervisor, "Restarted silent").await);

    let snapshot = supervisor.snapshot();
    let beater = snapshot
        .iter()
        .find(|unit| unit.unit == UnitKey::category("beater"))
        .unwrap();
    assert_eq!(beater.restarts, 0);
    assert!(beater.last_heartbeat.is_some());

    let silent = snapshot
        .iter()
        .find(|unit| unit.unit == UnitKey::category("silent"))
        .unwrap();
    assert!(silent.restarts >= 1);
    assert!(silent.last_restart_at_ms.is_some());

    let report = supervisor.shutdown("test over").await;
    assert!(report.survivors.is_empty(), "{report:?}");
}

#[tokio::test]
async fn wallet_units_hold_their_own_pid_tags() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::builder(options(dir.path()))
        .category(CategorySpec {
            wallets: vec!["a".into(), "b".into()],
            pid_tag: Some("seller".into()),
            restart: false,
            ..shell_category("seller", SILENT)
        })
        .build()
        .unwrap();

    supervisor.start().await.unwrap();
    let units: Vec<_> = supervisor.snapshot().into_iter().map(|u| u.unit).collect();
    assert_eq!(
        units,
        [UnitKey::wallet("seller", "a"), UnitKey::wallet("seller", "b")]
    );
    assert!(dir.path().join("seller-a").exists());
    assert!(dir.path().join("seller-b").exists());

    let report = supervisor.shutdown("test over").await;
    assert_eq!(report.stopped.len(), 2);
    assert!(report.cleanup_failures.is_empty());
    assert!(!dir.path().join("seller-a").exists());
    assert!(!dir.path().join("seller-b").exists());
}

#[tokio::test]
async fn held_pid_tag_blocks_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    let held = PidTag::acquire("buyer", dir.path()).await.unwrap();

    let supervisor = Supervisor::builder(options(dir.path()))
        .category(CategorySpec {
            pid_tag: Some("buyer".into()),
            ..shell_category("buyer", SILENT)
        })
        .build()
        .unwrap();

    supervisor.start().await.unwrap();
    assert!(supervisor.snapshot().is_empty());
    assert!(alert_messages(&supervisor)
        .iter()
        .any(|m| m.contains("already exists")));

    supervisor.shutdown("test over").await;
    // Someone else's lock is left alone
    assert!(held.path().exists());
    held.release().await.unwrap();
}

#[tokio::test]
async fn unexpected_exit_raises_alert() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::builder(options(dir.path()))
        .category(CategorySpec {
            restart: false,
            ..shell_category("crasher", "exit 1")
        })
        .build()
        .unwrap();

    supervisor.start().await.unwrap();
    assert!(wait_for_alert(&supervisor, "crasher exited unexpectedly (exit code 1)").await);
    supervisor.shutdown("test over").await;
}

#[tokio::test]
async fn exited_category_can_be_started_again() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::builder(options(dir.path()))
        .category(CategorySpec {
            restart: false,
            ..shell_category("crasher", "sleep 0.3; exit 1")
        })
        .build()
        .unwrap();
    let key = UnitKey::category("crasher");

    supervisor.start().await.unwrap();
    let first = supervisor.handle(&key).unwrap();
    assert!(wait_for_alert(&supervisor, "crasher exited unexpectedly").await);
    assert!(supervisor.snapshot().is_empty());
    // Only the pid-tag cleanup is still tracked
    assert_eq!(supervisor.coordinator().tracked_count(), 1);

    assert_eq!(supervisor.start_category("crasher").await.unwrap(), 1);
    let second = supervisor.handle(&key).unwrap();
    assert!(second.is_alive());
    assert_ne!(second.pid(), first.pid());

    supervisor.shutdown("test over").await;
}

#[tokio::test]
async fn restart_racing_shutdown_leaves_no_worker_behind() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::builder(options(dir.path()))
        .category(CategorySpec {
            pid_tag: Some("racer".into()),
            ..shell_category("racer", SILENT)
        })
        .build()
        .unwrap();
    let key = UnitKey::category("racer");

    supervisor.start().await.unwrap();
    let original = supervisor.handle(&key).unwrap();

    let restarter = supervisor.clone();
    let restart_key = key.clone();
    let restart =
        tokio::spawn(async move { restarter.restart_unit(&restart_key, "racing").await });
    let report = supervisor.shutdown("test over").await;
    let _ = restart.await.unwrap();

    assert!(report.survivors.is_empty(), "{report:?}");
    assert!(!original.is_alive());
    if let Some(handle) = supervisor.handle(&key) {
        assert!(handle.wait_exit_timeout(Duration::from_secs(2)).await.is_some());
    }
    assert!(!dir.path().join("racer").exists());
}

#[tokio::test]
async fn surviving_worker_keeps_its_pid_tag() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(dir.path());
    options.shutdown = ShutdownOptions {
        grace: Duration::from_millis(100),
        wait: Duration::from_millis(300),
        force_wait: Duration::from_millis(300),
        force_signal: Signal::SIGUSR1,
    };
    let supervisor = Supervisor::builder(options)
        .category(CategorySpec {
            pid_tag: Some("stubborn".into()),
            restart: false,
            ..shell_category("stubborn", IGNORES_SIGNALS)
        })
        .build()
        .unwrap();

    supervisor.start().await.unwrap();
    let handle = supervisor.handle(&UnitKey::category("stubborn")).unwrap();
    while handle.status() != WorkerStatus::Alive {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report = supervisor.shutdown("test over").await;
    assert_eq!(report.survivors.len(), 1, "{report:?}");
    assert!(handle.is_alive());
    assert!(dir.path().join("stubborn").exists());

    handle.kill(Signal::SIGKILL);
    handle.wait_exit().await;
}

#[tokio::test(start_paused = true)]
async fn stale_detection_follows_paused_time() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::builder(SupervisorOptions {
        restart_policy: RestartPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
            Duration::from_secs(20),
        ),
        lock_dir: dir.path().to_path_buf(),
        ..SupervisorOptions::default()
    })
    .category(shell_category("silent", SILENT))
    .build()
    .unwrap();

    let started = std::time::Instant::now();
    supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(90)).await;

    assert!(alert_messages(&supervisor)
        .iter()
        .any(|m| m.contains("Restarted silent")));
    assert!(started.elapsed() < Duration::from_secs(30));
    supervisor.shutdown("test over").await;
}

#[tokio::test]
async fn domain_events_are_republished() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::builder(options(dir.path()))
        .category(shell_category("scanner", DOMAIN_EVENT_THEN_SLEEP))
        .build()
        .unwrap();
    let mut events = supervisor.subscribe_events();

    supervisor.start().await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(event.unit, UnitKey::category("scanner"));
    match event.event {
        ProgressEvent::DomainEvent { name, payload } => {
            assert_eq!(name, "opened");
            assert_eq!(payload["mint"], "m1");
        }
        other => panic!("unexpected {other:?}"),
    }
    supervisor.shutdown("test over").await;
}

#[tokio::test]
async fn shutdown_finalizes_session_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySessionStore::new());
    let sessions = SessionManager::new(
        store.clone(),
        Arc::new(SystemAnchorSource::new()),
        SessionOptions {
            service_name: "bot".into(),
            ..SessionOptions::default()
        },
    );
    let supervisor = Supervisor::builder(options(dir.path()))
        .session(sessions)
        .build()
        .unwrap();

    supervisor.start().await.unwrap();
    assert!(store.find_open_session("bot").await.unwrap().is_some());

    let first = supervisor.shutdown("signal").await;
    let second = supervisor.shutdown("again").await;
    assert_eq!(second.reason, first.reason);

    assert!(store.find_open_session("bot").await.unwrap().is_none());
    let sessions = store.list_sessions("bot").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].end_reason.as_deref(), Some("signal"));
}

#[test]
fn duplicate_category_is_rejected() {
    let result = Supervisor::builder(SupervisorOptions::default())
        .category(shell_category("buyer", SILENT))
        .category(shell_category("buyer", SILENT))
        .build();
    assert!(matches!(result, Err(SupervisorError::DuplicateCategory(name)) if name == "buyer"));
}
