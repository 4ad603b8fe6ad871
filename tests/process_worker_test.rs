//! Process isolation tests: the delegate talking JSON lines to child
//! processes. The children are small shell scripts so the wire format is
//! exercised exactly as a foreign worker would see it.

#![cfg(unix)]

mod common;

use std::time::Duration;

use serde_json::json;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

use common::fast_settings;
use senseloop::{Delegate, ProcessLauncher, ProcessWorkerConfig, ServiceStatus, WorkerSpec};

const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// A well-behaved worker answering every request with canned frames.
const ECHO_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *HEARTBEAT_SYN*) echo '["HEARTBEAT_ACK"]' ;;
    *GET_DATA*) echo '["DATA_OK", {"x": 1}]' ;;
    *STOP*) echo '["STOP_ACK"]'; exit 0 ;;
  esac
done
"#;

/// Answers heartbeats but replies to data requests with junk.
const GARBAGE_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *HEARTBEAT_SYN*) echo '["HEARTBEAT_ACK"]' ;;
    *GET_DATA*) echo 'not json at all' ;;
    *STOP*) exit 0 ;;
  esac
done
"#;

/// Reports a failed startup on the first heartbeat.
const BROKEN_WORKER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *HEARTBEAT_SYN*) echo '["STARTUP_ERROR", "port /dev/ttyUSB0 busy"]' ;;
    *STOP*) exit 0 ;;
  esac
done
"#;

/// Delegate for a `/bin/sh -c script` worker.
fn script_delegate(id: &str, script: &str) -> Delegate {
    let launcher = ProcessLauncher::new(
        ProcessWorkerConfig::new("/bin/sh")
            .with_args(["-c", script])
            .with_field_names(["x"]),
    );
    Delegate::new(
        WorkerSpec::new(id, launcher),
        fast_settings(),
        CancellationToken::new(),
    )
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_process_round_trip() {
    let delegate = script_delegate("script", ECHO_WORKER);
    assert!(delegate.start(true).await.expect("start"));
    assert_eq!(delegate.status(), ServiceStatus::Running);

    for _ in 0..3 {
        let record = delegate.get_data(READ_TIMEOUT).await.expect("record");
        assert_eq!(record.get("x"), Some(&json!(1)));
    }
    assert!(delegate.check_heartbeat().await);
    assert_eq!(delegate.snapshot().success_ratio, Some(1.0));

    delegate.stop(false);
    assert_eq!(delegate.status(), ServiceStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_malformed_reply_is_critical() {
    let delegate = script_delegate("garbage", GARBAGE_WORKER);
    assert!(delegate.start(true).await.expect("start"));

    assert!(delegate.get_data(READ_TIMEOUT).await.is_none());
    assert_eq!(delegate.status(), ServiceStatus::StoppedIll);
    assert!(!delegate.is_healthy());
    assert!(
        delegate
            .last_error()
            .expect("last error")
            .contains("malformed")
    );
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_exited_worker_fails_start() {
    let delegate = script_delegate("gone", "exit 0");
    assert!(!delegate.start(true).await.expect("start"));
    assert_eq!(delegate.status(), ServiceStatus::StoppedIll);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_startup_error_reported_by_child() {
    let delegate = script_delegate("broken", BROKEN_WORKER);
    assert!(!delegate.start(true).await.expect("start"));
    assert_eq!(delegate.status(), ServiceStatus::StoppedIll);
    assert!(
        delegate
            .last_error()
            .expect("last error")
            .contains("port /dev/ttyUSB0 busy")
    );
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_missing_program_fails_start() {
    let launcher = ProcessLauncher::new(ProcessWorkerConfig::new("/nonexistent/senseloop-worker"));
    let delegate = Delegate::new(
        WorkerSpec::new("missing", launcher),
        fast_settings(),
        CancellationToken::new(),
    );
    assert!(!delegate.start(true).await.expect("start"));
    assert_eq!(delegate.status(), ServiceStatus::StoppedIll);
    assert!(delegate.last_error().is_some());
}
