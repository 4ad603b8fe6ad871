//! Delegate lifecycle tests against in-process (thread) workers.
//!
//! These verify:
//! - Startup failures leave the delegate STOPPED_ILL and unreachable
//! - Data round-trips and their effect on the health window
//! - Restart pacing, exhaustion and manual re-arming

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{FlakyControls, constant, fast_settings, flaky};
use senseloop::{Delegate, ServiceStatus, SupervisorConfig};

const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Delegate over a [`common::Flaky`] sensor with the given supervision settings.
fn flaky_delegate(controls: &FlakyControls, settings: SupervisorConfig) -> Delegate {
    Delegate::new(flaky("flaky", controls), settings, CancellationToken::new())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_startup_error_stops_ill() {
    let controls = FlakyControls::default();
    controls.fail_startup.store(true, Ordering::SeqCst);
    let delegate = flaky_delegate(&controls, fast_settings());

    assert!(!delegate.start(true).await.expect("start"));
    assert_eq!(delegate.status(), ServiceStatus::StoppedIll);
    assert!(!delegate.is_healthy());
    let last_error = delegate.last_error().expect("last error");
    assert!(last_error.contains("startup failed"), "{last_error}");
    assert!(last_error.contains("device not found"), "{last_error}");

    assert!(!delegate.check_heartbeat().await);
    assert!(delegate.get_data(READ_TIMEOUT).await.is_none());

    controls.fail_startup.store(false, Ordering::SeqCst);
    assert!(delegate.start(true).await.expect("start"));
    assert_eq!(delegate.status(), ServiceStatus::Running);
    assert!(delegate.check_heartbeat().await);
    assert_eq!(
        delegate.get_data(READ_TIMEOUT).await,
        Some([("flaky".to_string(), json!(1))].into_iter().collect())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_data_round_trip_records_success() {
    let delegate = Delegate::new(
        constant("imu", "x", json!(1)),
        fast_settings(),
        CancellationToken::new(),
    );
    assert!(delegate.start(true).await.expect("start"));
    let before = delegate.snapshot();

    let record = delegate.get_data(READ_TIMEOUT).await.expect("record");
    assert_eq!(record.len(), 1);
    assert_eq!(record.get("x"), Some(&json!(1)));

    let after = delegate.snapshot();
    assert_eq!(after.health_events, before.health_events + 1);
    assert_eq!(after.success_ratio, Some(1.0));
    assert!(after.healthy);
    assert_eq!(delegate.field_names(), vec!["x".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_waits_for_schedule() {
    let controls = FlakyControls::default();
    controls.fail_startup.store(true, Ordering::SeqCst);
    let settings = SupervisorConfig {
        heartbeat_timeout: Duration::from_millis(500),
        heartbeat_poll: Duration::from_millis(5),
        ..SupervisorConfig::default()
    };
    let delegate = flaky_delegate(&controls, settings);

    assert!(!delegate.start(true).await.expect("start"));
    assert_eq!(delegate.reboot_attempts(), 0);

    // the first automatic restart is immediate
    assert!(!delegate.try_reboot().await);
    assert_eq!(delegate.reboot_attempts(), 1);
    assert_eq!(delegate.status(), ServiceStatus::StoppedIll);

    // the second one is ten seconds away
    assert!(!delegate.try_reboot().await);
    assert_eq!(delegate.reboot_attempts(), 1);
    assert!(delegate.should_reboot());
    assert_eq!(controls.launches.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restarts_exhaust_then_manual_start_rearms() {
    let controls = FlakyControls::default();
    controls.fail_startup.store(true, Ordering::SeqCst);
    let delegate = flaky_delegate(&controls, fast_settings());

    assert!(!delegate.start(true).await.expect("start"));
    for attempt in 1..=5 {
        assert!(!delegate.try_reboot().await);
        assert_eq!(delegate.reboot_attempts(), attempt);
        assert!(delegate.should_reboot());
    }

    // the schedule has run out
    assert!(!delegate.try_reboot().await);
    assert!(!delegate.should_reboot());
    assert!(!delegate.try_reboot().await);
    assert!(!delegate.should_reboot());
    assert_eq!(delegate.reboot_attempts(), 5);
    assert_eq!(controls.launches.load(Ordering::SeqCst), 6);

    controls.fail_startup.store(false, Ordering::SeqCst);
    assert!(delegate.start(true).await.expect("start"));
    assert_eq!(delegate.reboot_attempts(), 0);
    assert!(delegate.should_reboot());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_is_noop_while_running() {
    let controls = FlakyControls::default();
    let delegate = flaky_delegate(&controls, fast_settings());

    assert!(delegate.start(true).await.expect("start"));
    assert!(!delegate.try_reboot().await);
    assert_eq!(delegate.reboot_attempts(), 0);
    assert_eq!(controls.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crashed_worker_is_stopped_and_restarted() {
    let controls = FlakyControls::default();
    let delegate = flaky_delegate(&controls, fast_settings());
    assert!(delegate.start(true).await.expect("start"));

    controls.panic_on_read.store(true, Ordering::SeqCst);
    assert!(delegate.get_data(READ_TIMEOUT).await.is_none());
    assert_eq!(delegate.status(), ServiceStatus::StoppedIll);

    controls.panic_on_read.store(false, Ordering::SeqCst);
    assert!(delegate.try_reboot().await);
    assert_eq!(delegate.status(), ServiceStatus::Running);
    assert_eq!(delegate.reboot_attempts(), 1);
    assert!(delegate.get_data(READ_TIMEOUT).await.is_some());
}
