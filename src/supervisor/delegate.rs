//! Per-worker supervisor.
//!
//! A [`Delegate`] owns one worker's handle, lifecycle status, health window and
//! restart bookkeeping, and implements the client side of the request/response
//! protocol. Every failure talking to the worker is absorbed here: callers only
//! ever see `false`/`None`.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant as StdInstant};

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::{RebootDecision, RebootState};
use super::error::{ConfigurationError, ServiceError, Severity};
use super::health::HealthWindow;
use super::status::ServiceStatus;
use crate::config::SupervisorConfig;
use crate::messages::{Frame, Message, MessageKind};
use crate::sensors::{Record, SensorConfig};
use crate::workers::{WorkerHandle, WorkerLauncher, WorkerSpec};

/// Smallest poll sub-interval used while waiting for data.
const MIN_DATA_POLL: Duration = Duration::from_millis(1);

/// Read-only view of a delegate for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DelegateSnapshot {
    pub id: String,
    pub status: ServiceStatus,
    pub healthy: bool,
    pub reboot_attempts: usize,
    pub should_reboot: bool,
    pub health_events: usize,
    pub success_ratio: Option<f64>,
    pub last_error: Option<String>,
}

struct DelegateState {
    status: ServiceStatus,
    config: Option<SensorConfig>,
    health: HealthWindow,
    reboot: RebootState,
    last_error: Option<String>,
    active: Option<Arc<WorkerHandle>>,
}

impl DelegateState {
    fn is_healthy(&self) -> bool {
        self.status != ServiceStatus::StoppedIll && self.health.is_acceptable()
    }

    fn active_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|handle| handle.id())
    }
}

pub struct Delegate {
    id: String,
    launcher: Arc<dyn WorkerLauncher>,
    settings: SupervisorConfig,
    cancel: CancellationToken,
    state: StdMutex<DelegateState>,
    /// Serialises start and automatic restart.
    lifecycle: Mutex<()>,
}

impl Delegate {
    pub fn new(spec: WorkerSpec, settings: SupervisorConfig, cancel: CancellationToken) -> Self {
        let state = DelegateState {
            status: ServiceStatus::NotStarted,
            config: None,
            health: settings.health_window(),
            reboot: RebootState::default(),
            last_error: None,
            active: None,
        };
        Self {
            id: spec.id,
            launcher: spec.launcher,
            settings,
            cancel,
            state: StdMutex::new(state),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> MutexGuard<'_, DelegateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.state().status
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    pub fn should_reboot(&self) -> bool {
        self.state().reboot.should_reboot()
    }

    pub fn reboot_attempts(&self) -> usize {
        self.state().reboot.attempts()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn config(&self) -> Option<SensorConfig> {
        self.state().config.clone()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.launcher.field_names()
    }

    pub fn describe(&self, record: &Record) -> Option<String> {
        self.launcher.describe(record)
    }

    /// Liveness verdict: never healthy once stopped as ill; otherwise healthy
    /// until the window holds enough samples to show a poor success ratio.
    pub fn is_healthy(&self) -> bool {
        self.state().is_healthy()
    }

    pub fn snapshot(&self) -> DelegateSnapshot {
        let state = self.state();
        DelegateSnapshot {
            id: self.id.clone(),
            status: state.status,
            healthy: state.is_healthy(),
            reboot_attempts: state.reboot.attempts(),
            should_reboot: state.reboot.should_reboot(),
            health_events: state.health.len(),
            success_ratio: state.health.success_ratio(),
            last_error: state.last_error.clone(),
        }
    }

    /// Store configuration for the next start.
    pub fn configure(&self, config: SensorConfig) -> Result<(), ConfigurationError> {
        let mut state = self.state();
        if state.status.is_running() {
            return Err(ConfigurationError::Running(self.id.clone()));
        }
        state.config = Some(config);
        Ok(())
    }

    /// Launch a fresh worker and confirm it answers its first heartbeat.
    ///
    /// Returns `Ok(false)` when the worker could not be launched or failed the
    /// heartbeat; the delegate is then STOPPED_ILL. A manual start re-arms
    /// automatic restarts.
    pub async fn start(&self, is_manual: bool) -> Result<bool, ServiceError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked(is_manual).await
    }

    async fn start_locked(&self, is_manual: bool) -> Result<bool, ServiceError> {
        let config = {
            let mut state = self.state();
            if state.status.is_running() {
                return Err(ServiceError::AlreadyRunning(self.id.clone()));
            }
            if is_manual {
                state.reboot.reset_manual();
            }
            state.config.clone()
        };

        let handle = match self.launcher.launch(&self.id, config.as_ref()) {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                self.handle_error(ServiceError::Launch(err), None);
                return Ok(false);
            }
        };
        let handle_id = handle.id();

        {
            let mut state = self.state();
            if let Some(previous) = state.active.replace(handle) {
                previous.terminate();
            }
            state.status = ServiceStatus::Running;
        }
        info!(worker_id = %self.id, handle_id = %handle_id, manual = is_manual, "started worker");

        if self.check_heartbeat().await {
            return Ok(true);
        }

        warn!(worker_id = %self.id, "worker failed its first heartbeat; stopping");
        let mut state = self.state();
        if state.active_id() == Some(handle_id) || state.active.is_none() {
            state.status = ServiceStatus::Stopped;
            Self::stop_locked(&self.id, &mut state, true);
        }
        Ok(false)
    }

    /// Probe liveness. A `STARTUP_ERROR` answer stops the worker as ill.
    pub async fn check_heartbeat(&self) -> bool {
        let Some(handle) = self.active_handle() else {
            self.handle_error(ServiceError::transient(&self.id, "not running"), None);
            return false;
        };

        let frame = match self
            .exchange(
                &handle,
                MessageKind::HeartbeatSyn,
                self.settings.heartbeat_timeout,
                self.settings.heartbeat_poll,
            )
            .await
        {
            Ok(frame) => frame,
            Err(err) => {
                self.handle_error(err, Some(handle.id()));
                return false;
            }
        };

        let outcome = match Message::from_frame(&frame) {
            Ok(message) => match message.kind {
                MessageKind::HeartbeatAck => Ok(()),
                MessageKind::StartupError => Err(ServiceError::critical(
                    &self.id,
                    format!(
                        "startup failed: {}",
                        message.payload_text().unwrap_or_default()
                    ),
                )),
                other => Err(ServiceError::transient(
                    &self.id,
                    format!("answered heartbeat with {other}"),
                )),
            },
            Err(err) => Err(ServiceError::transient(
                &self.id,
                format!("malformed heartbeat answer: {err}"),
            )),
        };

        match outcome {
            Ok(()) => {
                self.record_success();
                debug!(worker_id = %self.id, "heartbeat ok");
                true
            }
            Err(err) => {
                self.handle_error(err, Some(handle.id()));
                false
            }
        }
    }

    /// Request one record, waiting at most `timeout`.
    ///
    /// Every failure is recorded and absorbed: `None` means "skip this worker
    /// for this tick".
    pub async fn get_data(&self, timeout: Duration) -> Option<Record> {
        let Some(handle) = self.active_handle() else {
            self.handle_error(ServiceError::transient(&self.id, "not running"), None);
            return None;
        };

        let poll = (timeout / 10).max(MIN_DATA_POLL);
        let frame = match self
            .exchange(&handle, MessageKind::GetData, timeout, poll)
            .await
        {
            Ok(frame) => frame,
            Err(err) => {
                self.handle_error(err, Some(handle.id()));
                return None;
            }
        };

        let outcome = match Message::from_frame(&frame) {
            Ok(message) => match (message.kind, message.payload) {
                (MessageKind::DataOk, Some(Value::Object(fields))) => {
                    Ok(fields.into_iter().collect::<Record>())
                }
                (MessageKind::DataOk, _) => Err(ServiceError::critical(
                    &self.id,
                    "DATA_OK without a record payload",
                )),
                (MessageKind::DataError, payload) => {
                    let cause = match payload {
                        Some(Value::String(text)) => text,
                        Some(other) => other.to_string(),
                        None => "unknown error".to_string(),
                    };
                    Err(ServiceError::transient(&self.id, cause))
                }
                (other, _) => Err(ServiceError::critical(
                    &self.id,
                    format!("answered GET_DATA with {other}"),
                )),
            },
            Err(err) => Err(ServiceError::critical(
                &self.id,
                format!("malformed data answer: {err}"),
            )),
        };

        match outcome {
            Ok(record) => {
                self.record_success();
                Some(record)
            }
            Err(err) => {
                self.handle_error(err, Some(handle.id()));
                None
            }
        }
    }

    /// Record a failed interaction.
    ///
    /// Critical errors stop the worker as ill, but only when they came from
    /// the currently active handle: a late failure from a replaced worker must
    /// not take down its successor.
    pub fn handle_error(&self, err: ServiceError, handle_id: Option<Uuid>) {
        let severity = err.severity();
        if severity == Severity::Ignored {
            debug!(worker_id = %self.id, error = %err, "request abandoned");
            return;
        }

        counter!("senseloop_worker_errors_total", "worker" => self.id.clone()).increment(1);

        let mut state = self.state();
        state.health.record(false);
        state.last_error = Some(err.to_string());

        match severity {
            Severity::Critical => {
                let current = state.active_id();
                if handle_id.is_none() || handle_id == current {
                    error!(worker_id = %self.id, error = %err, "critical worker error; stopping");
                    Self::stop_locked(&self.id, &mut state, true);
                } else {
                    debug!(worker_id = %self.id, error = %err, "critical error from a replaced worker");
                }
            }
            _ => debug!(worker_id = %self.id, error = %err, "transient worker error"),
        }
    }

    /// Restart a stopped worker if the backoff schedule allows it.
    ///
    /// Returns whether a restart was attempted and left the worker running.
    pub async fn try_reboot(&self) -> bool {
        let Ok(_lifecycle) = self.lifecycle.try_lock() else {
            debug!(worker_id = %self.id, "start already in progress; skipping restart");
            return false;
        };

        let attempt = {
            let mut state = self.state();
            if matches!(
                state.status,
                ServiceStatus::Running | ServiceStatus::WaitingToReboot
            ) {
                return false;
            }
            match state
                .reboot
                .begin_attempt(StdInstant::now(), &self.settings.reboot_schedule)
            {
                RebootDecision::Disabled => return false,
                RebootDecision::Exhausted => {
                    warn!(worker_id = %self.id, "restart attempts exhausted; giving up");
                    return false;
                }
                RebootDecision::NotDue { remaining } => {
                    debug!(
                        worker_id = %self.id,
                        ?remaining,
                        "restart not due"
                    );
                    return false;
                }
                RebootDecision::Due { attempt } => {
                    state.status = ServiceStatus::WaitingToReboot;
                    attempt
                }
            }
        };

        counter!("senseloop_worker_restarts_total", "worker" => self.id.clone()).increment(1);
        info!(worker_id = %self.id, attempt, "restarting worker");

        match self.start_locked(false).await {
            Ok(running) => running,
            Err(err) => {
                warn!(worker_id = %self.id, error = %err, "restart failed");
                false
            }
        }
    }

    /// Stop the worker if it should be restarted and is unhealthy, leaving it
    /// STOPPED_ILL. Returns whether it was evicted.
    pub fn evict_if_unhealthy(&self) -> bool {
        let mut state = self.state();
        if !state.reboot.should_reboot()
            || state.status == ServiceStatus::WaitingToReboot
            || state.is_healthy()
        {
            return false;
        }
        Self::stop_locked(&self.id, &mut state, true);
        true
    }

    /// Terminate the active worker, if any.
    pub fn stop(&self, ill: bool) {
        let mut state = self.state();
        Self::stop_locked(&self.id, &mut state, ill);
    }

    fn stop_locked(id: &str, state: &mut DelegateState, ill: bool) {
        if let Some(handle) = state.active.take() {
            handle.terminate();
        }
        let status = if ill {
            ServiceStatus::StoppedIll
        } else {
            ServiceStatus::Stopped
        };
        if state.status != status {
            info!(worker_id = %id, from = %state.status, to = %status, "worker stopped");
        }
        state.status = status;
    }

    fn active_handle(&self) -> Option<Arc<WorkerHandle>> {
        self.state().active.clone()
    }

    fn record_success(&self) {
        self.state().health.record(true);
    }

    /// One request/response exchange with exclusive use of the reply channel.
    async fn exchange(
        &self,
        handle: &WorkerHandle,
        request: MessageKind,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Frame, ServiceError> {
        let mut inbox = handle.inbox().await;

        while let Ok(stale) = inbox.try_recv() {
            debug!(worker_id = %self.id, frame = %stale, "discarding stale reply");
        }

        handle
            .send(Message::new(request))
            .map_err(|_| ServiceError::ChannelClosed(self.id.clone()))?;
        debug!(worker_id = %self.id, %request, "sent request");

        self.spin_for_response(&mut inbox, request, timeout, poll)
            .await
    }

    async fn spin_for_response(
        &self,
        inbox: &mut UnboundedReceiver<Frame>,
        request: MessageKind,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Frame, ServiceError> {
        let started = Instant::now();
        loop {
            match inbox.try_recv() {
                Ok(frame) => return Ok(frame),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(ServiceError::ChannelClosed(self.id.clone()));
                }
            }
            if self.cancel.is_cancelled() {
                return Err(ServiceError::Interrupted(self.id.clone()));
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(ServiceError::Timeout {
                    worker_id: self.id.clone(),
                    request,
                    timeout,
                });
            }
            tokio::time::sleep(poll.min(timeout - elapsed)).await;
        }
    }
}

impl Drop for Delegate {
    fn drop(&mut self) {
        if let Some(handle) = self.state().active.take() {
            handle.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::sensors::{Sensor, SensorError};
    use crate::workers::{InlineLauncher, LaunchError};

    struct Fixed;

    impl Sensor for Fixed {
        fn configure(&mut self, _config: Option<&SensorConfig>) -> Result<(), SensorError> {
            Ok(())
        }

        fn startup(&mut self) -> Result<(), SensorError> {
            Ok(())
        }

        fn read_data(&mut self) -> Result<Option<Record>, SensorError> {
            let mut record = Record::new();
            record.insert("x".to_string(), json!(1));
            Ok(Some(record))
        }

        fn teardown(&mut self) {}

        fn field_names(&self) -> Vec<String> {
            vec!["x".to_string()]
        }

        fn describe(&self, _record: &Record) -> Option<String> {
            None
        }
    }

    struct Unlaunchable {
        attempts: AtomicUsize,
    }

    impl WorkerLauncher for Unlaunchable {
        fn field_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn describe(&self, _record: &Record) -> Option<String> {
            None
        }

        fn launch(
            &self,
            worker_id: &str,
            _config: Option<&SensorConfig>,
        ) -> Result<WorkerHandle, LaunchError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(LaunchError::UnknownKind(worker_id.to_string()))
        }
    }

    fn settings() -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_timeout: Duration::from_millis(500),
            heartbeat_poll: Duration::from_millis(5),
            ..SupervisorConfig::default()
        }
    }

    fn fixed_delegate() -> Delegate {
        let launcher = InlineLauncher::new(Arc::new(|| Box::new(Fixed) as Box<dyn Sensor>));
        Delegate::new(
            WorkerSpec::new("fixed", launcher),
            settings(),
            CancellationToken::new(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_and_read() {
        let delegate = fixed_delegate();
        assert_eq!(delegate.status(), ServiceStatus::NotStarted);

        assert!(delegate.start(true).await.expect("start"));
        assert_eq!(delegate.status(), ServiceStatus::Running);
        assert!(delegate.should_reboot());

        let record = delegate
            .get_data(Duration::from_millis(500))
            .await
            .expect("record");
        assert_eq!(record.get("x"), Some(&json!(1)));
        assert_eq!(delegate.snapshot().health_events, 2);

        assert!(matches!(
            delegate.start(true).await,
            Err(ServiceError::AlreadyRunning(_))
        ));

        delegate.stop(false);
        assert_eq!(delegate.status(), ServiceStatus::Stopped);
        assert!(delegate.get_data(Duration::from_millis(50)).await.is_none());
        assert!(delegate.is_healthy());
    }

    #[tokio::test]
    async fn test_launch_failure_stops_ill() {
        let launcher = Unlaunchable {
            attempts: AtomicUsize::new(0),
        };
        let delegate = Delegate::new(
            WorkerSpec::new("ghost", launcher),
            settings(),
            CancellationToken::new(),
        );

        assert!(!delegate.start(true).await.expect("start"));
        assert_eq!(delegate.status(), ServiceStatus::StoppedIll);
        assert!(!delegate.is_healthy());
        assert!(delegate.should_reboot());
        assert!(
            delegate
                .last_error()
                .expect("last error")
                .contains("unknown sensor kind")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_configure_rejected_while_running() {
        let delegate = fixed_delegate();
        delegate.configure(json!({"port": 1})).expect("configure");
        delegate.start(true).await.expect("start");

        assert_eq!(
            delegate.configure(json!({"port": 2})),
            Err(ConfigurationError::Running("fixed".to_string()))
        );
        assert_eq!(delegate.config(), Some(json!({"port": 1})));

        delegate.stop(false);
        delegate.configure(json!({"port": 2})).expect("configure");
        assert_eq!(delegate.config(), Some(json!({"port": 2})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stale_critical_error_spares_new_worker() {
        let delegate = fixed_delegate();
        delegate.start(true).await.expect("start");

        delegate.handle_error(
            ServiceError::critical("fixed", "late failure"),
            Some(Uuid::new_v4()),
        );
        assert_eq!(delegate.status(), ServiceStatus::Running);
        assert_eq!(
            delegate.last_error().as_deref(),
            Some("worker fixed: late failure")
        );

        delegate.handle_error(ServiceError::Interrupted("fixed".to_string()), None);
        assert_eq!(delegate.snapshot().health_events, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_request_is_not_penalised() {
        let cancel = CancellationToken::new();
        let launcher = InlineLauncher::new(Arc::new(|| Box::new(Fixed) as Box<dyn Sensor>));
        let delegate = Delegate::new(WorkerSpec::new("fixed", launcher), settings(), cancel.clone());
        delegate.start(true).await.expect("start");
        let events = delegate.snapshot().health_events;

        cancel.cancel();
        // the reply may still win the race; either way nothing is penalised
        let _ = delegate.get_data(Duration::from_millis(500)).await;
        let snapshot = delegate.snapshot();
        assert_eq!(snapshot.status, ServiceStatus::Running);
        assert!(snapshot.health_events <= events + 1);
        assert!(snapshot.last_error.is_none());
    }
}
