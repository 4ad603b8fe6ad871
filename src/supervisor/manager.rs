//! Registry of delegates and the fixed-rate sampling loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, Stream};
use metrics::counter;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delegate::{Delegate, DelegateSnapshot};
use super::error::{ConfigurationError, SupervisorError};
use crate::config::SupervisorConfig;
use crate::sensors::{Record, SensorConfig};
use crate::workers::WorkerSpec;

/// Leading column of the logging collaborator's header.
pub const TIMESTAMP_FIELD: &str = "timestamp";

struct Registry {
    /// Registration order.
    delegates: Vec<Arc<Delegate>>,
    index: HashMap<String, usize>,
}

impl Registry {
    fn get(&self, id: &str) -> Result<&Arc<Delegate>, ConfigurationError> {
        self.index
            .get(id)
            .map(|&slot| &self.delegates[slot])
            .ok_or_else(|| ConfigurationError::UnknownWorker(id.to_string()))
    }

    fn running(&self) -> impl Iterator<Item = &Arc<Delegate>> {
        self.delegates.iter().filter(|delegate| delegate.is_running())
    }
}

pub struct Manager {
    registry: Arc<Registry>,
    maintenance: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl Manager {
    /// Build the registry. The set of workers is fixed for the manager's
    /// lifetime; a repeated identity is rejected.
    pub fn register<I>(workers: I, settings: SupervisorConfig) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = WorkerSpec>,
    {
        let cancel = CancellationToken::new();
        let mut delegates = Vec::new();
        let mut index = HashMap::new();
        for spec in workers {
            if index.contains_key(&spec.id) {
                return Err(ConfigurationError::DuplicateWorker(spec.id));
            }
            index.insert(spec.id.clone(), delegates.len());
            delegates.push(Arc::new(Delegate::new(
                spec,
                settings.clone(),
                cancel.child_token(),
            )));
        }
        info!(workers = delegates.len(), "registered workers");
        Ok(Self {
            registry: Arc::new(Registry { delegates, index }),
            maintenance: Arc::new(Mutex::new(())),
            cancel,
        })
    }

    pub fn delegate(&self, id: &str) -> Result<Arc<Delegate>, ConfigurationError> {
        self.registry.get(id).cloned()
    }

    /// Registered identities in registration order.
    pub fn service_ids(&self) -> Vec<String> {
        self.registry
            .delegates
            .iter()
            .map(|delegate| delegate.id().to_string())
            .collect()
    }

    pub fn configure(&self, id: &str, config: SensorConfig) -> Result<(), ConfigurationError> {
        self.registry.get(id)?.configure(config)
    }

    /// Manually start every registered worker, one after another. Returns how
    /// many are running afterwards.
    pub async fn start(&self) -> usize {
        for delegate in &self.registry.delegates {
            match delegate.start(true).await {
                Ok(true) => {}
                Ok(false) => warn!(worker_id = %delegate.id(), "worker failed to start"),
                Err(err) => debug!(worker_id = %delegate.id(), error = %err, "start skipped"),
            }
        }
        self.registry.running().count()
    }

    pub async fn start_service(&self, id: &str) -> Result<bool, SupervisorError> {
        let delegate = self.registry.get(id)?;
        Ok(delegate.start(true).await?)
    }

    /// Stop a running worker; it stays down until started again. Returns
    /// `false` if it was not running.
    pub fn terminate_service(&self, id: &str) -> Result<bool, ConfigurationError> {
        let delegate = self.registry.get(id)?;
        if !delegate.is_running() {
            info!(worker_id = %id, "terminate requested for a worker that is not running");
            return Ok(false);
        }
        delegate.stop(false);
        Ok(true)
    }

    pub fn get_active_services(&self) -> Vec<String> {
        self.registry
            .running()
            .map(|delegate| delegate.id().to_string())
            .collect()
    }

    pub fn get_healthy_services(&self) -> Vec<String> {
        self.registry
            .delegates
            .iter()
            .filter(|delegate| delegate.is_healthy())
            .map(|delegate| delegate.id().to_string())
            .collect()
    }

    pub fn service_snapshot(&self, id: &str) -> Result<DelegateSnapshot, ConfigurationError> {
        Ok(self.registry.get(id)?.snapshot())
    }

    pub fn snapshots(&self) -> Vec<DelegateSnapshot> {
        self.registry
            .delegates
            .iter()
            .map(|delegate| delegate.snapshot())
            .collect()
    }

    /// Header for persisted rows: the timestamp column followed by every
    /// worker's fields, first occurrence wins.
    pub fn field_names(&self) -> Vec<String> {
        let mut names = vec![TIMESTAMP_FIELD.to_string()];
        for delegate in &self.registry.delegates {
            for name in delegate.field_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// One-sentence summary of the healthy, running workers and their latest
    /// readings.
    pub fn describe_healthy(&self, record: &Record) -> String {
        let healthy: Vec<&Arc<Delegate>> = self
            .registry
            .delegates
            .iter()
            .filter(|delegate| delegate.is_running() && delegate.is_healthy())
            .collect();
        if healthy.is_empty() {
            return "No services healthy".to_string();
        }

        let ids: Vec<&str> = healthy.iter().map(|delegate| delegate.id()).collect();
        let mut message = format!(
            "The following services are healthy and running: {};;",
            ids.join(",")
        );
        for delegate in healthy {
            if let Some(summary) = delegate.describe(record) {
                message.push_str(&format!(" {} has {}.", delegate.id(), summary));
            }
        }
        message
    }

    /// Request one record from every running worker concurrently and merge
    /// the answers. Workers that fail are skipped; on a field collision the
    /// later worker wins.
    pub async fn collect_tick(&self, timeout: Duration) -> Record {
        collect(&self.registry, timeout).await
    }

    /// Stop every unhealthy worker that should be restarted, then try to
    /// restart it. Returns immediately if another pass is still running.
    pub async fn maintain(&self) {
        maintain(self.registry.clone(), self.maintenance.clone()).await;
    }

    /// Endless stream of merged records, one per tick at `sample_rate` Hz.
    ///
    /// After each record is taken, a maintenance pass is spawned in the
    /// background; it may still be running while the next tick collects. The
    /// stream ends once the manager is shut down.
    pub fn monitor(&self, sample_rate: f64) -> impl Stream<Item = Record> + Send + 'static {
        let interval = tick_interval(sample_rate);
        let state = MonitorState {
            registry: self.registry.clone(),
            maintenance: self.maintenance.clone(),
            cancel: self.cancel.clone(),
            interval,
            last_tick: None,
        };
        info!(sample_rate, ?interval, "monitor started");

        stream::unfold(state, |mut state| async move {
            if let Some(last_tick) = state.last_tick {
                tokio::spawn(maintain(state.registry.clone(), state.maintenance.clone()));

                let pause = state.interval.saturating_sub(last_tick.elapsed());
                tokio::select! {
                    _ = state.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(pause) => {}
                }
                debug!(
                    achieved_hz = 1.0 / last_tick.elapsed().as_secs_f64().max(f64::EPSILON),
                    "tick pacing"
                );
            }
            if state.cancel.is_cancelled() {
                return None;
            }

            state.last_tick = Some(Instant::now());
            let record = collect(&state.registry, state.interval).await;
            Some((record, state))
        })
    }

    /// Interrupt flag observed by in-flight requests and the monitor stream.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Interrupt in-flight requests, end the monitor stream and stop every
    /// worker.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for delegate in &self.registry.delegates {
            delegate.stop(false);
        }
        info!("manager shut down");
    }
}

/// Fallback period for a sample rate that is not a positive, finite number.
pub const FALLBACK_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Period for `sample_rate` Hz; unusable rates fall back to one second.
pub fn tick_interval(sample_rate: f64) -> Duration {
    match Duration::try_from_secs_f64(1.0 / sample_rate) {
        Ok(interval) if sample_rate.is_finite() && !interval.is_zero() => interval,
        _ => {
            warn!(
                sample_rate,
                fallback = ?FALLBACK_TICK_INTERVAL,
                "unusable sample rate; falling back"
            );
            FALLBACK_TICK_INTERVAL
        }
    }
}

struct MonitorState {
    registry: Arc<Registry>,
    maintenance: Arc<Mutex<()>>,
    cancel: CancellationToken,
    interval: Duration,
    last_tick: Option<Instant>,
}

async fn collect(registry: &Registry, timeout: Duration) -> Record {
    let requests = registry
        .running()
        .map(|delegate| delegate.get_data(timeout))
        .collect::<Vec<_>>();
    let answers = join_all(requests).await;

    let mut merged = Record::new();
    for record in answers.into_iter().flatten() {
        merged.extend(record);
    }
    counter!("senseloop_ticks_total").increment(1);
    merged
}

async fn maintain(registry: Arc<Registry>, gate: Arc<Mutex<()>>) {
    let Ok(_pass) = gate.try_lock() else {
        debug!("maintenance pass already running");
        return;
    };
    for delegate in &registry.delegates {
        if delegate.evict_if_unhealthy() {
            info!(worker_id = %delegate.id(), "unhealthy worker evicted");
            delegate.try_reboot().await;
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
