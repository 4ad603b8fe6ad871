//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `SENSELOOP_SAMPLE_RATE`: Monitor sample rate in Hz (default: 5)
//! - `SENSELOOP_LOG_DIR`: Base directory for per-run log directories (default: data)
//! - `SENSELOOP_HEARTBEAT_TIMEOUT_MS`: Heartbeat response timeout (default: 1000)
//! - `SENSELOOP_HEARTBEAT_POLL_MS`: Heartbeat response poll interval (default: 100)
//! - `SENSELOOP_REBOOT_SCHEDULE_SECS`: Comma-separated restart backoff (default: 1,10,20,50,150)
//! - `SENSELOOP_WORKERS`: Comma-separated sensor kinds to supervise (default: example,example_long)
//! - `SENSELOOP_ISOLATION`: `process` or `thread` (default: process)
//! - `SENSELOOP_WORKER_CONFIG`: Path to a JSON object mapping worker id to its configuration (optional)

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

use crate::sensors::SensorConfig;
use crate::supervisor::backoff::RebootSchedule;
use crate::supervisor::health::{
    DEFAULT_CAPACITY, DEFAULT_MIN_SAMPLES, DEFAULT_MIN_SUCCESS_RATIO, HealthWindow,
};

pub const DEFAULT_SAMPLE_RATE: f64 = 5.0;
pub const DEFAULT_LOG_DIR: &str = "data";
pub const DEFAULT_WORKERS: &str = "example,example_long";

/// How worker runtimes are isolated from the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// One child process per worker.
    #[default]
    Process,
    /// One OS thread per worker inside the supervisor process.
    Thread,
}

impl FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            other => Err(anyhow!("unknown isolation mode {other:?}")),
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Thread => "thread",
        })
    }
}

/// Timing and health policy shared by every delegate.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a worker has to answer a heartbeat
    pub heartbeat_timeout: Duration,

    /// Poll interval while waiting for a heartbeat answer
    pub heartbeat_poll: Duration,

    /// Delay before each automatic restart attempt
    pub reboot_schedule: RebootSchedule,

    pub health_capacity: usize,
    pub health_min_samples: usize,
    pub health_min_success_ratio: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(1),
            heartbeat_poll: Duration::from_millis(100),
            reboot_schedule: RebootSchedule::default(),
            health_capacity: DEFAULT_CAPACITY,
            health_min_samples: DEFAULT_MIN_SAMPLES,
            health_min_success_ratio: DEFAULT_MIN_SUCCESS_RATIO,
        }
    }
}

impl SupervisorConfig {
    pub fn health_window(&self) -> HealthWindow {
        HealthWindow::new(
            self.health_capacity,
            self.health_min_samples,
            self.health_min_success_ratio,
        )
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Records yielded per second by the monitor loop
    pub sample_rate: f64,

    /// Base directory; each run logs under `<log_dir>/YYYYMMDD`
    pub log_dir: PathBuf,

    /// Sensor kinds to register; the kind doubles as the worker id
    pub workers: Vec<String>,

    pub isolation: Isolation,

    /// Optional JSON file with per-worker configuration blobs
    pub worker_config_path: Option<PathBuf>,

    pub supervisor: SupervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            workers: split_list(DEFAULT_WORKERS),
            isolation: Isolation::default(),
            worker_config_path: None,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SENSELOOP_SAMPLE_RATE") {
            let rate: f64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid SENSELOOP_SAMPLE_RATE {raw:?}"))?;
            if !rate.is_finite() || rate <= 0.0 {
                bail!("SENSELOOP_SAMPLE_RATE must be a positive number, got {raw:?}");
            }
            config.sample_rate = rate;
        }

        if let Some(dir) = lookup("SENSELOOP_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if let Some(raw) = lookup("SENSELOOP_HEARTBEAT_TIMEOUT_MS") {
            config.supervisor.heartbeat_timeout =
                parse_millis("SENSELOOP_HEARTBEAT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("SENSELOOP_HEARTBEAT_POLL_MS") {
            config.supervisor.heartbeat_poll = parse_millis("SENSELOOP_HEARTBEAT_POLL_MS", &raw)?;
        }

        if let Some(raw) = lookup("SENSELOOP_REBOOT_SCHEDULE_SECS") {
            let delays = split_list(&raw)
                .iter()
                .map(|item| item.parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid SENSELOOP_REBOOT_SCHEDULE_SECS {raw:?}"))?;
            config.supervisor.reboot_schedule = RebootSchedule::from_secs(&delays);
        }

        if let Some(raw) = lookup("SENSELOOP_WORKERS") {
            config.workers = split_list(&raw);
        }

        if let Some(raw) = lookup("SENSELOOP_ISOLATION") {
            config.isolation = raw.parse().context("invalid SENSELOOP_ISOLATION")?;
        }

        config.worker_config_path = lookup("SENSELOOP_WORKER_CONFIG")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(config)
    }

    /// Per-worker configuration blobs, empty when no file is configured.
    pub fn worker_configs(&self) -> Result<HashMap<String, SensorConfig>> {
        match &self.worker_config_path {
            Some(path) => load_worker_configs(path),
            None => Ok(HashMap::new()),
        }
    }

    /// Create a test configuration with thread isolation and short timeouts.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            isolation: Isolation::Thread,
            supervisor: SupervisorConfig {
                heartbeat_timeout: Duration::from_millis(500),
                heartbeat_poll: Duration::from_millis(5),
                ..SupervisorConfig::default()
            },
            ..Self::default()
        }
    }
}

fn parse_millis(name: &str, raw: &str) -> Result<Duration> {
    let millis: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid {name} {raw:?}"))?;
    Ok(Duration::from_millis(millis))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_worker_configs(path: &Path) -> Result<HashMap<String, SensorConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read worker config {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("worker config {} is not valid JSON", path.display()))?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => bail!(
            "worker config {} must be a JSON object keyed by worker id",
            path.display()
        ),
    }
}
