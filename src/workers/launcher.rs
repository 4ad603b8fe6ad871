//! How a delegate builds a fresh worker for every (re)start.

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;

use super::handle::WorkerHandle;
use crate::observability::LogContext;
use crate::sensors::{self, Record, SensorConfig, SensorFactory};

/// Environment variable carrying the worker identity into a child process.
pub const WORKER_ID_ENV: &str = "SENSELOOP_WORKER_ID";
/// Environment variable carrying the JSON configuration blob into a child process.
pub const WORKER_SETTINGS_ENV: &str = "SENSELOOP_WORKER_SETTINGS";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {worker_id} is missing its {stream} pipe")]
    MissingPipe {
        worker_id: String,
        stream: &'static str,
    },
    #[error("no tokio runtime available to host worker {0}")]
    NoRuntime(String),
    #[error("failed to open log file for worker {worker_id}: {source}")]
    LogFile {
        worker_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode configuration for worker {worker_id}: {source}")]
    Config {
        worker_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown sensor kind: {0}")]
    UnknownKind(String),
    #[error("cannot locate the senseloop executable: {0}")]
    CurrentExe(#[source] std::io::Error),
}

/// Builds isolated workers for one registered identity.
pub trait WorkerLauncher: Send + Sync {
    /// Field names the launched worker reports.
    fn field_names(&self) -> Vec<String>;

    /// Human-readable summary of one record from this worker.
    fn describe(&self, record: &Record) -> Option<String>;

    /// Start a new worker constructed with `config`.
    fn launch(
        &self,
        worker_id: &str,
        config: Option<&SensorConfig>,
    ) -> Result<WorkerHandle, LaunchError>;
}

/// Hosts a sensor on a dedicated thread of the supervisor process.
#[derive(Clone)]
pub struct InlineLauncher {
    factory: SensorFactory,
}

impl InlineLauncher {
    pub fn new(factory: SensorFactory) -> Self {
        Self { factory }
    }

    pub fn for_kind(kind: &str) -> Result<Self, LaunchError> {
        sensors::factory_for(kind)
            .map(Self::new)
            .ok_or_else(|| LaunchError::UnknownKind(kind.to_string()))
    }
}

impl fmt::Debug for InlineLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineLauncher").finish_non_exhaustive()
    }
}

impl WorkerLauncher for InlineLauncher {
    fn field_names(&self) -> Vec<String> {
        (self.factory)().field_names()
    }

    fn describe(&self, record: &Record) -> Option<String> {
        (self.factory)().describe(record)
    }

    fn launch(
        &self,
        worker_id: &str,
        config: Option<&SensorConfig>,
    ) -> Result<WorkerHandle, LaunchError> {
        WorkerHandle::spawn_thread(worker_id, (self.factory)(), config.cloned())
    }
}

#[derive(Clone, Debug)]
pub struct ProcessWorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub field_names: Vec<String>,
    pub env: HashMap<String, String>,
    /// Child stderr goes to `<log_dir>/<worker_id>.log` when set; otherwise it
    /// is inherited.
    pub log_dir: Option<PathBuf>,
}

impl ProcessWorkerConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            field_names: Vec::new(),
            env: HashMap::new(),
            log_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_field_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Runs each worker as a child process speaking JSON lines on stdin/stdout.
#[derive(Clone)]
pub struct ProcessLauncher {
    config: ProcessWorkerConfig,
    describer: Option<SensorFactory>,
}

impl ProcessLauncher {
    pub fn new(config: ProcessWorkerConfig) -> Self {
        Self {
            config,
            describer: None,
        }
    }

    /// Re-invoke this executable's `worker` subcommand for a built-in kind.
    pub fn self_hosted(kind: &str, log: Option<&LogContext>) -> Result<Self, LaunchError> {
        let factory =
            sensors::factory_for(kind).ok_or_else(|| LaunchError::UnknownKind(kind.to_string()))?;
        let program = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
        let mut config = ProcessWorkerConfig::new(program)
            .with_args(["worker", "--kind", kind])
            .with_field_names(factory().field_names());
        config.log_dir = log.map(|log| log.dir().to_path_buf());
        Ok(Self {
            config,
            describer: Some(factory),
        })
    }

    pub fn config(&self) -> &ProcessWorkerConfig {
        &self.config
    }

    fn command(
        &self,
        worker_id: &str,
        config: Option<&SensorConfig>,
    ) -> Result<Command, LaunchError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .env(WORKER_ID_ENV, worker_id);
        if let Some(config) = config {
            let encoded = serde_json::to_string(config).map_err(|source| LaunchError::Config {
                worker_id: worker_id.to_string(),
                source,
            })?;
            command.env(WORKER_SETTINGS_ENV, encoded);
        } else {
            command.env_remove(WORKER_SETTINGS_ENV);
        }

        match &self.config.log_dir {
            Some(dir) => {
                let path = dir.join(format!("{worker_id}.log"));
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|source| LaunchError::LogFile {
                        worker_id: worker_id.to_string(),
                        source,
                    })?;
                command.stderr(Stdio::from(file));
            }
            None => {
                command.stderr(Stdio::inherit());
            }
        }
        Ok(command)
    }
}

impl fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLauncher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn field_names(&self) -> Vec<String> {
        self.config.field_names.clone()
    }

    fn describe(&self, record: &Record) -> Option<String> {
        self.describer
            .as_ref()
            .and_then(|factory| factory().describe(record))
    }

    fn launch(
        &self,
        worker_id: &str,
        config: Option<&SensorConfig>,
    ) -> Result<WorkerHandle, LaunchError> {
        let command = self.command(worker_id, config)?;
        WorkerHandle::spawn_process(worker_id, command)
    }
}

/// One registry entry: a worker identity and how to launch it.
#[derive(Clone)]
pub struct WorkerSpec {
    pub id: String,
    pub launcher: Arc<dyn WorkerLauncher>,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, launcher: impl WorkerLauncher + 'static) -> Self {
        Self {
            id: id.into(),
            launcher: Arc::new(launcher),
        }
    }
}

impl fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_launcher_for_unknown_kind() {
        assert!(matches!(
            InlineLauncher::for_kind("co2"),
            Err(LaunchError::UnknownKind(kind)) if kind == "co2"
        ));
        let launcher = InlineLauncher::for_kind("example").expect("example kind");
        assert_eq!(launcher.field_names(), vec!["test".to_string()]);
    }

    #[test]
    fn test_process_launcher_reports_configured_fields() {
        let launcher = ProcessLauncher::new(
            ProcessWorkerConfig::new("/bin/sh")
                .with_args(["-c", "exit 0"])
                .with_field_names(["pm25", "pm10"]),
        );
        assert_eq!(
            launcher.field_names(),
            vec!["pm25".to_string(), "pm10".to_string()]
        );
        assert_eq!(launcher.describe(&Record::new()), None);
    }

    #[test]
    fn test_self_hosted_uses_worker_subcommand() {
        let launcher = ProcessLauncher::self_hosted("example_long", None).expect("launcher");
        assert_eq!(launcher.config().args, vec!["worker", "--kind", "example_long"]);
        assert_eq!(launcher.field_names(), vec!["test_long".to_string()]);
    }
}
