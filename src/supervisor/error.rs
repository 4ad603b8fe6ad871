use std::time::Duration;

use thiserror::Error;

use crate::messages::MessageKind;
use crate::workers::LaunchError;

/// Programming or setup mistakes; never recovered automatically.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("worker {0} is already registered")]
    DuplicateWorker(String),
    #[error("worker {0} is not registered")]
    UnknownWorker(String),
    #[error("worker {0} is running; stop it before changing its configuration")]
    Running(String),
}

/// How the delegate reacts to a failed interaction with its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Health penalty only.
    Transient,
    /// Health penalty and the worker is stopped as ill.
    Critical,
    /// Not the worker's fault; nothing is recorded.
    Ignored,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("worker {worker_id} did not answer {request} within {timeout:?}")]
    Timeout {
        worker_id: String,
        request: MessageKind,
        timeout: Duration,
    },
    #[error("worker {worker_id}: {message}")]
    Service {
        worker_id: String,
        message: String,
        critical: bool,
    },
    #[error("worker {0} closed its channel")]
    ChannelClosed(String),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("worker {0} is already running")]
    AlreadyRunning(String),
    #[error("request to worker {0} interrupted")]
    Interrupted(String),
}

/// Failure of a manager operation addressed to one worker.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ServiceError {
    pub fn transient(worker_id: &str, message: impl Into<String>) -> Self {
        Self::Service {
            worker_id: worker_id.to_string(),
            message: message.into(),
            critical: false,
        }
    }

    pub fn critical(worker_id: &str, message: impl Into<String>) -> Self {
        Self::Service {
            worker_id: worker_id.to_string(),
            message: message.into(),
            critical: true,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Timeout { .. } => Severity::Transient,
            Self::Service { critical, .. } => {
                if *critical {
                    Severity::Critical
                } else {
                    Severity::Transient
                }
            }
            Self::ChannelClosed(_) | Self::Launch(_) | Self::AlreadyRunning(_) => {
                Severity::Critical
            }
            Self::Interrupted(_) => Severity::Ignored,
        }
    }
}
