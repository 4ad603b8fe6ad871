use std::fmt;

use serde::Serialize;

/// Lifecycle state of one supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    #[default]
    NotStarted,
    Running,
    Stopped,
    StoppedIll,
    WaitingToReboot,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::StoppedIll => "STOPPED_ILL",
            Self::WaitingToReboot => "WAITING_TO_REBOOT",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
