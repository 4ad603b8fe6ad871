//! Supervision of isolated sensor workers: per-worker delegates with health
//! tracking and restart backoff, and the manager that samples them all at a
//! fixed rate.

pub mod backoff;
mod delegate;
mod error;
pub mod health;
mod manager;
mod status;

pub use backoff::{RebootDecision, RebootSchedule, RebootState};
pub use delegate::{Delegate, DelegateSnapshot};
pub use error::{ConfigurationError, ServiceError, Severity, SupervisorError};
pub use health::HealthWindow;
pub use manager::{FALLBACK_TICK_INTERVAL, Manager, TIMESTAMP_FIELD, tick_interval};
pub use status::ServiceStatus;
