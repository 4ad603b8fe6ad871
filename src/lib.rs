//! Senseloop - supervision and fixed-rate sampling of isolated sensor workers.

pub mod config;
pub mod messages;
pub mod observability;
pub mod sensors;
pub mod supervisor;
pub mod workers;

pub use config::{Config, Isolation, SupervisorConfig};
pub use messages::{Frame, Message, MessageError, MessageKind};
pub use observability::{LogContext, ObservabilityOptions};
pub use sensors::{Record, Sensor, SensorConfig, SensorError, SensorFactory};
pub use supervisor::{
    ConfigurationError, Delegate, DelegateSnapshot, Manager, RebootSchedule, ServiceError,
    ServiceStatus, SupervisorError,
};
pub use workers::{
    InlineLauncher, LaunchError, ProcessLauncher, ProcessWorkerConfig, WorkerHandle,
    WorkerLauncher, WorkerRuntime, WorkerSpec,
};
