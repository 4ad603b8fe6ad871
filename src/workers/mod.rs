//! Isolated worker execution: the worker-side runtime loop, the supervisor's
//! handle to a running worker, and the launchers that create them.

mod handle;
mod launcher;
pub mod runtime;

pub use handle::{STOP_GRACE, WorkerHandle};
pub use launcher::{
    InlineLauncher, LaunchError, ProcessLauncher, ProcessWorkerConfig, WORKER_ID_ENV,
    WORKER_SETTINGS_ENV, WorkerLauncher, WorkerSpec,
};
pub use runtime::{RuntimeExit, WorkerRuntime};
