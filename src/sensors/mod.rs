//! Worker capability contract.
//!
//! A [`Sensor`] is the data-acquisition logic a worker runs inside its
//! isolation boundary. The supervisor never calls a sensor directly: it only
//! talks to the worker runtime hosting it (see [`crate::workers::runtime`]).

mod example;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub use example::{ExampleLongSensor, ExampleSensor};

/// One sample: field name to value.
pub type Record = BTreeMap<String, Value>;

/// Opaque per-worker configuration blob.
pub type SensorConfig = Value;

/// Builds a fresh sensor instance for every worker launch.
pub type SensorFactory = Arc<dyn Fn() -> Box<dyn Sensor> + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("startup error: {0}")]
    Startup(String),
    #[error("data error: {0}")]
    Data(String),
}

/// Lifecycle a concrete worker implements.
///
/// `configure` and `startup` run once before the request loop; `teardown` is
/// invoked exactly once when the loop ends, whether or not startup succeeded.
pub trait Sensor: Send {
    /// Apply configuration before any hardware access.
    fn configure(&mut self, config: Option<&SensorConfig>) -> Result<(), SensorError>;

    /// Acquire hardware or network resources.
    fn startup(&mut self) -> Result<(), SensorError>;

    /// Produce one sample, or `None` if nothing is available right now.
    fn read_data(&mut self) -> Result<Option<Record>, SensorError>;

    /// Release resources.
    fn teardown(&mut self);

    /// Stable schema used by the logging collaborator.
    fn field_names(&self) -> Vec<String>;

    /// Human-readable summary of one record.
    fn describe(&self, record: &Record) -> Option<String>;
}

/// Built-in sensor kinds that can be hosted by the `senseloop worker` entry
/// point or registered by name.
pub fn catalog() -> Vec<(&'static str, SensorFactory)> {
    vec![
        (
            ExampleSensor::KIND,
            Arc::new(|| Box::new(ExampleSensor::default()) as Box<dyn Sensor>),
        ),
        (
            ExampleLongSensor::KIND,
            Arc::new(|| Box::new(ExampleLongSensor::default()) as Box<dyn Sensor>),
        ),
    ]
}

/// Look up a built-in sensor kind.
pub fn factory_for(kind: &str) -> Option<SensorFactory> {
    catalog()
        .into_iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, factory)| factory)
}
