//! Example sensors used for local runs and soak testing of the supervisor.
//!
//! Neither touches hardware: they report the current wall-clock time after a
//! random delay, optionally failing at a configured rate.

use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use super::{Record, Sensor, SensorConfig, SensorError};

#[derive(Debug, Clone, Default, Deserialize)]
struct ExampleSettings {
    failure_rate: Option<f64>,
    startup_failure_rate: Option<f64>,
    max_delay_ms: Option<u64>,
}

impl ExampleSettings {
    fn parse(config: Option<&SensorConfig>) -> Result<Self, SensorError> {
        let settings = match config {
            None | Some(Value::Null) => Self::default(),
            Some(value @ Value::Object(_)) => Self::deserialize(value)
                .map_err(|err| SensorError::Configuration(err.to_string()))?,
            Some(other) => {
                return Err(SensorError::Configuration(format!(
                    "expected an object, got {other}"
                )));
            }
        };
        for rate in [settings.failure_rate, settings.startup_failure_rate]
            .into_iter()
            .flatten()
        {
            if !(0.0..=1.0).contains(&rate) {
                return Err(SensorError::Configuration(format!(
                    "rate {rate} outside [0, 1]"
                )));
            }
        }
        Ok(settings)
    }
}

fn timestamp_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn random_delay(max: Duration) {
    if !max.is_zero() {
        thread::sleep(max.mul_f64(rand::random::<f64>()));
    }
}

fn describe_time(record: &Record, field: &str) -> Option<String> {
    record
        .get(field)
        .and_then(Value::as_f64)
        .map(|value| format!("Time: {value:.5}"))
}

/// Fast sensor: answers within `max_delay_ms` (default 100 ms).
#[derive(Debug)]
pub struct ExampleSensor {
    failure_rate: f64,
    max_delay: Duration,
}

impl ExampleSensor {
    pub const KIND: &'static str = "example";
    pub const FIELD: &'static str = "test";
}

impl Default for ExampleSensor {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            max_delay: Duration::from_millis(100),
        }
    }
}

impl Sensor for ExampleSensor {
    fn configure(&mut self, config: Option<&SensorConfig>) -> Result<(), SensorError> {
        let settings = ExampleSettings::parse(config)?;
        if let Some(rate) = settings.failure_rate {
            self.failure_rate = rate;
        }
        if let Some(delay) = settings.max_delay_ms {
            self.max_delay = Duration::from_millis(delay);
        }
        Ok(())
    }

    fn startup(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read_data(&mut self) -> Result<Option<Record>, SensorError> {
        random_delay(self.max_delay);
        if rand::random::<f64>() < self.failure_rate {
            return Err(SensorError::Data("simulated read failure".to_string()));
        }
        let mut record = Record::new();
        record.insert(Self::FIELD.to_string(), Value::from(timestamp_secs()));
        Ok(Some(record))
    }

    fn teardown(&mut self) {}

    fn field_names(&self) -> Vec<String> {
        vec![Self::FIELD.to_string()]
    }

    fn describe(&self, record: &Record) -> Option<String> {
        describe_time(record, Self::FIELD)
    }
}

/// Slow, flaky sensor: fails startup a quarter of the time and may take up
/// to two seconds per sample.
#[derive(Debug)]
pub struct ExampleLongSensor {
    startup_failure_rate: f64,
    max_delay: Duration,
}

impl ExampleLongSensor {
    pub const KIND: &'static str = "example_long";
    pub const FIELD: &'static str = "test_long";
}

impl Default for ExampleLongSensor {
    fn default() -> Self {
        Self {
            startup_failure_rate: 0.25,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl Sensor for ExampleLongSensor {
    fn configure(&mut self, config: Option<&SensorConfig>) -> Result<(), SensorError> {
        let settings = ExampleSettings::parse(config)?;
        if let Some(rate) = settings.startup_failure_rate {
            self.startup_failure_rate = rate;
        }
        if let Some(delay) = settings.max_delay_ms {
            self.max_delay = Duration::from_millis(delay);
        }
        Ok(())
    }

    fn startup(&mut self) -> Result<(), SensorError> {
        if rand::random::<f64>() < self.startup_failure_rate {
            return Err(SensorError::Startup("simulated startup failure".to_string()));
        }
        Ok(())
    }

    fn read_data(&mut self) -> Result<Option<Record>, SensorError> {
        random_delay(self.max_delay);
        let mut record = Record::new();
        record.insert(Self::FIELD.to_string(), Value::from(timestamp_secs()));
        Ok(Some(record))
    }

    fn teardown(&mut self) {}

    fn field_names(&self) -> Vec<String> {
        vec![Self::FIELD.to_string()]
    }

    fn describe(&self, record: &Record) -> Option<String> {
        describe_time(record, Self::FIELD)
    }
}
