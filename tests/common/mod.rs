//! Scripted sensors and settings shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use senseloop::{
    InlineLauncher, Record, RebootSchedule, Sensor, SensorConfig, SensorError, SupervisorConfig,
    WorkerSpec,
};

/// Fast supervision timings; restarts are always due.
pub fn fast_settings() -> SupervisorConfig {
    SupervisorConfig {
        heartbeat_timeout: Duration::from_millis(500),
        heartbeat_poll: Duration::from_millis(5),
        reboot_schedule: RebootSchedule::new(vec![Duration::ZERO; 5]),
        ..SupervisorConfig::default()
    }
}

fn record(field: &str, value: Value) -> Record {
    let mut record = Record::new();
    record.insert(field.to_string(), value);
    record
}

/// Answers every read with `{field: value}`.
pub struct Constant {
    pub field: String,
    pub value: Value,
}

impl Sensor for Constant {
    fn configure(&mut self, _config: Option<&SensorConfig>) -> Result<(), SensorError> {
        Ok(())
    }

    fn startup(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read_data(&mut self) -> Result<Option<Record>, SensorError> {
        Ok(Some(record(&self.field, self.value.clone())))
    }

    fn teardown(&mut self) {}

    fn field_names(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn describe(&self, record: &Record) -> Option<String> {
        record
            .get(&self.field)
            .map(|value| format!("{} = {value}", self.field))
    }
}

pub fn constant(id: &str, field: &str, value: Value) -> WorkerSpec {
    let field = field.to_string();
    WorkerSpec::new(
        id,
        InlineLauncher::new(Arc::new(move || {
            Box::new(Constant {
                field: field.clone(),
                value: value.clone(),
            }) as Box<dyn Sensor>
        })),
    )
}

/// Takes far longer than any test timeout to produce a record.
pub struct Sluggish {
    pub field: String,
}

impl Sensor for Sluggish {
    fn configure(&mut self, _config: Option<&SensorConfig>) -> Result<(), SensorError> {
        Ok(())
    }

    fn startup(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read_data(&mut self) -> Result<Option<Record>, SensorError> {
        thread::sleep(Duration::from_secs(5));
        Ok(Some(record(&self.field, json!(true))))
    }

    fn teardown(&mut self) {}

    fn field_names(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn describe(&self, _record: &Record) -> Option<String> {
        None
    }
}

pub fn sluggish(id: &str, field: &str) -> WorkerSpec {
    let field = field.to_string();
    WorkerSpec::new(
        id,
        InlineLauncher::new(Arc::new(move || {
            Box::new(Sluggish {
                field: field.clone(),
            }) as Box<dyn Sensor>
        })),
    )
}

/// Reports its configuration blob back as the `config` field.
pub struct Echo {
    config: Option<SensorConfig>,
}

impl Sensor for Echo {
    fn configure(&mut self, config: Option<&SensorConfig>) -> Result<(), SensorError> {
        self.config = config.cloned();
        Ok(())
    }

    fn startup(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read_data(&mut self) -> Result<Option<Record>, SensorError> {
        Ok(Some(record(
            "config",
            self.config.clone().unwrap_or(Value::Null),
        )))
    }

    fn teardown(&mut self) {}

    fn field_names(&self) -> Vec<String> {
        vec!["config".to_string()]
    }

    fn describe(&self, _record: &Record) -> Option<String> {
        None
    }
}

pub fn echo(id: &str) -> WorkerSpec {
    WorkerSpec::new(
        id,
        InlineLauncher::new(Arc::new(|| Box::new(Echo { config: None }) as Box<dyn Sensor>)),
    )
}

/// Switches shared between a test and every instance of a [`Flaky`] sensor.
#[derive(Clone, Default)]
pub struct FlakyControls {
    pub fail_startup: Arc<AtomicBool>,
    pub panic_on_read: Arc<AtomicBool>,
    pub launches: Arc<AtomicUsize>,
}

/// Startup and reads fail on demand.
pub struct Flaky {
    controls: FlakyControls,
}

impl Sensor for Flaky {
    fn configure(&mut self, _config: Option<&SensorConfig>) -> Result<(), SensorError> {
        Ok(())
    }

    fn startup(&mut self) -> Result<(), SensorError> {
        self.controls.launches.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_startup.load(Ordering::SeqCst) {
            return Err(SensorError::Startup("device not found".to_string()));
        }
        Ok(())
    }

    fn read_data(&mut self) -> Result<Option<Record>, SensorError> {
        if self.controls.panic_on_read.load(Ordering::SeqCst) {
            panic!("bus fault");
        }
        Ok(Some(record("flaky", json!(1))))
    }

    fn teardown(&mut self) {}

    fn field_names(&self) -> Vec<String> {
        vec!["flaky".to_string()]
    }

    fn describe(&self, _record: &Record) -> Option<String> {
        None
    }
}

pub fn flaky(id: &str, controls: &FlakyControls) -> WorkerSpec {
    let controls = controls.clone();
    WorkerSpec::new(
        id,
        InlineLauncher::new(Arc::new(move || {
            Box::new(Flaky {
                controls: controls.clone(),
            }) as Box<dyn Sensor>
        })),
    )
}
