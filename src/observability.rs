//! Tracing initialisation and the per-run log directory.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "trace")]
use std::sync::OnceLock;

#[cfg(feature = "trace")]
use tracing_chrome::FlushGuard;

pub const DEFAULT_FILTER: &str = "senseloop=info";

/// Directory that receives every log file of one run: `<base>/YYYYMMDD`.
///
/// Computed once at startup and handed to whatever needs a log location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContext {
    dir: PathBuf,
}

impl LogContext {
    /// Use today's (local) directory under `base`, creating it if needed.
    pub fn new(base: impl AsRef<Path>) -> io::Result<Self> {
        Self::for_date(base, Local::now().date_naive())
    }

    pub fn for_date(base: impl AsRef<Path>, date: NaiveDate) -> io::Result<Self> {
        let dir = base.as_ref().join(date.format("%Y%m%d").to_string());
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file called `name`.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.log"))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// Also write plain-text logs to `<log dir>/<name>.log`.
    pub log_file: Option<String>,
    /// Chrome trace output; only honoured with the `trace` feature.
    pub trace_path: Option<String>,
}

#[cfg(feature = "trace")]
static TRACE_GUARD: OnceLock<Mutex<Option<FlushGuard>>> = OnceLock::new();

#[cfg(feature = "trace")]
fn store_trace_guard(guard: FlushGuard) {
    let cell = TRACE_GUARD.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = Some(guard);
    }
}

/// Write out any buffered trace events.
#[cfg(feature = "trace")]
pub fn flush() {
    if let Some(cell) = TRACE_GUARD.get()
        && let Ok(mut slot) = cell.lock()
    {
        slot.take();
    }
}

#[cfg(not(feature = "trace"))]
pub fn flush() {}

/// Install the global subscriber: `RUST_LOG` filtering (default
/// `senseloop=info`), human-readable output on stderr, and optionally a
/// plain-text copy in the run's log directory.
pub fn init(options: &ObservabilityOptions, log: Option<&LogContext>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = match (&options.log_file, log) {
        (Some(name), Some(log)) => {
            let path = log.file(name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        _ => None,
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer);

    #[cfg(feature = "trace")]
    {
        let (chrome_layer, trace_guard) = match options.trace_path.clone() {
            Some(path) => {
                let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                    .file(path.clone())
                    .build();
                eprintln!("tracing-chrome enabled (trace at {path})");
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };
        registry
            .with(chrome_layer)
            .try_init()
            .context("tracing init failed")?;
        if let Some(guard) = trace_guard {
            store_trace_guard(guard);
        }
    }

    #[cfg(not(feature = "trace"))]
    {
        if options.trace_path.is_some() {
            eprintln!("Chrome tracing disabled. Rebuild with --features trace.");
        }
        registry.try_init().context("tracing init failed")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context_is_dated() {
        let base = tempfile::tempdir().expect("tempdir");
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).expect("date");

        let context = LogContext::for_date(base.path(), date).expect("context");
        assert_eq!(context.dir(), base.path().join("20240309"));
        assert!(context.dir().is_dir());
        assert_eq!(
            context.file("service_manager"),
            base.path().join("20240309").join("service_manager.log")
        );

        // creating it again is fine
        assert_eq!(
            LogContext::for_date(base.path(), date).expect("context"),
            context
        );
    }
}
