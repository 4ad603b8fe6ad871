//! Senseloop - supervise sensor workers and stream their merged samples.
//!
//! `senseloop run` registers the configured sensor kinds, starts them, and
//! prints one JSON object per tick on stdout until interrupted.
//! `senseloop worker` is the process-side entry point used by process
//! isolation: it serves one sensor over stdin/stdout.
//!
//! Configuration is via environment variables (see `senseloop::config`):
//! - SENSELOOP_SAMPLE_RATE: Records per second (default: 5)
//! - SENSELOOP_WORKERS: Sensor kinds to supervise (default: example,example_long)
//! - SENSELOOP_ISOLATION: `process` or `thread` (default: process)
//! - SENSELOOP_LOG_DIR: Base log directory (default: data)

use std::pin::pin;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::{select, signal};
use tracing::{info, warn};

use senseloop::observability::{self, LogContext, ObservabilityOptions};
use senseloop::supervisor::TIMESTAMP_FIELD;
use senseloop::workers::{WORKER_ID_ENV, WORKER_SETTINGS_ENV, runtime};
use senseloop::{
    Config, InlineLauncher, Isolation, Manager, ProcessLauncher, WorkerRuntime, WorkerSpec,
    sensors,
};

/// Exit status of a worker process whose sensor panicked.
const EXIT_SENSOR_PANIC: i32 = 70;

#[derive(Parser, Debug)]
#[command(
    name = "senseloop",
    about = "Supervise isolated sensor workers and sample them at a fixed rate"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the configured workers and print one JSON record per tick
    Run(RunArgs),
    /// Serve a single sensor over stdin/stdout
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Overrides SENSELOOP_SAMPLE_RATE
    #[arg(long)]
    sample_rate: Option<f64>,
    /// Overrides SENSELOOP_ISOLATION
    #[arg(long)]
    isolation: Option<Isolation>,
    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<usize>,
    /// Write a chrome trace here (requires the `trace` feature)
    #[arg(long)]
    trace: Option<String>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Built-in sensor kind to host
    #[arg(long)]
    kind: String,
    #[arg(long, env = WORKER_ID_ENV)]
    id: Option<String>,
    /// JSON configuration blob for the sensor
    #[arg(long, env = WORKER_SETTINGS_ENV)]
    settings: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Worker(args) => {
            // exit explicitly: a pending stdin read would otherwise hold the
            // runtime open
            let code = worker(args).await?;
            std::process::exit(code);
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(rate) = args.sample_rate {
        anyhow::ensure!(rate.is_finite() && rate > 0.0, "--sample-rate must be positive");
        config.sample_rate = rate;
    }
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }

    let log = LogContext::new(&config.log_dir).with_context(|| {
        format!(
            "failed to create log directory under {}",
            config.log_dir.display()
        )
    })?;
    observability::init(
        &ObservabilityOptions {
            log_file: Some("service_manager".to_string()),
            trace_path: args.trace,
        },
        Some(&log),
    )?;

    info!(
        sample_rate = config.sample_rate,
        isolation = %config.isolation,
        workers = ?config.workers,
        log_dir = %log.dir().display(),
        "starting senseloop"
    );

    let mut specs = Vec::with_capacity(config.workers.len());
    for kind in &config.workers {
        let spec = match config.isolation {
            Isolation::Thread => WorkerSpec::new(kind, InlineLauncher::for_kind(kind)?),
            Isolation::Process => {
                WorkerSpec::new(kind, ProcessLauncher::self_hosted(kind, Some(&log))?)
            }
        };
        specs.push(spec);
    }

    let manager = Manager::register(specs, config.supervisor.clone())?;
    for (id, worker_config) in config.worker_configs()? {
        manager
            .configure(&id, worker_config)
            .with_context(|| format!("invalid entry {id:?} in worker config"))?;
    }
    info!(header = ?manager.field_names(), "record schema");

    let running = manager.start().await;
    info!(running, registered = manager.service_ids().len(), "workers started");

    let mut records = pin!(manager.monitor(config.sample_rate));
    let mut shutdown = pin!(wait_for_shutdown());
    let mut emitted = 0usize;
    loop {
        select! {
            result = &mut shutdown => {
                result?;
                info!("shutdown signal received - stopping workers");
                break;
            }
            next = records.next() => {
                let Some(record) = next else {
                    break;
                };
                if emitted == 0 {
                    info!(summary = %manager.describe_healthy(&record), "first tick");
                }

                let mut row = Map::new();
                row.insert(
                    TIMESTAMP_FIELD.to_string(),
                    Value::String(Utc::now().to_rfc3339()),
                );
                row.extend(record);
                println!("{}", Value::Object(row));

                emitted += 1;
                if args.ticks.is_some_and(|limit| emitted >= limit) {
                    break;
                }
            }
        }
    }

    manager.shutdown();
    // let the process backends deliver STOP before the runtime goes away
    tokio::time::sleep(senseloop::workers::STOP_GRACE).await;
    observability::flush();
    info!(emitted, "shutdown complete");
    Ok(())
}

async fn worker(args: WorkerArgs) -> Result<i32> {
    observability::init(&ObservabilityOptions::default(), None)?;

    let factory = sensors::factory_for(&args.kind)
        .ok_or_else(|| anyhow!("unknown sensor kind {:?}", args.kind))?;
    let settings = args
        .settings
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("worker settings are not valid JSON")?;
    let worker_id = args.id.unwrap_or_else(|| args.kind.clone());

    let exit = runtime::serve_stdio(WorkerRuntime::new(worker_id, factory()), settings).await?;
    match exit {
        runtime::RuntimeExit::Panicked(reason) => {
            warn!(%reason, "worker ended abnormally");
            Ok(EXIT_SENSOR_PANIC)
        }
        other => {
            info!(exit = ?other, "worker finished");
            Ok(0)
        }
    }
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
