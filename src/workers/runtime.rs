//! Worker-side request loop.
//!
//! The runtime hosts one [`Sensor`] inside its isolation boundary and answers
//! supervisor requests arriving on the inbound channel. It runs on a dedicated
//! OS thread, either inside the supervisor process (thread isolation) or
//! inside a `senseloop worker` child process (process isolation, see
//! [`serve_stdio`]).

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use serde_json::Map;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tracing::{debug, error, info, info_span, warn};

use crate::messages::{self, Frame, Message, MessageError, MessageKind};
use crate::sensors::{Sensor, SensorConfig};

/// Inbound poll period; keeps the loop at or below 100 Hz.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why the request loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeExit {
    /// A `STOP` request was acknowledged.
    Stopped,
    /// The supervisor dropped one of the channel endpoints.
    Disconnected,
    /// The sensor panicked; the message is the panic payload.
    Panicked(String),
}

enum Flow {
    Continue,
    Exit(RuntimeExit),
}

pub struct WorkerRuntime {
    worker_id: String,
    sensor: Box<dyn Sensor>,
    startup_error: Option<String>,
    poll_interval: Duration,
}

impl WorkerRuntime {
    pub fn new(worker_id: impl Into<String>, sensor: Box<dyn Sensor>) -> Self {
        Self {
            worker_id: worker_id.into(),
            sensor,
            startup_error: None,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Configure and start the sensor, then serve requests until `STOP`, a
    /// closed channel, or a panic. `teardown` runs exactly once on every path.
    pub fn run(
        mut self,
        config: Option<SensorConfig>,
        inbound: &mut UnboundedReceiver<Frame>,
        outbound: &UnboundedSender<Frame>,
    ) -> RuntimeExit {
        let span = info_span!("worker_runtime", worker_id = %self.worker_id);
        let _entered = span.enter();

        self.boot(config.as_ref());

        let exit = match panic::catch_unwind(AssertUnwindSafe(|| self.serve(inbound, outbound))) {
            Ok(exit) => exit,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(%reason, "sensor panicked; leaving request loop");
                RuntimeExit::Panicked(reason)
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.sensor.teardown())) {
            error!(reason = %panic_message(payload.as_ref()), "sensor teardown panicked");
        }
        info!(?exit, "worker runtime exited");
        exit
    }

    fn boot(&mut self, config: Option<&SensorConfig>) {
        let sensor = &mut self.sensor;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            sensor.configure(config)?;
            sensor.startup()
        }));
        self.startup_error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(format!("startup panicked: {}", panic_message(payload.as_ref()))),
        };
        match &self.startup_error {
            Some(err) => warn!(error = %err, "sensor failed to start"),
            None => info!("sensor started"),
        }
    }

    fn serve(
        &mut self,
        inbound: &mut UnboundedReceiver<Frame>,
        outbound: &UnboundedSender<Frame>,
    ) -> RuntimeExit {
        // one request per poll, even when several are queued
        loop {
            match inbound.try_recv() {
                Ok(frame) => {
                    if let Flow::Exit(exit) = self.handle(frame, outbound) {
                        return exit;
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return RuntimeExit::Disconnected,
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn handle(&mut self, frame: Frame, outbound: &UnboundedSender<Frame>) -> Flow {
        let message = match Message::from_frame(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring malformed request");
                return Flow::Continue;
            }
        };
        debug!(kind = %message.kind, "request");

        let reply = match message.kind {
            MessageKind::HeartbeatSyn => match &self.startup_error {
                Some(err) => Message::with_payload(MessageKind::StartupError, err.clone()),
                None => Message::new(MessageKind::HeartbeatAck),
            },
            MessageKind::GetData => match self.sensor.read_data() {
                Ok(Some(record)) if !record.is_empty() => {
                    Message::with_payload(MessageKind::DataOk, record.into_iter().collect::<Map<_, _>>())
                }
                Ok(_) => Message::with_payload(MessageKind::DataError, "no data"),
                Err(err) => Message::with_payload(MessageKind::DataError, err.to_string()),
            },
            MessageKind::Stop => {
                let _ = outbound.send(Message::new(MessageKind::StopAck).into_frame());
                return Flow::Exit(RuntimeExit::Stopped);
            }
            other => {
                warn!(kind = %other, "ignoring response-only message sent to worker");
                return Flow::Continue;
            }
        };

        if outbound.send(reply.into_frame()).is_err() {
            return Flow::Exit(RuntimeExit::Disconnected);
        }
        Flow::Continue
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Serve the request loop over a line-oriented byte stream pair.
///
/// This is the body of a process-isolated worker: frames arrive one JSON line
/// at a time on `input` and replies are written to `output`. The sensor runs
/// on a blocking thread; two tasks bridge the streams into the same channel
/// pair the thread backend uses.
pub async fn serve_stream<R, W>(
    runtime: WorkerRuntime,
    config: Option<SensorConfig>,
    input: R,
    output: W,
) -> Result<RuntimeExit, MessageError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Frame>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let reader = tokio::spawn(async move {
        let mut input = BufReader::new(input);
        loop {
            match messages::read_frame(&mut input).await {
                Ok(Some(frame)) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("supervisor closed worker input");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "worker input failed");
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut output = BufWriter::new(output);
        while let Some(frame) = outbound_rx.recv().await {
            messages::write_frame(&mut output, &frame).await?;
        }
        Ok::<(), MessageError>(())
    });

    let exit = tokio::task::spawn_blocking(move || {
        runtime.run(config, &mut inbound_rx, &outbound_tx)
    })
    .await
    .map_err(|err| MessageError::Io(std::io::Error::other(err.to_string())))?;

    reader.abort();
    match writer.await {
        Ok(result) => result?,
        Err(err) if err.is_cancelled() => {}
        Err(err) => return Err(MessageError::Io(std::io::Error::other(err.to_string()))),
    }
    Ok(exit)
}

/// Serve the request loop on this process's stdin/stdout.
pub async fn serve_stdio(
    runtime: WorkerRuntime,
    config: Option<SensorConfig>,
) -> Result<RuntimeExit, MessageError> {
    serve_stream(runtime, config, tokio::io::stdin(), tokio::io::stdout()).await
}
