//! Supervisor-side handle to one running worker.
//!
//! A handle owns exactly one isolated execution context and one channel pair.
//! Thread-isolated workers run [`WorkerRuntime`] on a dedicated OS thread;
//! process-isolated workers are child processes whose stdin/stdout are bridged
//! into the same channel pair by two tokio tasks, so the delegate sees one
//! interface regardless of backend.

use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::launcher::LaunchError;
use super::runtime::{RuntimeExit, WorkerRuntime};
use crate::messages::{self, Frame, Message, MessageError, MessageKind};
use crate::sensors::{Sensor, SensorConfig};

/// How long a child process gets to exit on its own after `STOP`.
pub const STOP_GRACE: Duration = Duration::from_millis(500);

enum Backend {
    Thread {
        join: Option<thread::JoinHandle<RuntimeExit>>,
    },
    Process {
        child: Option<Child>,
        reader: Option<JoinHandle<()>>,
        writer: Option<JoinHandle<()>>,
    },
}

pub struct WorkerHandle {
    id: Uuid,
    worker_id: String,
    to_worker: StdMutex<Option<UnboundedSender<Frame>>>,
    from_worker: Mutex<UnboundedReceiver<Frame>>,
    backend: StdMutex<Backend>,
    terminated: AtomicBool,
}

impl WorkerHandle {
    /// Run `sensor` on a dedicated OS thread behind a panic boundary.
    pub fn spawn_thread(
        worker_id: &str,
        sensor: Box<dyn Sensor>,
        config: Option<SensorConfig>,
    ) -> Result<Self, LaunchError> {
        let (to_worker, mut inbound) = mpsc::unbounded_channel::<Frame>();
        let (outbound, from_worker) = mpsc::unbounded_channel::<Frame>();
        let runtime = WorkerRuntime::new(worker_id, sensor);

        let join = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || runtime.run(config, &mut inbound, &outbound))
            .map_err(|source| LaunchError::Spawn {
                worker_id: worker_id.to_string(),
                source,
            })?;

        let handle = Self::assemble(worker_id, to_worker, from_worker, Backend::Thread {
            join: Some(join),
        });
        info!(worker_id, handle_id = %handle.id, "spawned worker thread");
        Ok(handle)
    }

    /// Spawn `command` as a child process speaking JSON lines on stdin/stdout.
    ///
    /// Must be called from within a tokio runtime; the stdio bridge tasks
    /// live on it.
    pub fn spawn_process(worker_id: &str, mut command: Command) -> Result<Self, LaunchError> {
        let runtime = RuntimeHandle::try_current()
            .map_err(|_| LaunchError::NoRuntime(worker_id.to_string()))?;

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            worker_id: worker_id.to_string(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or_else(|| LaunchError::MissingPipe {
            worker_id: worker_id.to_string(),
            stream: "stdin",
        })?;
        let stdout = child.stdout.take().ok_or_else(|| LaunchError::MissingPipe {
            worker_id: worker_id.to_string(),
            stream: "stdout",
        })?;

        let (to_worker, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, from_worker) = mpsc::unbounded_channel::<Frame>();

        let reader_id = worker_id.to_string();
        let reader = runtime.spawn(async move {
            let mut stdout = BufReader::new(stdout);
            loop {
                match messages::read_frame(&mut stdout).await {
                    Ok(Some(frame)) => {
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(worker_id = %reader_id, "worker stdout closed");
                        break;
                    }
                    Err(err) => {
                        warn!(worker_id = %reader_id, error = %err, "worker stdout loop exited");
                        break;
                    }
                }
            }
        });

        let writer_id = worker_id.to_string();
        let writer = runtime.spawn(async move {
            let mut stdin = BufWriter::new(stdin);
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = messages::write_frame(&mut stdin, &frame).await {
                    warn!(worker_id = %writer_id, error = %err, "worker stdin loop exited");
                    break;
                }
            }
        });

        info!(worker_id, pid = child.id(), "spawned worker process");
        Ok(Self::assemble(worker_id, to_worker, from_worker, Backend::Process {
            child: Some(child),
            reader: Some(reader),
            writer: Some(writer),
        }))
    }

    fn assemble(
        worker_id: &str,
        to_worker: UnboundedSender<Frame>,
        from_worker: UnboundedReceiver<Frame>,
        backend: Backend,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id: worker_id.to_string(),
            to_worker: StdMutex::new(Some(to_worker)),
            from_worker: Mutex::new(from_worker),
            backend: StdMutex::new(backend),
            terminated: AtomicBool::new(false),
        }
    }

    /// Unique per launch; distinguishes a restarted worker from its predecessor.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Queue one request for the worker.
    pub fn send(&self, message: Message) -> Result<(), MessageError> {
        let guard = self
            .to_worker
            .lock()
            .map_err(|_| MessageError::ChannelClosed)?;
        let sender = guard.as_ref().ok_or(MessageError::ChannelClosed)?;
        sender
            .send(message.into_frame())
            .map_err(|_| MessageError::ChannelClosed)
    }

    /// Exclusive access to the worker's reply channel for one request/response
    /// exchange.
    pub async fn inbox(&self) -> MutexGuard<'_, UnboundedReceiver<Frame>> {
        self.from_worker.lock().await
    }

    /// Stop the worker and release both channel endpoints.
    ///
    /// Idempotent and best-effort: every step runs even if an earlier one
    /// fails, and failures are only logged.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(worker_id = %self.worker_id, handle_id = %self.id, "terminating worker");

        match self.to_worker.lock() {
            Ok(mut guard) => {
                if let Some(sender) = guard.take() {
                    let _ = sender.send(Message::new(MessageKind::Stop).into_frame());
                }
            }
            Err(_) => warn!(worker_id = %self.worker_id, "request channel lock poisoned"),
        }

        if let Ok(mut inbox) = self.from_worker.try_lock() {
            inbox.close();
        }

        let mut backend = match self.backend.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &mut *backend {
            // The runtime thread exits on STOP or on the closed channel; it
            // cannot be killed, only detached.
            Backend::Thread { join } => {
                drop(join.take());
            }
            Backend::Process {
                child,
                reader,
                writer,
            } => {
                let Some(mut child) = child.take() else {
                    return;
                };
                let reader = reader.take();
                let writer = writer.take();
                let worker_id = self.worker_id.clone();
                match RuntimeHandle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Some(writer) = writer {
                                let _ = tokio::time::timeout(STOP_GRACE, writer).await;
                            }
                            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                                Ok(Ok(status)) => {
                                    debug!(worker_id = %worker_id, %status, "worker process exited")
                                }
                                Ok(Err(err)) => {
                                    warn!(worker_id = %worker_id, ?err, "failed to reap worker process")
                                }
                                Err(_) => {
                                    warn!(worker_id = %worker_id, "worker ignored STOP; killing");
                                    if let Err(err) = child.start_kill() {
                                        warn!(worker_id = %worker_id, ?err, "failed to kill worker process");
                                    }
                                    let _ = child.wait().await;
                                }
                            }
                            if let Some(reader) = reader {
                                reader.abort();
                            }
                        });
                    }
                    Err(_) => {
                        if let Some(writer) = writer {
                            writer.abort();
                        }
                        if let Some(reader) = reader {
                            reader.abort();
                        }
                        if let Err(err) = child.start_kill() {
                            warn!(worker_id = %worker_id, ?err, "failed to kill worker process during drop");
                        }
                    }
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}
