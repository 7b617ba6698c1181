//! Worker-process side of the process backends.
//!
//! A host binary that uses a process backend must call [`run_if_worker`]
//! first thing in `main`. When the parent launches the binary as a worker the
//! call never returns: it serves frames on stdin/stdout and exits.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::invoke::invoke;
use crate::config::WORKER_ENV;
use crate::context::{CancelToken, LogLevel, ShareContext, TaskLogger, TracingLogger};
use crate::coord::queue::{PublishSink, Publication, StageChannels, StageMessage, StopSignal};
use crate::core::errors::{ConveyorError, Result};
use crate::ipc::{decode, encode, ParentMessage, WorkerMessage};
use crate::task::model::{TaskEnvelope, TaskId};

/// Serve as a worker when launched by a process backend, otherwise return
/// immediately.
pub fn run_if_worker() {
    if std::env::var_os(WORKER_ENV).is_none() {
        return;
    }
    crate::logging::init_worker();
    let code = match serve(std::io::stdin().lock()) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "worker failed");
            1
        }
    };
    std::process::exit(code);
}

/// Shared, line-atomic writer over stdout
#[derive(Clone)]
struct FrameWriter(Arc<Mutex<std::io::Stdout>>);

impl FrameWriter {
    fn stdout() -> Self {
        Self(Arc::new(Mutex::new(std::io::stdout())))
    }

    fn send(&self, message: &WorkerMessage) -> Result<()> {
        let line = encode(message)?;
        let mut out = self.0.lock();
        out.write_all(line.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| ConveyorError::io("write frame to parent", e))
    }
}

/// Ships task log lines to the parent, which replays them through its own
/// logger
struct ForwardingLogger {
    writer: FrameWriter,
}

impl TaskLogger for ForwardingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        let frame = WorkerMessage::Log {
            level,
            message: message.to_string(),
        };
        if self.writer.send(&frame).is_err() {
            TracingLogger.log(level, message);
        }
    }
}

struct RemotePublisher {
    writer: FrameWriter,
    task_id: TaskId,
}

impl PublishSink for RemotePublisher {
    fn publish(&self, message: Publication) -> Result<()> {
        self.writer.send(&WorkerMessage::Publish {
            task_id: self.task_id.clone(),
            message,
        })
    }
}

struct Running {
    cancel: CancelToken,
    deliveries: Option<mpsc::UnboundedSender<StageMessage>>,
}

struct WorkerState {
    worker_id: String,
    writer: FrameWriter,
    share: Arc<ShareContext>,
    stop: StopSignal,
    running: Arc<Mutex<HashMap<TaskId, Running>>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerState {
    fn execute(&mut self, envelope: TaskEnvelope, staged: bool) {
        let task_id = envelope.task_id.clone();
        let cancel = CancelToken::new();

        let (deliveries, channels) = if staged {
            let (tx, rx) = mpsc::unbounded_channel();
            let sink = Arc::new(RemotePublisher {
                writer: self.writer.clone(),
                task_id: task_id.clone(),
            });
            (
                Some(tx),
                Some(StageChannels::forwarded(rx, sink, self.stop.clone())),
            )
        } else {
            (None, None)
        };
        self.running.lock().insert(
            task_id.clone(),
            Running {
                cancel: cancel.clone(),
                deliveries,
            },
        );

        let share = self.share.clone();
        let writer = self.writer.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || {
            let outcome = invoke(&envelope, share, cancel, channels);
            running.lock().remove(&task_id);
            if let Err(e) = writer.send(&WorkerMessage::Completed { outcome }) {
                error!(task_id = %task_id, error = %e, "could not report outcome");
            }
        });
        self.threads.retain(|t| !t.is_finished());
        self.threads.push(handle);
    }

    fn handle(&mut self, message: ParentMessage) -> bool {
        match message {
            ParentMessage::Execute { envelope, staged } => {
                debug!(worker = %self.worker_id, task_id = %envelope.task_id, "executing");
                self.execute(envelope, staged);
            }
            ParentMessage::Deliver { task_id, message } => {
                let running = self.running.lock();
                match running.get(&task_id).and_then(|r| r.deliveries.as_ref()) {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => debug!(task_id = %task_id, "delivery for finished task dropped"),
                }
            }
            ParentMessage::Cancel { task_id } => {
                if let Some(task) = self.running.lock().get(&task_id) {
                    task.cancel.cancel();
                }
            }
            ParentMessage::Stop => self.stop.set(),
            ParentMessage::Shutdown => return false,
            ParentMessage::Init { .. } => warn!(worker = %self.worker_id, "duplicate init ignored"),
        }
        true
    }

    /// Unblock staged tasks and wait for every task thread
    fn drain(mut self) {
        self.stop.set();
        for task in self.running.lock().values_mut() {
            task.deliveries.take();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        info!(worker = %self.worker_id, "worker exiting");
    }
}

fn serve<R: BufRead>(input: R) -> Result<()> {
    let writer = FrameWriter::stdout();
    let mut lines = input.lines();

    let first = lines
        .next()
        .ok_or_else(|| ConveyorError::ipc("stdin closed before init"))?
        .map_err(|e| ConveyorError::io("read init frame", e))?;
    let (worker_id, snapshot) = match decode::<ParentMessage>(&first)? {
        ParentMessage::Init { worker_id, context } => (worker_id, context),
        other => {
            return Err(ConveyorError::ipc(format!(
                "expected init frame, got {:?}",
                other
            )))
        }
    };

    let logger: Arc<dyn TaskLogger> = Arc::new(ForwardingLogger {
        writer: writer.clone(),
    });
    let share = Arc::new(ShareContext::from_snapshot(snapshot, Some(logger)));
    writer.send(&WorkerMessage::Ready {
        worker_id: worker_id.clone(),
        pid: std::process::id(),
    })?;
    info!(worker = %worker_id, "worker ready");

    let mut state = WorkerState {
        worker_id,
        writer,
        share,
        stop: StopSignal::new(),
        running: Arc::new(Mutex::new(HashMap::new())),
        threads: Vec::new(),
    };

    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(worker = %state.worker_id, error = %e, "stdin failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode::<ParentMessage>(&line) {
            Ok(message) => {
                if !state.handle(message) {
                    break;
                }
            }
            Err(e) => warn!(worker = %state.worker_id, error = %e, "skipping unreadable frame"),
        }
    }
    state.drain();
    Ok(())
}
