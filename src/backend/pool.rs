//! Parent-side driver of a pool of worker processes.
//!
//! The driver owns the children and runs as one tokio task. It is controlled
//! through [`PoolHandle`] commands and fed by one reader task per worker
//! that turns stdout lines into [`PoolEvent`]s. Each worker runs one task at
//! a time.

use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Dispatch;
use crate::config::{WorkerCommandConfig, WORKER_ENV};
use crate::context::{ShareContext, TaskLogger};
use crate::coord::queue::{Publication, StageEndpoints};
use crate::core::errors::{ConveyorError, Result};
use crate::function::TaskFailure;
use crate::ipc::{ParentMessage, WorkerLink, WorkerMessage, WorkerStream};
use crate::task::model::{TaskId, TaskOutcome};
use crate::task::registry::TaskRegistry;

/// Pool sizing and launch settings
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Prefix of worker ids, used in logs
    pub label: String,
    pub workers: usize,
    /// Retire a worker after this many tasks
    pub recycle_after: Option<usize>,
    pub command: WorkerCommandConfig,
    pub grace: Duration,
}

enum PoolCommand {
    Dispatch(Vec<Dispatch>),
    Cancel(TaskId),
    Join(oneshot::Sender<Vec<TaskId>>),
    Shutdown(oneshot::Sender<()>),
}

enum PoolEvent {
    Message { worker: String, message: WorkerMessage },
    Exited { worker: String },
}

struct WorkerSlot {
    link: Arc<Mutex<WorkerLink>>,
    child: Child,
    reader: JoinHandle<()>,
    current: Option<TaskId>,
    executed: usize,
    retiring: bool,
}

struct StagedRoute {
    forwarder: JoinHandle<()>,
    publish: mpsc::UnboundedSender<Publication>,
}

/// Control handle of a running pool
#[derive(Clone)]
pub struct PoolHandle {
    label: String,
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    /// Start a pool driver. Workers are spawned lazily as work arrives.
    pub fn spawn(
        settings: PoolSettings,
        context: Arc<ShareContext>,
        registry: Arc<TaskRegistry>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let label = settings.label.clone();
        let driver = PoolDriver {
            logger: context.effective_logger(),
            settings,
            context,
            registry,
            events_tx,
            events_rx,
            workers: HashMap::new(),
            queue: VecDeque::new(),
            running: HashMap::new(),
            routes: HashMap::new(),
            completed: Vec::new(),
            joiners: Vec::new(),
            spawned: 0,
        };
        let task = tokio::spawn(driver.run(command_rx));
        (Self { label, commands }, task)
    }

    fn send(&self, command: PoolCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ConveyorError::worker(&self.label, "pool driver is gone"))
    }

    pub fn dispatch(&self, work: Vec<Dispatch>) -> Result<()> {
        self.send(PoolCommand::Dispatch(work))
    }

    pub fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.send(PoolCommand::Cancel(task_id))
    }

    /// Wait until the pool is idle. Returns the ids completed since the
    /// previous join, in completion order.
    pub async fn join(&self) -> Result<Vec<TaskId>> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolCommand::Join(tx))?;
        rx.await
            .map_err(|_| ConveyorError::worker(&self.label, "pool driver exited during join"))
    }

    /// Stop every worker, killing those that outlive the grace period
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolCommand::Shutdown(tx))?;
        rx.await
            .map_err(|_| ConveyorError::worker(&self.label, "pool driver exited during shutdown"))
    }
}

struct PoolDriver {
    settings: PoolSettings,
    context: Arc<ShareContext>,
    logger: Arc<dyn TaskLogger>,
    registry: Arc<TaskRegistry>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    workers: HashMap<String, WorkerSlot>,
    queue: VecDeque<Dispatch>,
    /// Task id to the worker running it
    running: HashMap<TaskId, String>,
    routes: HashMap<TaskId, StagedRoute>,
    completed: Vec<TaskId>,
    joiners: Vec<oneshot::Sender<Vec<TaskId>>>,
    spawned: usize,
}

impl PoolDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PoolCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PoolCommand::Dispatch(work)) => {
                        self.queue.extend(work);
                        self.pump().await;
                    }
                    Some(PoolCommand::Cancel(task_id)) => self.forward_cancel(&task_id).await,
                    Some(PoolCommand::Join(reply)) => self.joiners.push(reply),
                    Some(PoolCommand::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle(event).await,
            }
            self.settle_joiners();
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    fn settle_joiners(&mut self) {
        if self.joiners.is_empty() || !self.is_idle() {
            return;
        }
        let completed = std::mem::take(&mut self.completed);
        for joiner in self.joiners.drain(..) {
            let _ = joiner.send(completed.clone());
        }
    }

    /// Hand queued work to idle workers, spawning workers up to the limit
    async fn pump(&mut self) {
        while !self.queue.is_empty() {
            let idle = self
                .workers
                .iter()
                .find(|(_, slot)| slot.current.is_none() && !slot.retiring)
                .map(|(id, _)| id.clone());

            let worker_id = match idle {
                Some(id) => id,
                None if self.workers.len() < self.settings.workers => {
                    match self.spawn_worker().await {
                        Ok(id) => id,
                        Err(e) => {
                            error!(pool = %self.settings.label, error = %e, "failed to start worker");
                            if self.workers.is_empty() {
                                self.fail_queue(&e);
                            }
                            return;
                        }
                    }
                }
                None => return,
            };

            let Some(item) = self.queue.pop_front() else {
                return;
            };
            self.assign(worker_id, item).await;
        }
    }

    /// Without any live worker queued tasks can never run
    fn fail_queue(&mut self, cause: &ConveyorError) {
        for item in self.queue.drain(..) {
            let task_id = item.envelope.task_id.clone();
            self.registry.record(TaskOutcome::failure(
                task_id.clone(),
                TaskFailure::raised(format!("no worker available: {}", cause)),
                0.0,
                None,
            ));
            self.completed.push(task_id);
            if let Some(stage) = item.stage {
                release_unrouted(stage);
            }
        }
    }

    fn worker_program(&self) -> Result<PathBuf> {
        match &self.settings.command.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe()
                .map_err(|e| ConveyorError::io("locate current executable", e)),
        }
    }

    async fn spawn_worker(&mut self) -> Result<String> {
        self.spawned += 1;
        let worker_id = format!("{}-w{}", self.settings.label, self.spawned);
        let program = self.worker_program()?;

        let mut child = Command::new(&program)
            .args(&self.settings.command.args)
            .envs(&self.settings.command.env)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConveyorError::worker(&worker_id, format!("spawn {}: {}", program.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConveyorError::worker(&worker_id, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConveyorError::worker(&worker_id, "stdout not captured"))?;

        let mut link = WorkerLink::new(&worker_id, stdin);
        link.send(&ParentMessage::Init {
            worker_id: worker_id.clone(),
            context: self.context.snapshot(),
        })
        .await?;

        let reader = tokio::spawn(read_worker(
            worker_id.clone(),
            WorkerStream::new(stdout),
            self.events_tx.clone(),
        ));

        info!(worker = %worker_id, pid = ?child.id(), "worker process started");
        self.workers.insert(
            worker_id.clone(),
            WorkerSlot {
                link: Arc::new(Mutex::new(link)),
                child,
                reader,
                current: None,
                executed: 0,
                retiring: false,
            },
        );
        Ok(worker_id)
    }

    async fn assign(&mut self, worker_id: String, item: Dispatch) {
        let Dispatch {
            envelope,
            cancel,
            stage,
        } = item;
        let task_id = envelope.task_id.clone();
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            return;
        };
        let link = slot.link.clone();

        let execute = ParentMessage::Execute {
            envelope,
            staged: stage.is_some(),
        };
        if let Err(e) = link.lock().await.send(&execute).await {
            warn!(worker = %worker_id, task_id = %task_id, error = %e, "could not hand task to worker");
            self.registry.record(TaskOutcome::failure(
                task_id.clone(),
                TaskFailure::WorkerLost { worker: worker_id },
                0.0,
                None,
            ));
            self.completed.push(task_id);
            if let Some(stage) = stage {
                release_unrouted(stage);
            }
            return;
        }

        slot.current = Some(task_id.clone());
        self.running.insert(task_id.clone(), worker_id.clone());
        debug!(worker = %worker_id, task_id = %task_id, "task assigned");

        if cancel.is_cancelled() {
            let _ = link
                .lock()
                .await
                .send(&ParentMessage::Cancel {
                    task_id: task_id.clone(),
                })
                .await;
        }
        if let Some(stage) = stage {
            self.route(task_id, link, stage);
        }
    }

    /// Bridge a staged task's queues over the worker pipe
    fn route(&mut self, task_id: TaskId, link: Arc<Mutex<WorkerLink>>, stage: StageEndpoints) {
        let StageEndpoints {
            mut requests,
            publish,
            stop,
        } = stage;

        let forward_id = task_id.clone();
        let forwarder = tokio::spawn(async move {
            let mut stop_sent = false;
            loop {
                tokio::select! {
                    message = requests.recv() => {
                        let Some(message) = message else { break };
                        let frame = ParentMessage::Deliver { task_id: forward_id.clone(), message };
                        if link.lock().await.send(&frame).await.is_err() {
                            break;
                        }
                    }
                    _ = stop.wait(), if !stop_sent => {
                        stop_sent = true;
                        let _ = link.lock().await.send(&ParentMessage::Stop).await;
                    }
                }
            }
        });

        // In-order relay; a full publish queue must not stall the driver
        let (relay, mut relay_rx) = mpsc::unbounded_channel::<Publication>();
        tokio::spawn(async move {
            while let Some(message) = relay_rx.recv().await {
                if publish.send(message).await.is_err() {
                    break;
                }
            }
        });

        self.routes.insert(
            task_id,
            StagedRoute {
                forwarder,
                publish: relay,
            },
        );
    }

    async fn forward_cancel(&mut self, task_id: &TaskId) {
        let Some(worker_id) = self.running.get(task_id) else {
            return;
        };
        if let Some(slot) = self.workers.get(worker_id) {
            let cancel = ParentMessage::Cancel {
                task_id: task_id.clone(),
            };
            if let Err(e) = slot.link.lock().await.send(&cancel).await {
                debug!(task_id = %task_id, error = %e, "cancel not delivered");
            }
        }
    }

    async fn handle(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Message { worker, message } => match message {
                WorkerMessage::Ready { pid, .. } => {
                    debug!(worker = %worker, pid, "worker ready");
                }
                WorkerMessage::Completed { outcome } => self.complete(&worker, outcome).await,
                WorkerMessage::Publish { task_id, message } => match self.routes.get(&task_id) {
                    Some(route) => {
                        let _ = route.publish.send(message);
                    }
                    None => debug!(task_id = %task_id, "publication for unrouted task dropped"),
                },
                WorkerMessage::Log { level, message } => {
                    self.logger.log(level, &format!("[{}] {}", worker, message));
                }
            },
            PoolEvent::Exited { worker } => self.on_exit(&worker).await,
        }
    }

    /// A staged task lost with its worker still owes the barrier one
    /// publication. The placeholder completes the current cycle, the close
    /// ends the pipeline at the next one.
    fn release_route(&self, task_id: &TaskId) {
        if let Some(route) = self.routes.get(task_id) {
            let _ = route.publish.send(Publication::Value(json!({})));
            let _ = route.publish.send(Publication::Close);
        }
    }

    fn finish_task(&mut self, task_id: &TaskId) {
        self.running.remove(task_id);
        if let Some(route) = self.routes.remove(task_id) {
            route.forwarder.abort();
        }
        self.completed.push(task_id.clone());
    }

    async fn complete(&mut self, worker_id: &str, outcome: TaskOutcome) {
        let task_id = outcome.task_id.clone();
        self.registry.record(outcome);
        self.finish_task(&task_id);

        if let Some(slot) = self.workers.get_mut(worker_id) {
            slot.current = None;
            slot.executed += 1;
            let exhausted = self
                .settings
                .recycle_after
                .map(|limit| slot.executed >= limit)
                .unwrap_or(false);
            if exhausted {
                debug!(worker = %worker_id, executed = slot.executed, "retiring worker");
                slot.retiring = true;
                let mut link = slot.link.lock().await;
                let _ = link.send(&ParentMessage::Shutdown).await;
                link.close();
            }
        }
        self.pump().await;
    }

    async fn on_exit(&mut self, worker_id: &str) {
        let Some(mut slot) = self.workers.remove(worker_id) else {
            return;
        };
        if let Some(task_id) = slot.current.take() {
            error!(worker = %worker_id, task_id = %task_id, "worker exited while running a task");
            self.registry.record(TaskOutcome::failure(
                task_id.clone(),
                TaskFailure::WorkerLost {
                    worker: worker_id.to_string(),
                },
                0.0,
                None,
            ));
            self.release_route(&task_id);
            self.finish_task(&task_id);
        } else {
            debug!(worker = %worker_id, "worker exited");
        }

        let mut child = slot.child;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        self.pump().await;
    }

    async fn shutdown(&mut self) {
        for (worker_id, slot) in self.workers.drain() {
            let WorkerSlot {
                link,
                mut child,
                reader,
                ..
            } = slot;
            {
                let mut link = link.lock().await;
                let _ = link.send(&ParentMessage::Stop).await;
                let _ = link.send(&ParentMessage::Shutdown).await;
                link.close();
            }
            if tokio::time::timeout(self.settings.grace, child.wait())
                .await
                .is_err()
            {
                warn!(worker = %worker_id, "worker ignored shutdown, killing it");
                let _ = child.kill().await;
            }
            reader.abort();
        }
        for (_, route) in self.routes.drain() {
            route.forwarder.abort();
        }
        info!(pool = %self.settings.label, "worker pool shut down");
    }
}

/// Same as `PoolDriver::release_route` for a staged task that never reached
/// a worker
fn release_unrouted(stage: StageEndpoints) {
    tokio::spawn(async move {
        let _ = stage.publish.send(Publication::Value(json!({}))).await;
        let _ = stage.publish.send(Publication::Close).await;
    });
}

async fn read_worker(
    worker: String,
    mut stream: WorkerStream,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    loop {
        match stream.next().await {
            Ok(Some(message)) => {
                let event = PoolEvent::Message {
                    worker: worker.clone(),
                    message,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(ConveyorError::Io { source, .. }) => {
                warn!(worker = %worker, error = %source, "worker stdout failed");
                break;
            }
            Err(e) => warn!(worker = %worker, error = %e, "skipping unreadable frame"),
        }
    }
    let _ = events.send(PoolEvent::Exited { worker });
}
