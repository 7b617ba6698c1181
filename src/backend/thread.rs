use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::invoke::invoke;
use super::{Backend, Dispatch};
use crate::config::BackendKind;
use crate::context::ShareContext;
use crate::coord::queue::StageChannels;
use crate::core::errors::{ConveyorError, Result};
use crate::function::TaskFailure;
use crate::task::model::{TaskId, TaskOutcome};
use crate::task::registry::TaskRegistry;

/// In-process worker pool.
///
/// Each task takes a semaphore permit and runs on a blocking thread, so at
/// most `workers` task functions execute at once.
pub struct ThreadBackend {
    workers: usize,
    semaphore: Arc<Semaphore>,
    registry: Arc<TaskRegistry>,
    context: Option<Arc<ShareContext>>,
    running: JoinSet<TaskId>,
}

impl ThreadBackend {
    pub fn new(workers: usize, registry: Arc<TaskRegistry>) -> Self {
        Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
            registry,
            context: None,
            running: JoinSet::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

#[async_trait]
impl Backend for ThreadBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Thread
    }

    async fn start(&mut self, context: Arc<ShareContext>) -> Result<()> {
        if self.semaphore.is_closed() {
            self.semaphore = Arc::new(Semaphore::new(self.workers));
        }
        self.context = Some(context);
        info!(workers = self.workers, "thread backend started");
        Ok(())
    }

    async fn dispatch(&mut self, work: Vec<Dispatch>) -> Result<()> {
        let context = self
            .context
            .clone()
            .ok_or_else(|| ConveyorError::registration("thread backend is not started"))?;

        for item in work {
            let semaphore = self.semaphore.clone();
            let registry = self.registry.clone();
            let context = context.clone();
            debug!(task_id = %item.task_id(), function = %item.envelope.function, "dispatching task");

            self.running.spawn(async move {
                let Dispatch {
                    envelope,
                    cancel,
                    stage,
                } = item;
                let task_id = envelope.task_id.clone();
                // Closed on stop: the task never starts
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return task_id;
                };

                let channels = stage.map(StageChannels::local);
                let outcome = match tokio::task::spawn_blocking(move || {
                    invoke(&envelope, context, cancel, channels)
                })
                .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => TaskOutcome::failure(
                        task_id.clone(),
                        TaskFailure::Panicked {
                            message: e.to_string(),
                        },
                        0.0,
                        None,
                    ),
                };
                registry.record(outcome);
                task_id
            });
        }
        Ok(())
    }

    async fn join(&mut self) -> Result<Vec<TaskId>> {
        let mut completed = Vec::new();
        while let Some(joined) = self.running.join_next().await {
            match joined {
                Ok(task_id) => completed.push(task_id),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "task wrapper failed"),
            }
        }
        Ok(completed)
    }

    async fn stop(&mut self) -> Result<()> {
        self.semaphore.close();
        self.running.abort_all();
        while self.running.join_next().await.is_some() {}
        self.context = None;
        info!("thread backend stopped");
        Ok(())
    }
}
