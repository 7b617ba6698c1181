use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pool::{PoolHandle, PoolSettings};
use super::{Backend, BatchRecord, Dispatch};
use crate::config::{BackendKind, ExecutorConfig};
use crate::context::ShareContext;
use crate::core::errors::{ConveyorError, Result};
use crate::task::model::TaskId;
use crate::task::registry::TaskRegistry;

/// Worker-process backend.
///
/// In long-lived mode (`process`) one pool lives from `start` to `stop` and
/// every task is handed to it right away. In batched mode (`pool`) the work
/// is cut into `batch_size` chunks and each chunk gets a fresh pool that is
/// torn down before the next chunk starts.
pub struct ProcessBackend {
    config: ExecutorConfig,
    registry: Arc<TaskRegistry>,
    context: Option<Arc<ShareContext>>,
    /// Long-lived pool
    pool: Option<(PoolHandle, JoinHandle<()>)>,
    /// Tail of the batched run; each dispatch appends to it
    chain: Option<JoinHandle<Vec<TaskId>>>,
    /// Pool of the batch currently running, for cancel and stop
    current: Arc<Mutex<Option<PoolHandle>>>,
    history: Arc<Mutex<Vec<BatchRecord>>>,
}

impl ProcessBackend {
    pub fn new(config: ExecutorConfig, registry: Arc<TaskRegistry>) -> Self {
        Self {
            config,
            registry,
            context: None,
            pool: None,
            chain: None,
            current: Arc::new(Mutex::new(None)),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn settings(&self, label: String, recycle_after: Option<usize>) -> PoolSettings {
        PoolSettings {
            label,
            workers: self.config.effective_max_workers(),
            recycle_after,
            command: self.config.worker.clone(),
            grace: self.config.shutdown_grace(),
        }
    }

    fn context(&self) -> Result<Arc<ShareContext>> {
        self.context
            .clone()
            .ok_or_else(|| ConveyorError::registration("process backend is not started"))
    }

    fn dispatch_batched(&mut self, work: Vec<Dispatch>) -> Result<()> {
        let context = self.context()?;
        let batch_size = self.config.batch_size.max(1);
        let mut batches: Vec<Vec<Dispatch>> = Vec::new();
        let mut work = work.into_iter().peekable();
        while work.peek().is_some() {
            batches.push(work.by_ref().take(batch_size).collect());
        }

        let previous = self.chain.take();
        let history = self.history.clone();
        let current = self.current.clone();
        let registry = self.registry.clone();
        let recycle_after = Some(self.config.max_tasks_per_child.max(1));
        let template = self.settings(String::new(), recycle_after);

        self.chain = Some(tokio::spawn(async move {
            let mut completed = match previous {
                Some(previous) => previous.await.unwrap_or_default(),
                None => Vec::new(),
            };

            for batch in batches {
                let index = history.lock().len() + 1;
                let size = batch.len();
                let mut settings = template.clone();
                settings.label = format!("batch{}", index);

                let opened_at = Utc::now();
                info!(batch = index, size, "opening batch pool");
                let (pool, driver) = PoolHandle::spawn(settings, context.clone(), registry.clone());
                *current.lock() = Some(pool.clone());

                let joined = match pool.dispatch(batch) {
                    Ok(()) => pool.join().await,
                    Err(e) => Err(e),
                };
                match joined {
                    Ok(ids) => completed.extend(ids),
                    Err(e) => warn!(batch = index, error = %e, "batch did not complete"),
                }
                let _ = pool.shutdown().await;
                let _ = driver.await;
                current.lock().take();

                let closed_at = Utc::now();
                debug!(batch = index, "batch pool closed");
                history.lock().push(BatchRecord {
                    index,
                    size,
                    opened_at,
                    closed_at,
                });
            }
            completed
        }));
        Ok(())
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        self.config.mode
    }

    async fn start(&mut self, context: Arc<ShareContext>) -> Result<()> {
        if self.config.mode == BackendKind::Process && self.pool.is_none() {
            let settings = self.settings("pool".to_string(), None);
            self.pool = Some(PoolHandle::spawn(
                settings,
                context.clone(),
                self.registry.clone(),
            ));
        }
        self.context = Some(context);
        info!(
            mode = self.config.mode.as_str(),
            workers = self.config.effective_max_workers(),
            "process backend started"
        );
        Ok(())
    }

    async fn dispatch(&mut self, work: Vec<Dispatch>) -> Result<()> {
        if work.is_empty() {
            return Ok(());
        }
        match &self.pool {
            Some((pool, _)) => pool.dispatch(work),
            None if self.config.mode == BackendKind::Batched => self.dispatch_batched(work),
            None => Err(ConveyorError::registration("process backend is not started")),
        }
    }

    async fn join(&mut self) -> Result<Vec<TaskId>> {
        if let Some((pool, _)) = &self.pool {
            return pool.join().await;
        }
        match self.chain.take() {
            Some(chain) => chain
                .await
                .map_err(|e| ConveyorError::internal(format!("batch runner failed: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some((pool, driver)) = self.pool.take() {
            if let Err(e) = pool.shutdown().await {
                debug!(error = %e, "pool already gone");
            }
            let _ = driver.await;
        }
        if let Some(chain) = self.chain.take() {
            chain.abort();
        }
        let running = self.current.lock().take();
        if let Some(pool) = running {
            let _ = pool.shutdown().await;
        }
        self.context = None;
        info!(mode = self.config.mode.as_str(), "process backend stopped");
        Ok(())
    }

    fn cancel(&self, task_id: &TaskId) {
        let pool = match &self.pool {
            Some((pool, _)) => Some(pool.clone()),
            None => self.current.lock().clone(),
        };
        if let Some(pool) = pool {
            let _ = pool.cancel(task_id.clone());
        }
    }

    fn batch_history(&self) -> Vec<BatchRecord> {
        self.history.lock().clone()
    }
}
