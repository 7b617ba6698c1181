//! Execution backends behind the executor facade.
//!
//! Every backend honours the same contract: `dispatch` hands over tasks,
//! `join` waits for everything dispatched so far and reports completion
//! order, `stop` tears the backend down. Outcomes are written straight into
//! the shared [`TaskRegistry`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{BackendKind, ExecutorConfig};
use crate::context::{CancelToken, ShareContext};
use crate::coord::queue::StageEndpoints;
use crate::core::errors::Result;
use crate::task::model::{TaskEnvelope, TaskId};
use crate::task::registry::TaskRegistry;

pub(crate) mod invoke;
pub mod pool;
pub mod process;
pub mod thread;

pub use process::ProcessBackend;
pub use thread::ThreadBackend;

/// One task handed to a backend
pub struct Dispatch {
    pub envelope: TaskEnvelope,
    pub cancel: CancelToken,
    /// Queue ends for coordinator-registered tasks
    pub stage: Option<StageEndpoints>,
}

impl Dispatch {
    pub fn new(envelope: TaskEnvelope, cancel: CancelToken) -> Self {
        Self {
            envelope,
            cancel,
            stage: None,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.envelope.task_id
    }
}

/// One batch of the batched process backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// 1-based
    pub index: usize,
    pub size: usize,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[async_trait]
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Bring the backend up. Called once per run, before any dispatch.
    async fn start(&mut self, context: Arc<ShareContext>) -> Result<()>;

    /// Hand tasks over for execution without waiting for them
    async fn dispatch(&mut self, work: Vec<Dispatch>) -> Result<()>;

    /// Wait for every dispatched task. Returns ids in completion order.
    async fn join(&mut self) -> Result<Vec<TaskId>>;

    /// Tear the backend down. Work that has not started is dropped.
    async fn stop(&mut self) -> Result<()>;

    /// Forward an advisory cancellation to wherever the task runs
    fn cancel(&self, _task_id: &TaskId) {}

    fn batch_history(&self) -> Vec<BatchRecord> {
        Vec::new()
    }
}

/// Build the backend selected by `config`
pub fn create_backend(config: &ExecutorConfig, registry: Arc<TaskRegistry>) -> Box<dyn Backend> {
    match config.mode {
        BackendKind::Thread => Box::new(ThreadBackend::new(config.effective_max_workers(), registry)),
        BackendKind::Batched | BackendKind::Process => {
            Box::new(ProcessBackend::new(config.clone(), registry))
        }
    }
}
