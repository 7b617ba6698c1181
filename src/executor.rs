//! The task executor facade: one backend plus the task registry behind a
//! single lifecycle API.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{create_backend, Backend, BatchRecord, Dispatch};
use crate::config::{BackendKind, ExecutorConfig};
use crate::context::ShareContext;
use crate::coord::queue::StageEndpoints;
use crate::core::errors::{ConveyorError, Result};
use crate::function::FunctionRegistry;
use crate::report::{
    print_console, FileReporter, ReportData, ReportFormat, ReportSink, SummaryFilter, SummaryRow,
};
use crate::task::model::{Task, TaskId, TaskInfo, TaskSpec, TaskStatus};
use crate::task::registry::TaskRegistry;

/// Runs submitted tasks on the configured backend and keeps their
/// bookkeeping.
///
/// ```no_run
/// # async fn demo() -> conveyor::Result<()> {
/// use conveyor::{ExecutorConfig, TaskExecutor, TaskSpec};
///
/// let mut executor = TaskExecutor::new(ExecutorConfig::for_mode("thread")?)?;
/// let id = executor.submit(TaskSpec::new("math::add").arg(2).arg(3))?;
/// executor.start().await?;
/// executor.join(true).await?;
/// println!("{:?}", executor.get_result(&id));
/// # Ok(())
/// # }
/// ```
pub struct TaskExecutor {
    id: String,
    config: ExecutorConfig,
    registry: Arc<TaskRegistry>,
    backend: Box<dyn Backend>,
    share: Option<Arc<ShareContext>>,
    pending: Vec<Dispatch>,
    started: bool,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(TaskRegistry::new());
        let backend = create_backend(&config, registry.clone());
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            config,
            registry,
            backend,
            share: None,
            pending: Vec::new(),
            started: false,
        })
    }

    /// Shorthand for a default config of the named mode
    pub fn for_mode(mode: &str) -> Result<Self> {
        Self::new(ExecutorConfig::for_mode(mode)?)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or(self.config.mode.as_str())
    }

    pub fn mode(&self) -> BackendKind {
        self.config.mode
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Bind the shared context. Must happen before `start`.
    pub fn bind_share(&mut self, share: ShareContext) -> Result<()> {
        if self.started {
            return Err(ConveyorError::registration(
                "bind_share must be called before start",
            ));
        }
        self.share = Some(Arc::new(share));
        Ok(())
    }

    pub fn share(&self) -> Option<&ShareContext> {
        self.share.as_deref()
    }

    /// Register a task. It is dispatched by the next `start`, or by `join`
    /// once the executor is running.
    pub fn submit(&mut self, spec: TaskSpec) -> Result<TaskId> {
        if !spec.upstream_keys.is_empty() {
            return Err(ConveyorError::binding(
                &spec.function,
                "upstream keys are only meaningful for coordinator stages",
            ));
        }
        FunctionRegistry::global().resolve(&spec.function)?;
        self.enqueue(spec, None)
    }

    /// Register a coordinator stage task with its queue ends
    pub(crate) fn submit_staged(&mut self, spec: TaskSpec, stage: StageEndpoints) -> Result<TaskId> {
        self.enqueue(spec, Some(stage))
    }

    fn enqueue(&mut self, spec: TaskSpec, stage: Option<StageEndpoints>) -> Result<TaskId> {
        let task = Task::from_spec(TaskId::generate(), spec);
        let id = task.id.clone();
        let dispatch = Dispatch {
            envelope: task.envelope(),
            cancel: task.cancel_token().clone(),
            stage,
        };
        debug!(task_id = %id, function = %task.function, name = %task.name, "task submitted");
        self.registry.insert(task);
        self.pending.push(dispatch);
        Ok(id)
    }

    /// Dispatch pending work without waiting for it
    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let work = std::mem::take(&mut self.pending);
        debug!(count = work.len(), "dispatching pending tasks");
        self.backend.dispatch(work).await
    }

    /// Bring the backend up and dispatch every pending task. Calling it again
    /// dispatches whatever was submitted since.
    pub async fn start(&mut self) -> Result<()> {
        if !self.started {
            let share = self
                .share
                .clone()
                .unwrap_or_else(|| Arc::new(ShareContext::new()));
            self.share = Some(share.clone());
            self.backend.start(share).await?;
            self.started = true;
            info!(executor = %self.name(), mode = self.config.mode.as_str(), "executor started");
        }
        self.flush().await
    }

    /// Wait for every dispatched task. With `collect` the results come back
    /// in completion order; a failed task yields `None`.
    pub async fn join(&mut self, collect: bool) -> Result<Vec<(TaskId, Option<Value>)>> {
        if self.started {
            self.flush().await?;
        }
        let completed = self.backend.join().await?;
        if !collect {
            return Ok(Vec::new());
        }
        Ok(completed
            .into_iter()
            .map(|id| {
                let result = self.registry.result(&id);
                (id, result)
            })
            .collect())
    }

    /// Tear the backend down and clear all bookkeeping
    pub async fn stop(&mut self) -> Result<()> {
        self.backend.stop().await?;
        self.pending.clear();
        self.started = false;
        self.registry.reset();
        info!(executor = %self.name(), "executor stopped");
        Ok(())
    }

    /// Clear all bookkeeping without touching the backend
    pub fn reset(&mut self) {
        self.pending.clear();
        self.registry.reset();
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn get_task_ids(&self) -> Vec<TaskId> {
        self.registry.task_ids()
    }

    pub fn get_task_info(&self, id: &TaskId) -> Option<TaskInfo> {
        self.registry.info(id)
    }

    pub fn get_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.registry.status(id)
    }

    pub fn get_result(&self, id: &TaskId) -> Option<Value> {
        self.registry.result(id)
    }

    pub fn get_elapsed(&self, id: &TaskId) -> Option<f64> {
        self.registry.elapsed(id)
    }

    pub fn get_memory_usage(&self, id: &TaskId) -> Option<f64> {
        self.registry.memory_usage(id)
    }

    pub fn get_by_group(&self, group: &str) -> Vec<TaskId> {
        self.registry.by_group(group)
    }

    pub fn get_by_tag(&self, tag: &str) -> Vec<TaskId> {
        self.registry.by_tag(tag)
    }

    pub fn is_cancelled(&self, id: &TaskId) -> bool {
        self.registry.is_cancelled(id).unwrap_or(false)
    }

    /// Flag a task as cancelled. Work already running is not interrupted.
    pub fn cancel_task(&self, id: &TaskId) -> bool {
        let known = self.registry.cancel(id);
        if known {
            self.backend.cancel(id);
        }
        known
    }

    pub fn cancel_group(&self, group: &str) -> Vec<TaskId> {
        let ids = self.registry.cancel_group(group);
        for id in &ids {
            self.backend.cancel(id);
        }
        ids
    }

    fn resubmit(&mut self, ids: Vec<TaskId>) -> Result<Vec<TaskId>> {
        let mut fresh = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(task) = self.registry.get(&id) else {
                continue;
            };
            fresh.push(self.submit(task.respec())?);
        }
        Ok(fresh)
    }

    /// Submit a fresh copy of every failed task. The failed entries stay.
    pub fn retry_failed(&mut self) -> Result<Vec<TaskId>> {
        let failed = self.registry.by_status(TaskStatus::Error);
        info!(count = failed.len(), "retrying failed tasks");
        self.resubmit(failed)
    }

    /// Submit a fresh copy of every cancelled task
    pub fn rerun_cancelled(&mut self) -> Result<Vec<TaskId>> {
        let cancelled = self.registry.cancelled();
        info!(count = cancelled.len(), "rerunning cancelled tasks");
        self.resubmit(cancelled)
    }

    /// One row per task, in submission order
    pub fn summary(&self) -> Vec<SummaryRow> {
        self.registry.snapshot().iter().map(SummaryRow::from).collect()
    }

    /// Rows matching every criterion set in `filter`
    pub fn filter_summary(&self, filter: &SummaryFilter) -> Vec<SummaryRow> {
        self.summary()
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect()
    }

    pub fn summary_by_group(&self) -> std::collections::BTreeMap<String, usize> {
        self.registry.summary_by_group()
    }

    pub fn summary_by_tag(&self) -> std::collections::BTreeMap<String, usize> {
        self.registry.summary_by_tag()
    }

    /// Sequential batches run so far by the batched process backend
    pub fn batch_history(&self) -> Vec<BatchRecord> {
        self.backend.batch_history()
    }

    fn report_data(&self, filter: &SummaryFilter) -> ReportData {
        let all_rows = self.summary();
        let rows = if filter.is_empty() {
            all_rows.clone()
        } else {
            self.filter_summary(filter)
        };
        ReportData {
            mode: self.config.mode.as_str().to_string(),
            rows,
            all_rows,
            status_counts: self.registry.status_counts(),
            group_counts: self.registry.summary_by_group(),
            tag_counts: self.registry.summary_by_tag(),
        }
    }

    /// Write a report under `path` and return the directory it landed in
    pub fn report(
        &self,
        path: impl AsRef<Path>,
        format: ReportFormat,
        to_console: bool,
        filter: &SummaryFilter,
    ) -> Result<PathBuf> {
        self.report_to(&FileReporter::new(path.as_ref()), format, to_console, filter)
    }

    /// Like [`report`](Self::report) with a custom sink
    pub fn report_to(
        &self,
        sink: &dyn ReportSink,
        format: ReportFormat,
        to_console: bool,
        filter: &SummaryFilter,
    ) -> Result<PathBuf> {
        let data = self.report_data(filter);
        if data.all_rows.is_empty() {
            warn!(executor = %self.name(), "writing a report with no tasks");
        }
        let dir = sink.write(&data, format)?;
        if to_console {
            print_console(&data);
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn thread_executor() -> TaskExecutor {
        TaskExecutor::new(ExecutorConfig::builder().max_workers(2).build().unwrap()).unwrap()
    }

    #[test]
    fn test_unknown_mode_fails_fast() {
        assert!(matches!(
            TaskExecutor::for_mode("cluster"),
            Err(ConveyorError::Configuration { .. })
        ));
    }

    #[test]
    fn test_submit_unregistered_function_fails() {
        let mut executor = thread_executor();
        let err = executor.submit(TaskSpec::new("nowhere::fn")).unwrap_err();
        assert!(matches!(err, ConveyorError::FunctionNotFound { .. }));
        assert!(executor.get_task_ids().is_empty());
    }

    #[test]
    fn test_submit_rejects_upstream_keys() {
        let mut executor = thread_executor();
        let spec = TaskSpec::new("fixtures::scale").upstream("total");
        assert!(matches!(
            executor.submit(spec),
            Err(ConveyorError::Binding { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_share_after_start_rejected() {
        let mut executor = thread_executor();
        executor.start().await.unwrap();
        assert!(executor.bind_share(ShareContext::new()).is_err());
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_start_runs_immediately() {
        let mut executor = thread_executor();
        executor.start().await.unwrap();
        let id = executor
            .submit(TaskSpec::new("fixtures::add").kwarg("x", 4).kwarg("y", 5))
            .unwrap();
        let results = executor.join(true).await.unwrap();
        assert_eq!(results, vec![(id.clone(), Some(json!(9)))]);
        assert_eq!(executor.get_status(&id), Some(TaskStatus::Done));
    }

    #[tokio::test]
    async fn test_stop_resets_bookkeeping() {
        let mut executor = thread_executor();
        let id = executor.submit(TaskSpec::new("fixtures::add").arg(1).arg(2)).unwrap();
        executor.start().await.unwrap();
        executor.join(false).await.unwrap();
        assert_eq!(executor.get_result(&id), Some(json!(3)));

        executor.stop().await.unwrap();
        assert_eq!(executor.get_status(&id), None);
        assert!(!executor.is_started());
    }
}
