//! Shared context injected into every task call.
//!
//! The context is an explicit value handed to the backend at `start()`, never
//! a process-global. Thread backends share one live instance; process
//! backends ship a [`ContextSnapshot`] to every worker when it boots and the
//! copies never synchronise again.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::coord::queue::StageChannels;
use crate::function::Kwargs;
use crate::task::model::TaskId;

/// Log severity understood by every [`TaskLogger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Leveled logger collaborator. Implementations must be safe to call from
/// many worker threads at once.
pub trait TaskLogger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Routes task log lines into `tracing`. Used whenever no logger is bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TaskLogger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "conveyor::task", "{}", message),
            LogLevel::Info => tracing::info!(target: "conveyor::task", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "conveyor::task", "{}", message),
            LogLevel::Error => tracing::error!(target: "conveyor::task", "{}", message),
        }
    }
}

/// Collaborator bundle shared by every task of one executor run.
#[derive(Clone, Default)]
pub struct ShareContext {
    values: Kwargs,
    logger: Option<Arc<dyn TaskLogger>>,
}

impl fmt::Debug for ShareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareContext")
            .field("values", &self.values)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

impl ShareContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the logger collaborator
    pub fn with_logger(mut self, logger: Arc<dyn TaskLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Bind a named value. Values are injected as keyword arguments into
    /// every task call and win over the task's own argument of that name.
    pub fn with_value<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn logger(&self) -> Option<&Arc<dyn TaskLogger>> {
        self.logger.as_ref()
    }

    /// The bound logger, or the tracing fallback
    pub fn effective_logger(&self) -> Arc<dyn TaskLogger> {
        match &self.logger {
            Some(logger) => logger.clone(),
            None => Arc::new(TracingLogger),
        }
    }

    /// Keyword arguments contributed by the context. Names starting with an
    /// underscore stay private to the context.
    pub fn to_kwargs(&self) -> Kwargs {
        self.values
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Merge the context into a call's arguments. Context values override
    /// task arguments with the same name.
    pub fn merge_into(&self, kwargs: &mut Kwargs) {
        for (key, value) in self.to_kwargs() {
            kwargs.insert(key, value);
        }
    }

    /// Serializable copy handed to worker processes at start-up
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            values: self.values.clone(),
            has_logger: self.logger.is_some(),
        }
    }

    /// Materialize a worker-side copy, attaching that process's logger
    pub fn from_snapshot(snapshot: ContextSnapshot, logger: Option<Arc<dyn TaskLogger>>) -> Self {
        Self {
            values: snapshot.values,
            logger: if snapshot.has_logger { logger } else { None },
        }
    }
}

/// Wire form of a [`ShareContext`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub values: Kwargs,
    pub has_logger: bool,
}

/// Advisory cancellation flag. Setting it never interrupts a running call;
/// task code and the stage harness poll it at their own checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call view handed to a task function that declares a `&TaskContext`
/// parameter.
pub struct TaskContext {
    task_id: TaskId,
    function: String,
    share: Arc<ShareContext>,
    logger: Arc<dyn TaskLogger>,
    cancel: CancelToken,
    channels: Option<StageChannels>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        function: impl Into<String>,
        share: Arc<ShareContext>,
        cancel: CancelToken,
        channels: Option<StageChannels>,
    ) -> Self {
        let logger = share.effective_logger();
        Self {
            task_id,
            function: function.into(),
            share,
            logger,
            cancel,
            channels,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Registered name of the function being invoked
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn logger(&self) -> &dyn TaskLogger {
        self.logger.as_ref()
    }

    pub fn share(&self) -> &ShareContext {
        &self.share
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Stage queues, present only for tasks registered through a coordinator
    pub fn channels(&self) -> Option<&StageChannels> {
        self.channels.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_kwargs_hides_private_names() {
        let ctx = ShareContext::new()
            .with_value("region", "cn")
            .with_value("_secret", 1);
        let kwargs = ctx.to_kwargs();
        assert_eq!(kwargs.get("region"), Some(&json!("cn")));
        assert!(!kwargs.contains_key("_secret"));
    }

    #[test]
    fn test_context_overrides_task_kwargs() {
        let ctx = ShareContext::new().with_value("limit", 5);
        let mut kwargs = Kwargs::new();
        kwargs.insert("limit".into(), json!(100));
        kwargs.insert("symbol".into(), json!("rb"));
        ctx.merge_into(&mut kwargs);
        assert_eq!(kwargs["limit"], json!(5));
        assert_eq!(kwargs["symbol"], json!("rb"));
    }

    #[test]
    fn test_snapshot_drops_logger_but_remembers_it() {
        let ctx = ShareContext::new()
            .with_value("k", true)
            .with_logger(Arc::new(TracingLogger));
        let snapshot = ctx.snapshot();
        assert!(snapshot.has_logger);

        let restored = ShareContext::from_snapshot(snapshot.clone(), None);
        assert!(restored.logger().is_none());
        assert_eq!(restored.value("k"), Some(&json!(true)));

        let restored = ShareContext::from_snapshot(snapshot, Some(Arc::new(TracingLogger)));
        assert!(restored.logger().is_some());
    }

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
