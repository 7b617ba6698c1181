use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::context::CancelToken;
use crate::core::errors::{ConveyorError, Result};
use crate::function::{Kwargs, TaskFailure, TaskFunction};

/// Globally unique task identifier, `task_<cuid2>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        TaskId(format!("task_{}", cuid2::create_id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        TaskId(value)
    }
}

/// Task lifecycle status. Cancellation is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "done" => Ok(TaskStatus::Done),
            "error" => Ok(TaskStatus::Error),
            other => Err(ConveyorError::configuration_field(
                format!("unknown task status '{}'", other),
                "status",
                "pending | done | error",
                other,
            )),
        }
    }
}

/// Caller-side description of a task to submit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Registered function name
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub group: Option<String>,
    pub tags: BTreeSet<String>,
    /// Display label, defaults to the function name
    pub name: Option<String>,
    /// Parameters left unbound for upstream injection (coordinator only)
    pub upstream_keys: Vec<String>,
}

impl TaskSpec {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Default::default()
        }
    }

    /// Spec for a registered function value
    pub fn of(function: &TaskFunction) -> Self {
        Self::new(function.name)
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn upstream(mut self, key: impl Into<String>) -> Self {
        self.upstream_keys.push(key.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.function)
    }
}

/// What a backend needs to run one task. Crosses the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

/// Result of one task call as reported by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub result: Option<Value>,
    pub failure: Option<TaskFailure>,
    pub elapsed_secs: f64,
    pub memory_mb: Option<f64>,
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn success(task_id: TaskId, result: Value, elapsed_secs: f64, memory_mb: Option<f64>) -> Self {
        Self {
            task_id,
            result: Some(result),
            failure: None,
            elapsed_secs,
            memory_mb,
            finished_at: Utc::now(),
        }
    }

    pub fn failure(
        task_id: TaskId,
        failure: TaskFailure,
        elapsed_secs: f64,
        memory_mb: Option<f64>,
    ) -> Self {
        Self {
            task_id,
            result: None,
            failure: Some(failure),
            elapsed_secs,
            memory_mb,
            finished_at: Utc::now(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        if self.failure.is_some() {
            TaskStatus::Error
        } else {
            TaskStatus::Done
        }
    }
}

/// Registry entry for one submitted task
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub group: Option<String>,
    pub tags: BTreeSet<String>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub failure: Option<TaskFailure>,
    pub elapsed_secs: Option<f64>,
    pub memory_mb: Option<f64>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub(crate) cancel: CancelToken,
}

impl Task {
    pub fn from_spec(id: TaskId, spec: TaskSpec) -> Self {
        let name = spec.display_name().to_string();
        Self {
            id,
            name,
            function: spec.function,
            args: spec.args,
            kwargs: spec.kwargs,
            group: spec.group,
            tags: spec.tags,
            status: TaskStatus::Pending,
            result: None,
            failure: None,
            elapsed_secs: None,
            memory_mb: None,
            submitted_at: Utc::now(),
            finished_at: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            task_id: self.id.clone(),
            function: self.function.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }

    /// Spec reproducing this task under a fresh id
    pub fn respec(&self) -> TaskSpec {
        TaskSpec {
            function: self.function.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            group: self.group.clone(),
            tags: self.tags.clone(),
            name: Some(self.name.clone()),
            upstream_keys: Vec::new(),
        }
    }
}

/// Read-only view returned by `get_task_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub function: String,
    pub group: Option<String>,
    pub tags: BTreeSet<String>,
    pub status: TaskStatus,
    pub cancelled: bool,
}

impl From<&Task> for TaskInfo {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            function: task.function.clone(),
            group: task.group.clone(),
            tags: task.tags.clone(),
            status: task.status,
            cancelled: task.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_prefixed_and_distinct() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert!(a.as_str().starts_with("task_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_spec_builder_and_display_name() {
        let spec = TaskSpec::new("math::add")
            .arg(2)
            .kwarg("y", 3)
            .group("g1")
            .tag("fast")
            .tag("fast");
        assert_eq!(spec.display_name(), "math::add");
        assert_eq!(spec.args, vec![json!(2)]);
        assert_eq!(spec.tags.len(), 1);
        assert_eq!(spec.clone().name("adder").display_name(), "adder");
    }

    #[test]
    fn test_respec_preserves_call_shape() {
        let spec = TaskSpec::new("math::add").arg(1).kwarg("y", 2).group("g").tag("t");
        let task = Task::from_spec(TaskId::generate(), spec);
        let again = task.respec();
        assert_eq!(again.function, "math::add");
        assert_eq!(again.args, task.args);
        assert_eq!(again.kwargs, task.kwargs);
        assert_eq!(again.group.as_deref(), Some("g"));
        assert_eq!(again.tags, task.tags);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!("Error".parse::<TaskStatus>().unwrap(), TaskStatus::Error);
        assert!("running".parse::<TaskStatus>().is_err());
        assert_eq!(serde_json::to_value(TaskStatus::Done).unwrap(), json!("done"));
    }
}
