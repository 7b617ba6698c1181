use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::model::{Task, TaskId, TaskInfo, TaskOutcome, TaskStatus};
use crate::context::CancelToken;

/// Bookkeeping store for every task submitted to one executor.
///
/// Identity, function and arguments of an entry never change. Status, result,
/// timing and memory are written once, when the backend reports the outcome.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Task>,
    order: RwLock<Vec<TaskId>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        let id = task.id.clone();
        if self.tasks.insert(id.clone(), task).is_none() {
            self.order.write().push(id);
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Clone of one entry
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    /// Record a backend outcome. Returns `false` when the task is unknown or
    /// already settled; the first outcome always wins.
    pub fn record(&self, outcome: TaskOutcome) -> bool {
        let Some(mut entry) = self.tasks.get_mut(&outcome.task_id) else {
            debug!(task_id = %outcome.task_id, "outcome for unknown task dropped");
            return false;
        };
        let task = entry.value_mut();
        if task.status.is_settled() {
            warn!(task_id = %task.id, "task already settled, ignoring second outcome");
            return false;
        }
        task.status = outcome.status();
        task.result = outcome.result;
        task.failure = outcome.failure;
        task.elapsed_secs = Some(outcome.elapsed_secs);
        task.memory_mb = outcome.memory_mb;
        task.finished_at = Some(outcome.finished_at);
        true
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// Stored result. `None` for unknown, pending and failed tasks alike.
    pub fn result(&self, id: &TaskId) -> Option<Value> {
        self.tasks.get(id).and_then(|t| t.result.clone())
    }

    pub fn elapsed(&self, id: &TaskId) -> Option<f64> {
        self.tasks.get(id).and_then(|t| t.elapsed_secs)
    }

    pub fn memory_usage(&self, id: &TaskId) -> Option<f64> {
        self.tasks.get(id).and_then(|t| t.memory_mb)
    }

    pub fn info(&self, id: &TaskId) -> Option<TaskInfo> {
        self.tasks.get(id).map(|t| TaskInfo::from(t.value()))
    }

    pub fn cancel_token(&self, id: &TaskId) -> Option<CancelToken> {
        self.tasks.get(id).map(|t| t.cancel.clone())
    }

    /// Ids in submission order
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.order.read().clone()
    }

    /// Entries in submission order
    pub fn snapshot(&self) -> Vec<Task> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Flag a task as cancelled. Advisory only.
    pub fn cancel(&self, id: &TaskId) -> bool {
        match self.tasks.get(id) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Flag every task of `group`, returning the flagged ids
    pub fn cancel_group(&self, group: &str) -> Vec<TaskId> {
        let ids = self.by_group(group);
        for id in &ids {
            self.cancel(id);
        }
        ids
    }

    pub fn is_cancelled(&self, id: &TaskId) -> Option<bool> {
        self.tasks.get(id).map(|t| t.is_cancelled())
    }

    fn select<F>(&self, predicate: F) -> Vec<TaskId>
    where
        F: Fn(&Task) -> bool,
    {
        self.order
            .read()
            .iter()
            .filter(|id| self.tasks.get(*id).map(|t| predicate(t.value())).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn by_group(&self, group: &str) -> Vec<TaskId> {
        self.select(|t| t.group.as_deref() == Some(group))
    }

    pub fn by_tag(&self, tag: &str) -> Vec<TaskId> {
        self.select(|t| t.tags.contains(tag))
    }

    pub fn by_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.select(|t| t.status == status)
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.select(|t| t.is_cancelled())
    }

    /// Task count per group
    pub fn summary_by_group(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.tasks.iter() {
            if let Some(group) = &entry.group {
                *counts.entry(group.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Task count per tag
    pub fn summary_by_tag(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.tasks.iter() {
            for tag in &entry.tags {
                *counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.tasks.iter() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    /// Drop every entry. Ids are never reissued, so lookups of old ids
    /// simply miss afterwards.
    pub fn reset(&self) {
        let mut order = self.order.write();
        self.tasks.clear();
        order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::TaskFailure;
    use crate::task::model::TaskSpec;
    use serde_json::json;
    use std::collections::HashSet;

    fn add(registry: &TaskRegistry, spec: TaskSpec) -> TaskId {
        let id = TaskId::generate();
        registry.insert(Task::from_spec(id.clone(), spec));
        id
    }

    #[test]
    fn test_record_is_write_once() {
        let registry = TaskRegistry::new();
        let id = add(&registry, TaskSpec::new("f"));
        assert_eq!(registry.status(&id), Some(TaskStatus::Pending));

        assert!(registry.record(TaskOutcome::success(id.clone(), json!(0), 0.1, Some(0.5))));
        assert!(!registry.record(TaskOutcome::failure(
            id.clone(),
            TaskFailure::raised("late"),
            0.2,
            None
        )));

        assert_eq!(registry.status(&id), Some(TaskStatus::Done));
        assert_eq!(registry.result(&id), Some(json!(0)));
        assert_eq!(registry.elapsed(&id), Some(0.1));
        assert_eq!(registry.memory_usage(&id), Some(0.5));
    }

    #[test]
    fn test_unknown_ids_return_none() {
        let registry = TaskRegistry::new();
        let ghost = TaskId::from("task_ghost");
        assert!(registry.status(&ghost).is_none());
        assert!(registry.result(&ghost).is_none());
        assert!(registry.info(&ghost).is_none());
        assert!(registry.is_cancelled(&ghost).is_none());
        assert!(!registry.cancel(&ghost));
    }

    #[test]
    fn test_group_and_tag_queries() {
        let registry = TaskRegistry::new();
        let a = add(&registry, TaskSpec::new("f").group("g1").tag("x"));
        let b = add(&registry, TaskSpec::new("f").group("g2").tag("x").tag("y"));
        let _c = add(&registry, TaskSpec::new("f"));

        assert_eq!(registry.by_group("g1"), vec![a.clone()]);
        assert_eq!(registry.by_tag("x"), vec![a.clone(), b.clone()]);
        assert_eq!(registry.summary_by_group().get("g2"), Some(&1));
        assert_eq!(registry.summary_by_tag().get("x"), Some(&2));
        assert_eq!(registry.task_ids().len(), 3);
    }

    #[test]
    fn test_cancel_group_flags_only_members() {
        let registry = TaskRegistry::new();
        let a = add(&registry, TaskSpec::new("f").group("g1"));
        let b = add(&registry, TaskSpec::new("f").group("g2"));
        let token = registry.cancel_token(&a).unwrap();

        assert_eq!(registry.cancel_group("g1"), vec![a.clone()]);
        assert!(token.is_cancelled());
        assert_eq!(registry.is_cancelled(&b), Some(false));
        assert_eq!(registry.cancelled(), vec![a]);
    }

    #[test]
    fn test_reset_never_reuses_ids() {
        let registry = TaskRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..50 {
            seen.insert(add(&registry, TaskSpec::new("f")));
        }
        registry.reset();
        assert!(registry.is_empty());
        for _ in 0..50 {
            assert!(seen.insert(add(&registry, TaskSpec::new("f"))));
        }
    }
}
