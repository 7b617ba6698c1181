use std::collections::HashSet;
use std::sync::Arc;

use conveyor::{
    task_fn, ExecutorConfig, LogLevel, ReportFormat, ShareContext, SummaryFilter, TaskContext,
    TaskExecutor, TaskFailure, TaskLogger, TaskSpec, TaskStatus,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

#[task_fn(name = "demo::add")]
fn add(x: i64, y: i64) -> i64 {
    x + y
}

#[task_fn(name = "demo::fail")]
fn fail(message: String) -> anyhow::Result<i64> {
    anyhow::bail!(message)
}

#[task_fn(name = "demo::echo")]
fn echo(value: Value) -> Value {
    value
}

#[task_fn(name = "demo::nothing")]
fn nothing() {}

#[task_fn(name = "demo::panics")]
fn panics() -> i64 {
    panic!("kaboom")
}

#[task_fn(name = "demo::limit")]
fn limit(limit: i64) -> i64 {
    limit
}

#[task_fn(name = "demo::logs")]
fn logs(ctx: &TaskContext, line: String) -> usize {
    ctx.logger().info(&line);
    line.len()
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(LogLevel, String)>>);

impl TaskLogger for Recorder {
    fn log(&self, level: LogLevel, message: &str) {
        self.0.lock().push((level, message.to_string()));
    }
}

impl Recorder {
    fn count(&self, level: LogLevel) -> usize {
        self.0.lock().iter().filter(|(l, _)| *l == level).count()
    }
}

fn executor() -> TaskExecutor {
    let config = ExecutorConfig::builder().max_workers(4).build().unwrap();
    TaskExecutor::new(config).unwrap()
}

#[tokio::test]
async fn test_failing_task_is_logged_and_stored_as_error() {
    let recorder = Arc::new(Recorder::default());
    let mut executor = executor();
    executor
        .bind_share(ShareContext::new().with_logger(recorder.clone()))
        .unwrap();

    let bad = executor
        .submit(TaskSpec::new("demo::fail").kwarg("message", "boom"))
        .unwrap();
    let good = executor.submit(TaskSpec::new("demo::add").arg(1).arg(2)).unwrap();
    executor.start().await.unwrap();
    let results = executor.join(true).await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(executor.get_status(&bad), Some(TaskStatus::Error));
    assert_eq!(executor.get_result(&bad), None);
    assert_eq!(executor.get_status(&good), Some(TaskStatus::Done));
    assert_eq!(recorder.count(LogLevel::Error), 1);
    assert!(recorder
        .0
        .lock()
        .iter()
        .any(|(level, line)| *level == LogLevel::Error && line.contains("boom")));

    let failure = executor.registry().get(&bad).unwrap().failure;
    assert_eq!(
        failure,
        Some(TaskFailure::Raised {
            message: "boom".into()
        })
    );
}

#[tokio::test]
async fn test_falsy_results_are_kept_and_unit_becomes_true() {
    let mut executor = executor();
    let cases = [json!(0), json!(""), json!(false), json!([])];
    let ids: Vec<_> = cases
        .iter()
        .map(|value| {
            executor
                .submit(TaskSpec::new("demo::echo").kwarg("value", value.clone()))
                .unwrap()
        })
        .collect();
    let unit = executor.submit(TaskSpec::new("demo::nothing")).unwrap();

    executor.start().await.unwrap();
    executor.join(false).await.unwrap();

    for (id, expected) in ids.iter().zip(cases.iter()) {
        assert_eq!(executor.get_result(id).as_ref(), Some(expected));
        assert_eq!(executor.get_status(id), Some(TaskStatus::Done));
    }
    assert_eq!(executor.get_result(&unit), Some(json!(true)));
}

#[tokio::test]
async fn test_panicking_task_does_not_escape_join() {
    let mut executor = executor();
    let id = executor.submit(TaskSpec::new("demo::panics")).unwrap();
    executor.start().await.unwrap();
    executor.join(true).await.unwrap();

    assert_eq!(executor.get_status(&id), Some(TaskStatus::Error));
    assert_eq!(executor.get_result(&id), None);
    match executor.registry().get(&id).unwrap().failure {
        Some(TaskFailure::Panicked { message }) => assert!(message.contains("kaboom")),
        other => panic!("expected a panic failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_argument_is_a_task_error() {
    let mut executor = executor();
    let id = executor.submit(TaskSpec::new("demo::add").arg(1)).unwrap();
    executor.start().await.unwrap();
    executor.join(false).await.unwrap();
    assert!(matches!(
        executor.registry().get(&id).unwrap().failure,
        Some(TaskFailure::Argument { .. })
    ));
}

#[tokio::test]
async fn test_context_values_override_task_kwargs() {
    let mut executor = executor();
    executor
        .bind_share(ShareContext::new().with_value("limit", 5))
        .unwrap();
    let id = executor
        .submit(TaskSpec::new("demo::limit").kwarg("limit", 100))
        .unwrap();
    executor.start().await.unwrap();
    executor.join(false).await.unwrap();
    assert_eq!(executor.get_result(&id), Some(json!(5)));
}

#[tokio::test]
async fn test_task_logs_through_bound_logger() {
    let recorder = Arc::new(Recorder::default());
    let mut executor = executor();
    executor
        .bind_share(ShareContext::new().with_logger(recorder.clone()))
        .unwrap();
    let id = executor
        .submit(TaskSpec::new("demo::logs").kwarg("line", "hello"))
        .unwrap();
    executor.start().await.unwrap();
    executor.join(false).await.unwrap();

    assert_eq!(executor.get_result(&id), Some(json!(5)));
    assert!(recorder
        .0
        .lock()
        .iter()
        .any(|(level, line)| *level == LogLevel::Info && line == "hello"));
}

#[tokio::test]
async fn test_retry_failed_creates_fresh_tasks() {
    let mut executor = executor();
    let failed = executor
        .submit(
            TaskSpec::new("demo::fail")
                .kwarg("message", "again")
                .group("g1")
                .tag("flaky")
                .name("flaky-one"),
        )
        .unwrap();
    executor.submit(TaskSpec::new("demo::add").arg(1).arg(1)).unwrap();
    executor.start().await.unwrap();
    executor.join(false).await.unwrap();

    let retried = executor.retry_failed().unwrap();
    assert_eq!(retried.len(), 1);
    assert_ne!(retried[0], failed);
    executor.join(false).await.unwrap();

    let original = executor.registry().get(&failed).unwrap();
    let copy = executor.registry().get(&retried[0]).unwrap();
    assert_eq!(original.status, TaskStatus::Error);
    assert_eq!(copy.function, original.function);
    assert_eq!(copy.kwargs, original.kwargs);
    assert_eq!(copy.group, original.group);
    assert_eq!(copy.tags, original.tags);
    assert_eq!(copy.name, "flaky-one");
    assert_eq!(executor.get_task_ids().len(), 3);
}

#[tokio::test]
async fn test_rerun_cancelled_selects_by_flag() {
    let mut executor = executor();
    let a = executor
        .submit(TaskSpec::new("demo::add").arg(1).arg(2).group("batch"))
        .unwrap();
    let b = executor
        .submit(TaskSpec::new("demo::add").arg(3).arg(4).group("batch"))
        .unwrap();
    let c = executor.submit(TaskSpec::new("demo::add").arg(5).arg(6)).unwrap();

    let cancelled = executor.cancel_group("batch");
    assert_eq!(cancelled.len(), 2);
    assert!(executor.is_cancelled(&a));
    assert!(executor.is_cancelled(&b));
    assert!(!executor.is_cancelled(&c));

    // Advisory only: cancelled tasks still run
    executor.start().await.unwrap();
    executor.join(false).await.unwrap();
    assert_eq!(executor.get_result(&a), Some(json!(3)));

    let rerun = executor.rerun_cancelled().unwrap();
    assert_eq!(rerun.len(), 2);
    executor.join(false).await.unwrap();
    for id in &rerun {
        assert!(!executor.is_cancelled(id));
        assert_eq!(executor.get_status(id), Some(TaskStatus::Done));
    }
}

#[tokio::test]
async fn test_filter_summary_intersects_criteria() {
    let mut executor = executor();
    let target = executor
        .submit(TaskSpec::new("demo::fail").kwarg("message", "x").group("g1"))
        .unwrap();
    executor
        .submit(TaskSpec::new("demo::add").arg(1).arg(1).group("g1"))
        .unwrap();
    executor
        .submit(TaskSpec::new("demo::fail").kwarg("message", "y").group("g2"))
        .unwrap();
    executor.start().await.unwrap();
    executor.join(false).await.unwrap();

    let rows =
        executor.filter_summary(&SummaryFilter::new().status(TaskStatus::Error).group("g1"));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task_id, target);
    assert_eq!(executor.summary().len(), 3);
    assert_eq!(executor.summary_by_group().get("g1"), Some(&2));
}

#[tokio::test]
async fn test_report_writes_summary_and_charts() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor();
    executor.submit(TaskSpec::new("demo::add").arg(1).arg(2)).unwrap();
    executor
        .submit(TaskSpec::new("demo::fail").kwarg("message", "bad"))
        .unwrap();
    executor.start().await.unwrap();
    executor.join(false).await.unwrap();

    let out = executor
        .report(dir.path(), ReportFormat::Csv, false, &SummaryFilter::new())
        .unwrap();
    let csv = std::fs::read_to_string(out.join("task_summary.csv")).unwrap();
    assert_eq!(csv.lines().count(), 3);
    for chart in ["task_timeline.svg", "task_status.svg", "task_memory_usage.svg"] {
        assert!(out.join(chart).is_file());
    }
}

#[tokio::test]
async fn test_ids_stay_unique_across_reset() {
    let mut executor = executor();
    let mut seen = HashSet::new();
    for _ in 0..3 {
        for _ in 0..20 {
            let id = executor.submit(TaskSpec::new("demo::add").arg(0).arg(0)).unwrap();
            assert!(seen.insert(id));
        }
        executor.reset();
    }
    assert_eq!(seen.len(), 60);
}
