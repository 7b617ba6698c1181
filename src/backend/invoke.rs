//! The call routine shared by every backend: resolve, bind, merge the shared
//! context, run under a resource probe and turn the result into an outcome.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::context::{CancelToken, ShareContext, TaskContext};
use crate::coord::queue::StageChannels;
use crate::core::memory::ResourceProbe;
use crate::function::{CallFrame, FunctionRegistry, Kwargs, TaskFailure, TaskFunction};
use crate::task::model::{TaskEnvelope, TaskOutcome};

/// Run a handler, converting panics into task failures
pub(crate) fn call_guarded(
    function: &'static TaskFunction,
    kwargs: Kwargs,
    ctx: &TaskContext,
) -> Result<Value, TaskFailure> {
    let mut frame = CallFrame::new(function.name, kwargs, ctx);
    match catch_unwind(AssertUnwindSafe(|| (function.handler)(&mut frame))) {
        Ok(result) => result,
        Err(payload) => Err(TaskFailure::from_panic(payload)),
    }
}

fn prepare(
    envelope: &TaskEnvelope,
    share: &ShareContext,
) -> Result<(&'static TaskFunction, Kwargs), TaskFailure> {
    let function = FunctionRegistry::global().resolve(&envelope.function)?;
    let mut kwargs = function.bind_arguments(&envelope.args, &envelope.kwargs)?;
    share.merge_into(&mut kwargs);
    Ok((function, kwargs))
}

/// Execute one task to completion on the current thread.
///
/// Never fails: every problem ends up in the returned outcome and is logged
/// through the context's logger.
pub(crate) fn invoke(
    envelope: &TaskEnvelope,
    share: Arc<ShareContext>,
    cancel: CancelToken,
    channels: Option<StageChannels>,
) -> TaskOutcome {
    let probe = ResourceProbe::start();
    let logger = share.effective_logger();

    let result = match prepare(envelope, &share) {
        Ok((function, kwargs)) => {
            let ctx = TaskContext::new(
                envelope.task_id.clone(),
                function.name,
                share,
                cancel,
                channels,
            );
            call_guarded(function, kwargs, &ctx)
        }
        Err(failure) => Err(failure),
    };

    let usage = probe.finish();
    let elapsed = usage.elapsed.as_secs_f64();
    match result {
        Ok(value) => {
            logger.info(&format!(
                "task {} ({}) done in {:.3}s",
                envelope.task_id, envelope.function, elapsed
            ));
            TaskOutcome::success(envelope.task_id.clone(), value, elapsed, usage.memory_delta_mb)
        }
        Err(failure) => {
            logger.error(&format!(
                "task {} ({}) failed: {}",
                envelope.task_id, envelope.function, failure
            ));
            TaskOutcome::failure(envelope.task_id.clone(), failure, elapsed, usage.memory_delta_mb)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{LogLevel, TaskLogger};
    use crate::task::model::TaskId;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(LogLevel, String)>>);

    impl TaskLogger for Recorder {
        fn log(&self, level: LogLevel, message: &str) {
            self.0.lock().push((level, message.to_string()));
        }
    }

    fn envelope(function: &str) -> TaskEnvelope {
        TaskEnvelope {
            task_id: TaskId::generate(),
            function: function.to_string(),
            args: vec![],
            kwargs: Kwargs::new(),
        }
    }

    #[test]
    fn test_unknown_function_is_a_failed_outcome() {
        let recorder = Arc::new(Recorder::default());
        let share = Arc::new(ShareContext::new().with_logger(recorder.clone()));
        let outcome = invoke(&envelope("nowhere::missing"), share, CancelToken::new(), None);

        assert_eq!(outcome.result, None);
        assert_eq!(
            outcome.failure,
            Some(TaskFailure::NotFound {
                name: "nowhere::missing".into()
            })
        );
        let logs = recorder.0.lock();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].0, LogLevel::Error);
    }

    #[test]
    fn test_registered_function_keeps_falsy_result() {
        let mut env = envelope("fixtures::echo");
        env.kwargs.insert("value".into(), json!(0));
        let outcome = invoke(&env, Arc::new(ShareContext::new()), CancelToken::new(), None);
        assert_eq!(outcome.result, Some(json!(0)));
        assert!(outcome.elapsed_secs >= 0.0);
    }
}
