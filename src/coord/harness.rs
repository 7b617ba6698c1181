//! Built-in task function that runs a user function as one pipeline stage.
//!
//! The coordinator never submits user functions directly. It submits
//! [`STAGE_HARNESS`] with the user function's name, its pre-bound keyword
//! arguments and the names left for upstream injection; the harness then
//! talks to the sequencer through the task's stage queues.

use serde_json::{json, Value};

use crate::backend::invoke::call_guarded;
use crate::config::HarnessMode;
use crate::context::TaskContext;
use crate::coord::queue::{StageChannels, StageMessage};
use crate::function::{
    CallFrame, FunctionRegistry, Kwargs, ParamSpec, TaskFailure, TaskFunction, TASK_FUNCTIONS,
};

/// Registered name of the harness
pub const STAGE_HARNESS: &str = "conveyor::stage_harness";

pub(crate) const FUNCTION_KEY: &str = "_function";
pub(crate) const BOUND_KEY: &str = "_bound";
pub(crate) const INJECTED_KEY: &str = "_injected";
pub(crate) const MODE_KEY: &str = "_mode";

fn no_injected_keys() -> Value {
    json!([])
}

static HARNESS_PARAMS: [ParamSpec; 4] = [
    ParamSpec::required(FUNCTION_KEY),
    ParamSpec::required(BOUND_KEY),
    ParamSpec::with_default(INJECTED_KEY, no_injected_keys),
    ParamSpec::required(MODE_KEY),
];

#[linkme::distributed_slice(TASK_FUNCTIONS)]
static STAGE_HARNESS_FUNCTION: TaskFunction = TaskFunction {
    name: STAGE_HARNESS,
    params: &HARNESS_PARAMS,
    handler: run_stage,
};

/// Keyword arguments of one harness submission
pub(crate) fn harness_kwargs(
    function: &str,
    bound: Kwargs,
    injected: &[String],
    mode: HarnessMode,
) -> Kwargs {
    let mut kwargs = Kwargs::new();
    kwargs.insert(FUNCTION_KEY.into(), Value::String(function.to_string()));
    kwargs.insert(BOUND_KEY.into(), Value::Object(bound));
    kwargs.insert(INJECTED_KEY.into(), json!(injected));
    kwargs.insert(MODE_KEY.into(), Value::String(mode.as_str().to_string()));
    kwargs
}

fn run_stage(frame: &mut CallFrame<'_>) -> Result<Value, TaskFailure> {
    let function: String = frame.take(FUNCTION_KEY)?;
    let bound: Kwargs = frame.take(BOUND_KEY)?;
    let injected: Vec<String> = frame.take(INJECTED_KEY)?;
    let mode: HarnessMode = frame.take(MODE_KEY)?;

    let ctx = frame.context();
    let channels = ctx.channels().ok_or_else(|| TaskFailure::Binding {
        message: "stage harness started without stage queues".to_string(),
    })?;
    let target = FunctionRegistry::global().resolve(&function)?;

    let stage = Stage {
        target,
        bound,
        injected,
        ctx,
        channels,
    };
    match mode {
        HarnessMode::Once => stage.once(),
        HarnessMode::Persistent => stage.persistent(),
        HarnessMode::Custom => stage.custom(),
    }
}

struct Stage<'a> {
    target: &'static TaskFunction,
    bound: Kwargs,
    injected: Vec<String>,
    ctx: &'a TaskContext,
    channels: &'a StageChannels,
}

impl Stage<'_> {
    /// Bind one cycle's upstream values into the injected parameters
    fn merge(&self, upstream: Option<Vec<Value>>) -> Result<Kwargs, TaskFailure> {
        let mut kwargs = self.bound.clone();
        if let Some(values) = upstream {
            match self.injected.as_slice() {
                [] => {}
                [key] => {
                    kwargs.insert(key.clone(), Value::Array(values));
                }
                keys => {
                    for key in keys {
                        let value = values
                            .iter()
                            .find_map(|item| item.get(key.as_str()))
                            .ok_or_else(|| TaskFailure::Argument {
                                parameter: key.clone(),
                                message: "no upstream publication carries this field".to_string(),
                            })?;
                        kwargs.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        self.ctx.share().merge_into(&mut kwargs);
        Ok(kwargs)
    }

    fn call(&self, upstream: Option<Vec<Value>>) -> Result<Value, TaskFailure> {
        let kwargs = self.merge(upstream)?;
        call_guarded(self.target, kwargs, self.ctx)
    }

    fn publish(&self, value: Value) {
        if let Err(e) = self.channels.publish(value) {
            tracing::debug!(task_id = %self.ctx.task_id(), error = %e, "publish dropped");
        }
    }

    /// Next cycle's input. `None` ends the harness.
    fn next_input(&self) -> Option<Option<Vec<Value>>> {
        match self.channels.recv()? {
            StageMessage::Proceed => Some(None),
            StageMessage::Payload(values) => Some(Some(values)),
            StageMessage::Close => None,
        }
    }

    fn once(&self) -> Result<Value, TaskFailure> {
        let upstream = self
            .next_input()
            .ok_or_else(|| TaskFailure::raised("pipeline stopped before the stage ran"))?;
        match self.call(upstream) {
            Ok(value) => {
                self.publish(value.clone());
                Ok(value)
            }
            Err(failure) => {
                self.publish(json!({}));
                Err(failure)
            }
        }
    }

    fn persistent(&self) -> Result<Value, TaskFailure> {
        let logger = self.ctx.logger();
        let mut last = None;
        let mut cycle = 0usize;
        while !self.channels.is_stopped() {
            let Some(upstream) = self.next_input() else {
                break;
            };
            if self.channels.is_stopped() {
                break;
            }
            cycle += 1;
            match self.call(upstream) {
                Ok(value) => {
                    self.publish(value.clone());
                    last = Some(value);
                }
                Err(failure) => {
                    logger.error(&format!(
                        "stage cycle {} of {} failed: {}",
                        cycle, self.target.name, failure
                    ));
                    self.publish(json!({}));
                }
            }
        }
        Ok(last.unwrap_or(Value::Bool(true)))
    }

    fn custom(&self) -> Result<Value, TaskFailure> {
        let kwargs = self.merge(None)?;
        call_guarded(self.target, kwargs, self.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancelToken, ShareContext};
    use crate::coord::queue::{stage_queues, Publication, StageEndpoints, StopSignal};
    use crate::task::model::TaskId;
    use std::sync::Arc;

    fn harness_context(
        capacity: usize,
    ) -> (
        TaskContext,
        tokio::sync::mpsc::Sender<StageMessage>,
        tokio::sync::mpsc::Receiver<Publication>,
        StopSignal,
    ) {
        let ((req_tx, req_rx), (pub_tx, pub_rx)) = stage_queues(capacity);
        let stop = StopSignal::new();
        let channels = StageChannels::local(StageEndpoints {
            requests: req_rx,
            publish: pub_tx,
            stop: stop.clone(),
        });
        let ctx = TaskContext::new(
            TaskId::generate(),
            STAGE_HARNESS,
            Arc::new(ShareContext::new()),
            CancelToken::new(),
            Some(channels),
        );
        (ctx, req_tx, pub_rx, stop)
    }

    /// Registration applies declared defaults before the harness sees them
    fn factor_ten() -> Kwargs {
        let mut bound = Kwargs::new();
        bound.insert("factor".into(), json!(10));
        bound
    }

    fn run(ctx: &TaskContext, kwargs: Kwargs) -> Result<Value, TaskFailure> {
        call_guarded(&STAGE_HARNESS_FUNCTION, kwargs, ctx)
    }

    #[test]
    fn test_once_stage_one_runs_on_proceed() {
        let (ctx, req_tx, mut pub_rx, _stop) = harness_context(4);
        req_tx.blocking_send(StageMessage::Proceed).unwrap();

        let mut bound = Kwargs::new();
        bound.insert("x".into(), json!(2));
        bound.insert("y".into(), json!(3));
        let result = run(&ctx, harness_kwargs("fixtures::add", bound, &[], HarnessMode::Once));

        assert_eq!(result, Ok(json!(5)));
        assert_eq!(pub_rx.blocking_recv(), Some(Publication::Value(json!(5))));
    }

    #[test]
    fn test_single_injected_key_takes_whole_payload() {
        let (ctx, req_tx, mut pub_rx, _stop) = harness_context(4);
        req_tx
            .blocking_send(StageMessage::Payload(vec![json!(2), json!(3)]))
            .unwrap();

        let result = run(
            &ctx,
            harness_kwargs(
                "fixtures::scale",
                factor_ten(),
                &["total".to_string()],
                HarnessMode::Once,
            ),
        );
        assert_eq!(result, Ok(json!(50)));
        assert_eq!(pub_rx.blocking_recv(), Some(Publication::Value(json!(50))));
    }

    #[test]
    fn test_several_keys_pick_fields_from_publications() {
        let (ctx, req_tx, mut pub_rx, _stop) = harness_context(4);
        req_tx
            .blocking_send(StageMessage::Payload(vec![json!({"x": 4}), json!({"y": 6})]))
            .unwrap();

        let result = run(
            &ctx,
            harness_kwargs(
                "fixtures::add",
                Kwargs::new(),
                &["x".to_string(), "y".to_string()],
                HarnessMode::Once,
            ),
        );
        assert_eq!(result, Ok(json!(10)));
        assert_eq!(pub_rx.blocking_recv(), Some(Publication::Value(json!(10))));
    }

    #[test]
    fn test_once_failure_publishes_placeholder() {
        let (ctx, req_tx, mut pub_rx, _stop) = harness_context(4);
        req_tx.blocking_send(StageMessage::Proceed).unwrap();

        let result = run(
            &ctx,
            harness_kwargs("fixtures::boom", Kwargs::new(), &[], HarnessMode::Once),
        );
        assert!(result.is_err());
        assert_eq!(pub_rx.blocking_recv(), Some(Publication::Value(json!({}))));
    }

    #[test]
    fn test_persistent_survives_failed_cycles_until_close() {
        let (ctx, req_tx, mut pub_rx, _stop) = harness_context(8);
        req_tx
            .blocking_send(StageMessage::Payload(vec![json!("not a number")]))
            .unwrap();
        req_tx
            .blocking_send(StageMessage::Payload(vec![json!(1)]))
            .unwrap();
        req_tx.blocking_send(StageMessage::Close).unwrap();

        let result = run(
            &ctx,
            harness_kwargs(
                "fixtures::scale",
                factor_ten(),
                &["total".to_string()],
                HarnessMode::Persistent,
            ),
        );
        assert_eq!(result, Ok(json!(10)));
        assert_eq!(pub_rx.blocking_recv(), Some(Publication::Value(json!({}))));
        assert_eq!(pub_rx.blocking_recv(), Some(Publication::Value(json!(10))));
    }

    #[test]
    fn test_once_closed_before_running_is_a_failure() {
        let (ctx, req_tx, _pub_rx, _stop) = harness_context(4);
        req_tx.blocking_send(StageMessage::Close).unwrap();
        let result = run(
            &ctx,
            harness_kwargs("fixtures::add", Kwargs::new(), &[], HarnessMode::Once),
        );
        assert!(matches!(result, Err(TaskFailure::Raised { .. })));
    }
}
