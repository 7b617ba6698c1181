//! Task function registry and argument binding.
//!
//! Task functions are collected at link time into [`TASK_FUNCTIONS`], usually
//! through the `#[task_fn]` attribute. Every process linking the crate sees the
//! same table, so a worker process resolves a function name exactly the way the
//! parent did.

use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::context::TaskContext;
use crate::core::errors::{ConveyorError, Result};

/// Keyword arguments, in insertion order
pub type Kwargs = serde_json::Map<String, Value>;

/// One declared parameter of a task function
#[derive(Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    /// Declared default, evaluated each time it is applied
    pub default: Option<fn() -> Value>,
}

impl ParamSpec {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            default: None,
        }
    }

    pub const fn with_default(name: &'static str, default: fn() -> Value) -> Self {
        Self {
            name,
            default: Some(default),
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Handler generated for a task function: pulls its arguments out of the
/// frame, calls the function and converts the return value.
pub type TaskHandler = fn(&mut CallFrame<'_>) -> std::result::Result<Value, TaskFailure>;

/// A named, addressable unit of work
pub struct TaskFunction {
    pub name: &'static str,
    pub params: &'static [ParamSpec],
    pub handler: TaskHandler,
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

#[linkme::distributed_slice]
pub static TASK_FUNCTIONS: [TaskFunction] = [..];

impl TaskFunction {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn param_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.params.iter().map(|p| p.name)
    }

    /// Bind positional and keyword arguments without applying defaults.
    ///
    /// Positionals fill the declared parameters in order, keywords bind by
    /// name. Too many positionals, an unknown keyword or a parameter bound
    /// twice are rejected.
    pub fn bind_partial(&self, args: &[Value], kwargs: &Kwargs) -> Result<Kwargs> {
        if args.len() > self.params.len() {
            return Err(ConveyorError::binding(
                self.name,
                format!(
                    "takes {} positional argument(s) but {} were given",
                    self.params.len(),
                    args.len()
                ),
            ));
        }

        let mut bound = Kwargs::new();
        for (spec, value) in self.params.iter().zip(args) {
            bound.insert(spec.name.to_string(), value.clone());
        }

        for (key, value) in kwargs {
            if self.param(key).is_none() {
                return Err(ConveyorError::binding_param(
                    self.name,
                    format!("got an unexpected keyword argument '{}'", key),
                    key.as_str(),
                ));
            }
            if bound.contains_key(key) {
                return Err(ConveyorError::binding_param(
                    self.name,
                    format!("got multiple values for argument '{}'", key),
                    key.as_str(),
                ));
            }
            bound.insert(key.clone(), value.clone());
        }
        Ok(bound)
    }

    /// Fill unbound parameters from their declared defaults, leaving the
    /// names in `skip` untouched.
    pub fn apply_defaults(&self, bound: &mut Kwargs, skip: &[String]) {
        for spec in self.params {
            if bound.contains_key(spec.name) || skip.iter().any(|s| s == spec.name) {
                continue;
            }
            if let Some(default) = spec.default {
                bound.insert(spec.name.to_string(), default());
            }
        }
    }

    /// Partial binding followed by defaults
    pub fn bind_arguments(&self, args: &[Value], kwargs: &Kwargs) -> Result<Kwargs> {
        let mut bound = self.bind_partial(args, kwargs)?;
        self.apply_defaults(&mut bound, &[]);
        Ok(bound)
    }

    /// Required parameters that are neither bound nor satisfied by `provided`
    pub fn missing_required<F>(&self, bound: &Kwargs, provided: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> bool,
    {
        self.params
            .iter()
            .filter(|p| p.is_required() && !bound.contains_key(p.name) && !provided(p.name))
            .map(|p| p.name)
            .collect()
    }
}

/// Name-indexed view over [`TASK_FUNCTIONS`]
pub struct FunctionRegistry {
    by_name: HashMap<&'static str, &'static TaskFunction>,
}

lazy_static! {
    static ref GLOBAL_FUNCTIONS: FunctionRegistry = FunctionRegistry::from_slice(&TASK_FUNCTIONS);
}

impl FunctionRegistry {
    fn from_slice(functions: &'static [TaskFunction]) -> Self {
        let mut by_name = HashMap::with_capacity(functions.len());
        for function in functions {
            if by_name.insert(function.name, function).is_some() {
                warn!(function = function.name, "duplicate task function name, last one wins");
            }
        }
        Self { by_name }
    }

    /// The process-wide table, built on first use
    pub fn global() -> &'static FunctionRegistry {
        &GLOBAL_FUNCTIONS
    }

    pub fn get(&self, name: &str) -> Option<&'static TaskFunction> {
        self.by_name.get(name).copied()
    }

    pub fn resolve(&self, name: &str) -> Result<&'static TaskFunction> {
        self.get(name)
            .ok_or_else(|| ConveyorError::function_not_found(name))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Why a single task call failed. Recorded in the registry, never returned
/// from the executor API.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The function returned an error
    #[error("{message}")]
    Raised { message: String },
    #[error("panicked: {message}")]
    Panicked { message: String },
    /// An argument was missing or had the wrong shape
    #[error("argument '{parameter}': {message}")]
    Argument { parameter: String, message: String },
    #[error("binding failed: {message}")]
    Binding { message: String },
    #[error("function not registered: {name}")]
    NotFound { name: String },
    /// The worker process running the task exited before reporting back
    #[error("worker {worker} exited while running the task")]
    WorkerLost { worker: String },
}

impl TaskFailure {
    pub fn raised(message: impl fmt::Display) -> Self {
        TaskFailure::Raised {
            message: message.to_string(),
        }
    }

    /// Build a failure from a `catch_unwind` payload
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskFailure::Panicked { message }
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(err: anyhow::Error) -> Self {
        TaskFailure::Raised {
            message: format!("{:#}", err),
        }
    }
}

impl From<ConveyorError> for TaskFailure {
    fn from(err: ConveyorError) -> Self {
        match err {
            ConveyorError::FunctionNotFound { name } => TaskFailure::NotFound { name },
            ConveyorError::Binding { message, .. } => TaskFailure::Binding { message },
            other => TaskFailure::raised(other),
        }
    }
}

/// Arguments of one call, consumed parameter by parameter by the handler
pub struct CallFrame<'a> {
    function: &'static str,
    kwargs: Kwargs,
    context: &'a TaskContext,
}

impl<'a> CallFrame<'a> {
    pub fn new(function: &'static str, kwargs: Kwargs, context: &'a TaskContext) -> Self {
        Self {
            function,
            kwargs,
            context,
        }
    }

    pub fn function(&self) -> &'static str {
        self.function
    }

    /// Remove and deserialize the argument `name`. A missing argument
    /// deserializes from null, so `Option` parameters come out as `None`.
    pub fn take<T: DeserializeOwned>(&mut self, name: &str) -> std::result::Result<T, TaskFailure> {
        let (value, present) = match self.kwargs.remove(name) {
            Some(value) => (value, true),
            None => (Value::Null, false),
        };
        serde_json::from_value(value).map_err(|e| TaskFailure::Argument {
            parameter: name.to_string(),
            message: if present {
                e.to_string()
            } else {
                "missing required argument".to_string()
            },
        })
    }

    pub fn kwargs(&self) -> &Kwargs {
        &self.kwargs
    }

    pub fn context(&self) -> &'a TaskContext {
        self.context
    }
}

/// Convert a plain return value. A null result is stored as `true` so that
/// null stays reserved for failed tasks.
pub fn ok_value<T: Serialize>(value: T) -> std::result::Result<Value, TaskFailure> {
    match serde_json::to_value(value) {
        Ok(Value::Null) => Ok(Value::Bool(true)),
        Ok(value) => Ok(value),
        Err(e) => Err(TaskFailure::raised(format!("result is not serializable: {}", e))),
    }
}

/// Convert a fallible return value
pub fn result_value<T, E>(result: std::result::Result<T, E>) -> std::result::Result<Value, TaskFailure>
where
    T: Serialize,
    E: fmt::Display,
{
    match result {
        Ok(value) => ok_value(value),
        Err(e) => Err(TaskFailure::Raised {
            message: format!("{:#}", e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn noop(_frame: &mut CallFrame<'_>) -> std::result::Result<Value, TaskFailure> {
        Ok(Value::Bool(true))
    }

    fn default_extra() -> Value {
        json!(10)
    }

    static PARAMS: [ParamSpec; 3] = [
        ParamSpec::required("total"),
        ParamSpec::required("symbol"),
        ParamSpec::with_default("extra", default_extra),
    ];

    static FIXTURE: TaskFunction = TaskFunction {
        name: "fixture::combine",
        params: &PARAMS,
        handler: noop,
    };

    fn kwargs(value: Value) -> Kwargs {
        match value {
            Value::Object(map) => map,
            _ => Kwargs::new(),
        }
    }

    #[test]
    fn test_positional_then_keyword_binding() {
        let bound = FIXTURE
            .bind_arguments(&[json!(5)], &kwargs(json!({"symbol": "rb"})))
            .unwrap();
        assert_eq!(Value::Object(bound), json!({"total": 5, "symbol": "rb", "extra": 10}));
    }

    #[test]
    fn test_partial_binding_leaves_defaults_out() {
        let bound = FIXTURE.bind_partial(&[], &kwargs(json!({"symbol": "rb"}))).unwrap();
        assert_eq!(Value::Object(bound.clone()), json!({"symbol": "rb"}));
        assert_eq!(FIXTURE.missing_required(&bound, |_| false), vec!["total"]);
        assert!(FIXTURE.missing_required(&bound, |name| name == "total").is_empty());
    }

    #[test]
    fn test_defaults_skip_injected_names() {
        let mut bound = Kwargs::new();
        FIXTURE.apply_defaults(&mut bound, &["extra".to_string()]);
        assert!(bound.is_empty());
    }

    #[test]
    fn test_binding_errors() {
        let too_many = FIXTURE.bind_partial(&[json!(1), json!(2), json!(3), json!(4)], &Kwargs::new());
        assert!(matches!(too_many, Err(ConveyorError::Binding { .. })));

        let unknown = FIXTURE.bind_partial(&[], &kwargs(json!({"volume": 1})));
        match unknown {
            Err(ConveyorError::Binding { parameter, .. }) => {
                assert_eq!(parameter.as_deref(), Some("volume"))
            }
            other => panic!("unexpected: {other:?}"),
        }

        let twice = FIXTURE.bind_partial(&[json!(1)], &kwargs(json!({"total": 2})));
        assert!(matches!(twice, Err(ConveyorError::Binding { .. })));
    }

    #[test]
    fn test_null_result_becomes_true() {
        assert_eq!(ok_value(()).unwrap(), json!(true));
        assert_eq!(ok_value(None::<i32>).unwrap(), json!(true));
        assert_eq!(ok_value(0).unwrap(), json!(0));
        assert_eq!(ok_value("").unwrap(), json!(""));
        assert_eq!(ok_value(false).unwrap(), json!(false));
    }

    #[test]
    fn test_result_value_maps_errors() {
        let failed: std::result::Result<i32, anyhow::Error> = Err(anyhow::anyhow!("boom"));
        assert_eq!(
            result_value(failed).unwrap_err(),
            TaskFailure::Raised {
                message: "boom".into()
            }
        );
        let ok: std::result::Result<(), String> = Ok(());
        assert_eq!(result_value(ok).unwrap(), json!(true));
    }

    #[test]
    fn test_panic_payload_message() {
        let payload = std::panic::catch_unwind(|| panic!("kaput")).unwrap_err();
        assert_eq!(
            TaskFailure::from_panic(payload),
            TaskFailure::Panicked {
                message: "kaput".into()
            }
        );
    }

    #[test]
    fn test_failure_wire_shape() {
        let failure = TaskFailure::WorkerLost {
            worker: "w-1".into(),
        };
        let encoded = serde_json::to_value(&failure).unwrap();
        assert_eq!(encoded, json!({"kind": "worker_lost", "worker": "w-1"}));
        let decoded: TaskFailure = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, failure);
    }
}
