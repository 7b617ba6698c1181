//! Concurrent task execution with thread and worker-process backends, plus a
//! coordinator that chains worker pools into a staged pipeline.
//!
//! Task functions are plain Rust functions registered with [`task_fn`]:
//!
//! ```ignore
//! use conveyor::task_fn;
//!
//! #[task_fn(name = "math::add")]
//! fn add(x: i64, y: i64) -> i64 {
//!     x + y
//! }
//! ```
//!
//! Programs that use a process backend call [`worker::run_if_worker`] first
//! thing in `main`, because worker processes are re-executions of the same
//! binary.

// Allows the generated `::conveyor::` paths to resolve inside this crate
extern crate self as conveyor;

pub mod backend;
pub mod config;
pub mod context;
pub mod coord;
pub mod core;
pub mod executor;
pub mod function;
pub mod ipc;
pub mod logging;
pub mod report;
pub mod task;
pub mod worker;

#[cfg(test)]
mod fixtures;

pub use crate::core::errors::{ConveyorError, Result};
pub use backend::{Backend, BatchRecord};
pub use config::{BackendKind, CoordinatorConfig, ExecutorConfig, HarnessMode, WorkerCommandConfig};
pub use context::{CancelToken, LogLevel, ShareContext, TaskContext, TaskLogger, TracingLogger};
pub use conveyor_macros::task_fn;
pub use coord::{
    Coordinator, CycleOutput, PipelineState, Publication, StageChannels, StageMessage, StopSignal,
};
pub use executor::TaskExecutor;
pub use function::{
    CallFrame, FunctionRegistry, Kwargs, ParamSpec, TaskFailure, TaskFunction, TASK_FUNCTIONS,
};
pub use report::{FileReporter, ReportFormat, ReportSink, SummaryFilter, SummaryRow};
pub use task::{TaskId, TaskInfo, TaskSpec, TaskStatus};

/// Items used by `#[task_fn]` expansions
#[doc(hidden)]
pub mod __private {
    pub use crate::function::{ok_value, result_value};
    pub use linkme;
    pub use serde_json;
    pub use serde_json::Value;
}
