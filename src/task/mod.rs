pub mod model;
pub mod registry;

pub use model::{Task, TaskEnvelope, TaskId, TaskInfo, TaskOutcome, TaskSpec, TaskStatus};
pub use registry::TaskRegistry;
