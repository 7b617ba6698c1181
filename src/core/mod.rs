// Core infrastructure shared by the backends, the facade and the coordinator

pub mod errors;
pub mod memory;

// Re-export commonly used types
pub use errors::{ConveyorError, Result};
pub use memory::{ResourceProbe, ResourceUsage};
