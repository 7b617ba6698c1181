//! Staged pipelines: stage queues, the stage harness and the coordinator
//! that sequences stages behind a full barrier.

pub mod coordinator;
pub mod harness;
pub mod queue;

pub use coordinator::{Coordinator, CycleOutput, PipelineState};
pub use harness::STAGE_HARNESS;
pub use queue::{Publication, StageChannels, StageMessage, StopSignal};
