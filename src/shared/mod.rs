//! Shared state and messaging between the frame worker and its consumer
//!
//! The worker thread reports through channel messages and a shared statistics
//! block; the consumer never calls into the pipeline while a frame is running.

pub mod messages;
pub mod state;

pub use messages::{PipelineEvent, WorkerCommand};
pub use state::{RuntimeStats, SharedStats};
