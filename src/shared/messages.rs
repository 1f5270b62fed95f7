//! Message types for communication between the frame worker and its consumer

use uuid::Uuid;

use crate::pipeline::FrameReport;
use crate::vision::DetectorOptions;

/// Messages sent from the worker to the consumer
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A frame finished; may carry partial results and stage errors
    Results(FrameReport),
    /// Something went wrong that the consumer should show
    Error {
        /// Frame the error belongs to, if any
        frame_id: Option<Uuid>,
        message: String,
    },
    /// A pending frame was replaced by a newer one before processing
    FrameDropped { frame_id: Uuid },
    /// The worker has shut down
    Stopped,
}

/// Messages sent from the consumer to the worker
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Rebuild the detector with new options between frames
    Reconfigure(DetectorOptions),
    /// Stop after the current frame
    Shutdown,
}
