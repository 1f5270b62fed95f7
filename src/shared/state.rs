//! Runtime statistics shared between the frame worker and its consumer

use parking_lot::RwLock;
use std::sync::Arc;

use crate::pipeline::FrameReport;

/// Statistics handle shared across threads
pub type SharedStats = Arc<RwLock<RuntimeStats>>;

/// Runtime state that is not persisted
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    /// Frames that produced a report
    pub frames_processed: u64,
    /// Frames replaced before they were processed
    pub frames_dropped: u64,
    /// Events lost because the consumer stopped reading
    pub events_dropped: u64,
    /// Detection time of the last frame
    pub last_inference_ms: Option<u64>,
    /// Recognition time of the last frame
    pub last_recognition_ms: Option<u64>,
    /// Associations in the last frame that found a price
    pub last_priced: usize,
    /// Last error message (if any)
    pub last_error: Option<String>,
}

impl RuntimeStats {
    /// Record a finished frame
    pub fn record_frame(&mut self, report: &FrameReport) {
        self.frames_processed += 1;
        self.last_inference_ms = Some(report.result.inference_time_ms);
        self.last_recognition_ms = report.recognition_time_ms;
        self.last_priced = report
            .result
            .associations
            .iter()
            .filter(|a| a.price_text.is_some())
            .count();

        match report.errors.last() {
            Some(err) => self.set_error(err.to_string()),
            None => self.clear_error(),
        }
    }

    pub fn record_dropped(&mut self) {
        self.frames_dropped += 1;
    }

    pub fn record_event_dropped(&mut self) {
        self.events_dropped += 1;
    }

    /// Clear any error state
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Set an error message
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Stage, StageError};
    use crate::pipeline::PipelineResult;
    use uuid::Uuid;

    fn report(errors: Vec<StageError>) -> FrameReport {
        FrameReport {
            frame_id: Uuid::new_v4(),
            result: PipelineResult {
                associations: Vec::new(),
                inference_time_ms: 12,
                frame_width: 640,
                frame_height: 480,
            },
            recognition_time_ms: Some(40),
            recognized_text: String::new(),
            errors,
            notices: Vec::new(),
        }
    }

    #[test]
    fn test_record_frame() {
        let mut stats = RuntimeStats::default();
        stats.record_frame(&report(vec![StageError::new(Stage::Recognition, "no data")]));

        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.last_inference_ms, Some(12));
        assert_eq!(stats.last_recognition_ms, Some(40));
        assert_eq!(stats.last_error.as_deref(), Some("Recognition stage: no data"));

        stats.record_frame(&report(Vec::new()));
        assert_eq!(stats.frames_processed, 2);
        assert!(stats.last_error.is_none());
    }

    #[test]
    fn test_error_state() {
        let mut stats = RuntimeStats::default();
        stats.set_error("model missing");
        assert_eq!(stats.last_error.as_deref(), Some("model missing"));
        stats.clear_error();
        assert!(stats.last_error.is_none());
    }
}
