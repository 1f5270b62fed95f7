//! Error types for the detection, recognition and association stages
//!
//! Stage errors are typed with thiserror so the pipeline can tell a
//! recoverable OCR resource problem from a detector that failed to load.
//! Application glue (CLI, config loading, downloads) uses anyhow instead.

use thiserror::Error;

use crate::vision::models::Backend;

/// Input rejected before any inference runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("rotation must be a multiple of 90 degrees, got {0}")]
    InvalidRotation(i32),

    #[error("image has zero size ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("pixel buffer holds {actual} bytes, expected {expected} for {width}x{height} RGBA")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Object detector errors
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("model initialization failed: {0}")]
    ModelInitialization(String),

    #[error("detector is disabled after a failed initialization: {0}")]
    NotInitialized(String),

    #[error("backend {requested:?} is unavailable: {reason}")]
    UnsupportedBackend { requested: Backend, reason: String },

    #[error(transparent)]
    InvalidInput(#[from] InputError),

    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<ort::Error> for DetectorError {
    fn from(err: ort::Error) -> Self {
        DetectorError::Inference(err.to_string())
    }
}

/// Text recognizer errors
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR language data unavailable: {0}")]
    Resource(String),

    #[error("OCR engine failed: {0}")]
    Engine(String),

    #[error("OCR I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode image for OCR: {0}")]
    Encode(#[from] image::ImageError),
}

/// Errors from one-time resource provisioning (models, language data)
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("resource {name} not found in {searched} and no download source is configured")]
    Missing { name: String, searched: String },

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("provisioning I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop a whole frame from being processed
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),

    #[error("both stages failed: detection: {detection}; recognition: {recognition}")]
    AllStagesFailed { detection: String, recognition: String },
}

/// The pipeline stage an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detection,
    Recognition,
}

/// A stage-level failure carried alongside partial frame results
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} stage: {}", self.stage, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_error_messages() {
        assert_eq!(
            InputError::InvalidRotation(45).to_string(),
            "rotation must be a multiple of 90 degrees, got 45"
        );
        assert_eq!(
            InputError::EmptyImage { width: 0, height: 10 }.to_string(),
            "image has zero size (0x10)"
        );
    }

    #[test]
    fn test_detector_error_wraps_input_error() {
        let err: DetectorError = InputError::InvalidRotation(30).into();
        assert!(matches!(err, DetectorError::InvalidInput(InputError::InvalidRotation(30))));
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError::new(Stage::Recognition, "no language data");
        assert_eq!(err.to_string(), "Recognition stage: no language data");
    }
}
