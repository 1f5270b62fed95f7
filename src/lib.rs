//! PriceSight - fruit detection with price-tag reading
//!
//! Detects produce in camera frames, reads nearby price tags with OCR and pairs
//! every detected item with the price text of its nearest tag.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod shared;
pub mod storage;
pub mod vision;

pub use analysis::{AssociationConfig, PriceAssociation, PriceAssociator, ReferencePoint};
pub use capture::{Frame, FrameSlot, Rotation};
pub use config::AppConfig;
pub use error::{DetectorError, InputError, OcrError, PipelineError, ProvisionError, Stage, StageError};
pub use pipeline::{FrameOutcome, FramePipeline, FrameReport, FrameWorker, PipelineResult};
pub use shared::{PipelineEvent, RuntimeStats};
pub use vision::{
    Backend, BoundingBox, Detection, DetectorOptions, ModelVersion, ObjectDetector, Recognition,
    TextFragment, TextRecognizer,
};
