//! Vision Layer
//!
//! Object detection and price-tag text recognition on upright camera frames.
//! Detection runs an ONNX model through ONNX Runtime; text recognition drives a
//! Tesseract engine. Both stages report positions in the same pixel space so the
//! association step can compare them directly.

pub mod detection;
pub mod labels;
pub mod models;
pub mod ocr;
pub mod ocr_preprocess;
pub mod preprocess;
pub mod tessdata;

use serde::{Deserialize, Serialize};

pub use detection::{DetectionModel, DetectorOptions, DetectorState, ObjectDetector, RawDetection};
pub use models::{Backend, ModelManager, ModelVersion, OnnxSession};
pub use ocr::{OcrGranularity, Recognition, TesseractRecognizer, TextRecognizer};
pub use ocr_preprocess::{apply_preprocessing_with_scale, PreprocessResult};
pub use tessdata::{ProvisionOutcome, TessdataProvisioner};

/// Axis-aligned box in image pixel coordinates, (x0, y0) top-left, (x1, y1) bottom-right
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    /// Create a box from two corners, normalizing their order
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    /// Create a box from (x, y, width, height)
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn bottom_center(&self) -> Point {
        Point::new((self.x0 + self.x1) / 2.0, self.y1)
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x0 && p.x <= self.x1 && p.y >= self.y0 && p.y <= self.y1
    }

    /// Clamp the box into a `width`x`height` image
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x0: self.x0.clamp(0.0, w),
            y0: self.y0.clamp(0.0, h),
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
        }
    }

    /// Grow the box by `margin` on every side, staying inside the image
    pub fn expand(&self, margin: f32, width: u32, height: u32) -> Self {
        Self {
            x0: self.x0 - margin,
            y0: self.y0 - margin,
            x1: self.x1 + margin,
            y1: self.y1 + margin,
        }
        .clamp_to(width, height)
    }

    /// Shift the box by (dx, dy)
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self {
            x0: self.x0 + dx,
            y0: self.y0 + dy,
            x1: self.x1 + dx,
            y1: self.y1 + dy,
        }
    }

    /// Smallest box containing both
    pub fn union(&self, other: &BoundingBox) -> Self {
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Intersection over union
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x0 = self.x0.max(other.x0);
        let y0 = self.y0.max(other.y0);
        let x1 = self.x1.min(other.x1);
        let y1 = self.y1.min(other.y1);

        if x1 <= x0 || y1 <= y0 {
            return 0.0;
        }

        let intersection = (x1 - x0) * (y1 - y0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A 2D point in image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance, computed in f64
    pub fn distance_to(&self, other: Point) -> f64 {
        let dx = self.x as f64 - other.x as f64;
        let dy = self.y as f64 - other.y as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Detected object in an upright frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label (e.g. "banana")
    pub label: String,
    /// Score in [0, 1]
    pub confidence: f32,
    /// Box in upright frame pixel coordinates
    pub bounding_box: BoundingBox,
}

/// Where a piece of recognized text sits in the frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FragmentAnchor {
    /// Word or line box reported by the OCR engine
    Box(BoundingBox),
    /// Approximate position only
    Point(Point),
    /// Full-frame text with no position
    Unplaced,
}

impl FragmentAnchor {
    /// Reference point used for distance computation
    pub fn reference_point(&self) -> Option<Point> {
        match self {
            FragmentAnchor::Box(b) => Some(b.center()),
            FragmentAnchor::Point(p) => Some(*p),
            FragmentAnchor::Unplaced => None,
        }
    }
}

/// Recognized text with an optional position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    pub text: String,
    pub anchor: FragmentAnchor,
    /// Recognition confidence in [0, 1], when the engine reports one
    pub confidence: Option<f32>,
}

impl TextFragment {
    pub fn boxed(text: impl Into<String>, bounds: BoundingBox, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            anchor: FragmentAnchor::Box(bounds),
            confidence,
        }
    }

    pub fn at_point(text: impl Into<String>, x: f32, y: f32, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            anchor: FragmentAnchor::Point(Point::new(x, y)),
            confidence,
        }
    }

    pub fn unplaced(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            anchor: FragmentAnchor::Unplaced,
            confidence: None,
        }
    }
}
