//! Object detection module
//!
//! Runs a pretrained detection model on upright frames and turns raw model output
//! into ranked [`Detection`]s. The detector owns its model through an explicit
//! lifecycle (uninitialized, ready, failed) so a missing or corrupt model disables
//! detection instead of taking the process down, and a later `setup()` can
//! recover without losing the configured options.

use image::RgbaImage;
use ort::value::Value;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::capture::Rotation;
use crate::error::{DetectorError, InputError};
use crate::vision::labels::{label_for_coco_id, label_for_index};
use crate::vision::models::{Backend, ModelManager, ModelVersion, OnnxSession};
use crate::vision::preprocess::{resize_for_model, rotate_upright, to_nchw_f32, to_nhwc_u8};
use crate::vision::{BoundingBox, Detection};

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    /// Which pretrained model to run
    pub model_version: ModelVersion,
    /// Explicit model file; bypasses the model cache
    pub model_path: Option<PathBuf>,
    /// Download location overriding the built-in one
    pub model_url: Option<String>,
    /// Model cache directory (defaults to `<data_dir>/models`)
    pub models_dir: Option<PathBuf>,
    /// Minimum confidence for a detection to be reported (0.0 - 1.0)
    pub score_threshold: f32,
    /// Maximum number of detections per frame
    pub max_results: usize,
    /// Inference thread count
    pub num_threads: usize,
    /// Execution backend
    pub backend: Backend,
    /// Only report these labels (empty = all)
    pub label_allowlist: Vec<String>,
    /// Overlap above which lower-scored boxes of the same class are suppressed
    pub iou_threshold: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            model_version: ModelVersion::default(),
            model_path: None,
            model_url: None,
            models_dir: None,
            score_threshold: 0.5,
            max_results: 3,
            num_threads: 2,
            backend: Backend::Cpu,
            label_allowlist: Vec::new(),
            iou_threshold: 0.45,
        }
    }
}

/// Unfiltered model output in the coordinates of the image given to the model
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub score: f32,
    pub bounding_box: BoundingBox,
}

/// A loaded detection model
pub trait DetectionModel: Send {
    /// Run inference on an upright RGBA image
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<RawDetection>, DetectorError>;

    /// Backend the model is executing on
    fn backend(&self) -> Backend;
}

/// Result of a model load
pub struct LoadedModel {
    pub model: Box<dyn DetectionModel>,
    /// Set when the requested backend was unavailable and CPU was used instead
    pub fallback_notice: Option<String>,
}

/// Builds a model from options
pub type ModelLoader = Box<dyn Fn(&DetectorOptions) -> Result<LoadedModel, DetectorError> + Send + Sync>;

/// Public view of the detector lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorState {
    Uninitialized,
    Ready,
    Failed(String),
}

enum ModelSlot {
    Uninitialized,
    Ready(Box<dyn DetectionModel>),
    Failed(String),
}

/// Object detector with lazy, retryable model initialization
pub struct ObjectDetector {
    options: DetectorOptions,
    loader: ModelLoader,
    slot: ModelSlot,
    notices: Vec<String>,
}

impl ObjectDetector {
    /// Create a detector backed by ONNX Runtime. The model is loaded on first use.
    pub fn new(options: DetectorOptions) -> Self {
        Self::with_loader(options, Box::new(load_onnx_model))
    }

    /// Create a detector with a custom model loader
    pub fn with_loader(options: DetectorOptions, loader: ModelLoader) -> Self {
        Self {
            options,
            loader,
            slot: ModelSlot::Uninitialized,
            notices: Vec::new(),
        }
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.options
    }

    pub fn state(&self) -> DetectorState {
        match &self.slot {
            ModelSlot::Uninitialized => DetectorState::Uninitialized,
            ModelSlot::Ready(_) => DetectorState::Ready,
            ModelSlot::Failed(reason) => DetectorState::Failed(reason.clone()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.slot, ModelSlot::Ready(_))
    }

    /// Backend of the loaded model, if any
    pub fn active_backend(&self) -> Option<Backend> {
        match &self.slot {
            ModelSlot::Ready(model) => Some(model.backend()),
            _ => None,
        }
    }

    /// Load the model. Allowed from any state; replaces a loaded model.
    pub fn setup(&mut self) -> Result<(), DetectorError> {
        info!(
            "Initializing {} detector (backend {:?}, threshold {}, max results {})",
            self.options.model_version.display_name(),
            self.options.backend,
            self.options.score_threshold,
            self.options.max_results
        );

        match (self.loader)(&self.options) {
            Ok(loaded) => {
                if let Some(notice) = loaded.fallback_notice {
                    self.notices.push(notice);
                }
                self.slot = ModelSlot::Ready(loaded.model);
                Ok(())
            }
            Err(e) => {
                warn!("Detector initialization failed: {}", e);
                self.slot = ModelSlot::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Load the model unless it is already loaded
    pub fn ensure_ready(&mut self) -> Result<(), DetectorError> {
        if self.is_ready() {
            return Ok(());
        }
        self.setup()
    }

    /// Drop the loaded model; options are kept for the next setup
    pub fn clear(&mut self) {
        debug!("Clearing detector model");
        self.slot = ModelSlot::Uninitialized;
    }

    /// Replace options and rebuild the model with them
    pub fn reconfigure(&mut self, options: DetectorOptions) -> Result<(), DetectorError> {
        self.options = options;
        self.clear();
        self.setup()
    }

    /// Notices recorded since the last call (e.g. backend fallbacks)
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    /// Detect objects in a sensor-oriented image, correcting rotation first.
    /// Boxes are reported in upright coordinates.
    pub fn detect(&mut self, image: &RgbaImage, rotation_degrees: i32) -> Result<Vec<Detection>, DetectorError> {
        let rotation = Rotation::from_degrees(rotation_degrees)?;
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(InputError::EmptyImage { width, height }.into());
        }

        let upright = rotate_upright(image, rotation);
        self.detect_upright(&upright)
    }

    /// Detect objects in an image that is already upright
    pub fn detect_upright(&mut self, image: &RgbaImage) -> Result<Vec<Detection>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(InputError::EmptyImage { width, height }.into());
        }

        if let ModelSlot::Uninitialized = self.slot {
            self.setup()?;
        }

        let model = match &mut self.slot {
            ModelSlot::Ready(model) => model,
            ModelSlot::Failed(reason) => return Err(DetectorError::NotInitialized(reason.clone())),
            ModelSlot::Uninitialized => {
                return Err(DetectorError::NotInitialized("model not loaded".to_string()))
            }
        };

        let start = Instant::now();
        let raw = model.infer(image)?;
        let raw_count = raw.len();
        let detections = select_detections(raw, &self.options, width, height);

        debug!(
            "Detection complete in {:?}: {} raw, {} reported",
            start.elapsed(),
            raw_count,
            detections.len()
        );

        Ok(detections)
    }
}

/// Apply the allowlist, score threshold, ranking and result cap
pub fn select_detections(
    raw: Vec<RawDetection>,
    options: &DetectorOptions,
    width: u32,
    height: u32,
) -> Vec<Detection> {
    let threshold = options.score_threshold.clamp(0.0, 1.0);

    let mut kept: Vec<RawDetection> = raw
        .into_iter()
        .filter(|d| {
            options.label_allowlist.is_empty()
                || options
                    .label_allowlist
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(&d.label))
        })
        .filter(|d| d.score >= threshold)
        .collect();

    // Stable sort: equal scores keep model order
    kept.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    kept.truncate(options.max_results);

    kept.into_iter()
        .map(|d| Detection {
            label: d.label,
            confidence: d.score.clamp(0.0, 1.0),
            bounding_box: d.bounding_box.clamp_to(width, height),
        })
        .collect()
}

/// Default loader: resolve the model file, then build an ONNX session
pub fn load_onnx_model(options: &DetectorOptions) -> Result<LoadedModel, DetectorError> {
    let path = match &options.model_path {
        Some(path) if path.exists() => path.clone(),
        Some(path) => {
            return Err(DetectorError::ModelInitialization(format!(
                "model file {:?} does not exist",
                path
            )))
        }
        None => {
            let manager = match &options.models_dir {
                Some(dir) => ModelManager::with_dir(dir.clone()),
                None => ModelManager::new(),
            }
            .map_err(|e| DetectorError::ModelInitialization(format!("{:#}", e)))?;

            manager
                .ensure_model(options.model_version, options.model_url.as_deref())
                .map_err(|e| DetectorError::ModelInitialization(format!("{:#}", e)))?
        }
    };

    let loaded = OnnxSession::load(&path, options.backend, options.num_threads)?;
    let model: Box<dyn DetectionModel> = match options.model_version {
        ModelVersion::SsdMobilenetV1 => Box::new(SsdModel::new(loaded.session)),
        ModelVersion::YoloV8n => Box::new(YoloModel::new(
            loaded.session,
            options.score_threshold,
            options.iou_threshold,
        )),
    };

    Ok(LoadedModel {
        model,
        fallback_notice: loaded.fallback_notice,
    })
}

/// SSD-style model with detection post-processing inside the graph
pub struct SsdModel {
    session: OnnxSession,
    input_size: (u32, u32),
}

impl SsdModel {
    pub fn new(session: OnnxSession) -> Self {
        Self {
            session,
            input_size: ModelVersion::SsdMobilenetV1.input_size(),
        }
    }
}

impl DetectionModel for SsdModel {
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<RawDetection>, DetectorError> {
        let (width, height) = image.dimensions();
        let (resized, _, _) = resize_for_model(image, self.input_size.0, self.input_size.1);
        let input = Value::from_array(to_nhwc_u8(&resized))?;

        let input_name = self
            .session
            .input_names()
            .first()
            .cloned()
            .ok_or_else(|| DetectorError::Inference("model has no inputs".to_string()))?;
        let names = self.session.output_names().to_vec();
        let output_for = |key: &str, fallback: usize| -> Result<String, DetectorError> {
            names
                .iter()
                .find(|n| n.contains(key))
                .or_else(|| names.get(fallback))
                .cloned()
                .ok_or_else(|| DetectorError::Inference(format!("model has no '{}' output", key)))
        };
        let boxes_name = output_for("boxes", 0)?;
        let classes_name = output_for("classes", 1)?;
        let scores_name = output_for("scores", 2)?;
        let count_name = output_for("num", 3)?;

        let (boxes, classes, scores, count) = {
            let outputs = self
                .session
                .session_mut()
                .run(ort::inputs![input_name.as_str() => input])?;

            let (_, boxes) = outputs[boxes_name.as_str()].try_extract_tensor::<f32>()?;
            let (_, classes) = outputs[classes_name.as_str()].try_extract_tensor::<f32>()?;
            let (_, scores) = outputs[scores_name.as_str()].try_extract_tensor::<f32>()?;
            let (_, count) = outputs[count_name.as_str()].try_extract_tensor::<f32>()?;

            (boxes.to_vec(), classes.to_vec(), scores.to_vec(), count.to_vec())
        };

        let count = count.first().map(|&c| c.max(0.0) as usize).unwrap_or(scores.len());
        Ok(decode_ssd(&boxes, &classes, &scores, count, width, height))
    }

    fn backend(&self) -> Backend {
        self.session.backend()
    }
}

/// Decode SSD outputs: boxes are normalized (ymin, xmin, ymax, xmax), classes are
/// 1-based COCO category ids
pub fn decode_ssd(
    boxes: &[f32],
    classes: &[f32],
    scores: &[f32],
    count: usize,
    width: u32,
    height: u32,
) -> Vec<RawDetection> {
    let n = count.min(scores.len()).min(classes.len()).min(boxes.len() / 4);
    let (w, h) = (width as f32, height as f32);

    (0..n)
        .filter_map(|i| {
            let class_id = classes[i].round() as u32;
            let Some(label) = label_for_coco_id(class_id) else {
                trace!("Skipping detection {} with unknown class id {}", i, class_id);
                return None;
            };
            let b = &boxes[i * 4..i * 4 + 4];
            Some(RawDetection {
                label: label.to_string(),
                score: scores[i],
                bounding_box: BoundingBox::new(b[1] * w, b[0] * h, b[3] * w, b[2] * h),
            })
        })
        .collect()
}

/// YOLOv8 model with raw head output
pub struct YoloModel {
    session: OnnxSession,
    input_size: (u32, u32),
    score_floor: f32,
    iou_threshold: f32,
}

impl YoloModel {
    pub fn new(session: OnnxSession, score_floor: f32, iou_threshold: f32) -> Self {
        Self {
            session,
            input_size: ModelVersion::YoloV8n.input_size(),
            score_floor,
            iou_threshold,
        }
    }
}

impl DetectionModel for YoloModel {
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<RawDetection>, DetectorError> {
        let (resized, scale_x, scale_y) = resize_for_model(image, self.input_size.0, self.input_size.1);
        let input = Value::from_array(to_nchw_f32(&resized))?;

        let input_name = self
            .session
            .input_names()
            .first()
            .cloned()
            .ok_or_else(|| DetectorError::Inference("model has no inputs".to_string()))?;
        let output_name = self
            .session
            .output_names()
            .first()
            .cloned()
            .ok_or_else(|| DetectorError::Inference("model has no outputs".to_string()))?;

        let (shape, data) = {
            let outputs = self
                .session
                .session_mut()
                .run(ort::inputs![input_name.as_str() => input])?;
            let (shape, data) = outputs[output_name.as_str()].try_extract_tensor::<f32>()?;
            (shape.to_vec(), data.to_vec())
        };

        if shape.len() != 3 || shape[1] < 5 {
            return Err(DetectorError::Inference(format!(
                "unexpected YOLO output shape {:?}",
                shape
            )));
        }

        let rows = shape[1] as usize;
        let anchors = shape[2] as usize;
        let candidates = decode_yolo(&data, rows, anchors, scale_x, scale_y, self.score_floor);
        Ok(non_maximum_suppression(candidates, self.iou_threshold))
    }

    fn backend(&self) -> Backend {
        self.session.backend()
    }
}

/// Decode a YOLOv8 head laid out as `rows` x `anchors` (rows = 4 box + class scores)
pub fn decode_yolo(
    data: &[f32],
    rows: usize,
    anchors: usize,
    scale_x: f32,
    scale_y: f32,
    score_floor: f32,
) -> Vec<RawDetection> {
    if data.len() < rows * anchors || rows < 5 {
        return Vec::new();
    }
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];

    (0..anchors)
        .filter_map(|a| {
            let (class, score) = (4..rows)
                .map(|row| (row - 4, at(row, a)))
                .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

            if score < score_floor {
                return None;
            }

            let (cx, cy, w, h) = (at(0, a), at(1, a), at(2, a), at(3, a));
            let label = label_for_index(class)
                .map(str::to_string)
                .unwrap_or_else(|| format!("class_{}", class));

            Some(RawDetection {
                label,
                score,
                bounding_box: BoundingBox::new(
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ),
            })
        })
        .collect()
}

/// Class-wise non-maximum suppression
pub fn non_maximum_suppression(detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    if detections.is_empty() {
        return detections;
    }

    let mut sorted = detections;
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawDetection> = Vec::new();
    for candidate in sorted {
        let suppressed = keep.iter().any(|kept| {
            kept.label == candidate.label && kept.bounding_box.iou(&candidate.bounding_box) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }

    keep
}
