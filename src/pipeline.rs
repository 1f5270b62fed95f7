//! Frame pipeline
//!
//! Sequences detection and text recognition for one frame at a time and
//! packages the associated prices. Both stages read the same upright frame and
//! share nothing mutable, so with full-frame OCR they run on separate threads and
//! are joined before association. A failing stage never cancels the other one;
//! its error travels with the partial result.
//!
//! [`FrameWorker`] wraps a pipeline in a background thread fed by a
//! latest-frame-wins slot, for camera-style streams.

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use image::RgbaImage;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::{AssociationConfig, PriceAssociation, PriceAssociator};
use crate::capture::{Frame, FrameSlot, SubmitOutcome};
use crate::config::{AppConfig, OcrScope, PipelineConfig};
use crate::error::{DetectorError, PipelineError, Stage, StageError};
use crate::shared::{PipelineEvent, RuntimeStats, SharedStats, WorkerCommand};
use crate::vision::preprocess::rotate_upright;
use crate::vision::{
    BoundingBox, Detection, DetectorOptions, DetectorState, ObjectDetector, Recognition,
    TesseractRecognizer, TextFragment, TextRecognizer,
};

/// Result of one frame, in upright frame coordinates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    /// One entry per detection, in detector order
    pub associations: Vec<PriceAssociation>,
    /// Wall-clock detection time
    pub inference_time_ms: u64,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Everything produced for one frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_id: Uuid,
    pub result: PipelineResult,
    /// Wall-clock recognition time; `None` when recognition failed
    pub recognition_time_ms: Option<u64>,
    /// Full recognized text
    pub recognized_text: String,
    /// Stage failures; the result holds whatever the other stage produced
    pub errors: Vec<StageError>,
    /// Non-fatal notices such as a backend fallback
    pub notices: Vec<String>,
}

/// Outcome of [`FramePipeline::try_process_frame`]
#[derive(Debug)]
pub enum FrameOutcome {
    Processed(FrameReport),
    /// Another frame was in flight; this one was not processed
    Dropped,
}

/// Events held for a consumer that is not reading; further events are dropped
pub const EVENT_CAPACITY: usize = 64;

struct StageRun<T> {
    outcome: Result<T, String>,
    elapsed: Duration,
    /// Set when the stage succeeded only in part
    partial_error: Option<String>,
}

impl<T> StageRun<T> {
    fn finished(outcome: Result<T, String>, elapsed: Duration) -> Self {
        Self {
            outcome,
            elapsed,
            partial_error: None,
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Detection + recognition + association for single frames
pub struct FramePipeline {
    detector: Arc<Mutex<ObjectDetector>>,
    recognizer: Arc<dyn TextRecognizer>,
    associator: PriceAssociator,
    config: PipelineConfig,
    in_flight: Mutex<()>,
}

impl FramePipeline {
    pub fn new(
        detector: ObjectDetector,
        recognizer: Arc<dyn TextRecognizer>,
        association: AssociationConfig,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector: Arc::new(Mutex::new(detector)),
            recognizer,
            associator: PriceAssociator::new(association),
            config,
            in_flight: Mutex::new(()),
        }
    }

    /// Build the ONNX detector and Tesseract recognizer described by `config`
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let detector = ObjectDetector::new(config.detector.clone());
        let recognizer = TesseractRecognizer::from_config(&config.ocr)?;

        Ok(Self::new(
            detector,
            Arc::new(recognizer),
            config.association.clone(),
            config.pipeline.clone(),
        ))
    }

    pub fn detector_state(&self) -> DetectorState {
        self.detector.lock().state()
    }

    pub fn detector_options(&self) -> DetectorOptions {
        self.detector.lock().options().clone()
    }

    /// Replace detector options and rebuild the model. Waits for an in-flight
    /// detection to finish first.
    pub fn reconfigure(&self, options: DetectorOptions) -> Result<(), DetectorError> {
        let mut detector = self.detector.lock();
        info!("Reconfiguring detector");
        detector.reconfigure(options)
    }

    /// Unload the detector model; the next frame loads it again
    pub fn clear_detector(&self) {
        self.detector.lock().clear();
    }

    /// Convenience wrapper: build a frame from an image and rotation, then process it
    pub fn process_image(&self, image: RgbaImage, rotation_degrees: i32) -> Result<FrameReport, PipelineError> {
        let frame = Frame::new(image, rotation_degrees)?;
        self.process_frame(&frame)
    }

    /// Process a frame, waiting for any frame already in flight
    pub fn process_frame(&self, frame: &Frame) -> Result<FrameReport, PipelineError> {
        let _guard = self.in_flight.lock();
        self.run(frame)
    }

    /// Process a frame unless another one is in flight
    pub fn try_process_frame(&self, frame: &Frame) -> Result<FrameOutcome, PipelineError> {
        match self.in_flight.try_lock() {
            Some(_guard) => self.run(frame).map(FrameOutcome::Processed),
            None => {
                debug!("Frame {} dropped: pipeline busy", frame.id);
                Ok(FrameOutcome::Dropped)
            }
        }
    }

    fn run(&self, frame: &Frame) -> Result<FrameReport, PipelineError> {
        frame.validate()?;

        let upright = rotate_upright(&frame.image, frame.rotation);
        let (width, height) = upright.dimensions();
        let mut notices = Vec::new();

        let (detection, recognition) = match self.config.ocr_scope {
            OcrScope::FullFrame if self.config.concurrent_stages => {
                std::thread::scope(|s| {
                    let ocr = s.spawn(|| self.recognize_full(&upright));
                    let detection = self.detect(&upright, &mut notices);
                    let recognition = ocr.join().unwrap_or_else(|_| {
                        StageRun::finished(Err("text recognizer panicked".to_string()), Duration::ZERO)
                    });
                    (detection, recognition)
                })
            }
            OcrScope::FullFrame => {
                let detection = self.detect(&upright, &mut notices);
                (detection, self.recognize_full(&upright))
            }
            OcrScope::AroundDetections => {
                let detection = self.detect(&upright, &mut notices);
                let recognition = match &detection.outcome {
                    Ok(detections) => self.recognize_around(&upright, detections),
                    // Detection is unavailable; read the whole frame instead
                    Err(_) => self.recognize_full(&upright),
                };
                (detection, recognition)
            }
        };

        let mut errors = Vec::new();
        let detections = detection.outcome.unwrap_or_else(|e| {
            warn!("Detection failed for frame {}: {}", frame.id, e);
            errors.push(StageError::new(Stage::Detection, e));
            Vec::new()
        });
        let recognition_time_ms = recognition.outcome.is_ok().then(|| millis(recognition.elapsed));
        let partial_recognition_error = recognition.partial_error;
        let recognition = recognition.outcome.unwrap_or_else(|e| {
            warn!("Recognition failed for frame {}: {}", frame.id, e);
            errors.push(StageError::new(Stage::Recognition, e));
            Recognition::default()
        });

        if let [detection_err, recognition_err] = errors.as_slice() {
            return Err(PipelineError::AllStagesFailed {
                detection: detection_err.message.clone(),
                recognition: recognition_err.message.clone(),
            });
        }
        if let Some(message) = partial_recognition_error {
            warn!("Recognition incomplete for frame {}: {}", frame.id, message);
            errors.push(StageError::new(Stage::Recognition, message));
        }

        let mut fragments = recognition.fragments;
        if fragments.is_empty() && !recognition.text.trim().is_empty() {
            fragments.push(TextFragment::unplaced(recognition.text.clone()));
        }
        let associations = self.associator.associate(&detections, &fragments);

        let inference_time_ms = millis(detection.elapsed);
        info!(
            "Frame {}: {} detections, {} priced, detection {} ms, recognition {:?} ms",
            frame.id,
            associations.len(),
            associations.iter().filter(|a| a.price_text.is_some()).count(),
            inference_time_ms,
            recognition_time_ms
        );

        Ok(FrameReport {
            frame_id: frame.id,
            result: PipelineResult {
                associations,
                inference_time_ms,
                frame_width: width,
                frame_height: height,
            },
            recognition_time_ms,
            recognized_text: recognition.text,
            errors,
            notices,
        })
    }

    fn detect(&self, upright: &RgbaImage, notices: &mut Vec<String>) -> StageRun<Vec<Detection>> {
        let mut detector = self.detector.lock();

        // Re-setup a cleared or failed detector; options are kept
        let ready = detector.ensure_ready();
        notices.extend(detector.take_notices());
        if let Err(e) = ready {
            return StageRun::finished(Err(e.to_string()), Duration::ZERO);
        }

        let start = Instant::now();
        let outcome = detector.detect_upright(upright).map_err(|e| e.to_string());
        StageRun::finished(outcome, start.elapsed())
    }

    fn recognize_full(&self, upright: &RgbaImage) -> StageRun<Recognition> {
        let start = Instant::now();
        let outcome = self.recognizer.recognize(upright).map_err(|e| e.to_string());
        StageRun::finished(outcome, start.elapsed())
    }

    fn recognize_around(&self, upright: &RgbaImage, detections: &[Detection]) -> StageRun<Recognition> {
        let (width, height) = upright.dimensions();
        let regions = merge_regions(
            detections
                .iter()
                .map(|d| d.bounding_box.expand(self.config.region_margin, width, height))
                .collect(),
        );

        let start = Instant::now();
        let mut combined = Recognition::default();
        let mut lines = Vec::new();
        let mut failures = Vec::new();

        for region in &regions {
            match self.recognizer.recognize_region(upright, region) {
                Ok(recognition) => {
                    if !recognition.text.trim().is_empty() {
                        lines.push(recognition.text);
                    }
                    combined.fragments.extend(recognition.fragments);
                }
                Err(e) => {
                    debug!("Region {:?} failed: {}", region, e);
                    failures.push(e.to_string());
                }
            }
        }
        let elapsed = start.elapsed();

        if !failures.is_empty() && failures.len() == regions.len() {
            return StageRun::finished(Err(failures.join("; ")), elapsed);
        }

        combined.text = lines.join("\n");
        let partial_error = (!failures.is_empty()).then(|| {
            format!(
                "{} of {} regions unread: {}",
                failures.len(),
                regions.len(),
                failures.join("; ")
            )
        });
        StageRun {
            outcome: Ok(combined),
            elapsed,
            partial_error,
        }
    }
}

/// Merge overlapping regions so no area is read twice
fn merge_regions(mut regions: Vec<BoundingBox>) -> Vec<BoundingBox> {
    let mut merged = true;
    while merged {
        merged = false;
        'outer: for i in 0..regions.len() {
            for j in (i + 1)..regions.len() {
                if regions[i].iou(&regions[j]) > 0.0 {
                    let other = regions.swap_remove(j);
                    regions[i] = regions[i].union(&other);
                    merged = true;
                    break 'outer;
                }
            }
        }
    }
    regions
}

/// Background worker processing the most recent submitted frame
pub struct FrameWorker {
    slot: Arc<FrameSlot>,
    commands: Sender<WorkerCommand>,
    events_tx: Sender<PipelineEvent>,
    events: Receiver<PipelineEvent>,
    stats: SharedStats,
    handle: Option<JoinHandle<()>>,
}

impl FrameWorker {
    /// Move the pipeline onto a worker thread
    pub fn spawn(pipeline: FramePipeline) -> Self {
        Self::with_event_capacity(pipeline, EVENT_CAPACITY)
    }

    /// Like [`FrameWorker::spawn`], holding at most `capacity` unread events
    pub fn with_event_capacity(pipeline: FramePipeline, capacity: usize) -> Self {
        let slot = Arc::new(FrameSlot::new());
        let (commands, commands_rx) = unbounded();
        let (events_tx, events) = bounded(capacity.max(1));
        let stats: SharedStats = Arc::new(RwLock::new(RuntimeStats::default()));

        let frames = slot.receiver();
        let thread_events = events_tx.clone();
        let thread_stats = stats.clone();

        let handle = std::thread::spawn(move || {
            info!("Frame worker starting...");
            worker_loop(pipeline, frames, commands_rx, &thread_events, &thread_stats);
            emit(&thread_events, &thread_stats, PipelineEvent::Stopped);
            info!("Frame worker exiting...");
        });

        Self {
            slot,
            commands,
            events_tx,
            events,
            stats,
            handle: Some(handle),
        }
    }

    /// Offer a frame; a frame still waiting is replaced and reported as dropped
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        let outcome = self.slot.submit(frame);
        if let SubmitOutcome::Replaced { stale } = outcome {
            self.report_dropped(stale);
        }
        outcome
    }

    fn report_dropped(&self, frame_id: Uuid) {
        self.stats.write().record_dropped();
        emit(&self.events_tx, &self.stats, PipelineEvent::FrameDropped { frame_id });
    }

    /// Event stream; stays readable after the worker is dropped.
    /// Holds a bounded number of unread events.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events.clone()
    }

    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    /// Rebuild the detector between frames
    pub fn reconfigure(&self, options: DetectorOptions) {
        let _ = self.commands.send(WorkerCommand::Reconfigure(options));
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        // Signal worker to stop
        let _ = self.commands.send(WorkerCommand::Shutdown);

        // Wait for the current frame to finish
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Queue an event without blocking; a full queue drops it and counts the loss
fn emit(events: &Sender<PipelineEvent>, stats: &SharedStats, event: PipelineEvent) {
    if let Err(TrySendError::Full(_)) = events.try_send(event) {
        stats.write().record_event_dropped();
    }
}

fn worker_loop(
    pipeline: FramePipeline,
    frames: Receiver<Frame>,
    commands: Receiver<WorkerCommand>,
    events: &Sender<PipelineEvent>,
    stats: &SharedStats,
) {
    loop {
        select! {
            recv(commands) -> command => match command {
                Ok(WorkerCommand::Reconfigure(options)) => {
                    if let Err(e) = pipeline.reconfigure(options) {
                        stats.write().set_error(e.to_string());
                        emit(events, stats, PipelineEvent::Error { frame_id: None, message: e.to_string() });
                    }
                }
                Ok(WorkerCommand::Shutdown) | Err(_) => break,
            },
            recv(frames) -> frame => match frame {
                Ok(frame) => process_and_report(&pipeline, &frame, events, stats),
                Err(_) => break,
            },
        }
    }
}

fn process_and_report(
    pipeline: &FramePipeline,
    frame: &Frame,
    events: &Sender<PipelineEvent>,
    stats: &SharedStats,
) {
    match pipeline.process_frame(frame) {
        Ok(report) => {
            stats.write().record_frame(&report);

            let messages = report
                .notices
                .iter()
                .cloned()
                .chain(report.errors.iter().map(|e| e.to_string()));
            for message in messages {
                emit(
                    events,
                    stats,
                    PipelineEvent::Error {
                        frame_id: Some(report.frame_id),
                        message,
                    },
                );
            }
            emit(events, stats, PipelineEvent::Results(report));
        }
        Err(e) => {
            error!("Frame {} failed: {}", frame.id, e);
            stats.write().set_error(e.to_string());
            emit(
                events,
                stats,
                PipelineEvent::Error {
                    frame_id: Some(frame.id),
                    message: e.to_string(),
                },
            );
        }
    }
}
