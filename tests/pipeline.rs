//! End-to-end pipeline behaviour through the public API, with in-memory
//! detection and recognition engines.

use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;

use price_sight::analysis::{AssociationConfig, ReferencePoint};
use price_sight::capture::SubmitOutcome;
use price_sight::config::{OcrScope, PipelineConfig};
use price_sight::error::OcrError;
use price_sight::vision::detection::{DetectionModel, LoadedModel, ModelLoader, RawDetection};
use price_sight::vision::preprocess::map_box_to_source;
use price_sight::{
    Backend, BoundingBox, DetectorError, DetectorOptions, Frame, FramePipeline, FrameWorker,
    ObjectDetector, PipelineEvent, Recognition, Rotation, TextFragment, TextRecognizer,
};

/// Model returning fixed boxes expressed in the upright image it receives
struct ShelfModel {
    seen: Arc<parking_lot::Mutex<Vec<(u32, u32)>>>,
}

impl DetectionModel for ShelfModel {
    fn infer(&mut self, image: &RgbaImage) -> Result<Vec<RawDetection>, DetectorError> {
        self.seen.lock().push(image.dimensions());
        Ok(vec![
            RawDetection {
                label: "apple".to_string(),
                score: 0.64,
                bounding_box: BoundingBox::new(200.0, 40.0, 260.0, 100.0),
            },
            RawDetection {
                label: "banana".to_string(),
                score: 0.91,
                bounding_box: BoundingBox::new(20.0, 40.0, 100.0, 100.0),
            },
            RawDetection {
                label: "orange".to_string(),
                score: 0.12,
                bounding_box: BoundingBox::new(400.0, 40.0, 440.0, 80.0),
            },
        ])
    }

    fn backend(&self) -> Backend {
        Backend::Cpu
    }
}

fn shelf_detector(options: DetectorOptions) -> (ObjectDetector, Arc<parking_lot::Mutex<Vec<(u32, u32)>>>) {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let shared = seen.clone();
    let loader: ModelLoader = Box::new(move |_| {
        Ok(LoadedModel {
            model: Box::new(ShelfModel { seen: shared.clone() }),
            fallback_notice: None,
        })
    });
    (ObjectDetector::with_loader(options, loader), seen)
}

/// Price tags under each item plus one far away
struct ShelfTags;

impl TextRecognizer for ShelfTags {
    fn recognize(&self, _image: &RgbaImage) -> Result<Recognition, OcrError> {
        let fragments = vec![
            TextFragment::boxed("€1,19", BoundingBox::new(40.0, 110.0, 80.0, 126.0), Some(0.93)),
            TextFragment::boxed("Bananen", BoundingBox::new(20.0, 130.0, 90.0, 146.0), Some(0.88)),
            TextFragment::boxed("2.49", BoundingBox::new(210.0, 110.0, 250.0, 126.0), Some(0.9)),
            TextFragment::boxed("9.99", BoundingBox::new(600.0, 400.0, 640.0, 416.0), Some(0.9)),
        ];
        Ok(Recognition {
            text: "€1,19 2.49\nBananen\n9.99".to_string(),
            fragments,
        })
    }
}

#[test]
fn shelf_frame_is_priced_in_detection_order() {
    let (detector, _) = shelf_detector(DetectorOptions {
        score_threshold: 0.5,
        ..Default::default()
    });
    let pipeline = FramePipeline::new(
        detector,
        Arc::new(ShelfTags),
        AssociationConfig {
            reference_point: ReferencePoint::BottomCenter,
            max_distance: 100.0,
            numeric_only: true,
        },
        PipelineConfig::default(),
    );

    let report = pipeline.process_image(RgbaImage::new(640, 480), 0).unwrap();
    let associations = &report.result.associations;

    let labels: Vec<&str> = associations.iter().map(|a| a.detection.label.as_str()).collect();
    assert_eq!(labels, vec!["banana", "apple"]);
    assert_eq!(associations[0].price_text.as_deref(), Some("1.19"));
    assert_eq!(associations[1].price_text.as_deref(), Some("2.49"));
    // bottom center (60, 100) to tag center (60, 118)
    assert!((associations[0].distance.unwrap() - 18.0).abs() < 1e-6);
    assert!(report.errors.is_empty());
}

#[test]
fn rotated_frames_are_detected_upright() {
    let (detector, seen) = shelf_detector(DetectorOptions {
        score_threshold: 0.5,
        ..Default::default()
    });
    let pipeline = FramePipeline::new(
        detector,
        Arc::new(ShelfTags),
        AssociationConfig::default(),
        PipelineConfig {
            concurrent_stages: false,
            ..Default::default()
        },
    );

    // Portrait sensor frame that must be turned 270 degrees to be upright
    let report = pipeline.process_image(RgbaImage::new(480, 640), 270).unwrap();
    assert_eq!(seen.lock().as_slice(), &[(640, 480)]);
    assert_eq!((report.result.frame_width, report.result.frame_height), (640, 480));

    // Mapping back to sensor space and forward again is lossless
    let upright = report.result.associations[0].detection.bounding_box;
    let sensor = map_box_to_source(&upright, Rotation::Deg270, 640, 480);
    let again = price_sight::vision::preprocess::rotate_box(&sensor, Rotation::Deg270, 480, 640);
    assert!((again.x0 - upright.x0).abs() < 1e-4 && (again.y1 - upright.y1).abs() < 1e-4);
}

#[test]
fn per_region_ocr_pairs_items_with_their_own_tags() {
    let (detector, _) = shelf_detector(DetectorOptions {
        score_threshold: 0.5,
        ..Default::default()
    });
    let pipeline = FramePipeline::new(
        detector,
        Arc::new(ShelfTags),
        AssociationConfig::default(),
        PipelineConfig {
            ocr_scope: OcrScope::AroundDetections,
            region_margin: 30.0,
            concurrent_stages: true,
        },
    );

    let report = pipeline.process_image(RgbaImage::new(640, 480), 0).unwrap();
    assert_eq!(report.result.associations.len(), 2);
    assert!(report
        .result
        .associations
        .iter()
        .all(|a| a.price_text.is_some()));
}

#[test]
fn worker_keeps_only_the_latest_pending_frame() {
    struct SlowTags;

    impl TextRecognizer for SlowTags {
        fn recognize(&self, _image: &RgbaImage) -> Result<Recognition, OcrError> {
            std::thread::sleep(Duration::from_millis(150));
            Ok(Recognition::default())
        }
    }

    let (detector, _) = shelf_detector(DetectorOptions::default());
    let worker = FrameWorker::spawn(FramePipeline::new(
        detector,
        Arc::new(SlowTags),
        AssociationConfig::default(),
        PipelineConfig::default(),
    ));
    let events = worker.events();

    let frames: Vec<Frame> = (0..6)
        .map(|_| Frame::new(RgbaImage::new(32, 32), 0).unwrap())
        .collect();
    let last = frames[5].id;
    let outcomes: Vec<SubmitOutcome> = frames.into_iter().map(|f| worker.submit(f)).collect();
    assert!(outcomes
        .iter()
        .skip(2)
        .any(|o| matches!(o, SubmitOutcome::Replaced { .. })));

    let mut processed = Vec::new();
    let mut dropped = 0;
    while !processed.contains(&last) {
        match events.recv_timeout(Duration::from_secs(10)).unwrap() {
            PipelineEvent::Results(report) => processed.push(report.frame_id),
            PipelineEvent::FrameDropped { .. } => dropped += 1,
            PipelineEvent::Error { .. } => {}
            PipelineEvent::Stopped => panic!("worker stopped early"),
        }
    }

    assert!(processed.len() < 6);
    assert_eq!(processed.len() + dropped, 6);
    assert_eq!(worker.stats().read().frames_dropped, dropped as u64);
}

#[test]
fn worker_applies_reconfiguration_between_frames() {
    let (detector, _) = shelf_detector(DetectorOptions {
        score_threshold: 0.5,
        ..Default::default()
    });
    let worker = FrameWorker::spawn(FramePipeline::new(
        detector,
        Arc::new(ShelfTags),
        AssociationConfig::default(),
        PipelineConfig::default(),
    ));
    let events = worker.events();

    worker.reconfigure(DetectorOptions {
        score_threshold: 0.1,
        max_results: 1,
        ..Default::default()
    });
    // Commands and frames are separate channels; give the command a head start
    std::thread::sleep(Duration::from_millis(100));
    worker.submit(Frame::new(RgbaImage::new(640, 480), 0).unwrap());

    let report = loop {
        if let PipelineEvent::Results(report) = events.recv_timeout(Duration::from_secs(10)).unwrap() {
            break report;
        }
    };
    assert_eq!(report.result.associations.len(), 1);
    assert_eq!(report.result.associations[0].detection.label, "banana");
}

fn falling_back_detector(notice: &str) -> ObjectDetector {
    let notice = notice.to_string();
    let loader: ModelLoader = Box::new(move |_| {
        Ok(LoadedModel {
            model: Box::new(ShelfModel {
                seen: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }),
            fallback_notice: Some(notice.clone()),
        })
    });
    ObjectDetector::with_loader(
        DetectorOptions {
            backend: Backend::Gpu,
            ..Default::default()
        },
        loader,
    )
}

const GPU_FALLBACK: &str = "backend Gpu unavailable: built without the `cuda` or `directml` feature";

#[test]
fn backend_fallback_is_reported_with_the_frame() {
    let pipeline = FramePipeline::new(
        falling_back_detector(GPU_FALLBACK),
        Arc::new(ShelfTags),
        AssociationConfig::default(),
        PipelineConfig::default(),
    );

    let first = pipeline.process_image(RgbaImage::new(640, 480), 0).unwrap();
    assert_eq!(first.notices, vec![GPU_FALLBACK.to_string()]);
    assert!(first.errors.is_empty());
    assert_eq!(first.result.associations.len(), 2);

    // Reported once, not on every frame
    let second = pipeline.process_image(RgbaImage::new(640, 480), 0).unwrap();
    assert!(second.notices.is_empty());
}

#[test]
fn worker_notifies_listener_of_backend_fallback() {
    let worker = FrameWorker::spawn(FramePipeline::new(
        falling_back_detector(GPU_FALLBACK),
        Arc::new(ShelfTags),
        AssociationConfig::default(),
        PipelineConfig::default(),
    ));
    let events = worker.events();

    let frame = Frame::new(RgbaImage::new(640, 480), 0).unwrap();
    let frame_id = frame.id;
    worker.submit(frame);

    let mut notified = None;
    let report = loop {
        match events.recv_timeout(Duration::from_secs(10)).unwrap() {
            PipelineEvent::Error { frame_id, message } => notified = Some((frame_id, message)),
            PipelineEvent::Results(report) => break report,
            PipelineEvent::FrameDropped { .. } => {}
            PipelineEvent::Stopped => panic!("worker stopped early"),
        }
    };

    assert_eq!(notified, Some((Some(frame_id), GPU_FALLBACK.to_string())));
    assert_eq!(report.notices, vec![GPU_FALLBACK.to_string()]);
    assert_eq!(report.result.associations.len(), 2);
}
