//! Price association
//!
//! Assigns each detected object the text of its nearest price tag. This is a
//! greedy nearest-neighbour assignment: every detection independently picks the
//! closest fragment, and nothing stops two detections from sharing one tag. A
//! single tag in front of a crate of fruit is the common case this handles.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::analysis::price::first_price;
use crate::vision::{BoundingBox, Detection, Point, TextFragment};

/// Which point of a detection box distances are measured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePoint {
    #[default]
    Center,
    /// Middle of the bottom edge, where shelf tags usually sit
    BottomCenter,
}

impl ReferencePoint {
    pub fn of(&self, b: &BoundingBox) -> Point {
        match self {
            ReferencePoint::Center => b.center(),
            ReferencePoint::BottomCenter => b.bottom_center(),
        }
    }
}

/// Association settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    pub reference_point: ReferencePoint,
    /// Largest accepted distance in pixels (inclusive); `inf` disables the limit
    pub max_distance: f64,
    /// Only consider fragments containing a price, and report the normalized price
    pub numeric_only: bool,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            reference_point: ReferencePoint::Center,
            max_distance: 200.0,
            numeric_only: false,
        }
    }
}

/// A detection paired with its price text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceAssociation {
    pub detection: Detection,
    pub price_text: Option<String>,
    pub distance: Option<f64>,
}

impl PriceAssociation {
    fn unmatched(detection: &Detection) -> Self {
        Self {
            detection: detection.clone(),
            price_text: None,
            distance: None,
        }
    }
}

struct Candidate {
    point: Point,
    text: String,
    confidence: Option<f32>,
}

/// Matches detections to nearby text fragments
#[derive(Debug, Clone, Default)]
pub struct PriceAssociator {
    config: AssociationConfig,
}

impl PriceAssociator {
    pub fn new(config: AssociationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssociationConfig {
        &self.config
    }

    /// Pair every detection, in order, with at most one fragment
    pub fn associate(&self, detections: &[Detection], fragments: &[TextFragment]) -> Vec<PriceAssociation> {
        let positional = fragments
            .iter()
            .any(|f| f.anchor.reference_point().is_some());

        if !positional {
            return self.associate_without_positions(detections, fragments);
        }

        let candidates: Vec<Candidate> = fragments
            .iter()
            .filter_map(|f| {
                let point = f.anchor.reference_point()?;
                let text = self.price_text(&f.text)?;
                Some(Candidate {
                    point,
                    text,
                    confidence: f.confidence,
                })
            })
            .collect();

        trace!(
            "Associating {} detections with {} of {} fragments",
            detections.len(),
            candidates.len(),
            fragments.len()
        );

        detections
            .iter()
            .map(|detection| {
                let origin = self.config.reference_point.of(&detection.bounding_box);
                match nearest(origin, &candidates) {
                    Some((candidate, distance)) if distance <= self.config.max_distance => {
                        debug!(
                            "{} -> '{}' at {:.1}px",
                            detection.label, candidate.text, distance
                        );
                        PriceAssociation {
                            detection: detection.clone(),
                            price_text: Some(candidate.text.clone()),
                            distance: Some(distance),
                        }
                    }
                    Some((_, distance)) => {
                        debug!(
                            "{}: nearest tag at {:.1}px exceeds {:.1}px",
                            detection.label, distance, self.config.max_distance
                        );
                        PriceAssociation::unmatched(detection)
                    }
                    None => PriceAssociation::unmatched(detection),
                }
            })
            .collect()
    }

    /// Full-frame text with no coordinates: every detection gets the whole text
    fn associate_without_positions(
        &self,
        detections: &[Detection],
        fragments: &[TextFragment],
    ) -> Vec<PriceAssociation> {
        let joined = fragments
            .iter()
            .map(|f| f.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let text = self.price_text(&joined);

        detections
            .iter()
            .map(|detection| PriceAssociation {
                detection: detection.clone(),
                price_text: text.clone(),
                distance: None,
            })
            .collect()
    }

    fn price_text(&self, raw: &str) -> Option<String> {
        if self.config.numeric_only {
            return first_price(raw);
        }
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Closest candidate; ties go to higher confidence, then to the earlier fragment
fn nearest(origin: Point, candidates: &[Candidate]) -> Option<(&Candidate, f64)> {
    let mut best: Option<(&Candidate, f64)> = None;

    for candidate in candidates {
        let distance = origin.distance_to(candidate.point);
        if !distance.is_finite() {
            continue;
        }

        let better = match best {
            None => true,
            Some((current, best_distance)) => {
                distance < best_distance
                    || (distance == best_distance && candidate.confidence > current.confidence)
            }
        };

        if better {
            best = Some((candidate, distance));
        }
    }

    best
}
