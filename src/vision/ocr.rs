//! OCR (Optical Character Recognition) module
//!
//! Reads price-tag text with Tesseract. The engine runs as the `tesseract`
//! executable: the frame goes in as PNG on stdin and word boxes come back as TSV
//! on stdout. Language data is provisioned once before the first recognition.

use image::{imageops, DynamicImage, ImageFormat, RgbaImage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, info};

use crate::config::OcrConfig;
use crate::error::OcrError;
use crate::vision::ocr_preprocess::apply_preprocessing_with_scale;
use crate::vision::tessdata::{ProvisionOutcome, TessdataProvisioner};
use crate::vision::{BoundingBox, FragmentAnchor, Point, TextFragment};

/// Size of the text units returned as fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrGranularity {
    /// One fragment per word
    #[default]
    Word,
    /// One fragment per text line
    Line,
}

/// Text read from an image
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Recognition {
    /// Full text, one line per recognized line
    pub text: String,
    /// Positioned pieces of the text
    pub fragments: Vec<TextFragment>,
}

impl Recognition {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.fragments.is_empty()
    }

    /// Shift every fragment by (dx, dy)
    pub fn translated(mut self, dx: f32, dy: f32) -> Self {
        for fragment in &mut self.fragments {
            fragment.anchor = match fragment.anchor {
                FragmentAnchor::Box(b) => FragmentAnchor::Box(b.translate(dx, dy)),
                FragmentAnchor::Point(p) => FragmentAnchor::Point(Point::new(p.x + dx, p.y + dy)),
                FragmentAnchor::Unplaced => FragmentAnchor::Unplaced,
            };
        }
        self
    }
}

/// A text recognition engine
pub trait TextRecognizer: Send + Sync {
    /// Recognize all text in the image. Empty or blank input yields an empty result.
    fn recognize(&self, image: &RgbaImage) -> Result<Recognition, OcrError>;

    /// Recognize text inside `region`; fragment positions are in `image` coordinates
    fn recognize_region(&self, image: &RgbaImage, region: &BoundingBox) -> Result<Recognition, OcrError> {
        let (width, height) = image.dimensions();
        let region = region.clamp_to(width, height);
        let x = region.x0.floor() as u32;
        let y = region.y0.floor() as u32;
        let w = (region.x1.ceil() as u32).saturating_sub(x);
        let h = (region.y1.ceil() as u32).saturating_sub(y);

        if w == 0 || h == 0 {
            return Ok(Recognition::default());
        }

        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        Ok(self.recognize(&crop)?.translated(x as f32, y as f32))
    }
}

/// Tesseract-backed recognizer
pub struct TesseractRecognizer {
    config: OcrConfig,
    provisioner: TessdataProvisioner,
    provisioned: Mutex<bool>,
}

impl TesseractRecognizer {
    /// Create a recognizer using `tessdata_dir` as the working language-data directory
    pub fn new(config: OcrConfig, tessdata_dir: PathBuf) -> Self {
        let mut provisioner = TessdataProvisioner::new(tessdata_dir, config.language.clone())
            .with_bundled_dir(config.bundled_tessdata_dir.clone());
        if let Some(url) = &config.language_data_url {
            provisioner = provisioner.with_download_url(url.clone());
        }

        Self {
            config,
            provisioner,
            provisioned: Mutex::new(false),
        }
    }

    /// Create a recognizer from configuration, resolving the default tessdata directory
    pub fn from_config(config: &OcrConfig) -> anyhow::Result<Self> {
        let tessdata_dir = config.resolved_tessdata_dir()?;
        Ok(Self::new(config.clone(), tessdata_dir))
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    /// Provision language data. Idempotent; later calls write nothing.
    pub fn setup(&self) -> Result<ProvisionOutcome, OcrError> {
        let mut provisioned = self.provisioned.lock();
        if *provisioned {
            return Ok(ProvisionOutcome::AlreadyPresent);
        }

        let outcome = self
            .provisioner
            .ensure()
            .map_err(|e| OcrError::Resource(e.to_string()))?;
        if outcome == ProvisionOutcome::Created {
            info!("Provisioned OCR language data in {:?}", self.provisioner.tessdata_dir());
        }
        *provisioned = true;
        Ok(outcome)
    }

    fn run_tesseract(&self, png: &[u8]) -> Result<String, OcrError> {
        let mut child = Command::new(&self.config.tesseract_cmd)
            .arg("stdin")
            .arg("stdout")
            .arg("--tessdata-dir")
            .arg(self.provisioner.tessdata_dir())
            .arg("-l")
            .arg(&self.config.language)
            .arg("--psm")
            .arg(self.config.page_segmentation_mode.to_string())
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => OcrError::Engine(format!(
                    "'{}' not found; install Tesseract or set ocr.tesseract_cmd",
                    self.config.tesseract_cmd
                )),
                _ => OcrError::Io(e),
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Engine("tesseract stdin unavailable".to_string()))?;

        // Feed stdin from a separate thread so a full stdout pipe cannot deadlock us
        let output = std::thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(png));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            output.and_then(|o| written.map(|_| o))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Engine(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, image: &RgbaImage) -> Result<Recognition, OcrError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Recognition::default());
        }

        self.setup()?;

        let start = Instant::now();
        let prepared = apply_preprocessing_with_scale(image, &self.config.preprocessing);

        let mut png = Vec::new();
        DynamicImage::ImageRgba8(prepared.image).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let tsv = self.run_tesseract(&png)?;
        let recognition = parse_tsv(
            &tsv,
            self.config.granularity,
            self.config.min_confidence,
            prepared.scale as f32,
        );

        debug!(
            "OCR complete in {:?}: {} fragments from {}x{} image",
            start.elapsed(),
            recognition.fragments.len(),
            width,
            height
        );

        Ok(recognition)
    }
}

/// One word row of Tesseract TSV output
struct TsvWord {
    line_key: (u32, u32, u32, u32),
    bounds: BoundingBox,
    confidence: f32,
    text: String,
}

fn parse_word_row(row: &str, scale: f32) -> Option<TsvWord> {
    let cols: Vec<&str> = row.splitn(12, '\t').collect();
    if cols.len() < 12 || cols[0].trim() != "5" {
        return None;
    }

    let num = |i: usize| cols[i].trim().parse::<f32>().ok();
    let key = |i: usize| cols[i].trim().parse::<u32>().ok();

    let text = cols[11].trim();
    let conf = num(10)?;
    if text.is_empty() || conf < 0.0 {
        return None;
    }

    let scale = if scale > 0.0 { scale } else { 1.0 };
    Some(TsvWord {
        line_key: (key(1)?, key(2)?, key(3)?, key(4)?),
        bounds: BoundingBox::from_xywh(num(6)? / scale, num(7)? / scale, num(8)? / scale, num(9)? / scale),
        confidence: (conf / 100.0).clamp(0.0, 1.0),
        text: text.to_string(),
    })
}

/// Turn Tesseract TSV into fragments. Boxes are divided by `scale` to undo
/// preprocessing upscaling.
pub fn parse_tsv(tsv: &str, granularity: OcrGranularity, min_confidence: f32, scale: f32) -> Recognition {
    let mut words: Vec<TsvWord> = tsv
        .lines()
        .skip_while(|l| l.starts_with("level"))
        .filter_map(|row| parse_word_row(row, scale))
        .collect();

    let total = words.len();
    words.retain(|w| w.confidence >= min_confidence);
    if words.len() < total {
        debug!("Dropped {} low-confidence words", total - words.len());
    }

    // Group consecutive words of the same line
    let mut lines: Vec<Vec<TsvWord>> = Vec::new();
    for word in words {
        match lines.last_mut() {
            Some(line) if line[0].line_key == word.line_key => line.push(word),
            _ => lines.push(vec![word]),
        }
    }

    let text = lines
        .iter()
        .map(|line| line.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    let fragments = match granularity {
        OcrGranularity::Word => lines
            .into_iter()
            .flatten()
            .map(|w| TextFragment::boxed(w.text, w.bounds, Some(w.confidence)))
            .collect(),
        OcrGranularity::Line => lines
            .into_iter()
            .filter_map(|line| {
                let first = line.first()?;
                let bounds = line.iter().skip(1).fold(first.bounds, |acc, w| acc.union(&w.bounds));
                let confidence = line.iter().map(|w| w.confidence).sum::<f32>() / line.len() as f32;
                let text = line.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ");
                Some(TextFragment::boxed(text, bounds, Some(confidence)))
            })
            .collect(),
    };

    Recognition { text, fragments }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t
2\t1\t1\t0\t0\t0\t20\t30\t200\t60\t-1\t
4\t1\t1\t1\t1\t0\t20\t30\t200\t20\t-1\t
5\t1\t1\t1\t1\t1\t20\t30\t80\t20\t91.5\tBananas
5\t1\t1\t1\t1\t2\t110\t30\t50\t20\t88\t1.99
5\t1\t1\t1\t1\t3\t170\t30\t10\t20\t12\t~
5\t1\t1\t1\t2\t1\t20\t60\t40\t20\t95\t/kg
5\t1\t2\t1\t1\t1\t400\t300\t60\t30\t-1\t
";

    #[test]
    fn test_parse_words() {
        let recognition = parse_tsv(SAMPLE_TSV, OcrGranularity::Word, 0.0, 1.0);
        let texts: Vec<&str> = recognition.fragments.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["Bananas", "1.99", "~", "/kg"]);
        assert_eq!(recognition.text, "Bananas 1.99 ~\n/kg");

        let price = &recognition.fragments[1];
        assert_eq!(price.anchor, FragmentAnchor::Box(BoundingBox::new(110.0, 30.0, 160.0, 50.0)));
        assert!((price.confidence.unwrap() - 0.88).abs() < 1e-6);
    }

    #[test]
    fn test_parse_lines_with_min_confidence() {
        let recognition = parse_tsv(SAMPLE_TSV, OcrGranularity::Line, 0.5, 1.0);
        assert_eq!(recognition.fragments.len(), 2);

        let first = &recognition.fragments[0];
        assert_eq!(first.text, "Bananas 1.99");
        assert_eq!(first.anchor, FragmentAnchor::Box(BoundingBox::new(20.0, 30.0, 160.0, 50.0)));
        assert!((first.confidence.unwrap() - (0.915 + 0.88) / 2.0).abs() < 1e-5);
        assert_eq!(recognition.text, "Bananas 1.99\n/kg");
    }

    #[test]
    fn test_parse_undoes_upscaling() {
        let recognition = parse_tsv(SAMPLE_TSV, OcrGranularity::Word, 0.0, 2.0);
        assert_eq!(
            recognition.fragments[1].anchor,
            FragmentAnchor::Box(BoundingBox::new(55.0, 15.0, 80.0, 25.0))
        );
    }

    #[test]
    fn test_parse_empty_output() {
        let recognition = parse_tsv("", OcrGranularity::Word, 0.0, 1.0);
        assert!(recognition.is_empty());

        let header_only = parse_tsv(SAMPLE_TSV.lines().next().unwrap(), OcrGranularity::Line, 0.0, 1.0);
        assert!(header_only.is_empty());
    }

    struct EchoRecognizer;

    impl TextRecognizer for EchoRecognizer {
        fn recognize(&self, image: &RgbaImage) -> Result<Recognition, OcrError> {
            let (w, h) = image.dimensions();
            Ok(Recognition {
                text: format!("{}x{}", w, h),
                fragments: vec![TextFragment::boxed("0.99", BoundingBox::new(1.0, 2.0, 5.0, 6.0), None)],
            })
        }
    }

    #[test]
    fn test_recognize_region_offsets_fragments() {
        let image = RgbaImage::new(100, 80);
        let region = BoundingBox::new(10.5, 20.0, 40.0, 200.0);

        let recognition = EchoRecognizer.recognize_region(&image, &region).unwrap();
        // Crop is clamped to the image: x 10..40, y 20..80
        assert_eq!(recognition.text, "30x60");
        assert_eq!(
            recognition.fragments[0].anchor,
            FragmentAnchor::Box(BoundingBox::new(11.0, 22.0, 15.0, 26.0))
        );
    }

    #[test]
    fn test_recognize_region_outside_image_is_empty() {
        let image = RgbaImage::new(10, 10);
        let region = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!(EchoRecognizer.recognize_region(&image, &region).unwrap().is_empty());
    }

    #[test]
    fn test_tesseract_empty_image_skips_engine() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = OcrConfig {
            tesseract_cmd: "definitely-not-a-real-tesseract".to_string(),
            ..Default::default()
        };
        let recognizer = TesseractRecognizer::new(config, temp.path().join("tessdata"));

        let recognition = recognizer.recognize(&RgbaImage::new(0, 0)).unwrap();
        assert!(recognition.is_empty());
    }

    #[test]
    fn test_tesseract_missing_language_data_is_resource_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = OcrConfig {
            bundled_tessdata_dir: temp.path().join("no-assets"),
            ..Default::default()
        };
        let recognizer = TesseractRecognizer::new(config, temp.path().join("tessdata"));

        let err = recognizer.recognize(&RgbaImage::new(4, 4)).unwrap_err();
        assert!(matches!(err, OcrError::Resource(_)));
    }
}
