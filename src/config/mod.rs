//! Application Configuration
//!
//! User settings stored in TOML format. Every field has a default, so partial
//! files load and missing sections fall back to sensible values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::analysis::AssociationConfig;
use crate::vision::{DetectorOptions, OcrGranularity};

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Object detection settings
    pub detector: DetectorOptions,
    /// Text recognition settings
    pub ocr: OcrConfig,
    /// Price association settings
    pub association: AssociationConfig,
    /// Frame pipeline settings
    pub pipeline: PipelineConfig,
}

/// Text recognition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Tesseract language code
    pub language: String,
    /// Working language-data directory (defaults to `<data_dir>/tessdata`)
    pub tessdata_dir: Option<PathBuf>,
    /// Directory holding bundled `.traineddata` files
    pub bundled_tessdata_dir: PathBuf,
    /// Download location used when the bundled file is missing
    pub language_data_url: Option<String>,
    /// Tesseract executable
    pub tesseract_cmd: String,
    /// Word or line fragments
    pub granularity: OcrGranularity,
    /// Tesseract page segmentation mode (11 = sparse text)
    pub page_segmentation_mode: u32,
    /// Fragments below this confidence (0.0 - 1.0) are discarded
    pub min_confidence: f32,
    /// Image filters applied before recognition
    pub preprocessing: OcrPreprocessing,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            tessdata_dir: None,
            bundled_tessdata_dir: PathBuf::from("assets/tessdata"),
            language_data_url: None,
            tesseract_cmd: "tesseract".to_string(),
            granularity: OcrGranularity::Word,
            page_segmentation_mode: 11,
            min_confidence: 0.0,
            preprocessing: OcrPreprocessing::default(),
        }
    }
}

impl OcrConfig {
    /// Language-data directory, falling back to the platform data directory
    pub fn resolved_tessdata_dir(&self) -> Result<PathBuf> {
        match &self.tessdata_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(crate::storage::get_data_dir()?.join("tessdata")),
        }
    }
}

/// Image preprocessing applied before OCR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrPreprocessing {
    /// Master switch
    pub enabled: bool,
    /// Convert to grayscale
    pub grayscale: bool,
    /// Invert colors (light text on dark tags)
    pub invert: bool,
    /// Contrast factor (1.0 = unchanged)
    pub contrast: f32,
    /// Sharpening strength (0.0 = off)
    pub sharpen: f32,
    /// Integer upscale factor (1 = unchanged)
    pub scale: u32,
}

impl Default for OcrPreprocessing {
    fn default() -> Self {
        Self {
            enabled: false,
            grayscale: true,
            invert: false,
            contrast: 1.0,
            sharpen: 0.0,
            scale: 1,
        }
    }
}

/// Where text recognition runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrScope {
    /// Whole frame, concurrently with detection
    #[default]
    FullFrame,
    /// Margins around each detection, after detection
    AroundDetections,
}

/// Frame pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ocr_scope: OcrScope,
    /// Pixels added around each detection when OCR runs per region
    pub region_margin: f32,
    /// Run detection and full-frame OCR on separate threads
    pub concurrent_stages: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ocr_scope: OcrScope::FullFrame,
            region_margin: 24.0,
            concurrent_stages: true,
        }
    }
}

impl AppConfig {
    /// Reject values that cannot work at runtime
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if !(0.0..=1.0).contains(&d.score_threshold) {
            bail!("detector.score_threshold must be within 0.0 - 1.0, got {}", d.score_threshold);
        }
        if d.max_results == 0 {
            bail!("detector.max_results must be at least 1");
        }
        if d.num_threads == 0 {
            bail!("detector.num_threads must be at least 1");
        }
        if !(0.0..=1.0).contains(&d.iou_threshold) {
            bail!("detector.iou_threshold must be within 0.0 - 1.0, got {}", d.iou_threshold);
        }

        let o = &self.ocr;
        if o.language.trim().is_empty() {
            bail!("ocr.language must not be empty");
        }
        if o.page_segmentation_mode > 13 {
            bail!("ocr.page_segmentation_mode must be within 0 - 13, got {}", o.page_segmentation_mode);
        }
        if !(1..=4).contains(&o.preprocessing.scale) {
            bail!("ocr.preprocessing.scale must be within 1 - 4, got {}", o.preprocessing.scale);
        }

        if self.association.max_distance.is_nan() || self.association.max_distance < 0.0 {
            bail!("association.max_distance must be a non-negative number");
        }
        if self.pipeline.region_margin < 0.0 {
            bail!("pipeline.region_margin must not be negative");
        }

        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load the configuration from `explicit`, else from `default_path` if it exists,
/// else use defaults. Returns the file that was read, if any.
pub fn resolve_config(explicit: Option<&Path>, default_path: Option<&Path>) -> Result<(AppConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = load_config(path).with_context(|| format!("Failed to load config from {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok((config, Some(path.to_path_buf())));
    }

    match default_path {
        Some(path) if path.exists() => {
            let config =
                load_config(path).with_context(|| format!("Failed to load config from {:?}", path))?;
            info!("Loaded configuration from {:?}", path);
            Ok((config, Some(path.to_path_buf())))
        }
        _ => {
            debug!("No configuration file found, using defaults");
            Ok((AppConfig::default(), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ReferencePoint;
    use crate::vision::{Backend, ModelVersion};
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        // Detector defaults
        assert_eq!(config.detector.model_version, ModelVersion::SsdMobilenetV1);
        assert!((config.detector.score_threshold - 0.5).abs() < 0.01);
        assert_eq!(config.detector.max_results, 3);
        assert_eq!(config.detector.num_threads, 2);
        assert_eq!(config.detector.backend, Backend::Cpu);
        assert!(config.detector.label_allowlist.is_empty());

        // OCR defaults
        assert_eq!(config.ocr.language, "eng");
        assert_eq!(config.ocr.granularity, OcrGranularity::Word);
        assert_eq!(config.ocr.page_segmentation_mode, 11);
        assert!(!config.ocr.preprocessing.enabled);

        // Association defaults
        assert_eq!(config.association.reference_point, ReferencePoint::Center);
        assert!((config.association.max_distance - 200.0).abs() < f64::EPSILON);
        assert!(!config.association.numeric_only);

        // Pipeline defaults
        assert_eq!(config.pipeline.ocr_scope, OcrScope::FullFrame);
        assert!(config.pipeline.concurrent_stages);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.detector.backend = Backend::Nnapi;
        config.detector.label_allowlist = vec!["banana".to_string(), "apple".to_string()];
        config.ocr.granularity = OcrGranularity::Line;
        config.association.reference_point = ReferencePoint::BottomCenter;
        config.pipeline.ocr_scope = OcrScope::AroundDetections;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [detector]
            model_version = "yolov8n"
            score_threshold = 0.35
            backend = "gpu"

            [association]
            max_distance = inf
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.detector.model_version, ModelVersion::YoloV8n);
        assert!((config.detector.score_threshold - 0.35).abs() < 0.001);
        assert_eq!(config.detector.backend, Backend::Gpu);
        assert_eq!(config.detector.max_results, 3);
        assert!(config.association.max_distance.is_infinite());
        assert_eq!(config.ocr, OcrConfig::default());
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.detector.max_results = 5;
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.detector.max_results, 5);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_config_precedence() {
        let dir = TempDir::new().unwrap();
        let default_path = dir.path().join("config.toml");

        // Nothing on disk: defaults
        let (config, source) = resolve_config(None, Some(&default_path)).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(source.is_none());

        let mut stored = AppConfig::default();
        stored.detector.max_results = 7;
        save_config(&stored, &default_path).unwrap();

        let (config, source) = resolve_config(None, Some(&default_path)).unwrap();
        assert_eq!(config.detector.max_results, 7);
        assert_eq!(source.as_deref(), Some(default_path.as_path()));

        // Explicit path wins and must exist
        let explicit = dir.path().join("other.toml");
        assert!(resolve_config(Some(&explicit), Some(&default_path)).is_err());
        save_config(&AppConfig::default(), &explicit).unwrap();
        let (config, _) = resolve_config(Some(&explicit), Some(&default_path)).unwrap();
        assert_eq!(config.detector.max_results, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.detector.score_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detector.max_results = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.ocr.preprocessing.scale = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.association.max_distance = -1.0;
        assert!(config.validate().is_err());
    }
}
