//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of the object-detection models,
//! and builds inference sessions on the requested execution backend.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::error::DetectorError;

/// Supported pretrained detection models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVersion {
    /// SSD MobileNet v1 (TF detection post-processing baked into the graph)
    #[default]
    SsdMobilenetV1,
    /// YOLOv8 nano (raw head output, NMS done here)
    #[serde(rename = "yolov8n")]
    YoloV8n,
}

impl ModelVersion {
    /// Get the filename for this model
    pub fn filename(&self) -> &'static str {
        match self {
            ModelVersion::SsdMobilenetV1 => "ssd_mobilenet_v1_12.onnx",
            ModelVersion::YoloV8n => "yolov8n.onnx",
        }
    }

    /// Default download URL, if the model is published in the ONNX model zoo
    pub fn download_url(&self) -> Option<&'static str> {
        match self {
            ModelVersion::SsdMobilenetV1 => Some(
                "https://github.com/onnx/models/raw/main/validated/vision/object_detection_segmentation/ssd-mobilenetv1/model/ssd_mobilenet_v1_12.onnx",
            ),
            // Ultralytics exports are produced locally; supply `model_url` or `model_path`
            ModelVersion::YoloV8n => None,
        }
    }

    /// Expected file size for integrity check (approximate, in bytes)
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelVersion::SsdMobilenetV1 => (20_000_000, 40_000_000), // ~29 MB
            ModelVersion::YoloV8n => (5_000_000, 20_000_000),         // ~12 MB
        }
    }

    /// Model input (width, height)
    pub fn input_size(&self) -> (u32, u32) {
        match self {
            ModelVersion::SsdMobilenetV1 => (300, 300),
            ModelVersion::YoloV8n => (640, 640),
        }
    }

    /// Display name for logging
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelVersion::SsdMobilenetV1 => "SSD MobileNet v1",
            ModelVersion::YoloV8n => "YOLOv8n",
        }
    }
}

impl FromStr for ModelVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "ssd_mobilenet_v1" | "ssd" => Ok(ModelVersion::SsdMobilenetV1),
            "yolov8n" | "yolo" => Ok(ModelVersion::YoloV8n),
            other => Err(format!(
                "unknown model version '{}'; valid options: ssd_mobilenet_v1, yolov8n",
                other
            )),
        }
    }
}

/// Execution backend for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Plain CPU execution
    #[default]
    Cpu,
    /// GPU (DirectML with the `directml` feature, else CUDA with `cuda`)
    Gpu,
    /// Android Neural Networks API (`nnapi` feature)
    Nnapi,
}

impl Backend {
    /// Execution provider for this backend, or why this build cannot provide it
    fn execution_provider(&self) -> std::result::Result<ExecutionProviderDispatch, String> {
        match self {
            Backend::Cpu => Ok(CPUExecutionProvider::default().build()),
            Backend::Gpu => gpu_execution_provider(),
            Backend::Nnapi => nnapi_execution_provider(),
        }
    }
}

#[cfg(feature = "directml")]
fn gpu_execution_provider() -> std::result::Result<ExecutionProviderDispatch, String> {
    use ort::execution_providers::DirectMLExecutionProvider;
    Ok(DirectMLExecutionProvider::default().build().error_on_failure())
}

#[cfg(all(feature = "cuda", not(feature = "directml")))]
fn gpu_execution_provider() -> std::result::Result<ExecutionProviderDispatch, String> {
    use ort::execution_providers::CUDAExecutionProvider;
    Ok(CUDAExecutionProvider::default().build().error_on_failure())
}

#[cfg(not(any(feature = "cuda", feature = "directml")))]
fn gpu_execution_provider() -> std::result::Result<ExecutionProviderDispatch, String> {
    Err("built without the `cuda` or `directml` feature".to_string())
}

#[cfg(feature = "nnapi")]
fn nnapi_execution_provider() -> std::result::Result<ExecutionProviderDispatch, String> {
    use ort::execution_providers::NNAPIExecutionProvider;
    Ok(NNAPIExecutionProvider::default().build().error_on_failure())
}

#[cfg(not(feature = "nnapi"))]
fn nnapi_execution_provider() -> std::result::Result<ExecutionProviderDispatch, String> {
    Err("built without the `nnapi` feature".to_string())
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Backend::Cpu),
            "gpu" => Ok(Backend::Gpu),
            "nnapi" => Ok(Backend::Nnapi),
            other => Err(format!("unknown backend '{}'; valid options: cpu, gpu, nnapi", other)),
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_version: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub downloaded_at: String,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Model manager for downloading and caching ONNX models
pub struct ModelManager {
    models_dir: PathBuf,
}

impl ModelManager {
    /// Create a model manager rooted in the application data directory
    pub fn new() -> Result<Self> {
        let data_dir = crate::storage::get_data_dir()?;
        Self::with_dir(data_dir.join("models"))
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self { models_dir })
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, version: ModelVersion) -> PathBuf {
        self.models_dir.join(version.filename())
    }

    /// Check if a model is already downloaded.
    /// A file outside the expected size range counts only if the manifest
    /// recorded it with that exact size (custom `model_url` exports).
    pub fn is_model_available(&self, version: ModelVersion) -> bool {
        let size = match std::fs::metadata(self.model_path(version)) {
            Ok(metadata) => metadata.len(),
            Err(_) => return false,
        };
        if size == 0 {
            return false;
        }

        let (min, max) = version.expected_size_range();
        if size >= min && size <= max {
            return true;
        }

        self.load_manifest()
            .map(|manifest| {
                manifest
                    .models
                    .iter()
                    .any(|m| m.filename == version.filename() && m.size_bytes == size)
            })
            .unwrap_or(false)
    }

    /// Download a model if not already available.
    /// Returns the path to the model file
    pub fn ensure_model(&self, version: ModelVersion, url_override: Option<&str>) -> Result<PathBuf> {
        let path = self.model_path(version);

        if self.is_model_available(version) {
            info!("Model {:?} already available at {:?}", version, path);
            return Ok(path);
        }

        let url = url_override.or(version.download_url()).with_context(|| {
            format!(
                "{} is not present at {:?} and has no download URL; set detector.model_url or detector.model_path",
                version.display_name(),
                path
            )
        })?;

        self.download_model(version, url, url_override.is_some())?;

        Ok(path)
    }

    /// Download a specific model
    fn download_model(&self, version: ModelVersion, url: &str, custom_url: bool) -> Result<()> {
        let path = self.model_path(version);

        info!("Downloading {} model from {}", version.display_name(), url);

        let hash = download_file(url, &path)?;
        self.verify_download(version, custom_url)?;
        self.update_manifest_for_model(version, hash)?;

        info!("Successfully downloaded {} model", version.display_name());
        Ok(())
    }

    /// Reject a downloaded file that cannot be the requested model.
    /// Custom URLs may serve any export size; only empty files are rejected.
    fn verify_download(&self, version: ModelVersion, custom_url: bool) -> Result<()> {
        let path = self.model_path(version);
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let (min, max) = version.expected_size_range();

        let plausible = if custom_url {
            size > 0
        } else {
            size >= min && size <= max
        };
        if !plausible {
            std::fs::remove_file(&path).ok();
            anyhow::bail!(
                "Download of {} completed but its size ({} bytes) is not plausible",
                version.display_name(),
                size
            );
        }
        Ok(())
    }

    /// Update manifest after successful download
    fn update_manifest_for_model(&self, version: ModelVersion, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(version))?;

        let model_info = ModelInfo {
            model_version: format!("{:?}", version),
            filename: version.filename().to_string(),
            size_bytes: metadata.len(),
            sha256: Some(sha256),
            downloaded_at: unix_timestamp(),
        };

        // Update or add model info
        if let Some(existing) = manifest
            .models
            .iter_mut()
            .find(|m| m.filename == model_info.filename)
        {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: ModelManifest = serde_json::from_str(&content)?;
            Ok(manifest)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Download `url` to `path` through a temp file, returning the SHA-256 of the body.
/// Blocks on a private tokio runtime.
pub fn download_file(url: &str, path: &Path) -> Result<String> {
    if std::env::var("PRICE_SIGHT_OFFLINE").is_ok() {
        anyhow::bail!(
            "Offline mode: cannot download {}. Place the file at {:?} manually",
            url,
            path
        );
    }

    let rt = Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(download_file_async(url, path))
}

async fn download_file_async(url: &str, path: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let total_size = response.content_length();
    debug!("Download size: {:?} bytes", total_size);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);
    debug!("Downloaded {} bytes from {}", downloaded, url);

    std::fs::rename(&temp_path, path).context("Failed to move downloaded file to final location")?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    backend: Backend,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

/// A loaded session plus the notice recorded if the requested backend was unavailable
pub struct LoadedSession {
    pub session: OnnxSession,
    pub fallback_notice: Option<String>,
}

impl OnnxSession {
    /// Load a model on the requested backend, falling back to CPU when the
    /// accelerator cannot be registered
    pub fn load(model_path: &Path, backend: Backend, num_threads: usize) -> Result<LoadedSession, DetectorError> {
        match Self::build(model_path, backend, num_threads) {
            Ok(session) => Ok(LoadedSession {
                session,
                fallback_notice: None,
            }),
            Err(e) if backend != Backend::Cpu => {
                let notice = DetectorError::UnsupportedBackend {
                    requested: backend,
                    reason: e.to_string(),
                }
                .to_string();
                warn!("{}; falling back to CPU", notice);

                let session = Self::build(model_path, Backend::Cpu, num_threads)
                    .map_err(|e| DetectorError::ModelInitialization(e.to_string()))?;
                Ok(LoadedSession {
                    session,
                    fallback_notice: Some(notice),
                })
            }
            Err(e) => Err(DetectorError::ModelInitialization(e.to_string())),
        }
    }

    fn build(model_path: &Path, backend: Backend, num_threads: usize) -> Result<Self> {
        info!("Loading ONNX model from {:?} on {:?}", model_path, backend);

        let provider = backend.execution_provider().map_err(anyhow::Error::msg)?;
        let session = Session::builder()?
            .with_execution_providers([provider])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_threads.max(1))?
            .commit_from_file(model_path)
            .context("Failed to load ONNX model")?;

        let input_names: Vec<String> = session.inputs.iter().map(|input| input.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|output| output.name.clone()).collect();

        info!("Model loaded. Inputs: {:?}, Outputs: {:?}", input_names, output_names);

        Ok(Self {
            session,
            backend,
            input_names,
            output_names,
        })
    }

    /// Get the underlying session mutably for running inference
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Backend the session actually runs on
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

/// Current time as Unix seconds
fn unix_timestamp() -> String {
    use std::time::SystemTime;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    format!("{}", now)
}
