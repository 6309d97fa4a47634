//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of the TrOCR handwriting model
//! (vision encoder, text decoder and tokenizer) from the Hugging Face hub.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::config::{ComputeDevice, RecognizerSettings};

/// Environment variable that disables all downloads
pub const OFFLINE_ENV: &str = "GRADER_OFFLINE";

/// Hugging Face download host
const HUB_URL: &str = "https://huggingface.co";

/// Files making up one recognizer model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    /// Vision encoder (pixel values -> hidden states)
    Encoder,
    /// Text decoder (token ids + hidden states -> logits)
    Decoder,
    /// Byte-level BPE tokenizer
    Tokenizer,
}

impl ModelFile {
    /// All files required to run recognition
    pub const ALL: [ModelFile; 3] = [ModelFile::Encoder, ModelFile::Decoder, ModelFile::Tokenizer];

    /// Local filename in the model cache
    pub fn filename(&self) -> &'static str {
        match self {
            ModelFile::Encoder => "encoder_model.onnx",
            ModelFile::Decoder => "decoder_model.onnx",
            ModelFile::Tokenizer => "tokenizer.json",
        }
    }

    /// Path of the file inside the hub repository
    pub fn remote_path(&self) -> &'static str {
        match self {
            ModelFile::Encoder => "onnx/encoder_model.onnx",
            ModelFile::Decoder => "onnx/decoder_model.onnx",
            ModelFile::Tokenizer => "tokenizer.json",
        }
    }

    /// Download URL for this file of the given hub repository
    pub fn download_url(&self, model_id: &str) -> String {
        format!("{}/{}/resolve/main/{}", HUB_URL, model_id, self.remote_path())
    }

    /// Smallest plausible file size (catches truncated downloads and error pages)
    pub fn min_size(&self) -> u64 {
        match self {
            ModelFile::Encoder | ModelFile::Decoder => 1_000_000,
            ModelFile::Tokenizer => 1_000,
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelFile::Encoder => "Vision Encoder",
            ModelFile::Decoder => "Text Decoder",
            ModelFile::Tokenizer => "Tokenizer",
        }
    }
}

/// Model manifest tracking downloaded files
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub model_id: String,
    pub files: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub downloaded_at: String,
}

/// Progress callback for download operations
pub type DownloadProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            model_id: String::new(),
            files: Vec::new(),
        }
    }
}

/// Status of one cached file
#[derive(Debug, Clone)]
pub struct ModelFileStatus {
    pub file: ModelFile,
    pub available: bool,
    pub size_bytes: Option<u64>,
    /// `Some(true)` when the file matches its manifest checksum
    pub verified: Option<bool>,
}

/// Model manager for downloading and caching ONNX models
pub struct ModelManager {
    model_id: String,
    models_dir: PathBuf,
}

impl ModelManager {
    /// Create a manager for the configured model, cached under the data directory
    pub fn new(settings: &RecognizerSettings) -> Result<Self> {
        let base = match &settings.models_dir {
            Some(dir) => dir.clone(),
            None => crate::storage::get_data_dir()?.join("models"),
        };
        Self::with_dir(&settings.model_id, base)
    }

    /// Create a manager with a custom cache root
    pub fn with_dir(model_id: &str, base_dir: PathBuf) -> Result<Self> {
        let models_dir = base_dir.join(model_id.replace('/', "--"));
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;

        Ok(Self {
            model_id: model_id.to_string(),
            models_dir,
        })
    }

    /// Hub repository this manager serves
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, file: ModelFile) -> PathBuf {
        self.models_dir.join(file.filename())
    }

    /// Check if a file is already downloaded
    pub fn is_available(&self, file: ModelFile) -> bool {
        std::fs::metadata(self.model_path(file))
            .map(|metadata| metadata.is_file() && metadata.len() >= file.min_size())
            .unwrap_or(false)
    }

    /// Check if every required file is available
    pub fn are_models_ready(&self) -> bool {
        ModelFile::ALL.iter().all(|&file| self.is_available(file))
    }

    /// Get status of all files
    pub fn get_model_status(&self) -> Vec<ModelFileStatus> {
        let manifest = self.load_manifest().unwrap_or_default();

        ModelFile::ALL
            .iter()
            .map(|&file| {
                let path = self.model_path(file);
                let available = self.is_available(file);
                let size_bytes = std::fs::metadata(&path).ok().map(|m| m.len());
                let verified = if available {
                    manifest
                        .files
                        .iter()
                        .find(|info| info.filename == file.filename())
                        .and_then(|info| info.sha256.as_deref())
                        .map(|expected| {
                            sha256_file(&path)
                                .map(|actual| actual == expected)
                                .unwrap_or(false)
                        })
                } else {
                    None
                };

                ModelFileStatus {
                    file,
                    available,
                    size_bytes,
                    verified,
                }
            })
            .collect()
    }

    /// Download a file if not already available
    /// Returns the path to the model file
    pub fn ensure_model(&self, file: ModelFile) -> Result<PathBuf> {
        let path = self.model_path(file);

        if self.is_available(file) {
            debug!("{} already available at {:?}", file.display_name(), path);
            return Ok(path);
        }

        info!("Downloading {}...", file.display_name());
        self.download_with_progress(file, None)?;

        Ok(path)
    }

    /// Download every missing file
    pub fn ensure_all_models(&self) -> Result<()> {
        for file in ModelFile::ALL {
            self.ensure_model(file)?;
        }
        Ok(())
    }

    /// Download every missing file, reporting progress per file
    pub fn download_all_with_progress<F>(&self, on_progress: F) -> Result<()>
    where
        F: Fn(ModelFile, u64, Option<u64>) + Send + Sync + Clone + 'static,
    {
        for file in ModelFile::ALL {
            if self.is_available(file) {
                info!("{} already available, skipping download", file.display_name());
                continue;
            }

            let report = on_progress.clone();
            let callback: DownloadProgressCallback =
                Box::new(move |downloaded, total| report(file, downloaded, total));

            self.download_with_progress(file, Some(callback))?;
        }

        Ok(())
    }

    /// Download a specific file with optional progress callback (blocking)
    pub fn download_with_progress(
        &self,
        file: ModelFile,
        progress: Option<DownloadProgressCallback>,
    ) -> Result<()> {
        let url = file.download_url(&self.model_id);
        let path = self.model_path(file);

        // Check if we're in offline mode
        if std::env::var(OFFLINE_ENV).is_ok() {
            anyhow::bail!(
                "Offline mode: cannot download models. Please download manually from {} and place at {:?}",
                url,
                path
            );
        }

        info!("Downloading {} from {}", file.display_name(), url);

        // Create a tokio runtime for async download
        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let hash = rt.block_on(async { download_file_async(&url, &path, progress).await })?;

        // Verify the download
        if !self.is_available(file) {
            anyhow::bail!(
                "Download of {} completed but the file is smaller than expected",
                file.filename()
            );
        }

        self.update_manifest(file, hash)?;

        info!("Successfully downloaded {}", file.display_name());
        Ok(())
    }

    /// Record a downloaded file and its checksum
    fn update_manifest(&self, file: ModelFile, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        manifest.model_id = self.model_id.clone();

        let metadata = std::fs::metadata(self.model_path(file))?;
        let model_info = ModelInfo {
            filename: file.filename().to_string(),
            size_bytes: metadata.len(),
            sha256: Some(sha256),
            downloaded_at: crate::storage::unix_timestamp().to_string(),
        };

        // Update or add model info
        if let Some(existing) = manifest
            .files
            .iter_mut()
            .find(|m| m.filename == model_info.filename)
        {
            *existing = model_info;
        } else {
            manifest.files.push(model_info);
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

/// Stream a file to disk through a temp file, returning its SHA-256
async fn download_file_async(
    url: &str,
    path: &Path,
    progress: Option<DownloadProgressCallback>,
) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
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

        if let Some(ref callback) = progress {
            callback(downloaded, total_size);
        }
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);

    if let Some(expected) = total_size {
        if expected != downloaded {
            std::fs::remove_file(&temp_path).ok();
            anyhow::bail!("Truncated download: got {} of {} bytes", downloaded, expected);
        }
    }

    std::fs::rename(&temp_path, path)
        .context("Failed to move downloaded file to final location")?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of a file on disk, hex encoded
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {:?} for hashing", path))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Create a session on the requested device
    ///
    /// CUDA needs the `cuda` feature; without it, or when the provider cannot
    /// be registered, the session runs on CPU.
    pub fn new(model_path: &Path, device: ComputeDevice) -> Result<Self> {
        info!("Loading ONNX model from {:?} ({:?})", model_path, device);

        let builder = match device {
            ComputeDevice::Cpu => cpu_builder()?,
            ComputeDevice::Cuda => cuda_builder()?,
        };

        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let input_names: Vec<String> = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();

        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        info!(
            "Model loaded. Inputs: {:?}, Outputs: {:?}",
            input_names, output_names
        );

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    /// Get the underlying session mutably for running inference
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Get input names
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Get output names
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Whether the model declares an input with this name
    pub fn has_input(&self, name: &str) -> bool {
        self.input_names.iter().any(|n| n == name)
    }
}

fn cpu_builder() -> Result<SessionBuilder> {
    Ok(Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?)
}

#[cfg(feature = "cuda")]
fn cuda_builder() -> Result<SessionBuilder> {
    use ort::execution_providers::CUDAExecutionProvider;

    match cpu_builder()?.with_execution_providers([CUDAExecutionProvider::default().build()]) {
        Ok(builder) => {
            info!("CUDA acceleration enabled");
            Ok(builder)
        }
        Err(e) => {
            warn!("CUDA not available, using CPU: {}", e);
            cpu_builder()
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn cuda_builder() -> Result<SessionBuilder> {
    warn!("Built without the `cuda` feature; running recognition on CPU");
    cpu_builder()
}
