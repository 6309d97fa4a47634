//! Application Configuration
//!
//! Grading, vision, recognizer and server settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;

/// Default pass threshold for a single answer
pub const DEFAULT_THRESHOLD: f64 = 0.70;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Grading settings
    pub grading: GradingSettings,
    /// Image preprocessing settings
    pub preprocess: PreprocessSettings,
    /// Line segmentation settings
    pub segmentation: SegmentationSettings,
    /// Handwriting recognizer settings
    pub recognizer: RecognizerSettings,
    /// REST server settings
    pub server: ServerSettings,
    /// Output settings for command-line runs
    pub output: OutputSettings,
}

impl AppConfig {
    /// Check that every section holds usable values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.grading.threshold;
        if !(0.0..=1.0).contains(&t) || t.is_nan() {
            return Err(ConfigError::InvalidThreshold(t));
        }

        let seg = &self.segmentation;
        if seg.kernel_width == 0 || seg.kernel_divisor == 0 {
            return Err(ConfigError::InvalidSegmentation(
                "kernel_width and kernel_divisor must be > 0".to_string(),
            ));
        }
        if seg.fallback_bands == 0 {
            return Err(ConfigError::InvalidSegmentation(
                "fallback_bands must be > 0".to_string(),
            ));
        }

        let pp = &self.preprocess;
        if pp.clahe_tiles == 0 || pp.clahe_clip_limit <= 0.0 {
            return Err(ConfigError::InvalidPreprocess(format!(
                "clahe_tiles ({}) and clahe_clip_limit ({}) must be > 0",
                pp.clahe_tiles, pp.clahe_clip_limit
            )));
        }
        if pp.limit_size && (pp.max_width == 0 || pp.max_height == 0) {
            return Err(ConfigError::InvalidPreprocess(
                "max_width and max_height must be > 0 when limit_size is set".to_string(),
            ));
        }

        let rec = &self.recognizer;
        if rec.model_id.trim().is_empty() {
            return Err(ConfigError::InvalidRecognizer("model_id is empty".to_string()));
        }
        if rec.max_new_tokens == 0 || rec.image_size == 0 {
            return Err(ConfigError::InvalidRecognizer(
                "max_new_tokens and image_size must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Grading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingSettings {
    /// Minimum similarity for an answer to pass (0.0 - 1.0)
    pub threshold: f64,
    /// Drop lines whose recognized text is blank before alignment
    pub skip_blank_lines: bool,
}

impl Default for GradingSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            skip_blank_lines: false,
        }
    }
}

/// Image preprocessing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// Run preprocessing at all
    pub enabled: bool,
    /// Apply the bilateral denoising filter
    pub denoise: bool,
    /// CLAHE clip limit
    pub clahe_clip_limit: f32,
    /// CLAHE tile grid size (tiles per axis)
    pub clahe_tiles: u32,
    /// Straighten rotated sheets before segmentation
    pub deskew: bool,
    /// Shrink large photos before processing
    pub limit_size: bool,
    /// Maximum width when `limit_size` is set
    pub max_width: u32,
    /// Maximum height when `limit_size` is set
    pub max_height: u32,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            denoise: true,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            deskew: false,
            limit_size: false,
            max_width: 1280,
            max_height: 960,
        }
    }
}

/// Line segmentation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationSettings {
    /// Intensity above which a pixel counts as paper
    pub binary_threshold: u8,
    /// Structuring element width in pixels
    pub kernel_width: u32,
    /// Structuring element height is image height divided by this
    pub kernel_divisor: u32,
    /// Candidates must be taller than this many pixels
    pub min_line_height: u32,
    /// Candidates this close (in pixels) are merged
    pub merge_gap: u32,
    /// Number of equal bands used when no line is found
    pub fallback_bands: u32,
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            binary_threshold: 150,
            kernel_width: 40,
            kernel_divisor: 30,
            min_line_height: 5,
            merge_gap: 3,
            fallback_bands: 5,
        }
    }
}

/// Compute device for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Cuda,
}

/// Handwriting recognizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerSettings {
    /// Hugging Face model repository holding the ONNX export
    pub model_id: String,
    /// Override for the model cache directory
    pub models_dir: Option<PathBuf>,
    /// Languages expected on the sheet
    pub languages: Vec<String>,
    /// Inference device
    pub device: ComputeDevice,
    /// Maximum generated tokens per line
    pub max_new_tokens: usize,
    /// Square input size of the vision encoder
    pub image_size: u32,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            model_id: "Xenova/trocr-base-handwritten".to_string(),
            models_dir: None,
            languages: vec!["en".to_string()],
            device: ComputeDevice::Cpu,
            max_new_tokens: 100,
            image_size: 384,
        }
    }
}

/// REST server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Where uploaded sheets are stored (data dir when unset)
    pub upload_dir: Option<PathBuf>,
    /// Where grading records are stored (data dir when unset)
    pub results_dir: Option<PathBuf>,
    /// Maximum upload size in megabytes
    pub max_upload_mb: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            upload_dir: None,
            results_dir: None,
            max_upload_mb: 50,
        }
    }
}

/// Output settings for command-line runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Write the grading record to this JSON file
    pub path: Option<PathBuf>,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert!((config.grading.threshold - 0.70).abs() < 1e-9);
        assert!(!config.grading.skip_blank_lines);

        assert!(config.preprocess.enabled);
        assert!(!config.preprocess.deskew);
        assert_eq!(config.preprocess.clahe_tiles, 8);

        assert_eq!(config.segmentation.binary_threshold, 150);
        assert_eq!(config.segmentation.kernel_width, 40);
        assert_eq!(config.segmentation.merge_gap, 3);
        assert_eq!(config.segmentation.fallback_bands, 5);

        assert_eq!(config.recognizer.device, ComputeDevice::Cpu);
        assert_eq!(config.recognizer.max_new_tokens, 100);

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.max_upload_mb, 50);
        assert!(config.output.path.is_none());

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_with_custom_values() {
        let mut config = AppConfig::default();
        config.grading.threshold = 0.55;
        config.recognizer.device = ComputeDevice::Cuda;
        config.server.upload_dir = Some(PathBuf::from("/srv/uploads"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert!((parsed.grading.threshold - 0.55).abs() < 1e-9);
        assert_eq!(parsed.recognizer.device, ComputeDevice::Cuda);
        assert_eq!(parsed.server.upload_dir, Some(PathBuf::from("/srv/uploads")));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str("[grading]\nthreshold = 0.8\n").unwrap();
        assert!((parsed.grading.threshold - 0.8).abs() < 1e-9);
        assert_eq!(parsed.segmentation.kernel_width, 40);
        assert_eq!(parsed.recognizer.languages, vec!["en".to_string()]);
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.server.port, loaded.server.port);
        assert_eq!(config.recognizer.model_id, loaded.recognizer.model_id);
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
    fn test_threshold_out_of_range_rejected() {
        let mut config = AppConfig::default();
        config.grading.threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidThreshold(_))));

        config.grading.threshold = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_kernel_rejected() {
        let mut config = AppConfig::default();
        config.segmentation.kernel_width = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSegmentation(_))
        ));
    }
}
