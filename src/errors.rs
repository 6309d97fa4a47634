//! Error types for the grading pipeline
//!
//! Only input problems abort a grading request. Recognition and scoring
//! failures are carried as degraded outcomes inside the result instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a grading request
#[derive(Debug, Error)]
pub enum GradingError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Failed to load image {path:?}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Image not found: {0:?}")]
    ImageNotFound(PathBuf),

    #[error("Answer key is empty")]
    EmptyAnswerKey,

    #[error("Threshold must be in [0.0, 1.0], got {0}")]
    InvalidThreshold(f64),

    #[error(transparent)]
    AnswerKey(#[from] AnswerKeyError),
}

/// Answer key file errors
#[derive(Debug, Error)]
pub enum AnswerKeyError {
    #[error("Failed to read answer key {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Answer key is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported answer key shape: {0}")]
    UnsupportedShape(String),

    #[error("Answer key is empty")]
    Empty,
}

/// Line recognition errors (never fatal to a grading run)
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("ONNX inference failed: {0}")]
    Inference(#[from] ort::Error),

    #[error("Tokenizer failed: {0}")]
    Tokenizer(String),

    #[error("Unexpected model output: {0}")]
    ModelOutput(String),

    #[error("Line image is empty")]
    EmptyLine,
}

/// Result persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Threshold must be in [0.0, 1.0], got {0}")]
    InvalidThreshold(f64),

    #[error("Invalid segmentation config: {0}")]
    InvalidSegmentation(String),

    #[error("Invalid preprocessing config: {0}")]
    InvalidPreprocess(String),

    #[error("Invalid recognizer config: {0}")]
    InvalidRecognizer(String),
}

pub type GradingResult<T> = Result<T, GradingError>;
pub type RecognitionResult<T> = Result<T, RecognitionError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;
