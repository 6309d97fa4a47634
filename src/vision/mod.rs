//! Vision Layer
//!
//! Everything between a photographed answer sheet and per-line text:
//! - Sheet preprocessing (denoise, grayscale, CLAHE, optional deskew)
//! - Line segmentation by morphology and connected components
//! - Handwriting recognition with TrOCR via ONNX Runtime

pub mod models;
pub mod preprocess;
pub mod recognizer;
pub mod segmentation;

pub use models::{ModelFile, ModelManager, OnnxSession};
pub use preprocess::ImagePreprocessor;
pub use recognizer::{TextRecognizer, TrOcrRecognizer};
pub use segmentation::{LineRegion, LineSegmenter, Segmentation};
