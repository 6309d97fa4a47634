//! Grading pipeline
//!
//! Runs one sheet through preprocessing, line segmentation, recognition and
//! matching. Line *i* (top to bottom) is graded against answer *i*; whichever
//! side is longer gets truncated.

use image::DynamicImage;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AnswerKeyError, GradingError, GradingResult};
use crate::grading::{AnswerKey, GradingRecord, MatchNote, MatchResult, SimilarityMatcher, Status, Threshold};
use crate::vision::{ImagePreprocessor, LineRegion, LineSegmenter, Segmentation, TextRecognizer};

/// Pipeline stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loaded,
    Segmented,
    Recognized,
    Matched,
    Summarized,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Loaded => "loaded",
            Stage::Segmented => "segmented",
            Stage::Recognized => "recognized",
            Stage::Matched => "matched",
            Stage::Summarized => "summarized",
        };
        f.write_str(name)
    }
}

/// Text read from one line of the sheet
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedLine {
    pub region: LineRegion,
    pub text: String,
    /// Set when the line is degraded (recognizer failure or fallback band)
    pub note: Option<MatchNote>,
}

/// All lines read from a sheet, top to bottom
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub lines: Vec<ExtractedLine>,
    pub used_fallback: bool,
}

/// Sheet grading pipeline
///
/// Cheap to share: configuration is immutable and the recognizer serializes
/// access to its model sessions internally.
#[derive(Clone)]
pub struct GradingPipeline {
    preprocessor: ImagePreprocessor,
    segmenter: LineSegmenter,
    recognizer: Arc<dyn TextRecognizer>,
    skip_blank_lines: bool,
}

impl GradingPipeline {
    /// Build a pipeline from configuration and a recognizer backend
    pub fn new(config: &AppConfig, recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self {
            preprocessor: ImagePreprocessor::new(config.preprocess.clone()),
            segmenter: LineSegmenter::new(config.segmentation.clone()),
            recognizer,
            skip_blank_lines: config.grading.skip_blank_lines,
        }
    }

    /// Open an image file
    pub fn load_image(path: &Path) -> GradingResult<DynamicImage> {
        if !path.is_file() {
            return Err(GradingError::ImageNotFound(path.to_path_buf()));
        }
        image::open(path).map_err(|source| GradingError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read every line of a sheet
    ///
    /// A line the recognizer fails on comes back blank with a note; it never
    /// fails the sheet.
    pub fn extract_text(&self, image: &DynamicImage) -> GradingResult<Extraction> {
        let enhanced = self.preprocessor.preprocess(image)?;
        log_stage(Stage::Loaded, format_args!("{}x{}", enhanced.width(), enhanced.height()));

        let segmentation = self.segmenter.detect_lines(&enhanced);
        log_stage(
            Stage::Segmented,
            format_args!(
                "{} regions (fallback: {})",
                segmentation.regions.len(),
                segmentation.used_fallback
            ),
        );

        let crops = self.segmenter.crop_lines(&enhanced, &segmentation.regions);
        let mut lines = Vec::with_capacity(crops.len());

        for (i, (region, crop)) in segmentation.regions.iter().zip(crops).enumerate() {
            let rgb = DynamicImage::ImageLuma8(crop).to_rgb8();
            let (text, mut note) = match self.recognizer.recognize(&rgb) {
                Ok(text) => (text, None),
                Err(e) => {
                    warn!("Recognition failed on line {}: {}", i + 1, e);
                    (
                        String::new(),
                        Some(MatchNote::RecognitionFailed {
                            message: e.to_string(),
                        }),
                    )
                }
            };
            if note.is_none() && segmentation.used_fallback {
                note = Some(MatchNote::FallbackSegmentation);
            }

            debug!("Line {} [{}..{}]: {:?}", i + 1, region.start, region.end, text);
            lines.push(ExtractedLine {
                region: *region,
                text,
                note,
            });
        }

        if self.skip_blank_lines {
            let before = lines.len();
            lines.retain(|line| !line.text.trim().is_empty());
            if lines.len() < before {
                debug!("Dropped {} blank lines", before - lines.len());
            }
        }

        log_stage(Stage::Recognized, format_args!("{} lines", lines.len()));

        Ok(Extraction {
            lines,
            used_fallback: segmentation.used_fallback,
        })
    }

    /// Load and grade a sheet from disk; the record names the image path
    pub fn grade_path(
        &self,
        path: &Path,
        key: &AnswerKey,
        threshold: Threshold,
    ) -> GradingResult<GradingRecord> {
        let image = Self::load_image(path)?;
        self.grade_image(&image, key, threshold, Some(path.display().to_string()))
    }

    /// Validate raw request input, then grade the sheet stored at `path`
    ///
    /// A sheet that exists but cannot be processed gives a failed record
    /// instead of an error.
    pub fn grade_answers(
        &self,
        path: &Path,
        answers: Vec<String>,
        threshold: f64,
        image_name: String,
    ) -> GradingResult<GradingRecord> {
        let threshold = Threshold::new(threshold)?;
        let key = AnswerKey::new(answers).map_err(|e| match e {
            AnswerKeyError::Empty => GradingError::EmptyAnswerKey,
            other => GradingError::AnswerKey(other),
        })?;

        let graded = Self::load_image(path)
            .and_then(|image| self.grade_image(&image, &key, threshold, Some(image_name.clone())));

        match graded {
            Err(e @ (GradingError::ImageLoad { .. } | GradingError::InvalidImage(_))) => {
                warn!("Failed to process image {}: {}", image_name, e);
                Ok(GradingRecord::failed(
                    format!("Failed to process image: {}", e),
                    Some(image_name),
                ))
            }
            other => other,
        }
    }

    fn grade_image(
        &self,
        image: &DynamicImage,
        key: &AnswerKey,
        threshold: Threshold,
        image_name: Option<String>,
    ) -> GradingResult<GradingRecord> {
        let start = Instant::now();
        let extraction = self.extract_text(image)?;

        let results = grade_lines(&extraction.lines, key, threshold);
        log_stage(Stage::Matched, format_args!("{} questions", results.len()));

        let record = GradingRecord::graded(results, threshold, image_name);
        if let Some(summary) = &record.summary {
            info!(
                "Graded sheet: {}/{} passed ({:.1}%) in {:?}",
                summary.passed,
                summary.total_questions,
                summary.percentage,
                start.elapsed()
            );
        }
        log_stage(Stage::Summarized, format_args!("success: {}", record.success));

        Ok(record)
    }
}

/// Grade extracted lines against a key, aligned by position
pub fn grade_lines(lines: &[ExtractedLine], key: &AnswerKey, threshold: Threshold) -> Vec<MatchResult> {
    let total = lines.len().min(key.len());
    if lines.len() != key.len() {
        debug!(
            "{} lines read for {} answers; grading the first {}",
            lines.len(),
            key.len(),
            total
        );
    }

    let matcher = SimilarityMatcher::new(key.clone(), threshold);

    lines
        .iter()
        .zip(key.answers())
        .take(total)
        .enumerate()
        .map(|(i, (line, expected))| {
            let outcome = matcher.evaluate_against(&line.text, i);
            let similarity = outcome.score();
            let note = match &line.note {
                Some(MatchNote::RecognitionFailed { .. }) => line.note.clone(),
                _ => outcome.note().or_else(|| line.note.clone()),
            };
            if let Some(fault) = note.as_ref().filter(|n| n.is_fault()) {
                warn!("Question {}: {}", i + 1, fault);
            }

            MatchResult {
                question: i + 1,
                expected: expected.clone(),
                student: line.text.clone(),
                similarity,
                status: Status::from_score(similarity, threshold),
                note,
            }
        })
        .collect()
}

/// Preprocess and segment a sheet without recognizing it
pub fn detect_regions(config: &AppConfig, image: &DynamicImage) -> GradingResult<Segmentation> {
    let enhanced = ImagePreprocessor::new(config.preprocess.clone()).preprocess(image)?;
    Ok(LineSegmenter::new(config.segmentation.clone()).detect_lines(&enhanced))
}

fn log_stage(stage: Stage, detail: fmt::Arguments<'_>) {
    debug!("[{}] {}", stage, detail);
}
