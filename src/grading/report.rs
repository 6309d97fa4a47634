//! Grading results
//!
//! Per-question results, the sheet summary and the JSON record written for
//! each graded sheet.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;

use crate::config::DEFAULT_THRESHOLD;
use crate::errors::{GradingError, GradingResult};

/// Minimum similarity for a pass, always within [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Threshold(f64);

impl Threshold {
    /// Validate a threshold value
    pub fn new(value: f64) -> GradingResult<Self> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(GradingError::InvalidThreshold(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// A score passes when it reaches the threshold (inclusive)
    pub fn passes(&self, score: f64) -> bool {
        score >= self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.0 * 100.0)
    }
}

/// Pass/fail verdict for one question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl Status {
    pub fn from_score(score: f64, threshold: Threshold) -> Self {
        if threshold.passes(score) {
            Self::Pass
        } else {
            Self::Fail
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// Why a question's score is not a plain similarity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchNote {
    /// The recognizer failed on this line; it was graded as blank
    RecognitionFailed { message: String },
    /// The line came from equal-band fallback segmentation
    FallbackSegmentation,
    /// Nothing but stop words or single letters was read
    NoMeaningfulWords,
    /// The answer key has no meaningful words to compare against
    EmptyVocabulary,
    /// The question number has no reference answer
    QuestionOutOfRange { question: usize, total: usize },
}

impl MatchNote {
    /// True for problems with the matcher itself rather than with the input
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::EmptyVocabulary | Self::QuestionOutOfRange { .. })
    }
}

impl fmt::Display for MatchNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecognitionFailed { message } => write!(f, "recognition failed: {}", message),
            Self::FallbackSegmentation => write!(f, "line found by fallback segmentation"),
            Self::NoMeaningfulWords => write!(f, "no meaningful words"),
            Self::EmptyVocabulary => write!(f, "answer key has no meaningful words"),
            Self::QuestionOutOfRange { question, total } => {
                write!(f, "question {} outside key of {}", question, total)
            }
        }
    }
}

/// Result for one question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// 1-based question number
    #[serde(skip)]
    pub question: usize,
    pub expected: String,
    pub student: String,
    pub similarity: f64,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<MatchNote>,
}

/// Sheet-level totals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradingSummary {
    pub total_questions: usize,
    pub passed: usize,
    pub percentage: f64,
    pub threshold: Threshold,
}

impl GradingSummary {
    /// Summarize a set of results; percentage is 0 when nothing was graded
    pub fn from_results(results: &[MatchResult], threshold: Threshold) -> Self {
        let total_questions = results.len();
        let passed = results.iter().filter(|r| r.status.is_pass()).count();
        let percentage = if total_questions > 0 {
            passed as f64 / total_questions as f64 * 100.0
        } else {
            0.0
        };

        Self {
            total_questions,
            passed,
            percentage,
            threshold,
        }
    }
}

/// Complete outcome for one graded sheet
///
/// Serializes to an object with keys `"1".."N"` for the questions followed by
/// `summary`, `success`, `error` (when set) and `image`.
#[derive(Debug, Clone, PartialEq)]
pub struct GradingRecord {
    pub results: Vec<MatchResult>,
    pub summary: Option<GradingSummary>,
    pub success: bool,
    pub error: Option<String>,
    pub image: Option<String>,
}

impl GradingRecord {
    /// Record for a sheet that was graded
    pub fn graded(results: Vec<MatchResult>, threshold: Threshold, image: Option<String>) -> Self {
        let summary = GradingSummary::from_results(&results, threshold);
        Self {
            results,
            summary: Some(summary),
            success: true,
            error: None,
            image,
        }
    }

    /// Record for a sheet that could not be graded
    pub fn failed(error: impl Into<String>, image: Option<String>) -> Self {
        Self {
            results: Vec::new(),
            summary: None,
            success: false,
            error: Some(error.into()),
            image,
        }
    }
}

impl Serialize for GradingRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for result in &self.results {
            map.serialize_entry(&result.question.to_string(), result)?;
        }
        if let Some(summary) = &self.summary {
            map.serialize_entry("summary", summary)?;
        }
        map.serialize_entry("success", &self.success)?;
        if let Some(error) = &self.error {
            map.serialize_entry("error", error)?;
        }
        if let Some(image) = &self.image {
            map.serialize_entry("image", image)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(question: usize, similarity: f64, threshold: Threshold) -> MatchResult {
        MatchResult {
            question,
            expected: format!("expected {}", question),
            student: format!("student {}", question),
            similarity,
            status: Status::from_score(similarity, threshold),
            note: None,
        }
    }

    #[test]
    fn test_threshold_validation() {
        assert!(Threshold::new(0.0).is_ok());
        assert!(Threshold::new(1.0).is_ok());
        assert!(matches!(Threshold::new(1.01), Err(GradingError::InvalidThreshold(_))));
        assert!(Threshold::new(-0.5).is_err());
        assert!(Threshold::new(f64::NAN).is_err());
    }

    #[test]
    fn test_pass_is_inclusive() {
        for t in [0.0, 0.25, 0.5, 0.7, 1.0] {
            let threshold = Threshold::new(t).unwrap();
            assert_eq!(Status::from_score(t, threshold), Status::Pass);
            if t > 0.0 {
                assert_eq!(Status::from_score(t - 1e-6, threshold), Status::Fail);
            }
        }
    }

    #[test]
    fn test_summary_percentage() {
        let threshold = Threshold::default();
        let results = vec![
            result(1, 0.9, threshold),
            result(2, 0.1, threshold),
            result(3, 0.75, threshold),
            result(4, 0.3, threshold),
        ];

        let summary = GradingSummary::from_results(&results, threshold);
        assert_eq!(summary.total_questions, 4);
        assert_eq!(summary.passed, 2);
        assert!((summary.percentage - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_of_nothing() {
        let summary = GradingSummary::from_results(&[], Threshold::default());
        assert_eq!(summary.total_questions, 0);
        assert_eq!(summary.percentage, 0.0);
    }

    #[test]
    fn test_record_json_layout() {
        let threshold = Threshold::new(0.5).unwrap();
        let mut second = result(2, 0.0, threshold);
        second.note = Some(MatchNote::NoMeaningfulWords);

        let record = GradingRecord::graded(
            vec![result(1, 1.0, threshold), second],
            threshold,
            Some("sheet.png".to_string()),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["1"]["status"], "PASS");
        assert_eq!(json["1"]["similarity"], 1.0);
        assert!(json["1"].get("note").is_none());
        assert_eq!(json["2"]["status"], "FAIL");
        assert_eq!(json["2"]["note"]["kind"], "no_meaningful_words");
        assert_eq!(json["summary"]["total_questions"], 2);
        assert_eq!(json["summary"]["passed"], 1);
        assert_eq!(json["summary"]["threshold"], 0.5);
        assert_eq!(json["success"], true);
        assert_eq!(json["image"], "sheet.png");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failed_record() {
        let record = GradingRecord::failed("Image not found", None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Image not found");
        assert!(json.get("summary").is_none());
    }

    #[test]
    fn test_note_classification() {
        assert!(MatchNote::EmptyVocabulary.is_fault());
        assert!(!MatchNote::NoMeaningfulWords.is_fault());
        assert!(!MatchNote::RecognitionFailed { message: "x".into() }.is_fault());
    }
}
