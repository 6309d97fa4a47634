//! Answer grading
//!
//! Answer keys, similarity scoring and graded-sheet records.

pub mod answer_key;
pub mod matcher;
pub mod report;

pub use answer_key::{AnswerKey, AnswerKeyFile};
pub use matcher::SimilarityMatcher;
pub use report::{GradingRecord, MatchNote, MatchResult, Status, Threshold};
