//! Answer similarity scoring
//!
//! Answers are compared on their meaningful words only. Both sides are reduced
//! to character 2- and 3-grams, weighted with TF-IDF fitted on the answer key,
//! and scored by cosine similarity. Character n-grams tolerate the spelling
//! slips a handwriting recognizer makes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::answer_key::AnswerKey;
use super::report::{MatchNote, Threshold};

/// Words that carry no answer content
///
/// Articles, prepositions, auxiliaries and conjunctions, plus every single
/// letter (stray marks often come back from the recognizer as one letter).
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "her", "his",
    "i", "if", "in", "into", "is", "it", "its", "of", "on", "or", "that", "the", "to", "was",
    "we", "which", "who", "will", "with", "you", "your", "can", "could", "would", "should",
    "may", "might", "must", "do", "does", "did", "have", "had", "been", "being", "having",
    "all", "each", "every", "both", "few", "more", "most", "other", "same", "such", "no",
    "nor", "not", "only", "so", "than", "too", "very", "also", "up", "out", "about",
    "q", "b", "c", "d", "e", "f", "g", "h", "j", "k", "l", "m", "n", "o", "p", "r", "s", "t",
    "u", "v", "w", "x", "y", "z",
];

/// Smallest and largest character n-gram
const NGRAM_RANGE: (usize, usize) = (2, 3);
/// Vocabulary cap
const MAX_FEATURES: usize = 500;

fn stop_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

/// Lowercase, drop stop words and one-character tokens, rejoin with single spaces
///
/// Applying the filter twice gives the same result as applying it once.
pub fn filter_meaningful_words(text: &str) -> String {
    let lowered = text.to_lowercase();
    let words = stop_words();
    lowered
        .split_whitespace()
        .filter(|word| word.chars().count() > 1 && !words.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character n-grams of a document, whitespace runs collapsed to one space
fn char_ngrams(text: &str, min_n: usize, max_n: usize) -> Vec<String> {
    let chars: Vec<char> = collapse_whitespace(&text.to_lowercase()).chars().collect();
    let mut grams = Vec::new();
    for n in min_n..=max_n {
        if chars.len() < n {
            continue;
        }
        for window in chars.windows(n) {
            grams.push(window.iter().collect());
        }
    }
    grams
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// TF-IDF vectorizer over character n-grams
///
/// Fitted once; candidates are projected into the fitted vocabulary and
/// n-grams outside it are ignored.
#[derive(Debug, Clone)]
pub struct CharNgramTfidf {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    ngram_range: (usize, usize),
}

impl CharNgramTfidf {
    /// Fit on a corpus; `None` when the corpus yields no n-gram at all
    pub fn fit(documents: &[String], ngram_range: (usize, usize), max_features: usize) -> Option<Self> {
        let (min_n, max_n) = ngram_range;

        let mut corpus_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for doc in documents {
            let grams = char_ngrams(doc, min_n, max_n);
            let mut seen = HashSet::new();
            for gram in grams {
                if seen.insert(gram.clone()) {
                    *doc_freq.entry(gram.clone()).or_insert(0) += 1;
                }
                *corpus_counts.entry(gram).or_insert(0) += 1;
            }
        }

        if corpus_counts.is_empty() {
            return None;
        }

        // Most frequent first, alphabetical among equals (BTreeMap order + stable sort)
        let mut ranked: Vec<(String, usize)> = corpus_counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(max_features.max(1));

        let mut terms: Vec<String> = ranked.into_iter().map(|(term, _)| term).collect();
        terms.sort();

        let n_docs = documents.len() as f64;
        let idf = terms
            .iter()
            .map(|term| {
                let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
                ((1.0 + n_docs) / (1.0 + df)).ln() + 1.0
            })
            .collect();

        let vocabulary = terms
            .into_iter()
            .enumerate()
            .map(|(i, term)| (term, i))
            .collect();

        Some(Self {
            vocabulary,
            idf,
            ngram_range,
        })
    }

    /// Number of retained n-grams
    pub fn vocabulary_size(&self) -> usize {
        self.idf.len()
    }

    /// Dense, L2-normalized TF-IDF vector (all zeros when nothing is in vocabulary)
    pub fn transform(&self, document: &str) -> Vec<f64> {
        let mut vector = vec![0.0; self.idf.len()];
        for gram in char_ngrams(document, self.ngram_range.0, self.ngram_range.1) {
            if let Some(&index) = self.vocabulary.get(&gram) {
                vector[index] += 1.0;
            }
        }

        for (value, idf) in vector.iter_mut().zip(&self.idf) {
            *value *= idf;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }

        vector
    }
}

/// Cosine similarity of two L2-normalized vectors, clamped to [0, 1]
fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    if dot.is_finite() {
        dot.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Result of scoring one candidate, telling degraded input apart from faults
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    /// A real similarity in [0, 1]
    Scored(f64),
    /// The input carried nothing to compare; score is 0
    Degraded(MatchNote),
    /// The matcher could not score; score is 0
    Fault(MatchNote),
}

impl ScoreOutcome {
    /// Similarity, 0.0 for anything but `Scored`
    pub fn score(&self) -> f64 {
        match self {
            Self::Scored(score) => *score,
            Self::Degraded(_) | Self::Fault(_) => 0.0,
        }
    }

    /// Explanation for a non-scored outcome
    pub fn note(&self) -> Option<MatchNote> {
        match self {
            Self::Scored(_) => None,
            Self::Degraded(note) | Self::Fault(note) => Some(note.clone()),
        }
    }
}

/// Scores candidate answers against a fixed answer key
#[derive(Debug, Clone)]
pub struct SimilarityMatcher {
    key: AnswerKey,
    threshold: Threshold,
    vectorizer: Option<CharNgramTfidf>,
    references: Vec<Vec<f64>>,
}

impl SimilarityMatcher {
    /// Fit the vectorizer on the filtered answer key
    pub fn new(key: AnswerKey, threshold: Threshold) -> Self {
        let filtered: Vec<String> = key
            .answers()
            .iter()
            .map(|answer| filter_meaningful_words(answer))
            .collect();

        let vectorizer = CharNgramTfidf::fit(&filtered, NGRAM_RANGE, MAX_FEATURES);
        let references = match &vectorizer {
            Some(v) => {
                debug!(
                    "Fitted {} character n-grams over {} answers",
                    v.vocabulary_size(),
                    key.len()
                );
                filtered.iter().map(|doc| v.transform(doc)).collect()
            }
            None => {
                warn!("Answer key has no meaningful words; every answer will score 0");
                Vec::new()
            }
        };

        Self {
            key,
            threshold,
            vectorizer,
            references,
        }
    }

    /// Best similarity against any reference answer
    pub fn score(&self, candidate: &str) -> f64 {
        self.evaluate(candidate).score()
    }

    /// Similarity against the reference at 0-based `index`
    pub fn score_against(&self, candidate: &str, index: usize) -> f64 {
        self.evaluate_against(candidate, index).score()
    }

    /// Whether the best similarity meets the threshold
    pub fn is_correct(&self, candidate: &str) -> bool {
        self.threshold.passes(self.score(candidate))
    }

    /// Best similarity against any reference, with the reason when it is not a real score
    pub fn evaluate(&self, candidate: &str) -> ScoreOutcome {
        let vector = match self.project(candidate) {
            Ok(vector) => vector,
            Err(outcome) => return outcome,
        };

        let best = self
            .references
            .iter()
            .map(|reference| cosine(&vector, reference))
            .fold(0.0, f64::max);

        ScoreOutcome::Scored(best)
    }

    /// Similarity against the reference at 0-based `index`, with the reason when it is not a real score
    pub fn evaluate_against(&self, candidate: &str, index: usize) -> ScoreOutcome {
        if index >= self.key.len() {
            return ScoreOutcome::Fault(MatchNote::QuestionOutOfRange {
                question: index + 1,
                total: self.key.len(),
            });
        }

        let vector = match self.project(candidate) {
            Ok(vector) => vector,
            Err(outcome) => return outcome,
        };

        match self.references.get(index) {
            Some(reference) => ScoreOutcome::Scored(cosine(&vector, reference)),
            None => ScoreOutcome::Fault(MatchNote::EmptyVocabulary),
        }
    }

    fn project(&self, candidate: &str) -> Result<Vec<f64>, ScoreOutcome> {
        let Some(vectorizer) = &self.vectorizer else {
            return Err(ScoreOutcome::Fault(MatchNote::EmptyVocabulary));
        };

        let filtered = filter_meaningful_words(candidate);
        if filtered.is_empty() {
            return Err(ScoreOutcome::Degraded(MatchNote::NoMeaningfulWords));
        }

        Ok(vectorizer.transform(&filtered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(answers: &[&str]) -> SimilarityMatcher {
        let key = AnswerKey::new(answers.iter().copied()).unwrap();
        SimilarityMatcher::new(key, Threshold::default())
    }

    #[test]
    fn test_filter_meaningful_words() {
        assert_eq!(
            filter_meaningful_words("The Mitochondria is   the powerhouse of a cell"),
            "mitochondria powerhouse cell"
        );
        assert_eq!(filter_meaningful_words("a b c x"), "");
        assert_eq!(filter_meaningful_words(""), "");
    }

    #[test]
    fn test_filter_is_idempotent() {
        for text in [
            "Photosynthesis converts light into chemical energy",
            "Q1. The answer is B",
            "  lots\tof   whitespace\n here ",
            "Water boils at 100 degrees",
        ] {
            let once = filter_meaningful_words(text);
            assert_eq!(filter_meaningful_words(&once), once);
        }
    }

    #[test]
    fn test_char_ngrams() {
        let grams = char_ngrams("ab  cd", 2, 3);
        assert_eq!(grams, vec!["ab", "b ", " c", "cd", "ab ", "b c", " cd"]);
    }

    #[test]
    fn test_identical_answer_scores_one() {
        let m = matcher(&["Mitochondria are the powerhouse of the cell"]);
        let score = m.score("Mitochondria are the powerhouse of the cell");
        assert!((score - 1.0).abs() < 1e-9, "score was {}", score);
        assert!(m.is_correct("Mitochondria are the powerhouse of the cell"));
    }

    #[test]
    fn test_unrelated_answer_scores_near_zero() {
        let m = matcher(&["Photosynthesis converts light into chemical energy"]);
        let score = m.score("Blank");
        assert!(score < 0.1, "score was {}", score);
        assert!(!m.is_correct("Blank"));
    }

    #[test]
    fn test_stop_words_do_not_affect_score() {
        let m = matcher(&["mitochondria powerhouse cell"]);
        let with_fillers = m.score("The mitochondria is the powerhouse of the cell");
        assert!((with_fillers - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_misspelling_keeps_partial_credit() {
        let m = matcher(&["Photosynthesis converts light into chemical energy"]);
        let score = m.score("Photosynthesls converts lignt into chemical energy");
        assert!(score > 0.7 && score < 1.0, "score was {}", score);
    }

    #[test]
    fn test_scores_stay_in_unit_range() {
        let m = matcher(&["Newton's second law", "Force equals mass times acceleration", "Gravity"]);
        for candidate in ["", "force", "gravity gravity gravity", "zzzz qqqq", "Newton law force"] {
            let score = m.score(candidate);
            assert!((0.0..=1.0).contains(&score), "{} scored {}", candidate, score);
        }
    }

    #[test]
    fn test_score_against_picks_one_reference() {
        let m = matcher(&["capital city paris", "largest ocean pacific"]);
        assert!(m.score_against("pacific ocean", 1) > m.score_against("pacific ocean", 0));
        assert!(m.score("pacific ocean") >= m.score_against("pacific ocean", 1));
    }

    #[test]
    fn test_out_of_range_index_is_fault() {
        let m = matcher(&["only answer"]);
        assert_eq!(m.score_against("only answer", 5), 0.0);
        assert!(matches!(
            m.evaluate_against("only answer", 5),
            ScoreOutcome::Fault(MatchNote::QuestionOutOfRange { question: 6, total: 1 })
        ));
    }

    #[test]
    fn test_blank_candidate_is_degraded() {
        let m = matcher(&["chlorophyll"]);
        assert_eq!(m.evaluate("   "), ScoreOutcome::Degraded(MatchNote::NoMeaningfulWords));
        assert_eq!(m.evaluate("the of a"), ScoreOutcome::Degraded(MatchNote::NoMeaningfulWords));
    }

    #[test]
    fn test_key_of_only_stop_words_is_fault() {
        let m = matcher(&["the", "a of"]);
        assert_eq!(m.score("the"), 0.0);
        assert_eq!(m.evaluate("anything"), ScoreOutcome::Fault(MatchNote::EmptyVocabulary));
    }

    #[test]
    fn test_vocabulary_is_capped() {
        let docs: Vec<String> = (0..200)
            .map(|i| format!("word{:03} token{:03} sample{:03}", i, i * 7, i * 13))
            .collect();
        let vectorizer = CharNgramTfidf::fit(&docs, NGRAM_RANGE, MAX_FEATURES).unwrap();
        assert_eq!(vectorizer.vocabulary_size(), MAX_FEATURES);
    }

    #[test]
    fn test_idf_weights_rare_ngrams_higher() {
        let docs = vec!["aa".to_string(), "aa bb".to_string()];
        let vectorizer = CharNgramTfidf::fit(&docs, (2, 2), 10).unwrap();

        let aa = vectorizer.idf[vectorizer.vocabulary["aa"]];
        let bb = vectorizer.idf[vectorizer.vocabulary["bb"]];
        // df(aa) = 2 -> ln(3/3) + 1; df(bb) = 1 -> ln(3/2) + 1
        assert!((aa - 1.0).abs() < 1e-12);
        assert!((bb - ((1.5f64).ln() + 1.0)).abs() < 1e-12);
    }
}
