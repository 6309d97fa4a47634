//! Answer keys
//!
//! An answer key is the ordered list of reference answers for one sheet.
//! Question numbers are 1-based positions in the list.

use serde_json::Value;
use std::path::Path;
use tracing::debug;

use crate::errors::AnswerKeyError;

/// Ordered, non-empty reference answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerKey {
    answers: Vec<String>,
}

impl AnswerKey {
    /// Build a key from reference answers (must not be empty)
    pub fn new<I, S>(answers: I) -> Result<Self, AnswerKeyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let answers: Vec<String> = answers.into_iter().map(Into::into).collect();
        if answers.is_empty() {
            return Err(AnswerKeyError::Empty);
        }
        Ok(Self { answers })
    }

    /// Load a key from a JSON file (a list, or an object with an `answers` list)
    pub fn load(path: &Path) -> Result<Self, AnswerKeyError> {
        let content = std::fs::read_to_string(path).map_err(|source| AnswerKeyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let key = Self::from_json(&content)?;
        debug!("Loaded {} answers from {:?}", key.len(), path);
        Ok(key)
    }

    /// Parse a key from JSON text
    pub fn from_json(json: &str) -> Result<Self, AnswerKeyError> {
        let value: Value = serde_json::from_str(json)?;
        AnswerKeyFile::from_value(value)?.into_key()
    }

    /// Number of questions
    pub fn len(&self) -> usize {
        self.answers.len()
    }

    /// All answers in question order
    pub fn answers(&self) -> &[String] {
        &self.answers
    }
}

/// Accepted answer-key file layouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerKeyFile {
    /// `["answer one", "answer two"]`
    List(Vec<String>),
    /// `{"answers": ["answer one", "answer two"], ...}`
    Object { answers: Vec<String> },
}

impl AnswerKeyFile {
    /// Classify a parsed JSON document
    pub fn from_value(value: Value) -> Result<Self, AnswerKeyError> {
        let shape = describe(&value);
        match value {
            Value::Array(_) => serde_json::from_value::<Vec<String>>(value)
                .map(Self::List)
                .map_err(|_| {
                    AnswerKeyError::UnsupportedShape("list entries must all be strings".to_string())
                }),
            Value::Object(mut map) => match map.remove("answers") {
                Some(answers @ Value::Array(_)) => {
                    let answers: Vec<String> = serde_json::from_value(answers).map_err(|_| {
                        AnswerKeyError::UnsupportedShape(
                            "\"answers\" entries must all be strings".to_string(),
                        )
                    })?;
                    Ok(Self::Object { answers })
                }
                Some(other) => Err(AnswerKeyError::UnsupportedShape(format!(
                    "\"answers\" must be a list, found {}",
                    describe(&other)
                ))),
                None => Err(AnswerKeyError::UnsupportedShape(
                    "object without an \"answers\" list".to_string(),
                )),
            },
            _ => Err(AnswerKeyError::UnsupportedShape(shape)),
        }
    }

    /// Turn the file contents into a validated key
    pub fn into_key(self) -> Result<AnswerKey, AnswerKeyError> {
        match self {
            Self::List(answers) | Self::Object { answers } => AnswerKey::new(answers),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
    .to_string()
}
