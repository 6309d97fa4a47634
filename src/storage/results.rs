//! Grading record store
//!
//! One pretty-printed JSON file per graded sheet.

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{create_dir, modified_secs, resolve_in, unix_timestamp};
use crate::errors::{PersistenceError, PersistenceResult};
use crate::grading::GradingRecord;

/// Listing entry for a stored record
#[derive(Debug, Clone, Serialize)]
pub struct ResultEntry {
    pub filename: String,
    pub timestamp: u64,
    pub summary: Value,
}

/// Directory of grading records
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Open (and create) a record directory
    pub fn new(dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let dir = dir.into();
        create_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a record under a fresh `result_<ts>_<id>.json` name
    pub fn save(&self, record: &GradingRecord) -> PersistenceResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let filename = format!("result_{}_{}.json", unix_timestamp(), &id[..8]);
        let path = self.dir.join(&filename);

        write_json(&path, record)?;
        debug!("Saved grading record {:?}", path);
        Ok(filename)
    }

    /// All records, newest first
    ///
    /// Files that cannot be read or parsed are skipped.
    pub fn list(&self) -> PersistenceResult<Vec<ResultEntry>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| PersistenceError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut results = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                continue;
            };

            let data = match read_json(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Skipping unreadable record {:?}: {}", path, e);
                    continue;
                }
            };

            let timestamp = entry.metadata().map(|m| modified_secs(&m)).unwrap_or(0);
            results.push(ResultEntry {
                filename,
                timestamp,
                summary: data
                    .get("summary")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            });
        }

        results.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(results)
    }

    /// Load one stored record
    pub fn load(&self, filename: &str) -> PersistenceResult<Value> {
        let path = resolve_in(&self.dir, filename)?;
        read_json(&path)
    }
}

/// Write any serializable value as pretty JSON, creating missing parent directories
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> PersistenceResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir(parent)?;
    }
    std::fs::write(path, content).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json(path: &Path) -> PersistenceResult<Value> {
    let content = std::fs::read_to_string(path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::{MatchResult, Status, Threshold};
    use tempfile::TempDir;

    fn record() -> GradingRecord {
        let threshold = Threshold::default();
        GradingRecord::graded(
            vec![MatchResult {
                question: 1,
                expected: "Paris".to_string(),
                student: "Paris".to_string(),
                similarity: 1.0,
                status: Status::Pass,
                note: None,
            }],
            threshold,
            Some("sheet.png".to_string()),
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();

        let filename = store.save(&record()).unwrap();
        assert!(filename.starts_with("result_") && filename.ends_with(".json"));

        let loaded = store.load(&filename).unwrap();
        assert_eq!(loaded["1"]["expected"], "Paris");
        assert_eq!(loaded["summary"]["passed"], 1);
    }

    #[test]
    fn test_list_includes_summary() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();

        store.save(&record()).unwrap();
        store.save(&record()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|e| e.summary["total_questions"] == 1));
    }

    #[test]
    fn test_load_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();

        assert!(matches!(
            store.load("../config.toml"),
            Err(PersistenceError::InvalidName(_))
        ));
        assert!(matches!(
            store.load("result_0_missing.json"),
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[test]
    fn test_write_json_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("term1").join("sheet1.json");

        write_json(&path, &record()).unwrap();

        let saved = read_json(&path).unwrap();
        assert_eq!(saved["summary"]["total_questions"], 1);
    }

    #[test]
    fn test_store_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("results");
        let store = ResultStore::new(&nested).unwrap();
        assert!(store.dir().is_dir());
    }
}
