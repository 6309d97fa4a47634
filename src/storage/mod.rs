//! Storage Layer
//!
//! Application directories plus the file-backed stores for uploaded sheets
//! and grading records. Everything lives in plain files; there is no database.

pub mod results;
pub mod uploads;

pub use results::ResultStore;
pub use uploads::UploadStore;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{PersistenceError, PersistenceResult};

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "sheetgrader", "SheetGrader")
        .ok_or_else(|| anyhow::anyhow!("Could not determine application directories"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Seconds since the Unix epoch
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Reduce a user-supplied file name to a safe single path component
///
/// Keeps ASCII letters, digits, `_`, `-` and `.`; whitespace and path
/// separators become `_`; leading and trailing dots and underscores are
/// trimmed. May return an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let spaced: String = name
        .chars()
        .filter(|c| c.is_ascii())
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");

    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();

    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Resolve a stored file name inside `dir`, refusing anything that is not a plain name
pub(crate) fn resolve_in(dir: &Path, name: &str) -> PersistenceResult<PathBuf> {
    let clean = sanitize_filename(name);
    if clean.is_empty() || clean != name {
        return Err(PersistenceError::InvalidName(name.to_string()));
    }

    let path = dir.join(&clean);
    if !path.is_file() {
        return Err(PersistenceError::NotFound(clean));
    }
    Ok(path)
}

/// Modification time of a file in Unix seconds
pub(crate) fn modified_secs(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn create_dir(dir: &Path) -> PersistenceResult<()> {
    std::fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Sheet.png"), "My_Sheet.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("C:\\uploads\\scan 1.JPG"), "C_uploads_scan_1.JPG");
        assert_eq!(sanitize_filename("résumé.jpg"), "rsum.jpg");
        assert_eq!(sanitize_filename("..."), "");
        assert_eq!(sanitize_filename("a;b|c.png"), "abc.png");
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            resolve_in(dir.path(), "../secret.json"),
            Err(PersistenceError::InvalidName(_))
        ));
        assert!(matches!(
            resolve_in(dir.path(), ""),
            Err(PersistenceError::InvalidName(_))
        ));
    }

    #[test]
    fn test_resolve_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("result_1.json"), "{}").unwrap();

        assert_eq!(
            resolve_in(dir.path(), "result_1.json").unwrap(),
            dir.path().join("result_1.json")
        );
        assert!(matches!(
            resolve_in(dir.path(), "result_2.json"),
            Err(PersistenceError::NotFound(_))
        ));
    }
}
