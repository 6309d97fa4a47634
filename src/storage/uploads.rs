//! Uploaded sheet store

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{create_dir, modified_secs, resolve_in, sanitize_filename, unix_timestamp};
use crate::errors::{PersistenceError, PersistenceResult};

/// Image types accepted for upload
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff"];

/// Whether a file name carries an accepted image extension
pub fn allowed_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// A sheet written to the upload directory
#[derive(Debug, Clone, Serialize)]
pub struct StoredUpload {
    pub filename: String,
    pub path: PathBuf,
}

/// Listing entry for an uploaded sheet
#[derive(Debug, Clone, Serialize)]
pub struct ImageEntry {
    pub filename: String,
    pub timestamp: u64,
    pub size: u64,
}

/// Directory of uploaded sheets
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    /// Open (and create) an upload directory
    pub fn new(dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let dir = dir.into();
        create_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store uploaded bytes as `<unix-ts>_<sanitized name>`
    pub fn save(&self, original_name: &str, bytes: &[u8]) -> PersistenceResult<StoredUpload> {
        let clean = sanitize_filename(original_name);
        if clean.is_empty() {
            return Err(PersistenceError::InvalidName(original_name.to_string()));
        }
        if !allowed_file(&clean) {
            return Err(PersistenceError::UnsupportedType(clean));
        }

        let timestamp = unix_timestamp();
        let mut filename = format!("{}_{}", timestamp, clean);
        if self.dir.join(&filename).exists() {
            let id = uuid::Uuid::new_v4().simple().to_string();
            filename = format!("{}_{}_{}", timestamp, &id[..8], clean);
        }

        let path = self.dir.join(&filename);
        std::fs::write(&path, bytes).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;

        info!("Stored upload {} ({} bytes)", filename, bytes.len());
        Ok(StoredUpload { filename, path })
    }

    /// Uploaded images, newest first
    pub fn list(&self) -> PersistenceResult<Vec<ImageEntry>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| PersistenceError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut images: Vec<ImageEntry> = entries
            .flatten()
            .filter_map(|entry| {
                let filename = entry.file_name().to_str()?.to_string();
                if !allowed_file(&filename) {
                    return None;
                }
                let metadata = entry.metadata().ok()?;
                metadata.is_file().then(|| ImageEntry {
                    timestamp: modified_secs(&metadata),
                    size: metadata.len(),
                    filename,
                })
            })
            .collect();

        images.sort_by(|a, b| b.filename.cmp(&a.filename));
        debug!("{} uploaded images", images.len());
        Ok(images)
    }

    /// Full path of a stored upload
    pub fn path_of(&self, filename: &str) -> PersistenceResult<PathBuf> {
        resolve_in(&self.dir, filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allowed_file() {
        assert!(allowed_file("scan.PNG"));
        assert!(allowed_file("a.b.tiff"));
        assert!(!allowed_file("scan.gif"));
        assert!(!allowed_file("png"));
    }

    #[test]
    fn test_save_prefixes_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();

        let stored = store.save("quiz 1.jpg", b"fake jpeg").unwrap();
        assert!(stored.filename.ends_with("_quiz_1.jpg"));
        assert!(stored.path.starts_with(dir.path()));
        assert_eq!(std::fs::read(&stored.path).unwrap(), b"fake jpeg");
    }

    #[test]
    fn test_same_name_twice_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();

        let first = store.save("sheet.png", b"one").unwrap();
        let second = store.save("sheet.png", b"two").unwrap();

        assert_ne!(first.filename, second.filename);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"one");
    }

    #[test]
    fn test_rejects_unsupported_type() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();

        assert!(matches!(
            store.save("notes.txt", b"x"),
            Err(PersistenceError::UnsupportedType(_))
        ));
        assert!(matches!(
            store.save("../", b"x"),
            Err(PersistenceError::InvalidName(_))
        ));
    }

    #[test]
    fn test_list_and_path_of() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();

        let stored = store.save("sheet.png", b"12345").unwrap();
        std::fs::write(dir.path().join("readme.md"), "skip").unwrap();

        let images = store.list().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].filename, stored.filename);
        assert_eq!(images[0].size, 5);

        assert_eq!(store.path_of(&stored.filename).unwrap(), stored.path);
        assert!(store.path_of("../sheet.png").is_err());
    }
}
