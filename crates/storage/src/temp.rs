//! Temp file store for uploaded videos

use crate::StorageError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Temp store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TempStoreConfig {
    /// Directory for upload files (system temp dir when unset)
    pub dir: Option<PathBuf>,
    /// File name prefix
    pub prefix: String,
    /// File name suffix, kept so decoders can sniff the container
    pub suffix: String,
}

impl Default for TempStoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            prefix: "upload-".to_string(),
            suffix: ".mp4".to_string(),
        }
    }
}

/// Creates scoped temp files for uploads
#[derive(Debug, Clone)]
pub struct TempStore {
    config: TempStoreConfig,
}

impl TempStore {
    /// Create a new temp store
    pub fn new(config: TempStoreConfig) -> Self {
        match &config.dir {
            Some(dir) => info!("Creating temp store in {}", dir.display()),
            None => info!("Creating temp store in system temp dir"),
        }
        Self { config }
    }

    /// Write `bytes` to a fresh temp file
    pub fn acquire(&self, bytes: &[u8]) -> Result<TempVideo, StorageError> {
        if bytes.is_empty() {
            return Err(StorageError::EmptyUpload);
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix(&self.config.prefix).suffix(&self.config.suffix);

        let created = match &self.config.dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        let mut file = created.map_err(|e| StorageError::Create(e.to_string()))?;

        // A failed write drops `file`, which removes it
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|e| StorageError::Write(e.to_string()))?;

        let path = file.path().to_path_buf();
        debug!("Stored {} bytes at {}", bytes.len(), path.display());

        Ok(TempVideo {
            file: Some(file),
            path,
        })
    }
}

impl Default for TempStore {
    fn default() -> Self {
        Self::new(TempStoreConfig::default())
    }
}

/// Uploaded video on disk. Removed by [`TempVideo::release`] or on drop.
#[derive(Debug)]
pub struct TempVideo {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl TempVideo {
    /// Location of the stored video
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the backing file
    pub fn release(mut self) -> Result<(), StorageError> {
        match self.file.take() {
            Some(file) => {
                file.close()
                    .map_err(|e| StorageError::Release(format!("{}: {}", self.path.display(), e)))?;
                debug!("Released {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for TempVideo {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.close() {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> TempStore {
        TempStore::new(TempStoreConfig {
            dir: Some(dir.to_path_buf()),
            ..Default::default()
        })
    }

    #[test]
    fn test_acquire_writes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let video = store.acquire(b"not really a video").unwrap();
        assert!(video.path().starts_with(dir.path()));
        assert_eq!(video.path().extension().unwrap(), "mp4");
        assert_eq!(std::fs::read(video.path()).unwrap(), b"not really a video");
    }

    #[test]
    fn test_release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let video = store_in(dir.path()).acquire(&[1, 2, 3]).unwrap();
        let path = video.path().to_path_buf();

        video.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let video = store_in(dir.path()).acquire(&[1, 2, 3]).unwrap();
            video.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_release_of_vanished_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let video = store_in(dir.path()).acquire(&[1, 2, 3]).unwrap();
        std::fs::remove_file(video.path()).unwrap();

        assert!(matches!(video.release(), Err(StorageError::Release(_))));
    }

    #[test]
    fn test_empty_upload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            store_in(dir.path()).acquire(&[]),
            Err(StorageError::EmptyUpload)
        ));
    }

    #[test]
    fn test_missing_directory_is_create_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir.path().join("missing"));
        assert!(matches!(store.acquire(&[1]), Err(StorageError::Create(_))));
    }
}
