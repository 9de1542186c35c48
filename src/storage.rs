use crate::backends::CameraSelector;
use crate::config::{CaptureStrategy, StorageConfig};
use crate::error::StorageError;
use crate::frame::FrameData;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const FILE_URI_PREFIX: &str = "file://";

/// Stable reference to a persisted photo
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn from_path(path: &Path) -> Self {
        Self(format!("{}{}", FILE_URI_PREFIX, path.display()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0 == FILE_URI_PREFIX
    }

    /// Local path for `file://` references
    pub fn to_path(&self) -> Option<PathBuf> {
        self.0.strip_prefix(FILE_URI_PREFIX).map(PathBuf::from)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sidecar describing how a photo was taken
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub request_id: u64,
    pub selector: CameraSelector,
    pub strategy: CaptureStrategy,
    pub captured_at: DateTime<Utc>,
}

/// Persistence collaborator for captured photos
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Fresh destination reserved for one capture
    async fn output_for_capture(&self) -> Result<PathBuf, StorageError>;

    /// Reference for a photo a device has written to `path`
    async fn finalize(
        &self,
        path: &Path,
        metadata: &CaptureMetadata,
    ) -> Result<ImageRef, StorageError>;

    /// Write encoded frame bytes to `path` and return their reference
    async fn persist(
        &self,
        path: &Path,
        frame: &FrameData,
        metadata: &CaptureMetadata,
    ) -> Result<ImageRef, StorageError>;

    /// Remove whatever an abandoned capture left at `path`
    async fn discard(&self, path: &Path) -> Result<(), StorageError>;
}

/// Stores photos as `<millis>.jpg` in a single directory
pub struct FileImageStore {
    root: PathBuf,
    save_metadata: bool,
}

impl FileImageStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: PathBuf::from(&config.path),
            save_metadata: config.save_metadata,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_root(&self) -> Result<(), StorageError> {
        if fs::metadata(&self.root).await.is_err() {
            fs::create_dir_all(&self.root)
                .await
                .map_err(|e| StorageError::DirectoryCreation {
                    path: self.root.display().to_string(),
                    source: e,
                })?;
            info!("Created photo directory: {}", self.root.display());
        }
        Ok(())
    }

    /// `<millis>.jpg`, suffixed when two captures land in the same millisecond
    async fn next_photo_path(&self) -> Result<PathBuf, StorageError> {
        self.ensure_root().await?;

        let stem = Utc::now().timestamp_millis().to_string();
        let mut candidate = self.root.join(format!("{}.jpg", stem));
        let mut suffix = 1;
        while fs::metadata(&candidate).await.is_ok() {
            candidate = self.root.join(format!("{}-{}.jpg", stem, suffix));
            suffix += 1;
        }
        Ok(candidate)
    }

    async fn write_metadata(
        &self,
        photo: &Path,
        metadata: &CaptureMetadata,
    ) -> Result<(), StorageError> {
        if !self.save_metadata {
            return Ok(());
        }

        let metadata_json = serde_json::to_string_pretty(metadata)?;
        let metadata_path = photo.with_extension("json");
        fs::write(&metadata_path, metadata_json)
            .await
            .map_err(|e| StorageError::Write {
                path: metadata_path.display().to_string(),
                source: e,
            })?;

        debug!("Saved metadata to {}", metadata_path.display());
        Ok(())
    }
}

#[async_trait]
impl ImageStore for FileImageStore {
    async fn output_for_capture(&self) -> Result<PathBuf, StorageError> {
        self.next_photo_path().await
    }

    async fn finalize(
        &self,
        path: &Path,
        metadata: &CaptureMetadata,
    ) -> Result<ImageRef, StorageError> {
        self.write_metadata(path, metadata).await?;
        Ok(ImageRef::from_path(path))
    }

    async fn persist(
        &self,
        path: &Path,
        frame: &FrameData,
        metadata: &CaptureMetadata,
    ) -> Result<ImageRef, StorageError> {
        fs::write(path, frame.data.as_slice())
            .await
            .map_err(|e| StorageError::Write {
                path: path.display().to_string(),
                source: e,
            })?;

        debug!(
            "Persisted frame {} ({} bytes) to {}",
            frame.id,
            frame.len(),
            path.display()
        );

        self.finalize(path, metadata).await
    }

    async fn discard(&self, path: &Path) -> Result<(), StorageError> {
        for leftover in [path.to_path_buf(), path.with_extension("json")] {
            match fs::remove_file(&leftover).await {
                Ok(()) => debug!("Removed {}", leftover.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StorageError::Remove {
                        path: leftover.display().to_string(),
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }
}
