//! Model artifact and metadata storage.
//!
//! The registry only needs four operations from storage, expressed by the
//! [`ModelStorage`] trait. [`LocalModelStorage`] keeps one directory per
//! version:
//!
//! ```text
//! <model_dir>/
//!   v1/
//!     model.pkl
//!     metadata.json
//!   v2/
//!     model.h5
//!     metadata.json
//! ```

use crate::compute::{ArtifactFormat, ModelMetadata};
use crate::error::{Result, ServeError};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the metadata document inside a version directory.
pub const METADATA_FILE: &str = "metadata.json";

/// File stem of the artifact inside a version directory.
pub const ARTIFACT_STEM: &str = "model";

/// Artifact bytes with their declared format.
#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    pub format: ArtifactFormat,
    pub bytes: Vec<u8>,
}

impl ArtifactUpload {
    pub fn new(format: ArtifactFormat, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            format,
            bytes: bytes.into(),
        }
    }
}

/// Resolves versions to artifact and metadata locations.
#[async_trait]
pub trait ModelStorage: Send + Sync {
    /// All versions with an artifact, sorted.
    async fn list_versions(&self) -> Result<Vec<String>>;

    /// Path of the artifact for `version`.
    async fn artifact_path(&self, version: &str) -> Result<PathBuf>;

    /// Path of the metadata document for `version`.
    async fn metadata_path(&self, version: &str) -> Result<PathBuf>;

    /// Persists an artifact and its metadata, replacing any previous ones.
    async fn save_model(
        &self,
        version: &str,
        artifact: &ArtifactUpload,
        metadata: &ModelMetadata,
    ) -> Result<()>;
}

/// Rejects version names that cannot be used as a single path component.
pub fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version == "." || version == ".." {
        return Err(ServeError::Validation(format!(
            "invalid model version '{}'",
            version
        )));
    }
    if version.contains(['/', '\\']) || version.contains('\0') {
        return Err(ServeError::Validation(format!(
            "model version '{}' contains a path separator",
            version
        )));
    }
    Ok(())
}

/// Filesystem storage rooted at a model directory.
#[derive(Debug, Clone)]
pub struct LocalModelStorage {
    root: PathBuf,
}

impl LocalModelStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, version: &str) -> Result<PathBuf> {
        validate_version(version)?;
        Ok(self.root.join(version))
    }

    /// Finds `model.*` in a version directory. The lexically first one wins
    /// if there are several.
    async fn find_artifact(dir: &Path) -> Result<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut found: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_artifact = path.file_stem().and_then(|s| s.to_str()) == Some(ARTIFACT_STEM)
                && path.extension().is_some();
            if is_artifact
                && entry.file_type().await?.is_file()
                && found.as_ref().map_or(true, |f| path < *f)
            {
                found = Some(path);
            }
        }
        Ok(found)
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ServeError::Storage(format!("invalid path {}", path.display())))?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ServeError::Storage(format!(
                "failed to move {} into place: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ModelStorage for LocalModelStorage {
    async fn list_versions(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Self::find_artifact(&entry.path()).await?.is_some() {
                versions.push(name);
            }
        }

        versions.sort();
        Ok(versions)
    }

    async fn artifact_path(&self, version: &str) -> Result<PathBuf> {
        let dir = self.version_dir(version)?;
        Self::find_artifact(&dir)
            .await?
            .ok_or_else(|| ServeError::ArtifactNotFound(format!("no artifact for version {}", version)))
    }

    async fn metadata_path(&self, version: &str) -> Result<PathBuf> {
        let path = self.version_dir(version)?.join(METADATA_FILE);
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(ServeError::ArtifactNotFound(format!(
                "no metadata for version {}",
                version
            )))
        }
    }

    async fn save_model(
        &self,
        version: &str,
        artifact: &ArtifactUpload,
        metadata: &ModelMetadata,
    ) -> Result<()> {
        let dir = self.version_dir(version)?;
        tokio::fs::create_dir_all(&dir).await?;

        let artifact_path = dir.join(format!("{}.{}", ARTIFACT_STEM, artifact.format.extension()));
        Self::write_atomic(&artifact_path, &artifact.bytes).await?;

        let metadata_bytes = serde_json::to_vec_pretty(metadata)?;
        Self::write_atomic(&dir.join(METADATA_FILE), &metadata_bytes).await?;

        // Drop artifacts of other formats left by earlier saves
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path != artifact_path
                && path.file_stem().and_then(|s| s.to_str()) == Some(ARTIFACT_STEM)
            {
                debug!(version, path = %path.display(), "Removing stale artifact");
                tokio::fs::remove_file(&path).await?;
            }
        }

        debug!(version, format = %artifact.format, bytes = artifact.bytes.len(), "Saved model");
        Ok(())
    }
}
