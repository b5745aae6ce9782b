//! Local directory-backed artifact cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use stratum_core::artifact::{ArtifactRef, ArtifactStore, CacheError, CacheKey};
use stratum_core::element::ElementRef;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::tree::{copy_tree, tree_size};

const METADATA_FILE: &str = "artifact.json";
const FILES_DIR: &str = "files";

/// Metadata stored next to an artifact's files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactMetadata {
    element: ElementRef,
    created_at: DateTime<Utc>,
}

/// An artifact cache rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalCache {
    name: String,
    root: PathBuf,
}

impl LocalCache {
    /// Open (creating if needed) a cache at `root`.
    ///
    /// Staging directories left behind by an earlier process are removed.
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache = Self {
            name: name.into(),
            root: root.into(),
        };

        fs::create_dir_all(cache.cas_dir())
            .await
            .map_err(|e| CacheError::from_io("create cache directory", e))?;

        let tmp = cache.tmp_dir();
        if fs::try_exists(&tmp).await.unwrap_or(false) {
            fs::remove_dir_all(&tmp)
                .await
                .map_err(|e| CacheError::from_io("clear staging area", e))?;
        }
        fs::create_dir_all(&tmp)
            .await
            .map_err(|e| CacheError::from_io("create staging area", e))?;

        info!(cache = %cache.name, root = %cache.root.display(), "Opened artifact cache");
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cas_dir(&self) -> PathBuf {
        self.root.join("cas")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn artifact_dir(&self, key: &CacheKey) -> PathBuf {
        self.cas_dir().join(key.as_str())
    }

    /// Start assembling a new artifact for `key`.
    ///
    /// Nothing becomes visible under `key` until the staged artifact is
    /// passed to [`LocalCache::commit`]. Dropping it discards the staging
    /// directory.
    pub async fn stage(
        &self,
        key: &CacheKey,
        element: &ElementRef,
    ) -> Result<StagedArtifact, CacheError> {
        let path = self.tmp_dir().join(Uuid::new_v4().to_string());
        fs::create_dir_all(path.join(FILES_DIR))
            .await
            .map_err(|e| CacheError::from_io("create staging directory", e))?;

        debug!(key = %key.short(), staging = %path.display(), "Staging artifact");
        Ok(StagedArtifact {
            key: key.clone(),
            element: element.clone(),
            path,
            armed: true,
        })
    }

    /// Publish a staged artifact under its key with a single rename.
    ///
    /// Committing a key that is already present discards the staged copy
    /// and returns the existing artifact.
    pub async fn commit(&self, mut staged: StagedArtifact) -> Result<ArtifactRef, CacheError> {
        let metadata = ArtifactMetadata {
            element: staged.element.clone(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| CacheError::Fatal(format!("encode artifact metadata: {}", e)))?;
        fs::write(staged.path.join(METADATA_FILE), json)
            .await
            .map_err(|e| CacheError::from_io("write artifact metadata", e))?;

        let dest = self.artifact_dir(&staged.key);
        if let Err(e) = fs::rename(&staged.path, &dest).await {
            // Lost a race with another writer for the same key.
            if fs::try_exists(&dest).await.unwrap_or(false) {
                debug!(key = %staged.key.short(), "Artifact already committed, discarding staged copy");
            } else {
                return Err(CacheError::from_io("commit artifact", e));
            }
        } else {
            staged.armed = false;
            info!(cache = %self.name, key = %staged.key.short(), element = %staged.element, "Committed artifact");
        }

        self.get(&staged.key)
            .await?
            .ok_or_else(|| CacheError::NotFound(staged.key.clone()))
    }

    async fn read_metadata(&self, dir: &Path) -> Result<Option<ArtifactMetadata>, CacheError> {
        match fs::read(dir.join(METADATA_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CacheError::Fatal(format!("corrupt artifact metadata: {}", e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::from_io("read artifact metadata", e)),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn contains(&self, key: &CacheKey) -> Result<bool, CacheError> {
        fs::try_exists(self.artifact_dir(key).join(METADATA_FILE))
            .await
            .map_err(|e| CacheError::from_io("check artifact", e))
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<ArtifactRef>, CacheError> {
        let dir = self.artifact_dir(key);
        let Some(metadata) = self.read_metadata(&dir).await? else {
            return Ok(None);
        };
        let size = tree_size(&dir.join(FILES_DIR))
            .await
            .map_err(|e| CacheError::from_io("measure artifact", e))?;

        Ok(Some(ArtifactRef {
            key: key.clone(),
            element: metadata.element,
            location: dir,
            size,
            created_at: metadata.created_at,
        }))
    }

    async fn import(&self, artifact: &ArtifactRef) -> Result<ArtifactRef, CacheError> {
        if let Some(existing) = self.get(&artifact.key).await? {
            return Ok(existing);
        }

        let staged = self.stage(&artifact.key, &artifact.element).await?;
        copy_tree(&artifact.location.join(FILES_DIR), &staged.files_dir())
            .await
            .map_err(|e| CacheError::from_io("copy artifact", e))?;
        self.commit(staged).await
    }
}

/// An artifact being assembled in the staging area.
#[derive(Debug)]
pub struct StagedArtifact {
    key: CacheKey,
    element: ElementRef,
    path: PathBuf,
    armed: bool,
}

impl StagedArtifact {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Directory the artifact's files should be written into.
    pub fn files_dir(&self) -> PathBuf {
        self.path.join(FILES_DIR)
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(staging = %self.path.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}
