//! Artifact cache abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::action::ActionError;
use crate::element::ElementRef;

/// Content address of an artifact: hex encoded SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for an element from its own inputs and the keys of
    /// its dependencies. Any change upstream changes the key.
    pub fn compute(element: &ElementRef, inputs: &[String], dependencies: &[CacheKey]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"element\0");
        hasher.update(element.as_str().as_bytes());
        hasher.update(b"\0inputs\0");
        for input in inputs {
            hasher.update(input.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"dependencies\0");
        for dep in dependencies {
            hasher.update(dep.0.as_bytes());
            hasher.update(b"\0");
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a key from its hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

/// Reference to a committed artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: CacheKey,
    pub element: ElementRef,
    /// Directory holding the artifact contents.
    pub location: PathBuf,
    /// Total size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("artifact not found: {0}")]
    NotFound(CacheKey),

    /// A transient failure; the operation may succeed if repeated.
    #[error("temporary cache failure: {0}")]
    Retryable(String),

    #[error("cache failure: {0}")]
    Fatal(String),
}

impl CacheError {
    /// Classify an I/O error by whether repeating the operation could help.
    pub fn from_io(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused => {
                CacheError::Retryable(format!("{}: {}", context, err))
            }
            _ => CacheError::Fatal(format!("{}: {}", context, err)),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Retryable(_))
    }
}

impl From<CacheError> for ActionError {
    fn from(err: CacheError) -> Self {
        if err.is_retryable() {
            ActionError::retryable(err.to_string())
        } else {
            ActionError::fatal(err.to_string())
        }
    }
}

/// Trait for artifact storage backends, local or remote.
///
/// Writes are atomic-or-absent: an interrupted `import` never leaves a
/// partially written artifact visible under its key.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Name of this store, for messages.
    fn name(&self) -> &str;

    async fn contains(&self, key: &CacheKey) -> Result<bool, CacheError>;

    async fn get(&self, key: &CacheKey) -> Result<Option<ArtifactRef>, CacheError>;

    /// Copy an artifact committed in another store into this one.
    async fn import(&self, artifact: &ArtifactRef) -> Result<ArtifactRef, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_depends_on_every_input() {
        let base = ElementRef::new("base");
        let dep = CacheKey::compute(&ElementRef::new("libc"), &[], &[]);

        let key = CacheKey::compute(&base, &["make".to_string()], &[dep.clone()]);
        assert_eq!(
            key,
            CacheKey::compute(&base, &["make".to_string()], &[dep.clone()])
        );
        assert_ne!(
            key,
            CacheKey::compute(&base, &["make install".to_string()], &[dep.clone()])
        );
        assert_ne!(key, CacheKey::compute(&base, &["make".to_string()], &[]));
        assert_ne!(
            key,
            CacheKey::compute(&ElementRef::new("other"), &["make".to_string()], &[dep])
        );
    }

    #[test]
    fn test_from_hex_validates() {
        let key = CacheKey::compute(&ElementRef::new("base"), &[], &[]);
        assert_eq!(CacheKey::from_hex(key.as_str()), Some(key.clone()));
        assert_eq!(key.short().len(), 8);
        assert!(CacheKey::from_hex("abc").is_none());
        assert!(CacheKey::from_hex(&"Z".repeat(64)).is_none());
    }

    #[test]
    fn test_io_classification() {
        let err = CacheError::from_io("read", io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_retryable());
        assert!(ActionError::from(err).is_retryable());

        let err = CacheError::from_io("read", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_retryable());
    }
}
