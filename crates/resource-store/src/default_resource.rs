//! Fallback resource served to owners without custom content.
//!
//! The cache holds one snapshot of the backing source. Every read compares the
//! source's modification time with the snapshot and reloads when the source is newer.
//! Concurrent callers may reload redundantly; a reload never replaces a fresher
//! snapshot.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::cache_digest::CacheDigest;
use crate::digest::digest;
use crate::error::{Result, StoreError};
use crate::service::ResourceContent;
use crate::validator::ContentValidator;

/// Content type used when neither detection nor the source can name one.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Where the fallback payload comes from.
#[async_trait]
pub trait DefaultResourceSource: fmt::Debug + Send + Sync {
    /// Modification time of the current payload.
    async fn modified(&self) -> io::Result<OffsetDateTime>;

    async fn read(&self) -> io::Result<Vec<u8>>;

    /// Content type to fall back on when the payload's format is not detected.
    fn content_type_hint(&self) -> Option<String>;
}

/// A payload on disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DefaultResourceSource for FileSource {
    async fn modified(&self) -> io::Result<OffsetDateTime> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        Ok(OffsetDateTime::from(metadata.modified()?))
    }

    async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    fn content_type_hint(&self) -> Option<String> {
        mime_guess::from_path(&self.path)
            .first()
            .map(|mime| mime.essence_str().to_string())
    }
}

/// An in-memory payload with a settable modification time.
#[derive(Debug)]
pub struct MemorySource {
    state: Mutex<(Bytes, OffsetDateTime)>,
    hint: Option<String>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>, modified: OffsetDateTime) -> Self {
        Self {
            state: Mutex::new((data.into(), modified)),
            hint: None,
        }
    }

    pub fn with_content_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Swap in a new payload, as if the backing file was rewritten.
    pub fn replace(&self, data: impl Into<Bytes>, modified: OffsetDateTime) {
        *self.state.lock() = (data.into(), modified);
    }

    /// Bump the modification time without changing the payload.
    pub fn touch(&self, modified: OffsetDateTime) {
        self.state.lock().1 = modified;
    }
}

#[async_trait]
impl DefaultResourceSource for MemorySource {
    async fn modified(&self) -> io::Result<OffsetDateTime> {
        Ok(self.state.lock().1)
    }

    async fn read(&self) -> io::Result<Vec<u8>> {
        Ok(self.state.lock().0.to_vec())
    }

    fn content_type_hint(&self) -> Option<String> {
        self.hint.clone()
    }
}

/// One loaded snapshot of the fallback resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultResource {
    pub digest: CacheDigest,
    pub data: Bytes,
    pub content_type: String,
}

pub struct DefaultResourceCache {
    source: Arc<dyn DefaultResourceSource>,
    validator: Arc<dyn ContentValidator>,
    snapshot: RwLock<Option<Arc<DefaultResource>>>,
}

impl fmt::Debug for DefaultResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultResourceCache")
            .field("source", &self.source)
            .field(
                "loaded",
                &self.snapshot.read().as_ref().map(|s| s.digest.clone()),
            )
            .finish()
    }
}

impl DefaultResourceCache {
    pub fn new(
        source: Arc<dyn DefaultResourceSource>,
        validator: Arc<dyn ContentValidator>,
    ) -> Self {
        Self {
            source,
            validator,
            snapshot: RwLock::new(None),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>, validator: Arc<dyn ContentValidator>) -> Self {
        Self::new(Arc::new(FileSource::new(path)), validator)
    }

    pub async fn digest(&self) -> Result<CacheDigest> {
        Ok(self.current().await?.digest.clone())
    }

    pub async fn content(&self) -> Result<ResourceContent> {
        let snapshot = self.current().await?;
        Ok(ResourceContent {
            data: snapshot.data.clone(),
            content_type: snapshot.content_type.clone(),
        })
    }

    /// The snapshot, reloaded first if the source changed since it was taken.
    pub async fn current(&self) -> Result<Arc<DefaultResource>> {
        let modified = self.source.modified().await?;

        let cached = self.snapshot.read().clone();
        if let Some(snapshot) = cached {
            if modified <= snapshot.digest.last_modified {
                return Ok(snapshot);
            }
        }

        let data = self.source.read().await?;
        if data.is_empty() {
            return Err(StoreError::Config(format!(
                "default resource {:?} is empty",
                self.source
            )));
        }

        let content_type = self
            .validator
            .detect_format(&data)
            .or_else(|| self.source.content_type_hint())
            .unwrap_or_else(|| OCTET_STREAM.to_string());
        let fresh = Arc::new(DefaultResource {
            digest: CacheDigest::new(digest(&data).to_string(), modified),
            data: Bytes::from(data),
            content_type,
        });

        let mut slot = self.snapshot.write();
        if let Some(existing) = slot.as_ref() {
            if existing.digest.last_modified >= modified {
                debug!("default resource already reloaded by another caller");
                return Ok(existing.clone());
            }
        }
        *slot = Some(fresh.clone());
        drop(slot);

        info!(
            validator = %fresh.digest.validator,
            content_type = %fresh.content_type,
            size = fresh.data.len(),
            "default resource loaded"
        );
        Ok(fresh)
    }
}
