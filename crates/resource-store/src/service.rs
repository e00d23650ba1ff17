//! Get, set and delete of "one blob per owner" resources.
//!
//! Mutations run in a single SQLite transaction: the new blob is retained, the row
//! rewritten, and only then is the old blob freed, so re-setting identical content
//! never drops the shared blob to zero references. Cancellation or timeout before
//! the commit drops the transaction and nothing is persisted.
//!
//! The operation timeout and the cancellation token bound only the work before the
//! commit. Once the commit starts it runs to completion, waiting at most the
//! database `busy_timeout` for the write lock, and its result stands.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{Sqlite, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob_store;
use crate::cache_digest::CacheDigest;
use crate::clock::{next_stamp, Clock, SystemClock};
use crate::config::{DEFAULT_MAX_CONTENT_SIZE, DEFAULT_OPERATION_TIMEOUT_SECS};
use crate::database::{lock_owner, Database, Identity, ResourceEntity};
use crate::default_resource::{DefaultResourceCache, OCTET_STREAM};
use crate::error::{Result, StoreError};
use crate::resolver::{custom_digest, CompositeDigestResolver};
use crate::validator::{ContentConstraints, ContentValidator};

/// Name of a resource kind, stored with every row of that kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind(Cow<'static, str>);

impl ResourceKind {
    pub const AVATAR: ResourceKind = ResourceKind(Cow::Borrowed("avatar"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "resource kind must not be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload of a resource with its MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceContent {
    pub data: Bytes,
    pub content_type: String,
}

/// Operations every blob-backed resource kind supports.
///
/// Each call takes a [`CancellationToken`]. Cancelling it before the commit makes
/// the call return [`StoreError::Cancelled`] with nothing persisted; cancelling
/// it later has no effect.
#[async_trait]
pub trait CacheableResource: Send + Sync {
    /// Current cache digest, without reading the payload.
    async fn get_digest(&self, owner_id: i64, cancel: &CancellationToken) -> Result<CacheDigest>;

    async fn get_bytes(&self, owner_id: i64, cancel: &CancellationToken)
        -> Result<ResourceContent>;

    /// Replace the owner's content. Returns the new digest.
    async fn set(
        &self,
        owner_id: i64,
        data: Bytes,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> Result<CacheDigest>;

    /// Drop the owner's custom content, reverting to the default.
    async fn delete(&self, owner_id: i64, cancel: &CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ResourceService {
    kind: ResourceKind,
    db: Database,
    resolver: CompositeDigestResolver,
    validator: Arc<dyn ContentValidator>,
    constraints: ContentConstraints,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl ResourceService {
    pub fn new(
        kind: ResourceKind,
        db: Database,
        default: Arc<DefaultResourceCache>,
        validator: Arc<dyn ContentValidator>,
    ) -> Self {
        Self {
            kind,
            db,
            resolver: CompositeDigestResolver::new(default),
            validator,
            constraints: ContentConstraints {
                require_square: false,
                max_size: Some(DEFAULT_MAX_CONTENT_SIZE),
            },
            clock: Arc::new(SystemClock),
            timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
        }
    }

    /// Avatars: square images.
    pub fn avatar(
        db: Database,
        default: Arc<DefaultResourceCache>,
        validator: Arc<dyn ContentValidator>,
    ) -> Self {
        Self::new(ResourceKind::AVATAR, db, default, validator)
            .with_constraints(ContentConstraints::square(DEFAULT_MAX_CONTENT_SIZE))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_constraints(mut self, constraints: ContentConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Limit on the uncommitted part of each operation. The commit itself is
    /// bounded by the database `busy_timeout` instead.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn constraints(&self) -> &ContentConstraints {
        &self.constraints
    }

    /// Run `work` unless `cancel` fires or the operation timeout elapses first.
    ///
    /// Mutations have `work` return the open transaction and commit it after this
    /// returns.
    async fn guard<T>(
        &self,
        op: &'static str,
        owner_id: i64,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if cancel.is_cancelled() {
            debug!(op, kind = %self.kind, owner_id, "cancelled before start");
            return Err(StoreError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(op, kind = %self.kind, owner_id, "cancelled");
                Err(StoreError::Cancelled)
            }
            result = tokio::time::timeout(self.timeout, work) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!(op, kind = %self.kind, owner_id, timeout = ?self.timeout, "timed out");
                    Err(StoreError::TimedOut)
                }
            },
        }
    }

    async fn begin_for_owner(&self, owner_id: i64) -> Result<Transaction<'static, Sqlite>> {
        let mut tx = self.db.begin().await?;
        if !lock_owner(&mut tx, owner_id).await? {
            return Err(StoreError::NotFound(format!("identity {owner_id}")));
        }
        Ok(tx)
    }

    async fn validate(&self, data: Bytes, content_type: &str) -> Result<String> {
        if content_type.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "content type must not be empty".to_string(),
            ));
        }

        let validator = self.validator.clone();
        let constraints = self.constraints;
        let declared = content_type.to_string();
        let validated = tokio::task::spawn_blocking(move || {
            validator.validate(&data, Some(declared.as_str()), &constraints)
        })
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))??;

        Ok(validated.content_type)
    }

    async fn set_in_tx(
        &self,
        owner_id: i64,
        data: Bytes,
        content_type: &str,
    ) -> Result<(Transaction<'static, Sqlite>, CacheDigest)> {
        let content_type = self.validate(data.clone(), content_type).await?;
        let kind = self.kind.as_str();

        let mut tx = self.begin_for_owner(owner_id).await?;
        let identity_modified = Identity::last_modified(owner_id, &mut tx).await?;
        let previous = ResourceEntity::load(kind, owner_id, &mut tx).await?;
        let floor = self
            .resolver
            .current_last_modified(identity_modified, previous.as_ref())
            .await?;

        let tag = blob_store::retain_in(&mut tx, &data).await?;
        let stamp = next_stamp(self.clock.now(), Some(floor));
        ResourceEntity::upsert(
            kind,
            owner_id,
            Some(&tag),
            Some(&content_type),
            stamp,
            &mut tx,
        )
        .await?;

        // Only after the new tag holds its reference.
        if let Some(old) = previous.and_then(|p| p.blob_tag) {
            blob_store::free_in(&mut tx, &old).await?;
        }

        Ok((tx, custom_digest(&tag, identity_modified, stamp)))
    }

    async fn delete_in_tx(&self, owner_id: i64) -> Result<(Transaction<'static, Sqlite>, bool)> {
        let kind = self.kind.as_str();

        let mut tx = self.begin_for_owner(owner_id).await?;
        let identity_modified = Identity::last_modified(owner_id, &mut tx).await?;
        let previous = ResourceEntity::load(kind, owner_id, &mut tx).await?;
        let floor = self
            .resolver
            .current_last_modified(identity_modified, previous.as_ref())
            .await?;

        let old = previous.and_then(|p| p.blob_tag);
        if let Some(old) = &old {
            blob_store::free_in(&mut tx, old).await?;
        }

        let stamp = next_stamp(self.clock.now(), Some(floor));
        ResourceEntity::upsert(kind, owner_id, None, None, stamp, &mut tx).await?;

        Ok((tx, old.is_some()))
    }

    async fn read_in_tx(
        &self,
        owner_id: i64,
    ) -> Result<(Transaction<'static, Sqlite>, ResourceContent, bool)> {
        let kind = self.kind.as_str();

        let mut tx = self.db.begin().await?;
        Identity::last_modified(owner_id, &mut tx).await?;
        let entity = ResourceEntity::load(kind, owner_id, &mut tx).await?;

        let Some(ResourceEntity {
            blob_tag: Some(tag),
            content_type,
            ..
        }) = entity
        else {
            let content = self.resolver.default_resource().content().await?;
            return Ok((tx, content, false));
        };

        let data = blob_store::get_referenced(
            &mut tx,
            &tag,
            &format!("{kind} of owner {owner_id}"),
        )
        .await?;

        match content_type {
            Some(content_type) => Ok((tx, ResourceContent { data, content_type }, false)),
            None => {
                let content_type = self
                    .validator
                    .detect_format(&data)
                    .unwrap_or_else(|| OCTET_STREAM.to_string());
                Ok((tx, ResourceContent { data, content_type }, true))
            }
        }
    }

    /// Persist a content type detected for a row stored without one.
    async fn backfill_content_type(&self, owner_id: i64, content: &ResourceContent) -> Result<()> {
        let tag = crate::digest::digest(&content.data);
        let mut tx = self.db.begin().await?;
        let filled = ResourceEntity::fill_content_type(
            self.kind.as_str(),
            owner_id,
            &tag,
            &content.content_type,
            &mut tx,
        )
        .await?;
        tx.commit().await?;

        if filled {
            info!(
                kind = %self.kind,
                owner_id,
                content_type = %content.content_type,
                "content type backfilled"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl CacheableResource for ResourceService {
    async fn get_digest(&self, owner_id: i64, cancel: &CancellationToken) -> Result<CacheDigest> {
        self.guard("get_digest", owner_id, cancel, async {
            let mut tx = self.db.begin().await?;
            let digest = self
                .resolver
                .resolve(self.kind.as_str(), owner_id, &mut tx)
                .await?;
            tx.commit().await?;
            Ok(digest)
        })
        .await
    }

    async fn get_bytes(
        &self,
        owner_id: i64,
        cancel: &CancellationToken,
    ) -> Result<ResourceContent> {
        let (tx, content, needs_backfill) = self
            .guard("get_bytes", owner_id, cancel, self.read_in_tx(owner_id))
            .await?;
        tx.commit().await?;

        if needs_backfill {
            if let Err(e) = self.backfill_content_type(owner_id, &content).await {
                warn!(kind = %self.kind, owner_id, error = %e, "failed to backfill content type");
            }
        }
        Ok(content)
    }

    async fn set(
        &self,
        owner_id: i64,
        data: Bytes,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> Result<CacheDigest> {
        let (tx, digest) = self
            .guard("set", owner_id, cancel, self.set_in_tx(owner_id, data, content_type))
            .await?;
        tx.commit().await?;

        info!(
            kind = %self.kind,
            owner_id,
            tag = %digest.validator,
            last_modified = %digest.last_modified,
            "resource set"
        );
        Ok(digest)
    }

    async fn delete(&self, owner_id: i64, cancel: &CancellationToken) -> Result<()> {
        let (tx, had_content) = self
            .guard("delete", owner_id, cancel, self.delete_in_tx(owner_id))
            .await?;
        tx.commit().await?;

        info!(kind = %self.kind, owner_id, had_content, "resource deleted");
        Ok(())
    }
}
