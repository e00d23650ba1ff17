//! Cache digests for composite resources.
//!
//! A resource's digest must change whenever anything a client could infer from it
//! changes: its blob, its own row, the owning identity, or, while the owner has no
//! custom content, the default resource. The validator is the blob tag (or the
//! default's validator) and `last_modified` is the latest of the relevant timestamps.

use std::sync::Arc;

use sqlx::sqlite::SqliteConnection;
use time::OffsetDateTime;
use tracing::debug;

use crate::blob_store;
use crate::cache_digest::CacheDigest;
use crate::database::{Identity, ResourceEntity};
use crate::default_resource::DefaultResourceCache;
use crate::digest::ContentTag;
use crate::error::Result;

/// Digest of an owner's custom content.
pub fn custom_digest(
    tag: &ContentTag,
    identity_modified: OffsetDateTime,
    entity_modified: OffsetDateTime,
) -> CacheDigest {
    CacheDigest::new(tag.as_str(), identity_modified.max(entity_modified))
}

/// Digest of an owner served the default resource. `entity_modified` is `None`
/// when the owner has never had a row of this kind.
pub fn fallback_digest(
    default: &CacheDigest,
    identity_modified: OffsetDateTime,
    entity_modified: Option<OffsetDateTime>,
) -> CacheDigest {
    let last_modified = entity_modified
        .into_iter()
        .fold(identity_modified.max(default.last_modified), OffsetDateTime::max);
    CacheDigest::new(default.validator.clone(), last_modified)
}

#[derive(Debug, Clone)]
pub struct CompositeDigestResolver {
    default: Arc<DefaultResourceCache>,
}

impl CompositeDigestResolver {
    pub fn new(default: Arc<DefaultResourceCache>) -> Self {
        Self { default }
    }

    pub fn default_resource(&self) -> &Arc<DefaultResourceCache> {
        &self.default
    }

    /// Resolve the digest of `kind` for `owner_id` on `conn`.
    ///
    /// Fails with `NotFound` if the owner does not exist and with `DatabaseCorrupted`
    /// if the row references a missing blob.
    pub async fn resolve(
        &self,
        kind: &str,
        owner_id: i64,
        conn: &mut SqliteConnection,
    ) -> Result<CacheDigest> {
        let identity_modified = Identity::last_modified(owner_id, conn).await?;
        let entity = ResourceEntity::load(kind, owner_id, conn).await?;

        let digest = match &entity {
            Some(ResourceEntity {
                blob_tag: Some(tag),
                last_modified,
                ..
            }) => {
                if !blob_store::exists_in(conn, tag).await? {
                    return Err(blob_store::corrupted(
                        tag,
                        &format!("{kind} of owner {owner_id}"),
                    ));
                }
                custom_digest(tag, identity_modified, *last_modified)
            }
            _ => {
                let default = self.default.digest().await?;
                fallback_digest(
                    &default,
                    identity_modified,
                    entity.as_ref().map(|e| e.last_modified),
                )
            }
        };

        debug!(kind, owner_id, validator = %digest.validator, "digest resolved");
        Ok(digest)
    }

    /// `last_modified` of the digest the owner currently has, computed from rows
    /// already read. Unlike [`resolve`](Self::resolve) this does not check that the
    /// blob exists, so a mutation can still overwrite a corrupted row.
    pub async fn current_last_modified(
        &self,
        identity_modified: OffsetDateTime,
        entity: Option<&ResourceEntity>,
    ) -> Result<OffsetDateTime> {
        match entity {
            Some(ResourceEntity {
                blob_tag: Some(tag),
                last_modified,
                ..
            }) => Ok(custom_digest(tag, identity_modified, *last_modified).last_modified),
            _ => {
                let default = self.default.digest().await?;
                Ok(fallback_digest(&default, identity_modified, entity.map(|e| e.last_modified))
                    .last_modified)
            }
        }
    }
}
