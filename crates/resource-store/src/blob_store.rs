//! Content-addressed, reference-counted blob storage.
//!
//! Identical payloads are stored once under their [`ContentTag`]. Each `retain`
//! adds a reference and each `free` drops one; the row is deleted when the last
//! reference goes, so a blob exists iff its refcount is positive.
//!
//! The `*_in` functions run on a caller-supplied connection so resource updates can
//! retain and free inside their own transaction. The [`BlobStore`] methods wrap each
//! call in a transaction of its own.

use bytes::Bytes;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, error, info};

use crate::database::Database;
use crate::digest::{digest, ContentTag};
use crate::error::{Result, StoreError};

/// Result of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Other references remain.
    Decremented { ref_count: u64 },
    /// The last reference was dropped and the blob deleted.
    Removed,
    /// No blob with that tag exists; nothing changed.
    Absent,
}

/// Deduplicating blob store backed by the `blobs` table.
#[derive(Debug, Clone)]
pub struct BlobStore {
    db: Database,
}

impl BlobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Store `data` if it is new, otherwise add a reference. Returns its tag.
    pub async fn retain(&self, data: &[u8]) -> Result<ContentTag> {
        let mut tx = self.db.begin().await?;
        let tag = retain_in(&mut tx, data).await?;
        tx.commit().await?;
        Ok(tag)
    }

    /// Drop one reference to `tag`. Freeing an absent tag is a no-op.
    pub async fn free(&self, tag: &ContentTag) -> Result<FreeOutcome> {
        let mut tx = self.db.begin().await?;
        let outcome = free_in(&mut tx, tag).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Fetch the payload stored under `tag`.
    pub async fn get(&self, tag: &ContentTag) -> Result<Bytes> {
        let mut conn = self.db.acquire().await?;
        get_in(&mut conn, tag)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("blob {tag}")))
    }

    pub async fn has(&self, tag: &ContentTag) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        exists_in(&mut conn, tag).await
    }

    /// Current reference count, or `None` if the blob does not exist.
    pub async fn ref_count(&self, tag: &ContentTag) -> Result<Option<u64>> {
        let count = sqlx::query_scalar::<_, i64>("SELECT ref_count FROM blobs WHERE tag = ?1")
            .bind(tag)
            .fetch_optional(&*self.db)
            .await?;
        Ok(count.map(|c| c as u64))
    }

    /// Number of distinct blobs stored.
    pub async fn count(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM blobs")
            .fetch_one(&*self.db)
            .await?;
        Ok(count as u64)
    }

    /// Total payload bytes stored, counting each distinct blob once.
    pub async fn total_size(&self) -> Result<u64> {
        let size = sqlx::query_scalar::<_, i64>("SELECT COALESCE(SUM(LENGTH(data)), 0) FROM blobs")
            .fetch_one(&*self.db)
            .await?;
        Ok(size as u64)
    }
}

pub(crate) async fn retain_in(conn: &mut SqliteConnection, data: &[u8]) -> Result<ContentTag> {
    if data.is_empty() {
        return Err(StoreError::InvalidArgument(
            "cannot retain empty content".to_string(),
        ));
    }

    let tag = digest(data);

    // Single statement, so concurrent retains of the same content never lose a count.
    let ref_count = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO blobs (tag, data, ref_count)
        VALUES (?1, ?2, 1)
        ON CONFLICT (tag) DO UPDATE SET ref_count = ref_count + 1
        RETURNING ref_count
        "#,
    )
    .bind(&tag)
    .bind(data)
    .fetch_one(&mut *conn)
    .await?;

    if ref_count == 1 {
        info!(tag = %tag, size = data.len(), "blob created");
    } else {
        debug!(tag = %tag, ref_count, "blob reference added");
    }
    Ok(tag)
}

pub(crate) async fn free_in(conn: &mut SqliteConnection, tag: &ContentTag) -> Result<FreeOutcome> {
    if tag.as_str().is_empty() {
        return Err(StoreError::InvalidArgument(
            "cannot free an empty tag".to_string(),
        ));
    }

    let remaining = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE blobs SET ref_count = ref_count - 1
        WHERE tag = ?1 AND ref_count > 1
        RETURNING ref_count
        "#,
    )
    .bind(tag)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(ref_count) = remaining {
        debug!(tag = %tag, ref_count, "blob reference dropped");
        return Ok(FreeOutcome::Decremented {
            ref_count: ref_count as u64,
        });
    }

    let removed = sqlx::query("DELETE FROM blobs WHERE tag = ?1")
        .bind(tag)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if removed == 1 {
        info!(tag = %tag, "blob removed");
        Ok(FreeOutcome::Removed)
    } else {
        debug!(tag = %tag, "free of absent blob ignored");
        Ok(FreeOutcome::Absent)
    }
}

pub(crate) async fn get_in(conn: &mut SqliteConnection, tag: &ContentTag) -> Result<Option<Bytes>> {
    let data = sqlx::query_scalar::<_, Vec<u8>>("SELECT data FROM blobs WHERE tag = ?1")
        .bind(tag)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(data.map(Bytes::from))
}

pub(crate) async fn exists_in(conn: &mut SqliteConnection, tag: &ContentTag) -> Result<bool> {
    let row = sqlx::query_scalar::<_, i64>("SELECT 1 FROM blobs WHERE tag = ?1")
        .bind(tag)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Build the error for a row that references a missing blob, logging it loudly.
pub(crate) fn corrupted(tag: &ContentTag, context: &str) -> StoreError {
    error!(tag = %tag, context, "referenced blob is missing");
    StoreError::DatabaseCorrupted(format!("blob {tag} is missing; {context}"))
}

/// Fetch a blob that a row references. A miss means an earlier free was wrong.
pub(crate) async fn get_referenced(
    conn: &mut SqliteConnection,
    tag: &ContentTag,
    context: &str,
) -> Result<Bytes> {
    get_in(conn, tag)
        .await?
        .ok_or_else(|| corrupted(tag, context))
}
