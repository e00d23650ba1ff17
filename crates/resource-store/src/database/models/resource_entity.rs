use sqlx::sqlite::SqliteConnection;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::digest::ContentTag;
use crate::error::Result;

/// One resource slot of a given kind for one owner.
///
/// `blob_tag = None` means the owner has no custom content and the kind's default
/// resource is served instead.
#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntity {
    pub kind: String,
    pub owner_id: i64,
    pub blob_tag: Option<ContentTag>,
    pub content_type: Option<String>,
    pub last_modified: OffsetDateTime,
}

impl ResourceEntity {
    pub async fn load(
        kind: &str,
        owner_id: i64,
        conn: &mut SqliteConnection,
    ) -> Result<Option<Self>> {
        let entity = sqlx::query_as::<_, ResourceEntity>(
            r#"
            SELECT kind, owner_id, blob_tag, content_type, last_modified
            FROM resources
            WHERE kind = ?1 AND owner_id = ?2
            "#,
        )
        .bind(kind)
        .bind(owner_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(entity)
    }

    pub async fn list_for_owner(owner_id: i64, conn: &mut SqliteConnection) -> Result<Vec<Self>> {
        let entities = sqlx::query_as::<_, ResourceEntity>(
            r#"
            SELECT kind, owner_id, blob_tag, content_type, last_modified
            FROM resources
            WHERE owner_id = ?1
            ORDER BY kind
            "#,
        )
        .bind(owner_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(entities)
    }

    /// Create the row or overwrite all of its mutable columns.
    pub async fn upsert(
        kind: &str,
        owner_id: i64,
        blob_tag: Option<&ContentTag>,
        content_type: Option<&str>,
        last_modified: OffsetDateTime,
        conn: &mut SqliteConnection,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resources (kind, owner_id, blob_tag, content_type, last_modified)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (kind, owner_id) DO UPDATE SET
                blob_tag = excluded.blob_tag,
                content_type = excluded.content_type,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(kind)
        .bind(owner_id)
        .bind(blob_tag)
        .bind(content_type)
        .bind(last_modified)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Record a detected content type for a row that has none, as long as the row
    /// still points at `blob_tag`. Returns whether a row was updated.
    pub async fn fill_content_type(
        kind: &str,
        owner_id: i64,
        blob_tag: &ContentTag,
        content_type: &str,
        conn: &mut SqliteConnection,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE resources
            SET content_type = ?1
            WHERE kind = ?2 AND owner_id = ?3 AND blob_tag = ?4 AND content_type IS NULL
            "#,
        )
        .bind(content_type)
        .bind(kind)
        .bind(owner_id)
        .bind(blob_tag)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
