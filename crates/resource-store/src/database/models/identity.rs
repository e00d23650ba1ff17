use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::FromRow;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::blob_store;
use crate::clock::next_stamp;
use crate::database::lock_owner;
use crate::database::models::ResourceEntity;
use crate::error::{Result, StoreError};

/// Owner of resources. Only the name timestamp matters to cache digests: a
/// rename changes what clients infer from a resource even when its blob does not.
#[derive(FromRow, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub name_modified_at: OffsetDateTime,
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidArgument(
            "identity name must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn map_name_conflict(e: sqlx::Error, name: &str) -> StoreError {
    match e {
        sqlx::Error::Database(ref db_error) if db_error.is_unique_violation() => {
            StoreError::InvalidArgument(format!("identity name already taken: {name}"))
        }
        _ => StoreError::Storage(e),
    }
}

impl Identity {
    pub async fn create(name: &str, now: OffsetDateTime, conn: &mut SqliteConnection) -> Result<Self> {
        validate_name(name)?;

        let identity = sqlx::query_as::<_, Identity>(
            r#"
            INSERT INTO identities (name, name_modified_at)
            VALUES (?1, ?2)
            RETURNING id, name, name_modified_at
            "#,
        )
        .bind(name)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_name_conflict(e, name))?;

        info!(id = identity.id, name = %identity.name, "identity created");
        Ok(identity)
    }

    pub async fn get(id: i64, conn: &mut SqliteConnection) -> Result<Option<Self>> {
        let identity = sqlx::query_as::<_, Identity>(
            "SELECT id, name, name_modified_at FROM identities WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(identity)
    }

    pub async fn find_by_name(name: &str, conn: &mut SqliteConnection) -> Result<Option<Self>> {
        let identity = sqlx::query_as::<_, Identity>(
            "SELECT id, name, name_modified_at FROM identities WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(identity)
    }

    /// Timestamp of the identity's last externally visible change.
    pub async fn last_modified(id: i64, conn: &mut SqliteConnection) -> Result<OffsetDateTime> {
        sqlx::query_scalar::<_, OffsetDateTime>(
            "SELECT name_modified_at FROM identities WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))
    }

    /// Rename the identity. `not_before` is any other timestamp that feeds this
    /// owner's digests (the default resource's mtime); the new stamp lands after it.
    pub async fn rename(
        id: i64,
        new_name: &str,
        now: OffsetDateTime,
        not_before: Option<OffsetDateTime>,
        conn: &mut SqliteConnection,
    ) -> Result<Self> {
        validate_name(new_name)?;

        if !lock_owner(conn, id).await? {
            return Err(StoreError::NotFound(format!("identity {id}")));
        }
        // The new stamp must pass every digest this identity feeds into, not just
        // its own previous stamp.
        let previous = Self::last_modified(id, conn).await?;
        let floor = ResourceEntity::list_for_owner(id, conn)
            .await?
            .into_iter()
            .map(|resource| resource.last_modified)
            .chain(not_before)
            .fold(previous, OffsetDateTime::max);
        let stamp = next_stamp(now, Some(floor));

        let identity = sqlx::query_as::<_, Identity>(
            r#"
            UPDATE identities
            SET name = ?1, name_modified_at = ?2
            WHERE id = ?3
            RETURNING id, name, name_modified_at
            "#,
        )
        .bind(new_name)
        .bind(stamp)
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_name_conflict(e, new_name))?;

        info!(id, name = %identity.name, "identity renamed");
        Ok(identity)
    }

    /// Delete the identity and every resource row it owns, freeing their blobs.
    pub async fn delete(id: i64, conn: &mut SqliteConnection) -> Result<()> {
        if !lock_owner(conn, id).await? {
            return Err(StoreError::NotFound(format!("identity {id}")));
        }

        let resources = ResourceEntity::list_for_owner(id, conn).await?;
        for resource in &resources {
            if let Some(tag) = &resource.blob_tag {
                blob_store::free_in(conn, tag).await?;
            }
        }

        sqlx::query("DELETE FROM resources WHERE owner_id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM identities WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        warn!(id, resources = resources.len(), "identity deleted");
        Ok(())
    }
}
