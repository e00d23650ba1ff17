//! SQLite database holding blobs, identities and resource rows.
//!
//! Blob payloads live in the database itself so a resource update and the
//! refcount changes it implies commit or roll back together.

pub mod models;
pub mod types;

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use time::OffsetDateTime;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::Result;

pub use models::{Identity, ResourceEntity};

/// Database connection pool for resource store metadata and payloads.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::ops::Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    /// Open (or create) a file-based database and run migrations.
    pub async fn new(
        path: impl AsRef<Path>,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!(path = %path.display(), max_connections, "resource database initialized");
        Ok(db)
    }

    /// Create a new in-memory database.
    ///
    /// Every connection to `:memory:` is a separate database, so the pool is pinned
    /// to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("resource database initialized in-memory");
        Ok(db)
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        match &config.path {
            Some(path) => {
                Self::new(
                    path,
                    config.max_connections,
                    Duration::from_secs(config.busy_timeout_secs),
                )
                .await
            }
            None => Self::in_memory().await,
        }
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                tag TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                ref_count INTEGER NOT NULL CHECK (ref_count > 0),
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                name_modified_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // The blob reference is checked at commit so a transaction may free the old
        // tag before it rewrites the row.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                kind TEXT NOT NULL,
                owner_id INTEGER NOT NULL REFERENCES identities(id),
                blob_tag TEXT REFERENCES blobs(tag) DEFERRABLE INITIALLY DEFERRED,
                content_type TEXT,
                last_modified TEXT NOT NULL,
                PRIMARY KEY (kind, owner_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_resources_blob_tag ON resources(blob_tag)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create an identity whose externally visible name was set at `now`.
    pub async fn create_identity(&self, name: &str, now: OffsetDateTime) -> Result<Identity> {
        let mut tx = self.begin().await?;
        let identity = Identity::create(name, now, &mut tx).await?;
        tx.commit().await?;
        Ok(identity)
    }

    pub async fn get_identity(&self, id: i64) -> Result<Option<Identity>> {
        let mut conn = self.acquire().await?;
        Identity::get(id, &mut conn).await
    }

    pub async fn find_identity(&self, name: &str) -> Result<Option<Identity>> {
        let mut conn = self.acquire().await?;
        Identity::find_by_name(name, &mut conn).await
    }

    /// Rename an identity. Bumps its name timestamp past `not_before` and its own
    /// resources, which invalidates every resource digest owned by it.
    pub async fn rename_identity(
        &self,
        id: i64,
        new_name: &str,
        now: OffsetDateTime,
        not_before: Option<OffsetDateTime>,
    ) -> Result<Identity> {
        let mut tx = self.begin().await?;
        let identity = Identity::rename(id, new_name, now, not_before, &mut tx).await?;
        tx.commit().await?;
        Ok(identity)
    }

    /// Delete an identity together with its resources, releasing their blobs.
    pub async fn delete_identity(&self, id: i64) -> Result<()> {
        let mut tx = self.begin().await?;
        Identity::delete(id, &mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Take SQLite's write lock for `owner_id` at the start of a transaction.
///
/// The no-op update makes the transaction a writer before it reads anything, so a
/// concurrent writer waits on the busy timeout instead of failing a lock upgrade.
/// Returns whether the identity exists.
pub(crate) async fn lock_owner(conn: &mut SqliteConnection, owner_id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE identities SET id = id WHERE id = ?1")
        .bind(owner_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}
