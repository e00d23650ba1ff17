//! Shared fixtures for resource-store integration tests.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::{ImageFormat, RgbImage};
use resource_store::{
    ContentTag, ContentValidator, Database, DefaultResourceCache, ImageValidator, ManualClock,
    MemorySource, ResourceService, ResourceStore,
};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

/// When the test identity is created.
pub const T0: OffsetDateTime = datetime!(2021-03-01 0:00 UTC);

/// Modification time of the default resource, before `T0`.
pub const DEFAULT_MTIME: OffsetDateTime = datetime!(2021-01-01 0:00 UTC);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("resource_store=debug")),
        )
        .try_init();
}

/// A solid square PNG. Different `shade`s give different content.
pub fn png(side: u32, shade: u8) -> Bytes {
    encode(side, side, shade, ImageFormat::Png)
}

pub fn encode(width: u32, height: u32, shade: u8, format: ImageFormat) -> Bytes {
    let mut buf = Vec::new();
    RgbImage::from_pixel(width, height, image::Rgb([shade, shade, shade]))
        .write_to(&mut Cursor::new(&mut buf), format)
        .unwrap();
    Bytes::from(buf)
}

pub fn default_png() -> Bytes {
    png(2, 0x80)
}

pub struct TestEnv {
    pub db: Database,
    pub service: ResourceService,
    pub store: ResourceStore,
    pub clock: Arc<ManualClock>,
    pub default_source: Arc<MemorySource>,
    pub owner: i64,
}

/// In-memory database with one identity created at `T0`, and an avatar service
/// whose clock reads `T0 + 1h`. `store` shares the database, default resource
/// and clock with `service`.
pub async fn setup() -> TestEnv {
    init_tracing();

    let db = Database::in_memory().await.unwrap();
    let owner = db.create_identity("alice", T0).await.unwrap().id;

    let validator: Arc<dyn ContentValidator> = Arc::new(ImageValidator::new());
    let default_source = Arc::new(MemorySource::new(default_png(), DEFAULT_MTIME));
    let default = Arc::new(DefaultResourceCache::new(
        default_source.clone(),
        validator.clone(),
    ));
    let clock = Arc::new(ManualClock::new(T0 + Duration::HOUR));
    let service = ResourceService::avatar(db.clone(), default.clone(), validator.clone())
        .with_clock(clock.clone());
    let store = ResourceStore::from_parts(db.clone(), default, validator, clock.clone());

    TestEnv {
        db,
        service,
        store,
        clock,
        default_source,
        owner,
    }
}

pub async fn ref_count(db: &Database, tag: &ContentTag) -> Option<i64> {
    sqlx::query_scalar::<_, i64>("SELECT ref_count FROM blobs WHERE tag = ?1")
        .bind(tag.as_str())
        .fetch_optional(&**db)
        .await
        .unwrap()
}

pub async fn blob_count(db: &Database) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM blobs")
        .fetch_one(&**db)
        .await
        .unwrap()
}

pub type BlobRow = (String, i64);
pub type ResourceRow = (String, i64, Option<String>, Option<String>, String);

/// Every row of both tables, for before/after comparisons.
pub async fn snapshot(db: &Database) -> (Vec<BlobRow>, Vec<ResourceRow>) {
    let blobs = sqlx::query_as::<_, BlobRow>("SELECT tag, ref_count FROM blobs ORDER BY tag")
        .fetch_all(&**db)
        .await
        .unwrap();
    let resources = sqlx::query_as::<_, ResourceRow>(
        "SELECT kind, owner_id, blob_tag, content_type, last_modified FROM resources ORDER BY kind, owner_id",
    )
    .fetch_all(&**db)
    .await
    .unwrap();
    (blobs, resources)
}

/// Delete a blob out from under the rows that reference it.
///
/// The in-memory pool has a single connection, so the pragma applies to every
/// later statement too.
pub async fn corrupt_blob(db: &Database, tag: &ContentTag) {
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&**db)
        .await
        .unwrap();
    sqlx::query("DELETE FROM blobs WHERE tag = ?1")
        .bind(tag.as_str())
        .execute(&**db)
        .await
        .unwrap();
}
