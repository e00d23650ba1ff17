//! Integration tests for composite resource digests and mutations

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use common::{DEFAULT_MTIME, T0};
use image::ImageFormat;
use resource_store::{
    digest, CacheDigest, CacheableResource, ContentConstraints, ContentInvalidReason,
    Clock, ContentValidator, Database, DefaultResourceCache, ImageValidator, ManualClock, MemorySource,
    ResourceKind, ResourceService, StoreError,
};
use time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_digest_lifecycle_end_to_end() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let default_validator = digest(&common::default_png()).to_string();

    // No custom resource: default validator, latest of identity and default mtime.
    let d0 = env.service.get_digest(env.owner, &cancel).await.unwrap();
    assert_eq!(d0, CacheDigest::new(default_validator.clone(), T0.max(DEFAULT_MTIME)));

    let t1 = T0 + Duration::HOUR;
    let b = common::png(10, 1);
    let set = env
        .service
        .set(env.owner, b.clone(), "image/png", &cancel)
        .await
        .unwrap();
    let d1 = env.service.get_digest(env.owner, &cancel).await.unwrap();
    assert_eq!(d1, CacheDigest::new(digest(&b).to_string(), t1));
    assert_eq!(set, d1);

    let t2 = T0 + Duration::HOUR * 2;
    env.clock.set(t2);
    env.service.delete(env.owner, &cancel).await.unwrap();
    let d2 = env.service.get_digest(env.owner, &cancel).await.unwrap();
    assert_eq!(d2, CacheDigest::new(default_validator, t2.max(T0).max(DEFAULT_MTIME)));

    // The custom blob had one reference and is gone.
    assert_eq!(common::ref_count(&env.db, &digest(&b)).await, None);
}

#[tokio::test]
async fn test_resetting_same_content_keeps_the_blob() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let b = common::png(10, 2);
    let tag = digest(&b);

    env.service
        .set(env.owner, b.clone(), "image/png", &cancel)
        .await
        .unwrap();
    let rowid = blob_rowid(&env.db, tag.as_str()).await;

    // A later blob, so a delete and re-insert of `b` would get a new rowid.
    let other = env.db.create_identity("bob", T0).await.unwrap();
    env.service
        .set(other.id, common::png(10, 3), "image/png", &cancel)
        .await
        .unwrap();

    for _ in 0..3 {
        env.clock.advance(Duration::MINUTE);
        env.service
            .set(env.owner, b.clone(), "image/png", &cancel)
            .await
            .unwrap();
        assert_eq!(common::ref_count(&env.db, &tag).await, Some(1));
        assert_eq!(blob_rowid(&env.db, tag.as_str()).await, rowid);
        assert_eq!(
            env.service.get_bytes(env.owner, &cancel).await.unwrap().data,
            b
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resets_never_lose_the_blob() {
    common::init_tracing();
    let temp = tempfile::tempdir().unwrap();
    let db = Database::new(temp.path().join("resources.db"), 4, StdDuration::from_secs(10))
        .await
        .unwrap();
    let owner = db.create_identity("alice", T0).await.unwrap().id;
    let validator: Arc<dyn ContentValidator> = Arc::new(ImageValidator::new());
    let default = Arc::new(DefaultResourceCache::new(
        Arc::new(MemorySource::new(common::default_png(), DEFAULT_MTIME)),
        validator.clone(),
    ));
    let service = Arc::new(ResourceService::avatar(db.clone(), default, validator));
    let b = common::png(12, 4);
    let cancel = CancellationToken::new();

    service
        .set(owner, b.clone(), "image/png", &cancel)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = service.clone();
        let b = b.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            if i % 2 == 0 {
                service.set(owner, b, "image/png", &cancel).await.map(|_| ())
            } else {
                let content = service.get_bytes(owner, &cancel).await?;
                assert_eq!(content.data, b);
                Ok(())
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(common::ref_count(&db, &digest(&b)).await, Some(1));
    assert_eq!(common::blob_count(&db).await, 1);
    db.close().await;
}

#[tokio::test]
async fn test_digest_never_goes_backwards() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let mut last = env.service.get_digest(env.owner, &cancel).await.unwrap();

    let mut step = |label: &str, next: CacheDigest| {
        assert!(
            next.last_modified > last.last_modified,
            "{label}: {next:?} not after {last:?}"
        );
        last = next;
    };

    env.service
        .set(env.owner, common::png(6, 1), "image/png", &cancel)
        .await
        .unwrap();
    step("set", env.service.get_digest(env.owner, &cancel).await.unwrap());

    // Stable without intervening mutation.
    assert_eq!(
        env.service.get_digest(env.owner, &cancel).await.unwrap(),
        env.service.get_digest(env.owner, &cancel).await.unwrap()
    );

    // The clock jumps backwards; stamps still move forward.
    env.clock.set(T0 - Duration::DAY * 30);
    env.service
        .set(env.owner, common::png(6, 2), "image/png", &cancel)
        .await
        .unwrap();
    step("set after clock step back", env.service.get_digest(env.owner, &cancel).await.unwrap());

    env.service.delete(env.owner, &cancel).await.unwrap();
    step("delete", env.service.get_digest(env.owner, &cancel).await.unwrap());

    env.service.delete(env.owner, &cancel).await.unwrap();
    step("repeated delete", env.service.get_digest(env.owner, &cancel).await.unwrap());

    env.store.rename_identity(env.owner, "alicia").await.unwrap();
    step("rename", env.service.get_digest(env.owner, &cancel).await.unwrap());

    env.service
        .set(env.owner, common::png(6, 2), "image/png", &cancel)
        .await
        .unwrap();
    step("set again", env.service.get_digest(env.owner, &cancel).await.unwrap());
}

#[tokio::test]
async fn test_identity_rename_invalidates_digest() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let b = common::png(6, 5);

    let before = env
        .service
        .set(env.owner, b, "image/png", &cancel)
        .await
        .unwrap();
    let renamed_at = T0 + Duration::HOUR * 3;
    env.clock.set(renamed_at);
    env.store.rename_identity(env.owner, "alicia").await.unwrap();

    let after = env.service.get_digest(env.owner, &cancel).await.unwrap();
    assert_eq!(after.validator, before.validator);
    assert_eq!(after.last_modified, renamed_at);
}

#[tokio::test]
async fn test_rename_after_newer_default_still_invalidates() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();

    // The default file is newer than the clock the rename will read.
    env.default_source.touch(T0 + Duration::DAY);
    let before = env.service.get_digest(env.owner, &cancel).await.unwrap();
    assert_eq!(before.last_modified, T0 + Duration::DAY);

    assert_eq!(env.clock.now(), T0 + Duration::HOUR);
    let renamed = env.store.rename_identity(env.owner, "alicia").await.unwrap();
    assert!(renamed.name_modified_at > T0 + Duration::DAY);

    let after = env.service.get_digest(env.owner, &cancel).await.unwrap();
    assert_eq!(after.validator, before.validator);
    assert!(after.last_modified > before.last_modified);
    assert_eq!(after.last_modified, renamed.name_modified_at);
}

#[tokio::test]
async fn test_default_resource_change_invalidates_fallback_digest() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();

    let before = env.service.get_digest(env.owner, &cancel).await.unwrap();
    let replacement = common::png(2, 0x10);
    let replaced_at = T0 + Duration::HOUR * 5;
    env.default_source.replace(replacement.clone(), replaced_at);

    let after = env.service.get_digest(env.owner, &cancel).await.unwrap();
    assert_ne!(after.validator, before.validator);
    assert_eq!(after, CacheDigest::new(digest(&replacement).to_string(), replaced_at));
    assert_eq!(
        env.service.get_bytes(env.owner, &cancel).await.unwrap().data,
        replacement
    );
}

#[tokio::test]
async fn test_invalid_content_changes_nothing() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    env.service
        .set(env.owner, common::png(8, 1), "image/png", &cancel)
        .await
        .unwrap();
    let before = common::snapshot(&env.db).await;

    let cases = [
        (bytes::Bytes::from_static(b"\x00"), "image/png"),
        (common::encode(8, 16, 1, ImageFormat::Png), "image/png"),
        (common::png(8, 9), "image/jpeg"),
        (common::encode(8, 8, 9, ImageFormat::Jpeg), "image/png"),
    ];
    for (data, content_type) in cases {
        let err = env
            .service
            .set(env.owner, data, content_type, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ContentInvalid(_)), "{err:?}");
    }

    let err = env
        .service
        .set(env.owner, bytes::Bytes::new(), "image/png", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));

    assert_eq!(common::snapshot(&env.db).await, before);
}

#[tokio::test]
async fn test_failed_row_write_releases_retained_blob() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let old = common::png(8, 1);
    env.service
        .set(env.owner, old.clone(), "image/png", &cancel)
        .await
        .unwrap();
    let before = common::snapshot(&env.db).await;

    // Blob retain succeeds, then the resource row write aborts.
    for event in ["INSERT", "UPDATE"] {
        sqlx::query(&format!(
            "CREATE TRIGGER reject_resource_{event} BEFORE {event} ON resources \
             BEGIN SELECT RAISE(ABORT, 'resource write rejected'); END"
        ))
        .execute(&*env.db)
        .await
        .unwrap();
    }

    let new = common::png(8, 2);
    let err = env
        .service
        .set(env.owner, new.clone(), "image/png", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Storage(_)), "{err:?}");

    assert_eq!(common::snapshot(&env.db).await, before);
    assert_eq!(common::ref_count(&env.db, &digest(&new)).await, None);
    assert_eq!(common::ref_count(&env.db, &digest(&old)).await, Some(1));

    for event in ["INSERT", "UPDATE"] {
        sqlx::query(&format!("DROP TRIGGER reject_resource_{event}"))
            .execute(&*env.db)
            .await
            .unwrap();
    }
    env.service
        .set(env.owner, new.clone(), "image/png", &cancel)
        .await
        .unwrap();
    assert_eq!(common::ref_count(&env.db, &digest(&new)).await, Some(1));
    assert_eq!(common::ref_count(&env.db, &digest(&old)).await, None);
}

#[tokio::test]
async fn test_size_limit_applies_to_custom_kinds() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let data = common::png(8, 1);
    let banners = env
        .service
        .clone()
        .with_constraints(ContentConstraints {
            require_square: false,
            max_size: Some(data.len() - 1),
        });

    let err = banners
        .set(env.owner, data, "image/png", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::ContentInvalid(ContentInvalidReason::TooBig { .. })
    ));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();

    env.service.delete(env.owner, &cancel).await.unwrap();
    let first = env.service.get_digest(env.owner, &cancel).await.unwrap();
    env.clock.advance(Duration::SECOND);
    env.service.delete(env.owner, &cancel).await.unwrap();
    let second = env.service.get_digest(env.owner, &cancel).await.unwrap();

    assert_eq!(first.validator, second.validator);
    assert!(second.last_modified > first.last_modified);
    assert_eq!(common::blob_count(&env.db).await, 0);
}

#[tokio::test]
async fn test_shared_blob_across_owners_and_kinds() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let bob = env.db.create_identity("bob", T0).await.unwrap().id;
    let banners = ResourceService::new(
        ResourceKind::new("banner").unwrap(),
        env.db.clone(),
        Arc::new(DefaultResourceCache::new(
            Arc::new(MemorySource::new(common::default_png(), DEFAULT_MTIME)),
            Arc::new(ImageValidator::new()),
        )),
        Arc::new(ImageValidator::new()),
    )
    .with_constraints(ContentConstraints::default());

    let b = common::png(8, 6);
    let tag = digest(&b);
    env.service
        .set(env.owner, b.clone(), "image/png", &cancel)
        .await
        .unwrap();
    env.service
        .set(bob, b.clone(), "image/png", &cancel)
        .await
        .unwrap();
    banners
        .set(bob, b.clone(), "image/png", &cancel)
        .await
        .unwrap();
    assert_eq!(common::ref_count(&env.db, &tag).await, Some(3));
    assert_eq!(common::blob_count(&env.db).await, 1);

    env.service.delete(env.owner, &cancel).await.unwrap();
    env.service.delete(bob, &cancel).await.unwrap();
    assert_eq!(common::ref_count(&env.db, &tag).await, Some(1));
    assert_eq!(banners.get_bytes(bob, &cancel).await.unwrap().data, b);

    // The avatar row of one owner does not affect the other kind.
    assert_eq!(
        env.service.get_digest(bob, &cancel).await.unwrap().validator,
        digest(&common::default_png()).to_string()
    );
}

#[tokio::test]
async fn test_delete_identity_releases_blobs() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let bob = env.db.create_identity("bob", T0).await.unwrap().id;
    let shared = common::png(8, 7);

    env.service
        .set(env.owner, shared.clone(), "image/png", &cancel)
        .await
        .unwrap();
    env.service
        .set(bob, shared.clone(), "image/png", &cancel)
        .await
        .unwrap();

    env.db.delete_identity(env.owner).await.unwrap();

    assert_eq!(common::ref_count(&env.db, &digest(&shared)).await, Some(1));
    assert!(matches!(
        env.service.get_digest(env.owner, &cancel).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        env.db.delete_identity(env.owner).await,
        Err(StoreError::NotFound(_))
    ));

    env.db.delete_identity(bob).await.unwrap();
    assert_eq!(common::blob_count(&env.db).await, 0);
}

#[tokio::test]
async fn test_missing_blob_is_corruption() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let b = common::png(8, 8);
    env.service
        .set(env.owner, b.clone(), "image/png", &cancel)
        .await
        .unwrap();

    common::corrupt_blob(&env.db, &digest(&b)).await;

    let err = env.service.get_digest(env.owner, &cancel).await.unwrap_err();
    assert!(matches!(err, StoreError::DatabaseCorrupted(_)));
    assert!(err.is_fatal());
    let err = env.service.get_bytes(env.owner, &cancel).await.unwrap_err();
    assert!(matches!(err, StoreError::DatabaseCorrupted(_)));

    // Overwriting the broken row repairs it.
    let fresh = common::png(8, 9);
    env.clock.advance(Duration::MINUTE);
    env.service
        .set(env.owner, fresh.clone(), "image/png", &cancel)
        .await
        .unwrap();
    assert_eq!(
        env.service.get_bytes(env.owner, &cancel).await.unwrap().data,
        fresh
    );
}

#[tokio::test]
async fn test_missing_content_type_is_backfilled() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    env.service
        .set(env.owner, common::png(8, 1), "image/png", &cancel)
        .await
        .unwrap();
    sqlx::query("UPDATE resources SET content_type = NULL")
        .execute(&*env.db)
        .await
        .unwrap();

    let content = env.service.get_bytes(env.owner, &cancel).await.unwrap();
    assert_eq!(content.content_type, "image/png");

    let stored: Option<String> =
        sqlx::query_scalar("SELECT content_type FROM resources WHERE owner_id = ?1")
            .bind(env.owner)
            .fetch_one(&*env.db)
            .await
            .unwrap();
    assert_eq!(stored.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn test_cancelled_operations_change_nothing() {
    let env = common::setup().await;
    let before = common::snapshot(&env.db).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        env.service
            .set(env.owner, common::png(8, 1), "image/png", &cancel)
            .await,
        Err(StoreError::Cancelled)
    ));
    assert!(matches!(
        env.service.delete(env.owner, &cancel).await,
        Err(StoreError::Cancelled)
    ));
    assert!(matches!(
        env.service.get_digest(env.owner, &cancel).await,
        Err(StoreError::Cancelled)
    ));

    assert_eq!(common::snapshot(&env.db).await, before);
}

#[tokio::test]
async fn test_cancel_after_commit_keeps_result() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let b = common::png(8, 2);

    let digest_set = env
        .service
        .set(env.owner, b.clone(), "image/png", &cancel)
        .await
        .unwrap();
    cancel.cancel();

    let fresh = CancellationToken::new();
    assert_eq!(
        env.service.get_digest(env.owner, &fresh).await.unwrap(),
        digest_set
    );
}

#[tokio::test]
async fn test_timed_out_set_rolls_back() {
    let env = common::setup().await;
    let before = common::snapshot(&env.db).await;
    let impatient = env.service.clone().with_timeout(StdDuration::from_millis(50));

    // With the clock paused, the runtime jumps straight to the deadline as soon as
    // the operation waits on anything.
    tokio::time::pause();
    let result = impatient
        .set(env.owner, common::png(8, 1), "image/png", &CancellationToken::new())
        .await;
    tokio::time::resume();

    assert!(matches!(result, Err(StoreError::TimedOut)));
    assert!(StoreError::TimedOut.is_transient());
    assert_eq!(common::snapshot(&env.db).await, before);
}

#[tokio::test]
async fn test_clock_is_injected() {
    let env = common::setup().await;
    let cancel = CancellationToken::new();
    let clock = Arc::new(ManualClock::new(T0 + Duration::DAY));
    let service = env.service.clone().with_clock(clock);

    let digest = service
        .set(env.owner, common::png(4, 4), "image/png", &cancel)
        .await
        .unwrap();
    assert_eq!(digest.last_modified, T0 + Duration::DAY);
}

async fn blob_rowid(db: &Database, tag: &str) -> i64 {
    sqlx::query_scalar("SELECT rowid FROM blobs WHERE tag = ?1")
        .bind(tag)
        .fetch_one(&**db)
        .await
        .unwrap()
}
