//! Deduplicated, reference-counted resource storage with composite cache validators.
//!
//! Payloads are stored once per distinct content under their BLAKE3 [`ContentTag`] and
//! kept alive by a reference count. Owners point at blobs through resource rows, and
//! each resource exposes a [`CacheDigest`] that changes whenever the blob, the row,
//! the owning identity or the fallback default changes.
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use resource_store::{CacheableResource, ResourceStore, StoreConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(png: Bytes) -> resource_store::Result<()> {
//! let config = StoreConfig::from_file("resource-store.toml")?;
//! let store = ResourceStore::open(&config).await?;
//! let avatars = store.avatars();
//! let cancel = CancellationToken::new();
//!
//! let alice = store.create_identity("alice").await?;
//! let digest = avatars.set(alice.id, png, "image/png", &cancel).await?;
//! println!("ETag: {}", digest.etag());
//!
//! let content = avatars.get_bytes(alice.id, &cancel).await?;
//! println!("{} bytes of {}", content.data.len(), content.content_type);
//! # Ok(())
//! # }
//! ```

pub mod blob_store;
pub mod cache_digest;
pub mod clock;
pub mod config;
pub mod database;
pub mod default_resource;
pub mod digest;
pub mod error;
pub mod resolver;
pub mod service;
mod store;
pub mod validator;

pub use blob_store::{BlobStore, FreeOutcome};
pub use cache_digest::{cache_control_value, evaluate, CacheDigest, Freshness};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DatabaseConfig, StoreConfig};
pub use database::{Database, Identity, ResourceEntity};
pub use default_resource::{
    DefaultResource, DefaultResourceCache, DefaultResourceSource, FileSource, MemorySource,
};
pub use digest::{digest, ContentTag};
pub use error::{ContentInvalidReason, Result, StoreError};
pub use resolver::CompositeDigestResolver;
pub use service::{CacheableResource, ResourceContent, ResourceKind, ResourceService};
pub use store::ResourceStore;
pub use validator::{ContentConstraints, ContentValidator, ImageValidator, ValidatedContent};
