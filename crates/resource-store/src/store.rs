//! Top-level handle wiring the database, blob store and default resource together.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::info;

use crate::blob_store::BlobStore;
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::database::{Database, Identity};
use crate::default_resource::DefaultResourceCache;
use crate::error::Result;
use crate::service::{ResourceKind, ResourceService};
use crate::validator::{ContentConstraints, ContentValidator, ImageValidator};

#[derive(Debug, Clone)]
pub struct ResourceStore {
    db: Database,
    blobs: BlobStore,
    validator: Arc<dyn ContentValidator>,
    default: Arc<DefaultResourceCache>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    max_content_size: usize,
}

impl ResourceStore {
    /// Open the database described by `config`. The default resource is read on
    /// first use.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let db = Database::from_config(&config.database).await?;
        let validator: Arc<dyn ContentValidator> = Arc::new(ImageValidator::new());
        let default = Arc::new(DefaultResourceCache::from_file(
            config.default_resource_path.clone(),
            validator.clone(),
        ));

        info!(
            default_resource = %config.default_resource_path.display(),
            timeout_secs = config.operation_timeout_secs,
            "resource store opened"
        );

        Ok(Self {
            blobs: BlobStore::new(db.clone()),
            db,
            validator,
            default,
            clock: Arc::new(SystemClock),
            timeout: config.operation_timeout(),
            max_content_size: config.max_content_size,
        })
    }

    /// Assemble a store from already-built parts.
    pub fn from_parts(
        db: Database,
        default: Arc<DefaultResourceCache>,
        validator: Arc<dyn ContentValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blobs: BlobStore::new(db.clone()),
            db,
            validator,
            default,
            clock,
            timeout: Duration::from_secs(crate::config::DEFAULT_OPERATION_TIMEOUT_SECS),
            max_content_size: crate::config::DEFAULT_MAX_CONTENT_SIZE,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn default_resource(&self) -> &Arc<DefaultResourceCache> {
        &self.default
    }

    /// Avatar service: square images.
    pub fn avatars(&self) -> ResourceService {
        self.service(
            ResourceKind::AVATAR,
            ContentConstraints::square(self.max_content_size),
        )
    }

    /// Service for any blob-backed kind sharing this store's default resource.
    pub fn service(&self, kind: ResourceKind, constraints: ContentConstraints) -> ResourceService {
        ResourceService::new(kind, self.db.clone(), self.default.clone(), self.validator.clone())
            .with_constraints(constraints)
            .with_clock(self.clock.clone())
            .with_timeout(self.timeout)
    }

    pub async fn create_identity(&self, name: &str) -> Result<Identity> {
        self.db.create_identity(name, self.clock.now()).await
    }

    /// Rename an identity. Owners without custom content serve the default
    /// resource, so its mtime bounds the new name stamp from below.
    pub async fn rename_identity(&self, id: i64, new_name: &str) -> Result<Identity> {
        let default_modified = self.default.digest().await?.last_modified;
        self.db
            .rename_identity(id, new_name, self.clock.now(), Some(default_modified))
            .await
    }

    /// Delete an identity and release every blob its resources held.
    pub async fn delete_identity(&self, id: i64) -> Result<()> {
        self.db.delete_identity(id).await
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}
