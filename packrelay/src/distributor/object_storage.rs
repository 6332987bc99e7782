//! Object-storage pack distributor.
//!
//! Every resolution re-probes the object's metadata: a wrong content type
//! fails the resolution, and a changed last-modified timestamp invalidates
//! the cached content hash so the next hash is computed against the new
//! bytes. The signed URL itself is always freshly minted; reuse within the
//! rate-limit window is the resolution cache's job, not this distributor's.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{PackDescriptor, PackSource};
use crate::config::ObjectStorageConfig;
use crate::hash::sha1_hex;

use super::storage_api::{HmacV1Client, StorageApi};
use super::{BoxFuture, Distributor, DistributorError, ResolvedPack, ARCHIVE_CONTENT_TYPE};

pub struct ObjectStorageDistributor {
    api: Arc<dyn StorageApi>,
    /// Client-facing validity of each minted URL.
    signed_url_expire: Duration,
    /// Last observed upstream modification time per pack id.
    last_modified: DashMap<Uuid, DateTime<Utc>>,
    /// Content hashes, valid only while the upstream object is unchanged.
    content_hashes: DashMap<Uuid, String>,
}

impl ObjectStorageDistributor {
    pub fn new(api: Arc<dyn StorageApi>, signed_url_expire: Duration) -> Self {
        Self {
            api,
            signed_url_expire,
            last_modified: DashMap::new(),
            content_hashes: DashMap::new(),
        }
    }

    pub fn from_config(config: &ObjectStorageConfig) -> Result<Self, DistributorError> {
        let api = HmacV1Client::new(
            &config.endpoint,
            &config.access_key_id,
            &config.access_key_secret,
        )?;
        Ok(Self::new(
            Arc::new(api),
            Duration::from_secs(config.signed_url_expire_secs),
        ))
    }

    async fn resolve_inner(
        &self,
        pack: &PackDescriptor,
    ) -> Result<ResolvedPack, DistributorError> {
        let bucket = match pack.source() {
            PackSource::ObjectStorage { bucket } => bucket,
            other => {
                return Err(DistributorError::UnsupportedSource {
                    name: pack.name().to_string(),
                    kind: other.kind(),
                })
            }
        };
        let key = pack.relative_path();

        let metadata = self.api.head_object(bucket, key).await?;
        if metadata.content_type != ARCHIVE_CONTENT_TYPE {
            return Err(DistributorError::ContentTypeMismatch {
                name: pack.name().to_string(),
                content_type: metadata.content_type,
            });
        }

        // A changed object invalidates its hash before anything else uses it.
        let previous = self.last_modified.insert(pack.id(), metadata.last_modified);
        if previous != Some(metadata.last_modified) {
            if self.content_hashes.remove(&pack.id()).is_some() {
                debug!(pack = %pack.name(), "upstream object changed; dropped cached hash");
            }
        }

        let uri = self.api.presign_get(bucket, key, self.signed_url_expire)?;

        let content_hash = match self.content_hashes.get(&pack.id()) {
            Some(hash) => Some(hash.clone()),
            None => match self.api.get_object(bucket, key).await {
                Ok(bytes) => {
                    let hash = sha1_hex(&bytes);
                    self.content_hashes.insert(pack.id(), hash.clone());
                    Some(hash)
                }
                Err(e) => {
                    warn!(
                        pack = %pack.name(),
                        error = %e,
                        "could not hash pack object; client will hash on receipt"
                    );
                    None
                }
            },
        };

        Ok(ResolvedPack { uri, content_hash })
    }
}

impl Distributor for ObjectStorageDistributor {
    fn resolve<'a>(
        &'a self,
        pack: &'a PackDescriptor,
        _client_id: Uuid,
        _client_addr: IpAddr,
    ) -> BoxFuture<'a, Result<ResolvedPack, DistributorError>> {
        Box::pin(self.resolve_inner(pack))
    }

    fn start(&self) -> BoxFuture<'_, Result<(), DistributorError>> {
        Box::pin(async {
            info!("starting object storage distributor");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {
            info!("stopping object storage distributor");
        })
    }
}
