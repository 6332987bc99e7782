//! Content-delivery backends.
//!
//! A distributor turns a catalog entry into a client-fetchable address.
//! Two real backends exist — object storage (signed URLs) and a self-hosted
//! file server — plus the trivial pass-through for external packs whose
//! address is fixed in configuration.
//!
//! The trait uses `Pin<Box<dyn Future>>` so distributors work as trait
//! objects; the underlying network clients are shared, long-lived, and
//! closed exactly once at shutdown.

mod object_storage;
mod self_hosted;
mod storage_api;

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::catalog::{PackDescriptor, PackSource};
use crate::config::Config;

pub use object_storage::ObjectStorageDistributor;
pub use self_hosted::SelfHostedDistributor;
pub use storage_api::{HmacV1Client, ObjectMetadata, StorageApi, StorageError};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Content type every distributed archive must report.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Errors raised while resolving a pack to a fetchable address.
///
/// A resolution failure skips the pack for that client; it never crashes
/// the coordinator or aborts the rest of a batch.
#[derive(Debug, Error)]
pub enum DistributorError {
    /// Object metadata disagrees with the expected archive type.
    #[error("pack `{name}` is not a zip archive (upstream content type `{content_type}`)")]
    ContentTypeMismatch { name: String, content_type: String },

    /// Storage API failure. The resolution is not cached, so the client's
    /// next attempt retries cleanly.
    #[error("upstream storage unavailable: {0}")]
    Upstream(#[from] StorageError),

    /// Local pack file could not be read.
    #[error("pack file unreadable: {0}")]
    Io(#[from] std::io::Error),

    /// A generated address did not form a valid URL.
    #[error("generated address is not a valid URL: {0}")]
    InvalidUri(#[from] url::ParseError),

    /// The pack names a backend this deployment has not configured.
    #[error("no distributor configured for `{kind}` packs")]
    NotConfigured { kind: &'static str },

    /// The pack was routed to a distributor for a different backend.
    #[error("pack `{name}` is a `{kind}` pack; wrong distributor")]
    UnsupportedSource { name: String, kind: &'static str },
}

/// A pack descriptor's client-facing resolution result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPack {
    /// Fetchable address; time-limited for object-storage packs.
    pub uri: Url,
    /// Absent forces the client to hash on receipt.
    pub content_hash: Option<String>,
}

/// Common contract of every content-delivery backend.
pub trait Distributor: Send + Sync {
    /// Produce a client-fetchable address (and hash, when cheaply known)
    /// for a pack. Runs on the async runtime; never blocks host dispatch.
    fn resolve<'a>(
        &'a self,
        pack: &'a PackDescriptor,
        client_id: Uuid,
        client_addr: IpAddr,
    ) -> BoxFuture<'a, Result<ResolvedPack, DistributorError>>;

    /// Start the backend (bind servers, validate clients). Called once.
    fn start(&self) -> BoxFuture<'_, Result<(), DistributorError>>;

    /// Release the backend's resources. Called exactly once at shutdown.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// The configured distributors, routed by a pack's storage kind.
///
/// External packs short-circuit here: their address is fixed, so no
/// backend is consulted at all.
pub struct DistributorSet {
    object_storage: Option<Arc<ObjectStorageDistributor>>,
    self_hosted: Option<Arc<SelfHostedDistributor>>,
}

impl DistributorSet {
    pub fn new(
        object_storage: Option<Arc<ObjectStorageDistributor>>,
        self_hosted: Option<Arc<SelfHostedDistributor>>,
    ) -> Self {
        Self {
            object_storage,
            self_hosted,
        }
    }

    /// Build the set from host configuration. Backends without a config
    /// section are simply absent.
    pub fn from_config(config: &Config) -> Result<Self, DistributorError> {
        let object_storage = config
            .object_storage
            .as_ref()
            .map(ObjectStorageDistributor::from_config)
            .transpose()?
            .map(Arc::new);
        let self_hosted = config
            .self_hosted
            .as_ref()
            .map(|c| Arc::new(SelfHostedDistributor::from_config(c)));
        Ok(Self {
            object_storage,
            self_hosted,
        })
    }

    pub async fn start(&self) -> Result<(), DistributorError> {
        if let Some(dist) = &self.object_storage {
            dist.start().await?;
        }
        if let Some(dist) = &self.self_hosted {
            dist.start().await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(dist) = &self.self_hosted {
            dist.close().await;
        }
        if let Some(dist) = &self.object_storage {
            dist.close().await;
        }
    }

    /// Route a pack to its backend and resolve it.
    pub async fn resolve(
        &self,
        pack: &PackDescriptor,
        client_id: Uuid,
        client_addr: IpAddr,
    ) -> Result<ResolvedPack, DistributorError> {
        match pack.source() {
            PackSource::External { uri, content_hash } => Ok(ResolvedPack {
                uri: uri.clone(),
                content_hash: content_hash.clone(),
            }),
            PackSource::ObjectStorage { .. } => {
                let dist =
                    self.object_storage
                        .as_ref()
                        .ok_or(DistributorError::NotConfigured {
                            kind: "object_storage",
                        })?;
                dist.resolve(pack, client_id, client_addr).await
            }
            PackSource::SelfHosted => {
                let dist = self
                    .self_hosted
                    .as_ref()
                    .ok_or(DistributorError::NotConfigured { kind: "self_hosted" })?;
                dist.resolve(pack, client_id, client_addr).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (Uuid, IpAddr) {
        (Uuid::new_v4(), "203.0.113.7".parse().unwrap())
    }

    #[tokio::test]
    async fn test_external_pack_resolves_without_backends() {
        let set = DistributorSet::new(None, None);
        let uri = Url::parse("https://cdn.example.com/base.zip").unwrap();
        let pack = PackDescriptor::new(
            Uuid::new_v4(),
            "base",
            PackSource::External {
                uri: uri.clone(),
                content_hash: Some("abc123".into()),
            },
            "",
        )
        .unwrap();

        let (id, addr) = client();
        let resolved = set.resolve(&pack, id, addr).await.unwrap();
        assert_eq!(resolved.uri, uri);
        assert_eq!(resolved.content_hash.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_unconfigured_backend_is_an_error() {
        let set = DistributorSet::new(None, None);
        let pack =
            PackDescriptor::new(Uuid::new_v4(), "base", PackSource::SelfHosted, "base.zip")
                .unwrap();

        let (id, addr) = client();
        let result = set.resolve(&pack, id, addr).await;
        assert!(matches!(
            result,
            Err(DistributorError::NotConfigured { kind: "self_hosted" })
        ));
    }
}
