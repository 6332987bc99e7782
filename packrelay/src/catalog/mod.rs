//! The pack catalog: every pack this deployment can distribute, plus the
//! pack request each backend server expects.
//!
//! Loaded once from host-supplied configuration and read-only afterwards;
//! a reload builds a whole new catalog and swaps it in. Unknown pack names
//! referenced by a request are dropped with a warning rather than failing
//! the load, so one bad reference cannot block startup.

mod types;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::config::{Config, PackConfig, RequestConfig, StorageKindConfig};

pub use types::{PackDescriptor, PackRequest, PackSource};

/// Errors raised while building a catalog from configuration.
///
/// These are definition errors (a broken pack entry), not reference errors;
/// a request naming an unknown pack is soft-failed instead.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("pack `{name}` has an absolute path; paths must be backend-relative")]
    AbsolutePath { name: String },

    #[error("pack `{name}` has an empty path")]
    EmptyPath { name: String },

    #[error("pack `{name}` path contains traversal segments")]
    PathTraversal { name: String },

    #[error("object-storage pack `{name}` does not name a bucket")]
    MissingBucket { name: String },

    #[error("external pack `{name}` does not provide a uri")]
    MissingUri { name: String },

    #[error("duplicate pack name `{0}`")]
    DuplicateName(String),

    #[error("duplicate pack id `{0}`")]
    DuplicateId(Uuid),
}

/// Read-only registry of packs and per-server pack requests.
#[derive(Debug)]
pub struct Catalog {
    by_id: HashMap<Uuid, Arc<PackDescriptor>>,
    by_name: HashMap<String, Arc<PackDescriptor>>,
    default_request: PackRequest,
    server_requests: HashMap<String, PackRequest>,
}

impl Catalog {
    /// Build a catalog from host-supplied configuration.
    ///
    /// Pack definitions are validated strictly; pack *references* inside
    /// requests follow the soft-fail policy (warn and drop).
    pub fn from_config(config: &Config) -> Result<Self, CatalogError> {
        let mut by_id: HashMap<Uuid, Arc<PackDescriptor>> = HashMap::new();
        let mut by_name: HashMap<String, Arc<PackDescriptor>> = HashMap::new();

        for pack in &config.packs {
            let descriptor = Arc::new(descriptor_from_config(pack)?);
            if by_id.contains_key(&descriptor.id()) {
                return Err(CatalogError::DuplicateId(descriptor.id()));
            }
            if by_name.contains_key(descriptor.name()) {
                return Err(CatalogError::DuplicateName(descriptor.name().to_string()));
            }
            by_id.insert(descriptor.id(), descriptor.clone());
            by_name.insert(descriptor.name().to_string(), descriptor);
        }

        let default_request = config
            .default_request
            .as_ref()
            .map(|request| build_request(request, &by_name, "default"))
            .unwrap_or(PackRequest::Empty);

        let server_requests = config
            .servers
            .iter()
            .map(|(server, request)| {
                (server.clone(), build_request(request, &by_name, server))
            })
            .collect();

        Ok(Self {
            by_id,
            by_name,
            default_request,
            server_requests,
        })
    }

    pub fn pack_by_id(&self, id: Uuid) -> Option<&Arc<PackDescriptor>> {
        self.by_id.get(&id)
    }

    pub fn pack_by_name(&self, name: &str) -> Option<&Arc<PackDescriptor>> {
        self.by_name.get(name)
    }

    pub fn default_request(&self) -> &PackRequest {
        &self.default_request
    }

    /// The pack request for a server, falling back to the default when the
    /// server has no explicit entry. Unknown server names are not an error.
    pub fn request_for_server(&self, server: &str) -> &PackRequest {
        self.server_requests
            .get(server)
            .unwrap_or(&self.default_request)
    }

    /// Ids of every pack this catalog knows. Used for "remove everything"
    /// instructions, which only ever touch packs this system manages.
    pub fn known_pack_ids(&self) -> Vec<Uuid> {
        self.by_id.keys().copied().collect()
    }

    pub fn pack_count(&self) -> usize {
        self.by_id.len()
    }
}

fn descriptor_from_config(pack: &PackConfig) -> Result<PackDescriptor, CatalogError> {
    let source = match pack.storage {
        StorageKindConfig::External => {
            let uri: &Url = pack.uri.as_ref().ok_or_else(|| CatalogError::MissingUri {
                name: pack.name.clone(),
            })?;
            PackSource::External {
                uri: uri.clone(),
                content_hash: pack.content_hash.clone(),
            }
        }
        StorageKindConfig::ObjectStorage => {
            let bucket = pack
                .bucket
                .as_ref()
                .ok_or_else(|| CatalogError::MissingBucket {
                    name: pack.name.clone(),
                })?;
            PackSource::ObjectStorage {
                bucket: bucket.clone(),
            }
        }
        StorageKindConfig::SelfHosted => PackSource::SelfHosted,
    };

    PackDescriptor::new(pack.id, pack.name.clone(), source, pack.path.clone())
}

/// Resolve a request's pack names against the catalog, dropping unknown
/// references with a warning.
fn build_request(
    request: &RequestConfig,
    by_name: &HashMap<String, Arc<PackDescriptor>>,
    owner: &str,
) -> PackRequest {
    let mut packs = Vec::with_capacity(request.packs.len());
    for name in &request.packs {
        match by_name.get(name) {
            Some(descriptor) => packs.push(descriptor.clone()),
            None => warn!(
                pack = %name,
                request = %owner,
                "pack request references an undefined pack; dropping it"
            ),
        }
    }
    PackRequest::new(packs, request.enforce, request.prompt.clone())
}
