//! In-memory configuration model.
//!
//! The host proxy owns configuration files and hot reload; it hands this
//! crate a fully parsed [`Config`] and swaps in a fresh one on reload. The
//! structs here are plain serde-derived data so any format the host speaks
//! (YAML, TOML, JSON) deserializes into them directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Default validity of a freshly minted signed URL (seconds).
pub const DEFAULT_SIGNED_URL_EXPIRE_SECS: u64 = 1800;

/// Default window during which a resolution is reused instead of minting a
/// fresh one (seconds). Doubles as the client-facing rate limit.
pub const DEFAULT_MIN_REFRESH_INTERVAL_SECS: u64 = 300;

/// Top-level configuration supplied by the host's configuration loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Object-storage distributor settings; absent disables that backend.
    #[serde(default)]
    pub object_storage: Option<ObjectStorageConfig>,

    /// Self-hosted distributor settings; absent disables that backend.
    #[serde(default)]
    pub self_hosted: Option<SelfHostedConfig>,

    /// Every pack this deployment knows about.
    #[serde(default)]
    pub packs: Vec<PackConfig>,

    /// The request applied to servers without an explicit entry.
    #[serde(default)]
    pub default_request: Option<RequestConfig>,

    /// Per-server pack requests, keyed by backend server name.
    #[serde(default)]
    pub servers: HashMap<String, RequestConfig>,
}

impl Config {
    /// TTL of the resolution cache.
    ///
    /// Rate limiting and URL staleness share this window; the signed-URL
    /// validity is a separate, independent duration.
    pub fn resolution_ttl(&self) -> Duration {
        let secs = self
            .object_storage
            .as_ref()
            .map(|c| c.min_refresh_interval_secs)
            .unwrap_or(DEFAULT_MIN_REFRESH_INTERVAL_SECS);
        Duration::from_secs(secs)
    }
}

/// Credentials and tuning for the object-storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// API endpoint host, e.g. `storage.example-region.example.com`.
    /// No scheme; requests always go over HTTPS.
    pub endpoint: String,

    pub access_key_id: String,

    pub access_key_secret: String,

    /// Client-facing validity of a minted signed URL.
    #[serde(default = "default_signed_url_expire_secs")]
    pub signed_url_expire_secs: u64,

    /// How long a resolution may be reused before a fresh signed URL is
    /// minted. Also the per-client rate-limit window.
    #[serde(default = "default_min_refresh_interval_secs")]
    pub min_refresh_interval_secs: u64,
}

fn default_signed_url_expire_secs() -> u64 {
    DEFAULT_SIGNED_URL_EXPIRE_SECS
}

fn default_min_refresh_interval_secs() -> u64 {
    DEFAULT_MIN_REFRESH_INTERVAL_SECS
}

/// Settings for the built-in pack file server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfHostedConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Hostname placed in client-facing URIs. Not the bind address; the
    /// server itself listens on the wildcard address.
    pub advertised_host: String,

    pub port: u16,

    /// Reject HTTP requests that lack a recognized client fingerprint.
    /// Best-effort anti-hotlinking, not authentication.
    #[serde(default)]
    pub strict_client_only: bool,

    /// Local directory the served files live under.
    pub root_dir: PathBuf,
}

/// Which backend holds a pack's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKindConfig {
    /// Distributed by someone else entirely; `uri` must be set.
    External,
    /// Lives in an object-storage bucket; `bucket` must be set.
    ObjectStorage,
    /// Served by the built-in file server.
    SelfHosted,
}

/// One pack definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackConfig {
    /// Stable identity. Never reuse an id for different content.
    pub id: Uuid,

    /// Human key, unique within the catalog.
    pub name: String,

    pub storage: StorageKindConfig,

    /// Backend-relative path, e.g. `packs/base.zip`. Unused for external
    /// packs.
    #[serde(default)]
    pub path: String,

    /// Bucket name for object-storage packs.
    #[serde(default)]
    pub bucket: Option<String>,

    /// Fixed download address for external packs.
    #[serde(default)]
    pub uri: Option<Url>,

    /// Optional fixed content hash for external packs.
    #[serde(default)]
    pub content_hash: Option<String>,
}

/// A pack request attached to a server (or the default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Pack names in application order. Order is observable to clients.
    pub packs: Vec<String>,

    /// Whether the client must not proceed without applying the packs.
    #[serde(default)]
    pub enforce: bool,

    /// Optional styled prompt shown to the client.
    #[serde(default)]
    pub prompt: Option<String>,
}
