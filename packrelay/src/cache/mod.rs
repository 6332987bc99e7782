//! Per-(client, address, pack) memoization of resolved packs.
//!
//! Backed by `moka::future::Cache`: lock-free reads, and `try_get_with`
//! guarantees at most one in-flight resolution per key — concurrent
//! requesters share the same load, so repeated requests inside the TTL
//! window can never hammer the storage origin. Failed loads are never
//! cached, so a client's next attempt after an upstream failure retries
//! cleanly.
//!
//! TTL expiry is normal operation (logged at debug); *eviction* is the
//! explicit act of dropping a key after a failed or declined download so
//! the client's next attempt gets a fresh resolution.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use moka::notification::RemovalCause;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::PackDescriptor;
use crate::distributor::{DistributorError, DistributorSet, ResolvedPack};

/// Cache key: one resolution per client identity, client address, and pack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub client_id: Uuid,
    pub client_addr: IpAddr,
    pub pack_id: Uuid,
}

pub struct ResolutionCache {
    inner: Cache<ResolutionKey, ResolvedPack>,
}

impl ResolutionCache {
    /// `ttl` is the rate-limit window: how long a resolution is reused
    /// before a fresh one is loaded. Capacity is unbounded; entries are
    /// small and expire on their own.
    pub fn new(ttl: Duration) -> Self {
        let inner = Cache::builder()
            .time_to_live(ttl)
            .eviction_listener(|key: Arc<ResolutionKey>, _value, cause| {
                if cause == RemovalCause::Expired {
                    debug!(?key, "resolution expired");
                }
            })
            .build();
        Self { inner }
    }

    /// Return the cached resolution for `key`, loading it through the
    /// pack's distributor on a miss. Concurrent calls for the same key
    /// collapse to a single upstream resolution.
    pub async fn resolve(
        &self,
        key: ResolutionKey,
        distributors: Arc<DistributorSet>,
        pack: Arc<PackDescriptor>,
    ) -> Result<ResolvedPack, Arc<DistributorError>> {
        let client_id = key.client_id;
        let client_addr = key.client_addr;
        self.inner
            .try_get_with(key, async move {
                distributors.resolve(&pack, client_id, client_addr).await
            })
            .await
    }

    /// Explicitly drop one key, e.g. after a failed or declined download.
    pub async fn evict(&self, key: &ResolutionKey) {
        self.inner.invalidate(key).await;
        debug!(?key, "resolution evicted");
    }

    /// Drop everything. Used when distributors are replaced on reload.
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}
