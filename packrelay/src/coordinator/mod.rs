//! Per-client completion state machine.
//!
//! The host proxy drives this through four hooks tied to its connection
//! lifecycle:
//!
//! 1. `on_pre_connect` — the client is about to switch to a backend;
//!    compute the pack delta and queue it. `NoOp` short-circuits.
//! 2. `on_sync_phase` — the client entered its sync phase; pop the queued
//!    delta, resolve additions concurrently, issue one remove-then-add
//!    batch, and hand back a [`SuspensionHandle`] the host parks the
//!    connection on until every expected acknowledgement arrives.
//! 3. `on_pack_status` — the client reported a terminal status for one
//!    pack; complete the matching future, or treat a mismatch as a fatal
//!    protocol violation.
//! 4. `on_disconnect` — purge the client's state, force-completing any
//!    futures still pending so nothing stays suspended on a gone client.
//!
//! The catalog, distributors, and cache are swapped wholesale on reload;
//! per-client state lives in a concurrent map and is touched only from the
//! client's own event stream plus disconnect.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{ResolutionCache, ResolutionKey};
use crate::catalog::{Catalog, CatalogError};
use crate::config::Config;
use crate::distributor::{DistributorError, DistributorSet};
use crate::gateway::{ClientGateway, OutboundPack, PackBatch, PackStatus};
use crate::reconcile::{self, Reconciliation};

/// Errors from swapping in a fresh configuration.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Distributor(#[from] DistributorError),
}

/// Completes when every acknowledgement registered for a client has
/// arrived (or the client disconnected, which force-completes them).
/// The host parks the client's connection progression on this.
pub struct SuspensionHandle {
    inner: BoxFuture<'static, ()>,
}

impl SuspensionHandle {
    /// A handle that is already complete; the client proceeds immediately.
    pub fn ready() -> Self {
        Self {
            inner: Box::pin(std::future::ready(())),
        }
    }

    fn from_receivers(receivers: Vec<oneshot::Receiver<()>>) -> Self {
        Self {
            inner: Box::pin(async move {
                for receiver in receivers {
                    // A dropped sender counts as completion too; the only
                    // way senders go away is completion or client teardown.
                    let _ = receiver.await;
                }
            }),
        }
    }
}

impl Future for SuspensionHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for SuspensionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SuspensionHandle")
    }
}

/// Everything tracked for one connected client.
#[derive(Default)]
struct PendingClientState {
    /// Address seen at the last sync phase; used to evict resolutions.
    addr: Option<IpAddr>,
    /// Delta computed at pre-connect, awaiting the sync phase.
    queued: Option<Reconciliation>,
    /// Terminal status each in-flight pack must report.
    expected: HashMap<Uuid, PackStatus>,
    /// Completion signal per in-flight pack.
    signals: HashMap<Uuid, oneshot::Sender<()>>,
}

/// Owns the catalog, distributors, and cache, and runs the per-client
/// state machine. Constructed once and passed by handle; there is no
/// ambient global instance.
pub struct PackCoordinator {
    catalog: RwLock<Arc<Catalog>>,
    distributors: RwLock<Arc<DistributorSet>>,
    cache: RwLock<Arc<ResolutionCache>>,
    clients: DashMap<Uuid, PendingClientState>,
    gateway: Arc<dyn ClientGateway>,
}

impl PackCoordinator {
    pub fn new(config: &Config, gateway: Arc<dyn ClientGateway>) -> Result<Self, ReloadError> {
        let catalog = Catalog::from_config(config)?;
        let distributors = DistributorSet::from_config(config)?;
        let cache = ResolutionCache::new(config.resolution_ttl());
        Ok(Self {
            catalog: RwLock::new(Arc::new(catalog)),
            distributors: RwLock::new(Arc::new(distributors)),
            cache: RwLock::new(Arc::new(cache)),
            clients: DashMap::new(),
            gateway,
        })
    }

    /// Start the distributors. Called once after construction.
    pub async fn start(&self) -> Result<(), DistributorError> {
        let distributors = self.distributors.read().clone();
        distributors.start().await
    }

    /// Release distributor resources. Called exactly once at shutdown.
    pub async fn close(&self) {
        let distributors = self.distributors.read().clone();
        distributors.close().await;
    }

    /// Swap in a freshly loaded configuration: new catalog, new
    /// distributors, empty cache. The old distributors are closed after
    /// the swap so in-flight resolutions against them can finish.
    pub async fn reload(&self, config: &Config) -> Result<(), ReloadError> {
        let catalog = Arc::new(Catalog::from_config(config)?);
        let distributors = Arc::new(DistributorSet::from_config(config)?);
        distributors.start().await?;

        *self.catalog.write() = catalog;
        let old = std::mem::replace(&mut *self.distributors.write(), distributors);
        *self.cache.write() = Arc::new(ResolutionCache::new(config.resolution_ttl()));

        old.close().await;
        info!("catalog and distributors reloaded");
        Ok(())
    }

    fn catalog(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    /// The client is about to connect to `target_server`; compute and
    /// queue the delta between that server's request and what the client
    /// reports as applied. A `NoOp` stores nothing.
    pub fn on_pre_connect(&self, client_id: Uuid, target_server: &str, applied: &[Uuid]) {
        let catalog = self.catalog();
        let request = catalog.request_for_server(target_server);
        let delta = reconcile::calculate(request.packs(), applied);

        match &delta {
            Reconciliation::NoOp => {
                info!(%client_id, server = target_server, "packs already in sync");
                return;
            }
            Reconciliation::ClearAll => {
                info!(%client_id, server = target_server, "scheduled removal of all packs");
            }
            Reconciliation::Normal { to_add, to_remove } => {
                let adding: Vec<&str> = to_add.iter().map(|p| p.name()).collect();
                info!(
                    %client_id,
                    server = target_server,
                    adding = ?adding,
                    removing = to_remove.len(),
                    "scheduled pack delta"
                );
            }
        }

        self.clients.entry(client_id).or_default().queued = Some(delta);
    }

    /// The client entered its sync phase. Applies the queued delta and
    /// returns the handle the host must block the client on.
    pub async fn on_sync_phase(
        &self,
        client_id: Uuid,
        client_addr: IpAddr,
        target_server: &str,
    ) -> SuspensionHandle {
        let queued = self
            .clients
            .get_mut(&client_id)
            .and_then(|mut state| state.queued.take());
        let Some(delta) = queued else {
            warn!(%client_id, "sync phase without a queued pack delta");
            return SuspensionHandle::ready();
        };

        match delta {
            Reconciliation::NoOp => {
                // Pre-connect never queues NoOp.
                error!(%client_id, "NoOp delta reached the sync phase");
                SuspensionHandle::ready()
            }
            Reconciliation::ClearAll => {
                info!(%client_id, server = target_server, "clearing all known packs");
                // Removal produces no client acknowledgement; nothing to
                // suspend on.
                self.gateway
                    .remove_packs(client_id, &self.catalog().known_pack_ids());
                SuspensionHandle::ready()
            }
            Reconciliation::Normal { to_add, to_remove } => {
                self.apply_normal_delta(client_id, client_addr, target_server, to_add, to_remove)
                    .await
            }
        }
    }

    async fn apply_normal_delta(
        &self,
        client_id: Uuid,
        client_addr: IpAddr,
        target_server: &str,
        to_add: Vec<Arc<crate::catalog::PackDescriptor>>,
        to_remove: Vec<Uuid>,
    ) -> SuspensionHandle {
        let catalog = self.catalog();
        let distributors = self.distributors.read().clone();
        let cache = self.cache.read().clone();

        // Resolve every addition concurrently; the cache collapses
        // duplicate in-flight work per key.
        let resolutions = futures::future::join_all(to_add.iter().map(|pack| {
            let key = ResolutionKey {
                client_id,
                client_addr,
                pack_id: pack.id(),
            };
            let cache = cache.clone();
            let distributors = distributors.clone();
            let pack = pack.clone();
            async move {
                let result = cache.resolve(key, distributors, pack.clone()).await;
                (pack, result)
            }
        }))
        .await;

        let mut add = Vec::with_capacity(resolutions.len());
        let mut resolved_ids = Vec::with_capacity(resolutions.len());
        for (pack, result) in resolutions {
            match result {
                Ok(resolved) => {
                    resolved_ids.push(pack.id());
                    add.push(OutboundPack {
                        id: pack.id(),
                        uri: resolved.uri,
                        content_hash: resolved.content_hash,
                    });
                }
                // One bad pack never aborts the batch; it is just skipped.
                Err(e) => error!(
                    %client_id,
                    pack = %pack.name(),
                    error = %e,
                    "pack resolution failed; excluding it from this batch"
                ),
            }
        }

        if add.is_empty() && to_remove.is_empty() {
            warn!(%client_id, "nothing left to apply after failed resolutions");
            return SuspensionHandle::ready();
        }

        let mut receivers = Vec::with_capacity(add.len());
        {
            let mut state = self.clients.entry(client_id).or_default();
            state.addr = Some(client_addr);
            for pack_id in &resolved_ids {
                let (tx, rx) = oneshot::channel();
                state.expected.insert(*pack_id, PackStatus::Successful);
                state.signals.insert(*pack_id, tx);
                receivers.push(rx);
            }
        }

        let request = catalog.request_for_server(target_server);
        info!(
            %client_id,
            server = target_server,
            adding = add.len(),
            removing = to_remove.len(),
            "issuing pack batch"
        );
        self.gateway.apply_packs(
            client_id,
            PackBatch {
                remove: to_remove,
                add,
                enforce: request.enforce(),
                prompt: request.prompt().map(str::to_string),
            },
        );

        SuspensionHandle::from_receivers(receivers)
    }

    /// The client reported a terminal status for one pack.
    ///
    /// An untracked pack id is ignored. A tracked id with the expected
    /// status completes its future; any other status means client and
    /// server state diverged in a way local retry cannot fix, so the
    /// client is disconnected.
    pub async fn on_pack_status(&self, client_id: Uuid, pack_id: Uuid, status: PackStatus) {
        if !status.is_terminal() {
            debug!(%client_id, %pack_id, %status, "ignoring intermediate pack status");
            return;
        }

        let verdict = {
            let Some(mut state) = self.clients.get_mut(&client_id) else {
                debug!(%client_id, %pack_id, "status for an untracked client");
                return;
            };
            let Some(expected) = state.expected.get(&pack_id).copied() else {
                debug!(%client_id, %pack_id, "status for an untracked pack");
                return;
            };
            state.expected.remove(&pack_id);
            if status == expected {
                if let Some(tx) = state.signals.remove(&pack_id) {
                    let _ = tx.send(());
                }
                None
            } else {
                Some((expected, state.addr))
            }
        };

        match verdict {
            None => {
                info!(%client_id, %pack_id, %status, "pack acknowledged");
            }
            Some((expected, addr)) => {
                error!(
                    %client_id,
                    %pack_id,
                    %status,
                    %expected,
                    "unexpected terminal pack status; disconnecting client"
                );
                // The broken resolution must not be replayed on the next
                // attempt.
                if let Some(addr) = addr {
                    let cache = self.cache.read().clone();
                    cache
                        .evict(&ResolutionKey {
                            client_id,
                            client_addr: addr,
                            pack_id,
                        })
                        .await;
                }
                self.gateway
                    .disconnect(client_id, "Error applying content pack");
            }
        }
    }

    /// Connection teardown. Force-completes every pending future so no
    /// task stays suspended on a client that is gone.
    pub fn on_disconnect(&self, client_id: Uuid) {
        if let Some((_, state)) = self.clients.remove(&client_id) {
            let pending = state.signals.len();
            for (_, tx) in state.signals {
                let _ = tx.send(());
            }
            debug!(%client_id, pending, "purged pending pack state");
        }
    }

    /// Administrative re-push: strip every connected client of all known
    /// packs, then re-run the sync procedure against each client's
    /// current backend. Returns the number of clients refreshed; it does
    /// not wait for their acknowledgements.
    pub async fn resend(&self) -> usize {
        let catalog = self.catalog();
        let known = catalog.known_pack_ids();
        let clients = self.gateway.connected_clients();

        for client in &clients {
            self.gateway.remove_packs(client.id, &known);

            let request = catalog.request_for_server(&client.server);
            // Everything was just removed, so reconcile against nothing.
            let delta = reconcile::calculate(request.packs(), &[]);
            match delta {
                Reconciliation::NoOp | Reconciliation::ClearAll => continue,
                normal @ Reconciliation::Normal { .. } => {
                    self.clients.entry(client.id).or_default().queued = Some(normal);
                    // Acknowledgements flow through on_pack_status as
                    // usual; resend itself does not suspend on them.
                    let _ = self
                        .on_sync_phase(client.id, client.addr, &client.server)
                        .await;
                }
            }
        }

        info!(clients = clients.len(), "packs resent to connected clients");
        clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PackConfig, RequestConfig, StorageKindConfig};
    use crate::gateway::{ConnectedClient, PackBatch};
    use futures::FutureExt;
    use parking_lot::Mutex;
    use url::Url;

    /// Records every instruction the coordinator would send over the wire.
    #[derive(Default)]
    struct MockGateway {
        removals: Mutex<Vec<(Uuid, Vec<Uuid>)>>,
        batches: Mutex<Vec<(Uuid, PackBatch)>>,
        disconnects: Mutex<Vec<(Uuid, String)>>,
        clients: Mutex<Vec<ConnectedClient>>,
    }

    impl ClientGateway for MockGateway {
        fn remove_packs(&self, client_id: Uuid, pack_ids: &[Uuid]) {
            self.removals.lock().push((client_id, pack_ids.to_vec()));
        }

        fn apply_packs(&self, client_id: Uuid, batch: PackBatch) {
            self.batches.lock().push((client_id, batch));
        }

        fn disconnect(&self, client_id: Uuid, reason: &str) {
            self.disconnects.lock().push((client_id, reason.to_string()));
        }

        fn connected_clients(&self) -> Vec<ConnectedClient> {
            self.clients.lock().clone()
        }
    }

    /// External packs need no backend, so they exercise the full pipeline
    /// without any distributor configured.
    fn external_pack(name: &str) -> PackConfig {
        PackConfig {
            id: Uuid::new_v4(),
            name: name.to_string(),
            storage: StorageKindConfig::External,
            path: String::new(),
            bucket: None,
            uri: Some(Url::parse(&format!("https://cdn.example.com/{name}.zip")).unwrap()),
            content_hash: None,
        }
    }

    fn config_for_lobby(packs: Vec<PackConfig>) -> Config {
        let names = packs.iter().map(|p| p.name.clone()).collect();
        let mut servers = HashMap::new();
        servers.insert(
            "lobby".to_string(),
            RequestConfig {
                packs: names,
                enforce: true,
                prompt: Some("Packs required".into()),
            },
        );
        Config {
            object_storage: None,
            self_hosted: None,
            packs,
            default_request: None,
            servers,
        }
    }

    fn coordinator(config: &Config) -> (Arc<PackCoordinator>, Arc<MockGateway>) {
        let gateway = Arc::new(MockGateway::default());
        let coordinator = PackCoordinator::new(config, gateway.clone()).unwrap();
        (Arc::new(coordinator), gateway)
    }

    fn addr() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    #[tokio::test]
    async fn test_in_sync_client_triggers_no_traffic() {
        let config = config_for_lobby(vec![external_pack("base")]);
        let applied: Vec<Uuid> = config.packs.iter().map(|p| p.id).collect();
        let (coordinator, gateway) = coordinator(&config);
        let client = Uuid::new_v4();

        coordinator.on_pre_connect(client, "lobby", &applied);
        let handle = coordinator.on_sync_phase(client, addr(), "lobby").await;

        handle.await;
        assert!(gateway.batches.lock().is_empty());
        assert!(gateway.removals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_phase_without_queued_delta_is_ready() {
        let config = config_for_lobby(vec![external_pack("base")]);
        let (coordinator, gateway) = coordinator(&config);

        let handle = coordinator
            .on_sync_phase(Uuid::new_v4(), addr(), "lobby")
            .await;

        handle.await;
        assert!(gateway.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_full_sync_suspends_until_all_packs_acknowledged() {
        let config = config_for_lobby(vec![external_pack("base"), external_pack("extras")]);
        let pack_ids: Vec<Uuid> = config.packs.iter().map(|p| p.id).collect();
        let (coordinator, gateway) = coordinator(&config);
        let client = Uuid::new_v4();

        coordinator.on_pre_connect(client, "lobby", &[]);
        let mut handle = coordinator.on_sync_phase(client, addr(), "lobby").await;

        {
            let batches = gateway.batches.lock();
            assert_eq!(batches.len(), 1);
            let (to, batch) = &batches[0];
            assert_eq!(*to, client);
            assert_eq!(batch.add.len(), 2);
            assert!(batch.remove.is_empty());
            assert!(batch.enforce);
            assert_eq!(batch.prompt.as_deref(), Some("Packs required"));
        }

        assert!((&mut handle).now_or_never().is_none());

        coordinator
            .on_pack_status(client, pack_ids[0], PackStatus::Successful)
            .await;
        assert!((&mut handle).now_or_never().is_none());

        coordinator
            .on_pack_status(client, pack_ids[1], PackStatus::Successful)
            .await;
        handle.await;
        assert!(gateway.disconnects.lock().is_empty());
    }

    #[tokio::test]
    async fn test_intermediate_status_does_not_complete() {
        let config = config_for_lobby(vec![external_pack("base")]);
        let pack_id = config.packs[0].id;
        let (coordinator, gateway) = coordinator(&config);
        let client = Uuid::new_v4();

        coordinator.on_pre_connect(client, "lobby", &[]);
        let mut handle = coordinator.on_sync_phase(client, addr(), "lobby").await;

        coordinator
            .on_pack_status(client, pack_id, PackStatus::Accepted)
            .await;
        coordinator
            .on_pack_status(client, pack_id, PackStatus::Downloaded)
            .await;
        assert!((&mut handle).now_or_never().is_none());
        assert!(gateway.disconnects.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_terminal_status_disconnects() {
        let config = config_for_lobby(vec![external_pack("base")]);
        let pack_id = config.packs[0].id;
        let (coordinator, gateway) = coordinator(&config);
        let client = Uuid::new_v4();

        coordinator.on_pre_connect(client, "lobby", &[]);
        let _handle = coordinator.on_sync_phase(client, addr(), "lobby").await;

        coordinator
            .on_pack_status(client, pack_id, PackStatus::FailedDownload)
            .await;

        let disconnects = gateway.disconnects.lock();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].0, client);
        assert_eq!(disconnects[0].1, "Error applying content pack");
    }

    #[tokio::test]
    async fn test_status_for_untracked_pack_is_ignored() {
        let config = config_for_lobby(vec![external_pack("base")]);
        let (coordinator, gateway) = coordinator(&config);
        let client = Uuid::new_v4();

        coordinator.on_pre_connect(client, "lobby", &[]);
        let _handle = coordinator.on_sync_phase(client, addr(), "lobby").await;

        coordinator
            .on_pack_status(client, Uuid::new_v4(), PackStatus::Declined)
            .await;
        assert!(gateway.disconnects.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_force_completes_pending_futures() {
        let config = config_for_lobby(vec![external_pack("base")]);
        let (coordinator, _gateway) = coordinator(&config);
        let client = Uuid::new_v4();

        coordinator.on_pre_connect(client, "lobby", &[]);
        let mut handle = coordinator.on_sync_phase(client, addr(), "lobby").await;
        assert!((&mut handle).now_or_never().is_none());

        coordinator.on_disconnect(client);
        handle.await;
    }

    #[tokio::test]
    async fn test_empty_request_clears_applied_packs() {
        // "other" has no request and there is no default, so a client
        // arriving with packs applied must lose all of them.
        let config = config_for_lobby(vec![external_pack("base")]);
        let known: Vec<Uuid> = config.packs.iter().map(|p| p.id).collect();
        let (coordinator, gateway) = coordinator(&config);
        let client = Uuid::new_v4();

        coordinator.on_pre_connect(client, "other", &known);
        let handle = coordinator.on_sync_phase(client, addr(), "other").await;
        handle.await;

        let removals = gateway.removals.lock();
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].1, known);
        assert!(gateway.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_resend_strips_and_reissues_per_client() {
        let config = config_for_lobby(vec![external_pack("base")]);
        let (coordinator, gateway) = coordinator(&config);
        let client = Uuid::new_v4();
        gateway.clients.lock().push(ConnectedClient {
            id: client,
            addr: addr(),
            server: "lobby".to_string(),
        });

        let refreshed = coordinator.resend().await;

        assert_eq!(refreshed, 1);
        assert_eq!(gateway.removals.lock().len(), 1);
        let batches = gateway.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.add.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_swaps_in_the_new_catalog() {
        let config = config_for_lobby(vec![external_pack("base")]);
        let (coordinator, gateway) = coordinator(&config);
        let client = Uuid::new_v4();

        let replacement = config_for_lobby(vec![external_pack("seasonal")]);
        coordinator.reload(&replacement).await.unwrap();

        coordinator.on_pre_connect(client, "lobby", &[]);
        let handle = coordinator.on_sync_phase(client, addr(), "lobby").await;
        handle.await;

        let batches = gateway.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.add[0].id, replacement.packs[0].id);
        assert!(batches[0].1.add[0].uri.as_str().contains("seasonal.zip"));
    }
}
