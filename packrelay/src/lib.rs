//! PackRelay - Content pack distribution for multi-backend game proxies
//!
//! This library keeps each connected client's applied content packs in
//! sync with whatever the client's current backend server requests. The
//! host proxy feeds connection lifecycle events into [`PackCoordinator`];
//! the coordinator reconciles desired versus applied packs, resolves pack
//! addresses through the configured distributors (signed object-storage
//! URLs or a built-in file server), and suspends the client's connection
//! progression until every pack is acknowledged.

pub mod admin;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod distributor;
pub mod gateway;
pub mod hash;
pub mod reconcile;

pub use catalog::{Catalog, PackDescriptor, PackRequest, PackSource};
pub use config::Config;
pub use coordinator::{PackCoordinator, ReloadError, SuspensionHandle};
pub use distributor::{Distributor, DistributorError, DistributorSet, ResolvedPack};
pub use gateway::{ClientGateway, ConnectedClient, OutboundPack, PackBatch, PackStatus};
pub use reconcile::Reconciliation;
