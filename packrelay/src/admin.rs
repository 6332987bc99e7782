//! Administrative operations, as invoked from the host's command layer.
//!
//! Thin wrappers over the coordinator that time the operation and produce
//! a human-readable outcome line for whoever issued the command.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::Config;
use crate::coordinator::{PackCoordinator, ReloadError};

/// Result of one administrative command, ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminOutcome {
    pub elapsed: Duration,
    /// One line describing what happened, e.g. `reloaded 4 packs`.
    pub detail: String,
}

/// Rebuild the catalog and distributors from a freshly parsed config.
/// Connected clients keep their current packs until the next sync or an
/// explicit [`resend`].
pub async fn reload(
    coordinator: &Arc<PackCoordinator>,
    config: &Config,
) -> Result<AdminOutcome, ReloadError> {
    let started = Instant::now();
    coordinator.reload(config).await?;
    let elapsed = started.elapsed();

    info!(?elapsed, "admin reload finished");
    Ok(AdminOutcome {
        elapsed,
        detail: format!("reloaded {} packs", config.packs.len()),
    })
}

/// Strip and re-push packs for every connected client.
pub async fn resend(coordinator: &Arc<PackCoordinator>) -> AdminOutcome {
    let started = Instant::now();
    let clients = coordinator.resend().await;
    let elapsed = started.elapsed();

    info!(?elapsed, clients, "admin resend finished");
    AdminOutcome {
        elapsed,
        detail: format!("resent packs to {clients} clients"),
    }
}
