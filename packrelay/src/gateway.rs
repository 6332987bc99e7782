//! The host-proxy collaborator seam.
//!
//! The coordinator never talks to clients directly; it issues instructions
//! through [`ClientGateway`], which the host implements on top of its own
//! connection layer. The trait exists for dependency injection and test
//! doubles — a mock gateway records what would have gone over the wire.

use std::fmt;
use std::net::IpAddr;

use url::Url;
use uuid::Uuid;

/// A client's report on one pack, as forwarded by the host.
///
/// Intermediate statuses describe progress; only terminal ones complete a
/// registered completion future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackStatus {
    /// Client accepted the download prompt (intermediate).
    Accepted,
    /// Archive finished downloading (intermediate).
    Downloaded,
    /// Pack applied successfully (terminal).
    Successful,
    /// Client refused the pack (terminal).
    Declined,
    /// Download failed (terminal).
    FailedDownload,
    /// Archive downloaded but could not be applied (terminal).
    FailedApply,
    /// Client dropped the pack, e.g. on disconnect (terminal).
    Discarded,
}

impl PackStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PackStatus::Accepted | PackStatus::Downloaded)
    }
}

impl fmt::Display for PackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackStatus::Accepted => "accepted",
            PackStatus::Downloaded => "downloaded",
            PackStatus::Successful => "successful",
            PackStatus::Declined => "declined",
            PackStatus::FailedDownload => "failed_download",
            PackStatus::FailedApply => "failed_apply",
            PackStatus::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// A resolved pack ready to hand to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPack {
    pub id: Uuid,
    /// Fetchable address; time-limited for object-storage packs.
    pub uri: Url,
    /// Absent forces the client to hash the archive on receipt.
    pub content_hash: Option<String>,
}

/// One batched instruction: remove these ids, then add these packs.
#[derive(Debug, Clone, PartialEq)]
pub struct PackBatch {
    pub remove: Vec<Uuid>,
    pub add: Vec<OutboundPack>,
    /// Client must not proceed without applying the additions.
    pub enforce: bool,
    pub prompt: Option<String>,
}

/// A client currently connected through the proxy.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub id: Uuid,
    pub addr: IpAddr,
    /// Name of the backend server the client is on.
    pub server: String,
}

/// Instructions the coordinator can issue to the host proxy.
///
/// All methods are fire-and-forget from the coordinator's view: the host
/// queues packets on its own connection machinery. Acknowledgements come
/// back later through the coordinator's status hook.
pub trait ClientGateway: Send + Sync {
    /// Tell a client to drop these packs. Produces no acknowledgement.
    fn remove_packs(&self, client_id: Uuid, pack_ids: &[Uuid]);

    /// Send a remove-then-add batch to a client.
    fn apply_packs(&self, client_id: Uuid, batch: PackBatch);

    /// Disconnect a client with a short explanatory message.
    fn disconnect(&self, client_id: Uuid, reason: &str);

    /// Every client currently connected, for administrative resends.
    fn connected_clients(&self) -> Vec<ConnectedClient>;
}
