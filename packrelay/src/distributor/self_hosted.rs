//! Self-hosted pack distributor: a static URI scheme plus a built-in HTTP
//! file server over a local directory.
//!
//! Resolution never goes over the network — the URI is computed from
//! configuration and the content hash is read straight off the local file,
//! since this distributor owns the bytes it serves. The `strict_client_only`
//! flag gates the HTTP side behind a recognized client fingerprint; that is
//! best-effort anti-hotlinking, not authentication.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::catalog::PackDescriptor;
use crate::config::SelfHostedConfig;
use crate::hash::sha1_hex_file;

use super::{BoxFuture, Distributor, DistributorError, ResolvedPack, ARCHIVE_CONTENT_TYPE};

/// Headers a recognized client always sends when fetching a pack.
pub const CLIENT_FINGERPRINT_HEADERS: [&str; 2] = ["x-client-uuid", "x-client-version"];

pub struct SelfHostedDistributor {
    enabled: bool,
    advertised_host: String,
    port: u16,
    root: PathBuf,
    serve_state: Arc<ServeState>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

struct ServeState {
    root: PathBuf,
    strict_client_only: bool,
}

impl SelfHostedDistributor {
    pub fn from_config(config: &SelfHostedConfig) -> Self {
        Self {
            enabled: config.enabled,
            advertised_host: config.advertised_host.clone(),
            port: config.port,
            root: config.root_dir.clone(),
            serve_state: Arc::new(ServeState {
                root: config.root_dir.clone(),
                strict_client_only: config.strict_client_only,
            }),
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }

    /// Local filesystem path a pack's bytes live at.
    fn local_path(&self, pack: &PackDescriptor) -> PathBuf {
        self.root.join(pack.relative_path())
    }

    async fn resolve_inner(
        &self,
        pack: &PackDescriptor,
    ) -> Result<ResolvedPack, DistributorError> {
        let uri = Url::parse(&format!(
            "http://{}:{}/{}",
            self.advertised_host,
            self.port,
            pack.relative_path()
        ))?;

        // Hash the local file directly; the network fetch is for clients.
        let content_hash = sha1_hex_file(&self.local_path(pack)).await?;

        Ok(ResolvedPack {
            uri,
            content_hash: Some(content_hash),
        })
    }
}

impl Distributor for SelfHostedDistributor {
    fn resolve<'a>(
        &'a self,
        pack: &'a PackDescriptor,
        _client_id: Uuid,
        _client_addr: IpAddr,
    ) -> BoxFuture<'a, Result<ResolvedPack, DistributorError>> {
        Box::pin(self.resolve_inner(pack))
    }

    fn start(&self) -> BoxFuture<'_, Result<(), DistributorError>> {
        Box::pin(async move {
            if !self.enabled {
                debug!("self-hosted distributor disabled; not binding");
                return Ok(());
            }

            // Listen on the wildcard address; advertised_host is only what
            // clients are told.
            let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
            info!(port = self.port, root = %self.root.display(), "starting pack file server");

            let app = router(self.serve_state.clone());
            let token = self.shutdown.clone();
            let handle = tokio::spawn(async move {
                let shutdown = token.cancelled_owned();
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(error = %e, "pack file server terminated abnormally");
                }
            });
            *self.server.lock() = Some(handle);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let handle = self.server.lock().take();
            if let Some(handle) = handle {
                info!(port = self.port, "stopping pack file server");
                self.shutdown.cancel();
                let _ = handle.await;
            }
        })
    }
}

/// The file-serving router. Split out so tests can drive it without a
/// bound socket.
fn router(state: Arc<ServeState>) -> Router {
    Router::new().fallback(serve_pack).with_state(state)
}

async fn serve_pack(
    State(state): State<Arc<ServeState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if state.strict_client_only && !has_client_fingerprint(&headers) {
        info!(path = uri.path(), "rejecting pack request without client fingerprint");
        return (
            StatusCode::BAD_REQUEST,
            [(CONTENT_TYPE, "text/plain")],
            "This endpoint serves game clients only\n",
        )
            .into_response();
    }

    let relative = uri.path().trim_start_matches('/');
    if relative.is_empty()
        || relative
            .split('/')
            .any(|segment| segment.is_empty() || segment == "..")
    {
        return StatusCode::NOT_FOUND.into_response();
    }

    match tokio::fs::read(state.root.join(relative)).await {
        Ok(bytes) => {
            debug!(path = relative, size = bytes.len(), "serving pack file");
            ([(CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)], bytes).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn has_client_fingerprint(headers: &HeaderMap) -> bool {
    CLIENT_FINGERPRINT_HEADERS
        .iter()
        .all(|header| headers.contains_key(*header))
}
