use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use audit_log::{AuditEntry, AuditEventType, AuditSource};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};

use crate::handshake::{self, HandshakeInfo, HandshakeRejection, OriginPolicy};
use crate::session::{RelaySession, SessionContext, SessionServices};
use crate::transport::{Duplex, UpstreamConnector};

/// Listener settings for the relay.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub listen_addr: SocketAddr,
    /// Allowed `Origin` patterns (`*` wildcards). Localhost is always allowed.
    pub origin_allowlist: Vec<String>,
}

/// Accepts client WebSocket upgrades on the attached paths and runs one
/// [`RelaySession`] per connection.
pub struct RelayServer {
    config: RelayServerConfig,
    services: SessionServices,
    connector: Arc<dyn UpstreamConnector>,
    paths: Vec<String>,
}

struct Shared {
    paths: Vec<String>,
    origins: OriginPolicy,
    services: SessionServices,
    connector: Arc<dyn UpstreamConnector>,
}

impl RelayServer {
    pub fn new(
        config: RelayServerConfig,
        services: SessionServices,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        Self {
            config,
            services,
            connector,
            paths: Vec::new(),
        }
    }

    /// Serve realtime sessions at `path`. May be called more than once.
    pub fn attach(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
        self
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Bind `listen_addr` and serve until the task is dropped.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        if self.paths.is_empty() {
            anyhow::bail!("relay server has no attached paths");
        }
        let origins = OriginPolicy::new(&self.config.origin_allowlist)
            .context("invalid origin allowlist")?;

        let addr = listener.local_addr()?;
        tracing::info!(%addr, paths = ?self.paths, "relay listening");

        let shared = Arc::new(Shared {
            paths: self.paths,
            origins,
            services: self.services,
            connector: self.connector,
        });

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let shared = Arc::clone(&shared);

            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, remote_addr, shared).await {
                    tracing::error!(%remote_addr, %err, "connection handler error");
                }
            });
        }
    }
}

type Verdict = Result<HandshakeInfo, HandshakeRejection>;

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> anyhow::Result<()> {
    // ------------------------------------------------------------------
    // 1. Upgrade, checking path and origin in the handshake callback.
    // ------------------------------------------------------------------
    let verdict: Arc<std::sync::Mutex<Option<Verdict>>> = Arc::new(std::sync::Mutex::new(None));
    let verdict_cb = Arc::clone(&verdict);
    let shared_cb = Arc::clone(&shared);

    let callback =
        move |req: &HsRequest, response: HsResponse| -> Result<HsResponse, ErrorResponse> {
            let checked = handshake::check_request(req, &shared_cb.paths, &shared_cb.origins);
            let reply = match &checked {
                Ok(_) => Ok(response),
                Err(rejection) => {
                    tracing::warn!(%remote_addr, %rejection, "upgrade rejected");
                    let mut err_response = ErrorResponse::new(Some(rejection.to_string()));
                    *err_response.status_mut() = rejection.status();
                    Err(err_response)
                }
            };
            if let Ok(mut slot) = verdict_cb.lock() {
                *slot = Some(checked);
            }
            reply
        };

    let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    let verdict = verdict.lock().ok().and_then(|mut slot| slot.take());

    let (client_ws, info) = match (accepted, verdict) {
        (Ok(ws), Some(Ok(info))) => (ws, info),
        (_, Some(Err(rejection))) => {
            shared
                .services
                .audit
                .log(AuditEntry::new(
                    AuditEventType::HandshakeRejected,
                    AuditSource {
                        remote_addr: Some(remote_addr.to_string()),
                        ..AuditSource::new("rt-relay")
                    },
                    json!({
                        "reason": rejection.to_string(),
                        "status": rejection.status().as_u16(),
                    }),
                ))
                .await;
            return Ok(());
        }
        (Err(err), _) => return Err(err.into()),
        (Ok(_), None) => anyhow::bail!("handshake completed without a verdict"),
    };

    // ------------------------------------------------------------------
    // 2. Run the session to completion.
    // ------------------------------------------------------------------
    let ctx = SessionContext::new(remote_addr).with_client_request_id(info.client_request_id);
    let session = RelaySession::new(ctx, shared.services.clone());
    tracing::info!(
        session_id = %session.id(),
        %remote_addr,
        path = %info.path,
        origin = info.origin.as_deref().unwrap_or("<none>"),
        "client connected"
    );

    session
        .run(Duplex::from_ws(client_ws), shared.connector.as_ref())
        .await;
    Ok(())
}
