//! Network layer: listener, WebSocket upgrades, and the shared hub state
//!
//! The transport contract is deliberately thin: each WebSocket text frame is
//! one JSON message, delivered in order per socket. The context key a
//! connection binds to comes from the upgrade request path (`GET /room/a` →
//! key `room/a`); an optional `x-connection-identity` header names the
//! authenticated principal (authenticating it is someone else's job).
//!
//! Everything a connection needs after the upgrade lives in [`Hub`]: the
//! context registry, the signed-parameter service, and the generator for
//! per-session fan-out identities.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use uuid::Uuid;

use shared::uuid7::{self, GenState};

use crate::context::Hooks;
use crate::keys::{GenParamService, ServerKeypair};
use crate::registry::{ContextRegistry, HydrateFn};
use crate::session;

/// Header naming the authenticated principal of a connection.
pub const IDENTITY_HEADER: &str = "x-connection-identity";

/// Process-wide server state shared by every connection task.
pub struct Hub {
    pub registry: Arc<ContextRegistry>,
    pub params: Arc<GenParamService>,
    session_ids: Mutex<GenState>,
}

impl Hub {
    pub fn new(keypair: &ServerKeypair, hydrate: Arc<HydrateFn>, hooks: Arc<Hooks>) -> Arc<Self> {
        let params = Arc::new(GenParamService::new(keypair));
        Arc::new(Self {
            registry: ContextRegistry::new(hydrate, hooks, Arc::clone(&params)),
            params,
            session_ids: Mutex::new(GenState::fresh(uuid7::now_ms())),
        })
    }

    /// Mints the server-side UUIDv7 identifying one session for fan-out
    /// exclusion.
    pub async fn mint_session_id(&self) -> Uuid {
        let mut gen = self.session_ids.lock().await;
        uuid7::mint(&mut gen, None, None)
    }
}

/// The listening server: accepts sockets and spawns a session per upgrade.
pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Server {
    /// Binds the listener and assembles the hub around the supplied
    /// keypair and collaborators.
    pub async fn bind(
        addr: &str,
        keypair: ServerKeypair,
        hydrate: Arc<HydrateFn>,
        hooks: Arc<Hooks>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            hub: Hub::new(&keypair, hydrate, hooks),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Accept loop; runs until the process exits.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(handle_connection(hub, stream, peer));
                }
                Err(err) => {
                    error!("accept failed: {}", err);
                }
            }
        }
    }
}

/// Upgrades one TCP connection and hands it to a session.
async fn handle_connection(hub: Arc<Hub>, stream: TcpStream, peer: SocketAddr) {
    let mut key = None;
    let mut identity = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        key = Some(request.uri().path().trim_start_matches('/').to_string());
        identity = request
            .headers()
            .get(IDENTITY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!("websocket handshake with {} failed: {}", peer, err);
            return;
        }
    };

    let Some(key) = key.filter(|key| !key.is_empty()) else {
        warn!("connection from {} named no context key; closing", peer);
        return;
    };

    debug!("connection from {} bound for context '{}'", peer, key);
    session::run(hub, ws, key, identity).await;
}
