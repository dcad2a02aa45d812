//! WebSocket server: one task per connection, master or relay role.
//!
//! Architecture:
//! ```text
//!   Client A ──┐                           ┌──► Client A
//!   Client B ──┼── edit ──► CellStore ──► ConnectionHub ──► Client B
//!   Client C ──┘                │          └──► Client C
//!                               │
//!              master: SnapshotStore (periodic + shutdown save)
//!              relay:  UpstreamLink (forward edits, mirror master)
//! ```
//!
//! Per-connection lifecycle:
//! `Connecting → Upgraded → (master: SnapshotSent) → Streaming → Closed`.
//! Every per-message and per-connection error is contained in the
//! connection's own task.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::hub::ConnectionHub;
use crate::metrics::{ServerMetrics, ServerStats};
use crate::protocol::{Edit, ProtocolError};
use crate::relay::{BackoffConfig, RelayError, UpstreamLink};
use crate::storage::{self, LoadOutcome, PersistenceConfig, SnapshotStore};
use crate::store::{CellError, CellStore, DEFAULT_CELLS};

/// Which tier this process plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Authoritative owner of the cells.
    Master,
    /// Mirror that forwards edits to the master at `upstream_url`.
    Relay { upstream_url: String },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Relay { .. } => "relay",
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path accepted for the WebSocket upgrade
    pub ws_path: String,
    pub role: Role,
    /// Number of cells (N)
    pub cells: usize,
    /// Outbound frames buffered per connection before it is dropped
    pub outbound_capacity: usize,
    /// Snapshot persistence (master only)
    pub persistence: Option<PersistenceConfig>,
    /// Reconnect policy for the master link (relay only)
    pub backoff: BackoffConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_path: "/ws".to_string(),
            role: Role::Master,
            cells: DEFAULT_CELLS,
            outbound_capacity: 1024,
            persistence: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Small in-memory master for tests.
    pub fn for_testing(cells: usize) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            cells,
            outbound_capacity: 64,
            backoff: BackoffConfig::for_testing(),
            ..Self::default()
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.cells == 0 || self.cells > u32::MAX as usize {
            return Err(ServerError::Config(format!(
                "cell count must be between 1 and {}, got {}",
                u32::MAX,
                self.cells
            )));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ServerError::Config(format!(
                "WebSocket path must start with '/', got {:?}",
                self.ws_path
            )));
        }
        if self.outbound_capacity == 0 {
            return Err(ServerError::Config(
                "outbound capacity must be at least 1".to_string(),
            ));
        }
        if let Role::Relay { upstream_url } = &self.role {
            if !(upstream_url.starts_with("ws://") || upstream_url.starts_with("wss://")) {
                return Err(ServerError::Config(format!(
                    "master URL must be ws:// or wss://, got {upstream_url:?}"
                )));
            }
        }
        Ok(())
    }

    /// Same, as a relay of `upstream_url`.
    pub fn relay_for_testing(cells: usize, upstream_url: impl Into<String>) -> Self {
        Self {
            role: Role::Relay {
                upstream_url: upstream_url.into(),
            },
            ..Self::for_testing(cells)
        }
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Upgraded,
    SnapshotSent,
    Streaming,
    Closed,
}

/// Why an inbound message was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cell(#[from] CellError),
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    cells: Arc<CellStore>,
    hub: Arc<ConnectionHub>,
    metrics: Arc<ServerMetrics>,
    upstream: Option<Arc<UpstreamLink>>,
}

impl Shared {
    fn is_master(&self) -> bool {
        self.config.role == Role::Master
    }

    /// Decode and apply one client message, then fan the raw bytes out
    /// (and, on a relay, forward them to the master).
    async fn ingest(&self, raw: Vec<u8>) -> Result<Edit, EditError> {
        let edit = Edit::decode(&raw)?;
        self.cells.apply(edit)?;
        self.metrics.edit_applied();

        let frame = Arc::new(raw);
        self.hub.broadcast(frame.clone()).await;

        if let Some(link) = &self.upstream {
            if let Err(e) = link.forward(&frame).await {
                log::warn!("Edit {edit:?} not forwarded to master: {e}");
            }
        }
        Ok(edit)
    }
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
    /// Snapshot persistence (master with persistence configured)
    persistence: Option<Arc<SnapshotStore>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let cells = Arc::new(CellStore::new(config.cells));
        let hub = Arc::new(ConnectionHub::new(config.outbound_capacity));
        let metrics = Arc::new(ServerMetrics::new());

        let upstream = match &config.role {
            Role::Master => None,
            Role::Relay { upstream_url } => Some(Arc::new(UpstreamLink::new(
                upstream_url.clone(),
                config.backoff.clone(),
                cells.clone(),
                hub.clone(),
                metrics.clone(),
            ))),
        };

        let persistence = match (&config.role, &config.persistence) {
            (Role::Master, Some(p)) => Some(Arc::new(SnapshotStore::new(p.clone(), cells.clone()))),
            (Role::Relay { .. }, Some(_)) => {
                log::warn!("Persistence is ignored in relay mode");
                None
            }
            (_, None) => None,
        };

        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                cells,
                hub,
                metrics,
                upstream,
            }),
            persistence,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn cells(&self) -> &Arc<CellStore> {
        &self.shared.cells
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.shared.hub
    }

    pub fn upstream(&self) -> Option<&Arc<UpstreamLink>> {
        self.shared.upstream.as_ref()
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.metrics.snapshot()
    }

    /// Process one inbound edit exactly as a connection task would.
    pub async fn ingest(&self, raw: Vec<u8>) -> Result<Edit, EditError> {
        self.shared.ingest(raw).await
    }

    /// Restore cells from the snapshot file, if persistence is configured.
    pub fn load_snapshot(&self) -> Option<LoadOutcome> {
        self.persistence.as_ref().and_then(|p| p.load_logged())
    }

    /// Save cells to the snapshot file. Returns false on failure or when
    /// persistence is not configured.
    pub fn save_snapshot(&self) -> bool {
        self.persistence
            .as_ref()
            .is_some_and(|p| p.save_logged(&self.shared.metrics))
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.shared.config.validate()?;
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Prepare state for the configured role.
    ///
    /// Master: load the snapshot file and start periodic saves.
    /// Relay: sync from the master; an unreachable master is fatal here.
    async fn start(&self) -> Result<(), ServerError> {
        if let Some(store) = &self.persistence {
            let loader = store.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || loader.load_logged()).await {
                log::error!("Snapshot load task panicked: {e}");
            }

            let task = tokio::spawn(storage::run_periodic(
                store.clone(),
                self.shared.metrics.clone(),
                self.shutdown.subscribe(),
            ));
            self.tasks.lock().await.push(task);
        }

        if let Some(link) = &self.shared.upstream {
            log::info!("Syncing from master {}", link.url());
            let driver = link.clone().start(self.shutdown.subscribe()).await?;
            self.tasks.lock().await.push(driver);
        }

        Ok(())
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.shared.config.validate()?;
        self.start().await?;

        let local = listener.local_addr()?;
        log::info!(
            "{} server listening on ws://{local}{} ({} cells)",
            self.shared.config.role.name(),
            self.shared.config.ws_path,
            self.shared.cells.len()
        );

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let shared = self.shared.clone();
                        let shutdown = self.shutdown.subscribe();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, shared, shutdown).await;
                        });
                    }
                    Err(e) => log::error!("Accept failed: {e}"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("Stopped accepting connections on {local}");
        Ok(())
    }

    /// Graceful shutdown: stop accepting, save a final snapshot, close the
    /// master link and every client connection.
    pub async fn shutdown(&self) {
        log::info!("Shutting down server...");
        self.shutdown.send_replace(true);

        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                log::error!("Background task failed: {e}");
            }
        }

        if let Some(store) = &self.persistence {
            let store = store.clone();
            let metrics = self.shared.metrics.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || store.save_logged(&metrics)).await {
                log::error!("Final snapshot task panicked: {e}");
            }
        }

        if let Some(link) = &self.shared.upstream {
            link.close().await;
        }

        let closed = self.shared.hub.close_all().await;
        log::info!("Server stopped ({closed} connections closed)");
    }
}

/// Reject upgrades on any path other than the configured one.
fn check_path(ws_path: &str, req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == ws_path {
        return Ok(resp);
    }
    let mut err = ErrorResponse::new(Some("not found".to_string()));
    *err.status_mut() = StatusCode::NOT_FOUND;
    Err(err)
}

/// Run one connection from upgrade to close.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut phase = ConnectionPhase::Connecting;
    let ws_path = shared.config.ws_path.clone();
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        check_path(&ws_path, req, resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("Upgrade error from {addr}: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Register before the snapshot is taken so no edit falls in between.
    let mut peer = shared.hub.register().await;
    shared.metrics.connection_opened();
    phase = advance(addr, phase, ConnectionPhase::Upgraded);

    if shared.is_master() {
        let snapshot = shared.cells.snapshot();
        if let Err(e) = ws_sender
            .send(Message::Binary(snapshot.into_bytes().into()))
            .await
        {
            log::warn!("Error sending full state to {addr}: {e}");
            close_connection(addr, &shared, &peer.id, phase).await;
            return;
        }
        phase = advance(addr, phase, ConnectionPhase::SnapshotSent);
    }
    phase = advance(addr, phase, ConnectionPhase::Streaming);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    shared.metrics.message_received();
                    match shared.ingest(data.into()).await {
                        Ok(edit) => log::trace!("{addr}: applied {edit:?}"),
                        Err(e) => {
                            shared.metrics.edit_rejected();
                            log::warn!("Dropped message from {addr}: {e}");
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                        log::warn!("Write error to {addr}: {e}");
                        break;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    shared.metrics.message_received();
                    shared.metrics.edit_rejected();
                    log::warn!("Dropped text message from {addr}");
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("Connection closed by {addr}");
                    break;
                }
                Some(Err(e)) => {
                    log::warn!("Read error from {addr}: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },

            frame = peer.outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                        log::warn!("Write error to {addr}: {e}");
                        break;
                    }
                }
                None => {
                    log::info!("Connection {addr} dropped by the hub");
                    break;
                }
            },

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if let Err(e) = ws_sender.close().await {
        log::debug!("Error closing {addr}: {e}");
    }
    close_connection(addr, &shared, &peer.id, phase).await;
}

async fn close_connection(
    addr: SocketAddr,
    shared: &Shared,
    id: &crate::hub::ConnectionId,
    phase: ConnectionPhase,
) {
    shared.metrics.connection_closed();
    shared.hub.unregister(id).await;
    advance(addr, phase, ConnectionPhase::Closed);
}

fn advance(addr: SocketAddr, from: ConnectionPhase, to: ConnectionPhase) -> ConnectionPhase {
    log::trace!("{addr}: {from:?} -> {to:?}");
    to
}
