//! Relay-tier link to the master.
//!
//! ```text
//!              establish()                         relay()
//! Disconnected ──► Connecting ──► AwaitingSnapshot ──► Relaying
//!      ▲               │ dial error                       │
//!      │               ▼                                  │ read error,
//!      └────── backoff, retry ◄───────────────────────────┘ forward error
//! ```
//!
//! One outbound WebSocket per relayer. The write half sits behind a mutex
//! shared by the receive loop's teardown and every client task forwarding
//! edits upstream; reconnecting swaps it in one step. The read half is
//! owned by the driver task.
//!
//! Edits from local clients are applied locally before the master confirms
//! them. The master's rebroadcast then arrives here and is applied again,
//! which is harmless because edits are plain writes.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::hub::ConnectionHub;
use crate::metrics::ServerMetrics;
use crate::protocol::{Edit, Snapshot};
use crate::store::CellStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upstream link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    AwaitingSnapshot,
    Relaying,
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The master could not be reached when the process started.
    #[error("master {url} unreachable at startup: {reason}")]
    StartupUnreachable { url: String, reason: String },
    /// Dial or handshake failed.
    #[error("failed to connect to master {url}: {reason}")]
    Dial { url: String, reason: String },
    /// The master closed the link before sending its snapshot.
    #[error("master closed the link before sending a snapshot")]
    MissingSnapshot,
    /// Writing to the master failed; the link has been torn down.
    #[error("master link lost: {0}")]
    UpstreamUnreachable(String),
    /// No link is currently established.
    #[error("not connected to master")]
    NotConnected,
}

/// Reconnect delay policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt
    pub initial: Duration,
    /// Upper bound on the delay
    pub max: Duration,
    /// Limit on the dial and, separately, on the wait for the snapshot
    pub handshake_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    /// Config for testing (fast retries).
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(500),
        }
    }

    /// Delay before retry number `attempt` (0-based): doubles each time.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// The installed write half plus the guard whose drop ends the session's
/// receive loop.
struct Upstream {
    sink: SplitSink<WsStream, Message>,
    _teardown: oneshot::Sender<()>,
}

/// An established session's read half.
pub struct Session {
    source: SplitStream<WsStream>,
    teardown: oneshot::Receiver<()>,
}

/// Connection from a relayer to its master.
pub struct UpstreamLink {
    url: String,
    backoff: BackoffConfig,
    upstream: Mutex<Option<Upstream>>,
    state: RwLock<LinkState>,
    cells: Arc<CellStore>,
    hub: Arc<ConnectionHub>,
    metrics: Arc<ServerMetrics>,
}

impl UpstreamLink {
    pub fn new(
        url: impl Into<String>,
        backoff: BackoffConfig,
        cells: Arc<CellStore>,
        hub: Arc<ConnectionHub>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            url: url.into(),
            backoff,
            upstream: Mutex::new(None),
            state: RwLock::new(LinkState::Disconnected),
            cells,
            hub,
            metrics,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    async fn set_state(&self, state: LinkState) {
        *self.state.write().await = state;
    }

    /// Dial the master, load its snapshot and install the write half.
    pub async fn establish(&self) -> Result<Session, RelayError> {
        self.set_state(LinkState::Connecting).await;

        let dial = tokio::time::timeout(
            self.backoff.handshake_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await;
        let ws = match dial {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(self.dial_failed(e.to_string()).await),
            Err(_) => return Err(self.dial_failed("timed out".to_string()).await),
        };
        let (sink, mut source) = ws.split();

        self.set_state(LinkState::AwaitingSnapshot).await;
        let wait = tokio::time::timeout(
            self.backoff.handshake_timeout,
            Self::read_snapshot(&mut source),
        )
        .await;
        let snapshot = match wait.unwrap_or_else(|_| {
            log::warn!("Master {} sent no snapshot in time", self.url);
            Err(RelayError::MissingSnapshot)
        }) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.set_state(LinkState::Disconnected).await;
                return Err(e);
            }
        };

        let expected = Snapshot::wire_len(self.cells.len());
        if snapshot.len() < expected {
            log::warn!(
                "Master snapshot is {} bytes, expected {expected}; restoring what it covers",
                snapshot.len()
            );
        }
        let restored = self.cells.restore(&snapshot);
        log::info!(
            "Loaded state from master {} ({restored} cells, {} set)",
            self.url,
            self.cells.count_set()
        );

        let (teardown_tx, teardown_rx) = oneshot::channel();
        let mut upstream = self.upstream.lock().await;
        *upstream = Some(Upstream {
            sink,
            _teardown: teardown_tx,
        });
        self.set_state(LinkState::Relaying).await;
        drop(upstream);

        Ok(Session {
            source,
            teardown: teardown_rx,
        })
    }

    async fn dial_failed(&self, reason: String) -> RelayError {
        self.set_state(LinkState::Disconnected).await;
        RelayError::Dial {
            url: self.url.clone(),
            reason,
        }
    }

    /// First binary message on a fresh link is the snapshot.
    async fn read_snapshot(source: &mut SplitStream<WsStream>) -> Result<Snapshot, RelayError> {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Ok(Snapshot::from_bytes(data.into())),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Error reading snapshot from master: {e}");
                    break;
                }
            }
        }
        Err(RelayError::MissingSnapshot)
    }

    /// Apply an edit received from the master and fan it out locally.
    pub async fn apply_master_edit(&self, data: &[u8]) {
        let edit = match Edit::decode(data) {
            Ok(edit) => edit,
            Err(e) => {
                log::warn!("Dropped message from master: {e}");
                return;
            }
        };
        if let Err(e) = self.cells.apply(edit) {
            log::warn!("Dropped edit from master: {e}");
            return;
        }
        self.metrics.upstream_edit();
        self.hub.broadcast_bytes(data).await;
    }

    /// Receive loop for one session. Returns once the link is gone.
    async fn relay(&self, session: Session, shutdown: &mut watch::Receiver<bool>) {
        let Session {
            mut source,
            mut teardown,
        } = session;

        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(data))) => self.apply_master_edit(&data).await,
                    Some(Ok(Message::Close(_))) | None => {
                        log::warn!("Master {} closed the link", self.url);
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("Read error from master {}: {e}", self.url);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                _ = &mut teardown => {
                    log::debug!("Master link torn down by a failed forward");
                    break;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.close().await;
    }

    /// Send a local client's raw edit to the master.
    ///
    /// A write failure drops the link; the driver loop reconnects.
    pub async fn forward(&self, bytes: &[u8]) -> Result<(), RelayError> {
        let mut guard = self.upstream.lock().await;
        let Some(upstream) = guard.as_mut() else {
            return Err(RelayError::NotConnected);
        };

        if let Err(e) = upstream
            .sink
            .send(Message::Binary(bytes.to_vec().into()))
            .await
        {
            guard.take();
            self.set_state(LinkState::Disconnected).await;
            return Err(RelayError::UpstreamUnreachable(e.to_string()));
        }

        self.metrics.upstream_forwarded();
        Ok(())
    }

    /// Close the link to the master, if any.
    pub async fn close(&self) {
        let mut guard = self.upstream.lock().await;
        if let Some(mut upstream) = guard.take() {
            if let Err(e) = upstream.sink.close().await {
                log::debug!("Error closing master link: {e}");
            }
        }
        self.set_state(LinkState::Disconnected).await;
    }

    /// Establish the first session and spawn the driver.
    ///
    /// Failing to dial the master here is fatal to the caller. Any later
    /// loss of the link is retried with backoff.
    pub async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, RelayError> {
        let first = match self.establish().await {
            Ok(session) => Some(session),
            Err(RelayError::Dial { url, reason }) => {
                return Err(RelayError::StartupUnreachable { url, reason });
            }
            Err(e) => {
                log::warn!("Initial sync with master failed, retrying: {e}");
                None
            }
        };

        Ok(tokio::spawn(async move { self.run(first, shutdown).await }))
    }

    /// `establish()`, abandoned as soon as shutdown is signalled.
    async fn establish_or_shutdown(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Result<Session, RelayError>> {
        tokio::select! {
            result = self.establish() => Some(result),
            _ = wait_for_shutdown(shutdown) => None,
        }
    }

    /// Driver loop: relay, and on loss reconnect until shutdown.
    pub async fn run(&self, mut session: Option<Session>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let current = match session.take() {
                Some(s) => s,
                None => match self.establish_or_shutdown(&mut shutdown).await {
                    None => break,
                    Some(Ok(s)) => {
                        log::info!("Reconnected to master {}", self.url);
                        attempt = 0;
                        s
                    }
                    Some(Err(e)) => {
                        let delay = self.backoff.delay(attempt);
                        attempt = attempt.saturating_add(1);
                        log::warn!("{e}; retrying in {delay:?}");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                        continue;
                    }
                },
            };

            self.relay(current, &mut shutdown).await;
        }

        self.close().await;
        log::debug!("Master link driver stopped");
    }
}

/// Resolves once `shutdown` reads true or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
