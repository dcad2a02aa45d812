//! Fan-out of raw edit bytes to every open connection.
//!
//! Each registered peer owns a bounded outbound queue drained by its
//! connection task. `broadcast()` walks the membership map under one lock
//! and enqueues without waiting:
//!
//! ```text
//!              broadcast(bytes)
//!                    │
//!        ┌───────────┼───────────┐
//!        ▼           ▼           ▼
//!   [queue A]   [queue B]   [queue C]
//!     ok          full ✗       ok
//!                   │
//!                   └── removed from the map; dropping its sender closes
//!                       the queue, and B's task closes the socket
//! ```
//!
//! A full queue (peer too slow) and a closed queue (task already gone) are
//! both failed sends. Nothing else reaps peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Message type carried by the hub. Shared so fan-out never copies the
/// payload per peer.
pub type Frame = Arc<Vec<u8>>;

/// Identity of one registered connection.
pub type ConnectionId = Uuid;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub broadcasts: u64,
    pub deliveries: u64,
    pub pruned: u64,
    pub active_peers: usize,
}

struct AtomicHubStats {
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    pruned: AtomicU64,
}

impl AtomicHubStats {
    fn new() -> Self {
        Self {
            broadcasts: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }
}

/// Receiving half handed to a connection task on registration.
pub struct PeerHandle {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Frame>,
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: Vec<ConnectionId>,
}

/// The set of live connections on this process.
pub struct ConnectionHub {
    peers: Mutex<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
    /// Outbound frames buffered per peer before it counts as failed
    capacity: usize,
    stats: AtomicHubStats,
}

impl ConnectionHub {
    /// Create a hub whose peers may buffer up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicHubStats::new(),
        }
    }

    /// Register a new connection and return its outbound queue.
    pub async fn register(&self) -> PeerHandle {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        self.peers.lock().await.insert(id, tx);
        PeerHandle { id, outbound: rx }
    }

    /// Remove a connection. Returns false if it was already gone (for
    /// instance pruned by a broadcast).
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        self.peers.lock().await.remove(id).is_some()
    }

    /// Deliver `frame` to every registered peer.
    ///
    /// Peers whose queue is full or closed are removed in the same pass.
    /// One failing peer never stops delivery to the rest.
    pub async fn broadcast(&self, frame: Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut peers = self.peers.lock().await;

        peers.retain(|id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Peer {id} outbound queue full, dropping connection");
                report.pruned.push(*id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Peer {id} already closed, removing");
                report.pruned.push(*id);
                false
            }
        });
        drop(peers);

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .pruned
            .fetch_add(report.pruned.len() as u64, Ordering::Relaxed);

        report
    }

    /// Convenience wrapper copying `bytes` into a shared frame.
    pub async fn broadcast_bytes(&self, bytes: &[u8]) -> BroadcastReport {
        self.broadcast(Arc::new(bytes.to_vec())).await
    }

    /// Drop every registration. Each connection task sees its queue close
    /// and shuts its socket.
    pub async fn close_all(&self) -> usize {
        let mut peers = self.peers.lock().await;
        let n = peers.len();
        peers.clear();
        n
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn has_peer(&self, id: &ConnectionId) -> bool {
        self.peers.lock().await.contains_key(id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            pruned: self.stats.pruned.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }
}
