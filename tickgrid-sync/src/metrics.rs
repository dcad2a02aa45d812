//! Process-wide counters.
//!
//! Updated from connection tasks on the hot path, so everything is a
//! relaxed atomic. Exporting them (Prometheus, logs, ...) is left to the
//! embedding binary via [`ServerMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub edits_applied: u64,
    pub edits_rejected: u64,
    pub upstream_forwards: u64,
    pub upstream_edits: u64,
    pub snapshots_saved: u64,
}

#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    messages_received: AtomicU64,
    edits_applied: AtomicU64,
    edits_rejected: AtomicU64,
    upstream_forwards: AtomicU64,
    upstream_edits: AtomicU64,
    snapshots_saved: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn edit_applied(&self) {
        self.edits_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn edit_rejected(&self) {
        self.edits_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_forwarded(&self) {
        self.upstream_forwards.fetch_add(1, Ordering::Relaxed);
    }

    /// An edit arrived from the master over the replication link.
    pub fn upstream_edit(&self) {
        self.upstream_edits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_saved(&self) {
        self.snapshots_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        ServerStats {
            connections_opened: opened,
            connections_closed: closed,
            active_connections: opened.saturating_sub(closed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            edits_applied: self.edits_applied.load(Ordering::Relaxed),
            edits_rejected: self.edits_rejected.load(Ordering::Relaxed),
            upstream_forwards: self.upstream_forwards.load(Ordering::Relaxed),
            upstream_edits: self.upstream_edits.load(Ordering::Relaxed),
            snapshots_saved: self.snapshots_saved.load(Ordering::Relaxed),
        }
    }
}
