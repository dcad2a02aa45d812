//! # tickgrid-sync — Replicated bitfield over WebSocket
//!
//! A fixed array of N boolean cells, edited by many clients at once and
//! fanned out to every connection. One master owns the state; any number
//! of relays mirror it and forward their clients' edits upstream.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──────────────────────┐
//!                        │ Master               │
//!   clients ◄──────────► │ CellStore + Hub      │ ◄── SnapshotStore
//!                        └──────────▲───────────┘
//!                                   │ edits ⇅, snapshot on connect
//!                 ┌─────────────────┴─────────────────┐
//!         ┌───────┴──────┐                    ┌───────┴──────┐
//!         │ Relay        │                    │ Relay        │
//!         │ UpstreamLink │                    │ UpstreamLink │
//!         └───────▲──────┘                    └───────▲──────┘
//!                 │                                   │
//!              clients                             clients
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — 5-byte edit messages and packed snapshots
//! - [`store`] — Lock-free cell array
//! - [`hub`] — Connection registry and fan-out with slow-peer pruning
//! - [`relay`] — Relay-side link to the master with reconnect
//! - [`storage`] — Snapshot file persistence for the master
//! - [`server`] — WebSocket server, connection lifecycle
//! - [`metrics`] — Counters

pub mod protocol;
pub mod store;
pub mod hub;
pub mod metrics;
pub mod relay;
pub mod storage;
pub mod server;

// Re-exports for convenience
pub use protocol::{Action, Edit, ProtocolError, Snapshot, EDIT_LEN};
pub use store::{CellError, CellStore, DEFAULT_CELLS};
pub use hub::{BroadcastReport, ConnectionHub, ConnectionId, Frame, HubStats, PeerHandle};
pub use metrics::{ServerMetrics, ServerStats};
pub use relay::{BackoffConfig, LinkState, RelayError, UpstreamLink};
pub use storage::{LoadOutcome, PersistError, PersistenceConfig, SnapshotStore};
pub use server::{ConnectionPhase, EditError, Role, ServerConfig, ServerError, SyncServer};
