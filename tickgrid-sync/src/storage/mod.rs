//! Durable snapshots of the cell store (master tier only).
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   every interval    ┌──────────────────────────┐
//! │ CellStore   │ ──────────────────► │ SnapshotStore            │
//! │ (in-memory) │   + on shutdown     │                          │
//! └──────▲──────┘                     │  <path>.tmp ──rename──►  │
//!        │                            │  <path>                  │
//!        │ on startup                 └────────────┬─────────────┘
//!        └─────────────────────────────────────────┘
//! ```
//!
//! The file holds one [`SnapshotFile`]: the snapshot wire bytes, LZ4
//! compressed, inside a small bincode envelope with a format version, the
//! cell count and a checksum. In-memory state is always authoritative; a
//! failed save or load is logged by the caller and never fatal.

pub mod snapshot;

pub use snapshot::{
    run_periodic, LoadOutcome, PersistError, PersistenceConfig, SaveReport, SnapshotFile,
    SnapshotStore, FORMAT_VERSION,
};
