//! Snapshot file envelope and the save/load cycle around it.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::metrics::ServerMetrics;
use crate::protocol::Snapshot;
use crate::store::CellStore;

/// Current envelope version.
pub const FORMAT_VERSION: u32 = 1;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
    #[error("snapshot decoding failed: {0}")]
    Decode(String),
    #[error("corrupt snapshot file: {0}")]
    Corrupt(String),
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Snapshot file path
    pub path: PathBuf,
    /// Time between periodic saves. Default: 5 minutes.
    pub interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tickgrid_state.bin"),
            interval: Duration::from_secs(5 * 60),
        }
    }
}

impl PersistenceConfig {
    /// Config for testing (short interval).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: Duration::from_millis(50),
        }
    }
}

/// On-disk envelope around a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub format_version: u32,
    /// Cell count of the store that produced the snapshot
    pub cells: u64,
    /// FNV-1a over the uncompressed snapshot bytes
    pub checksum: u32,
    /// LZ4-compressed snapshot wire bytes (size-prepended)
    pub payload: Vec<u8>,
}

impl SnapshotFile {
    /// Wrap a snapshot taken from a store of `cells` cells.
    pub fn seal(snapshot: &Snapshot, cells: usize) -> Self {
        let raw = snapshot.as_bytes();
        Self {
            format_version: FORMAT_VERSION,
            cells: cells as u64,
            checksum: checksum(raw),
            payload: lz4_flex::compress_prepend_size(raw),
        }
    }

    /// Verify and unwrap the snapshot.
    pub fn open(&self) -> Result<Snapshot, PersistError> {
        if self.format_version != FORMAT_VERSION {
            return Err(PersistError::Corrupt(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        let raw = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| PersistError::Corrupt(e.to_string()))?;

        let expected = Snapshot::wire_len(self.cells as usize);
        if raw.len() != expected {
            return Err(PersistError::Corrupt(format!(
                "payload is {} bytes, expected {expected} for {} cells",
                raw.len(),
                self.cells
            )));
        }

        if checksum(&raw) != self.checksum {
            return Err(PersistError::Corrupt("checksum mismatch".into()));
        }

        Ok(Snapshot::from_bytes(raw))
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        let (file, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistError::Decode(e.to_string()))?;
        Ok(file)
    }
}

/// FNV-1a, 32-bit.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub bytes_written: usize,
    pub set_cells: usize,
}

/// Result of a load attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No file yet: cold start with every cell clear.
    Missing,
    /// Cells restored from disk.
    Restored { cells: usize, set_cells: usize },
}

/// Saves and restores one [`CellStore`] at a fixed path.
pub struct SnapshotStore {
    config: PersistenceConfig,
    cells: Arc<CellStore>,
}

impl SnapshotStore {
    pub fn new(config: PersistenceConfig, cells: Arc<CellStore>) -> Self {
        Self { config, cells }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.config.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Write the current cells to disk.
    ///
    /// Writes a sibling `.tmp` file, syncs it, then renames it over the
    /// target so a crash mid-save leaves the previous snapshot intact.
    pub fn save(&self) -> Result<SaveReport, PersistError> {
        let snapshot = self.cells.snapshot();
        let set_cells = snapshot.count_set();
        let encoded = SnapshotFile::seal(&snapshot, self.cells.len()).encode()?;

        let tmp = self.tmp_path();
        {
            let mut file = std::fs::File::create(&tmp).map_err(|e| PersistError::io(&tmp, e))?;
            file.write_all(&encoded)
                .map_err(|e| PersistError::io(&tmp, e))?;
            file.sync_all().map_err(|e| PersistError::io(&tmp, e))?;
        }
        std::fs::rename(&tmp, &self.config.path)
            .map_err(|e| PersistError::io(&self.config.path, e))?;

        Ok(SaveReport {
            bytes_written: encoded.len(),
            set_cells,
        })
    }

    /// Restore cells from disk.
    ///
    /// The file is fully decoded and verified before any cell is touched,
    /// so an error leaves the store exactly as it was.
    pub fn load(&self) -> Result<LoadOutcome, PersistError> {
        let bytes = match std::fs::read(&self.config.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadOutcome::Missing);
            }
            Err(e) => return Err(PersistError::io(&self.config.path, e)),
        };

        let file = SnapshotFile::decode(&bytes)?;
        let snapshot = file.open()?;

        if file.cells as usize != self.cells.len() {
            log::warn!(
                "Snapshot {} holds {} cells, store has {}; restoring the overlap",
                self.config.path.display(),
                file.cells,
                self.cells.len()
            );
        }

        let cells = self.cells.restore(&snapshot).min(file.cells as usize);
        Ok(LoadOutcome::Restored {
            cells,
            set_cells: self.cells.count_set(),
        })
    }

    /// Save and log the outcome. Returns whether the save succeeded.
    pub fn save_logged(&self, metrics: &ServerMetrics) -> bool {
        match self.save() {
            Ok(report) => {
                metrics.snapshot_saved();
                log::info!(
                    "Saved snapshot to {} ({} bytes, {} cells set)",
                    self.config.path.display(),
                    report.bytes_written,
                    report.set_cells
                );
                true
            }
            Err(e) => {
                log::error!("Failed to save snapshot: {e}");
                false
            }
        }
    }

    /// Load and log the outcome. A corrupt or unreadable file leaves the
    /// store at its current (zeroed) state.
    pub fn load_logged(&self) -> Option<LoadOutcome> {
        match self.load() {
            Ok(LoadOutcome::Missing) => {
                log::info!(
                    "No snapshot at {}, starting with empty state",
                    self.config.path.display()
                );
                Some(LoadOutcome::Missing)
            }
            Ok(LoadOutcome::Restored { cells, set_cells }) => {
                log::info!(
                    "Loaded snapshot from {} ({cells} cells, {set_cells} set)",
                    self.config.path.display()
                );
                Some(LoadOutcome::Restored { cells, set_cells })
            }
            Err(e) => {
                log::error!("Failed to load snapshot, starting with empty state: {e}");
                None
            }
        }
    }
}

/// Save on a fixed interval until `shutdown` flips to true.
///
/// The first save happens one full interval after start. The final
/// shutdown save is the caller's job.
pub async fn run_periodic(
    store: Arc<SnapshotStore>,
    metrics: Arc<ServerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = store.interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let store = store.clone();
                let metrics = metrics.clone();
                let saved = tokio::task::spawn_blocking(move || store.save_logged(&metrics)).await;
                if let Err(e) = saved {
                    log::error!("Snapshot task panicked: {e}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::debug!("Periodic snapshot task stopped");
}
