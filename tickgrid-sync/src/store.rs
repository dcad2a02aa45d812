//! Lock-free bitfield of independently togglable cells.
//!
//! Cells are packed 32 per `AtomicU32`, using the same bit order as the
//! snapshot wire format (bit 31 of word 0 = cell 0). A write is a single
//! `fetch_or` / `fetch_and` on one word, so concurrent writers to different
//! cells never block each other and never lose updates, even when they
//! share a word.
//!
//! `snapshot()` and `restore()` walk the words one at a time and are not
//! atomic with respect to concurrent edits. A save racing live traffic may
//! capture some edits and miss others; the result is still a valid
//! bitfield.

use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

use crate::protocol::{Edit, Snapshot, CELLS_PER_GROUP};

/// Default number of cells.
pub const DEFAULT_CELLS: usize = 1_000_000;

/// Cell access errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("cell index {index} out of range (len {len})")]
    OutOfRange { index: u32, len: usize },
}

/// Shared array of N boolean cells.
pub struct CellStore {
    words: Box<[AtomicU32]>,
    len: usize,
}

impl CellStore {
    /// Allocate `len` cells, all clear.
    ///
    /// `len` must fit the 32-bit index space of the wire protocol; larger
    /// values are clamped.
    pub fn new(len: usize) -> Self {
        let len = len.min(u32::MAX as usize);
        let words = (0..len.div_ceil(CELLS_PER_GROUP))
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { words, len }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn locate(&self, index: u32) -> Result<(usize, u32), CellError> {
        let i = index as usize;
        if i >= self.len {
            return Err(CellError::OutOfRange {
                index,
                len: self.len,
            });
        }
        let mask = 1u32 << (31 - (i % CELLS_PER_GROUP));
        Ok((i / CELLS_PER_GROUP, mask))
    }

    /// Read one cell.
    pub fn get(&self, index: u32) -> Result<bool, CellError> {
        let (word, mask) = self.locate(index)?;
        Ok(self.words[word].load(Ordering::Acquire) & mask != 0)
    }

    /// Write one cell, returning its previous value.
    pub fn set(&self, index: u32, value: bool) -> Result<bool, CellError> {
        let (word, mask) = self.locate(index)?;
        let prev = if value {
            self.words[word].fetch_or(mask, Ordering::AcqRel)
        } else {
            self.words[word].fetch_and(!mask, Ordering::AcqRel)
        };
        Ok(prev & mask != 0)
    }

    /// Apply a decoded edit.
    pub fn apply(&self, edit: Edit) -> Result<bool, CellError> {
        self.set(edit.index, edit.action.value())
    }

    /// Number of set cells.
    pub fn count_set(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Encode every cell into a wire snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::from_groups(self.words.iter().map(|w| w.load(Ordering::Acquire)))
    }

    /// Overwrite cells from a snapshot.
    ///
    /// Only cells covered by the snapshot's bytes are touched; a short
    /// snapshot leaves the tail as it was. Bits beyond `len` in the last
    /// group are ignored. Returns the number of cells restored.
    pub fn restore(&self, snapshot: &Snapshot) -> usize {
        let covered = snapshot.covered_cells().min(self.len);

        for (g, word) in self.words.iter().enumerate() {
            let first = g * CELLS_PER_GROUP;
            if first >= covered {
                break;
            }
            let Some(group) = snapshot.group(g) else {
                break;
            };

            // Mask of cells in this word that the snapshot actually covers.
            let n = (covered - first).min(CELLS_PER_GROUP);
            let mask = if n == CELLS_PER_GROUP {
                u32::MAX
            } else {
                !(u32::MAX >> n)
            };

            if mask == u32::MAX {
                word.store(group, Ordering::Release);
            } else {
                word.fetch_and(!mask, Ordering::AcqRel);
                word.fetch_or(group & mask, Ordering::AcqRel);
            }
        }

        covered
    }
}

impl Default for CellStore {
    fn default() -> Self {
        Self::new(DEFAULT_CELLS)
    }
}

impl std::fmt::Debug for CellStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellStore")
            .field("len", &self.len)
            .field("set", &self.count_set())
            .finish()
    }
}
