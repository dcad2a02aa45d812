//! Binary wire protocol for cell edits and full-state snapshots.
//!
//! Edit message (exactly 5 bytes):
//! ```text
//! ┌──────────┬──────────────────────┐
//! │ action   │ index                │
//! │ 1 byte   │ 4 bytes, big-endian  │
//! └──────────┴──────────────────────┘
//!   0 = clear
//!   1 = set
//! ```
//!
//! Snapshot message (`ceil(N/32) * 4` bytes):
//! ```text
//! ┌───────────────────┬───────────────────┬─────┐
//! │ group 0 (u32, BE) │ group 1 (u32, BE) │ ... │
//! └───────────────────┴───────────────────┴─────┘
//!   bit 31 of group g = cell 32g, bit 0 = cell 32g + 31
//! ```
//!
//! Because every group is big-endian and packed MSB-first, cell `i` lives in
//! byte `i / 8` at bit `7 - i % 8`. Both the encoder and the partial restore
//! path rely on that.

use thiserror::Error;

/// Length of an edit message on the wire.
pub const EDIT_LEN: usize = 5;

/// Cells packed into one snapshot group.
pub const CELLS_PER_GROUP: usize = 32;

/// Errors produced while decoding inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Message shorter than an edit.
    #[error("malformed edit: {len} bytes, expected {EDIT_LEN}")]
    Malformed { len: usize },
    /// Action byte other than clear/set.
    #[error("invalid action byte {0:#04x}")]
    InvalidAction(u8),
}

/// What an edit does to its cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Clear = 0,
    Set = 1,
}

impl Action {
    /// The cell value this action writes.
    pub fn value(self) -> bool {
        matches!(self, Action::Set)
    }
}

impl TryFrom<u8> for Action {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Action::Clear),
            1 => Ok(Action::Set),
            other => Err(ProtocolError::InvalidAction(other)),
        }
    }
}

/// A single cell edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edit {
    pub action: Action,
    pub index: u32,
}

impl Edit {
    pub fn new(action: Action, index: u32) -> Self {
        Self { action, index }
    }

    pub fn set(index: u32) -> Self {
        Self::new(Action::Set, index)
    }

    pub fn clear(index: u32) -> Self {
        Self::new(Action::Clear, index)
    }

    /// Encode to the 5-byte wire form.
    pub fn encode(&self) -> [u8; EDIT_LEN] {
        let mut buf = [0u8; EDIT_LEN];
        buf[0] = self.action as u8;
        buf[1..].copy_from_slice(&self.index.to_be_bytes());
        buf
    }

    /// Decode from the wire.
    ///
    /// Only the first five bytes are read; trailing bytes are ignored, which
    /// matches how peers have always parsed the message. The index is not
    /// range-checked here since the codec does not know N.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < EDIT_LEN {
            return Err(ProtocolError::Malformed { len: bytes.len() });
        }
        let action = Action::try_from(bytes[0])?;
        let index = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Ok(Self { action, index })
    }
}

/// Packed full-state bitfield, exactly as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    bytes: Vec<u8>,
}

impl Snapshot {
    /// Byte length of a complete snapshot for `cells` cells.
    pub fn wire_len(cells: usize) -> usize {
        cells.div_ceil(CELLS_PER_GROUP) * 4
    }

    /// Wrap bytes received from a peer or read from disk. Any length is
    /// accepted; short snapshots restore partially.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Build a snapshot from big-endian 32-bit groups.
    pub fn from_groups(groups: impl IntoIterator<Item = u32>) -> Self {
        let bytes = groups
            .into_iter()
            .flat_map(|g| g.to_be_bytes())
            .collect();
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of cells whose bit is present in this snapshot.
    pub fn covered_cells(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Value of cell `index`, or `None` if the snapshot does not reach it.
    pub fn cell(&self, index: usize) -> Option<bool> {
        self.bytes
            .get(index / 8)
            .map(|byte| byte & (0x80 >> (index % 8)) != 0)
    }

    /// Big-endian group `g`, zero-padded when the snapshot ends mid-group.
    pub fn group(&self, g: usize) -> Option<u32> {
        let start = g * 4;
        if start >= self.bytes.len() {
            return None;
        }
        let mut word = [0u8; 4];
        let end = (start + 4).min(self.bytes.len());
        word[..end - start].copy_from_slice(&self.bytes[start..end]);
        Some(u32::from_be_bytes(word))
    }

    /// Number of set cells.
    pub fn count_set(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_wire_layout() {
        let edit = Edit::set(3);
        assert_eq!(edit.encode(), [1, 0, 0, 0, 3]);

        let edit = Edit::clear(0x0102_0304);
        assert_eq!(edit.encode(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_edit_decode() {
        let edit = Edit::decode(&[1, 0, 0x0F, 0x42, 0x3F]).unwrap();
        assert_eq!(edit.action, Action::Set);
        assert_eq!(edit.index, 999_999);
    }

    #[test]
    fn test_short_messages_are_malformed() {
        for len in 0..EDIT_LEN {
            let bytes = vec![1u8; len];
            assert_eq!(
                Edit::decode(&bytes),
                Err(ProtocolError::Malformed { len })
            );
        }
    }

    #[test]
    fn test_unknown_action_rejected() {
        assert_eq!(
            Edit::decode(&[2, 0, 0, 0, 1]),
            Err(ProtocolError::InvalidAction(2))
        );
        assert_eq!(
            Edit::decode(&[0xFF, 0, 0, 0, 1]),
            Err(ProtocolError::InvalidAction(0xFF))
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let edit = Edit::decode(&[0, 0, 0, 0, 7, 99, 99]).unwrap();
        assert_eq!(edit, Edit::clear(7));
    }

    #[test]
    fn test_snapshot_wire_len() {
        assert_eq!(Snapshot::wire_len(0), 0);
        assert_eq!(Snapshot::wire_len(1), 4);
        assert_eq!(Snapshot::wire_len(8), 4);
        assert_eq!(Snapshot::wire_len(32), 4);
        assert_eq!(Snapshot::wire_len(33), 8);
        assert_eq!(Snapshot::wire_len(1_000_000), 125_000);
    }

    #[test]
    fn test_snapshot_bit_order() {
        // bit 31 of group 0 is cell 0, bit 27 is cell 4
        let snap = Snapshot::from_groups([0x8800_0000, 0x0000_0001]);
        assert_eq!(snap.as_bytes(), &[0x88, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(snap.cell(0), Some(true));
        assert_eq!(snap.cell(4), Some(true));
        assert_eq!(snap.cell(1), Some(false));
        assert_eq!(snap.cell(63), Some(true));
        assert_eq!(snap.cell(64), None);
        assert_eq!(snap.count_set(), 3);
    }

    #[test]
    fn test_snapshot_partial_group() {
        let snap = Snapshot::from_bytes(vec![0xFF, 0x01]);
        assert_eq!(snap.covered_cells(), 16);
        assert_eq!(snap.group(0), Some(0xFF01_0000));
        assert_eq!(snap.group(1), None);
    }

    #[test]
    fn test_action_value() {
        assert!(Action::Set.value());
        assert!(!Action::Clear.value());
        assert_eq!(Action::try_from(0), Ok(Action::Clear));
    }
}
