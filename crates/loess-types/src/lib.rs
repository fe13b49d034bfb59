#![forbid(unsafe_code)]
//! Core value types for loess.
//!
//! Unit-carrying newtypes (physical block numbers, slab-relative block
//! numbers, sequence numbers), journal/recovery positions, block-map
//! mapping states, the packed five-byte block-map entry, and the
//! little-endian parse helpers shared by every on-disk format in the
//! workspace. Pure data — no I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Metadata block size in bytes. All journal, reference-count, and
/// block-map structures are laid out in blocks of this size.
pub const BLOCK_SIZE: usize = 4096;
/// Torn-write detection granularity: drives commit sectors atomically.
pub const SECTOR_SIZE: usize = 512;
/// Sectors per metadata block.
pub const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;

/// The physical block number reserved to mean "no block".
pub const ZERO_BLOCK: Pbn = Pbn(0);

// ── Reference count sentinels ───────────────────────────────────────────────
//
// One byte per physical block: 0 is free, 1..=253 is a shared count,
// and the two top values are reserved sentinels.

/// Reference count of a free block.
pub const EMPTY_REFERENCE_COUNT: u8 = 0;
/// The largest count a shareable data block may reach.
pub const MAXIMUM_SHAREABLE_REFERENCES: u8 = 253;
/// Sentinel for a tentatively allocated block, pending confirmation.
pub const PROVISIONAL_REFERENCE_COUNT: u8 = 254;
/// Sentinel for a block owned by the block map. Block-map pages never
/// dedupe, so their counters are pinned at the maximum.
pub const BLOCK_MAP_REFERENCE_COUNT: u8 = 255;

/// Counters carried by one sector of a packed reference block
/// (the sector minus its eight-byte commit point).
pub const COUNTS_PER_SECTOR: usize = SECTOR_SIZE - 8;
/// Counters carried by one packed reference block.
pub const COUNTS_PER_BLOCK: usize = COUNTS_PER_SECTOR * SECTORS_PER_BLOCK;

/// Mappings per block-map leaf page (the page minus its 36-byte header,
/// divided by the five-byte packed entry).
pub const BLOCK_MAP_ENTRIES_PER_PAGE: u16 = 812;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Absolute physical block number in the underlying storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pbn(pub u64);

impl Pbn {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract a block count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }

    /// Byte offset of this block, returning `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(BLOCK_SIZE as u64)
    }
}

/// Index of a slab within the depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlabNumber(pub u32);

/// Block number relative to the start of one slab's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlabBlockNumber(pub u32);

/// Monotonic journal block sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Pbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SlabNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SlabBlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Mapping states ──────────────────────────────────────────────────────────

/// The 4-bit state stored with every block-map mapping.
///
/// `0` is unmapped, `1` is an uncompressed mapping, and `2..=15` name
/// the fourteen compression slots within a compressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingState(u8);

impl MappingState {
    pub const UNMAPPED: Self = Self(0);
    pub const UNCOMPRESSED: Self = Self(1);
    pub const COMPRESSED_BASE: Self = Self(2);
    pub const COMPRESSED_MAX: Self = Self(15);

    /// Build a state from the low nibble of a byte.
    #[must_use]
    pub fn from_nibble(raw: u8) -> Self {
        Self(raw & 0x0F)
    }

    #[must_use]
    pub fn as_nibble(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn is_compressed(self) -> bool {
        self.0 > Self::UNCOMPRESSED.0
    }
}

impl fmt::Display for MappingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNMAPPED => write!(f, "unmapped"),
            Self::UNCOMPRESSED => write!(f, "uncompressed"),
            other => write!(f, "compressed:{}", other.0 - Self::COMPRESSED_BASE.0),
        }
    }
}

/// A physical location: a block and how the data is stored there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLocation {
    pub pbn: Pbn,
    pub state: MappingState,
}

impl DataLocation {
    pub const UNMAPPED: Self = Self {
        pbn: ZERO_BLOCK,
        state: MappingState::UNMAPPED,
    };

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.state != MappingState::UNMAPPED
    }

    /// Whether this location is internally consistent: the zero block
    /// may not claim compression, and a non-zero block must be mapped.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.pbn == ZERO_BLOCK {
            !self.state.is_compressed()
        } else {
            self.is_mapped()
        }
    }
}

// ── Packed block-map entry ──────────────────────────────────────────────────

/// The five-byte on-disk form of one block-map mapping.
///
/// Byte 0 packs the 4-bit mapping state (low nibble) with the four
/// highest bits of the 36-bit physical block number (high nibble);
/// bytes 1..=4 are the low 32 bits of the PBN, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapEntry([u8; 5]);

/// Mask limiting a packed physical block number to its 36 bits.
pub const PACKED_PBN_MASK: u64 = (1 << 36) - 1;

impl BlockMapEntry {
    /// Pack a location. PBNs wider than 36 bits are truncated by the
    /// format; callers validate range before packing.
    #[must_use]
    pub fn pack(pbn: Pbn, state: MappingState) -> Self {
        let pbn = pbn.0 & PACKED_PBN_MASK;
        let low = (pbn & 0xFFFF_FFFF) as u32;
        let high_nibble = ((pbn >> 32) & 0x0F) as u8;
        let mut bytes = [0_u8; 5];
        bytes[0] = (state.as_nibble() & 0x0F) | (high_nibble << 4);
        bytes[1..5].copy_from_slice(&low.to_le_bytes());
        Self(bytes)
    }

    #[must_use]
    pub fn unpack(&self) -> DataLocation {
        let high4 = u64::from(self.0[0] >> 4);
        let low32 = u64::from(u32::from_le_bytes([
            self.0[1], self.0[2], self.0[3], self.0[4],
        ]));
        DataLocation {
            pbn: Pbn((high4 << 32) | low32),
            state: MappingState::from_nibble(self.0[0]),
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 5]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 5] {
        self.0
    }

    /// The packed form of "no mapping".
    pub const UNMAPPED: Self = Self([0; 5]);
}

/// One addressable mapping within the block map: a leaf page and a
/// slot on that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockMapSlot {
    /// Physical block number of the leaf page holding the mapping.
    pub pbn: Pbn,
    /// Slot within the page, `0..BLOCK_MAP_ENTRIES_PER_PAGE`.
    pub slot: u16,
}

// ── Journal operations and positions ────────────────────────────────────────

/// What a recovery journal entry remaps: a data mapping or a
/// block-map tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOperation {
    DataRemapping,
    BlockMapRemapping,
}

impl JournalOperation {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::DataRemapping => 0,
            Self::BlockMapRemapping => 1,
        }
    }

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::DataRemapping),
            1 => Some(Self::BlockMapRemapping),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DataRemapping => "data remapping",
            Self::BlockMapRemapping => "block map remapping",
        }
    }
}

/// A position within a journal: a block sequence number and an entry
/// index within that block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct JournalPoint {
    pub sequence_number: SequenceNumber,
    pub entry_count: u16,
}

impl JournalPoint {
    #[must_use]
    pub fn new(sequence_number: SequenceNumber, entry_count: u16) -> Self {
        Self {
            sequence_number,
            entry_count,
        }
    }

    /// A point is valid once its journal block exists; sequence zero
    /// is the unwritten default.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.sequence_number.0 > 0
    }

    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self < other
    }

    /// Advance by one entry, rolling into the next block at
    /// `entries_per_block`.
    pub fn advance(&mut self, entries_per_block: u16) {
        if self.entry_count.saturating_add(1) < entries_per_block {
            self.entry_count += 1;
        } else {
            self.sequence_number = self.sequence_number.next();
            self.entry_count = 0;
        }
    }

    /// The packed on-disk form: sequence number shifted over a 16-bit
    /// entry count, little-endian.
    #[must_use]
    pub fn pack(&self) -> [u8; 8] {
        ((self.sequence_number.0 << 16) | u64::from(self.entry_count)).to_le_bytes()
    }

    #[must_use]
    pub fn unpack(bytes: [u8; 8]) -> Self {
        let encoded = u64::from_le_bytes(bytes);
        Self {
            sequence_number: SequenceNumber(encoded >> 16),
            entry_count: (encoded & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for JournalPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.sequence_number, self.entry_count)
    }
}

/// The absolute position of one half-entry (increment or decrement)
/// in the recovery journal.
///
/// The derived ordering is lexicographic on (sequence number, sector,
/// entry, increment-applied), which is exactly the journal's replay
/// order: the increment half of an entry precedes its decrement half.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RecoveryPoint {
    pub sequence_number: SequenceNumber,
    pub sector: u8,
    pub entry: u16,
    pub increment_applied: bool,
}

impl RecoveryPoint {
    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self < other
    }
}

impl fmt::Display for RecoveryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.sequence_number,
            self.sector,
            self.entry,
            if self.increment_applied { "dec" } else { "inc" }
        )
    }
}

// ── Parse errors and helpers ────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
