#![forbid(unsafe_code)]
//! Recovery journal on-disk formats.
//!
//! Pure format crate — no I/O, no side effects. Packs and unpacks the
//! recovery journal's block headers, sector stamps, and both entry
//! encodings:
//!
//! - the current format (metadata type 3): 16-byte entries carrying an
//!   explicit old mapping ("unmapping") next to the new one;
//! - the legacy format (metadata type 1): 11-byte increment-only
//!   entries, decoded with a synthesized zero unmapping. Legacy
//!   journals can be read for a rebuild but never replayed directly.
//!
//! Both encodings are fixed serialization contracts, so every field is
//! expressed through explicit shift/mask constants with per-field unit
//! tests rather than a structure overlay.

use loess_types::{
    BLOCK_SIZE, BlockMapEntry, BlockMapSlot, DataLocation, JournalOperation, ParseError, Pbn,
    SECTOR_SIZE, SECTORS_PER_BLOCK, SequenceNumber, ensure_slice, read_fixed, read_le_u16,
    read_le_u32, read_le_u64,
};

// ── Metadata block type tags ────────────────────────────────────────────────

/// Tag identifying a metadata block's owner and format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataType {
    /// Legacy recovery journal blocks (increment-only entries).
    RecoveryJournal,
    /// Slab journal blocks.
    SlabJournal,
    /// Current recovery journal blocks.
    RecoveryJournal2,
}

impl MetadataType {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::RecoveryJournal => 1,
            Self::SlabJournal => 2,
            Self::RecoveryJournal2 => 3,
        }
    }

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::RecoveryJournal),
            2 => Some(Self::SlabJournal),
            3 => Some(Self::RecoveryJournal2),
            _ => None,
        }
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Packed block header size in bytes.
pub const BLOCK_HEADER_SIZE: usize = 53;
/// Per-sector stamp: check byte, recovery count, entry count.
pub const SECTOR_HEADER_SIZE: usize = 3;

/// Packed size of a current-format entry.
pub const ENTRY_SIZE: usize = 16;
/// Packed size of a legacy-format entry.
pub const LEGACY_ENTRY_SIZE: usize = 11;

/// Current-format entries per 512-byte sector.
pub const ENTRIES_PER_SECTOR: u16 = ((SECTOR_SIZE - SECTOR_HEADER_SIZE) / ENTRY_SIZE) as u16;
/// Current-format entries per journal block (sectors 1..=7 hold entries).
pub const ENTRIES_PER_BLOCK: u16 = ENTRIES_PER_SECTOR * (SECTORS_PER_BLOCK as u16 - 1);

/// Legacy entries per sector (except the last).
pub const LEGACY_ENTRIES_PER_SECTOR: u16 =
    ((SECTOR_SIZE - SECTOR_HEADER_SIZE) / LEGACY_ENTRY_SIZE) as u16;
/// Legacy entries per journal block.
pub const LEGACY_ENTRIES_PER_BLOCK: u16 = 311;
/// Legacy entries in the last sector of a full block.
pub const LEGACY_ENTRIES_IN_LAST_SECTOR: u16 =
    LEGACY_ENTRIES_PER_BLOCK % LEGACY_ENTRIES_PER_SECTOR;

/// Static configuration of one recovery journal: where it lives, how
/// large it is, and the identity stamps its blocks must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryJournalConfig {
    /// First physical block of the journal region.
    pub origin: Pbn,
    /// Number of blocks in the journal. Must be a power of two so a
    /// sequence number's home block is just its low-order bits.
    pub size: u64,
    /// This store instance's nonce.
    pub nonce: u64,
    /// Number of recoveries completed; blocks from an earlier life of
    /// the journal carry a smaller count and are ignored.
    pub recovery_count: u8,
}

impl RecoveryJournalConfig {
    pub fn new(origin: Pbn, size: u64, nonce: u64, recovery_count: u8) -> Result<Self, ParseError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "journal_size",
                reason: "must be a non-zero power of two",
            });
        }
        Ok(Self {
            origin,
            size,
            nonce,
            recovery_count,
        })
    }

    /// The journal-relative block index which holds a given sequence
    /// number.
    #[must_use]
    pub fn block_index(&self, sequence: SequenceNumber) -> u64 {
        sequence.0 & (self.size - 1)
    }

    /// The absolute block which holds a given sequence number.
    #[must_use]
    pub fn block_pbn(&self, sequence: SequenceNumber) -> Pbn {
        Pbn(self.origin.0 + self.block_index(sequence))
    }
}

/// The protection check byte stamped on a block and each of its
/// sectors: the low seven bits of the sequence number with the high
/// bit set, so an all-zero sector can never look current.
#[must_use]
pub fn compute_check_byte(sequence: SequenceNumber) -> u8 {
    ((sequence.0 & 0x7F) as u8) | 0x80
}

// ── Block header ────────────────────────────────────────────────────────────

/// Unpacked recovery journal block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryBlockHeader {
    /// Oldest sequence number the block map still needs.
    pub block_map_head: SequenceNumber,
    /// Oldest sequence number the slab journals still need.
    pub slab_journal_head: SequenceNumber,
    /// Sequence number of this block.
    pub sequence_number: SequenceNumber,
    /// Store instance nonce.
    pub nonce: u64,
    /// Logical blocks in use when this block was opened.
    pub logical_blocks_used: u64,
    /// Allocated block-map pages when this block was opened.
    pub block_map_data_blocks: u64,
    /// Number of entries committed in this block.
    pub entry_count: u16,
    pub check_byte: u8,
    pub recovery_count: u8,
    /// Raw metadata type byte; garbage blocks carry arbitrary values,
    /// so the tag is kept raw and interpreted through [`MetadataType`].
    pub metadata_type: u8,
}

impl RecoveryBlockHeader {
    #[must_use]
    pub fn metadata_type(&self) -> Option<MetadataType> {
        MetadataType::from_u8(self.metadata_type)
    }

    /// Pack into the on-disk little-endian layout.
    #[must_use]
    pub fn pack(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0_u8; BLOCK_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.block_map_head.0.to_le_bytes());
        out[8..16].copy_from_slice(&self.slab_journal_head.0.to_le_bytes());
        out[16..24].copy_from_slice(&self.sequence_number.0.to_le_bytes());
        out[24..32].copy_from_slice(&self.nonce.to_le_bytes());
        out[32] = self.metadata_type;
        out[33..35].copy_from_slice(&self.entry_count.to_le_bytes());
        out[35..43].copy_from_slice(&self.logical_blocks_used.to_le_bytes());
        out[43..51].copy_from_slice(&self.block_map_data_blocks.to_le_bytes());
        out[51] = self.check_byte;
        out[52] = self.recovery_count;
        out
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            block_map_head: SequenceNumber(read_le_u64(data, 0)?),
            slab_journal_head: SequenceNumber(read_le_u64(data, 8)?),
            sequence_number: SequenceNumber(read_le_u64(data, 16)?),
            nonce: read_le_u64(data, 24)?,
            metadata_type: ensure_slice(data, 32, 1)?[0],
            entry_count: read_le_u16(data, 33)?,
            logical_blocks_used: read_le_u64(data, 35)?,
            block_map_data_blocks: read_le_u64(data, 43)?,
            check_byte: ensure_slice(data, 51, 1)?[0],
            recovery_count: ensure_slice(data, 52, 1)?[0],
        })
    }

    /// Whether this header describes a usable block for `config`: the
    /// identity stamps match and the entry count fits the format.
    /// Legacy-format blocks are accepted only when `old_ok`.
    #[must_use]
    pub fn is_valid_for(&self, config: &RecoveryJournalConfig, old_ok: bool) -> bool {
        if self.nonce != config.nonce || self.recovery_count != config.recovery_count {
            return false;
        }

        match self.metadata_type() {
            Some(MetadataType::RecoveryJournal2) => self.entry_count <= ENTRIES_PER_BLOCK,
            Some(MetadataType::RecoveryJournal) => {
                old_ok && self.entry_count <= LEGACY_ENTRIES_PER_BLOCK
            }
            _ => false,
        }
    }

    /// Whether this header describes exactly the block `sequence` of
    /// `config` in the given format.
    #[must_use]
    pub fn is_exactly(
        &self,
        config: &RecoveryJournalConfig,
        sequence: SequenceNumber,
        metadata_type: MetadataType,
    ) -> bool {
        self.metadata_type() == Some(metadata_type)
            && self.sequence_number == sequence
            && self.is_valid_for(config, true)
    }
}

// ── Sector stamps ───────────────────────────────────────────────────────────

/// The three-byte stamp at the start of each entry sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    pub check_byte: u8,
    pub recovery_count: u8,
    pub entry_count: u8,
}

impl SectorHeader {
    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let bytes: [u8; SECTOR_HEADER_SIZE] = read_fixed(data, 0)?;
        Ok(Self {
            check_byte: bytes[0],
            recovery_count: bytes[1],
            entry_count: bytes[2],
        })
    }

    /// A sector belongs to its block when its stamp matches the block
    /// header's; a mismatch marks the block torn at this sector.
    #[must_use]
    pub fn matches(&self, header: &RecoveryBlockHeader) -> bool {
        self.check_byte == header.check_byte && self.recovery_count == header.recovery_count
    }
}

/// Borrow sector `sector` (1..=7) of a journal block. Sector 0 holds
/// the block header and carries no entries.
pub fn sector_bytes(block: &[u8], sector: usize) -> Result<&[u8], ParseError> {
    if sector == 0 || sector >= SECTORS_PER_BLOCK {
        return Err(ParseError::InvalidField {
            field: "sector",
            reason: "entry sectors are 1..=7",
        });
    }
    ensure_slice(block, sector * SECTOR_SIZE, SECTOR_SIZE)
}

/// Entries a given sector can hold in the given format.
#[must_use]
pub fn entries_per_sector(metadata_type: MetadataType, sector: usize) -> u16 {
    match metadata_type {
        MetadataType::RecoveryJournal2 | MetadataType::SlabJournal => ENTRIES_PER_SECTOR,
        MetadataType::RecoveryJournal => {
            if sector == SECTORS_PER_BLOCK - 1 {
                LEGACY_ENTRIES_IN_LAST_SECTOR
            } else {
                LEGACY_ENTRIES_PER_SECTOR
            }
        }
    }
}

// ── Entries ─────────────────────────────────────────────────────────────────

/// A decoded recovery journal entry: one logical-map slot moving from
/// `unmapping` to `mapping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub slot: BlockMapSlot,
    pub mapping: DataLocation,
    pub unmapping: DataLocation,
    pub operation: JournalOperation,
}

// The leading u16 of both entry encodings, little-endian:
//   bits 1..0   operation
//   bits 7..2   slot, low six bits
//   bits 11..8  slot, high four bits
//   bits 15..12 leaf-page PBN, bits 35..32
const OPERATION_MASK: u16 = 0x0003;
const SLOT_LOW_SHIFT: u16 = 2;
const SLOT_LOW_MASK: u16 = 0x003F;
const SLOT_HIGH_SHIFT: u16 = 8;
const SLOT_HIGH_MASK: u16 = 0x000F;
const PBN_HIGH_SHIFT: u16 = 12;

fn pack_lead_word(operation: u8, slot: u16, pbn_high_nibble: u8) -> u16 {
    u16::from(operation & 0x03)
        | ((slot & SLOT_LOW_MASK) << SLOT_LOW_SHIFT)
        | (((slot >> 6) & SLOT_HIGH_MASK) << SLOT_HIGH_SHIFT)
        | (u16::from(pbn_high_nibble & 0x0F) << PBN_HIGH_SHIFT)
}

fn unpack_lead_word(word: u16) -> (u8, u16, u8) {
    let operation = (word & OPERATION_MASK) as u8;
    let slot =
        ((word >> SLOT_LOW_SHIFT) & SLOT_LOW_MASK) | (((word >> SLOT_HIGH_SHIFT) & SLOT_HIGH_MASK) << 6);
    let pbn_high_nibble = (word >> PBN_HIGH_SHIFT) as u8;
    (operation, slot, pbn_high_nibble)
}

impl JournalEntry {
    /// Pack into the current 16-byte on-disk form.
    #[must_use]
    pub fn pack(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0_u8; ENTRY_SIZE];
        let lead = pack_lead_word(
            self.operation.as_u8(),
            self.slot.slot,
            ((self.slot.pbn.0 >> 32) & 0x0F) as u8,
        );
        out[0..2].copy_from_slice(&lead.to_le_bytes());
        out[2..6].copy_from_slice(&((self.slot.pbn.0 & 0xFFFF_FFFF) as u32).to_le_bytes());
        out[6..11]
            .copy_from_slice(&BlockMapEntry::pack(self.mapping.pbn, self.mapping.state).to_bytes());
        out[11..16].copy_from_slice(
            &BlockMapEntry::pack(self.unmapping.pbn, self.unmapping.state).to_bytes(),
        );
        out
    }

    /// Unpack a current-format entry.
    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        let (operation, slot, pbn_high) = unpack_lead_word(read_le_u16(data, 0)?);
        let pbn_low = u64::from(read_le_u32(data, 2)?);
        let mapping = BlockMapEntry::from_bytes(read_fixed(data, 6)?).unpack();
        let unmapping = BlockMapEntry::from_bytes(read_fixed(data, 11)?).unpack();

        // Both operation codes are in range for a 2-bit field; treat
        // the spare value defensively all the same.
        let operation =
            JournalOperation::from_u8(operation).ok_or(ParseError::InvalidField {
                field: "operation",
                reason: "unknown journal operation code",
            })?;

        Ok(Self {
            slot: BlockMapSlot {
                pbn: Pbn((u64::from(pbn_high) << 32) | pbn_low),
                slot,
            },
            mapping,
            unmapping,
            operation,
        })
    }
}

// ── Legacy entries ──────────────────────────────────────────────────────────

/// Legacy operation codes. Only the two increment kinds decode into a
/// [`JournalEntry`]; decrements were separate entries in the old
/// format and carry nothing a rebuild needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyOperation {
    DataIncrement,
    DataDecrement,
    BlockMapIncrement,
    BlockMapDecrement,
}

impl LegacyOperation {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::DataIncrement => 0,
            Self::DataDecrement => 1,
            Self::BlockMapIncrement => 2,
            Self::BlockMapDecrement => 3,
        }
    }

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::DataIncrement),
            1 => Some(Self::DataDecrement),
            2 => Some(Self::BlockMapIncrement),
            3 => Some(Self::BlockMapDecrement),
            _ => None,
        }
    }
}

/// Pack a legacy 11-byte entry. Only used by tests and format
/// tooling; the live write path never produces legacy blocks.
#[must_use]
pub fn pack_legacy_entry(
    operation: LegacyOperation,
    slot: BlockMapSlot,
    mapping: DataLocation,
) -> [u8; LEGACY_ENTRY_SIZE] {
    let mut out = [0_u8; LEGACY_ENTRY_SIZE];
    let lead = pack_lead_word(
        operation.as_u8(),
        slot.slot,
        ((slot.pbn.0 >> 32) & 0x0F) as u8,
    );
    out[0..2].copy_from_slice(&lead.to_le_bytes());
    out[2..6].copy_from_slice(&((slot.pbn.0 & 0xFFFF_FFFF) as u32).to_le_bytes());
    out[6..11].copy_from_slice(&BlockMapEntry::pack(mapping.pbn, mapping.state).to_bytes());
    out
}

/// Decode a legacy entry.
///
/// Returns `Ok(None)` for decrement entries, which are skipped: a
/// legacy journal is only ever read for a rebuild, and the rebuild
/// derives all reference state from the block map, not from
/// decrements. Increments decode with a synthesized zero unmapping.
pub fn unpack_legacy_entry(data: &[u8]) -> Result<Option<JournalEntry>, ParseError> {
    let (operation, slot, pbn_high) = unpack_lead_word(read_le_u16(data, 0)?);
    let pbn_low = u64::from(read_le_u32(data, 2)?);
    let mapping = BlockMapEntry::from_bytes(read_fixed(data, 6)?).unpack();

    let operation = match LegacyOperation::from_u8(operation) {
        Some(LegacyOperation::DataIncrement) => JournalOperation::DataRemapping,
        Some(LegacyOperation::BlockMapIncrement) => JournalOperation::BlockMapRemapping,
        _ => return Ok(None),
    };

    Ok(Some(JournalEntry {
        slot: BlockMapSlot {
            pbn: Pbn((u64::from(pbn_high) << 32) | pbn_low),
            slot,
        },
        mapping,
        unmapping: DataLocation::UNMAPPED,
        operation,
    }))
}

// ── Block building ──────────────────────────────────────────────────────────

/// Pack a full journal block: the header into sector 0, then entries
/// filling sectors 1..=7 with per-sector stamps. The header's
/// `entry_count`, `check_byte`, and `metadata_type` are taken from
/// `header` as given; callers set `entry_count == entries.len()`.
///
/// This is format tooling (tests, mkfs-style utilities); the live
/// journal writer is outside this subsystem.
pub fn pack_journal_block(
    header: &RecoveryBlockHeader,
    entries: &[JournalEntry],
) -> Result<Vec<u8>, ParseError> {
    if entries.len() > usize::from(ENTRIES_PER_BLOCK) {
        return Err(ParseError::InvalidField {
            field: "entries",
            reason: "more entries than a block can hold",
        });
    }

    let mut block = vec![0_u8; BLOCK_SIZE];
    block[..BLOCK_HEADER_SIZE].copy_from_slice(&header.pack());

    for (sector, chunk) in entries.chunks(usize::from(ENTRIES_PER_SECTOR)).enumerate() {
        let base = (sector + 1) * SECTOR_SIZE;
        block[base] = header.check_byte;
        block[base + 1] = header.recovery_count;
        block[base + 2] = chunk.len() as u8;
        for (i, entry) in chunk.iter().enumerate() {
            let at = base + SECTOR_HEADER_SIZE + i * ENTRY_SIZE;
            block[at..at + ENTRY_SIZE].copy_from_slice(&entry.pack());
        }
    }

    Ok(block)
}
