//! Per-slab journals.
//!
//! A slab journal is a small ring of blocks logging reference-count
//! deltas for one slab before they reach the reference-count blocks.
//! Blocks come in two payload formats: pure data-delta blocks hold
//! 1353 three-byte entries; blocks containing block-map increments
//! switch to the "full" format, trading capacity (1299 entries) for an
//! entry-type bitmap.
//!
//! During recovery, [`SlabJournal::attempt_replay`] appends
//! recovery-journal deltas one recovery point at a time, committing
//! the tail block as it fills and signalling [`ReplayAttempt::Full`]
//! when the ring has no room for another block — the back-pressure
//! point where the caller must flush reference blocks (releasing
//! per-entry locks, advancing the reap head) before resuming.

use crate::ref_counts::ReferenceCounters;
use loess_block::BlockDevice;
use loess_error::{LoessError, Result};
use loess_journal::MetadataType;
use loess_types::{
    BLOCK_SIZE, JournalOperation, JournalPoint, ParseError, Pbn, SequenceNumber, SlabBlockNumber,
    SlabNumber, ensure_slice, read_fixed, read_le_u16, read_le_u64,
};

/// Packed slab journal block header size.
pub const SLAB_JOURNAL_HEADER_SIZE: usize = 36;
/// Entry payload bytes per block.
pub const SLAB_JOURNAL_PAYLOAD_SIZE: usize = BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE;
/// Entries per pure-data block.
pub const SLAB_JOURNAL_ENTRIES_PER_BLOCK: u16 = (SLAB_JOURNAL_PAYLOAD_SIZE / 3) as u16;
/// Entries per block in the full format (three bytes per entry plus
/// one type bit each).
pub const SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK: u16 = (SLAB_JOURNAL_PAYLOAD_SIZE * 8 / 25) as u16;
/// Size of the full format's entry-type bitmap.
pub const SLAB_JOURNAL_ENTRY_TYPES_SIZE: usize =
    (SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK as usize - 1) / 8 + 1;

const ENTRIES_OFFSET: usize = SLAB_JOURNAL_HEADER_SIZE;
const ENTRY_TYPES_OFFSET: usize =
    ENTRIES_OFFSET + SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK as usize * 3;

/// One slab journal entry: a delta against one slab-relative block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn: SlabBlockNumber,
    pub operation: JournalOperation,
    pub increment: bool,
}

/// Largest slab-relative offset the 23-bit packed entry can carry.
pub const MAX_SLAB_JOURNAL_OFFSET: u32 = (1 << 23) - 1;

/// Pack an entry's offset and direction: offset low byte, middle
/// byte, then the high seven bits sharing the last byte with the
/// increment flag in bit 7.
#[must_use]
pub fn pack_slab_journal_entry(sbn: SlabBlockNumber, increment: bool) -> [u8; 3] {
    let offset = sbn.0 & MAX_SLAB_JOURNAL_OFFSET;
    [
        (offset & 0xFF) as u8,
        ((offset >> 8) & 0xFF) as u8,
        (((offset >> 16) & 0x7F) as u8) | (u8::from(increment) << 7),
    ]
}

/// Unpack the offset/direction bytes. Block-map tagging lives in the
/// block's entry-type bitmap, not the entry itself.
#[must_use]
pub fn unpack_slab_journal_entry(bytes: [u8; 3]) -> (SlabBlockNumber, bool) {
    let offset = u32::from(bytes[0])
        | (u32::from(bytes[1]) << 8)
        | (u32::from(bytes[2] & 0x7F) << 16);
    (SlabBlockNumber(offset), bytes[2] & 0x80 != 0)
}

/// Unpacked slab journal block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabJournalBlockHeader {
    /// Oldest block of this journal still holding unreclaimed entries.
    pub head: SequenceNumber,
    pub sequence_number: SequenceNumber,
    /// Recovery journal point of the last entry in this block.
    pub recovery_point: JournalPoint,
    pub nonce: u64,
    pub metadata_type: u8,
    pub has_block_map_increments: bool,
    pub entry_count: u16,
}

impl SlabJournalBlockHeader {
    #[must_use]
    pub fn pack(&self) -> [u8; SLAB_JOURNAL_HEADER_SIZE] {
        let mut out = [0_u8; SLAB_JOURNAL_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.head.0.to_le_bytes());
        out[8..16].copy_from_slice(&self.sequence_number.0.to_le_bytes());
        out[16..24].copy_from_slice(&self.recovery_point.pack());
        out[24..32].copy_from_slice(&self.nonce.to_le_bytes());
        out[32] = self.metadata_type;
        out[33] = u8::from(self.has_block_map_increments);
        out[34..36].copy_from_slice(&self.entry_count.to_le_bytes());
        out
    }

    pub fn unpack(data: &[u8]) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            head: SequenceNumber(read_le_u64(data, 0)?),
            sequence_number: SequenceNumber(read_le_u64(data, 8)?),
            recovery_point: JournalPoint::unpack(read_fixed(data, 16)?),
            nonce: read_le_u64(data, 24)?,
            metadata_type: ensure_slice(data, 32, 1)?[0],
            has_block_map_increments: ensure_slice(data, 33, 1)?[0] != 0,
            entry_count: read_le_u16(data, 34)?,
        })
    }
}

/// Decode entry `index` of a packed slab journal block.
pub fn decode_block_entry(
    data: &[u8],
    index: usize,
    has_block_map_increments: bool,
) -> std::result::Result<SlabJournalEntry, ParseError> {
    let offset = ENTRIES_OFFSET + index * 3;
    let bytes: [u8; 3] = read_fixed(data, offset)?;
    let (sbn, increment) = unpack_slab_journal_entry(bytes);

    let mut operation = JournalOperation::DataRemapping;
    if has_block_map_increments {
        let type_byte = ensure_slice(data, ENTRY_TYPES_OFFSET + index / 8, 1)?[0];
        if type_byte & (1 << (index % 8)) != 0 {
            if !increment {
                return Err(ParseError::InvalidField {
                    field: "entry_types",
                    reason: "block map entries are always increments",
                });
            }
            operation = JournalOperation::BlockMapRemapping;
        }
    }

    Ok(SlabJournalEntry {
        sbn,
        operation,
        increment,
    })
}

/// Static shape of one slab journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalConfig {
    /// First block of the journal ring on the device.
    pub origin: Pbn,
    /// Ring size in blocks.
    pub size: u64,
    /// Store instance nonce stamped on every block.
    pub nonce: u64,
}

/// Result of one replay attempt against a slab journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayAttempt {
    /// The entry was appended.
    Applied,
    /// The entry is at or before the journal's last recovery point
    /// and was already journaled before the crash.
    Skipped,
    /// The ring has no room for another block: the caller must flush
    /// reference blocks to release journal locks, then resume from
    /// the same recovery point.
    Full,
}

/// One slab's journal: the in-memory tail block being filled, the
/// ring bounds, and per-block lock counts holding off reclamation.
#[derive(Debug)]
pub struct SlabJournal {
    config: SlabJournalConfig,
    slab_number: SlabNumber,
    /// Oldest block still locked by unpersisted reference updates.
    head: SequenceNumber,
    /// Sequence number of the open (uncommitted) tail block.
    tail: SequenceNumber,
    tail_entries: Vec<SlabJournalEntry>,
    tail_has_block_map_increments: bool,
    /// Recovery journal point of the newest entry ever appended;
    /// monotonic across tail blocks.
    last_recovery_point: JournalPoint,
    /// Per-ring-slot lock counts: one per entry until the covering
    /// reference block persists.
    locks: Vec<u64>,
}

impl SlabJournal {
    pub fn new(slab_number: SlabNumber, config: SlabJournalConfig) -> Result<Self> {
        if config.size == 0 {
            return Err(LoessError::Format(
                "slab journal size must be nonzero".to_owned(),
            ));
        }
        Ok(Self {
            config,
            slab_number,
            head: SequenceNumber(1),
            tail: SequenceNumber(1),
            tail_entries: Vec::new(),
            tail_has_block_map_increments: false,
            last_recovery_point: JournalPoint::default(),
            locks: vec![0; usize::try_from(config.size).map_err(|_| {
                LoessError::Format("slab journal size does not fit usize".to_owned())
            })?],
        })
    }

    #[must_use]
    pub fn config(&self) -> SlabJournalConfig {
        self.config
    }

    #[must_use]
    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    #[must_use]
    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    #[must_use]
    pub fn tail_entry_count(&self) -> usize {
        self.tail_entries.len()
    }

    #[must_use]
    pub fn last_recovery_point(&self) -> JournalPoint {
        self.last_recovery_point
    }

    /// Whether nothing has ever been appended.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.tail.0 == 1 && self.tail_entries.is_empty()
    }

    fn ring_slot(&self, sequence: SequenceNumber) -> usize {
        (sequence.0 % self.config.size) as usize
    }

    fn block_pbn(&self, sequence: SequenceNumber) -> Pbn {
        Pbn(self.config.origin.0 + (sequence.0 % self.config.size))
    }

    fn tail_capacity(&self, needs_full_format: bool) -> usize {
        if needs_full_format {
            usize::from(SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK)
        } else {
            usize::from(SLAB_JOURNAL_ENTRIES_PER_BLOCK)
        }
    }

    /// Append an entry to the open tail block. The caller has checked
    /// capacity; the entry's reference update takes a lock on the
    /// tail block until it persists.
    fn add_entry(&mut self, entry: SlabJournalEntry, recovery_point: JournalPoint) {
        debug_assert!(
            self.tail_entries.len()
                < self.tail_capacity(
                    self.tail_has_block_map_increments
                        || entry.operation == JournalOperation::BlockMapRemapping
                )
        );
        if entry.operation == JournalOperation::BlockMapRemapping {
            self.tail_has_block_map_increments = true;
        }
        self.tail_entries.push(entry);
        self.last_recovery_point = recovery_point;
        let slot = self.ring_slot(self.tail);
        self.locks[slot] += 1;
    }

    /// Pack the open tail block into its on-disk form.
    #[must_use]
    fn pack_tail_block(&self) -> Vec<u8> {
        let header = SlabJournalBlockHeader {
            head: self.head,
            sequence_number: self.tail,
            recovery_point: self.last_recovery_point,
            nonce: self.config.nonce,
            metadata_type: MetadataType::SlabJournal.as_u8(),
            has_block_map_increments: self.tail_has_block_map_increments,
            entry_count: self.tail_entries.len() as u16,
        };

        let mut block = vec![0_u8; BLOCK_SIZE];
        block[..SLAB_JOURNAL_HEADER_SIZE].copy_from_slice(&header.pack());
        for (index, entry) in self.tail_entries.iter().enumerate() {
            let at = ENTRIES_OFFSET + index * 3;
            block[at..at + 3].copy_from_slice(&pack_slab_journal_entry(entry.sbn, entry.increment));
            if self.tail_has_block_map_increments
                && entry.operation == JournalOperation::BlockMapRemapping
            {
                block[ENTRY_TYPES_OFFSET + index / 8] |= 1 << (index % 8);
            }
        }
        block
    }

    /// Write the open tail block out and open the next one.
    ///
    /// No-op on an empty tail. Fails with `InvalidState` when the
    /// ring has no free slot — the head must advance first.
    pub fn commit_tail(&mut self, device: &dyn BlockDevice) -> Result<()> {
        if self.tail_entries.is_empty() {
            return Ok(());
        }
        // The open block's slot is distinct from every live committed
        // block as long as the ring occupancy invariant held when it
        // was opened.
        if self.tail.0 - self.head.0 >= self.config.size {
            return Err(LoessError::InvalidState(format!(
                "slab journal {} ring is full (head {}, tail {})",
                self.slab_number, self.head, self.tail
            )));
        }

        let block = self.pack_tail_block();
        device.write_block(self.block_pbn(self.tail), &block)?;
        tracing::trace!(
            target: "loess::slab_journal",
            slab = self.slab_number.0,
            sequence = self.tail.0,
            entries = self.tail_entries.len(),
            "committed slab journal tail block"
        );

        self.tail = self.tail.next();
        self.tail_entries.clear();
        self.tail_has_block_map_increments = false;
        Ok(())
    }

    /// Replay one recovery-journal delta into this journal.
    pub fn attempt_replay(
        &mut self,
        device: &dyn BlockDevice,
        entry: SlabJournalEntry,
        recovery_point: JournalPoint,
    ) -> Result<ReplayAttempt> {
        // Only accept entries after the newest point already journaled.
        if !self.last_recovery_point.is_before(&recovery_point) {
            return Ok(ReplayAttempt::Skipped);
        }

        let needs_full_format = self.tail_has_block_map_increments
            || entry.operation == JournalOperation::BlockMapRemapping;
        if self.tail_entries.len() >= self.tail_capacity(needs_full_format) {
            // Opening another block needs a free ring slot; the open
            // tail occupies one alongside the unreaped committed
            // blocks.
            if self.tail.0 - self.head.0 + 1 >= self.config.size {
                return Ok(ReplayAttempt::Full);
            }
            self.commit_tail(device)?;
        }

        self.add_entry(entry, recovery_point);
        Ok(ReplayAttempt::Applied)
    }

    /// Release `count` per-entry locks against the block at
    /// `sequence`, reaping the head past fully released blocks.
    pub fn release_block_reference(&mut self, sequence: SequenceNumber, count: u64) {
        let slot = self.ring_slot(sequence);
        self.locks[slot] = self.locks[slot].saturating_sub(count);
        self.reap();
    }

    fn reap(&mut self) {
        while self.head < self.tail && self.locks[self.ring_slot(self.head)] == 0 {
            self.head = self.head.next();
        }
    }

    /// Drop every outstanding lock and reap the whole committed range.
    /// Only valid once the counters covering this journal's entries
    /// are durable (after a scrub has been saved).
    pub fn release_all_locks(&mut self) {
        self.locks.fill(0);
        self.head = self.tail;
    }

    #[must_use]
    pub fn lock_count(&self, sequence: SequenceNumber) -> u64 {
        self.locks[self.ring_slot(sequence)]
    }

    /// Read this journal's committed blocks back from the device and
    /// replay every entry into `counters` (the scrub path).
    ///
    /// The head is taken from the last committed block's header; each
    /// block must carry the right identity stamps or the journal is
    /// corrupt. Replay is idempotent through the counters' per-sector
    /// commit points. Returns the number of entries examined.
    pub fn apply_to_counters(
        &self,
        device: &dyn BlockDevice,
        counters: &mut ReferenceCounters,
    ) -> Result<usize> {
        if self.tail.0 == 1 {
            return Ok(0);
        }

        let end = SequenceNumber(self.tail.0 - 1);
        let end_block = device.read_block(self.block_pbn(end))?;
        let end_header = SlabJournalBlockHeader::unpack(end_block.as_slice())
            .map_err(|err| LoessError::Parse(err.to_string()))?;
        let head = end_header.head;

        let mut applied = 0_usize;
        for sequence in head.0..self.tail.0 {
            let sequence = SequenceNumber(sequence);
            let block = device.read_block(self.block_pbn(sequence))?;
            let header = SlabJournalBlockHeader::unpack(block.as_slice())
                .map_err(|err| LoessError::Parse(err.to_string()))?;

            let capacity = if header.has_block_map_increments {
                SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
            } else {
                SLAB_JOURNAL_ENTRIES_PER_BLOCK
            };
            if header.nonce != self.config.nonce
                || header.metadata_type != MetadataType::SlabJournal.as_u8()
                || header.sequence_number != sequence
                || header.entry_count > capacity
            {
                return Err(LoessError::CorruptJournal(format!(
                    "slab journal block for slab {} was invalid (sequence {sequence})",
                    self.slab_number
                )));
            }

            for index in 0..usize::from(header.entry_count) {
                let entry =
                    decode_block_entry(block.as_slice(), index, header.has_block_map_increments)
                        .map_err(|err| LoessError::CorruptJournal(err.to_string()))?;
                if entry.sbn.0 >= counters.block_count() {
                    return Err(LoessError::CorruptJournal(format!(
                        "slab journal entry ({sequence}, {index}) had invalid offset {} \
                         in slab of {} blocks",
                        entry.sbn, counters.block_count()
                    )));
                }
                let entry_point = JournalPoint::new(sequence, index as u16);
                counters.replay(entry_point, entry).map_err(|err| {
                    tracing::error!(
                        target: "loess::slab_journal",
                        slab = self.slab_number.0,
                        sequence = sequence.0,
                        index,
                        %err,
                        "slab journal entry could not be applied"
                    );
                    err
                })?;
                applied += 1;
            }
        }

        Ok(applied)
    }
}
