//! Per-slab reference counters.
//!
//! One saturating byte per data block, with two reserved sentinels:
//! `254` marks a provisional allocation and `255` marks a block owned
//! by the block map (pinned at the maximum so it never dedupes).
//! Counter mutations mark the covering [`ReferenceBlock`] dirty and
//! coordinate per-entry slab-journal locks so a reference update is
//! never considered durable before the journal entry that describes
//! it.
//!
//! The on-disk form of a reference block is eight independent sectors,
//! each carrying the block's latest journal commit point and its slice
//! of counters; a torn write leaves sectors disagreeing, which load
//! tolerates by taking the newest commit point and logging the tear.

use crate::{PbnLock, SlabJournalEntry};
use loess_block::{BlockDevice, ReadOnlyLatch};
use loess_error::{LoessError, Result};
use loess_types::{
    BLOCK_MAP_REFERENCE_COUNT, BLOCK_SIZE, COUNTS_PER_BLOCK, COUNTS_PER_SECTOR,
    EMPTY_REFERENCE_COUNT, JournalOperation, JournalPoint, MAXIMUM_SHAREABLE_REFERENCES,
    PROVISIONAL_REFERENCE_COUNT, Pbn, SECTOR_SIZE, SECTORS_PER_BLOCK, SequenceNumber, SlabNumber,
    read_fixed,
};
use std::collections::VecDeque;

/// Interpreted value of one reference counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceStatus {
    Free,
    Single,
    Shared,
    Provisional,
    BlockMapOwned,
}

#[must_use]
pub fn reference_status(count: u8) -> ReferenceStatus {
    match count {
        EMPTY_REFERENCE_COUNT => ReferenceStatus::Free,
        1 => ReferenceStatus::Single,
        PROVISIONAL_REFERENCE_COUNT => ReferenceStatus::Provisional,
        BLOCK_MAP_REFERENCE_COUNT => ReferenceStatus::BlockMapOwned,
        _ => ReferenceStatus::Shared,
    }
}

/// One reference adjustment, as seen from the data path or from
/// journal replay.
#[derive(Debug)]
pub struct ReferenceUpdater<'a> {
    pub operation: JournalOperation,
    pub increment: bool,
    /// The physical-zone lock covering the block, if the caller holds
    /// one. Increments clear a provisional hold through it; a
    /// decrement under a held read lock parks the block at the
    /// provisional sentinel instead of freeing it.
    pub lock: Option<&'a mut PbnLock>,
}

/// In-memory state of one on-disk block of reference counters.
#[derive(Debug, Clone)]
pub struct ReferenceBlock {
    /// Counters in this block with a nonzero value.
    pub allocated_count: u32,
    pub is_dirty: bool,
    pub is_writing: bool,
    /// Per-sector journal commit points, for torn-write detection and
    /// idempotent replay.
    pub commit_points: [JournalPoint; SECTORS_PER_BLOCK],
    /// The slab-journal block this reference block must not be
    /// considered durable before; zero when no entry is outstanding.
    pub slab_journal_lock: SequenceNumber,
    /// The lock to release once the in-flight write completes.
    pub slab_journal_lock_to_release: SequenceNumber,
}

impl Default for ReferenceBlock {
    fn default() -> Self {
        Self {
            allocated_count: 0,
            is_dirty: false,
            is_writing: false,
            commit_points: [JournalPoint::default(); SECTORS_PER_BLOCK],
            slab_journal_lock: SequenceNumber(0),
            slab_journal_lock_to_release: SequenceNumber(0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SearchCursor {
    /// Reference block currently being searched.
    block: u32,
    /// Next counter index to examine.
    index: u32,
    /// One past the last counter index of the current block.
    end_index: u32,
}

/// Outcome of [`ReferenceCounters::adjust`]: whether the block's free
/// status flipped, and a per-entry slab-journal lock the caller must
/// release (the counters do not own the journal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustResult {
    pub free_status_changed: bool,
    pub release_journal_lock: Option<SequenceNumber>,
}

/// The reference counters for every data block of one slab.
#[derive(Debug)]
pub struct ReferenceCounters {
    slab_number: SlabNumber,
    /// First data block of the slab.
    slab_start: Pbn,
    /// Data blocks counted.
    block_count: u32,
    /// Where the packed reference blocks live on the device.
    origin: Pbn,
    /// One byte per block, padded past the last reference block so the
    /// word-at-a-time free search can always load a full word.
    counters: Vec<u8>,
    free_blocks: u32,
    reference_block_count: u32,
    blocks: Vec<ReferenceBlock>,
    search_cursor: SearchCursor,
    /// FIFO of dirty reference-block indices awaiting write-back.
    dirty_blocks: VecDeque<u32>,
    /// The most recent slab-journal point reflected in the counters.
    slab_journal_point: JournalPoint,
    latch: ReadOnlyLatch,
}

const BYTES_PER_WORD: usize = 8;

impl ReferenceCounters {
    /// Create counters for a freshly formatted slab (everything free).
    #[must_use]
    pub fn new(slab_number: SlabNumber, slab_start: Pbn, block_count: u32, origin: Pbn,
               latch: ReadOnlyLatch) -> Self {
        let reference_block_count = block_count.div_ceil(COUNTS_PER_BLOCK as u32).max(1);
        // Full-length array for the runt block, plus two words of
        // padding so word loads at the very end stay in bounds. The
        // padding is poisoned nonzero so it can never look free.
        let padded =
            reference_block_count as usize * COUNTS_PER_BLOCK + 2 * BYTES_PER_WORD;
        let mut counters = vec![0xFF_u8; padded];
        counters[..block_count as usize].fill(EMPTY_REFERENCE_COUNT);

        let mut this = Self {
            slab_number,
            slab_start,
            block_count,
            origin,
            counters,
            free_blocks: block_count,
            reference_block_count,
            blocks: vec![ReferenceBlock::default(); reference_block_count as usize],
            search_cursor: SearchCursor {
                block: 0,
                index: 0,
                end_index: 0,
            },
            dirty_blocks: VecDeque::new(),
            slab_journal_point: JournalPoint::default(),
            latch,
        };
        this.reset_search_cursor();
        this
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    #[must_use]
    pub fn free_block_count(&self) -> u32 {
        self.free_blocks
    }

    #[must_use]
    pub fn reference_block_count(&self) -> u32 {
        self.reference_block_count
    }

    #[must_use]
    pub fn dirty_block_count(&self) -> usize {
        self.dirty_blocks.len()
    }

    #[must_use]
    pub fn slab_journal_point(&self) -> JournalPoint {
        self.slab_journal_point
    }

    #[must_use]
    pub fn reference_block(&self, index: u32) -> &ReferenceBlock {
        &self.blocks[index as usize]
    }

    /// The counter value for a slab-relative block number.
    pub fn count_for(&self, sbn: u32) -> Result<u8> {
        self.check_sbn(sbn)?;
        Ok(self.counters[sbn as usize])
    }

    /// The status of a physical block within this slab.
    pub fn status_for_pbn(&self, pbn: Pbn) -> Result<ReferenceStatus> {
        let sbn = self.sbn_from_pbn(pbn)?;
        Ok(reference_status(self.counters[sbn as usize]))
    }

    fn check_sbn(&self, sbn: u32) -> Result<()> {
        if sbn >= self.block_count {
            return Err(LoessError::Format(format!(
                "slab block {sbn} out of range (slab {} has {} blocks)",
                self.slab_number, self.block_count
            )));
        }
        Ok(())
    }

    fn sbn_from_pbn(&self, pbn: Pbn) -> Result<u32> {
        let offset = pbn
            .checked_sub(self.slab_start.0)
            .filter(|offset| offset.0 < u64::from(self.block_count))
            .ok_or_else(|| LoessError::Format(format!(
                "PBN {pbn} is not a data block of slab {}",
                self.slab_number
            )))?;
        Ok(offset.0 as u32)
    }

    fn block_index_for(sbn: u32) -> u32 {
        sbn / COUNTS_PER_BLOCK as u32
    }

    fn sector_for(sbn: u32) -> usize {
        (sbn as usize % COUNTS_PER_BLOCK) / COUNTS_PER_SECTOR
    }

    // ── Adjustment state machine ────────────────────────────────────────────

    fn increment_for_data(
        &mut self,
        block_index: u32,
        sbn: u32,
        lock: Option<&mut PbnLock>,
    ) -> Result<bool> {
        let count = self.counters[sbn as usize];
        let free_status_changed = match reference_status(count) {
            ReferenceStatus::Free => {
                self.counters[sbn as usize] = 1;
                self.blocks[block_index as usize].allocated_count += 1;
                self.free_blocks -= 1;
                true
            }
            ReferenceStatus::Provisional => {
                self.counters[sbn as usize] = 1;
                false
            }
            ReferenceStatus::Single | ReferenceStatus::Shared => {
                if count >= MAXIMUM_SHAREABLE_REFERENCES {
                    return Err(LoessError::ReferenceCountInvalid(format!(
                        "incrementing a block already having {MAXIMUM_SHAREABLE_REFERENCES} \
                         references (slab {}, offset {sbn})",
                        self.slab_number
                    )));
                }
                self.counters[sbn as usize] = count + 1;
                false
            }
            ReferenceStatus::BlockMapOwned => {
                return Err(LoessError::ReferenceCountInvalid(format!(
                    "incrementing a block map block as data (slab {}, offset {sbn})",
                    self.slab_number
                )));
            }
        };

        if let Some(lock) = lock {
            lock.unassign_provisional_reference();
        }
        Ok(free_status_changed)
    }

    fn decrement_for_data(
        &mut self,
        block_index: u32,
        sbn: u32,
        lock: Option<&mut PbnLock>,
    ) -> Result<(bool, bool)> {
        let count = self.counters[sbn as usize];
        match reference_status(count) {
            ReferenceStatus::Free => Err(LoessError::ReferenceCountInvalid(format!(
                "decrementing free block at offset {sbn} in slab {}",
                self.slab_number
            ))),
            ReferenceStatus::BlockMapOwned => Err(LoessError::ReferenceCountInvalid(format!(
                "decrementing a block map block at offset {sbn} in slab {}",
                self.slab_number
            ))),
            status @ (ReferenceStatus::Provisional | ReferenceStatus::Single) => {
                if let Some(lock) = lock {
                    // A read lock covers this block: it must not become
                    // unreferenced while the read is in flight.
                    self.counters[sbn as usize] = PROVISIONAL_REFERENCE_COUNT;
                    lock.assign_provisional_reference();
                    Ok((false, status == ReferenceStatus::Provisional))
                } else {
                    self.counters[sbn as usize] = EMPTY_REFERENCE_COUNT;
                    self.blocks[block_index as usize].allocated_count -= 1;
                    self.free_blocks += 1;
                    Ok((true, status == ReferenceStatus::Provisional))
                }
            }
            ReferenceStatus::Shared => {
                self.counters[sbn as usize] = count - 1;
                Ok((false, false))
            }
        }
    }

    fn increment_for_block_map(
        &mut self,
        block_index: u32,
        sbn: u32,
        lock: Option<&mut PbnLock>,
        normal_operation: bool,
    ) -> Result<bool> {
        let count = self.counters[sbn as usize];
        match reference_status(count) {
            ReferenceStatus::Free => {
                if normal_operation {
                    return Err(LoessError::ReferenceCountInvalid(format!(
                        "incrementing unallocated block map block (slab {}, offset {sbn})",
                        self.slab_number
                    )));
                }
                self.counters[sbn as usize] = BLOCK_MAP_REFERENCE_COUNT;
                self.blocks[block_index as usize].allocated_count += 1;
                self.free_blocks -= 1;
                Ok(true)
            }
            ReferenceStatus::Provisional => {
                if !normal_operation {
                    return Err(LoessError::ReferenceCountInvalid(format!(
                        "block map block had provisional reference during replay \
                         (slab {}, offset {sbn})",
                        self.slab_number
                    )));
                }
                self.counters[sbn as usize] = BLOCK_MAP_REFERENCE_COUNT;
                if let Some(lock) = lock {
                    lock.unassign_provisional_reference();
                }
                Ok(false)
            }
            _ => Err(LoessError::ReferenceCountInvalid(format!(
                "incrementing a block map block which is already referenced {count} times \
                 (slab {}, offset {sbn})",
                self.slab_number
            ))),
        }
    }

    /// Apply one update to a counter, recording the journal point when
    /// one is supplied. Returns (free status changed, decremented a
    /// provisional reference).
    fn update_reference_count(
        &mut self,
        sbn: u32,
        slab_journal_point: Option<JournalPoint>,
        updater: &mut ReferenceUpdater<'_>,
        normal_operation: bool,
    ) -> Result<(bool, bool)> {
        let block_index = Self::block_index_for(sbn);
        let (free_status_changed, provisional_decrement) = if !updater.increment {
            self.decrement_for_data(block_index, sbn, updater.lock.as_deref_mut())?
        } else if updater.operation == JournalOperation::DataRemapping {
            (
                self.increment_for_data(block_index, sbn, updater.lock.as_deref_mut())?,
                false,
            )
        } else {
            (
                self.increment_for_block_map(
                    block_index,
                    sbn,
                    updater.lock.as_deref_mut(),
                    normal_operation,
                )?,
                false,
            )
        };

        if let Some(point) = slab_journal_point {
            if point.is_valid() {
                self.slab_journal_point = point;
            }
        }

        Ok((free_status_changed, provisional_decrement))
    }

    /// Adjust the reference count of `pbn` during normal operation.
    ///
    /// On success, the covering reference block is dirty and either
    /// holds `slab_journal_point`'s block as its durability floor, or
    /// the result carries the per-entry journal lock to release —
    /// never both, so no entry is double-accounted.
    pub fn adjust(
        &mut self,
        pbn: Pbn,
        mut updater: ReferenceUpdater<'_>,
        slab_journal_point: JournalPoint,
    ) -> Result<AdjustResult> {
        let sbn = self.sbn_from_pbn(pbn)?;
        let (free_status_changed, provisional_decrement) =
            self.update_reference_count(sbn, Some(slab_journal_point), &mut updater, true)?;

        // A decrement of a provisional reference is the undo of a
        // tentative allocation that was never journaled; it needs no
        // dirty or lock bookkeeping.
        if provisional_decrement {
            return Ok(AdjustResult {
                free_status_changed,
                release_journal_lock: None,
            });
        }

        let block_index = Self::block_index_for(sbn) as usize;
        if self.blocks[block_index].is_dirty && self.blocks[block_index].slab_journal_lock.0 > 0 {
            // Already dirty with a recorded floor: this entry's
            // per-entry journal lock must be released instead.
            if !slab_journal_point.is_valid() {
                return Err(LoessError::InvalidState(
                    "reference count adjustments need slab journal points".to_owned(),
                ));
            }
            return Ok(AdjustResult {
                free_status_changed,
                release_journal_lock: Some(slab_journal_point.sequence_number),
            });
        }

        // First update since the block was last clean: the per-entry
        // lock converts into the block's durability floor.
        self.blocks[block_index].slab_journal_lock = if slab_journal_point.is_valid() {
            slab_journal_point.sequence_number
        } else {
            SequenceNumber(0)
        };
        self.dirty_block(block_index as u32);
        Ok(AdjustResult {
            free_status_changed,
            release_journal_lock: None,
        })
    }

    /// Adjust a count while rebuilding from the block map: always an
    /// increment from free (or, for block-map blocks, from free only),
    /// with the rebuild-mode invariants.
    pub fn adjust_for_rebuild(&mut self, pbn: Pbn, operation: JournalOperation) -> Result<()> {
        let sbn = self.sbn_from_pbn(pbn)?;
        let mut updater = ReferenceUpdater {
            operation,
            increment: true,
            lock: None,
        };
        self.update_reference_count(sbn, None, &mut updater, false)?;
        self.dirty_block(Self::block_index_for(sbn));
        Ok(())
    }

    /// Replay one already-journaled adjustment.
    ///
    /// Skipped without effect when the covering sector's recorded
    /// commit point is already at or past `entry_point` — the delta is
    /// known to be reflected in the counters loaded from disk.
    pub fn replay(&mut self, entry_point: JournalPoint, entry: SlabJournalEntry) -> Result<()> {
        let sbn = entry.sbn.0;
        self.check_sbn(sbn)?;
        let block_index = Self::block_index_for(sbn) as usize;
        let sector = Self::sector_for(sbn);
        if !self.blocks[block_index].commit_points[sector].is_before(&entry_point) {
            // Already reflected in the on-disk counters.
            return Ok(());
        }

        let mut updater = ReferenceUpdater {
            operation: entry.operation,
            increment: entry.increment,
            lock: None,
        };
        self.update_reference_count(sbn, Some(entry_point), &mut updater, false)?;
        self.dirty_block(block_index as u32);
        Ok(())
    }

    fn dirty_block(&mut self, block_index: u32) {
        let block = &mut self.blocks[block_index as usize];
        if block.is_dirty {
            return;
        }
        block.is_dirty = true;
        if !block.is_writing {
            self.dirty_blocks.push_back(block_index);
        }
    }

    /// Mark every reference block dirty (used when saving a freshly
    /// built slab whose counters were never written).
    pub fn dirty_all_blocks(&mut self) {
        for index in 0..self.reference_block_count {
            self.dirty_block(index);
        }
    }

    /// Reset every counter to free, discarding commit points and
    /// dirty state. A rebuild starts from counters it derives itself,
    /// not from whatever was loaded.
    pub fn reset(&mut self) {
        self.counters[..self.block_count as usize].fill(EMPTY_REFERENCE_COUNT);
        self.free_blocks = self.block_count;
        self.slab_journal_point = JournalPoint::default();
        self.dirty_blocks.clear();
        for block in &mut self.blocks {
            *block = ReferenceBlock::default();
        }
        self.reset_search_cursor();
    }

    // ── Free block search ───────────────────────────────────────────────────

    fn reset_search_cursor(&mut self) {
        self.search_cursor.block = 0;
        self.search_cursor.index = 0;
        // A slab smaller than one reference block is a runt.
        self.search_cursor.end_index = (COUNTS_PER_BLOCK as u32).min(self.block_count);
    }

    /// Advance the cursor to the next reference block, without
    /// wrapping. Returns false from the last block.
    fn advance_search_cursor(&mut self) -> bool {
        if self.search_cursor.block + 1 >= self.reference_block_count {
            self.reset_search_cursor();
            return false;
        }
        self.search_cursor.block += 1;
        self.search_cursor.index = self.search_cursor.end_index;
        self.search_cursor.end_index = if self.search_cursor.block + 1 == self.reference_block_count
        {
            // The last reference block is usually a runt.
            self.block_count
        } else {
            self.search_cursor.end_index + COUNTS_PER_BLOCK as u32
        };
        true
    }

    /// Find the first zero counter in `[start, end)`, loading the
    /// padded array a word at a time.
    fn find_zero_counter(&self, start: u32, end: u32) -> Option<u32> {
        let end = end.min(self.block_count) as usize;
        let mut index = start as usize;
        while index < end {
            let word = u64::from_le_bytes(
                read_fixed::<8>(&self.counters, index).unwrap_or_else(|_| {
                    unreachable!("counter array is padded past the last block")
                }),
            );
            let mut shifted = word;
            for offset in 0..BYTES_PER_WORD {
                if shifted & 0xFF == 0 {
                    let found = index + offset;
                    if found < end {
                        return Some(found as u32);
                    }
                    // A zero past the range ends the search: every
                    // later hit in this scan is also out of range.
                    return None;
                }
                shifted >>= 8;
            }
            index += BYTES_PER_WORD;
        }
        None
    }

    fn search_from_cursor(&mut self) -> Option<u32> {
        loop {
            // Skip blocks known to be full.
            if self.blocks[self.search_cursor.block as usize].allocated_count
                < (self.search_cursor.end_index - self.search_cursor.block * COUNTS_PER_BLOCK as u32)
            {
                if let Some(found) =
                    self.find_zero_counter(self.search_cursor.index, self.search_cursor.end_index)
                {
                    return Some(found);
                }
            }
            if !self.advance_search_cursor() {
                return None;
            }
        }
    }

    /// Find a free block, scanning from the persistent cursor and
    /// wrapping to the start of the slab once per call.
    pub fn find_free_block(&mut self) -> Option<u32> {
        if let Some(found) = self.search_from_cursor() {
            return Some(found);
        }
        // advance_search_cursor reset the cursor; one pass from the
        // start covers the skipped prefix.
        self.search_from_cursor()
    }

    /// Find and provisionally allocate a free block.
    pub fn allocate_free_block(&mut self) -> Result<Pbn> {
        let Some(free_index) = self.find_free_block() else {
            return Err(LoessError::OutOfSpace);
        };

        debug_assert_eq!(self.counters[free_index as usize], EMPTY_REFERENCE_COUNT);
        self.counters[free_index as usize] = PROVISIONAL_REFERENCE_COUNT;
        self.blocks[Self::block_index_for(free_index) as usize].allocated_count += 1;
        self.free_blocks -= 1;

        // The next search starts just past this block.
        self.search_cursor.index = free_index + 1;

        Ok(Pbn(self.slab_start.0 + u64::from(free_index)))
    }

    // ── On-disk block format ────────────────────────────────────────────────

    /// Pack reference block `block_index` into its on-disk form: eight
    /// sectors, each stamping the block's latest commit point beside
    /// its slice of counters.
    #[must_use]
    pub fn pack_reference_block(&self, block_index: u32) -> Vec<u8> {
        let mut out = vec![0_u8; BLOCK_SIZE];
        let commit_point = self.slab_journal_point.pack();
        let base = block_index as usize * COUNTS_PER_BLOCK;
        for sector in 0..SECTORS_PER_BLOCK {
            let sector_base = sector * SECTOR_SIZE;
            out[sector_base..sector_base + 8].copy_from_slice(&commit_point);
            let counts_base = base + sector * COUNTS_PER_SECTOR;
            out[sector_base + 8..sector_base + 8 + COUNTS_PER_SECTOR]
                .copy_from_slice(&self.counters[counts_base..counts_base + COUNTS_PER_SECTOR]);
        }
        out
    }

    /// Unpack an on-disk reference block into `block_index`.
    ///
    /// The newest commit point across sectors becomes the block's
    /// recorded point; a sector disagreeing with sector 0 is a torn
    /// write, logged but tolerated.
    pub fn unpack_reference_block(&mut self, block_index: u32, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(LoessError::Format(format!(
                "reference block must be {BLOCK_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let base = block_index as usize * COUNTS_PER_BLOCK;
        let mut commit_points = [JournalPoint::default(); SECTORS_PER_BLOCK];
        for sector in 0..SECTORS_PER_BLOCK {
            let sector_base = sector * SECTOR_SIZE;
            let point = JournalPoint::unpack(
                read_fixed(data, sector_base).map_err(|err| LoessError::Parse(err.to_string()))?,
            );
            commit_points[sector] = point;
            self.counters[base + sector * COUNTS_PER_SECTOR
                ..base + (sector + 1) * COUNTS_PER_SECTOR]
                .copy_from_slice(
                    &data[sector_base + 8..sector_base + 8 + COUNTS_PER_SECTOR],
                );

            if self.slab_journal_point.is_before(&point) {
                self.slab_journal_point = point;
            }

            if sector > 0 && commit_points[sector] != commit_points[0] {
                tracing::warn!(
                    target: "loess::refcounts",
                    slab = self.slab_number.0,
                    block = block_index,
                    sector,
                    "torn write detected in reference block sector"
                );
            }
        }

        let block = &mut self.blocks[block_index as usize];
        block.commit_points = commit_points;
        block.allocated_count = 0;

        let block_end = (base + COUNTS_PER_BLOCK).min(self.block_count as usize);
        let mut allocated = 0_u32;
        for index in base..block_end {
            if self.counters[index] != EMPTY_REFERENCE_COUNT {
                allocated += 1;
            }
        }
        // Poison the tail of a runt block so the free search never
        // returns a counter past the slab.
        for index in block_end..base + COUNTS_PER_BLOCK {
            self.counters[index] = 0xFF;
        }
        block.allocated_count = allocated;
        Ok(())
    }

    /// Release any provisional references left in a loaded block: they
    /// belonged to writes that never completed.
    fn clear_provisional_references(&mut self, block_index: u32) {
        let base = block_index as usize * COUNTS_PER_BLOCK;
        let block_end = (base + COUNTS_PER_BLOCK).min(self.block_count as usize);
        for index in base..block_end {
            if self.counters[index] == PROVISIONAL_REFERENCE_COUNT {
                self.counters[index] = EMPTY_REFERENCE_COUNT;
                self.blocks[block_index as usize].allocated_count -= 1;
            }
        }
    }

    // ── Bulk I/O lifecycle ──────────────────────────────────────────────────

    /// Load every reference block from the device, clearing
    /// provisional holds and recomputing the free count.
    pub fn load(&mut self, device: &dyn BlockDevice) -> Result<()> {
        self.free_blocks = self.block_count;
        for index in 0..self.reference_block_count {
            let pbn = Pbn(self.origin.0 + u64::from(index));
            let data = match device.read_block(pbn) {
                Ok(buf) => buf,
                Err(err) => {
                    self.latch.enter_read_only_mode(&err);
                    return Err(err);
                }
            };
            self.unpack_reference_block(index, data.as_slice())?;
            self.clear_provisional_references(index);
            self.free_blocks -= self.blocks[index as usize].allocated_count;
        }
        Ok(())
    }

    fn write_reference_block(
        &mut self,
        device: &dyn BlockDevice,
        block_index: u32,
    ) -> Result<SequenceNumber> {
        let packed = self.pack_reference_block(block_index);
        let block = &mut self.blocks[block_index as usize];
        block.slab_journal_lock_to_release = block.slab_journal_lock;
        // Clean before the write: updates landing after this moment
        // re-dirty the block and queue another write.
        block.is_dirty = false;
        block.is_writing = true;

        let pbn = Pbn(self.origin.0 + u64::from(block_index));
        let result = device.write_block(pbn, &packed);

        let block = &mut self.blocks[block_index as usize];
        block.is_writing = false;
        match result {
            Ok(()) => {
                // Every sector of the written block now records the
                // packed commit point.
                let committed = JournalPoint::unpack(
                    packed[0..8]
                        .try_into()
                        .unwrap_or_else(|_| unreachable!("slice of fixed size")),
                );
                block.commit_points = [committed; SECTORS_PER_BLOCK];
                Ok(block.slab_journal_lock_to_release)
            }
            Err(err) => {
                self.latch.enter_read_only_mode(&err);
                Err(err)
            }
        }
    }

    /// Write out up to `dirty / divisor` dirty blocks (at least one),
    /// oldest first. Returns the slab-journal locks the writes
    /// released; the caller applies them to the slab journal.
    pub fn save_dirty(
        &mut self,
        device: &dyn BlockDevice,
        divisor: usize,
    ) -> Result<Vec<SequenceNumber>> {
        let dirty = self.dirty_blocks.len();
        if dirty == 0 {
            return Ok(Vec::new());
        }
        let to_write = (dirty / divisor.max(1)).max(1);
        self.save_next(device, to_write)
    }

    /// Write out every dirty block.
    pub fn save_all(&mut self, device: &dyn BlockDevice) -> Result<Vec<SequenceNumber>> {
        let dirty = self.dirty_blocks.len();
        self.save_next(device, dirty)
    }

    fn save_next(
        &mut self,
        device: &dyn BlockDevice,
        count: usize,
    ) -> Result<Vec<SequenceNumber>> {
        let mut released = Vec::new();
        for _ in 0..count {
            let Some(block_index) = self.dirty_blocks.pop_front() else {
                break;
            };
            let lock = self.write_reference_block(device, block_index)?;
            if lock.0 > 0 {
                released.push(lock);
            }
            let block = &mut self.blocks[block_index as usize];
            block.slab_journal_lock = SequenceNumber(0);
            if block.is_dirty {
                // Re-dirtied while writing; queue it again.
                self.dirty_blocks.push_back(block_index);
            }
        }
        Ok(released)
    }
}
