//! The recovery state machine.
//!
//! One [`RecoveryCoordinator`] owns one recovery attempt end to end:
//! it loads the recovery journal into memory, determines the usable
//! head/tail bounds, and then either replays journal entries into the
//! block map and the slab journals (targeted replay), or rebuilds
//! every reference count from the block map's own pages (read-only
//! rebuild) when the journal cannot be trusted.
//!
//! Each phase runs to completion before the next begins; the `Phase`
//! tag plus the driving loop in [`RecoveryCoordinator::run`] replace
//! the callback chains a fully asynchronous implementation would
//! register at every suspension point. The first error wins: it
//! aborts the remaining phases, releases held resources, and (for
//! integrity violations) latches the store read-only.

use crate::block_map_replay::{NumberedBlockMapping, replay_into_block_map};
use loess_block::BlockDevice;
use loess_block_map::{BlockMapPage, BlockMapView, PageCache};
use loess_error::{LoessError, Result};
use loess_journal::{
    ENTRIES_PER_BLOCK, ENTRIES_PER_SECTOR, ENTRY_SIZE, JournalEntry, LEGACY_ENTRY_SIZE,
    MetadataType, RecoveryBlockHeader, RecoveryJournalConfig, SECTOR_HEADER_SIZE, SectorHeader,
    entries_per_sector, sector_bytes, unpack_legacy_entry,
};
use loess_slab::{ReplayAttempt, SlabDepot, SlabStatus};
use loess_types::{
    BLOCK_MAP_ENTRIES_PER_PAGE, BLOCK_SIZE, BlockMapEntry, JournalOperation, JournalPoint, Pbn,
    RecoveryPoint, SECTORS_PER_BLOCK, SequenceNumber, ZERO_BLOCK,
};
use serde::{Deserialize, Serialize};

/// How the store shut down, as recorded by the prior load inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Unclean shutdown; the journal should be replayable.
    Dirty,
    /// Crashed while a previous recovery was replaying into the block
    /// map; the block map must be redone but the slab journals were
    /// already recovered.
    Replaying,
    /// Operator-requested rebuild to clear read-only mode.
    ForceRebuild,
    /// Rebuild requested as part of an upgrade.
    RebuildForUpgrade,
}

/// Which strategy this recovery is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Targeted replay of a trustworthy journal.
    Replay,
    /// Full rebuild of reference counts from the block map's leaves.
    Rebuild,
}

/// Everything a recovery consumes, handed in by the embedding store.
pub struct RecoveryContext<'a> {
    pub device: &'a dyn BlockDevice,
    pub journal: RecoveryJournalConfig,
    pub page_cache: &'a dyn PageCache,
    pub block_map: &'a dyn BlockMapView,
    pub depot: &'a mut SlabDepot,
    /// Maximum concurrently held page-cache leases during block-map
    /// replay.
    pub page_window: usize,
}

/// The recovered figures a caller persists into its durable header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub mode: RecoveryMode,
    pub entries_replayed_into_block_map: usize,
    pub entries_added_to_slab_journals: usize,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
    pub highest_tail: u64,
    pub tail: u64,
    /// The recovery count the next generation of journal blocks must
    /// carry.
    pub next_recovery_count: u8,
}

impl RecoverySummary {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    LoadingJournal,
    ParsingJournal,
    ReplayingBlockMap,
    ReplayingSlabJournals,
    RebuildingTree,
    RebuildingLeaves,
    FlushingBlockMap,
    DrainingSlabs,
    Done,
}

/// Begin a full recovery or rebuild, selected from the prior load
/// state, and drive it to completion.
pub fn repair(ctx: RecoveryContext<'_>, load_state: LoadState) -> Result<RecoverySummary> {
    match load_state {
        LoadState::ForceRebuild => {
            tracing::warn!(
                target: "loess::recovery",
                "rebuilding reference counts to clear read-only mode"
            );
        }
        LoadState::RebuildForUpgrade => {
            tracing::warn!(
                target: "loess::recovery",
                "rebuilding reference counts for upgrade"
            );
        }
        LoadState::Dirty | LoadState::Replaying => {
            tracing::warn!(
                target: "loess::recovery",
                "device was dirty, rebuilding reference counts"
            );
        }
    }

    let mode = match load_state {
        LoadState::Dirty | LoadState::Replaying => RecoveryMode::Replay,
        LoadState::ForceRebuild | LoadState::RebuildForUpgrade => RecoveryMode::Rebuild,
    };
    RecoveryCoordinator::new(ctx, load_state, mode).run()
}

/// Working state of one recovery attempt. Single-owner, single-use:
/// built at the start of an attempt and consumed by [`Self::run`].
pub struct RecoveryCoordinator<'a> {
    ctx: RecoveryContext<'a>,
    load_state: LoadState,
    mode: RecoveryMode,
    phase: Phase,
    /// The whole journal region, read in one pass.
    journal_data: Vec<u8>,
    /// Extracted mappings awaiting block-map replay.
    entries: Vec<NumberedBlockMapping>,
    block_map_head: SequenceNumber,
    slab_journal_head: SequenceNumber,
    tail: SequenceNumber,
    highest_tail: SequenceNumber,
    /// One past the last valid entry of the journal.
    tail_recovery_point: RecoveryPoint,
    /// Upper bound on extractable entries, from the sector walk.
    entry_count: usize,
    logical_blocks_used: u64,
    block_map_data_blocks: u64,
    block_map_entries_applied: usize,
    entries_added_to_slab_journals: usize,
}

impl<'a> RecoveryCoordinator<'a> {
    #[must_use]
    pub fn new(ctx: RecoveryContext<'a>, load_state: LoadState, mode: RecoveryMode) -> Self {
        Self {
            ctx,
            load_state,
            mode,
            phase: Phase::LoadingJournal,
            journal_data: Vec::new(),
            entries: Vec::new(),
            block_map_head: SequenceNumber(0),
            slab_journal_head: SequenceNumber(0),
            tail: SequenceNumber(0),
            highest_tail: SequenceNumber(0),
            tail_recovery_point: RecoveryPoint::default(),
            entry_count: 0,
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
            block_map_entries_applied: 0,
            entries_added_to_slab_journals: 0,
        }
    }

    /// Drive the state machine to `Done` or the first fatal error.
    pub fn run(mut self) -> Result<RecoverySummary> {
        loop {
            let step = match self.phase {
                Phase::LoadingJournal => self.load_journal(),
                Phase::ParsingJournal => self.parse_journal(),
                Phase::ReplayingBlockMap => self.replay_block_map(),
                Phase::ReplayingSlabJournals => self.replay_slab_journals(),
                Phase::RebuildingTree => self.rebuild_from_tree(),
                Phase::RebuildingLeaves => self.rebuild_from_leaves(),
                Phase::FlushingBlockMap => self.flush_block_map(),
                Phase::DrainingSlabs => self.drain_slabs(),
                Phase::Done => {
                    tracing::info!(target: "loess::recovery", "rebuild complete");
                    return Ok(self.summary());
                }
            };

            match step {
                Ok(next) => self.phase = next,
                Err(err) => {
                    if err.forces_read_only() {
                        self.ctx.depot.latch().enter_read_only_mode(&err);
                    } else {
                        tracing::error!(target: "loess::recovery", %err, "recovery failed");
                    }
                    tracing::warn!(target: "loess::recovery", "recovery aborted");
                    return Err(err);
                }
            }
        }
    }

    fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            mode: self.mode,
            entries_replayed_into_block_map: self.block_map_entries_applied,
            entries_added_to_slab_journals: self.entries_added_to_slab_journals,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
            highest_tail: self.highest_tail.0,
            tail: self.tail.0,
            next_recovery_count: self.ctx.journal.recovery_count.wrapping_add(1),
        }
    }

    // ── Journal access ──────────────────────────────────────────────────────

    fn block_bytes_by_index(&self, index: u64) -> &[u8] {
        let start = index as usize * BLOCK_SIZE;
        &self.journal_data[start..start + BLOCK_SIZE]
    }

    fn block_bytes(&self, sequence: SequenceNumber) -> &[u8] {
        self.block_bytes_by_index(self.ctx.journal.block_index(sequence))
    }

    fn header_by_index(&self, index: u64) -> RecoveryBlockHeader {
        RecoveryBlockHeader::unpack(self.block_bytes_by_index(index))
            .unwrap_or_else(|_| unreachable!("journal blocks are BLOCK_SIZE"))
    }

    fn header_at(&self, sequence: SequenceNumber) -> RecoveryBlockHeader {
        self.header_by_index(self.ctx.journal.block_index(sequence))
    }

    /// Unpack the current-format entry at `point`.
    fn entry_at(&self, point: &RecoveryPoint) -> Result<JournalEntry> {
        let block = self.block_bytes(point.sequence_number);
        let sector = sector_bytes(block, usize::from(point.sector))
            .map_err(|err| LoessError::CorruptJournal(err.to_string()))?;
        let offset = SECTOR_HEADER_SIZE + usize::from(point.entry) * ENTRY_SIZE;
        JournalEntry::unpack(&sector[offset..offset + ENTRY_SIZE])
            .map_err(|err| LoessError::CorruptJournal(err.to_string()))
    }

    /// Move a recovery point forward by one entry.
    fn increment_recovery_point(point: &mut RecoveryPoint) {
        point.entry += 1;
        if point.entry < ENTRIES_PER_SECTOR {
            return;
        }
        point.entry = 0;
        if usize::from(point.sector) < SECTORS_PER_BLOCK - 1 {
            point.sector += 1;
            return;
        }
        point.sequence_number = point.sequence_number.next();
        point.sector = 1;
    }

    /// The slab-journal-visible position of one half-entry: entry
    /// indices are doubled so the increment and decrement halves of
    /// one journal entry carry distinct, ordered points.
    fn expanded_journal_point(point: &RecoveryPoint, increment: bool) -> JournalPoint {
        let entry_number = u16::from(point.sector - 1) * ENTRIES_PER_SECTOR + point.entry;
        JournalPoint::new(
            point.sequence_number,
            entry_number * 2 + u16::from(!increment),
        )
    }

    /// Validate one journal entry against the store's geometry.
    fn validate_entry(&self, entry: &JournalEntry) -> Result<()> {
        let ok = entry.slot.pbn.0 < self.ctx.device.block_count()
            && entry.slot.slot < BLOCK_MAP_ENTRIES_PER_PAGE
            && entry.mapping.is_valid()
            && entry.unmapping.is_valid()
            && self.ctx.depot.is_physical_data_block(entry.mapping.pbn)
            && self.ctx.depot.is_physical_data_block(entry.unmapping.pbn);
        if !ok {
            return Err(LoessError::CorruptJournal(format!(
                "invalid entry: {} ({}, {}) from {} to {} is not within bounds",
                entry.operation.name(),
                entry.slot.pbn,
                entry.slot.slot,
                entry.unmapping.pbn,
                entry.mapping.pbn,
            )));
        }

        if entry.operation == JournalOperation::BlockMapRemapping
            && (entry.mapping.state.is_compressed()
                || entry.mapping.pbn == ZERO_BLOCK
                || entry.unmapping.is_mapped()
                || entry.unmapping.pbn != ZERO_BLOCK)
        {
            return Err(LoessError::CorruptJournal(format!(
                "invalid entry: {} ({}, {}) from {} to {} is not a valid tree mapping",
                entry.operation.name(),
                entry.slot.pbn,
                entry.slot.slot,
                entry.unmapping.pbn,
                entry.mapping.pbn,
            )));
        }

        Ok(())
    }

    // ── Phase: loading ──────────────────────────────────────────────────────

    fn load_journal(&mut self) -> Result<Phase> {
        self.journal_data = self
            .ctx
            .device
            .read_blocks(self.ctx.journal.origin, self.ctx.journal.size)?;
        tracing::info!(
            target: "loess::recovery",
            blocks = self.ctx.journal.size,
            "finished reading recovery journal"
        );
        Ok(Phase::ParsingJournal)
    }

    // ── Phase: parsing ──────────────────────────────────────────────────────

    /// Scan every journal block for a valid header, finding the
    /// highest tail and the maximum heads recorded by any valid block.
    fn find_head_and_tail(&mut self) -> bool {
        let mut found_entries = false;
        let mut highest_tail = SequenceNumber(0);
        let mut block_map_head = SequenceNumber(0);
        let mut slab_journal_head = SequenceNumber(0);

        for index in 0..self.ctx.journal.size {
            let header = self.header_by_index(index);
            if !header.is_valid_for(&self.ctx.journal, true) {
                // Old or unformatted.
                continue;
            }
            if self.ctx.journal.block_index(header.sequence_number) != index {
                // A valid block in the wrong location.
                continue;
            }

            if header.sequence_number >= highest_tail {
                found_entries = true;
                highest_tail = header.sequence_number;
            }
            block_map_head = block_map_head.max(header.block_map_head);
            slab_journal_head = slab_journal_head.max(header.slab_journal_head);
        }

        self.highest_tail = highest_tail;
        if !found_entries {
            return false;
        }
        self.block_map_head = block_map_head;
        self.slab_journal_head = slab_journal_head;
        true
    }

    fn parse_journal(&mut self) -> Result<Phase> {
        match self.mode {
            RecoveryMode::Replay => self.prepare_replay(),
            RecoveryMode::Rebuild => self.extract_for_rebuild(),
        }
    }

    /// Fall back from targeted replay to a full rebuild.
    fn fall_back_to_rebuild(&mut self, reason: &str) -> Phase {
        tracing::warn!(
            target: "loess::recovery",
            reason,
            "recovery journal is not replayable, falling back to read-only rebuild"
        );
        self.mode = RecoveryMode::Rebuild;
        self.entries.clear();
        self.entry_count = 0;
        Phase::ParsingJournal
    }

    /// Determine the usable limits of the journal and extract the
    /// entries for targeted replay (mode A).
    fn prepare_replay(&mut self) -> Result<Phase> {
        if !self.find_head_and_tail() {
            tracing::info!(
                target: "loess::recovery",
                "replaying 0 recovery entries into block map"
            );
            return Ok(Phase::FlushingBlockMap);
        }

        // Replay needs every block from the heads to some tail; heads
        // recorded beyond the highest surviving block mean the journal
        // cannot describe a consistent replay at all.
        if self.block_map_head > self.highest_tail || self.slab_journal_head > self.highest_tail {
            return Ok(self.fall_back_to_rebuild("journal heads beyond the highest tail"));
        }

        let head = self.block_map_head.min(self.slab_journal_head);
        let mut found_entries = false;
        let mut sequence = head;
        while sequence <= self.highest_tail {
            self.tail = sequence;
            self.tail_recovery_point = RecoveryPoint {
                sequence_number: sequence,
                sector: 0,
                entry: 0,
                increment_applied: false,
            };

            let header = self.header_at(sequence);
            if header.metadata_type() == Some(MetadataType::RecoveryJournal) {
                // An old-format block cannot be replayed in place.
                return Ok(self.fall_back_to_rebuild("legacy-format journal block"));
            }
            if !header.is_exactly(&self.ctx.journal, sequence, MetadataType::RecoveryJournal2) {
                // A bad block header: this is the end of the journal.
                break;
            }

            let mut block_entries = header.entry_count;
            let mut torn = false;
            for sector_number in 1..SECTORS_PER_BLOCK {
                let sector = sector_bytes(self.block_bytes(sequence), sector_number)
                    .unwrap_or_else(|_| unreachable!("sector within a full block"));
                let sector_header = SectorHeader::unpack(sector)
                    .unwrap_or_else(|_| unreachable!("sector stamp within a full sector"));
                if !sector_header.matches(&header) {
                    // A bad sector means the block was torn.
                    torn = true;
                    break;
                }

                let sector_entries = u16::from(sector_header.entry_count).min(block_entries);
                if sector_entries > 0 {
                    found_entries = true;
                    self.tail_recovery_point.sector = sector_number as u8;
                    self.tail_recovery_point.entry = sector_entries;
                    block_entries -= sector_entries;
                    self.entry_count += usize::from(sector_entries);
                }

                // A short sector means the later sectors cannot matter.
                if sector_entries < ENTRIES_PER_SECTOR || block_entries == 0 {
                    break;
                }
            }

            // A block that was not filled, or that tore, ends the
            // journal.
            if torn || header.entry_count != ENTRIES_PER_BLOCK || block_entries > 0 {
                break;
            }
            sequence = sequence.next();
        }

        if !found_entries {
            tracing::info!(
                target: "loess::recovery",
                "replaying 0 recovery entries into block map"
            );
            return Ok(Phase::FlushingBlockMap);
        }

        // The last examined block may have contributed nothing.
        if self.tail_recovery_point.sector == 0 {
            self.tail = SequenceNumber(self.tail.0 - 1);
        }

        // Both reap heads must be at or before the usable tail, or the
        // journal cannot describe a consistent replay.
        if self.block_map_head > self.tail || self.slab_journal_head > self.tail {
            return Ok(self.fall_back_to_rebuild("journal tail earlier than its heads"));
        }

        tracing::info!(
            target: "loess::recovery",
            highest_tail = self.highest_tail.0,
            tail = self.tail.0,
            "found highest-numbered and highest usable journal blocks"
        );

        self.compute_usages()?;
        self.extract_increments()?;
        Ok(Phase::ReplayingBlockMap)
    }

    /// Determine the logical-blocks-used and block-map-block counts as
    /// of the end of the journal.
    fn compute_usages(&mut self) -> Result<()> {
        let tail_header = self.header_at(self.tail);
        self.logical_blocks_used = tail_header.logical_blocks_used;
        self.block_map_data_blocks = tail_header.block_map_data_blocks;

        let mut point = RecoveryPoint {
            sequence_number: self.tail,
            sector: 1,
            entry: 0,
            increment_applied: false,
        };
        while point.is_before(&self.tail_recovery_point) {
            let entry = self.entry_at(&point)?;
            self.validate_entry(&entry)?;

            if entry.operation == JournalOperation::BlockMapRemapping {
                self.block_map_data_blocks += 1;
            } else {
                if entry.mapping.is_mapped() {
                    self.logical_blocks_used += 1;
                }
                if entry.unmapping.is_mapped() {
                    self.logical_blocks_used = self.logical_blocks_used.saturating_sub(1);
                }
            }
            Self::increment_recovery_point(&mut point);
        }
        Ok(())
    }

    /// Transcribe every entry's increment half, in journal order,
    /// validating strictly: a corrupt entry in a replayable journal
    /// poisons the whole recovery.
    fn extract_increments(&mut self) -> Result<()> {
        self.entries = Vec::with_capacity(self.entry_count);
        let mut point = RecoveryPoint {
            sequence_number: self.block_map_head,
            sector: 1,
            entry: 0,
            increment_applied: false,
        };
        while point.is_before(&self.tail_recovery_point) {
            let entry = self.entry_at(&point)?;
            self.validate_entry(&entry)?;

            self.entries.push(NumberedBlockMapping {
                slot: entry.slot,
                entry: BlockMapEntry::pack(entry.mapping.pbn, entry.mapping.state),
                number: self.entries.len() as u32,
            });
            Self::increment_recovery_point(&mut point);
        }
        debug_assert!(
            self.entries.len() <= self.entry_count,
            "approximate entry count is an upper bound"
        );
        Ok(())
    }

    /// Extract every decodable entry for a rebuild (mode B): invalid
    /// or undecodable entries are skipped, not fatal — the rebuild
    /// tolerates data loss in exchange for always completing.
    fn extract_for_rebuild(&mut self) -> Result<Phase> {
        if !self.find_head_and_tail() {
            return Ok(Phase::ReplayingBlockMap);
        }
        self.tail = self.highest_tail;

        let format = match self.header_at(self.tail).metadata_type() {
            Some(MetadataType::RecoveryJournal) => MetadataType::RecoveryJournal,
            _ => MetadataType::RecoveryJournal2,
        };
        let entries_per_block = if format == MetadataType::RecoveryJournal {
            loess_journal::LEGACY_ENTRIES_PER_BLOCK
        } else {
            ENTRIES_PER_BLOCK
        };

        for sequence in self.block_map_head.0..=self.tail.0 {
            self.extract_entries_from_block(SequenceNumber(sequence), format, entries_per_block);
        }
        Ok(Phase::ReplayingBlockMap)
    }

    fn extract_entries_from_block(
        &mut self,
        sequence: SequenceNumber,
        format: MetadataType,
        entries_per_block: u16,
    ) {
        let header = self.header_at(sequence);
        if !header.is_exactly(&self.ctx.journal, sequence, format) {
            // This block is invalid, so skip it.
            return;
        }

        let mut remaining = entries_per_block.min(header.entry_count);
        for sector_number in 1..SECTORS_PER_BLOCK {
            if remaining == 0 {
                break;
            }
            let sector_capacity = entries_per_sector(format, sector_number);
            let sector_entries = remaining.min(sector_capacity);

            let block = self.block_bytes(sequence);
            let sector = sector_bytes(block, sector_number)
                .unwrap_or_else(|_| unreachable!("sector within a full block"));
            let sector_header = SectorHeader::unpack(sector)
                .unwrap_or_else(|_| unreachable!("sector stamp within a full sector"));
            if sector_header.matches(&header) {
                // Only extract as many as the block header calls for.
                let count = sector_entries.min(u16::from(sector_header.entry_count));
                let mut decoded = Vec::with_capacity(usize::from(count));
                for index in 0..usize::from(count) {
                    if let Some(entry) = Self::unpack_lenient(sector, index, format) {
                        decoded.push(entry);
                    }
                }
                for entry in decoded {
                    if self.validate_entry(&entry).is_err() {
                        // When recovering from read-only mode, ignore
                        // damaged entries.
                        continue;
                    }
                    self.entries.push(NumberedBlockMapping {
                        slot: entry.slot,
                        entry: BlockMapEntry::pack(entry.mapping.pbn, entry.mapping.state),
                        number: self.entries.len() as u32,
                    });
                }
            }

            // Count a short sector as full against the block header's
            // claimed entry count.
            remaining -= sector_entries;
        }
    }

    fn unpack_lenient(sector: &[u8], index: usize, format: MetadataType) -> Option<JournalEntry> {
        match format {
            MetadataType::RecoveryJournal2 => {
                let offset = SECTOR_HEADER_SIZE + index * ENTRY_SIZE;
                JournalEntry::unpack(sector.get(offset..offset + ENTRY_SIZE)?).ok()
            }
            MetadataType::RecoveryJournal => {
                let offset = SECTOR_HEADER_SIZE + index * LEGACY_ENTRY_SIZE;
                unpack_legacy_entry(sector.get(offset..offset + LEGACY_ENTRY_SIZE)?)
                    .ok()
                    .flatten()
            }
            MetadataType::SlabJournal => None,
        }
    }

    // ── Phase: block map replay ─────────────────────────────────────────────

    fn replay_block_map(&mut self) -> Result<Phase> {
        let mut entries = std::mem::take(&mut self.entries);
        self.block_map_entries_applied =
            replay_into_block_map(&mut entries, self.ctx.page_cache, self.ctx.page_window)?;
        // The mapping array is single-use; drop it before the
        // remaining phases run.
        drop(entries);

        Ok(match self.mode {
            RecoveryMode::Replay => {
                if self.load_state == LoadState::Replaying {
                    // The slab journals were recovered before the
                    // crash that interrupted the block map replay.
                    Phase::FlushingBlockMap
                } else {
                    Phase::ReplayingSlabJournals
                }
            }
            RecoveryMode::Rebuild => Phase::RebuildingTree,
        })
    }

    // ── Phase: slab journal replay ──────────────────────────────────────────

    fn replay_slab_journals(&mut self) -> Result<Phase> {
        self.ctx.depot.mark_all_unrecovered();

        let mut point = RecoveryPoint {
            sequence_number: self.slab_journal_head,
            sector: 1,
            entry: 0,
            increment_applied: false,
        };

        while point.is_before(&self.tail_recovery_point) {
            let increment = !point.increment_applied;
            let entry = self.entry_at(&point)?;

            // Validation covers both directions at once, so only the
            // increment half is checked.
            let pbn = if increment {
                self.validate_entry(&entry)?;
                entry.mapping.pbn
            } else {
                entry.unmapping.pbn
            };

            if pbn != ZERO_BLOCK {
                self.replay_one_delta(pbn, entry.operation, increment, &point)?;
            }

            if increment {
                point.increment_applied = true;
            } else {
                Self::increment_recovery_point(&mut point);
                point.increment_applied = false;
            }
        }

        tracing::info!(
            target: "loess::recovery",
            entries = self.entries_added_to_slab_journals,
            "replayed journal entries into slab journals"
        );
        Ok(Phase::FlushingBlockMap)
    }

    fn replay_one_delta(
        &mut self,
        pbn: Pbn,
        operation: JournalOperation,
        increment: bool,
        point: &RecoveryPoint,
    ) -> Result<()> {
        let journal_point = Self::expanded_journal_point(point, increment);
        let device = self.ctx.device;
        let Some(state) = self.ctx.depot.slab_for_pbn_mut(pbn) else {
            // Not in any slab's region; validated entries only get
            // here for metadata PBNs outside the data range.
            return Ok(());
        };
        if !state.slab.contains_data_block(pbn) {
            return Ok(());
        }

        let applied = loop {
            match state.attempt_replay(device, pbn, operation, increment, journal_point)? {
                ReplayAttempt::Applied => break true,
                ReplayAttempt::Skipped => break false,
                ReplayAttempt::Full => {
                    // Back-pressure: this slab's ring has no room for
                    // another block. Drain it — committing the tail
                    // and persisting counters releases the journal
                    // locks — then resume from the same point.
                    tracing::debug!(
                        target: "loess::recovery",
                        slab = state.slab.slab_number.0,
                        "slab journal full during replay, draining slab"
                    );
                    state.drain(device)?;
                    // Entries appended after this drain will need the
                    // final drain to scrub them too.
                    state.status = SlabStatus::RequiresScrubbing;
                }
            }
        };
        if applied {
            self.entries_added_to_slab_journals += 1;
        }
        Ok(())
    }

    // ── Phases: rebuild from the block map ──────────────────────────────────

    /// Account for every interior tree page of the block map.
    fn rebuild_from_tree(&mut self) -> Result<Phase> {
        for state in self.ctx.depot.iter_mut() {
            state.ref_counts.reset();
            state.status = SlabStatus::Rebuilt;
        }

        // The replayed pages must be durable before the cache is
        // repopulated by the leaf walk.
        self.ctx.page_cache.flush()?;
        self.ctx.page_cache.invalidate()?;

        let depot = &mut *self.ctx.depot;
        let mut block_map_data_blocks = 0_u64;
        self.ctx.block_map.visit_tree_pages(&mut |pbn| {
            if pbn == ZERO_BLOCK || !depot.is_physical_data_block(pbn) {
                return Err(LoessError::BadMapping { pbn: pbn.0 });
            }
            let state = depot
                .slab_for_pbn_mut(pbn)
                .unwrap_or_else(|| unreachable!("data block belongs to a slab"));
            state
                .ref_counts
                .adjust_for_rebuild(pbn, JournalOperation::BlockMapRemapping)?;
            block_map_data_blocks += 1;
            Ok(())
        })?;
        self.block_map_data_blocks = block_map_data_blocks;
        Ok(Phase::RebuildingLeaves)
    }

    /// Derive every data reference from the leaf pages.
    fn rebuild_from_leaves(&mut self) -> Result<Phase> {
        self.logical_blocks_used = 0;

        let leaf_pages = self.ctx.block_map.leaf_page_count();
        if leaf_pages == 0 {
            return Ok(Phase::FlushingBlockMap);
        }

        // The last leaf page may cover only part of the logical space;
        // anything past it is out of bounds.
        let mut last_slot = (self.ctx.block_map.entry_count()
            % u64::from(BLOCK_MAP_ENTRIES_PER_PAGE)) as u16;
        if last_slot == 0 {
            last_slot = BLOCK_MAP_ENTRIES_PER_PAGE;
        }
        let last_leaf_pbn = self.ctx.block_map.leaf_page_pbn(leaf_pages - 1);

        for index in 0..leaf_pages {
            let pbn = self.ctx.block_map.leaf_page_pbn(index);
            if pbn == ZERO_BLOCK {
                // This part of the logical space was never written.
                continue;
            }
            if !self.ctx.depot.is_physical_data_block(pbn) {
                return Err(LoessError::BadMapping { pbn: pbn.0 });
            }

            let lease = self.ctx.page_cache.acquire(pbn)?;
            let result = self.rebuild_counts_from_page(&lease, pbn, pbn == last_leaf_pbn, last_slot);
            self.ctx.page_cache.release(lease);
            result?;
        }

        Ok(Phase::FlushingBlockMap)
    }

    fn rebuild_counts_from_page(
        &mut self,
        lease: &loess_block_map::PageLease,
        page_pbn: Pbn,
        is_last_page: bool,
        last_slot: u16,
    ) -> Result<()> {
        let mut page = self.ctx.page_cache.page(lease)?;
        if !page.is_initialized() {
            return Ok(());
        }

        let limit = if is_last_page {
            last_slot
        } else {
            BLOCK_MAP_ENTRIES_PER_PAGE
        };

        let mut modified = false;
        // Remove any bogus entries which exist beyond the end of the
        // logical space.
        for slot in limit..BLOCK_MAP_ENTRIES_PER_PAGE {
            if page.entry(slot)?.unpack().is_mapped() {
                Self::unmap_slot(&mut page, slot, &mut modified)?;
            }
        }

        for slot in 0..limit {
            if self.rebuild_one_slot(&mut page, page_pbn, slot, &mut modified)? {
                self.logical_blocks_used += 1;
            }
        }

        if modified {
            self.ctx.page_cache.update(lease, &page)?;
            self.ctx.page_cache.request_write(lease)?;
        }
        Ok(())
    }

    /// Account for one leaf slot. Invalid or nonsensical mappings are
    /// unmapped in place rather than failing the rebuild. Returns
    /// whether the slot holds a live logical mapping.
    fn rebuild_one_slot(
        &mut self,
        page: &mut BlockMapPage,
        page_pbn: Pbn,
        slot: u16,
        modified: &mut bool,
    ) -> Result<bool> {
        let mapping = page.entry(slot)?.unpack();

        if !mapping.is_valid() {
            Self::unmap_slot(page, slot, modified)?;
            return Ok(false);
        }
        if !mapping.is_mapped() {
            return Ok(false);
        }
        if mapping.pbn == ZERO_BLOCK {
            // Mapped to the zero block: a logical block of zeroes,
            // holding no physical reference.
            return Ok(true);
        }
        if !self.ctx.depot.is_physical_data_block(mapping.pbn) {
            // A nonsense mapping; remove it so the map is at least
            // consistent.
            Self::unmap_slot(page, slot, modified)?;
            return Ok(false);
        }

        let state = self
            .ctx
            .depot
            .slab_for_pbn_mut(mapping.pbn)
            .unwrap_or_else(|| unreachable!("data block belongs to a slab"));
        match state
            .ref_counts
            .adjust_for_rebuild(mapping.pbn, JournalOperation::DataRemapping)
        {
            Ok(()) => Ok(true),
            Err(err) => {
                tracing::error!(
                    target: "loess::recovery",
                    page = page_pbn.0,
                    slot,
                    pbn = mapping.pbn.0,
                    %err,
                    "could not adjust reference count for mapped block"
                );
                Self::unmap_slot(page, slot, modified)?;
                Ok(false)
            }
        }
    }

    fn unmap_slot(page: &mut BlockMapPage, slot: u16, modified: &mut bool) -> Result<()> {
        page.set_entry(slot, BlockMapEntry::UNMAPPED)?;
        *modified = true;
        Ok(())
    }

    // ── Phases: convergence ─────────────────────────────────────────────────

    fn flush_block_map(&mut self) -> Result<Phase> {
        tracing::info!(target: "loess::recovery", "flushing block map changes");
        self.ctx.page_cache.flush()?;
        Ok(Phase::DrainingSlabs)
    }

    fn drain_slabs(&mut self) -> Result<Phase> {
        tracing::info!(target: "loess::recovery", "saving recovered state");
        if self.mode == RecoveryMode::Rebuild {
            // Every reference block must be rewritten, including the
            // ones the rebuild left all-free.
            for state in self.ctx.depot.iter_mut() {
                state.ref_counts.dirty_all_blocks();
            }
        }
        self.ctx.depot.drain(self.ctx.device)?;
        Ok(Phase::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(sequence: u64, sector: u8, entry: u16) -> RecoveryPoint {
        RecoveryPoint {
            sequence_number: SequenceNumber(sequence),
            sector,
            entry,
            increment_applied: false,
        }
    }

    #[test]
    fn recovery_point_steps_through_sectors_and_blocks() {
        let mut current = point(3, 1, 0);
        RecoveryCoordinator::increment_recovery_point(&mut current);
        assert_eq!(current, point(3, 1, 1));

        // End of a sector rolls into the next sector.
        let mut current = point(3, 1, ENTRIES_PER_SECTOR - 1);
        RecoveryCoordinator::increment_recovery_point(&mut current);
        assert_eq!(current, point(3, 2, 0));

        // End of the last sector rolls into the next block, whose
        // entries start in sector 1.
        let mut current = point(3, 7, ENTRIES_PER_SECTOR - 1);
        RecoveryCoordinator::increment_recovery_point(&mut current);
        assert_eq!(current, point(4, 1, 0));
    }

    #[test]
    fn expanded_points_order_increments_before_decrements() {
        let base = point(5, 2, 7);
        let increment = RecoveryCoordinator::expanded_journal_point(&base, true);
        let decrement = RecoveryCoordinator::expanded_journal_point(&base, false);
        assert!(increment.is_before(&decrement));
        assert_eq!(increment.sequence_number, SequenceNumber(5));
        assert_eq!(increment.entry_count, (ENTRIES_PER_SECTOR + 7) * 2);
        assert_eq!(decrement.entry_count, increment.entry_count + 1);

        // The next entry's increment follows this entry's decrement.
        let next = point(5, 2, 8);
        let next_increment = RecoveryCoordinator::expanded_journal_point(&next, true);
        assert!(decrement.is_before(&next_increment));
    }
}
