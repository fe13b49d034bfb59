#![forbid(unsafe_code)]
//! Slabs: fixed-size regions of physical space, each with its own
//! reference-count table and journal.
//!
//! The depot is the directory over all slabs — lookup by physical
//! block number, enumeration, and the drain choreography that commits
//! slab-journal tails and persists reference blocks. Space accounting
//! inside one slab lives in [`ref_counts::ReferenceCounters`]; the
//! per-slab delta log lives in [`journal::SlabJournal`].

pub mod journal;
pub mod ref_counts;

pub use journal::{ReplayAttempt, SlabJournal, SlabJournalConfig, SlabJournalEntry};
pub use ref_counts::{AdjustResult, ReferenceCounters, ReferenceStatus, ReferenceUpdater};

use loess_block::{BlockDevice, ReadOnlyLatch};
use loess_error::{LoessError, Result};
use loess_types::{
    COUNTS_PER_BLOCK, JournalOperation, JournalPoint, Pbn, SlabBlockNumber, SlabNumber, ZERO_BLOCK,
};

// ── Physical-zone locks ─────────────────────────────────────────────────────

/// A lock placed on one physical block by in-flight I/O.
///
/// The lock table itself belongs to the front end's physical zones;
/// reference adjustments only need to transfer provisional holds in
/// and out of a lock the caller already found.
#[derive(Debug, Default)]
pub struct PbnLock {
    has_provisional_reference: bool,
}

impl PbnLock {
    #[must_use]
    pub fn has_provisional_reference(&self) -> bool {
        self.has_provisional_reference
    }

    pub fn assign_provisional_reference(&mut self) {
        self.has_provisional_reference = true;
    }

    pub fn unassign_provisional_reference(&mut self) {
        self.has_provisional_reference = false;
    }
}

// ── Slab geometry ───────────────────────────────────────────────────────────

/// Shape shared by every slab in a depot: data blocks first, then the
/// packed reference-count blocks, then the slab journal ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    pub data_blocks: u32,
    pub reference_count_blocks: u32,
    pub slab_journal_blocks: u32,
}

impl SlabConfig {
    pub fn new(data_blocks: u32, slab_journal_blocks: u32) -> Result<Self> {
        if data_blocks == 0 {
            return Err(LoessError::Format("slab needs data blocks".to_owned()));
        }
        if slab_journal_blocks < 2 {
            return Err(LoessError::Format(
                "slab journal ring needs at least two blocks".to_owned(),
            ));
        }
        Ok(Self {
            data_blocks,
            reference_count_blocks: data_blocks.div_ceil(COUNTS_PER_BLOCK as u32),
            slab_journal_blocks,
        })
    }

    /// Total blocks one slab occupies.
    #[must_use]
    pub fn slab_blocks(&self) -> u64 {
        u64::from(self.data_blocks)
            + u64::from(self.reference_count_blocks)
            + u64::from(self.slab_journal_blocks)
    }
}

/// One slab's placement within the physical space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slab {
    pub slab_number: SlabNumber,
    /// First data block.
    pub start: Pbn,
    /// One past the last data block.
    pub end: Pbn,
    /// First packed reference-count block.
    pub ref_counts_origin: Pbn,
    /// First slab journal block.
    pub journal_origin: Pbn,
}

impl Slab {
    /// Convert an absolute data-block PBN into this slab's offset.
    pub fn slab_block_number(&self, pbn: Pbn) -> Result<SlabBlockNumber> {
        if pbn < self.start || pbn >= self.end {
            return Err(LoessError::Format(format!(
                "PBN {pbn} is not a data block of slab {}",
                self.slab_number
            )));
        }
        Ok(SlabBlockNumber((pbn.0 - self.start.0) as u32))
    }

    /// Whether `pbn` is one of this slab's data blocks.
    #[must_use]
    pub fn contains_data_block(&self, pbn: Pbn) -> bool {
        pbn >= self.start && pbn < self.end
    }
}

/// Recovery-relevant lifecycle of one slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabStatus {
    /// Counters are accurate in memory; saving them suffices.
    Rebuilt,
    /// Counters must be derived by replaying the slab journal.
    RequiresScrubbing,
}

/// One slab with its live state: placement, counters, journal.
#[derive(Debug)]
pub struct SlabState {
    pub slab: Slab,
    pub ref_counts: ReferenceCounters,
    pub journal: SlabJournal,
    pub status: SlabStatus,
}

impl SlabState {
    /// Adjust a reference during normal operation, applying the
    /// per-entry journal-lock handoff to this slab's journal.
    pub fn adjust_reference(
        &mut self,
        pbn: Pbn,
        updater: ReferenceUpdater<'_>,
        slab_journal_point: JournalPoint,
    ) -> Result<bool> {
        let result = self.ref_counts.adjust(pbn, updater, slab_journal_point)?;
        if let Some(sequence) = result.release_journal_lock {
            self.journal.release_block_reference(sequence, 1);
        }
        Ok(result.free_status_changed)
    }

    /// Replay one recovery-journal delta into this slab's journal.
    pub fn attempt_replay(
        &mut self,
        device: &dyn BlockDevice,
        pbn: Pbn,
        operation: JournalOperation,
        increment: bool,
        recovery_point: JournalPoint,
    ) -> Result<ReplayAttempt> {
        let sbn = self.slab.slab_block_number(pbn)?;
        self.journal.attempt_replay(
            device,
            SlabJournalEntry {
                sbn,
                operation,
                increment,
            },
            recovery_point,
        )
    }

    /// Persist dirty reference blocks, releasing the slab-journal
    /// locks the completed writes held.
    pub fn save_dirty_references(
        &mut self,
        device: &dyn BlockDevice,
        divisor: usize,
    ) -> Result<()> {
        let released = self.ref_counts.save_dirty(device, divisor)?;
        for sequence in released {
            self.journal.release_block_reference(sequence, 1);
        }
        Ok(())
    }

    /// Persist every dirty reference block.
    pub fn save_all_references(&mut self, device: &dyn BlockDevice) -> Result<()> {
        let released = self.ref_counts.save_all(device)?;
        for sequence in released {
            self.journal.release_block_reference(sequence, 1);
        }
        Ok(())
    }

    /// Derive this slab's counters from its committed journal and
    /// persist them (the scrub-then-save drain).
    pub fn scrub(&mut self, device: &dyn BlockDevice) -> Result<usize> {
        let applied = self.journal.apply_to_counters(device, &mut self.ref_counts)?;
        self.status = SlabStatus::Rebuilt;
        Ok(applied)
    }

    /// Flush everything this slab holds in memory: the open journal
    /// tail, a scrub if the counters are behind the journal, and all
    /// dirty reference blocks.
    pub fn drain(&mut self, device: &dyn BlockDevice) -> Result<()> {
        self.journal.commit_tail(device)?;
        let scrubbed = self.status == SlabStatus::RequiresScrubbing;
        if scrubbed {
            self.scrub(device)?;
        }
        self.save_all_references(device)?;
        if scrubbed {
            // The scrub derived and persisted every journaled delta,
            // so any per-entry locks still held are moot.
            self.journal.release_all_locks();
        }
        Ok(())
    }
}

// ── Depot ───────────────────────────────────────────────────────────────────

/// Layout of the whole slab depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabDepotConfig {
    /// First block of the first slab.
    pub first_block: Pbn,
    pub slab_count: u32,
    pub slab: SlabConfig,
    pub nonce: u64,
}

/// The directory of all slabs: lookup by PBN, enumeration, and the
/// drain choreography used at the end of recovery.
#[derive(Debug)]
pub struct SlabDepot {
    config: SlabDepotConfig,
    slabs: Vec<SlabState>,
    latch: ReadOnlyLatch,
}

impl SlabDepot {
    /// Lay out and create `slab_count` fresh slabs.
    pub fn new(config: SlabDepotConfig, latch: ReadOnlyLatch) -> Result<Self> {
        if config.slab_count == 0 {
            return Err(LoessError::Format("depot needs at least one slab".to_owned()));
        }
        if config.first_block == ZERO_BLOCK {
            return Err(LoessError::Format(
                "slabs may not start at the zero block".to_owned(),
            ));
        }

        let slab_blocks = config.slab.slab_blocks();
        let mut slabs = Vec::with_capacity(config.slab_count as usize);
        for index in 0..config.slab_count {
            let slab_number = SlabNumber(index);
            let origin = Pbn(config.first_block.0 + u64::from(index) * slab_blocks);
            let start = origin;
            let end = Pbn(start.0 + u64::from(config.slab.data_blocks));
            let ref_counts_origin = end;
            let journal_origin =
                Pbn(ref_counts_origin.0 + u64::from(config.slab.reference_count_blocks));
            let slab = Slab {
                slab_number,
                start,
                end,
                ref_counts_origin,
                journal_origin,
            };

            slabs.push(SlabState {
                slab,
                ref_counts: ReferenceCounters::new(
                    slab_number,
                    start,
                    config.slab.data_blocks,
                    ref_counts_origin,
                    latch.clone(),
                ),
                journal: SlabJournal::new(
                    slab_number,
                    SlabJournalConfig {
                        origin: journal_origin,
                        size: u64::from(config.slab.slab_journal_blocks),
                        nonce: config.nonce,
                    },
                )?,
                status: SlabStatus::Rebuilt,
            });
        }

        Ok(Self {
            config,
            slabs,
            latch,
        })
    }

    #[must_use]
    pub fn config(&self) -> SlabDepotConfig {
        self.config
    }

    #[must_use]
    pub fn latch(&self) -> &ReadOnlyLatch {
        &self.latch
    }

    #[must_use]
    pub fn slab_count(&self) -> u32 {
        self.config.slab_count
    }

    /// One past the last block of the last slab.
    #[must_use]
    pub fn last_block(&self) -> Pbn {
        Pbn(self.config.first_block.0
            + u64::from(self.config.slab_count) * self.config.slab.slab_blocks())
    }

    fn slab_index_for(&self, pbn: Pbn) -> Option<usize> {
        let offset = pbn.checked_sub(self.config.first_block.0)?;
        let index = offset.0 / self.config.slab.slab_blocks();
        if index >= u64::from(self.config.slab_count) {
            return None;
        }
        Some(index as usize)
    }

    /// The slab whose region contains `pbn`, if any.
    #[must_use]
    pub fn slab_for_pbn(&self, pbn: Pbn) -> Option<&SlabState> {
        self.slab_index_for(pbn).map(|index| &self.slabs[index])
    }

    /// Mutable access to the slab whose region contains `pbn`.
    #[must_use]
    pub fn slab_for_pbn_mut(&mut self, pbn: Pbn) -> Option<&mut SlabState> {
        self.slab_index_for(pbn).map(move |index| &mut self.slabs[index])
    }

    #[must_use]
    pub fn slab(&self, slab_number: SlabNumber) -> Option<&SlabState> {
        self.slabs.get(slab_number.0 as usize)
    }

    #[must_use]
    pub fn slab_mut(&mut self, slab_number: SlabNumber) -> Option<&mut SlabState> {
        self.slabs.get_mut(slab_number.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlabState> {
        self.slabs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SlabState> {
        self.slabs.iter_mut()
    }

    /// Whether `pbn` may carry data references: the zero block always
    /// qualifies (it is the "no data" mapping target), as does any
    /// slab data block.
    #[must_use]
    pub fn is_physical_data_block(&self, pbn: Pbn) -> bool {
        if pbn == ZERO_BLOCK {
            return true;
        }
        self.slab_for_pbn(pbn)
            .is_some_and(|state| state.slab.contains_data_block(pbn))
    }

    /// Total data blocks with a nonzero counter, across all slabs.
    #[must_use]
    pub fn allocated_blocks(&self) -> u64 {
        self.slabs
            .iter()
            .map(|state| {
                u64::from(state.ref_counts.block_count() - state.ref_counts.free_block_count())
            })
            .sum()
    }

    /// Mark every slab as needing its counters derived from its
    /// journal (used when entering recovery).
    pub fn mark_all_unrecovered(&mut self) {
        for state in &mut self.slabs {
            state.status = SlabStatus::RequiresScrubbing;
        }
    }

    /// Drain every slab: commit journal tails, scrub where required,
    /// persist all reference blocks, then sync the device once.
    pub fn drain(&mut self, device: &dyn BlockDevice) -> Result<()> {
        for state in &mut self.slabs {
            state.drain(device)?;
        }
        device.sync()?;
        tracing::info!(
            target: "loess::slab",
            slabs = self.slabs.len(),
            "drained slab depot"
        );
        Ok(())
    }

    /// Load every slab's reference counters from the device.
    pub fn load_all_ref_counts(&mut self, device: &dyn BlockDevice) -> Result<()> {
        for state in &mut self.slabs {
            state.ref_counts.load(device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loess_types::SequenceNumber;

    fn depot_config() -> SlabDepotConfig {
        SlabDepotConfig {
            first_block: Pbn(16),
            slab_count: 3,
            slab: SlabConfig::new(64, 4).expect("slab config"),
            nonce: 0xD0_70,
        }
    }

    #[test]
    fn slab_config_geometry() {
        let config = SlabConfig::new(64, 4).expect("config");
        assert_eq!(config.reference_count_blocks, 1);
        assert_eq!(config.slab_blocks(), 64 + 1 + 4);

        // A slab bigger than one reference block of counters.
        let big = SlabConfig::new(COUNTS_PER_BLOCK as u32 + 1, 4).expect("config");
        assert_eq!(big.reference_count_blocks, 2);

        assert!(SlabConfig::new(0, 4).is_err());
        assert!(SlabConfig::new(64, 1).is_err());
    }

    #[test]
    fn depot_layout_and_lookup() {
        let depot = SlabDepot::new(depot_config(), ReadOnlyLatch::new()).expect("depot");
        assert_eq!(depot.slab_count(), 3);
        assert_eq!(depot.last_block(), Pbn(16 + 3 * 69));

        let first = depot.slab(SlabNumber(0)).expect("slab 0").slab;
        assert_eq!(first.start, Pbn(16));
        assert_eq!(first.end, Pbn(80));
        assert_eq!(first.ref_counts_origin, Pbn(80));
        assert_eq!(first.journal_origin, Pbn(81));

        let second = depot.slab(SlabNumber(1)).expect("slab 1").slab;
        assert_eq!(second.start, Pbn(85));

        // Data-block membership: slab metadata blocks do not qualify.
        assert!(depot.is_physical_data_block(ZERO_BLOCK));
        assert!(depot.is_physical_data_block(Pbn(16)));
        assert!(depot.is_physical_data_block(Pbn(79)));
        assert!(!depot.is_physical_data_block(Pbn(80)), "refcount block");
        assert!(!depot.is_physical_data_block(Pbn(84)), "journal block");
        assert!(depot.is_physical_data_block(Pbn(85)), "next slab's data");
        assert!(!depot.is_physical_data_block(Pbn(15)), "before the depot");
        assert!(!depot.is_physical_data_block(depot.last_block()));
    }

    #[test]
    fn slab_block_number_conversion() {
        let depot = SlabDepot::new(depot_config(), ReadOnlyLatch::new()).expect("depot");
        let slab = depot.slab(SlabNumber(1)).expect("slab").slab;

        assert_eq!(
            slab.slab_block_number(Pbn(85)).expect("first"),
            SlabBlockNumber(0)
        );
        assert_eq!(
            slab.slab_block_number(Pbn(148)).expect("last"),
            SlabBlockNumber(63)
        );
        assert!(slab.slab_block_number(Pbn(149)).is_err());
        assert!(slab.slab_block_number(Pbn(84)).is_err());
    }

    #[test]
    fn adjust_reference_releases_journal_locks() {
        let mut depot = SlabDepot::new(depot_config(), ReadOnlyLatch::new()).expect("depot");
        let device = loess_block::ByteBlockDevice::new(
            loess_block::RamByteDevice::new(4096 * 256),
            4096,
        )
        .expect("device");

        let state = depot.slab_mut(SlabNumber(0)).expect("slab");
        // Journal two entries in block 1, driving the matching
        // reference updates.
        for entry in 0..2_u16 {
            let point = JournalPoint::new(SequenceNumber(1), entry);
            state
                .attempt_replay(&device, Pbn(16 + u64::from(entry)), JournalOperation::DataRemapping, true, point)
                .expect("journal entry");
            state
                .adjust_reference(
                    Pbn(16 + u64::from(entry)),
                    ReferenceUpdater {
                        operation: JournalOperation::DataRemapping,
                        increment: true,
                        lock: None,
                    },
                    point,
                )
                .expect("adjust");
        }

        // Entry 0 dirtied the block and kept its lock as the floor;
        // entry 1's per-entry lock was released on the spot.
        assert_eq!(state.journal.lock_count(SequenceNumber(1)), 1);

        // Writing the reference block releases the floor lock too.
        state.save_all_references(&device).expect("save");
        assert_eq!(state.journal.lock_count(SequenceNumber(1)), 0);
    }

    #[test]
    fn drain_commits_scrubs_and_saves() {
        let mut depot = SlabDepot::new(depot_config(), ReadOnlyLatch::new()).expect("depot");
        let device = loess_block::ByteBlockDevice::new(
            loess_block::RamByteDevice::new(4096 * 256),
            4096,
        )
        .expect("device");
        depot.mark_all_unrecovered();

        {
            let state = depot.slab_mut(SlabNumber(2)).expect("slab");
            let point = JournalPoint::new(SequenceNumber(1), 0);
            state
                .attempt_replay(&device, Pbn(154), JournalOperation::DataRemapping, true, point)
                .expect("journal entry");
        }

        depot.drain(&device).expect("drain");

        // The scrub derived the counter from the journal; reloading
        // from the device sees the persisted value.
        let state = depot.slab_mut(SlabNumber(2)).expect("slab");
        assert_eq!(state.status, SlabStatus::Rebuilt);
        assert_eq!(state.ref_counts.count_for(0).expect("count"), 1);

        let mut reloaded = ReferenceCounters::new(
            SlabNumber(2),
            state.slab.start,
            64,
            state.slab.ref_counts_origin,
            ReadOnlyLatch::new(),
        );
        reloaded.load(&device).expect("load");
        assert_eq!(reloaded.count_for(0).expect("count"), 1);
        assert_eq!(reloaded.free_block_count(), 63);
    }
}
