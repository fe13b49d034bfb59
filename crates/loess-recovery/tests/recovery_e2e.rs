//! End-to-end recovery scenarios on an in-memory device.
//!
//! Each test lays out a little store — recovery journal region, block
//! map leaf pages, and a two-slab depot — crashes it in a specific
//! way, and drives [`loess_recovery::repair`] over the pieces.

use loess_block::{BlockDevice, ByteBlockDevice, RamByteDevice, ReadOnlyLatch};
use loess_block_map::{BlockMapPage, DevicePageCache, FlatBlockMap};
use loess_journal::{
    BLOCK_HEADER_SIZE, ENTRIES_PER_BLOCK, JournalEntry, LEGACY_ENTRY_SIZE, MetadataType,
    RecoveryBlockHeader, RecoveryJournalConfig, compute_check_byte, pack_journal_block,
    pack_legacy_entry,
};
use loess_recovery::{LoadState, RecoveryContext, RecoverySummary, RecoveryMode, repair};
use loess_slab::{ReferenceCounters, SlabConfig, SlabDepot, SlabDepotConfig};
use loess_types::{
    BLOCK_SIZE, BlockMapSlot, DataLocation, JournalOperation, MappingState, Pbn, SECTOR_SIZE,
    SequenceNumber, SlabNumber, ZERO_BLOCK,
};

const NONCE: u64 = 0x10E5_5000_0000_0001;
const JOURNAL_ORIGIN: Pbn = Pbn(8);
const JOURNAL_SIZE: u64 = 8;
const DEPOT_FIRST: Pbn = Pbn(16);

type TestDevice = ByteBlockDevice<RamByteDevice>;

fn test_device() -> TestDevice {
    ByteBlockDevice::new(RamByteDevice::new(BLOCK_SIZE * 256), BLOCK_SIZE as u32).expect("device")
}

fn journal_config() -> RecoveryJournalConfig {
    RecoveryJournalConfig::new(JOURNAL_ORIGIN, JOURNAL_SIZE, NONCE, 0).expect("journal config")
}

fn test_depot() -> SlabDepot {
    SlabDepot::new(
        SlabDepotConfig {
            first_block: DEPOT_FIRST,
            slab_count: 2,
            slab: SlabConfig::new(64, 4).expect("slab config"),
            nonce: NONCE,
        },
        ReadOnlyLatch::new(),
    )
    .expect("depot")
}

fn seed_leaf_page(device: &TestDevice, pbn: Pbn) {
    let page = BlockMapPage::new_formatted(NONCE, pbn, true);
    device.write_block(pbn, page.as_bytes()).expect("seed leaf page");
}

fn header(sequence: u64, entry_count: u16) -> RecoveryBlockHeader {
    RecoveryBlockHeader {
        block_map_head: SequenceNumber(1),
        slab_journal_head: SequenceNumber(1),
        sequence_number: SequenceNumber(sequence),
        nonce: NONCE,
        logical_blocks_used: 0,
        block_map_data_blocks: 0,
        entry_count,
        check_byte: compute_check_byte(SequenceNumber(sequence)),
        recovery_count: 0,
        metadata_type: MetadataType::RecoveryJournal2.as_u8(),
    }
}

fn remap(leaf: u64, slot: u16, old: Option<u64>, new: Option<u64>) -> JournalEntry {
    let location = |pbn: Option<u64>| match pbn {
        Some(pbn) => DataLocation {
            pbn: Pbn(pbn),
            state: MappingState::UNCOMPRESSED,
        },
        None => DataLocation::UNMAPPED,
    };
    JournalEntry {
        slot: BlockMapSlot {
            pbn: Pbn(leaf),
            slot,
        },
        mapping: location(new),
        unmapping: location(old),
        operation: JournalOperation::DataRemapping,
    }
}

fn write_journal_block(
    device: &TestDevice,
    config: &RecoveryJournalConfig,
    header: &RecoveryBlockHeader,
    entries: &[JournalEntry],
) {
    let block = pack_journal_block(header, entries).expect("pack journal block");
    device
        .write_block(config.block_pbn(header.sequence_number), &block)
        .expect("write journal block");
}

fn run_repair(
    device: &TestDevice,
    depot: &mut SlabDepot,
    block_map: &FlatBlockMap,
    load_state: LoadState,
) -> loess_error::Result<RecoverySummary> {
    let cache = DevicePageCache::new(device).expect("page cache");
    repair(
        RecoveryContext {
            device,
            journal: journal_config(),
            page_cache: &cache,
            block_map,
            depot,
            page_window: 4,
        },
        load_state,
    )
}

fn leaf_slot(device: &TestDevice, leaf: u64, slot: u16) -> DataLocation {
    let bytes = device.read_block(Pbn(leaf)).expect("read leaf").into_inner();
    BlockMapPage::from_bytes(bytes)
        .expect("page")
        .entry(slot)
        .expect("slot")
        .unpack()
}

fn count_for(depot: &SlabDepot, pbn: Pbn) -> u8 {
    let state = depot.slab_for_pbn(pbn).expect("slab for pbn");
    let sbn = state.slab.slab_block_number(pbn).expect("sbn");
    state.ref_counts.count_for(sbn.0).expect("count")
}

#[test]
fn small_recovery_replays_increment_then_decrement() {
    let device = test_device();
    let leaf = 2_u64;
    seed_leaf_page(&device, Pbn(leaf));

    // One journal block: map slot 3 to data block 20, then unmap it.
    let config = journal_config();
    let entries = vec![
        remap(leaf, 3, None, Some(20)),
        remap(leaf, 3, Some(20), None),
    ];
    write_journal_block(&device, &config, &header(1, 2), &entries);

    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, vec![Pbn(leaf)], Vec::new());
    let summary =
        run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("repair");

    assert_eq!(summary.mode, RecoveryMode::Replay);
    assert_eq!(summary.entries_replayed_into_block_map, 2);
    assert_eq!(summary.logical_blocks_used, 0);
    assert_eq!(count_for(&depot, Pbn(20)), 0, "increment then decrement nets out");
    assert_eq!(
        leaf_slot(&device, leaf, 3),
        DataLocation::UNMAPPED,
        "the later unmapping wins"
    );
}

#[test]
fn same_slot_remaps_apply_in_journal_order() {
    let device = test_device();
    let leaf = 2_u64;
    seed_leaf_page(&device, Pbn(leaf));

    // Slot 5 maps to block 20, then is remapped to block 21: the
    // later entry must be the surviving mapping even though the heap
    // consumes by slot order.
    let config = journal_config();
    let entries = vec![
        remap(leaf, 5, None, Some(20)),
        remap(leaf, 9, None, Some(22)),
        remap(leaf, 5, Some(20), Some(21)),
    ];
    write_journal_block(&device, &config, &header(1, 3), &entries);

    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, vec![Pbn(leaf)], Vec::new());
    let summary =
        run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("repair");

    assert_eq!(summary.entries_replayed_into_block_map, 3);
    assert_eq!(leaf_slot(&device, leaf, 5).pbn, Pbn(21));
    assert_eq!(leaf_slot(&device, leaf, 9).pbn, Pbn(22));
    assert_eq!(count_for(&depot, Pbn(20)), 0, "old mapping released");
    assert_eq!(count_for(&depot, Pbn(21)), 1);
    assert_eq!(count_for(&depot, Pbn(22)), 1);
    assert_eq!(summary.logical_blocks_used, 2);
}

#[test]
fn shared_references_accumulate_across_slots() {
    let device = test_device();
    let leaf = 2_u64;
    seed_leaf_page(&device, Pbn(leaf));

    // Three logical slots deduplicate onto data block 30, one onto 31
    // in the second slab.
    let config = journal_config();
    let entries = vec![
        remap(leaf, 0, None, Some(30)),
        remap(leaf, 1, None, Some(30)),
        remap(leaf, 2, None, Some(30)),
        remap(leaf, 3, None, Some(85)),
    ];
    write_journal_block(&device, &config, &header(1, 4), &entries);

    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, vec![Pbn(leaf)], Vec::new());
    let summary =
        run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("repair");

    assert_eq!(count_for(&depot, Pbn(30)), 3, "dedupe raises the shared count");
    assert_eq!(count_for(&depot, Pbn(85)), 1, "slabs advance independently");
    assert_eq!(summary.logical_blocks_used, 4);
    assert_eq!(summary.entries_added_to_slab_journals, 4);
}

#[test]
fn torn_sector_truncates_the_usable_journal() {
    let device = test_device();
    let leaf = 2_u64;
    seed_leaf_page(&device, Pbn(leaf));
    let config = journal_config();

    // Block 1: completely full and valid.
    let full_entries: Vec<JournalEntry> = (0..u64::from(ENTRIES_PER_BLOCK))
        .map(|i| remap(leaf, (i % 812) as u16, None, Some(16 + (i % 64))))
        .collect();
    write_journal_block(&device, &config, &header(1, ENTRIES_PER_BLOCK), &full_entries);

    // Block 2: claims to be full, but sector 3 carries a stale stamp —
    // the write tore. Only sectors 1 and 2 (62 entries) are usable.
    let torn_entries: Vec<JournalEntry> = (0..u64::from(ENTRIES_PER_BLOCK))
        .map(|i| remap(leaf, ((i + 300) % 812) as u16, None, Some(16 + (i % 64))))
        .collect();
    let torn_header = header(2, ENTRIES_PER_BLOCK);
    let mut block = pack_journal_block(&torn_header, &torn_entries).expect("pack");
    block[3 * SECTOR_SIZE] ^= 0xFF; // corrupt sector 3's check byte
    device
        .write_block(config.block_pbn(SequenceNumber(2)), &block)
        .expect("write torn block");

    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, vec![Pbn(leaf)], Vec::new());
    let summary =
        run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("repair");

    assert_eq!(summary.tail, 2, "the torn block is the usable tail");
    assert_eq!(summary.highest_tail, 2);
    assert_eq!(
        summary.entries_replayed_into_block_map,
        usize::from(ENTRIES_PER_BLOCK) + 62,
        "entries past the torn sector are not replayed"
    );
}

#[test]
fn replay_is_idempotent_across_a_restart() {
    let device = test_device();
    let leaf = 2_u64;
    seed_leaf_page(&device, Pbn(leaf));

    let config = journal_config();
    let entries = vec![
        remap(leaf, 0, None, Some(20)),
        remap(leaf, 1, None, Some(20)),
        remap(leaf, 2, None, Some(21)),
        remap(leaf, 1, Some(20), None),
    ];
    write_journal_block(&device, &config, &header(1, 4), &entries);

    let block_map = FlatBlockMap::new(812, vec![Pbn(leaf)], Vec::new());

    // First recovery: crash happened, replay runs and persists.
    let mut depot = test_depot();
    let first =
        run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("first repair");
    assert_eq!(count_for(&depot, Pbn(20)), 1);
    assert_eq!(count_for(&depot, Pbn(21)), 1);

    // Second crash before the superblock recorded the recovery: a
    // fresh depot loads the already-recovered counters and the same
    // journal replays again. The per-sector commit points must keep
    // every delta from double-applying.
    let mut depot = test_depot();
    depot
        .load_all_ref_counts(&device)
        .expect("load recovered counters");
    assert_eq!(count_for(&depot, Pbn(20)), 1, "counters were persisted");

    let second =
        run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("second repair");
    assert_eq!(count_for(&depot, Pbn(20)), 1, "no double application");
    assert_eq!(count_for(&depot, Pbn(21)), 1, "no double application");
    assert_eq!(first.logical_blocks_used, second.logical_blocks_used);

    let state = depot.slab_for_pbn(Pbn(20)).expect("slab");
    assert_eq!(state.ref_counts.free_block_count(), 62);
}

#[test]
fn empty_journal_recovers_to_a_clean_store() {
    let device = test_device();
    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, Vec::new(), Vec::new());

    let summary =
        run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("repair");
    assert_eq!(summary.mode, RecoveryMode::Replay);
    assert_eq!(summary.entries_replayed_into_block_map, 0);
    assert_eq!(summary.entries_added_to_slab_journals, 0);
    assert_eq!(depot.allocated_blocks(), 0);
}

#[test]
fn corrupt_entry_aborts_replay_and_latches_read_only() {
    let device = test_device();
    let leaf = 2_u64;
    seed_leaf_page(&device, Pbn(leaf));

    // The mapping PBN points into slab metadata, not a data block.
    let config = journal_config();
    let entries = vec![remap(leaf, 0, None, Some(80))];
    write_journal_block(&device, &config, &header(1, 1), &entries);

    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, vec![Pbn(leaf)], Vec::new());
    let err = run_repair(&device, &mut depot, &block_map, LoadState::Dirty)
        .expect_err("corrupt journal entry");
    assert!(matches!(err, loess_error::LoessError::CorruptJournal(_)));
    assert!(depot.latch().is_read_only(), "integrity failures latch read-only");
}

// ── Rebuild scenarios ───────────────────────────────────────────────────────

/// Write a legacy-format journal block by hand: the same sector
/// framing as the current format, but 11-byte increment-only entries.
fn write_legacy_journal_block(
    device: &TestDevice,
    config: &RecoveryJournalConfig,
    sequence: u64,
    block_map_head: u64,
    entries: &[[u8; LEGACY_ENTRY_SIZE]],
) {
    let header = RecoveryBlockHeader {
        block_map_head: SequenceNumber(block_map_head),
        slab_journal_head: SequenceNumber(block_map_head),
        sequence_number: SequenceNumber(sequence),
        nonce: NONCE,
        logical_blocks_used: 0,
        block_map_data_blocks: 0,
        entry_count: entries.len() as u16,
        check_byte: compute_check_byte(SequenceNumber(sequence)),
        recovery_count: 0,
        metadata_type: MetadataType::RecoveryJournal.as_u8(),
    };

    let mut block = vec![0_u8; BLOCK_SIZE];
    block[..BLOCK_HEADER_SIZE].copy_from_slice(&header.pack());
    // All entries fit one sector in these tests.
    let base = SECTOR_SIZE;
    block[base] = header.check_byte;
    block[base + 1] = header.recovery_count;
    block[base + 2] = entries.len() as u8;
    for (index, entry) in entries.iter().enumerate() {
        let at = base + 3 + index * LEGACY_ENTRY_SIZE;
        block[at..at + LEGACY_ENTRY_SIZE].copy_from_slice(entry);
    }
    device
        .write_block(config.block_pbn(SequenceNumber(sequence)), &block)
        .expect("write legacy journal block");
}

#[test]
fn legacy_journal_with_early_tail_falls_back_to_rebuild() {
    let device = test_device();
    let config = journal_config();

    // A leaf page inside slab 0's data region, holding two mappings:
    // slots 0 and 1 both reference data block 30 (a dedupe), and a
    // third slot maps the zero block.
    let leaf_pbn = Pbn(17);
    let mut leaf = BlockMapPage::new_formatted(NONCE, leaf_pbn, true);
    for (slot, target) in [(0_u16, 30_u64), (1, 30)] {
        leaf.set_entry(
            slot,
            loess_types::BlockMapEntry::pack(Pbn(target), MappingState::UNCOMPRESSED),
        )
        .expect("seed mapping");
    }
    leaf.set_entry(2, loess_types::BlockMapEntry::pack(ZERO_BLOCK, MappingState::UNCOMPRESSED))
        .expect("seed zero mapping");
    device.write_block(leaf_pbn, leaf.as_bytes()).expect("write leaf");

    // An interior tree page in slab 1's data region.
    let tree_pbn = Pbn(90);

    // The legacy journal's highest tail (2) is earlier than its
    // recorded block map head (5): replay is impossible.
    let legacy_entry = pack_legacy_entry(
        loess_journal::LegacyOperation::DataIncrement,
        BlockMapSlot {
            pbn: leaf_pbn,
            slot: 0,
        },
        DataLocation {
            pbn: Pbn(30),
            state: MappingState::UNCOMPRESSED,
        },
    );
    write_legacy_journal_block(&device, &config, 2, 5, &[legacy_entry]);

    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, vec![leaf_pbn], vec![tree_pbn]);
    let summary =
        run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("repair");

    assert_eq!(summary.mode, RecoveryMode::Rebuild, "fell back to rebuild");
    assert_eq!(
        summary.entries_added_to_slab_journals, 0,
        "rebuild never replays slab journals"
    );
    assert_eq!(count_for(&depot, Pbn(30)), 2, "both slots counted");
    assert_eq!(
        count_for(&depot, tree_pbn),
        loess_types::BLOCK_MAP_REFERENCE_COUNT,
        "tree pages are pinned at the block map sentinel"
    );
    assert_eq!(summary.logical_blocks_used, 3, "zero-block mapping counts");
    assert_eq!(summary.block_map_data_blocks, 1);
}

#[test]
fn forced_rebuild_unmaps_nonsense_entries() {
    let device = test_device();

    // Leaf page with one good mapping, one mapping into journal
    // space (nonsense), and one structurally invalid entry.
    let leaf_pbn = Pbn(17);
    let mut leaf = BlockMapPage::new_formatted(NONCE, leaf_pbn, true);
    leaf.set_entry(
        0,
        loess_types::BlockMapEntry::pack(Pbn(40), MappingState::UNCOMPRESSED),
    )
    .expect("good mapping");
    leaf.set_entry(
        1,
        loess_types::BlockMapEntry::pack(Pbn(9), MappingState::UNCOMPRESSED),
    )
    .expect("nonsense mapping");
    // A non-zero PBN claiming to be unmapped is invalid.
    leaf.set_entry(
        2,
        loess_types::BlockMapEntry::pack(Pbn(50), MappingState::UNMAPPED),
    )
    .expect("invalid mapping");
    device.write_block(leaf_pbn, leaf.as_bytes()).expect("write leaf");

    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, vec![leaf_pbn], Vec::new());
    let summary = run_repair(&device, &mut depot, &block_map, LoadState::ForceRebuild)
        .expect("forced rebuild");

    assert_eq!(summary.mode, RecoveryMode::Rebuild);
    assert_eq!(summary.logical_blocks_used, 1, "only the good mapping counts");
    assert_eq!(count_for(&depot, Pbn(40)), 1);

    // The bad entries were unmapped in place and written back.
    assert_eq!(leaf_slot(&device, leaf_pbn.0, 1), DataLocation::UNMAPPED);
    assert_eq!(leaf_slot(&device, leaf_pbn.0, 2), DataLocation::UNMAPPED);
    assert_eq!(leaf_slot(&device, leaf_pbn.0, 0).pbn, Pbn(40));
}

#[test]
fn rebuild_with_bad_tree_page_fails() {
    let device = test_device();
    let mut depot = test_depot();
    // The tree page PBN points at the journal region.
    let block_map = FlatBlockMap::new(812, Vec::new(), vec![Pbn(9)]);

    let err = run_repair(&device, &mut depot, &block_map, LoadState::ForceRebuild)
        .expect_err("bad tree page");
    assert!(matches!(err, loess_error::LoessError::BadMapping { pbn: 9 }));
}

#[test]
fn recovered_state_is_durable() {
    let device = test_device();
    let leaf = 2_u64;
    seed_leaf_page(&device, Pbn(leaf));

    let config = journal_config();
    let entries = vec![
        remap(leaf, 0, None, Some(20)),
        remap(leaf, 1, None, Some(21)),
    ];
    write_journal_block(&device, &config, &header(1, 2), &entries);

    let mut depot = test_depot();
    let block_map = FlatBlockMap::new(812, vec![Pbn(leaf)], Vec::new());
    run_repair(&device, &mut depot, &block_map, LoadState::Dirty).expect("repair");

    // Reference counters reload from the device with the recovered
    // values, independent of the in-memory depot.
    let state = depot.slab_for_pbn(Pbn(20)).expect("slab");
    let mut reloaded = ReferenceCounters::new(
        SlabNumber(0),
        state.slab.start,
        state.ref_counts.block_count(),
        state.slab.ref_counts_origin,
        ReadOnlyLatch::new(),
    );
    reloaded.load(&device).expect("reload");
    assert_eq!(reloaded.count_for(4).expect("block 20 is sbn 4"), 1);
    assert_eq!(reloaded.count_for(5).expect("block 21 is sbn 5"), 1);
    assert_eq!(reloaded.free_block_count(), 62);
}
