//! Reference counter lifecycle over a real (in-memory) device:
//! adjust, save, crash, reload — including torn reference-block
//! writes and provisional references abandoned by a crash.

use loess_block::{BlockDevice, ByteBlockDevice, RamByteDevice, ReadOnlyLatch};
use loess_slab::{
    ReferenceCounters, ReferenceStatus, ReferenceUpdater, SlabConfig, SlabDepot, SlabDepotConfig,
};
use loess_types::{
    BLOCK_SIZE, JournalOperation, JournalPoint, Pbn, SECTOR_SIZE, SequenceNumber, SlabNumber,
};

type TestDevice = ByteBlockDevice<RamByteDevice>;

fn test_device() -> TestDevice {
    ByteBlockDevice::new(RamByteDevice::new(BLOCK_SIZE * 512), BLOCK_SIZE as u32).expect("device")
}

fn test_depot() -> SlabDepot {
    SlabDepot::new(
        SlabDepotConfig {
            first_block: Pbn(16),
            slab_count: 2,
            slab: SlabConfig::new(128, 4).expect("slab config"),
            nonce: 7,
        },
        ReadOnlyLatch::new(),
    )
    .expect("depot")
}

fn point(seq: u64, entry: u16) -> JournalPoint {
    JournalPoint::new(SequenceNumber(seq), entry)
}

fn increment(depot: &mut SlabDepot, pbn: Pbn, journal_point: JournalPoint) {
    let state = depot.slab_for_pbn_mut(pbn).expect("slab for pbn");
    state
        .adjust_reference(
            pbn,
            ReferenceUpdater {
                operation: JournalOperation::DataRemapping,
                increment: true,
                lock: None,
            },
            journal_point,
        )
        .expect("increment");
}

#[test]
fn save_and_reload_round_trips_counters() {
    let device = test_device();
    let mut depot = test_depot();

    // Slab 0 data starts at 16; slab 1 at 16 + 133.
    for (i, pbn) in [16_u64, 17, 17, 50, 149, 200].into_iter().enumerate() {
        increment(&mut depot, Pbn(pbn), point(1, i as u16));
    }

    let state = depot.slab_for_pbn_mut(Pbn(16)).expect("slab 0");
    state.save_all_references(&device).expect("save slab 0");
    let state = depot.slab_for_pbn_mut(Pbn(149)).expect("slab 1");
    state.save_all_references(&device).expect("save slab 1");

    // Reload into a fresh depot.
    let mut reloaded = test_depot();
    reloaded.load_all_ref_counts(&device).expect("load");

    let slab0 = reloaded.slab_for_pbn(Pbn(16)).expect("slab 0");
    assert_eq!(slab0.ref_counts.count_for(0).expect("sbn 0"), 1);
    assert_eq!(slab0.ref_counts.count_for(1).expect("sbn 1"), 2, "shared");
    assert_eq!(slab0.ref_counts.count_for(34).expect("sbn 34"), 1);
    assert_eq!(slab0.ref_counts.free_block_count(), 125);

    let slab1 = reloaded.slab_for_pbn(Pbn(149)).expect("slab 1");
    assert_eq!(slab1.ref_counts.count_for(0).expect("sbn 0"), 1);
    assert_eq!(slab1.ref_counts.count_for(51).expect("sbn 51"), 1);
    assert_eq!(slab1.ref_counts.free_block_count(), 126);
}

#[test]
fn load_clears_abandoned_provisional_references() {
    let device = test_device();
    let mut depot = test_depot();

    increment(&mut depot, Pbn(16), point(1, 0));

    // A write was in flight when the crash hit: its tentative
    // allocation must not survive a reload.
    let state = depot.slab_for_pbn_mut(Pbn(16)).expect("slab 0");
    let allocated = state.ref_counts.allocate_free_block().expect("allocate");
    assert_eq!(
        state.ref_counts.status_for_pbn(allocated).expect("status"),
        ReferenceStatus::Provisional
    );
    state.ref_counts.dirty_all_blocks();
    state.save_all_references(&device).expect("save");

    let mut reloaded = test_depot();
    reloaded.load_all_ref_counts(&device).expect("load");
    let slab0 = reloaded.slab_for_pbn(Pbn(16)).expect("slab 0");
    assert_eq!(
        slab0.ref_counts.status_for_pbn(allocated).expect("status"),
        ReferenceStatus::Free,
        "provisional holds are not durable"
    );
    assert_eq!(slab0.ref_counts.free_block_count(), 127);
}

#[test]
fn torn_reference_block_write_is_tolerated_on_load() {
    let device = test_device();
    let mut depot = test_depot();

    increment(&mut depot, Pbn(20), point(9, 4));
    let state = depot.slab_for_pbn_mut(Pbn(20)).expect("slab 0");
    let origin = state.slab.ref_counts_origin;
    state.save_all_references(&device).expect("save");

    // Tear the write: age one sector's commit point on disk.
    let mut block = device.read_block(origin).expect("read").into_inner();
    let stale = JournalPoint::new(SequenceNumber(1), 0).pack();
    block[5 * SECTOR_SIZE..5 * SECTOR_SIZE + 8].copy_from_slice(&stale);
    device.write_block(origin, &block).expect("write torn block");

    let mut counters = ReferenceCounters::new(
        SlabNumber(0),
        Pbn(16),
        128,
        origin,
        ReadOnlyLatch::new(),
    );
    counters.load(&device).expect("torn block loads");
    assert_eq!(counters.count_for(4).expect("count"), 1);
    assert_eq!(
        counters.slab_journal_point(),
        point(9, 4),
        "the newest commit point wins"
    );
}

#[test]
fn graduated_flushing_writes_a_fraction_of_dirty_blocks() {
    let device = test_device();
    // A slab big enough for several reference blocks.
    let mut counters = ReferenceCounters::new(
        SlabNumber(0),
        Pbn(16),
        4032 * 4,
        Pbn(300),
        ReadOnlyLatch::new(),
    );
    counters.dirty_all_blocks();
    assert_eq!(counters.dirty_block_count(), 4);

    // One quarter of four dirty blocks: one write.
    counters.save_dirty(&device, 4).expect("save fraction");
    assert_eq!(counters.dirty_block_count(), 3);

    // The minimum is always one block.
    counters.save_dirty(&device, 100).expect("save minimum");
    assert_eq!(counters.dirty_block_count(), 2);

    counters.save_all(&device).expect("save rest");
    assert_eq!(counters.dirty_block_count(), 0);
}

#[test]
fn io_error_on_save_latches_read_only() {
    // A device too small for the reference-block origin.
    let device =
        ByteBlockDevice::new(RamByteDevice::new(BLOCK_SIZE * 4), BLOCK_SIZE as u32).expect("device");
    let latch = ReadOnlyLatch::new();
    let mut counters =
        ReferenceCounters::new(SlabNumber(0), Pbn(16), 64, Pbn(1000), latch.clone());

    counters.dirty_all_blocks();
    assert!(counters.save_all(&device).is_err());
    assert!(latch.is_read_only(), "failed metadata write trips the latch");
}
