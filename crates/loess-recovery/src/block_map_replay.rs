//! Replaying extracted journal mappings into block-map leaf pages.
//!
//! The entry array is consumed through an in-place heap ordered by
//! (leaf page, slot, extraction number): grouping by target page lets
//! every mapping bound for one page ride a single fetch/write cycle,
//! while the extraction number keeps same-slot entries in original
//! journal order — the order that must win when a slot was remapped
//! more than once.
//!
//! Page fetches run ahead of application through a bounded window of
//! page-cache leases reused round-robin, and a run's boundary is found
//! by walking the sorted tail of the array backward — no rescanning.

use crate::heap::SortHeap;
use loess_block_map::{PageCache, PageLease};
use loess_error::Result;
use loess_types::{BlockMapEntry, BlockMapSlot};
use std::cmp::Ordering;
use std::collections::VecDeque;

/// A journal mapping tagged with its extraction order, so entries for
/// the same slot replay in original journal order even after sorting
/// by slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberedBlockMapping {
    pub slot: BlockMapSlot,
    pub entry: BlockMapEntry,
    pub number: u32,
}

/// Reversed comparator: the heap surfaces the smallest
/// (page, slot, number) first.
fn replay_order(a: &NumberedBlockMapping, b: &NumberedBlockMapping) -> Ordering {
    (b.slot, b.number).cmp(&(a.slot, a.number))
}

struct PendingRun {
    lease: PageLease,
    /// Highest slice index of the run (smallest key).
    from: usize,
    /// One below the lowest slice index of the run; `-1` when the run
    /// reaches the start of the array.
    below: isize,
}

/// Apply every mapping to its leaf page. Returns the number of
/// entries applied.
///
/// On error, every outstanding lease is released before returning, so
/// an aborted replay never leaks page-cache reservations.
pub fn replay_into_block_map(
    entries: &mut [NumberedBlockMapping],
    cache: &dyn PageCache,
    window: usize,
) -> Result<usize> {
    tracing::info!(
        target: "loess::recovery",
        entries = entries.len(),
        "replaying recovery entries into block map"
    );
    if entries.is_empty() {
        return Ok(0);
    }

    let window = window.max(1);
    let mut heap = SortHeap::new(entries, replay_order);
    let first = heap
        .sort_next()
        .unwrap_or_else(|| unreachable!("heap of a non-empty slice"));
    debug_assert_eq!(first + 1, heap.slice().len());

    let mut pending: VecDeque<PendingRun> = VecDeque::new();
    // Highest index whose page has not been requested yet.
    let mut unfetched = first as isize;
    let mut applied = 0_usize;

    let release_all = |cache: &dyn PageCache, pending: &mut VecDeque<PendingRun>| {
        for run in pending.drain(..) {
            cache.release(run.lease);
        }
    };

    loop {
        // Keep the fetch window full.
        while pending.len() < window && unfetched >= 0 {
            let from = unfetched as usize;
            let page_pbn = heap.slice()[from].slot.pbn;
            let below = find_run_below(&mut heap, from);
            match cache.acquire(page_pbn) {
                Ok(lease) => pending.push_back(PendingRun { lease, from, below }),
                Err(err) => {
                    release_all(cache, &mut pending);
                    return Err(err);
                }
            }
            unfetched = below;
        }

        let Some(run) = pending.pop_front() else {
            break;
        };

        if let Err(err) = apply_run(&heap, cache, &run) {
            cache.release(run.lease);
            release_all(cache, &mut pending);
            return Err(err);
        }
        applied += (run.from as isize - run.below) as usize;
        cache.release(run.lease);
    }

    Ok(applied)
}

/// Walk backward from `from` (already sorted) past every entry bound
/// for the same leaf page, sorting the array as the walk advances.
/// Returns the index one below the run.
fn find_run_below<F>(heap: &mut SortHeap<'_, NumberedBlockMapping, F>, from: usize) -> isize
where
    F: Fn(&NumberedBlockMapping, &NumberedBlockMapping) -> Ordering,
{
    let page = heap.slice()[from].slot.pbn;
    let mut index = from as isize;
    while index >= 0 && heap.slice()[index as usize].slot.pbn == page {
        if let Some(just_sorted) = heap.sort_next() {
            debug_assert!(
                (just_sorted as isize) < index,
                "heap returned elements in an unexpected order"
            );
        }
        index -= 1;
    }
    index
}

fn apply_run<F>(
    heap: &SortHeap<'_, NumberedBlockMapping, F>,
    cache: &dyn PageCache,
    run: &PendingRun,
) -> Result<()>
where
    F: Fn(&NumberedBlockMapping, &NumberedBlockMapping) -> Ordering,
{
    let mut page = cache.page(&run.lease)?;
    // Walk the run from the highest index down: ascending (slot,
    // number), so the newest mapping for a slot lands last.
    let mut index = run.from as isize;
    while index > run.below {
        let mapping = &heap.slice()[index as usize];
        page.set_entry(mapping.slot.slot, mapping.entry)?;
        index -= 1;
    }
    cache.update(&run.lease, &page)?;
    cache.request_write(&run.lease)?;
    Ok(())
}
