#![forbid(unsafe_code)]
//! Block-map leaf pages and the page-cache protocol recovery consumes.
//!
//! The logical-to-physical map itself (tree growth, lookup, the live
//! page cache) belongs to the front end; recovery only needs:
//!
//! - the on-disk leaf page format, to write replayed mappings and to
//!   walk leaves during a rebuild;
//! - a lease-based [`PageCache`] interface — acquire a page by PBN,
//!   read or update it, request write-back, release — with
//!   [`DevicePageCache`] as the device-backed implementation;
//! - a [`BlockMapView`] interface describing the map's shape: how many
//!   leaf pages exist, where each lives, and which PBNs hold interior
//!   tree pages.

use loess_block::BlockDevice;
use loess_error::{LoessError, Result};
use loess_types::{
    BLOCK_MAP_ENTRIES_PER_PAGE, BLOCK_SIZE, BlockMapEntry, Pbn, read_fixed, read_le_u32,
    read_le_u64,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// On-disk page format version.
pub const PAGE_VERSION_MAJOR: u32 = 4;
pub const PAGE_VERSION_MINOR: u32 = 1;

/// Page header: 8-byte version, nonce, home PBN, 8 reserved bytes,
/// initialized flag, 3 reserved bytes.
pub const PAGE_HEADER_SIZE: usize = 36;

const NONCE_OFFSET: usize = 8;
const PBN_OFFSET: usize = 16;
const INITIALIZED_OFFSET: usize = 32;
const ENTRIES_OFFSET: usize = PAGE_HEADER_SIZE;

/// Result of checking a loaded page against its expected identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageValidity {
    Valid,
    /// Not a formatted page (wrong version or nonce).
    Invalid,
    /// A formatted page found somewhere it does not belong.
    BadLocation,
}

/// One block-map leaf page: a 36-byte header and 812 packed mappings.
///
/// Owns its full block of bytes; accessors keep the on-disk form
/// authoritative so a page can be handed straight back to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapPage {
    bytes: Vec<u8>,
}

impl BlockMapPage {
    /// Format a fresh page in memory.
    #[must_use]
    pub fn new_formatted(nonce: u64, pbn: Pbn, initialized: bool) -> Self {
        let mut bytes = vec![0_u8; BLOCK_SIZE];
        bytes[0..4].copy_from_slice(&PAGE_VERSION_MAJOR.to_le_bytes());
        bytes[4..8].copy_from_slice(&PAGE_VERSION_MINOR.to_le_bytes());
        bytes[NONCE_OFFSET..NONCE_OFFSET + 8].copy_from_slice(&nonce.to_le_bytes());
        bytes[PBN_OFFSET..PBN_OFFSET + 8].copy_from_slice(&pbn.0.to_le_bytes());
        bytes[INITIALIZED_OFFSET] = u8::from(initialized);
        Self { bytes }
    }

    /// Adopt a block read from the device.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != BLOCK_SIZE {
            return Err(LoessError::Format(format!(
                "block map page must be {BLOCK_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn pbn(&self) -> Pbn {
        Pbn(read_le_u64(&self.bytes, PBN_OFFSET).unwrap_or(0))
    }

    #[must_use]
    pub fn nonce(&self) -> u64 {
        read_le_u64(&self.bytes, NONCE_OFFSET).unwrap_or(0)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.bytes[INITIALIZED_OFFSET] != 0
    }

    pub fn set_initialized(&mut self, initialized: bool) {
        self.bytes[INITIALIZED_OFFSET] = u8::from(initialized);
    }

    /// Check a loaded page's identity stamps.
    #[must_use]
    pub fn validate(&self, nonce: u64, expected_pbn: Pbn) -> PageValidity {
        let version_ok = read_le_u32(&self.bytes, 0) == Ok(PAGE_VERSION_MAJOR)
            && read_le_u32(&self.bytes, 4) == Ok(PAGE_VERSION_MINOR);
        if !version_ok || self.nonce() != nonce {
            return PageValidity::Invalid;
        }
        if self.pbn() != expected_pbn {
            return PageValidity::BadLocation;
        }
        PageValidity::Valid
    }

    pub fn entry(&self, slot: u16) -> Result<BlockMapEntry> {
        let offset = Self::entry_offset(slot)?;
        let bytes: [u8; 5] = read_fixed(&self.bytes, offset)
            .map_err(|err| LoessError::Parse(err.to_string()))?;
        Ok(BlockMapEntry::from_bytes(bytes))
    }

    pub fn set_entry(&mut self, slot: u16, entry: BlockMapEntry) -> Result<()> {
        let offset = Self::entry_offset(slot)?;
        self.bytes[offset..offset + 5].copy_from_slice(&entry.to_bytes());
        Ok(())
    }

    fn entry_offset(slot: u16) -> Result<usize> {
        if slot >= BLOCK_MAP_ENTRIES_PER_PAGE {
            return Err(LoessError::Format(format!(
                "slot {slot} out of range (page holds {BLOCK_MAP_ENTRIES_PER_PAGE})"
            )));
        }
        Ok(ENTRIES_OFFSET + usize::from(slot) * 5)
    }
}

// ── Page cache protocol ─────────────────────────────────────────────────────

/// A held reservation on one cached page. Not cloneable: dropping the
/// lease without [`PageCache::release`] leaks the reservation, which
/// the cache reports via [`PageCache::held_leases`].
#[derive(Debug, PartialEq, Eq)]
pub struct PageLease {
    pbn: Pbn,
    token: u64,
}

impl PageLease {
    #[must_use]
    pub fn pbn(&self) -> Pbn {
        self.pbn
    }
}

/// The acquire/release page protocol recovery drives.
///
/// At most a caller-chosen window of leases is held at once; the cache
/// tracks reservations so an abort path can verify it released
/// everything it acquired.
pub trait PageCache: Send + Sync {
    /// Acquire a lease on the page at `pbn`, loading it if absent.
    fn acquire(&self, pbn: Pbn) -> Result<PageLease>;

    /// Copy out the leased page.
    fn page(&self, lease: &PageLease) -> Result<BlockMapPage>;

    /// Replace the leased page's contents and mark it dirty.
    fn update(&self, lease: &PageLease, page: &BlockMapPage) -> Result<()>;

    /// Ask for the leased page to be written back on the next flush.
    fn request_write(&self, lease: &PageLease) -> Result<()>;

    /// Return a lease. Pages with no holders become evictable.
    fn release(&self, lease: PageLease);

    /// Write every dirty page back to the device.
    fn flush(&self) -> Result<()>;

    /// Drop all clean cached pages. Fails if leases are held or dirty
    /// pages have not been flushed.
    fn invalidate(&self) -> Result<()>;

    /// Number of leases currently outstanding.
    fn held_leases(&self) -> usize;
}

#[derive(Debug)]
struct CachedPage {
    bytes: Vec<u8>,
    dirty: bool,
    holders: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    pages: HashMap<u64, CachedPage>,
    next_token: u64,
    held: usize,
}

/// Device-backed [`PageCache`].
///
/// Pages load on first acquire and stay resident until invalidated;
/// recovery touches each leaf page a bounded number of times, so no
/// eviction policy is needed here — the front end's cache owns that
/// concern in live operation.
#[derive(Debug)]
pub struct DevicePageCache<D: BlockDevice> {
    device: D,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> DevicePageCache<D> {
    pub fn new(device: D) -> Result<Self> {
        if device.block_size() as usize != BLOCK_SIZE {
            return Err(LoessError::Format(format!(
                "page cache requires {BLOCK_SIZE}-byte blocks, device has {}",
                device.block_size()
            )));
        }
        Ok(Self {
            device,
            state: Mutex::new(CacheState::default()),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: BlockDevice> PageCache for DevicePageCache<D> {
    fn acquire(&self, pbn: Pbn) -> Result<PageLease> {
        let mut state = self.state.lock();
        if !state.pages.contains_key(&pbn.0) {
            // Load outside the map borrow but inside the lock: the
            // device read must not race a concurrent first acquire.
            let bytes = self.device.read_block(pbn)?.into_inner();
            state.pages.insert(
                pbn.0,
                CachedPage {
                    bytes,
                    dirty: false,
                    holders: 0,
                },
            );
        }

        let page = state
            .pages
            .get_mut(&pbn.0)
            .unwrap_or_else(|| unreachable!("page inserted above"));
        page.holders += 1;
        state.held += 1;
        state.next_token += 1;
        let token = state.next_token;
        drop(state);

        tracing::trace!(target: "loess::block_map", pbn = pbn.0, "page acquired");
        Ok(PageLease { pbn, token })
    }

    fn page(&self, lease: &PageLease) -> Result<BlockMapPage> {
        let state = self.state.lock();
        let page = state
            .pages
            .get(&lease.pbn.0)
            .ok_or_else(|| LoessError::InvalidState(format!("no page cached for {}", lease.pbn)))?;
        BlockMapPage::from_bytes(page.bytes.clone())
    }

    fn update(&self, lease: &PageLease, page: &BlockMapPage) -> Result<()> {
        let mut state = self.state.lock();
        let cached = state
            .pages
            .get_mut(&lease.pbn.0)
            .ok_or_else(|| LoessError::InvalidState(format!("no page cached for {}", lease.pbn)))?;
        cached.bytes.clear();
        cached.bytes.extend_from_slice(page.as_bytes());
        cached.dirty = true;
        Ok(())
    }

    fn request_write(&self, lease: &PageLease) -> Result<()> {
        let mut state = self.state.lock();
        let cached = state
            .pages
            .get_mut(&lease.pbn.0)
            .ok_or_else(|| LoessError::InvalidState(format!("no page cached for {}", lease.pbn)))?;
        cached.dirty = true;
        Ok(())
    }

    fn release(&self, lease: PageLease) {
        let mut state = self.state.lock();
        if let Some(page) = state.pages.get_mut(&lease.pbn.0) {
            page.holders = page.holders.saturating_sub(1);
        }
        state.held = state.held.saturating_sub(1);
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut dirty: Vec<u64> = state
            .pages
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(pbn, _)| *pbn)
            .collect();
        dirty.sort_unstable();

        for pbn in &dirty {
            let page = state
                .pages
                .get(pbn)
                .unwrap_or_else(|| unreachable!("collected above"));
            self.device.write_block(Pbn(*pbn), &page.bytes)?;
            state
                .pages
                .get_mut(pbn)
                .unwrap_or_else(|| unreachable!("collected above"))
                .dirty = false;
        }
        drop(state);

        if !dirty.is_empty() {
            self.device.sync()?;
            tracing::debug!(
                target: "loess::block_map",
                pages = dirty.len(),
                "flushed dirty block map pages"
            );
        }
        Ok(())
    }

    fn invalidate(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.held > 0 {
            return Err(LoessError::InvalidState(format!(
                "cannot invalidate page cache with {} leases held",
                state.held
            )));
        }
        if state.pages.values().any(|page| page.dirty) {
            return Err(LoessError::InvalidState(
                "cannot invalidate page cache with unflushed dirty pages".to_owned(),
            ));
        }
        state.pages.clear();
        Ok(())
    }

    fn held_leases(&self) -> usize {
        self.state.lock().held
    }
}

// ── Block map shape ─────────────────────────────────────────────────────────

/// The map's shape as recovery needs it: where leaves live and which
/// PBNs hold interior tree pages. The tree's own walk/growth logic is
/// the front end's; recovery only enumerates.
pub trait BlockMapView: Send + Sync {
    /// Total logical mappings the map addresses.
    fn entry_count(&self) -> u64;

    /// Number of leaf pages covering `entry_count`.
    fn leaf_page_count(&self) -> u64;

    /// Home PBN of leaf page `index`, or the zero block if that page
    /// has never been allocated.
    fn leaf_page_pbn(&self, index: u64) -> Pbn;

    /// Visit every interior tree page PBN, in any order.
    fn visit_tree_pages(&self, visitor: &mut dyn FnMut(Pbn) -> Result<()>) -> Result<()>;
}

/// An explicit, pre-enumerated map shape.
///
/// The production front end derives this from its forest; tests and
/// embedded callers construct it directly.
#[derive(Debug, Clone, Default)]
pub struct FlatBlockMap {
    entry_count: u64,
    leaf_pages: Vec<Pbn>,
    tree_pages: Vec<Pbn>,
}

impl FlatBlockMap {
    #[must_use]
    pub fn new(entry_count: u64, leaf_pages: Vec<Pbn>, tree_pages: Vec<Pbn>) -> Self {
        Self {
            entry_count,
            leaf_pages,
            tree_pages,
        }
    }
}

impl BlockMapView for FlatBlockMap {
    fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn leaf_page_count(&self) -> u64 {
        self.leaf_pages.len() as u64
    }

    fn leaf_page_pbn(&self, index: u64) -> Pbn {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.leaf_pages.get(index))
            .copied()
            .unwrap_or(loess_types::ZERO_BLOCK)
    }

    fn visit_tree_pages(&self, visitor: &mut dyn FnMut(Pbn) -> Result<()>) -> Result<()> {
        for pbn in &self.tree_pages {
            visitor(*pbn)?;
        }
        Ok(())
    }
}
