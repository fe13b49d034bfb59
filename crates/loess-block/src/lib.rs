#![forbid(unsafe_code)]
//! Durable-storage I/O primitives.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits used by the
//! journal, reference-count, and recovery crates, a file-backed
//! implementation with `pread`/`pwrite` semantics, a RAM-backed
//! device for tests and embedding, and the store-wide read-only
//! latch that metadata-integrity failures trip.

use loess_error::{LoessError, Result};
use loess_types::Pbn;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using Linux `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does
/// not require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(LoessError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// RAM-backed byte device for tests and ephemeral stores.
#[derive(Debug)]
pub struct RamByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl RamByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }
}

impl ByteDevice for RamByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| LoessError::Format("offset does not fit usize".to_owned()))?;
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| LoessError::Format("read out of bounds".to_owned()))?;
        buf.copy_from_slice(&bytes[offset..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| LoessError::Format("offset does not fit usize".to_owned()))?;
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| LoessError::Format("write out of bounds".to_owned()))?;
        bytes[offset..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn check_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| LoessError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| LoessError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(LoessError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read one block by number.
    fn read_block(&self, pbn: Pbn) -> Result<BlockBuf>;

    /// Write one block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, pbn: Pbn, data: &[u8]) -> Result<()>;

    /// Read `count` contiguous blocks starting at `first` into one
    /// buffer. The default implementation issues per-block reads.
    fn read_blocks(&self, first: Pbn, count: u64) -> Result<Vec<u8>> {
        let block_size = self.block_size() as usize;
        let total = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(block_size))
            .ok_or_else(|| LoessError::Format("bulk read size overflows usize".to_owned()))?;
        let mut data = Vec::with_capacity(total);
        for i in 0..count {
            let pbn = first
                .checked_add(i)
                .ok_or_else(|| LoessError::Format("bulk read PBN overflow".to_owned()))?;
            data.extend_from_slice(self.read_block(pbn)?.as_slice());
        }
        Ok(data)
    }

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn read_block(&self, pbn: Pbn) -> Result<BlockBuf> {
        (**self).read_block(pbn)
    }

    fn write_block(&self, pbn: Pbn, data: &[u8]) -> Result<()> {
        (**self).write_block(pbn, data)
    }

    fn read_blocks(&self, first: Pbn, count: u64) -> Result<Vec<u8>> {
        (**self).read_blocks(first, count)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Adapter presenting a `ByteDevice` as fixed-size blocks.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(LoessError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(LoessError::Format(format!(
                "device length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, pbn: Pbn) -> Result<BlockBuf> {
        if pbn.0 >= self.block_count {
            return Err(LoessError::Format(format!(
                "block out of range: block={pbn} block_count={}",
                self.block_count
            )));
        }

        let offset = pbn
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| LoessError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, pbn: Pbn, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(LoessError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if pbn.0 >= self.block_count {
            return Err(LoessError::Format(format!(
                "block out of range: block={pbn} block_count={}",
                self.block_count
            )));
        }

        let offset = pbn
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| LoessError::Format("block offset overflow".to_owned()))?;
        self.inner.write_all_at(offset, data)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

// ── Read-only latch ─────────────────────────────────────────────────────────

/// Store-wide read-only mode latch.
///
/// A metadata-integrity failure anywhere in the slab depot or the
/// recovery path trips the latch for the whole store; it is never
/// reset while the store is live (clearing it requires a successful
/// rebuild on the next load). Cloning shares the latch.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyLatch {
    read_only: Arc<AtomicBool>,
}

impl ReadOnlyLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Trip the latch, logging the triggering condition once.
    pub fn enter_read_only_mode(&self, reason: &LoessError) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            tracing::error!(
                target: "loess::block",
                %reason,
                "entering read-only mode"
            );
        }
    }

    /// Fail with `ReadOnly` if the latch has tripped.
    pub fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(LoessError::ReadOnly);
        }
        Ok(())
    }
}
