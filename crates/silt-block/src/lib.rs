#![forbid(unsafe_code)]
//! Backing store and chunk cache.
//!
//! A `ChunkStore` exposes a fixed-size byte device as an array of
//! fixed-size chunks. Chunk handles are reference counted and deduplicated
//! through a weak map: while any handle to an index is live, every
//! `get_chunk` for that index returns the same buffer. A chunk that was
//! mutated writes itself back to the device when its last handle drops.

use parking_lot::Mutex;
use silt_error::{FsError, Result};
use silt_types::{ChunkIndex, ChunkSize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

// ── Byte devices ────────────────────────────────────────────────────────────

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

/// File-backed byte device using positional I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position; the kernel page cache gives all handles a shared
/// view of the file, so this is the buffered-I/O rendering of a shared
/// mapping.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing backing file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) a backing file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// RAM-backed byte device.
///
/// The anonymous-mapping analogue: a volume that lives only as long as the
/// process. Also the workhorse of the test suites.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(FsError::OutOfRange {
            index: offset,
            limit: device_len,
        })?;
    if end > device_len {
        return Err(FsError::OutOfRange {
            index: end,
            limit: device_len,
        });
    }
    Ok(())
}

// ── Chunk ───────────────────────────────────────────────────────────────────

/// Shared handle to one cached chunk.
pub type ChunkHandle = Arc<Chunk>;

/// A fixed-size chunk buffer wired to its byte range on the device.
///
/// Carries its own byte mutex for caller discipline; the filesystem itself
/// serializes writers through higher-level locks. Mutating accessors mark
/// the chunk dirty; a dirty chunk writes itself back when the last handle
/// drops, and `flush` writes it back immediately.
pub struct Chunk {
    index: ChunkIndex,
    offset: u64,
    dev: Arc<dyn ByteDevice>,
    data: Mutex<Box<[u8]>>,
    dirty: AtomicBool,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.index)
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Chunk {
    #[must_use]
    pub fn index(&self) -> ChunkIndex {
        self.index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// The range must lie within the chunk.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy `buf` into the chunk starting at `offset` and mark it dirty.
    ///
    /// The range must lie within the chunk.
    pub fn write_at(&self, offset: usize, buf: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + buf.len()].copy_from_slice(buf);
        drop(data);
        self.dirty.store(true, Ordering::Release);
    }

    /// Zero the whole chunk.
    pub fn fill_zero(&self) {
        let mut data = self.data.lock();
        data.fill(0);
        drop(data);
        self.dirty.store(true, Ordering::Release);
    }

    /// Read the `word`-th native-endian u64.
    #[must_use]
    pub fn read_u64(&self, word: usize) -> u64 {
        let data = self.data.lock();
        let start = word * 8;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&data[start..start + 8]);
        u64::from_ne_bytes(raw)
    }

    /// Write the `word`-th native-endian u64 and mark the chunk dirty.
    pub fn write_u64(&self, word: usize, value: u64) {
        let mut data = self.data.lock();
        let start = word * 8;
        data[start..start + 8].copy_from_slice(&value.to_ne_bytes());
        drop(data);
        self.dirty.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn read_byte(&self, offset: usize) -> u8 {
        self.data.lock()[offset]
    }

    pub fn write_byte(&self, offset: usize, value: u8) {
        let mut data = self.data.lock();
        data[offset] = value;
        drop(data);
        self.dirty.store(true, Ordering::Release);
    }

    /// Copy of the full chunk contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().to_vec()
    }

    /// Replace this chunk's bytes with `src`'s bytes.
    ///
    /// Locks are taken sequentially (source copied out first), so the two
    /// chunks may be acquired in any order by concurrent callers.
    pub fn copy_from(&self, src: &Chunk) {
        let bytes = src.to_vec();
        self.write_at(0, &bytes);
    }

    /// Write the chunk through to the device now if it is dirty.
    pub fn flush(&self) -> Result<()> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            let data = self.data.lock();
            self.dev.write_all_at(self.offset, &data)?;
        }
        Ok(())
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Last handle gone; schedule the bytes back to the device. Errors
        // cannot propagate from here, so they are logged and the explicit
        // flush paths remain responsible for durability guarantees.
        if self.dirty.load(Ordering::Acquire) {
            let data = self.data.get_mut();
            if let Err(err) = self.dev.write_all_at(self.offset, data) {
                warn!(
                    target: "silt::block",
                    event = "writeback_failed",
                    chunk = self.index.0,
                    error = %err,
                    "chunk write-back on last-handle drop failed"
                );
            }
        }
    }
}

// ── Chunk store ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct CacheMap {
    map: HashMap<u64, Weak<Chunk>>,
    next_sweep: usize,
}

impl CacheMap {
    fn sweep(&mut self) {
        let before = self.map.len();
        self.map.retain(|_, weak| weak.strong_count() > 0);
        self.next_sweep = (self.map.len() * 2).max(16);
        trace!(
            target: "silt::block",
            event = "cache_sweep",
            before,
            after = self.map.len()
        );
    }
}

/// Fixed-size, chunk-addressable backing store with a deduplicating cache.
pub struct ChunkStore {
    dev: Arc<dyn ByteDevice>,
    chunk_size: ChunkSize,
    chunk_count: u64,
    cache: Mutex<CacheMap>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_count", &self.chunk_count)
            .finish_non_exhaustive()
    }
}

impl ChunkStore {
    /// Wrap an existing byte device.
    ///
    /// The device must be at least `chunk_count × chunk_size` bytes long.
    pub fn with_device(
        dev: Arc<dyn ByteDevice>,
        chunk_count: u64,
        chunk_size: ChunkSize,
    ) -> Result<Self> {
        let needed = chunk_count
            .checked_mul(u64::from(chunk_size.get()))
            .ok_or(FsError::InvalidArgument("volume size overflows u64"))?;
        if dev.len_bytes() < needed {
            return Err(FsError::Corrupted(format!(
                "device holds {} bytes but the volume needs {needed}",
                dev.len_bytes()
            )));
        }
        let mut cache = CacheMap::default();
        cache.next_sweep = 16;
        Ok(Self {
            dev,
            chunk_size,
            chunk_count,
            cache: Mutex::new(cache),
        })
    }

    /// Create (or truncate) a file-backed store of `chunk_count` chunks.
    pub fn create(
        path: impl AsRef<Path>,
        chunk_count: u64,
        chunk_size: ChunkSize,
    ) -> Result<Self> {
        let len = chunk_count
            .checked_mul(u64::from(chunk_size.get()))
            .ok_or(FsError::InvalidArgument("volume size overflows u64"))?;
        let dev = FileByteDevice::create(path, len)?;
        Self::with_device(Arc::new(dev), chunk_count, chunk_size)
    }

    /// Open an existing file-backed store.
    pub fn open(path: impl AsRef<Path>, chunk_count: u64, chunk_size: ChunkSize) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        Self::with_device(Arc::new(dev), chunk_count, chunk_size)
    }

    #[must_use]
    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.chunk_count * u64::from(self.chunk_size.get())
    }

    /// Return a shared handle to the chunk at `index`.
    ///
    /// A live handle for the same index yields the same buffer; otherwise
    /// the chunk bytes are read from the device.
    pub fn get_chunk(&self, index: ChunkIndex) -> Result<ChunkHandle> {
        if index.0 >= self.chunk_count {
            return Err(FsError::OutOfRange {
                index: index.0,
                limit: self.chunk_count,
            });
        }

        let mut cache = self.cache.lock();
        if let Some(chunk) = cache.map.get(&index.0).and_then(Weak::upgrade) {
            return Ok(chunk);
        }

        let offset = index.0 * u64::from(self.chunk_size.get());
        let mut buf = vec![0_u8; self.chunk_size.as_usize()].into_boxed_slice();
        self.dev.read_exact_at(offset, &mut buf)?;

        let chunk = Arc::new(Chunk {
            index,
            offset,
            dev: Arc::clone(&self.dev),
            data: Mutex::new(buf),
            dirty: AtomicBool::new(false),
        });
        cache.map.insert(index.0, Arc::downgrade(&chunk));
        if cache.map.len() >= cache.next_sweep {
            cache.sweep();
        }
        Ok(chunk)
    }

    /// Write a cached dirty chunk through to the device now.
    ///
    /// A chunk that is not cached has no pending bytes, so this is a no-op
    /// for it.
    pub fn flush_chunk(&self, index: ChunkIndex) -> Result<()> {
        let cached = {
            let cache = self.cache.lock();
            cache.map.get(&index.0).and_then(Weak::upgrade)
        };
        // The cache mutex is released before the write-back call.
        match cached {
            Some(chunk) => chunk.flush(),
            None => Ok(()),
        }
    }

    /// Flush pending device writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    /// Number of cache entries with a live outside handle.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.cache
            .lock()
            .map
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Tear down the store.
    ///
    /// Every chunk handle must have been dropped; live handles mean some
    /// component still believes it owns part of the volume.
    pub fn close(&self) -> Result<()> {
        let live = self.live_handles();
        if live > 0 {
            return Err(FsError::Invariant(format!(
                "{live} chunk handle(s) still live at close"
            )));
        }
        debug!(target: "silt::block", event = "store_close");
        self.dev.sync()
    }
}
