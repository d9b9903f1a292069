#![forbid(unsafe_code)]
//! Inode records, the indirect block map, and the inode table.
//!
//! An inode's `addresses` array is four concatenated regions — direct,
//! single-, double-, and triple-indirect — forming a sparse tree keyed by
//! logical file chunk number. Every mutation of the tree is copy-on-write:
//! resolving a chunk for writing allocates a fresh chunk from the segment
//! controller at every touched level and frees the one it replaces, which
//! is what keeps the allocator log-structured.
//!
//! In-memory `Inode` handles carry the slot index and a non-owning pointer
//! back to their table; persisting a record is an explicit
//! [`InodeTable::update`], never a destructor side effect.

use parking_lot::Mutex;
use silt_alloc::ChunkBitmap;
use silt_block::{ChunkHandle, ChunkStore};
use silt_error::{FsError, Result};
use silt_seg::{RelocateOwner, SegmentController};
use silt_types::{ChunkIndex, FileKind, InodeIndex, PERM_MASK};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

// ── Record layout ───────────────────────────────────────────────────────────

pub const DIRECT_SLOTS: usize = 8;
pub const SINGLE_INDIRECT_SLOTS: usize = 1;
pub const DOUBLE_INDIRECT_SLOTS: usize = 1;
pub const TRIPLE_INDIRECT_SLOTS: usize = 1;
pub const ADDRESS_SLOTS: usize =
    DIRECT_SLOTS + SINGLE_INDIRECT_SLOTS + DOUBLE_INDIRECT_SLOTS + TRIPLE_INDIRECT_SLOTS;

/// Slots per region, indexed by indirection level.
const REGION_SLOTS: [u64; 4] = [
    DIRECT_SLOTS as u64,
    SINGLE_INDIRECT_SLOTS as u64,
    DOUBLE_INDIRECT_SLOTS as u64,
    TRIPLE_INDIRECT_SLOTS as u64,
];

/// Packed on-disk size of one inode record (8-byte aligned).
pub const INODE_RECORD_SIZE: usize = 136;

/// Persistent per-file metadata.
///
/// Serialized with explicit offsets, native-endian, exactly
/// `INODE_RECORD_SIZE` bytes. A zero address means "not present".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub uid: u64,
    pub gid: u64,
    pub atime_ms: u64,
    pub mtime_ms: u64,
    pub size: u64,
    pub addresses: [u64; ADDRESS_SLOTS],
    pub perms: u16,
    pub kind: u8,
}

impl Default for InodeRecord {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            atime_ms: 0,
            mtime_ms: 0,
            size: 0,
            addresses: [0; ADDRESS_SLOTS],
            perms: 0o644,
            kind: 0,
        }
    }
}

impl InodeRecord {
    #[must_use]
    pub fn encode(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut raw = [0_u8; INODE_RECORD_SIZE];
        raw[0x00..0x08].copy_from_slice(&self.uid.to_ne_bytes());
        raw[0x08..0x10].copy_from_slice(&self.gid.to_ne_bytes());
        raw[0x10..0x18].copy_from_slice(&self.atime_ms.to_ne_bytes());
        raw[0x18..0x20].copy_from_slice(&self.mtime_ms.to_ne_bytes());
        raw[0x20..0x28].copy_from_slice(&self.size.to_ne_bytes());
        for (slot, address) in self.addresses.iter().enumerate() {
            let at = 0x28 + slot * 8;
            raw[at..at + 8].copy_from_slice(&address.to_ne_bytes());
        }
        raw[0x80..0x82].copy_from_slice(&self.perms.to_ne_bytes());
        raw[0x82] = self.kind;
        raw
    }

    #[must_use]
    pub fn decode(raw: &[u8; INODE_RECORD_SIZE]) -> Self {
        let word = |at: usize| {
            let mut bytes = [0_u8; 8];
            bytes.copy_from_slice(&raw[at..at + 8]);
            u64::from_ne_bytes(bytes)
        };
        let mut addresses = [0_u64; ADDRESS_SLOTS];
        for (slot, address) in addresses.iter_mut().enumerate() {
            *address = word(0x28 + slot * 8);
        }
        Self {
            uid: word(0x00),
            gid: word(0x08),
            atime_ms: word(0x10),
            mtime_ms: word(0x18),
            size: word(0x20),
            addresses,
            perms: u16::from_ne_bytes([raw[0x80], raw[0x81]]),
            kind: raw[0x82],
        }
    }

    #[must_use]
    pub fn file_kind(&self) -> Option<FileKind> {
        FileKind::from_u8(self.kind)
    }
}

// ── Inode handle ────────────────────────────────────────────────────────────

/// In-memory handle to one live inode.
pub struct Inode {
    index: InodeIndex,
    store: Arc<ChunkStore>,
    seg: Arc<SegmentController>,
    table: Weak<InodeTable>,
    data: Mutex<InodeRecord>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Inode {
    #[must_use]
    pub fn index(&self) -> InodeIndex {
        self.index
    }

    /// Snapshot of the current record.
    #[must_use]
    pub fn record(&self) -> InodeRecord {
        self.data.lock().clone()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.lock().size
    }

    #[must_use]
    pub fn kind(&self) -> Option<FileKind> {
        self.data.lock().file_kind()
    }

    /// Fill in a freshly allocated inode's record.
    pub fn initialize(&self, uid: u64, gid: u64, perms: u16, kind: FileKind, now_ms: u64) {
        let mut rec = self.data.lock();
        rec.uid = uid;
        rec.gid = gid;
        rec.perms = perms & PERM_MASK;
        rec.kind = kind.as_u8();
        rec.atime_ms = now_ms;
        rec.mtime_ms = now_ms;
    }

    pub fn set_kind(&self, kind: FileKind) {
        self.data.lock().kind = kind.as_u8();
    }

    pub fn set_perms(&self, perms: u16) {
        self.data.lock().perms = perms & PERM_MASK;
    }

    pub fn set_times(&self, atime_ms: u64, mtime_ms: u64) {
        let mut rec = self.data.lock();
        rec.atime_ms = atime_ms;
        rec.mtime_ms = mtime_ms;
    }

    fn touch_mtime(rec: &mut InodeRecord, now_ms: u64) {
        rec.mtime_ms = now_ms;
    }

    /// Highest logical chunk number addressable through the four regions.
    fn chunk_capacity(&self) -> u64 {
        let f = self.store.chunk_size().fan_out();
        let mut capacity = 0_u64;
        let mut span = 1_u64;
        for slots in REGION_SLOTS {
            capacity = capacity.saturating_add(slots.saturating_mul(span));
            span = span.saturating_mul(f);
        }
        capacity
    }

    /// Allocate a fresh chunk for this inode, seeding it from `old` (COW)
    /// or zero-filling, and retiring the replaced chunk.
    fn cow_replace(&self, old: u64) -> Result<ChunkHandle> {
        let fresh_idx = self.seg.allocate(self.index)?;
        let fresh = self.store.get_chunk(fresh_idx)?;
        if old != 0 {
            let replaced = self.store.get_chunk(ChunkIndex(old))?;
            fresh.copy_from(&replaced);
            self.seg.free_chunk(replaced)?;
        } else {
            fresh.fill_zero();
        }
        Ok(fresh)
    }

    /// Map a logical file chunk number to its data chunk.
    ///
    /// With `create`, absent entries are allocated and present ones are
    /// rewritten copy-on-write at every level of the walk; the returned
    /// chunk is always `Some`. Without `create`, a zero entry anywhere on
    /// the path yields `None` (reads treat that as a hole).
    pub fn resolve(&self, chunk_number: u64, create: bool) -> Result<Option<ChunkHandle>> {
        let mut rec = self.data.lock();
        self.resolve_locked(&mut rec, chunk_number, create)
    }

    fn resolve_locked(
        &self,
        rec: &mut InodeRecord,
        chunk_number: u64,
        create: bool,
    ) -> Result<Option<ChunkHandle>> {
        let fan_out = self.store.chunk_size().fan_out();
        let mut k = chunk_number;
        let mut span = 1_u64; // logical chunks covered by one slot at this level
        let mut base = 0_usize;

        for (level, &slots) in REGION_SLOTS.iter().enumerate() {
            let region_span = slots * span;
            if k < region_span {
                let slot = base + (k / span) as usize;
                let entry = rec.addresses[slot];
                if !create && entry == 0 {
                    return Ok(None);
                }
                let mut chunk = if create {
                    let fresh = self.cow_replace(entry)?;
                    rec.addresses[slot] = fresh.index().0;
                    fresh
                } else {
                    self.store.get_chunk(ChunkIndex(entry))?
                };

                // Descend through the indirect pages.
                let mut remaining = k % span;
                let mut page_span = span;
                for _ in 0..level {
                    page_span /= fan_out;
                    let word = (remaining / page_span) as usize;
                    let entry = chunk.read_u64(word);
                    if !create && entry == 0 {
                        return Ok(None);
                    }
                    if create {
                        let fresh = self.cow_replace(entry)?;
                        chunk.write_u64(word, fresh.index().0);
                        chunk = fresh;
                    } else {
                        chunk = self.store.get_chunk(ChunkIndex(entry))?;
                    }
                    remaining %= page_span;
                }
                return Ok(Some(chunk));
            }
            k -= region_span;
            base += slots as usize;
            span *= fan_out;
        }

        if create {
            return Err(FsError::OutOfRange {
                index: chunk_number,
                limit: self.chunk_capacity(),
            });
        }
        Ok(None)
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the count.
    ///
    /// Reads are clamped to `file_size`; a start at or past it reads 0
    /// bytes; holes read back as zeros.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut rec = self.data.lock();
        if offset >= rec.size {
            return Ok(0);
        }
        let chunk_size = u64::from(self.store.chunk_size().get());
        let available = rec.size - offset;
        let n = if (buf.len() as u64) < available {
            buf.len()
        } else {
            available as usize
        };

        let mut done = 0_usize;
        let mut pos = offset;
        while done < n {
            let in_chunk = (pos % chunk_size) as usize;
            let take = (chunk_size as usize - in_chunk).min(n - done);
            let slice = &mut buf[done..done + take];
            match self.resolve_locked(&mut rec, pos / chunk_size, false)? {
                Some(chunk) => chunk.read_at(in_chunk, slice),
                None => slice.fill(0),
            }
            done += take;
            pos += take as u64;
        }
        Ok(n)
    }

    /// Write `buf` at `offset`, returning the count written.
    ///
    /// Runs the cleaner first when the free-segment count is at or below a
    /// quarter of the segment count. On a capacity error mid-write the
    /// file size is advanced over the bytes that did commit before the
    /// error propagates.
    pub fn write(&self, offset: u64, buf: &[u8], now_ms: u64) -> Result<usize> {
        // Cleaner entry happens before the record lock is taken; the pass
        // relocates other inodes and must be able to lock their records.
        if self.seg.needs_clean() {
            if let Some(table) = self.table.upgrade() {
                self.seg.clean(table.as_ref())?;
            }
        }

        let mut rec = self.data.lock();
        let chunk_size = u64::from(self.store.chunk_size().get());
        let n = buf.len();
        let mut done = 0_usize;
        let mut pos = offset;

        let outcome = loop {
            if done >= n {
                break Ok(());
            }
            let in_chunk = (pos % chunk_size) as usize;
            let take = (chunk_size as usize - in_chunk).min(n - done);
            match self.resolve_locked(&mut rec, pos / chunk_size, true) {
                Ok(Some(chunk)) => {
                    chunk.write_at(in_chunk, &buf[done..done + take]);
                    done += take;
                    pos += take as u64;
                }
                Ok(None) => {
                    break Err(FsError::Invariant(format!(
                        "creating resolve returned a hole for inode {}",
                        self.index
                    )));
                }
                Err(err) => break Err(err),
            }
        };

        let committed_end = offset + done as u64;
        if committed_end > rec.size {
            rec.size = committed_end;
        }
        if done > 0 {
            Self::touch_mtime(&mut rec, now_ms);
        }
        outcome.map(|()| n)
    }

    /// Free every chunk this inode references: data chunks and the
    /// indirect pages that point at them, in post-order.
    pub fn release_chunks(&self) -> Result<()> {
        let mut rec = self.data.lock();
        let mut base = 0_usize;
        for (level, &slots) in REGION_SLOTS.iter().enumerate() {
            for slot in 0..slots as usize {
                let entry = rec.addresses[base + slot];
                if entry != 0 {
                    self.release_tree(ChunkIndex(entry), level)?;
                    rec.addresses[base + slot] = 0;
                }
            }
            base += slots as usize;
        }
        rec.size = 0;
        debug!(
            target: "silt::inode",
            event = "chunks_released",
            inode = self.index.0
        );
        Ok(())
    }

    fn release_tree(&self, index: ChunkIndex, level: usize) -> Result<()> {
        if level > 0 {
            let words: Vec<u64> = {
                let page = self.store.get_chunk(index)?;
                let raw = page.to_vec();
                raw.chunks_exact(8)
                    .map(|bytes| u64::from_ne_bytes(bytes.try_into().unwrap_or([0; 8])))
                    .collect()
            };
            for child in words.into_iter().filter(|&word| word != 0) {
                self.release_tree(ChunkIndex(child), level - 1)?;
            }
        }
        let handle = self.store.get_chunk(index)?;
        self.seg.free_chunk(handle)
    }

    /// Rewrite every stored chunk index present in `moves`.
    ///
    /// Indirect pages are loaded and patched in place; a page whose own
    /// index moved is chased at its new location.
    pub fn update_chunk_locations(&self, moves: &HashMap<ChunkIndex, ChunkIndex>) -> Result<()> {
        let mut rec = self.data.lock();
        let mut base = 0_usize;
        for (level, &slots) in REGION_SLOTS.iter().enumerate() {
            for slot in 0..slots as usize {
                let entry = rec.addresses[base + slot];
                if entry != 0 {
                    rec.addresses[base + slot] =
                        self.remap_tree(ChunkIndex(entry), level, moves)?.0;
                }
            }
            base += slots as usize;
        }
        Ok(())
    }

    fn remap_tree(
        &self,
        index: ChunkIndex,
        level: usize,
        moves: &HashMap<ChunkIndex, ChunkIndex>,
    ) -> Result<ChunkIndex> {
        let mapped = moves.get(&index).copied().unwrap_or(index);
        if level > 0 {
            let page = self.store.get_chunk(mapped)?;
            let words = page.len() / 8;
            for word in 0..words {
                let entry = page.read_u64(word);
                if entry != 0 {
                    let new = self.remap_tree(ChunkIndex(entry), level - 1, moves)?;
                    if new.0 != entry {
                        page.write_u64(word, new.0);
                    }
                }
            }
        }
        Ok(mapped)
    }
}

// ── Inode table ─────────────────────────────────────────────────────────────

struct TableInner {
    used: ChunkBitmap,
    cache: HashMap<u64, Weak<Inode>>,
}

/// Used-inode bitmap plus the ilist, with an in-memory handle cache.
///
/// A cached inode is mirrored to the ilist by [`update`] before any reader
/// can load the same slot from disk: `get` always prefers the cache.
///
/// [`update`]: InodeTable::update
pub struct InodeTable {
    store: Arc<ChunkStore>,
    seg: Arc<SegmentController>,
    table_offset: u64,
    ilist_offset: u64,
    inode_count: u64,
    inodes_per_chunk: u64,
    size_chunks: u64,
    self_ref: Weak<InodeTable>,
    inner: Mutex<TableInner>,
}

impl std::fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeTable")
            .field("table_offset", &self.table_offset)
            .field("inode_count", &self.inode_count)
            .finish_non_exhaustive()
    }
}

impl InodeTable {
    /// Chunks a table with `inode_count` slots occupies (bitmap + ilist).
    #[must_use]
    pub fn size_chunks_for(inode_count: u64, chunk_size: silt_types::ChunkSize) -> u64 {
        let bitmap = ChunkBitmap::size_chunks_for(inode_count, chunk_size);
        let per_chunk = u64::from(chunk_size.get()) / INODE_RECORD_SIZE as u64;
        bitmap + inode_count / per_chunk + 1
    }

    /// Open (or adopt at format time) the table at `table_offset`.
    pub fn open(
        store: Arc<ChunkStore>,
        seg: Arc<SegmentController>,
        table_offset: u64,
        inode_count: u64,
    ) -> Result<Arc<Self>> {
        let chunk_size = store.chunk_size();
        let inodes_per_chunk = u64::from(chunk_size.get()) / INODE_RECORD_SIZE as u64;
        let used = ChunkBitmap::open(&store, ChunkIndex(table_offset), inode_count)?;
        let bitmap_chunks = used.size_chunks();
        let ilist_offset = table_offset + bitmap_chunks;
        let size_chunks = bitmap_chunks + inode_count / inodes_per_chunk + 1;

        Ok(Arc::new_cyclic(|self_ref| Self {
            store,
            seg,
            table_offset,
            ilist_offset,
            inode_count,
            inodes_per_chunk,
            size_chunks,
            self_ref: self_ref.clone(),
            inner: Mutex::new(TableInner {
                used,
                cache: HashMap::new(),
            }),
        }))
    }

    #[must_use]
    pub fn size_chunks(&self) -> u64 {
        self.size_chunks
    }

    #[must_use]
    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    #[must_use]
    pub fn inode_count(&self) -> u64 {
        self.inode_count
    }

    /// Format the table: no inode is live, except the reserved slot 0.
    pub fn format(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.used.clear_all();
        inner.used.set(InodeIndex::RESERVED.0)?;
        Ok(())
    }

    fn check_bounds(&self, index: InodeIndex) -> Result<()> {
        if index.0 >= self.inode_count {
            return Err(FsError::OutOfRange {
                index: index.0,
                limit: self.inode_count,
            });
        }
        Ok(())
    }

    fn new_handle(&self, index: InodeIndex, record: InodeRecord) -> Arc<Inode> {
        Arc::new(Inode {
            index,
            store: Arc::clone(&self.store),
            seg: Arc::clone(&self.seg),
            table: self.self_ref.clone(),
            data: Mutex::new(record),
        })
    }

    fn ilist_location(&self, index: InodeIndex) -> (ChunkIndex, usize) {
        let chunk = self.ilist_offset + index.0 / self.inodes_per_chunk;
        let offset = (index.0 % self.inodes_per_chunk) as usize * INODE_RECORD_SIZE;
        (ChunkIndex(chunk), offset)
    }

    /// Allocate a fresh inode at the first clear bit.
    ///
    /// The record reaches the ilist on the first [`update`]; until then it
    /// exists only in the cache.
    ///
    /// [`update`]: InodeTable::update
    pub fn alloc(&self) -> Result<Arc<Inode>> {
        let mut inner = self.inner.lock();
        let run = inner.used.find_unset_run(1).ok_or(FsError::NoSpace)?;
        let index = InodeIndex(run.start);
        inner.used.set(index.0)?;

        let inode = self.new_handle(index, InodeRecord::default());
        inner.cache.insert(index.0, Arc::downgrade(&inode));
        trace!(target: "silt::inode", event = "inode_alloc", inode = index.0);
        Ok(inode)
    }

    /// Fetch a live inode, preferring the cached handle.
    pub fn get(&self, index: InodeIndex) -> Result<Arc<Inode>> {
        self.check_bounds(index)?;
        let mut inner = self.inner.lock();
        if !inner.used.get(index.0)? {
            return Err(FsError::Invariant(format!(
                "inode {index} is not live"
            )));
        }
        if let Some(inode) = inner.cache.get(&index.0).and_then(Weak::upgrade) {
            return Ok(inode);
        }

        let (chunk_idx, offset) = self.ilist_location(index);
        let chunk = self.store.get_chunk(chunk_idx)?;
        let mut raw = [0_u8; INODE_RECORD_SIZE];
        chunk.read_at(offset, &mut raw);
        let inode = self.new_handle(index, InodeRecord::decode(&raw));
        inner.cache.insert(index.0, Arc::downgrade(&inode));
        Ok(inode)
    }

    /// Mirror an inode's in-memory record into its ilist slot.
    pub fn update(&self, inode: &Inode) -> Result<()> {
        self.check_bounds(inode.index())?;
        let inner = self.inner.lock();
        if !inner.used.get(inode.index().0)? {
            return Err(FsError::Invariant(format!(
                "inode {} updated while not live",
                inode.index()
            )));
        }
        drop(inner);

        let (chunk_idx, offset) = self.ilist_location(inode.index());
        let chunk = self.store.get_chunk(chunk_idx)?;
        let raw = inode.data.lock().encode();
        chunk.write_at(offset, &raw);
        Ok(())
    }

    /// Release an inode slot.
    ///
    /// The handed handle must be the only outstanding reference, and the
    /// caller must have released the inode's data chunks already.
    pub fn free(&self, inode: Arc<Inode>) -> Result<()> {
        if Arc::strong_count(&inode) != 1 {
            return Err(FsError::Invariant(format!(
                "inode {} freed while still referenced",
                inode.index()
            )));
        }
        let index = inode.index();
        self.check_bounds(index)?;
        if index == InodeIndex::RESERVED {
            return Err(FsError::Invariant("freeing the reserved inode".into()));
        }

        let mut inner = self.inner.lock();
        inner.cache.remove(&index.0);
        drop(inode);
        inner.used.clear(index.0)?;
        trace!(target: "silt::inode", event = "inode_free", inode = index.0);
        Ok(())
    }

    /// Mirror every live cached inode to the ilist; used at shutdown.
    pub fn flush_all(&self) -> Result<()> {
        let live: Vec<Arc<Inode>> = {
            let mut inner = self.inner.lock();
            inner.cache.retain(|_, weak| weak.strong_count() > 0);
            inner.cache.values().filter_map(Weak::upgrade).collect()
        };
        for inode in live {
            self.update(&inode)?;
        }
        Ok(())
    }
}

impl RelocateOwner for InodeTable {
    fn relocate_chunks(
        &self,
        owner: InodeIndex,
        moves: &HashMap<ChunkIndex, ChunkIndex>,
    ) -> Result<()> {
        let inode = self.get(owner)?;
        inode.update_chunk_locations(moves)?;
        self.update(&inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_block::MemByteDevice;
    use silt_types::{ChunkSize, SegmentIndex};

    const CHUNK: u64 = 4096;

    struct Fixture {
        store: Arc<ChunkStore>,
        seg: Arc<SegmentController>,
        table: Arc<InodeTable>,
    }

    /// Lay out a miniature volume: superblock mirror chunk, inode table,
    /// then `seg_count` segments of `seg_size` chunks.
    fn fixture(inode_count: u64, seg_size: u64, seg_count: u64) -> Fixture {
        let chunk_size = ChunkSize::new(CHUNK as u32).unwrap();
        let table_chunks = InodeTable::size_chunks_for(inode_count, chunk_size);
        let data_offset = 1 + table_chunks;
        let total = data_offset + seg_size * seg_count;

        let dev = Arc::new(MemByteDevice::new((total * CHUNK) as usize));
        let store = Arc::new(ChunkStore::with_device(dev, total, chunk_size).unwrap());
        let seg = Arc::new(
            SegmentController::new(Arc::clone(&store), data_offset, seg_size, seg_count, seg_count)
                .unwrap(),
        );
        seg.clear_all().unwrap();
        let table =
            InodeTable::open(Arc::clone(&store), Arc::clone(&seg), 1, inode_count).unwrap();
        table.format().unwrap();
        Fixture { store, seg, table }
    }

    fn live_chunk_total(seg: &SegmentController) -> u64 {
        (0..seg.segment_count())
            .map(|s| seg.usage_of(SegmentIndex(s)).unwrap())
            .sum()
    }

    #[test]
    fn record_codec_round_trip() {
        let mut rec = InodeRecord {
            uid: 1000,
            gid: 100,
            atime_ms: 1_234_567,
            mtime_ms: 7_654_321,
            size: 99_999,
            addresses: [0; ADDRESS_SLOTS],
            perms: 0o755,
            kind: FileKind::Directory.as_u8(),
        };
        for (slot, address) in rec.addresses.iter_mut().enumerate() {
            *address = 100 + slot as u64;
        }
        let raw = rec.encode();
        assert_eq!(InodeRecord::decode(&raw), rec);
        // Spot-check the layout: size lives at word 4, perms at 0x80.
        assert_eq!(
            u64::from_ne_bytes(raw[0x20..0x28].try_into().unwrap()),
            99_999
        );
        assert_eq!(u16::from_ne_bytes([raw[0x80], raw[0x81]]), 0o755);
    }

    #[test]
    fn record_fits_declared_size() {
        // 5 scalar words + 11 addresses + perms + kind, 8-byte aligned.
        assert_eq!(INODE_RECORD_SIZE, 136);
        assert!(CHUNK as usize / INODE_RECORD_SIZE >= 30);
    }

    #[test]
    fn alloc_skips_reserved_slot() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        assert_eq!(inode.index(), InodeIndex(1));
        let next = fx.table.alloc().unwrap();
        assert_eq!(next.index(), InodeIndex(2));
    }

    #[test]
    fn get_returns_cached_handle() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        let again = fx.table.get(inode.index()).unwrap();
        assert!(Arc::ptr_eq(&inode, &again));
    }

    #[test]
    fn update_persists_through_cache_drop() {
        let fx = fixture(64, 8, 6);
        let index = {
            let inode = fx.table.alloc().unwrap();
            inode.initialize(42, 7, 0o600, FileKind::Regular, 5000);
            fx.table.update(&inode).unwrap();
            inode.index()
        };
        // Handle dropped; the next get must load the ilist slot.
        let reloaded = fx.table.get(index).unwrap();
        let rec = reloaded.record();
        assert_eq!(rec.uid, 42);
        assert_eq!(rec.gid, 7);
        assert_eq!(rec.perms, 0o600);
        assert_eq!(rec.file_kind(), Some(FileKind::Regular));
        assert_eq!(rec.atime_ms, 5000);
    }

    #[test]
    fn get_dead_slot_is_an_invariant_violation() {
        let fx = fixture(64, 8, 6);
        assert!(matches!(
            fx.table.get(InodeIndex(5)),
            Err(FsError::Invariant(_))
        ));
        assert!(matches!(
            fx.table.get(InodeIndex(64)),
            Err(FsError::OutOfRange { .. })
        ));
    }

    #[test]
    fn free_requires_unique_handle() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        let extra = Arc::clone(&inode);
        assert!(matches!(fx.table.free(inode), Err(FsError::Invariant(_))));
        drop(extra);
    }

    #[test]
    fn free_then_alloc_reuses_slot() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        let index = inode.index();
        fx.table.free(inode).unwrap();
        assert!(matches!(fx.table.get(index), Err(FsError::Invariant(_))));

        let again = fx.table.alloc().unwrap();
        assert_eq!(again.index(), index);
    }

    #[test]
    fn write_then_read_round_trip() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        let written = inode.write(0, b"the quick brown fox", 1000).unwrap();
        assert_eq!(written, 19);
        assert_eq!(inode.size(), 19);

        let mut out = vec![0_u8; 19];
        assert_eq!(inode.read(0, &mut out).unwrap(), 19);
        assert_eq!(&out, b"the quick brown fox");
    }

    #[test]
    fn read_clamps_to_file_size() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        inode.write(0, b"abc", 0).unwrap();

        let mut out = vec![0_u8; 16];
        assert_eq!(inode.read(0, &mut out).unwrap(), 3);
        assert_eq!(inode.read(3, &mut out).unwrap(), 0);
        assert_eq!(inode.read(100, &mut out).unwrap(), 0);
    }

    #[test]
    fn sparse_write_reads_zeros_in_hole() {
        let fx = fixture(64, 16, 8);
        let inode = fx.table.alloc().unwrap();
        inode.write(1_000_000, b"end", 0).unwrap();
        assert_eq!(inode.size(), 1_000_003);

        let mut head = vec![0xFF_u8; 10];
        assert_eq!(inode.read(0, &mut head).unwrap(), 10);
        assert_eq!(head, vec![0; 10]);

        let mut tail = vec![0_u8; 3];
        assert_eq!(inode.read(1_000_000, &mut tail).unwrap(), 3);
        assert_eq!(&tail, b"end");
    }

    #[test]
    fn overwrite_is_copy_on_write() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        inode.write(0, b"first", 0).unwrap();
        let before = inode.resolve(0, false).unwrap().unwrap().index();
        let live_before = live_chunk_total(&fx.seg);

        inode.write(0, b"second", 0).unwrap();
        let after = inode.resolve(0, false).unwrap().unwrap().index();
        assert_ne!(before, after, "overwrite must relocate the chunk");
        // The replaced chunk went back to its segment.
        assert_eq!(live_chunk_total(&fx.seg), live_before);

        let mut out = vec![0_u8; 6];
        inode.read(0, &mut out).unwrap();
        assert_eq!(&out, b"second");
    }

    #[test]
    fn write_spanning_direct_and_indirect_regions() {
        let fx = fixture(64, 16, 12);
        let inode = fx.table.alloc().unwrap();
        // Logical chunk 8 is the first single-indirect chunk.
        let offset = 8 * CHUNK - 3;
        inode.write(offset, b"bridging bytes", 0).unwrap();

        let mut out = vec![0_u8; 14];
        assert_eq!(inode.read(offset, &mut out).unwrap(), 14);
        assert_eq!(&out, b"bridging bytes");

        // An indirect page plus a data chunk exist for the tail.
        assert!(inode.resolve(8, false).unwrap().is_some());
        let rec = inode.record();
        assert_ne!(rec.addresses[DIRECT_SLOTS], 0, "single-indirect slot set");
    }

    #[test]
    fn double_indirect_reach() {
        let fx = fixture(64, 16, 12);
        let inode = fx.table.alloc().unwrap();
        let fan_out = CHUNK / 8;
        // First logical chunk of the double-indirect region.
        let chunk_number = 8 + fan_out;
        inode.write(chunk_number * CHUNK, b"deep", 0).unwrap();

        let mut out = vec![0_u8; 4];
        assert_eq!(inode.read(chunk_number * CHUNK, &mut out).unwrap(), 4);
        assert_eq!(&out, b"deep");
        let rec = inode.record();
        assert_ne!(rec.addresses[DIRECT_SLOTS + 1], 0, "double-indirect slot set");
    }

    #[test]
    fn partial_write_commits_prefix_on_no_space() {
        let fx = fixture(64, 4, 5);
        let inode = fx.table.alloc().unwrap();
        // 5 segments of 3 data chunks; a 17-chunk write cannot fit once
        // COW churn on the indirect page is paid for.
        let big = vec![0xAB_u8; (17 * CHUNK) as usize];
        let err = inode.write(0, &big, 0).unwrap_err();
        assert!(matches!(err, FsError::NoSpace));

        let size = inode.size();
        assert!(size > 0, "some prefix must have committed");
        assert!(size < big.len() as u64);
        // The committed prefix reads back intact.
        let mut out = vec![0_u8; size as usize];
        assert_eq!(inode.read(0, &mut out).unwrap(), size as usize);
        assert!(out.iter().all(|&byte| byte == 0xAB));
    }

    #[test]
    fn release_chunks_returns_everything() {
        let fx = fixture(64, 16, 12);
        let inode = fx.table.alloc().unwrap();
        let payload = vec![0x5A_u8; (10 * CHUNK) as usize];
        inode.write(0, &payload, 0).unwrap();
        assert!(live_chunk_total(&fx.seg) > 10, "indirect pages also live");

        inode.release_chunks().unwrap();
        assert_eq!(live_chunk_total(&fx.seg), 0);
        assert_eq!(fx.seg.free_segments(), fx.seg.segment_count());
        let rec = inode.record();
        assert!(rec.addresses.iter().all(|&address| address == 0));
    }

    #[test]
    fn update_chunk_locations_rewrites_leaves() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        inode.write(0, b"movable", 0).unwrap();
        let old = inode.resolve(0, false).unwrap().unwrap();
        let old_idx = old.index();

        // Copy the chunk to a fresh location by hand and remap.
        let new_idx = fx.seg.allocate(inode.index()).unwrap();
        let fresh = fx.store.get_chunk(new_idx).unwrap();
        fresh.copy_from(&old);
        drop((old, fresh));

        let mut moves = HashMap::new();
        moves.insert(old_idx, new_idx);
        inode.update_chunk_locations(&moves).unwrap();

        let resolved = inode.resolve(0, false).unwrap().unwrap();
        assert_eq!(resolved.index(), new_idx);
        let mut out = vec![0_u8; 7];
        drop(resolved);
        inode.read(0, &mut out).unwrap();
        assert_eq!(&out, b"movable");
    }

    #[test]
    fn flush_all_mirrors_cached_records() {
        let fx = fixture(64, 8, 6);
        let inode = fx.table.alloc().unwrap();
        inode.initialize(9, 9, 0o640, FileKind::Regular, 77);
        inode.write(0, b"payload", 77).unwrap();
        fx.table.flush_all().unwrap();

        // Read the raw ilist slot back and compare.
        let (chunk_idx, offset) = fx.table.ilist_location(inode.index());
        let chunk = fx.store.get_chunk(chunk_idx).unwrap();
        let mut raw = [0_u8; INODE_RECORD_SIZE];
        chunk.read_at(offset, &mut raw);
        let rec = InodeRecord::decode(&raw);
        assert_eq!(rec.uid, 9);
        assert_eq!(rec.size, 7);
    }
}
