#![forbid(unsafe_code)]
//! Volume lifecycle and the filesystem operation surface.
//!
//! The superblock at chunk 0 records the whole layout: block map, inode
//! table, data region geometry, root inode, and the live free-segment
//! count. `SuperBlock::init` lays a fresh volume out; `SuperBlock::load`
//! rebuilds the views from the header and refuses anything inconsistent.
//!
//! `Filesystem` is the surface the mount bridge calls: path resolution,
//! create/unlink/rmdir, byte-level read/write, readdir, and attributes.
//! One operation lock serializes user-visible operations. Most paths
//! below it take the inode table, then the segment controller, then the
//! chunk cache; the cleaner inverts that, re-entering the inode table
//! with the controller lock held, and it is the operation lock that
//! keeps the inversion from deadlocking.

use parking_lot::Mutex;
use serde::Serialize;
use silt_alloc::ChunkBitmap;
use silt_block::{ChunkHandle, ChunkStore};
use silt_dir::{DirEntry, Directory};
use silt_error::{FsError, Result};
use silt_inode::{Inode, InodeRecord, InodeTable, INODE_RECORD_SIZE};
use silt_seg::SegmentController;
use silt_types::{
    ChunkIndex, FileKind, InodeIndex, CHUNK_ADDRESS_BYTES, FREE_SEGMENT_WORD, MIN_DISK_CHUNKS,
    MIN_SEGMENT_COUNT, NAME_MAX, PERM_MASK, SUPERBLOCK_CHUNK_COUNT, S_IRGRP, S_IROTH, S_IRUSR,
    S_IWGRP, S_IWOTH, S_IWUSR, S_IXGRP, S_IXOTH, S_IXUSR,
};
use std::sync::Arc;
use tracing::{debug, info};

// ── Superblock header ───────────────────────────────────────────────────────

/// The serialized root record at chunk 0: fourteen native-endian words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuperBlockHeader {
    pub superblock_chunks: u64,
    pub disk_bytes: u64,
    pub disk_chunks: u64,
    pub chunk_size: u64,
    pub block_map_offset: u64,
    pub block_map_chunks: u64,
    pub inode_table_offset: u64,
    pub inode_table_chunks: u64,
    pub inode_count: u64,
    pub data_offset: u64,
    pub segment_size: u64,
    pub segment_count: u64,
    pub root_inode: u64,
    pub free_segments: u64,
}

impl SuperBlockHeader {
    fn write_to(&self, chunk: &ChunkHandle) {
        let words = [
            self.superblock_chunks,
            self.disk_bytes,
            self.disk_chunks,
            self.chunk_size,
            self.block_map_offset,
            self.block_map_chunks,
            self.inode_table_offset,
            self.inode_table_chunks,
            self.inode_count,
            self.data_offset,
            self.segment_size,
            self.segment_count,
            self.root_inode,
            self.free_segments,
        ];
        for (word, value) in words.into_iter().enumerate() {
            chunk.write_u64(word, value);
        }
    }

    fn read_from(chunk: &ChunkHandle) -> Self {
        Self {
            superblock_chunks: chunk.read_u64(0),
            disk_bytes: chunk.read_u64(1),
            disk_chunks: chunk.read_u64(2),
            chunk_size: chunk.read_u64(3),
            block_map_offset: chunk.read_u64(4),
            block_map_chunks: chunk.read_u64(5),
            inode_table_offset: chunk.read_u64(6),
            inode_table_chunks: chunk.read_u64(7),
            inode_count: chunk.read_u64(8),
            data_offset: chunk.read_u64(9),
            segment_size: chunk.read_u64(10),
            segment_count: chunk.read_u64(11),
            root_inode: chunk.read_u64(12),
            free_segments: chunk.read_u64(FREE_SEGMENT_WORD),
        }
    }
}

/// Read just the header of a volume, without assembling the views.
pub fn read_header(store: &ChunkStore) -> Result<SuperBlockHeader> {
    let chunk = store.get_chunk(ChunkIndex(0))?;
    Ok(SuperBlockHeader::read_from(&chunk))
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// An assembled volume: the store plus the views the header describes.
pub struct SuperBlock {
    store: Arc<ChunkStore>,
    header: SuperBlockHeader,
    block_map: ChunkBitmap,
    table: Arc<InodeTable>,
    seg: Arc<SegmentController>,
    root: InodeIndex,
}

impl std::fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperBlock")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl SuperBlock {
    /// Format a fresh volume.
    ///
    /// Lays out, in chunk order: this header, the block map, the inode
    /// table, a one-chunk margin, then the segmented data region. Marks
    /// every metadata chunk used in the block map, formats the segment
    /// controller, creates the root directory, and serializes the header.
    pub fn init(store: Arc<ChunkStore>, inode_fraction: f64) -> Result<Self> {
        let chunk_size = store.chunk_size();
        let disk_chunks = store.chunk_count();

        if !(0.0..1.0).contains(&inode_fraction) {
            return Err(FsError::InvalidArgument(
                "inode fraction must lie in [0, 1)",
            ));
        }
        #[allow(clippy::cast_precision_loss)]
        let data_share = disk_chunks as f64 * (1.0 - inode_fraction);
        if disk_chunks < MIN_DISK_CHUNKS || data_share < MIN_DISK_CHUNKS as f64 {
            return Err(FsError::InvalidArgument(
                "volume too small for the metadata layout",
            ));
        }

        let mut offset = SUPERBLOCK_CHUNK_COUNT;

        let block_map = ChunkBitmap::open(&store, ChunkIndex(offset), disk_chunks)?;
        block_map.clear_all();
        let block_map_offset = offset;
        offset += block_map.size_chunks();

        let inodes_per_chunk = u64::from(chunk_size.get()) / INODE_RECORD_SIZE as u64;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let inode_count = (inode_fraction * disk_chunks as f64) as u64 * inodes_per_chunk;
        if inode_count < 2 {
            return Err(FsError::InvalidArgument(
                "inode fraction yields fewer than two inodes",
            ));
        }
        let inode_table_offset = offset;
        let inode_table_chunks = InodeTable::size_chunks_for(inode_count, chunk_size);
        offset += inode_table_chunks;

        // One spare chunk between the metadata and the data region.
        offset += 1;

        for bit in 0..offset {
            block_map.set(bit)?;
        }
        let data_offset = offset;

        // Halve the segment size until enough segments fit.
        let data_chunks = disk_chunks
            .checked_sub(data_offset + 1)
            .ok_or(FsError::InvalidArgument("metadata layout exceeds the volume"))?;
        let fan_out = u64::from(chunk_size.get()) / CHUNK_ADDRESS_BYTES;
        let mut segment_size = 2 * fan_out;
        let mut segment_count = 0_u64;
        while segment_count < MIN_SEGMENT_COUNT {
            segment_size /= 2;
            if segment_size < 2 {
                return Err(FsError::InvalidArgument(
                    "data region too small to segment",
                ));
            }
            segment_count = data_chunks / segment_size;
        }
        if segment_count == 0 {
            return Err(FsError::InvalidArgument("no segments fit the data region"));
        }

        let seg = Arc::new(SegmentController::new(
            Arc::clone(&store),
            data_offset,
            segment_size,
            segment_count,
            segment_count,
        )?);
        let table = InodeTable::open(
            Arc::clone(&store),
            Arc::clone(&seg),
            inode_table_offset,
            inode_count,
        )?;
        table.format()?;
        seg.clear_all()?;

        // Root directory: `.` and `..` both point at the root inode.
        let root = table.alloc()?;
        root.initialize(0, 0, 0o755, FileKind::Directory, 0);
        let root_index = root.index();
        {
            let dir = Directory::new(Arc::clone(&root));
            dir.add(".", root_index, 0)?;
            dir.add("..", root_index, 0)?;
        }
        table.update(&root)?;
        drop(root);

        let header = SuperBlockHeader {
            superblock_chunks: SUPERBLOCK_CHUNK_COUNT,
            disk_bytes: store.size_bytes(),
            disk_chunks,
            chunk_size: u64::from(chunk_size.get()),
            block_map_offset,
            block_map_chunks: block_map.size_chunks(),
            inode_table_offset,
            inode_table_chunks,
            inode_count,
            data_offset,
            segment_size,
            segment_count,
            root_inode: root_index.0,
            free_segments: seg.free_segments(),
        };
        let sb_chunk = store.get_chunk(ChunkIndex(0))?;
        header.write_to(&sb_chunk);
        sb_chunk.flush()?;
        drop(sb_chunk);

        info!(
            target: "silt::core",
            event = "volume_init",
            disk_chunks,
            inode_count,
            data_offset,
            segment_size,
            segment_count
        );

        Ok(Self {
            store,
            header,
            block_map,
            table,
            seg,
            root: root_index,
        })
    }

    /// Reassemble a volume from its header.
    ///
    /// The format-fixed words must match the store exactly, and every
    /// chunk below the data offset must be marked used in the block map;
    /// any mismatch means the volume is corrupted.
    pub fn load(store: Arc<ChunkStore>) -> Result<Self> {
        let header = read_header(&store)?;

        if header.superblock_chunks != SUPERBLOCK_CHUNK_COUNT {
            return Err(FsError::Corrupted(format!(
                "superblock spans {} chunks, expected {SUPERBLOCK_CHUNK_COUNT}",
                header.superblock_chunks
            )));
        }
        if header.disk_bytes != store.size_bytes() {
            return Err(FsError::Corrupted(format!(
                "header says {} bytes, store holds {}",
                header.disk_bytes,
                store.size_bytes()
            )));
        }
        if header.disk_chunks != store.chunk_count() {
            return Err(FsError::Corrupted(format!(
                "header says {} chunks, store holds {}",
                header.disk_chunks,
                store.chunk_count()
            )));
        }
        if header.chunk_size != u64::from(store.chunk_size().get()) {
            return Err(FsError::Corrupted(format!(
                "header chunk size {} does not match {}",
                header.chunk_size,
                store.chunk_size()
            )));
        }

        let block_map = ChunkBitmap::open(
            &store,
            ChunkIndex(header.block_map_offset),
            header.disk_chunks,
        )?;
        if block_map.size_chunks() != header.block_map_chunks {
            return Err(FsError::Corrupted(
                "block map geometry disagrees with the header".into(),
            ));
        }

        let seg = Arc::new(SegmentController::new(
            Arc::clone(&store),
            header.data_offset,
            header.segment_size,
            header.segment_count,
            header.free_segments,
        )?);
        let table = InodeTable::open(
            Arc::clone(&store),
            Arc::clone(&seg),
            header.inode_table_offset,
            header.inode_count,
        )?;
        if table.size_chunks() != header.inode_table_chunks {
            return Err(FsError::Corrupted(
                "inode table geometry disagrees with the header".into(),
            ));
        }

        for bit in 0..header.data_offset {
            if !block_map.get(bit)? {
                return Err(FsError::Corrupted(format!(
                    "metadata chunk {bit} is not marked used in the block map"
                )));
            }
        }

        // Nothing is rewritten on load; just pick a fresh write segment.
        seg.reset_write_segment()?;

        debug!(target: "silt::core", event = "volume_load", root = header.root_inode);
        let root = InodeIndex(header.root_inode);
        Ok(Self {
            store,
            header,
            block_map,
            table,
            seg,
            root,
        })
    }

    #[must_use]
    pub fn header(&self) -> &SuperBlockHeader {
        &self.header
    }

    #[must_use]
    pub fn root(&self) -> InodeIndex {
        self.root
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    #[must_use]
    pub fn table(&self) -> &Arc<InodeTable> {
        &self.table
    }

    #[must_use]
    pub fn segments(&self) -> &Arc<SegmentController> {
        &self.seg
    }

    #[must_use]
    pub fn block_map(&self) -> &ChunkBitmap {
        &self.block_map
    }

    /// Push all cached state to the device: cached inode records to the
    /// ilist, then a device sync.
    pub fn flush(&self) -> Result<()> {
        self.table.flush_all()?;
        self.store.sync()
    }
}

// ── Permissions ─────────────────────────────────────────────────────────────

/// Caller identity and clock for one operation.
///
/// The core keeps no clock of its own; wall time arrives from the caller
/// in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpContext {
    pub uid: u64,
    pub gid: u64,
    pub now_ms: u64,
}

#[must_use]
pub fn can_read(ctx: &OpContext, rec: &InodeRecord) -> bool {
    if ctx.uid == 0 {
        return true;
    }
    rec.perms & S_IROTH != 0
        || (rec.uid == ctx.uid && rec.perms & S_IRUSR != 0)
        || (rec.gid == ctx.gid && rec.perms & S_IRGRP != 0)
}

#[must_use]
pub fn can_write(ctx: &OpContext, rec: &InodeRecord) -> bool {
    if ctx.uid == 0 {
        return true;
    }
    rec.perms & S_IWOTH != 0
        || (rec.uid == ctx.uid && rec.perms & S_IWUSR != 0)
        || (rec.gid == ctx.gid && rec.perms & S_IWGRP != 0)
}

#[must_use]
pub fn can_exec(ctx: &OpContext, rec: &InodeRecord) -> bool {
    rec.perms & S_IXOTH != 0
        || (rec.uid == ctx.uid && rec.perms & S_IXUSR != 0)
        || (rec.gid == ctx.gid && rec.perms & S_IXGRP != 0)
}

// ── Attributes ──────────────────────────────────────────────────────────────

/// Stat-shaped view of one inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attr {
    pub inode: u64,
    pub kind: FileKind,
    pub perms: u16,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub atime_ms: u64,
    pub mtime_ms: u64,
}

// ── Path handling ───────────────────────────────────────────────────────────

/// Split an absolute path into (parent path, final name).
fn split_path(path: &str) -> Result<(&str, &str)> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument("paths must be absolute"));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument("the root has no parent entry"));
    }
    let cut = trimmed.rfind('/').unwrap_or(0);
    let (parent, name) = trimmed.split_at(cut);
    let parent = if parent.is_empty() { "/" } else { parent };
    Ok((parent, &name[1..]))
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// The operation surface handed to the mount bridge.
pub struct Filesystem {
    sb: SuperBlock,
    op_lock: Mutex<()>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("superblock", &self.sb)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Format a store and mount the fresh volume.
    pub fn format(store: Arc<ChunkStore>, inode_fraction: f64) -> Result<Self> {
        Ok(Self {
            sb: SuperBlock::init(store, inode_fraction)?,
            op_lock: Mutex::new(()),
        })
    }

    /// Mount an existing volume.
    pub fn open(store: Arc<ChunkStore>) -> Result<Self> {
        Ok(Self {
            sb: SuperBlock::load(store)?,
            op_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    fn kind_of(inode: &Inode) -> Result<FileKind> {
        inode.kind().ok_or_else(|| {
            FsError::Invariant(format!("inode {} has an invalid type tag", inode.index()))
        })
    }

    fn resolve_locked(&self, path: &str) -> Result<Arc<Inode>> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument("paths must be absolute"));
        }
        let mut inode = self.sb.table.get(self.sb.root)?;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            if segment.len() > NAME_MAX {
                return Err(FsError::NameTooLong);
            }
            if Self::kind_of(&inode)? != FileKind::Directory {
                return Err(FsError::NotDirectory);
            }
            let dir = Directory::new(inode);
            let entry = dir.get(segment)?.ok_or(FsError::NotFound)?;
            inode = self.sb.table.get(entry.inode)?;
        }
        Ok(inode)
    }

    /// Walk `path` from the root to an inode handle.
    pub fn resolve(&self, path: &str) -> Result<Arc<Inode>> {
        let _guard = self.op_lock.lock();
        self.resolve_locked(path)
    }

    /// Create a regular file or directory at `path`.
    ///
    /// Directories are born holding `.` and `..`. A failure after the
    /// inode allocation releases the inode again.
    pub fn create(
        &self,
        path: &str,
        perms: u16,
        kind: FileKind,
        ctx: &OpContext,
    ) -> Result<Arc<Inode>> {
        let _guard = self.op_lock.lock();
        let (parent_path, name) = split_path(path)?;
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }

        let parent = self.resolve_locked(parent_path)?;
        if Self::kind_of(&parent)? != FileKind::Directory {
            return Err(FsError::NotDirectory);
        }
        if !can_write(ctx, &parent.record()) {
            return Err(FsError::PermissionDenied);
        }
        let parent_dir = Directory::new(Arc::clone(&parent));
        if parent_dir.get(name)?.is_some() {
            return Err(FsError::Exists);
        }

        let inode = self.sb.table.alloc()?;
        inode.initialize(ctx.uid, ctx.gid, perms & PERM_MASK, kind, ctx.now_ms);

        let wired = (|| -> Result<()> {
            if kind == FileKind::Directory {
                let dir = Directory::new(Arc::clone(&inode));
                dir.add(".", inode.index(), ctx.now_ms)?;
                dir.add("..", parent.index(), ctx.now_ms)?;
            }
            parent_dir.add(name, inode.index(), ctx.now_ms)?;
            self.sb.table.update(&inode)?;
            self.sb.table.update(&parent)?;
            Ok(())
        })();

        if let Err(err) = wired {
            // Roll the allocation back as far as possible.
            let _ = inode.release_chunks();
            let _ = self.sb.table.free(inode);
            return Err(err);
        }

        debug!(
            target: "silt::core",
            event = "create",
            path,
            inode = inode.index().0,
            kind = kind.as_u8()
        );
        Ok(inode)
    }

    /// Read up to `n` bytes at `offset`.
    pub fn read(&self, inode: &Inode, offset: u64, n: usize) -> Result<Vec<u8>> {
        let _guard = self.op_lock.lock();
        let mut out = vec![0_u8; n];
        let got = inode.read(offset, &mut out)?;
        out.truncate(got);
        Ok(out)
    }

    /// Write `data` at `offset`, returning the byte count on success.
    pub fn write(&self, inode: &Inode, offset: u64, data: &[u8], ctx: &OpContext) -> Result<usize> {
        let _guard = self.op_lock.lock();
        let written = inode.write(offset, data, ctx.now_ms);
        // The record changed (size, mtime) even on a partial write.
        self.sb.table.update(inode)?;
        written
    }

    /// Remove a regular file.
    pub fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
        let _guard = self.op_lock.lock();
        let (parent_path, name) = split_path(path)?;

        let parent = self.resolve_locked(parent_path)?;
        let parent_dir = Directory::new(Arc::clone(&parent));
        let entry = parent_dir.get(name)?.ok_or(FsError::NotFound)?;
        let child = self.sb.table.get(entry.inode)?;

        if Self::kind_of(&child)? == FileKind::Directory {
            return Err(FsError::IsDirectory);
        }
        if !can_write(ctx, &child.record()) {
            return Err(FsError::PermissionDenied);
        }

        parent_dir
            .remove(name, ctx.now_ms)?
            .ok_or(FsError::NotFound)?;
        child.release_chunks()?;
        self.sb.table.update(&parent)?;
        self.sb.table.free(child)?;
        debug!(target: "silt::core", event = "unlink", path);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str, ctx: &OpContext) -> Result<()> {
        let _guard = self.op_lock.lock();
        let (parent_path, name) = split_path(path)?;
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument("cannot remove `.` or `..`"));
        }

        let parent = self.resolve_locked(parent_path)?;
        if !can_write(ctx, &parent.record()) {
            return Err(FsError::PermissionDenied);
        }
        let parent_dir = Directory::new(Arc::clone(&parent));
        let entry = parent_dir.get(name)?.ok_or(FsError::NotFound)?;
        let child = self.sb.table.get(entry.inode)?;

        if Self::kind_of(&child)? != FileKind::Directory {
            return Err(FsError::NotDirectory);
        }
        let occupied = Directory::new(Arc::clone(&child))
            .entries()?
            .into_iter()
            .any(|entry| entry.name != "." && entry.name != "..");
        if occupied {
            return Err(FsError::NotEmpty);
        }

        parent_dir
            .remove(name, ctx.now_ms)?
            .ok_or(FsError::NotFound)?;
        child.release_chunks()?;
        self.sb.table.update(&parent)?;
        self.sb.table.free(child)?;
        debug!(target: "silt::core", event = "rmdir", path);
        Ok(())
    }

    /// List a directory's live entries.
    pub fn readdir(&self, inode: &Arc<Inode>, ctx: &OpContext) -> Result<Vec<DirEntry>> {
        let _guard = self.op_lock.lock();
        if Self::kind_of(inode)? != FileKind::Directory {
            return Err(FsError::NotDirectory);
        }
        if !can_read(ctx, &inode.record()) {
            return Err(FsError::PermissionDenied);
        }
        Directory::new(Arc::clone(inode)).entries()
    }

    /// Stat-shaped attributes for an inode.
    pub fn getattr(&self, inode: &Inode) -> Result<Attr> {
        let _guard = self.op_lock.lock();
        let rec = inode.record();
        Ok(Attr {
            inode: inode.index().0,
            kind: Self::kind_of(inode)?,
            perms: rec.perms,
            uid: rec.uid,
            gid: rec.gid,
            size: rec.size,
            atime_ms: rec.atime_ms,
            mtime_ms: rec.mtime_ms,
        })
    }

    /// Overwrite both stored timestamps.
    pub fn setattr(&self, inode: &Inode, atime_ms: u64, mtime_ms: u64, ctx: &OpContext) -> Result<()> {
        let _guard = self.op_lock.lock();
        if !can_write(ctx, &inode.record()) {
            return Err(FsError::PermissionDenied);
        }
        inode.set_times(atime_ms, mtime_ms);
        self.sb.table.update(inode)
    }

    /// Flush cached state and tear the volume down.
    ///
    /// All externally held inode handles must be dropped first; a live
    /// chunk handle fails the close.
    pub fn close(self) -> Result<()> {
        self.sb.flush()?;
        let store = Arc::clone(&self.sb.store);
        drop(self);
        store.close()
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        // Best effort for abandoned instances; `close` is the real path.
        let _ = self.sb.table.flush_all();
    }
}
