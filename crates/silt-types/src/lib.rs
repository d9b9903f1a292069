#![forbid(unsafe_code)]
//! Core index types and layout constants for SiltFS.
//!
//! Unit-carrying newtypes (`ChunkIndex`, `SegmentIndex`, `InodeIndex`) keep
//! chunk numbers, segment numbers, and ilist slots from being mixed up at
//! call sites, and `ChunkSize` is validated once at construction so the rest
//! of the workspace can rely on it being a power of two.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of one on-disk chunk address in bytes.
pub const CHUNK_ADDRESS_BYTES: u64 = 8;

/// The superblock header always occupies exactly one chunk.
pub const SUPERBLOCK_CHUNK_COUNT: u64 = 1;

/// Number of u64 words in the serialized superblock header.
pub const SUPERBLOCK_WORD_COUNT: usize = 14;

/// Header word holding the live free-segment count.
///
/// The segment controller rewrites this word on every free-count
/// transition so a reload sees an up-to-date value.
pub const FREE_SEGMENT_WORD: usize = 13;

/// Formatting halves the segment size until at least this many segments fit.
pub const MIN_SEGMENT_COUNT: u64 = 20;

/// Smallest disk, in chunks, that can hold the metadata layout.
pub const MIN_DISK_CHUNKS: u64 = 16;

/// Directory names are stored and compared up to this many bytes.
pub const NAME_MAX: usize = 255;

/// Default chunk size used by the format tool.
pub const DEFAULT_CHUNK_SIZE: u32 = 4096;

// ── Index newtypes ──────────────────────────────────────────────────────────

/// 0-based chunk number within the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkIndex(pub u64);

/// 0-based segment number within the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentIndex(pub u64);

/// 0-based slot in the inode list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeIndex(pub u64);

impl InodeIndex {
    /// Slot 0 is reserved at format time: the segment reverse map stores
    /// owning inode indices directly and uses 0 for "free slot".
    pub const RESERVED: Self = Self(0);
}

impl ChunkIndex {
    /// Add a chunk count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Byte offset of this chunk for the given chunk size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn byte_offset(self, chunk_size: ChunkSize) -> Option<u64> {
        self.0.checked_mul(u64::from(chunk_size.get()))
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Chunk size ──────────────────────────────────────────────────────────────

/// Validated chunk size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkSize(u32);

impl ChunkSize {
    /// Create a `ChunkSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, InvalidChunkSize> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(InvalidChunkSize(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of u64 chunk addresses that fit in one chunk — the fan-out of
    /// an indirect page.
    #[must_use]
    pub fn fan_out(self) -> u64 {
        u64::from(self.0) / CHUNK_ADDRESS_BYTES
    }

    /// Logical chunk number containing a byte offset.
    #[must_use]
    pub fn chunk_of(self, byte_offset: u64) -> u64 {
        byte_offset / u64::from(self.0)
    }

    /// Offset of a byte within its chunk.
    #[must_use]
    pub fn offset_in_chunk(self, byte_offset: u64) -> usize {
        (byte_offset % u64::from(self.0)) as usize
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        Self(DEFAULT_CHUNK_SIZE)
    }
}

impl fmt::Display for ChunkSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rejected chunk size value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidChunkSize(pub u32);

impl fmt::Display for InvalidChunkSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid chunk size {} (must be a power of two in 512..=65536)",
            self.0
        )
    }
}

impl std::error::Error for InvalidChunkSize {}

// ── File kind ───────────────────────────────────────────────────────────────

/// On-disk file type tag.
///
/// The numeric values are part of the inode record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileKind {
    Directory = 1,
    Regular = 2,
}

impl FileKind {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode the on-disk tag; unknown values return `None`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Directory),
            2 => Some(Self::Regular),
            _ => None,
        }
    }
}

// ── Permission bits ─────────────────────────────────────────────────────────

/// The 12 permission bits stored in an inode record.
pub const PERM_MASK: u16 = 0o7777;

pub const S_IRUSR: u16 = 0o400;
pub const S_IWUSR: u16 = 0o200;
pub const S_IXUSR: u16 = 0o100;
pub const S_IRGRP: u16 = 0o040;
pub const S_IWGRP: u16 = 0o020;
pub const S_IXGRP: u16 = 0o010;
pub const S_IROTH: u16 = 0o004;
pub const S_IWOTH: u16 = 0o002;
pub const S_IXOTH: u16 = 0o001;
