#![forbid(unsafe_code)]
//! Bit-addressable view over a contiguous run of chunks.
//!
//! `ChunkBitmap` backs both the block map (metadata chunk accounting) and
//! the used-inode map. The free-run scan is byte-wise over a precomputed
//! table of per-byte unset runs, resuming from a persisted cursor so
//! repeated allocations do not rescan the low bits.

use parking_lot::Mutex;
use silt_block::{ChunkHandle, ChunkStore};
use silt_error::{FsError, Result};
use silt_types::{ChunkIndex, ChunkSize};
use tracing::trace;

/// A run of consecutive unset bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRun {
    pub start: u64,
    pub len: u64,
}

/// Per-byte scan table: (first unset bit position, run length from there).
///
/// A byte with no unset bit maps to length 0.
const fn build_run_table() -> [(u8, u8); 256] {
    let mut table = [(0_u8, 0_u8); 256];
    let mut byte = 0_usize;
    while byte < 256 {
        let mut bit = 0_usize;
        while bit < 8 {
            if byte & (1 << bit) == 0 {
                let mut run = 1_usize;
                while bit + run < 8 && byte & (1 << (bit + run)) == 0 {
                    run += 1;
                }
                table[byte] = (bit as u8, run as u8);
                break;
            }
            bit += 1;
        }
        byte += 1;
    }
    table
}

static RUN_TABLE: [(u8, u8); 256] = build_run_table();

/// A logical array of bits stored across a pinned run of chunks.
///
/// Bits past the nominal `bit_count` (the padding region) are kept set so
/// the scanner can never hand them out.
pub struct ChunkBitmap {
    chunks: Vec<ChunkHandle>,
    start_chunk: ChunkIndex,
    bit_count: u64,
    chunk_size: usize,
    cursor: Mutex<u64>,
}

impl std::fmt::Debug for ChunkBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBitmap")
            .field("start_chunk", &self.start_chunk)
            .field("bit_count", &self.bit_count)
            .finish_non_exhaustive()
    }
}

impl ChunkBitmap {
    /// Bytes needed for `bit_count` bits, including the padding byte region.
    #[must_use]
    pub fn size_bytes_for(bit_count: u64) -> u64 {
        bit_count / 8 + 8
    }

    /// Chunks needed for `bit_count` bits at the given chunk size.
    #[must_use]
    pub fn size_chunks_for(bit_count: u64, chunk_size: ChunkSize) -> u64 {
        Self::size_bytes_for(bit_count) / u64::from(chunk_size.get()) + 1
    }

    /// Pin the bitmap's chunk run starting at `start_chunk`.
    pub fn open(store: &ChunkStore, start_chunk: ChunkIndex, bit_count: u64) -> Result<Self> {
        let chunk_size = store.chunk_size();
        let span = Self::size_chunks_for(bit_count, chunk_size);
        let mut chunks = Vec::with_capacity(span as usize);
        for offset in 0..span {
            let index = start_chunk
                .checked_add(offset)
                .ok_or(FsError::InvalidArgument("bitmap chunk range overflows"))?;
            chunks.push(store.get_chunk(index)?);
        }
        Ok(Self {
            chunks,
            start_chunk,
            bit_count,
            chunk_size: chunk_size.as_usize(),
            cursor: Mutex::new(0),
        })
    }

    #[must_use]
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    #[must_use]
    pub fn start_chunk(&self) -> ChunkIndex {
        self.start_chunk
    }

    #[must_use]
    pub fn size_chunks(&self) -> u64 {
        self.chunks.len() as u64
    }

    fn read_byte(&self, byte_idx: u64) -> u8 {
        let chunk = &self.chunks[(byte_idx / self.chunk_size as u64) as usize];
        chunk.read_byte((byte_idx % self.chunk_size as u64) as usize)
    }

    fn write_byte(&self, byte_idx: u64, value: u8) {
        let chunk = &self.chunks[(byte_idx / self.chunk_size as u64) as usize];
        chunk.write_byte((byte_idx % self.chunk_size as u64) as usize, value);
    }

    fn check_bounds(&self, bit: u64) -> Result<()> {
        if bit >= self.bit_count {
            return Err(FsError::OutOfRange {
                index: bit,
                limit: self.bit_count,
            });
        }
        Ok(())
    }

    pub fn get(&self, bit: u64) -> Result<bool> {
        self.check_bounds(bit)?;
        Ok(self.read_byte(bit / 8) & (1 << (bit % 8)) != 0)
    }

    pub fn set(&self, bit: u64) -> Result<()> {
        self.check_bounds(bit)?;
        self.set_raw(bit);
        Ok(())
    }

    pub fn clear(&self, bit: u64) -> Result<()> {
        self.check_bounds(bit)?;
        let byte = self.read_byte(bit / 8);
        self.write_byte(bit / 8, byte & !(1 << (bit % 8)));
        Ok(())
    }

    /// Set without the bounds check; used for the padding region.
    fn set_raw(&self, bit: u64) {
        let byte = self.read_byte(bit / 8);
        self.write_byte(bit / 8, byte | (1 << (bit % 8)));
    }

    /// Zero the whole run, then re-set the padding bits past `bit_count`.
    pub fn clear_all(&self) {
        for chunk in &self.chunks {
            chunk.fill_zero();
        }
        for bit in self.bit_count..self.bit_count + 8 {
            self.set_raw(bit);
        }
        *self.cursor.lock() = 0;
    }

    /// Number of set bits in `[0, bit_count)`.
    #[must_use]
    pub fn count_set(&self) -> u64 {
        let full_bytes = self.bit_count / 8;
        let mut total = 0_u64;
        for byte_idx in 0..full_bytes {
            total += u64::from(self.read_byte(byte_idx).count_ones());
        }
        for bit in full_bytes * 8..self.bit_count {
            if self.read_byte(bit / 8) & (1 << (bit % 8)) != 0 {
                total += 1;
            }
        }
        total
    }

    /// Find the first run of consecutive unset bits, up to `want` long.
    ///
    /// The scan resumes from the persisted cursor; when it comes up empty,
    /// the cursor is reset to 0 and the scan retried once. The returned run
    /// may be shorter than `want` if no longer run exists — callers that
    /// need exactly `want` bits must check `len`.
    pub fn find_unset_run(&self, want: u64) -> Option<BitRun> {
        if want == 0 {
            return None;
        }

        let mut cursor = self.cursor.lock();
        let started_at = *cursor;
        let mut run = self.scan_from(want, &mut cursor);
        if run.is_none() && started_at != 0 {
            *cursor = 0;
            run = self.scan_from(want, &mut cursor);
        }
        drop(cursor);

        run.map(|mut r| {
            if r.len > want {
                r.len = want;
            }
            trace!(
                target: "silt::alloc",
                event = "bitmap_run",
                start = r.start,
                len = r.len
            );
            r
        })
    }

    /// One cursor-to-end pass. Byte-wise: a byte's first unset run either
    /// starts a candidate, extends one that ended exactly at the byte
    /// boundary, or terminates the scan.
    fn scan_from(&self, want: u64, cursor: &mut u64) -> Option<BitRun> {
        let mut run: Option<BitRun> = None;
        let mut idx = *cursor & !7; // byte-aligned bit index

        while idx < self.bit_count {
            let byte = self.read_byte(idx / 8);
            let (first, len) = RUN_TABLE[byte as usize];

            if len == 0 {
                if run.is_some() {
                    *cursor = idx;
                    break;
                }
            } else {
                let abs_start = idx + u64::from(first);
                match run {
                    Some(ref mut r) => {
                        if abs_start != r.start + r.len {
                            // A gap of set bits ended the candidate run.
                            *cursor = idx;
                            break;
                        }
                        r.len += u64::from(len);
                    }
                    None => {
                        run = Some(BitRun {
                            start: abs_start,
                            len: u64::from(len),
                        });
                    }
                }
                if run.is_some_and(|r| r.len >= want) {
                    *cursor = idx;
                    break;
                }
            }
            idx += 8;
        }

        run.filter(|r| r.len > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_block::MemByteDevice;
    use std::sync::Arc;

    fn test_store(chunks: u64) -> ChunkStore {
        let chunk_size = ChunkSize::new(4096).unwrap();
        let dev = Arc::new(MemByteDevice::new((chunks * 4096) as usize));
        ChunkStore::with_device(dev, chunks, chunk_size).unwrap()
    }

    fn test_bitmap(bits: u64) -> (ChunkStore, ChunkBitmap) {
        let store = test_store(8);
        let map = ChunkBitmap::open(&store, ChunkIndex(0), bits).unwrap();
        map.clear_all();
        (store, map)
    }

    #[test]
    fn run_table_spot_checks() {
        assert_eq!(RUN_TABLE[0x00], (0, 8));
        assert_eq!(RUN_TABLE[0xFF], (0, 0));
        assert_eq!(RUN_TABLE[0x01], (1, 7));
        assert_eq!(RUN_TABLE[0xF0], (0, 4));
        assert_eq!(RUN_TABLE[0x0F], (4, 4));
        // 0b0110_0110: first unset run is bit 0, length 1.
        assert_eq!(RUN_TABLE[0x66], (0, 1));
    }

    #[test]
    fn get_set_clear_round_trip() {
        let (_store, map) = test_bitmap(100);
        assert!(!map.get(42).unwrap());
        map.set(42).unwrap();
        assert!(map.get(42).unwrap());
        map.clear(42).unwrap();
        assert!(!map.get(42).unwrap());
    }

    #[test]
    fn bounds_are_enforced() {
        let (_store, map) = test_bitmap(100);
        assert!(matches!(map.get(100), Err(FsError::OutOfRange { .. })));
        assert!(matches!(map.set(100), Err(FsError::OutOfRange { .. })));
        assert!(matches!(map.clear(777), Err(FsError::OutOfRange { .. })));
    }

    #[test]
    fn clear_all_sets_padding() {
        let (_store, map) = test_bitmap(12);
        // Bits 12..20 live past the nominal count and must read as set via
        // the raw bytes (bit 12..15 share byte 1 with real bits 8..11).
        assert_eq!(map.read_byte(1) >> 4, 0x0F);
        assert_eq!(map.read_byte(2), 0x0F);
    }

    #[test]
    fn find_run_from_empty_map() {
        let (_store, map) = test_bitmap(256);
        let run = map.find_unset_run(4).unwrap();
        assert_eq!(run, BitRun { start: 0, len: 4 });
    }

    #[test]
    fn find_run_skips_set_prefix() {
        let (_store, map) = test_bitmap(256);
        for bit in 0..10 {
            map.set(bit).unwrap();
        }
        let run = map.find_unset_run(3).unwrap();
        assert_eq!(run.start, 10);
        assert_eq!(run.len, 3);
    }

    #[test]
    fn run_stitches_across_byte_boundary() {
        let (_store, map) = test_bitmap(256);
        // Occupy everything except bits 6..18: the free run spans three bytes.
        for bit in 0..6 {
            map.set(bit).unwrap();
        }
        for bit in 18..256 {
            map.set(bit).unwrap();
        }
        let run = map.find_unset_run(12).unwrap();
        assert_eq!(run, BitRun { start: 6, len: 12 });
    }

    #[test]
    fn short_run_is_returned_clamped() {
        let (_store, map) = test_bitmap(16);
        for bit in 0..16 {
            map.set(bit).unwrap();
        }
        map.clear(5).unwrap();
        // Only a single free bit exists; asking for 4 yields the short run.
        let run = map.find_unset_run(4).unwrap();
        assert_eq!(run, BitRun { start: 5, len: 1 });
    }

    #[test]
    fn full_map_yields_none() {
        let (_store, map) = test_bitmap(64);
        for bit in 0..64 {
            map.set(bit).unwrap();
        }
        assert_eq!(map.find_unset_run(1), None);
    }

    #[test]
    fn cursor_resumes_and_wraps() {
        let (_store, map) = test_bitmap(64);
        // Consume the first byte worth of bits.
        let first = map.find_unset_run(8).unwrap();
        assert_eq!(first.start, 0);
        for bit in 0..8 {
            map.set(bit).unwrap();
        }
        let second = map.find_unset_run(8).unwrap();
        assert_eq!(second.start, 8);
        for bit in 8..16 {
            map.set(bit).unwrap();
        }
        // Free an early bit again; the cursor sits past it, so the scan
        // must wrap to find it once the tail is exhausted.
        map.clear(3).unwrap();
        for bit in 16..64 {
            map.set(bit).unwrap();
        }
        let wrapped = map.find_unset_run(1).unwrap();
        assert_eq!(wrapped, BitRun { start: 3, len: 1 });
    }

    #[test]
    fn padding_is_never_allocated() {
        let (_store, map) = test_bitmap(10);
        for bit in 0..10 {
            map.set(bit).unwrap();
        }
        // The padding bits after bit 10 are set, and the rest of the chunk
        // run (zeroed, beyond the padding) must not be reachable either.
        assert_eq!(map.find_unset_run(1), None);
    }

    #[test]
    fn count_set_counts_only_real_bits() {
        let (_store, map) = test_bitmap(20);
        assert_eq!(map.count_set(), 0);
        map.set(0).unwrap();
        map.set(13).unwrap();
        map.set(19).unwrap();
        assert_eq!(map.count_set(), 3);
    }

    #[test]
    fn size_math_matches_layout() {
        let chunk_size = ChunkSize::new(4096).unwrap();
        assert_eq!(ChunkBitmap::size_bytes_for(0), 8);
        assert_eq!(ChunkBitmap::size_bytes_for(4096), 520);
        assert_eq!(ChunkBitmap::size_chunks_for(4096, chunk_size), 1);
        // A disk-sized map (1 bit per chunk) for a 4096-chunk volume.
        assert_eq!(ChunkBitmap::size_chunks_for(4096 * 8, chunk_size), 2);
    }
}
