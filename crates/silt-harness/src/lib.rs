#![forbid(unsafe_code)]
//! Shared fixtures for the SiltFS end-to-end suites.
//!
//! RAM-backed volumes that can be "rebooted" (the device outlives the
//! filesystem instance), plus the cross-cutting consistency checks the
//! scenario tests assert after every interesting operation.

use silt_block::{ChunkStore, MemByteDevice};
use silt_core::{Filesystem, OpContext};
use silt_types::{ChunkSize, SegmentIndex};
use std::sync::Arc;

pub const CHUNK_SIZE: u32 = 4096;

/// A RAM-backed volume whose device survives filesystem teardown, so a
/// test can format, close, and reopen the same bytes.
pub struct RamVolume {
    dev: Arc<MemByteDevice>,
    chunks: u64,
}

impl RamVolume {
    #[must_use]
    pub fn new(chunks: u64) -> Self {
        Self {
            dev: Arc::new(MemByteDevice::new(
                (chunks * u64::from(CHUNK_SIZE)) as usize,
            )),
            chunks,
        }
    }

    fn store(&self) -> Arc<ChunkStore> {
        let chunk_size = ChunkSize::new(CHUNK_SIZE).expect("valid chunk size");
        Arc::new(
            ChunkStore::with_device(
                Arc::clone(&self.dev) as Arc<dyn silt_block::ByteDevice>,
                self.chunks,
                chunk_size,
            )
            .expect("store over RAM device"),
        )
    }

    /// Format the device and mount the fresh volume.
    #[must_use]
    pub fn format(&self, inode_fraction: f64) -> Filesystem {
        Filesystem::format(self.store(), inode_fraction).expect("format")
    }

    /// Mount the device as it currently stands.
    #[must_use]
    pub fn reopen(&self) -> Filesystem {
        Filesystem::open(self.store()).expect("reopen")
    }
}

/// Operation context for a root caller at a fixed clock.
#[must_use]
pub fn root_ctx(now_ms: u64) -> OpContext {
    OpContext {
        uid: 0,
        gid: 0,
        now_ms,
    }
}

/// Assert the two segment-accounting invariants: every header's usage
/// counter equals its reverse-map population, and the free-segment count
/// equals the number of zero-usage segments.
pub fn assert_segment_invariants(fs: &Filesystem) {
    let seg = fs.superblock().segments();
    let mut zero_usage = 0_u64;
    for segment in 0..seg.segment_count() {
        let index = SegmentIndex(segment);
        let usage = seg.usage_of(index).expect("segment usage");
        let populated = (1..seg.segment_size())
            .filter(|&slot| seg.owner_of(index, slot).expect("reverse map").0 != 0)
            .count() as u64;
        assert_eq!(
            usage, populated,
            "segment {segment}: usage {usage} != reverse-map population {populated}"
        );
        if usage == 0 {
            zero_usage += 1;
        }
    }
    assert_eq!(
        seg.free_segments(),
        zero_usage,
        "free-segment count disagrees with zero-usage segments"
    );
}

/// Assert every metadata chunk below the data region is marked used.
pub fn assert_metadata_marked_used(fs: &Filesystem) {
    let header = fs.superblock().header();
    for bit in 0..header.data_offset {
        assert!(
            fs.superblock().block_map().get(bit).expect("block map bit"),
            "metadata chunk {bit} not marked used"
        );
    }
}
