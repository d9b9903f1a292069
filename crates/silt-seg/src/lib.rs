#![forbid(unsafe_code)]
//! Log-structured segment allocator.
//!
//! The data region is carved into fixed-size segments. Chunk 0 of every
//! segment is its header: word 0 holds the live-chunk counter, words
//! `1..segment_size` reverse-map chunk slots to the owning inode index
//! (0 = free slot). New chunks are appended to the current write segment;
//! the cleaner consolidates partially-live segments into fresh ones and
//! reports the relocations through the [`RelocateOwner`] seam.
//!
//! Locking: allocation and free paths take only the controller lock (plus
//! short chunk-cache sections). The cleaner holds the controller lock for
//! its entire pass and re-enters the inode layer through [`RelocateOwner`]
//! with that lock still held — the reverse of the table-before-controller
//! nesting used everywhere else, and neither lock is reentrant. Callers
//! must serialize operations above this layer (the filesystem's operation
//! lock does); in exchange, other operations see either pre-clean or
//! post-clean pointers, never a mixture.

use parking_lot::Mutex;
use silt_block::{ChunkHandle, ChunkStore};
use silt_error::{FsError, Result};
use silt_types::{ChunkIndex, InodeIndex, SegmentIndex, FREE_SEGMENT_WORD};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Callback seam used by the cleaner to rewrite owner pointer graphs.
///
/// Implemented by the inode table; keeps this crate from depending on the
/// inode layer.
pub trait RelocateOwner: Send + Sync {
    /// Rewrite every stored chunk index of `owner` present in `moves`.
    fn relocate_chunks(
        &self,
        owner: InodeIndex,
        moves: &HashMap<ChunkIndex, ChunkIndex>,
    ) -> Result<()>;
}

#[derive(Debug)]
struct WriteHead {
    /// Segment currently receiving appends, if any remain.
    current: Option<u64>,
    /// Next chunk slot within the current segment (1..segment_size).
    slot: u64,
    free_segments: u64,
}

/// Log-structured allocator over the data region.
pub struct SegmentController {
    store: Arc<ChunkStore>,
    data_offset: u64,
    segment_size: u64,
    segment_count: u64,
    state: Mutex<WriteHead>,
}

impl std::fmt::Debug for SegmentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentController")
            .field("data_offset", &self.data_offset)
            .field("segment_size", &self.segment_size)
            .field("segment_count", &self.segment_count)
            .finish_non_exhaustive()
    }
}

impl SegmentController {
    /// Build a controller over an already-formatted data region.
    ///
    /// `free_segments` comes from the superblock header on reload; callers
    /// formatting a fresh volume follow up with [`clear_all`].
    ///
    /// [`clear_all`]: SegmentController::clear_all
    pub fn new(
        store: Arc<ChunkStore>,
        data_offset: u64,
        segment_size: u64,
        segment_count: u64,
        free_segments: u64,
    ) -> Result<Self> {
        if segment_size < 2 || segment_count == 0 {
            return Err(FsError::Corrupted(format!(
                "unusable segment geometry: size {segment_size}, count {segment_count}"
            )));
        }
        let end = data_offset + segment_size * segment_count;
        if end > store.chunk_count() {
            return Err(FsError::Corrupted(format!(
                "data region ends at chunk {end} past the store ({} chunks)",
                store.chunk_count()
            )));
        }
        Ok(Self {
            store,
            data_offset,
            segment_size,
            segment_count,
            state: Mutex::new(WriteHead {
                current: None,
                slot: 0,
                free_segments,
            }),
        })
    }

    #[must_use]
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    #[must_use]
    pub fn segment_count(&self) -> u64 {
        self.segment_count
    }

    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    #[must_use]
    pub fn free_segments(&self) -> u64 {
        self.state.lock().free_segments
    }

    /// The segment currently receiving appends.
    #[must_use]
    pub fn write_segment(&self) -> Option<SegmentIndex> {
        self.state.lock().current.map(SegmentIndex)
    }

    fn header(&self, segment: u64) -> Result<ChunkHandle> {
        self.store
            .get_chunk(ChunkIndex(self.data_offset + segment * self.segment_size))
    }

    /// Live-chunk counter of a segment header.
    pub fn usage_of(&self, segment: SegmentIndex) -> Result<u64> {
        Ok(self.header(segment.0)?.read_u64(0))
    }

    /// Reverse-map entry for a chunk slot (0 = free).
    pub fn owner_of(&self, segment: SegmentIndex, slot: u64) -> Result<InodeIndex> {
        Ok(InodeIndex(self.header(segment.0)?.read_u64(slot as usize)))
    }

    /// Write a segment's usage counter, keeping the free-segment count and
    /// its superblock mirror in step with 0↔nonzero transitions.
    fn set_usage(&self, head: &mut WriteHead, segment: u64, usage: u64) -> Result<()> {
        let header = self.header(segment)?;
        let old = header.read_u64(0);
        if old == 0 && usage != 0 {
            head.free_segments -= 1;
            self.mirror_free_count(head.free_segments)?;
        } else if old != 0 && usage == 0 {
            head.free_segments += 1;
            self.mirror_free_count(head.free_segments)?;
        }
        header.write_u64(0, usage);
        Ok(())
    }

    fn mirror_free_count(&self, free: u64) -> Result<()> {
        self.store
            .get_chunk(ChunkIndex(0))?
            .write_u64(FREE_SEGMENT_WORD, free);
        Ok(())
    }

    fn set_owner(&self, segment: u64, slot: u64, owner: InodeIndex) -> Result<()> {
        self.header(segment)?.write_u64(slot as usize, owner.0);
        Ok(())
    }

    /// Zero every segment header, reset the free count, and pick a fresh
    /// write segment. Used at format time.
    pub fn clear_all(&self) -> Result<()> {
        let mut head = self.state.lock();
        for segment in 0..self.segment_count {
            self.header(segment)?.fill_zero();
        }
        head.free_segments = self.segment_count;
        self.mirror_free_count(head.free_segments)?;
        self.pick_write_segment(&mut head)?;
        Ok(())
    }

    /// Choose the lowest-index free segment as the write target.
    ///
    /// Partially-filled segments are never resumed; the log only ever
    /// appends into segments that start empty.
    fn pick_write_segment(&self, head: &mut WriteHead) -> Result<()> {
        for segment in 0..self.segment_count {
            if self.header(segment)?.read_u64(0) == 0 {
                head.current = Some(segment);
                head.slot = 1;
                return Ok(());
            }
        }
        head.current = None;
        Ok(())
    }

    /// Re-pick the write segment after a reload.
    pub fn reset_write_segment(&self) -> Result<()> {
        let mut head = self.state.lock();
        self.pick_write_segment(&mut head)
    }

    /// Append one chunk for `owner` and return its absolute index.
    pub fn allocate(&self, owner: InodeIndex) -> Result<ChunkIndex> {
        let mut head = self.state.lock();

        if head.current.is_none() || head.slot == self.segment_size {
            self.pick_write_segment(&mut head)?;
        }
        let Some(segment) = head.current else {
            return Err(FsError::NoSpace);
        };

        let usage = self.header(segment)?.read_u64(0);
        self.set_usage(&mut head, segment, usage + 1)?;
        self.set_owner(segment, head.slot, owner)?;

        let absolute = ChunkIndex(self.data_offset + segment * self.segment_size + head.slot);
        trace!(
            target: "silt::seg",
            event = "chunk_alloc",
            segment,
            slot = head.slot,
            owner = owner.0,
            chunk = absolute.0
        );
        head.slot += 1;
        Ok(absolute)
    }

    /// Return a chunk to its segment.
    ///
    /// The caller must hand over the only outstanding handle; a shared
    /// handle means some other component still reads or writes the chunk.
    pub fn free_chunk(&self, chunk: ChunkHandle) -> Result<()> {
        if Arc::strong_count(&chunk) != 1 {
            return Err(FsError::Invariant(format!(
                "chunk {} freed while still referenced",
                chunk.index()
            )));
        }

        let mut head = self.state.lock();
        let index = chunk.index().0;
        if index < self.data_offset {
            return Err(FsError::Invariant(format!(
                "chunk {index} lies before the data region"
            )));
        }
        let segment = (index - self.data_offset) / self.segment_size;
        let slot = (index - self.data_offset) % self.segment_size;
        if segment >= self.segment_count {
            return Err(FsError::Invariant(format!(
                "chunk {index} lies past the data region"
            )));
        }
        if slot == 0 {
            return Err(FsError::Invariant(format!(
                "chunk {index} is a segment header"
            )));
        }

        self.set_owner(segment, slot, InodeIndex(0))?;
        let usage = self.header(segment)?.read_u64(0);
        if usage == 0 {
            return Err(FsError::Invariant(format!(
                "segment {segment} usage underflow on free of chunk {index}"
            )));
        }
        self.set_usage(&mut head, segment, usage - 1)?;
        trace!(
            target: "silt::seg",
            event = "chunk_free",
            segment,
            slot,
            chunk = index
        );
        Ok(())
    }

    /// Whether the cleaner should run before the next write.
    #[must_use]
    pub fn needs_clean(&self) -> bool {
        self.state.lock().free_segments * 4 <= self.segment_count
    }

    /// Consolidate partially-live segments into fresh ones.
    ///
    /// Holds the controller lock for the whole pass, including the
    /// `owners` callbacks — which lock the inode table and inode records
    /// underneath it. Safe only while the caller serializes operations
    /// (see the crate docs). Live chunks from the accepted sources are
    /// copied into two free destination segments in source order, every
    /// touched owner has its pointer graph rewritten through `owners`,
    /// and the sources are zeroed afterwards. With fewer than two free
    /// destinations the pass is a no-op; with fewer than two eligible
    /// sources it raises `NoSpace`.
    pub fn clean(&self, owners: &dyn RelocateOwner) -> Result<()> {
        let mut head = self.state.lock();

        if head.free_segments == 0 {
            return Ok(());
        }

        let mut destinations = Vec::with_capacity(2);
        for segment in 0..self.segment_count {
            if head.current == Some(segment) {
                continue;
            }
            if self.header(segment)?.read_u64(0) == 0 {
                destinations.push(segment);
                if destinations.len() == 2 {
                    break;
                }
            }
        }
        if destinations.len() < 2 {
            return Ok(());
        }
        let (dest_a, dest_b) = (destinations[0], destinations[1]);

        // Accept sources in ascending order while the live total fits the
        // two destinations. Full segments have nothing to consolidate.
        let budget = 2 * (self.segment_size - 1);
        let mut sources = Vec::new();
        let mut live_total = 0_u64;
        for segment in 0..self.segment_count {
            if head.current == Some(segment) {
                continue;
            }
            let usage = self.header(segment)?.read_u64(0);
            if usage == 0 || usage == self.segment_size - 1 {
                continue;
            }
            if live_total + usage > budget {
                break;
            }
            sources.push(segment);
            live_total += usage;
        }

        if sources.len() < 2 {
            return Err(FsError::NoSpace);
        }

        let usage_a = live_total.min(self.segment_size - 1);
        let usage_b = live_total - usage_a;
        self.set_usage(&mut head, dest_a, usage_a)?;
        self.set_usage(&mut head, dest_b, usage_b)?;

        let mut moves: HashMap<InodeIndex, HashMap<ChunkIndex, ChunkIndex>> = HashMap::new();
        let mut dest = dest_a;
        let mut write_head = 1_u64;
        for &source in &sources {
            for slot in 1..self.segment_size {
                let owner = self.header(source)?.read_u64(slot as usize);
                if owner == 0 {
                    continue;
                }
                if dest == dest_a && write_head == usage_a + 1 {
                    dest = dest_b;
                    write_head = 1;
                }
                self.set_owner(dest, write_head, InodeIndex(owner))?;

                let old = ChunkIndex(self.data_offset + source * self.segment_size + slot);
                let new = ChunkIndex(self.data_offset + dest * self.segment_size + write_head);
                let from = self.store.get_chunk(old)?;
                let to = self.store.get_chunk(new)?;
                to.copy_from(&from);

                moves
                    .entry(InodeIndex(owner))
                    .or_default()
                    .insert(old, new);
                write_head += 1;
            }
        }

        for (owner, owner_moves) in &moves {
            owners.relocate_chunks(*owner, owner_moves)?;
        }

        // Sources stay valid until every destination is written and every
        // pointer is rewritten; only then are they wiped.
        for &source in &sources {
            self.set_usage(&mut head, source, 0)?;
            for slot in 0..self.segment_size {
                self.store
                    .get_chunk(ChunkIndex(self.data_offset + source * self.segment_size + slot))?
                    .fill_zero();
            }
        }

        debug!(
            target: "silt::seg",
            event = "clean_pass",
            sources = sources.len(),
            live_chunks = live_total,
            dest_a,
            dest_b,
            free_segments = head.free_segments
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_block::MemByteDevice;
    use silt_types::ChunkSize;

    const CHUNK: u64 = 4096;
    const SEG_SIZE: u64 = 8;
    const SEG_COUNT: u64 = 7;
    const DATA_OFFSET: u64 = 1;

    struct NoopRelocate;

    impl RelocateOwner for NoopRelocate {
        fn relocate_chunks(
            &self,
            _owner: InodeIndex,
            _moves: &HashMap<ChunkIndex, ChunkIndex>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRelocate {
        calls: Mutex<Vec<(InodeIndex, HashMap<ChunkIndex, ChunkIndex>)>>,
    }

    impl RelocateOwner for RecordingRelocate {
        fn relocate_chunks(
            &self,
            owner: InodeIndex,
            moves: &HashMap<ChunkIndex, ChunkIndex>,
        ) -> Result<()> {
            self.calls.lock().push((owner, moves.clone()));
            Ok(())
        }
    }

    fn controller() -> (Arc<ChunkStore>, SegmentController) {
        let chunks = DATA_OFFSET + SEG_SIZE * SEG_COUNT;
        let dev = Arc::new(MemByteDevice::new((chunks * CHUNK) as usize));
        let store = Arc::new(
            ChunkStore::with_device(dev, chunks, ChunkSize::new(CHUNK as u32).unwrap()).unwrap(),
        );
        let seg = SegmentController::new(
            Arc::clone(&store),
            DATA_OFFSET,
            SEG_SIZE,
            SEG_COUNT,
            SEG_COUNT,
        )
        .unwrap();
        seg.clear_all().unwrap();
        (store, seg)
    }

    fn check_usage_matches_reverse_map(seg: &SegmentController) {
        for s in 0..seg.segment_count() {
            let mut live = 0;
            for slot in 1..seg.segment_size() {
                if seg.owner_of(SegmentIndex(s), slot).unwrap().0 != 0 {
                    live += 1;
                }
            }
            assert_eq!(
                seg.usage_of(SegmentIndex(s)).unwrap(),
                live,
                "segment {s} usage disagrees with its reverse map"
            );
        }
    }

    fn check_free_count(seg: &SegmentController) {
        let free = (0..seg.segment_count())
            .filter(|s| seg.usage_of(SegmentIndex(*s)).unwrap() == 0)
            .count() as u64;
        assert_eq!(seg.free_segments(), free);
    }

    #[test]
    fn clear_all_resets_everything() {
        let (store, seg) = controller();
        assert_eq!(seg.free_segments(), SEG_COUNT);
        assert_eq!(seg.write_segment(), Some(SegmentIndex(0)));
        assert_eq!(
            store
                .get_chunk(ChunkIndex(0))
                .unwrap()
                .read_u64(FREE_SEGMENT_WORD),
            SEG_COUNT
        );
    }

    #[test]
    fn allocate_fills_slots_in_order() {
        let (_store, seg) = controller();
        let a = seg.allocate(InodeIndex(3)).unwrap();
        let b = seg.allocate(InodeIndex(3)).unwrap();
        assert_eq!(a, ChunkIndex(DATA_OFFSET + 1));
        assert_eq!(b, ChunkIndex(DATA_OFFSET + 2));
        assert_eq!(seg.usage_of(SegmentIndex(0)).unwrap(), 2);
        assert_eq!(seg.owner_of(SegmentIndex(0), 1).unwrap(), InodeIndex(3));
        assert_eq!(seg.owner_of(SegmentIndex(0), 2).unwrap(), InodeIndex(3));
        check_usage_matches_reverse_map(&seg);
        check_free_count(&seg);
    }

    #[test]
    fn allocate_rolls_to_fresh_segment() {
        let (_store, seg) = controller();
        // Fill segment 0 (7 data slots).
        for _ in 0..SEG_SIZE - 1 {
            seg.allocate(InodeIndex(1)).unwrap();
        }
        let next = seg.allocate(InodeIndex(1)).unwrap();
        assert_eq!(next, ChunkIndex(DATA_OFFSET + SEG_SIZE + 1));
        assert_eq!(seg.write_segment(), Some(SegmentIndex(1)));
        check_free_count(&seg);
    }

    #[test]
    fn allocate_exhausts_to_no_space() {
        let (_store, seg) = controller();
        for _ in 0..SEG_COUNT * (SEG_SIZE - 1) {
            seg.allocate(InodeIndex(1)).unwrap();
        }
        assert!(matches!(seg.allocate(InodeIndex(1)), Err(FsError::NoSpace)));
    }

    #[test]
    fn free_chunk_round_trip() {
        let (store, seg) = controller();
        let idx = seg.allocate(InodeIndex(5)).unwrap();
        assert_eq!(seg.free_segments(), SEG_COUNT - 1);

        let handle = store.get_chunk(idx).unwrap();
        seg.free_chunk(handle).unwrap();
        assert_eq!(seg.usage_of(SegmentIndex(0)).unwrap(), 0);
        assert_eq!(seg.owner_of(SegmentIndex(0), 1).unwrap(), InodeIndex(0));
        assert_eq!(seg.free_segments(), SEG_COUNT);
        check_usage_matches_reverse_map(&seg);
    }

    #[test]
    fn free_chunk_rejects_shared_handle() {
        let (store, seg) = controller();
        let idx = seg.allocate(InodeIndex(5)).unwrap();
        let handle = store.get_chunk(idx).unwrap();
        let extra = Arc::clone(&handle);
        assert!(matches!(seg.free_chunk(handle), Err(FsError::Invariant(_))));
        drop(extra);
    }

    #[test]
    fn free_chunk_rejects_header_chunk() {
        let (store, seg) = controller();
        let header = store.get_chunk(ChunkIndex(DATA_OFFSET)).unwrap();
        assert!(matches!(seg.free_chunk(header), Err(FsError::Invariant(_))));
    }

    #[test]
    fn needs_clean_threshold() {
        let (_store, seg) = controller();
        // 7 segments: threshold trips at free <= 1 (7 / 4 == 1).
        assert!(!seg.needs_clean());
        for _ in 0..6 * (SEG_SIZE - 1) {
            seg.allocate(InodeIndex(1)).unwrap();
        }
        assert_eq!(seg.free_segments(), 1);
        assert!(seg.needs_clean());
    }

    /// Build fragmentation: fill several segments, then free most slots so
    /// their usages sit strictly between 0 and segment_size - 1.
    fn fragment(store: &Arc<ChunkStore>, seg: &SegmentController, segments: u64, keep: u64) {
        for _ in 0..segments * (SEG_SIZE - 1) {
            seg.allocate(InodeIndex(2)).unwrap();
        }
        for s in 0..segments {
            for slot in keep + 1..SEG_SIZE {
                let idx = ChunkIndex(DATA_OFFSET + s * SEG_SIZE + slot);
                let handle = store.get_chunk(idx).unwrap();
                seg.free_chunk(handle).unwrap();
            }
        }
    }

    #[test]
    fn clean_consolidates_sources() {
        let (store, seg) = controller();
        // Segments 0..4 each keep 2 live chunks. One more allocation rolls
        // the write head onto segment 4, keeping it out of the source set.
        fragment(&store, &seg, 4, 2);
        seg.allocate(InodeIndex(2)).unwrap();
        assert_eq!(seg.write_segment(), Some(SegmentIndex(4)));

        // Tag each live chunk so relocation can be verified by content.
        for s in 0..4_u64 {
            for slot in 1..=2_u64 {
                let idx = ChunkIndex(DATA_OFFSET + s * SEG_SIZE + slot);
                store
                    .get_chunk(idx)
                    .unwrap()
                    .write_u64(0, 1000 + s * 10 + slot);
            }
        }

        let recorder = RecordingRelocate::default();
        seg.clean(&recorder).unwrap();

        // 8 live chunks moved into segment 5 (7 slots) and segment 6 (1).
        assert_eq!(seg.usage_of(SegmentIndex(5)).unwrap(), 7);
        assert_eq!(seg.usage_of(SegmentIndex(6)).unwrap(), 1);
        for s in 0..4 {
            assert_eq!(seg.usage_of(SegmentIndex(s)).unwrap(), 0);
        }
        check_usage_matches_reverse_map(&seg);
        check_free_count(&seg);

        // All moves were reported for the single owner, and the bytes
        // travelled with them.
        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 1);
        let (owner, moves) = &calls[0];
        assert_eq!(*owner, InodeIndex(2));
        assert_eq!(moves.len(), 8);
        for (old, new) in moves {
            assert!(old.0 < DATA_OFFSET + 4 * SEG_SIZE);
            let tag = store.get_chunk(*new).unwrap().read_u64(0);
            assert!(tag >= 1000, "chunk {old} -> {new} lost its payload");
        }
    }

    #[test]
    fn clean_is_noop_without_two_destinations() {
        let (store, seg) = controller();
        // Occupy six segments, then fragment two of them so sources exist.
        // Segment 6 is the lone free segment, so the pass cannot pick two
        // destinations and must leave everything alone.
        for _ in 0..6 * (SEG_SIZE - 1) {
            seg.allocate(InodeIndex(1)).unwrap();
        }
        for s in 0..2_u64 {
            for slot in 3..SEG_SIZE {
                let idx = ChunkIndex(DATA_OFFSET + s * SEG_SIZE + slot);
                seg.free_chunk(store.get_chunk(idx).unwrap()).unwrap();
            }
        }
        let free_before = seg.free_segments();
        assert_eq!(free_before, 1);
        seg.clean(&NoopRelocate).unwrap();
        assert_eq!(seg.free_segments(), free_before);
        assert_eq!(seg.usage_of(SegmentIndex(0)).unwrap(), 2);
    }

    #[test]
    fn clean_without_two_sources_is_no_space() {
        let (store, seg) = controller();
        // One fragmented segment only.
        for _ in 0..SEG_SIZE - 1 {
            seg.allocate(InodeIndex(1)).unwrap();
        }
        for slot in 3..SEG_SIZE {
            let idx = ChunkIndex(DATA_OFFSET + slot);
            seg.free_chunk(store.get_chunk(idx).unwrap()).unwrap();
        }
        assert!(matches!(
            seg.clean(&NoopRelocate),
            Err(FsError::NoSpace)
        ));
    }

    #[test]
    fn clean_skips_full_and_current_segments() {
        let (store, seg) = controller();
        // Segment 0 stays full; one extra allocation rolls the write head
        // onto segment 3; segments 1 and 2 get fragmented.
        for _ in 0..3 * (SEG_SIZE - 1) {
            seg.allocate(InodeIndex(9)).unwrap();
        }
        seg.allocate(InodeIndex(9)).unwrap();
        assert_eq!(seg.write_segment(), Some(SegmentIndex(3)));
        for s in 1..3_u64 {
            for slot in 3..SEG_SIZE {
                let idx = ChunkIndex(DATA_OFFSET + s * SEG_SIZE + slot);
                seg.free_chunk(store.get_chunk(idx).unwrap()).unwrap();
            }
        }
        seg.clean(&NoopRelocate).unwrap();
        // The full segment was not touched.
        assert_eq!(seg.usage_of(SegmentIndex(0)).unwrap(), SEG_SIZE - 1);
        // The fragmented pair was consolidated elsewhere.
        assert_eq!(seg.usage_of(SegmentIndex(1)).unwrap(), 0);
        assert_eq!(seg.usage_of(SegmentIndex(2)).unwrap(), 0);
        assert_eq!(seg.usage_of(SegmentIndex(4)).unwrap(), 4);
        check_usage_matches_reverse_map(&seg);
        check_free_count(&seg);
    }
}
