#![forbid(unsafe_code)]
//! Directory container.
//!
//! A directory is a file whose bytes are a flat sequence of fixed-size
//! records: a live flag, a 255-byte-bounded name, and the child's inode
//! index. Removing an entry tombstones its slot (flag 0); adding reuses
//! the first tombstone or appends at end-of-file. No uniqueness check
//! happens at this level — callers that need it look the name up first.

use silt_error::{FsError, Result};
use silt_inode::Inode;
use silt_types::{InodeIndex, NAME_MAX};
use std::sync::Arc;

/// Packed on-disk size of one directory record (8-byte aligned).
pub const DIR_RECORD_SIZE: usize = 272;

const FLAG_OFFSET: usize = 0;
const NAME_OFFSET: usize = 8;
const INODE_OFFSET: usize = 264;

/// One live directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeIndex,
}

/// Directory operations over a directory-typed inode.
pub struct Directory {
    inode: Arc<Inode>,
}

impl Directory {
    #[must_use]
    pub fn new(inode: Arc<Inode>) -> Self {
        Self { inode }
    }

    /// The backing inode.
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    fn load(&self) -> Result<Vec<u8>> {
        let size = self.inode.size();
        let mut raw = vec![0_u8; size as usize];
        let got = self.inode.read(0, &mut raw)?;
        raw.truncate(got);
        Ok(raw)
    }

    fn encode_record(name: &str, child: InodeIndex) -> [u8; DIR_RECORD_SIZE] {
        let mut raw = [0_u8; DIR_RECORD_SIZE];
        raw[FLAG_OFFSET..FLAG_OFFSET + 8].copy_from_slice(&1_u64.to_ne_bytes());
        let bytes = name.as_bytes();
        let keep = bytes.len().min(NAME_MAX);
        raw[NAME_OFFSET..NAME_OFFSET + keep].copy_from_slice(&bytes[..keep]);
        raw[INODE_OFFSET..INODE_OFFSET + 8].copy_from_slice(&child.0.to_ne_bytes());
        raw
    }

    fn record_flag(raw: &[u8]) -> u64 {
        u64::from_ne_bytes(raw[FLAG_OFFSET..FLAG_OFFSET + 8].try_into().unwrap_or([0; 8]))
    }

    fn record_inode(raw: &[u8]) -> InodeIndex {
        InodeIndex(u64::from_ne_bytes(
            raw[INODE_OFFSET..INODE_OFFSET + 8].try_into().unwrap_or([0; 8]),
        ))
    }

    fn record_name(raw: &[u8]) -> &[u8] {
        let field = &raw[NAME_OFFSET..NAME_OFFSET + NAME_MAX];
        let end = field.iter().position(|&byte| byte == 0).unwrap_or(NAME_MAX);
        &field[..end]
    }

    /// Bounded comparison: both sides truncated at `NAME_MAX` bytes.
    fn name_matches(raw: &[u8], candidate: &str) -> bool {
        let bytes = candidate.as_bytes();
        Self::record_name(raw) == &bytes[..bytes.len().min(NAME_MAX)]
    }

    fn decode_entry(raw: &[u8]) -> DirEntry {
        DirEntry {
            name: String::from_utf8_lossy(Self::record_name(raw)).into_owned(),
            inode: Self::record_inode(raw),
        }
    }

    /// Add an entry for `child`, reusing the first tombstoned slot or
    /// appending at end-of-file.
    pub fn add(&self, name: &str, child: InodeIndex, now_ms: u64) -> Result<DirEntry> {
        let raw = self.load()?;
        let records = raw.len() / DIR_RECORD_SIZE;

        let mut slot = records;
        for index in 0..records {
            if Self::record_flag(&raw[index * DIR_RECORD_SIZE..]) == 0 {
                slot = index;
                break;
            }
        }

        let record = Self::encode_record(name, child);
        let offset = (slot * DIR_RECORD_SIZE) as u64;
        let written = self.inode.write(offset, &record, now_ms)?;
        if written != DIR_RECORD_SIZE {
            return Err(FsError::Invariant(format!(
                "short directory record write: {written} bytes"
            )));
        }
        Ok(Self::decode_entry(&record))
    }

    /// First live entry whose name matches, if any.
    pub fn get(&self, name: &str) -> Result<Option<DirEntry>> {
        let raw = self.load()?;
        for record in raw.chunks_exact(DIR_RECORD_SIZE) {
            if Self::record_flag(record) != 0 && Self::name_matches(record, name) {
                return Ok(Some(Self::decode_entry(record)));
            }
        }
        Ok(None)
    }

    /// Tombstone the first live entry whose name matches, writing only
    /// that record slot back. Returns the removed entry.
    pub fn remove(&self, name: &str, now_ms: u64) -> Result<Option<DirEntry>> {
        let mut raw = self.load()?;
        let records = raw.len() / DIR_RECORD_SIZE;
        for index in 0..records {
            let at = index * DIR_RECORD_SIZE;
            let record = &raw[at..at + DIR_RECORD_SIZE];
            if Self::record_flag(record) != 0 && Self::name_matches(record, name) {
                let entry = Self::decode_entry(record);
                raw[at..at + 8].copy_from_slice(&0_u64.to_ne_bytes());
                self.inode
                    .write(at as u64, &raw[at..at + DIR_RECORD_SIZE], now_ms)?;
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Every live entry, in slot order.
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        let raw = self.load()?;
        Ok(raw
            .chunks_exact(DIR_RECORD_SIZE)
            .filter(|record| Self::record_flag(record) != 0)
            .map(Self::decode_entry)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_block::{ChunkStore, MemByteDevice};
    use silt_inode::InodeTable;
    use silt_seg::SegmentController;
    use silt_types::{ChunkSize, FileKind};

    const CHUNK: u64 = 4096;

    fn test_dir() -> (Arc<InodeTable>, Directory) {
        let chunk_size = ChunkSize::new(CHUNK as u32).unwrap();
        let table_chunks = InodeTable::size_chunks_for(64, chunk_size);
        let data_offset = 1 + table_chunks;
        let seg_size = 16;
        let seg_count = 8;
        let total = data_offset + seg_size * seg_count;

        let dev = Arc::new(MemByteDevice::new((total * CHUNK) as usize));
        let store = Arc::new(ChunkStore::with_device(dev, total, chunk_size).unwrap());
        let seg = Arc::new(
            SegmentController::new(Arc::clone(&store), data_offset, seg_size, seg_count, seg_count)
                .unwrap(),
        );
        seg.clear_all().unwrap();
        let table = InodeTable::open(store, seg, 1, 64).unwrap();
        table.format().unwrap();

        let inode = table.alloc().unwrap();
        inode.initialize(0, 0, 0o755, FileKind::Directory, 0);
        (table, Directory::new(inode))
    }

    #[test]
    fn record_layout_is_stable() {
        let raw = Directory::encode_record("hello.txt", InodeIndex(7));
        assert_eq!(raw.len(), DIR_RECORD_SIZE);
        assert_eq!(Directory::record_flag(&raw), 1);
        assert_eq!(Directory::record_name(&raw), b"hello.txt");
        assert_eq!(Directory::record_inode(&raw), InodeIndex(7));
    }

    #[test]
    fn add_then_get() {
        let (_table, dir) = test_dir();
        dir.add("alpha", InodeIndex(2), 10).unwrap();
        dir.add("beta", InodeIndex(3), 11).unwrap();

        let entry = dir.get("beta").unwrap().unwrap();
        assert_eq!(entry.name, "beta");
        assert_eq!(entry.inode, InodeIndex(3));
        assert!(dir.get("gamma").unwrap().is_none());
        assert_eq!(dir.inode().size(), 2 * DIR_RECORD_SIZE as u64);
    }

    #[test]
    fn remove_tombstones_in_place() {
        let (_table, dir) = test_dir();
        dir.add("one", InodeIndex(2), 0).unwrap();
        dir.add("two", InodeIndex(3), 0).unwrap();
        dir.add("three", InodeIndex(4), 0).unwrap();

        let removed = dir.remove("two", 1).unwrap().unwrap();
        assert_eq!(removed.inode, InodeIndex(3));
        assert!(dir.get("two").unwrap().is_none());

        // Neighbours are untouched and the file did not shrink.
        assert!(dir.get("one").unwrap().is_some());
        assert!(dir.get("three").unwrap().is_some());
        assert_eq!(dir.inode().size(), 3 * DIR_RECORD_SIZE as u64);

        let names: Vec<String> = dir.entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["one", "three"]);
    }

    #[test]
    fn add_reuses_tombstoned_slot() {
        let (_table, dir) = test_dir();
        dir.add("one", InodeIndex(2), 0).unwrap();
        dir.add("two", InodeIndex(3), 0).unwrap();
        dir.remove("one", 0).unwrap();

        dir.add("replacement", InodeIndex(9), 0).unwrap();
        // The file did not grow: the tombstone was reused.
        assert_eq!(dir.inode().size(), 2 * DIR_RECORD_SIZE as u64);

        let names: Vec<String> = dir.entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["replacement", "two"]);
    }

    #[test]
    fn remove_missing_yields_none() {
        let (_table, dir) = test_dir();
        dir.add("present", InodeIndex(2), 0).unwrap();
        assert!(dir.remove("absent", 0).unwrap().is_none());
        assert_eq!(dir.entries().unwrap().len(), 1);
    }

    #[test]
    fn names_compare_on_the_255_byte_bound() {
        let (_table, dir) = test_dir();
        let long = "x".repeat(300);
        dir.add(&long, InodeIndex(5), 0).unwrap();

        // Lookup with any name sharing the first 255 bytes succeeds.
        let other = format!("{}y", "x".repeat(299));
        let entry = dir.get(&other).unwrap().unwrap();
        assert_eq!(entry.inode, InodeIndex(5));
        assert_eq!(entry.name.len(), NAME_MAX);
    }

    #[test]
    fn empty_directory_lists_nothing() {
        let (_table, dir) = test_dir();
        assert!(dir.entries().unwrap().is_empty());
        assert!(dir.get("anything").unwrap().is_none());
    }

    #[test]
    fn many_entries_span_chunks() {
        let (_table, dir) = test_dir();
        // 40 records × 272 bytes crosses two 4096-byte chunks.
        for index in 0..40_u64 {
            dir.add(&format!("file-{index}"), InodeIndex(index + 2), 0)
                .unwrap();
        }
        let entries = dir.entries().unwrap();
        assert_eq!(entries.len(), 40);
        for (index, entry) in entries.iter().enumerate() {
            assert_eq!(entry.name, format!("file-{index}"));
            assert_eq!(entry.inode, InodeIndex(index as u64 + 2));
        }
    }
}
