//! Record File (spec §4.1, §6.1): a fixed-record mapped file with an 8-byte
//! live-count header. Shared foundation for Table Catalogs, Element Stores,
//! and Variant Catalogs.

use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 8;
const INITIAL_FILE_SIZE: u64 = 4096;

/// A growable, soft-deletable sequence of fixed-size records backed by a
/// memory-mapped file.
pub struct RecordFile {
  path: PathBuf,
  record_size: usize,
  file: File,
  mmap: MmapMut,
}

impl RecordFile {
  /// Creates a new, empty record file at `path` with capacity for at least
  /// one record, writing a zeroed 8-byte count header.
  pub fn create(path: impl AsRef<Path>, record_size: usize) -> std::io::Result<Self> {
    assert!(record_size > 0, "zero-field composites must be rejected before reaching storage");
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
    file.set_len(INITIAL_FILE_SIZE)?;
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    let mut rf = RecordFile { path, record_size, file, mmap };
    rf.write_count(0);
    rf.mmap.flush()?;
    tracing::debug!(path = %rf.path.display(), record_size, "created record file");
    Ok(rf)
  }

  /// Opens an existing record file, validating its header is consistent
  /// with `record_size` as derived from the schema.
  pub fn open(path: impl AsRef<Path>, record_size: usize) -> std::io::Result<Self> {
    assert!(record_size > 0);
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new().read(true).write(true).open(&path)?;
    let len = file.metadata()?.len();
    if len < HEADER_SIZE || (len - HEADER_SIZE) % record_size as u64 != 0 {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: file size {len} is inconsistent with record size {record_size}", path.display()),
      ));
    }
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    Ok(RecordFile { path, record_size, file, mmap })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn record_size(&self) -> usize {
    self.record_size
  }

  pub fn count(&self) -> u64 {
    u64::from_le_bytes(self.mmap[0..8].try_into().unwrap())
  }

  pub fn capacity(&self) -> u64 {
    (self.mmap.len() as u64 - HEADER_SIZE) / self.record_size as u64
  }

  fn write_count(&mut self, count: u64) {
    self.mmap[0..8].copy_from_slice(&count.to_le_bytes());
  }

  fn offset_of(&self, index: u64) -> usize {
    (HEADER_SIZE + index * self.record_size as u64) as usize
  }

  /// Appends `record`, growing the file first if it is at capacity.
  /// Returns the index the record was written at.
  pub fn append(&mut self, record: &[u8]) -> std::io::Result<u64> {
    assert_eq!(record.len(), self.record_size);
    let count = self.count();
    if count == self.capacity() {
      self.grow()?;
    }
    let offset = self.offset_of(count);
    self.mmap[offset..offset + self.record_size].copy_from_slice(record);
    // Data before header, so a crash leaves no torn record visible at
    // `count - 1` (spec §4.1, §5).
    self.mmap.flush_range(offset, self.record_size)?;
    self.write_count(count + 1);
    self.mmap.flush_range(0, HEADER_SIZE as usize)?;
    Ok(count)
  }

  fn grow(&mut self) -> std::io::Result<()> {
    let current_size = self.mmap.len() as u64;
    let new_size = std::cmp::max(current_size * 2, HEADER_SIZE + self.record_size as u64);
    self.mmap.flush()?;
    self.file.set_len(new_size)?;
    self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
    tracing::debug!(path = %self.path.display(), new_size, "grew record file");
    Ok(())
  }

  pub fn read(&self, index: u64) -> &[u8] {
    let offset = self.offset_of(index);
    &self.mmap[offset..offset + self.record_size]
  }

  pub fn overwrite(&mut self, index: u64, record: &[u8]) -> std::io::Result<()> {
    assert_eq!(record.len(), self.record_size);
    let offset = self.offset_of(index);
    self.mmap[offset..offset + self.record_size].copy_from_slice(record);
    self.mmap.flush_range(offset, self.record_size)
  }

  /// Overwrites the entire record region with `0xFF`, marking it deleted.
  /// The count header is never decremented (spec §3.3).
  pub fn tombstone(&mut self, index: u64) -> std::io::Result<()> {
    let offset = self.offset_of(index);
    for b in &mut self.mmap[offset..offset + self.record_size] {
      *b = 0xFF;
    }
    self.mmap.flush_range(offset, self.record_size)
  }

  /// A record is tombstoned iff every byte of it is `0xFF` (spec §3.3, §7).
  pub fn is_tombstoned(&self, index: u64) -> bool {
    self.read(index).iter().all(|&b| b == 0xFF)
  }

  /// Yields `(index, record_bytes)` for every live record.
  pub fn iter_live(&self) -> impl Iterator<Item = (u64, &[u8])> {
    (0..self.count()).filter_map(move |i| {
      if self.is_tombstoned(i) {
        None
      } else {
        Some((i, self.read(i)))
      }
    })
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn append_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut rf = RecordFile::create(dir.path().join("t.bin"), 4).unwrap();
    let idx = rf.append(&[1, 2, 3, 4]).unwrap();
    assert_eq!(0, idx);
    assert_eq!(&[1, 2, 3, 4], rf.read(0));
    assert_eq!(1, rf.count());
  }

  #[test]
  fn grows_past_initial_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let mut rf = RecordFile::create(dir.path().join("t.bin"), 4).unwrap();
    let initial_capacity = rf.capacity();
    for i in 0..(initial_capacity + 5) {
      let v = (i as u32).to_le_bytes();
      rf.append(&v).unwrap();
    }
    assert_eq!(initial_capacity + 5, rf.count());
    assert!(rf.capacity() > initial_capacity);
    for i in 0..(initial_capacity + 5) {
      assert_eq!((i as u32).to_le_bytes(), rf.read(i));
    }
  }

  #[test]
  fn tombstone_marks_as_not_live() {
    let dir = tempfile::tempdir().unwrap();
    let mut rf = RecordFile::create(dir.path().join("t.bin"), 4).unwrap();
    rf.append(&[9, 9, 9, 9]).unwrap();
    rf.append(&[1, 1, 1, 1]).unwrap();
    rf.tombstone(0).unwrap();
    assert!(rf.is_tombstoned(0));
    let live: Vec<u64> = rf.iter_live().map(|(i, _)| i).collect();
    assert_eq!(vec![1], live);
  }

  #[test]
  fn reopen_preserves_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.bin");
    {
      let mut rf = RecordFile::create(&path, 4).unwrap();
      rf.append(&[5, 6, 7, 8]).unwrap();
    }
    let rf = RecordFile::open(&path, 4).unwrap();
    assert_eq!(1, rf.count());
    assert_eq!(&[5, 6, 7, 8], rf.read(0));
  }

  #[test]
  fn empty_array_all_ones_is_not_tombstone_because_bitmap_byte_breaks_it() {
    // A record whose slots happen to all be 0xFF but whose bitmap byte is
    // not all-ones is a real, if maximal, value — not a tombstone. This
    // property is enforced by the catalog layer (it never writes an
    // all-0xFF bitmap byte for a live record), not by RecordFile itself,
    // which only implements the raw byte predicate.
    let dir = tempfile::tempdir().unwrap();
    let mut rf = RecordFile::create(dir.path().join("t.bin"), 2).unwrap();
    rf.append(&[0xFF, 0xFF]).unwrap();
    assert!(rf.is_tombstoned(0));
  }
}
