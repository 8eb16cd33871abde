//! Element Store (spec §4.2): a Record File whose records are single
//! elements of one component type, shared by every array/set/dict usage of
//! that element type across the whole database.

use super::record_file::RecordFile;
use std::path::Path;

pub struct ElementStore {
  file: RecordFile,
  element_width: usize,
}

impl ElementStore {
  pub fn create(path: impl AsRef<Path>, element_width: usize) -> std::io::Result<Self> {
    Ok(ElementStore { file: RecordFile::create(path, element_width)?, element_width })
  }

  pub fn open(path: impl AsRef<Path>, element_width: usize) -> std::io::Result<Self> {
    Ok(ElementStore { file: RecordFile::open(path, element_width)?, element_width })
  }

  pub fn element_width(&self) -> usize {
    self.element_width
  }

  pub fn count(&self) -> u64 {
    self.file.count()
  }

  /// Appends a contiguous run of elements (each `element_width` bytes,
  /// concatenated in `elements`) and returns its `(start, length)`. An
  /// empty run is represented as `(0, 0)` and consumes no space, per spec
  /// §4.2.
  pub fn insert_run(&mut self, elements: &[u8]) -> std::io::Result<(u32, u32)> {
    assert_eq!(elements.len() % self.element_width, 0);
    let len = (elements.len() / self.element_width) as u32;
    if len == 0 {
      return Ok((0, 0));
    }
    let mut start = None;
    for chunk in elements.chunks(self.element_width) {
      let idx = self.file.append(chunk)?;
      if start.is_none() {
        start = Some(idx as u32);
      }
    }
    Ok((start.unwrap(), len))
  }

  /// Reads back a `(start, length)` run as a flat byte buffer.
  pub fn read_run(&self, start: u32, length: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(length as usize * self.element_width);
    for i in 0..length as u64 {
      out.extend_from_slice(self.file.read(start as u64 + i));
    }
    out
  }

  pub fn read_element(&self, index: u32) -> &[u8] {
    self.file.read(index as u64)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn empty_run_consumes_no_space() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ElementStore::create(dir.path().join("e.bin"), 4).unwrap();
    let (start, len) = store.insert_run(&[]).unwrap();
    assert_eq!((0, 0), (start, len));
    assert_eq!(0, store.count());
  }

  #[test]
  fn run_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ElementStore::create(dir.path().join("e.bin"), 4).unwrap();
    let bytes: Vec<u8> = (0..20u32).flat_map(|x| x.to_le_bytes()).collect();
    let (start, len) = store.insert_run(&bytes).unwrap();
    assert_eq!(0, start);
    assert_eq!(20, len);
    assert_eq!(bytes, store.read_run(start, len));
  }

  #[test]
  fn successive_runs_are_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ElementStore::create(dir.path().join("e.bin"), 1).unwrap();
    let (s1, l1) = store.insert_run(&[b'a', b'b']).unwrap();
    let (s2, l2) = store.insert_run(&[b'c']).unwrap();
    assert_eq!((0, 2), (s1, l1));
    assert_eq!((2, 1), (s2, l2));
  }
}
