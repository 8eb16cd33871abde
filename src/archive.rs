//! The Archiver (spec §4.10): compacts a database into a temporary
//! directory, then bundles every resulting file into one binary blob a
//! caller can move or store as a unit. Restore is the inverse.
//!
//! Bundle layout (spec §6.4): an 8-byte ascii magic, a `uint32` format
//! version, a `uint32` entry count, then one header entry per file
//! (`name_len: u16`, name bytes, `length: u64`, `offset: u64` — offset
//! relative to the start of the raw-byte region), followed by every file's
//! bytes back to back in header order. Compression is an outer, transparent
//! gzip wrapper over the whole bundle (spec §4.10); it is not part of the
//! bundle format itself.

use crate::engine::{Engine, EngineOptions};
use crate::error::{EngineError, EngineResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"TTARCHIV";
const FORMAT_VERSION: u32 = 1;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

struct FileEntry {
  name: String,
  length: u64,
}

/// Compacts `source` into a scratch directory and writes the result as a
/// single bundle file at `bundle_path`. `gzip` wraps the bundle in
/// transparent gzip compression; the `.ttar[.gz]` extension is advisory and
/// not enforced here.
pub fn archive(source: &mut Engine, bundle_path: impl AsRef<Path>, gzip: bool) -> EngineResult<()> {
  let scratch = tempfile::tempdir()?;
  let compacted_dir = scratch.path().join("compacted");
  let compacted = crate::compact::compact(source, &compacted_dir)?;
  drop(compacted); // release the lock file before reading its bytes back

  let files = collect_files(&compacted_dir)?;
  let out = File::create(bundle_path.as_ref())?;
  if gzip {
    write_bundle(&mut GzEncoder::new(BufWriter::new(out), Compression::default()), &compacted_dir, &files)?;
  } else {
    write_bundle(&mut BufWriter::new(out), &compacted_dir, &files)?;
  }
  tracing::info!(bundle = %bundle_path.as_ref().display(), files = files.len(), gzip, "wrote archive");
  Ok(())
}

fn write_bundle(out: &mut impl Write, root: &Path, files: &[PathBuf]) -> EngineResult<()> {
  let entries: Vec<FileEntry> = files
    .iter()
    .map(|p| -> io::Result<FileEntry> {
      let name = relative_name(root, p);
      let length = p.metadata()?.len();
      Ok(FileEntry { name, length })
    })
    .collect::<io::Result<_>>()?;

  out.write_all(MAGIC)?;
  out.write_all(&FORMAT_VERSION.to_le_bytes())?;
  out.write_all(&(entries.len() as u32).to_le_bytes())?;
  let mut offset = 0u64;
  for entry in &entries {
    out.write_all(&(entry.name.len() as u16).to_le_bytes())?;
    out.write_all(entry.name.as_bytes())?;
    out.write_all(&entry.length.to_le_bytes())?;
    out.write_all(&offset.to_le_bytes())?;
    offset += entry.length;
  }
  for path in files {
    let mut f = BufReader::new(File::open(path)?);
    io::copy(&mut f, out)?;
  }
  Ok(())
}

/// Restores a bundle written by [`archive`] into `dest_dir`, which must not
/// already contain anything (a supplement to spec §4.10: restoring into a
/// non-empty directory would silently interleave the restored files with
/// whatever was already there). Returns an `Engine` open on the result.
pub fn restore(bundle_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> EngineResult<Engine> {
  let dest_dir = dest_dir.as_ref();
  if dest_dir.exists() && std::fs::read_dir(dest_dir)?.next().is_some() {
    return Err(EngineError::Archive(format!("restore target is not empty: {}", dest_dir.display())));
  }
  std::fs::create_dir_all(dest_dir)?;

  let raw = std::fs::read(bundle_path.as_ref())?;
  let bytes: Vec<u8> = if raw.len() >= 2 && raw[0..2] == GZIP_MAGIC {
    let mut out = Vec::new();
    GzDecoder::new(&raw[..]).read_to_end(&mut out)?;
    out
  } else {
    raw
  };

  let mut cursor = 0usize;
  let magic = &bytes[cursor..cursor + 8];
  if magic != MAGIC {
    return Err(EngineError::Archive("not a TTAR bundle".into()));
  }
  cursor += 8;
  let version = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
  cursor += 4;
  if version != FORMAT_VERSION {
    return Err(EngineError::Archive(format!("unsupported bundle format version {version}")));
  }
  let count = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
  cursor += 4;

  let mut entries = Vec::with_capacity(count);
  for _ in 0..count {
    let name_len = u16::from_le_bytes(bytes[cursor..cursor + 2].try_into().unwrap()) as usize;
    cursor += 2;
    let name = String::from_utf8(bytes[cursor..cursor + name_len].to_vec())
      .map_err(|e| EngineError::Archive(format!("corrupt file name in bundle: {e}")))?;
    cursor += name_len;
    let length = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
    cursor += 8;
    let offset = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
    cursor += 8;
    entries.push((name, length, offset));
  }
  let body_start = cursor;

  for (name, length, offset) in entries {
    let dest_path = dest_dir.join(&name);
    if let Some(parent) = dest_path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let start = body_start + offset as usize;
    let end = start + length as usize;
    std::fs::write(&dest_path, &bytes[start..end])?;
  }

  Engine::open(EngineOptions::new(dest_dir))
}

fn relative_name(root: &Path, path: &Path) -> String {
  path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/")
}

/// Every regular file under `root`, recursively, in a stable (sorted)
/// order, excluding the per-process lock file (which must not outlive the
/// engine instance that created it).
fn collect_files(root: &Path) -> io::Result<Vec<PathBuf>> {
  let mut out = Vec::new();
  collect_files_into(root, &mut out)?;
  out.sort();
  Ok(out)
}

fn collect_files_into(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    if path.is_dir() {
      collect_files_into(&path, out)?;
    } else if path.file_name().map(|n| n != "_lock").unwrap_or(true) {
      out.push(path);
    }
  }
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::schema::{CompositeDef, FieldDef, Kind};
  use crate::value::{CompositeValue, TypedValue};

  fn sample_engine(dir: &Path) -> Engine {
    let mut engine = Engine::open(EngineOptions::new(dir).create_if_missing(true)).unwrap();
    engine
      .register_type(Kind::Composite(CompositeDef {
        name: "Item".into(),
        fields: vec![FieldDef::new("name", "string")],
        parent: None,
        interfaces: vec![],
      }))
      .unwrap();
    engine.insert(&CompositeValue::new("Item").with_field("name", TypedValue::Str("widget".into()))).unwrap();
    engine
  }

  #[test]
  fn archive_then_restore_round_trips() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut engine = sample_engine(src_dir.path());
    let bundle = src_dir.path().join("out.ttar");
    archive(&mut engine, &bundle, false).unwrap();
    drop(engine);

    let restore_dir = src_dir.path().join("restored");
    let restored = restore(&bundle, &restore_dir).unwrap();
    match restored.read_value("Item", 0).unwrap() {
      TypedValue::Composite(cv) => assert_eq!(Some(&TypedValue::Str("widget".into())), cv.fields.get("name")),
      other => panic!("expected composite, got {other:?}"),
    }
  }

  #[test]
  fn gzip_round_trips_too() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut engine = sample_engine(src_dir.path());
    let bundle = src_dir.path().join("out.ttar.gz");
    archive(&mut engine, &bundle, true).unwrap();
    drop(engine);

    let restore_dir = src_dir.path().join("restored");
    let restored = restore(&bundle, &restore_dir).unwrap();
    assert_eq!(1, restored.iter_live("Item").unwrap().len());
  }

  #[test]
  fn restore_refuses_nonempty_target() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut engine = sample_engine(src_dir.path());
    let bundle = src_dir.path().join("out.ttar");
    archive(&mut engine, &bundle, false).unwrap();
    drop(engine);

    let restore_dir = src_dir.path().join("restored");
    std::fs::create_dir_all(&restore_dir).unwrap();
    std::fs::write(restore_dir.join("stray.txt"), b"pre-existing").unwrap();

    let err = restore(&bundle, &restore_dir).unwrap_err();
    assert!(matches!(err, EngineError::Archive(_)));
  }
}
