//! The Compactor (spec §4.9): rebuilds a database directory gap-free into a
//! fresh directory, renumbering every live record and remapping every
//! cross-table reference to match. Operates on raw slot bytes against the
//! schema's `Kind`s rather than through the resolver — a cycle built with
//! `Scope`/`TagRef` (spec §4.7) is already baked down into an ordinary
//! composite-index slot by the time it reaches storage, so compaction never
//! needs a recursion guard the way a value-level read does.

use crate::engine::{element_store_file_name, Engine, EngineOptions};
use crate::error::{EngineError, EngineResult, SchemaError};
use crate::math::required_byte_width;
use crate::schema::{Kind, Registry, TypeIdTable};
use crate::storage::catalog::RecordLayout;
use crate::storage::{Catalog, ElementStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Compacts `source` into a fresh directory at `dest_dir`, returning an
/// `Engine` already open on it. `dest_dir` must not exist.
pub fn compact(source: &mut Engine, dest_dir: impl AsRef<Path>) -> EngineResult<Engine> {
  let dest_dir = dest_dir.as_ref().to_path_buf();
  if dest_dir.exists() {
    return Err(EngineError::OutputDirectoryExists(dest_dir.display().to_string()));
  }
  std::fs::create_dir_all(&dest_dir)?;

  let metadata_src = source.dir().join(crate::schema::document::METADATA_FILE_NAME);
  let metadata_dst = dest_dir.join(crate::schema::document::METADATA_FILE_NAME);
  std::fs::copy(&metadata_src, &metadata_dst)?;

  let mut compactor = Compactor::new(source, dest_dir.clone());
  compactor.run()?;
  drop(compactor);

  tracing::info!(dest = %dest_dir.display(), "compaction complete");
  Engine::open(EngineOptions::new(&dest_dir))
}

/// Old-(start,length) → new-(start,length), one table per Element Store
/// key. Built lazily: a run is only compacted the first time some live
/// slot is found to reach it (spec §4.9 step 2).
type ByteRemap = HashMap<String, HashMap<(u32, u32), (u32, u32)>>;

struct Compactor<'a> {
  source: &'a mut Engine,
  registry: Registry,
  type_ids: TypeIdTable,
  dest_dir: PathBuf,
  composite_remap: HashMap<String, HashMap<u32, u32>>,
  variant_remap: HashMap<String, HashMap<u32, u32>>,
  byte_remap: ByteRemap,
  dest_catalogs: HashMap<String, Catalog>,
  dest_variant_catalogs: HashMap<String, HashMap<String, Catalog>>,
  dest_stores: HashMap<String, ElementStore>,
}

impl<'a> Compactor<'a> {
  fn new(source: &'a mut Engine, dest_dir: PathBuf) -> Self {
    let registry = source.registry().clone();
    let type_ids = source.type_ids().clone();
    Compactor {
      source,
      registry,
      type_ids,
      dest_dir,
      composite_remap: HashMap::new(),
      variant_remap: HashMap::new(),
      byte_remap: HashMap::new(),
      dest_catalogs: HashMap::new(),
      dest_variant_catalogs: HashMap::new(),
      dest_stores: HashMap::new(),
    }
  }

  fn run(&mut self) -> EngineResult<()> {
    let kinds: Vec<Kind> = self.registry.iter_in_order().cloned().collect();

    self.build_index_remaps(&kinds)?;
    self.create_dest_catalogs(&kinds)?;
    self.compact_composites(&kinds)?;
    self.compact_payload_variants(&kinds)?;
    Ok(())
  }

  /// Step 1: number every live record 0..M-1 in ascending old-index order,
  /// dropping tombstones. Independent of byte remapping, so it runs first
  /// and in full before any slot is rewritten.
  fn build_index_remaps(&mut self, kinds: &[Kind]) -> EngineResult<()> {
    for kind in kinds {
      match kind {
        Kind::Composite(c) => {
          if let Some(cat) = self.source.catalogs.get(&c.name) {
            let mut m = HashMap::new();
            for (new_idx, old_idx) in cat.iter_live().enumerate() {
              m.insert(old_idx, new_idx as u32);
            }
            self.composite_remap.insert(c.name.clone(), m);
          }
        }
        Kind::PayloadEnum(e) => {
          if let Some(vc) = self.source.variant_catalogs.get(&e.name) {
            for v in &e.variants {
              if v.fields.is_none() {
                continue;
              }
              if let Some(cat) = vc.catalog(&v.name) {
                let mut m = HashMap::new();
                for (new_idx, old_idx) in cat.iter_live().enumerate() {
                  m.insert(old_idx, new_idx as u32);
                }
                self.variant_remap.insert(format!("{}::{}", e.name, v.name), m);
              }
            }
          }
        }
        _ => {}
      }
    }
    Ok(())
  }

  fn create_dest_catalogs(&mut self, kinds: &[Kind]) -> EngineResult<()> {
    for kind in kinds {
      match kind {
        Kind::Composite(c) => {
          if self.source.catalogs.contains_key(&c.name) {
            let layout = RecordLayout::compute(self.registry.effective_fields(&c.name), &self.registry)?;
            let path = self.dest_dir.join(format!("{}.bin", c.name));
            self.dest_catalogs.insert(c.name.clone(), Catalog::create(path, layout)?);
          }
        }
        Kind::PayloadEnum(e) => {
          if self.source.variant_catalogs.contains_key(&e.name) {
            let dir = self.dest_dir.join(&e.name);
            let mut per_variant = HashMap::new();
            for v in &e.variants {
              if let Some(fields) = &v.fields {
                std::fs::create_dir_all(&dir)?;
                let layout = RecordLayout::compute(fields.clone(), &self.registry)?;
                let path = dir.join(format!("{}.bin", v.name));
                per_variant.insert(v.name.clone(), Catalog::create(path, layout)?);
              }
            }
            self.dest_variant_catalogs.insert(e.name.clone(), per_variant);
          }
        }
        _ => {}
      }
    }
    Ok(())
  }

  fn compact_composites(&mut self, kinds: &[Kind]) -> EngineResult<()> {
    for kind in kinds {
      let Kind::Composite(c) = kind else { continue };
      if !self.source.catalogs.contains_key(&c.name) {
        continue;
      }
      let fields = self.registry.effective_fields(&c.name);
      let old_indices: Vec<u32> = self.source.catalogs[&c.name].iter_live().collect();
      for old_idx in old_indices {
        let (mask, slots) = self.source.catalogs[&c.name].read_raw(old_idx);
        let (new_mask, new_slots) = self.remap_record(&fields, &mask, &slots)?;
        self.dest_catalogs.get_mut(&c.name).unwrap().insert_raw(&new_mask, &new_slots)?;
      }
    }
    Ok(())
  }

  fn compact_payload_variants(&mut self, kinds: &[Kind]) -> EngineResult<()> {
    for kind in kinds {
      let Kind::PayloadEnum(e) = kind else { continue };
      if !self.source.variant_catalogs.contains_key(&e.name) {
        continue;
      }
      for v in e.variants.clone() {
        let Some(fields) = v.fields.clone() else { continue };
        let old_indices: Vec<u32> = match self.source.variant_catalogs[&e.name].catalog(&v.name) {
          Some(cat) => cat.iter_live().collect(),
          None => continue,
        };
        for old_idx in old_indices {
          let (mask, slots) = self.source.variant_catalogs[&e.name].catalog(&v.name).unwrap().read_raw(old_idx);
          let (new_mask, new_slots) = self.remap_record(&fields, &mask, &slots)?;
          self
            .dest_variant_catalogs
            .get_mut(&e.name)
            .and_then(|m| m.get_mut(&v.name))
            .ok_or_else(|| SchemaError::UnknownType(format!("{}::{}", e.name, v.name)))?
            .insert_raw(&new_mask, &new_slots)?;
        }
      }
    }
    Ok(())
  }

  /// Rewrites every field of one record through the remaps built so far,
  /// per spec §4.9 step 3/4: a dangling reference degrades to an explicit
  /// null (bitmap bit set, slot zeroed) rather than aborting.
  fn remap_record(
    &mut self,
    fields: &[crate::schema::FieldDef],
    mask: &[bool],
    slots: &[Vec<u8>],
  ) -> EngineResult<(Vec<bool>, Vec<Vec<u8>>)> {
    let mut new_mask = Vec::with_capacity(fields.len());
    let mut new_slots = Vec::with_capacity(fields.len());
    for (i, field) in fields.iter().enumerate() {
      if mask[i] {
        new_mask.push(true);
        new_slots.push(vec![0u8; slots[i].len()]);
        continue;
      }
      let kind = self.resolved_kind_clone(&field.type_name)?;
      match self.remap_value(&kind, &slots[i])? {
        Some(bytes) => {
          new_mask.push(false);
          new_slots.push(bytes);
        }
        None => {
          new_mask.push(true);
          new_slots.push(vec![0u8; slots[i].len()]);
        }
      }
    }
    Ok((new_mask, new_slots))
  }

  fn resolved_kind_clone(&self, name: &str) -> EngineResult<Kind> {
    let resolved = self.registry.resolve_alias(name).ok_or_else(|| SchemaError::UnknownType(name.to_string()))?;
    self.registry.lookup(resolved).cloned().ok_or_else(|| SchemaError::UnknownType(name.to_string()).into())
  }

  /// Rewrites one value-sized slot. `None` means the referent no longer
  /// exists in the compacted output (it was tombstoned) and the caller
  /// should record this as a null instead.
  fn remap_value(&mut self, kind: &Kind, bytes: &[u8]) -> EngineResult<Option<Vec<u8>>> {
    Ok(match kind {
      Kind::Primitive(_) | Kind::Boolean { .. } | Kind::Enum(_) => Some(bytes.to_vec()),

      Kind::Composite(c) => {
        let old_idx = u32::from_le_bytes(bytes.try_into().unwrap());
        self.composite_index(&c.name, old_idx).map(|i| i.to_le_bytes().to_vec())
      }

      Kind::Interface(_) => {
        let type_id = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        let old_idx = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
        match self.type_ids.name_for(type_id).map(str::to_string) {
          Some(name) => self.composite_index(&name, old_idx).map(|new_idx| {
            let mut out = type_id.to_le_bytes().to_vec();
            out.extend_from_slice(&new_idx.to_le_bytes());
            out
          }),
          None => None,
        }
      }

      Kind::String { .. } => {
        let (start, len) = read_run(bytes);
        let element_kind = self.resolved_kind_clone("character")?;
        let (ns, nl) = self.request_run("character", Some(element_kind), start, len)?;
        Some(run_to_bytes(ns, nl))
      }

      Kind::Array(a) => {
        let (start, len) = read_run(bytes);
        let element_kind = self.resolved_kind_clone(&a.element)?;
        let (ns, nl) = self.request_run(&a.element, Some(element_kind), start, len)?;
        Some(run_to_bytes(ns, nl))
      }

      Kind::Set(s) => {
        let (start, len) = read_run(bytes);
        let element_kind = self.resolved_kind_clone(&s.element)?;
        let (ns, nl) = self.request_run(&s.element, Some(element_kind), start, len)?;
        Some(run_to_bytes(ns, nl))
      }

      Kind::Dictionary(d) => {
        let (start, len) = read_run(bytes);
        let entry_name = d.entry_composite_name();
        let entry_kind = self.resolved_kind_clone(&entry_name)?;
        let (ns, nl) = self.request_run(&entry_name, Some(entry_kind), start, len)?;
        Some(run_to_bytes(ns, nl))
      }

      Kind::Bigint { .. } => {
        let (start, len) = read_run(bytes);
        let (ns, nl) = self.request_run("$bigint", None, start, len)?;
        Some(run_to_bytes(ns, nl))
      }

      Kind::Biguint { .. } => {
        let (start, len) = read_run(bytes);
        let (ns, nl) = self.request_run("$biguint", None, start, len)?;
        Some(run_to_bytes(ns, nl))
      }

      Kind::Fraction { .. } => {
        let ns_ = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let nl_ = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let ds_ = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let dl_ = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let (nns, nnl) = self.request_run("$fraction_num", None, ns_, nl_)?;
        let (nds, ndl) = self.request_run("$fraction_den", None, ds_, dl_)?;
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&nns.to_le_bytes());
        out.extend_from_slice(&nnl.to_le_bytes());
        out.extend_from_slice(&nds.to_le_bytes());
        out.extend_from_slice(&ndl.to_le_bytes());
        Some(out)
      }

      Kind::PayloadEnum(e) => {
        let max_disc = e.variants.iter().enumerate().map(|(i, v)| v.discriminant.unwrap_or(i as u64)).max().unwrap_or(0);
        let width = required_byte_width(max_disc);
        let disc = le_to_u64(&bytes[..width]);
        let old_idx = u32::from_le_bytes(bytes[width..width + 4].try_into().unwrap());
        let variant = e
          .variants
          .iter()
          .enumerate()
          .find(|(i, v)| v.discriminant.unwrap_or(*i as u64) == disc)
          .map(|(_, v)| v.clone());
        let new_idx = match &variant {
          Some(v) if v.fields.is_some() && old_idx != u32::MAX => {
            let key = format!("{}::{}", e.name, v.name);
            self.variant_index(&key, old_idx).unwrap_or_else(|| {
              tracing::warn!(enum_name = %e.name, variant = %v.name, old_idx, "dangling payload-enum reference degraded to sentinel");
              u32::MAX
            })
          }
          _ => old_idx,
        };
        let mut out = bytes[..width].to_vec();
        out.extend_from_slice(&new_idx.to_le_bytes());
        Some(out)
      }

      Kind::Alias(_) => unreachable!("callers resolve aliases before calling remap_value"),
    })
  }

  fn composite_index(&self, type_name: &str, old_index: u32) -> Option<u32> {
    self.composite_remap.get(type_name).and_then(|m| m.get(&old_index)).copied()
  }

  fn variant_index(&self, key: &str, old_index: u32) -> Option<u32> {
    self.variant_remap.get(key).and_then(|m| m.get(&old_index)).copied()
  }

  /// Step 2: compacts one `(start, length)` run the first time it's
  /// reached, laying its (recursively remapped) elements back-to-back in
  /// D′'s store in first-encounter order. `element_kind` is `None` for the
  /// four reserved raw-byte stores, whose contents are opaque and copied
  /// verbatim. A dangling composite/interface element has no null
  /// representation at this level (unlike a field slot, it has no bitmap bit
  /// to set, and a zeroed slot is a live reference to index 0) so it aborts
  /// compaction rather than silently aliasing to whatever record now sits at
  /// index 0; every other element kind degrades to a zeroed slot with a
  /// warning, same as today.
  fn request_run(&mut self, store_key: &str, element_kind: Option<Kind>, start: u32, len: u32) -> EngineResult<(u32, u32)> {
    if len == 0 {
      return Ok((0, 0));
    }
    if let Some(existing) = self.byte_remap.get(store_key).and_then(|m| m.get(&(start, len))) {
      return Ok(*existing);
    }
    let width = match &element_kind {
      Some(k) => crate::storage::catalog::slot_width_for(k.name(), &self.registry)?,
      None => 1,
    };
    let raw = source_store_mut(self.source, store_key)?.read_run(start, len);
    let mut new_bytes = Vec::with_capacity(raw.len());
    for chunk in raw.chunks(width) {
      let remapped = match &element_kind {
        Some(k) => match self.remap_value(k, chunk)? {
          Some(bytes) => bytes,
          None if matches!(k, Kind::Composite(_) | Kind::Interface(_)) => {
            return Err(EngineError::Compaction(format!(
              "dangling {} reference inside element store '{store_key}' has no null representation at the element level",
              k.name()
            )));
          }
          None => {
            tracing::warn!(store = store_key, "dangling element-level reference degraded to a zeroed slot");
            vec![0u8; width]
          }
        },
        None => chunk.to_vec(),
      };
      new_bytes.extend_from_slice(&remapped);
    }
    let (new_start, new_len) = self.dest_store_mut(store_key, width)?.insert_run(&new_bytes)?;
    self.byte_remap.entry(store_key.to_string()).or_default().insert((start, len), (new_start, new_len));
    Ok((new_start, new_len))
  }

  fn dest_store_mut(&mut self, key: &str, width: usize) -> EngineResult<&mut ElementStore> {
    if !self.dest_stores.contains_key(key) {
      let path = self.dest_dir.join(element_store_file_name(key));
      self.dest_stores.insert(key.to_string(), ElementStore::create(path, width)?);
    }
    Ok(self.dest_stores.get_mut(key).unwrap())
  }
}

fn source_store_mut<'e>(source: &'e mut Engine, key: &str) -> EngineResult<&'e mut ElementStore> {
  if key.starts_with('$') {
    source.raw_byte_store_mut(key)
  } else {
    source.element_store_mut(key)
  }
}

fn run_to_bytes(start: u32, len: u32) -> Vec<u8> {
  let mut out = Vec::with_capacity(8);
  out.extend_from_slice(&start.to_le_bytes());
  out.extend_from_slice(&len.to_le_bytes());
  out
}

fn read_run(bytes: &[u8]) -> (u32, u32) {
  (u32::from_le_bytes(bytes[0..4].try_into().unwrap()), u32::from_le_bytes(bytes[4..8].try_into().unwrap()))
}

fn le_to_u64(bytes: &[u8]) -> u64 {
  let mut buf = [0u8; 8];
  buf[..bytes.len()].copy_from_slice(bytes);
  u64::from_le_bytes(buf)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::schema::{CompositeDef, FieldDef};
  use crate::value::{CompositeValue, TypedValue};

  #[test]
  fn drops_tombstones_and_renumbers() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(EngineOptions::new(src_dir.path()).create_if_missing(true)).unwrap();
    engine
      .register_type(Kind::Composite(CompositeDef {
        name: "Item".into(),
        fields: vec![FieldDef::new("name", "string")],
        parent: None,
        interfaces: vec![],
      }))
      .unwrap();
    for name in ["a", "b", "c"] {
      let v = CompositeValue::new("Item").with_field("name", TypedValue::Str(name.into()));
      engine.insert(&v).unwrap();
    }
    engine.delete("Item", 1).unwrap();

    let dest_dir = src_dir.path().join("compacted");
    let compacted = compact(&mut engine, &dest_dir).unwrap();

    assert_eq!(2, compacted.iter_live("Item").unwrap().len());
    match compacted.read_value("Item", 0).unwrap() {
      TypedValue::Composite(cv) => assert_eq!(Some(&TypedValue::Str("a".into())), cv.fields.get("name")),
      other => panic!("expected composite, got {other:?}"),
    }
    match compacted.read_value("Item", 1).unwrap() {
      TypedValue::Composite(cv) => assert_eq!(Some(&TypedValue::Str("c".into())), cv.fields.get("name")),
      other => panic!("expected composite, got {other:?}"),
    }
  }

  #[test]
  fn remaps_composite_references_and_nulls_dangling_ones() {
    let src_dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::open(EngineOptions::new(src_dir.path()).create_if_missing(true)).unwrap();
    engine
      .register_type(Kind::Composite(CompositeDef {
        name: "Leaf".into(),
        fields: vec![FieldDef::new("tag", "uint8")],
        parent: None,
        interfaces: vec![],
      }))
      .unwrap();
    engine
      .register_type(Kind::Composite(CompositeDef {
        name: "Node".into(),
        fields: vec![FieldDef::new("leaf", "Leaf")],
        parent: None,
        interfaces: vec![],
      }))
      .unwrap();

    let leaf0 = engine.insert(&CompositeValue::new("Leaf").with_field("tag", TypedValue::U8(0))).unwrap();
    let leaf1 = engine.insert(&CompositeValue::new("Leaf").with_field("tag", TypedValue::U8(1))).unwrap();
    assert_eq!(0, leaf0);
    assert_eq!(1, leaf1);
    engine.delete("Leaf", 0).unwrap();

    let node_to_live = CompositeValue::new("Node").with_field("leaf", TypedValue::Composite(CompositeValue::new("Leaf").with_field("tag", TypedValue::U8(2))));
    // second Leaf insert happens implicitly via interning inside `insert`'s
    // nested composite field, landing at index 2 (0 tombstoned, 1 alive).
    let node_idx = engine.insert(&node_to_live).unwrap();

    let dest_dir = src_dir.path().join("compacted");
    let compacted = compact(&mut engine, &dest_dir).unwrap();

    match compacted.read_value("Node", node_idx).unwrap() {
      TypedValue::Composite(cv) => match cv.fields.get("leaf") {
        Some(TypedValue::Composite(leaf)) => assert_eq!(Some(&TypedValue::U8(2)), leaf.fields.get("tag")),
        other => panic!("expected nested leaf, got {other:?}"),
      },
      other => panic!("expected composite, got {other:?}"),
    }
  }
}
