//! Table Catalog (spec §4.3): one Record File per composite type, with
//! `record_size = bitmap_bytes + sum(slot_widths)`. This module owns the
//! null-bitmap codec and raw slot packing; value <-> slot translation is
//! the Reference Resolver's job (see `crate::resolver`).

use super::record_file::RecordFile;
use crate::error::SchemaError;
use crate::math::{div_ceil, required_byte_width};
use crate::schema::{FieldDef, Kind, Registry};
use std::path::Path;

/// The fixed byte layout derived from a composite's effective field list.
#[derive(Clone, Debug)]
pub struct RecordLayout {
  pub bitmap_bytes: usize,
  pub fields: Vec<FieldDef>,
  pub slot_widths: Vec<usize>,
  pub slot_offsets: Vec<usize>,
  pub record_size: usize,
}

impl RecordLayout {
  pub fn compute(fields: Vec<FieldDef>, registry: &Registry) -> Result<Self, SchemaError> {
    let bitmap_bytes = div_ceil(fields.len(), 8);
    let mut slot_widths = Vec::with_capacity(fields.len());
    for f in &fields {
      slot_widths.push(slot_width_for(&f.type_name, registry)?);
    }
    let mut offset = bitmap_bytes;
    let mut slot_offsets = Vec::with_capacity(fields.len());
    for w in &slot_widths {
      slot_offsets.push(offset);
      offset += w;
    }
    Ok(RecordLayout { bitmap_bytes, fields, slot_widths, slot_offsets, record_size: offset })
  }

  pub fn field_index(&self, name: &str) -> Option<usize> {
    self.fields.iter().position(|f| f.name == name)
  }

  fn bit_is_set(bitmap: &[u8], index: usize) -> bool {
    let byte = bitmap[index / 8];
    (byte & (1 << (index % 8))) != 0
  }

  fn set_bit(bitmap: &mut [u8], index: usize, value: bool) {
    if value {
      bitmap[index / 8] |= 1 << (index % 8);
    } else {
      bitmap[index / 8] &= !(1 << (index % 8));
    }
  }

  /// Packs a full record: bitmap first, then each field's slot bytes in
  /// declaration order. `null_mask[i]` true means field `i` is null, in
  /// which case `slots[i]` is ignored and zeroed instead (spec §3.2).
  pub fn pack(&self, null_mask: &[bool], slots: &[Vec<u8>]) -> Vec<u8> {
    assert_eq!(null_mask.len(), self.fields.len());
    assert_eq!(slots.len(), self.fields.len());
    let mut out = vec![0u8; self.record_size];
    let bitmap = &mut out[0..self.bitmap_bytes];
    for (i, is_null) in null_mask.iter().enumerate() {
      Self::set_bit(bitmap, i, *is_null);
    }
    for (i, width) in self.slot_widths.iter().enumerate() {
      if null_mask[i] {
        continue; // already zeroed
      }
      let off = self.slot_offsets[i];
      assert_eq!(slots[i].len(), *width, "slot width mismatch for field '{}'", self.fields[i].name);
      out[off..off + width].copy_from_slice(&slots[i]);
    }
    out
  }

  /// Unpacks a raw record into `(null_mask, slot_bytes)` parallel to
  /// `self.fields`.
  pub fn unpack<'a>(&self, record: &'a [u8]) -> (Vec<bool>, Vec<&'a [u8]>) {
    let bitmap = &record[0..self.bitmap_bytes];
    let mut null_mask = Vec::with_capacity(self.fields.len());
    let mut slots = Vec::with_capacity(self.fields.len());
    for (i, width) in self.slot_widths.iter().enumerate() {
      null_mask.push(Self::bit_is_set(bitmap, i));
      let off = self.slot_offsets[i];
      slots.push(&record[off..off + width]);
    }
    (null_mask, slots)
  }
}

/// The slot width for a field of declared type `type_name` (spec §3.2's
/// field-kind-to-slot-width table).
pub fn slot_width_for(type_name: &str, registry: &Registry) -> Result<usize, SchemaError> {
  let resolved = registry
    .resolve_alias(type_name)
    .ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
  let kind = registry.lookup(resolved).ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
  Ok(match kind {
    Kind::Primitive(p) => p.width as usize,
    Kind::Boolean { .. } => 1,
    Kind::Composite(_) => 4,
    Kind::Interface(_) => 6,
    Kind::Array(_) | Kind::String { .. } | Kind::Set(_) | Kind::Dictionary(_) => 8,
    Kind::Enum(e) => required_byte_width(e.max_discriminant()),
    Kind::PayloadEnum(e) => {
      let max_disc = e
        .variants
        .iter()
        .enumerate()
        .map(|(i, v)| v.discriminant.unwrap_or(i as u64))
        .max()
        .unwrap_or(0);
      required_byte_width(max_disc) + 4
    }
    Kind::Bigint { .. } | Kind::Biguint { .. } => 8,
    Kind::Fraction { .. } => 16,
    Kind::Alias(_) => unreachable!("resolve_alias already followed the chain"),
  })
}

/// The element width for an Element Store backing arrays/sets of
/// `element_type` (spec §4.2) — the same byte-width rule as a field slot,
/// since an element is just a field with no null bit of its own.
pub fn slot_width_for_element(element_type: &str, registry: &Registry) -> Result<usize, SchemaError> {
  slot_width_for(element_type, registry)
}

/// A Table Catalog: the Record File for one composite type, paired with
/// the layout derived from its effective field list.
pub struct Catalog {
  pub layout: RecordLayout,
  file: RecordFile,
}

impl Catalog {
  pub fn create(path: impl AsRef<Path>, layout: RecordLayout) -> std::io::Result<Self> {
    Ok(Catalog { file: RecordFile::create(path, layout.record_size)?, layout })
  }

  pub fn open(path: impl AsRef<Path>, layout: RecordLayout) -> std::io::Result<Self> {
    Ok(Catalog { file: RecordFile::open(path, layout.record_size)?, layout })
  }

  pub fn count(&self) -> u64 {
    self.file.count()
  }

  pub fn insert_raw(&mut self, null_mask: &[bool], slots: &[Vec<u8>]) -> std::io::Result<u32> {
    let record = self.layout.pack(null_mask, slots);
    Ok(self.file.append(&record)? as u32)
  }

  /// Appends a placeholder record (every field null) and returns its
  /// index, for the reserve-then-fill cyclic-reference pattern (spec
  /// §4.7). The placeholder is later replaced via [`overwrite_raw`].
  pub fn reserve(&mut self) -> std::io::Result<u32> {
    let null_mask = vec![true; self.layout.fields.len()];
    let slots = vec![Vec::new(); self.layout.fields.len()];
    self.insert_raw(&null_mask, &slots)
  }

  pub fn overwrite_raw(&mut self, index: u32, null_mask: &[bool], slots: &[Vec<u8>]) -> std::io::Result<()> {
    let record = self.layout.pack(null_mask, slots);
    self.file.overwrite(index as u64, &record)
  }

  pub fn read_raw(&self, index: u32) -> (Vec<bool>, Vec<Vec<u8>>) {
    let (mask, slots) = self.layout.unpack(self.file.read(index as u64));
    (mask, slots.into_iter().map(|s| s.to_vec()).collect())
  }

  pub fn delete(&mut self, index: u32) -> std::io::Result<()> {
    self.file.tombstone(index as u64)
  }

  pub fn is_tombstoned(&self, index: u32) -> bool {
    self.file.is_tombstoned(index as u64)
  }

  pub fn iter_live(&self) -> impl Iterator<Item = u32> + '_ {
    self.file.iter_live().map(|(i, _)| i as u32)
  }

  pub fn record_size(&self) -> usize {
    self.layout.record_size
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::schema::{CompositeDef, FieldDef};

  #[test]
  fn null_bit_zeroes_slot_bytes() {
    let registry = Registry::new();
    let layout = RecordLayout::compute(
      vec![FieldDef::new("a", "uint32"), FieldDef::new("b", "uint8")],
      &registry,
    )
    .unwrap();
    let record = layout.pack(&[true, false], &[Vec::new(), vec![7u8]]);
    let (mask, slots) = layout.unpack(&record);
    assert_eq!(vec![true, false], mask);
    assert_eq!(vec![0u8, 0, 0, 0], slots[0]);
    assert_eq!(vec![7u8], slots[1]);
  }

  #[test]
  fn layout_matches_spec_table() {
    let mut registry = Registry::new();
    registry
      .register(Kind::Composite(CompositeDef {
        name: "Ref".into(),
        fields: vec![FieldDef::new("x", "uint8")],
        parent: None,
        interfaces: vec![],
      }))
      .unwrap();
    let layout = RecordLayout::compute(
      vec![
        FieldDef::new("name", "string"),
        FieldDef::new("other", "Ref"),
      ],
      &registry,
    )
    .unwrap();
    assert_eq!(8, layout.slot_widths[0]); // string: (start, length)
    assert_eq!(4, layout.slot_widths[1]); // composite ref: uint32 index
    assert_eq!(1, layout.bitmap_bytes);
  }
}
