//! Reference Resolver (spec §4.6): translates typed values to and from the
//! raw slot bytes a Table Catalog stores, dispatching interface-typed slots
//! to their concrete composite via the stable type-id, and interning
//! variable-length content into the right Element Store / Variant Catalog
//! along the way. Implemented as `Engine` methods because every case needs
//! simultaneous access to the registry, the catalogs, and the element
//! stores that only `Engine` owns together.

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, ReferenceError, SchemaError, ValueError};
use crate::math::required_byte_width;
use crate::numeric;
use crate::schema::{DefaultValue, FieldDef, Kind, PrimitiveEncoding};
use crate::value::{CompositeValue, TypedValue, ValueUsage};
use num_traits::ToPrimitive;

impl Engine {
  pub(crate) fn encode_record(&mut self, type_name: &str, value: &CompositeValue) -> EngineResult<(Vec<bool>, Vec<Vec<u8>>)> {
    let fields = self.registry.effective_fields(type_name);
    if fields.is_empty() && self.registry.lookup(type_name).is_none() {
      return Err(SchemaError::UnknownType(type_name.to_string()).into());
    }
    self.encode_fields(&fields, value)
  }

  fn encode_fields(&mut self, fields: &[FieldDef], value: &CompositeValue) -> EngineResult<(Vec<bool>, Vec<Vec<u8>>)> {
    let mut null_mask = Vec::with_capacity(fields.len());
    let mut slots = Vec::with_capacity(fields.len());
    for field in fields {
      let provided = value.fields.get(&field.name);
      let (is_null, bytes) = self.encode_field(field, provided)?;
      null_mask.push(is_null);
      slots.push(bytes);
    }
    Ok((null_mask, slots))
  }

  fn encode_field(&mut self, field: &FieldDef, provided: Option<&TypedValue>) -> EngineResult<(bool, Vec<u8>)> {
    match provided {
      Some(TypedValue::Null) | None => {
        if let Some(default) = &field.default {
          let materialized = self.default_to_typed(default)?;
          let bytes = self.encode_value(&field.type_name, &materialized, Some(field))?;
          Ok((false, bytes))
        } else if provided.is_some() {
          Ok((true, vec![0u8; crate::storage::catalog::slot_width_for(&field.type_name, &self.registry)?]))
        } else {
          Err(ValueError::MissingRequiredField(field.name.clone()).into())
        }
      }
      Some(v) => {
        let bytes = self.encode_value(&field.type_name, v, Some(field))?;
        Ok((false, bytes))
      }
    }
  }

  fn default_to_typed(&self, default: &DefaultValue) -> EngineResult<TypedValue> {
    Ok(match default {
      DefaultValue::Null => TypedValue::Null,
      DefaultValue::Bool(b) => TypedValue::Bool(*b),
      DefaultValue::Int(i) => TypedValue::I64(*i),
      DefaultValue::UInt(u) => TypedValue::U64(*u),
      DefaultValue::Float(f) => TypedValue::F64(*f),
      DefaultValue::Str(s) => TypedValue::Str(s.clone()),
      DefaultValue::EnumVariant(_) => {
        return Err(ValueError::WrongShape { field: "default".into(), expected: "explicit enum default unsupported; supply a value" }.into())
      }
      DefaultValue::Decimal(s) => TypedValue::BigInt(
        s.parse().map_err(|_| ValueError::WrongShape { field: "default".into(), expected: "decimal integer text" })?,
      ),
    })
  }

  fn resolved_kind<'a>(&'a self, type_name: &str) -> EngineResult<&'a Kind> {
    let name = self.registry.resolve_alias(type_name).ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
    self.registry.lookup(name).ok_or_else(|| SchemaError::UnknownType(type_name.to_string()).into())
  }

  fn encode_value(&mut self, type_name: &str, value: &TypedValue, field: Option<&FieldDef>) -> EngineResult<Vec<u8>> {
    let kind = self.resolved_kind(type_name)?.clone();
    match &kind {
      Kind::Primitive(p) => self.encode_primitive(p.width as usize, p.encoding, value, field),
      Kind::Boolean { .. } => match value {
        TypedValue::Bool(b) => Ok(vec![if *b { 1 } else { 0 }]),
        _ => Err(ValueError::WrongShape { field: field_name(field), expected: "bool" }.into()),
      },
      Kind::String { .. } => self.encode_string(value, field),
      Kind::Array(a) => self.encode_sequence(&a.element, value, field, false),
      Kind::Set(s) => self.encode_sequence(&s.element, value, field, true),
      Kind::Dictionary(d) => self.encode_dictionary(&d.key, &d.value, &d.entry_composite_name(), value, field),
      Kind::Composite(_) => self.encode_composite_ref(&kind, value, field),
      Kind::Interface(iface) => self.encode_interface_ref(&iface.name.clone(), value, field),
      Kind::Enum(e) => self.encode_bare_enum(e, value, field),
      Kind::PayloadEnum(e) => self.encode_payload_enum(&e.clone(), value, field),
      Kind::Bigint { .. } => match value {
        TypedValue::BigInt(v) => {
          let bytes = numeric::encode_bigint(v);
          let (start, len) = self.raw_byte_store_mut("$bigint")?.insert_run(&bytes)?;
          Ok(run_to_bytes(start, len))
        }
        _ => Err(ValueError::WrongShape { field: field_name(field), expected: "bigint" }.into()),
      },
      Kind::Biguint { .. } => match value {
        TypedValue::BigUInt(v) => {
          let bytes = numeric::encode_biguint(v);
          let (start, len) = self.raw_byte_store_mut("$biguint")?.insert_run(&bytes)?;
          Ok(run_to_bytes(start, len))
        }
        _ => Err(ValueError::WrongShape { field: field_name(field), expected: "biguint" }.into()),
      },
      Kind::Fraction { .. } => match value {
        TypedValue::Fraction(v) => {
          let (num_bytes, den_bytes) = numeric::encode_fraction(v);
          let (ns, nl) = self.raw_byte_store_mut("$fraction_num")?.insert_run(&num_bytes)?;
          let (ds, dl) = self.raw_byte_store_mut("$fraction_den")?.insert_run(&den_bytes)?;
          let mut out = Vec::with_capacity(16);
          out.extend_from_slice(&ns.to_le_bytes());
          out.extend_from_slice(&nl.to_le_bytes());
          out.extend_from_slice(&ds.to_le_bytes());
          out.extend_from_slice(&dl.to_le_bytes());
          Ok(out)
        }
        _ => Err(ValueError::WrongShape { field: field_name(field), expected: "fraction" }.into()),
      },
      Kind::Alias(_) => unreachable!("resolved_kind already followed aliases"),
    }
  }

  fn encode_primitive(&self, width: usize, encoding: PrimitiveEncoding, value: &TypedValue, field: Option<&FieldDef>) -> EngineResult<Vec<u8>> {
    match encoding {
      PrimitiveEncoding::Ieee754 => match (width, value) {
        (4, TypedValue::F32(f)) => Ok(f.to_le_bytes().to_vec()),
        (8, TypedValue::F64(f)) => Ok(f.to_le_bytes().to_vec()),
        _ => Err(ValueError::WrongShape { field: field_name(field), expected: "float matching declared width" }.into()),
      },
      PrimitiveEncoding::UnsignedInt => {
        let raw = narrowing_as_u128(value, &field_name(field))?;
        let max = if width >= 16 { u128::MAX } else { (1u128 << (width * 8)) - 1 };
        let policy = field.and_then(|f| f.overflow).unwrap_or_default();
        let applied = policy.apply_unsigned(&field_name(field), raw, max)?;
        Ok(applied.to_le_bytes()[..width].to_vec())
      }
      PrimitiveEncoding::SignedInt => {
        let raw = narrowing_as_i128(value, &field_name(field))?;
        let bits = (width * 8) as u32;
        let (min, max) = if bits >= 128 { (i128::MIN, i128::MAX) } else { (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1) };
        let policy = field.and_then(|f| f.overflow).unwrap_or_default();
        let applied = policy.apply_signed(&field_name(field), raw, min, max)?;
        Ok(applied.to_le_bytes()[..width].to_vec())
      }
    }
  }

  fn encode_string(&mut self, value: &TypedValue, field: Option<&FieldDef>) -> EngineResult<Vec<u8>> {
    let s = match value {
      TypedValue::Str(s) => s,
      _ => return Err(ValueError::WrongShape { field: field_name(field), expected: "string" }.into()),
    };
    let bytes: Vec<u8> = s.chars().flat_map(|c| (c as u32).to_le_bytes()).collect();
    let (start, len) = self.element_store_mut("character")?.insert_run(&bytes)?;
    Ok(run_to_bytes(start, len))
  }

  fn encode_sequence(&mut self, element_type: &str, value: &TypedValue, field: Option<&FieldDef>, is_set: bool) -> EngineResult<Vec<u8>> {
    let items: &[TypedValue] = match value {
      TypedValue::Array(v) if !is_set => v,
      TypedValue::Set(v) if is_set => v,
      _ => return Err(ValueError::WrongShape { field: field_name(field), expected: if is_set { "set" } else { "array" } }.into()),
    };
    let mut bytes = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for item in items {
      let encoded = self.encode_value(element_type, item, None)?;
      if is_set && !seen.insert(encoded.clone()) {
        return Err(ValueError::DuplicateSetElement(format!("{item:?}")).into());
      }
      bytes.extend_from_slice(&encoded);
    }
    let (start, len) = self.element_store_mut(element_type)?.insert_run(&bytes)?;
    Ok(run_to_bytes(start, len))
  }

  fn encode_dictionary(&mut self, key_type: &str, value_type: &str, entry_name: &str, value: &TypedValue, field: Option<&FieldDef>) -> EngineResult<Vec<u8>> {
    let entries = match value {
      TypedValue::Dict(d) => d,
      _ => return Err(ValueError::WrongShape { field: field_name(field), expected: "dictionary" }.into()),
    };
    let mut index_bytes = Vec::new();
    let mut seen_keys = std::collections::HashSet::new();
    for (k, v) in entries {
      let key_bytes = self.encode_value(key_type, k, None)?;
      if !seen_keys.insert(key_bytes) {
        return Err(ValueError::DuplicateDictKey(format!("{k:?}")).into());
      }
      let entry = CompositeValue::new(entry_name).with_field("key", k.clone()).with_field("value", v.clone());
      let idx = self.intern_composite(&entry)?;
      index_bytes.extend_from_slice(&idx.to_le_bytes());
    }
    let (start, len) = self.element_store_mut(entry_name)?.insert_run(&index_bytes)?;
    Ok(run_to_bytes(start, len))
  }

  fn encode_composite_ref(&mut self, kind: &Kind, value: &TypedValue, field: Option<&FieldDef>) -> EngineResult<Vec<u8>> {
    if let TypedValue::TagRef(tag) = value {
      let (_, idx) = self.resolve_tag(tag)?;
      return Ok(idx.to_le_bytes().to_vec());
    }
    let cv = match value {
      TypedValue::Composite(cv) => cv,
      _ => return Err(ValueError::WrongShape { field: field_name(field), expected: "composite" }.into()),
    };
    let _ = kind;
    let idx = self.intern_composite(cv)?;
    Ok(idx.to_le_bytes().to_vec())
  }

  fn encode_interface_ref(&mut self, iface_name: &str, value: &TypedValue, field: Option<&FieldDef>) -> EngineResult<Vec<u8>> {
    if let TypedValue::TagRef(tag) = value {
      let (type_name, idx) = self.resolve_tag(tag)?;
      if !self.registry.implements(&type_name, iface_name) {
        return Err(ValueError::InterfaceNotImplemented { field: field_name(field), concrete: type_name, iface: iface_name.to_string() }.into());
      }
      let type_id = self.type_ids.id_for(&type_name);
      let mut out = Vec::with_capacity(6);
      out.extend_from_slice(&type_id.to_le_bytes());
      out.extend_from_slice(&idx.to_le_bytes());
      return Ok(out);
    }
    let cv = match value {
      TypedValue::Interface(cv) => cv.as_ref(),
      _ => return Err(ValueError::WrongShape { field: field_name(field), expected: "interface value" }.into()),
    };
    if !self.registry.implements(&cv.type_name, iface_name) {
      return Err(ValueError::InterfaceNotImplemented {
        field: field_name(field),
        concrete: cv.type_name.clone(),
        iface: iface_name.to_string(),
      }
      .into());
    }
    let idx = self.intern_composite(cv)?;
    let type_id = self.type_ids.id_for(&cv.type_name);
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&type_id.to_le_bytes());
    out.extend_from_slice(&idx.to_le_bytes());
    Ok(out)
  }

  fn resolve_tag(&self, tag: &str) -> EngineResult<(String, u32)> {
    self
      .active_scope
      .as_ref()
      .and_then(|scope| scope.get(tag))
      .cloned()
      .ok_or_else(|| ValueError::WrongShape { field: tag.to_string(), expected: "tag bound in an open scope" }.into())
  }

  fn encode_bare_enum(&self, e: &crate::schema::BareEnumDef, value: &TypedValue, field: Option<&FieldDef>) -> EngineResult<Vec<u8>> {
    let variant = match value {
      TypedValue::EnumBare { variant, .. } => variant,
      _ => return Err(ValueError::WrongShape { field: field_name(field), expected: "bare enum variant" }.into()),
    };
    let disc = e
      .discriminant_of(variant)
      .ok_or_else(|| ValueError::UnknownDiscriminant(0, e.name.clone()))?;
    let width = required_byte_width(e.max_discriminant());
    Ok(disc.to_le_bytes()[..width].to_vec())
  }

  fn encode_payload_enum(&mut self, e: &crate::schema::PayloadEnumDef, value: &TypedValue, field: Option<&FieldDef>) -> EngineResult<Vec<u8>> {
    let (variant, payload) = match value {
      TypedValue::EnumPayload { variant, payload, .. } => (variant, payload),
      _ => return Err(ValueError::WrongShape { field: field_name(field), expected: "payload enum value" }.into()),
    };
    let vdef = e.variant(variant).ok_or_else(|| ValueError::UnknownDiscriminant(0, e.name.clone()))?;
    let disc = e.discriminant_of(variant).unwrap();
    let max_disc = e.variants.iter().enumerate().map(|(i, v)| v.discriminant.unwrap_or(i as u64)).max().unwrap_or(0);
    let width = required_byte_width(max_disc);
    let index: u32 = match &vdef.fields {
      Some(fields) => {
        let cv = payload.clone().ok_or_else(|| ValueError::MissingRequiredField(variant.clone()))?;
        let (mask, slots) = self.encode_fields(&fields.clone(), &cv)?;
        let vc = self
          .variant_catalogs
          .get_mut(&e.name)
          .ok_or_else(|| SchemaError::UnknownType(e.name.clone()))?;
        let cat = vc.catalog_mut(variant).ok_or_else(|| SchemaError::UnknownType(variant.clone()))?;
        cat.insert_raw(&mask, &slots)?
      }
      None => u32::MAX,
    };
    let mut out = disc.to_le_bytes()[..width].to_vec();
    out.extend_from_slice(&index.to_le_bytes());
    Ok(out)
  }

  fn intern_composite(&mut self, cv: &CompositeValue) -> EngineResult<u32> {
    let (mask, slots) = self.encode_record(&cv.type_name, cv)?;
    let catalog = self.catalogs.get_mut(&cv.type_name).ok_or_else(|| SchemaError::UnknownType(cv.type_name.clone()))?;
    Ok(catalog.insert_raw(&mask, &slots)?)
  }

  // -- reading -------------------------------------------------------
  //
  // Composite/interface references are resolved eagerly into nested
  // `TypedValue`s for caller convenience. A genuine cycle (built via
  // `Scope`/`Tag`, spec §4.7) would recurse forever doing that, so every
  // recursive read carries a `visiting` set of `(type, index)` pairs
  // currently on the call stack; re-entering one stops the recursion and
  // reports it as a null rather than looping (the slot itself is untouched
  // — only this read's expansion of it stops).

  pub(crate) fn read_composite(&self, type_name: &str, index: u32) -> EngineResult<TypedValue> {
    let mut visiting = std::collections::HashSet::new();
    self.read_composite_inner(type_name, index, &mut visiting)
  }

  fn read_composite_inner(
    &self,
    type_name: &str,
    index: u32,
    visiting: &mut std::collections::HashSet<(String, u32)>,
  ) -> EngineResult<TypedValue> {
    let catalog = self.catalogs.get(type_name).ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
    let count = catalog.count();
    if (index as u64) >= count {
      return Err(ReferenceError::OutOfBounds { type_name: type_name.to_string(), index, count }.into());
    }
    if catalog.is_tombstoned(index) {
      return Err(ReferenceError::Tombstoned { type_name: type_name.to_string(), index }.into());
    }
    if !visiting.insert((type_name.to_string(), index)) {
      return Ok(TypedValue::Null);
    }
    let (mask, slots) = catalog.read_raw(index);
    let fields = self.registry.effective_fields(type_name);
    let mut cv = CompositeValue::new(type_name);
    for (i, field) in fields.iter().enumerate() {
      let value = if mask[i] { TypedValue::Null } else { self.decode_value(&field.type_name, &slots[i], visiting) };
      cv.fields.insert(field.name.clone(), value);
    }
    visiting.remove(&(type_name.to_string(), index));
    Ok(TypedValue::Composite(cv))
  }

  /// Decodes a slot's bytes into a value. Reference errors (dangling or
  /// out-of-bounds composite/interface slots) degrade to a logical null
  /// rather than aborting the surrounding traversal (spec §7).
  fn decode_value(&self, type_name: &str, bytes: &[u8], visiting: &mut std::collections::HashSet<(String, u32)>) -> TypedValue {
    match self.try_decode_value(type_name, bytes, visiting) {
      Ok(v) => v,
      Err(e) => {
        tracing::warn!(type_name, error = %e, "reference degraded to null on read");
        TypedValue::Null
      }
    }
  }

  fn try_decode_value(
    &self,
    type_name: &str,
    bytes: &[u8],
    visiting: &mut std::collections::HashSet<(String, u32)>,
  ) -> EngineResult<TypedValue> {
    let kind = self.resolved_kind(type_name)?;
    Ok(match kind {
      Kind::Primitive(p) => self.decode_primitive(p.width as usize, p.encoding, bytes),
      Kind::Boolean { .. } => TypedValue::Bool(bytes[0] != 0),
      Kind::String { .. } => {
        let (start, len) = read_run(bytes);
        let raw = self.element_store("character").map(|s| s.read_run(start, len)).unwrap_or_default();
        let s: String = raw
          .chunks(4)
          .filter_map(|c| char::from_u32(u32::from_le_bytes(c.try_into().unwrap())))
          .collect();
        TypedValue::Str(s)
      }
      Kind::Array(a) => TypedValue::Array(self.decode_sequence(&a.element, bytes, visiting)),
      Kind::Set(s) => TypedValue::Set(self.decode_sequence(&s.element, bytes, visiting)),
      Kind::Dictionary(d) => self.decode_dictionary(&d.entry_composite_name(), bytes, visiting)?,
      Kind::Composite(c) => self.read_composite_inner(&c.name, u32::from_le_bytes(bytes.try_into().unwrap()), visiting)?,
      Kind::Interface(_) => {
        let type_id = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        let idx = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
        let concrete = self.type_ids.name_for(type_id).ok_or_else(|| SchemaError::UnknownType(format!("type-id {type_id}")))?;
        let resolved = self.read_composite_inner(concrete, idx, visiting)?;
        match resolved {
          TypedValue::Composite(cv) => TypedValue::Interface(Box::new(cv)),
          other => other,
        }
      }
      Kind::Enum(e) => {
        let width = required_byte_width(e.max_discriminant());
        let disc = le_to_u64(&bytes[..width]);
        let variant = e.variant_with_discriminant(disc).unwrap_or("").to_string();
        TypedValue::EnumBare { enum_name: e.name.clone(), variant }
      }
      Kind::PayloadEnum(e) => self.decode_payload_enum(e, bytes, visiting)?,
      Kind::Bigint { .. } => {
        let (start, len) = read_run(bytes);
        let raw = self.element_store("$bigint").map(|s| s.read_run(start, len)).unwrap_or_default();
        TypedValue::BigInt(numeric::decode_bigint(&raw))
      }
      Kind::Biguint { .. } => {
        let (start, len) = read_run(bytes);
        let raw = self.element_store("$biguint").map(|s| s.read_run(start, len)).unwrap_or_default();
        TypedValue::BigUInt(numeric::decode_biguint(&raw))
      }
      Kind::Fraction { .. } => {
        let ns = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let nl = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let ds = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let dl = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let num = self.element_store("$fraction_num").map(|s| s.read_run(ns, nl)).unwrap_or_default();
        let den = self.element_store("$fraction_den").map(|s| s.read_run(ds, dl)).unwrap_or_default();
        TypedValue::Fraction(numeric::decode_fraction(&num, &den))
      }
      Kind::Alias(_) => unreachable!("resolved_kind already followed aliases"),
    })
  }

  fn decode_primitive(&self, width: usize, encoding: PrimitiveEncoding, bytes: &[u8]) -> TypedValue {
    match (width, encoding) {
      (4, PrimitiveEncoding::Ieee754) => TypedValue::F32(f32::from_le_bytes(bytes.try_into().unwrap())),
      (8, PrimitiveEncoding::Ieee754) => TypedValue::F64(f64::from_le_bytes(bytes.try_into().unwrap())),
      (1, PrimitiveEncoding::UnsignedInt) => TypedValue::U8(bytes[0]),
      (2, PrimitiveEncoding::UnsignedInt) => TypedValue::U16(u16::from_le_bytes(bytes.try_into().unwrap())),
      (4, PrimitiveEncoding::UnsignedInt) => TypedValue::U32(u32::from_le_bytes(bytes.try_into().unwrap())),
      (8, PrimitiveEncoding::UnsignedInt) => TypedValue::U64(u64::from_le_bytes(bytes.try_into().unwrap())),
      (16, PrimitiveEncoding::UnsignedInt) => TypedValue::U128(u128::from_le_bytes(bytes.try_into().unwrap())),
      (1, PrimitiveEncoding::SignedInt) => TypedValue::I8(bytes[0] as i8),
      (2, PrimitiveEncoding::SignedInt) => TypedValue::I16(i16::from_le_bytes(bytes.try_into().unwrap())),
      (4, PrimitiveEncoding::SignedInt) => TypedValue::I32(i32::from_le_bytes(bytes.try_into().unwrap())),
      (8, PrimitiveEncoding::SignedInt) => TypedValue::I64(i64::from_le_bytes(bytes.try_into().unwrap())),
      (16, PrimitiveEncoding::SignedInt) => TypedValue::I128(i128::from_le_bytes(bytes.try_into().unwrap())),
      _ => TypedValue::Null,
    }
  }

  fn decode_sequence(&self, element_type: &str, bytes: &[u8], visiting: &mut std::collections::HashSet<(String, u32)>) -> Vec<TypedValue> {
    let (start, len) = read_run(bytes);
    let store = match self.element_store(element_type) {
      Some(s) => s,
      None => return Vec::new(),
    };
    let width = store.element_width();
    let raw = store.read_run(start, len);
    raw.chunks(width).map(|chunk| self.decode_value(element_type, chunk, visiting)).collect()
  }

  fn decode_dictionary(
    &self,
    entry_name: &str,
    bytes: &[u8],
    visiting: &mut std::collections::HashSet<(String, u32)>,
  ) -> EngineResult<TypedValue> {
    let (start, len) = read_run(bytes);
    let store = match self.element_store(entry_name) {
      Some(s) => s,
      None => return Ok(TypedValue::Dict(Vec::new())),
    };
    let raw = store.read_run(start, len);
    let mut out = Vec::new();
    for chunk in raw.chunks(4) {
      let idx = u32::from_le_bytes(chunk.try_into().unwrap());
      if let TypedValue::Composite(cv) = self.read_composite_inner(entry_name, idx, visiting)? {
        let k = cv.fields.get("key").cloned().unwrap_or(TypedValue::Null);
        let v = cv.fields.get("value").cloned().unwrap_or(TypedValue::Null);
        out.push((k, v));
      }
    }
    Ok(TypedValue::Dict(out))
  }

  fn decode_payload_enum(
    &self,
    e: &crate::schema::PayloadEnumDef,
    bytes: &[u8],
    visiting: &mut std::collections::HashSet<(String, u32)>,
  ) -> EngineResult<TypedValue> {
    let max_disc = e.variants.iter().enumerate().map(|(i, v)| v.discriminant.unwrap_or(i as u64)).max().unwrap_or(0);
    let width = required_byte_width(max_disc);
    let disc = le_to_u64(&bytes[..width]);
    let idx = u32::from_le_bytes(bytes[width..width + 4].try_into().unwrap());
    let variant = e
      .variants
      .iter()
      .enumerate()
      .find(|(i, v)| v.discriminant.unwrap_or(*i as u64) == disc)
      .map(|(_, v)| v)
      .ok_or_else(|| ValueError::UnknownDiscriminant(disc, e.name.clone()))?;
    let payload = if let Some(fields) = &variant.fields {
      if idx == u32::MAX {
        None
      } else {
        let vc = self.variant_catalogs.get(&e.name).ok_or_else(|| SchemaError::UnknownType(e.name.clone()))?;
        let cat = vc.catalog(&variant.name).ok_or_else(|| SchemaError::UnknownType(variant.name.clone()))?;
        let (mask, slots) = cat.read_raw(idx);
        let mut cv = CompositeValue::new(format!("{}::{}", e.name, variant.name));
        for (i, f) in fields.iter().enumerate() {
          let v = if mask[i] { TypedValue::Null } else { self.decode_value(&f.type_name, &slots[i], visiting) };
          cv.fields.insert(f.name.clone(), v);
        }
        Some(cv)
      }
    } else {
      None
    };
    Ok(TypedValue::EnumPayload { enum_name: e.name.clone(), variant: variant.name.clone(), payload })
  }

  /// Every live usage of a value of type `type_name` (spec §4.6's type-
  /// faceted query, §6.5): for each composite whose schema contains a field
  /// whose effective type resolves to `type_name` (`Registry::references_to`),
  /// every live record of that composite, projected down to just that field.
  pub fn iter_values(&self, type_name: &str) -> EngineResult<Vec<ValueUsage>> {
    let mut out = Vec::new();
    for (owner, field_name) in self.registry.references_to(type_name) {
      let catalog = match self.catalogs.get(&owner) {
        Some(c) => c,
        None => continue,
      };
      let fields = self.registry.effective_fields(&owner);
      let pos = match fields.iter().position(|f| f.name == field_name) {
        Some(p) => p,
        None => continue,
      };
      for index in catalog.iter_live() {
        let (mask, slots) = catalog.read_raw(index);
        let mut visiting = std::collections::HashSet::new();
        let value = if mask[pos] { TypedValue::Null } else { self.decode_value(&fields[pos].type_name, &slots[pos], &mut visiting) };
        out.push(ValueUsage { composite: owner.clone(), index, field: field_name.clone(), value });
      }
    }
    Ok(out)
  }
}

fn field_name(field: Option<&FieldDef>) -> String {
  field.map(|f| f.name.clone()).unwrap_or_else(|| "<element>".to_string())
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

fn value_as_u128(value: &TypedValue) -> Option<u128> {
  match value {
    TypedValue::U8(v) => Some(*v as u128),
    TypedValue::U16(v) => Some(*v as u128),
    TypedValue::U32(v) => Some(*v as u128),
    TypedValue::U64(v) => Some(*v as u128),
    TypedValue::U128(v) => Some(*v),
    _ => None,
  }
}

fn value_as_i128(value: &TypedValue) -> Option<i128> {
  match value {
    TypedValue::I8(v) => Some(*v as i128),
    TypedValue::I16(v) => Some(*v as i128),
    TypedValue::I32(v) => Some(*v as i128),
    TypedValue::I64(v) => Some(*v as i128),
    TypedValue::I128(v) => Some(*v),
    _ => None,
  }
}

/// Stages a value down to the `u128` `encode_primitive` writes from. A
/// `BigInt`/`BigUInt` that can't fit in 128 bits at all is a narrowing
/// conversion and always errors regardless of the field's overflow policy
/// (spec §4.8); the field's policy still governs the final range check once
/// the value has been staged.
fn narrowing_as_u128(value: &TypedValue, field: &str) -> Result<u128, ValueError> {
  match value {
    TypedValue::BigInt(v) => v.to_u128().ok_or_else(|| ValueError::NarrowingOverflow(field.to_string())),
    TypedValue::BigUInt(v) => v.to_u128().ok_or_else(|| ValueError::NarrowingOverflow(field.to_string())),
    _ => value_as_u128(value).ok_or_else(|| ValueError::WrongShape { field: field.to_string(), expected: "unsigned integer" }),
  }
}

/// As [`narrowing_as_u128`] but for signed fields.
fn narrowing_as_i128(value: &TypedValue, field: &str) -> Result<i128, ValueError> {
  match value {
    TypedValue::BigInt(v) => v.to_i128().ok_or_else(|| ValueError::NarrowingOverflow(field.to_string())),
    TypedValue::BigUInt(v) => v.to_i128().ok_or_else(|| ValueError::NarrowingOverflow(field.to_string())),
    _ => value_as_i128(value).ok_or_else(|| ValueError::WrongShape { field: field.to_string(), expected: "signed integer" }),
  }
}
