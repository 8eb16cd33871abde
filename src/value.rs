//! The in-memory typed value (spec §4.6, §6.5): what callers pass to
//! `Engine::insert`/`Engine::update` and what `Engine::read`/`iter_values`
//! hand back. This is the interface an out-of-scope dump/query layer would
//! consume, per spec §1.

use num_bigint::{BigInt, BigUint};
use num_rational::BigRational;
use std::collections::BTreeMap;

/// A fully-resolved composite instance: field name to value, in whatever
/// order the caller supplies (order doesn't matter for writes — the
/// schema's declaration order drives layout).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CompositeValue {
  pub type_name: String,
  pub fields: BTreeMap<String, TypedValue>,
}

impl CompositeValue {
  pub fn new(type_name: impl Into<String>) -> Self {
    CompositeValue { type_name: type_name.into(), fields: BTreeMap::new() }
  }

  pub fn with_field(mut self, name: impl Into<String>, value: TypedValue) -> Self {
    self.fields.insert(name.into(), value);
    self
  }
}

/// A language-level value for any schema entity kind (spec §4.6).
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
  Null,
  Bool(bool),
  U8(u8),
  I8(i8),
  U16(u16),
  I16(i16),
  U32(u32),
  I32(i32),
  U64(u64),
  I64(i64),
  U128(u128),
  I128(i128),
  F32(f32),
  F64(f64),
  Str(String),
  Array(Vec<TypedValue>),
  Set(Vec<TypedValue>),
  Dict(Vec<(TypedValue, TypedValue)>),
  /// A nested composite to be interned into its own Table Catalog, or the
  /// result of reading one back.
  Composite(CompositeValue),
  /// An interface-typed reference: the concrete composite's value plus the
  /// interface it's being viewed through isn't needed here (callers know
  /// the field's declared interface from the schema); this variant just
  /// carries the concrete composite's value.
  Interface(Box<CompositeValue>),
  EnumBare { enum_name: String, variant: String },
  EnumPayload { enum_name: String, variant: String, payload: Option<CompositeValue> },
  BigInt(BigInt),
  BigUInt(BigUint),
  Fraction(BigRational),
  /// A reference to a tag reserved earlier in the enclosing `Scope`, used
  /// to build cyclic composite graphs (spec §4.7). Valid only for
  /// composite- or interface-typed fields, and only while the scope that
  /// reserved the tag is still open.
  TagRef(String),
}

/// One usage surfaced by `Engine::iter_values(type_name)` (spec §4.6, §6.5):
/// a live record of `composite` whose `field` resolves to the queried type,
/// paired with that field's fully-resolved value.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueUsage {
  pub composite: String,
  pub index: u32,
  pub field: String,
  pub value: TypedValue,
}

impl TypedValue {
  pub fn is_null(&self) -> bool {
    matches!(self, TypedValue::Null)
  }

  pub fn as_composite(&self) -> Option<&CompositeValue> {
    match self {
      TypedValue::Composite(c) => Some(c),
      _ => None,
    }
  }
}
