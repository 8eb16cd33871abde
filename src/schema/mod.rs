//! The schema: the closed set of entity kinds a name can resolve to (spec
//! §3.1), composite record layout derivation (spec §3.2), and the registry
//! that ties names together and persists them (spec §4.5, §6.2).

pub mod document;
pub mod registry;
pub mod typeid;

pub use registry::Registry;
pub use typeid::TypeIdTable;

use crate::numeric::OverflowPolicy;
use serde::{Deserialize, Serialize};

/// A primitive's byte encoding. `width` is always one of `{1, 2, 4, 8, 16}`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrimitiveEncoding {
  UnsignedInt,
  SignedInt,
  Ieee754,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveDef {
  pub name: String,
  pub width: u8,
  pub encoding: PrimitiveEncoding,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AliasDef {
  pub name: String,
  pub target: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArrayDef {
  pub name: String,
  pub element: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetDef {
  pub name: String,
  pub element: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DictDef {
  pub name: String,
  pub key: String,
  pub value: String,
}

impl DictDef {
  /// The synthetic entry composite's name, e.g. `Dict_UserId_Account`.
  pub fn entry_composite_name(&self) -> String {
    format!("Dict_{}_{}", self.key, self.value)
  }
}

/// A literal default value for a field, as it appears in the schema
/// document. Values too wide for a 64-bit integer are kept as decimal
/// strings, per spec §4.5.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultValue {
  Null,
  Bool(bool),
  Int(i64),
  UInt(u64),
  Float(f64),
  /// 128-bit integers and BigInt/BigUInt/Fraction defaults, serialised as
  /// decimal (or `numerator/denominator`) text.
  Decimal(String),
  Str(String),
  EnumVariant(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
  pub name: String,
  pub type_name: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub default: Option<DefaultValue>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub overflow: Option<OverflowPolicy>,
}

impl FieldDef {
  pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
    FieldDef {
      name: name.into(),
      type_name: type_name.into(),
      default: None,
      overflow: None,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeDef {
  pub name: String,
  pub fields: Vec<FieldDef>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub parent: Option<String>,
  #[serde(default)]
  pub interfaces: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDef {
  pub name: String,
  pub fields: Vec<FieldDef>,
  #[serde(default)]
  pub parents: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantDecl {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub discriminant: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BareEnumDef {
  pub name: String,
  pub variants: Vec<VariantDecl>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub backing: Option<String>,
}

impl BareEnumDef {
  /// The maximum discriminant across all variants, defaulting to ordinal
  /// position for variants without an explicit one.
  pub fn max_discriminant(&self) -> u64 {
    self
      .variants
      .iter()
      .enumerate()
      .map(|(i, v)| v.discriminant.unwrap_or(i as u64))
      .max()
      .unwrap_or(0)
  }

  /// Resolves the discriminant for `variant_name`, if present.
  pub fn discriminant_of(&self, variant_name: &str) -> Option<u64> {
    self
      .variants
      .iter()
      .enumerate()
      .find(|(_, v)| v.name == variant_name)
      .map(|(i, v)| v.discriminant.unwrap_or(i as u64))
  }

  pub fn variant_with_discriminant(&self, disc: u64) -> Option<&str> {
    self
      .variants
      .iter()
      .enumerate()
      .find(|(i, v)| v.discriminant.unwrap_or(*i as u64) == disc)
      .map(|(_, v)| v.name.as_str())
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayloadVariantDef {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub discriminant: Option<u64>,
  /// `None` for a bare variant within an otherwise payload-bearing enum.
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub fields: Option<Vec<FieldDef>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnumDef {
  pub name: String,
  pub variants: Vec<PayloadVariantDef>,
}

impl PayloadEnumDef {
  pub fn discriminant_of(&self, variant_name: &str) -> Option<u64> {
    self
      .variants
      .iter()
      .enumerate()
      .find(|(_, v)| v.name == variant_name)
      .map(|(i, v)| v.discriminant.unwrap_or(i as u64))
  }

  pub fn variant(&self, name: &str) -> Option<&PayloadVariantDef> {
    self.variants.iter().find(|v| v.name == name)
  }

  /// The per-variant directory name this enum's Variant Catalog lives
  /// under (spec §6.1: `<Enum>/<Variant>.bin`).
  pub fn directory_name(&self) -> &str {
    &self.name
  }
}

/// The closed set of schema entity kinds (spec §3.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Kind {
  Primitive(PrimitiveDef),
  Boolean { name: String },
  Alias(AliasDef),
  Array(ArrayDef),
  String { name: String },
  Set(SetDef),
  Dictionary(DictDef),
  Composite(CompositeDef),
  Interface(InterfaceDef),
  Enum(BareEnumDef),
  PayloadEnum(PayloadEnumDef),
  Bigint { name: String },
  Biguint { name: String },
  Fraction { name: String },
}

impl Kind {
  pub fn name(&self) -> &str {
    match self {
      Kind::Primitive(p) => &p.name,
      Kind::Boolean { name } => name,
      Kind::Alias(a) => &a.name,
      Kind::Array(a) => &a.name,
      Kind::String { name } => name,
      Kind::Set(s) => &s.name,
      Kind::Dictionary(d) => &d.name,
      Kind::Composite(c) => &c.name,
      Kind::Interface(i) => &i.name,
      Kind::Enum(e) => &e.name,
      Kind::PayloadEnum(e) => &e.name,
      Kind::Bigint { name } => name,
      Kind::Biguint { name } => name,
      Kind::Fraction { name } => name,
    }
  }

  pub fn as_composite(&self) -> Option<&CompositeDef> {
    match self {
      Kind::Composite(c) => Some(c),
      _ => None,
    }
  }

  pub fn as_interface(&self) -> Option<&InterfaceDef> {
    match self {
      Kind::Interface(i) => Some(i),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&ArrayDef> {
    match self {
      Kind::Array(a) => Some(a),
      _ => None,
    }
  }

  pub fn as_set(&self) -> Option<&SetDef> {
    match self {
      Kind::Set(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_dictionary(&self) -> Option<&DictDef> {
    match self {
      Kind::Dictionary(d) => Some(d),
      _ => None,
    }
  }

  pub fn as_bare_enum(&self) -> Option<&BareEnumDef> {
    match self {
      Kind::Enum(e) => Some(e),
      _ => None,
    }
  }

  pub fn as_payload_enum(&self) -> Option<&PayloadEnumDef> {
    match self {
      Kind::PayloadEnum(e) => Some(e),
      _ => None,
    }
  }

  pub fn as_primitive(&self) -> Option<&PrimitiveDef> {
    match self {
      Kind::Primitive(p) => Some(p),
      _ => None,
    }
  }
}

/// The four built-in character/primitive kinds every database starts with,
/// plus the numeric singletons. `character` backs every string/array-of-
/// character/string-set (spec §4.2).
pub fn builtin_kinds() -> Vec<Kind> {
  use PrimitiveEncoding::*;
  vec![
    Kind::Primitive(PrimitiveDef { name: "character".into(), width: 4, encoding: UnsignedInt }),
    Kind::Primitive(PrimitiveDef { name: "uint8".into(), width: 1, encoding: UnsignedInt }),
    Kind::Primitive(PrimitiveDef { name: "uint16".into(), width: 2, encoding: UnsignedInt }),
    Kind::Primitive(PrimitiveDef { name: "uint32".into(), width: 4, encoding: UnsignedInt }),
    Kind::Primitive(PrimitiveDef { name: "uint64".into(), width: 8, encoding: UnsignedInt }),
    Kind::Primitive(PrimitiveDef { name: "uint128".into(), width: 16, encoding: UnsignedInt }),
    Kind::Primitive(PrimitiveDef { name: "int8".into(), width: 1, encoding: SignedInt }),
    Kind::Primitive(PrimitiveDef { name: "int16".into(), width: 2, encoding: SignedInt }),
    Kind::Primitive(PrimitiveDef { name: "int32".into(), width: 4, encoding: SignedInt }),
    Kind::Primitive(PrimitiveDef { name: "int64".into(), width: 8, encoding: SignedInt }),
    Kind::Primitive(PrimitiveDef { name: "int128".into(), width: 16, encoding: SignedInt }),
    Kind::Primitive(PrimitiveDef { name: "float32".into(), width: 4, encoding: Ieee754 }),
    Kind::Primitive(PrimitiveDef { name: "float64".into(), width: 8, encoding: Ieee754 }),
    Kind::Boolean { name: "bool".into() },
    Kind::Array(ArrayDef { name: "character[]".into(), element: "character".into() }),
    Kind::String { name: "string".into() },
    Kind::Bigint { name: "bigint".into() },
    Kind::Biguint { name: "biguint".into() },
    Kind::Fraction { name: "fraction".into() },
  ]
}
