//! The error taxonomy for the engine: schema errors, value errors, reference
//! errors, and I/O errors, per the propagation policy described in the
//! schema registry and reference resolver modules.
//!
//! Schema and value errors abort the operation with no partial mutation.
//! Reference errors are surfaced from read paths as a diagnostic alongside
//! a logical null rather than aborting iteration; callers that need to tell
//! "real null" from "dangling reference" can match on [`ReferenceError`].

use thiserror::Error;

/// Errors rejected before any write, while a schema entity is registered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
  #[error("unknown type: {0}")]
  UnknownType(String),

  #[error("cycle detected in interface extends chain: {0:?}")]
  InterfaceCycle(Vec<String>),

  #[error("cycle detected in composite extends chain: {0:?}")]
  CompositeCycle(Vec<String>),

  #[error("duplicate field '{field}' in type '{type_name}'")]
  DuplicateField { type_name: String, field: String },

  #[error("forward stub '{0}' was never populated")]
  UnpopulatedForwardStub(String),

  #[error("enum variant '{0}' declares both an explicit discriminant and associated fields")]
  PayloadEnumVariantConflict(String),

  #[error("name '{0}' is already registered")]
  DuplicateName(String),

  #[error("overflow wrapper attached to non-integer field '{0}'")]
  OverflowOnNonInteger(String),

  #[error("composite type '{0}' has zero fields, which degenerates its record size to zero")]
  ZeroFieldComposite(String),

  #[error("'{0}' is not a composite type")]
  NotAComposite(String),
}

/// Errors rejected during insert/update, after schema validation passes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
  #[error("value {value} out of range for field '{field}' under the 'error' overflow policy")]
  Overflow { field: String, value: String },

  #[error("narrowing conversion overflow for field '{0}'")]
  NarrowingOverflow(String),

  #[error("duplicate key in dictionary literal: {0}")]
  DuplicateDictKey(String),

  #[error("duplicate element in set literal, which was declared unique: {0}")]
  DuplicateSetElement(String),

  #[error("string element is not a sequence of characters")]
  NotACharacterSequence,

  #[error("discriminant {0} is not present in enum '{1}'")]
  UnknownDiscriminant(u64, String),

  #[error("value for interface field '{field}' has concrete type '{concrete}', which does not implement '{iface}'")]
  InterfaceNotImplemented {
    field: String,
    concrete: String,
    iface: String,
  },

  #[error("wrong value shape for field '{field}': expected {expected}")]
  WrongShape { field: String, expected: &'static str },

  #[error("unknown field '{0}'")]
  UnknownField(String),

  #[error("field '{0}' has no default and no value was supplied")]
  MissingRequiredField(String),
}

/// Errors surfaced while reading an already-written record. These never
/// abort an `iter_live`/`iter_values` traversal; the offending slot reads
/// back as a logical null alongside the diagnostic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
  #[error("index {index} is out of bounds for '{type_name}' (count = {count})")]
  OutOfBounds {
    type_name: String,
    index: u32,
    count: u64,
  },

  #[error("reference into '{type_name}' at index {index} is tombstoned")]
  Tombstoned { type_name: String, index: u32 },
}

/// The top-level error type returned by every public `Engine` operation.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error(transparent)]
  Schema(#[from] SchemaError),

  #[error(transparent)]
  Value(#[from] ValueError),

  #[error(transparent)]
  Reference(#[from] ReferenceError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("another engine instance already holds the lock for this data directory")]
  AlreadyOpen,

  #[error("output directory already exists: {0}")]
  OutputDirectoryExists(String),

  #[error("schema document error: {0}")]
  Document(String),

  #[error("archive error: {0}")]
  Archive(String),

  #[error("compaction error: {0}")]
  Compaction(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
