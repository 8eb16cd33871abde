//! Typed Tables: a file-backed, single-process, structured database built
//! around a user-defined type system (see `SPEC_FULL.md` for the full
//! engine specification this crate implements).

pub mod compact;
pub mod engine;
pub mod error;
pub mod math;
pub mod numeric;
pub mod resolver;
pub mod schema;
pub mod scope;
pub mod storage;
pub mod value;

pub mod archive;

pub use engine::{Engine, EngineOptions};
pub use error::{EngineError, EngineResult, ReferenceError, SchemaError, ValueError};
pub use value::{CompositeValue, TypedValue, ValueUsage};
