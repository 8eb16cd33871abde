//! Stable uint16 type-ids assigned to composites for use in interface-typed
//! slots (spec §4.5, §6.3). Assigned on first registration, persisted
//! alongside the schema document, never recycled even if the composite is
//! later dropped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TypeIdTable {
  by_name: HashMap<String, u16>,
  next: u16,
}

impl TypeIdTable {
  pub fn new() -> Self {
    TypeIdTable { by_name: HashMap::new(), next: 0 }
  }

  /// Returns the existing type-id for `composite`, assigning a fresh one if
  /// this is the first time it's been seen. Ids are never recycled: a
  /// dropped composite's id stays retired for the lifetime of the table.
  pub fn id_for(&mut self, composite: &str) -> u16 {
    if let Some(id) = self.by_name.get(composite) {
      return *id;
    }
    let id = self.next;
    self.next = self.next.checked_add(1).expect("exhausted 16-bit type-id space");
    self.by_name.insert(composite.to_string(), id);
    id
  }

  pub fn name_for(&self, id: u16) -> Option<&str> {
    self.by_name.iter().find(|(_, v)| **v == id).map(|(k, _)| k.as_str())
  }

  pub fn get(&self, composite: &str) -> Option<u16> {
    self.by_name.get(composite).copied()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn assigns_stable_increasing_ids() {
    let mut t = TypeIdTable::new();
    assert_eq!(0, t.id_for("A"));
    assert_eq!(1, t.id_for("B"));
    assert_eq!(0, t.id_for("A"));
  }

  #[test]
  fn name_for_resolves_back() {
    let mut t = TypeIdTable::new();
    let id = t.id_for("Widget");
    assert_eq!(Some("Widget"), t.name_for(id));
  }
}
