//! Persistence of the Schema Registry to the well-known `_metadata.yaml`
//! document in a data directory (spec §4.5, §6.2).

use super::{Kind, Registry, TypeIdTable};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const METADATA_FILE_NAME: &str = "_metadata.yaml";

#[derive(Serialize, Deserialize)]
struct SchemaDocument {
  types: Vec<Kind>,
  #[serde(rename = "type-ids")]
  type_ids: TypeIdTable,
}

/// Serialises `registry`/`type_ids` to `dir/_metadata.yaml`.
pub fn save(dir: &Path, registry: &Registry, type_ids: &TypeIdTable) -> Result<(), EngineError> {
  let doc = SchemaDocument {
    types: registry.iter_in_order().cloned().collect(),
    type_ids: type_ids.clone(),
  };
  let text = serde_yaml::to_string(&doc).map_err(|e| EngineError::Document(e.to_string()))?;
  std::fs::write(dir.join(METADATA_FILE_NAME), text)?;
  Ok(())
}

/// Loads a previously-saved schema document, reconstructing a `Registry`
/// (including its built-in kinds, which were themselves persisted) and a
/// `TypeIdTable`.
pub fn load(dir: &Path) -> Result<(Registry, TypeIdTable), EngineError> {
  let text = std::fs::read_to_string(dir.join(METADATA_FILE_NAME))?;
  let doc: SchemaDocument =
    serde_yaml::from_str(&text).map_err(|e| EngineError::Document(e.to_string()))?;
  let mut registry = Registry::empty();
  for kind in doc.types {
    registry
      .register(kind)
      .map_err(|e| EngineError::Document(format!("corrupt schema document: {e}")))?;
  }
  Ok((registry, doc.type_ids))
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::schema::{CompositeDef, FieldDef, Kind};

  #[test]
  fn round_trips_through_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = Registry::new();
    registry
      .register(Kind::Composite(CompositeDef {
        name: "Widget".into(),
        fields: vec![FieldDef::new("name", "string")],
        parent: None,
        interfaces: vec![],
      }))
      .unwrap();
    let mut type_ids = TypeIdTable::new();
    type_ids.id_for("Widget");

    save(dir.path(), &registry, &type_ids).unwrap();
    let (loaded, loaded_ids) = load(dir.path()).unwrap();

    assert!(loaded.lookup("Widget").is_some());
    assert_eq!(type_ids.get("Widget"), loaded_ids.get("Widget"));
  }
}
