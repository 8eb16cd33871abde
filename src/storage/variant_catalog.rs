//! Variant Catalog (spec §4.4, §6.1): a payload-bearing enum gets one
//! Table Catalog per variant that carries fields, stored as
//! `<Enum>/<Variant>.bin`. Bare variants (no payload) need no storage at
//! all — they're fully represented by their discriminant.

use super::catalog::{Catalog, RecordLayout};
use crate::error::SchemaError;
use crate::schema::{PayloadEnumDef, Registry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The per-enum directory of per-payload-variant Table Catalogs.
pub struct VariantCatalog {
  dir: PathBuf,
  variants: HashMap<String, Catalog>,
}

impl VariantCatalog {
  fn variant_path(dir: &Path, variant: &str) -> PathBuf {
    dir.join(format!("{variant}.bin"))
  }

  fn layout_for(def: &PayloadEnumDef, variant: &str, registry: &Registry) -> Option<Result<RecordLayout, SchemaError>> {
    let v = def.variant(variant)?;
    let fields = v.fields.as_ref()?;
    Some(RecordLayout::compute(fields.clone(), registry))
  }

  pub fn create(dir: impl AsRef<Path>, def: &PayloadEnumDef, registry: &Registry) -> std::io::Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    let mut variants = HashMap::new();
    for v in &def.variants {
      if v.fields.is_some() {
        let layout = Self::layout_for(def, &v.name, registry)
          .expect("variant fields")
          .expect("layout already validated at registration time");
        let path = Self::variant_path(&dir, &v.name);
        variants.insert(v.name.clone(), Catalog::create(path, layout)?);
      }
    }
    Ok(VariantCatalog { dir, variants })
  }

  pub fn open(dir: impl AsRef<Path>, def: &PayloadEnumDef, registry: &Registry) -> std::io::Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    let mut variants = HashMap::new();
    for v in &def.variants {
      if v.fields.is_some() {
        let layout = Self::layout_for(def, &v.name, registry)
          .expect("variant fields")
          .expect("layout already validated at registration time");
        let path = Self::variant_path(&dir, &v.name);
        variants.insert(v.name.clone(), Catalog::open(path, layout)?);
      }
    }
    Ok(VariantCatalog { dir, variants })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn catalog(&self, variant: &str) -> Option<&Catalog> {
    self.variants.get(variant)
  }

  pub fn catalog_mut(&mut self, variant: &str) -> Option<&mut Catalog> {
    self.variants.get_mut(variant)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::schema::{FieldDef, PayloadVariantDef};

  fn sample_def() -> PayloadEnumDef {
    PayloadEnumDef {
      name: "Shape".into(),
      variants: vec![
        PayloadVariantDef { name: "Circle".into(), discriminant: None, fields: Some(vec![FieldDef::new("radius", "uint32")]) },
        PayloadVariantDef { name: "Point".into(), discriminant: None, fields: None },
      ],
    }
  }

  #[test]
  fn bare_variant_gets_no_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new();
    let def = sample_def();
    let vc = VariantCatalog::create(dir.path().join("Shape"), &def, &registry).unwrap();
    assert!(vc.catalog("Circle").is_some());
    assert!(vc.catalog("Point").is_none());
  }

  #[test]
  fn payload_variant_round_trips_through_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new();
    let def = sample_def();
    let path = dir.path().join("Shape");
    {
      let mut vc = VariantCatalog::create(&path, &def, &registry).unwrap();
      let cat = vc.catalog_mut("Circle").unwrap();
      cat.insert_raw(&[false], &[5u32.to_le_bytes().to_vec()]).unwrap();
    }
    let vc = VariantCatalog::open(&path, &def, &registry).unwrap();
    let cat = vc.catalog("Circle").unwrap();
    assert_eq!(1, cat.count());
  }
}
