//! The `Engine`: the open-database handle that owns the Schema Registry,
//! every live Table Catalog / Element Store / Variant Catalog, the
//! per-directory lock, and the public CRUD surface (spec §2's "ninth
//! component", §5).

use crate::error::{EngineError, EngineResult, SchemaError};
use crate::schema::{document, Kind, Registry, TypeIdTable};
use crate::storage::catalog::RecordLayout;
use crate::storage::{Catalog, ElementStore, VariantCatalog};
use crate::value::{CompositeValue, TypedValue};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

const LOCK_FILE_NAME: &str = "_lock";

/// Element Store file names (spec §6.1): the four reserved numeric-byte
/// stores get their own fixed names; every other element type (including
/// the built-in `character` store backing strings, and synthetic
/// dictionary entry composites) is named after its element type directly.
/// Shared with the compactor, which rebuilds these same stores in D′.
pub(crate) fn element_store_file_name(element_type: &str) -> String {
  match element_type {
    "$bigint" => "bigint.bin".to_string(),
    "$biguint" => "biguint.bin".to_string(),
    "$fraction_num" => "_frac_num.bin".to_string(),
    "$fraction_den" => "_frac_den.bin".to_string(),
    other => format!("{other}.bin"),
  }
}

/// How `Engine::open` should behave with respect to an existing or absent
/// data directory, and whether the directory should be torn down on exit.
#[derive(Clone, Debug)]
pub struct EngineOptions {
  pub dir: PathBuf,
  pub create_if_missing: bool,
  pub temporary: bool,
}

impl EngineOptions {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    EngineOptions { dir: dir.into(), create_if_missing: false, temporary: false }
  }

  pub fn create_if_missing(mut self, yes: bool) -> Self {
    self.create_if_missing = yes;
    self
  }

  pub fn temporary(mut self, yes: bool) -> Self {
    self.temporary = yes;
    self
  }
}

struct LockFile {
  path: PathBuf,
}

impl LockFile {
  fn acquire(dir: &Path) -> EngineResult<Self> {
    let path = dir.join(LOCK_FILE_NAME);
    OpenOptions::new().write(true).create_new(true).open(&path).map_err(|e| {
      if e.kind() == std::io::ErrorKind::AlreadyExists {
        EngineError::AlreadyOpen
      } else {
        EngineError::Io(e)
      }
    })?;
    Ok(LockFile { path })
  }
}

impl Drop for LockFile {
  fn drop(&mut self) {
    let _ = std::fs::remove_file(&self.path);
  }
}

static TEMP_REGISTRY: OnceLock<Mutex<Vec<PathBuf>>> = OnceLock::new();

fn temp_registry() -> &'static Mutex<Vec<PathBuf>> {
  TEMP_REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// The open-database handle. Not `Clone`/`Send`+`Sync` by design — spec §5
/// is explicit that this engine is single-threaded, single-instance.
pub struct Engine {
  pub(crate) dir: PathBuf,
  pub(crate) registry: Registry,
  pub(crate) type_ids: TypeIdTable,
  pub(crate) catalogs: HashMap<String, Catalog>,
  pub(crate) element_stores: HashMap<String, ElementStore>,
  pub(crate) variant_catalogs: HashMap<String, VariantCatalog>,
  /// Tag bindings from the currently-open `Scope`, if any (spec §4.7).
  /// Consulted by the resolver when a composite/interface field's value is
  /// a `TypedValue::TagRef`.
  pub(crate) active_scope: Option<HashMap<String, (String, u32)>>,
  _lock: LockFile,
}

impl Engine {
  /// Opens (or creates) a database directory per `options`.
  pub fn open(options: EngineOptions) -> EngineResult<Self> {
    let dir = options.dir.clone();
    if !dir.exists() {
      if !options.create_if_missing {
        return Err(EngineError::Io(std::io::Error::new(
          std::io::ErrorKind::NotFound,
          format!("{}: no such directory", dir.display()),
        )));
      }
      std::fs::create_dir_all(&dir)?;
    }
    let lock = LockFile::acquire(&dir)?;

    let metadata_path = dir.join(document::METADATA_FILE_NAME);
    let (registry, type_ids) = if metadata_path.exists() {
      document::load(&dir)?
    } else {
      let registry = Registry::new();
      let type_ids = TypeIdTable::new();
      document::save(&dir, &registry, &type_ids)?;
      (registry, type_ids)
    };

    let mut engine = Engine {
      dir: dir.clone(),
      registry,
      type_ids,
      catalogs: HashMap::new(),
      element_stores: HashMap::new(),
      variant_catalogs: HashMap::new(),
      active_scope: None,
      _lock: lock,
    };
    engine.open_existing_storage()?;

    if options.temporary {
      temp_registry().lock().unwrap().push(dir);
    }
    Ok(engine)
  }

  fn composite_path(&self, name: &str) -> PathBuf {
    self.dir.join(format!("{name}.bin"))
  }

  fn element_store_path(&self, element_type: &str) -> PathBuf {
    self.dir.join(element_store_file_name(element_type))
  }

  fn enum_dir(&self, name: &str) -> PathBuf {
    self.dir.join(name)
  }

  /// Opens Table/Variant Catalogs for whatever composites/enums already
  /// have a record file on disk; element stores are opened lazily on first
  /// access since not every element type is necessarily used yet.
  fn open_existing_storage(&mut self) -> EngineResult<()> {
    let names: Vec<(String, Kind)> = self.registry.iter_in_order().map(|k| (k.name().to_string(), k.clone())).collect();
    for (name, kind) in names {
      match &kind {
        Kind::Composite(_) => {
          let path = self.composite_path(&name);
          if path.exists() {
            let layout = RecordLayout::compute(self.registry.effective_fields(&name), &self.registry)?;
            self.catalogs.insert(name.clone(), Catalog::open(path, layout)?);
          }
        }
        Kind::PayloadEnum(def) => {
          let dir = self.enum_dir(&name);
          if dir.exists() {
            self.variant_catalogs.insert(name.clone(), VariantCatalog::open(dir, def, &self.registry)?);
          }
        }
        _ => {}
      }
    }
    Ok(())
  }

  /// Registers a new composite/interface/enum/alias/etc. and, for
  /// composites and payload enums, creates their backing storage.
  pub fn register_type(&mut self, kind: Kind) -> EngineResult<()> {
    self.registry.register(kind.clone())?;
    self.finalize_registration(&kind)
  }

  /// Declares a forward stub (spec §3.1): a placeholder name that a
  /// composite/interface/payload-enum field may reference before it is
  /// itself registered. Needed to express mutual recursion between two
  /// different composites (A references stub B, B is later filled with a
  /// field referencing the now-registered A). Every declared stub must be
  /// filled via `fill_forward_stub` before `check_schema_complete` passes.
  pub fn declare_forward_stub(&mut self, name: &str) -> EngineResult<()> {
    self.registry.declare_stub(name)?;
    Ok(())
  }

  /// Fills a previously declared forward stub with its real definition,
  /// exactly like `register_type` but permitted to reference other
  /// still-open stubs.
  pub fn fill_forward_stub(&mut self, kind: Kind) -> EngineResult<()> {
    self.registry.fill_stub(kind.clone())?;
    self.finalize_registration(&kind)
  }

  /// Commit-time check (spec §3.1): every forward stub declared so far must
  /// have been filled.
  pub fn check_schema_complete(&self) -> EngineResult<()> {
    self.registry.check_stubs_filled()?;
    Ok(())
  }

  /// Drops a composite type (spec §3.3, §6.3): removes only its own Table
  /// Catalog file. Shared element stores persist untouched while any other
  /// type still uses them, and its type-id is never reissued — dropping
  /// here only removes the registry entry and the catalog file, leaving its
  /// `TypeIdTable` assignment retired in place.
  pub fn drop_type(&mut self, name: &str) -> EngineResult<()> {
    self.registry.drop_composite(name)?;
    self.catalogs.remove(name);
    let path = self.composite_path(name);
    if path.exists() {
      std::fs::remove_file(&path)?;
    }
    document::save(&self.dir, &self.registry, &self.type_ids)?;
    tracing::debug!(type_name = name, "dropped composite type");
    Ok(())
  }

  /// Shared tail of `register_type`/`fill_forward_stub`: creates backing
  /// storage for the kinds that need it, persists the schema document, and
  /// logs.
  fn finalize_registration(&mut self, kind: &Kind) -> EngineResult<()> {
    match kind {
      Kind::Composite(_) => {
        let layout = RecordLayout::compute(self.registry.effective_fields(kind.name()), &self.registry)?;
        let path = self.composite_path(kind.name());
        self.catalogs.insert(kind.name().to_string(), Catalog::create(path, layout)?);
        self.type_ids.id_for(kind.name());
      }
      Kind::PayloadEnum(def) => {
        let dir = self.enum_dir(kind.name());
        self.variant_catalogs.insert(kind.name().to_string(), VariantCatalog::create(dir, def, &self.registry)?);
      }
      Kind::Dictionary(d) => {
        let entry_name = d.entry_composite_name();
        if self.registry.lookup(&entry_name).is_none() {
          use crate::schema::{CompositeDef, FieldDef};
          let entry = Kind::Composite(CompositeDef {
            name: entry_name.clone(),
            fields: vec![FieldDef::new("key", &d.key), FieldDef::new("value", &d.value)],
            parent: None,
            interfaces: vec![],
          });
          self.registry.register(entry)?;
          let layout = RecordLayout::compute(self.registry.effective_fields(&entry_name), &self.registry)?;
          let path = self.composite_path(&entry_name);
          self.catalogs.insert(entry_name.clone(), Catalog::create(path, layout)?);
          self.type_ids.id_for(&entry_name);
        }
      }
      _ => {}
    }
    document::save(&self.dir, &self.registry, &self.type_ids)?;
    tracing::debug!(type_name = kind.name(), "registered type");
    Ok(())
  }

  pub(crate) fn element_store_mut(&mut self, element_type: &str) -> EngineResult<&mut ElementStore> {
    if !self.element_stores.contains_key(element_type) {
      let width = crate::storage::catalog::slot_width_for_element(element_type, &self.registry)?;
      self.open_or_create_store(element_type, width)?;
    }
    Ok(self.element_stores.get_mut(element_type).unwrap())
  }

  pub(crate) fn element_store(&self, element_type: &str) -> Option<&ElementStore> {
    self.element_stores.get(element_type)
  }

  /// A shared, fixed-width-1 byte store, used for the raw bytes behind
  /// BigInt/BigUInt/Fraction numerators and denominators (spec §3.2). These
  /// are not schema entities, so they bypass `slot_width_for` and are keyed
  /// by a reserved name that can never collide with a user type name.
  pub(crate) fn raw_byte_store_mut(&mut self, key: &str) -> EngineResult<&mut ElementStore> {
    if !self.element_stores.contains_key(key) {
      self.open_or_create_store(key, 1)?;
    }
    Ok(self.element_stores.get_mut(key).unwrap())
  }

  fn open_or_create_store(&mut self, key: &str, width: usize) -> EngineResult<()> {
    let path = self.element_store_path(key);
    let store = if path.exists() { ElementStore::open(path, width)? } else { ElementStore::create(path, width)? };
    self.element_stores.insert(key.to_string(), store);
    Ok(())
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  pub fn type_ids(&self) -> &TypeIdTable {
    &self.type_ids
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Inserts a new record for `value.type_name`, returning its index.
  pub fn insert(&mut self, value: &CompositeValue) -> EngineResult<u32> {
    let (null_mask, slots) = self.encode_record(&value.type_name, value)?;
    let catalog = self
      .catalogs
      .get_mut(&value.type_name)
      .ok_or_else(|| SchemaError::UnknownType(value.type_name.clone()))?;
    let idx = catalog.insert_raw(&null_mask, &slots)?;
    tracing::debug!(type_name = %value.type_name, index = idx, "inserted record");
    Ok(idx)
  }

  pub fn update(&mut self, index: u32, value: &CompositeValue) -> EngineResult<()> {
    let (null_mask, slots) = self.encode_record(&value.type_name, value)?;
    let catalog = self
      .catalogs
      .get_mut(&value.type_name)
      .ok_or_else(|| SchemaError::UnknownType(value.type_name.clone()))?;
    catalog.overwrite_raw(index, &null_mask, &slots)?;
    Ok(())
  }

  pub fn delete(&mut self, type_name: &str, index: u32) -> EngineResult<()> {
    let catalog = self.catalogs.get_mut(type_name).ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
    catalog.delete(index)?;
    Ok(())
  }

  /// Reads a composite back as a fully-resolved [`TypedValue::Composite`].
  pub fn read_value(&self, type_name: &str, index: u32) -> EngineResult<TypedValue> {
    self.read_composite(type_name, index)
  }

  pub fn iter_live(&self, type_name: &str) -> EngineResult<Vec<u32>> {
    let catalog = self.catalogs.get(type_name).ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
    Ok(catalog.iter_live().collect())
  }

  /// Drains the process-wide temporary-database registry, deleting every
  /// directory created via `EngineOptions::temporary(true)` that is still
  /// present (spec §5's last paragraph).
  pub fn teardown_temporaries() {
    let mut reg = temp_registry().lock().unwrap();
    for dir in reg.drain(..) {
      let _ = std::fs::remove_dir_all(dir);
    }
  }
}
