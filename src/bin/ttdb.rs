//! `ttdb`: a small command-line front end over the engine, for poking at a
//! database directory without writing Rust. Schema definitions and record
//! field values are read as JSON/YAML; `TypedValue`s never cross this
//! boundary as anything but plain structured data (spec §1: the wire/query
//! layer is explicitly out of scope, so this binary only demonstrates the
//! CRUD surface directly).

use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;
use typed_tables::{CompositeValue, Engine, EngineOptions, TypedValue};

#[derive(Debug, StructOpt)]
#[structopt(name = "ttdb", about = "A file-backed, single-process, strongly typed record store")]
struct Opt {
  #[structopt(subcommand)]
  cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
  /// Create an empty database directory.
  Init { dir: PathBuf },

  /// Register every type declared in a schema file (JSON or YAML) against
  /// an existing database directory.
  Schema {
    dir: PathBuf,
    /// A YAML or JSON document holding a list of type declarations, tagged
    /// by `kind` the same way the on-disk schema document is.
    schema_file: PathBuf,
  },

  /// Insert one record, with field values given as a JSON object.
  Insert {
    dir: PathBuf,
    type_name: String,
    /// A JSON object mapping field name to value.
    fields_json: String,
  },

  /// Print a single record as JSON.
  Read { dir: PathBuf, type_name: String, index: u32 },

  /// List the live indices for a type.
  List { dir: PathBuf, type_name: String },

  /// Compact a database into a fresh directory, dropping tombstones and
  /// renumbering every record.
  Compact { dir: PathBuf, dest_dir: PathBuf },

  /// Compact and bundle a database into a single archive file.
  Archive {
    dir: PathBuf,
    bundle: PathBuf,
    #[structopt(long)]
    gzip: bool,
  },

  /// Unbundle an archive into a fresh, empty directory.
  Restore { bundle: PathBuf, dest_dir: PathBuf },

  /// Drop a composite type. Its Table Catalog is removed; any element
  /// stores it shares with other types are left untouched, and its type-id
  /// is never reissued.
  Drop { dir: PathBuf, type_name: String },

  /// List every live usage of values of a type, across every composite
  /// whose schema references it.
  Usages { dir: PathBuf, type_name: String },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
  let result = run(Opt::from_args());
  typed_tables::Engine::teardown_temporaries();
  result
}

fn run(opt: Opt) -> Result<()> {
  match opt.cmd {
    Command::Init { dir } => {
      Engine::open(EngineOptions::new(&dir).create_if_missing(true))?;
      println!("initialized {}", dir.display());
      Ok(())
    }
    Command::Schema { dir, schema_file } => cmd_schema(&dir, &schema_file),
    Command::Insert { dir, type_name, fields_json } => cmd_insert(&dir, &type_name, &fields_json),
    Command::Read { dir, type_name, index } => cmd_read(&dir, &type_name, index),
    Command::List { dir, type_name } => cmd_list(&dir, &type_name),
    Command::Compact { dir, dest_dir } => cmd_compact(&dir, &dest_dir),
    Command::Archive { dir, bundle, gzip } => cmd_archive(&dir, &bundle, gzip),
    Command::Restore { bundle, dest_dir } => cmd_restore(&bundle, &dest_dir),
    Command::Drop { dir, type_name } => cmd_drop(&dir, &type_name),
    Command::Usages { dir, type_name } => cmd_usages(&dir, &type_name),
  }
}

fn cmd_schema(dir: &std::path::Path, schema_file: &std::path::Path) -> Result<()> {
  let mut engine = Engine::open(EngineOptions::new(dir))?;
  let text = std::fs::read_to_string(schema_file).with_context(|| format!("reading {}", schema_file.display()))?;
  let kinds: Vec<typed_tables::schema::Kind> = if schema_file.extension().and_then(|e| e.to_str()) == Some("json") {
    serde_json::from_str(&text)?
  } else {
    serde_yaml::from_str(&text)?
  };
  // Declare every name up front as a forward stub so two types in the same
  // file can reference each other regardless of which is listed first, then
  // fill each stub in turn. A name the registry already knows about (e.g. a
  // schema file adding to a database that was seeded earlier) just registers
  // directly instead of going through the stub dance.
  for kind in &kinds {
    let name = kind.name().to_string();
    if engine.registry().lookup(&name).is_none() {
      engine.declare_forward_stub(&name)?;
    }
  }
  for kind in kinds {
    let name = kind.name().to_string();
    if engine.registry().open_stubs().contains(&name.as_str()) {
      engine.fill_forward_stub(kind)?;
    } else {
      engine.register_type(kind)?;
    }
    tracing::info!(type_name = %name, "registered");
  }
  engine.check_schema_complete()?;
  Ok(())
}

fn cmd_drop(dir: &std::path::Path, type_name: &str) -> Result<()> {
  let mut engine = Engine::open(EngineOptions::new(dir))?;
  engine.drop_type(type_name)?;
  println!("dropped {type_name}");
  Ok(())
}

fn cmd_usages(dir: &std::path::Path, type_name: &str) -> Result<()> {
  let engine = Engine::open(EngineOptions::new(dir))?;
  for usage in engine.iter_values(type_name)? {
    println!(
      "{}",
      serde_json::to_string(&serde_json::json!({
        "composite": usage.composite,
        "index": usage.index,
        "field": usage.field,
        "value": typed_value_to_json(&usage.value),
      }))?
    );
  }
  Ok(())
}

fn cmd_insert(dir: &std::path::Path, type_name: &str, fields_json: &str) -> Result<()> {
  let mut engine = Engine::open(EngineOptions::new(dir))?;
  let json: serde_json::Value = serde_json::from_str(fields_json)?;
  let obj = json.as_object().ok_or_else(|| anyhow!("expected a JSON object of field values"))?;

  let mut value = CompositeValue::new(type_name);
  for field in engine.registry().effective_fields(type_name) {
    if let Some(raw) = obj.get(&field.name) {
      let typed = json_to_typed_value(engine.registry(), &field.type_name, raw)?;
      value = value.with_field(field.name, typed);
    }
  }
  let index = engine.insert(&value)?;
  println!("{index}");
  Ok(())
}

fn cmd_read(dir: &std::path::Path, type_name: &str, index: u32) -> Result<()> {
  let engine = Engine::open(EngineOptions::new(dir))?;
  let value = engine.read_value(type_name, index)?;
  println!("{}", serde_json::to_string_pretty(&typed_value_to_json(&value))?);
  Ok(())
}

fn cmd_list(dir: &std::path::Path, type_name: &str) -> Result<()> {
  let engine = Engine::open(EngineOptions::new(dir))?;
  for index in engine.iter_live(type_name)? {
    println!("{index}");
  }
  Ok(())
}

fn cmd_compact(dir: &std::path::Path, dest_dir: &std::path::Path) -> Result<()> {
  let mut engine = Engine::open(EngineOptions::new(dir))?;
  typed_tables::compact::compact(&mut engine, dest_dir)?;
  println!("compacted {} -> {}", dir.display(), dest_dir.display());
  Ok(())
}

fn cmd_archive(dir: &std::path::Path, bundle: &std::path::Path, gzip: bool) -> Result<()> {
  let mut engine = Engine::open(EngineOptions::new(dir))?;
  typed_tables::archive::archive(&mut engine, bundle, gzip)?;
  println!("archived {} -> {}", dir.display(), bundle.display());
  Ok(())
}

fn cmd_restore(bundle: &std::path::Path, dest_dir: &std::path::Path) -> Result<()> {
  typed_tables::archive::restore(bundle, dest_dir)?;
  println!("restored {} -> {}", bundle.display(), dest_dir.display());
  Ok(())
}

/// Converts a JSON value into a [`TypedValue`] for `type_name`, following
/// alias/array/set/dictionary/composite/enum/numeric-text structure the
/// same way the resolver's decode path does, just starting from JSON
/// instead of raw bytes.
fn json_to_typed_value(registry: &typed_tables::schema::Registry, type_name: &str, json: &serde_json::Value) -> Result<TypedValue> {
  use typed_tables::schema::{Kind, PrimitiveEncoding};

  if json.is_null() {
    return Ok(TypedValue::Null);
  }
  let resolved_name = registry.resolve_alias(type_name).unwrap_or(type_name);
  let kind = registry.lookup(resolved_name).ok_or_else(|| anyhow!("unknown type '{resolved_name}'"))?;

  match kind {
    Kind::Primitive(p) => {
      let n = json.as_f64().ok_or_else(|| anyhow!("expected a number for '{resolved_name}'"))?;
      Ok(match (p.encoding, p.width) {
        (PrimitiveEncoding::UnsignedInt, 1) => TypedValue::U8(n as u8),
        (PrimitiveEncoding::UnsignedInt, 2) => TypedValue::U16(n as u16),
        (PrimitiveEncoding::UnsignedInt, 4) => TypedValue::U32(n as u32),
        (PrimitiveEncoding::UnsignedInt, 8) => TypedValue::U64(n as u64),
        (PrimitiveEncoding::UnsignedInt, 16) => TypedValue::U128(n as u128),
        (PrimitiveEncoding::SignedInt, 1) => TypedValue::I8(n as i8),
        (PrimitiveEncoding::SignedInt, 2) => TypedValue::I16(n as i16),
        (PrimitiveEncoding::SignedInt, 4) => TypedValue::I32(n as i32),
        (PrimitiveEncoding::SignedInt, 8) => TypedValue::I64(n as i64),
        (PrimitiveEncoding::SignedInt, 16) => TypedValue::I128(n as i128),
        (PrimitiveEncoding::Ieee754, 4) => TypedValue::F32(n as f32),
        (PrimitiveEncoding::Ieee754, 8) => TypedValue::F64(n),
        (encoding, width) => bail!("unsupported primitive width {width} for encoding {encoding:?}"),
      })
    }
    Kind::Boolean { .. } => Ok(TypedValue::Bool(json.as_bool().ok_or_else(|| anyhow!("expected a boolean for '{resolved_name}'"))?)),
    Kind::String { .. } => Ok(TypedValue::Str(json.as_str().ok_or_else(|| anyhow!("expected a string for '{resolved_name}'"))?.to_string())),
    Kind::Array(a) => {
      let items = json.as_array().ok_or_else(|| anyhow!("expected an array for '{resolved_name}'"))?;
      Ok(TypedValue::Array(items.iter().map(|v| json_to_typed_value(registry, &a.element, v)).collect::<Result<_>>()?))
    }
    Kind::Set(s) => {
      let items = json.as_array().ok_or_else(|| anyhow!("expected an array for '{resolved_name}'"))?;
      Ok(TypedValue::Set(items.iter().map(|v| json_to_typed_value(registry, &s.element, v)).collect::<Result<_>>()?))
    }
    Kind::Dictionary(d) => {
      let obj = json.as_object().ok_or_else(|| anyhow!("expected an object for dictionary '{resolved_name}'"))?;
      let mut pairs = Vec::with_capacity(obj.len());
      for (k, v) in obj {
        let key = json_to_typed_value(registry, &d.key, &serde_json::Value::String(k.clone()))?;
        let value = json_to_typed_value(registry, &d.value, v)?;
        pairs.push((key, value));
      }
      Ok(TypedValue::Dict(pairs))
    }
    Kind::Composite(c) => {
      let obj = json.as_object().ok_or_else(|| anyhow!("expected an object for composite '{resolved_name}'"))?;
      let mut cv = CompositeValue::new(c.name.clone());
      for field in registry.effective_fields(&c.name) {
        if let Some(raw) = obj.get(&field.name) {
          cv = cv.with_field(field.name.clone(), json_to_typed_value(registry, &field.type_name, raw)?);
        }
      }
      Ok(TypedValue::Composite(cv))
    }
    Kind::Interface(_) => {
      let obj = json.as_object().ok_or_else(|| anyhow!("expected an object for interface '{resolved_name}'"))?;
      let concrete_name = obj.get("$type").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("interface value for '{resolved_name}' needs a '$type' field naming the concrete composite"))?;
      match json_to_typed_value(registry, concrete_name, json)? {
        TypedValue::Composite(cv) => Ok(TypedValue::Interface(Box::new(cv))),
        other => bail!("expected '{concrete_name}' to resolve to a composite, got {other:?}"),
      }
    }
    Kind::Enum(_) => {
      let variant = json.as_str().ok_or_else(|| anyhow!("expected a variant name string for enum '{resolved_name}'"))?;
      Ok(TypedValue::EnumBare { enum_name: resolved_name.to_string(), variant: variant.to_string() })
    }
    Kind::PayloadEnum(e) => {
      if let Some(variant) = json.as_str() {
        return Ok(TypedValue::EnumPayload { enum_name: resolved_name.to_string(), variant: variant.to_string(), payload: None });
      }
      let obj = json.as_object().ok_or_else(|| anyhow!("expected a string or object for payload enum '{resolved_name}'"))?;
      let variant_name = obj.get("variant").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("payload enum value needs a 'variant' field"))?;
      let variant_def = e.variant(variant_name).ok_or_else(|| anyhow!("unknown variant '{variant_name}' of '{resolved_name}'"))?;
      let payload = match (&variant_def.fields, obj.get("payload")) {
        (None, _) => None,
        (Some(fields), Some(payload_json)) => {
          let payload_obj = payload_json.as_object().ok_or_else(|| anyhow!("expected an object payload for variant '{variant_name}'"))?;
          let mut cv = CompositeValue::new(format!("{resolved_name}::{variant_name}"));
          for field in fields {
            if let Some(raw) = payload_obj.get(&field.name) {
              cv = cv.with_field(field.name.clone(), json_to_typed_value(registry, &field.type_name, raw)?);
            }
          }
          Some(cv)
        }
        (Some(_), None) => bail!("variant '{variant_name}' of '{resolved_name}' requires a 'payload' object"),
      };
      Ok(TypedValue::EnumPayload { enum_name: resolved_name.to_string(), variant: variant_name.to_string(), payload })
    }
    Kind::Bigint { .. } => Ok(TypedValue::BigInt(num_bigint::BigInt::from_str(json.as_str().ok_or_else(|| anyhow!("expected a decimal string for '{resolved_name}'"))?)?)),
    Kind::Biguint { .. } => Ok(TypedValue::BigUInt(num_bigint::BigUint::from_str(json.as_str().ok_or_else(|| anyhow!("expected a decimal string for '{resolved_name}'"))?)?)),
    Kind::Fraction { .. } => {
      let text = json.as_str().ok_or_else(|| anyhow!("expected a 'numerator/denominator' string for '{resolved_name}'"))?;
      let (num, den) = text.split_once('/').ok_or_else(|| anyhow!("fraction '{text}' is missing a '/'"))?;
      Ok(TypedValue::Fraction(num_rational::BigRational::new(num_bigint::BigInt::from_str(num)?, num_bigint::BigInt::from_str(den)?)))
    }
    Kind::Alias(_) => unreachable!("resolve_alias already peeled aliases"),
  }
}

/// The display-only inverse of [`json_to_typed_value`], for `ttdb read`.
fn typed_value_to_json(value: &TypedValue) -> serde_json::Value {
  use serde_json::json;
  match value {
    TypedValue::Null => serde_json::Value::Null,
    TypedValue::Bool(b) => json!(b),
    TypedValue::U8(n) => json!(n),
    TypedValue::I8(n) => json!(n),
    TypedValue::U16(n) => json!(n),
    TypedValue::I16(n) => json!(n),
    TypedValue::U32(n) => json!(n),
    TypedValue::I32(n) => json!(n),
    TypedValue::U64(n) => json!(n),
    TypedValue::I64(n) => json!(n),
    TypedValue::U128(n) => json!(n.to_string()),
    TypedValue::I128(n) => json!(n.to_string()),
    TypedValue::F32(n) => json!(n),
    TypedValue::F64(n) => json!(n),
    TypedValue::Str(s) => json!(s),
    TypedValue::Array(items) | TypedValue::Set(items) => serde_json::Value::Array(items.iter().map(typed_value_to_json).collect()),
    TypedValue::Dict(pairs) => {
      serde_json::Value::Array(pairs.iter().map(|(k, v)| json!({"key": typed_value_to_json(k), "value": typed_value_to_json(v)})).collect())
    }
    TypedValue::Composite(cv) => composite_to_json(cv),
    TypedValue::Interface(cv) => composite_to_json(cv),
    TypedValue::EnumBare { enum_name, variant } => json!({"enum": enum_name, "variant": variant}),
    TypedValue::EnumPayload { enum_name, variant, payload } => {
      json!({"enum": enum_name, "variant": variant, "payload": payload.as_ref().map(composite_to_json)})
    }
    TypedValue::BigInt(n) => json!(n.to_string()),
    TypedValue::BigUInt(n) => json!(n.to_string()),
    TypedValue::Fraction(r) => json!(format!("{}/{}", r.numer(), r.denom())),
    TypedValue::TagRef(tag) => json!({"tag_ref": tag}),
  }
}

fn composite_to_json(cv: &CompositeValue) -> serde_json::Value {
  let mut map = serde_json::Map::new();
  map.insert("$type".to_string(), serde_json::Value::String(cv.type_name.clone()));
  for (name, value) in &cv.fields {
    map.insert(name.clone(), typed_value_to_json(value));
  }
  serde_json::Value::Object(map)
}
