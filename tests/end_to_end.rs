//! Black-box scenarios exercising the whole engine through its public
//! surface only, against temporary directories. One test per concrete
//! scenario the engine's invariants are checked against.

use typed_tables::numeric::OverflowPolicy;
use typed_tables::schema::{CompositeDef, FieldDef, InterfaceDef, Kind};
use typed_tables::value::{CompositeValue, TypedValue};
use typed_tables::{Engine, EngineOptions};

fn open_temp() -> Engine {
  // `into_path()` hands ownership of cleanup to the engine's own temporary-
  // directory registry instead of deleting it the moment this `TempDir`
  // guard drops at the end of this function.
  let dir = tempfile::tempdir().unwrap().into_path();
  Engine::open(EngineOptions::new(dir).create_if_missing(true).temporary(true)).unwrap()
}

#[test]
fn string_round_trip() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "P".into(),
      fields: vec![FieldDef::new("n", "string")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();

  let idx = engine.insert(&CompositeValue::new("P").with_field("n", TypedValue::Str("Hello".into()))).unwrap();

  match engine.read_value("P", idx).unwrap() {
    TypedValue::Composite(cv) => assert_eq!(Some(&TypedValue::Str("Hello".into())), cv.fields.get("n")),
    other => panic!("expected composite, got {other:?}"),
  }
}

#[test]
fn string_array_round_trip_is_regression_critical() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "C".into(),
      fields: vec![FieldDef::new("tags", "string[]")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();

  let tags = TypedValue::Array(vec![TypedValue::Str("a".into()), TypedValue::Str("b".into())]);
  let idx = engine.insert(&CompositeValue::new("C").with_field("tags", tags)).unwrap();

  match engine.read_value("C", idx).unwrap() {
    TypedValue::Composite(cv) => match cv.fields.get("tags") {
      Some(TypedValue::Array(items)) => {
        assert_eq!(vec![TypedValue::Str("a".into()), TypedValue::Str("b".into())], *items);
      }
      other => panic!("expected array, got {other:?}"),
    },
    other => panic!("expected composite, got {other:?}"),
  }
}

#[test]
fn polymorphic_interface_query_sees_transitive_implementers() {
  let mut engine = open_temp();
  engine.register_type(Kind::Interface(InterfaceDef { name: "I1".into(), fields: vec![], parents: vec![] })).unwrap();
  engine
    .register_type(Kind::Interface(InterfaceDef { name: "I2".into(), fields: vec![], parents: vec!["I1".into()] }))
    .unwrap();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "T".into(),
      fields: vec![FieldDef::new("name", "string")],
      parent: None,
      interfaces: vec!["I2".into()],
    }))
    .unwrap();

  assert!(engine.registry().implementers_of("I1").contains(&"T"));
}

#[test]
fn soft_delete_then_compaction_renumbers_references() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "T".into(),
      fields: vec![FieldDef::new("n", "uint8")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();

  let mut ids = Vec::new();
  for i in 0..10u8 {
    ids.push(engine.insert(&CompositeValue::new("T").with_field("n", TypedValue::U8(i))).unwrap());
  }
  engine.delete("T", ids[3]).unwrap();
  engine.delete("T", ids[7]).unwrap();
  assert_eq!(8, engine.iter_live("T").unwrap().len());

  let dest = tempfile::tempdir().unwrap();
  let compacted = typed_tables::compact::compact(&mut engine, dest.path().join("out")).unwrap();

  assert_eq!(8, compacted.iter_live("T").unwrap().len());
  // Old index 5 (n=5) sits after exactly one earlier tombstone (index 3), so it
  // shifts down by one to new index 4.
  match compacted.read_value("T", 4).unwrap() {
    TypedValue::Composite(cv) => assert_eq!(Some(&TypedValue::U8(5)), cv.fields.get("n")),
    other => panic!("expected composite, got {other:?}"),
  }
}

#[test]
fn cycle_via_scope_tags_links_both_directions() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "N".into(),
      fields: vec![FieldDef::new("name", "string"), FieldDef::new("next", "N")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();

  let mut scope = typed_tables::scope::Scope::new();
  let a = scope.reserve(&mut engine, "N", "A").unwrap();
  let b = scope.reserve(&mut engine, "N", "B").unwrap();

  scope
    .fill(
      &mut engine,
      "A",
      &CompositeValue::new("N").with_field("name", TypedValue::Str("A".into())).with_field("next", TypedValue::TagRef("B".into())),
    )
    .unwrap();
  scope
    .fill(
      &mut engine,
      "B",
      &CompositeValue::new("N").with_field("name", TypedValue::Str("B".into())).with_field("next", TypedValue::TagRef("A".into())),
    )
    .unwrap();

  match engine.read_value("N", a.index).unwrap() {
    TypedValue::Composite(cv) => match cv.fields.get("next") {
      Some(TypedValue::Composite(next)) => assert_eq!(Some(&TypedValue::Str("B".into())), next.fields.get("name")),
      other => panic!("expected resolved composite, got {other:?}"),
    },
    other => panic!("expected composite, got {other:?}"),
  }
  let _ = b;
}

#[test]
fn overflow_policies_apply_per_field() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "Overflowing".into(),
      fields: vec![
        FieldDef { overflow: Some(OverflowPolicy::Saturating), ..FieldDef::new("x", "int8") },
        FieldDef { overflow: Some(OverflowPolicy::Wrapping), ..FieldDef::new("y", "uint8") },
        FieldDef::new("z", "int8"),
      ],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();

  let idx = engine
    .insert(
      &CompositeValue::new("Overflowing")
        .with_field("x", TypedValue::I32(200))
        .with_field("y", TypedValue::U16(257))
        .with_field("z", TypedValue::I32(0)),
    )
    .unwrap();
  match engine.read_value("Overflowing", idx).unwrap() {
    TypedValue::Composite(cv) => {
      assert_eq!(Some(&TypedValue::I8(127)), cv.fields.get("x"));
      assert_eq!(Some(&TypedValue::U8(1)), cv.fields.get("y"));
    }
    other => panic!("expected composite, got {other:?}"),
  }

  let err = engine.insert(&CompositeValue::new("Overflowing").with_field("x", TypedValue::I32(0)).with_field("y", TypedValue::U16(0)).with_field("z", TypedValue::I32(200)));
  assert!(err.is_err());
}

#[test]
fn forward_stub_lets_two_composites_reference_each_other() {
  let mut engine = open_temp();
  engine.declare_forward_stub("Department").unwrap();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "Employee".into(),
      fields: vec![FieldDef::new("name", "string"), FieldDef::new("dept", "Department")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();
  engine
    .fill_forward_stub(Kind::Composite(CompositeDef {
      name: "Department".into(),
      fields: vec![FieldDef::new("title", "string"), FieldDef::new("head", "Employee")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();

  engine.check_schema_complete().unwrap();
  assert!(engine.registry().lookup("Department").is_some());
}

#[test]
fn dropping_a_composite_removes_only_its_catalog() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "Scratch".into(),
      fields: vec![FieldDef::new("n", "uint8")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();
  engine.insert(&CompositeValue::new("Scratch").with_field("n", TypedValue::U8(1))).unwrap();
  assert!(engine.dir().join("Scratch.bin").exists());

  engine.drop_type("Scratch").unwrap();
  assert!(!engine.dir().join("Scratch.bin").exists());
  assert!(engine.registry().lookup("Scratch").is_none());
  assert!(engine.iter_live("Scratch").is_err());
}

#[test]
fn iter_values_finds_usages_by_type_across_owning_composites() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "Address".into(),
      fields: vec![FieldDef::new("city", "string")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "Person".into(),
      fields: vec![FieldDef::new("home", "Address")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "Business".into(),
      fields: vec![FieldDef::new("hq", "Address")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();

  engine
    .insert(&CompositeValue::new("Person").with_field("home", TypedValue::Composite(CompositeValue::new("Address").with_field("city", TypedValue::Str("Linz".into())))))
    .unwrap();
  engine
    .insert(&CompositeValue::new("Business").with_field("hq", TypedValue::Composite(CompositeValue::new("Address").with_field("city", TypedValue::Str("Graz".into())))))
    .unwrap();

  let usages = engine.iter_values("Address").unwrap();
  assert_eq!(2, usages.len());
  let owners: std::collections::HashSet<&str> = usages.iter().map(|u| u.composite.as_str()).collect();
  assert_eq!(std::collections::HashSet::from(["Person", "Business"]), owners);
  assert!(usages.iter().all(|u| u.field == "home" || u.field == "hq"));
}

#[test]
fn narrowing_bigint_overflow_errors_regardless_of_policy() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "Counter".into(),
      fields: vec![FieldDef { overflow: Some(OverflowPolicy::Saturating), ..FieldDef::new("n", "int64") }],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();

  let huge: num_bigint::BigInt = num_bigint::BigInt::from(i128::MAX) * num_bigint::BigInt::from(1000);
  let err = engine.insert(&CompositeValue::new("Counter").with_field("n", TypedValue::BigInt(huge)));
  assert!(err.is_err());
}

#[test]
fn archive_then_restore_matches_compacted_contents() {
  let mut engine = open_temp();
  engine
    .register_type(Kind::Composite(CompositeDef {
      name: "Item".into(),
      fields: vec![FieldDef::new("name", "string")],
      parent: None,
      interfaces: vec![],
    }))
    .unwrap();
  engine.insert(&CompositeValue::new("Item").with_field("name", TypedValue::Str("first".into()))).unwrap();
  let second = engine.insert(&CompositeValue::new("Item").with_field("name", TypedValue::Str("second".into()))).unwrap();
  engine.delete("Item", second).unwrap();
  engine.insert(&CompositeValue::new("Item").with_field("name", TypedValue::Str("third".into()))).unwrap();

  let bundle_dir = tempfile::tempdir().unwrap();
  let bundle = bundle_dir.path().join("db.ttar.gz");
  typed_tables::archive::archive(&mut engine, &bundle, true).unwrap();

  let restore_dir = bundle_dir.path().join("restored");
  let restored = typed_tables::archive::restore(&bundle, &restore_dir).unwrap();

  let live = restored.iter_live("Item").unwrap();
  assert_eq!(2, live.len());
  let names: Vec<String> = live
    .iter()
    .map(|&i| match restored.read_value("Item", i).unwrap() {
      TypedValue::Composite(cv) => match cv.fields.get("name") {
        Some(TypedValue::Str(s)) => s.clone(),
        other => panic!("expected string, got {other:?}"),
      },
      other => panic!("expected composite, got {other:?}"),
    })
    .collect();
  assert_eq!(vec!["first".to_string(), "third".to_string()], names);
}
