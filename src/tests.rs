//! End-to-end behaviour over an in-memory SQLite store

use std::sync::Arc;
use crate::descriptor::{ColumnType, FieldOptions};
use crate::proxy::{FieldProxy, ScalarProxy};
use crate::registry::{FieldMapping, TypeKey};
use crate::storage::SqliteStore;
use crate::{Database, EntityType, Error, Filter, Property, Value, ValueType};

fn test_class(db: &Database) -> Arc<EntityType> {
    db.define("TestClass")
        .property(Property::new("foo", ValueType::Float).db_field())
        .property(Property::new("str_field", ValueType::Text).db_field())
        .build()
        .unwrap()
}

fn pks(value: &Value) -> Vec<i64> {
    value
        .as_entities()
        .unwrap()
        .iter()
        .map(|e| e.pk().unwrap())
        .collect()
}

#[test]
fn test_identity_invariant() {
    let db = Database::open_in_memory().unwrap();
    let ty = test_class(&db);
    let pk = db
        .create(&ty, [("foo", Value::from(1.0)), ("str_field", "x".into())])
        .unwrap()
        .pk()
        .unwrap();

    let first = db.get(&ty, pk).unwrap().unwrap();
    let second = db.get(&ty, pk).unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.handle_count(), 2);

    let listed = db.all(&ty).unwrap();
    assert_eq!(listed, vec![first]);
}

#[test]
fn test_eviction_goes_back_to_store() {
    let db = Database::open_in_memory().unwrap();
    let ty = test_class(&db);
    let pk = db
        .create(&ty, [("foo", Value::from(2.0)), ("str_field", "gone".into())])
        .unwrap()
        .pk()
        .unwrap();
    assert!(ty.identity().is_empty());

    let before = db.stats().fetches;
    let reloaded = db.get(&ty, pk).unwrap().unwrap();
    assert_eq!(db.stats().fetches, before + 1);
    assert_eq!(reloaded.get("str_field").unwrap(), Value::from("gone"));
}

#[test]
fn test_scalar_round_trip() {
    let db = Database::open_in_memory().unwrap();
    let ty = test_class(&db);
    let entity = db
        .create(&ty, [("foo", Value::from(1.234)), ("str_field", "asdf".into())])
        .unwrap();
    let pk = entity.pk().unwrap();
    drop(entity);

    let loaded = db.get(&ty, pk).unwrap().unwrap();
    assert_eq!(loaded.get("foo").unwrap(), Value::Float(1.234));
    assert_eq!(loaded.get("str_field").unwrap(), Value::from("asdf"));
}

#[test]
fn test_save_is_repeatable() {
    let db = Database::open_in_memory().unwrap();
    let ty = test_class(&db);
    let entity = db
        .create(&ty, [("foo", Value::from(1.0)), ("str_field", "a".into())])
        .unwrap();
    let pk = entity.pk();

    entity.set("str_field", "b").unwrap();
    entity.save().unwrap();
    entity.save().unwrap();

    assert_eq!(entity.pk(), pk);
    assert_eq!(db.all(&ty).unwrap().len(), 1);
    entity.clear_cache();
    assert_eq!(entity.get("str_field").unwrap(), Value::from("b"));
}

#[test]
fn test_polymorphic_load() {
    let db = Database::open_in_memory().unwrap();
    let base = test_class(&db);
    let sub = db
        .define("SubClass")
        .extends(&base)
        .property(Property::new("extra", ValueType::Integer).db_field())
        .build()
        .unwrap();

    let base_pk = db
        .create(&base, [("foo", Value::from(1.0)), ("str_field", "base".into())])
        .unwrap()
        .pk()
        .unwrap();
    let sub_pk = db
        .create(&sub, [("foo", Value::from(2.0)), ("str_field", "sub".into()), ("extra", Value::Integer(5))])
        .unwrap()
        .pk()
        .unwrap();

    let all = db.all(&base).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].entity_type().name(), "TestClass");
    assert_eq!(all[0].pk(), Some(base_pk));
    assert_eq!(all[1].entity_type().name(), "SubClass");
    assert_eq!(all[1].pk(), Some(sub_pk));
    assert_eq!(all[1].get("extra").unwrap(), Value::Integer(5));

    // The subtype instance is found through the base type's identity map
    assert_eq!(db.get(&base, sub_pk).unwrap().unwrap(), all[1]);
    assert!(db.get(&sub, base_pk).unwrap().is_none());
}

#[test]
fn test_many_round_trip_keeps_order() {
    let db = Database::open_in_memory().unwrap();
    let member = test_class(&db);
    let group = db
        .define("Group")
        .property(Property::new("members", ValueType::many(&member)).db_field())
        .build()
        .unwrap();

    let members: Vec<_> = (0..4)
        .map(|i| {
            db.create(&member, [("foo", Value::from(i as f64)), ("str_field", format!("m{i}").into())])
                .unwrap()
        })
        .collect();
    let assigned = vec![
        members[2].clone(),
        members[0].clone(),
        members[3].clone(),
        members[1].clone(),
    ];
    let expected: Vec<i64> = assigned.iter().map(|m| m.pk().unwrap()).collect();

    let owner = db.create_unsaved(&group, [("members", Value::from(assigned))]).unwrap();
    owner.save().unwrap();
    let pk = owner.pk().unwrap();
    drop(owner);

    let reloaded = db.get(&group, pk).unwrap().unwrap();
    assert_eq!(pks(&reloaded.get("members").unwrap()), expected);

    // Unchanged membership is not rewritten
    let writes = db.stats().join_writes;
    reloaded.save().unwrap();
    assert_eq!(db.stats().join_writes, writes);
}

#[test]
fn test_many_saves_unsaved_members() {
    let db = Database::open_in_memory().unwrap();
    let member = test_class(&db);
    let group = db
        .define("Group")
        .property(Property::new("members", ValueType::many(&member)).db_field())
        .build()
        .unwrap();

    let fresh = db
        .create_unsaved(&member, [("foo", Value::from(1.0)), ("str_field", "new".into())])
        .unwrap();
    let owner = db
        .create(&group, [("members", Value::from(vec![fresh.clone()]))])
        .unwrap();
    assert!(fresh.pk().is_some());
    assert_eq!(
        db.store().join_members(group.schema().join("members").unwrap(), owner.pk().unwrap()).unwrap(),
        vec![fresh.pk().unwrap()]
    );
}

#[test]
fn test_bulk_batching() {
    let db = Database::open_in_memory().unwrap();
    let plain = test_class(&db);
    let tagged = db
        .define("Tagged")
        .property(Property::new("label", ValueType::Text).db_field())
        .property(Property::new("related", ValueType::many(&plain)).db_field())
        .build()
        .unwrap();
    assert!(plain.is_bulk_eligible());
    assert!(!tagged.is_bulk_eligible());

    db.persist(|ctx| {
        for i in 0..10 {
            ctx.create(&plain, [("foo", Value::from(i as f64)), ("str_field", "p".into())])?;
        }
        for i in 0..4 {
            ctx.create(&tagged, [("label", format!("t{i}"))])?;
        }
        Ok(())
    })
    .unwrap();

    let stats = db.stats();
    assert_eq!(stats.bulk_inserts, 1);
    assert_eq!(stats.bulk_rows, 10);
    assert_eq!(stats.row_saves, 4);
    assert_eq!(db.all(&plain).unwrap().len(), 10);
    assert_eq!(db.all(&tagged).unwrap().len(), 4);
}

#[test]
fn test_batch_saves_referenced_types_first() {
    let db = Database::open_in_memory().unwrap();
    let author = db
        .define("Author")
        .property(Property::new("name", ValueType::Text).db_field())
        .build()
        .unwrap();
    let book = db
        .define("Book")
        .property(Property::new("title", ValueType::Text).db_field())
        .property(Property::new("author", ValueType::entity(&author)).db_field())
        .build()
        .unwrap();

    let (written, by) = db
        .persist(|ctx| {
            let by = ctx.create(&author, [("name", Value::from("Le Guin"))])?;
            let written = ctx.create(&book, [("title", Value::from("Lathe")), ("author", Value::from(&by))])?;
            Ok((written, by))
        })
        .unwrap();

    assert_eq!(db.stats().bulk_inserts, 2);
    assert_eq!(written.raw_attribute("author_id").unwrap(), Value::Entity(by.clone()));
    assert_eq!(written.get("author").unwrap(), Value::Entity(by));
}

#[test]
fn test_reference_cascade_and_reverse_relation() {
    let db = Database::open_in_memory().unwrap();
    let author = db
        .define("Author")
        .property(Property::new("name", ValueType::Text).db_field())
        .build()
        .unwrap();
    let book = db
        .define("Book")
        .property(Property::new("title", ValueType::Text).db_field())
        .property(Property::new("author", ValueType::entity(&author)).db_field())
        .build()
        .unwrap();

    let by = db.create_unsaved(&author, [("name", "Herbert")]).unwrap();
    let dune = db
        .create(&book, [("title", Value::from("Dune")), ("author", Value::from(&by))])
        .unwrap();
    assert!(by.pk().is_some());

    let found = db
        .find(&book, &Filter::new().eq("author", Value::from(&by)))
        .unwrap()
        .unwrap();
    assert_eq!(found, dune);

    let reverse = by.raw_attribute("book_author_author_set").unwrap();
    assert_eq!(reverse, Value::Entities(vec![dune]));
    assert!(matches!(by.raw_attribute("nothing_here"), Err(Error::UnknownProperty { .. })));
}

#[test]
fn test_delete_clears_identity_and_key() {
    let db = Database::open_in_memory().unwrap();
    let ty = test_class(&db);
    let entity = db
        .create(&ty, [("foo", Value::from(1.0)), ("str_field", "bye".into())])
        .unwrap();
    let pk = entity.pk().unwrap();

    assert!(entity.delete().unwrap());
    assert!(entity.pk().is_none());
    assert!(db.get(&ty, pk).unwrap().is_none());
    assert!(!entity.delete().unwrap());
}

#[test]
fn test_out_of_band_delete_is_stale_reference() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.db");
    let db = Database::new(SqliteStore::open(&path).unwrap());
    let ty = test_class(&db);
    let entity = db
        .create(&ty, [("foo", Value::from(1.0)), ("str_field", "here".into())])
        .unwrap();

    let other = rusqlite::Connection::open(&path).unwrap();
    other
        .execute("DELETE FROM \"test_class\" WHERE \"id\" = ?1", [entity.pk().unwrap()])
        .unwrap();
    drop(other);

    entity.set("str_field", "changed").unwrap();
    assert!(matches!(entity.save(), Err(Error::StaleReference { .. })));
}

#[test]
fn test_explicit_default_is_stored() {
    let db = Database::open_in_memory().unwrap();
    let ty = db
        .define("Counter")
        .property(Property::new("count", ValueType::Integer).db_field().default_value(7))
        .property(Property::new("note", ValueType::Text).db_field_with(FieldOptions::new().nullable(true)))
        .build()
        .unwrap();

    let pk = db.create(&ty, Vec::<(&str, Value)>::new()).unwrap().pk().unwrap();
    let loaded = db.get(&ty, pk).unwrap().unwrap();
    assert_eq!(loaded.get("count").unwrap(), Value::Integer(7));
    assert_eq!(loaded.get("note").unwrap(), Value::Null);
}

#[test]
fn test_type_value_round_trip() {
    let db = Database::open_in_memory().unwrap();
    let target = db.define("Target").module("things").build().unwrap();
    let holder = db
        .define("Holder")
        .property(Property::new("kind", ValueType::Type).db_field())
        .build()
        .unwrap();

    let pk = db.create(&holder, [("kind", Value::from(target.clone()))]).unwrap().pk().unwrap();
    let stored = db.get(&holder, pk).unwrap().unwrap().raw_attribute("kind").unwrap();
    assert_eq!(stored, Value::from("things::Target"));

    let loaded = db.get(&holder, pk).unwrap().unwrap();
    assert_eq!(loaded.get("kind").unwrap().as_type(), Some(&target));
}

#[test]
fn test_registered_custom_field_type() {
    fn money(binding: &crate::descriptor::FieldBinding) -> Box<dyn FieldProxy> {
        Box::new(ScalarProxy::new(binding))
    }

    let db = Database::open_in_memory().unwrap();
    assert!(matches!(
        db.define("Before")
            .property(Property::new("price", ValueType::custom("Money")).db_field())
            .build(),
        Err(Error::UnsupportedType(_))
    ));

    db.register_field_type(TypeKey::Custom("Money".into()), FieldMapping::new(ColumnType::Integer, money));
    let ty = db
        .define("Priced")
        .property(Property::new("price", ValueType::custom("Money")).db_field())
        .build()
        .unwrap();
    let pk = db.create(&ty, [("price", 1250)]).unwrap().pk().unwrap();
    assert_eq!(db.get(&ty, pk).unwrap().unwrap().get("price").unwrap(), Value::Integer(1250));
}

#[test]
fn test_query_is_lazy_and_ordered() {
    let db = Database::open_in_memory().unwrap();
    let ty = test_class(&db);
    for name in ["a", "b", "a"] {
        db.create(&ty, [("foo", Value::from(0.5)), ("str_field", name.into())]).unwrap();
    }

    let mut rows = db.query(&ty, &Filter::new().eq("str_field", "a")).unwrap();
    let first = rows.next().unwrap().unwrap();
    let second = rows.next().unwrap().unwrap();
    assert!(rows.next().is_none());
    assert!(first.pk() < second.pk());

    assert!(matches!(
        db.find(&ty, &Filter::new().eq("str_field", "a")),
        Err(Error::MultipleRows(_))
    ));
}
