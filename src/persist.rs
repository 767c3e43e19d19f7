//! Persistence context
//!
//! A scope object that collects entities created through it and saves them
//! together when the scope body completes. Types without child tables or
//! many-relationships are written with one bulk insert per type; everything
//! else is saved one entity at a time. The whole flush is one store
//! transaction.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use crate::database::Database;
use crate::entity::{Entity, EntityType};
use crate::order::sort_reference_order;
use crate::value::Value;
use crate::Result;

/// An open persistence scope
///
/// Scopes nest: an inner scope flushes only what was created inside it, and
/// all of them share the outermost scope's pending set. A context is not
/// `Send`, so each thread batches independently; while one thread's flush
/// is open, store writes from other threads wait for it to finish.
pub struct PersistenceContext<'db> {
    db: &'db Database,
    pending: Rc<RefCell<Vec<Entity>>>,
    mark: usize,
}

impl<'db> PersistenceContext<'db> {
    pub(crate) fn new(db: &'db Database) -> Self {
        Self {
            db,
            pending: Rc::new(RefCell::new(Vec::new())),
            mark: 0,
        }
    }

    fn nested(&self) -> Self {
        Self {
            db: self.db,
            pending: Rc::clone(&self.pending),
            mark: self.pending.borrow().len(),
        }
    }

    pub fn db(&self) -> &'db Database {
        self.db
    }

    /// Construct an entity that is saved when the scope completes
    pub fn create<I, K, V>(&self, ty: &Arc<EntityType>, values: I) -> Result<Entity>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let entity = self.db.create_unsaved(ty, values)?;
        self.add(&entity);
        Ok(entity)
    }

    /// Construct and save an entity immediately, bypassing the batch
    pub fn create_saved<I, K, V>(&self, ty: &Arc<EntityType>, values: I) -> Result<Entity>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.db.create_saved(ty, values)
    }

    /// Queue an existing entity for the batch
    pub fn add(&self, entity: &Entity) {
        let mut pending = self.pending.borrow_mut();
        if !pending.contains(entity) {
            pending.push(entity.clone());
        }
    }

    /// Entities queued since this scope opened
    pub fn pending(&self) -> Vec<Entity> {
        self.pending.borrow().iter().skip(self.mark).cloned().collect()
    }

    /// Open a nested scope
    pub fn persist<T>(&self, body: impl FnOnce(&PersistenceContext<'_>) -> Result<T>) -> Result<T> {
        self.nested().run(body)
    }

    /// Run the body, then flush what it queued
    ///
    /// A failing body writes nothing and leaves its entities pending for an
    /// enclosing scope. A failing flush is rolled back: keys assigned during
    /// it are cleared and the entities go back to the pending set.
    pub(crate) fn run<T>(self, body: impl FnOnce(&PersistenceContext<'_>) -> Result<T>) -> Result<T> {
        let value = body(&self)?;
        let batch = {
            let mut pending = self.pending.borrow_mut();
            let mark = self.mark.min(pending.len());
            pending.split_off(mark)
        };
        if let Err(err) = flush(self.db, &batch) {
            self.pending.borrow_mut().extend(batch);
            return Err(err);
        }
        Ok(value)
    }
}

fn flush(db: &Database, batch: &[Entity]) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let store = db.store();
    store.begin()?;
    db.begin_journal();
    match write_batch(db, batch).and_then(|_| store.commit()) {
        Ok(()) => {
            db.commit_journal();
            info!("Flushed {} pending entities", batch.len());
            Ok(())
        }
        Err(err) => {
            warn!("Rolling back batch of {} entities: {}", batch.len(), err);
            if let Err(rollback_err) = store.rollback() {
                warn!("Rollback failed: {}", rollback_err);
            }
            db.rollback_journal();
            Err(err)
        }
    }
}

fn write_batch(db: &Database, batch: &[Entity]) -> Result<()> {
    let unsaved: Vec<&Entity> = batch.iter().filter(|e| e.pk().is_none()).collect();
    let mut requires_post: Vec<&Entity> = batch.iter().filter(|e| e.entity_type().has_many()).collect();

    let types: Vec<Arc<EntityType>> = unsaved.iter().map(|e| e.entity_type().clone()).collect();
    for ty in sort_reference_order(&types) {
        // Earlier groups may have cascaded into this one
        let group: Vec<Entity> = unsaved
            .iter()
            .filter(|e| *e.entity_type() == ty && e.pk().is_none())
            .map(|e| (*e).clone())
            .collect();
        if group.is_empty() {
            continue;
        }
        if ty.is_bulk_eligible() {
            debug!("Bulk inserting {} x {}", group.len(), ty.name());
            db.bulk_save(&ty, &group)?;
        } else {
            for entity in &group {
                entity.save()?;
                requires_post.retain(|e| *e != entity);
            }
        }
    }

    for entity in requires_post {
        entity.save()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;
    use crate::descriptor::{ColumnType, FieldBinding, FieldDescriptor, FieldOptions};
    use crate::property::Property;
    use crate::proxy::{FieldProxy, ScalarProxy};
    use crate::registry::{FieldMapping, TypeKey};
    use crate::value::{Cell, ValueType};
    use crate::Error;

    fn plain(db: &Database) -> Arc<EntityType> {
        db.define("Plain")
            .property(Property::new("n", ValueType::Integer).db_field())
            .build()
            .unwrap()
    }

    #[test]
    fn test_scope_defers_saves() {
        let db = Database::open_in_memory().unwrap();
        let ty = plain(&db);

        let created = db
            .persist(|ctx| {
                let a = ctx.create(&ty, [("n", 1)])?;
                let b = ctx.create(&ty, [("n", 2)])?;
                assert!(a.pk().is_none());
                assert!(b.pk().is_none());
                assert_eq!(ctx.pending().len(), 2);
                Ok(vec![a, b])
            })
            .unwrap();

        assert!(created.iter().all(|e| e.pk().is_some()));
        assert_eq!(db.stats().bulk_inserts, 1);
        assert_eq!(db.stats().row_saves, 0);
        assert_eq!(db.all(&ty).unwrap(), created);
    }

    #[test]
    fn test_create_saved_bypasses_scope() {
        let db = Database::open_in_memory().unwrap();
        let ty = plain(&db);

        db.persist(|ctx| {
            let now = ctx.create_saved(&ty, [("n", 1)])?;
            assert!(now.pk().is_some());
            assert!(ctx.pending().is_empty());
            Ok(())
        })
        .unwrap();
        assert_eq!(db.stats().bulk_inserts, 0);
    }

    #[test]
    fn test_failing_body_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let ty = plain(&db);

        let mut kept = None;
        let result: Result<()> = db.persist(|ctx| {
            kept = Some(ctx.create(&ty, [("n", 1)])?);
            Err(Error::Schema("abort".into()))
        });
        assert!(result.is_err());
        assert!(kept.unwrap().pk().is_none());
        assert!(db.all(&ty).unwrap().is_empty());
    }

    #[test]
    fn test_inner_failure_stays_pending_for_outer() {
        let db = Database::open_in_memory().unwrap();
        let ty = plain(&db);

        let inner = db
            .persist(|ctx| {
                let mut inner = None;
                let result: Result<()> = ctx.persist(|inner_ctx| {
                    inner = Some(inner_ctx.create(&ty, [("n", 1)])?);
                    Err(Error::Schema("abort".into()))
                });
                assert!(result.is_err());
                assert_eq!(ctx.pending().len(), 1);
                Ok(inner)
            })
            .unwrap()
            .unwrap();

        assert!(inner.pk().is_some());
    }

    #[test]
    fn test_nested_scope_flushes_own_entities() {
        let db = Database::open_in_memory().unwrap();
        let ty = plain(&db);

        db.persist(|ctx| {
            let outer = ctx.create(&ty, [("n", 1)])?;
            let inner = ctx.persist(|inner_ctx| inner_ctx.create(&ty, [("n", 2)]))?;
            assert!(inner.pk().is_some());
            assert!(outer.pk().is_none());
            Ok(())
        })
        .unwrap();
        assert_eq!(db.all(&ty).unwrap().len(), 2);
        assert_eq!(db.stats().bulk_inserts, 2);
    }

    #[test]
    fn test_failed_flush_rolls_back_keys() {
        let db = Database::open_in_memory().unwrap();
        let short = db
            .define("Short")
            .property(Property::new("code", ValueType::Text).db_field_with(FieldOptions::new().max_length(3)))
            .build()
            .unwrap();
        let ty = plain(&db);

        let mut made = Vec::new();
        let result: Result<()> = db.persist(|ctx| {
            made.push(ctx.create(&ty, [("n", 1)])?);
            made.push(ctx.create(&short, [("code", "far too long")])?);
            Ok(())
        });

        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(made.iter().all(|e| e.pk().is_none()));
        assert!(db.all(&ty).unwrap().is_empty());
        assert!(ty.identity().is_empty());
    }

    #[test]
    fn test_plain_create_inside_scope_saves_immediately() {
        let db = Database::open_in_memory().unwrap();
        let ty = plain(&db);

        db.persist(|ctx| {
            let direct = ctx.db().create(&ty, [("n", 9)])?;
            assert!(direct.pk().is_some());
            assert!(ctx.pending().is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_added_entity_is_flushed_once() {
        let db = Database::open_in_memory().unwrap();
        let ty = plain(&db);
        let loose = db.create_unsaved(&ty, [("n", 3)]).unwrap();

        db.persist(|ctx| {
            ctx.add(&loose);
            ctx.add(&loose);
            assert_eq!(ctx.pending().len(), 1);
            Ok(())
        })
        .unwrap();
        assert!(loose.pk().is_some());
        assert_eq!(db.stats().bulk_rows, 1);
    }

    /// Signals sent by a flush parked inside a pre-save hook
    struct Gate {
        entered: Sender<()>,
        resume: Receiver<()>,
    }

    static GATE: Mutex<Option<Gate>> = Mutex::new(None);

    #[derive(Debug)]
    struct GatedProxy(ScalarProxy);

    impl FieldProxy for GatedProxy {
        fn field_descriptor(&self) -> &FieldDescriptor {
            self.0.field_descriptor()
        }

        fn get(&self, entity: &Entity) -> Result<Value> {
            self.0.get(entity)
        }

        fn set(&self, entity: &Entity, value: &Value) -> Result<()> {
            self.0.set(entity, value)
        }

        fn to_cell(&self, value: &Value) -> Result<Cell> {
            self.0.to_cell(value)
        }

        fn on_pre_save(&self, _entity: &Entity) -> Result<()> {
            if let Some(gate) = GATE.lock().unwrap().as_ref() {
                gate.entered.send(()).unwrap();
                let _ = gate.resume.recv_timeout(Duration::from_secs(5));
            }
            Ok(())
        }
    }

    fn gated(binding: &FieldBinding) -> Box<dyn FieldProxy> {
        Box::new(GatedProxy(ScalarProxy::new(binding)))
    }

    #[test]
    fn test_failed_flush_keeps_other_thread_writes() {
        let db = Database::open_in_memory().unwrap();
        db.register_field_type(TypeKey::Custom("Gated".into()), FieldMapping::new(ColumnType::Integer, gated));
        let slow = db
            .define("Slow")
            .property(Property::new("g", ValueType::custom("Gated")).db_field())
            .build()
            .unwrap();
        let short = db
            .define("Short")
            .property(Property::new("code", ValueType::Text).db_field_with(FieldOptions::new().max_length(3)))
            .build()
            .unwrap();
        let ty = plain(&db);

        let (entered_tx, entered_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        *GATE.lock().unwrap() = Some(Gate {
            entered: entered_tx,
            resume: resume_rx,
        });

        let failing = {
            let db = db.clone();
            let (slow, short) = (slow.clone(), short.clone());
            thread::spawn(move || {
                db.persist(|ctx| {
                    ctx.create(&slow, [("g", 1)])?;
                    ctx.create(&short, [("code", "far too long")])?;
                    Ok(())
                })
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let writer = {
            let db = db.clone();
            let ty = ty.clone();
            thread::spawn(move || db.create(&ty, [("n", 7)]).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        resume_tx.send(()).unwrap();

        assert!(matches!(failing.join().unwrap(), Err(Error::Storage(_))));
        let written = writer.join().unwrap();
        GATE.lock().unwrap().take();

        let pk = written.pk().unwrap();
        assert_eq!(db.all(&ty).unwrap(), vec![written]);
        assert!(db.store().get_row(ty.schema(), &crate::storage::Criteria::by_pk(pk)).unwrap().is_some());
        assert!(db.all(&slow).unwrap().is_empty());
    }
}
