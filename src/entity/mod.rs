//! Entities - in-memory objects backed by one stored row each
//!
//! An `Entity` is a cheap, cloneable handle. All clones share one instance,
//! and the identity map guarantees at most one live instance per stored row,
//! so handle equality is identity.
//!
//! The backing row is materialized lazily: a fresh row for a new entity, or
//! fetched by key for a deferred one. Property reads consult the in-memory
//! cache first and fall back to the property's default, which for stored
//! properties is the field proxy reading the row.

mod catalog;
mod entity_type;
mod identity;

pub use catalog::TypeCatalog;
pub use entity_type::{EntityType, EntityTypeBuilder};
pub use identity::IdentityMap;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;
use crate::database::{Database, Filter};
use crate::storage::{Criteria, Row, PK_COLUMN, TYPE_COLUMN};
use crate::value::{Cell, Value};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct EntityState {
    row: Option<Row>,
    /// Primary key, known before the row for deferred instances
    key: Option<i64>,
    cache: HashMap<String, Value>,
    /// Set while `save` runs, to cut cascades through reference cycles
    saving: bool,
}

pub(crate) struct EntityInner {
    db: Database,
    ty: Arc<EntityType>,
    state: Mutex<EntityState>,
}

impl Drop for EntityInner {
    fn drop(&mut self) {
        let key = self
            .state
            .get_mut()
            .map(|s| s.key)
            .unwrap_or_else(|poisoned| poisoned.into_inner().key);
        if let Some(pk) = key {
            self.ty.identity().remove_dead(pk);
        }
    }
}

/// Handle to a live entity instance
#[derive(Clone)]
pub struct Entity(Arc<EntityInner>);

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pk() {
            Some(pk) => write!(f, "{}#{}", self.0.ty.name(), pk),
            None => write!(f, "{}#<unsaved>", self.0.ty.name()),
        }
    }
}

impl Entity {
    fn with_state(db: Database, ty: Arc<EntityType>, state: EntityState) -> Self {
        Entity(Arc::new(EntityInner {
            db,
            ty,
            state: Mutex::new(state),
        }))
    }

    /// A new, unsaved instance
    pub(crate) fn fresh(db: Database, ty: Arc<EntityType>) -> Self {
        Self::with_state(db, ty, EntityState::default())
    }

    /// An instance wrapping a row read from the store
    pub(crate) fn loaded(db: Database, ty: Arc<EntityType>, row: Row) -> Self {
        let key = row.pk();
        Self::with_state(db, ty, EntityState {
            row: Some(row),
            key,
            ..EntityState::default()
        })
    }

    /// An instance whose row is fetched on first access
    pub(crate) fn deferred(db: Database, ty: Arc<EntityType>, pk: i64) -> Self {
        Self::with_state(db, ty, EntityState {
            row: None,
            key: Some(pk),
            ..EntityState::default()
        })
    }

    pub(crate) fn from_inner(inner: Arc<EntityInner>) -> Self {
        Entity(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<EntityInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn is_handle_of(&self, weak: &Weak<EntityInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.0), weak.as_ptr())
    }

    fn state(&self) -> MutexGuard<'_, EntityState> {
        self.0.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn db(&self) -> &Database {
        &self.0.db
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.0.ty
    }

    /// Primary key, present once the entity has been saved
    pub fn pk(&self) -> Option<i64> {
        self.state().key
    }

    /// Number of live handles to this instance
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    // ========== Row Access ==========

    fn materialize<'a>(&self, state: &'a mut EntityState) -> Result<&'a mut Row> {
        if state.row.is_none() {
            let schema = self.0.ty.schema();
            let row = match state.key {
                Some(pk) => self
                    .0
                    .db
                    .store()
                    .get_row(schema, &Criteria::by_pk(pk))?
                    .ok_or_else(|| Error::StaleReference {
                        entity: self.0.ty.name().to_string(),
                        pk,
                    })?,
                None => self.0.db.store().create_row(schema),
            };
            state.row = Some(row);
        }
        state
            .row
            .as_mut()
            .ok_or_else(|| Error::Schema("row could not be materialized".into()))
    }

    /// Run `f` on the backing row, materializing it first
    pub fn with_row<R>(&self, f: impl FnOnce(&mut Row) -> R) -> Result<R> {
        let mut state = self.state();
        let row = self.materialize(&mut state)?;
        Ok(f(row))
    }

    /// Stored cell of a column in the backing row
    pub fn read_cell(&self, column: &str) -> Result<Cell> {
        self.with_row(|row| row.cell(column))
    }

    /// Write a cell into the backing row (in memory only)
    pub fn write_cell(&self, column: &str, cell: Cell) -> Result<()> {
        self.with_row(|row| row.set(column, cell))
    }

    // ========== Value Cache ==========

    pub fn cached(&self, name: &str) -> Option<Value> {
        self.state().cache.get(name).cloned()
    }

    pub fn cache_value(&self, name: &str, value: Value) {
        self.state().cache.insert(name.to_string(), value);
    }

    /// Forget assigned values so reads go back to the row
    pub fn clear_cache(&self) {
        self.state().cache.clear();
    }

    // ========== Properties ==========

    /// Read a declared property
    pub fn get(&self, name: &str) -> Result<Value> {
        let property = self.0.ty.property(name).ok_or_else(|| self.unknown(name))?;
        if let Some(value) = self.cached(name) {
            return Ok(value);
        }
        property.read_default(self)
    }

    /// Assign a declared property; stored properties are written to the row
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let property = self.0.ty.property(name).ok_or_else(|| self.unknown(name))?;
        let value = property.check(value.into())?;
        self.cache_value(name, value.clone());
        property.apply(self, &value)
    }

    fn unknown(&self, name: &str) -> Error {
        Error::UnknownProperty {
            entity: self.0.ty.name().to_string(),
            property: name.to_string(),
        }
    }

    // ========== Persistence ==========

    /// Write the entity, running the proxies' pre- and post-save hooks
    ///
    /// Safe to call repeatedly: later calls update the same row. A save
    /// reached again through a reference cycle returns without writing.
    pub fn save(&self) -> Result<Entity> {
        if std::mem::replace(&mut self.state().saving, true) {
            return Ok(self.clone());
        }
        let result = self.save_inner();
        self.state().saving = false;
        result.map(|_| self.clone())
    }

    fn save_inner(&self) -> Result<()> {
        for property in self.0.ty.stored_properties() {
            if let Some(proxy) = property.proxy() {
                proxy.on_pre_save(self)?;
            }
        }
        self.write_row()?;
        self.cache_instance();
        for property in self.0.ty.stored_properties() {
            if let Some(proxy) = property.proxy() {
                proxy.on_post_save(self)?;
            }
        }
        Ok(())
    }

    fn write_row(&self) -> Result<()> {
        let inserted = {
            let mut state = self.state();
            let row = self.materialize(&mut state)?;
            let was_new = row.pk().is_none();
            self.0.db.store().save_row(self.0.ty.schema(), row)?;
            state.key = state.row.as_ref().and_then(Row::pk);
            was_new
        };
        if inserted {
            self.0.db.record_insert(self);
        }
        Ok(())
    }

    /// Put the keyed instance into its type's identity map
    pub(crate) fn cache_instance(&self) {
        if let Some(pk) = self.pk() {
            self.0.ty.identity().register(pk, self);
        }
    }

    /// Record the key a bulk insert assigned to the row
    pub(crate) fn sync_key(&self) {
        let mut state = self.state();
        state.key = state.row.as_ref().and_then(Row::pk);
    }

    /// Lock the state and hand out the materialized row
    pub(crate) fn lock_row(&self) -> Result<RowGuard<'_>> {
        let mut state = self.state();
        self.materialize(&mut state)?;
        Ok(RowGuard(state))
    }

    /// Undo a key assigned inside a rolled-back transaction
    pub(crate) fn forget_key(&self) {
        let pk = {
            let mut state = self.state();
            let pk = state.key.take();
            if let Some(row) = state.row.as_mut() {
                row.set_pk(None);
            }
            pk
        };
        if let Some(pk) = pk {
            self.0.ty.identity().forget(pk, self);
            debug!("Cleared key {} of rolled-back {}", pk, self.0.ty.name());
        }
    }

    /// Delete the stored row; the instance becomes unsaved again
    pub fn delete(&self) -> Result<bool> {
        let Some(pk) = self.pk() else {
            return Ok(false);
        };
        let deleted = self.0.db.store().delete_row(self.0.ty.schema(), pk)?;
        self.0.ty.identity().forget(pk, self);
        let mut state = self.state();
        state.key = None;
        state.row = None;
        debug!("Deleted {} #{}", self.0.ty.name(), pk);
        Ok(deleted)
    }

    // ========== Raw Access ==========

    /// Escape hatch for attributes that are not declared properties
    ///
    /// Resolves, in order, a column of the backing row (foreign keys are
    /// wrapped into entities through the identity map) and then a reverse
    /// relationship by its related name.
    pub fn raw_attribute(&self, name: &str) -> Result<Value> {
        if name == PK_COLUMN {
            return Ok(self.pk().map(Value::Integer).unwrap_or(Value::Null));
        }
        if name == TYPE_COLUMN {
            return Ok(Value::Text(self.0.ty.name().to_string()));
        }
        if self.0.ty.schema().find_column(name).is_some() {
            let cell = self.read_cell(name)?;
            let target = self
                .0
                .ty
                .stored_properties()
                .filter_map(|p| p.descriptor())
                .find(|d| d.column.has_column() && d.column_name() == name)
                .and_then(|d| d.target.clone());
            return match (target, cell) {
                (Some(target), Cell::Integer(pk)) => {
                    let ty = self.0.db.entity_type(&target.type_name)?;
                    let member = self.0.db.get(&ty, pk)?.ok_or(Error::StaleReference {
                        entity: target.type_name,
                        pk,
                    })?;
                    Ok(Value::Entity(member))
                }
                (_, cell) => Ok(Value::from(cell)),
            };
        }
        if let Some(related) = self.reverse_relationship(name)? {
            return Ok(Value::Entities(related));
        }
        Err(self.unknown(name))
    }

    fn reverse_relationship(&self, name: &str) -> Result<Option<Vec<Entity>>> {
        for owner in self.0.db.entity_types() {
            for property in owner.own_properties() {
                let (Some(proxy), Some(descriptor)) = (property.proxy(), property.descriptor()) else {
                    continue;
                };
                if descriptor.reverse_name() != Some(name) {
                    continue;
                }
                let Some(target) = proxy.references() else {
                    continue;
                };
                if !self.0.ty.is_a(target) {
                    continue;
                }
                let Some(pk) = self.pk() else {
                    return Ok(Some(Vec::new()));
                };
                let related = if proxy.is_many() {
                    let Some(join) = owner.schema().join(property.name()) else {
                        continue;
                    };
                    self.0
                        .db
                        .store()
                        .join_owners(join, pk)?
                        .into_iter()
                        .filter_map(|owner_pk| self.0.db.get(&owner, owner_pk).transpose())
                        .collect::<Result<Vec<_>>>()?
                } else {
                    let filter = Filter::new().eq(property.name(), Value::Entity(self.clone()));
                    self.0.db.filter(&owner, &filter)?
                };
                return Ok(Some(related));
            }
        }
        Ok(None)
    }
}

/// Exclusive access to an entity's materialized row
pub(crate) struct RowGuard<'a>(MutexGuard<'a, EntityState>);

impl RowGuard<'_> {
    pub(crate) fn row_mut(&mut self) -> Option<&mut Row> {
        self.0.row.as_mut()
    }
}
