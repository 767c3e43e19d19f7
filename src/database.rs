//! Database facade
//!
//! Ties a store, the field type registry and the catalog of declared entity
//! types together, and exposes the caller-facing operations: declaring
//! types, constructing entities, identity-mapped lookups and batched
//! persistence scopes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};
use tracing::{debug, info};
use crate::config::{ensure_db_dir, PropbindConfig};
use crate::entity::{Entity, EntityType, EntityTypeBuilder, TypeCatalog};
use crate::persist::PersistenceContext;
use crate::registry::{default_registry, FieldMapping, FieldTypeRegistry, TypeKey};
use crate::storage::{Criteria, Row, SqliteStore, Store, StoreStats};
use crate::value::{Cell, Value};
use crate::{Error, Result};

/// Lookup criteria: an optional primary key plus property equalities
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pk: Option<i64>,
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pk(mut self, pk: i64) -> Self {
        self.pk = Some(pk);
        self
    }

    /// Match a property (or raw column) value
    pub fn eq(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((name.into(), value.into()));
        self
    }

    pub fn primary_key(&self) -> Option<i64> {
        self.pk
    }
}

struct DatabaseInner {
    store: Arc<dyn Store>,
    registry: RwLock<FieldTypeRegistry>,
    catalog: Arc<TypeCatalog>,
    /// Entities keyed inside open batch transactions, per thread, innermost last
    journal: Mutex<HashMap<ThreadId, Vec<Vec<Entity>>>>,
    save_on_create: bool,
}

/// Handle to an entity database; clones share everything
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("types", &self.inner.catalog.all().iter().map(|t| t.name().to_string()).collect::<Vec<_>>())
            .field("save_on_create", &self.inner.save_on_create)
            .finish()
    }
}

impl Database {
    /// Database over a store, with the built-in field type registry
    pub fn new(store: impl Store + 'static) -> Self {
        Self::with_options(store, default_registry(), true)
    }

    pub fn with_registry(store: impl Store + 'static, registry: FieldTypeRegistry) -> Self {
        Self::with_options(store, registry, true)
    }

    /// Full constructor; `save_on_create` is the default for types that do not set it
    pub fn with_options(store: impl Store + 'static, registry: FieldTypeRegistry, save_on_create: bool) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                store: Arc::new(store),
                registry: RwLock::new(registry),
                catalog: Arc::new(TypeCatalog::new()),
                journal: Mutex::new(HashMap::new()),
                save_on_create,
            }),
        }
    }

    /// In-memory SQLite database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(SqliteStore::open_in_memory()?))
    }

    /// SQLite database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(SqliteStore::open(path)?))
    }

    /// Open the database a configuration points at, relative to `base`
    pub fn from_config(config: &PropbindConfig, base: &Path) -> anyhow::Result<Self> {
        let path = config.database_path(base);
        ensure_db_dir(&path)?;
        let store = SqliteStore::open_with(&path, config.foreign_keys)?;
        let mut registry = default_registry();
        registry.set_text_max_length(config.text_max_length);
        info!("Opened entity database at {}", path.display());
        Ok(Self::with_options(store, registry, config.save_on_create))
    }

    /// Open the database described by a config file
    ///
    /// `path` defaults to `propbind.toml` under `base`; a missing file means
    /// the default configuration.
    pub fn from_config_file(path: Option<&Path>, base: &Path) -> anyhow::Result<Self> {
        let config = PropbindConfig::discover(path, base)?;
        Self::from_config(&config, base)
    }

    pub fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.store.stats()
    }

    // ========== Type Declarations ==========

    /// Register a storage mapping for types declared from now on
    pub fn register_field_type(&self, key: TypeKey, mapping: FieldMapping) {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(key, mapping);
    }

    pub(crate) fn read_registry<R>(&self, f: impl FnOnce(&FieldTypeRegistry) -> R) -> R {
        let registry = self.inner.registry.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&registry)
    }

    pub(crate) fn catalog(&self) -> &Arc<TypeCatalog> {
        &self.inner.catalog
    }

    pub(crate) fn save_on_create_default(&self) -> bool {
        self.inner.save_on_create
    }

    /// Start declaring an entity type
    pub fn define(&self, name: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder::new(self.clone(), name)
    }

    pub fn find_type(&self, name: &str) -> Option<Arc<EntityType>> {
        self.inner.catalog.find(name)
    }

    /// Declared type by short name
    pub fn entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        self.find_type(name)
            .ok_or_else(|| Error::UnresolvedType(name.to_string()))
    }

    /// Declared type by stored `module::Name`
    pub fn resolve_type(&self, qualified: &str) -> Result<Arc<EntityType>> {
        self.inner.catalog.resolve(qualified)
    }

    pub fn entity_types(&self) -> Vec<Arc<EntityType>> {
        self.inner.catalog.all()
    }

    // ========== Construction ==========

    fn build_entity<I, K, V>(&self, ty: &Arc<EntityType>, values: I) -> Result<Entity>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let entity = Entity::fresh(self.clone(), ty.clone());
        let mut assigned = HashSet::new();
        for (name, value) in values {
            entity.set(name.as_ref(), value)?;
            assigned.insert(name.as_ref().to_string());
        }
        for property in ty.properties() {
            if property.is_stored() && property.has_explicit_default() && !assigned.contains(property.name()) {
                let value = property.read_default(&entity)?;
                entity.set(property.name(), value)?;
            }
        }
        Ok(entity)
    }

    /// Construct an entity, saving it if the type saves on create
    ///
    /// Use [`PersistenceContext::create`] to batch the save instead.
    pub fn create<I, K, V>(&self, ty: &Arc<EntityType>, values: I) -> Result<Entity>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let entity = self.build_entity(ty, values)?;
        if ty.save_on_create() {
            entity.save()?;
        }
        Ok(entity)
    }

    /// Construct an entity and save it regardless of the type's setting
    pub fn create_saved<I, K, V>(&self, ty: &Arc<EntityType>, values: I) -> Result<Entity>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let entity = self.build_entity(ty, values)?;
        entity.save()?;
        Ok(entity)
    }

    /// Construct an entity without saving it
    pub fn create_unsaved<I, K, V>(&self, ty: &Arc<EntityType>, values: I) -> Result<Entity>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.build_entity(ty, values)
    }

    /// Handle for a stored row that is only fetched on first access
    ///
    /// When `ty` has subtypes the row is read up front so the handle carries
    /// the concrete type; later lookups through any type of the hierarchy
    /// then return this same instance.
    pub fn deferred(&self, ty: &Arc<EntityType>, pk: i64) -> Result<Entity> {
        if let Some(live) = self.live_instance(ty, pk) {
            return Ok(live);
        }
        if ty.identity().has_children() {
            if let Some(row) = self.store().get_row(ty.schema(), &Criteria::by_pk(pk))? {
                return self.from_row(row);
            }
        }
        let entity = Entity::deferred(self.clone(), ty.clone(), pk);
        Ok(ty.identity().register(pk, &entity))
    }

    /// Live instance of `ty` (or a subtype) for a key, wherever it is registered
    fn live_instance(&self, ty: &EntityType, pk: i64) -> Option<Entity> {
        ty.root()
            .identity()
            .lookup(pk)
            .filter(|live| live.entity_type().is_subtype_of(ty))
    }

    // ========== Lookups ==========

    /// Entity by primary key; `Ok(None)` when no row exists
    pub fn get(&self, ty: &Arc<EntityType>, pk: i64) -> Result<Option<Entity>> {
        self.find(ty, &Filter::new().pk(pk))
    }

    /// Single entity matching a filter
    ///
    /// A primary key with a live instance returns that instance without
    /// touching the store. More than one matching row is an error.
    pub fn find(&self, ty: &Arc<EntityType>, filter: &Filter) -> Result<Option<Entity>> {
        if let Some(live) = filter.pk.and_then(|pk| self.live_instance(ty, pk)) {
            return Ok(Some(live));
        }
        let criteria = self.criteria(ty, filter)?;
        match self.store().get_row(ty.schema(), &criteria)? {
            Some(row) => self.from_row(row).map(Some),
            None => Ok(None),
        }
    }

    /// All entities matching a filter, in key order
    pub fn filter(&self, ty: &Arc<EntityType>, filter: &Filter) -> Result<Vec<Entity>> {
        self.query(ty, filter)?.collect()
    }

    /// Lazily wrap the rows matching a filter
    pub fn query<'a>(
        &'a self,
        ty: &Arc<EntityType>,
        filter: &Filter,
    ) -> Result<impl Iterator<Item = Result<Entity>> + use<'a>> {
        let criteria = self.criteria(ty, filter)?;
        let rows = self.store().filter_rows(ty.schema(), &criteria)?;
        Ok(self.from_rows(rows))
    }

    pub fn all(&self, ty: &Arc<EntityType>) -> Result<Vec<Entity>> {
        self.filter(ty, &Filter::new())
    }

    fn criteria(&self, ty: &EntityType, filter: &Filter) -> Result<Criteria> {
        let mut criteria = Criteria::new();
        criteria.pk = filter.pk;
        for (name, value) in &filter.conditions {
            let stored = ty
                .property(name)
                .and_then(|p| p.proxy())
                .map(|proxy| (proxy.field_descriptor().column_name(), proxy.clone()));
            criteria = match stored {
                Some((column, proxy)) => criteria.eq(column, proxy.to_cell(value)?),
                None if ty.schema().find_column(name).is_some() => criteria.eq(name.clone(), raw_cell(name, value)?),
                None => {
                    return Err(Error::UnknownProperty {
                        entity: ty.name().to_string(),
                        property: name.clone(),
                    })
                }
            };
        }
        Ok(criteria)
    }

    /// Wrap a stored row, returning the live instance if there is one
    ///
    /// The row's type tag selects the concrete entity type. A row read
    /// through a base type's schema is refetched with the concrete schema.
    pub fn from_row(&self, row: Row) -> Result<Entity> {
        let concrete = self.entity_type(row.type_name())?;
        let pk = row.pk();
        if let Some(live) = pk.and_then(|pk| concrete.root().identity().lookup(pk)) {
            return Ok(live);
        }
        let complete = concrete.schema().columns().all(|c| row.get(&c.name).is_some());
        let row = match (complete, pk) {
            (false, Some(pk)) => self
                .store()
                .get_row(concrete.schema(), &Criteria::by_pk(pk))?
                .ok_or_else(|| Error::StaleReference {
                    entity: concrete.name().to_string(),
                    pk,
                })?,
            _ => row,
        };
        let entity = Entity::loaded(self.clone(), concrete.clone(), row);
        Ok(match pk {
            Some(pk) => concrete.identity().register(pk, &entity),
            None => entity,
        })
    }

    /// Lazily wrap store rows into entities
    pub fn from_rows(&self, rows: Vec<Row>) -> impl Iterator<Item = Result<Entity>> + '_ {
        rows.into_iter().map(move |row| self.from_row(row))
    }

    // ========== Persistence ==========

    /// Run `body` in a persistence scope and batch-save what it created
    ///
    /// See [`PersistenceContext::persist`].
    pub fn persist<T>(&self, body: impl FnOnce(&PersistenceContext<'_>) -> Result<T>) -> Result<T> {
        PersistenceContext::new(self).run(body)
    }

    /// Pre-save hooks, then one store call for every unsaved entity of `ty`
    pub(crate) fn bulk_save(&self, ty: &Arc<EntityType>, group: &[Entity]) -> Result<()> {
        for entity in group {
            for property in ty.stored_properties() {
                if let Some(proxy) = property.proxy() {
                    proxy.on_pre_save(entity)?;
                }
            }
        }
        let unsaved: Vec<&Entity> = group.iter().filter(|e| e.pk().is_none()).collect();
        {
            let mut guards = unsaved.iter().map(|e| e.lock_row()).collect::<Result<Vec<_>>>()?;
            let mut rows: Vec<&mut Row> = guards.iter_mut().filter_map(|g| g.row_mut()).collect();
            self.store().bulk_insert(ty.schema(), &mut rows)?;
        }
        for entity in unsaved {
            entity.sync_key();
            entity.cache_instance();
            self.record_insert(entity);
        }
        Ok(())
    }

    fn journal(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<Vec<Entity>>>> {
        self.inner.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn begin_journal(&self) {
        self.journal().entry(thread::current().id()).or_default().push(Vec::new());
    }

    /// Remember an entity that received its key inside this thread's open batch
    pub(crate) fn record_insert(&self, entity: &Entity) {
        let mut journal = self.journal();
        if let Some(frame) = journal.get_mut(&thread::current().id()).and_then(|frames| frames.last_mut()) {
            frame.push(entity.clone());
        }
    }

    pub(crate) fn commit_journal(&self) {
        let me = thread::current().id();
        let mut journal = self.journal();
        let Some(frames) = journal.get_mut(&me) else {
            return;
        };
        let frame = frames.pop().unwrap_or_default();
        match frames.last_mut() {
            Some(outer) => outer.extend(frame),
            None => {
                journal.remove(&me);
            }
        }
    }

    /// Clear the keys handed out inside the rolled-back batch
    pub(crate) fn rollback_journal(&self) {
        let me = thread::current().id();
        let frame = {
            let mut journal = self.journal();
            let frame = journal.get_mut(&me).and_then(|frames| frames.pop()).unwrap_or_default();
            if journal.get(&me).is_some_and(|frames| frames.is_empty()) {
                journal.remove(&me);
            }
            frame
        };
        for entity in frame.iter().rev() {
            entity.forget_key();
        }
        debug!("Rolled back {} keyed entities", frame.len());
    }
}

fn raw_cell(column: &str, value: &Value) -> Result<Cell> {
    match value {
        Value::Null => Ok(Cell::Null),
        Value::Integer(v) => Ok(Cell::Integer(*v)),
        Value::Float(v) => Ok(Cell::Real(*v)),
        Value::Bool(v) => Ok(Cell::Integer(i64::from(*v))),
        Value::Text(v) => Ok(Cell::Text(v.clone())),
        Value::Entity(e) => Ok(e.pk().map(Cell::Integer).unwrap_or(Cell::Null)),
        other => Err(Error::TypeMismatch {
            property: column.to_string(),
            expected: "column value".into(),
            found: other.kind_name().to_string(),
        }),
    }
}
