//! Entity types and their declaration builder
//!
//! Declaring a type is an explicit build step, run once at startup:
//!
//! ```ignore
//! let test_class = db.define("TestClass")
//!     .property(Property::new("foo", ValueType::Float).db_field())
//!     .property(Property::new("str_field", ValueType::Text).db_field())
//!     .build()?;
//! let subclass = db.define("Subclass")
//!     .extends(&test_class)
//!     .property(Property::new("bar", ValueType::Integer).db_field())
//!     .build()?;
//! ```
//!
//! `build` resolves every storage binding (unsupported value types fail
//! here), composes the row schema from the parent's plus the newly declared
//! fields, creates the tables and chains the identity map below the parent's.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::info;
use crate::database::Database;
use crate::descriptor::FieldTarget;
use crate::naming::{pascal_to_snake, qualified_name, validate_identifier};
use crate::property::{BoundProperty, Property};
use crate::storage::{RowSchema, TableSchema, PK_COLUMN, TYPE_COLUMN};
use crate::{Error, Result};
use super::catalog::TypeCatalog;
use super::identity::IdentityMap;

/// A declared, persistable entity type
pub struct EntityType {
    name: String,
    module: String,
    qualified: String,
    table: String,
    parent: Option<Arc<EntityType>>,
    /// Inherited properties first, then the type's own
    properties: Vec<BoundProperty>,
    own_start: usize,
    schema: RowSchema,
    identity: Arc<IdentityMap>,
    catalog: Weak<TypeCatalog>,
    has_many: bool,
    bulk_eligible: bool,
    save_on_create: bool,
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.qualified)
            .field("table", &self.table)
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .field("properties", &self.properties.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified)
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.qualified == other.qualified && Weak::ptr_eq(&self.catalog, &other.catalog)
    }
}

impl Eq for EntityType {}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// `module::Name`, the stored form of a type-value
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn parent(&self) -> Option<&Arc<EntityType>> {
        self.parent.as_ref()
    }

    /// Topmost ancestor; its identity map covers the whole hierarchy
    pub fn root(&self) -> &EntityType {
        match &self.parent {
            Some(parent) => parent.root(),
            None => self,
        }
    }

    /// All properties, inherited ones first
    pub fn properties(&self) -> &[BoundProperty] {
        &self.properties
    }

    /// Properties declared by this type itself
    pub fn own_properties(&self) -> &[BoundProperty] {
        &self.properties[self.own_start..]
    }

    pub fn property(&self, name: &str) -> Option<&BoundProperty> {
        self.properties.iter().find(|p| p.name() == name)
    }

    /// Properties with a storage binding
    pub fn stored_properties(&self) -> impl Iterator<Item = &BoundProperty> {
        self.properties.iter().filter(|p| p.is_stored())
    }

    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    pub fn identity(&self) -> &Arc<IdentityMap> {
        &self.identity
    }

    /// Whether any property is a many-relationship
    pub fn has_many(&self) -> bool {
        self.has_many
    }

    /// Whether instances can be written with a single bulk insert
    pub fn is_bulk_eligible(&self) -> bool {
        self.bulk_eligible
    }

    pub fn save_on_create(&self) -> bool {
        self.save_on_create
    }

    /// True if this type is `name` or derives from it
    pub fn is_a(&self, name: &str) -> bool {
        self.name == name || self.parent.as_ref().is_some_and(|p| p.is_a(name))
    }

    pub fn is_subtype_of(&self, other: &EntityType) -> bool {
        self == other || self.parent.as_ref().is_some_and(|p| p.is_subtype_of(other))
    }

    /// Entity types targeted by reference and many-reference properties
    pub fn reference_targets(&self) -> Vec<Arc<EntityType>> {
        let Some(catalog) = self.catalog.upgrade() else {
            return Vec::new();
        };
        let mut targets: Vec<Arc<EntityType>> = Vec::new();
        for name in self.stored_properties().filter_map(|p| p.proxy().and_then(|x| x.references())) {
            if let Some(ty) = catalog.find(name) {
                if !targets.iter().any(|t| t.name() == ty.name()) {
                    targets.push(ty);
                }
            }
        }
        targets
    }

    /// True if a reference property, directly or through the referenced
    /// types' own references, may point at instances of `other`
    pub fn refers_to(&self, other: &EntityType) -> bool {
        self.refers_to_inner(other, &mut HashSet::new())
    }

    fn refers_to_inner(&self, other: &EntityType, visited: &mut HashSet<String>) -> bool {
        if !visited.insert(self.qualified.clone()) {
            return false;
        }
        let targets = self.reference_targets();
        if targets.iter().any(|t| other.is_subtype_of(t)) {
            return true;
        }
        targets.iter().any(|t| t.refers_to_inner(other, visited))
    }

    /// Stored column names of the whole chain, plus the reserved ones
    fn column_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self.schema.columns().map(|c| c.name.clone()).collect();
        names.insert(PK_COLUMN.to_string());
        names.insert(TYPE_COLUMN.to_string());
        names
    }
}

/// Builder for an entity type declaration
#[derive(Debug)]
pub struct EntityTypeBuilder {
    db: Database,
    name: String,
    module: Option<String>,
    parent: Option<Arc<EntityType>>,
    properties: Vec<Property>,
    save_on_create: Option<bool>,
}

impl EntityTypeBuilder {
    pub(crate) fn new(db: Database, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
            module: None,
            parent: None,
            properties: Vec::new(),
            save_on_create: None,
        }
    }

    /// Derive from a parent type, extending its row schema
    pub fn extends(mut self, parent: &Arc<EntityType>) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Module path used in the type's qualified name (defaults to the parent's)
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Whether constructing an instance outside a persistence scope saves it
    pub fn save_on_create(mut self, save: bool) -> Self {
        self.save_on_create = Some(save);
        self
    }

    /// Compose the type, create its tables and register it
    pub fn build(self) -> Result<Arc<EntityType>> {
        validate_identifier("entity type", &self.name)?;
        let catalog = self.db.catalog().clone();
        if catalog.contains(&self.name) {
            return Err(Error::Schema(format!("Entity type {} is already declared", self.name)));
        }
        if let Some(parent) = &self.parent {
            if !Weak::ptr_eq(&parent.catalog, &Arc::downgrade(&catalog)) {
                return Err(Error::Schema(format!(
                    "{} cannot extend {}: declared on another database",
                    self.name,
                    parent.name()
                )));
            }
        }

        let table = pascal_to_snake(&self.name);
        let module = self
            .module
            .or_else(|| self.parent.as_ref().map(|p| p.module().to_string()))
            .unwrap_or_default();
        let qualified = qualified_name(&module, &self.name);

        let mut properties: Vec<BoundProperty> = self
            .parent
            .as_ref()
            .map(|p| p.properties().to_vec())
            .unwrap_or_default();
        let own_start = properties.len();
        let mut columns = self.parent.as_ref().map(|p| p.column_names()).unwrap_or_else(|| {
            HashSet::from([PK_COLUMN.to_string(), TYPE_COLUMN.to_string()])
        });

        let mut descriptors = Vec::new();
        for property in self.properties {
            validate_identifier("property", property.name())?;
            if properties.iter().any(|p| p.name() == property.name()) {
                return Err(Error::Schema(format!(
                    "Property {} is declared twice on {}",
                    property.name(),
                    self.name
                )));
            }

            let target = match property.value_type().entity_target().or(property.value_type().many_target()) {
                Some(target) if target == self.name => Some(FieldTarget {
                    type_name: self.name.clone(),
                    table: table.clone(),
                }),
                Some(target) => {
                    let ty = catalog.find(target).ok_or_else(|| {
                        Error::Schema(format!(
                            "{}.{} refers to undeclared entity type {}",
                            self.name,
                            property.name(),
                            target
                        ))
                    })?;
                    Some(FieldTarget {
                        type_name: ty.name().to_string(),
                        table: ty.table().to_string(),
                    })
                }
                None => None,
            };

            let bound = self.db.read_registry(|registry| property.bind(&self.name, registry, target))?;
            if let Some(descriptor) = bound.descriptor() {
                if descriptor.column.has_column() && !columns.insert(descriptor.column_name()) {
                    return Err(Error::Schema(format!(
                        "Column {} of {}.{} clashes with an existing column",
                        descriptor.column_name(),
                        self.name,
                        bound.name()
                    )));
                }
                descriptors.push(descriptor.clone());
            }
            properties.push(bound);
        }

        let own_table = TableSchema::from_descriptors(
            table.clone(),
            self.parent.as_ref().map(|p| p.table().to_string()),
            &descriptors,
        );
        let schema = match &self.parent {
            Some(parent) => parent.schema().extend(self.name.clone(), own_table),
            None => RowSchema::root(self.name.clone(), own_table),
        };
        self.db.store().ensure_schema(&schema)?;

        let has_many = properties
            .iter()
            .any(|p| p.proxy().is_some_and(|proxy| proxy.is_many()));
        let parent_has_fields = self
            .parent
            .as_ref()
            .is_some_and(|p| p.stored_properties().next().is_some());

        let identity = Arc::new(IdentityMap::new());
        if let Some(parent) = &self.parent {
            parent.identity().add_child(identity.clone());
        }

        let ty = Arc::new(EntityType {
            name: self.name,
            module,
            qualified,
            table,
            parent: self.parent,
            properties,
            own_start,
            schema,
            identity,
            catalog: Arc::downgrade(&catalog),
            has_many,
            bulk_eligible: !(parent_has_fields || has_many),
            save_on_create: self.save_on_create.unwrap_or_else(|| self.db.save_on_create_default()),
        });
        catalog.register(ty.clone())?;
        info!(
            "Declared entity type {} ({} properties, bulk insert: {})",
            ty.qualified_name(),
            ty.properties().len(),
            ty.is_bulk_eligible()
        );
        Ok(ty)
    }
}
