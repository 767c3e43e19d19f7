//! Field proxies - per-property translation between values and stored cells
//!
//! Every storage-bound property owns one proxy. A proxy reads and writes the
//! entity's backing row in memory only; the row reaches the store when the
//! entity is saved, with two hooks around that write:
//! 1. `on_pre_save` runs before the row is written (referenced entities)
//! 2. `on_post_save` runs once the row has a key (join rows)

mod collection;
mod many;
mod reference;
mod scalar;
mod type_value;

pub use collection::CollectionProxy;
pub use many::ManyToManyProxy;
pub use reference::ReferenceProxy;
pub use scalar::ScalarProxy;
pub use type_value::TypeProxy;

use std::fmt;
use crate::Result;
use crate::descriptor::FieldDescriptor;
use crate::entity::Entity;
use crate::value::{Cell, Value};

/// Translator between one property and its stored field
pub trait FieldProxy: Send + Sync + fmt::Debug {
    /// Resolved storage specification, fixed at type-declaration time
    fn field_descriptor(&self) -> &FieldDescriptor;

    /// Read the stored field and convert it to the declared value type
    fn get(&self, entity: &Entity) -> Result<Value>;

    /// Write a value into the entity's in-memory row
    fn set(&self, entity: &Entity, value: &Value) -> Result<()>;

    /// Stored form of a value, used for lookups by criteria
    fn to_cell(&self, value: &Value) -> Result<Cell>;

    fn on_pre_save(&self, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    fn on_post_save(&self, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    /// Target entity type name for reference fields
    fn references(&self) -> Option<&str> {
        None
    }

    /// Whether the field is a many-relationship backed by a join table
    fn is_many(&self) -> bool {
        false
    }

    fn property(&self) -> &str {
        &self.field_descriptor().name
    }
}

/// Build the `TypeMismatch` error for a value a proxy cannot store
pub(crate) fn mismatch(descriptor: &FieldDescriptor, value: &Value) -> crate::Error {
    crate::Error::TypeMismatch {
        property: descriptor.name.clone(),
        expected: descriptor.column.to_string(),
        found: value.kind_name().to_string(),
    }
}
