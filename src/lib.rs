//! # propbind - property-to-storage binding with an identity map
//!
//! Declared entity types carry typed properties. Properties with a storage
//! binding are backed by columns of a relational row, derived from their
//! value types through an extensible field type registry.
//!
//! propbind provides:
//! - Schema derivation from property value types, including references,
//!   many-references and polymorphic subtypes with joined child tables
//! - A weak identity map: at most one live instance per stored row
//! - Cascading saves and join-table reconciliation through field proxies
//! - Batched persistence scopes with reference-ordered bulk inserts
//! - SQLite-backed storage

pub mod naming;
pub mod value;
pub mod descriptor;
pub mod registry;
pub mod proxy;
pub mod property;
pub mod entity;
pub mod order;
pub mod persist;
pub mod database;
pub mod storage;
pub mod config;
pub mod logging;

#[cfg(test)]
mod tests;

// Re-exports for convenient access
pub use database::{Database, Filter};
pub use descriptor::{ColumnType, FieldOptions, OnDelete};
pub use entity::{Entity, EntityType, EntityTypeBuilder};
pub use persist::PersistenceContext;
pub use property::{Property, PropertyTrait};
pub use registry::{default_registry, FieldMapping, FieldTypeRegistry, TypeKey};
pub use storage::{SqliteStore, Store, StoreStats};
pub use value::{Cell, Value, ValueType};

/// Result type alias for propbind operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for propbind operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No field type registered for {0}")]
    UnsupportedType(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Stale reference: {entity} #{pk} no longer exists")]
    StaleReference { entity: String, pk: i64 },

    #[error("Unknown property {property} on {entity}")]
    UnknownProperty { entity: String, property: String },

    #[error("Type mismatch for {property}: expected {expected}, found {found}")]
    TypeMismatch {
        property: String,
        expected: String,
        found: String,
    },

    #[error("More than one {0} row matches")]
    MultipleRows(String),

    #[error("Unresolved entity type: {0}")]
    UnresolvedType(String),

    #[error("Transaction error: {0}")]
    Transaction(String),
}
