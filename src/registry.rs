//! Field Type Registry
//!
//! Maps a declared value type to the storage mapping (column type + field
//! proxy) used for it. Lookup walks the candidate keys of a value type from
//! most to least specific and takes the first registered one, so
//! `sequence<entity<T>>` hits the many-relationship entry before falling back
//! to the generic list entry.

use std::collections::HashMap;
use crate::{Error, Result};
use crate::descriptor::{ColumnType, FieldBinding, FieldOptions, OnDelete};
use crate::proxy::{
    CollectionProxy, FieldProxy, ManyToManyProxy, ReferenceProxy, ScalarProxy, TypeProxy,
};
use crate::value::ValueType;

/// Default maximum length of text columns
pub const DEFAULT_TEXT_MAX_LENGTH: usize = 256;

/// Registry lookup key derived from a `ValueType`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Float,
    Integer,
    Boolean,
    Text,
    Timestamp,
    List,
    Tuple,
    Set,
    Map,
    Type,
    /// Any entity type
    AnyEntity,
    /// One specific entity type
    Entity(String),
    SequenceOf(Box<TypeKey>),
    Custom(String),
}

impl TypeKey {
    /// Candidate keys for a declared type, most specific first
    pub fn candidates(value_type: &ValueType) -> Vec<TypeKey> {
        match value_type {
            ValueType::Float => vec![TypeKey::Float],
            ValueType::Integer => vec![TypeKey::Integer],
            ValueType::Boolean => vec![TypeKey::Boolean],
            ValueType::Text => vec![TypeKey::Text],
            ValueType::Timestamp => vec![TypeKey::Timestamp],
            ValueType::List => vec![TypeKey::List],
            ValueType::Tuple => vec![TypeKey::Tuple],
            ValueType::Set => vec![TypeKey::Set],
            ValueType::Map => vec![TypeKey::Map],
            ValueType::Type => vec![TypeKey::Type],
            ValueType::Entity(name) => vec![TypeKey::Entity(name.clone()), TypeKey::AnyEntity],
            ValueType::Sequence(inner) => {
                let mut keys: Vec<TypeKey> = TypeKey::candidates(inner)
                    .into_iter()
                    .map(|k| TypeKey::SequenceOf(Box::new(k)))
                    .collect();
                keys.push(TypeKey::List);
                keys
            }
            ValueType::Custom { name, base } => {
                let mut keys = vec![TypeKey::Custom(name.clone())];
                if let Some(base) = base {
                    keys.extend(TypeKey::candidates(base));
                }
                keys
            }
        }
    }
}

/// Builds the field proxy for one bound property
pub type ProxyFactory = fn(&FieldBinding) -> Box<dyn FieldProxy>;

/// Storage mapping registered for a type key
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    pub column: ColumnType,
    pub proxy: ProxyFactory,
}

impl FieldMapping {
    pub fn new(column: ColumnType, proxy: ProxyFactory) -> Self {
        Self { column, proxy }
    }
}

/// Registry of type key -> storage mapping, plus per-column default arguments
#[derive(Debug, Default, Clone)]
pub struct FieldTypeRegistry {
    mappings: HashMap<TypeKey, FieldMapping>,
    column_defaults: HashMap<ColumnType, FieldOptions>,
}

impl FieldTypeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the mapping for a key
    pub fn register(&mut self, key: TypeKey, mapping: FieldMapping) {
        self.mappings.insert(key, mapping);
    }

    /// Register the same mapping under several keys
    pub fn register_keys(&mut self, keys: &[TypeKey], mapping: FieldMapping) {
        for key in keys {
            self.register(key.clone(), mapping);
        }
    }

    /// Set the default arguments applied to every field of a column type
    pub fn register_defaults(&mut self, column: ColumnType, defaults: FieldOptions) {
        self.column_defaults.insert(column, defaults);
    }

    /// Find the nearest registered mapping for a declared type
    pub fn resolve(&self, value_type: &ValueType) -> Result<(TypeKey, FieldMapping)> {
        TypeKey::candidates(value_type)
            .into_iter()
            .find_map(|key| self.mappings.get(&key).map(|m| (key, *m)))
            .ok_or_else(|| Error::UnsupportedType(value_type.to_string()))
    }

    /// Default arguments for a column type
    pub fn defaults_for(&self, column: ColumnType) -> FieldOptions {
        self.column_defaults.get(&column).cloned().unwrap_or_default()
    }

    /// Override the default text column length
    pub fn set_text_max_length(&mut self, len: usize) {
        let defaults = self.defaults_for(ColumnType::Text).max_length(len);
        self.register_defaults(ColumnType::Text, defaults);
    }
}

fn scalar(binding: &FieldBinding) -> Box<dyn FieldProxy> {
    Box::new(ScalarProxy::new(binding))
}

fn collection(binding: &FieldBinding) -> Box<dyn FieldProxy> {
    Box::new(CollectionProxy::new(binding))
}

fn type_value(binding: &FieldBinding) -> Box<dyn FieldProxy> {
    Box::new(TypeProxy::new(binding))
}

fn reference(binding: &FieldBinding) -> Box<dyn FieldProxy> {
    Box::new(ReferenceProxy::new(binding))
}

fn many_to_many(binding: &FieldBinding) -> Box<dyn FieldProxy> {
    Box::new(ManyToManyProxy::new(binding))
}

/// Create a registry with all built-in mappings
pub fn default_registry() -> FieldTypeRegistry {
    let mut registry = FieldTypeRegistry::new();
    registry.register(TypeKey::Float, FieldMapping::new(ColumnType::Real, scalar));
    registry.register(TypeKey::Integer, FieldMapping::new(ColumnType::Integer, scalar));
    registry.register(TypeKey::Boolean, FieldMapping::new(ColumnType::Boolean, scalar));
    registry.register(TypeKey::Text, FieldMapping::new(ColumnType::Text, scalar));
    registry.register(TypeKey::Timestamp, FieldMapping::new(ColumnType::Timestamp, scalar));
    registry.register_keys(
        &[TypeKey::List, TypeKey::Tuple, TypeKey::Set, TypeKey::Map],
        FieldMapping::new(ColumnType::Json, collection),
    );
    registry.register(TypeKey::Type, FieldMapping::new(ColumnType::Text, type_value));
    registry.register(TypeKey::AnyEntity, FieldMapping::new(ColumnType::ForeignKey, reference));
    registry.register(
        TypeKey::SequenceOf(Box::new(TypeKey::AnyEntity)),
        FieldMapping::new(ColumnType::ManyToMany, many_to_many),
    );

    registry.register_defaults(ColumnType::Text, FieldOptions::new().max_length(DEFAULT_TEXT_MAX_LENGTH));
    registry.register_defaults(ColumnType::ForeignKey, FieldOptions::new().on_delete(OnDelete::Cascade));
    registry
}
