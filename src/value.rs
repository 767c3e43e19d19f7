//! Value types - declared property types, in-memory values and stored cells
//!
//! Three layers meet here:
//! - `ValueType`: the semantic type a property is declared with
//! - `Value`: what callers read from and write to an entity
//! - `Cell`: what a store row holds for one column

use std::fmt;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use crate::entity::{Entity, EntityType};

/// Declared type of a property.
///
/// Drives the field type registry: every declared type resolves to a
/// storage field mapping at type-declaration time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Float,
    Integer,
    Boolean,
    Text,
    Timestamp,
    /// Opaque structured values, stored serialized
    List,
    Tuple,
    Set,
    Map,
    /// A type-value, stored as its fully-qualified name
    Type,
    /// Reference to a single entity of the named type
    Entity(String),
    /// Parameterized sequence; a sequence of entities is a many-relationship
    Sequence(Box<ValueType>),
    /// Caller-registered type, optionally falling back to a base type
    Custom {
        name: String,
        base: Option<Box<ValueType>>,
    },
}

impl ValueType {
    /// Reference to a single entity of the given type
    pub fn entity(ty: &EntityType) -> Self {
        ValueType::Entity(ty.name().to_string())
    }

    /// Many-relationship to entities of the given type
    pub fn many(ty: &EntityType) -> Self {
        ValueType::Sequence(Box::new(ValueType::entity(ty)))
    }

    /// Sequence of an arbitrary element type
    pub fn sequence(inner: ValueType) -> Self {
        ValueType::Sequence(Box::new(inner))
    }

    /// Caller-defined type with no fallback
    pub fn custom(name: impl Into<String>) -> Self {
        ValueType::Custom { name: name.into(), base: None }
    }

    /// Caller-defined type that resolves like `base` when not registered itself
    pub fn custom_with_base(name: impl Into<String>, base: ValueType) -> Self {
        ValueType::Custom { name: name.into(), base: Some(Box::new(base)) }
    }

    /// Target type name of a single-entity reference
    pub fn entity_target(&self) -> Option<&str> {
        match self {
            ValueType::Entity(name) => Some(name),
            ValueType::Custom { base: Some(base), .. } => base.entity_target(),
            _ => None,
        }
    }

    /// Target type name of a many-relationship (`sequence<entity<T>>`)
    pub fn many_target(&self) -> Option<&str> {
        match self {
            ValueType::Sequence(inner) => match inner.as_ref() {
                ValueType::Entity(name) => Some(name),
                _ => None,
            },
            ValueType::Custom { base: Some(base), .. } => base.many_target(),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Float => write!(f, "float"),
            ValueType::Integer => write!(f, "integer"),
            ValueType::Boolean => write!(f, "boolean"),
            ValueType::Text => write!(f, "text"),
            ValueType::Timestamp => write!(f, "timestamp"),
            ValueType::List => write!(f, "list"),
            ValueType::Tuple => write!(f, "tuple"),
            ValueType::Set => write!(f, "set"),
            ValueType::Map => write!(f, "map"),
            ValueType::Type => write!(f, "type"),
            ValueType::Entity(name) => write!(f, "entity<{}>", name),
            ValueType::Sequence(inner) => write!(f, "sequence<{}>", inner),
            ValueType::Custom { name, .. } => write!(f, "{}", name),
        }
    }
}

/// A property value as seen by callers
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Type(Arc<EntityType>),
    Entity(Entity),
    Entities(Vec<Entity>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&Arc<EntityType>> {
        match self {
            Value::Type(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Entity(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entities(&self) -> Option<&[Entity]> {
        match self {
            Value::Entities(v) => Some(v),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "boolean",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
            Value::Type(_) => "type",
            Value::Entity(_) => "entity",
            Value::Entities(_) => "entities",
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Arc<EntityType>> for Value {
    fn from(v: Arc<EntityType>) -> Self {
        Value::Type(v)
    }
}

impl From<Entity> for Value {
    fn from(v: Entity) -> Self {
        Value::Entity(v)
    }
}

impl From<&Entity> for Value {
    fn from(v: &Entity) -> Self {
        Value::Entity(v.clone())
    }
}

impl From<Vec<Entity>> for Value {
    fn from(v: Vec<Entity>) -> Self {
        Value::Entities(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A stored column value, following SQLite storage classes
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Cell> for Value {
    fn from(cell: Cell) -> Self {
        match cell {
            Cell::Null => Value::Null,
            Cell::Integer(v) => Value::Integer(v),
            Cell::Real(v) => Value::Float(v),
            Cell::Text(v) => Value::Text(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_display() {
        let many = ValueType::sequence(ValueType::Entity("Book".into()));
        assert_eq!(many.to_string(), "sequence<entity<Book>>");
        assert_eq!(ValueType::custom("Money").to_string(), "Money");
    }

    #[test]
    fn test_reference_targets() {
        let single = ValueType::Entity("Author".into());
        let many = ValueType::sequence(single.clone());
        let ints = ValueType::sequence(ValueType::Integer);

        assert_eq!(single.entity_target(), Some("Author"));
        assert_eq!(single.many_target(), None);
        assert_eq!(many.many_target(), Some("Author"));
        assert_eq!(many.entity_target(), None);
        assert_eq!(ints.many_target(), None);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::from(3).as_f64(), Some(3.0));
        assert_eq!(Value::from("asdf").as_str(), Some("asdf"));
        assert!(Value::from(None::<i64>).is_null());
        assert_eq!(Value::from(true).kind_name(), "boolean");
    }
}
