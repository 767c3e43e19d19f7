//! Declarative properties and the storage binding trait
//!
//! A `Property` is a named, typed attribute with an optional default-value
//! provider and a list of traits. The `DbField` trait binds the property to
//! storage: at type-declaration time it resolves a field proxy for the value
//! type through the field type registry and contributes the proxy's field
//! descriptor to the owning type's row schema.

use std::fmt;
use std::sync::Arc;
use crate::descriptor::{FieldBinding, FieldDescriptor, FieldOptions, FieldTarget};
use crate::entity::Entity;
use crate::proxy::FieldProxy;
use crate::registry::FieldTypeRegistry;
use crate::value::{Value, ValueType};
use crate::{Error, Result};

/// Computes a property's value when none has been assigned
pub type DefaultProvider = Arc<dyn Fn(&Entity) -> Result<Value> + Send + Sync>;

/// Storage binding marker attached to a property
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbField {
    /// Explicit column arguments, merged over the registry defaults
    pub options: FieldOptions,
}

impl DbField {
    pub fn new(options: FieldOptions) -> Self {
        Self { options }
    }

    /// Resolve the field proxy for a property declared on `declaring_type`
    pub fn bind(
        &self,
        property: &Property,
        declaring_type: &str,
        registry: &FieldTypeRegistry,
        target: Option<FieldTarget>,
    ) -> Result<Arc<dyn FieldProxy>> {
        let (_, mapping) = registry.resolve(&property.value_type)?;
        let binding = FieldBinding {
            property: property.name.clone(),
            declaring_type: declaring_type.to_string(),
            value_type: property.value_type.clone(),
            column: mapping.column,
            options: self.options.clone(),
            defaults: registry.defaults_for(mapping.column),
            target: target.filter(|_| mapping.column.is_relationship()),
        };
        Ok(Arc::from((mapping.proxy)(&binding)))
    }

    /// Apply an assigned value to the backing row
    pub fn apply(proxy: &dyn FieldProxy, entity: &Entity, value: &Value) -> Result<()> {
        proxy.set(entity, value)
    }
}

/// Behaviour attached to a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyTrait {
    Db(DbField),
}

/// A named, typed attribute of an entity type
#[derive(Clone)]
pub struct Property {
    name: String,
    value_type: ValueType,
    traits: Vec<PropertyTrait>,
    default: Option<DefaultProvider>,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("value_type", &self.value_type)
            .field("traits", &self.traits)
            .field("default", &self.default.is_some())
            .finish()
    }
}

impl Property {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            traits: Vec::new(),
            default: None,
        }
    }

    /// Bind the property to storage with registry defaults
    pub fn db_field(self) -> Self {
        self.with_trait(PropertyTrait::Db(DbField::default()))
    }

    /// Bind the property to storage with explicit column arguments
    pub fn db_field_with(self, options: FieldOptions) -> Self {
        self.with_trait(PropertyTrait::Db(DbField::new(options)))
    }

    pub fn with_trait(mut self, property_trait: PropertyTrait) -> Self {
        self.traits.push(property_trait);
        self
    }

    /// Constant default value
    pub fn default_value(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.default_with(move |_| Ok(value.clone()))
    }

    /// Computed default value
    pub fn default_with<F>(mut self, provider: F) -> Self
    where
        F: Fn(&Entity) -> Result<Value> + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(provider));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    pub fn traits(&self) -> &[PropertyTrait] {
        &self.traits
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// The storage binding, if the property has one
    pub fn db_trait(&self) -> Option<&DbField> {
        self.traits.iter().find_map(|t| match t {
            PropertyTrait::Db(db) => Some(db),
        })
    }

    /// Bind the property to its declaring type
    ///
    /// With a storage binding, the field proxy is resolved now so unsupported
    /// value types fail at declaration. When no default provider was declared
    /// the proxy's `get` becomes the default.
    pub fn bind(
        self,
        declaring_type: &str,
        registry: &FieldTypeRegistry,
        target: Option<FieldTarget>,
    ) -> Result<BoundProperty> {
        let proxy = match self.db_trait() {
            Some(db) => Some(db.bind(&self, declaring_type, registry, target)?),
            None => None,
        };
        let explicit_default = self.default.is_some();
        let default: DefaultProvider = match (&self.default, &proxy) {
            (Some(provider), _) => provider.clone(),
            (None, Some(proxy)) => {
                let proxy = proxy.clone();
                Arc::new(move |entity: &Entity| proxy.get(entity))
            }
            (None, None) => Arc::new(|_: &Entity| Ok(Value::Null)),
        };
        Ok(BoundProperty {
            name: self.name,
            value_type: self.value_type,
            declaring_type: declaring_type.to_string(),
            default,
            explicit_default,
            proxy,
        })
    }
}

/// A property bound to the entity type that declared it
#[derive(Clone)]
pub struct BoundProperty {
    name: String,
    value_type: ValueType,
    declaring_type: String,
    default: DefaultProvider,
    explicit_default: bool,
    proxy: Option<Arc<dyn FieldProxy>>,
}

impl fmt::Debug for BoundProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundProperty")
            .field("name", &self.name)
            .field("value_type", &self.value_type)
            .field("declaring_type", &self.declaring_type)
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl BoundProperty {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    pub fn proxy(&self) -> Option<&Arc<dyn FieldProxy>> {
        self.proxy.as_ref()
    }

    pub fn descriptor(&self) -> Option<&FieldDescriptor> {
        self.proxy.as_ref().map(|p| p.field_descriptor())
    }

    pub fn is_stored(&self) -> bool {
        self.proxy.is_some()
    }

    pub fn has_explicit_default(&self) -> bool {
        self.explicit_default
    }

    /// Value when nothing has been assigned in memory
    ///
    /// A persisted entity reads stored properties through the proxy even if
    /// the property declares its own default.
    pub fn read_default(&self, entity: &Entity) -> Result<Value> {
        match &self.proxy {
            Some(proxy) if self.explicit_default && entity.pk().is_some() => proxy.get(entity),
            _ => (self.default)(entity),
        }
    }

    /// Assign a value: stored properties write through their proxy
    pub fn apply(&self, entity: &Entity, value: &Value) -> Result<()> {
        match &self.proxy {
            Some(proxy) => DbField::apply(proxy.as_ref(), entity, value),
            None => Ok(()),
        }
    }

    /// Check a value against the declared type, normalizing integers for floats
    pub fn check(&self, value: Value) -> Result<Value> {
        check_value(&self.name, &self.value_type, value)
    }
}

fn check_value(property: &str, value_type: &ValueType, value: Value) -> Result<Value> {
    if let ValueType::Custom { base, .. } = value_type {
        return match base {
            Some(base) => check_value(property, base, value),
            None => Ok(value),
        };
    }
    if let (ValueType::Float, Value::Integer(v)) = (value_type, &value) {
        return Ok(Value::Float(*v as f64));
    }
    let ok = match (value_type, &value) {
        (_, Value::Null) => true,
        (ValueType::Float, Value::Float(_)) => true,
        (ValueType::Integer, Value::Integer(_)) => true,
        (ValueType::Boolean, Value::Bool(_)) => true,
        (ValueType::Text, Value::Text(_)) => true,
        (ValueType::Timestamp, Value::Timestamp(_)) => true,
        (ValueType::List | ValueType::Tuple | ValueType::Set, Value::Json(json)) => json.is_array(),
        (ValueType::Map, Value::Json(json)) => json.is_object(),
        (ValueType::Type, Value::Type(_)) => true,
        (ValueType::Entity(target), Value::Entity(entity)) => entity.entity_type().is_a(target),
        (ValueType::Sequence(inner), Value::Entities(members)) => match inner.as_ref() {
            ValueType::Entity(target) => members.iter().all(|m| m.entity_type().is_a(target)),
            _ => false,
        },
        (ValueType::Sequence(inner), Value::Json(json)) => {
            inner.entity_target().is_none() && json.is_array()
        }
        _ => false,
    };
    if ok {
        Ok(value)
    } else {
        Err(Error::TypeMismatch {
            property: property.to_string(),
            expected: value_type.to_string(),
            found: value.kind_name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_registry;
    use serde_json::json;

    #[test]
    fn test_check_values() {
        assert_eq!(check_value("foo", &ValueType::Float, Value::Integer(2)).unwrap(), Value::Float(2.0));
        assert!(check_value("foo", &ValueType::Float, Value::Text("x".into())).is_err());
        assert!(check_value("tags", &ValueType::List, Value::Json(json!([1, 2]))).is_ok());
        assert!(check_value("tags", &ValueType::Map, Value::Json(json!([1, 2]))).is_err());
        assert!(check_value("n", &ValueType::Integer, Value::Null).is_ok());

        let cents = ValueType::custom_with_base("Cents", ValueType::Integer);
        assert!(check_value("price", &cents, Value::Integer(5)).is_ok());
        assert!(check_value("price", &cents, Value::Bool(true)).is_err());
    }

    #[test]
    fn test_bind_unsupported_type_fails_fast() {
        let registry = default_registry();
        let err = Property::new("id_card", ValueType::custom("Uuid"))
            .db_field()
            .bind("Person", &registry, None)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));

        // Without a storage binding nothing is resolved
        let bound = Property::new("scratch", ValueType::custom("Uuid"))
            .bind("Person", &registry, None)
            .unwrap();
        assert!(!bound.is_stored());
    }

    #[test]
    fn test_bind_merges_options() {
        let registry = default_registry();
        let bound = Property::new("code", ValueType::Text)
            .db_field_with(FieldOptions::new().max_length(12).nullable(true))
            .bind("Person", &registry, None)
            .unwrap();
        let descriptor = bound.descriptor().unwrap();
        assert_eq!(descriptor.max_length, Some(12));
        assert!(descriptor.nullable);
        assert!(!bound.has_explicit_default());
        assert_eq!(bound.declaring_type(), "Person");
    }
}
