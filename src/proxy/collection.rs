//! Opaque structured values stored as serialized JSON

use crate::descriptor::{FieldBinding, FieldDescriptor};
use crate::entity::Entity;
use crate::value::{Cell, Value};
use crate::Result;
use super::{mismatch, FieldProxy};

/// Lists, tuples, sets and maps
#[derive(Debug, Clone)]
pub struct CollectionProxy {
    descriptor: FieldDescriptor,
}

impl CollectionProxy {
    pub fn new(binding: &FieldBinding) -> Self {
        Self {
            descriptor: binding.resolve_descriptor(),
        }
    }
}

impl FieldProxy for CollectionProxy {
    fn field_descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    fn get(&self, entity: &Entity) -> Result<Value> {
        match entity.read_cell(&self.descriptor.name)? {
            Cell::Text(json) => Ok(Value::Json(serde_json::from_str(&json)?)),
            _ => Ok(Value::Null),
        }
    }

    fn set(&self, entity: &Entity, value: &Value) -> Result<()> {
        let cell = self.to_cell(value)?;
        entity.write_cell(&self.descriptor.name, cell)
    }

    fn to_cell(&self, value: &Value) -> Result<Cell> {
        match value {
            Value::Null => Ok(Cell::Null),
            Value::Json(json) => Ok(Cell::Text(serde_json::to_string(json)?)),
            other => Err(mismatch(&self.descriptor, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ColumnType, FieldOptions};
    use crate::value::ValueType;
    use serde_json::json;

    #[test]
    fn test_json_cells() {
        let proxy = CollectionProxy::new(&FieldBinding {
            property: "tags".into(),
            declaring_type: "Thing".into(),
            value_type: ValueType::List,
            column: ColumnType::Json,
            options: FieldOptions::new(),
            defaults: FieldOptions::new(),
            target: None,
        });

        let cell = proxy.to_cell(&Value::Json(json!(["a", 1, {"b": null}]))).unwrap();
        assert_eq!(cell, Cell::Text(r#"["a",1,{"b":null}]"#.into()));
        assert!(proxy.to_cell(&Value::Float(1.0)).is_err());
    }
}
