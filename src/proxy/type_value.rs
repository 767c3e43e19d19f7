//! Type-values stored as fully-qualified type names

use crate::descriptor::{FieldBinding, FieldDescriptor};
use crate::entity::Entity;
use crate::value::{Cell, Value};
use crate::Result;
use super::{mismatch, FieldProxy};

/// Stores an entity type as `module::Name` and resolves it back on load
#[derive(Debug, Clone)]
pub struct TypeProxy {
    descriptor: FieldDescriptor,
}

impl TypeProxy {
    pub fn new(binding: &FieldBinding) -> Self {
        Self {
            descriptor: binding.resolve_descriptor(),
        }
    }
}

impl FieldProxy for TypeProxy {
    fn field_descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    fn get(&self, entity: &Entity) -> Result<Value> {
        match entity.read_cell(&self.descriptor.name)? {
            Cell::Text(name) => Ok(Value::Type(entity.db().resolve_type(&name)?)),
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
            Value::Type(ty) => Ok(Cell::Text(ty.qualified_name().to_string())),
            other => Err(mismatch(&self.descriptor, other)),
        }
    }
}
