//! Single-entity references stored as a foreign key column

use crate::descriptor::{FieldBinding, FieldDescriptor, FieldTarget};
use crate::entity::Entity;
use crate::naming::pascal_to_snake;
use crate::value::{Cell, Value};
use crate::{Error, Result};
use super::{mismatch, FieldProxy};

/// Default reverse accessor: `{declaring}_{attr}_{target}_set`, snake-cased
pub fn default_related_name(declaring_type: &str, property: &str, target_type: &str) -> String {
    format!(
        "{}_{}_{}_set",
        pascal_to_snake(declaring_type),
        property,
        pascal_to_snake(target_type)
    )
}

/// Descriptor for a relationship field, filling in the default related name
pub(crate) fn relationship_descriptor(binding: &FieldBinding) -> FieldDescriptor {
    let mut descriptor = binding.resolve_descriptor();
    if descriptor.related_name.is_none() {
        if let Some(target) = &binding.target {
            descriptor.related_name = Some(default_related_name(
                &binding.declaring_type,
                &binding.property,
                &target.type_name,
            ));
        }
    }
    descriptor
}

/// Load the entity a stored key points at, through the identity map
pub(crate) fn load_target(entity: &Entity, target: &FieldTarget, pk: i64) -> Result<Entity> {
    let db = entity.db();
    let ty = db.entity_type(&target.type_name)?;
    db.get(&ty, pk)?.ok_or(Error::StaleReference {
        entity: target.type_name.clone(),
        pk,
    })
}

/// Foreign key to another entity's row
#[derive(Debug, Clone)]
pub struct ReferenceProxy {
    descriptor: FieldDescriptor,
    target: FieldTarget,
}

impl ReferenceProxy {
    pub fn new(binding: &FieldBinding) -> Self {
        let descriptor = relationship_descriptor(binding);
        let target = binding.target.clone().unwrap_or_else(|| FieldTarget {
            type_name: binding.value_type.entity_target().unwrap_or_default().to_string(),
            table: String::new(),
        });
        Self { descriptor, target }
    }

    fn column(&self) -> String {
        self.descriptor.column_name()
    }
}

impl FieldProxy for ReferenceProxy {
    fn field_descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    fn get(&self, entity: &Entity) -> Result<Value> {
        if let Some(value) = entity.cached(&self.descriptor.name) {
            return Ok(value);
        }
        match entity.read_cell(&self.column())? {
            Cell::Integer(pk) => {
                let member = load_target(entity, &self.target, pk)?;
                entity.cache_value(&self.descriptor.name, Value::Entity(member.clone()));
                Ok(Value::Entity(member))
            }
            _ => Ok(Value::Null),
        }
    }

    fn set(&self, entity: &Entity, value: &Value) -> Result<()> {
        let cell = self.to_cell(value)?;
        entity.cache_value(&self.descriptor.name, value.clone());
        entity.write_cell(&self.column(), cell)
    }

    fn to_cell(&self, value: &Value) -> Result<Cell> {
        match value {
            Value::Null => Ok(Cell::Null),
            Value::Entity(member) => Ok(member.pk().map(Cell::Integer).unwrap_or(Cell::Null)),
            other => Err(mismatch(&self.descriptor, other)),
        }
    }

    /// Save a referenced entity that has no key yet, then point the column at it
    fn on_pre_save(&self, entity: &Entity) -> Result<()> {
        if let Some(Value::Entity(member)) = entity.cached(&self.descriptor.name) {
            if member.pk().is_none() {
                member.save()?;
            }
            entity.write_cell(&self.column(), member.pk().map(Cell::Integer).unwrap_or(Cell::Null))?;
        }
        Ok(())
    }

    fn references(&self) -> Option<&str> {
        Some(&self.target.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_related_name() {
        assert_eq!(
            default_related_name("ManyToManyTest", "related", "TestClass"),
            "many_to_many_test_related_test_class_set"
        );
    }
}
