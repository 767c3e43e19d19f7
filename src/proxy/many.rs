//! Many-entity references stored in a join table

use std::collections::BTreeSet;
use tracing::debug;
use crate::descriptor::{FieldBinding, FieldDescriptor, FieldTarget};
use crate::entity::Entity;
use crate::storage::JoinTable;
use crate::value::{Cell, Value};
use crate::{Error, Result};
use super::reference::{load_target, relationship_descriptor};
use super::FieldProxy;

/// Ordered membership of a `sequence<entity<T>>` property
///
/// Nothing is written by `set`; join rows are reconciled after the owner's
/// row has been saved and has a key.
#[derive(Debug, Clone)]
pub struct ManyToManyProxy {
    descriptor: FieldDescriptor,
    target: FieldTarget,
}

impl ManyToManyProxy {
    pub fn new(binding: &FieldBinding) -> Self {
        let descriptor = relationship_descriptor(binding);
        let target = binding.target.clone().unwrap_or_else(|| FieldTarget {
            type_name: binding.value_type.many_target().unwrap_or_default().to_string(),
            table: String::new(),
        });
        Self { descriptor, target }
    }

    fn join_table(&self, entity: &Entity) -> Result<JoinTable> {
        entity
            .entity_type()
            .schema()
            .join(&self.descriptor.name)
            .cloned()
            .ok_or_else(|| Error::Schema(format!(
                "{} has no join table for {}",
                entity.entity_type().name(),
                self.descriptor.name
            )))
    }
}

impl FieldProxy for ManyToManyProxy {
    fn field_descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    fn get(&self, entity: &Entity) -> Result<Value> {
        if let Some(value) = entity.cached(&self.descriptor.name) {
            return Ok(value);
        }
        let Some(owner) = entity.pk() else {
            return Ok(Value::Entities(Vec::new()));
        };
        let join = self.join_table(entity)?;
        let members = entity
            .db()
            .store()
            .join_members(&join, owner)?
            .into_iter()
            .map(|pk| load_target(entity, &self.target, pk))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Entities(members))
    }

    fn set(&self, _entity: &Entity, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn to_cell(&self, _value: &Value) -> Result<Cell> {
        Err(Error::Schema(format!(
            "many-relationship {} cannot be used as a lookup criterion",
            self.descriptor.name
        )))
    }

    /// Rewrite join rows when the membership differs from what is stored
    fn on_post_save(&self, entity: &Entity) -> Result<()> {
        let Some(owner) = entity.pk() else {
            return Ok(());
        };
        let members = match entity.get(&self.descriptor.name)? {
            Value::Entities(members) => members,
            _ => Vec::new(),
        };
        let join = self.join_table(entity)?;
        let store = entity.db().store();

        let stored: BTreeSet<i64> = store.join_members(&join, owner)?.into_iter().collect();
        let current: BTreeSet<Option<i64>> = members.iter().map(Entity::pk).collect();
        if current.iter().all(Option::is_some) && current.iter().flatten().copied().collect::<BTreeSet<_>>() == stored {
            return Ok(());
        }

        store.join_clear(&join, owner)?;
        for member in &members {
            if member.pk().is_none() {
                member.save()?;
            }
            if let Some(pk) = member.pk() {
                store.join_add(&join, owner, pk)?;
            }
        }
        debug!(
            "Reconciled {}.{} for #{}: {} members",
            entity.entity_type().name(),
            self.descriptor.name,
            owner,
            members.len()
        );
        Ok(())
    }

    fn references(&self) -> Option<&str> {
        Some(&self.target.type_name)
    }

    fn is_many(&self) -> bool {
        true
    }
}
