//! Catalog of the entity types declared on one database

use std::sync::{Arc, RwLock};
use crate::{Error, Result};
use super::EntityType;

/// Registered entity types, in declaration order
#[derive(Debug, Default)]
pub struct TypeCatalog {
    types: RwLock<Vec<Arc<EntityType>>>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<Arc<EntityType>> {
        self.types
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Add a type; names must be unique within the catalog
    pub fn register(&self, ty: Arc<EntityType>) -> Result<()> {
        let mut types = self.types.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if types.iter().any(|t| t.name() == ty.name()) {
            return Err(Error::Schema(format!("Entity type {} is already declared", ty.name())));
        }
        types.push(ty);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Look up a type by its short name
    pub fn find(&self, name: &str) -> Option<Arc<EntityType>> {
        self.snapshot().into_iter().find(|t| t.name() == name)
    }

    /// Resolve a stored `module::Name` back to a type
    pub fn resolve(&self, qualified: &str) -> Result<Arc<EntityType>> {
        self.snapshot()
            .into_iter()
            .find(|t| t.qualified_name() == qualified)
            .ok_or_else(|| Error::UnresolvedType(qualified.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<EntityType>> {
        self.snapshot()
    }
}
