//! Identity map - one live instance per stored row
//!
//! Each entity type owns a map from primary key to a weak handle. Subtype
//! maps are registered as children of their parent's map, so a lookup on a
//! base type also finds instances living in any subtype map:
//!
//! ```text
//! TestClass  {1, 4}
//!   └── Subclass {2}
//!         └── Leaf {3}
//! ```
//!
//! Entries never keep an instance alive. When the last strong handle of an
//! instance is dropped, the entity's `Drop` removes its entry again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use super::{Entity, EntityInner};

#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: Mutex<HashMap<i64, Weak<EntityInner>>>,
    children: Mutex<Vec<Arc<IdentityMap>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain a subtype's map below this one
    pub fn add_child(&self, child: Arc<IdentityMap>) {
        locked(&self.children).push(child);
    }

    /// Whether any subtype map is chained below this one
    pub fn has_children(&self) -> bool {
        !locked(&self.children).is_empty()
    }

    /// Live instance for a key, searching this map then every descendant
    pub fn lookup(&self, pk: i64) -> Option<Entity> {
        let own = locked(&self.entries).get(&pk).and_then(Weak::upgrade);
        if let Some(inner) = own {
            return Some(Entity::from_inner(inner));
        }
        let children = locked(&self.children).clone();
        children.iter().find_map(|child| child.lookup(pk))
    }

    /// Register an instance under its key unless a live one is already there
    ///
    /// Returns the instance that ends up in the map.
    pub fn register(&self, pk: i64, entity: &Entity) -> Entity {
        let existing = {
            let mut entries = locked(&self.entries);
            match entries.get(&pk).and_then(Weak::upgrade) {
                Some(live) => Some(live),
                None => {
                    entries.insert(pk, entity.downgrade());
                    None
                }
            }
        };
        existing.map(Entity::from_inner).unwrap_or_else(|| entity.clone())
    }

    /// Drop the entry for a key if it points at `entity`
    pub fn forget(&self, pk: i64, entity: &Entity) {
        let mut entries = locked(&self.entries);
        if entries.get(&pk).is_some_and(|weak| entity.is_handle_of(weak)) {
            entries.remove(&pk);
        }
    }

    /// Drop the entry for a key if its instance is gone
    pub fn remove_dead(&self, pk: i64) {
        let mut entries = locked(&self.entries);
        if entries.get(&pk).is_some_and(|weak| weak.strong_count() == 0) {
            entries.remove(&pk);
        }
    }

    /// Number of entries in this map only
    pub fn len(&self) -> usize {
        locked(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
