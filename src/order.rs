//! Reference-order resolution for batched saves
//!
//! Orders entity types so that referenced types are written before the
//! types that refer to them. Each round picks the remaining type with the
//! fewest references into the remaining set; ties keep input order.

use std::sync::Arc;
use crate::entity::EntityType;

/// Sort entity types so that referenced types come first
///
/// Duplicates are dropped, keeping the first occurrence. Reference cycles
/// do not stall the sort: a type in a cycle is placed once its count is the
/// lowest left.
pub fn sort_reference_order(types: &[Arc<EntityType>]) -> Vec<Arc<EntityType>> {
    let mut unique: Vec<Arc<EntityType>> = Vec::with_capacity(types.len());
    for ty in types {
        if !unique.iter().any(|t| t == ty) {
            unique.push(ty.clone());
        }
    }

    // refers[i][j]: type i refers to type j
    let refers: Vec<Vec<bool>> = unique
        .iter()
        .enumerate()
        .map(|(i, a)| {
            unique
                .iter()
                .enumerate()
                .map(|(j, b)| i != j && a.refers_to(b))
                .collect()
        })
        .collect();

    let mut remaining: Vec<usize> = (0..unique.len()).collect();
    let mut order = Vec::with_capacity(unique.len());
    while !remaining.is_empty() {
        let mut best = 0;
        let mut best_count = usize::MAX;
        for (pos, &i) in remaining.iter().enumerate() {
            let count = remaining.iter().filter(|&&j| refers[i][j]).count();
            if count < best_count {
                best = pos;
                best_count = count;
            }
        }
        let picked = remaining.remove(best);
        order.push(unique[picked].clone());
    }
    order
}
