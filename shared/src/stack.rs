//! Stack resolution
//!
//! Picking up an object also picks up everything lying on top of it. The
//! graph records, for each draw-order slot, the later slots whose object has
//! the same owner and overlaps it. Resolving walks that graph from a root.

use crate::ids::{ClientId, ObjectId};
use crate::object::{Bounds, Object};
use std::collections::HashMap;

/// Outcome of resolving the stack above an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stack {
    /// Every object resting on the root, root excluded, back to front
    Above(Vec<ObjectId>),
    /// Another client holds part of the stack; the selection must be aborted
    Blocked,
}

#[derive(Debug, Clone, Default)]
pub struct StackGraph {
    order: Vec<ObjectId>,
    slots: HashMap<ObjectId, usize>,
    above: Vec<Vec<usize>>,
}

impl StackGraph {
    /// Builds the graph for `order` (back to front). Ids missing from
    /// `objects` get no edges.
    pub fn build(order: &[ObjectId], objects: &HashMap<ObjectId, Object>) -> Self {
        let placed: Vec<Option<(Option<ClientId>, Bounds)>> = order
            .iter()
            .map(|id| objects.get(id).map(|o| (o.owned_by(), o.bounds())))
            .collect();
        let mut above = vec![Vec::new(); order.len()];

        for (i, lower) in placed.iter().enumerate() {
            let Some((lower_owner, lower)) = lower else { continue };
            for (j, upper) in placed.iter().enumerate().skip(i + 1) {
                let Some((upper_owner, upper)) = upper else { continue };
                if upper_owner == lower_owner && lower.overlaps(upper) {
                    above[i].push(j);
                }
            }
        }

        let slots = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Self {
            order: order.to_vec(),
            slots,
            above,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Objects directly on top of `id`, back to front
    pub fn above(&self, id: ObjectId) -> Vec<ObjectId> {
        self.slots
            .get(&id)
            .map(|&slot| self.above[slot].iter().map(|&j| self.order[j]).collect())
            .unwrap_or_default()
    }

    /// Collects everything `mover` would pick up along with `root`
    ///
    /// Objects already selected by `mover` do not block, so re-selecting a
    /// stack yields the same answer.
    pub fn resolve(
        &self,
        root: ObjectId,
        mover: ClientId,
        objects: &HashMap<ObjectId, Object>,
    ) -> Stack {
        let (Some(&root_slot), Some(root_object)) = (self.slots.get(&root), objects.get(&root))
        else {
            return Stack::Blocked;
        };
        let held_by_other = |object: &Object| {
            object.selected_by().map_or(false, |client| client != mover)
        };
        if root_object.owned_by().map_or(false, |owner| owner != mover) || held_by_other(root_object) {
            return Stack::Blocked;
        }

        let mut visited = vec![false; self.order.len()];
        visited[root_slot] = true;
        let mut pending = vec![root_slot];

        while let Some(slot) = pending.pop() {
            let Some(current) = objects.get(&self.order[slot]) else {
                continue;
            };
            for &next in &self.above[slot] {
                if visited[next] {
                    continue;
                }
                let Some(neighbour) = objects.get(&self.order[next]) else {
                    continue;
                };
                if neighbour.owned_by() != current.owned_by() {
                    continue;
                }
                if held_by_other(neighbour) {
                    return Stack::Blocked;
                }
                visited[next] = true;
                pending.push(next);
            }
        }

        let ids = visited
            .iter()
            .enumerate()
            .filter(|&(slot, &seen)| seen && slot != root_slot)
            .map(|(slot, _)| self.order[slot])
            .collect();
        Stack::Above(ids)
    }
}
