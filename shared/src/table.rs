//! The table: every object plus the back-to-front draw order
//!
//! The id map and the draw order always hold the same set of ids. Operations
//! that change the draw order or ownership rebuild the stack graph before
//! returning; callers that change poses through [`Table::get_mut`] call
//! [`Table::restack`] themselves once they are done.

use crate::class::{ClassInfo, ClassRef};
use crate::ids::{ClientId, IdPool, ObjectId, OBJECT_CAPACITY};
use crate::object::{Object, Vec2};
use crate::stack::{Stack, StackGraph};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug)]
pub struct Table {
    objects: HashMap<ObjectId, Object>,
    draw_order: Vec<ObjectId>,
    ids: IdPool<ObjectId>,
    graph: StackGraph,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            draw_order: Vec::new(),
            ids: IdPool::new(OBJECT_CAPACITY),
            graph: StackGraph::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    /// Mutable access to one object
    ///
    /// The stack graph is not rebuilt afterwards. Call [`Table::restack`]
    /// once every pose, owner or size change of the batch is done.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    /// Ids back to front
    pub fn draw_order(&self) -> &[ObjectId] {
        &self.draw_order
    }

    /// Objects back to front
    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.draw_order.iter().filter_map(|id| self.objects.get(id))
    }

    /// Creates an object under the first free id and puts it on top.
    /// Returns None once every id is taken.
    pub fn spawn(
        &mut self,
        class: ClassRef,
        variant: u8,
        info: Arc<ClassInfo>,
        location: Vec2,
    ) -> Option<ObjectId> {
        self.spawn_batch([(class, variant, info, location)], |_| {})
            .first()
            .copied()
    }

    /// Creates a whole batch with one restack at the end
    ///
    /// Each new object goes on top in batch order and is passed to `settle`
    /// before the restack. Creation stops at the first exhausted id; the ids
    /// created so far are returned.
    pub fn spawn_batch<I, F>(&mut self, batch: I, mut settle: F) -> Vec<ObjectId>
    where
        I: IntoIterator<Item = (ClassRef, u8, Arc<ClassInfo>, Vec2)>,
        F: FnMut(&mut Object),
    {
        let mut created = Vec::new();
        for (class, variant, info, location) in batch {
            let Some(id) = self.ids.allocate() else { break };
            let mut object = Object::new(id, class, variant, info, location);
            settle(&mut object);
            self.objects.insert(id, object);
            self.draw_order.push(id);
            created.push(id);
        }
        if !created.is_empty() {
            self.restack();
        }
        created
    }

    /// Places an object under its own id. A known id is replaced where it
    /// stands in the draw order; a new one goes on top.
    pub fn insert(&mut self, object: Object) {
        let id = object.id();
        if self.objects.insert(id, object).is_none() {
            self.ids.reserve(id);
            self.draw_order.push(id);
        }
        self.restack();
    }

    /// Inserts many objects with a single restack at the end
    pub fn extend(&mut self, objects: impl IntoIterator<Item = Object>) {
        for object in objects {
            let id = object.id();
            if self.objects.insert(id, object).is_none() {
                self.ids.reserve(id);
                self.draw_order.push(id);
            }
        }
        self.restack();
    }

    /// Takes an object off the table and frees its id for reuse
    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let object = self.objects.remove(&id)?;
        self.draw_order.retain(|other| *other != id);
        self.ids.release(id);
        self.restack();
        Some(object)
    }

    /// Drops every object and frees every id
    pub fn clear(&mut self) {
        self.objects.clear();
        self.draw_order.clear();
        self.ids.clear();
        self.graph = StackGraph::default();
    }

    /// Moves `ids` to the top, keeping their relative order
    pub fn raise(&mut self, ids: &[ObjectId]) {
        let raised: HashSet<ObjectId> = ids
            .iter()
            .copied()
            .filter(|id| self.objects.contains_key(id))
            .collect();
        if raised.is_empty() {
            return;
        }
        let (top, mut rest): (Vec<_>, Vec<_>) =
            self.draw_order.iter().copied().partition(|id| raised.contains(id));
        rest.extend(top);
        self.draw_order = rest;
        self.restack();
    }

    /// Replaces the draw order. Refused unless `order` is a permutation of
    /// the current ids.
    pub fn set_draw_order(&mut self, order: Vec<ObjectId>) -> bool {
        if order.len() != self.objects.len() {
            return false;
        }
        let mut seen = HashSet::with_capacity(order.len());
        if !order
            .iter()
            .all(|id| self.objects.contains_key(id) && seen.insert(*id))
        {
            return false;
        }
        self.draw_order = order;
        self.restack();
        true
    }

    /// Clears every selection and ownership held by `client`
    ///
    /// Returns the touched ids in draw order.
    pub fn release_client(&mut self, client: ClientId) -> Vec<ObjectId> {
        let mut touched = Vec::new();
        for id in &self.draw_order {
            if let Some(object) = self.objects.get_mut(id) {
                let mut changed = false;
                if object.selected_by() == Some(client) {
                    object.select(None);
                    changed = true;
                }
                if object.owned_by() == Some(client) {
                    object.own(None);
                    changed = true;
                }
                if changed {
                    touched.push(*id);
                }
            }
        }
        if !touched.is_empty() {
            self.restack();
        }
        touched
    }

    /// Ids selected by `client`, back to front
    pub fn selected_by(&self, client: ClientId) -> Vec<ObjectId> {
        self.iter()
            .filter(|object| object.selected_by() == Some(client))
            .map(Object::id)
            .collect()
    }

    /// The frontmost object whose bounds contain `point`
    pub fn topmost_at(&self, point: Vec2) -> Option<ObjectId> {
        self.draw_order
            .iter()
            .rev()
            .find(|id| {
                self.objects
                    .get(id)
                    .map_or(false, |object| object.hit_test(point))
            })
            .copied()
    }

    /// Points every instance of `class` at freshly loaded metadata
    ///
    /// Returns the ids that were updated.
    pub fn refresh_class(&mut self, class: &ClassRef, info: Arc<ClassInfo>) -> Vec<ObjectId> {
        let mut updated = Vec::new();
        for id in &self.draw_order {
            if let Some(object) = self.objects.get_mut(id) {
                if object.class() == class {
                    object.set_info(info.clone());
                    updated.push(*id);
                }
            }
        }
        if !updated.is_empty() {
            self.restack();
        }
        updated
    }

    /// Rebuilds the stack graph from the current draw order. Quadratic in
    /// the number of objects.
    pub fn restack(&mut self) {
        self.graph = StackGraph::build(&self.draw_order, &self.objects);
    }

    /// Objects directly on top of `id`
    pub fn above(&self, id: ObjectId) -> Vec<ObjectId> {
        self.graph.above(id)
    }

    /// What `mover` would pick up along with `root`, see [`StackGraph::resolve`]
    pub fn resolve_stack(&self, root: ObjectId, mover: ClientId) -> Stack {
        self.graph.resolve(root, mover, &self.objects)
    }
}
