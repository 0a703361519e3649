//! Transform manager (spec §4.6): a hierarchy of local/world matrices kept
//! as SoA columns, linked by `parent`/`first_child`/`next`/`prev` integer
//! indices rather than pointers — reparenting is bit-patching, no
//! allocation.
//!
//! Grounded in the teacher's own scene-graph transform manager (a SoA with
//! the same four link columns, since deleted from this tree once its shape
//! had been absorbed here — see `DESIGN.md`).

use glam::{Mat4, Vec3};
use rustc_hash::FxHashMap;

use crate::entity::Entity;

const NONE: u32 = 0;

/// A dense index into `TransformManager`'s SoA. `NONE` (zero) means "no
/// transform" and is never returned by `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformInstance(u32);

impl TransformInstance {
    pub const NONE: TransformInstance = TransformInstance(NONE);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == NONE
    }
}

fn two_sum(a: Vec3, b: Vec3) -> (Vec3, Vec3) {
    let sum = a + b;
    let bb = sum - a;
    let err = (a - (sum - bb)) + (b - bb);
    (sum, err)
}

pub struct TransformManager {
    entity_to_instance: FxHashMap<Entity, u32>,
    entities: Vec<Entity>,
    local: Vec<Mat4>,
    world: Vec<Mat4>,
    /// Compensated-summation translation residual (spec §3: "accurate
    /// mode"). Rotation doesn't need a lo term, only translation.
    local_lo: Vec<Vec3>,
    world_lo: Vec<Vec3>,
    parent: Vec<u32>,
    first_child: Vec<u32>,
    next: Vec<u32>,
    prev: Vec<u32>,
    transaction_depth: u32,
    dirty: std::collections::HashSet<u32>,
}

impl Default for TransformManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformManager {
    #[must_use]
    pub fn new() -> Self {
        let mut manager = TransformManager {
            entity_to_instance: FxHashMap::default(),
            entities: Vec::new(),
            local: Vec::new(),
            world: Vec::new(),
            local_lo: Vec::new(),
            world_lo: Vec::new(),
            parent: Vec::new(),
            first_child: Vec::new(),
            next: Vec::new(),
            prev: Vec::new(),
            transaction_depth: 0,
            dirty: std::collections::HashSet::new(),
        };
        // Index 0 is the NONE sentinel; real instances start at 1.
        manager.push_slot(Entity::NULL);
        manager
    }

    fn push_slot(&mut self, entity: Entity) -> u32 {
        let index = self.local.len() as u32;
        self.entities.push(entity);
        self.local.push(Mat4::IDENTITY);
        self.world.push(Mat4::IDENTITY);
        self.local_lo.push(Vec3::ZERO);
        self.world_lo.push(Vec3::ZERO);
        self.parent.push(NONE);
        self.first_child.push(NONE);
        self.next.push(NONE);
        self.prev.push(NONE);
        index
    }

    #[must_use]
    pub fn instance_for(&self, entity: Entity) -> Option<TransformInstance> {
        self.entity_to_instance.get(&entity).copied().map(TransformInstance)
    }

    /// Appends a new transform for `entity`, linked as a child of `parent`
    /// (or a root if `parent` is `TransformInstance::NONE`).
    pub fn create(&mut self, entity: Entity, parent: TransformInstance) -> TransformInstance {
        let index = self.push_slot(entity);
        self.entity_to_instance.insert(entity, index);
        self.link(index, parent.0);
        self.recompute_subtree(index);
        TransformInstance(index)
    }

    fn unlink(&mut self, instance: u32) {
        let parent = self.parent[instance as usize];
        let prev = self.prev[instance as usize];
        let next = self.next[instance as usize];
        if prev != NONE {
            self.next[prev as usize] = next;
        } else if parent != NONE {
            self.first_child[parent as usize] = next;
        }
        if next != NONE {
            self.prev[next as usize] = prev;
        }
        self.prev[instance as usize] = NONE;
        self.next[instance as usize] = NONE;
    }

    fn link(&mut self, instance: u32, parent: u32) {
        self.parent[instance as usize] = parent;
        if parent == NONE {
            self.next[instance as usize] = NONE;
            self.prev[instance as usize] = NONE;
            return;
        }
        let old_head = self.first_child[parent as usize];
        self.next[instance as usize] = old_head;
        self.prev[instance as usize] = NONE;
        if old_head != NONE {
            self.prev[old_head as usize] = instance;
        }
        self.first_child[parent as usize] = instance;
    }

    fn reparent(&mut self, instance: u32, new_parent: u32) {
        self.unlink(instance);
        self.link(instance, new_parent);
    }

    pub fn set_parent(&mut self, instance: TransformInstance, new_parent: TransformInstance) {
        self.reparent(instance.0, new_parent.0);
        self.recompute_subtree(instance.0);
    }

    #[must_use]
    pub fn parent(&self, instance: TransformInstance) -> TransformInstance {
        TransformInstance(self.parent[instance.0 as usize])
    }

    #[must_use]
    pub fn local_transform(&self, instance: TransformInstance) -> Mat4 {
        self.local[instance.0 as usize]
    }

    #[must_use]
    pub fn world_transform(&self, instance: TransformInstance) -> Mat4 {
        self.world[instance.0 as usize]
    }

    /// Sets the local transform. If a transaction is open, only marks the
    /// instance dirty; world recomputation happens at `commit_transaction`.
    pub fn set_local_transform(&mut self, instance: TransformInstance, local: Mat4) {
        self.local[instance.0 as usize] = local;
        if self.transaction_depth > 0 {
            self.dirty.insert(instance.0);
        } else {
            self.recompute_subtree(instance.0);
        }
    }

    /// Sets the accurate-mode translation residual for this instance (see
    /// `local_lo`'s doc). Same deferral rule as `set_local_transform`.
    pub fn set_local_translation_lo(&mut self, instance: TransformInstance, lo: Vec3) {
        self.local_lo[instance.0 as usize] = lo;
        if self.transaction_depth > 0 {
            self.dirty.insert(instance.0);
        } else {
            self.recompute_subtree(instance.0);
        }
    }

    /// Defers `set_local_transform` world recomputation until the matching
    /// `commit_transaction`. Nestable.
    pub fn open_transaction(&mut self) {
        self.transaction_depth += 1;
    }

    /// Recomputes the world transform of every subtree touched since the
    /// matching `open_transaction`, each exactly once.
    pub fn commit_transaction(&mut self) {
        debug_assert!(self.transaction_depth > 0, "commit without a matching open_transaction");
        self.transaction_depth -= 1;
        if self.transaction_depth != 0 || self.dirty.is_empty() {
            return;
        }
        let roots: Vec<u32> = self
            .dirty
            .iter()
            .copied()
            .filter(|&i| !self.has_dirty_ancestor(i))
            .collect();
        for root in roots {
            self.recompute_subtree(root);
        }
        self.dirty.clear();
    }

    fn has_dirty_ancestor(&self, instance: u32) -> bool {
        let mut p = self.parent[instance as usize];
        while p != NONE {
            if self.dirty.contains(&p) {
                return true;
            }
            p = self.parent[p as usize];
        }
        false
    }

    fn recompute_subtree(&mut self, instance: u32) {
        let parent = self.parent[instance as usize];
        let (parent_world, parent_world_lo) = if parent == NONE {
            (Mat4::IDENTITY, Vec3::ZERO)
        } else {
            (self.world[parent as usize], self.world_lo[parent as usize])
        };
        self.recompute_from(instance, parent_world, parent_world_lo);
    }

    fn recompute_from(&mut self, instance: u32, parent_world: Mat4, parent_world_lo: Vec3) {
        let local = self.local[instance as usize];
        let world = parent_world * local;
        self.world[instance as usize] = world;

        let local_lo = self.local_lo[instance as usize];
        let (world_lo, _residual) = two_sum(parent_world_lo, local_lo);
        self.world_lo[instance as usize] = world_lo;

        let mut child = self.first_child[instance as usize];
        while child != NONE {
            let next = self.next[child as usize];
            self.recompute_from(child, world, world_lo);
            child = next;
        }
    }

    /// Destroys `entity`'s transform, if it has one. Its children are
    /// reparented to its own parent so the hierarchy doesn't silently
    /// disconnect underneath still-alive descendants.
    pub fn destroy(&mut self, entity: Entity) {
        let Some(&instance) = self.entity_to_instance.get(&entity) else {
            return;
        };
        self.entity_to_instance.remove(&entity);

        let parent = self.parent[instance as usize];
        self.unlink(instance);

        let mut child = self.first_child[instance as usize];
        while child != NONE {
            let next_sibling = self.next[child as usize];
            self.reparent(child, parent);
            child = next_sibling;
        }
        if parent != NONE {
            self.recompute_subtree(parent);
        }

        self.remove_slot(instance);
    }

    /// Destroys the transform of every entity in `dead_entities` (spec
    /// §4.8's once-per-frame entity-component GC).
    pub fn gc(&mut self, dead_entities: &[Entity]) {
        for &entity in dead_entities {
            self.destroy(entity);
        }
    }

    fn remove_slot(&mut self, instance: u32) {
        let last = (self.local.len() - 1) as u32;
        if instance != last {
            self.entities.swap(instance as usize, last as usize);
            self.local.swap(instance as usize, last as usize);
            self.world.swap(instance as usize, last as usize);
            self.local_lo.swap(instance as usize, last as usize);
            self.world_lo.swap(instance as usize, last as usize);
            self.parent.swap(instance as usize, last as usize);
            self.first_child.swap(instance as usize, last as usize);
            self.next.swap(instance as usize, last as usize);
            self.prev.swap(instance as usize, last as usize);

            let moved_entity = self.entities[instance as usize];
            self.entity_to_instance.insert(moved_entity, instance);
            self.retarget_index(last, instance);
        }
        self.entities.pop();
        self.local.pop();
        self.world.pop();
        self.local_lo.pop();
        self.world_lo.pop();
        self.parent.pop();
        self.first_child.pop();
        self.next.pop();
        self.prev.pop();
    }

    /// Fixes up every index that referred to the slot formerly at `old`,
    /// now living at `new`, after a `swap_remove`.
    fn retarget_index(&mut self, old: u32, new: u32) {
        let parent = self.parent[new as usize];
        if parent != NONE && self.first_child[parent as usize] == old {
            self.first_child[parent as usize] = new;
        }
        let prev = self.prev[new as usize];
        if prev != NONE {
            self.next[prev as usize] = new;
        }
        let next = self.next[new as usize];
        if next != NONE {
            self.prev[next as usize] = new;
        }
        let mut child = self.first_child[new as usize];
        while child != NONE {
            self.parent[child as usize] = new;
            child = self.next[child as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityManager;

    const EPSILON: f32 = 1e-5;

    fn approx_eq(a: Mat4, b: Mat4) -> bool {
        a.to_cols_array().iter().zip(b.to_cols_array()).all(|(x, y)| (x - y).abs() < EPSILON)
    }

    struct HierarchySetup {
        transforms: TransformManager,
        root: TransformInstance,
        child: TransformInstance,
        child_entity: Entity,
        grandchild: TransformInstance,
    }

    fn build_hierarchy() -> HierarchySetup {
        let mut entities = EntityManager::new();
        let mut transforms = TransformManager::new();
        let root_entity = entities.create();
        let child_entity = entities.create();
        let grandchild_entity = entities.create();

        let root = transforms.create(root_entity, TransformInstance::NONE);
        let child = transforms.create(child_entity, root);
        let grandchild = transforms.create(grandchild_entity, child);

        HierarchySetup {
            transforms,
            root,
            child,
            child_entity,
            grandchild,
        }
    }

    #[test]
    fn world_transform_composes_down_the_hierarchy() {
        let mut setup = build_hierarchy();
        setup
            .transforms
            .set_local_transform(setup.root, Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)));
        setup
            .transforms
            .set_local_transform(setup.child, Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)));

        let expected = Mat4::from_translation(Vec3::new(1.0, 2.0, 0.0));
        assert!(approx_eq(setup.transforms.world_transform(setup.child), expected));
    }

    #[test]
    fn reparenting_updates_the_child_list_and_world() {
        let mut setup = build_hierarchy();
        setup
            .transforms
            .set_local_transform(setup.root, Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)));

        setup.transforms.set_parent(setup.grandchild, setup.root);
        assert_eq!(setup.transforms.parent(setup.grandchild), setup.root);
        assert!(approx_eq(
            setup.transforms.world_transform(setup.grandchild),
            Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0))
        ));
    }

    #[test]
    fn transaction_defers_recompute_until_commit() {
        let mut setup = build_hierarchy();
        setup.transforms.open_transaction();
        setup
            .transforms
            .set_local_transform(setup.root, Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)));
        assert!(approx_eq(setup.transforms.world_transform(setup.root), Mat4::IDENTITY));

        setup.transforms.commit_transaction();
        assert!(approx_eq(
            setup.transforms.world_transform(setup.root),
            Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0))
        ));
    }

    #[test]
    fn destroy_reparents_children_to_the_grandparent() {
        let mut setup = build_hierarchy();

        setup.transforms.destroy(setup.child_entity);
        assert_eq!(setup.transforms.parent(setup.grandchild), setup.root);
        assert!(setup.transforms.instance_for(setup.child_entity).is_none());
    }

    #[test]
    fn gc_removes_transforms_for_dead_entities() {
        let mut entities = EntityManager::new();
        let mut transforms = TransformManager::new();
        let e1 = entities.create();
        let e2 = entities.create();
        transforms.create(e1, TransformInstance::NONE);
        transforms.create(e2, TransformInstance::NONE);

        entities.destroy(e1);
        let dead = entities.drain_destroyed();
        transforms.gc(&dead);

        assert!(transforms.instance_for(e1).is_none());
        assert!(transforms.instance_for(e2).is_some());
    }
}
