//! Entities: 32-bit opaque handles minted by a process-wide allocator.
//!
//! An entity packs a dense index in the low 24 bits and a generation counter
//! in the high 8 bits, so a destroyed-and-recycled index cannot be confused
//! with the entity that previously held it. Components never live on the
//! entity itself — they live in the component managers (`transform`,
//! `renderable`), looked up by entity via a sparse map.

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_SHIFT: u32 = INDEX_BITS;

/// An opaque 32-bit entity identifier. The all-zero value is never handed
/// out by [`EntityManager::create`] and stands for "no entity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(u32);

impl Entity {
    /// The reserved null entity.
    pub const NULL: Entity = Entity(0);

    #[must_use]
    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    #[must_use]
    pub fn generation(self) -> u8 {
        (self.0 >> GENERATION_SHIFT) as u8
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn pack(index: u32, generation: u8) -> Self {
        debug_assert!(index <= INDEX_MASK, "entity index space exhausted");
        Entity((u32::from(generation) << GENERATION_SHIFT) | index)
    }
}

impl Default for Entity {
    fn default() -> Self {
        Entity::NULL
    }
}

/// Process-wide entity allocator.
///
/// Destroying an entity recycles its index once its generation has been
/// bumped, so any handle captured before the destroy compares unequal to the
/// entity that's later minted at the same index.
#[derive(Debug, Default)]
pub struct EntityManager {
    generations: Vec<u8>,
    free_indices: Vec<u32>,
    dead_since_gc: Vec<Entity>,
}

impl EntityManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new entity.
    pub fn create(&mut self) -> Entity {
        if let Some(index) = self.free_indices.pop() {
            Entity::pack(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(1);
            Entity::pack(index, 1)
        }
    }

    /// Fill `out` with `count` freshly minted entities.
    pub fn create_n(&mut self, count: usize, out: &mut Vec<Entity>) {
        out.reserve(count);
        for _ in 0..count {
            out.push(self.create());
        }
    }

    /// Returns whether `entity` was minted by this manager and has not since
    /// been destroyed.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        if entity.is_null() {
            return false;
        }
        let index = entity.index() as usize;
        self.generations
            .get(index)
            .is_some_and(|&g| g == entity.generation())
    }

    /// Destroy `entity`. Bumps its generation so the index can be recycled
    /// without aliasing the old handle. Queues it for component GC (§4.8);
    /// call [`EntityManager::drain_destroyed`] once per frame to collect it.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let index = entity.index() as usize;
        self.generations[index] = self.generations[index].wrapping_add(1).max(1);
        self.free_indices.push(entity.index());
        self.dead_since_gc.push(entity);
        true
    }

    /// Drain the entities destroyed since the last GC pass. Component
    /// managers use this list to destroy their own components for entities
    /// the entity manager reports dead (spec §4.8).
    pub fn drain_destroyed(&mut self) -> Vec<Entity> {
        std::mem::take(&mut self.dead_since_gc)
    }
}
