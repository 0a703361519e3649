//! Renderable manager (spec §4.7): the component store for render
//! geometry, visibility flags, and the skinning/morphing/instancing refs a
//! primitive may carry.
//!
//! Shaped like `transform`'s entity-component manager — a sparse
//! `entity -> instance` map over a dense, swap-removable `Vec` — rather
//! than full SoA columns, since renderables carry variable-length
//! primitive slices that don't flatten into fixed-width columns the way a
//! 4x4 matrix does.

use rustc_hash::FxHashMap;

use crate::driver::{BufferHandle, Driver, DescriptorSetHandle, DescriptorSetLayoutHandle, PrimitiveHandle, TextureHandle, VertexBufferInfoHandle};
use crate::entity::Entity;
use crate::error::{ForgeError, Result};
use crate::key::PrimitiveType;
use crate::material::MaterialInstanceHandle;

/// Build-time cap on instances in a single `draw2` call (spec §4.2,
/// §4.7's instance-count invariant). An exact value is a build-time
/// choice this crate has no access to (spec §9 Open Question 2); 2048
/// matches common GPU instancing limits.
pub const MAX_INSTANCES: u32 = 2048;

/// Minimum size of a skinning/morphing UBO, per the OpenGL ES
/// requirement that a bound uniform block be no smaller than its
/// declared minimum size (spec §4.7).
pub const PER_RENDERABLE_BONE_UBO_SIZE: u64 = 8192;

const NONE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderableInstance(u32);

impl RenderableInstance {
    pub const NONE: RenderableInstance = RenderableInstance(NONE);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == NONE
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub center: [f32; 3],
    pub half_extents: [f32; 3],
}

impl Aabb {
    #[must_use]
    pub fn empty() -> Self {
        Aabb {
            center: [0.0; 3],
            half_extents: [0.0; 3],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.half_extents.iter().all(|&h| h <= 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryType {
    Dynamic,
    StaticBounds,
    Static,
}

/// 16-bit visibility pack (spec §3): priority, channel, per-renderable
/// flags, and geometry type, all in one value cheap to carry through the
/// scene SoA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisibilityPack(pub u16);

impl VisibilityPack {
    const PRIORITY_SHIFT: u16 = 0;
    const PRIORITY_MASK: u16 = 0b111;
    const CHANNEL_SHIFT: u16 = 3;
    const CHANNEL_MASK: u16 = 0b111;
    const CAST_SHADOWS: u16 = 1 << 6;
    const RECEIVE_SHADOWS: u16 = 1 << 7;
    const CULLING_ON: u16 = 1 << 8;
    const SKINNING_ON: u16 = 1 << 9;
    const MORPHING_ON: u16 = 1 << 10;
    const SCREEN_SPACE_CONTACT_SHADOWS: u16 = 1 << 11;
    const REVERSED_WINDING: u16 = 1 << 12;
    const FOG: u16 = 1 << 13;
    const GEOMETRY_TYPE_SHIFT: u16 = 14;
    const GEOMETRY_TYPE_MASK: u16 = 0b11;

    #[must_use]
    pub fn priority(self) -> u8 {
        ((self.0 >> Self::PRIORITY_SHIFT) & Self::PRIORITY_MASK) as u8
    }

    #[must_use]
    pub fn channel(self) -> u8 {
        ((self.0 >> Self::CHANNEL_SHIFT) & Self::CHANNEL_MASK) as u8
    }

    #[must_use]
    pub fn casts_shadows(self) -> bool {
        self.0 & Self::CAST_SHADOWS != 0
    }

    #[must_use]
    pub fn receives_shadows(self) -> bool {
        self.0 & Self::RECEIVE_SHADOWS != 0
    }

    #[must_use]
    pub fn culling_on(self) -> bool {
        self.0 & Self::CULLING_ON != 0
    }

    #[must_use]
    pub fn skinning_on(self) -> bool {
        self.0 & Self::SKINNING_ON != 0
    }

    #[must_use]
    pub fn morphing_on(self) -> bool {
        self.0 & Self::MORPHING_ON != 0
    }

    #[must_use]
    pub fn has_screen_space_contact_shadows(self) -> bool {
        self.0 & Self::SCREEN_SPACE_CONTACT_SHADOWS != 0
    }

    #[must_use]
    pub fn reversed_winding(self) -> bool {
        self.0 & Self::REVERSED_WINDING != 0
    }

    #[must_use]
    pub fn fog(self) -> bool {
        self.0 & Self::FOG != 0
    }

    #[must_use]
    pub fn geometry_type(self) -> GeometryType {
        match (self.0 >> Self::GEOMETRY_TYPE_SHIFT) & Self::GEOMETRY_TYPE_MASK {
            0 => GeometryType::Dynamic,
            1 => GeometryType::StaticBounds,
            _ => GeometryType::Static,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.0 = (self.0 & !(Self::PRIORITY_MASK << Self::PRIORITY_SHIFT))
            | ((u16::from(priority) & Self::PRIORITY_MASK) << Self::PRIORITY_SHIFT);
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.0 = (self.0 & !(Self::CHANNEL_MASK << Self::CHANNEL_SHIFT))
            | ((u16::from(channel) & Self::CHANNEL_MASK) << Self::CHANNEL_SHIFT);
        self
    }

    #[must_use]
    pub fn with_flag(mut self, flag: u16, set: bool) -> Self {
        if set {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
        self
    }

    #[must_use]
    pub fn with_geometry_type(mut self, geometry_type: GeometryType) -> Self {
        let bits = match geometry_type {
            GeometryType::Dynamic => 0,
            GeometryType::StaticBounds => 1,
            GeometryType::Static => 2,
        };
        self.0 = (self.0 & !(Self::GEOMETRY_TYPE_MASK << Self::GEOMETRY_TYPE_SHIFT))
            | (bits << Self::GEOMETRY_TYPE_SHIFT);
        self
    }
}

/// One drawable surface of a renderable (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct Primitive {
    pub material_instance: MaterialInstanceHandle,
    pub primitive: PrimitiveHandle,
    pub vertex_buffer_info: VertexBufferInfoHandle,
    pub index_offset: u32,
    pub index_count: u32,
    pub blend_order: u16,
    pub primitive_type: PrimitiveType,
    pub enabled_attributes: u32,
    pub global_blend_order: bool,
    pub morphing_offset: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SkinningRef {
    pub uniform_buffer: BufferHandle,
    pub count: u32,
    pub offset: u32,
    pub bone_texture: TextureHandle,
    pub owns_buffer: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MorphingRef {
    pub uniform_buffer: BufferHandle,
    pub target_count: u32,
    pub morph_target_buffer: BufferHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct InstancingRef {
    pub instance_buffer: BufferHandle,
    pub instance_count: u32,
    pub capacity: u32,
}

struct RenderableComponent {
    entity: Entity,
    aabb: Aabb,
    layer_mask: u8,
    light_channel_mask: u8,
    channels: u8,
    visibility: VisibilityPack,
    primitives: Vec<Primitive>,
    skinning: Option<SkinningRef>,
    morphing: Option<MorphingRef>,
    instancing: Option<InstancingRef>,
    descriptor_set: DescriptorSetHandle,
}

/// Everything needed to create one renderable, gathered before
/// `RenderableManager::create` validates and commits it.
pub struct RenderableBuilder {
    pub aabb: Aabb,
    pub layer_mask: u8,
    pub light_channel_mask: u8,
    pub channels: u8,
    pub visibility: VisibilityPack,
    pub primitives: Vec<Primitive>,
    pub skinning_bone_count: Option<u32>,
    pub skinning_bone_texture: Option<TextureHandle>,
    pub morphing_target_count: Option<u32>,
    pub morphing_target_buffer: Option<BufferHandle>,
    pub instancing: Option<InstancingRef>,
    pub descriptor_set_layout: DescriptorSetLayoutHandle,
}

impl RenderableBuilder {
    #[must_use]
    pub fn new(descriptor_set_layout: DescriptorSetLayoutHandle) -> Self {
        RenderableBuilder {
            aabb: Aabb::empty(),
            layer_mask: 0xFF,
            light_channel_mask: 0xFF,
            channels: 1,
            visibility: VisibilityPack::default(),
            primitives: Vec::new(),
            skinning_bone_count: None,
            skinning_bone_texture: None,
            morphing_target_count: None,
            morphing_target_buffer: None,
            instancing: None,
            descriptor_set_layout,
        }
    }
}

pub struct RenderableManager {
    entity_to_instance: FxHashMap<Entity, u32>,
    components: Vec<RenderableComponent>,
}

impl Default for RenderableManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderableManager {
    #[must_use]
    pub fn new() -> Self {
        RenderableManager {
            entity_to_instance: FxHashMap::default(),
            components: vec![dummy_component()],
        }
    }

    #[must_use]
    pub fn instance_for(&self, entity: Entity) -> Option<RenderableInstance> {
        self.entity_to_instance.get(&entity).copied().map(RenderableInstance)
    }

    /// Validates the builder against the invariants in spec §3, allocates
    /// skinning/morphing UBOs on the driver if requested, and commits the
    /// component. The hardware-primitive-factory step (turning geometry
    /// builder entries into backend primitive handles) is assumed done by
    /// the caller — `builder.primitives` already carries backend handles.
    pub fn create(
        &mut self,
        entity: Entity,
        mut builder: RenderableBuilder,
        driver: &mut dyn Driver,
    ) -> Result<RenderableInstance> {
        let wants_skinning = builder.visibility.skinning_on() && builder.skinning_bone_count.is_some();
        let wants_morphing = builder.visibility.morphing_on() && builder.morphing_target_count.is_some();
        if builder.visibility.geometry_type() == GeometryType::Static && (wants_skinning || wants_morphing) {
            return Err(ForgeError::StaticGeometryCannotSkin);
        }

        let culled = builder.visibility.culling_on();
        let shadow_exempt = !builder.visibility.casts_shadows() && !builder.visibility.receives_shadows();
        if builder.aabb.is_empty() && !(!culled && shadow_exempt) && !builder.primitives.is_empty() {
            return Err(ForgeError::AabbEmpty);
        }

        if let Some(instancing) = builder.instancing {
            if instancing.instance_count > instancing.capacity || instancing.instance_count > MAX_INSTANCES {
                return Err(ForgeError::InstanceCountExceeded {
                    requested: instancing.instance_count,
                    capacity: instancing.capacity,
                    max: MAX_INSTANCES,
                });
            }
        }

        let skinning = if wants_skinning {
            let bone_texture = builder
                .skinning_bone_texture
                .expect("skinning_bone_count set without skinning_bone_texture");
            let uniform_buffer = driver.create_buffer_object(
                PER_RENDERABLE_BONE_UBO_SIZE,
                crate::driver::BufferBinding::Uniform,
                crate::driver::BufferUsage::DYNAMIC,
            );
            Some(SkinningRef {
                uniform_buffer,
                count: builder.skinning_bone_count.unwrap(),
                offset: 0,
                bone_texture,
                owns_buffer: true,
            })
        } else {
            None
        };

        let morphing = if wants_morphing {
            let morph_target_buffer = builder
                .morphing_target_buffer
                .expect("morphing_target_count set without morphing_target_buffer");
            let uniform_buffer = driver.create_buffer_object(
                PER_RENDERABLE_BONE_UBO_SIZE,
                crate::driver::BufferBinding::Uniform,
                crate::driver::BufferUsage::DYNAMIC,
            );
            Some(MorphingRef {
                uniform_buffer,
                target_count: builder.morphing_target_count.unwrap(),
                morph_target_buffer,
            })
        } else {
            None
        };

        let descriptor_set = driver.create_descriptor_set(builder.descriptor_set_layout);

        let index = self.components.len() as u32;
        self.components.push(RenderableComponent {
            entity,
            aabb: std::mem::replace(&mut builder.aabb, Aabb::empty()),
            layer_mask: builder.layer_mask,
            light_channel_mask: builder.light_channel_mask,
            channels: builder.channels,
            visibility: builder.visibility,
            primitives: std::mem::take(&mut builder.primitives),
            skinning,
            morphing,
            instancing: builder.instancing,
            descriptor_set,
        });
        self.entity_to_instance.insert(entity, index);
        Ok(RenderableInstance(index))
    }

    #[must_use]
    pub fn aabb(&self, instance: RenderableInstance) -> Aabb {
        self.components[instance.0 as usize].aabb
    }

    #[must_use]
    pub fn visibility(&self, instance: RenderableInstance) -> VisibilityPack {
        self.components[instance.0 as usize].visibility
    }

    #[must_use]
    pub fn layer_mask(&self, instance: RenderableInstance) -> u8 {
        self.components[instance.0 as usize].layer_mask
    }

    #[must_use]
    pub fn light_channel_mask(&self, instance: RenderableInstance) -> u8 {
        self.components[instance.0 as usize].light_channel_mask
    }

    #[must_use]
    pub fn channels(&self, instance: RenderableInstance) -> u8 {
        self.components[instance.0 as usize].channels
    }

    #[must_use]
    pub fn primitives(&self, instance: RenderableInstance) -> &[Primitive] {
        &self.components[instance.0 as usize].primitives
    }

    #[must_use]
    pub fn skinning(&self, instance: RenderableInstance) -> Option<SkinningRef> {
        self.components[instance.0 as usize].skinning
    }

    #[must_use]
    pub fn morphing(&self, instance: RenderableInstance) -> Option<MorphingRef> {
        self.components[instance.0 as usize].morphing
    }

    #[must_use]
    pub fn instancing(&self, instance: RenderableInstance) -> Option<InstancingRef> {
        self.components[instance.0 as usize].instancing
    }

    #[must_use]
    pub fn descriptor_set(&self, instance: RenderableInstance) -> DescriptorSetHandle {
        self.components[instance.0 as usize].descriptor_set
    }

    /// Destroys `entity`'s renderable component, if it has one, freeing any
    /// backend resources it owns.
    pub fn destroy(&mut self, entity: Entity, driver: &mut dyn Driver) {
        let Some(&instance) = self.entity_to_instance.get(&entity) else {
            return;
        };
        self.entity_to_instance.remove(&entity);

        let component = &self.components[instance as usize];
        let skinning = component.skinning;
        let morphing = component.morphing;
        let descriptor_set = component.descriptor_set;

        if let Some(skinning) = skinning {
            if skinning.owns_buffer {
                driver.destroy_buffer_object(skinning.uniform_buffer);
            }
        }
        if let Some(morphing) = morphing {
            driver.destroy_buffer_object(morphing.uniform_buffer);
        }
        driver.destroy_descriptor_set(descriptor_set);

        self.remove_slot(instance);
    }

    /// Destroys the renderable component of every entity in
    /// `dead_entities` (spec §4.8's once-per-frame entity-component GC).
    pub fn gc(&mut self, dead_entities: &[Entity], driver: &mut dyn Driver) {
        for &entity in dead_entities {
            self.destroy(entity, driver);
        }
    }

    fn remove_slot(&mut self, instance: u32) {
        let last = (self.components.len() - 1) as u32;
        if instance != last {
            self.components.swap(instance as usize, last as usize);
            let moved_entity = self.components[instance as usize].entity;
            self.entity_to_instance.insert(moved_entity, instance);
        }
        self.components.pop();
    }
}

fn dummy_component() -> RenderableComponent {
    RenderableComponent {
        entity: Entity::NULL,
        aabb: Aabb::empty(),
        layer_mask: 0,
        light_channel_mask: 0,
        channels: 0,
        visibility: VisibilityPack::default(),
        primitives: Vec::new(),
        skinning: None,
        morphing: None,
        instancing: None,
        descriptor_set: DescriptorSetHandle::default(),
    }
}

/// Direct bone-weight attribute slots a vertex carries (spec §4.7).
pub const DIRECT_BONE_SLOTS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PackedBoneWeights {
    pub indices: [u32; DIRECT_BONE_SLOTS],
    pub weights: [f32; DIRECT_BONE_SLOTS],
}

/// Packs a vertex's (bone index, weight) influences into the four direct
/// attribute slots (spec §4.7). Weights are normalized first; sums within
/// `2e-7 * influences.len()` of 1.0 snap to exactly 1.0. Vertices with
/// more than four influences spill into a global texture: the fourth
/// slot's index holds the total pair count, its weight holds the negated
/// `texture_offset`, and the caller is responsible for writing the full
/// influence list to that texture offset.
pub fn pack_bone_weights(influences: &[(u32, f32)], texture_offset: u32) -> Result<PackedBoneWeights> {
    let sum: f32 = influences.iter().map(|(_, weight)| weight).sum();
    if sum <= 0.0 {
        return Err(ForgeError::WeightsSumToZero);
    }
    let tolerance = 2e-7 * influences.len() as f32;
    let normalize = if (sum - 1.0).abs() <= tolerance { 1.0 } else { sum };

    let mut packed = PackedBoneWeights::default();
    if influences.len() <= DIRECT_BONE_SLOTS {
        for (slot, &(index, weight)) in influences.iter().enumerate() {
            packed.indices[slot] = index;
            packed.weights[slot] = weight / normalize;
        }
    } else {
        for slot in 0..DIRECT_BONE_SLOTS - 1 {
            let (index, weight) = influences[slot];
            packed.indices[slot] = index;
            packed.weights[slot] = weight / normalize;
        }
        let overflow_slot = DIRECT_BONE_SLOTS - 1;
        packed.indices[overflow_slot] = influences.len() as u32;
        packed.weights[overflow_slot] = -(texture_offset as f32);
    }
    Ok(packed)
}
