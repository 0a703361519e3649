//! Materials and material instances (spec §3 "Material" / "Material
//! instance").
//!
//! Program compilation and the material package format are out of scope
//! (spec §1) — a `Material` here tracks which variants have been prepared
//! and hands back an opaque [`ProgramHandle`] per variant, without knowing
//! or caring how that handle maps to compiled shader code.

use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::SlotMap;

use crate::buffer_allocator::AllocationId;
use crate::driver::{ProgramHandle, Viewport};
use crate::key::{CullingMode, DepthFunc, RasterState};
use crate::resource_list::Handle;

pub type MaterialHandle = Handle<Material>;
pub type MaterialInstanceHandle = Handle<MaterialInstance>;

/// 16-bit variant key (spec §3): bits select shadow-receiver, skinning,
/// fog, VSM, SSR, etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VariantKey(pub u16);

impl VariantKey {
    pub const SHADOW_RECEIVER: u16 = 1 << 0;
    pub const SKINNING_OR_MORPHING: u16 = 1 << 1;
    pub const FOG: u16 = 1 << 2;
    pub const VSM: u16 = 1 << 3;
    pub const SSR: u16 = 1 << 4;

    #[must_use]
    pub fn with_bit(self, bit: u16, set: bool) -> Self {
        if set {
            VariantKey(self.0 | bit)
        } else {
            VariantKey(self.0 & !bit)
        }
    }

    #[must_use]
    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilePriority {
    Critical,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendingMode {
    Opaque,
    Masked,
    Transparent,
    TransparentTwoPassesOneSide,
    TransparentTwoPassesTwoSides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransparencyMode {
    Default,
    TwoPassesOneSide,
    TwoPassesTwoSides,
}

/// Everything about a material family that doesn't vary per instance.
pub struct Material {
    pub raster_state: RasterState,
    pub blending_mode: BlendingMode,
    pub transparency_mode: TransparencyMode,
    pub culling_mode: CullingMode,
    pub shadow_culling_mode: CullingMode,
    pub depth_func: DepthFunc,
    pub required_attributes: u32,
    pub is_lit: bool,
    pub uses_screen_space_refraction: bool,
    pub is_ssr_variant: bool,

    program_slots: SlotMap<ProgramHandle, VariantKey>,
    programs: FxHashMap<VariantKey, ProgramHandle>,
    pending: FxHashSet<VariantKey>,

    default_instance: MaterialInstance,
}

pub struct MaterialDescriptor {
    pub raster_state: RasterState,
    pub blending_mode: BlendingMode,
    pub transparency_mode: TransparencyMode,
    pub culling_mode: CullingMode,
    pub shadow_culling_mode: CullingMode,
    pub depth_func: DepthFunc,
    pub required_attributes: u32,
    pub is_lit: bool,
    pub uses_screen_space_refraction: bool,
    pub is_ssr_variant: bool,
    pub uniform_buffer_size: usize,
}

impl Material {
    #[must_use]
    pub fn new(descriptor: MaterialDescriptor, material: MaterialHandle, sort_key_material: u32) -> Self {
        Material {
            raster_state: descriptor.raster_state,
            blending_mode: descriptor.blending_mode,
            transparency_mode: descriptor.transparency_mode,
            culling_mode: descriptor.culling_mode,
            shadow_culling_mode: descriptor.shadow_culling_mode,
            depth_func: descriptor.depth_func,
            required_attributes: descriptor.required_attributes,
            is_lit: descriptor.is_lit,
            uses_screen_space_refraction: descriptor.uses_screen_space_refraction,
            is_ssr_variant: descriptor.is_ssr_variant,
            program_slots: SlotMap::with_key(),
            programs: FxHashMap::default(),
            pending: FxHashSet::default(),
            default_instance: MaterialInstance::new(material, descriptor.uniform_buffer_size, sort_key_material),
        }
    }

    /// Idempotent; schedules an async backend compile. This crate has no
    /// shader compiler to schedule onto (spec §1 non-goal), so the program
    /// handle is minted immediately and the "schedule" is a no-op beyond
    /// bookkeeping `priority` for a real backend to honor.
    pub fn prepare_program(&mut self, variant: VariantKey, priority: CompilePriority) {
        if self.programs.contains_key(&variant) {
            return;
        }
        if priority == CompilePriority::Critical {
            log::debug!("preparing material program at critical priority");
        }
        self.pending.insert(variant);
        let handle = self.program_slots.insert(variant);
        self.programs.insert(variant, handle);
        self.pending.remove(&variant);
    }

    /// Precondition: `prepare_program(variant, _)` has been called.
    #[must_use]
    pub fn get_program(&self, variant: VariantKey) -> Option<ProgramHandle> {
        self.programs.get(&variant).copied()
    }

    #[must_use]
    pub fn default_instance(&self) -> &MaterialInstance {
        &self.default_instance
    }

    pub fn default_instance_mut(&mut self) -> &mut MaterialInstance {
        &mut self.default_instance
    }
}

/// Where a `MaterialInstance`'s uniform data lives relative to the UBO pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Unallocated,
    Allocated { id: AllocationId, offset: u32 },
    NeedsRealloc,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolygonOffset {
    pub slope: f32,
    pub constant: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StencilState {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureBinding {
    pub texture: crate::driver::TextureHandle,
    pub min_filter: SamplerFilter,
    pub mag_filter: SamplerFilter,
    pub wrap: SamplerWrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerFilter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerWrap {
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

/// A scalar-byte uniform block, dirtied by any write since the last commit
/// (spec GLOSSARY "Dirty").
pub struct UniformBuffer {
    bytes: Vec<u8>,
    dirty: bool,
}

impl UniformBuffer {
    #[must_use]
    pub fn new(size: usize) -> Self {
        UniformBuffer {
            bytes: vec![0u8; size],
            dirty: true,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self.dirty = true;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn commit(&mut self) {
        self.dirty = false;
    }
}

/// Per-instance material state (spec §3 "Material instance").
pub struct MaterialInstance {
    pub material: MaterialHandle,
    pub uniform_buffer: UniformBuffer,
    pub textures: FxHashMap<u32, TextureBinding>,
    pub polygon_offset: PolygonOffset,
    pub stencil_state: StencilState,
    pub scissor: Option<Viewport>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: DepthFunc,
    pub color_write: bool,
    pub culling_color_pass: CullingMode,
    pub culling_shadow_pass: CullingMode,
    pub transparency_mode: TransparencyMode,
    pub double_sided: bool,
    sort_key_material: u32,
    allocation: AllocationState,
}

impl MaterialInstance {
    #[must_use]
    pub fn new(material: MaterialHandle, uniform_buffer_size: usize, sort_key_material: u32) -> Self {
        MaterialInstance {
            material,
            uniform_buffer: UniformBuffer::new(uniform_buffer_size),
            textures: FxHashMap::default(),
            polygon_offset: PolygonOffset::default(),
            stencil_state: StencilState::default(),
            scissor: None,
            depth_test: true,
            depth_write: true,
            depth_func: DepthFunc::Ge,
            color_write: true,
            culling_color_pass: CullingMode::Back,
            culling_shadow_pass: CullingMode::Back,
            transparency_mode: TransparencyMode::Default,
            double_sided: false,
            sort_key_material,
            allocation: AllocationState::Unallocated,
        }
    }

    #[must_use]
    pub fn allocation(&self) -> AllocationState {
        self.allocation
    }

    pub fn set_allocation(&mut self, state: AllocationState) {
        self.allocation = state;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.uniform_buffer.is_dirty()
    }

    pub fn commit(&mut self) {
        self.uniform_buffer.commit();
    }

    /// The material-sort-key bits of the render key (spec §4.1), derived
    /// from material id and instance id so equal values cluster.
    #[must_use]
    pub fn sorting_key(&self) -> u32 {
        self.sort_key_material
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{CullingMode, DepthFunc, RasterState};
    use crate::resource_list::ResourceList;

    fn descriptor() -> MaterialDescriptor {
        MaterialDescriptor {
            raster_state: RasterState {
                culling: CullingMode::Back,
                color_write: true,
                depth_write: true,
                depth_func: DepthFunc::Ge,
                inverse_front_faces: false,
                depth_clamp: false,
            },
            blending_mode: BlendingMode::Opaque,
            transparency_mode: TransparencyMode::Default,
            culling_mode: CullingMode::Back,
            shadow_culling_mode: CullingMode::Back,
            depth_func: DepthFunc::Ge,
            required_attributes: 0,
            is_lit: true,
            uses_screen_space_refraction: false,
            is_ssr_variant: false,
            uniform_buffer_size: 64,
        }
    }

    #[test]
    fn prepare_program_is_idempotent() {
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let handle = materials.insert_with(|h| Material::new(descriptor(), h, 0));
        let material = materials.get_mut(handle).unwrap();
        let variant = VariantKey(VariantKey::FOG);
        material.prepare_program(variant, CompilePriority::Normal);
        let first = material.get_program(variant);
        material.prepare_program(variant, CompilePriority::Critical);
        assert_eq!(first, material.get_program(variant));
    }

    #[test]
    fn get_program_before_prepare_is_none() {
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let handle = materials.insert_with(|h| Material::new(descriptor(), h, 0));
        let material = materials.get(handle).unwrap();
        assert!(material.get_program(VariantKey::default()).is_none());
    }

    #[test]
    fn uniform_buffer_write_marks_dirty_until_commit() {
        let mut ubuf = UniformBuffer::new(16);
        ubuf.commit();
        assert!(!ubuf.is_dirty());
        ubuf.write(0, &[1, 2, 3, 4]);
        assert!(ubuf.is_dirty());
        ubuf.commit();
        assert!(!ubuf.is_dirty());
    }
}
