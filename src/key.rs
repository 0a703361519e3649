//! The 64-bit render-command sort key and its descriptor (spec §4.1).
//!
//! Bit widths are a build-time choice (the widths a real renderer used for
//! this are configured via defines this crate has no access to — spec §9
//! Open Question 2); the widths picked here keep every field wide enough to
//! avoid collisions in practice while preserving the ordering semantics the
//! spec requires. The only hard requirement is that [`SENTINEL`] compares
//! greater than every key a real command can produce.
//!
//! Layout, most to least significant bit:
//!
//! | field | bits |
//! |---|---|
//! | pass | 3 |
//! | channel | 3 |
//! | custom tag | 2 |
//! | priority | 3 |
//! | material key | 24 |
//! | variant | 7 |
//! | z bucket / blend distance | 10 |
//! | blend order | 11 |
//! | two-pass flag | 1 |

pub const PASS_BITS: u32 = 3;
pub const CHANNEL_BITS: u32 = 3;
pub const CUSTOM_TAG_BITS: u32 = 2;
pub const PRIORITY_BITS: u32 = 3;
pub const MATERIAL_BITS: u32 = 24;
pub const VARIANT_BITS: u32 = 7;
pub const ZBUCKET_BITS: u32 = 10;
pub const BLEND_ORDER_BITS: u32 = 11;
pub const TWO_PASS_BITS: u32 = 1;

const TWO_PASS_SHIFT: u32 = 0;
const BLEND_ORDER_SHIFT: u32 = TWO_PASS_SHIFT + TWO_PASS_BITS;
const ZBUCKET_SHIFT: u32 = BLEND_ORDER_SHIFT + BLEND_ORDER_BITS;
const VARIANT_SHIFT: u32 = ZBUCKET_SHIFT + ZBUCKET_BITS;
const MATERIAL_SHIFT: u32 = VARIANT_SHIFT + VARIANT_BITS;
const PRIORITY_SHIFT: u32 = MATERIAL_SHIFT + MATERIAL_BITS;
const CUSTOM_TAG_SHIFT: u32 = PRIORITY_SHIFT + PRIORITY_BITS;
const CHANNEL_SHIFT: u32 = CUSTOM_TAG_SHIFT + CUSTOM_TAG_BITS;
const PASS_SHIFT: u32 = CHANNEL_SHIFT + CHANNEL_BITS;

const fn mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// The largest legal key. Appended after every real command so a plain
/// ascending sort pushes skipped/cancelled slots to the end.
pub const SENTINEL: u64 = u64::MAX;

/// Which render pass a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pass {
    Depth = 0,
    Color = 1,
    Blended = 2,
    Refract = 3,
}

/// Custom-command tag: a real draw, or an index into the per-renderpass
/// callback vector.
pub const CUSTOM_TAG_DRAW: u8 = 0;
pub const CUSTOM_TAG_CUSTOM: u8 = 1;

/// Fields that make up a draw command's key (everything except the
/// custom-command path).
#[derive(Debug, Clone, Copy)]
pub struct DrawKeyFields {
    pub pass: Pass,
    pub channel: u8,
    pub priority: u8,
    /// Identifies material+instance for batching; equal values cluster.
    pub material_key: u32,
    pub variant: u8,
    /// Signed distance to the camera plane, already negated by the caller
    /// so ascending float-bit order sorts front-to-back.
    pub depth: f32,
    pub blend_order: u16,
    /// True for the second of a `TWO_PASSES_*` pair.
    pub two_pass: bool,
    /// The primitive's depth/blend bucket should not participate in
    /// sorting at all (e.g. `cullingMode == FRONT_AND_BACK`); force this
    /// key to [`SENTINEL`] instead of packing it.
    pub cancelled: bool,
}

fn z_bucket(depth: f32) -> u64 {
    // IEEE-754 bit pattern is monotonic for non-negative floats; depth is
    // expected pre-negated by the caller so "smaller" means "closer".
    let bits = depth.to_bits();
    u64::from(bits >> (32 - ZBUCKET_BITS))
}

/// Pack a draw command's fields into its 64-bit sort key (spec §4.1).
///
/// `blended` selects whether the z-bucket field is written as-is
/// (opaque/depth: front-to-back) or one's-complemented (blended pass:
/// back-to-front), per the spec's "Blend distance" field description.
#[must_use]
pub fn pack_draw_key(fields: DrawKeyFields) -> u64 {
    if fields.cancelled {
        return SENTINEL;
    }
    let z = z_bucket(fields.depth) & mask(ZBUCKET_BITS);
    let z = if matches!(fields.pass, Pass::Blended) {
        (!z) & mask(ZBUCKET_BITS)
    } else {
        z
    };

    (u64::from(fields.pass as u8) << PASS_SHIFT)
        | (u64::from(fields.channel) & mask(CHANNEL_BITS)) << CHANNEL_SHIFT
        | (u64::from(CUSTOM_TAG_DRAW) & mask(CUSTOM_TAG_BITS)) << CUSTOM_TAG_SHIFT
        | (u64::from(fields.priority) & mask(PRIORITY_BITS)) << PRIORITY_SHIFT
        | (u64::from(fields.material_key) & mask(MATERIAL_BITS)) << MATERIAL_SHIFT
        | (u64::from(fields.variant) & mask(VARIANT_BITS)) << VARIANT_SHIFT
        | z << ZBUCKET_SHIFT
        | (u64::from(fields.blend_order) & mask(BLEND_ORDER_BITS)) << BLEND_ORDER_SHIFT
        | (u64::from(fields.two_pass) << TWO_PASS_SHIFT)
}

/// Pack a custom (non-draw) command's key: ordered by pass/channel, then by
/// the caller-supplied `order`, which also serves as the callback index.
#[must_use]
pub fn pack_custom_key(pass: Pass, channel: u8, order: u32) -> u64 {
    let low_bits = MATERIAL_BITS + VARIANT_BITS + ZBUCKET_BITS + BLEND_ORDER_BITS + TWO_PASS_BITS;
    (u64::from(pass as u8) << PASS_SHIFT)
        | (u64::from(channel) & mask(CHANNEL_BITS)) << CHANNEL_SHIFT
        | (u64::from(CUSTOM_TAG_CUSTOM) & mask(CUSTOM_TAG_BITS)) << CUSTOM_TAG_SHIFT
        | (u64::from(order) & mask(low_bits))
}

/// Extract the callback index packed by [`pack_custom_key`].
#[must_use]
pub fn custom_command_index(key: u64) -> u32 {
    let low_bits = MATERIAL_BITS + VARIANT_BITS + ZBUCKET_BITS + BLEND_ORDER_BITS + TWO_PASS_BITS;
    (key & mask(low_bits)) as u32
}

/// True if `key` was produced by [`pack_custom_key`] rather than a draw.
#[must_use]
pub fn is_custom(key: u64) -> bool {
    key != SENTINEL && ((key >> CUSTOM_TAG_SHIFT) & mask(CUSTOM_TAG_BITS)) as u8 == CUSTOM_TAG_CUSTOM
}

/// Per-primitive draw descriptor, paired 1:1 with a sort key in the command
/// buffer (spec §4.1's ~96-byte POD).
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    pub material_instance: crate::material::MaterialInstanceHandle,
    pub primitive: crate::driver::PrimitiveHandle,
    pub vertex_buffer_info: crate::driver::VertexBufferInfoHandle,
    pub index_offset: u32,
    pub index_count: u32,
    /// Index into the scene SoA's per-renderable UBO array, or — after
    /// instancify — the byte offset into the instancing staging buffer.
    pub ubo_index: u32,
    pub descriptor_set: crate::driver::DescriptorSetHandle,
    pub skinning_offset: u32,
    pub morphing_offset: u32,
    pub primitive_type: PrimitiveType,
    pub raster_state: RasterState,
    pub variant: u8,
    pub instance_count: u32,
    pub has_morphing: bool,
    pub has_skinning: bool,
    pub has_hybrid_instancing: bool,
}

impl CommandDescriptor {
    /// Fields that must match for two adjacent descriptors to be merged by
    /// `instancify` (spec §4.2).
    #[must_use]
    pub fn instancing_batch_key(&self) -> InstancingBatchKey {
        InstancingBatchKey {
            material_instance: self.material_instance,
            primitive: self.primitive,
            vertex_buffer_info: self.vertex_buffer_info,
            index_offset: self.index_offset,
            index_count: self.index_count,
            raster_state: self.raster_state,
        }
    }

    #[must_use]
    pub fn is_instanceable(&self) -> bool {
        !(self.has_skinning || self.has_morphing || self.has_hybrid_instancing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstancingBatchKey {
    pub material_instance: crate::material::MaterialInstanceHandle,
    pub primitive: crate::driver::PrimitiveHandle,
    pub vertex_buffer_info: crate::driver::VertexBufferInfoHandle,
    pub index_offset: u32,
    pub index_count: u32,
    pub raster_state: RasterState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimitiveType {
    Triangles,
    TriangleStrip,
    Lines,
    Points,
}

/// Packed raster state carried in a command descriptor: culling, color/depth
/// write, depth func. Kept small and `Copy` so it's cheap to compare when
/// deciding whether two draws can be instanced together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterState {
    pub culling: CullingMode,
    pub color_write: bool,
    pub depth_write: bool,
    pub depth_func: DepthFunc,
    pub inverse_front_faces: bool,
    pub depth_clamp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CullingMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DepthFunc {
    Ge,
    Greater,
    Less,
    Always,
}
