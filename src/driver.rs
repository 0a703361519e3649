//! The backend driver abstraction (spec §6, §9 "Backend driver abstraction").
//!
//! The renderer core never talks to a concrete GPU API directly. Every
//! handle type here is an opaque `slotmap` key; a real backend is free to
//! interpret it however it likes (mapping it onto a `wgpu::Buffer`, a GL
//! name, …). The only implementation shipped in this crate is
//! [`crate::backend::mock::MockDriver`], used by tests.

use slotmap::new_key_type;

new_key_type! {
    pub struct BufferHandle;
    pub struct TextureHandle;
    pub struct FenceHandle;
    pub struct DescriptorSetHandle;
    pub struct DescriptorSetLayoutHandle;
    pub struct PrimitiveHandle;
    pub struct VertexBufferInfoHandle;
    pub struct ProgramHandle;
}

/// A mapped write view into a buffer object, valid between `map_buffer` and
/// `unmap_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedHandle(pub(crate) BufferHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBinding {
    Uniform,
    Vertex,
    Index,
    ShaderStorage,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u8 {
        const STATIC = 1 << 0;
        const DYNAMIC = 1 << 1;
        const SHARED_WRITE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    ConditionSatisfied,
    TimeoutExpired,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderModel {
    Mobile,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub left: i32,
    pub bottom: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub levels: u8,
    pub sample_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineState {
    pub program: ProgramHandle,
    pub vertex_buffer_info: VertexBufferInfoHandle,
    pub raster_state: crate::key::RasterState,
}

/// A description of a CPU-side buffer update, matching
/// `updateBufferObjectUnsynchronized`'s `{ ptr, sizeBytes, freeCallback }`
/// triple from spec §6 — here a plain owned byte vector, since Rust's
/// ownership makes the free-callback indirection unnecessary.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub bytes: Vec<u8>,
}

/// The narrow API the command-generation core needs from a GPU backend
/// (spec §6). Implementations may be a GL/Vulkan/Metal driver, or
/// [`crate::backend::mock::MockDriver`] for tests.
pub trait Driver {
    fn create_buffer_object(
        &mut self,
        size_bytes: u64,
        binding: BufferBinding,
        usage: BufferUsage,
    ) -> BufferHandle;
    fn destroy_buffer_object(&mut self, handle: BufferHandle);
    fn update_buffer_object_unsynchronized(
        &mut self,
        handle: BufferHandle,
        descriptor: BufferDescriptor,
        byte_offset: u64,
    );
    fn map_buffer(&mut self, handle: BufferHandle, offset: u64, size: u64) -> MappedHandle;
    fn copy_to_memory_mapped_buffer(&mut self, mapped: MappedHandle, offset: u64, data: &[u8]);
    fn unmap_buffer(&mut self, mapped: MappedHandle);

    fn create_texture(&mut self, descriptor: TextureDescriptor) -> TextureHandle;
    fn destroy_texture(&mut self, handle: TextureHandle);

    fn create_fence(&mut self) -> FenceHandle;
    fn destroy_fence(&mut self, handle: FenceHandle);
    fn get_fence_status(&mut self, handle: FenceHandle) -> FenceStatus;

    fn create_descriptor_set(&mut self, layout: DescriptorSetLayoutHandle) -> DescriptorSetHandle;
    fn destroy_descriptor_set(&mut self, handle: DescriptorSetHandle);
    fn update_descriptor_set_buffer(
        &mut self,
        set: DescriptorSetHandle,
        binding_index: u32,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    );

    fn bind_pipeline(&mut self, state: PipelineState);
    fn bind_render_primitive(&mut self, primitive: PrimitiveHandle);
    fn bind_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        binding_point: u32,
        dynamic_offsets: &[u32],
    );
    fn scissor(&mut self, viewport: Viewport);
    fn set_push_constant(&mut self, stage: ShaderStage, id: u32, value: u32);
    fn draw2(&mut self, index_offset: u32, index_count: u32, instance_count: u32);
    fn flush(&mut self);
    fn purge(&mut self);

    fn shader_model(&self) -> ShaderModel;
    fn is_stereo_supported(&self) -> bool;
    fn is_workaround_needed(&self, code: u32) -> bool;
}
