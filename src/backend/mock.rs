//! An in-process [`Driver`] that records every call instead of submitting
//! to a GPU. Used by integration tests to assert on the exact bind/draw
//! sequence the executor produces (spec §8's end-to-end scenarios).

use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::driver::{
    BufferBinding, BufferDescriptor, BufferHandle, BufferUsage, DescriptorSetHandle,
    DescriptorSetLayoutHandle, Driver, FenceHandle, FenceStatus, MappedHandle, PipelineState,
    PrimitiveHandle, ProgramHandle, ShaderModel, ShaderStage, TextureDescriptor, TextureHandle,
    Viewport,
};

/// One call the executor made, in order, for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Scissor(Viewport),
    BindDescriptorSet {
        set: DescriptorSetHandle,
        binding_point: u32,
        dynamic_offsets: Vec<u32>,
    },
    BindPipeline(PipelineState),
    BindRenderPrimitive(PrimitiveHandle),
    SetPushConstant { stage: ShaderStage, id: u32, value: u32 },
    Draw2 { index_offset: u32, index_count: u32, instance_count: u32 },
    Flush,
}

struct MockBuffer {
    bytes: Vec<u8>,
    mapped: bool,
}

/// Fences are "signaled" the moment [`MockDriver::signal_fence`] is called;
/// real backends would instead poll the GPU. Tests drive this explicitly to
/// exercise `UboManager::beginFrame`'s fence-retirement logic.
#[derive(Default)]
pub struct MockDriver {
    buffers: SlotMap<BufferHandle, MockBuffer>,
    textures: SlotMap<TextureHandle, TextureDescriptor>,
    fences: SlotMap<FenceHandle, bool>,
    descriptor_sets: SlotMap<DescriptorSetHandle, FxHashMap<u32, (BufferHandle, u64, u64)>>,
    programs: SlotMap<ProgramHandle, ()>,
    pub calls: Vec<RecordedCall>,
}

impl MockDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_fence(&mut self, handle: FenceHandle) {
        if let Some(signaled) = self.fences.get_mut(handle) {
            *signaled = true;
        }
    }

    #[must_use]
    pub fn buffer_bytes(&self, handle: BufferHandle) -> &[u8] {
        &self.buffers[handle].bytes
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }
}

impl Driver for MockDriver {
    fn create_buffer_object(
        &mut self,
        size_bytes: u64,
        _binding: BufferBinding,
        _usage: BufferUsage,
    ) -> BufferHandle {
        self.buffers.insert(MockBuffer {
            bytes: vec![0u8; size_bytes as usize],
            mapped: false,
        })
    }

    fn destroy_buffer_object(&mut self, handle: BufferHandle) {
        self.buffers.remove(handle);
    }

    fn update_buffer_object_unsynchronized(
        &mut self,
        handle: BufferHandle,
        descriptor: BufferDescriptor,
        byte_offset: u64,
    ) {
        let buffer = &mut self.buffers[handle];
        let start = byte_offset as usize;
        let end = start + descriptor.bytes.len();
        if end > buffer.bytes.len() {
            buffer.bytes.resize(end, 0);
        }
        buffer.bytes[start..end].copy_from_slice(&descriptor.bytes);
    }

    fn map_buffer(&mut self, handle: BufferHandle, _offset: u64, _size: u64) -> MappedHandle {
        self.buffers[handle].mapped = true;
        MappedHandle(handle)
    }

    fn copy_to_memory_mapped_buffer(&mut self, mapped: MappedHandle, offset: u64, data: &[u8]) {
        let buffer = &mut self.buffers[mapped.0];
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.bytes.len() {
            buffer.bytes.resize(end, 0);
        }
        buffer.bytes[start..end].copy_from_slice(data);
    }

    fn unmap_buffer(&mut self, mapped: MappedHandle) {
        self.buffers[mapped.0].mapped = false;
    }

    fn create_texture(&mut self, descriptor: TextureDescriptor) -> TextureHandle {
        self.textures.insert(descriptor)
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        self.textures.remove(handle);
    }

    fn create_fence(&mut self) -> FenceHandle {
        self.fences.insert(false)
    }

    fn destroy_fence(&mut self, handle: FenceHandle) {
        self.fences.remove(handle);
    }

    fn get_fence_status(&mut self, handle: FenceHandle) -> FenceStatus {
        match self.fences.get(handle) {
            Some(true) => FenceStatus::ConditionSatisfied,
            Some(false) => FenceStatus::TimeoutExpired,
            None => FenceStatus::Error,
        }
    }

    fn create_descriptor_set(&mut self, _layout: DescriptorSetLayoutHandle) -> DescriptorSetHandle {
        self.descriptor_sets.insert(FxHashMap::default())
    }

    fn destroy_descriptor_set(&mut self, handle: DescriptorSetHandle) {
        self.descriptor_sets.remove(handle);
    }

    fn update_descriptor_set_buffer(
        &mut self,
        set: DescriptorSetHandle,
        binding_index: u32,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) {
        self.descriptor_sets[set].insert(binding_index, (buffer, offset, size));
    }

    fn bind_pipeline(&mut self, state: PipelineState) {
        self.calls.push(RecordedCall::BindPipeline(state));
    }

    fn bind_render_primitive(&mut self, primitive: PrimitiveHandle) {
        self.calls.push(RecordedCall::BindRenderPrimitive(primitive));
    }

    fn bind_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        binding_point: u32,
        dynamic_offsets: &[u32],
    ) {
        self.calls.push(RecordedCall::BindDescriptorSet {
            set,
            binding_point,
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn scissor(&mut self, viewport: Viewport) {
        self.calls.push(RecordedCall::Scissor(viewport));
    }

    fn set_push_constant(&mut self, stage: ShaderStage, id: u32, value: u32) {
        self.calls.push(RecordedCall::SetPushConstant { stage, id, value });
    }

    fn draw2(&mut self, index_offset: u32, index_count: u32, instance_count: u32) {
        self.calls.push(RecordedCall::Draw2 {
            index_offset,
            index_count,
            instance_count,
        });
    }

    fn flush(&mut self) {
        self.calls.push(RecordedCall::Flush);
    }

    fn purge(&mut self) {}

    fn shader_model(&self) -> ShaderModel {
        ShaderModel::Desktop
    }

    fn is_stereo_supported(&self) -> bool {
        false
    }

    fn is_workaround_needed(&self, _code: u32) -> bool {
        false
    }
}
