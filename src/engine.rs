//! Top-level engine orchestrator (spec §10.1, new relative to the distilled
//! spec): one struct a host embeds instead of wiring up nine managers by
//! hand.
//!
//! Grounded in the teacher's own `Engine`: a struct of public subsystem
//! fields plus a handful of orchestration methods (`new`, a per-frame
//! sequencing pair, a cleanup pass) rather than a method forwarding every
//! single subsystem operation. Component managers (`transforms`,
//! `renderables`, `material_instance_cache`, `ubo_manager`, `entities`) are
//! public fields here for the same reason the teacher exposes `renderer`,
//! `scene_manager`, `assets` directly — callers reach through `Engine` into
//! the manager they need rather than going through a hundred wrapper
//! methods. The eighteen resource kinds of spec §4.8 are the exception:
//! those get `create_*`/`destroy_*` pairs, since existence-tracking plus
//! (for the driver-backed kinds) handle lifetime is exactly the behavior
//! the spec asks `Engine` to own for them.

use parking_lot::Mutex;

use crate::driver::{
    BufferBinding, BufferHandle, BufferUsage, Driver, FenceHandle, TextureDescriptor, TextureHandle,
    VertexBufferInfoHandle,
};
use crate::entity::{Entity, EntityManager};
use crate::error::{ForgeError, Result};
use crate::material::{Material, MaterialDescriptor, MaterialHandle, MaterialInstance, MaterialInstanceHandle};
use crate::material_cache::MaterialInstanceCache;
use crate::renderable::{RenderableBuilder, RenderableInstance, RenderableManager};
use crate::resource_list::{Handle, ResourceList};
use crate::transform::TransformManager;
use crate::ubo_manager::UboManager;

/// Resource kinds spec §4.8 names that have no further behavior defined in
/// this crate — a `ResourceList` entry is existence-tracking, nothing more.
/// Each wraps the driver handle it's backed by (if any) in its own type, so
/// a `Handle<Texture>` can never be mistaken for a `Handle<BufferObject>`
/// even though both happen to carry a `BufferHandle`/`TextureHandle`
/// underneath.
pub struct Texture(pub TextureHandle);
pub struct VertexBuffer(pub VertexBufferInfoHandle);
pub struct IndexBuffer(pub BufferHandle);
pub struct BufferObject(pub BufferHandle);
pub struct SkinningBuffer(pub BufferHandle);
pub struct MorphTargetBuffer(pub BufferHandle);
pub struct InstanceBuffer(pub BufferHandle);

macro_rules! marker_resource {
    ($name:ident) => {
        #[derive(Debug, Default)]
        pub struct $name;
    };
}

marker_resource!(RendererResource);
marker_resource!(ViewResource);
marker_resource!(SceneResource);
marker_resource!(SwapChainResource);
marker_resource!(RenderTargetResource);
marker_resource!(IndirectLightResource);
marker_resource!(SkyboxResource);
marker_resource!(ColorGradingResource);
marker_resource!(StreamResource);
marker_resource!(SyncResource);

/// Defines a `create_*`/`destroy_*` pair for a resource kind that has no
/// driver-side lifetime, just engine-side existence tracking (spec §4.8:
/// "insert on create, erase on destroy, `isValid` = set membership").
macro_rules! plain_resource_kind {
    ($list:ident, $ty:ty, $kind:literal, $create:ident, $destroy:ident) => {
        #[must_use]
        pub fn $create(&mut self) -> Handle<$ty> {
            self.$list.insert(<$ty>::default())
        }

        pub fn $destroy(&mut self, handle: Handle<$ty>) -> Result<()> {
            self.$list
                .remove(handle)
                .map(|_| ())
                .ok_or(ForgeError::InvalidHandle { kind: $kind })
        }
    };
}

/// Owns every manager and resource list in the engine, plus the backend
/// driver. A host embeds one of these; nothing here outlives it.
pub struct Engine {
    pub entities: EntityManager,
    pub transforms: TransformManager,
    pub renderables: RenderableManager,
    pub material_instance_cache: MaterialInstanceCache,
    pub ubo_manager: UboManager,

    materials: ResourceList<Material>,
    material_instances: ResourceList<MaterialInstance>,
    textures: ResourceList<Texture>,
    vertex_buffers: ResourceList<VertexBuffer>,
    index_buffers: ResourceList<IndexBuffer>,
    buffer_objects: ResourceList<BufferObject>,
    skinning_buffers: ResourceList<SkinningBuffer>,
    morph_target_buffers: ResourceList<MorphTargetBuffer>,
    instance_buffers: ResourceList<InstanceBuffer>,
    renderers: ResourceList<RendererResource>,
    views: ResourceList<ViewResource>,
    scenes: ResourceList<SceneResource>,
    swap_chains: ResourceList<SwapChainResource>,
    render_targets: ResourceList<RenderTargetResource>,
    indirect_lights: ResourceList<IndirectLightResource>,
    skyboxes: ResourceList<SkyboxResource>,
    color_gradings: ResourceList<ColorGradingResource>,
    streams: ResourceList<StreamResource>,
    /// Fence and sync lists may be touched from the driver thread (spec §5
    /// thread-affinity exception), so these two alone carry a mutex; every
    /// other list here is engine (app) thread only.
    fences: Mutex<ResourceList<FenceHandle>>,
    syncs: Mutex<ResourceList<SyncResource>>,

    driver: Box<dyn Driver>,
}

impl Engine {
    /// `ubo_initial_capacity`/`ubo_slot_size` seed the per-frame UBO pool
    /// (spec §4.3/§4.4); both are per-engine runtime knobs, not build-time
    /// constants.
    #[must_use]
    pub fn new(mut driver: Box<dyn Driver>, ubo_initial_capacity: u32, ubo_slot_size: u32) -> Self {
        let ubo_manager = UboManager::new(driver.as_mut(), ubo_initial_capacity, ubo_slot_size);
        Engine {
            entities: EntityManager::new(),
            transforms: TransformManager::new(),
            renderables: RenderableManager::new(),
            material_instance_cache: MaterialInstanceCache::new(),
            ubo_manager,
            materials: ResourceList::new("Material"),
            material_instances: ResourceList::new("MaterialInstance"),
            textures: ResourceList::new("Texture"),
            vertex_buffers: ResourceList::new("VertexBuffer"),
            index_buffers: ResourceList::new("IndexBuffer"),
            buffer_objects: ResourceList::new("BufferObject"),
            skinning_buffers: ResourceList::new("SkinningBuffer"),
            morph_target_buffers: ResourceList::new("MorphTargetBuffer"),
            instance_buffers: ResourceList::new("InstanceBuffer"),
            renderers: ResourceList::new("Renderer"),
            views: ResourceList::new("View"),
            scenes: ResourceList::new("Scene"),
            swap_chains: ResourceList::new("SwapChain"),
            render_targets: ResourceList::new("RenderTarget"),
            indirect_lights: ResourceList::new("IndirectLight"),
            skyboxes: ResourceList::new("Skybox"),
            color_gradings: ResourceList::new("ColorGrading"),
            streams: ResourceList::new("Stream"),
            fences: Mutex::new(ResourceList::new("Fence")),
            syncs: Mutex::new(ResourceList::new("Sync")),
            driver,
        }
    }

    #[must_use]
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> &mut dyn Driver {
        self.driver.as_mut()
    }

    #[must_use]
    pub fn materials(&self) -> &ResourceList<Material> {
        &self.materials
    }

    /// Mutable materials access, needed by [`crate::render_pass::RenderPass::generate`]
    /// to compile variants it discovers mid-generation.
    pub fn materials_mut(&mut self) -> &mut ResourceList<Material> {
        &mut self.materials
    }

    /// Disjoint borrows of the driver and the two lists a render pass's
    /// `instancify`/`execute` steps need, all live at once. A host can't get
    /// this by calling `driver_mut()`/`materials()`/`material_instances()`
    /// separately in one call's argument list — each of those reborrows all
    /// of `Engine` — so the three fields are projected out together here,
    /// the same way the methods inside this `impl` already do.
    pub fn driver_and_lists(&mut self) -> (&mut dyn Driver, &ResourceList<Material>, &ResourceList<MaterialInstance>) {
        (self.driver.as_mut(), &self.materials, &self.material_instances)
    }

    #[must_use]
    pub fn material_instances(&self) -> &ResourceList<MaterialInstance> {
        &self.material_instances
    }

    pub fn create_entity(&mut self) -> Entity {
        self.entities.create()
    }

    pub fn destroy_entity(&mut self, entity: Entity) -> bool {
        self.entities.destroy(entity)
    }

    pub fn create_material(&mut self, descriptor: MaterialDescriptor) -> MaterialHandle {
        self.materials.insert_with(|handle| Material::new(descriptor, handle, 0))
    }

    /// Destroys `handle` and every material instance the cache has minted
    /// for it (spec §9 "cyclic ownership between material and
    /// material-instance cache", resolved per §10's composed-owner note).
    pub fn destroy_material(&mut self, handle: MaterialHandle) -> Result<()> {
        self.materials
            .remove(handle)
            .ok_or(ForgeError::InvalidHandle { kind: "Material" })?;
        for instance in self.material_instance_cache.take_instances_for(handle) {
            self.ubo_manager.unmanage_material_instance(instance, &mut self.material_instances);
            self.material_instances.remove(instance);
        }
        Ok(())
    }

    /// Hands back the next available instance of `material`, minting one
    /// if needed, and registers it with the UBO manager so its uniform
    /// bytes are pooled starting at the next `begin_frame`.
    pub fn acquire_material_instance(&mut self, material: MaterialHandle) -> (MaterialInstanceHandle, usize) {
        let (instance, fixed_index) =
            self.material_instance_cache
                .get_instance(material, &self.materials, &mut self.material_instances);
        self.ubo_manager.manage_material_instance(instance);
        (instance, fixed_index)
    }

    pub fn create_renderable(&mut self, entity: Entity, builder: RenderableBuilder) -> Result<RenderableInstance> {
        self.renderables.create(entity, builder, self.driver.as_mut())
    }

    pub fn create_texture(&mut self, descriptor: TextureDescriptor) -> Handle<Texture> {
        let handle = self.driver.create_texture(descriptor);
        self.textures.insert(Texture(handle))
    }

    pub fn destroy_texture(&mut self, handle: Handle<Texture>) -> Result<()> {
        let texture = self.textures.remove(handle).ok_or(ForgeError::InvalidHandle { kind: "Texture" })?;
        self.driver.destroy_texture(texture.0);
        Ok(())
    }

    /// Geometry upload (populating vertex/index bytes) is out of scope
    /// (spec §1 Non-goals); this only tracks the liveness of a layout
    /// handle a higher-level asset loader already minted.
    pub fn create_vertex_buffer(&mut self, info: VertexBufferInfoHandle) -> Handle<VertexBuffer> {
        self.vertex_buffers.insert(VertexBuffer(info))
    }

    pub fn destroy_vertex_buffer(&mut self, handle: Handle<VertexBuffer>) -> Result<()> {
        self.vertex_buffers
            .remove(handle)
            .map(|_| ())
            .ok_or(ForgeError::InvalidHandle { kind: "VertexBuffer" })
    }

    pub fn create_index_buffer(&mut self, size_bytes: u64) -> Handle<IndexBuffer> {
        let buffer = self.driver.create_buffer_object(size_bytes, BufferBinding::Index, BufferUsage::STATIC);
        self.index_buffers.insert(IndexBuffer(buffer))
    }

    pub fn destroy_index_buffer(&mut self, handle: Handle<IndexBuffer>) -> Result<()> {
        let buffer = self
            .index_buffers
            .remove(handle)
            .ok_or(ForgeError::InvalidHandle { kind: "IndexBuffer" })?;
        self.driver.destroy_buffer_object(buffer.0);
        Ok(())
    }

    pub fn create_buffer_object(&mut self, size_bytes: u64, binding: BufferBinding, usage: BufferUsage) -> Handle<BufferObject> {
        let buffer = self.driver.create_buffer_object(size_bytes, binding, usage);
        self.buffer_objects.insert(BufferObject(buffer))
    }

    pub fn destroy_buffer_object(&mut self, handle: Handle<BufferObject>) -> Result<()> {
        let buffer = self
            .buffer_objects
            .remove(handle)
            .ok_or(ForgeError::InvalidHandle { kind: "BufferObject" })?;
        self.driver.destroy_buffer_object(buffer.0);
        Ok(())
    }

    pub fn create_skinning_buffer(&mut self, size_bytes: u64) -> Handle<SkinningBuffer> {
        let buffer = self.driver.create_buffer_object(size_bytes, BufferBinding::ShaderStorage, BufferUsage::DYNAMIC);
        self.skinning_buffers.insert(SkinningBuffer(buffer))
    }

    pub fn destroy_skinning_buffer(&mut self, handle: Handle<SkinningBuffer>) -> Result<()> {
        let buffer = self
            .skinning_buffers
            .remove(handle)
            .ok_or(ForgeError::InvalidHandle { kind: "SkinningBuffer" })?;
        self.driver.destroy_buffer_object(buffer.0);
        Ok(())
    }

    pub fn create_morph_target_buffer(&mut self, size_bytes: u64) -> Handle<MorphTargetBuffer> {
        let buffer = self.driver.create_buffer_object(size_bytes, BufferBinding::ShaderStorage, BufferUsage::DYNAMIC);
        self.morph_target_buffers.insert(MorphTargetBuffer(buffer))
    }

    pub fn destroy_morph_target_buffer(&mut self, handle: Handle<MorphTargetBuffer>) -> Result<()> {
        let buffer = self
            .morph_target_buffers
            .remove(handle)
            .ok_or(ForgeError::InvalidHandle { kind: "MorphTargetBuffer" })?;
        self.driver.destroy_buffer_object(buffer.0);
        Ok(())
    }

    pub fn create_instance_buffer(&mut self, size_bytes: u64) -> Handle<InstanceBuffer> {
        let buffer = self.driver.create_buffer_object(size_bytes, BufferBinding::Vertex, BufferUsage::DYNAMIC);
        self.instance_buffers.insert(InstanceBuffer(buffer))
    }

    pub fn destroy_instance_buffer(&mut self, handle: Handle<InstanceBuffer>) -> Result<()> {
        let buffer = self
            .instance_buffers
            .remove(handle)
            .ok_or(ForgeError::InvalidHandle { kind: "InstanceBuffer" })?;
        self.driver.destroy_buffer_object(buffer.0);
        Ok(())
    }

    pub fn create_fence(&mut self) -> Handle<FenceHandle> {
        let fence = self.driver.create_fence();
        self.fences.lock().insert(fence)
    }

    pub fn destroy_fence(&mut self, handle: Handle<FenceHandle>) -> Result<()> {
        let fence = self
            .fences
            .lock()
            .remove(handle)
            .ok_or(ForgeError::InvalidHandle { kind: "Fence" })?;
        self.driver.destroy_fence(fence);
        Ok(())
    }

    plain_resource_kind!(renderers, RendererResource, "Renderer", create_renderer, destroy_renderer);
    plain_resource_kind!(views, ViewResource, "View", create_view, destroy_view);
    plain_resource_kind!(scenes, SceneResource, "Scene", create_scene, destroy_scene);
    plain_resource_kind!(swap_chains, SwapChainResource, "SwapChain", create_swap_chain, destroy_swap_chain);
    plain_resource_kind!(
        render_targets,
        RenderTargetResource,
        "RenderTarget",
        create_render_target,
        destroy_render_target
    );
    plain_resource_kind!(
        indirect_lights,
        IndirectLightResource,
        "IndirectLight",
        create_indirect_light,
        destroy_indirect_light
    );
    plain_resource_kind!(skyboxes, SkyboxResource, "Skybox", create_skybox, destroy_skybox);
    plain_resource_kind!(
        color_gradings,
        ColorGradingResource,
        "ColorGrading",
        create_color_grading,
        destroy_color_grading
    );
    plain_resource_kind!(streams, StreamResource, "Stream", create_stream, destroy_stream);

    pub fn create_sync(&mut self) -> Handle<SyncResource> {
        self.syncs.lock().insert(SyncResource)
    }

    pub fn destroy_sync(&mut self, handle: Handle<SyncResource>) -> Result<()> {
        self.syncs
            .lock()
            .remove(handle)
            .map(|_| ())
            .ok_or(ForgeError::InvalidHandle { kind: "Sync" })
    }

    /// Sequences the UBO manager's `beginFrame` before any material-instance
    /// commit this frame (spec §5 ordering guarantee).
    pub fn begin_frame(&mut self) -> Result<()> {
        self.ubo_manager.begin_frame(self.driver.as_mut(), &mut self.material_instances)
    }

    /// Unmaps the UBO pool. Must be called after every `update_slot` this
    /// frame and before any draw that reads the pool (spec §5 ordering
    /// guarantee).
    pub fn finish_begin_frame(&mut self) {
        self.ubo_manager.finish_begin_frame(self.driver.as_mut());
    }

    /// Sequences the UBO manager's `endFrame` after every draw that may
    /// have touched the pool, and resets the material-instance cache's
    /// per-record cursor for the next frame.
    pub fn end_frame(&mut self) {
        self.ubo_manager.end_frame(self.driver.as_mut(), &self.material_instances);
        self.material_instance_cache.reset();
    }

    /// Runs the once-per-frame entity-component GC (spec §4.8): every dead
    /// entity's transform and renderable components are destroyed.
    pub fn gc(&mut self) {
        let dead = self.entities.drain_destroyed();
        if dead.is_empty() {
            return;
        }
        self.transforms.gc(&dead);
        self.renderables.gc(&dead, self.driver.as_mut());
    }

    /// Releases every resource list and manager. Non-empty lists log a
    /// leak warning as they drop (spec §4.8); this only tears down the
    /// backend-owned pieces that need an explicit driver call first.
    pub fn terminate(&mut self) {
        self.ubo_manager.terminate(self.driver.as_mut());
        self.material_instance_cache.terminate(&mut self.material_instances);
        for (_, fence) in self.fences.lock().iter().map(|(h, f)| (h, *f)).collect::<Vec<_>>() {
            self.driver.destroy_fence(fence);
        }
        self.fences.lock().clear();
        for (_, texture) in self.textures.iter().map(|(h, t)| (h, t.0)).collect::<Vec<_>>() {
            self.driver.destroy_texture(texture);
        }
        self.textures.clear();
        for buffer in [
            self.index_buffers.iter().map(|(_, b)| b.0).collect::<Vec<_>>(),
            self.buffer_objects.iter().map(|(_, b)| b.0).collect::<Vec<_>>(),
            self.skinning_buffers.iter().map(|(_, b)| b.0).collect::<Vec<_>>(),
            self.morph_target_buffers.iter().map(|(_, b)| b.0).collect::<Vec<_>>(),
            self.instance_buffers.iter().map(|(_, b)| b.0).collect::<Vec<_>>(),
        ]
        .concat()
        {
            self.driver.destroy_buffer_object(buffer);
        }
        self.index_buffers.clear();
        self.buffer_objects.clear();
        self.skinning_buffers.clear();
        self.morph_target_buffers.clear();
        self.instance_buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockDriver;
    use crate::key::{CullingMode, DepthFunc, RasterState};
    use crate::material::{BlendingMode, TransparencyMode};
    use crate::transform::TransformInstance;

    fn test_engine() -> Engine {
        Engine::new(Box::new(MockDriver::new()), 1024, 256)
    }

    fn a_material_descriptor(uniform_buffer_size: usize) -> MaterialDescriptor {
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
            uniform_buffer_size,
        }
    }

    #[test]
    fn create_destroy_material_round_trips() {
        let mut engine = test_engine();
        let material = engine.create_material(a_material_descriptor(64));
        assert!(engine.materials().is_valid(material));
        engine.destroy_material(material).unwrap();
        assert!(!engine.materials().is_valid(material));
    }

    #[test]
    fn destroying_a_material_cascades_to_its_instances() {
        let mut engine = test_engine();
        let material = engine.create_material(a_material_descriptor(64));
        let (instance, _) = engine.acquire_material_instance(material);
        assert!(engine.material_instances().is_valid(instance));

        engine.destroy_material(material).unwrap();
        assert!(!engine.material_instances().is_valid(instance));
    }

    #[test]
    fn begin_then_end_frame_assigns_a_ubo_slot() {
        let mut engine = test_engine();
        let material = engine.create_material(a_material_descriptor(64));
        let (instance, _) = engine.acquire_material_instance(material);

        engine.begin_frame().unwrap();
        assert!(engine.material_instances().get(instance).unwrap().allocation() != crate::material::AllocationState::Unallocated);
        engine.finish_begin_frame();
        engine.end_frame();
    }

    #[test]
    fn gc_destroys_components_of_dead_entities_only() {
        let mut engine = test_engine();
        let alive = engine.create_entity();
        let dead = engine.create_entity();
        engine.transforms.create(alive, TransformInstance::NONE);
        engine.transforms.create(dead, TransformInstance::NONE);

        engine.destroy_entity(dead);
        engine.gc();

        assert!(engine.transforms.instance_for(alive).is_some());
        assert!(engine.transforms.instance_for(dead).is_none());
    }

    #[test]
    fn plain_resource_kind_round_trips() {
        let mut engine = test_engine();
        let view = engine.create_view();
        engine.destroy_view(view).unwrap();
        assert!(matches!(
            engine.destroy_view(view).unwrap_err(),
            ForgeError::InvalidHandle { kind: "View" }
        ));
    }

    #[test]
    fn texture_create_destroy_round_trips_through_the_driver() {
        let mut engine = test_engine();
        let texture = engine.create_texture(TextureDescriptor {
            width: 4,
            height: 4,
            depth: 1,
            levels: 1,
            sample_count: 1,
        });
        assert!(engine.destroy_texture(texture).is_ok());
    }
}
