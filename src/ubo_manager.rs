//! `UboManager` (spec §4.4): pools every managed `MaterialInstance`'s
//! uniform bytes into one growable GPU buffer, backed by
//! [`crate::buffer_allocator::BufferAllocator`] for slot bookkeeping and a
//! nested `FenceManager` for knowing when a retired slot's previous
//! contents are no longer read by an in-flight frame.
//!
//! Grounded on a reference UboManager: `mUbHandle`/`mUboSize` grow by 1.5x
//! whenever the allocator reports it's out of room, `manageMaterialInstance`/
//! `unmanageMaterialInstance` bracket an instance's participation, and
//! `beginFrame`/`finishBeginFrame`/`endFrame`/`terminate` drive the
//! per-frame lifecycle. Slot data lives twice: once in each
//! `MaterialInstance`'s CPU-side `UniformBuffer` (the source of truth) and
//! once in the GPU buffer this manager owns, so growing the pool is just
//! "make a bigger buffer and re-push everything that's still managed".

use crate::buffer_allocator::{AllocationId, AllocationOutcome, BufferAllocator};
use crate::driver::{BufferBinding, BufferHandle, BufferUsage, Driver, FenceHandle, FenceStatus, MappedHandle};
use crate::error::{ForgeError, Result};
use crate::material::{AllocationState, MaterialInstance, MaterialInstanceHandle};
use crate::resource_list::ResourceList;

const GROWTH_NUM: u64 = 3;
const GROWTH_DEN: u64 = 2;

/// Fences created at `end_frame`, each paired with the set of allocations
/// it guards. A fence signals once every draw recorded before it has
/// finished reading the UBO pool, at which point `release_gpu` runs on
/// every allocation in its set.
#[derive(Default)]
struct FenceManager {
    fences: Vec<(FenceHandle, Vec<AllocationId>)>,
}

impl FenceManager {
    fn push(&mut self, fence: FenceHandle, allocations: Vec<AllocationId>) {
        self.fences.push((fence, allocations));
    }

    /// Walks newest-to-oldest. The first signaled fence found, and every
    /// fence older than it, are retired regardless of their own reported
    /// status — the GPU executes in submission order, so a newer fence
    /// signaling guarantees every older one already completed.
    fn retire_signaled(&mut self, driver: &mut dyn Driver, allocator: &mut BufferAllocator) {
        let mut cutoff = None;
        for index in (0..self.fences.len()).rev() {
            if driver.get_fence_status(self.fences[index].0) == FenceStatus::ConditionSatisfied {
                cutoff = Some(index);
                break;
            }
        }
        let Some(cutoff) = cutoff else { return };
        for (fence, allocations) in self.fences.drain(..=cutoff) {
            for id in allocations {
                allocator.release_gpu(id);
            }
            driver.destroy_fence(fence);
        }
    }

    fn terminate(&mut self, driver: &mut dyn Driver) {
        for (fence, _) in self.fences.drain(..) {
            driver.destroy_fence(fence);
        }
    }
}

pub struct UboManager {
    allocator: BufferAllocator,
    buffer: BufferHandle,
    managed: Vec<MaterialInstanceHandle>,
    pending: Vec<MaterialInstanceHandle>,
    fence_manager: FenceManager,
    /// The write view opened by `begin_frame` and closed by
    /// `finish_begin_frame`. `None` outside that window.
    mapped: Option<MappedHandle>,
}

impl UboManager {
    #[must_use]
    pub fn new(driver: &mut dyn Driver, initial_capacity: u32, slot_size: u32) -> Self {
        let buffer = driver.create_buffer_object(u64::from(initial_capacity), BufferBinding::Uniform, BufferUsage::DYNAMIC);
        UboManager {
            allocator: BufferAllocator::new(initial_capacity, slot_size),
            buffer,
            managed: Vec::new(),
            pending: Vec::new(),
            fence_manager: FenceManager::default(),
            mapped: None,
        }
    }

    #[must_use]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.allocator.total_size()
    }

    /// Queues `handle` for slot assignment at the next `begin_frame`. A
    /// no-op if it's already managed or already queued.
    pub fn manage_material_instance(&mut self, handle: MaterialInstanceHandle) {
        if self.managed.contains(&handle) || self.pending.contains(&handle) {
            return;
        }
        self.pending.push(handle);
    }

    /// Releases `handle`'s slot. The slot is not reusable until a later
    /// fence confirms this frame's draws have finished on the GPU.
    pub fn unmanage_material_instance(
        &mut self,
        handle: MaterialInstanceHandle,
        instances: &mut ResourceList<MaterialInstance>,
    ) {
        self.managed.retain(|&h| h != handle);
        self.pending.retain(|&h| h != handle);
        if let Some(instance) = instances.get_mut(handle) {
            if let AllocationState::Allocated { id, .. } = instance.allocation() {
                self.allocator.retire(id);
            }
            instance.set_allocation(AllocationState::Unallocated);
        }
    }

    /// Runs the full `beginFrame` sequence (spec §4.4): retires signaled
    /// fences and releases their GPU holds, compacts the free list,
    /// assigns slots to pending instances, orphans any dirty-but-still-
    /// gpu-inflight managed instance onto a fresh slot, then maps the
    /// buffer for writing.
    pub fn begin_frame(&mut self, driver: &mut dyn Driver, instances: &mut ResourceList<MaterialInstance>) -> Result<()> {
        self.fence_manager.retire_signaled(driver, &mut self.allocator);
        self.allocator.release_free_slots();
        self.resolve_pending(driver, instances)?;
        self.orphan_dirty_gpu_inflight(driver, instances)?;
        // A grow() triggered while orphaning re-queues every managed
        // instance into `pending`; mop that up before mapping.
        self.resolve_pending(driver, instances)?;

        let mapped = driver.map_buffer(self.buffer, 0, u64::from(self.allocator.total_size()));
        self.mapped = Some(mapped);
        Ok(())
    }

    /// Unmaps the buffer. Committing writes via `update_slot` must happen
    /// between `begin_frame` and `finish_begin_frame`.
    pub fn finish_begin_frame(&mut self, driver: &mut dyn Driver) {
        if let Some(mapped) = self.mapped.take() {
            driver.unmap_buffer(mapped);
        }
    }

    /// Allocate-on-demand pass 1: assigns a slot to every pending instance.
    /// `allocate_for`'s regrow path re-queues already-managed instances
    /// back into `pending`, so this loops until the queue is genuinely
    /// empty rather than taking one pass over a snapshot of it.
    fn resolve_pending(&mut self, driver: &mut dyn Driver, instances: &mut ResourceList<MaterialInstance>) -> Result<()> {
        while !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            for handle in pending {
                self.allocate_for(driver, handle, instances)?;
                self.managed.push(handle);
            }
        }
        Ok(())
    }

    /// Allocate-on-demand pass 2 (orphan-on-write): a managed instance
    /// that's dirty but whose current slot is still read by an in-flight
    /// frame can't be overwritten in place. Retire the old slot — kept
    /// alive by its GPU use count until a later fence signals — and
    /// allocate a fresh one; the instance stays dirty so it commits into
    /// the new slot this frame.
    fn orphan_dirty_gpu_inflight(
        &mut self,
        driver: &mut dyn Driver,
        instances: &mut ResourceList<MaterialInstance>,
    ) -> Result<()> {
        let managed = self.managed.clone();
        for handle in managed {
            let Some(instance) = instances.get(handle) else { continue };
            if !instance.is_dirty() {
                continue;
            }
            let AllocationState::Allocated { id, .. } = instance.allocation() else {
                continue;
            };
            if !self.allocator.gpu_in_flight(id) {
                continue;
            }
            if let Some(instance) = instances.get_mut(handle) {
                instance.set_allocation(AllocationState::NeedsRealloc);
            }
            self.allocator.retire(id);
            self.allocate_for(driver, handle, instances)?;
        }
        Ok(())
    }

    fn allocate_for(
        &mut self,
        driver: &mut dyn Driver,
        handle: MaterialInstanceHandle,
        instances: &mut ResourceList<MaterialInstance>,
    ) -> Result<()> {
        let size = instances
            .get(handle)
            .ok_or(ForgeError::InvalidHandle { kind: "MaterialInstance" })?
            .uniform_buffer
            .size() as u32;

        loop {
            match self.allocator.allocate(size) {
                AllocationOutcome::Allocated { id, offset } => {
                    if let Some(instance) = instances.get_mut(handle) {
                        instance.set_allocation(AllocationState::Allocated { id, offset });
                        instance.uniform_buffer.mark_dirty();
                    }
                    return Ok(());
                }
                AllocationOutcome::ReallocationRequired => self.grow(driver, instances),
            }
        }
    }

    /// Grows the backing buffer by 1.5x (at least one slot) and marks every
    /// managed instance for re-allocation against the new pool. CPU-side
    /// uniform bytes are untouched, so nothing is lost across the regrow.
    fn grow(&mut self, driver: &mut dyn Driver, instances: &mut ResourceList<MaterialInstance>) {
        let old_total = u64::from(self.allocator.total_size());
        let slot_size = u64::from(self.allocator.slot_size());
        let grown = (old_total * GROWTH_NUM / GROWTH_DEN).max(old_total + slot_size);
        let new_total = self.allocator.align_up(grown.min(u64::from(u32::MAX)) as u32);

        log::info!("growing UBO pool from {old_total} to {new_total} bytes");

        driver.destroy_buffer_object(self.buffer);
        self.buffer = driver.create_buffer_object(u64::from(new_total), BufferBinding::Uniform, BufferUsage::DYNAMIC);
        self.allocator.reset(new_total);
        self.fence_manager.terminate(driver);

        for &handle in &self.managed {
            if let Some(instance) = instances.get_mut(handle) {
                instance.set_allocation(AllocationState::Unallocated);
                instance.uniform_buffer.mark_dirty();
            }
        }
        self.pending.extend(self.managed.drain(..));
    }

    /// Uploads `instance`'s bytes through the mapped view if it's dirty
    /// and has a live slot. No-op outside a `begin_frame`/
    /// `finish_begin_frame` window.
    pub fn update_slot(&mut self, driver: &mut dyn Driver, instance: &mut MaterialInstance) {
        let AllocationState::Allocated { offset, .. } = instance.allocation() else {
            return;
        };
        if !instance.is_dirty() {
            return;
        }
        let Some(mapped) = self.mapped else { return };
        driver.copy_to_memory_mapped_buffer(mapped, u64::from(offset), instance.uniform_buffer.as_bytes());
        instance.commit();
    }

    /// Creates a fence marking every draw recorded up to this point,
    /// acquires GPU use on every managed instance's current allocation,
    /// and records that set with the fence so it stays out of the free
    /// list until the fence signals.
    pub fn end_frame(&mut self, driver: &mut dyn Driver, instances: &ResourceList<MaterialInstance>) {
        let mut acquired = Vec::with_capacity(self.managed.len());
        for &handle in &self.managed {
            if let Some(AllocationState::Allocated { id, .. }) = instances.get(handle).map(MaterialInstance::allocation) {
                self.allocator.acquire_gpu(id);
                acquired.push(id);
            }
        }
        let fence = driver.create_fence();
        self.fence_manager.push(fence, acquired);
    }

    /// Releases the backing buffer and every outstanding fence. No further
    /// calls are valid afterward.
    pub fn terminate(&mut self, driver: &mut dyn Driver) {
        self.fence_manager.terminate(driver);
        driver.destroy_buffer_object(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockDriver;
    use crate::key::{CullingMode, DepthFunc, RasterState};
    use crate::material::{BlendingMode, Material, MaterialDescriptor, TransparencyMode};

    fn material_handle(materials: &mut ResourceList<Material>, uniform_buffer_size: usize) -> crate::material::MaterialHandle {
        let descriptor = MaterialDescriptor {
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
        };
        materials.insert_with(|h| Material::new(descriptor, h, 0))
    }

    #[test]
    fn manage_then_begin_frame_assigns_a_slot() {
        let mut driver = MockDriver::new();
        let mut ubo = UboManager::new(&mut driver, 1024, 256);
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let material = material_handle(&mut materials, 64);
        let mut instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");
        let instance = instances.insert(MaterialInstance::new(material, 64, 0));

        ubo.manage_material_instance(instance);
        ubo.begin_frame(&mut driver, &mut instances).unwrap();

        assert!(matches!(
            instances.get(instance).unwrap().allocation(),
            AllocationState::Allocated { .. }
        ));
        ubo.finish_begin_frame(&mut driver);
    }

    #[test]
    fn update_slot_uploads_dirty_bytes_and_clears_dirty() {
        let mut driver = MockDriver::new();
        let mut ubo = UboManager::new(&mut driver, 1024, 256);
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let material = material_handle(&mut materials, 16);
        let mut instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");
        let handle = instances.insert(MaterialInstance::new(material, 16, 0));
        ubo.manage_material_instance(handle);
        ubo.begin_frame(&mut driver, &mut instances).unwrap();

        let instance = instances.get_mut(handle).unwrap();
        instance.uniform_buffer.write(0, &[9, 9, 9, 9]);
        ubo.update_slot(&mut driver, instance);

        assert!(!instance.is_dirty());
        assert_eq!(&driver.buffer_bytes(ubo.buffer())[0..4], &[9, 9, 9, 9]);
        ubo.finish_begin_frame(&mut driver);
    }

    #[test]
    fn exhausting_the_pool_triggers_a_regrow() {
        let mut driver = MockDriver::new();
        let mut ubo = UboManager::new(&mut driver, 256, 256);
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let material = material_handle(&mut materials, 256);
        let mut instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");

        let first = instances.insert(MaterialInstance::new(material, 256, 0));
        ubo.manage_material_instance(first);
        ubo.begin_frame(&mut driver, &mut instances).unwrap();
        ubo.finish_begin_frame(&mut driver);

        let second = instances.insert(MaterialInstance::new(material, 256, 1));
        ubo.manage_material_instance(second);
        ubo.begin_frame(&mut driver, &mut instances).unwrap();
        ubo.finish_begin_frame(&mut driver);

        assert!(ubo.total_size() > 256);
        assert!(matches!(
            instances.get(first).unwrap().allocation(),
            AllocationState::Allocated { .. }
        ));
        assert!(matches!(
            instances.get(second).unwrap().allocation(),
            AllocationState::Allocated { .. }
        ));
    }

    #[test]
    fn unmanage_clears_allocation_state() {
        let mut driver = MockDriver::new();
        let mut ubo = UboManager::new(&mut driver, 256, 256);
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let material = material_handle(&mut materials, 256);
        let mut instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");
        let handle = instances.insert(MaterialInstance::new(material, 256, 0));
        ubo.manage_material_instance(handle);
        ubo.begin_frame(&mut driver, &mut instances).unwrap();
        ubo.finish_begin_frame(&mut driver);

        ubo.unmanage_material_instance(handle, &mut instances);
        assert!(matches!(
            instances.get(handle).unwrap().allocation(),
            AllocationState::Unallocated
        ));
    }

    #[test]
    fn end_frame_acquires_gpu_use_and_begin_frame_releases_it_once_signaled() {
        let mut driver = MockDriver::new();
        let mut ubo = UboManager::new(&mut driver, 256, 256);
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let material = material_handle(&mut materials, 256);
        let mut instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");
        let handle = instances.insert(MaterialInstance::new(material, 256, 0));
        ubo.manage_material_instance(handle);
        ubo.begin_frame(&mut driver, &mut instances).unwrap();
        ubo.finish_begin_frame(&mut driver);

        let AllocationState::Allocated { id, .. } = instances.get(handle).unwrap().allocation() else {
            panic!("expected the instance to be allocated");
        };
        assert!(!ubo.allocator.gpu_in_flight(id));

        ubo.end_frame(&mut driver, &instances);
        assert!(ubo.allocator.gpu_in_flight(id));

        let fence = fence_handles(&mut ubo).last().copied().unwrap();
        driver.signal_fence(fence);
        ubo.begin_frame(&mut driver, &mut instances).unwrap();
        ubo.finish_begin_frame(&mut driver);

        assert!(!ubo.allocator.gpu_in_flight(id));
    }

    #[test]
    fn dirtying_a_gpu_inflight_instance_orphans_its_slot_instead_of_overwriting_it() {
        // Two 256-byte slots in a 512-byte pool: large enough that orphaning
        // one instance onto a fresh slot never itself triggers a regrow.
        let mut driver = MockDriver::new();
        let mut ubo = UboManager::new(&mut driver, 512, 256);
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let material = material_handle(&mut materials, 256);
        let mut instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");
        let handle = instances.insert(MaterialInstance::new(material, 256, 0));
        ubo.manage_material_instance(handle);
        ubo.begin_frame(&mut driver, &mut instances).unwrap();
        ubo.finish_begin_frame(&mut driver);

        let AllocationState::Allocated { id: old_id, offset: old_offset } = instances.get(handle).unwrap().allocation()
        else {
            panic!("expected the instance to be allocated");
        };

        ubo.end_frame(&mut driver, &instances);
        assert!(ubo.allocator.gpu_in_flight(old_id));

        // Next frame: dirty the instance while its slot is still gpu-inflight.
        instances.get_mut(handle).unwrap().uniform_buffer.mark_dirty();
        ubo.begin_frame(&mut driver, &mut instances).unwrap();

        let AllocationState::Allocated { id: new_id, offset: new_offset } = instances.get(handle).unwrap().allocation()
        else {
            panic!("expected the instance to still be allocated");
        };
        assert_ne!((new_id, new_offset), (old_id, old_offset));
        assert!(ubo.allocator.gpu_in_flight(old_id), "old slot stays alive until its fence signals");
        assert!(instances.get(handle).unwrap().is_dirty(), "orphaned instance still needs to commit this frame");

        ubo.finish_begin_frame(&mut driver);
    }

    fn fence_handles(ubo: &mut UboManager) -> Vec<FenceHandle> {
        ubo.fence_manager.fences.iter().map(|&(fence, _)| fence).collect()
    }
}
