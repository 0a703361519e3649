//! Material-instance cache (spec §4.5): one record per material, handing
//! out already-constructed instances before minting new ones.
//!
//! Grounded on a reference `MaterialInstanceManager`: a flat `Vec<Record>`
//! scanned linearly to find a material's record (the number of distinct
//! materials live at once is small enough that a hash map would be
//! overkill), and an `available` cursor per record, reset once a frame. The
//! reference uses a sentinel `INVALID_FIXED_INDEX = -1` for "no fixed index
//! assigned yet"; an `Option<usize>` plays that role here.

use crate::material::{Material, MaterialHandle, MaterialInstance, MaterialInstanceHandle};
use crate::resource_list::ResourceList;

struct Record {
    material: MaterialHandle,
    instances: Vec<MaterialInstanceHandle>,
    available: usize,
}

#[derive(Default)]
pub struct MaterialInstanceCache {
    records: Vec<Record>,
}

impl MaterialInstanceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find_or_insert(&mut self, material: MaterialHandle) -> usize {
        if let Some(index) = self.records.iter().position(|r| r.material == material) {
            return index;
        }
        self.records.push(Record {
            material,
            instances: Vec::new(),
            available: 0,
        });
        self.records.len() - 1
    }

    /// Hands back the next available instance for `material`, constructing
    /// one if the cursor has caught up to the end of the record.
    pub fn get_instance(
        &mut self,
        material: MaterialHandle,
        materials: &ResourceList<Material>,
        instances: &mut ResourceList<MaterialInstance>,
    ) -> (MaterialInstanceHandle, usize) {
        let record_index = self.find_or_insert(material);
        let record = &mut self.records[record_index];
        if record.available == record.instances.len() {
            let fresh = new_instance_for(material, materials, instances);
            record.instances.push(fresh);
        }
        let fixed_index = record.available;
        record.available += 1;
        (record.instances[fixed_index], fixed_index)
    }

    /// Looks up the instance at a previously-handed-out `fixed_index`
    /// without touching the cursor, so multiple frame-graph passes can
    /// cooperate on one shared instance within a frame.
    #[must_use]
    pub fn get_fixed_instance(&self, material: MaterialHandle, fixed_index: usize) -> Option<MaterialInstanceHandle> {
        self.records
            .iter()
            .find(|r| r.material == material)?
            .instances
            .get(fixed_index)
            .copied()
    }

    /// Removes `material`'s record entirely and hands back every instance
    /// it had cached, so the caller (the engine, on material destruction)
    /// can cascade the destroy through them.
    pub fn take_instances_for(&mut self, material: MaterialHandle) -> Vec<MaterialInstanceHandle> {
        let Some(index) = self.records.iter().position(|r| r.material == material) else {
            return Vec::new();
        };
        self.records.remove(index).instances
    }

    /// Resets every record's cursor to the start. Called once per frame.
    pub fn reset(&mut self) {
        for record in &mut self.records {
            record.available = 0;
        }
    }

    /// Destroys every cached instance.
    pub fn terminate(&mut self, instances: &mut ResourceList<MaterialInstance>) {
        for record in self.records.drain(..) {
            for handle in record.instances {
                instances.remove(handle);
            }
        }
    }
}

fn new_instance_for(
    material: MaterialHandle,
    materials: &ResourceList<Material>,
    instances: &mut ResourceList<MaterialInstance>,
) -> MaterialInstanceHandle {
    let (size, sort_key) = materials
        .get(material)
        .map_or((0, 0), |m| (m.default_instance().uniform_buffer.size(), m.default_instance().sorting_key()));
    instances.insert(MaterialInstance::new(material, size, sort_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{CullingMode, DepthFunc, RasterState};
    use crate::material::{BlendingMode, MaterialDescriptor, TransparencyMode};

    fn make_material(materials: &mut ResourceList<Material>) -> MaterialHandle {
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
            uniform_buffer_size: 32,
        };
        materials.insert_with(|h| Material::new(descriptor, h, 0))
    }

    #[test]
    fn get_instance_grows_the_record_then_reuses_after_reset() {
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let mut instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");
        let mut cache = MaterialInstanceCache::new();
        let material = make_material(&mut materials);

        let (first, first_index) = cache.get_instance(material, &materials, &mut instances);
        let (second, second_index) = cache.get_instance(material, &materials, &mut instances);
        assert_ne!(first, second);
        assert_eq!((first_index, second_index), (0, 1));
        assert_eq!(instances.len(), 2);

        cache.reset();
        let (reused, reused_index) = cache.get_instance(material, &materials, &mut instances);
        assert_eq!(reused, first);
        assert_eq!(reused_index, 0);
        assert_eq!(instances.len(), 2, "reset must reuse existing instances, not grow");
    }

    #[test]
    fn get_fixed_instance_does_not_advance_the_cursor() {
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let mut instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");
        let mut cache = MaterialInstanceCache::new();
        let material = make_material(&mut materials);

        let (handle, index) = cache.get_instance(material, &materials, &mut instances);
        assert_eq!(cache.get_fixed_instance(material, index), Some(handle));
        assert_eq!(cache.get_fixed_instance(material, index), Some(handle));
    }
}
