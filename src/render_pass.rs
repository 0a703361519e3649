//! Render-pass command generation, sort, automatic instancing, and
//! execution (spec §4.2 "Generation", "Sort", "Instancify", "Execute").
//!
//! `generate` fans command building for disjoint renderable chunks out
//! across [`crate::jobs::parallel_for_renderables`]; rather than writing
//! into statically-sized, prefix-summed sub-slices of one shared buffer
//! (which needs `unsafe` to split a `Vec` into disjoint `&mut` chunks of
//! variable length), each worker builds its own local `Vec` and the
//! results are merged in chunk order once all workers join. A renderable
//! whose visibility mask misses the pass, or whose primitive has no valid
//! material instance, is simply omitted rather than padded with a
//! sentinel — the later sort+truncate step this crate's source used to
//! recover slot alignment has nothing to recover here.

use glam::Vec3;
use parking_lot::Mutex;

use crate::driver::{
    BufferBinding, BufferDescriptor, BufferHandle, BufferUsage, DescriptorSetHandle, Driver,
    PipelineState, PrimitiveHandle, ShaderStage, Viewport,
};
use crate::key::{
    CommandDescriptor, CullingMode, DepthFunc, DrawKeyFields, Pass, RasterState, pack_custom_key,
    pack_draw_key,
};
use crate::material::{
    BlendingMode, CompilePriority, Material, MaterialInstance, MaterialInstanceHandle,
    TransparencyMode, VariantKey,
};
use crate::renderable::{MAX_INSTANCES, Primitive, RenderableManager};
use crate::resource_list::ResourceList;
use crate::scene::{Scene, VisibleMask};

bitflags::bitflags! {
    /// Which kinds of commands a render pass should emit per renderable
    /// (spec §4.2's generation inputs).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandTypeFlags: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const DEPTH_CONTAINS_SHADOW_CASTERS = 1 << 2;
        const FILTER_TRANSLUCENT = 1 << 3;
        const DEPTH_FILTER_ALPHA_MASKED = 1 << 4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenderFlags: u8 {
        const HAS_SHADOWING = 1 << 0;
        const HAS_INVERSE_FRONT_FACES = 1 << 1;
        const IS_INSTANCED_STEREO = 1 << 2;
        const HAS_DEPTH_CLAMP = 1 << 3;
    }
}

/// Everything [`RenderPass::generate`] needs that isn't carried by the
/// scene SoA or the renderable manager (spec §4.2).
pub struct RenderPassInputs<'a> {
    pub scene: &'a Scene,
    pub range: std::ops::Range<usize>,
    pub command_types: CommandTypeFlags,
    pub render_flags: RenderFlags,
    pub pass_visibility_mask: VisibleMask,
    pub variant: VariantKey,
    pub camera_position: Vec3,
    pub camera_forward: Vec3,
    pub pass_scissor: Option<Viewport>,
}

#[derive(Debug, Clone, Copy)]
enum CommandSlot {
    Draw(CommandDescriptor),
    Custom,
}

/// A built, sorted (and optionally instanced) sequence of draw commands
/// for one view/pass combination, ready for [`RenderPass::execute`].
/// Stereo rendering always draws exactly two eyes per instance (spec
/// §4.2/§8 "times eyeCount when stereo").
const EYE_COUNT: u32 = 2;

pub struct RenderPass {
    commands: Vec<(u64, CommandSlot)>,
    pass_scissor: Option<Viewport>,
    custom_count: u32,
    transient_buffers: Vec<BufferHandle>,
    transient_descriptor_sets: Vec<DescriptorSetHandle>,
    is_instanced_stereo: bool,
}

impl RenderPass {
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Walks every visible renderable in `inputs.range`, building one or
    /// two commands per primitive depending on blending mode and the
    /// requested command types. Chunks of
    /// [`crate::jobs::JOBS_PARALLEL_FOR_COMMANDS_COUNT`] renderables are
    /// built concurrently; `prepareProgram` is then called once per
    /// command on the calling thread, since compiling a program may
    /// submit to the backend.
    #[must_use]
    pub fn generate(
        inputs: &RenderPassInputs,
        renderables: &RenderableManager,
        materials: &mut ResourceList<Material>,
        material_instances: &ResourceList<MaterialInstance>,
    ) -> RenderPass {
        let count = inputs.range.len();
        let range_start = inputs.range.start;
        let chunk_size = crate::jobs::JOBS_PARALLEL_FOR_COMMANDS_COUNT;
        let chunk_count = count.div_ceil(chunk_size).max(1);
        let results: Mutex<Vec<Vec<(u64, CommandSlot)>>> = Mutex::new(vec![Vec::new(); chunk_count]);

        {
            let materials_ref: &ResourceList<Material> = materials;
            crate::jobs::parallel_for_renderables(count, |start, len| {
                let mut local = Vec::new();
                for offset in 0..len {
                    let visible_index = range_start + start + offset;
                    generate_for_renderable(inputs, renderables, materials_ref, material_instances, visible_index, &mut local);
                }
                results.lock()[start / chunk_size] = local;
            });
        }

        let commands: Vec<(u64, CommandSlot)> = results.into_inner().into_iter().flatten().collect();

        for (_, slot) in &commands {
            if let CommandSlot::Draw(descriptor) = slot {
                if let Some(instance) = material_instances.get(descriptor.material_instance) {
                    if let Some(material) = materials.get_mut(instance.material) {
                        material.prepare_program(VariantKey(u16::from(descriptor.variant)), CompilePriority::Critical);
                    }
                }
            }
        }

        RenderPass {
            commands,
            pass_scissor: inputs.pass_scissor,
            custom_count: 0,
            transient_buffers: Vec::new(),
            transient_descriptor_sets: Vec::new(),
            is_instanced_stereo: inputs.render_flags.contains(RenderFlags::IS_INSTANCED_STEREO),
        }
    }

    /// Appends a custom (non-draw) command, ordered by `pass`/`channel`
    /// then insertion order. Returns the index the caller should use to
    /// find its callback in the vector passed to [`RenderPass::execute`].
    pub fn push_custom_command(&mut self, pass: Pass, channel: u8) -> u32 {
        let order = self.custom_count;
        self.custom_count += 1;
        self.commands.push((pack_custom_key(pass, channel, order), CommandSlot::Custom));
        order
    }

    /// Orders commands by their packed sort key (spec §4.1's field
    /// priority). Stability is not required (spec §4.2).
    pub fn sort(&mut self) {
        self.commands.sort_unstable_by_key(|(key, _)| *key);
    }

    /// Merges runs of adjacent, identically-keyed draw commands into one
    /// instanced draw (spec §4.2 "Instancify"). Runs are capped at
    /// [`MAX_INSTANCES`]. Allocates one transient backend buffer and
    /// descriptor set per merged run, tracked for [`RenderPass::terminate`].
    pub fn instancify(&mut self, driver: &mut dyn Driver, material_instances: &ResourceList<MaterialInstance>) {
        let mut output = Vec::with_capacity(self.commands.len());
        let mut i = 0;
        while i < self.commands.len() {
            let (key, slot) = self.commands[i];
            let CommandSlot::Draw(first) = slot else {
                output.push((key, slot));
                i += 1;
                continue;
            };
            if !first.is_instanceable() {
                output.push((key, slot));
                i += 1;
                continue;
            }

            let batch_key = first.instancing_batch_key();
            let mut end = i + 1;
            while end < self.commands.len() && end - i < MAX_INSTANCES as usize {
                match self.commands[end].1 {
                    CommandSlot::Draw(next) if next.is_instanceable() && next.instancing_batch_key() == batch_key => end += 1,
                    _ => break,
                }
            }

            let run_len = end - i;
            if run_len == 1 {
                output.push((key, slot));
                i += 1;
                continue;
            }

            let mut staging = Vec::new();
            for (_, run_slot) in &self.commands[i..end] {
                let CommandSlot::Draw(cmd) = run_slot else { unreachable!() };
                if let Some(instance) = material_instances.get(cmd.material_instance) {
                    staging.extend_from_slice(instance.uniform_buffer.as_bytes());
                }
            }
            let per_instance_size = material_instances
                .get(first.material_instance)
                .map_or(0, |mi| mi.uniform_buffer.size()) as u64;

            let transient_buffer = driver.create_buffer_object(staging.len() as u64, BufferBinding::Uniform, BufferUsage::DYNAMIC);
            driver.update_buffer_object_unsynchronized(transient_buffer, BufferDescriptor { bytes: staging }, 0);
            let transient_set = driver.create_descriptor_set(crate::driver::DescriptorSetLayoutHandle::default());
            driver.update_descriptor_set_buffer(transient_set, 0, transient_buffer, 0, per_instance_size * run_len as u64);
            self.transient_buffers.push(transient_buffer);
            self.transient_descriptor_sets.push(transient_set);

            let eye_count = if self.is_instanced_stereo { EYE_COUNT } else { 1 };
            let mut rewritten = first;
            rewritten.instance_count = run_len as u32 * eye_count;
            rewritten.ubo_index = 0;
            rewritten.descriptor_set = transient_set;
            output.push((key, CommandSlot::Draw(rewritten)));
            i = end;
        }
        self.commands = output;
    }

    /// Walks the (sorted, possibly instanced) command sequence, binding
    /// only what changed since the previous command (spec §4.2
    /// "Execute"), flushing the driver every `minCommandBufferSize /
    /// maxEncodedCommandSize` commands. `custom_commands[i]` is invoked
    /// for the custom command [`RenderPass::push_custom_command`] handed
    /// back index `i` for.
    pub fn execute(
        &self,
        materials: &ResourceList<Material>,
        material_instances: &ResourceList<MaterialInstance>,
        driver: &mut dyn Driver,
        per_view_descriptor_set: Option<DescriptorSetHandle>,
        view_scissor: Viewport,
        custom_commands: &[&dyn Fn(&mut dyn Driver)],
    ) {
        const MIN_COMMAND_BUFFER_SIZE: usize = 4096;
        const MAX_ENCODED_COMMAND_SIZE: usize = 64;
        let flush_every = (MIN_COMMAND_BUFFER_SIZE / MAX_ENCODED_COMMAND_SIZE).max(1);

        if let Some(set) = per_view_descriptor_set {
            driver.bind_descriptor_set(set, 0, &[]);
        }

        let mut last_pipeline: Option<PipelineState> = None;
        let mut last_primitive: Option<PrimitiveHandle> = None;
        let mut last_material_instance: Option<MaterialInstanceHandle> = None;
        let mut last_scissor: Option<Viewport> = None;
        let mut since_flush = 0usize;
        let mut custom_index = 0usize;

        for (_, slot) in &self.commands {
            let CommandSlot::Draw(cmd) = slot else {
                if let Some(callback) = custom_commands.get(custom_index) {
                    callback(driver);
                }
                custom_index += 1;
                last_pipeline = None;
                last_primitive = None;
                last_material_instance = None;
                continue;
            };

            let Some(instance) = material_instances.get(cmd.material_instance) else {
                continue;
            };

            let scissor = compose_scissor(self.pass_scissor, instance.scissor, view_scissor);
            if last_scissor != Some(scissor) {
                driver.scissor(scissor);
                last_scissor = Some(scissor);
            }

            last_material_instance = Some(cmd.material_instance);

            let program = materials
                .get(instance.material)
                .and_then(|material| material.get_program(VariantKey(u16::from(cmd.variant))))
                .unwrap_or_default();
            let pipeline = PipelineState {
                program,
                vertex_buffer_info: cmd.vertex_buffer_info,
                raster_state: cmd.raster_state,
            };
            if last_pipeline != Some(pipeline) {
                driver.bind_pipeline(pipeline);
                last_pipeline = Some(pipeline);
            }

            if last_primitive != Some(cmd.primitive) {
                driver.bind_render_primitive(cmd.primitive);
                last_primitive = Some(cmd.primitive);
            }

            driver.bind_descriptor_set(cmd.descriptor_set, 1, &[cmd.ubo_index, cmd.skinning_offset]);

            if cmd.has_morphing {
                driver.set_push_constant(ShaderStage::Vertex, 0, cmd.morphing_offset);
            }

            driver.draw2(cmd.index_offset, cmd.index_count, cmd.instance_count.max(1));

            since_flush += 1;
            if since_flush >= flush_every {
                driver.flush();
                since_flush = 0;
            }
        }

        if since_flush > 0 {
            driver.flush();
        }
    }

    /// Frees every transient buffer/descriptor set [`RenderPass::instancify`]
    /// allocated. Must be called before the pass is dropped — `Driver`
    /// calls can't happen from a destructor.
    pub fn terminate(&mut self, driver: &mut dyn Driver) {
        for buffer in self.transient_buffers.drain(..) {
            driver.destroy_buffer_object(buffer);
        }
        for set in self.transient_descriptor_sets.drain(..) {
            driver.destroy_descriptor_set(set);
        }
    }
}

fn generate_for_renderable(
    inputs: &RenderPassInputs,
    renderables: &RenderableManager,
    materials: &ResourceList<Material>,
    material_instances: &ResourceList<MaterialInstance>,
    visible_index: usize,
    out: &mut Vec<(u64, CommandSlot)>,
) {
    let scene = inputs.scene;
    if !scene.visible_mask(visible_index).intersects(inputs.pass_visibility_mask) {
        return;
    }

    let renderable_instance = scene.renderable(visible_index);
    let visibility = scene.visibility(visible_index);
    let world_center = scene.world_center(visible_index);
    let depth = -(inputs.camera_forward.dot(world_center) - inputs.camera_forward.dot(inputs.camera_position));
    let channel = scene.channel(visible_index);
    let priority = visibility.priority();
    let descriptor_set = scene.descriptor_set(visible_index);
    let skinning = scene.skinning(visible_index);
    let morphing = scene.morphing(visible_index);
    let instancing = scene.instancing(visible_index);

    let base_variant = inputs
        .variant
        .with_bit(VariantKey::SKINNING_OR_MORPHING, visibility.skinning_on() || visibility.morphing_on())
        .with_bit(VariantKey::FOG, visibility.fog());

    for primitive in renderables.primitives(renderable_instance) {
        if !material_instances.is_valid(primitive.material_instance) {
            log::warn!("dropping primitive with a stale material instance");
            continue;
        }
        let instance = material_instances.get(primitive.material_instance).unwrap();
        let Some(material) = materials.get(instance.material) else {
            log::warn!("dropping primitive whose material was destroyed");
            continue;
        };

        let variant = base_variant.with_bit(
            VariantKey::SHADOW_RECEIVER,
            visibility.receives_shadows() && inputs.render_flags.contains(RenderFlags::HAS_SHADOWING) && !material.is_ssr_variant,
        );

        let raster_state = RasterState {
            culling: instance.culling_color_pass,
            color_write: instance.color_write,
            depth_write: instance.depth_write,
            depth_func: instance.depth_func,
            inverse_front_faces: inputs.render_flags.contains(RenderFlags::HAS_INVERSE_FRONT_FACES),
            depth_clamp: inputs.render_flags.contains(RenderFlags::HAS_DEPTH_CLAMP),
        };

        let descriptor = CommandDescriptor {
            material_instance: primitive.material_instance,
            primitive: primitive.primitive,
            vertex_buffer_info: primitive.vertex_buffer_info,
            index_offset: primitive.index_offset,
            index_count: primitive.index_count,
            ubo_index: visible_index as u32,
            descriptor_set,
            skinning_offset: skinning.map_or(0, |s| s.offset),
            morphing_offset: primitive.morphing_offset,
            primitive_type: primitive.primitive_type,
            raster_state,
            variant: (variant.0 & 0x7F) as u8,
            instance_count: instancing.map_or(1, |i| i.instance_count.max(1)),
            has_morphing: morphing.is_some(),
            has_skinning: skinning.is_some(),
            has_hybrid_instancing: instancing.is_some(),
        };

        if inputs.command_types.contains(CommandTypeFlags::COLOR) {
            push_color_commands(material, instance, primitive, descriptor, depth, channel, priority, out);
        }
        if inputs.command_types.contains(CommandTypeFlags::DEPTH) {
            push_depth_command(material, instance, primitive, descriptor, depth, channel, priority, inputs, out);
        }
    }
}

fn push_color_commands(
    material: &Material,
    instance: &MaterialInstance,
    primitive: &Primitive,
    descriptor: CommandDescriptor,
    depth: f32,
    channel: u8,
    priority: u8,
    out: &mut Vec<(u64, CommandSlot)>,
) {
    let material_key = instance.sorting_key();
    let pass = if matches!(material.blending_mode, BlendingMode::Opaque | BlendingMode::Masked) {
        Pass::Color
    } else if material.uses_screen_space_refraction {
        Pass::Refract
    } else {
        Pass::Blended
    };
    let cancelled = matches!(descriptor.raster_state.culling, CullingMode::FrontAndBack);

    match instance.transparency_mode {
        TransparencyMode::TwoPassesOneSide if pass != Pass::Color => {
            let mut first = descriptor;
            first.raster_state.color_write = false;
            first.raster_state.depth_write = true;
            out.push((
                pack_draw_key(DrawKeyFields {
                    pass,
                    channel,
                    priority,
                    material_key,
                    variant: first.variant,
                    depth,
                    blend_order: primitive.blend_order,
                    two_pass: false,
                    cancelled,
                }),
                CommandSlot::Draw(first),
            ));

            let mut second = descriptor;
            second.raster_state.depth_func = DepthFunc::Ge;
            out.push((
                pack_draw_key(DrawKeyFields {
                    pass,
                    channel,
                    priority,
                    material_key,
                    variant: second.variant,
                    depth,
                    blend_order: primitive.blend_order,
                    two_pass: true,
                    cancelled,
                }),
                CommandSlot::Draw(second),
            ));
        }
        TransparencyMode::TwoPassesTwoSides if pass != Pass::Color => {
            let mut first = descriptor;
            first.raster_state.culling = CullingMode::Front;
            out.push((
                pack_draw_key(DrawKeyFields {
                    pass,
                    channel,
                    priority,
                    material_key,
                    variant: first.variant,
                    depth,
                    blend_order: primitive.blend_order,
                    two_pass: false,
                    cancelled: false,
                }),
                CommandSlot::Draw(first),
            ));

            let mut second = descriptor;
            second.raster_state.culling = CullingMode::Back;
            out.push((
                pack_draw_key(DrawKeyFields {
                    pass,
                    channel,
                    priority,
                    material_key,
                    variant: second.variant,
                    depth,
                    blend_order: primitive.blend_order,
                    two_pass: true,
                    cancelled: false,
                }),
                CommandSlot::Draw(second),
            ));
        }
        _ => {
            out.push((
                pack_draw_key(DrawKeyFields {
                    pass,
                    channel,
                    priority,
                    material_key,
                    variant: descriptor.variant,
                    depth,
                    blend_order: primitive.blend_order,
                    two_pass: false,
                    cancelled,
                }),
                CommandSlot::Draw(descriptor),
            ));
        }
    }
}

fn push_depth_command(
    material: &Material,
    instance: &MaterialInstance,
    primitive: &Primitive,
    mut descriptor: CommandDescriptor,
    depth: f32,
    channel: u8,
    priority: u8,
    inputs: &RenderPassInputs,
    out: &mut Vec<(u64, CommandSlot)>,
) {
    if inputs.command_types.contains(CommandTypeFlags::DEPTH_FILTER_ALPHA_MASKED) && material.blending_mode == BlendingMode::Masked {
        return;
    }
    if inputs.command_types.contains(CommandTypeFlags::FILTER_TRANSLUCENT)
        && matches!(
            material.blending_mode,
            BlendingMode::Transparent | BlendingMode::TransparentTwoPassesOneSide | BlendingMode::TransparentTwoPassesTwoSides
        )
    {
        return;
    }

    descriptor.raster_state.culling = instance.culling_shadow_pass;
    descriptor.raster_state.color_write = false;
    descriptor.raster_state.depth_write = true;
    let cancelled = matches!(descriptor.raster_state.culling, CullingMode::FrontAndBack);

    out.push((
        pack_draw_key(DrawKeyFields {
            pass: Pass::Depth,
            channel,
            priority,
            material_key: instance.sorting_key(),
            variant: descriptor.variant,
            depth,
            blend_order: primitive.blend_order,
            two_pass: false,
            cancelled,
        }),
        CommandSlot::Draw(descriptor),
    ));
}

/// A pass-level scissor override wins outright; otherwise the instance's
/// scissor is offset into the view's and clamped to it, all in 64-bit
/// arithmetic to avoid overflow on the additions (spec §4.2 "Execute").
fn compose_scissor(pass_override: Option<Viewport>, instance_scissor: Option<Viewport>, view: Viewport) -> Viewport {
    if let Some(v) = pass_override {
        return v;
    }
    let Some(instance) = instance_scissor else {
        return view;
    };

    let view_left = i64::from(view.left);
    let view_bottom = i64::from(view.bottom);
    let view_right = view_left + i64::from(view.width);
    let view_top = view_bottom + i64::from(view.height);

    let left = (view_left + i64::from(instance.left)).clamp(view_left, view_right);
    let bottom = (view_bottom + i64::from(instance.bottom)).clamp(view_bottom, view_top);
    let right = (left + i64::from(instance.width)).clamp(left, view_right);
    let top = (bottom + i64::from(instance.height)).clamp(bottom, view_top);

    Viewport {
        left: left.max(0) as i32,
        bottom: bottom.max(0) as i32,
        width: (right - left).max(0) as u32,
        height: (top - bottom).max(0) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockDriver, RecordedCall};
    use crate::driver::DescriptorSetLayoutHandle;
    use crate::entity::EntityManager;
    use crate::key::{CullingMode, DepthFunc, PrimitiveType, RasterState};
    use crate::material::{MaterialDescriptor, MaterialHandle};
    use crate::renderable::{Aabb, RenderableBuilder};
    use crate::scene::VisibleRenderable;
    use slotmap::SlotMap;

    fn a_material(materials: &mut ResourceList<Material>) -> MaterialHandle {
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

    fn a_primitive_using(material_instance: MaterialInstanceHandle) -> Primitive {
        let mut primitives: SlotMap<crate::driver::PrimitiveHandle, ()> = SlotMap::with_key();
        let mut vbis: SlotMap<crate::driver::VertexBufferInfoHandle, ()> = SlotMap::with_key();
        Primitive {
            material_instance,
            primitive: primitives.insert(()),
            vertex_buffer_info: vbis.insert(()),
            index_offset: 0,
            index_count: 36,
            blend_order: 0,
            primitive_type: PrimitiveType::Triangles,
            enabled_attributes: 0,
            global_blend_order: false,
            morphing_offset: 0,
        }
    }

    fn builder_with_one_primitive(layout: DescriptorSetLayoutHandle, material_instance: MaterialInstanceHandle) -> RenderableBuilder {
        let mut builder = RenderableBuilder::new(layout);
        builder.aabb = Aabb {
            center: [0.0; 3],
            half_extents: [1.0; 3],
        };
        builder.primitives.push(a_primitive_using(material_instance));
        builder
    }

    struct Fixture {
        materials: ResourceList<Material>,
        material_instances: ResourceList<MaterialInstance>,
        renderables: RenderableManager,
        scene: Scene,
        driver: MockDriver,
    }

    fn two_renderable_fixture(shared_material_instance: bool) -> Fixture {
        let mut driver = MockDriver::default();
        let mut materials: ResourceList<Material> = ResourceList::new("Material");
        let mut material_instances: ResourceList<MaterialInstance> = ResourceList::new("MaterialInstance");
        let mut entities = EntityManager::new();
        let mut renderables = RenderableManager::new();

        let material = a_material(&mut materials);
        let mi_a = material_instances.insert(MaterialInstance::new(material, 32, 7));
        let mi_b = if shared_material_instance { mi_a } else { material_instances.insert(MaterialInstance::new(material, 32, 7)) };

        let layout = DescriptorSetLayoutHandle::default();
        let e1 = entities.create();
        let e2 = entities.create();
        let r1 = renderables.create(e1, builder_with_one_primitive(layout, mi_a), &mut driver).unwrap();
        let r2 = renderables.create(e2, builder_with_one_primitive(layout, mi_b), &mut driver).unwrap();

        let mut scene = Scene::new();
        scene.prepare(
            &[
                VisibleRenderable {
                    instance: r1,
                    world_center: Vec3::new(0.0, 0.0, -5.0),
                    visible_mask: VisibleMask(1),
                },
                VisibleRenderable {
                    instance: r2,
                    world_center: Vec3::new(0.0, 0.0, -1.0),
                    visible_mask: VisibleMask(1),
                },
            ],
            &renderables,
        );

        Fixture {
            materials,
            material_instances,
            renderables,
            scene,
            driver,
        }
    }

    fn base_inputs(scene: &Scene) -> RenderPassInputs<'_> {
        RenderPassInputs {
            scene,
            range: 0..scene.len(),
            command_types: CommandTypeFlags::COLOR,
            render_flags: RenderFlags::empty(),
            pass_visibility_mask: VisibleMask(1),
            variant: VariantKey::default(),
            camera_position: Vec3::ZERO,
            camera_forward: Vec3::new(0.0, 0.0, -1.0),
            pass_scissor: None,
        }
    }

    #[test]
    fn generate_then_sort_produces_one_draw_per_renderable() {
        let mut fx = two_renderable_fixture(false);
        let inputs = base_inputs(&fx.scene);
        let mut pass = RenderPass::generate(&inputs, &fx.renderables, &mut fx.materials, &fx.material_instances);
        pass.sort();

        assert_eq!(pass.len(), 2);
        for (_, slot) in &pass.commands {
            assert!(matches!(slot, CommandSlot::Draw(_)));
        }
    }

    #[test]
    fn invisible_renderable_is_skipped() {
        let mut fx = two_renderable_fixture(false);
        let mut inputs = base_inputs(&fx.scene);
        inputs.pass_visibility_mask = VisibleMask(0b10);
        let pass = RenderPass::generate(&inputs, &fx.renderables, &mut fx.materials, &fx.material_instances);
        assert!(pass.is_empty());
    }

    #[test]
    fn instancify_merges_matching_adjacent_draws() {
        let mut fx = two_renderable_fixture(true);
        let inputs = base_inputs(&fx.scene);
        let mut pass = RenderPass::generate(&inputs, &fx.renderables, &mut fx.materials, &fx.material_instances);
        pass.sort();
        pass.instancify(&mut fx.driver, &fx.material_instances);

        assert_eq!(pass.len(), 1);
        let CommandSlot::Draw(merged) = pass.commands[0].1 else { panic!("expected a draw") };
        assert_eq!(merged.instance_count, 2);
        assert_eq!(pass.transient_buffers.len(), 1);
        assert_eq!(pass.transient_descriptor_sets.len(), 1);

        pass.terminate(&mut fx.driver);
        assert!(pass.transient_buffers.is_empty());
    }

    #[test]
    fn instancify_multiplies_instance_count_by_eye_count_when_stereo() {
        let mut fx = two_renderable_fixture(true);
        let mut inputs = base_inputs(&fx.scene);
        inputs.render_flags = RenderFlags::IS_INSTANCED_STEREO;
        let mut pass = RenderPass::generate(&inputs, &fx.renderables, &mut fx.materials, &fx.material_instances);
        pass.sort();
        pass.instancify(&mut fx.driver, &fx.material_instances);

        assert_eq!(pass.len(), 1);
        let CommandSlot::Draw(merged) = pass.commands[0].1 else { panic!("expected a draw") };
        assert_eq!(merged.instance_count, 2 * EYE_COUNT);

        pass.terminate(&mut fx.driver);
    }

    #[test]
    fn execute_binds_and_draws_each_command() {
        let mut fx = two_renderable_fixture(false);
        let inputs = base_inputs(&fx.scene);
        let mut pass = RenderPass::generate(&inputs, &fx.renderables, &mut fx.materials, &fx.material_instances);
        pass.sort();

        pass.execute(&fx.materials, &fx.material_instances, &mut fx.driver, None, Viewport::default(), &[]);

        let draws = fx.driver.calls.iter().filter(|c| matches!(c, RecordedCall::Draw2 { .. })).count();
        assert_eq!(draws, 2);
    }

    #[test]
    fn scissor_composition_falls_back_to_view_without_an_instance_override() {
        let view = Viewport {
            left: 10,
            bottom: 20,
            width: 100,
            height: 200,
        };
        assert_eq!(compose_scissor(None, None, view), view);
    }

    #[test]
    fn pass_level_scissor_override_wins() {
        let view = Viewport {
            left: 0,
            bottom: 0,
            width: 100,
            height: 100,
        };
        let pass_override = Viewport {
            left: 1,
            bottom: 2,
            width: 3,
            height: 4,
        };
        let instance = Viewport {
            left: 50,
            bottom: 50,
            width: 10,
            height: 10,
        };
        assert_eq!(compose_scissor(Some(pass_override), Some(instance), view), pass_override);
    }
}
