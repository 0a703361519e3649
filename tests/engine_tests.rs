//! Engine Integration Tests
//!
//! Tests for:
//! - Entity/transform/renderable lifecycle wired through `Engine`
//! - Material + material-instance acquire/destroy cascade
//! - Frame sequencing (begin_frame / end_frame) and per-frame GC
//! - A full generate -> sort -> instancify -> execute pass over the engine

use forge_render::backend::mock::MockDriver;
use forge_render::driver::TextureDescriptor;
use forge_render::engine::Engine;
use forge_render::key::{CullingMode, DepthFunc, PrimitiveType, RasterState};
use forge_render::material::{BlendingMode, MaterialDescriptor, TransparencyMode};
use forge_render::render_pass::{CommandTypeFlags, RenderFlags, RenderPass, RenderPassInputs};
use forge_render::renderable::{Aabb, Primitive, RenderableBuilder};
use forge_render::scene::{Scene, VisibleMask, VisibleRenderable};
use forge_render::transform::TransformInstance;
use glam::Vec3;
use slotmap::SlotMap;

fn an_engine() -> Engine {
    Engine::new(Box::new(MockDriver::new()), 1024, 256)
}

fn a_material_descriptor() -> MaterialDescriptor {
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

fn builder_with_one_primitive(material_instance: forge_render::material::MaterialInstanceHandle) -> RenderableBuilder {
    let mut primitives: SlotMap<forge_render::driver::PrimitiveHandle, ()> = SlotMap::with_key();
    let mut vbis: SlotMap<forge_render::driver::VertexBufferInfoHandle, ()> = SlotMap::with_key();
    let mut builder = RenderableBuilder::new(forge_render::driver::DescriptorSetLayoutHandle::default());
    builder.aabb = Aabb {
        center: [0.0; 3],
        half_extents: [1.0; 3],
    };
    builder.primitives.push(Primitive {
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
    });
    builder
}

#[test]
fn entity_destroy_is_reflected_by_gc_on_transforms_and_renderables() {
    let mut engine = an_engine();
    let material = engine.create_material(a_material_descriptor());
    let (instance, _) = engine.acquire_material_instance(material);

    let entity = engine.create_entity();
    engine.transforms.create(entity, TransformInstance::NONE);
    engine
        .create_renderable(entity, builder_with_one_primitive(instance))
        .unwrap();

    engine.destroy_entity(entity);
    engine.gc();

    assert!(engine.transforms.instance_for(entity).is_none());
}

#[test]
fn destroying_a_material_invalidates_instances_acquired_from_it() {
    let mut engine = an_engine();
    let material = engine.create_material(a_material_descriptor());
    let (first, _) = engine.acquire_material_instance(material);
    let (second, _) = engine.acquire_material_instance(material);
    assert_ne!(first, second);

    engine.destroy_material(material).unwrap();
    assert!(!engine.material_instances().is_valid(first));
    assert!(!engine.material_instances().is_valid(second));
}

#[test]
fn texture_lifecycle_round_trips_through_the_driver() {
    let mut engine = an_engine();
    let texture = engine.create_texture(TextureDescriptor {
        width: 16,
        height: 16,
        depth: 1,
        levels: 1,
        sample_count: 1,
    });
    assert!(engine.destroy_texture(texture).is_ok());
    assert!(engine.destroy_texture(texture).is_err(), "double destroy must fail");
}

#[test]
fn full_frame_generates_sorts_instances_and_executes_a_pass() {
    let mut engine = an_engine();
    let material = engine.create_material(a_material_descriptor());
    let (mi_a, _) = engine.acquire_material_instance(material);
    let (mi_b, _) = engine.acquire_material_instance(material);

    let e1 = engine.create_entity();
    let e2 = engine.create_entity();
    let r1 = engine.create_renderable(e1, builder_with_one_primitive(mi_a)).unwrap();
    let r2 = engine.create_renderable(e2, builder_with_one_primitive(mi_b)).unwrap();

    engine.begin_frame().unwrap();
    engine.finish_begin_frame();

    let mut scene = Scene::new();
    scene.prepare(
        &[
            VisibleRenderable {
                instance: r1,
                world_center: Vec3::new(0.0, 0.0, -3.0),
                visible_mask: VisibleMask(1),
            },
            VisibleRenderable {
                instance: r2,
                world_center: Vec3::new(0.0, 0.0, -6.0),
                visible_mask: VisibleMask(1),
            },
        ],
        &engine.renderables,
    );

    let inputs = RenderPassInputs {
        scene: &scene,
        range: 0..scene.len(),
        command_types: CommandTypeFlags::COLOR,
        render_flags: RenderFlags::empty(),
        pass_visibility_mask: VisibleMask(1),
        variant: forge_render::material::VariantKey::default(),
        camera_position: Vec3::ZERO,
        camera_forward: Vec3::new(0.0, 0.0, -1.0),
        pass_scissor: None,
    };

    let mut pass = RenderPass::generate(&inputs, &engine.renderables, engine.materials_mut(), engine.material_instances());
    pass.sort();
    assert_eq!(pass.len(), 2);

    let (driver, materials, instances) = engine.driver_and_lists();
    pass.instancify(driver, instances);
    pass.execute(materials, instances, driver, None, forge_render::driver::Viewport::default(), &[]);
    pass.terminate(driver);

    engine.end_frame();
}
