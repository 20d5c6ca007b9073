use aurora::{
    backend::{
        headless::{HeadlessDevice, RecordedCommand},
        shader_compiler::PassthroughShaderCompiler,
        AccelerationStructureType, Device,
    },
    materialx::{GeneratedMaterial, MaterialXCodeGenerator},
    properties,
    uniform_buffer::{UniformField, UniformType},
    GeometryDescriptor, ImageDescriptor, ImageFormat, InstanceDescriptor,
    PropertyValue, RenderBufferFormat, RenderError, Renderer, Scene, VertexData,
};
use glam::{Mat4, Vec2, Vec3};
use std::sync::Arc;

fn headless_renderer() -> (Arc<HeadlessDevice>, Renderer) {
    let headless = Arc::new(HeadlessDevice::new(3));
    let renderer = Renderer::new(
        Device::new(headless.clone()),
        Arc::new(PassthroughShaderCompiler),
        3,
    )
    .unwrap();
    (headless, renderer)
}

fn triangle() -> GeometryDescriptor {
    GeometryDescriptor::from_data(
        VertexData::new(&[Vec3::ZERO, Vec3::X, Vec3::Y]).texcoords(&[Vec2::ZERO, Vec2::X, Vec2::Y]),
    )
}

fn placed(x: f32) -> InstanceDescriptor {
    InstanceDescriptor::new("")
        .property("transform", Mat4::from_translation(Vec3::new(x, 0.0, 0.0)))
        .property("material", PropertyValue::Path("/materials/red".into()))
}

fn red_triangles(scene: &Scene, count: usize) -> Vec<String> {
    scene.set_geometry_descriptor("/geometry/tri", triangle()).unwrap();
    scene
        .set_material_properties(
            "/materials/red",
            &properties([("base_color", Vec3::new(1.0, 0.0, 0.0))]),
        )
        .unwrap();

    let descriptors: Vec<_> = (0..count).map(|i| placed(i as f32)).collect();
    let paths = scene.add_instances("/geometry/tri", &descriptors).unwrap();
    scene.set_bounds(Vec3::ZERO, Vec3::new(count as f32, 1.0, 0.0));
    paths
}

fn commands(headless: &HeadlessDevice) -> Vec<RecordedCommand> {
    headless
        .log()
        .submissions
        .into_iter()
        .flat_map(|submission| submission.commands)
        .collect()
}

fn ray_dispatches(headless: &HeadlessDevice) -> Vec<(u64, u64)> {
    commands(headless)
        .into_iter()
        .filter_map(|command| match command {
            RecordedCommand::DispatchRays {
                hit_group_records,
                miss_records,
                ..
            } => Some((hit_group_records, miss_records)),
            _ => None,
        })
        .collect()
}

fn tlas_sizes(headless: &HeadlessDevice) -> Vec<u32> {
    commands(headless)
        .into_iter()
        .filter_map(|command| match command {
            RecordedCommand::BuildAccelerationStructure {
                ty: AccelerationStructureType::TopLevel,
                primitive_count,
            } => Some(primitive_count),
            _ => None,
        })
        .collect()
}

#[test]
fn hundred_copies_of_one_instance_share_a_hit_record() {
    let (headless, mut renderer) = headless_renderer();
    let scene = renderer.create_scene().unwrap();
    red_triangles(&scene, 100);
    renderer.set_scene(scene.clone());

    let target = renderer
        .create_render_buffer(16, 16, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();
    renderer.render(0, 1).unwrap();

    assert_eq!(scene.unique_instance_count(), 1);
    assert_eq!(scene.unique_instance_indices(), vec![0; 100]);
    assert!(scene
        .tlas_instances()
        .iter()
        .all(|instance| instance.sbt_offset() == 0));
    assert_eq!(tlas_sizes(&headless), vec![100]);
    assert_eq!(ray_dispatches(&headless), vec![(1, 4)]);
}

#[test]
fn unique_records_follow_geometry_and_material() {
    let (headless, mut renderer) = headless_renderer();
    let scene = renderer.create_scene().unwrap();
    let paths = red_triangles(&scene, 4);

    scene
        .set_material_properties(
            "/materials/blue",
            &properties([("base_color", Vec3::new(0.0, 0.0, 1.0))]),
        )
        .unwrap();
    scene
        .set_instance_properties(
            &paths[..2],
            &properties([("material", PropertyValue::Path("/materials/blue".into()))]),
        )
        .unwrap();
    scene
        .add_instances("/geometry/tri", &[InstanceDescriptor::new("/instances/default")])
        .unwrap();
    renderer.set_scene(scene.clone());

    let target = renderer
        .create_render_buffer(8, 8, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();
    renderer.render(0, 1).unwrap();

    // Red, blue and the default material on one geometry.
    assert_eq!(scene.unique_instance_count(), 3);
    assert_eq!(scene.tlas_instances().len(), 5);
    assert_eq!(scene.hit_group_record_count(), 3);
    assert_eq!(ray_dispatches(&headless), vec![(3, 4)]);

    headless.clear_log();
    scene.remove_instances(&paths[2..]);
    renderer.render(1, 1).unwrap();

    assert_eq!(scene.unique_instance_count(), 2);
    assert_eq!(tlas_sizes(&headless), vec![3]);
    assert_eq!(ray_dispatches(&headless), vec![(2, 4)]);
}

#[test]
fn hidden_instances_are_not_traced() {
    let (headless, mut renderer) = headless_renderer();
    let scene = renderer.create_scene().unwrap();
    let paths = red_triangles(&scene, 3);
    scene
        .set_instance_properties(&paths[..1], &properties([("is_visible", false)]))
        .unwrap();
    renderer.set_scene(scene.clone());

    let target = renderer
        .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();
    renderer.render(0, 1).unwrap();

    assert_eq!(scene.instance_count(), 3);
    assert_eq!(tlas_sizes(&headless), vec![2]);
}

#[test]
fn tasks_advance_once_per_sample_and_once_for_the_frame() {
    let (headless, mut renderer) = headless_renderer();
    let scene = renderer.create_scene().unwrap();
    renderer.set_scene(scene);
    let target = renderer
        .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();

    // The empty scene still builds its top-level structure in a task.
    renderer.render(0, 4).unwrap();
    let after_first = renderer.task_number();
    assert_eq!(after_first, 1 + 4 + 1);

    renderer.render(4, 2).unwrap();
    assert_eq!(renderer.task_number(), after_first + 2 + 1);
    assert_eq!(renderer.frame_count(), 2);

    renderer.wait_for_task().unwrap();
    let log = headless.log();
    assert_eq!(log.fence_signals.last().copied(), Some(renderer.task_number()));
    assert!(log
        .submissions
        .iter()
        .all(|submission| submission.allocator_index < 3));
}

#[test]
fn targets_receive_the_final_and_depth_images() {
    let (headless, mut renderer) = headless_renderer();
    let scene = renderer.create_scene().unwrap();
    red_triangles(&scene, 1);
    renderer.set_scene(scene);

    let color = renderer
        .create_render_buffer(5, 3, RenderBufferFormat::Rgba8Srgb)
        .unwrap();
    let depth = renderer
        .create_render_buffer(5, 3, RenderBufferFormat::R32Float)
        .unwrap();
    renderer.set_targets(color.clone(), Some(depth.clone())).unwrap();
    renderer.render(0, 2).unwrap();
    renderer.wait_for_task().unwrap();

    let copies = commands(&headless)
        .into_iter()
        .filter(|command| matches!(command, RecordedCommand::CopyImage { .. }))
        .count();
    let readbacks = commands(&headless)
        .into_iter()
        .filter(|command| matches!(command, RecordedCommand::CopyImageToBuffer { .. }))
        .count();
    assert_eq!((copies, readbacks), (2, 2));

    let (stride, pixels) = color.data(true);
    assert_eq!(stride, 5 * 4);
    assert_eq!(pixels.len(), 5 * 3 * 4);
    let (stride, _) = depth.data(false);
    assert_eq!(stride, 5 * 4);
}

#[test]
fn resizing_the_target_recreates_the_outputs() {
    let (headless, mut renderer) = headless_renderer();
    renderer.set_scene(renderer.create_scene().unwrap());

    for (width, height) in [(8, 8), (32, 16)] {
        let target = renderer
            .create_render_buffer(width, height, RenderBufferFormat::Rgba16Float)
            .unwrap();
        renderer.set_targets(target, None).unwrap();
        renderer.render(0, 1).unwrap();
    }

    let extents: Vec<[u32; 3]> = commands(&headless)
        .into_iter()
        .filter_map(|command| match command {
            RecordedCommand::DispatchRays { extent, .. } => Some(extent),
            _ => None,
        })
        .collect();
    assert_eq!(extents, vec![[8, 8, 1], [32, 16, 1]]);
}

#[test]
fn option_changes_relink_the_pipeline() {
    let (headless, mut renderer) = headless_renderer();
    renderer.set_scene(renderer.create_scene().unwrap());
    let target = renderer
        .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();

    renderer.render(0, 1).unwrap();
    let linked = headless.log().ray_tracing_pipelines.len();
    renderer.render(1, 1).unwrap();
    assert_eq!(headless.log().ray_tracing_pipelines.len(), linked);

    renderer.set_option("trace_depth", 2).unwrap();
    renderer.render(0, 1).unwrap();
    let log = headless.log();
    assert_eq!(log.ray_tracing_pipelines.len(), linked + 1);
    assert_eq!(
        log.ray_tracing_pipelines
            .last()
            .map(|desc| desc.max_pipeline_ray_recursion_depth),
        Some(3)
    );

    assert!(renderer.set_option("trace_depth", "deep").is_err());
    assert!(renderer.set_option("no_such_option", true).is_err());
}

#[test]
fn environment_images_get_an_alias_map() {
    let (headless, mut renderer) = headless_renderer();
    let scene = renderer.create_scene().unwrap();
    red_triangles(&scene, 1);

    let sky: Vec<u8> = [1.0f32, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    scene
        .set_image_descriptor(
            "/images/sky",
            ImageDescriptor::from_pixels(ImageFormat::Rgba32Float, 2, 1, sky),
        )
        .unwrap();
    scene
        .set_environment_properties(
            "/environments/sky",
            &properties([("light_image", PropertyValue::Path("/images/sky".into()))]),
        )
        .unwrap();
    scene.set_environment("/environments/sky").unwrap();
    assert!(scene.set_environment("/environments/missing").is_err());

    let light = scene.add_light_pointer("distant").unwrap();
    light
        .set_properties(&properties([("direction", Vec3::new(0.0, -1.0, 0.0))]))
        .unwrap();
    assert!(scene.add_light_pointer("spot").is_err());

    renderer.set_scene(scene.clone());
    let target = renderer
        .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();
    renderer.render(0, 1).unwrap();

    let resources = scene.resources().unwrap();
    assert_eq!(resources.environment_alias_map.size, 2 * 16);
    assert_eq!(scene.lights().len(), 1);
    assert_eq!(ray_dispatches(&headless).len(), 1);
}

#[test]
fn denoising_adds_a_filter_pass_per_sample() {
    let (headless, mut renderer) = headless_renderer();
    renderer.set_option("is_denoising_enabled", true).unwrap();
    renderer.set_scene(renderer.create_scene().unwrap());
    let target = renderer
        .create_render_buffer(32, 8, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();
    renderer.render(0, 3).unwrap();

    let passes: Vec<String> = commands(&headless)
        .into_iter()
        .filter_map(|command| match command {
            RecordedCommand::Dispatch { pipeline, .. } => Some(pipeline),
            _ => None,
        })
        .collect();
    assert_eq!(
        passes,
        vec![
            "denoise",
            "accumulate",
            "denoise",
            "accumulate",
            "denoise",
            "accumulate",
            "post process",
        ]
    );
}

#[test]
fn a_failed_frame_invalidates_the_renderer() {
    let (_headless, mut renderer) = headless_renderer();
    let scene = renderer.create_scene().unwrap();
    red_triangles(&scene, 1);
    scene
        .set_geometry_descriptor(
            "/geometry/quad",
            GeometryDescriptor::from_data(
                VertexData::new(&[Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::ONE])
                    .indices(vec![0, 1, 2, 2, 1, 3]),
            ),
        )
        .unwrap();
    scene
        .add_instances(
            "/geometry/tri",
            &[InstanceDescriptor::new("/instances/layered")
                .property(
                    "material_layers",
                    PropertyValue::Strings(vec!["/materials/red".into()]),
                )
                .property(
                    "geometry_layers",
                    PropertyValue::Strings(vec!["/geometry/quad".into()]),
                )],
        )
        .unwrap();
    renderer.set_scene(scene);

    let target = renderer
        .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();

    assert!(matches!(
        renderer.render(0, 1),
        Err(RenderError::InvalidArgument { .. })
    ));
    assert!(!renderer.is_valid());
    assert!(matches!(
        renderer.render(0, 1),
        Err(RenderError::RendererInvalid)
    ));
}

#[test]
fn materialx_without_a_generator_falls_back_to_the_default() {
    let (_headless, mut renderer) = headless_renderer();
    let scene = renderer.create_scene().unwrap();
    red_triangles(&scene, 2);
    scene
        .set_material_type("/materials/red", "materialx", "<materialx version=\"1.38\"/>")
        .unwrap();
    assert!(scene
        .set_material_type("/materials/red", "no_such_type", "")
        .is_err());

    let material = renderer.create_material("built_in", "", "standalone").unwrap();
    assert_eq!(material.name(), "standalone");
    assert!(renderer.create_material("glsl", "", "broken").is_err());

    renderer.set_scene(scene.clone());
    let target = renderer
        .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();
    renderer.render(0, 1).unwrap();

    assert_eq!(scene.unique_instance_count(), 1);
}

struct TintGenerator;

impl MaterialXCodeGenerator for TintGenerator {
    fn generate(&self, document: &str) -> anyhow::Result<GeneratedMaterial> {
        Ok(GeneratedMaterial {
            source: format!("// {}\nvoid evaluate_material() {{}}\n", document),
            fields: vec![UniformField::new("tint", "tint", UniformType::Float3)],
            defaults: vec![PropertyValue::Float3(Vec3::ONE)],
            texture_names: vec![],
            is_always_opaque: true,
        })
    }
}

#[test]
fn changing_a_layer_material_type_relinks_its_layer_shader() {
    let (headless, mut renderer) = headless_renderer();
    renderer.set_materialx_generator(Some(Arc::new(TintGenerator)));
    let scene = renderer.create_scene().unwrap();
    red_triangles(&scene, 1);
    scene
        .set_material_properties(
            "/materials/coat",
            &properties([("base_color", Vec3::new(0.0, 1.0, 0.0))]),
        )
        .unwrap();
    scene
        .add_instances(
            "/geometry/tri",
            &[InstanceDescriptor::new("/instances/coated").property(
                "material_layers",
                PropertyValue::Strings(vec!["/materials/coat".into()]),
            )],
        )
        .unwrap();
    renderer.set_scene(scene.clone());

    let target = renderer
        .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
        .unwrap();
    renderer.set_targets(target, None).unwrap();
    renderer.render(0, 1).unwrap();

    scene
        .set_material_type("/materials/coat", "materialx", "<materialx version=\"1.38\"/>")
        .unwrap();
    renderer.render(1, 1).unwrap();
    assert!(renderer.is_valid());

    scene
        .set_material_type("/materials/coat", "built_in", "")
        .unwrap();
    renderer.render(2, 1).unwrap();

    assert!(renderer.is_valid());
    assert_eq!(scene.miss_record_count(), 5);
    assert_eq!(ray_dispatches(&headless), vec![(2, 5); 3]);
}
