use aurora::{
    alias_map::AliasMap,
    backend::{
        headless::HeadlessDevice,
        shader_compiler::PassthroughShaderCompiler,
        CommandList, Device,
    },
    context::RenderContext,
    geometry::MeshData,
    material::Material,
    properties,
    shader_library::{CompileState, EntryPoint, MaterialShaderDefinition, ShaderLibrary},
    standard_surface,
    task::TaskScheduler,
    uniform_buffer::{UniformBufferDefinition, UniformField, UniformType},
    PropertyValue, VertexData,
};
use glam::{Vec2, Vec3, Vec4};
use std::{f32::consts::PI, sync::Arc};

fn headless_context() -> (Arc<HeadlessDevice>, Arc<RenderContext>) {
    let headless = Arc::new(HeadlessDevice::new(3));
    let ctx = RenderContext::new(
        Device::new(headless.clone()),
        Arc::new(PassthroughShaderCompiler),
        3,
    );
    (headless, ctx)
}

#[test]
fn uniform_fields_never_straddle_a_register() {
    let definition = UniformBufferDefinition::new(&[
        UniformField::new("a", "a", UniformType::Float),
        UniformField::new("b", "b", UniformType::Float3),
        UniformField::new("c", "c", UniformType::Float2),
        UniformField::new("d", "d", UniformType::Float3),
        UniformField::new("e", "e", UniformType::Bool),
        UniformField::new("f", "f", UniformType::Float4),
    ]);

    assert_eq!(definition.size() % 16, 0);
    for (field, offset) in definition.declared_fields() {
        let size = field.ty.size();
        assert_eq!(
            offset / 16,
            (offset + size - 1) / 16,
            "{} at {} crosses a 16-byte boundary",
            field.name,
            offset
        );
    }
}

#[test]
fn two_pixel_environment_puts_all_weight_on_the_lit_pixel() {
    let map = AliasMap::build(&[1.0, 1.0, 1.0, 0.0, 0.0, 0.0], 2, 1, 3);

    assert!((map.luminance_integral - PI).abs() < 1e-5);
    assert!((map.entries[0].pdf - 1.0 / PI).abs() < 1e-6);
    assert_eq!(map.entries[1].pdf, 0.0);
    assert_eq!(map.entries[1].alias, 0);
    assert_eq!(map.as_bytes().len(), 2 * 16);

    for u in [0.0, 0.3, 0.6, 0.99] {
        assert_eq!(map.sample([u, 0.5]), 0);
    }
}

#[test]
fn seven_tasks_on_three_allocators() {
    let headless = Arc::new(HeadlessDevice::new(3));
    let mut tasks = TaskScheduler::new(Device::new(headless.clone()), 3);

    for _ in 0..7 {
        tasks.command_list();
        tasks.complete_task().unwrap();
    }
    tasks.wait_for_task().unwrap();

    let log = headless.log();
    assert_eq!(log.fence_signals, (1..=7).collect::<Vec<u64>>());
    let slot_zero_resets: Vec<u64> = log
        .allocator_resets
        .iter()
        .enumerate()
        .filter(|(_, slot)| **slot == 0)
        .map(|(task, _)| task as u64 + 1)
        .collect();
    assert_eq!(slot_zero_resets, vec![3, 6]);
    assert!(log.fence_waits.last().copied().unwrap_or(0) >= 5);
}

#[test]
fn material_changes_upload_once() {
    let (_headless, ctx) = headless_context();
    let mut material = Material::new(
        ctx.clone(),
        "/materials/orange",
        Arc::new(standard_surface::material_definition()),
    );

    material
        .set("base_color", &PropertyValue::from(Vec3::new(1.0, 0.5, 0.2)))
        .unwrap();
    assert!(material.update().unwrap());

    let destination = material.constant_buffer().map(|buffer| buffer.id());
    assert_eq!(
        ctx.uploads.pending_destinations(),
        destination.into_iter().collect::<Vec<_>>()
    );

    let mut list = CommandList::new("uploads");
    list.begin();
    assert_eq!(ctx.uploads.record(&mut list), 1);
    list.close();

    assert!(!material.update().unwrap());
    assert!(ctx.uploads.is_empty());
}

#[test]
fn shader_slots_are_shared_and_recycled() {
    let headless = Arc::new(HeadlessDevice::new(3));
    let mut library = ShaderLibrary::new(
        Device::new(headless.clone()),
        Arc::new(PassthroughShaderCompiler),
    );

    let default = library.acquire(Arc::new(standard_surface::shader_definition()));
    for entry in EntryPoint::SHARED {
        library.increment_refcount(default.id(), entry);
    }
    library.rebuild().unwrap();

    let definition = Arc::new(MaterialShaderDefinition::new(
        "void evaluate_material() {}",
        standard_surface::shader_definition().uniforms.clone(),
        vec![],
        false,
    ));
    let shaders: Vec<_> = (0..4).map(|_| library.acquire(definition.clone())).collect();
    assert_eq!(library.live_shader_count(), 2);

    let id = shaders[0].id().to_owned();
    let slot = shaders[0].slot();
    library.increment_refcount(&id, EntryPoint::RadianceHit);
    assert!(library.is_dirty());

    library.rebuild().unwrap();
    assert_eq!(library.state(slot), CompileState::CompiledSuccessfully);
    assert_eq!(library.refcount(&id, EntryPoint::RadianceHit), 1);

    library.decrement_refcount(&id, EntryPoint::RadianceHit);
    assert!(library.is_dirty());
    library.rebuild().unwrap();
    assert!(library.get(&id).is_some());

    drop(shaders);
    assert_eq!(library.state(slot), CompileState::PendingRemoval);
    library.rebuild().unwrap();
    assert!(library.free_slots().contains(&slot));
    assert!(library.get(&id).is_none());
    assert_eq!(library.live_shader_count(), 1);
}

#[test]
fn single_triangle_gets_face_normals() {
    let data = VertexData::new(&[Vec3::ZERO, Vec3::X, Vec3::Y]);
    let mesh = MeshData::from_vertex_data(3, 0, &data).unwrap();

    assert_eq!(mesh.normals.len(), 3);
    for normal in &mesh.normals {
        assert!((*normal - Vec3::Z).length() < 1e-6);
    }
    for tangent in &mesh.tangents {
        assert!(tangent.dot(Vec3::Z).abs() < 1e-6);
        assert!((tangent.length() - 1.0).abs() < 1e-5);
    }
}

#[test]
fn generated_normals_cover_every_vertex() {
    let positions: Vec<Vec3> = (0..9)
        .map(|i| Vec3::new((i % 3) as f32, (i / 3) as f32, ((i * 7) % 4) as f32 * 0.2))
        .collect();
    let texcoords: Vec<Vec2> = positions.iter().map(|p| Vec2::new(p.x, p.y)).collect();
    let indices: Vec<u32> = vec![
        0, 1, 3, 1, 4, 3, 1, 2, 4, 2, 5, 4, 3, 4, 6, 4, 7, 6, 4, 5, 7, 5, 8, 7,
    ];

    let data = VertexData::new(&positions)
        .texcoords(&texcoords)
        .indices(indices.clone());
    let mesh = MeshData::from_vertex_data(9, indices.len() as u32, &data).unwrap();

    assert_eq!(mesh.normals.len(), positions.len());
    assert_eq!(mesh.tangents.len(), positions.len());
    for normal in &mesh.normals {
        assert!((normal.length() - 1.0).abs() < 1e-5);
    }
}

#[test]
fn options_reject_unknown_values() {
    let mut options = aurora::options::Options::default();
    assert!(options.set("units", "furlong").is_err());
    assert!(options.set("brightness", Vec4::ONE).is_err());
    options.set("trace_depth", 50).unwrap();
    assert_eq!(options.trace_depth(), aurora::options::MAX_TRACE_DEPTH as u32);

    options
        .set_all(&properties([
            ("is_tone_mapping_enabled", PropertyValue::Bool(true)),
            ("max_luminance", PropertyValue::Float(10.0)),
        ]))
        .unwrap();
    assert!(options.is_tone_mapping_enabled());
    assert_eq!(options.max_luminance(), 10.0);
}
