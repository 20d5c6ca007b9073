use anyhow::Context;
use aurora::{
    create_renderer, logging::set_up_logging, properties, Backend, GeometryDescriptor,
    InstanceDescriptor, PropertyValue, RenderBufferFormat, RendererConfig, Scene, VertexData,
};
use glam::{Mat4, Vec2, Vec3};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{f32::consts::PI, path::PathBuf};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "aurora-render", about = "Path traces a procedural scene into a PNG.")]
struct Opt {
    #[structopt(long, default_value = "640")]
    width: u32,

    #[structopt(long, default_value = "360")]
    height: u32,

    #[structopt(long, default_value = "64")]
    samples: u32,

    /// Samples traced per `render` call.
    #[structopt(long, default_value = "8")]
    samples_per_frame: u32,

    #[structopt(short = "o", long, default_value = "aurora.png", parse(from_os_str))]
    output: PathBuf,

    /// Record the work on the CPU instead of tracing on a Vulkan device.
    #[structopt(long)]
    headless: bool,

    #[structopt(long)]
    graphics_debugging: bool,

    #[structopt(long)]
    denoise: bool,
}

fn sphere(rings: u32, segments: u32) -> GeometryDescriptor {
    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut texcoords = Vec::new();

    for ring in 0..=rings {
        let v = ring as f32 / rings as f32;
        let theta = v * PI;
        for segment in 0..=segments {
            let u = segment as f32 / segments as f32;
            let phi = u * 2.0 * PI;
            let n = Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
            positions.push(n);
            normals.push(n);
            texcoords.push(Vec2::new(u, v));
        }
    }

    let stride = segments + 1;
    let mut indices = Vec::new();
    for ring in 0..rings {
        for segment in 0..segments {
            let a = ring * stride + segment;
            let b = a + stride;
            indices.extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
        }
    }

    GeometryDescriptor::from_data(
        VertexData::new(&positions)
            .normals(&normals)
            .texcoords(&texcoords)
            .indices(indices),
    )
}

fn build_scene(scene: &Scene) -> anyhow::Result<()> {
    scene.set_geometry_descriptor("/geometry/sphere", sphere(32, 64))?;

    let materials = [
        ("/materials/copper", Vec3::new(0.95, 0.64, 0.54), 1.0f32, 0.25f32),
        ("/materials/plastic", Vec3::new(0.1, 0.3, 0.8), 0.0, 0.4),
        ("/materials/chalk", Vec3::new(0.9, 0.9, 0.85), 0.0, 0.9),
    ];
    for (path, base_color, metalness, roughness) in materials {
        scene.set_material_properties(
            path,
            &properties([
                ("base_color", PropertyValue::from(base_color)),
                ("metalness", PropertyValue::from(metalness)),
                ("specular_roughness", PropertyValue::from(roughness)),
            ]),
        )?;
    }

    let instances: Vec<InstanceDescriptor> = materials
        .iter()
        .enumerate()
        .map(|(i, (material, ..))| {
            let x = (i as f32 - 1.0) * 2.5;
            InstanceDescriptor::new(format!("/instances/sphere{}", i))
                .property("transform", Mat4::from_translation(Vec3::new(x, 1.0, 0.0)))
                .property("material", PropertyValue::Path((*material).to_owned()))
                .property("object_id", i as i32)
        })
        .collect();
    scene.add_instances("/geometry/sphere", &instances)?;
    scene.set_bounds(Vec3::new(-4.0, 0.0, -1.0), Vec3::new(4.0, 2.0, 1.0));

    scene.set_environment_properties(
        "/environments/sky",
        &properties([
            ("light_top", Vec3::new(0.8, 0.9, 1.0)),
            ("light_bottom", Vec3::new(0.2, 0.2, 0.2)),
            ("background_top", Vec3::new(0.5, 0.7, 1.0)),
            ("background_bottom", Vec3::new(0.9, 0.9, 0.9)),
        ]),
    )?;
    scene.set_environment("/environments/sky")?;

    scene.set_ground_plane_properties(&properties([
        ("enabled", PropertyValue::from(true)),
        ("shadow_opacity", PropertyValue::from(0.8f32)),
    ]))?;

    let sun = scene.add_light_pointer("distant")?;
    sun.set_properties(&properties([
        (
            "direction",
            PropertyValue::from(Vec3::new(-0.4, -1.0, -0.3).normalize()),
        ),
        ("intensity", PropertyValue::from(3.0f32)),
    ]))?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    set_up_logging(log::LevelFilter::Info)?;
    let opt = Opt::from_args();

    let mut renderer = create_renderer(RendererConfig {
        backend: if opt.headless {
            Backend::Headless
        } else {
            Backend::Vulkan
        },
        graphics_debugging: opt.graphics_debugging,
        ..Default::default()
    })?;
    renderer.set_option("is_denoising_enabled", opt.denoise)?;
    renderer.set_option("is_tone_mapping_enabled", true)?;

    let scene = renderer.create_scene()?;
    build_scene(&scene)?;
    renderer.set_scene(scene);

    let target = renderer.create_render_buffer(opt.width, opt.height, RenderBufferFormat::Rgba8Srgb)?;
    renderer.set_targets(target.clone(), None)?;

    let aspect = opt.width as f32 / opt.height as f32;
    renderer.set_camera(
        Mat4::look_at_rh(Vec3::new(0.0, 2.5, 8.0), Vec3::new(0.0, 1.0, 0.0), Vec3::Y),
        Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 100.0),
    );

    let t0 = std::time::Instant::now();
    let per_frame = opt.samples_per_frame.max(1);
    let mut sample = 0;
    while sample < opt.samples {
        let count = per_frame.min(opt.samples - sample);
        renderer.render(sample, count)?;
        sample += count;
    }
    renderer.wait_for_task()?;
    info!(
        "Traced {} samples at {}x{} in {:.2?}",
        opt.samples,
        opt.width,
        opt.height,
        t0.elapsed()
    );

    let (_, pixels) = target.data(true);
    image::save_buffer(
        &opt.output,
        &pixels,
        opt.width,
        opt.height,
        image::ColorType::Rgba8,
    )
    .with_context(|| format!("Writing {:?}", opt.output))?;
    info!("Wrote {:?}", opt.output);

    Ok(())
}
