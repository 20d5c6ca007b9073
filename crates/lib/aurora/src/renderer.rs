use crate::{
    compute::ComputePass,
    context::RenderContext,
    denoiser::{Denoiser, DENOISING_SLOT, DENOISING_TEXTURE_COUNT},
    environment::Environment,
    error::RenderError,
    frame_data::{Camera, FrameData, FRAME_DATA_STRIDE},
    geometry::{Geometry, GeometryDescriptor},
    ground_plane::GroundPlane,
    image::{Image, ImageDescriptor},
    material::Material,
    materialx::MaterialXCodeGenerator,
    options::Options,
    properties::{Properties, PropertyValue},
    render_buffer::{RenderBuffer, RenderBufferFormat},
    sampler::Sampler,
    scene::{Scene, ENVIRONMENT_TEXTURE_SLOT},
    shader_library::{EntryPoint, MaterialShader, RAY_GEN_GROUP},
    shaders,
    transfer_buffer::TransferBuffer,
};
use aurora_backend::{
    ash::vk,
    headless::HeadlessDevice,
    pipeline::{SHADER_IDENTIFIER_SIZE, SHADER_TABLE_ALIGNMENT},
    shader_compiler::{PassthroughShaderCompiler, ShaderCompiler},
    Buffer, BufferBinding, BufferDesc, CommandList, Descriptor, DescriptorHeap, Device,
    DispatchRaysDesc, Image as GpuImage, ImageDesc, RayTracingArgs, RayTracingPipeline,
    ResourceId, ResourceState, ShaderTableRegion,
};
use glam::Mat4;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

/// Seed offsets cycle through this many values between restarts.
const SEED_OFFSET_PERIOD: u32 = 100;

/// Post-process constants, one slice per task.
const POST_PROCESS_STRIDE: usize = 256;

const ACCUMULATE_TABLE_START: u32 = 1;
const POST_PROCESS_TABLE_START: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// CPU-side device that records work without executing shaders.
    Headless,
    Vulkan,
}

#[derive(Clone, Copy, Debug)]
pub struct RendererConfig {
    /// Tasks in flight.
    pub task_count: usize,
    pub backend: Backend,
    pub graphics_debugging: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            task_count: 3,
            backend: Backend::Vulkan,
            graphics_debugging: false,
        }
    }
}

pub fn create_renderer(config: RendererConfig) -> anyhow::Result<Renderer> {
    let (device, compiler): (Device, Arc<dyn ShaderCompiler>) = match config.backend {
        Backend::Headless => (
            Device::new(Arc::new(HeadlessDevice::new(config.task_count))),
            Arc::new(PassthroughShaderCompiler),
        ),
        Backend::Vulkan => create_vulkan_device(config)?,
    };

    info!("Created {:?} device {:?}", config.backend, device.properties().name);
    Ok(Renderer::new(device, compiler, config.task_count)?)
}

#[cfg(feature = "dxc")]
fn create_vulkan_device(config: RendererConfig) -> anyhow::Result<(Device, Arc<dyn ShaderCompiler>)> {
    use aurora_backend::{
        shader_compiler::DxcShaderCompiler,
        vulkan::{create_device, VulkanDeviceConfig},
    };

    let device = create_device(VulkanDeviceConfig {
        graphics_debugging: config.graphics_debugging,
        device_index: None,
        command_allocator_count: config.task_count,
    })?;
    Ok((Device::new(device), Arc::new(DxcShaderCompiler)))
}

#[cfg(not(feature = "dxc"))]
fn create_vulkan_device(_config: RendererConfig) -> anyhow::Result<(Device, Arc<dyn ShaderCompiler>)> {
    anyhow::bail!("The Vulkan backend needs the `dxc` feature to compile shaders")
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct PostProcessData {
    brightness: [f32; 4],
    max_luminance: f32,
    is_tone_mapping_enabled: u32,
    is_gamma_correction_enabled: u32,
    is_alpha_enabled: u32,
}

/// Where a frame ends up.
#[derive(Clone)]
pub struct RenderTargets {
    pub final_target: Arc<RenderBuffer>,
    /// Must be `R32Float`.
    pub depth_ndc: Option<Arc<RenderBuffer>>,
}

/// Storage images the shaders write, at heap slots 0..4.
struct Outputs {
    extent: [u32; 2],
    format: RenderBufferFormat,
    final_image: Arc<GpuImage>,
    accumulation: Arc<GpuImage>,
    direct: Arc<GpuImage>,
    depth_ndc: Arc<GpuImage>,
    is_initialized: bool,
}

impl Outputs {
    fn new(ctx: &RenderContext, extent: [u32; 2], format: RenderBufferFormat) -> Result<Self, RenderError> {
        let create = |format: vk::Format, usage: vk::ImageUsageFlags, name: &str| {
            ctx.device.create_image(
                ImageDesc::new_2d(format, extent).usage(vk::ImageUsageFlags::STORAGE | usage),
                name,
            )
        };

        Ok(Self {
            extent,
            format,
            final_image: create(
                format.storage_format(),
                vk::ImageUsageFlags::TRANSFER_SRC,
                "final",
            )?,
            accumulation: create(
                vk::Format::R32G32B32A32_SFLOAT,
                vk::ImageUsageFlags::empty(),
                "accumulation",
            )?,
            direct: create(
                vk::Format::R32G32B32A32_SFLOAT,
                vk::ImageUsageFlags::empty(),
                "direct",
            )?,
            depth_ndc: create(
                vk::Format::R32_SFLOAT,
                vk::ImageUsageFlags::TRANSFER_SRC,
                "depth ndc",
            )?,
            is_initialized: false,
        })
    }

    fn images(&self) -> [&Arc<GpuImage>; 4] {
        [
            &self.final_image,
            &self.accumulation,
            &self.direct,
            &self.depth_ndc,
        ]
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct DescriptorKey {
    heap: ResourceId,
    final_image: ResourceId,
    has_denoiser: bool,
}

/// Path traces a scene into render buffers.
///
/// `render` is the only operation that records GPU work; everything else
/// stages changes for it.
pub struct Renderer {
    ctx: Arc<RenderContext>,
    options: Options,
    camera: Camera,
    scene: Option<Arc<Scene>>,
    targets: Option<RenderTargets>,

    // Keeps the shared entry points of the default shader linked.
    default_shader: Arc<MaterialShader>,
    accumulate: ComputePass,
    post_process: ComputePass,
    frame_data: TransferBuffer,
    post_constants: Arc<Buffer>,

    ray_gen: Option<(Arc<RayTracingPipeline>, ShaderTableRegion)>,
    outputs: Option<Outputs>,
    denoiser: Option<Denoiser>,
    descriptors: Option<DescriptorKey>,

    seed_offset: u32,
    frame_count: u64,
    is_valid: bool,
}

impl Renderer {
    pub fn new(
        device: Device,
        compiler: Arc<dyn ShaderCompiler>,
        task_count: usize,
    ) -> Result<Self, RenderError> {
        let ctx = RenderContext::new(device, compiler, task_count);

        let default_shader = {
            let mut library = ctx.library.lock();
            let shader = library.acquire(ctx.default_material.shader.clone());
            for entry in EntryPoint::SHARED {
                library.increment_refcount(shader.id(), entry);
            }
            shader
        };

        let accumulate = ComputePass::new(
            &ctx,
            "accumulate",
            shaders::ACCUMULATE,
            ACCUMULATE_TABLE_START,
            false,
        )?;
        let post_process = ComputePass::new(
            &ctx,
            "post process",
            shaders::POST_PROCESS,
            POST_PROCESS_TABLE_START,
            true,
        )?;

        let frame_data = TransferBuffer::new(
            &ctx.device,
            task_count * FRAME_DATA_STRIDE,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            ResourceState::ConstantBuffer,
            "frame data",
        )?;
        let post_constants = ctx.device.create_buffer(
            BufferDesc::new_cpu_to_gpu(
                task_count * POST_PROCESS_STRIDE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            ),
            "post process constants",
        )?;

        Ok(Self {
            ctx,
            options: Options::default(),
            camera: Camera::default(),
            scene: None,
            targets: None,
            default_shader,
            accumulate,
            post_process,
            frame_data,
            post_constants,
            ray_gen: None,
            outputs: None,
            denoiser: None,
            descriptors: None,
            seed_offset: 0,
            frame_count: 0,
            is_valid: true,
        })
    }

    pub fn device(&self) -> &Device {
        &self.ctx.device
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn set_option(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<(), RenderError> {
        self.options.set(name, value)
    }

    pub fn set_options(&mut self, properties: &Properties) -> Result<(), RenderError> {
        self.options.set_all(properties)
    }

    pub fn set_materialx_generator(&self, generator: Option<Arc<dyn MaterialXCodeGenerator>>) {
        self.ctx.materialx.lock().set_generator(generator);
    }

    pub fn create_scene(&self) -> Result<Arc<Scene>, RenderError> {
        let scene = Scene::new(self.ctx.clone())?;
        scene.set_flip_image_y(self.options.is_flip_image_y_enabled());
        Ok(Arc::new(scene))
    }

    /// `Ok(None)` when the descriptor supplies no pixels.
    pub fn create_image(&self, descriptor: &ImageDescriptor, name: &str) -> Result<Option<Arc<Image>>, RenderError> {
        let image = Image::create(&self.ctx, name, descriptor)?;
        self.ctx.upload_transfer_buffers();
        Ok(image.map(Arc::new))
    }

    pub fn create_sampler(&self, properties: &Properties) -> Result<Sampler, RenderError> {
        Sampler::from_properties(properties)
    }

    pub fn create_material(&self, type_name: &str, document: &str, name: &str) -> Result<Material, RenderError> {
        let definition = self.ctx.material_definition(type_name, document)?;
        Ok(Material::new(self.ctx.clone(), name, definition))
    }

    pub fn create_geometry(&self, descriptor: GeometryDescriptor, name: &str) -> Geometry {
        Geometry::new(self.ctx.clone(), name, descriptor)
    }

    pub fn create_environment(&self) -> Environment {
        Environment::new()
    }

    pub fn create_ground_plane(&self) -> GroundPlane {
        GroundPlane::new()
    }

    pub fn create_render_buffer(
        &self,
        width: u32,
        height: u32,
        format: RenderBufferFormat,
    ) -> Result<Arc<RenderBuffer>, RenderError> {
        Ok(Arc::new(RenderBuffer::new(&self.ctx.device, width, height, format)?))
    }

    /// Presenting to native windows is not supported.
    pub fn create_window(&self, _native_handle: u64, _width: u32, _height: u32) -> Result<(), RenderError> {
        Err(RenderError::Unsupported {
            info: format!(
                "window targets on the {} device",
                self.ctx.device.properties().name
            ),
        })
    }

    pub fn set_scene(&mut self, scene: Arc<Scene>) {
        scene.set_flip_image_y(self.options.is_flip_image_y_enabled());
        self.scene = Some(scene);
    }

    pub fn scene(&self) -> Option<&Arc<Scene>> {
        self.scene.as_ref()
    }

    pub fn set_targets(
        &mut self,
        final_target: Arc<RenderBuffer>,
        depth_ndc: Option<Arc<RenderBuffer>>,
    ) -> Result<(), RenderError> {
        if let Some(depth) = &depth_ndc {
            if depth.format() != RenderBufferFormat::R32Float
                || [depth.width(), depth.height()] != [final_target.width(), final_target.height()]
            {
                return Err(RenderError::invalid_argument(format!(
                    "depth target {}x{} {:?} does not match a {}x{} final target",
                    depth.width(),
                    depth.height(),
                    depth.format(),
                    final_target.width(),
                    final_target.height()
                )));
            }
        }

        self.targets = Some(RenderTargets {
            final_target,
            depth_ndc,
        });
        Ok(())
    }

    pub fn set_camera(&mut self, view: Mat4, projection: Mat4) {
        self.camera.view = view;
        self.camera.projection = projection;
    }

    pub fn set_camera_lens(&mut self, focal_distance: f32, lens_radius: f32) {
        self.camera.focal_distance = focal_distance;
        self.camera.lens_radius = lens_radius;
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn task_number(&self) -> u64 {
        self.ctx.tasks.lock().task_number()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn wait_for_task(&self) -> Result<(), RenderError> {
        self.ctx.tasks.lock().wait_for_task()
    }

    /// Traces `sample_count` samples, accumulating onto the samples before
    /// `sample_start`, then writes the targets.
    ///
    /// A failure here leaves the renderer permanently invalid.
    pub fn render(&mut self, sample_start: u32, sample_count: u32) -> Result<(), RenderError> {
        if !self.is_valid {
            return Err(RenderError::RendererInvalid);
        }

        let scene = self
            .scene
            .clone()
            .ok_or_else(|| RenderError::invalid_argument("render without a scene"))?;
        let targets = self
            .targets
            .clone()
            .ok_or_else(|| RenderError::invalid_argument("render without targets"))?;
        assert!(
            scene.instance_count() == 0 || scene.has_valid_bounds(),
            "scene bounds must be set before rendering instances"
        );

        let result = self.render_frame(&scene, &targets, sample_start, sample_count);
        if let Err(err) = &result {
            error!("Rendering failed, the renderer is now invalid: {}", err);
            self.is_valid = false;
        }
        result
    }

    fn render_frame(
        &mut self,
        scene: &Scene,
        targets: &RenderTargets,
        sample_start: u32,
        sample_count: u32,
    ) -> Result<(), RenderError> {
        let ctx = self.ctx.clone();

        if self.options.is_dirty() {
            ctx.library.lock().set_options(self.options.shader_options());
            scene.set_flip_image_y(self.options.is_flip_image_y_enabled());
            self.options.clear_dirty();
        }
        self.rebuild_library(scene)?;

        scene.update()?;
        // Materials may have acquired shaders or any-hit entry points.
        self.rebuild_library(scene)?;
        scene.update_shader_tables()?;

        let ray_gen = self.ray_gen_table()?;
        let resources = scene
            .resources()
            .ok_or_else(|| RenderError::invalid_argument("scene has no GPU resources"))?;

        let extent = [targets.final_target.width(), targets.final_target.height()];
        self.update_outputs(extent, targets.final_target.format())?;
        self.update_denoiser(extent)?;
        self.update_descriptors(&resources.descriptor_heap)?;

        let seed_offset = if self.options.is_denoising_enabled() {
            if sample_start == 0 {
                self.seed_offset = (self.seed_offset + 1) % SEED_OFFSET_PERIOD;
            }
            self.seed_offset
        } else {
            0
        };

        let desc = DispatchRaysDesc {
            ray_gen,
            miss: resources.miss.clone(),
            hit_groups: resources.hit_groups.clone(),
            extent: [extent[0], extent[1], 1],
        };
        let pipeline = ctx.library.lock().pipeline().clone();
        let reset_history = self.options.is_reset_history_enabled();

        let frame_data = FrameData::new(
            &self.camera,
            &self.options,
            scene.scene_size(),
            &scene.lights(),
        );

        for i in 0..sample_count {
            let sample_index = sample_start + i;
            let is_reset = reset_history && i == 0;

            let task_index = ctx.tasks.lock().task_index();
            let offset = task_index * FRAME_DATA_STRIDE;
            self.frame_data
                .write(offset, bytemuck::bytes_of(&frame_data), &ctx.uploads);
            ctx.upload_transfer_buffers();

            let mut tasks = ctx.tasks.lock();
            let list = tasks.command_list();
            self.initialize_outputs(list);

            list.dispatch_rays(
                &pipeline,
                RayTracingArgs {
                    acceleration_structure: resources.tlas.clone(),
                    sample_constants: [sample_index, seed_offset],
                    frame_data: BufferBinding::range(
                        self.frame_data.buffer(),
                        offset as u64,
                        std::mem::size_of::<FrameData>() as u64,
                    ),
                    environment: resources.environment.clone(),
                    environment_alias_map: resources.environment_alias_map.clone(),
                    environment_textures: ENVIRONMENT_TEXTURE_SLOT as u32,
                    ground_plane: resources.ground_plane.clone(),
                    null_acceleration_structure: None,
                    descriptor_heap: resources.descriptor_heap.clone(),
                    sampler_heap: resources.sampler_heap.clone(),
                },
                desc.clone(),
            );
            list.uav_barrier(None);

            if let Some(denoiser) = &mut self.denoiser {
                denoiser.record(list, &resources.descriptor_heap, is_reset);
            }

            self.accumulate.record(
                list,
                &resources.descriptor_heap,
                [sample_index, is_reset as u32, 0],
                None,
                extent,
            );
            tasks.complete_task()?;
        }

        self.post_process(&resources.descriptor_heap, targets)?;

        self.options.clear_reset_history();
        self.frame_count += 1;
        trace!(
            "Frame {}: samples {}..{}",
            self.frame_count,
            sample_start,
            sample_start + sample_count
        );
        Ok(())
    }

    fn rebuild_library(&mut self, scene: &Scene) -> Result<(), RenderError> {
        let is_dirty = self.ctx.library.lock().is_dirty();
        if !is_dirty {
            return Ok(());
        }

        self.ctx.tasks.lock().wait_for_task()?;
        self.ctx.library.lock().rebuild()?;
        scene.invalidate_shader_tables();
        Ok(())
    }

    /// The ray generation record only holds its identifier. Rewritten
    /// whenever the pipeline was relinked.
    fn ray_gen_table(&mut self) -> Result<ShaderTableRegion, RenderError> {
        let mut library = self.ctx.library.lock();
        let pipeline = library.pipeline().clone();

        if let Some((linked, region)) = &self.ray_gen {
            if Arc::ptr_eq(linked, &pipeline) {
                return Ok(region.clone());
            }
        }

        let identifier = library.shader_identifier(RAY_GEN_GROUP).ok_or_else(|| {
            RenderError::invalid_argument("pipeline has no ray generation group")
        })?;
        drop(library);

        let buffer = self.ctx.device.create_buffer(
            BufferDesc::new_cpu_to_gpu(
                SHADER_TABLE_ALIGNMENT,
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            )
            .alignment(SHADER_TABLE_ALIGNMENT as u64),
            "ray gen shader table",
        )?;
        buffer.write_bytes(0, &identifier[..SHADER_IDENTIFIER_SIZE]);

        let region = ShaderTableRegion {
            buffer,
            offset: 0,
            stride: SHADER_TABLE_ALIGNMENT as u64,
            size: SHADER_TABLE_ALIGNMENT as u64,
        };
        self.ray_gen = Some((pipeline, region.clone()));
        Ok(region)
    }

    fn update_outputs(&mut self, extent: [u32; 2], format: RenderBufferFormat) -> Result<(), RenderError> {
        if let Some(outputs) = &self.outputs {
            if outputs.extent == extent && outputs.format == format {
                return Ok(());
            }
            self.ctx.tasks.lock().wait_for_task()?;
        }

        info!("Render outputs: {}x{} {:?}", extent[0], extent[1], format);
        self.outputs = Some(Outputs::new(&self.ctx, extent, format)?);
        Ok(())
    }

    fn update_denoiser(&mut self, extent: [u32; 2]) -> Result<(), RenderError> {
        let wanted = self.options.is_denoising_enabled();
        let matches = self
            .denoiser
            .as_ref()
            .map_or(false, |denoiser| denoiser.extent() == extent);

        if wanted && matches || !wanted && self.denoiser.is_none() {
            return Ok(());
        }

        if self.denoiser.is_some() {
            self.ctx.tasks.lock().wait_for_task()?;
            self.denoiser = None;
        }
        if wanted {
            self.denoiser = Some(Denoiser::new(&self.ctx, extent)?);
        }
        Ok(())
    }

    /// Writes the output storage images into the reserved heap slots when
    /// the heap or the outputs changed.
    fn update_descriptors(&mut self, heap: &Arc<DescriptorHeap>) -> Result<(), RenderError> {
        let outputs = match &self.outputs {
            Some(outputs) => outputs,
            None => return Ok(()),
        };

        let key = DescriptorKey {
            heap: heap.id(),
            final_image: outputs.final_image.id(),
            has_denoiser: self.denoiser.is_some(),
        };
        if self.descriptors == Some(key) {
            return Ok(());
        }

        let mut descriptors: Vec<Descriptor> = outputs
            .images()
            .iter()
            .map(|image| Descriptor::StorageImage((*image).clone()))
            .collect();
        debug_assert_eq!(descriptors.len(), DENOISING_SLOT);

        match &self.denoiser {
            Some(denoiser) => descriptors.extend(
                denoiser
                    .textures()
                    .iter()
                    .map(|texture| Descriptor::StorageImage(texture.clone())),
            ),
            None => descriptors.extend((0..DENOISING_TEXTURE_COUNT).map(|_| Descriptor::Null)),
        }

        heap.write(0, &descriptors)?;
        self.descriptors = Some(key);
        Ok(())
    }

    fn initialize_outputs(&mut self, list: &mut CommandList) {
        if let Some(outputs) = &mut self.outputs {
            if !outputs.is_initialized {
                for image in outputs.images() {
                    list.transition(image, ResourceState::Common, ResourceState::UnorderedAccess);
                }
                outputs.is_initialized = true;
            }
        }
    }

    /// Tone maps into the final image and copies it, and depth, into the
    /// targets and their readback buffers.
    fn post_process(
        &mut self,
        heap: &Arc<DescriptorHeap>,
        targets: &RenderTargets,
    ) -> Result<(), RenderError> {
        let ctx = self.ctx.clone();
        let target = &targets.final_target;

        let constants = PostProcessData {
            brightness: self.options.brightness().extend(1.0).to_array(),
            max_luminance: self.options.max_luminance(),
            is_tone_mapping_enabled: self.options.is_tone_mapping_enabled() as u32,
            is_gamma_correction_enabled: (self.options.is_gamma_correction_enabled()
                || target.format().is_srgb()) as u32,
            is_alpha_enabled: self.options.is_alpha_enabled() as u32,
        };

        let mut tasks = ctx.tasks.lock();
        let offset = tasks.task_index() * POST_PROCESS_STRIDE;
        self.post_constants
            .write_bytes(offset, bytemuck::bytes_of(&constants));

        let list = tasks.command_list();
        self.initialize_outputs(list);

        let outputs = match &self.outputs {
            Some(outputs) => outputs,
            None => return Err(RenderError::invalid_argument("render outputs are missing")),
        };

        list.uav_barrier(None);
        self.post_process.record(
            list,
            heap,
            [0; 3],
            Some(BufferBinding::range(
                &self.post_constants,
                offset as u64,
                std::mem::size_of::<PostProcessData>() as u64,
            )),
            outputs.extent,
        );
        list.uav_barrier(None);

        let mut copies = vec![(&outputs.final_image, target)];
        if let Some(depth) = &targets.depth_ndc {
            copies.push((&outputs.depth_ndc, depth));
        }

        for (src, dst) in copies {
            list.transition(src, ResourceState::UnorderedAccess, ResourceState::CopySource);
            list.transition(dst.image(), ResourceState::Common, ResourceState::CopyDest);
            list.copy_image(src, dst.image());
            list.transition(dst.image(), ResourceState::CopyDest, ResourceState::CopySource);
            list.copy_image_to_buffer(dst.image(), dst.readback(), 0);
            list.transition(dst.image(), ResourceState::CopySource, ResourceState::Common);
            list.transition(src, ResourceState::CopySource, ResourceState::UnorderedAccess);
        }

        tasks.complete_task()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.tasks.lock().flush() {
            error!("Failed to drain the GPU on shutdown: {}", err);
        }

        // Scenes may outlive the renderer; they release their own references.
        self.scene = None;

        let mut library = self.ctx.library.lock();
        for entry in EntryPoint::SHARED {
            library.decrement_refcount(self.default_shader.id(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_backend::headless::RecordedCommand;

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

    fn render_empty(renderer: &mut Renderer, sample_start: u32, sample_count: u32) {
        let scene = renderer.create_scene().unwrap();
        renderer.set_scene(scene);
        let target = renderer
            .create_render_buffer(8, 4, RenderBufferFormat::Rgba8Unorm)
            .unwrap();
        renderer.set_targets(target, None).unwrap();
        renderer.render(sample_start, sample_count).unwrap();
    }

    fn dispatches(headless: &HeadlessDevice) -> Vec<(String, Vec<u32>)> {
        headless
            .log()
            .submissions
            .iter()
            .flat_map(|submission| submission.commands.iter())
            .filter_map(|command| match command {
                RecordedCommand::Dispatch {
                    pipeline,
                    root_constants,
                    ..
                } => Some((pipeline.clone(), root_constants.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn every_sample_is_traced_then_accumulated() {
        let (headless, mut renderer) = headless_renderer();
        render_empty(&mut renderer, 0, 3);

        let log = headless.log();
        let rays: Vec<[u32; 2]> = log
            .submissions
            .iter()
            .flat_map(|submission| submission.commands.iter())
            .filter_map(|command| match command {
                RecordedCommand::DispatchRays {
                    sample_constants,
                    extent,
                    ..
                } => {
                    assert_eq!(*extent, [8, 4, 1]);
                    Some(*sample_constants)
                }
                _ => None,
            })
            .collect();
        assert_eq!(rays, vec![[0, 0], [1, 0], [2, 0]]);

        let passes = dispatches(&headless);
        assert_eq!(
            passes,
            vec![
                ("accumulate".to_owned(), vec![0, 0, 0]),
                ("accumulate".to_owned(), vec![1, 0, 0]),
                ("accumulate".to_owned(), vec![2, 0, 0]),
                ("post process".to_owned(), vec![0, 0, 0]),
            ]
        );
        assert_eq!(renderer.frame_count(), 1);
    }

    #[test]
    fn seed_offset_advances_on_restart_when_denoising() {
        let (headless, mut renderer) = headless_renderer();
        renderer.set_option("is_denoising_enabled", true).unwrap();
        render_empty(&mut renderer, 0, 1);
        renderer.render(1, 1).unwrap();
        renderer.render(0, 1).unwrap();

        let seeds: Vec<u32> = headless
            .log()
            .submissions
            .iter()
            .flat_map(|submission| submission.commands.iter())
            .filter_map(|command| match command {
                RecordedCommand::DispatchRays {
                    sample_constants, ..
                } => Some(sample_constants[1]),
                _ => None,
            })
            .collect();
        assert_eq!(seeds, vec![1, 1, 2]);
        assert!(dispatches(&headless)
            .iter()
            .any(|(name, _)| name == "denoise"));
    }

    #[test]
    fn reset_history_applies_to_one_frame() {
        let (headless, mut renderer) = headless_renderer();
        renderer.set_option("is_reset_history_enabled", true).unwrap();
        render_empty(&mut renderer, 4, 2);
        renderer.render(6, 1).unwrap();

        let accumulate: Vec<Vec<u32>> = dispatches(&headless)
            .into_iter()
            .filter(|(name, _)| name == "accumulate")
            .map(|(_, constants)| constants)
            .collect();
        assert_eq!(accumulate, vec![vec![4, 1, 0], vec![5, 0, 0], vec![6, 0, 0]]);
        assert!(!renderer.options().is_reset_history_enabled());
    }

    #[test]
    fn render_needs_a_scene_and_targets() {
        let (_headless, mut renderer) = headless_renderer();
        assert!(matches!(
            renderer.render(0, 1),
            Err(RenderError::InvalidArgument { .. })
        ));
        assert!(renderer.is_valid());
        assert!(matches!(
            renderer.create_window(0, 64, 64),
            Err(RenderError::Unsupported { .. })
        ));
    }

    #[test]
    fn depth_target_must_be_single_channel() {
        let (_headless, mut renderer) = headless_renderer();
        let color = renderer
            .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
            .unwrap();
        let depth = renderer
            .create_render_buffer(4, 4, RenderBufferFormat::Rgba8Unorm)
            .unwrap();
        assert!(renderer.set_targets(color, Some(depth)).is_err());
    }
}
