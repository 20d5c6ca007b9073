use crate::{
    context::RenderContext,
    environment::{Environment, EnvironmentData, ENVIRONMENT_DESCRIPTOR_COUNT},
    error::RenderError,
    geometry::{Geometry, GeometryBuffers, GeometryDescriptor},
    ground_plane::{GroundPlane, GroundPlaneData},
    image::{load_image_file, Image, ImageDescriptor},
    instance::{Instance, InstanceDescriptor},
    light::{DistantLightData, Light, LightList},
    material::Material,
    properties::{Properties, PropertyValue},
    sampler::Sampler,
    shader_library::{
        hit_group_name, layer_miss_group_name, EntryPoint, MaterialShader, BACKGROUND_MISS_GROUP,
        RADIANCE_MISS_GROUP, SHADOW_MISS_GROUP,
    },
    transfer_buffer::TransferBuffer,
};
use aurora_backend::{
    ash::vk,
    pipeline::{
        ShaderIdentifier, SHADER_IDENTIFIER_SIZE, SHADER_RECORD_ALIGNMENT, SHADER_TABLE_ALIGNMENT,
    },
    AccelerationStructure, AccelerationStructureGeometry, AccelerationStructureType, Buffer,
    BufferBinding, BufferDesc, Descriptor, DescriptorHeap, DescriptorHeapKind, GeometryInstance,
    ResourceState, Sampler as GpuSampler, ShaderTableRegion,
};
use glam::{Mat4, Vec3};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, BTreeSet, HashMap},
    hash::{Hash, Hasher},
    path::Path,
    sync::Arc,
};

/// Storage-image slots at the start of the resource heap, owned by the
/// renderer's outputs.
pub const RESERVED_DESCRIPTOR_COUNT: usize = 11;

/// First heap slot of the environment textures (light, then background).
pub const ENVIRONMENT_TEXTURE_SLOT: usize = RESERVED_DESCRIPTOR_COUNT;

/// Null, background, radiance and shadow; layer records follow.
pub const BUILT_IN_MISS_COUNT: usize = 4;

/// Path of the material used by instances without one.
pub const DEFAULT_MATERIAL_PATH: &str = "/aurora/default_material";

/// Local arguments of a hit-group or layer-miss record, after the shader
/// identifier. Matches `HitRecord` in `material_header.hlsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HitRecordArgs {
    pub index_buffer: u64,
    pub position_buffer: u64,
    pub normal_buffer: u64,
    pub tangent_buffer: u64,
    pub texcoord_buffer: u64,
    pub has_normals: u32,
    pub has_tangents: u32,
    pub has_texcoords: u32,
    pub material_layer_count: u32,
    pub is_opaque: u32,
    pub _pad: u32,
    pub material_constants: u64,
    pub layer_table: u64,
    /// Index of the material's first texture in the resource heap, not a
    /// GPU descriptor handle. The heap itself is bound globally.
    pub texture_start: u32,
    /// Index of the first sampler in the sampler heap.
    pub sampler_start: u32,
}

pub const SHADER_RECORD_STRIDE: usize = (SHADER_IDENTIFIER_SIZE
    + std::mem::size_of::<HitRecordArgs>()
    + SHADER_RECORD_ALIGNMENT
    - 1)
    & !(SHADER_RECORD_ALIGNMENT - 1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PathKind {
    Image,
    Sampler,
    Material,
    Geometry,
    Environment,
    Instance,
}

struct ImageEntry {
    /// `None` after a failed load; shaders then see no texture.
    descriptor: Option<ImageDescriptor>,
    image: Option<Arc<Image>>,
}

struct MaterialEntry {
    material: Material,
    /// Texture name to image path.
    image_paths: BTreeMap<String, String>,
    /// Texture name to sampler path.
    sampler_paths: BTreeMap<String, String>,
}

impl MaterialEntry {
    fn new(material: Material) -> Self {
        Self {
            material,
            image_paths: BTreeMap::new(),
            sampler_paths: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct LayerBinding {
    material: String,
    geometry: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct UniqueInstanceKey {
    geometry: String,
    material: String,
    layers: u64,
}

fn layer_fingerprint(layers: &[LayerBinding]) -> u64 {
    let mut hasher = DefaultHasher::new();
    layers.hash(&mut hasher);
    hasher.finish()
}

/// One hit-group record: every instance with the same key shares it.
struct UniqueInstance {
    geometry: String,
    material: String,
    layers: Vec<LayerBinding>,
    layer_table: Option<Arc<Buffer>>,
}

#[derive(Clone, Copy, Debug)]
/// Heap indices of a material's textures and samplers.
struct MaterialSlots {
    texture_start: u32,
    sampler_start: u32,
}

/// What the renderer binds to trace a scene.
#[derive(Clone)]
pub struct SceneResources {
    pub tlas: Arc<AccelerationStructure>,
    pub environment: BufferBinding,
    pub environment_alias_map: BufferBinding,
    pub ground_plane: BufferBinding,
    pub descriptor_heap: Arc<DescriptorHeap>,
    pub sampler_heap: Arc<DescriptorHeap>,
    pub hit_groups: ShaderTableRegion,
    pub miss: ShaderTableRegion,
}

/// GPU-side state derived from the scene description by `Scene::update`.
struct SceneGpu {
    environment_buffer: TransferBuffer,
    ground_plane_buffer: TransferBuffer,
    empty_alias_map: Arc<Buffer>,
    light_image: Option<Arc<Image>>,
    background_image: Option<Arc<Image>>,
    lights: Vec<DistantLightData>,

    active_materials: Vec<String>,
    material_slots: HashMap<String, MaterialSlots>,
    samplers: HashMap<u64, Arc<GpuSampler>>,
    layer_shaders: HashMap<String, Arc<MaterialShader>>,

    unique_instances: Vec<UniqueInstance>,
    unique_indices: Vec<u32>,
    tlas_instances: Vec<GeometryInstance>,
    tlas: Option<Arc<AccelerationStructure>>,

    descriptor_heap: Option<Arc<DescriptorHeap>>,
    sampler_heap: Option<Arc<DescriptorHeap>>,
    hit_groups: Option<ShaderTableRegion>,
    miss: Option<ShaderTableRegion>,

    heaps_dirty: bool,
    shader_tables_dirty: bool,
}

struct SceneState {
    paths: HashMap<String, PathKind>,
    images: HashMap<String, ImageEntry>,
    samplers: HashMap<String, Sampler>,
    materials: BTreeMap<String, MaterialEntry>,
    geometries: BTreeMap<String, Geometry>,
    modified_geometries: BTreeSet<String>,
    instances: BTreeMap<String, Instance>,
    instances_changed: bool,
    next_instance: u64,
    environments: HashMap<String, Environment>,
    active_environment: Option<String>,
    default_environment: Environment,
    ground_plane: GroundPlane,
    ground_plane_dirty: bool,
    lights: LightList,
    bounds: Option<(Vec3, Vec3)>,
    flip_image_y: bool,

    // Replaced while the GPU may still read them; dropped after the next wait.
    retired_materials: Vec<Material>,
    retired_geometries: Vec<Geometry>,

    gpu: SceneGpu,
}

/// Everything that gets traced: geometry, materials, instances, images,
/// environment, ground plane and lights, all addressed by path.
///
/// Changes are recorded immediately and reach the GPU on the next
/// `Renderer::render`, which calls `update` and `update_shader_tables`.
pub struct Scene {
    ctx: Arc<RenderContext>,
    state: Mutex<SceneState>,
}

fn same_image(a: &Option<Arc<Image>>, b: &Option<Arc<Image>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn transform_rows(transform: &Mat4) -> [f32; 12] {
    let rows = transform.transpose().to_cols_array();
    let mut out = [0.0; 12];
    out.copy_from_slice(&rows[..12]);
    out
}

fn image_descriptor(image: &Option<Arc<Image>>) -> Descriptor {
    match image {
        Some(image) => Descriptor::SampledImage(image.texture.clone()),
        None => Descriptor::Null,
    }
}

/// Creates the GPU image for `path` on first use. Environment lights need an
/// alias map, so an image first created without one is recreated.
fn resolve_image(
    ctx: &RenderContext,
    images: &mut HashMap<String, ImageEntry>,
    path: &str,
    as_environment: bool,
) -> Option<Arc<Image>> {
    let entry = match images.get_mut(path) {
        Some(entry) => entry,
        None => {
            warn!("Image {:?} is not in the scene", path);
            return None;
        }
    };

    if let Some(image) = &entry.image {
        if !as_environment || image.alias_map.is_some() {
            return Some(image.clone());
        }
    }

    let descriptor = entry.descriptor.as_ref()?;
    let descriptor = if as_environment {
        descriptor.clone().environment(true)
    } else {
        descriptor.clone()
    };

    match Image::create(ctx, path, &descriptor) {
        Ok(Some(image)) => {
            let image = Arc::new(image);
            entry.image = Some(image.clone());
            Some(image)
        }
        Ok(None) => None,
        Err(err) => {
            error!("Image {:?}: {}", path, err);
            entry.descriptor = None;
            None
        }
    }
}

fn write_record(out: &mut Vec<u8>, identifier: &ShaderIdentifier, args: &HitRecordArgs) {
    let start = out.len();
    out.extend_from_slice(identifier);
    out.extend_from_slice(bytemuck::bytes_of(args));
    out.resize(start + SHADER_RECORD_STRIDE, 0);
}

fn record_args(
    indices: &GeometryBuffers,
    vertices: &GeometryBuffers,
    material: &Material,
    slots: MaterialSlots,
) -> HitRecordArgs {
    let texcoords = vertices.texcoords.as_ref().or(indices.texcoords.as_ref());

    HitRecordArgs {
        index_buffer: indices.indices.device_address(),
        position_buffer: vertices.positions.device_address(),
        normal_buffer: vertices.normals.device_address(),
        tangent_buffer: vertices.tangents.device_address(),
        texcoord_buffer: texcoords.map_or(0, |slice| slice.device_address()),
        has_normals: 1,
        has_tangents: 1,
        has_texcoords: texcoords.is_some() as u32,
        material_layer_count: 0,
        is_opaque: material.is_opaque() as u32,
        _pad: 0,
        material_constants: material.constant_buffer_address(),
        layer_table: 0,
        texture_start: slots.texture_start,
        sampler_start: slots.sampler_start,
    }
}

impl SceneState {
    fn claim(&mut self, path: &str, kind: PathKind) -> Result<(), RenderError> {
        if path.is_empty() {
            return Err(RenderError::invalid_argument("empty scene path"));
        }

        match self.paths.get(path) {
            Some(existing) if *existing != kind => Err(RenderError::invalid_argument(format!(
                "{:?} is already used by a {:?}",
                path, existing
            ))),
            _ => {
                self.paths.insert(path.to_owned(), kind);
                Ok(())
            }
        }
    }

    fn material_path(&self, path: Option<&str>) -> String {
        match path {
            Some(path) if self.materials.contains_key(path) => path.to_owned(),
            Some(path) => {
                debug!("Material {:?} is not in the scene; using the default", path);
                DEFAULT_MATERIAL_PATH.to_owned()
            }
            None => DEFAULT_MATERIAL_PATH.to_owned(),
        }
    }

    /// The default material first, then every material a visible instance
    /// uses, in path order.
    fn active_material_paths(&self) -> Vec<String> {
        let mut used = BTreeSet::new();
        for instance in self.instances.values().filter(|i| i.is_visible) {
            used.insert(self.material_path(instance.material.as_deref()));
            for layer in &instance.material_layers {
                used.insert(self.material_path(Some(layer)));
            }
        }
        used.remove(DEFAULT_MATERIAL_PATH);

        std::iter::once(DEFAULT_MATERIAL_PATH.to_owned())
            .chain(used)
            .collect()
    }

    fn update_environment(&mut self, ctx: &RenderContext) {
        let environment = match &self.active_environment {
            Some(path) => self
                .environments
                .get_mut(path)
                .unwrap_or(&mut self.default_environment),
            None => &mut self.default_environment,
        };

        let light = environment
            .light_image_path()
            .and_then(|path| resolve_image(ctx, &mut self.images, path, true));
        let background = environment
            .background_image_path()
            .and_then(|path| resolve_image(ctx, &mut self.images, path, false));

        let images_changed = !same_image(&self.gpu.light_image, &light)
            || !same_image(&self.gpu.background_image, &background);

        if !environment.is_dirty() && !images_changed {
            return;
        }

        let data: EnvironmentData = environment.data(light.as_deref(), background.as_deref());
        self.gpu
            .environment_buffer
            .write(0, bytemuck::bytes_of(&data), &ctx.uploads);
        environment.clear_dirty();

        if images_changed {
            self.gpu.light_image = light;
            self.gpu.background_image = background;
            self.gpu.heaps_dirty = true;
        }
        trace!("Environment constants updated");
    }

    /// Resolves texture and sampler paths of the active materials and flushes
    /// them. Returns whether any material changed.
    fn update_materials(&mut self, ctx: &RenderContext) -> Result<bool, RenderError> {
        let active = self.active_material_paths();
        if active != self.gpu.active_materials {
            self.gpu.active_materials = active;
            self.gpu.heaps_dirty = true;
        }

        let mut changed = false;
        for path in &self.gpu.active_materials {
            let entry = match self.materials.get_mut(path) {
                Some(entry) => entry,
                None => continue,
            };
            let MaterialEntry {
                material,
                image_paths,
                sampler_paths,
            } = entry;

            for (texture, image_path) in image_paths.iter() {
                let image = resolve_image(ctx, &mut self.images, image_path, false);
                let current = material
                    .textures()
                    .iter()
                    .find(|binding| &binding.name == texture)
                    .and_then(|binding| binding.image.clone());
                if !same_image(&current, &image) {
                    material.set_image(texture, image)?;
                    self.gpu.heaps_dirty = true;
                }
            }

            for (texture, sampler_path) in sampler_paths.iter() {
                let sampler = self.samplers.get(sampler_path).copied();
                if sampler.is_none() {
                    warn!("Sampler {:?} is not in the scene", sampler_path);
                }
                let current = material
                    .textures()
                    .iter()
                    .find(|binding| &binding.name == texture)
                    .and_then(|binding| binding.sampler);
                if current != sampler {
                    material.set_sampler(texture, sampler)?;
                    self.gpu.heaps_dirty = true;
                }
            }

            changed |= material.update()?;
        }

        self.update_sampler_table(ctx)?;
        Ok(changed)
    }

    fn update_sampler_table(&mut self, ctx: &RenderContext) -> Result<(), RenderError> {
        let mut wanted = vec![Sampler::default()];
        for path in &self.gpu.active_materials {
            if let Some(entry) = self.materials.get(path) {
                wanted.extend(
                    entry
                        .material
                        .textures()
                        .iter()
                        .map(|binding| binding.sampler.unwrap_or_default()),
                );
            }
        }

        for sampler in wanted {
            let key = sampler.hash_value();
            if !self.gpu.samplers.contains_key(&key) {
                let gpu_sampler = ctx.device.create_sampler(sampler.desc())?;
                self.gpu.samplers.insert(key, gpu_sampler);
            }
        }
        Ok(())
    }

    fn gpu_sampler(&self, sampler: Sampler) -> Result<Arc<GpuSampler>, RenderError> {
        self.gpu
            .samplers
            .get(&sampler.hash_value())
            .cloned()
            .ok_or_else(|| RenderError::invalid_argument("sampler missing from the sampler table"))
    }

    /// Layer-miss entry points are only linked for materials used as layers.
    fn update_layer_shaders(&mut self, ctx: &RenderContext) {
        let mut wanted: HashMap<String, Arc<MaterialShader>> = HashMap::new();
        for unique in &self.gpu.unique_instances {
            for layer in &unique.layers {
                if let Some(entry) = self.materials.get(&layer.material) {
                    let shader = entry.material.shader();
                    wanted.insert(shader.id().to_owned(), shader.clone());
                }
            }
        }

        let mut library = ctx.library.lock();
        for id in wanted.keys() {
            if !self.gpu.layer_shaders.contains_key(id) {
                library.increment_refcount(id, EntryPoint::LayerMiss);
            }
        }
        for id in self.gpu.layer_shaders.keys() {
            if !wanted.contains_key(id) {
                library.decrement_refcount(id, EntryPoint::LayerMiss);
            }
        }
        drop(library);

        self.gpu.layer_shaders = wanted;
    }

    fn build_tlas(&mut self, ctx: &RenderContext) -> Result<(), RenderError> {
        let mut keys: HashMap<UniqueInstanceKey, u32> = HashMap::new();
        let mut unique_instances = Vec::new();
        let mut unique_indices = Vec::new();
        let mut tlas_instances = Vec::new();

        for (path, instance) in &self.instances {
            if !instance.is_visible {
                continue;
            }

            let blas = match self.geometries.get(&instance.geometry).and_then(Geometry::blas) {
                Some(blas) => blas,
                None => {
                    warn!(
                        "Instance {:?} skipped: geometry {:?} has no acceleration structure",
                        path, instance.geometry
                    );
                    continue;
                }
            };

            let material = self.material_path(instance.material.as_deref());
            let layers: Vec<LayerBinding> = instance
                .material_layers
                .iter()
                .enumerate()
                .map(|(index, layer)| LayerBinding {
                    material: self.material_path(Some(layer)),
                    geometry: instance.layer_geometry(index).to_owned(),
                })
                .collect();

            let key = UniqueInstanceKey {
                geometry: instance.geometry.clone(),
                material: material.clone(),
                layers: layer_fingerprint(&layers),
            };

            let next_index = unique_instances.len() as u32;
            let unique_index = *keys.entry(key).or_insert_with(|| {
                unique_instances.push(UniqueInstance {
                    geometry: instance.geometry.clone(),
                    material,
                    layers,
                    layer_table: None,
                });
                next_index
            });

            unique_indices.push(unique_index);
            tlas_instances.push(GeometryInstance::new(
                transform_rows(&instance.transform),
                instance.object_id as u32 & 0x00ff_ffff,
                0xff,
                unique_index,
                vk::GeometryInstanceFlagsKHR::empty(),
                blas.device_address(),
            ));
        }

        // Miss-table indices of each unique instance's layers.
        let mut next_layer = BUILT_IN_MISS_COUNT as u32;
        for unique in &mut unique_instances {
            if unique.layers.is_empty() {
                continue;
            }
            let table: Vec<u32> = (0..unique.layers.len() as u32)
                .map(|i| next_layer + i)
                .collect();
            next_layer += table.len() as u32;

            let bytes: &[u8] = bytemuck::cast_slice(&table);
            let buffer = ctx.device.create_buffer(
                BufferDesc::new_cpu_to_gpu(bytes.len(), vk::BufferUsageFlags::STORAGE_BUFFER),
                "layer table",
            )?;
            buffer.write_bytes(0, bytes);
            unique.layer_table = Some(buffer);
        }

        let instance_bytes: &[u8] = bytemuck::cast_slice(&tlas_instances);
        let instance_buffer = ctx.device.create_buffer(
            BufferDesc::new_cpu_to_gpu(
                instance_bytes.len().max(std::mem::size_of::<GeometryInstance>()),
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            )
            .alignment(16),
            "tlas instances",
        )?;
        instance_buffer.write_bytes(0, instance_bytes);

        let geometry = AccelerationStructureGeometry::Instances {
            instances_address: instance_buffer.device_address(),
            instance_count: tlas_instances.len() as u32,
        };
        let sizes = ctx.device.acceleration_structure_build_sizes(&geometry);
        let tlas = ctx.device.create_acceleration_structure(
            AccelerationStructureType::TopLevel,
            sizes.result_size,
            "scene tlas".to_owned(),
        )?;

        {
            let mut tasks = ctx.tasks.lock();
            let scratch = tasks.scratch(sizes.scratch_size)?;
            let list = tasks.command_list();
            list.build_acceleration_structure(
                &tlas,
                geometry,
                scratch.device_address,
                vec![instance_buffer, scratch.buffer.clone()],
            );
            list.uav_barrier(Some((&tlas).into()));
            tasks.complete_task()?;
            tasks.wait_for_task()?;
        }

        info!(
            "Built TLAS: {} instances, {} unique",
            tlas_instances.len(),
            unique_instances.len()
        );

        self.gpu.unique_instances = unique_instances;
        self.gpu.unique_indices = unique_indices;
        self.gpu.tlas_instances = tlas_instances;
        self.gpu.tlas = Some(tlas);
        self.gpu.heaps_dirty = true;
        Ok(())
    }

    fn build_descriptor_heaps(&mut self, ctx: &RenderContext) -> Result<(), RenderError> {
        let texture_count: usize = self
            .gpu
            .active_materials
            .iter()
            .filter_map(|path| self.materials.get(path))
            .map(|entry| entry.material.textures().len())
            .sum();

        let heap = ctx.device.create_descriptor_heap(
            DescriptorHeapKind::Resources,
            RESERVED_DESCRIPTOR_COUNT + ENVIRONMENT_DESCRIPTOR_COUNT + texture_count,
        )?;
        let sampler_heap = ctx
            .device
            .create_descriptor_heap(DescriptorHeapKind::Samplers, 1 + texture_count)?;

        let mut textures = vec![
            image_descriptor(&self.gpu.light_image),
            image_descriptor(&self.gpu.background_image),
        ];
        let mut samplers = vec![Descriptor::Sampler(self.gpu_sampler(Sampler::default())?)];
        let mut slots = HashMap::new();

        for path in &self.gpu.active_materials {
            let entry = match self.materials.get(path) {
                Some(entry) => entry,
                None => continue,
            };

            slots.insert(
                path.clone(),
                MaterialSlots {
                    texture_start: (ENVIRONMENT_TEXTURE_SLOT + textures.len()) as u32,
                    sampler_start: samplers.len() as u32,
                },
            );

            for binding in entry.material.textures() {
                textures.push(image_descriptor(&binding.image));
                samplers.push(Descriptor::Sampler(
                    self.gpu_sampler(binding.sampler.unwrap_or_default())?,
                ));
            }
        }

        heap.write(ENVIRONMENT_TEXTURE_SLOT, &textures)?;
        sampler_heap.write(0, &samplers)?;

        debug!(
            "Descriptor heaps rebuilt: {} textures, {} samplers",
            textures.len(),
            samplers.len()
        );

        self.gpu.material_slots = slots;
        self.gpu.descriptor_heap = Some(heap);
        self.gpu.sampler_heap = Some(sampler_heap);
        self.gpu.heaps_dirty = false;
        self.gpu.shader_tables_dirty = true;
        Ok(())
    }

    fn material_record(
        &self,
        material_path: &str,
        indices: &GeometryBuffers,
        vertices: &GeometryBuffers,
    ) -> Result<(&Material, HitRecordArgs), RenderError> {
        let entry = self.materials.get(material_path).ok_or_else(|| {
            RenderError::invalid_argument(format!("material {:?} is gone", material_path))
        })?;
        let slots = *self.gpu.material_slots.get(material_path).ok_or_else(|| {
            RenderError::invalid_argument(format!("material {:?} is not active", material_path))
        })?;
        Ok((
            &entry.material,
            record_args(indices, vertices, &entry.material, slots),
        ))
    }

    fn geometry_buffers(&self, path: &str) -> Result<&GeometryBuffers, RenderError> {
        self.geometries
            .get(path)
            .and_then(Geometry::buffers)
            .ok_or_else(|| {
                RenderError::invalid_argument(format!("geometry {:?} has no vertex data", path))
            })
    }

    fn build_shader_tables(&mut self, ctx: &RenderContext) -> Result<(), RenderError> {
        let mut library = ctx.library.lock();
        let mut identifier = |group: &str| {
            library.shader_identifier(group).ok_or_else(|| {
                RenderError::invalid_argument(format!("shader group {:?} is not linked", group))
            })
        };

        let mut hit_records = Vec::with_capacity(self.gpu.unique_instances.len() * SHADER_RECORD_STRIDE);
        let mut miss_records = Vec::new();
        write_record(&mut miss_records, &[0; SHADER_IDENTIFIER_SIZE], &HitRecordArgs::default());
        for group in [BACKGROUND_MISS_GROUP, RADIANCE_MISS_GROUP, SHADOW_MISS_GROUP] {
            write_record(&mut miss_records, &identifier(group)?, &HitRecordArgs::default());
        }

        for unique in &self.gpu.unique_instances {
            let buffers = self.geometry_buffers(&unique.geometry)?;
            let (material, mut args) = self.material_record(&unique.material, buffers, buffers)?;
            args.material_layer_count = unique.layers.len() as u32;
            args.layer_table = unique
                .layer_table
                .as_ref()
                .map_or(0, |table| table.device_address());
            write_record(
                &mut hit_records,
                &identifier(&hit_group_name(material.shader().id()))?,
                &args,
            );

            for layer in &unique.layers {
                let layer_buffers = self.geometry_buffers(&layer.geometry)?;
                if layer_buffers.vertex_count != buffers.vertex_count {
                    return Err(RenderError::invalid_argument(format!(
                        "layer geometry {:?} has {} vertices, {:?} has {}",
                        layer.geometry,
                        layer_buffers.vertex_count,
                        unique.geometry,
                        buffers.vertex_count
                    )));
                }

                let (layer_material, layer_args) =
                    self.material_record(&layer.material, buffers, layer_buffers)?;
                write_record(
                    &mut miss_records,
                    &identifier(&layer_miss_group_name(layer_material.shader().id()))?,
                    &layer_args,
                );
            }
        }
        drop(library);

        self.gpu.hit_groups = Some(create_shader_table(ctx, &hit_records, "hit group table")?);
        self.gpu.miss = Some(create_shader_table(ctx, &miss_records, "miss table")?);
        self.gpu.shader_tables_dirty = false;

        debug!(
            "Shader tables rebuilt: {} hit groups, {} miss records",
            hit_records.len() / SHADER_RECORD_STRIDE,
            miss_records.len() / SHADER_RECORD_STRIDE
        );
        Ok(())
    }
}

fn create_shader_table(
    ctx: &RenderContext,
    records: &[u8],
    name: &str,
) -> Result<ShaderTableRegion, RenderError> {
    let buffer = ctx.device.create_buffer(
        BufferDesc::new_cpu_to_gpu(
            records.len().max(SHADER_RECORD_STRIDE),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        )
        .alignment(SHADER_TABLE_ALIGNMENT as u64),
        name,
    )?;
    buffer.write_bytes(0, records);

    Ok(ShaderTableRegion {
        buffer,
        offset: 0,
        stride: SHADER_RECORD_STRIDE as u64,
        size: records.len() as u64,
    })
}

impl Scene {
    pub fn new(ctx: Arc<RenderContext>) -> Result<Self, RenderError> {
        let default_material = Material::new(
            ctx.clone(),
            DEFAULT_MATERIAL_PATH,
            ctx.default_material.clone(),
        );

        let gpu = SceneGpu {
            environment_buffer: TransferBuffer::new(
                &ctx.device,
                std::mem::size_of::<EnvironmentData>(),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                ResourceState::ConstantBuffer,
                "environment",
            )?,
            ground_plane_buffer: TransferBuffer::new(
                &ctx.device,
                std::mem::size_of::<GroundPlaneData>(),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                ResourceState::ConstantBuffer,
                "ground plane",
            )?,
            empty_alias_map: ctx.device.create_buffer(
                BufferDesc::new_gpu_only(16, vk::BufferUsageFlags::STORAGE_BUFFER),
                "empty alias map",
            )?,
            light_image: None,
            background_image: None,
            lights: Vec::new(),
            active_materials: Vec::new(),
            material_slots: HashMap::new(),
            samplers: HashMap::new(),
            layer_shaders: HashMap::new(),
            unique_instances: Vec::new(),
            unique_indices: Vec::new(),
            tlas_instances: Vec::new(),
            tlas: None,
            descriptor_heap: None,
            sampler_heap: None,
            hit_groups: None,
            miss: None,
            heaps_dirty: true,
            shader_tables_dirty: true,
        };

        let mut state = SceneState {
            paths: HashMap::new(),
            images: HashMap::new(),
            samplers: HashMap::new(),
            materials: BTreeMap::new(),
            geometries: BTreeMap::new(),
            modified_geometries: BTreeSet::new(),
            instances: BTreeMap::new(),
            instances_changed: true,
            next_instance: 0,
            environments: HashMap::new(),
            active_environment: None,
            default_environment: Environment::new(),
            ground_plane: GroundPlane::new(),
            ground_plane_dirty: true,
            lights: LightList::default(),
            bounds: None,
            flip_image_y: false,
            retired_materials: Vec::new(),
            retired_geometries: Vec::new(),
            gpu,
        };
        state.claim(DEFAULT_MATERIAL_PATH, PathKind::Material)?;
        state
            .materials
            .insert(DEFAULT_MATERIAL_PATH.to_owned(), MaterialEntry::new(default_material));

        Ok(Self {
            ctx,
            state: Mutex::new(state),
        })
    }

    pub(crate) fn set_flip_image_y(&self, flip: bool) {
        self.state.lock().flip_image_y = flip;
    }

    pub fn set_image_descriptor(&self, path: &str, descriptor: ImageDescriptor) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        state.claim(path, PathKind::Image)?;
        state.images.insert(
            path.to_owned(),
            ImageEntry {
                descriptor: Some(descriptor),
                image: None,
            },
        );
        Ok(())
    }

    /// Decodes an image file. A file that cannot be loaded is logged and
    /// leaves the path bound to no texture.
    pub fn set_image_from_path(
        &self,
        path: &str,
        file_path: impl AsRef<Path>,
        linearize: bool,
    ) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        state.claim(path, PathKind::Image)?;

        let file_path = file_path.as_ref();
        let descriptor = match load_image_file(file_path, state.flip_image_y) {
            Ok(descriptor) => Some(descriptor.linearize(linearize)),
            Err(err) => {
                error!("Failed to load image {:?}: {:#}", file_path, err);
                None
            }
        };

        state.images.insert(
            path.to_owned(),
            ImageEntry {
                descriptor,
                image: None,
            },
        );
        Ok(())
    }

    pub fn set_sampler_properties(&self, path: &str, properties: &Properties) -> Result<(), RenderError> {
        let sampler = Sampler::from_properties(properties)?;
        let mut state = self.state.lock();
        state.claim(path, PathKind::Sampler)?;
        state.samplers.insert(path.to_owned(), sampler);
        Ok(())
    }

    /// Binds `path` to a material of the given type (`built_in`, `materialx`
    /// or `materialx_path`). Texture and sampler paths carry over to the new
    /// material where it has the same texture names.
    pub fn set_material_type(&self, path: &str, type_name: &str, document: &str) -> Result<(), RenderError> {
        let definition = self.ctx.material_definition(type_name, document)?;

        let mut state = self.state.lock();
        state.claim(path, PathKind::Material)?;

        if let Some(entry) = state.materials.get(path) {
            if Arc::ptr_eq(entry.material.definition(), &definition) {
                return Ok(());
            }
        }

        let mut entry = MaterialEntry::new(Material::new(self.ctx.clone(), path, definition));
        if let Some(old) = state.materials.remove(path) {
            let material = &entry.material;
            entry.image_paths = old
                .image_paths
                .into_iter()
                .filter(|(name, _)| material.is_texture_name(name))
                .collect();
            entry.sampler_paths = old
                .sampler_paths
                .into_iter()
                .filter(|(name, _)| material.is_texture_name(name))
                .collect();
            state.retired_materials.push(old.material);
            state.gpu.heaps_dirty = true;
        }

        state.materials.insert(path.to_owned(), entry);
        Ok(())
    }

    /// Sets uniforms, texture image paths (`<texture>`) and texture sampler
    /// paths (`<texture>_sampler`). A missing material is created as the
    /// built-in type. Either every property applies or none does.
    pub fn set_material_properties(&self, path: &str, properties: &Properties) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        if !state.materials.contains_key(path) {
            state.claim(path, PathKind::Material)?;
            let material = Material::new(self.ctx.clone(), path, self.ctx.default_material.clone());
            state
                .materials
                .insert(path.to_owned(), MaterialEntry::new(material));
        }

        let entry = match state.materials.get_mut(path) {
            Some(entry) => entry,
            None => return Err(RenderError::invalid_argument(format!("no material {:?}", path))),
        };

        let texture_of_sampler = |name: &str| {
            name.strip_suffix("_sampler")
                .filter(|texture| entry.material.is_texture_name(texture))
                .map(str::to_owned)
        };

        let path_value = |name: &str, value: &PropertyValue| -> Result<Option<String>, RenderError> {
            match value {
                PropertyValue::Empty => Ok(None),
                value => value
                    .as_path()
                    .map(|path| Some(path.to_owned()))
                    .ok_or_else(|| RenderError::PropertyType {
                        name: name.to_owned(),
                        expected: "path",
                        found: value.kind().name(),
                    }),
            }
        };

        enum Change {
            Uniform,
            Image(String, Option<String>),
            Sampler(String, Option<String>),
        }

        let mut changes = Vec::with_capacity(properties.len());
        for (name, value) in properties {
            let name = name.as_str();
            if entry.material.is_texture_name(name) {
                changes.push(Change::Image(name.to_owned(), path_value(name, value)?));
            } else if let Some(texture) = texture_of_sampler(name) {
                changes.push(Change::Sampler(texture, path_value(name, value)?));
            } else {
                entry.material.check(name, value)?;
                changes.push(Change::Uniform);
            }
        }

        for ((name, value), change) in properties.iter().zip(changes) {
            match change {
                Change::Uniform => entry.material.set(name, value)?,
                Change::Image(texture, Some(image)) => {
                    entry.image_paths.insert(texture, image);
                }
                Change::Image(texture, None) => {
                    entry.image_paths.remove(&texture);
                    entry.material.set_image(&texture, None)?;
                }
                Change::Sampler(texture, Some(sampler)) => {
                    entry.sampler_paths.insert(texture, sampler);
                }
                Change::Sampler(texture, None) => {
                    entry.sampler_paths.remove(&texture);
                    entry.material.set_sampler(&texture, None)?;
                }
            }
        }
        Ok(())
    }

    /// Replaces the geometry at `path`. Instances referring to it pick up
    /// the new data on the next update.
    pub fn set_geometry_descriptor(&self, path: &str, descriptor: GeometryDescriptor) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        state.claim(path, PathKind::Geometry)?;

        let geometry = Geometry::new(self.ctx.clone(), path, descriptor);
        if let Some(old) = state.geometries.insert(path.to_owned(), geometry) {
            state.retired_geometries.push(old);
        }
        state.modified_geometries.insert(path.to_owned());
        Ok(())
    }

    pub fn set_environment_properties(&self, path: &str, properties: &Properties) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        state.claim(path, PathKind::Environment)?;
        state
            .environments
            .entry(path.to_owned())
            .or_default()
            .set_properties(properties)
    }

    /// Makes the environment at `path` the active one; an empty path selects
    /// the default environment.
    pub fn set_environment(&self, path: &str) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        if path.is_empty() {
            state.active_environment = None;
            state.default_environment.mark_dirty();
            return Ok(());
        }

        let environment = state.environments.get_mut(path).ok_or_else(|| {
            RenderError::invalid_argument(format!("no environment {:?}", path))
        })?;
        environment.mark_dirty();
        state.active_environment = Some(path.to_owned());
        Ok(())
    }

    pub fn set_ground_plane(&self, ground_plane: GroundPlane) {
        let mut state = self.state.lock();
        state.ground_plane = ground_plane;
        state.ground_plane_dirty = true;
    }

    pub fn set_ground_plane_properties(&self, properties: &Properties) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        state.ground_plane.set_properties(properties)?;
        state.ground_plane_dirty = true;
        Ok(())
    }

    /// Adds one instance of `geometry_path` per descriptor and returns their
    /// paths. Descriptors with an empty path get a generated one. Nothing is
    /// added if any descriptor is invalid.
    pub fn add_instances(
        &self,
        geometry_path: &str,
        descriptors: &[InstanceDescriptor],
    ) -> Result<Vec<String>, RenderError> {
        let mut state = self.state.lock();
        if !state.geometries.contains_key(geometry_path) {
            return Err(RenderError::invalid_argument(format!(
                "no geometry {:?}",
                geometry_path
            )));
        }

        let mut staged = Vec::with_capacity(descriptors.len());
        let mut next_instance = state.next_instance;
        for descriptor in descriptors {
            let path = if descriptor.path.is_empty() {
                next_instance += 1;
                format!("{}/instance{}", geometry_path, next_instance)
            } else {
                descriptor.path.clone()
            };

            if state.paths.contains_key(&path) || staged.iter().any(|(p, _)| p == &path) {
                return Err(RenderError::invalid_argument(format!(
                    "instance path {:?} is already in use",
                    path
                )));
            }

            let mut instance = Instance::new(geometry_path);
            instance.set_properties(&descriptor.properties)?;
            staged.push((path, instance));
        }

        state.next_instance = next_instance;
        let mut paths = Vec::with_capacity(staged.len());
        for (path, instance) in staged {
            state.claim(&path, PathKind::Instance)?;
            state.instances.insert(path.clone(), instance);
            paths.push(path);
        }
        state.instances_changed = true;
        Ok(paths)
    }

    pub fn remove_instances(&self, paths: &[String]) {
        let mut state = self.state.lock();
        for path in paths {
            if state.instances.remove(path).is_some() {
                state.paths.remove(path);
                state.instances_changed = true;
            } else {
                warn!("Cannot remove {:?}: no such instance", path);
            }
        }
    }

    /// Applies `properties` to every listed instance, or to none of them.
    pub fn set_instance_properties(&self, paths: &[String], properties: &Properties) -> Result<(), RenderError> {
        let mut state = self.state.lock();

        let mut staged = Vec::with_capacity(paths.len());
        for path in paths {
            let mut instance = state
                .instances
                .get(path)
                .cloned()
                .ok_or_else(|| RenderError::invalid_argument(format!("no instance {:?}", path)))?;
            instance.set_properties(properties)?;
            staged.push((path, instance));
        }

        for (path, instance) in staged {
            state.instances.insert(path.clone(), instance);
        }
        state.instances_changed = true;
        Ok(())
    }

    pub fn add_light_pointer(&self, light_type: &str) -> Result<Light, RenderError> {
        self.state.lock().lights.add(light_type)
    }

    pub fn set_bounds(&self, min: Vec3, max: Vec3) {
        self.state.lock().bounds = Some((min.min(max), min.max(max)));
    }

    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        self.state.lock().bounds
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    /// An empty scene needs no bounds.
    pub fn has_valid_bounds(&self) -> bool {
        let state = self.state.lock();
        state.instances.is_empty() || state.bounds.is_some()
    }

    /// Diagonal of the bounds, used to place rays that must leave the scene.
    pub fn scene_size(&self) -> f32 {
        self.state
            .lock()
            .bounds
            .map_or(1.0, |(min, max)| (max - min).length().max(1e-3))
    }

    /// Packed distant lights, as of the last update.
    pub fn lights(&self) -> Vec<DistantLightData> {
        self.state.lock().gpu.lights.clone()
    }

    /// Brings the GPU copy of the scene up to date, short of the shader
    /// tables, which need the linked pipeline. Material updates may leave the
    /// shader library dirty; the caller rebuilds it before
    /// `update_shader_tables`.
    pub fn update(&self) -> Result<(), RenderError> {
        let ctx = &*self.ctx;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.retired_materials.is_empty() || !state.retired_geometries.is_empty() {
            ctx.tasks.lock().wait_for_task()?;
            state.retired_materials.clear();
            state.retired_geometries.clear();
        }

        state.update_environment(ctx);

        if state.ground_plane_dirty {
            let data = state.ground_plane.data();
            state
                .gpu
                .ground_plane_buffer
                .write(0, bytemuck::bytes_of(&data), &ctx.uploads);
            state.ground_plane_dirty = false;
        }
        state.gpu.lights = state.lights.data();

        let modified: Vec<String> = std::mem::take(&mut state.modified_geometries)
            .into_iter()
            .collect();
        let mut updated = Vec::with_capacity(modified.len());
        for path in &modified {
            if let Some(geometry) = state.geometries.get_mut(path) {
                match geometry.update() {
                    Ok(_) => updated.push(path.clone()),
                    Err(err) => error!("Geometry {:?} skipped: {}", path, err),
                }
            }
        }
        ctx.vertex_pool.lock().flush();

        if state.update_materials(ctx)? {
            state.gpu.shader_tables_dirty = true;
        }

        ctx.upload_transfer_buffers();

        for path in &updated {
            if let Some(geometry) = state.geometries.get_mut(path) {
                geometry.update_blas()?;
            }
        }

        if state.instances_changed || !modified.is_empty() || state.gpu.tlas.is_none() {
            if state.gpu.tlas.take().is_some() {
                ctx.tasks.lock().flush()?;
            }
            state.build_tlas(ctx)?;
            state.instances_changed = false;
        }
        // A layer material may have changed shader without touching the TLAS.
        state.update_layer_shaders(ctx);

        if state.gpu.heaps_dirty {
            state.build_descriptor_heaps(ctx)?;
        }
        Ok(())
    }

    /// Forces the shader tables to be rebuilt, after the pipeline was relinked.
    pub fn invalidate_shader_tables(&self) {
        self.state.lock().gpu.shader_tables_dirty = true;
    }

    /// Writes the hit-group and miss tables from the current pipeline's
    /// shader identifiers. The shader library must be rebuilt.
    pub fn update_shader_tables(&self) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        if state.gpu.shader_tables_dirty {
            state.build_shader_tables(&self.ctx)?;
        }
        Ok(())
    }

    /// `None` until the first update.
    pub fn resources(&self) -> Option<SceneResources> {
        let state = self.state.lock();
        let gpu = &state.gpu;

        let alias_map = gpu
            .light_image
            .as_ref()
            .and_then(|image| image.alias_map.as_ref())
            .unwrap_or(&gpu.empty_alias_map);

        Some(SceneResources {
            tlas: gpu.tlas.clone()?,
            environment: BufferBinding::whole(gpu.environment_buffer.buffer()),
            environment_alias_map: BufferBinding::whole(alias_map),
            ground_plane: BufferBinding::whole(gpu.ground_plane_buffer.buffer()),
            descriptor_heap: gpu.descriptor_heap.clone()?,
            sampler_heap: gpu.sampler_heap.clone()?,
            hit_groups: gpu.hit_groups.clone()?,
            miss: gpu.miss.clone()?,
        })
    }

    pub fn unique_instance_count(&self) -> usize {
        self.state.lock().gpu.unique_instances.len()
    }

    /// Unique-instance index of each visible instance, in path order.
    pub fn unique_instance_indices(&self) -> Vec<u32> {
        self.state.lock().gpu.unique_indices.clone()
    }

    pub fn tlas_instances(&self) -> Vec<GeometryInstance> {
        self.state.lock().gpu.tlas_instances.clone()
    }

    pub fn hit_group_record_count(&self) -> usize {
        self.state
            .lock()
            .gpu
            .hit_groups
            .as_ref()
            .map_or(0, |region| region.record_count() as usize)
    }

    pub fn miss_record_count(&self) -> usize {
        self.state
            .lock()
            .gpu
            .miss
            .as_ref()
            .map_or(0, |region| region.record_count() as usize)
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.gpu.layer_shaders.is_empty() {
            return;
        }

        let mut library = self.ctx.library.lock();
        for id in state.gpu.layer_shaders.keys() {
            library.decrement_refcount(id, EntryPoint::LayerMiss);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::VertexData, properties::properties, shader_library::DEFAULT_SHADER_ID,
        standard_surface,
    };
    use aurora_backend::{
        headless::HeadlessDevice, shader_compiler::PassthroughShaderCompiler, Device,
    };
    use glam::Vec2;

    fn context() -> Arc<RenderContext> {
        RenderContext::new(
            Device::new(Arc::new(HeadlessDevice::new(3))),
            Arc::new(PassthroughShaderCompiler),
            3,
        )
    }

    fn triangle() -> GeometryDescriptor {
        GeometryDescriptor::from_data(
            VertexData::new(&[Vec3::ZERO, Vec3::X, Vec3::Y])
                .texcoords(&[Vec2::ZERO, Vec2::X, Vec2::Y]),
        )
    }

    /// Updates the scene and links a pipeline the way the renderer does.
    fn update_and_link(ctx: &RenderContext, scene: &Scene) {
        scene.update().unwrap();
        ctx.library.lock().rebuild().unwrap();
        scene.update_shader_tables().unwrap();
    }

    fn scene_with_shared_entry_points(ctx: &Arc<RenderContext>) -> Scene {
        let scene = Scene::new(ctx.clone()).unwrap();
        let mut library = ctx.library.lock();
        for entry in EntryPoint::SHARED {
            library.increment_refcount(DEFAULT_SHADER_ID, entry);
        }
        drop(library);
        scene
    }

    fn translated(x: f32) -> InstanceDescriptor {
        InstanceDescriptor::new("").property("transform", Mat4::from_translation(Vec3::new(x, 0.0, 0.0)))
    }

    #[test]
    fn identical_instances_share_one_record() {
        let ctx = context();
        let scene = scene_with_shared_entry_points(&ctx);
        scene.set_geometry_descriptor("/geometry/tri", triangle()).unwrap();
        scene
            .set_material_properties("/materials/red", &properties([("base_color", Vec3::X)]))
            .unwrap();

        let descriptors: Vec<InstanceDescriptor> = (0..100)
            .map(|i| translated(i as f32).property("material", PropertyValue::Path("/materials/red".into())))
            .collect();
        let paths = scene.add_instances("/geometry/tri", &descriptors).unwrap();
        assert_eq!(paths.len(), 100);
        scene.set_bounds(Vec3::ZERO, Vec3::new(100.0, 1.0, 0.0));

        update_and_link(&ctx, &scene);

        assert_eq!(scene.unique_instance_count(), 1);
        assert!(scene.unique_instance_indices().iter().all(|&i| i == 0));
        assert_eq!(scene.hit_group_record_count(), 1);
        assert_eq!(scene.miss_record_count(), BUILT_IN_MISS_COUNT);

        let instances = scene.tlas_instances();
        assert_eq!(instances.len(), 100);
        assert!(instances.iter().all(|i| i.sbt_offset() == 0 && i.mask() == 0xff));
        assert!(instances
            .iter()
            .all(|i| i.flags() == vk::GeometryInstanceFlagsKHR::empty()));
    }

    #[test]
    fn unique_instances_follow_distinct_tuples() {
        let ctx = context();
        let scene = scene_with_shared_entry_points(&ctx);
        scene.set_geometry_descriptor("/geometry/a", triangle()).unwrap();
        scene.set_geometry_descriptor("/geometry/b", triangle()).unwrap();
        scene
            .set_material_properties("/materials/m", &properties([("metalness", 1.0f32)]))
            .unwrap();

        let with_material =
            |x: f32| translated(x).property("material", PropertyValue::Path("/materials/m".into()));
        let layered = |x: f32| {
            with_material(x).property(
                "material_layers",
                PropertyValue::Strings(vec!["/materials/m".into()]),
            )
        };

        scene
            .add_instances("/geometry/a", &[translated(0.0), translated(1.0), with_material(2.0)])
            .unwrap();
        scene
            .add_instances("/geometry/b", &[with_material(3.0), layered(4.0), layered(5.0)])
            .unwrap();
        let hidden = scene
            .add_instances("/geometry/b", &[translated(6.0).property("is_visible", false)])
            .unwrap();
        scene.set_bounds(Vec3::ZERO, Vec3::splat(6.0));

        update_and_link(&ctx, &scene);

        // (a, default), (a, m), (b, m), (b, m + layer m)
        assert_eq!(scene.unique_instance_count(), 4);
        assert_eq!(scene.tlas_instances().len(), 6);
        assert_eq!(scene.hit_group_record_count(), 4);
        assert_eq!(scene.miss_record_count(), BUILT_IN_MISS_COUNT + 1);

        // The hidden instance is the only (b, default) pairing, so showing it
        // adds both a TLAS entry and a hit-group record of its own.
        scene
            .set_instance_properties(&hidden, &properties([("is_visible", true)]))
            .unwrap();
        update_and_link(&ctx, &scene);
        assert_eq!(scene.tlas_instances().len(), 7);
        assert_eq!(scene.unique_instance_count(), 5);
        assert_eq!(scene.hit_group_record_count(), 5);

        let indices = scene.unique_instance_indices();
        let distinct: BTreeSet<u32> = indices.iter().copied().collect();
        assert_eq!(distinct, (0..5).collect());
    }

    #[test]
    fn layer_geometry_must_match_vertex_count() {
        let ctx = context();
        let scene = scene_with_shared_entry_points(&ctx);
        scene.set_geometry_descriptor("/geometry/tri", triangle()).unwrap();
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
                        PropertyValue::Strings(vec!["/materials/missing".into()]),
                    )
                    .property(
                        "geometry_layers",
                        PropertyValue::Strings(vec!["/geometry/quad".into()]),
                    )],
            )
            .unwrap();
        scene.set_bounds(Vec3::ZERO, Vec3::ONE);

        scene.update().unwrap();
        ctx.library.lock().rebuild().unwrap();
        assert!(scene.update_shader_tables().is_err());
    }

    #[test]
    fn transform_copy_is_row_major_three_by_four() {
        let transform = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let rows = transform_rows(&transform);
        assert_eq!(
            rows,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
    }

    #[test]
    fn record_layout_matches_shader() {
        assert_eq!(std::mem::size_of::<HitRecordArgs>(), 88);
        assert_eq!(SHADER_RECORD_STRIDE, 128);
    }

    #[test]
    fn invalid_material_properties_change_nothing() {
        let ctx = context();
        let scene = Scene::new(ctx).unwrap();
        scene
            .set_material_properties("/materials/m", &properties([("metalness", 0.25f32)]))
            .unwrap();

        let result = scene.set_material_properties(
            "/materials/m",
            &properties([
                ("metalness", PropertyValue::Float(1.0)),
                ("no_such_field", PropertyValue::Float(1.0)),
            ]),
        );
        assert!(result.is_err());

        let state = scene.state.lock();
        let material = &state.materials["/materials/m"].material;
        assert_eq!(material.get::<f32>("metalness"), 0.25);
    }

    #[test]
    fn paths_are_typed() {
        let scene = Scene::new(context()).unwrap();
        scene.set_geometry_descriptor("/things/a", triangle()).unwrap();
        assert!(scene
            .set_environment_properties("/things/a", &Properties::new())
            .is_err());
        assert!(scene.add_instances("/geometry/none", &[translated(0.0)]).is_err());
    }

    #[test]
    fn texture_paths_reach_the_heap() {
        let ctx = context();
        let scene = scene_with_shared_entry_points(&ctx);
        scene
            .set_image_descriptor(
                "/images/white",
                ImageDescriptor::from_pixels(
                    crate::image::ImageFormat::Rgba8Srgb,
                    1,
                    1,
                    vec![255; 4],
                ),
            )
            .unwrap();
        scene
            .set_sampler_properties(
                "/samplers/clamp",
                &properties([("address_mode_u", "clamp")]),
            )
            .unwrap();
        scene
            .set_material_properties(
                "/materials/textured",
                &properties([
                    ("base_color_image", PropertyValue::Path("/images/white".into())),
                    (
                        "base_color_image_sampler",
                        PropertyValue::Path("/samplers/clamp".into()),
                    ),
                ]),
            )
            .unwrap();
        scene.set_geometry_descriptor("/geometry/tri", triangle()).unwrap();
        scene
            .add_instances(
                "/geometry/tri",
                &[translated(0.0).property("material", PropertyValue::Path("/materials/textured".into()))],
            )
            .unwrap();
        scene.set_bounds(Vec3::ZERO, Vec3::ONE);

        update_and_link(&ctx, &scene);

        let resources = scene.resources().unwrap();
        let textures_per_material = crate::standard_surface::TEXTURE_NAMES.len();
        assert_eq!(
            resources.descriptor_heap.len(),
            RESERVED_DESCRIPTOR_COUNT + ENVIRONMENT_DESCRIPTOR_COUNT + 2 * textures_per_material
        );
        assert_eq!(resources.sampler_heap.len(), 1 + 2 * textures_per_material);

        // Default material first, then the textured one; base color is its
        // first texture.
        let slot = ENVIRONMENT_TEXTURE_SLOT + ENVIRONMENT_DESCRIPTOR_COUNT + textures_per_material;
        assert!(matches!(
            resources.descriptor_heap.slot(slot),
            Some(Descriptor::SampledImage(_))
        ));
        assert!(matches!(
            resources.descriptor_heap.slot(ENVIRONMENT_TEXTURE_SLOT),
            Some(Descriptor::Null)
        ));
    }

    #[test]
    fn hit_records_carry_heap_indices() {
        let ctx = context();
        let scene = scene_with_shared_entry_points(&ctx);
        scene.set_geometry_descriptor("/geometry/tri", triangle()).unwrap();
        scene
            .set_material_properties("/m/a", &properties([("metalness", 1.0f32)]))
            .unwrap();
        scene
            .add_instances(
                "/geometry/tri",
                &[
                    InstanceDescriptor::new("/i/default"),
                    InstanceDescriptor::new("/i/a").property("material", PropertyValue::Path("/m/a".into())),
                ],
            )
            .unwrap();
        update_and_link(&ctx, &scene);

        let state = scene.state.lock();
        let default = state.gpu.material_slots[DEFAULT_MATERIAL_PATH];
        let a = state.gpu.material_slots["/m/a"];
        let texture_count = standard_surface::TEXTURE_NAMES.len() as u32;

        let first = (ENVIRONMENT_TEXTURE_SLOT + ENVIRONMENT_DESCRIPTOR_COUNT) as u32;
        assert_eq!(default.texture_start, first);
        assert_eq!(default.sampler_start, 1);
        assert_eq!(a.texture_start, first + texture_count);
        assert_eq!(a.sampler_start, 1 + texture_count);
    }
}
