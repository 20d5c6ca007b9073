use super::{
    commands,
    descriptors::{self, DescriptorLayouts, MAX_HEAP_DESCRIPTORS},
    physical_device::PhysicalDevice,
    pipeline,
};
use crate::{
    bytes::align_up,
    command::CommandList,
    descriptor::{Descriptor, DescriptorHeapKind},
    device::{DeviceProperties, RenderDevice},
    pipeline::{ComputePipelineDesc, RawRayTracingPipeline, RayTracingPipelineDesc},
    ray_tracing::{
        AccelerationStructureGeometry, AccelerationStructureSizes, AccelerationStructureType,
        RawAccelerationStructure, ACCELERATION_STRUCTURE_ALIGNMENT,
    },
    resource::{BufferDesc, ImageDesc, MemoryLocation, RawBuffer, ResourceId, SamplerDesc},
    BackendError,
};
use anyhow::Result;
use ash::{extensions::khr, vk};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
    AllocatorDebugSettings,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    mem::ManuallyDrop,
    os::raw::c_char,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub(crate) enum VulkanResource {
    Buffer {
        raw: vk::Buffer,
        allocation: Allocation,
    },
    Image {
        raw: vk::Image,
        view: vk::ImageView,
        allocation: Allocation,
    },
    Sampler(vk::Sampler),
    AccelerationStructure {
        raw: vk::AccelerationStructureKHR,
        buffer: vk::Buffer,
        allocation: Allocation,
    },
    Pipeline(vk::Pipeline),
    DescriptorHeap {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    },
}

struct CommandAllocator {
    pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    used: usize,
    descriptor_pool: vk::DescriptorPool,
}

pub struct VulkanDevice {
    pub raw: ash::Device,
    pub pdevice: Arc<PhysicalDevice>,
    pub(crate) queue: vk::Queue,
    pub(crate) queue_family_index: u32,
    queue_lock: Mutex<()>,

    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) layouts: DescriptorLayouts,

    pub acceleration_structure_ext: khr::AccelerationStructure,
    pub ray_tracing_pipeline_ext: khr::RayTracingPipeline,
    pub ray_tracing_pipeline_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    pub(crate) null_descriptors: bool,

    properties: DeviceProperties,

    timeline: vk::Semaphore,
    last_signaled: AtomicU64,

    command_allocators: Vec<Mutex<CommandAllocator>>,
    setup: Mutex<(vk::CommandPool, vk::CommandBuffer)>,

    pub(crate) resources: Mutex<HashMap<ResourceId, VulkanResource>>,
    pending_releases: Mutex<Vec<(u64, VulkanResource)>>,
    next_id: AtomicU64,
}

// The ray tracing properties struct carries a raw `p_next` pointer which is
// never dereferenced after creation.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

fn supported_extensions(pdevice: &PhysicalDevice) -> Result<HashSet<String>> {
    unsafe {
        let extension_properties = pdevice
            .instance
            .raw
            .enumerate_device_extension_properties(pdevice.raw)?;

        Ok(extension_properties
            .iter()
            .map(|ext| {
                std::ffi::CStr::from_ptr(ext.extension_name.as_ptr() as *const c_char)
                    .to_string_lossy()
                    .as_ref()
                    .to_owned()
            })
            .collect())
    }
}

impl VulkanDevice {
    pub fn create(pdevice: &Arc<PhysicalDevice>, command_allocator_count: usize) -> Result<Self> {
        assert!(command_allocator_count > 0);

        let supported_extensions = supported_extensions(pdevice)?;

        let mut device_extension_names = vec![
            vk::ExtDescriptorIndexingFn::name().as_ptr(),
            vk::KhrMaintenance3Fn::name().as_ptr(),
            vk::KhrDeferredHostOperationsFn::name().as_ptr(),
            vk::KhrBufferDeviceAddressFn::name().as_ptr(),
            vk::KhrAccelerationStructureFn::name().as_ptr(),
            vk::KhrRayTracingPipelineFn::name().as_ptr(),
        ];

        unsafe {
            for &ext in &device_extension_names {
                let ext = std::ffi::CStr::from_ptr(ext).to_string_lossy();
                if !supported_extensions.contains(ext.as_ref()) {
                    anyhow::bail!("Device extension not supported: {}", ext);
                }
            }
        }

        let null_descriptors = supported_extensions.contains("VK_EXT_robustness2");
        if null_descriptors {
            device_extension_names.push(vk::ExtRobustness2Fn::name().as_ptr());
        } else {
            info!("VK_EXT_robustness2 not supported; empty heap slots keep stale descriptors");
        }

        let universal_queue = if let Some(qf) = pdevice.universal_queue_family() {
            qf
        } else {
            anyhow::bail!("No suitable render queue found");
        };

        let priorities = [1.0];
        let universal_queue_info = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(universal_queue.index)
            .queue_priorities(&priorities)
            .build()];

        let mut descriptor_indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
        let mut buffer_device_address = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
        let mut timeline_semaphore = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_tracing_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut robustness2 = vk::PhysicalDeviceRobustness2FeaturesEXT::default();

        unsafe {
            let instance = &pdevice.instance.raw;

            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut descriptor_indexing)
                .push_next(&mut buffer_device_address)
                .push_next(&mut timeline_semaphore)
                .push_next(&mut acceleration_structure_features)
                .push_next(&mut ray_tracing_pipeline_features);

            if null_descriptors {
                features2 = features2.push_next(&mut robustness2);
            }

            let mut features2 = features2.build();

            instance.get_physical_device_features2(pdevice.raw, &mut features2);

            debug!("{:#?}", &descriptor_indexing);
            debug!("{:#?}", &acceleration_structure_features);
            debug!("{:#?}", &ray_tracing_pipeline_features);

            #[allow(clippy::deprecated_cfg_attr)]
            #[cfg_attr(rustfmt, rustfmt_skip)]
            {
                let required = [
                    ("runtimeDescriptorArray", descriptor_indexing.runtime_descriptor_array),
                    ("descriptorBindingPartiallyBound", descriptor_indexing.descriptor_binding_partially_bound),
                    ("descriptorBindingSampledImageUpdateAfterBind", descriptor_indexing.descriptor_binding_sampled_image_update_after_bind),
                    ("descriptorBindingStorageImageUpdateAfterBind", descriptor_indexing.descriptor_binding_storage_image_update_after_bind),
                    ("descriptorBindingUpdateUnusedWhilePending", descriptor_indexing.descriptor_binding_update_unused_while_pending),
                    ("shaderSampledImageArrayNonUniformIndexing", descriptor_indexing.shader_sampled_image_array_non_uniform_indexing),
                    ("bufferDeviceAddress", buffer_device_address.buffer_device_address),
                    ("timelineSemaphore", timeline_semaphore.timeline_semaphore),
                    ("accelerationStructure", acceleration_structure_features.acceleration_structure),
                    ("rayTracingPipeline", ray_tracing_pipeline_features.ray_tracing_pipeline),
                ];

                for (name, supported) in required {
                    if supported == 0 {
                        anyhow::bail!("Required device feature not supported: {}", name);
                    }
                }
            }

            let device_create_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(&universal_queue_info)
                .enabled_extension_names(&device_extension_names)
                .push_next(&mut features2)
                .build();

            let device = instance.create_device(pdevice.raw, &device_create_info, None)?;
            info!("Created a Vulkan device");

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device: pdevice.raw,
                debug_settings: AllocatorDebugSettings {
                    log_leaks_on_shutdown: true,
                    log_memory_information: true,
                    ..Default::default()
                },
                buffer_device_address: true,
                allocation_sizes: Default::default(),
            })?;

            let layouts = DescriptorLayouts::new(&device)?;

            let acceleration_structure_ext = khr::AccelerationStructure::new(instance, &device);
            let ray_tracing_pipeline_ext = khr::RayTracingPipeline::new(instance, &device);

            let ray_tracing_pipeline_properties = {
                let mut rt = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
                let mut properties2 = vk::PhysicalDeviceProperties2::builder()
                    .push_next(&mut rt)
                    .build();
                instance.get_physical_device_properties2(pdevice.raw, &mut properties2);
                rt
            };

            let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let timeline = device.create_semaphore(
                &vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info),
                None,
            )?;

            let create_pool = || {
                device.create_command_pool(
                    &vk::CommandPoolCreateInfo::builder()
                        .queue_family_index(universal_queue.index)
                        .flags(vk::CommandPoolCreateFlags::TRANSIENT),
                    None,
                )
            };

            let command_allocators = (0..command_allocator_count)
                .map(|_| -> Result<Mutex<CommandAllocator>> {
                    Ok(Mutex::new(CommandAllocator {
                        pool: create_pool()?,
                        command_buffers: Vec::new(),
                        used: 0,
                        descriptor_pool: descriptors::create_dispatch_descriptor_pool(&device)?,
                    }))
                })
                .collect::<Result<Vec<_>>>()?;

            let setup_pool = device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(universal_queue.index)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )?;
            let setup_cb = device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_buffer_count(1)
                    .command_pool(setup_pool)
                    .level(vk::CommandBufferLevel::PRIMARY),
            )?[0];

            let properties = DeviceProperties {
                name: pdevice.name(),
                shader_group_handle_size: ray_tracing_pipeline_properties.shader_group_handle_size,
                max_ray_recursion_depth: ray_tracing_pipeline_properties
                    .max_ray_recursion_depth,
                supports_shared_handles: false,
            };

            info!("Device properties: {:?}", properties);

            Ok(Self {
                queue: device.get_device_queue(universal_queue.index, 0),
                queue_family_index: universal_queue.index,
                queue_lock: Mutex::new(()),
                allocator: ManuallyDrop::new(Mutex::new(allocator)),
                layouts,
                acceleration_structure_ext,
                ray_tracing_pipeline_ext,
                ray_tracing_pipeline_properties,
                null_descriptors,
                properties,
                timeline,
                last_signaled: AtomicU64::new(0),
                command_allocators,
                setup: Mutex::new((setup_pool, setup_cb)),
                resources: Default::default(),
                pending_releases: Default::default(),
                next_id: AtomicU64::new(1),
                raw: device,
                pdevice: pdevice.clone(),
            })
        }
    }

    fn allocate_id(&self) -> ResourceId {
        ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation, BackendError> {
        self.allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| BackendError::Allocation {
                inner: err,
                name: name.to_owned(),
            })
    }

    fn free(&self, allocation: Allocation) {
        if let Err(err) = self.allocator.lock().free(allocation) {
            error!("Failed to free an allocation: {:?}", err);
        }
    }

    fn create_raw_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        alignment: Option<u64>,
        name: &str,
    ) -> Result<(vk::Buffer, Allocation), BackendError> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let buffer = self.raw.create_buffer(&buffer_info, None)?;
            let mut requirements = self.raw.get_buffer_memory_requirements(buffer);
            if let Some(alignment) = alignment {
                requirements.alignment = requirements.alignment.max(alignment);
            }

            let allocation = match self.allocate(name, requirements, location, true) {
                Ok(allocation) => allocation,
                Err(err) => {
                    self.raw.destroy_buffer(buffer, None);
                    return Err(err);
                }
            };

            self.raw
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;

            Ok((buffer, allocation))
        }
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> u64 {
        unsafe {
            self.raw
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(buffer))
        }
    }

    /// Records one-off work and blocks until the GPU has finished it.
    pub(crate) fn with_setup_cb(
        &self,
        callback: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), BackendError> {
        let setup = self.setup.lock();
        let cb = setup.1;

        unsafe {
            self.raw.begin_command_buffer(
                cb,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;

            callback(cb);

            self.raw.end_command_buffer(cb)?;

            let submit_info =
                vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&cb));

            let _queue = self.queue_lock.lock();
            self.raw
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())?;
            Ok(self.raw.queue_wait_idle(self.queue)?)
        }
    }

    unsafe fn destroy_resource(&self, resource: VulkanResource) {
        match resource {
            VulkanResource::Buffer { raw, allocation } => {
                self.raw.destroy_buffer(raw, None);
                self.free(allocation);
            }
            VulkanResource::Image {
                raw,
                view,
                allocation,
            } => {
                self.raw.destroy_image_view(view, None);
                self.raw.destroy_image(raw, None);
                self.free(allocation);
            }
            VulkanResource::Sampler(raw) => self.raw.destroy_sampler(raw, None),
            VulkanResource::AccelerationStructure {
                raw,
                buffer,
                allocation,
            } => {
                self.acceleration_structure_ext
                    .destroy_acceleration_structure(raw, None);
                self.raw.destroy_buffer(buffer, None);
                self.free(allocation);
            }
            VulkanResource::Pipeline(raw) => self.raw.destroy_pipeline(raw, None),
            VulkanResource::DescriptorHeap { pool, .. } => {
                self.raw.destroy_descriptor_pool(pool, None)
            }
        }
    }

    /// Destroys released resources the GPU can no longer reference.
    fn release_completed(&self) {
        let completed = self.completed_fence_value();
        let retired: Vec<VulkanResource> = {
            let mut pending = self.pending_releases.lock();
            let (retired, still_pending) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|(value, _)| *value <= completed);
            *pending = still_pending;
            retired.into_iter().map(|(_, resource)| resource).collect()
        };

        for resource in retired {
            unsafe { self.destroy_resource(resource) };
        }
    }

    fn insert(&self, id: ResourceId, resource: VulkanResource) {
        self.resources.lock().insert(id, resource);
    }
}

impl RenderDevice for VulkanDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn create_buffer(&self, desc: &BufferDesc, name: &str) -> Result<RawBuffer, BackendError> {
        let (raw, allocation) = self.create_raw_buffer(
            desc.size as u64,
            desc.usage,
            desc.memory_location,
            desc.alignment,
            name,
        )?;

        let device_address = self.buffer_device_address(raw);
        let mapped_ptr = allocation
            .mapped_ptr()
            .and_then(|ptr| NonNull::new(ptr.as_ptr() as *mut u8));

        if desc.is_host_visible() && mapped_ptr.is_none() {
            unsafe { self.destroy_resource(VulkanResource::Buffer { raw, allocation }) };
            return Err(BackendError::ResourceAccess {
                info: format!("host-visible buffer {:?} was not mapped", name),
            });
        }

        let id = self.allocate_id();
        self.insert(id, VulkanResource::Buffer { raw, allocation });

        Ok(RawBuffer {
            id,
            device_address,
            mapped_ptr,
        })
    }

    fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<ResourceId, BackendError> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent[0],
                height: desc.extent[1],
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        unsafe {
            let raw = self.raw.create_image(&create_info, None)?;
            let requirements = self.raw.get_image_memory_requirements(raw);

            let allocation = match self.allocate(name, requirements, MemoryLocation::GpuOnly, false)
            {
                Ok(allocation) => allocation,
                Err(err) => {
                    self.raw.destroy_image(raw, None);
                    return Err(err);
                }
            };

            self.raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())?;

            let view = self.raw.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(raw)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(desc.format)
                    .subresource_range(subresource_range),
                None,
            )?;

            // Images start out in the `Common` state, which is `GENERAL`.
            self.with_setup_cb(|cb| {
                self.raw.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[vk::ImageMemoryBarrier::builder()
                        .image(raw)
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(vk::ImageLayout::GENERAL)
                        .dst_access_mask(
                            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                        )
                        .subresource_range(subresource_range)
                        .build()],
                );
            })?;

            let id = self.allocate_id();
            self.insert(
                id,
                VulkanResource::Image {
                    raw,
                    view,
                    allocation,
                },
            );
            Ok(id)
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<ResourceId, BackendError> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(desc.address_modes[0])
            .address_mode_v(desc.address_modes[1])
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(0.0)
            .max_anisotropy(1.0);

        let raw = unsafe { self.raw.create_sampler(&create_info, None)? };
        let id = self.allocate_id();
        self.insert(id, VulkanResource::Sampler(raw));
        Ok(id)
    }

    fn acceleration_structure_build_sizes(
        &self,
        geometry: &AccelerationStructureGeometry,
    ) -> AccelerationStructureSizes {
        let geometries = [commands::vk_geometry(geometry)];
        let build_info = commands::build_geometry_info(geometry.ty(), &geometries);

        let sizes = unsafe {
            self.acceleration_structure_ext
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    &[geometry.primitive_count()],
                )
        };

        AccelerationStructureSizes {
            result_size: align_up(
                sizes.acceleration_structure_size,
                ACCELERATION_STRUCTURE_ALIGNMENT,
            ),
            scratch_size: align_up(sizes.build_scratch_size, ACCELERATION_STRUCTURE_ALIGNMENT),
        }
    }

    fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        size: u64,
        name: &str,
    ) -> Result<RawAccelerationStructure, BackendError> {
        let (buffer, allocation) = self.create_raw_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            MemoryLocation::GpuOnly,
            Some(ACCELERATION_STRUCTURE_ALIGNMENT),
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .ty(commands::vk_acceleration_structure_type(ty))
            .buffer(buffer)
            .size(size);

        unsafe {
            let raw = match self
                .acceleration_structure_ext
                .create_acceleration_structure(&create_info, None)
            {
                Ok(raw) => raw,
                Err(err) => {
                    self.destroy_resource(VulkanResource::Buffer {
                        raw: buffer,
                        allocation,
                    });
                    return Err(err.into());
                }
            };

            let device_address = self
                .acceleration_structure_ext
                .get_acceleration_structure_device_address(
                    &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                        .acceleration_structure(raw),
                );

            let id = self.allocate_id();
            self.insert(
                id,
                VulkanResource::AccelerationStructure {
                    raw,
                    buffer,
                    allocation,
                },
            );

            Ok(RawAccelerationStructure { id, device_address })
        }
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<RawRayTracingPipeline, BackendError> {
        let (raw, shader_identifiers) = pipeline::create_ray_tracing_pipeline(self, desc)?;
        let id = self.allocate_id();
        self.insert(id, VulkanResource::Pipeline(raw));
        Ok(RawRayTracingPipeline {
            id,
            shader_identifiers,
        })
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<ResourceId, BackendError> {
        let raw = pipeline::create_compute_pipeline(self, desc)?;
        let id = self.allocate_id();
        self.insert(id, VulkanResource::Pipeline(raw));
        Ok(id)
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        len: usize,
    ) -> Result<ResourceId, BackendError> {
        if len > MAX_HEAP_DESCRIPTORS as usize {
            return Err(BackendError::Unsupported {
                info: format!(
                    "descriptor heap of {} slots exceeds the maximum of {}",
                    len, MAX_HEAP_DESCRIPTORS
                ),
            });
        }

        let (pool, set) = descriptors::create_heap_set(&self.raw, &self.layouts, kind)?;
        let id = self.allocate_id();
        self.insert(id, VulkanResource::DescriptorHeap { pool, set });
        Ok(id)
    }

    fn write_descriptors(
        &self,
        heap: ResourceId,
        kind: DescriptorHeapKind,
        start: usize,
        descriptors: &[Descriptor],
    ) -> Result<(), BackendError> {
        let resources = self.resources.lock();
        let set = match resources.get(&heap) {
            Some(VulkanResource::DescriptorHeap { set, .. }) => *set,
            _ => {
                return Err(BackendError::ResourceAccess {
                    info: format!("{:?} is not a descriptor heap", heap),
                })
            }
        };

        commands::write_heap_descriptors(self, &resources, set, kind, start, descriptors)
    }

    fn release(&self, id: ResourceId) {
        if let Some(resource) = self.resources.lock().remove(&id) {
            // Anything recorded so far is covered by the next signal.
            let value = self.last_signaled.load(Ordering::Acquire) + 1;
            self.pending_releases.lock().push((value, resource));
        }
    }

    fn command_allocator_count(&self) -> usize {
        self.command_allocators.len()
    }

    fn reset_command_allocator(&self, index: usize) -> Result<(), BackendError> {
        let mut allocator = self.command_allocators[index].lock();
        unsafe {
            self.raw
                .reset_command_pool(allocator.pool, vk::CommandPoolResetFlags::empty())?;
            self.raw.reset_descriptor_pool(
                allocator.descriptor_pool,
                vk::DescriptorPoolResetFlags::empty(),
            )?;
        }
        allocator.used = 0;
        Ok(())
    }

    fn submit(&self, allocator_index: usize, commands: &CommandList) -> Result<(), BackendError> {
        let mut allocator = self.command_allocators[allocator_index].lock();

        unsafe {
            if allocator.used == allocator.command_buffers.len() {
                let cb = self.raw.allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::builder()
                        .command_buffer_count(1)
                        .command_pool(allocator.pool)
                        .level(vk::CommandBufferLevel::PRIMARY),
                )?[0];
                allocator.command_buffers.push(cb);
            }

            let cb = allocator.command_buffers[allocator.used];
            allocator.used += 1;

            self.raw.begin_command_buffer(
                cb,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;

            {
                let resources = self.resources.lock();
                commands::record_commands(
                    self,
                    cb,
                    allocator.descriptor_pool,
                    &resources,
                    commands.commands(),
                )?;
            }

            self.raw.end_command_buffer(cb)?;

            let submit_info =
                vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&cb));

            let _queue = self.queue_lock.lock();
            self.raw
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())?;
        }

        trace!(
            "Submitted {:?} ({} commands) on allocator {}",
            commands.name(),
            commands.commands().len(),
            allocator_index
        );

        Ok(())
    }

    fn signal_fence(&self, value: u64) -> Result<(), BackendError> {
        let values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(std::slice::from_ref(&self.timeline))
            .push_next(&mut timeline_info);

        unsafe {
            let _queue = self.queue_lock.lock();
            self.raw
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())?;
        }

        self.last_signaled.store(value, Ordering::Release);
        Ok(())
    }

    fn wait_for_fence(&self, value: u64) -> Result<(), BackendError> {
        if value > self.last_signaled.load(Ordering::Acquire) {
            return Err(BackendError::ResourceAccess {
                info: format!("waiting for fence value {} which was never signaled", value),
            });
        }

        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(std::slice::from_ref(&self.timeline))
            .values(&values);

        unsafe { self.raw.wait_semaphores(&wait_info, u64::MAX)? };

        self.release_completed();
        Ok(())
    }

    fn completed_fence_value(&self) -> u64 {
        unsafe {
            self.raw
                .get_semaphore_counter_value(self.timeline)
                .unwrap_or_else(|err| {
                    error!("Failed to query the fence value: {:?}", err);
                    0
                })
        }
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        unsafe {
            let _queue = self.queue_lock.lock();
            self.raw.queue_wait_idle(self.queue)?;
        }
        self.release_completed();
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.raw.device_wait_idle() {
                error!("device_wait_idle failed during shutdown: {:?}", err);
            }

            let pending: Vec<_> = self.pending_releases.lock().drain(..).collect();
            for (_, resource) in pending {
                self.destroy_resource(resource);
            }

            let live: Vec<_> = self.resources.lock().drain().collect();
            if !live.is_empty() {
                warn!("{} device resources still alive at shutdown", live.len());
            }
            for (_, resource) in live {
                self.destroy_resource(resource);
            }

            for allocator in &self.command_allocators {
                let allocator = allocator.lock();
                self.raw.destroy_command_pool(allocator.pool, None);
                self.raw
                    .destroy_descriptor_pool(allocator.descriptor_pool, None);
            }

            self.raw.destroy_command_pool(self.setup.lock().0, None);
            self.layouts.destroy(&self.raw);
            self.raw.destroy_semaphore(self.timeline, None);

            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}
