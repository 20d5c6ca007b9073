use crate::{descriptor::DescriptorHeapKind, BackendError};
use ash::vk;

/// Slots in each bindless heap set.
pub const MAX_HEAP_DESCRIPTORS: u32 = 1024;

/// Push constant block shared by ray tracing and compute pipelines.
pub const PUSH_CONSTANT_BYTES: u32 = 128;

/// Per-dispatch global sets allocated from a single command allocator's pool
/// before it is reset.
const MAX_DISPATCH_SETS: u32 = 256;

pub mod ray_tracing_bindings {
    pub const SCENE: u32 = 0;
    pub const FRAME_DATA: u32 = 1;
    pub const ENVIRONMENT: u32 = 2;
    pub const ENVIRONMENT_ALIAS_MAP: u32 = 3;
    pub const GROUND_PLANE: u32 = 4;
    pub const NULL_SCENE: u32 = 5;
}

pub mod heap_bindings {
    pub const STORAGE_IMAGES: u32 = 0;
    pub const SAMPLED_IMAGES: u32 = 1;
    pub const SAMPLERS: u32 = 0;
}

/// Set 0 holds per-dispatch globals, set 1 the resource heap and set 2 the sampler heap.
pub struct DescriptorLayouts {
    pub ray_tracing_globals: vk::DescriptorSetLayout,
    pub compute_globals: vk::DescriptorSetLayout,
    pub resource_heap: vk::DescriptorSetLayout,
    pub sampler_heap: vk::DescriptorSetLayout,
    pub ray_tracing_pipeline_layout: vk::PipelineLayout,
    pub compute_pipeline_layout: vk::PipelineLayout,
}

fn binding(
    binding: u32,
    ty: vk::DescriptorType,
    count: u32,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(ty)
        .descriptor_count(count)
        .stage_flags(vk::ShaderStageFlags::ALL)
        .build()
}

unsafe fn create_set_layout(
    device: &ash::Device,
    bindings: &[vk::DescriptorSetLayoutBinding],
    binding_flags: &[vk::DescriptorBindingFlags],
    flags: vk::DescriptorSetLayoutCreateFlags,
) -> Result<vk::DescriptorSetLayout, BackendError> {
    let mut binding_flags_info =
        vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(binding_flags);

    Ok(device.create_descriptor_set_layout(
        &vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(bindings)
            .flags(flags)
            .push_next(&mut binding_flags_info),
        None,
    )?)
}

impl DescriptorLayouts {
    pub fn new(device: &ash::Device) -> Result<Self, BackendError> {
        use ray_tracing_bindings::*;

        let heap_flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;

        unsafe {
            let ray_tracing_globals = create_set_layout(
                device,
                &[
                    binding(SCENE, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1),
                    binding(FRAME_DATA, vk::DescriptorType::UNIFORM_BUFFER, 1),
                    binding(ENVIRONMENT, vk::DescriptorType::UNIFORM_BUFFER, 1),
                    binding(ENVIRONMENT_ALIAS_MAP, vk::DescriptorType::STORAGE_BUFFER, 1),
                    binding(GROUND_PLANE, vk::DescriptorType::UNIFORM_BUFFER, 1),
                    binding(NULL_SCENE, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1),
                ],
                &[
                    vk::DescriptorBindingFlags::empty(),
                    vk::DescriptorBindingFlags::empty(),
                    vk::DescriptorBindingFlags::empty(),
                    vk::DescriptorBindingFlags::empty(),
                    vk::DescriptorBindingFlags::empty(),
                    vk::DescriptorBindingFlags::PARTIALLY_BOUND,
                ],
                vk::DescriptorSetLayoutCreateFlags::empty(),
            )?;

            let compute_globals = create_set_layout(
                device,
                &[binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1)],
                &[vk::DescriptorBindingFlags::PARTIALLY_BOUND],
                vk::DescriptorSetLayoutCreateFlags::empty(),
            )?;

            let resource_heap = create_set_layout(
                device,
                &[
                    binding(
                        heap_bindings::STORAGE_IMAGES,
                        vk::DescriptorType::STORAGE_IMAGE,
                        MAX_HEAP_DESCRIPTORS,
                    ),
                    binding(
                        heap_bindings::SAMPLED_IMAGES,
                        vk::DescriptorType::SAMPLED_IMAGE,
                        MAX_HEAP_DESCRIPTORS,
                    ),
                ],
                &[heap_flags, heap_flags],
                vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
            )?;

            let sampler_heap = create_set_layout(
                device,
                &[binding(
                    heap_bindings::SAMPLERS,
                    vk::DescriptorType::SAMPLER,
                    MAX_HEAP_DESCRIPTORS,
                )],
                &[heap_flags],
                vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
            )?;

            let push_constant_ranges = [vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::ALL,
                offset: 0,
                size: PUSH_CONSTANT_BYTES,
            }];

            let ray_tracing_pipeline_layout = device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(&[ray_tracing_globals, resource_heap, sampler_heap])
                    .push_constant_ranges(&push_constant_ranges),
                None,
            )?;

            let compute_pipeline_layout = device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(&[compute_globals, resource_heap])
                    .push_constant_ranges(&push_constant_ranges),
                None,
            )?;

            Ok(Self {
                ray_tracing_globals,
                compute_globals,
                resource_heap,
                sampler_heap,
                ray_tracing_pipeline_layout,
                compute_pipeline_layout,
            })
        }
    }

    pub fn heap_layout(&self, kind: DescriptorHeapKind) -> vk::DescriptorSetLayout {
        match kind {
            DescriptorHeapKind::Resources => self.resource_heap,
            DescriptorHeapKind::Samplers => self.sampler_heap,
        }
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline_layout(self.ray_tracing_pipeline_layout, None);
        device.destroy_pipeline_layout(self.compute_pipeline_layout, None);
        device.destroy_descriptor_set_layout(self.ray_tracing_globals, None);
        device.destroy_descriptor_set_layout(self.compute_globals, None);
        device.destroy_descriptor_set_layout(self.resource_heap, None);
        device.destroy_descriptor_set_layout(self.sampler_heap, None);
    }
}

/// Pool for the per-dispatch global sets of one command allocator.
pub fn create_dispatch_descriptor_pool(
    device: &ash::Device,
) -> Result<vk::DescriptorPool, BackendError> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            descriptor_count: 2 * MAX_DISPATCH_SETS,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 3 * MAX_DISPATCH_SETS,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: MAX_DISPATCH_SETS,
        },
    ];

    unsafe {
        Ok(device.create_descriptor_pool(
            &vk::DescriptorPoolCreateInfo::builder()
                .max_sets(MAX_DISPATCH_SETS)
                .pool_sizes(&pool_sizes),
            None,
        )?)
    }
}

/// A pool holding exactly one bindless heap set.
pub fn create_heap_set(
    device: &ash::Device,
    layouts: &DescriptorLayouts,
    kind: DescriptorHeapKind,
) -> Result<(vk::DescriptorPool, vk::DescriptorSet), BackendError> {
    let pool_sizes: Vec<vk::DescriptorPoolSize> = match kind {
        DescriptorHeapKind::Resources => vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: MAX_HEAP_DESCRIPTORS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: MAX_HEAP_DESCRIPTORS,
            },
        ],
        DescriptorHeapKind::Samplers => vec![vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLER,
            descriptor_count: MAX_HEAP_DESCRIPTORS,
        }],
    };

    unsafe {
        let pool = device.create_descriptor_pool(
            &vk::DescriptorPoolCreateInfo::builder()
                .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                .max_sets(1)
                .pool_sizes(&pool_sizes),
            None,
        )?;

        let set = device.allocate_descriptor_sets(
            &vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(std::slice::from_ref(&layouts.heap_layout(kind))),
        )?[0];

        Ok((pool, set))
    }
}
