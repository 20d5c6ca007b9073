use crate::resource::ResourceState;
use ash::vk;
use vk_sync::AccessType;

/// How a resource state maps onto a synchronization access for buffers.
pub fn buffer_access(state: ResourceState) -> AccessType {
    match state {
        ResourceState::Common => AccessType::General,
        ResourceState::CopySource => AccessType::TransferRead,
        ResourceState::CopyDest => AccessType::TransferWrite,
        ResourceState::ConstantBuffer => AccessType::AnyShaderReadUniformBuffer,
        ResourceState::ShaderResource => AccessType::AnyShaderReadOther,
        ResourceState::UnorderedAccess => AccessType::AnyShaderWrite,
        // Read by acceleration structure builds as well as shaders.
        ResourceState::GenericRead | ResourceState::AccelerationStructure => {
            AccessType::General
        }
    }
}

/// How a resource state maps onto a synchronization access (and thus a layout) for images.
pub fn image_access(state: ResourceState) -> AccessType {
    match state {
        ResourceState::Common | ResourceState::GenericRead => AccessType::General,
        ResourceState::CopySource => AccessType::TransferRead,
        ResourceState::CopyDest => AccessType::TransferWrite,
        ResourceState::ShaderResource | ResourceState::ConstantBuffer => {
            AccessType::AnyShaderReadSampledImageOrUniformTexelBuffer
        }
        ResourceState::UnorderedAccess => AccessType::AnyShaderWrite,
        ResourceState::AccelerationStructure => AccessType::General,
    }
}

pub fn image_layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::ShaderResource | ResourceState::ConstantBuffer => {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
        _ => vk::ImageLayout::GENERAL,
    }
}

fn is_optimal(state: ResourceState) -> bool {
    image_layout(state) != vk::ImageLayout::GENERAL
}

pub fn record_buffer_transition(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    before: ResourceState,
    after: ResourceState,
) {
    vk_sync::cmd::pipeline_barrier(
        device,
        cb,
        Some(vk_sync::GlobalBarrier {
            previous_accesses: &[buffer_access(before)],
            next_accesses: &[buffer_access(after)],
        }),
        &[],
        &[],
    );
}

pub fn record_image_transition(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    queue_family_index: u32,
    before: ResourceState,
    after: ResourceState,
) {
    let layout = |state| {
        if is_optimal(state) {
            vk_sync::ImageLayout::Optimal
        } else {
            vk_sync::ImageLayout::General
        }
    };

    vk_sync::cmd::pipeline_barrier(
        device,
        cb,
        None,
        &[],
        &[vk_sync::ImageBarrier {
            previous_accesses: &[image_access(before)],
            next_accesses: &[image_access(after)],
            previous_layout: layout(before),
            next_layout: layout(after),
            discard_contents: false,
            src_queue_family_index: queue_family_index,
            dst_queue_family_index: queue_family_index,
            image,
            range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
        }],
    );
}

/// Orders acceleration-structure builds against later builds and traces.
pub fn record_acceleration_structure_barrier(device: &ash::Device, cb: vk::CommandBuffer) {
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::DependencyFlags::empty(),
            &[vk::MemoryBarrier::builder()
                .src_access_mask(
                    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                        | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                )
                .dst_access_mask(
                    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                        | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                )
                .build()],
            &[],
            &[],
        );
    }
}

/// Waits for all shader and build writes before any later read or write.
pub fn record_uav_barrier(device: &ash::Device, cb: vk::CommandBuffer) {
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[vk::MemoryBarrier::builder()
                .src_access_mask(
                    vk::AccessFlags::SHADER_WRITE
                        | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                )
                .dst_access_mask(
                    vk::AccessFlags::SHADER_READ
                        | vk::AccessFlags::SHADER_WRITE
                        | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                )
                .build()],
            &[],
            &[],
        );
    }
}
