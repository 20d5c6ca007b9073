use super::{
    barrier,
    descriptors::{heap_bindings, ray_tracing_bindings},
    device::{VulkanDevice, VulkanResource},
};
use crate::{
    command::{Command, ComputeArgs, DispatchRaysDesc, RayTracingArgs, ShaderTableRegion},
    descriptor::{Descriptor, DescriptorHeapKind},
    ray_tracing::{AccelerationStructureGeometry, AccelerationStructureType},
    resource::{ResourceId, ResourceRef},
    BackendError,
};
use ash::vk;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;

type Resources = HashMap<ResourceId, VulkanResource>;

fn missing(id: ResourceId, what: &str) -> BackendError {
    BackendError::ResourceAccess {
        info: format!("{:?} is not a live {}", id, what),
    }
}

fn buffer(resources: &Resources, id: ResourceId) -> Result<vk::Buffer, BackendError> {
    match resources.get(&id) {
        Some(VulkanResource::Buffer { raw, .. }) => Ok(*raw),
        _ => Err(missing(id, "buffer")),
    }
}

fn image(resources: &Resources, id: ResourceId) -> Result<(vk::Image, vk::ImageView), BackendError> {
    match resources.get(&id) {
        Some(VulkanResource::Image { raw, view, .. }) => Ok((*raw, *view)),
        _ => Err(missing(id, "image")),
    }
}

fn acceleration_structure(
    resources: &Resources,
    id: ResourceId,
) -> Result<vk::AccelerationStructureKHR, BackendError> {
    match resources.get(&id) {
        Some(VulkanResource::AccelerationStructure { raw, .. }) => Ok(*raw),
        _ => Err(missing(id, "acceleration structure")),
    }
}

fn pipeline(resources: &Resources, id: ResourceId) -> Result<vk::Pipeline, BackendError> {
    match resources.get(&id) {
        Some(VulkanResource::Pipeline(raw)) => Ok(*raw),
        _ => Err(missing(id, "pipeline")),
    }
}

fn heap_set(resources: &Resources, id: ResourceId) -> Result<vk::DescriptorSet, BackendError> {
    match resources.get(&id) {
        Some(VulkanResource::DescriptorHeap { set, .. }) => Ok(*set),
        _ => Err(missing(id, "descriptor heap")),
    }
}

pub(crate) fn vk_acceleration_structure_type(
    ty: AccelerationStructureType,
) -> vk::AccelerationStructureTypeKHR {
    match ty {
        AccelerationStructureType::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureType::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

pub(crate) fn vk_geometry(
    geometry: &AccelerationStructureGeometry,
) -> vk::AccelerationStructureGeometryKHR {
    match *geometry {
        AccelerationStructureGeometry::Triangles {
            vertex_address,
            vertex_stride,
            vertex_count,
            vertex_format,
            index_address,
            index_type,
            flags,
            ..
        } => vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_address,
                    })
                    .vertex_stride(vertex_stride)
                    .max_vertex(vertex_count.saturating_sub(1))
                    .vertex_format(vertex_format)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: index_address,
                    })
                    .index_type(index_type)
                    .build(),
            })
            .flags(flags)
            .build(),
        AccelerationStructureGeometry::Instances {
            instances_address, ..
        } => vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: instances_address,
                    })
                    .build(),
            })
            .build(),
    }
}

/// `geometries` must outlive the returned struct.
pub(crate) fn build_geometry_info(
    ty: AccelerationStructureType,
    geometries: &[vk::AccelerationStructureGeometryKHR],
) -> vk::AccelerationStructureBuildGeometryInfoKHR {
    vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(vk_acceleration_structure_type(ty))
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
        .build()
}

fn strided_region(region: &ShaderTableRegion) -> vk::StridedDeviceAddressRegionKHR {
    vk::StridedDeviceAddressRegionKHR {
        device_address: region.device_address(),
        stride: region.stride,
        size: region.size,
    }
}

pub(crate) fn write_heap_descriptors(
    device: &VulkanDevice,
    resources: &Resources,
    set: vk::DescriptorSet,
    kind: DescriptorHeapKind,
    start: usize,
    descriptors: &[Descriptor],
) -> Result<(), BackendError> {
    // Image and sampler infos are referenced by pointer from the writes.
    let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::with_capacity(descriptors.len() * 2);
    let mut targets: Vec<(u32, u32, vk::DescriptorType)> = Vec::new();

    for (i, descriptor) in descriptors.iter().enumerate() {
        let element = (start + i) as u32;

        match (kind, descriptor) {
            (DescriptorHeapKind::Resources, Descriptor::StorageImage(img)) => {
                let (_, view) = image(resources, img.id())?;
                image_infos.push(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                });
                targets.push((
                    heap_bindings::STORAGE_IMAGES,
                    element,
                    vk::DescriptorType::STORAGE_IMAGE,
                ));
            }
            (DescriptorHeapKind::Resources, Descriptor::SampledImage(img)) => {
                let (_, view) = image(resources, img.id())?;
                image_infos.push(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                });
                targets.push((
                    heap_bindings::SAMPLED_IMAGES,
                    element,
                    vk::DescriptorType::SAMPLED_IMAGE,
                ));
            }
            (DescriptorHeapKind::Samplers, Descriptor::Sampler(sampler)) => {
                let raw = match resources.get(&sampler.id()) {
                    Some(VulkanResource::Sampler(raw)) => *raw,
                    _ => return Err(missing(sampler.id(), "sampler")),
                };
                image_infos.push(vk::DescriptorImageInfo {
                    sampler: raw,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                });
                targets.push((heap_bindings::SAMPLERS, element, vk::DescriptorType::SAMPLER));
            }
            (DescriptorHeapKind::Resources, Descriptor::Null) if device.null_descriptors => {
                for (binding, ty) in [
                    (
                        heap_bindings::STORAGE_IMAGES,
                        vk::DescriptorType::STORAGE_IMAGE,
                    ),
                    (
                        heap_bindings::SAMPLED_IMAGES,
                        vk::DescriptorType::SAMPLED_IMAGE,
                    ),
                ] {
                    image_infos.push(vk::DescriptorImageInfo::default());
                    targets.push((binding, element, ty));
                }
            }
            (_, Descriptor::Null) => {}
            (kind, descriptor) => {
                return Err(BackendError::ResourceAccess {
                    info: format!("{:?} cannot live in a {:?} heap", descriptor, kind),
                })
            }
        }
    }

    let writes: Vec<vk::WriteDescriptorSet> = targets
        .iter()
        .zip(image_infos.iter())
        .map(|(&(binding, element, ty), info)| {
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(binding)
                .dst_array_element(element)
                .descriptor_type(ty)
                .image_info(std::slice::from_ref(info))
                .build()
        })
        .collect();

    unsafe { device.raw.update_descriptor_sets(&writes, &[]) };
    Ok(())
}

unsafe fn record_dispatch_rays(
    device: &VulkanDevice,
    cb: vk::CommandBuffer,
    descriptor_pool: vk::DescriptorPool,
    resources: &Resources,
    pipeline_id: ResourceId,
    args: &RayTracingArgs,
    desc: &DispatchRaysDesc,
) -> Result<(), BackendError> {
    use ray_tracing_bindings::*;

    let raw_pipeline = pipeline(resources, pipeline_id)?;

    let globals = device.raw.allocate_descriptor_sets(
        &vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(std::slice::from_ref(&device.layouts.ray_tracing_globals)),
    )?[0];

    let scene = [acceleration_structure(
        resources,
        args.acceleration_structure.id(),
    )?];
    let null_scene = match &args.null_acceleration_structure {
        Some(null) => Some([acceleration_structure(resources, null.id())?]),
        None => None,
    };

    let buffer_info = |binding: &crate::command::BufferBinding| -> Result<_, BackendError> {
        Ok([vk::DescriptorBufferInfo {
            buffer: buffer(resources, binding.buffer.id())?,
            offset: binding.offset,
            range: binding.size,
        }])
    };

    let frame_data = buffer_info(&args.frame_data)?;
    let environment = buffer_info(&args.environment)?;
    let alias_map = buffer_info(&args.environment_alias_map)?;
    let ground_plane = buffer_info(&args.ground_plane)?;

    let mut scene_info =
        vk::WriteDescriptorSetAccelerationStructureKHR::builder().acceleration_structures(&scene);
    let mut scene_write = vk::WriteDescriptorSet::builder()
        .dst_set(globals)
        .dst_binding(SCENE)
        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
        .push_next(&mut scene_info)
        .build();
    scene_write.descriptor_count = 1;

    let buffer_write = |binding: u32, ty: vk::DescriptorType, info: &[vk::DescriptorBufferInfo]| {
        vk::WriteDescriptorSet::builder()
            .dst_set(globals)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(info)
            .build()
    };

    let mut writes = vec![
        scene_write,
        buffer_write(FRAME_DATA, vk::DescriptorType::UNIFORM_BUFFER, &frame_data),
        buffer_write(ENVIRONMENT, vk::DescriptorType::UNIFORM_BUFFER, &environment),
        buffer_write(
            ENVIRONMENT_ALIAS_MAP,
            vk::DescriptorType::STORAGE_BUFFER,
            &alias_map,
        ),
        buffer_write(GROUND_PLANE, vk::DescriptorType::UNIFORM_BUFFER, &ground_plane),
    ];

    let mut null_scene_info;
    if let Some(null_scene) = &null_scene {
        null_scene_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
            .acceleration_structures(null_scene);
        let mut write = vk::WriteDescriptorSet::builder()
            .dst_set(globals)
            .dst_binding(NULL_SCENE)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut null_scene_info)
            .build();
        write.descriptor_count = 1;
        writes.push(write);
    }

    device.raw.update_descriptor_sets(&writes, &[]);

    let sets = [
        globals,
        heap_set(resources, args.descriptor_heap.id())?,
        heap_set(resources, args.sampler_heap.id())?,
    ];

    device
        .raw
        .cmd_bind_pipeline(cb, vk::PipelineBindPoint::RAY_TRACING_KHR, raw_pipeline);
    device.raw.cmd_bind_descriptor_sets(
        cb,
        vk::PipelineBindPoint::RAY_TRACING_KHR,
        device.layouts.ray_tracing_pipeline_layout,
        0,
        &sets,
        &[],
    );

    let push_constants = [
        args.sample_constants[0],
        args.sample_constants[1],
        args.environment_textures,
        0,
    ];
    device.raw.cmd_push_constants(
        cb,
        device.layouts.ray_tracing_pipeline_layout,
        vk::ShaderStageFlags::ALL,
        0,
        bytemuck::cast_slice(&push_constants),
    );

    let mut ray_gen = strided_region(&desc.ray_gen);
    ray_gen.size = ray_gen.stride;

    device.ray_tracing_pipeline_ext.cmd_trace_rays(
        cb,
        &ray_gen,
        &strided_region(&desc.miss),
        &strided_region(&desc.hit_groups),
        &vk::StridedDeviceAddressRegionKHR::default(),
        desc.extent[0],
        desc.extent[1],
        desc.extent[2],
    );

    Ok(())
}

unsafe fn record_dispatch(
    device: &VulkanDevice,
    cb: vk::CommandBuffer,
    descriptor_pool: vk::DescriptorPool,
    resources: &Resources,
    pipeline_id: ResourceId,
    args: &ComputeArgs,
    group_counts: [u32; 3],
) -> Result<(), BackendError> {
    let raw_pipeline = pipeline(resources, pipeline_id)?;
    let layout = device.layouts.compute_pipeline_layout;

    let globals = device.raw.allocate_descriptor_sets(
        &vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(std::slice::from_ref(&device.layouts.compute_globals)),
    )?[0];

    if let Some(constant_buffer) = &args.constant_buffer {
        let info = [vk::DescriptorBufferInfo {
            buffer: buffer(resources, constant_buffer.buffer.id())?,
            offset: constant_buffer.offset,
            range: constant_buffer.size,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(globals)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&info)
            .build();
        device.raw.update_descriptor_sets(&[write], &[]);
    }

    let sets = [globals, heap_set(resources, args.descriptor_heap.id())?];

    device
        .raw
        .cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, raw_pipeline);
    device.raw.cmd_bind_descriptor_sets(
        cb,
        vk::PipelineBindPoint::COMPUTE,
        layout,
        0,
        &sets,
        &[],
    );

    let mut push_constants = Vec::with_capacity(1 + args.root_constants.len());
    push_constants.push(args.table_start);
    push_constants.extend_from_slice(&args.root_constants);

    device.raw.cmd_push_constants(
        cb,
        layout,
        vk::ShaderStageFlags::ALL,
        0,
        bytemuck::cast_slice(&push_constants),
    );

    device
        .raw
        .cmd_dispatch(cb, group_counts[0], group_counts[1], group_counts[2]);

    Ok(())
}

pub(crate) unsafe fn record_commands(
    device: &VulkanDevice,
    cb: vk::CommandBuffer,
    descriptor_pool: vk::DescriptorPool,
    resources: &Resources,
    commands: &[Command],
) -> Result<(), BackendError> {
    let raw = &device.raw;

    for command in commands {
        match command {
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                raw.cmd_copy_buffer(
                    cb,
                    buffer(resources, src.id())?,
                    buffer(resources, dst.id())?,
                    &[vk::BufferCopy {
                        src_offset: *src_offset,
                        dst_offset: *dst_offset,
                        size: *size,
                    }],
                );
            }
            Command::CopyBufferToImage {
                src,
                src_offset,
                dst,
            } => {
                raw.cmd_copy_buffer_to_image(
                    cb,
                    buffer(resources, src.id())?,
                    image(resources, dst.id())?.0,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[buffer_image_copy(*src_offset, dst.desc.extent)],
                );
            }
            Command::CopyImageToBuffer {
                src,
                dst,
                dst_offset,
            } => {
                raw.cmd_copy_image_to_buffer(
                    cb,
                    image(resources, src.id())?.0,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    buffer(resources, dst.id())?,
                    &[buffer_image_copy(*dst_offset, src.desc.extent)],
                );
            }
            Command::CopyImage { src, dst } => {
                let subresource = vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                raw.cmd_copy_image(
                    cb,
                    image(resources, src.id())?.0,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image(resources, dst.id())?.0,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[vk::ImageCopy {
                        src_subresource: subresource,
                        src_offset: Default::default(),
                        dst_subresource: subresource,
                        dst_offset: Default::default(),
                        extent: vk::Extent3D {
                            width: src.desc.extent[0].min(dst.desc.extent[0]),
                            height: src.desc.extent[1].min(dst.desc.extent[1]),
                            depth: 1,
                        },
                    }],
                );
            }
            Command::Transition {
                resource,
                before,
                after,
            } => match resource {
                ResourceRef::Buffer(_) => {
                    barrier::record_buffer_transition(raw, cb, *before, *after)
                }
                ResourceRef::Image(img) => barrier::record_image_transition(
                    raw,
                    cb,
                    image(resources, img.id())?.0,
                    device.queue_family_index,
                    *before,
                    *after,
                ),
                ResourceRef::AccelerationStructure(_) => {
                    barrier::record_acceleration_structure_barrier(raw, cb)
                }
            },
            Command::UavBarrier { .. } => barrier::record_uav_barrier(raw, cb),
            Command::BuildAccelerationStructure {
                dst,
                geometry,
                scratch_address,
                ..
            } => {
                let geometries = [vk_geometry(geometry)];
                let mut build_info = build_geometry_info(geometry.ty(), &geometries);
                build_info.dst_acceleration_structure =
                    acceleration_structure(resources, dst.id())?;
                build_info.scratch_data = vk::DeviceOrHostAddressKHR {
                    device_address: *scratch_address,
                };

                let range = vk::AccelerationStructureBuildRangeInfoKHR {
                    primitive_count: geometry.primitive_count(),
                    primitive_offset: 0,
                    first_vertex: 0,
                    transform_offset: 0,
                };

                device
                    .acceleration_structure_ext
                    .cmd_build_acceleration_structures(
                        cb,
                        std::slice::from_ref(&build_info),
                        std::slice::from_ref(&std::slice::from_ref(&range)),
                    );

                barrier::record_acceleration_structure_barrier(raw, cb);
            }
            Command::DispatchRays {
                pipeline,
                args,
                desc,
            } => record_dispatch_rays(
                device,
                cb,
                descriptor_pool,
                resources,
                pipeline.id(),
                args,
                desc,
            )?,
            Command::Dispatch {
                pipeline,
                args,
                group_counts,
            } => record_dispatch(
                device,
                cb,
                descriptor_pool,
                resources,
                pipeline.id(),
                args,
                *group_counts,
            )?,
        }
    }

    Ok(())
}

fn buffer_image_copy(buffer_offset: u64, extent: [u32; 2]) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: Default::default(),
        image_extent: vk::Extent3D {
            width: extent[0],
            height: extent[1],
            depth: 1,
        },
    }
}
