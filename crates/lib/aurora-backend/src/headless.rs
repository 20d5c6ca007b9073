//! A device without a GPU.
//!
//! Memory lives on the CPU heap; copies execute at submit time, ray and compute
//! dispatches are recorded but not run. The fence completes as soon as it is
//! signaled. Used by tests and by tools that only need the scene plumbing.

use crate::{
    command::{Command, CommandList},
    descriptor::{Descriptor, DescriptorHeapKind},
    device::{DeviceProperties, RenderDevice},
    pipeline::{
        ComputePipelineDesc, RawRayTracingPipeline, RayTracingPipelineDesc, ShaderExport,
        ShaderGroupDesc, ShaderIdentifier, SHADER_IDENTIFIER_SIZE,
    },
    ray_tracing::{
        AccelerationStructureGeometry, AccelerationStructureSizes, AccelerationStructureType,
        RawAccelerationStructure, ACCELERATION_STRUCTURE_ALIGNMENT,
    },
    resource::{BufferDesc, ImageDesc, RawBuffer, ResourceId, ResourceRef, SamplerDesc},
    BackendError,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::DefaultHasher, HashMap, HashSet},
    hash::{Hash, Hasher},
    ptr::NonNull,
};

struct Memory {
    ptr: NonNull<u8>,
    len: usize,
}

// Only reachable through the device mutex or the owning buffer's mapping lock.
unsafe impl Send for Memory {}

impl Memory {
    fn new(len: usize) -> Self {
        let len = len.max(1);
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self {
            ptr: NonNull::new(ptr).expect("Box::into_raw never returns null"),
            len,
        }
    }

    fn check(&self, offset: u64, size: u64) -> Result<(), BackendError> {
        if offset + size > self.len as u64 {
            Err(BackendError::ResourceAccess {
                info: format!(
                    "access [{}, {}) exceeds allocation of {} bytes",
                    offset,
                    offset + size,
                    self.len
                ),
            })
        } else {
            Ok(())
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeadlessResourceKind {
    Buffer,
    Image,
    Sampler,
    AccelerationStructure,
    RayTracingPipeline,
    ComputePipeline,
    DescriptorHeap,
}

/// A condensed view of one recorded command, kept for inspection.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    CopyBuffer {
        src: ResourceId,
        dst: ResourceId,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        dst: ResourceId,
    },
    CopyImageToBuffer {
        src: ResourceId,
    },
    CopyImage {
        src: ResourceId,
        dst: ResourceId,
    },
    Transition {
        resource: ResourceId,
        before: crate::resource::ResourceState,
        after: crate::resource::ResourceState,
    },
    UavBarrier {
        resource: Option<ResourceId>,
    },
    BuildAccelerationStructure {
        ty: AccelerationStructureType,
        primitive_count: u32,
    },
    DispatchRays {
        extent: [u32; 3],
        sample_constants: [u32; 2],
        hit_group_records: u64,
        miss_records: u64,
    },
    Dispatch {
        pipeline: String,
        table_start: u32,
        root_constants: Vec<u32>,
        group_counts: [u32; 3],
    },
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub allocator_index: usize,
    pub commands: Vec<RecordedCommand>,
}

/// Everything the device observed, in order.
#[derive(Clone, Debug, Default)]
pub struct HeadlessLog {
    pub allocator_resets: Vec<usize>,
    pub fence_signals: Vec<u64>,
    pub fence_waits: Vec<u64>,
    pub submissions: Vec<Submission>,
    pub ray_tracing_pipelines: Vec<RayTracingPipelineDesc>,
}

struct HeadlessState {
    next_id: u64,
    next_device_address: u64,
    kinds: HashMap<ResourceId, HeadlessResourceKind>,
    memory: HashMap<ResourceId, Memory>,
    image_descs: HashMap<ResourceId, ImageDesc>,
    compute_pipeline_names: HashMap<ResourceId, String>,
    fence_value: u64,
    log: HeadlessLog,
}

impl HeadlessState {
    fn alloc_id(&mut self, kind: HeadlessResourceKind) -> ResourceId {
        self.next_id += 1;
        let id = ResourceId(self.next_id);
        self.kinds.insert(id, kind);
        id
    }

    fn alloc_device_address(&mut self, size: u64) -> u64 {
        let address = self.next_device_address;
        let size = crate::bytes::align_up(size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);
        self.next_device_address += size;
        address
    }

    fn memory(&self, id: ResourceId) -> Result<&Memory, BackendError> {
        self.memory
            .get(&id)
            .ok_or_else(|| BackendError::ResourceAccess {
                info: format!("no memory backs resource {:?}", id),
            })
    }

    fn copy(
        &self,
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let src = self.memory(src)?;
        let dst = self.memory(dst)?;
        src.check(src_offset, size)?;
        dst.check(dst_offset, size)?;

        unsafe {
            std::ptr::copy(
                src.ptr.as_ptr().add(src_offset as usize),
                dst.ptr.as_ptr().add(dst_offset as usize),
                size as usize,
            );
        }
        Ok(())
    }

    fn image_size(&self, id: ResourceId) -> Result<u64, BackendError> {
        self.image_descs
            .get(&id)
            .map(|desc| desc.byte_size() as u64)
            .ok_or_else(|| BackendError::ResourceAccess {
                info: format!("{:?} is not an image", id),
            })
    }

    fn execute(&self, command: &Command) -> Result<RecordedCommand, BackendError> {
        Ok(match command {
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                self.copy(src.id(), *src_offset, dst.id(), *dst_offset, *size)?;
                RecordedCommand::CopyBuffer {
                    src: src.id(),
                    dst: dst.id(),
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                }
            }
            Command::CopyBufferToImage {
                src,
                src_offset,
                dst,
            } => {
                let size = self.image_size(dst.id())?;
                self.copy(src.id(), *src_offset, dst.id(), 0, size)?;
                RecordedCommand::CopyBufferToImage { dst: dst.id() }
            }
            Command::CopyImageToBuffer {
                src,
                dst,
                dst_offset,
            } => {
                let size = self.image_size(src.id())?;
                self.copy(src.id(), 0, dst.id(), *dst_offset, size)?;
                RecordedCommand::CopyImageToBuffer { src: src.id() }
            }
            Command::CopyImage { src, dst } => {
                let size = self.image_size(src.id())?.min(self.image_size(dst.id())?);
                self.copy(src.id(), 0, dst.id(), 0, size)?;
                RecordedCommand::CopyImage {
                    src: src.id(),
                    dst: dst.id(),
                }
            }
            Command::Transition {
                resource,
                before,
                after,
            } => RecordedCommand::Transition {
                resource: resource.id(),
                before: *before,
                after: *after,
            },
            Command::UavBarrier { resource } => RecordedCommand::UavBarrier {
                resource: resource.as_ref().map(ResourceRef::id),
            },
            Command::BuildAccelerationStructure { dst, geometry, .. } => {
                RecordedCommand::BuildAccelerationStructure {
                    ty: dst.ty,
                    primitive_count: geometry.primitive_count(),
                }
            }
            Command::DispatchRays { args, desc, .. } => RecordedCommand::DispatchRays {
                extent: desc.extent,
                sample_constants: args.sample_constants,
                hit_group_records: desc.hit_groups.record_count(),
                miss_records: desc.miss.record_count(),
            },
            Command::Dispatch {
                pipeline,
                args,
                group_counts,
            } => RecordedCommand::Dispatch {
                pipeline: self
                    .compute_pipeline_names
                    .get(&pipeline.id())
                    .cloned()
                    .unwrap_or_default(),
                table_start: args.table_start,
                root_constants: args.root_constants.clone(),
                group_counts: *group_counts,
            },
        })
    }
}

pub struct HeadlessDevice {
    properties: DeviceProperties,
    command_allocator_count: usize,
    state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    pub fn new(command_allocator_count: usize) -> Self {
        Self {
            properties: DeviceProperties {
                name: "headless".to_owned(),
                shader_group_handle_size: SHADER_IDENTIFIER_SIZE as u32,
                max_ray_recursion_depth: 31,
                supports_shared_handles: false,
            },
            command_allocator_count,
            state: Mutex::new(HeadlessState {
                next_id: 0,
                // Keep zero free so that a null address is never handed out.
                next_device_address: 0x1_0000,
                kinds: Default::default(),
                memory: Default::default(),
                image_descs: Default::default(),
                compute_pipeline_names: Default::default(),
                fence_value: 0,
                log: Default::default(),
            }),
        }
    }

    pub fn log(&self) -> HeadlessLog {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log = HeadlessLog::default();
    }

    pub fn live_resource_count(&self, kind: HeadlessResourceKind) -> usize {
        self.state
            .lock()
            .kinds
            .values()
            .filter(|k| **k == kind)
            .count()
    }

    /// Raw contents of a buffer or image, regardless of its memory location.
    pub fn read_resource(&self, id: ResourceId, offset: usize, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let memory = state.memory(id).expect("resource has memory");
        memory
            .check(offset as u64, len as u64)
            .expect("read within bounds");
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(memory.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }

    fn shader_identifier(pipeline: ResourceId, group: &str) -> ShaderIdentifier {
        let mut identifier = [0u8; SHADER_IDENTIFIER_SIZE];
        for (i, chunk) in identifier.chunks_mut(8).enumerate() {
            let mut hasher = DefaultHasher::new();
            (pipeline, group, i).hash(&mut hasher);
            chunk.copy_from_slice(&hasher.finish().to_le_bytes());
        }
        identifier
    }

    fn validate_pipeline(desc: &RayTracingPipelineDesc) -> Result<(), BackendError> {
        let invalid = |info: String| Err(BackendError::ResourceAccess { info });

        let check_export = |export: &ShaderExport| -> Result<(), BackendError> {
            match desc.libraries.get(export.library) {
                Some(library) if library.entry_points.contains(&export.entry_point) => Ok(()),
                _ => Err(BackendError::ResourceAccess {
                    info: format!("pipeline {:?} imports missing export {:?}", desc.name, export),
                }),
            }
        };

        let mut names = HashSet::new();
        for group in &desc.groups {
            if !names.insert(group.name()) {
                return invalid(format!("duplicate shader group {:?}", group.name()));
            }

            match group {
                ShaderGroupDesc::General { shader, .. } => check_export(shader)?,
                ShaderGroupDesc::TrianglesHit {
                    closest_hit,
                    any_hit,
                    ..
                } => {
                    if closest_hit.is_none() && any_hit.is_none() {
                        return invalid(format!("hit group {:?} is empty", group.name()));
                    }
                    closest_hit.iter().try_for_each(check_export)?;
                    any_hit.iter().try_for_each(check_export)?;
                }
            }
        }

        for association in &desc.local_root_associations {
            for group in &association.groups {
                if !names.contains(group.as_str()) {
                    return invalid(format!(
                        "local root association references unknown group {:?}",
                        group
                    ));
                }
            }
        }

        Ok(())
    }
}

impl RenderDevice for HeadlessDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn create_buffer(&self, desc: &BufferDesc, name: &str) -> Result<RawBuffer, BackendError> {
        let mut state = self.state.lock();
        let id = state.alloc_id(HeadlessResourceKind::Buffer);
        let device_address = state.alloc_device_address(desc.size as u64);
        let memory = Memory::new(desc.size);
        let mapped_ptr = desc.is_host_visible().then_some(memory.ptr);
        state.memory.insert(id, memory);

        trace!("headless: buffer {:?} {:?} ({} bytes)", id, name, desc.size);

        Ok(RawBuffer {
            id,
            device_address,
            mapped_ptr,
        })
    }

    fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<ResourceId, BackendError> {
        let mut state = self.state.lock();
        let id = state.alloc_id(HeadlessResourceKind::Image);
        state.memory.insert(id, Memory::new(desc.byte_size()));
        state.image_descs.insert(id, *desc);

        trace!("headless: image {:?} {:?} {:?}", id, name, desc.extent);
        Ok(id)
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<ResourceId, BackendError> {
        Ok(self.state.lock().alloc_id(HeadlessResourceKind::Sampler))
    }

    fn acceleration_structure_build_sizes(
        &self,
        geometry: &AccelerationStructureGeometry,
    ) -> AccelerationStructureSizes {
        let count = geometry.primitive_count() as u64;
        let (result, scratch) = match geometry {
            AccelerationStructureGeometry::Triangles { .. } => (64 * count, 32 * count),
            AccelerationStructureGeometry::Instances { .. } => (128 * count, 64 * count),
        };

        AccelerationStructureSizes {
            result_size: crate::bytes::align_up(result + 256, ACCELERATION_STRUCTURE_ALIGNMENT),
            scratch_size: crate::bytes::align_up(scratch + 256, ACCELERATION_STRUCTURE_ALIGNMENT),
        }
    }

    fn create_acceleration_structure(
        &self,
        _ty: AccelerationStructureType,
        size: u64,
        _name: &str,
    ) -> Result<RawAccelerationStructure, BackendError> {
        let mut state = self.state.lock();
        let id = state.alloc_id(HeadlessResourceKind::AccelerationStructure);
        let device_address = state.alloc_device_address(size);
        Ok(RawAccelerationStructure { id, device_address })
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<RawRayTracingPipeline, BackendError> {
        Self::validate_pipeline(desc)?;

        let mut state = self.state.lock();
        let id = state.alloc_id(HeadlessResourceKind::RayTracingPipeline);
        state.log.ray_tracing_pipelines.push(desc.clone());

        let shader_identifiers = desc
            .groups
            .iter()
            .map(|group| {
                (
                    group.name().to_owned(),
                    Self::shader_identifier(id, group.name()),
                )
            })
            .collect();

        Ok(RawRayTracingPipeline {
            id,
            shader_identifiers,
        })
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<ResourceId, BackendError> {
        let mut state = self.state.lock();
        let id = state.alloc_id(HeadlessResourceKind::ComputePipeline);
        state.compute_pipeline_names.insert(id, desc.name.clone());
        Ok(id)
    }

    fn create_descriptor_heap(
        &self,
        _kind: DescriptorHeapKind,
        _len: usize,
    ) -> Result<ResourceId, BackendError> {
        Ok(self.state.lock().alloc_id(HeadlessResourceKind::DescriptorHeap))
    }

    fn write_descriptors(
        &self,
        heap: ResourceId,
        _kind: DescriptorHeapKind,
        _start: usize,
        _descriptors: &[Descriptor],
    ) -> Result<(), BackendError> {
        match self.state.lock().kinds.get(&heap) {
            Some(HeadlessResourceKind::DescriptorHeap) => Ok(()),
            _ => Err(BackendError::ResourceAccess {
                info: format!("{:?} is not a descriptor heap", heap),
            }),
        }
    }

    fn release(&self, id: ResourceId) {
        let mut state = self.state.lock();
        state.kinds.remove(&id);
        state.memory.remove(&id);
        state.image_descs.remove(&id);
        state.compute_pipeline_names.remove(&id);
    }

    fn command_allocator_count(&self) -> usize {
        self.command_allocator_count
    }

    fn reset_command_allocator(&self, index: usize) -> Result<(), BackendError> {
        assert!(index < self.command_allocator_count);
        self.state.lock().log.allocator_resets.push(index);
        Ok(())
    }

    fn submit(&self, allocator_index: usize, commands: &CommandList) -> Result<(), BackendError> {
        assert!(allocator_index < self.command_allocator_count);

        let mut state = self.state.lock();
        let recorded = commands
            .commands()
            .iter()
            .map(|command| state.execute(command))
            .collect::<Result<Vec<_>, _>>()?;

        state.log.submissions.push(Submission {
            allocator_index,
            commands: recorded,
        });
        Ok(())
    }

    fn signal_fence(&self, value: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.fence_value = state.fence_value.max(value);
        state.log.fence_signals.push(value);
        Ok(())
    }

    fn wait_for_fence(&self, value: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.log.fence_waits.push(value);
        if value > state.fence_value {
            Err(BackendError::ResourceAccess {
                info: format!(
                    "waiting for fence value {} which was never signaled (current: {})",
                    value, state.fence_value
                ),
            })
        } else {
            Ok(())
        }
    }

    fn completed_fence_value(&self) -> u64 {
        self.state.lock().fence_value
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::Device, resource::MemoryLocation};
    use ash::vk;
    use std::sync::Arc;

    #[test]
    fn copies_execute_on_submit() {
        let headless = Arc::new(HeadlessDevice::new(3));
        let device = Device::new(headless.clone());

        let upload = device
            .create_buffer(
                BufferDesc::new_cpu_to_gpu(16, vk::BufferUsageFlags::TRANSFER_SRC),
                "upload",
            )
            .unwrap();
        let dst = device
            .create_buffer(
                BufferDesc::new_gpu_only(16, vk::BufferUsageFlags::TRANSFER_DST),
                "dst",
            )
            .unwrap();
        assert_eq!(dst.desc.memory_location, MemoryLocation::GpuOnly);
        assert!(!dst.is_mapped());

        upload.write_bytes(4, &[1, 2, 3, 4]);

        let mut list = CommandList::new("copy");
        list.begin();
        list.copy_buffer(&upload, 4, &dst, 8, 4);
        list.close();
        device.submit(0, &list).unwrap();

        assert_eq!(headless.read_resource(dst.id(), 8, 4), vec![1, 2, 3, 4]);
        assert_eq!(headless.log().submissions.len(), 1);
    }

    #[test]
    fn resources_are_released_on_drop() {
        let headless = Arc::new(HeadlessDevice::new(3));
        let device = Device::new(headless.clone());

        let buffer = device
            .create_buffer(
                BufferDesc::new_gpu_only(64, vk::BufferUsageFlags::STORAGE_BUFFER),
                "buffer",
            )
            .unwrap();
        assert_eq!(headless.live_resource_count(HeadlessResourceKind::Buffer), 1);
        drop(buffer);
        assert_eq!(headless.live_resource_count(HeadlessResourceKind::Buffer), 0);
    }

    #[test]
    fn waiting_for_unsignaled_value_fails() {
        let device = HeadlessDevice::new(3);
        device.signal_fence(1).unwrap();
        assert!(device.wait_for_fence(1).is_ok());
        assert!(device.wait_for_fence(2).is_err());
    }

    #[test]
    fn recorded_dispatches_name_their_pipeline() {
        let device = Device::new(Arc::new(HeadlessDevice::new(3)));
        let pipeline = device
            .create_compute_pipeline(ComputePipelineDesc {
                name: "tone map".to_owned(),
                code: ::bytes::Bytes::from_static(b"void main() {}"),
                entry_point: "main".to_owned(),
                root_constant_count: 4,
                uses_constant_buffer: false,
            })
            .unwrap();
        let heap = device
            .create_descriptor_heap(DescriptorHeapKind::Resources, 4)
            .unwrap();

        let mut list = CommandList::new("post");
        list.begin();
        list.dispatch(
            &pipeline,
            crate::command::ComputeArgs {
                descriptor_heap: heap,
                table_start: 0,
                root_constants: vec![0; 3],
                constant_buffer: None,
            },
            [1, 1, 1],
        );
        list.close();

        let text = format!("{:?}", list.commands());
        assert!(text.contains("ComputePipeline"));
        assert!(text.contains("tone map"));
    }
}
