//! Recorded command lists.
//!
//! Commands are recorded into a `CommandList` and translated by the device at
//! submit time. Every command holds strong references to the resources it
//! touches, so keeping the recorded commands around until the task fence passes
//! keeps those resources alive.

use crate::{
    descriptor::DescriptorHeap,
    pipeline::{ComputePipeline, RayTracingPipeline},
    ray_tracing::{AccelerationStructure, AccelerationStructureGeometry},
    resource::{Buffer, Image, ResourceRef, ResourceState},
};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct BufferBinding {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub size: u64,
}

impl BufferBinding {
    pub fn whole(buffer: &Arc<Buffer>) -> Self {
        Self {
            buffer: buffer.clone(),
            offset: 0,
            size: buffer.size() as u64,
        }
    }

    pub fn range(buffer: &Arc<Buffer>, offset: u64, size: u64) -> Self {
        assert!(offset + size <= buffer.size() as u64);
        Self {
            buffer: buffer.clone(),
            offset,
            size,
        }
    }
}

/// A strided region of a shader table buffer.
#[derive(Clone, Debug)]
pub struct ShaderTableRegion {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

impl ShaderTableRegion {
    pub fn device_address(&self) -> u64 {
        self.buffer.device_address() + self.offset
    }

    pub fn record_count(&self) -> u64 {
        if self.stride == 0 {
            0
        } else {
            self.size / self.stride
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchRaysDesc {
    pub ray_gen: ShaderTableRegion,
    pub miss: ShaderTableRegion,
    pub hit_groups: ShaderTableRegion,
    pub extent: [u32; 3],
}

/// Global root arguments of a ray dispatch.
#[derive(Clone, Debug)]
pub struct RayTracingArgs {
    pub acceleration_structure: Arc<AccelerationStructure>,
    /// Sample index and random seed offset.
    pub sample_constants: [u32; 2],
    pub frame_data: BufferBinding,
    pub environment: BufferBinding,
    pub environment_alias_map: BufferBinding,
    /// First heap slot of the environment textures (light, background).
    pub environment_textures: u32,
    pub ground_plane: BufferBinding,
    /// Traced against when shading material layers; always `None` (a null
    /// acceleration structure) in practice.
    pub null_acceleration_structure: Option<Arc<AccelerationStructure>>,
    pub descriptor_heap: Arc<DescriptorHeap>,
    pub sampler_heap: Arc<DescriptorHeap>,
}

#[derive(Clone, Debug)]
pub struct ComputeArgs {
    pub descriptor_heap: Arc<DescriptorHeap>,
    /// Heap slot where the dispatch's descriptor table starts.
    pub table_start: u32,
    pub root_constants: Vec<u32>,
    pub constant_buffer: Option<BufferBinding>,
}

#[derive(Clone, Debug)]
pub enum Command {
    CopyBuffer {
        src: Arc<Buffer>,
        dst: Arc<Buffer>,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: Arc<Buffer>,
        src_offset: u64,
        dst: Arc<Image>,
    },
    CopyImageToBuffer {
        src: Arc<Image>,
        dst: Arc<Buffer>,
        dst_offset: u64,
    },
    CopyImage {
        src: Arc<Image>,
        dst: Arc<Image>,
    },
    Transition {
        resource: ResourceRef,
        before: ResourceState,
        after: ResourceState,
    },
    UavBarrier {
        resource: Option<ResourceRef>,
    },
    BuildAccelerationStructure {
        dst: Arc<AccelerationStructure>,
        geometry: AccelerationStructureGeometry,
        scratch_address: u64,
        inputs: Vec<Arc<Buffer>>,
    },
    DispatchRays {
        pipeline: Arc<RayTracingPipeline>,
        args: Box<RayTracingArgs>,
        desc: Box<DispatchRaysDesc>,
    },
    Dispatch {
        pipeline: Arc<ComputePipeline>,
        args: ComputeArgs,
        group_counts: [u32; 3],
    },
}

/// A reusable command list. Recording requires the list to be open; a list is
/// opened with `begin` and closed with `close` before submission.
#[derive(Debug, Default)]
pub struct CommandList {
    name: String,
    commands: Vec<Command>,
    is_open: bool,
}

impl CommandList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            is_open: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn begin(&mut self) {
        assert!(!self.is_open, "command list {:?} is already open", self.name);
        self.commands.clear();
        self.is_open = true;
    }

    pub fn close(&mut self) {
        assert!(self.is_open, "command list {:?} is not open", self.name);
        self.is_open = false;
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Take the recorded commands out of a closed list.
    pub fn take_commands(&mut self) -> Vec<Command> {
        assert!(!self.is_open, "command list {:?} is still open", self.name);
        std::mem::take(&mut self.commands)
    }

    pub fn push(&mut self, command: Command) {
        assert!(
            self.is_open,
            "recording into closed command list {:?}",
            self.name
        );
        self.commands.push(command);
    }

    pub fn copy_buffer(
        &mut self,
        src: &Arc<Buffer>,
        src_offset: u64,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    ) {
        assert!(src_offset + size <= src.size() as u64);
        assert!(dst_offset + size <= dst.size() as u64);

        self.push(Command::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            src_offset,
            dst_offset,
            size,
        });
    }

    pub fn copy_buffer_to_image(&mut self, src: &Arc<Buffer>, src_offset: u64, dst: &Arc<Image>) {
        self.push(Command::CopyBufferToImage {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
        });
    }

    pub fn copy_image_to_buffer(&mut self, src: &Arc<Image>, dst: &Arc<Buffer>, dst_offset: u64) {
        self.push(Command::CopyImageToBuffer {
            src: src.clone(),
            dst: dst.clone(),
            dst_offset,
        });
    }

    pub fn copy_image(&mut self, src: &Arc<Image>, dst: &Arc<Image>) {
        assert_eq!(src.desc.extent, dst.desc.extent);
        self.push(Command::CopyImage {
            src: src.clone(),
            dst: dst.clone(),
        });
    }

    pub fn transition(
        &mut self,
        resource: impl Into<ResourceRef>,
        before: ResourceState,
        after: ResourceState,
    ) {
        if before != after {
            self.push(Command::Transition {
                resource: resource.into(),
                before,
                after,
            });
        }
    }

    pub fn uav_barrier(&mut self, resource: Option<ResourceRef>) {
        self.push(Command::UavBarrier { resource });
    }

    pub fn build_acceleration_structure(
        &mut self,
        dst: &Arc<AccelerationStructure>,
        geometry: AccelerationStructureGeometry,
        scratch_address: u64,
        inputs: Vec<Arc<Buffer>>,
    ) {
        assert_eq!(dst.ty, geometry.ty());
        self.push(Command::BuildAccelerationStructure {
            dst: dst.clone(),
            geometry,
            scratch_address,
            inputs,
        });
    }

    pub fn dispatch_rays(
        &mut self,
        pipeline: &Arc<RayTracingPipeline>,
        args: RayTracingArgs,
        desc: DispatchRaysDesc,
    ) {
        self.push(Command::DispatchRays {
            pipeline: pipeline.clone(),
            args: Box::new(args),
            desc: Box::new(desc),
        });
    }

    pub fn dispatch(
        &mut self,
        pipeline: &Arc<ComputePipeline>,
        args: ComputeArgs,
        group_counts: [u32; 3],
    ) {
        self.push(Command::Dispatch {
            pipeline: pipeline.clone(),
            args,
            group_counts,
        });
    }
}

#[test]
#[should_panic]
fn recording_into_closed_list_panics() {
    let mut list = CommandList::new("test");
    list.uav_barrier(None);
}

#[test]
fn begin_clears_previous_recording() {
    let mut list = CommandList::new("test");
    list.begin();
    list.uav_barrier(None);
    list.close();
    assert_eq!(list.commands().len(), 1);

    list.begin();
    assert!(list.is_empty());
    list.close();
}
