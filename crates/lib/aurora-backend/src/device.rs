use crate::{
    command::CommandList,
    descriptor::{Descriptor, DescriptorHeap, DescriptorHeapKind},
    pipeline::{
        ComputePipeline, ComputePipelineDesc, RawRayTracingPipeline, RayTracingPipeline,
        RayTracingPipelineDesc,
    },
    ray_tracing::{
        AccelerationStructure, AccelerationStructureGeometry, AccelerationStructureSizes,
        AccelerationStructureType, RawAccelerationStructure,
    },
    resource::{Buffer, BufferDesc, Image, ImageDesc, RawBuffer, ResourceId, Sampler, SamplerDesc},
    BackendError,
};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct DeviceProperties {
    pub name: String,
    pub shader_group_handle_size: u32,
    pub max_ray_recursion_depth: u32,
    pub supports_shared_handles: bool,
}

/// The seam between the renderer and a GPU implementation.
///
/// A device owns one universal queue, a fixed number of command allocators and
/// one monotonically increasing fence. Resources are created through `Device`,
/// which wraps the raw ids returned here into reference-counted handles.
pub trait RenderDevice: Send + Sync {
    fn properties(&self) -> &DeviceProperties;

    fn create_buffer(&self, desc: &BufferDesc, name: &str) -> Result<RawBuffer, BackendError>;
    fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<ResourceId, BackendError>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<ResourceId, BackendError>;

    fn acceleration_structure_build_sizes(
        &self,
        geometry: &AccelerationStructureGeometry,
    ) -> AccelerationStructureSizes;
    fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        size: u64,
        name: &str,
    ) -> Result<RawAccelerationStructure, BackendError>;

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
    ) -> Result<RawRayTracingPipeline, BackendError>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc)
        -> Result<ResourceId, BackendError>;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        len: usize,
    ) -> Result<ResourceId, BackendError>;
    fn write_descriptors(
        &self,
        heap: ResourceId,
        kind: DescriptorHeapKind,
        start: usize,
        descriptors: &[Descriptor],
    ) -> Result<(), BackendError>;

    /// Called when the last handle to a resource goes away.
    fn release(&self, id: ResourceId);

    fn command_allocator_count(&self) -> usize;
    fn reset_command_allocator(&self, index: usize) -> Result<(), BackendError>;
    fn submit(&self, allocator_index: usize, commands: &CommandList) -> Result<(), BackendError>;

    fn signal_fence(&self, value: u64) -> Result<(), BackendError>;
    fn wait_for_fence(&self, value: u64) -> Result<(), BackendError>;
    fn completed_fence_value(&self) -> u64;

    fn wait_idle(&self) -> Result<(), BackendError>;
}

/// Cheaply clonable handle to a `RenderDevice`.
#[derive(Clone)]
pub struct Device {
    raw: Arc<dyn RenderDevice>,
}

impl Device {
    pub fn new(raw: Arc<dyn RenderDevice>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Arc<dyn RenderDevice> {
        &self.raw
    }

    pub fn properties(&self) -> &DeviceProperties {
        self.raw.properties()
    }

    pub fn create_buffer(
        &self,
        desc: BufferDesc,
        name: impl Into<String>,
    ) -> Result<Arc<Buffer>, BackendError> {
        let name = name.into();
        let raw = self.raw.create_buffer(&desc, &name)?;
        Ok(Arc::new(Buffer::new(self.raw.clone(), desc, name, raw)))
    }

    pub fn create_image(
        &self,
        desc: ImageDesc,
        name: impl Into<String>,
    ) -> Result<Arc<Image>, BackendError> {
        let name = name.into();
        let id = self.raw.create_image(&desc, &name)?;
        Ok(Arc::new(Image::new(self.raw.clone(), desc, name, id)))
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> Result<Arc<Sampler>, BackendError> {
        let id = self.raw.create_sampler(&desc)?;
        Ok(Arc::new(Sampler::new(self.raw.clone(), desc, id)))
    }

    pub fn acceleration_structure_build_sizes(
        &self,
        geometry: &AccelerationStructureGeometry,
    ) -> AccelerationStructureSizes {
        self.raw.acceleration_structure_build_sizes(geometry)
    }

    pub fn create_acceleration_structure(
        &self,
        ty: AccelerationStructureType,
        size: u64,
        name: impl Into<String>,
    ) -> Result<Arc<AccelerationStructure>, BackendError> {
        let name = name.into();
        let raw = self.raw.create_acceleration_structure(ty, size, &name)?;
        Ok(Arc::new(AccelerationStructure::new(
            self.raw.clone(),
            ty,
            size,
            name,
            raw,
        )))
    }

    pub fn create_ray_tracing_pipeline(
        &self,
        desc: RayTracingPipelineDesc,
    ) -> Result<Arc<RayTracingPipeline>, BackendError> {
        let raw = self.raw.create_ray_tracing_pipeline(&desc)?;
        Ok(Arc::new(RayTracingPipeline::new(self.raw.clone(), desc, raw)))
    }

    pub fn create_compute_pipeline(
        &self,
        desc: ComputePipelineDesc,
    ) -> Result<Arc<ComputePipeline>, BackendError> {
        let id = self.raw.create_compute_pipeline(&desc)?;
        Ok(Arc::new(ComputePipeline::new(self.raw.clone(), desc, id)))
    }

    pub fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        len: usize,
    ) -> Result<Arc<DescriptorHeap>, BackendError> {
        let id = self.raw.create_descriptor_heap(kind, len)?;
        Ok(Arc::new(DescriptorHeap::new(self.raw.clone(), kind, id, len)))
    }

    pub fn command_allocator_count(&self) -> usize {
        self.raw.command_allocator_count()
    }

    pub fn reset_command_allocator(&self, index: usize) -> Result<(), BackendError> {
        self.raw.reset_command_allocator(index)
    }

    pub fn submit(&self, allocator_index: usize, commands: &CommandList) -> Result<(), BackendError> {
        assert!(
            !commands.is_open(),
            "command list {:?} must be closed before submission",
            commands.name()
        );
        self.raw.submit(allocator_index, commands)
    }

    pub fn signal_fence(&self, value: u64) -> Result<(), BackendError> {
        self.raw.signal_fence(value)
    }

    pub fn wait_for_fence(&self, value: u64) -> Result<(), BackendError> {
        self.raw.wait_for_fence(value)
    }

    pub fn completed_fence_value(&self) -> u64 {
        self.raw.completed_fence_value()
    }

    pub fn wait_idle(&self) -> Result<(), BackendError> {
        self.raw.wait_idle()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.properties().name)
            .finish()
    }
}
