pub mod bytes;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod headless;
pub mod pipeline;
pub mod ray_tracing;
pub mod resource;
pub mod shader_compiler;
pub mod vulkan;

pub use ash;
pub use gpu_allocator;
pub use vk_sync;

pub use command::{
    BufferBinding, Command, CommandList, ComputeArgs, DispatchRaysDesc, RayTracingArgs,
    ShaderTableRegion,
};
pub use descriptor::{Descriptor, DescriptorHeap, DescriptorHeapKind};
pub use device::{Device, DeviceProperties, RenderDevice};
pub use error::BackendError;
pub use pipeline::{
    ComputePipeline, ComputePipelineDesc, RayTracingPipeline, RayTracingPipelineDesc,
};
pub use ray_tracing::{
    AccelerationStructure, AccelerationStructureGeometry, AccelerationStructureSizes,
    AccelerationStructureType, GeometryInstance,
};
pub use resource::{
    Buffer, BufferDesc, Image, ImageDesc, MemoryLocation, ResourceId, ResourceRef, ResourceState,
    Sampler, SamplerDesc,
};
