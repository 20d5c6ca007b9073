use crate::{device::RenderDevice, ray_tracing::AccelerationStructure};
use ash::vk;
pub use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::{ptr::NonNull, sync::Arc};

/// Device-side identity of a resource. Stable for the lifetime of the resource
/// and never reused by the same device.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Explicit resource states, recorded by callers on every transition.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    CopySource,
    CopyDest,
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    AccelerationStructure,
    GenericRead,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct BufferDesc {
    pub size: usize,
    pub usage: vk::BufferUsageFlags,
    pub memory_location: MemoryLocation,
    pub alignment: Option<u64>,
}

impl BufferDesc {
    pub fn new_gpu_only(size: usize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory_location: MemoryLocation::GpuOnly,
            alignment: None,
        }
    }

    pub fn new_cpu_to_gpu(size: usize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory_location: MemoryLocation::CpuToGpu,
            alignment: None,
        }
    }

    pub fn new_gpu_to_cpu(size: usize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory_location: MemoryLocation::GpuToCpu,
            alignment: None,
        }
    }

    pub fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn is_host_visible(&self) -> bool {
        matches!(
            self.memory_location,
            MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu
        )
    }
}

/// What a device hands back when it creates a buffer.
pub struct RawBuffer {
    pub id: ResourceId,
    pub device_address: u64,
    pub mapped_ptr: Option<NonNull<u8>>,
}

struct MappedMemory {
    ptr: NonNull<u8>,
    len: usize,
    // Serializes CPU-side access through the shared mapping.
    lock: Mutex<()>,
}

// The mapping is owned by the buffer and only touched under `lock`.
unsafe impl Send for MappedMemory {}
unsafe impl Sync for MappedMemory {}

pub struct Buffer {
    pub desc: BufferDesc,
    pub name: String,
    id: ResourceId,
    device_address: u64,
    mapped: Option<MappedMemory>,
    device: Arc<dyn RenderDevice>,
}

impl Buffer {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        desc: BufferDesc,
        name: String,
        raw: RawBuffer,
    ) -> Self {
        Self {
            mapped: raw.mapped_ptr.map(|ptr| MappedMemory {
                ptr,
                len: desc.size,
                lock: Mutex::new(()),
            }),
            desc,
            name,
            id: raw.id,
            device_address: raw.device_address,
            device,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.desc.size
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    fn mapping(&self, offset: usize, len: usize) -> &MappedMemory {
        let mapped = self
            .mapped
            .as_ref()
            .unwrap_or_else(|| panic!("buffer {:?} is not host-visible", self.name));
        assert!(
            offset + len <= mapped.len,
            "access [{}, {}) out of range for buffer {:?} of size {}",
            offset,
            offset + len,
            self.name,
            mapped.len
        );
        mapped
    }

    /// Copy `data` into the persistently mapped memory at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let mapped = self.mapping(offset, data.len());
        let _guard = mapped.lock.lock();
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.ptr.as_ptr().add(offset),
                data.len(),
            );
        }
    }

    /// Copy from the persistently mapped memory at `offset` into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        let mapped = self.mapping(offset, out.len());
        let _guard = mapped.lock.lock();
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped.ptr.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    /// # Safety
    /// The caller must be the only CPU-side reader or writer of the returned
    /// range for as long as the slice lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn mapped_slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let mapped = self.mapping(offset, len);
        std::slice::from_raw_parts_mut(mapped.ptr.as_ptr().add(offset), len)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: [u32; 2],
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    pub fn new_2d(format: vk::Format, extent: [u32; 2]) -> Self {
        Self {
            format,
            extent,
            usage: vk::ImageUsageFlags::default(),
        }
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    pub fn extent(mut self, extent: [u32; 2]) -> Self {
        self.extent = extent;
        self
    }

    pub fn bytes_per_pixel(&self) -> usize {
        format_byte_size(self.format)
    }

    pub fn row_pitch(&self) -> usize {
        self.extent[0] as usize * self.bytes_per_pixel()
    }

    pub fn byte_size(&self) -> usize {
        self.row_pitch() * self.extent[1] as usize
    }
}

pub fn format_byte_size(format: vk::Format) -> usize {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT => 8,
        vk::Format::R32G32B32_SFLOAT => 12,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => panic!("unsupported image format {:?}", format),
    }
}

pub struct Image {
    pub desc: ImageDesc,
    pub name: String,
    id: ResourceId,
    device: Arc<dyn RenderDevice>,
}

impl Image {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        desc: ImageDesc,
        name: String,
        id: ResourceId,
    ) -> Self {
        Self {
            desc,
            name,
            id,
            device,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub address_modes: [vk::SamplerAddressMode; 2],
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_modes: [vk::SamplerAddressMode::REPEAT; 2],
        }
    }
}

pub struct Sampler {
    pub desc: SamplerDesc,
    id: ResourceId,
    device: Arc<dyn RenderDevice>,
}

impl Sampler {
    pub(crate) fn new(device: Arc<dyn RenderDevice>, desc: SamplerDesc, id: ResourceId) -> Self {
        Self { desc, id, device }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish()
    }
}

/// Any resource that can be the subject of a barrier.
#[derive(Clone, Debug)]
pub enum ResourceRef {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
    AccelerationStructure(Arc<AccelerationStructure>),
}

impl ResourceRef {
    pub fn id(&self) -> ResourceId {
        match self {
            ResourceRef::Buffer(buffer) => buffer.id(),
            ResourceRef::Image(image) => image.id(),
            ResourceRef::AccelerationStructure(accel) => accel.id(),
        }
    }
}

impl From<&Arc<Buffer>> for ResourceRef {
    fn from(buffer: &Arc<Buffer>) -> Self {
        ResourceRef::Buffer(buffer.clone())
    }
}

impl From<&Arc<Image>> for ResourceRef {
    fn from(image: &Arc<Image>) -> Self {
        ResourceRef::Image(image.clone())
    }
}

impl From<&Arc<AccelerationStructure>> for ResourceRef {
    fn from(accel: &Arc<AccelerationStructure>) -> Self {
        ResourceRef::AccelerationStructure(accel.clone())
    }
}
