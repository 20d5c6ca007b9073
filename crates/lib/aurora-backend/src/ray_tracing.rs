use crate::{device::RenderDevice, resource::ResourceId};
use ash::vk;
use std::sync::Arc;

/// Alignment of acceleration-structure results and build scratch memory.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructureType {
    BottomLevel,
    TopLevel,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelerationStructureSizes {
    pub result_size: u64,
    pub scratch_size: u64,
}

/// Inputs of a single acceleration structure build.
#[derive(Clone, Copy, Debug)]
pub enum AccelerationStructureGeometry {
    Triangles {
        vertex_address: u64,
        vertex_stride: u64,
        vertex_count: u32,
        vertex_format: vk::Format,
        index_address: u64,
        index_count: u32,
        index_type: vk::IndexType,
        flags: vk::GeometryFlagsKHR,
    },
    Instances {
        instances_address: u64,
        instance_count: u32,
    },
}

impl AccelerationStructureGeometry {
    pub fn ty(&self) -> AccelerationStructureType {
        match self {
            AccelerationStructureGeometry::Triangles { .. } => AccelerationStructureType::BottomLevel,
            AccelerationStructureGeometry::Instances { .. } => AccelerationStructureType::TopLevel,
        }
    }

    pub fn primitive_count(&self) -> u32 {
        match *self {
            AccelerationStructureGeometry::Triangles { index_count, .. } => index_count / 3,
            AccelerationStructureGeometry::Instances { instance_count, .. } => instance_count,
        }
    }
}

pub struct RawAccelerationStructure {
    pub id: ResourceId,
    pub device_address: u64,
}

pub struct AccelerationStructure {
    pub ty: AccelerationStructureType,
    pub size: u64,
    pub name: String,
    id: ResourceId,
    device_address: u64,
    device: Arc<dyn RenderDevice>,
}

impl AccelerationStructure {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        ty: AccelerationStructureType,
        size: u64,
        name: String,
        raw: RawAccelerationStructure,
    ) -> Self {
        Self {
            ty,
            size,
            name,
            id: raw.id,
            device_address: raw.device_address,
            device,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("size", &self.size)
            .finish()
    }
}

/// Top-level instance record, laid out exactly as the ray tracing API expects.
#[repr(C)]
#[derive(Clone, Debug, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GeometryInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    instance_id_and_mask: u32,
    instance_sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

impl GeometryInstance {
    pub fn new(
        transform: [f32; 12],
        id: u32,
        mask: u8,
        sbt_offset: u32,
        flags: vk::GeometryInstanceFlagsKHR,
        blas_address: u64,
    ) -> Self {
        let mut instance = GeometryInstance {
            transform,
            instance_id_and_mask: 0,
            instance_sbt_offset_and_flags: 0,
            blas_address,
        };
        instance.set_id(id);
        instance.set_mask(mask);
        instance.set_sbt_offset(sbt_offset);
        instance.set_flags(flags);
        instance
    }

    fn set_id(&mut self, id: u32) {
        let id = id & 0x00ffffff;
        self.instance_id_and_mask |= id;
    }

    fn set_mask(&mut self, mask: u8) {
        let mask = mask as u32;
        self.instance_id_and_mask |= mask << 24;
    }

    fn set_sbt_offset(&mut self, offset: u32) {
        let offset = offset & 0x00ffffff;
        self.instance_sbt_offset_and_flags |= offset;
    }

    fn set_flags(&mut self, flags: vk::GeometryInstanceFlagsKHR) {
        let flags = flags.as_raw() as u32;
        self.instance_sbt_offset_and_flags |= flags << 24;
    }

    pub fn id(&self) -> u32 {
        self.instance_id_and_mask & 0x00ffffff
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.instance_sbt_offset_and_flags & 0x00ffffff
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.instance_sbt_offset_and_flags >> 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_instance_packing() {
        assert_eq!(std::mem::size_of::<GeometryInstance>(), 64);

        let instance = GeometryInstance::new(
            [0.0; 12],
            0x12345678,
            0xff,
            7,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            0xdead_0000,
        );

        assert_eq!(instance.id(), 0x345678);
        assert_eq!(instance.mask(), 0xff);
        assert_eq!(instance.sbt_offset(), 7);
        assert_eq!(
            instance.flags(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
        );
        assert_eq!(instance.blas_address, 0xdead_0000);
    }
}
