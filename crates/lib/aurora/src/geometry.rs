use crate::{
    context::RenderContext,
    error::RenderError,
    image::CompletionCallback,
    memory_pool::VertexBufferSlice,
    tangent_space,
};
use aurora_backend::{
    ash::vk, AccelerationStructure, AccelerationStructureGeometry, AccelerationStructureType,
};
use bytemuck::Pod;
use glam::{Vec2, Vec3};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

/// One vertex attribute as supplied by the caller. The data may be
/// interleaved with other attributes, in which case `stride` exceeds the
/// element size and `offset` locates the first element.
#[derive(Clone, Debug)]
pub struct VertexChannel {
    pub data: Arc<Vec<u8>>,
    pub offset: usize,
    pub stride: usize,
}

impl VertexChannel {
    pub fn packed<T: Pod>(values: &[T]) -> Self {
        Self {
            data: Arc::new(bytemuck::cast_slice(values).to_vec()),
            offset: 0,
            stride: std::mem::size_of::<T>(),
        }
    }

    pub fn interleaved(data: Arc<Vec<u8>>, offset: usize, stride: usize) -> Self {
        Self {
            data,
            offset,
            stride,
        }
    }

    /// Reads `count` elements of `component_count` floats, copying element by
    /// element when the source is interleaved.
    fn read_floats(
        &self,
        component_count: usize,
        count: usize,
        what: &str,
    ) -> Result<Vec<f32>, RenderError> {
        let element_size = component_count * 4;
        let stride = if self.stride == 0 {
            element_size
        } else {
            self.stride
        };

        if count > 0 && self.offset + (count - 1) * stride + element_size > self.data.len() {
            return Err(RenderError::invalid_argument(format!(
                "{} channel holds {} bytes, {} elements of stride {} requested",
                what,
                self.data.len(),
                count,
                stride
            )));
        }

        let bytes: Vec<u8> = if stride == element_size {
            self.data[self.offset..self.offset + count * element_size].to_vec()
        } else {
            (0..count)
                .flat_map(|i| {
                    let start = self.offset + i * stride;
                    self.data[start..start + element_size].iter().copied()
                })
                .collect()
        };

        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Everything the pull callback of a geometry hands over.
#[derive(Clone, Debug)]
pub struct VertexData {
    pub positions: VertexChannel,
    pub normals: Option<VertexChannel>,
    pub tangents: Option<VertexChannel>,
    pub texcoords: Option<VertexChannel>,
    pub indices: Option<Vec<u32>>,
}

impl VertexData {
    pub fn new(positions: &[Vec3]) -> Self {
        Self {
            positions: VertexChannel::packed(positions),
            normals: None,
            tangents: None,
            texcoords: None,
            indices: None,
        }
    }

    pub fn normals(mut self, normals: &[Vec3]) -> Self {
        self.normals = Some(VertexChannel::packed(normals));
        self
    }

    pub fn tangents(mut self, tangents: &[Vec3]) -> Self {
        self.tangents = Some(VertexChannel::packed(tangents));
        self
    }

    pub fn texcoords(mut self, texcoords: &[Vec2]) -> Self {
        self.texcoords = Some(VertexChannel::packed(texcoords));
        self
    }

    pub fn indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = Some(indices);
        self
    }
}

pub type VertexDataCallback = Arc<dyn Fn() -> Option<VertexData> + Send + Sync>;

/// Describes a triangle mesh whose attributes are pulled on activation.
#[derive(Clone)]
pub struct GeometryDescriptor {
    pub vertex_count: u32,
    /// Zero when the mesh is not indexed.
    pub index_count: u32,
    pub get_data: VertexDataCallback,
    pub complete: Option<CompletionCallback>,
}

impl GeometryDescriptor {
    pub fn new(
        vertex_count: u32,
        index_count: u32,
        get_data: impl Fn() -> Option<VertexData> + Send + Sync + 'static,
    ) -> Self {
        Self {
            vertex_count,
            index_count,
            get_data: Arc::new(get_data),
            complete: None,
        }
    }

    pub fn from_data(data: VertexData) -> Self {
        let vertex_count = (data.positions.data.len().saturating_sub(data.positions.offset)
            / data.positions.stride.max(1)) as u32;
        let index_count = data.indices.as_ref().map_or(0, |i| i.len() as u32);
        Self::new(vertex_count, index_count, move || Some(data.clone()))
    }

    pub fn on_complete(mut self, complete: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(complete));
        self
    }
}

impl std::fmt::Debug for GeometryDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryDescriptor")
            .field("vertex_count", &self.vertex_count)
            .field("index_count", &self.index_count)
            .finish()
    }
}

/// Vertex data in the form the GPU buffers hold: tightly packed, indexed,
/// with normals and tangents always present.
#[derive(Clone, Debug)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec3>,
    pub texcoords: Option<Vec<Vec2>>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn from_vertex_data(
        vertex_count: u32,
        index_count: u32,
        data: &VertexData,
    ) -> Result<Self, RenderError> {
        let count = vertex_count as usize;

        let to_vec3 = |floats: Vec<f32>| -> Vec<Vec3> {
            floats.chunks_exact(3).map(Vec3::from_slice).collect()
        };

        let positions = to_vec3(data.positions.read_floats(3, count, "position")?);

        let indices = match &data.indices {
            Some(indices) => {
                if index_count as usize > indices.len() {
                    return Err(RenderError::invalid_argument(format!(
                        "{} indices declared, {} supplied",
                        index_count,
                        indices.len()
                    )));
                }
                let indices = indices[..index_count as usize].to_vec();
                if let Some(bad) = indices.iter().find(|&&i| i as usize >= count) {
                    return Err(RenderError::invalid_argument(format!(
                        "index {} is out of range for {} vertices",
                        bad, count
                    )));
                }
                indices
            }
            None => (0..vertex_count).collect(),
        };

        let normals = match &data.normals {
            Some(channel) => to_vec3(channel.read_floats(3, count, "normal")?),
            None => tangent_space::calculate_normals(&positions, &indices),
        };

        let texcoords = match &data.texcoords {
            Some(channel) => Some(
                channel
                    .read_floats(2, count, "texcoord")?
                    .chunks_exact(2)
                    .map(Vec2::from_slice)
                    .collect::<Vec<_>>(),
            ),
            None => None,
        };

        let tangents = match (&data.tangents, &texcoords) {
            (Some(channel), _) => to_vec3(channel.read_floats(3, count, "tangent")?),
            (None, Some(texcoords)) => {
                tangent_space::calculate_tangents(&positions, &normals, texcoords, &indices)
            }
            (None, None) => tangent_space::basis_tangents(&normals),
        };

        Ok(Self {
            positions,
            normals,
            tangents,
            texcoords,
            indices,
        })
    }
}

/// GPU slices of a geometry's attributes. Each slice keeps its vertex arena
/// alive.
#[derive(Clone, Debug)]
pub struct GeometryBuffers {
    pub positions: VertexBufferSlice,
    pub normals: VertexBufferSlice,
    pub tangents: VertexBufferSlice,
    pub texcoords: Option<VertexBufferSlice>,
    pub indices: VertexBufferSlice,
    pub vertex_count: u32,
    pub index_count: u32,
}

pub struct Geometry {
    ctx: Arc<RenderContext>,
    name: String,
    descriptor: GeometryDescriptor,
    buffers: Option<GeometryBuffers>,
    blas: Option<Arc<AccelerationStructure>>,
    is_dirty: bool,
}

impl Geometry {
    pub fn new(ctx: Arc<RenderContext>, name: &str, descriptor: GeometryDescriptor) -> Self {
        Self {
            ctx,
            name: name.to_owned(),
            descriptor,
            buffers: None,
            blas: None,
            is_dirty: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &GeometryDescriptor {
        &self.descriptor
    }

    pub fn vertex_count(&self) -> u32 {
        self.descriptor.vertex_count
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn buffers(&self) -> Option<&GeometryBuffers> {
        self.buffers.as_ref()
    }

    pub fn blas(&self) -> Option<&Arc<AccelerationStructure>> {
        self.blas.as_ref()
    }

    /// Pulls the vertex data and queues it for upload. Returns `false` when
    /// nothing changed.
    pub fn update(&mut self) -> Result<bool, RenderError> {
        if !self.is_dirty {
            return Ok(false);
        }

        let data = (self.descriptor.get_data)().ok_or_else(|| {
            RenderError::invalid_argument(format!("geometry {:?} provided no vertex data", self.name))
        })?;

        let mesh = MeshData::from_vertex_data(
            self.descriptor.vertex_count,
            self.descriptor.index_count,
            &data,
        );
        if let Some(complete) = &self.descriptor.complete {
            complete();
        }
        let mesh = mesh.map_err(|err| {
            error!("Geometry {:?}: {}", self.name, err);
            err
        })?;

        let buffers = {
            let mut pool = self.ctx.vertex_pool.lock();
            let uploads = &self.ctx.uploads;
            let mut upload = |bytes: &[u8]| pool.get(bytes, uploads);

            GeometryBuffers {
                positions: upload(bytemuck::cast_slice(&mesh.positions))?,
                normals: upload(bytemuck::cast_slice(&mesh.normals))?,
                tangents: upload(bytemuck::cast_slice(&mesh.tangents))?,
                texcoords: match &mesh.texcoords {
                    Some(texcoords) => Some(upload(bytemuck::cast_slice(texcoords))?),
                    None => None,
                },
                indices: upload(bytemuck::cast_slice(&mesh.indices))?,
                vertex_count: mesh.positions.len() as u32,
                index_count: mesh.indices.len() as u32,
            }
        };

        trace!(
            "Geometry {:?}: {} vertices, {} indices",
            self.name,
            buffers.vertex_count,
            buffers.index_count
        );

        self.buffers = Some(buffers);
        self.blas = None;
        self.is_dirty = false;
        Ok(true)
    }

    /// Builds the bottom-level acceleration structure if there is none.
    /// The vertex uploads must already be recorded.
    pub fn update_blas(&mut self) -> Result<bool, RenderError> {
        if self.blas.is_some() {
            return Ok(false);
        }

        let buffers = self.buffers.as_ref().unwrap_or_else(|| {
            panic!("geometry {:?} has no vertex data; call update() first", self.name)
        });

        // Not flagged opaque: the ray flags at trace time decide whether
        // any-hit runs.
        let geometry = AccelerationStructureGeometry::Triangles {
            vertex_address: buffers.positions.device_address(),
            vertex_stride: 12,
            vertex_count: buffers.vertex_count,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            index_address: buffers.indices.device_address(),
            index_count: buffers.index_count,
            index_type: vk::IndexType::UINT32,
            flags: vk::GeometryFlagsKHR::empty(),
        };

        let sizes = self.ctx.device.acceleration_structure_build_sizes(&geometry);
        let blas = self.ctx.device.create_acceleration_structure(
            AccelerationStructureType::BottomLevel,
            sizes.result_size,
            format!("{} (blas)", self.name),
        )?;

        let mut tasks = self.ctx.tasks.lock();
        let scratch = tasks.scratch(sizes.scratch_size)?;
        let list = tasks.command_list();
        list.build_acceleration_structure(
            &blas,
            geometry,
            scratch.device_address,
            vec![
                buffers.positions.buffer.clone(),
                buffers.indices.buffer.clone(),
                scratch.buffer.clone(),
            ],
        );
        list.uav_barrier(Some((&blas).into()));
        tasks.complete_task()?;

        info!(
            "Built BLAS for {:?} ({} triangles)",
            self.name,
            buffers.index_count / 3
        );
        self.blas = Some(blas);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_backend::{
        headless::{HeadlessDevice, RecordedCommand},
        shader_compiler::PassthroughShaderCompiler,
        Device,
    };

    fn triangle() -> VertexData {
        VertexData::new(&[Vec3::ZERO, Vec3::X, Vec3::Y])
    }

    #[test]
    fn missing_normals_and_indices_are_generated() {
        let mesh = MeshData::from_vertex_data(3, 0, &triangle()).unwrap();

        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.normals.len(), 3);
        for n in &mesh.normals {
            assert!((*n - Vec3::Z).length() < 1e-6);
        }
        // No texcoords: tangents come from the orthonormal basis of +Z.
        for t in &mesh.tangents {
            assert!((*t - Vec3::X).length() < 1e-6);
        }
        assert!(mesh.texcoords.is_none());
    }

    #[test]
    fn generated_normals_are_unit_length() {
        let positions: Vec<Vec3> = (0..16)
            .map(|i| {
                let a = i as f32 * 0.7;
                Vec3::new(a.cos(), a.sin(), (i % 3) as f32 * 0.25)
            })
            .collect();
        let indices: Vec<u32> = (0..14).flat_map(|i| [0, i + 1, i + 2]).collect();
        let data = VertexData::new(&positions).indices(indices.clone());

        let mesh = MeshData::from_vertex_data(16, indices.len() as u32, &data).unwrap();
        assert_eq!(mesh.normals.len(), positions.len());
        for n in &mesh.normals {
            assert!((n.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn interleaved_channels_are_gathered() {
        // position (3 floats) + texcoord (2 floats) per vertex.
        let interleaved: Vec<f32> = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 1.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, 1.0,
        ];
        let bytes = Arc::new(bytemuck::cast_slice(&interleaved).to_vec());
        let data = VertexData {
            positions: VertexChannel::interleaved(bytes.clone(), 0, 20),
            normals: None,
            tangents: None,
            texcoords: Some(VertexChannel::interleaved(bytes, 12, 20)),
            indices: None,
        };

        let mesh = MeshData::from_vertex_data(3, 0, &data).unwrap();
        assert_eq!(mesh.positions, vec![Vec3::ZERO, Vec3::X, Vec3::Y]);
        assert_eq!(
            mesh.texcoords.unwrap(),
            vec![Vec2::ZERO, Vec2::X, Vec2::Y]
        );
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let data = triangle().indices(vec![0, 1, 3]);
        assert!(MeshData::from_vertex_data(3, 3, &data).is_err());
        assert!(MeshData::from_vertex_data(4, 0, &triangle()).is_err());
    }

    #[test]
    fn blas_is_built_once_per_update() {
        let headless = Arc::new(HeadlessDevice::new(3));
        let ctx = RenderContext::new(
            Device::new(headless.clone()),
            Arc::new(PassthroughShaderCompiler),
            3,
        );

        let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = completed.clone();
        let descriptor = GeometryDescriptor::from_data(triangle()).on_complete(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(descriptor.vertex_count, 3);

        let mut geometry = Geometry::new(ctx.clone(), "/geometry/triangle", descriptor);
        assert!(geometry.update().unwrap());
        assert!(!geometry.update().unwrap());
        assert_eq!(completed.load(std::sync::atomic::Ordering::SeqCst), 1);

        ctx.upload_transfer_buffers();
        assert!(geometry.update_blas().unwrap());
        assert!(!geometry.update_blas().unwrap());

        let log = headless.log();
        assert_eq!(log.fence_signals, vec![1]);
        let commands = &log.submissions[0].commands;
        let build = commands
            .iter()
            .position(|c| {
                matches!(
                    c,
                    RecordedCommand::BuildAccelerationStructure {
                        ty: AccelerationStructureType::BottomLevel,
                        primitive_count: 1,
                    }
                )
            })
            .unwrap();
        assert!(matches!(
            commands[build + 1],
            RecordedCommand::UavBarrier { resource: Some(_) }
        ));

        // The generated normals reached the GPU buffer.
        let normals = &geometry.buffers().unwrap().normals;
        let bytes = headless.read_resource(normals.buffer.id(), normals.offset, 36);
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        for normal in floats.chunks_exact(3) {
            assert!((Vec3::from_slice(normal) - Vec3::Z).length() < 1e-6);
        }
    }
}
