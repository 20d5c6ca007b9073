use crate::{device::RenderDevice, resource::ResourceId};
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};

pub const SHADER_IDENTIFIER_SIZE: usize = 32;
/// Alignment of every record within a shader table.
pub const SHADER_RECORD_ALIGNMENT: usize = 32;
/// Alignment of the start of a shader table.
pub const SHADER_TABLE_ALIGNMENT: usize = 64;

pub type ShaderIdentifier = [u8; SHADER_IDENTIFIER_SIZE];

/// A compiled shader library: one module exporting several entry points.
#[derive(Clone, Debug)]
pub struct ShaderLibraryDesc {
    pub name: String,
    pub code: Bytes,
    pub entry_points: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderExport {
    pub library: usize,
    pub entry_point: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeneralShaderKind {
    RayGen,
    Miss,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShaderGroupDesc {
    General {
        name: String,
        kind: GeneralShaderKind,
        shader: ShaderExport,
    },
    TrianglesHit {
        name: String,
        closest_hit: Option<ShaderExport>,
        any_hit: Option<ShaderExport>,
    },
}

impl ShaderGroupDesc {
    pub fn name(&self) -> &str {
        match self {
            ShaderGroupDesc::General { name, .. } => name,
            ShaderGroupDesc::TrianglesHit { name, .. } => name,
        }
    }
}

/// Layout of the per-record arguments that follow a shader identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocalRootLayout {
    RayGen,
    RadianceHit,
    LayerMiss,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRootAssociation {
    pub layout: LocalRootLayout,
    pub groups: Vec<String>,
}

/// Global arguments bound once per ray dispatch, in root-parameter order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GlobalRootParameter {
    SceneAccelerationStructure,
    SampleConstants,
    FrameData,
    Environment,
    EnvironmentAliasMap,
    EnvironmentTextures,
    GroundPlane,
    NullAccelerationStructure,
}

pub const GLOBAL_ROOT_PARAMETERS: [GlobalRootParameter; 8] = [
    GlobalRootParameter::SceneAccelerationStructure,
    GlobalRootParameter::SampleConstants,
    GlobalRootParameter::FrameData,
    GlobalRootParameter::Environment,
    GlobalRootParameter::EnvironmentAliasMap,
    GlobalRootParameter::EnvironmentTextures,
    GlobalRootParameter::GroundPlane,
    GlobalRootParameter::NullAccelerationStructure,
];

#[derive(Clone, Debug)]
pub struct RayTracingPipelineDesc {
    pub name: String,
    pub max_pipeline_ray_recursion_depth: u32,
    pub libraries: Vec<ShaderLibraryDesc>,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub global_root_parameters: Vec<GlobalRootParameter>,
    pub groups: Vec<ShaderGroupDesc>,
    pub local_root_associations: Vec<LocalRootAssociation>,
}

impl RayTracingPipelineDesc {
    pub fn group(&self, name: &str) -> Option<&ShaderGroupDesc> {
        self.groups.iter().find(|group| group.name() == name)
    }
}

pub struct RawRayTracingPipeline {
    pub id: ResourceId,
    pub shader_identifiers: HashMap<String, ShaderIdentifier>,
}

pub struct RayTracingPipeline {
    pub desc: RayTracingPipelineDesc,
    id: ResourceId,
    shader_identifiers: HashMap<String, ShaderIdentifier>,
    device: Arc<dyn RenderDevice>,
}

impl RayTracingPipeline {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        desc: RayTracingPipelineDesc,
        raw: RawRayTracingPipeline,
    ) -> Self {
        Self {
            desc,
            id: raw.id,
            shader_identifiers: raw.shader_identifiers,
            device,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Identifier of the named shader group, if the pipeline exports it.
    pub fn shader_identifier(&self, group: &str) -> Option<&ShaderIdentifier> {
        self.shader_identifiers.get(group)
    }
}

impl std::fmt::Debug for RayTracingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTracingPipeline")
            .field("name", &self.desc.name)
            .field("id", &self.id)
            .field("groups", &self.shader_identifiers.len())
            .finish()
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDesc {
    pub name: String,
    pub code: Bytes,
    pub entry_point: String,
    /// Number of 32-bit root constants, including the descriptor table offset.
    pub root_constant_count: u32,
    pub uses_constant_buffer: bool,
}

pub struct ComputePipeline {
    pub desc: ComputePipelineDesc,
    id: ResourceId,
    device: Arc<dyn RenderDevice>,
}

impl ComputePipeline {
    pub(crate) fn new(device: Arc<dyn RenderDevice>, desc: ComputePipelineDesc, id: ResourceId) -> Self {
        Self { desc, id, device }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("name", &self.desc.name)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}
