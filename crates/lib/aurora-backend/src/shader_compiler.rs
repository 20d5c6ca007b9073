use crate::BackendError;
use bytes::Bytes;

pub struct CompiledShader {
    pub name: String,
    pub spirv: Bytes,
}

/// Turns HLSL source into device code.
pub trait ShaderCompiler: Send + Sync {
    /// Compile a ray tracing library exporting every `[shader("...")]` entry point.
    fn compile_library(&self, name: &str, source: &str) -> Result<CompiledShader, BackendError>;

    fn compile_compute(
        &self,
        name: &str,
        source: &str,
        entry_point: &str,
    ) -> Result<CompiledShader, BackendError>;
}

/// Passes source text through untouched. Paired with the headless device,
/// which never executes shaders.
#[derive(Default)]
pub struct PassthroughShaderCompiler;

impl ShaderCompiler for PassthroughShaderCompiler {
    fn compile_library(&self, name: &str, source: &str) -> Result<CompiledShader, BackendError> {
        Ok(CompiledShader {
            name: name.to_owned(),
            spirv: Bytes::copy_from_slice(source.as_bytes()),
        })
    }

    fn compile_compute(
        &self,
        name: &str,
        source: &str,
        _entry_point: &str,
    ) -> Result<CompiledShader, BackendError> {
        self.compile_library(name, source)
    }
}

#[cfg(feature = "dxc")]
pub struct DxcShaderCompiler;

#[cfg(feature = "dxc")]
impl DxcShaderCompiler {
    fn compile(
        name: &str,
        source: &str,
        entry_point: &str,
        target_profile: &str,
    ) -> Result<CompiledShader, BackendError> {
        let t0 = std::time::Instant::now();
        let spirv = hassle_rs::compile_hlsl(
            name,
            source,
            entry_point,
            target_profile,
            &[
                "-spirv",
                "-fspv-target-env=vulkan1.2",
                "-fspv-extension=SPV_KHR_ray_tracing",
                "-fspv-extension=SPV_EXT_descriptor_indexing",
                "-WX",      // warnings as errors
                "-Ges",     // strict mode
                "-HV 2021", // HLSL version 2021
            ],
            &[],
        )
        .map_err(|err| BackendError::ShaderCompilation {
            name: name.to_owned(),
            message: err.to_string(),
        })?;

        log::trace!("dxc took {:?} for {}", t0.elapsed(), name);

        Ok(CompiledShader {
            name: name.to_owned(),
            spirv: spirv.into(),
        })
    }
}

#[cfg(feature = "dxc")]
impl ShaderCompiler for DxcShaderCompiler {
    fn compile_library(&self, name: &str, source: &str) -> Result<CompiledShader, BackendError> {
        Self::compile(name, source, "", "lib_6_4")
    }

    fn compile_compute(
        &self,
        name: &str,
        source: &str,
        entry_point: &str,
    ) -> Result<CompiledShader, BackendError> {
        Self::compile(name, source, entry_point, "cs_6_4")
    }
}
