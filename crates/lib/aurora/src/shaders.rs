//! Embedded HLSL sources and the assembly of per-material libraries.

use crate::{options::ImportanceSamplingMode, shader_library::MaterialShaderDefinition};
use std::fmt::Write as _;

pub const COMMON: &str = include_str!("../shaders/common.hlsl");
pub const MATERIAL_HEADER: &str = include_str!("../shaders/material_header.hlsl");
pub const MATERIAL_TEMPLATE: &str = include_str!("../shaders/material_template.hlsl");
pub const RAY_GEN: &str = include_str!("../shaders/ray_gen.hlsl");
pub const STANDARD_SURFACE: &str = include_str!("../shaders/standard_surface.hlsl");

pub const COMPUTE_COMMON: &str = include_str!("../shaders/compute_common.hlsl");
pub const ACCUMULATE: &str = include_str!("../shaders/accumulate.hlsl");
pub const POST_PROCESS: &str = include_str!("../shaders/post_process.hlsl");
pub const DENOISE: &str = include_str!("../shaders/denoise.hlsl");

/// Prefix of the generated material constant accessors.
pub const MATERIAL_ACCESSOR_PREFIX: &str = "Material";

/// Renderer options baked into every ray tracing library. Changing any of
/// them recompiles all material shaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderOptions {
    pub trace_depth: u32,
    pub is_diffuse_only: bool,
    pub is_reference_bsdf: bool,
    pub importance_sampling_mode: ImportanceSamplingMode,
    pub is_alpha_enabled: bool,
}

impl Default for ShaderOptions {
    fn default() -> Self {
        Self {
            trace_depth: 5,
            is_diffuse_only: false,
            is_reference_bsdf: false,
            importance_sampling_mode: ImportanceSamplingMode::Mis,
            is_alpha_enabled: false,
        }
    }
}

impl ShaderOptions {
    pub fn defines(&self) -> String {
        let mut code = String::new();
        let _ = writeln!(code, "#define TRACE_DEPTH {}", self.trace_depth);
        let _ = writeln!(code, "#define DIFFUSE_ONLY {}", self.is_diffuse_only as u32);
        let _ = writeln!(
            code,
            "#define USE_REFERENCE_BSDF {}",
            self.is_reference_bsdf as u32
        );
        let _ = writeln!(
            code,
            "#define IMPORTANCE_SAMPLING_MODE {}",
            self.importance_sampling_mode as u32
        );
        let _ = writeln!(code, "#define ALPHA_ENABLED {}", self.is_alpha_enabled as u32);
        code
    }
}

/// Full source of the ray tracing library of one material shader. The
/// default shader additionally carries the ray generation and built-in miss
/// entry points.
pub fn material_library_source(
    definition: &MaterialShaderDefinition,
    options: &ShaderOptions,
    with_ray_gen: bool,
) -> String {
    let mut source = String::new();
    source.push_str(&options.defines());
    source.push_str(COMMON);
    source.push('\n');
    source.push_str(MATERIAL_HEADER);
    source.push('\n');

    for (index, name) in definition.texture_names.iter().enumerate() {
        let _ = writeln!(source, "#define TEXTURE_{} {}", name, index);
    }

    source.push_str(
        &definition
            .uniforms
            .generate_accessors(MATERIAL_ACCESSOR_PREFIX, "MaterialBuffer"),
    );
    source.push_str(&definition.source);
    source.push('\n');
    source.push_str(MATERIAL_TEMPLATE);

    if with_ray_gen {
        source.push('\n');
        source.push_str(RAY_GEN);
    }

    source
}

pub fn compute_source(body: &str) -> String {
    format!("{}\n{}", COMPUTE_COMMON, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standard_surface;

    #[test]
    fn default_library_carries_ray_gen() {
        let definition = standard_surface::shader_definition();
        let options = ShaderOptions {
            trace_depth: 3,
            is_diffuse_only: true,
            ..Default::default()
        };

        let source = material_library_source(&definition, &options, true);
        assert!(source.starts_with("#define TRACE_DEPTH 3\n#define DIFFUSE_ONLY 1\n"));
        assert!(source.contains("#define TEXTURE_base_color_image 0"));
        assert!(source.contains("float3 Material_baseColor(MaterialBuffer buf, int offset)"));
        assert!(source.contains("void RayGenShader()"));

        let without = material_library_source(&definition, &options, false);
        assert!(!without.contains("void RayGenShader()"));
        assert!(without.contains("void RadianceHitShader("));
    }
}
