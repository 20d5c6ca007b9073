//! Materials generated from MaterialX documents.
//!
//! Code generation itself lives outside the renderer; callers plug a
//! generator in through `MaterialXCodeGenerator`.

use crate::{
    error::RenderError,
    material::{MaterialDefinition, TextureBinding},
    properties::PropertyValue,
    shader_library::MaterialShaderDefinition,
    uniform_buffer::{UniformBuffer, UniformBufferDefinition, UniformField},
};
use glam::Vec3;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{collections::HashMap, path::Path, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MaterialType {
    BuiltIn,
    MaterialX,
    MaterialXPath,
}

impl MaterialType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "built-in" | "built_in" => Some(MaterialType::BuiltIn),
            "materialx" => Some(MaterialType::MaterialX),
            "materialx_path" => Some(MaterialType::MaterialXPath),
            _ => None,
        }
    }
}

/// What a code generator produces for one document.
///
/// `source` must define
/// `void evaluate_material(MaterialBuffer constants, ShadingData shading, inout MaterialResult result)`
/// and may use the generated `Material_<variable>` accessors and
/// `TEXTURE_<name>` indices.
#[derive(Clone, Debug)]
pub struct GeneratedMaterial {
    pub source: String,
    pub fields: Vec<UniformField>,
    pub defaults: Vec<PropertyValue>,
    pub texture_names: Vec<String>,
    pub is_always_opaque: bool,
}

pub trait MaterialXCodeGenerator: Send + Sync {
    fn generate(&self, document: &str) -> anyhow::Result<GeneratedMaterial>;
}

fn update(uniforms: &mut UniformBuffer, textures: &[TextureBinding]) -> bool {
    for texture in textures {
        let flag = format!("has_{}", texture.name);
        if uniforms.contains(&flag) {
            let _ = uniforms.set(&flag, &PropertyValue::Bool(texture.image.is_some()));
        }
    }

    let opacity = if uniforms.contains("opacity") {
        uniforms.get::<Vec3>("opacity")
    } else {
        Vec3::ONE
    };

    opacity == Vec3::ONE
        && uniforms.get::<f32>("transmission") == 0.0
        && !textures
            .iter()
            .any(|texture| texture.name == "opacity_image" && texture.image.is_some())
}

/// Turns documents into material definitions, caching by document text.
#[derive(Default)]
pub struct MaterialXLoader {
    generator: Option<Arc<dyn MaterialXCodeGenerator>>,
    cache: HashMap<String, Arc<MaterialDefinition>>,
}

impl MaterialXLoader {
    pub fn set_generator(&mut self, generator: Option<Arc<dyn MaterialXCodeGenerator>>) {
        self.generator = generator;
        self.cache.clear();
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    pub fn load(&mut self, document: &str) -> Result<Arc<MaterialDefinition>, RenderError> {
        if let Some(definition) = self.cache.get(document) {
            return Ok(definition.clone());
        }

        let generator = self.generator.as_ref().ok_or_else(|| RenderError::Unsupported {
            info: "no MaterialX code generator is installed".to_owned(),
        })?;

        let generated = generator
            .generate(document)
            .map_err(|err| RenderError::invalid_argument(format!("MaterialX: {:#}", err)))?;

        if generated.fields.len() != generated.defaults.len() {
            return Err(RenderError::invalid_argument(format!(
                "MaterialX: {} fields but {} defaults",
                generated.fields.len(),
                generated.defaults.len()
            )));
        }

        let definition = Arc::new(MaterialDefinition {
            shader: Arc::new(MaterialShaderDefinition::new(
                generated.source,
                UniformBufferDefinition::new(&generated.fields),
                generated.texture_names,
                generated.is_always_opaque,
            )),
            defaults: Arc::new(generated.defaults),
            update: Some(update),
        });

        debug!("Generated MaterialX shader {:?}", definition.shader.id);
        self.cache.insert(document.to_owned(), definition.clone());
        Ok(definition)
    }

    pub fn load_path(&mut self, path: &Path) -> Result<Arc<MaterialDefinition>, RenderError> {
        let document = std::fs::read_to_string(path).map_err(|err| {
            RenderError::invalid_argument(format!("cannot read {:?}: {}", path, err))
        })?;
        self.load(&document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniform_buffer::UniformType;

    struct FixedGenerator;

    impl MaterialXCodeGenerator for FixedGenerator {
        fn generate(&self, document: &str) -> anyhow::Result<GeneratedMaterial> {
            anyhow::ensure!(document.contains("<materialx"), "not a MaterialX document");
            Ok(GeneratedMaterial {
                source: format!("// {}\n", document.len()),
                fields: vec![UniformField::new("opacity", "opacity", UniformType::Float3)],
                defaults: vec![PropertyValue::Float3(Vec3::ONE)],
                texture_names: vec![],
                is_always_opaque: false,
            })
        }
    }

    #[test]
    fn documents_are_cached_and_errors_reported() {
        let mut loader = MaterialXLoader::default();
        assert!(matches!(
            loader.load("<materialx/>"),
            Err(RenderError::Unsupported { .. })
        ));

        loader.set_generator(Some(Arc::new(FixedGenerator)));
        let a = loader.load("<materialx/>").unwrap();
        let b = loader.load("<materialx/>").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert!(loader.load("<gltf/>").is_err());
        assert!(loader.load_path(Path::new("/no/such/file.mtlx")).is_err());
    }
}
