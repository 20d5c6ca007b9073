//! The built-in Standard Surface material.

use crate::{
    material::{MaterialDefinition, TextureBinding},
    properties::PropertyValue,
    shader_library::{MaterialShaderDefinition, DEFAULT_SHADER_ID},
    shaders::STANDARD_SURFACE,
    uniform_buffer::{UniformBuffer, UniformBufferDefinition, UniformField, UniformType},
};
use glam::Vec3;
use std::sync::Arc;

pub const TEXTURE_NAMES: [&str; 5] = [
    "base_color_image",
    "specular_roughness_image",
    "opacity_image",
    "normal_image",
    "emission_color_image",
];

fn float(v: f32) -> PropertyValue {
    PropertyValue::Float(v)
}

fn color(r: f32, g: f32, b: f32) -> PropertyValue {
    PropertyValue::Float3(Vec3::new(r, g, b))
}

/// (name, shader variable, type, default)
fn fields() -> Vec<(&'static str, &'static str, UniformType, PropertyValue)> {
    use UniformType::*;

    vec![
        ("base", "base", Float, float(0.8)),
        ("base_color", "baseColor", Float3, color(1.0, 1.0, 1.0)),
        ("diffuse_roughness", "diffuseRoughness", Float, float(0.0)),
        ("metalness", "metalness", Float, float(0.0)),
        ("specular", "specular", Float, float(1.0)),
        ("specular_color", "specularColor", Float3, color(1.0, 1.0, 1.0)),
        ("specular_roughness", "specularRoughness", Float, float(0.2)),
        ("specular_IOR", "specularIOR", Float, float(1.5)),
        ("specular_anisotropy", "specularAnisotropy", Float, float(0.0)),
        ("specular_rotation", "specularRotation", Float, float(0.0)),
        ("transmission", "transmission", Float, float(0.0)),
        ("transmission_color", "transmissionColor", Float3, color(1.0, 1.0, 1.0)),
        ("subsurface", "subsurface", Float, float(0.0)),
        ("subsurface_color", "subsurfaceColor", Float3, color(1.0, 1.0, 1.0)),
        ("subsurface_radius", "subsurfaceRadius", Float3, color(1.0, 1.0, 1.0)),
        ("subsurface_scale", "subsurfaceScale", Float, float(1.0)),
        ("coat", "coat", Float, float(0.0)),
        ("coat_color", "coatColor", Float3, color(1.0, 1.0, 1.0)),
        ("coat_roughness", "coatRoughness", Float, float(0.1)),
        ("sheen", "sheen", Float, float(0.0)),
        ("sheen_color", "sheenColor", Float3, color(1.0, 1.0, 1.0)),
        ("sheen_roughness", "sheenRoughness", Float, float(0.3)),
        ("emission", "emission", Float, float(0.0)),
        ("emission_color", "emissionColor", Float3, color(1.0, 1.0, 1.0)),
        ("opacity", "opacity", Float3, color(1.0, 1.0, 1.0)),
        ("thin_walled", "thinWalled", Bool, PropertyValue::Bool(false)),
        ("has_base_color_image", "hasBaseColorImage", Bool, PropertyValue::Bool(false)),
        (
            "has_specular_roughness_image",
            "hasSpecularRoughnessImage",
            Bool,
            PropertyValue::Bool(false),
        ),
        ("has_opacity_image", "hasOpacityImage", Bool, PropertyValue::Bool(false)),
        ("has_normal_image", "hasNormalImage", Bool, PropertyValue::Bool(false)),
        (
            "has_emission_color_image",
            "hasEmissionColorImage",
            Bool,
            PropertyValue::Bool(false),
        ),
    ]
}

pub fn shader_definition() -> MaterialShaderDefinition {
    let uniform_fields: Vec<UniformField> = fields()
        .iter()
        .map(|(name, variable, ty, _)| UniformField::new(name, variable, *ty))
        .collect();

    MaterialShaderDefinition::with_id(
        DEFAULT_SHADER_ID,
        STANDARD_SURFACE,
        UniformBufferDefinition::new(&uniform_fields),
        TEXTURE_NAMES.iter().map(|name| (*name).to_owned()).collect(),
        false,
    )
}

/// Keeps the texture flags in sync with the bound images and derives opacity.
fn update(uniforms: &mut UniformBuffer, textures: &[TextureBinding]) -> bool {
    for texture in textures {
        let flag = format!("has_{}", texture.name);
        if uniforms.contains(&flag) {
            let _ = uniforms.set(&flag, &PropertyValue::Bool(texture.image.is_some()));
        }
    }

    let has_opacity_image = textures
        .iter()
        .any(|texture| texture.name == "opacity_image" && texture.image.is_some());

    uniforms.get::<Vec3>("opacity") == Vec3::ONE
        && uniforms.get::<f32>("transmission") == 0.0
        && !has_opacity_image
}

pub fn material_definition() -> MaterialDefinition {
    MaterialDefinition {
        shader: Arc::new(shader_definition()),
        defaults: Arc::new(fields().into_iter().map(|(_, _, _, value)| value).collect()),
        update: Some(update),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opacity_follows_values_and_images() {
        let definition = material_definition();
        let mut uniforms = UniformBuffer::new(
            definition.shader.uniforms.clone(),
            definition.defaults.clone(),
        );
        let mut textures: Vec<TextureBinding> = TEXTURE_NAMES
            .iter()
            .map(|name| TextureBinding::new(name))
            .collect();

        assert!(update(&mut uniforms, &textures));

        uniforms.set("transmission", &PropertyValue::Float(0.5)).unwrap();
        assert!(!update(&mut uniforms, &textures));
        uniforms.reset("transmission").unwrap();

        textures[2].image = Some(crate::material::tests::dummy_image());
        assert!(!update(&mut uniforms, &textures));
        assert!(uniforms.get::<bool>("has_opacity_image"));
        assert!(!uniforms.get::<bool>("has_base_color_image"));
    }

    #[test]
    fn defaults_parallel_fields() {
        let definition = material_definition();
        assert_eq!(
            definition.shader.uniforms.declared_fields().count(),
            definition.defaults.len()
        );
        assert_eq!(definition.shader.uniforms.size() % 16, 0);
    }
}
