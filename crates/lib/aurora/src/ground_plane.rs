use crate::{
    error::RenderError,
    properties::{Properties, PropertySet, PropertyValue},
    tangent_space::orthonormal_basis,
};
use glam::{Vec3, Vec4};

static DEFAULTS: &[(&str, fn() -> PropertyValue)] = &[
    ("enabled", || false.into()),
    ("position", || Vec3::ZERO.into()),
    ("normal", || Vec3::Y.into()),
    ("shadow_opacity", || 1.0f32.into()),
    ("shadow_color", || Vec3::ZERO.into()),
    ("reflection_opacity", || 0.5f32.into()),
    ("reflection_color", || Vec3::ONE.into()),
    ("reflection_roughness", || 0.0f32.into()),
];

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GroundPlaneData {
    pub enabled: u32,
    pub _pad0: [u32; 3],
    pub position: [f32; 4],
    pub normal: [f32; 4],
    pub tangent: [f32; 4],
    pub bitangent: [f32; 4],
    pub shadow_color_and_opacity: [f32; 4],
    pub reflection_color_and_opacity: [f32; 4],
    pub reflection_roughness: [f32; 4],
}

/// An infinite plane that catches shadows and reflections under the scene.
#[derive(Clone, Debug)]
pub struct GroundPlane {
    properties: PropertySet,
}

impl Default for GroundPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl GroundPlane {
    pub fn new() -> Self {
        Self {
            properties: PropertySet::new(DEFAULTS),
        }
    }

    pub fn set_properties(&mut self, properties: &Properties) -> Result<(), RenderError> {
        self.properties.set_all(properties)
    }

    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    pub fn is_enabled(&self) -> bool {
        self.properties.get("enabled")
    }

    pub fn data(&self) -> GroundPlaneData {
        let p = &self.properties;

        let normal = p.get::<Vec3>("normal").try_normalize().unwrap_or(Vec3::Y);
        let (tangent, bitangent) = orthonormal_basis(normal);

        GroundPlaneData {
            enabled: self.is_enabled() as u32,
            _pad0: [0; 3],
            position: Vec4::from((p.get::<Vec3>("position"), 1.0)).to_array(),
            normal: Vec4::from((normal, 0.0)).to_array(),
            tangent: Vec4::from((tangent, 0.0)).to_array(),
            bitangent: Vec4::from((bitangent, 0.0)).to_array(),
            shadow_color_and_opacity: Vec4::from((
                p.get::<Vec3>("shadow_color"),
                p.get::<f32>("shadow_opacity"),
            ))
            .to_array(),
            reflection_color_and_opacity: Vec4::from((
                p.get::<Vec3>("reflection_color"),
                p.get::<f32>("reflection_opacity"),
            ))
            .to_array(),
            reflection_roughness: [p.get::<f32>("reflection_roughness"), 0.0, 0.0, 0.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::properties;

    #[test]
    fn basis_is_stable_and_orthonormal() {
        let mut plane = GroundPlane::new();
        plane
            .set_properties(&properties([
                ("enabled", PropertyValue::Bool(true)),
                ("normal", Vec3::new(0.0, 2.0, 0.0).into()),
            ]))
            .unwrap();

        let a = plane.data();
        let b = plane.data();
        assert_eq!(a.tangent, b.tangent);
        assert_eq!(a.enabled, 1);

        let n = Vec4::from(a.normal).truncate();
        let t = Vec4::from(a.tangent).truncate();
        let bt = Vec4::from(a.bitangent).truncate();
        assert!((n - Vec3::Y).length() < 1e-6);
        assert!(n.dot(t).abs() < 1e-6);
        assert!(n.dot(bt).abs() < 1e-6);
        assert!(t.dot(bt).abs() < 1e-6);
    }

    #[test]
    fn layout_matches_shader() {
        assert_eq!(std::mem::size_of::<GroundPlaneData>(), 128);
    }
}
