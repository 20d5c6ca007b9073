use crate::{
    error::RenderError,
    image::Image,
    properties::{Properties, PropertySet, PropertyValue},
};
use glam::{Mat4, Vec3, Vec4};

/// Heap slots taken by an environment: light then background texture.
pub const ENVIRONMENT_DESCRIPTOR_COUNT: usize = 2;

static DEFAULTS: &[(&str, fn() -> PropertyValue)] = &[
    ("light_top", || Vec3::ONE.into()),
    ("light_bottom", || Vec3::ZERO.into()),
    ("light_image", || PropertyValue::Empty),
    ("light_transform", || Mat4::IDENTITY.into()),
    ("background_top", || Vec3::ONE.into()),
    ("background_bottom", || Vec3::ZERO.into()),
    ("background_image", || PropertyValue::Empty),
    ("background_transform", || Mat4::IDENTITY.into()),
    ("background_use_screen", || false.into()),
];

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct EnvironmentData {
    pub light_top: [f32; 4],
    pub light_bottom: [f32; 4],
    pub light_transform_rows: [[f32; 4]; 4],
    pub light_transform_inv_rows: [[f32; 4]; 4],
    pub background_top: [f32; 4],
    pub background_bottom: [f32; 4],
    pub background_transform_rows: [[f32; 4]; 4],
    pub background_use_screen: u32,
    pub has_light_texture: u32,
    pub has_background_texture: u32,
    pub _pad0: u32,
    pub light_luminance_integral: f32,
    pub _pad1: [f32; 3],
}

pub(crate) fn matrix_rows(m: Mat4) -> [[f32; 4]; 4] {
    [
        m.row(0).to_array(),
        m.row(1).to_array(),
        m.row(2).to_array(),
        m.row(3).to_array(),
    ]
}

fn color(v: Vec3) -> [f32; 4] {
    Vec4::from((v, 1.0)).to_array()
}

/// Lighting and backdrop of a scene: gradients or lat-long images.
#[derive(Clone, Debug)]
pub struct Environment {
    properties: PropertySet,
    is_dirty: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self {
            properties: PropertySet::new(DEFAULTS),
            is_dirty: true,
        }
    }

    pub fn set_properties(&mut self, properties: &Properties) -> Result<(), RenderError> {
        self.properties.set_all(properties)?;
        self.is_dirty = true;
        Ok(())
    }

    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    pub fn light_image_path(&self) -> Option<&str> {
        self.properties.path("light_image")
    }

    pub fn background_image_path(&self) -> Option<&str> {
        self.properties.path("background_image")
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.is_dirty = false;
    }

    /// The uniform block, given the images the paths currently resolve to.
    pub fn data(&self, light_image: Option<&Image>, background_image: Option<&Image>) -> EnvironmentData {
        let p = &self.properties;
        let light_transform: Mat4 = p.get("light_transform");

        EnvironmentData {
            light_top: color(p.get("light_top")),
            light_bottom: color(p.get("light_bottom")),
            light_transform_rows: matrix_rows(light_transform),
            light_transform_inv_rows: matrix_rows(light_transform.inverse()),
            background_top: color(p.get("background_top")),
            background_bottom: color(p.get("background_bottom")),
            background_transform_rows: matrix_rows(p.get("background_transform")),
            background_use_screen: p.get::<bool>("background_use_screen") as u32,
            has_light_texture: light_image.is_some() as u32,
            has_background_texture: background_image.is_some() as u32,
            _pad0: 0,
            light_luminance_integral: light_image.map_or(0.0, |image| image.luminance_integral),
            _pad1: [0.0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::properties;

    #[test]
    fn data_matches_shader_layout() {
        assert_eq!(std::mem::size_of::<EnvironmentData>(), 16 * 18);
    }

    #[test]
    fn properties_feed_the_uniform_block() {
        let mut environment = Environment::new();
        let rotation = Mat4::from_rotation_y(1.0);
        environment
            .set_properties(&properties([
                ("light_top", PropertyValue::from(Vec3::new(0.5, 0.5, 1.0))),
                ("light_transform", rotation.into()),
                ("light_image", PropertyValue::Path("/images/sky".to_owned())),
            ]))
            .unwrap();

        assert_eq!(environment.light_image_path(), Some("/images/sky"));
        assert_eq!(environment.background_image_path(), None);

        let data = environment.data(None, None);
        assert_eq!(data.light_top, [0.5, 0.5, 1.0, 1.0]);
        assert_eq!(data.has_light_texture, 0);
        let inverse = Mat4::from_cols_array_2d(&data.light_transform_inv_rows).transpose();
        assert!(inverse.abs_diff_eq(rotation.inverse(), 1e-6));

        assert!(environment
            .set_properties(&properties([("light_top", 1.0f32)]))
            .is_err());
        assert!(environment
            .set_properties(&properties([("no_such_property", 1.0f32)]))
            .is_err());
    }
}
