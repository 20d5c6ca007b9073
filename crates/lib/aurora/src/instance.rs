use crate::{
    error::RenderError,
    properties::{expect_value, Properties, PropertyValue},
};
use glam::Mat4;

/// What `Scene::add_instances` needs for one new instance.
#[derive(Clone, Debug, Default)]
pub struct InstanceDescriptor {
    pub path: String,
    pub properties: Properties,
}

impl InstanceDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            properties: Properties::new(),
        }
    }

    pub fn property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.to_owned(), value.into());
        self
    }
}

/// A placement of a geometry with a material and optional material layers.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub geometry: String,
    /// `None` selects the scene's default material.
    pub material: Option<String>,
    pub transform: Mat4,
    pub material_layers: Vec<String>,
    /// Parallel to `material_layers` when not empty; an empty entry keeps the
    /// instance's own geometry for that layer.
    pub geometry_layers: Vec<String>,
    pub object_id: i32,
    pub is_visible: bool,
}

impl Instance {
    pub fn new(geometry: &str) -> Self {
        Self {
            geometry: geometry.to_owned(),
            material: None,
            transform: Mat4::IDENTITY,
            material_layers: Vec::new(),
            geometry_layers: Vec::new(),
            object_id: 0,
            is_visible: true,
        }
    }

    /// Applies every property or none of them.
    pub fn set_properties(&mut self, properties: &Properties) -> Result<(), RenderError> {
        let mut staged = self.clone();

        for (name, value) in properties {
            match name.as_str() {
                "material" => {
                    staged.material = match value {
                        PropertyValue::Empty => None,
                        value => Some(
                            value
                                .as_path()
                                .filter(|path| !path.is_empty())
                                .ok_or_else(|| RenderError::PropertyType {
                                    name: name.clone(),
                                    expected: "path",
                                    found: value.kind().name(),
                                })?
                                .to_owned(),
                        ),
                    }
                }
                "transform" => {
                    staged.transform = match value {
                        PropertyValue::Empty => Mat4::IDENTITY,
                        value => expect_value(name, value)?,
                    }
                }
                "material_layers" => {
                    staged.material_layers = match value {
                        PropertyValue::Empty => Vec::new(),
                        value => expect_value(name, value)?,
                    }
                }
                "geometry_layers" => {
                    staged.geometry_layers = match value {
                        PropertyValue::Empty => Vec::new(),
                        value => expect_value(name, value)?,
                    }
                }
                "object_id" => staged.object_id = expect_value(name, value)?,
                "is_visible" => staged.is_visible = expect_value(name, value)?,
                _ => {
                    return Err(RenderError::UnknownProperty {
                        name: name.clone(),
                    })
                }
            }
        }

        if !staged.geometry_layers.is_empty()
            && staged.geometry_layers.len() != staged.material_layers.len()
        {
            return Err(RenderError::invalid_argument(format!(
                "{} geometry layers for {} material layers",
                staged.geometry_layers.len(),
                staged.material_layers.len()
            )));
        }

        *self = staged;
        Ok(())
    }

    /// Geometry used to shade layer `index`.
    pub fn layer_geometry(&self, index: usize) -> &str {
        match self.geometry_layers.get(index) {
            Some(path) if !path.is_empty() => path,
            _ => &self.geometry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::properties;

    #[test]
    fn mismatched_layers_leave_the_instance_untouched() {
        let mut instance = Instance::new("/geometry/a");
        let before = instance.clone();

        let result = instance.set_properties(&properties([
            (
                "material_layers",
                PropertyValue::Strings(vec!["/materials/x".into(), "/materials/y".into()]),
            ),
            (
                "geometry_layers",
                PropertyValue::Strings(vec!["/geometry/b".into()]),
            ),
            ("object_id", PropertyValue::Int(7)),
        ]));
        assert!(result.is_err());
        assert_eq!(instance, before);
    }

    #[test]
    fn layer_geometry_falls_back_to_the_instance() {
        let mut instance = Instance::new("/geometry/a");
        instance
            .set_properties(&properties([
                (
                    "material_layers",
                    PropertyValue::Strings(vec!["/m/x".into(), "/m/y".into()]),
                ),
                (
                    "geometry_layers",
                    PropertyValue::Strings(vec!["".into(), "/geometry/b".into()]),
                ),
                ("material", PropertyValue::Path("/m/base".into())),
                ("is_visible", PropertyValue::Bool(false)),
            ]))
            .unwrap();

        assert_eq!(instance.layer_geometry(0), "/geometry/a");
        assert_eq!(instance.layer_geometry(1), "/geometry/b");
        assert_eq!(instance.material.as_deref(), Some("/m/base"));
        assert!(!instance.is_visible);
    }
}
