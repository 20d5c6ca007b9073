use crate::error::RenderError;
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Empty,
    Bool,
    Int,
    Float,
    Float2,
    Float3,
    Float4,
    Mat4,
    String,
    Path,
    Strings,
}

impl PropertyKind {
    pub fn name(self) -> &'static str {
        match self {
            PropertyKind::Empty => "empty",
            PropertyKind::Bool => "bool",
            PropertyKind::Int => "int",
            PropertyKind::Float => "float",
            PropertyKind::Float2 => "float2",
            PropertyKind::Float3 => "float3",
            PropertyKind::Float4 => "float4",
            PropertyKind::Mat4 => "mat4",
            PropertyKind::String => "string",
            PropertyKind::Path => "path",
            PropertyKind::Strings => "strings",
        }
    }
}

/// A dynamically typed value used by every property-based API.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// Clears a property back to its default.
    Empty,
    Bool(bool),
    Int(i32),
    Float(f32),
    Float2(Vec2),
    Float3(Vec3),
    Float4(Vec4),
    Mat4(Mat4),
    String(String),
    /// A reference to another scene resource.
    Path(String),
    Strings(Vec<String>),
}

impl Default for PropertyValue {
    fn default() -> Self {
        PropertyValue::Empty
    }
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Empty => PropertyKind::Empty,
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Int(_) => PropertyKind::Int,
            PropertyValue::Float(_) => PropertyKind::Float,
            PropertyValue::Float2(_) => PropertyKind::Float2,
            PropertyValue::Float3(_) => PropertyKind::Float3,
            PropertyValue::Float4(_) => PropertyKind::Float4,
            PropertyValue::Mat4(_) => PropertyKind::Mat4,
            PropertyValue::String(_) => PropertyKind::String,
            PropertyValue::Path(_) => PropertyKind::Path,
            PropertyValue::Strings(_) => PropertyKind::Strings,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PropertyValue::Empty)
    }

    /// Strings and paths both name resources.
    pub fn as_path(&self) -> Option<&str> {
        match self {
            PropertyValue::Path(path) | PropertyValue::String(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            PropertyValue::Strings(strings) => Some(strings),
            _ => None,
        }
    }
}

macro_rules! impl_property_conversions {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for PropertyValue {
            fn from(value: $ty) -> Self {
                PropertyValue::$variant(value)
            }
        }

        impl FromPropertyValue for $ty {
            const KIND: PropertyKind = PropertyKind::$variant;

            fn from_property_value(value: &PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::$variant(value) => Some(value.clone()),
                    _ => None,
                }
            }
        }
    };
}

/// Typed extraction from a `PropertyValue`.
pub trait FromPropertyValue: Sized {
    const KIND: PropertyKind;

    fn from_property_value(value: &PropertyValue) -> Option<Self>;
}

impl_property_conversions!(bool, Bool);
impl_property_conversions!(i32, Int);
impl_property_conversions!(f32, Float);
impl_property_conversions!(Vec2, Float2);
impl_property_conversions!(Vec3, Float3);
impl_property_conversions!(Vec4, Float4);
impl_property_conversions!(Mat4, Mat4);
impl_property_conversions!(String, String);
impl_property_conversions!(Vec<String>, Strings);

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_owned())
    }
}

impl From<[f32; 3]> for PropertyValue {
    fn from(value: [f32; 3]) -> Self {
        PropertyValue::Float3(Vec3::from(value))
    }
}

/// A named set of values. Ordered so iteration is deterministic.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Convenience for building `Properties` inline.
pub fn properties<K: Into<String>, V: Into<PropertyValue>>(
    entries: impl IntoIterator<Item = (K, V)>,
) -> Properties {
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Extracts a typed value, reporting a type mismatch against `name`.
pub fn expect_value<T: FromPropertyValue>(
    name: &str,
    value: &PropertyValue,
) -> Result<T, RenderError> {
    T::from_property_value(value).ok_or_else(|| RenderError::PropertyType {
        name: name.to_owned(),
        expected: T::KIND.name(),
        found: value.kind().name(),
    })
}

/// A fixed set of named, typed values with defaults, as used for options and
/// the properties of environments and ground planes.
#[derive(Clone, Debug)]
pub struct PropertySet {
    defaults: &'static [(&'static str, fn() -> PropertyValue)],
    values: Properties,
}

impl PropertySet {
    pub fn new(defaults: &'static [(&'static str, fn() -> PropertyValue)]) -> Self {
        Self {
            values: defaults
                .iter()
                .map(|(name, value)| ((*name).to_owned(), value()))
                .collect(),
            defaults,
        }
    }

    fn default_value(&self, name: &str) -> Option<PropertyValue> {
        self.defaults
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, value)| value())
    }

    /// Sets a value; `Empty` restores the default.
    pub fn set(&mut self, name: &str, value: PropertyValue) -> Result<(), RenderError> {
        let default = self
            .default_value(name)
            .ok_or_else(|| RenderError::UnknownProperty {
                name: name.to_owned(),
            })?;

        if value.is_empty() {
            self.values.insert(name.to_owned(), default);
            return Ok(());
        }

        // Paths and strings are interchangeable, as are the empty defaults of
        // optional references.
        let compatible = value.kind() == default.kind()
            || (value.as_path().is_some() && default.as_path().is_some())
            || (default.is_empty() && value.as_path().is_some());

        if !compatible {
            return Err(RenderError::PropertyType {
                name: name.to_owned(),
                expected: default.kind().name(),
                found: value.kind().name(),
            });
        }

        self.values.insert(name.to_owned(), value);
        Ok(())
    }

    pub fn set_all(&mut self, properties: &Properties) -> Result<(), RenderError> {
        // Validate first so a bad entry leaves the set untouched.
        let mut staged = self.clone();
        for (name, value) in properties {
            staged.set(name, value.clone())?;
        }
        self.values = staged.values;
        Ok(())
    }

    pub fn get_value(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    /// Typed read; panics on an unknown name or a type mismatch, which are
    /// programming errors for a fixed property set.
    pub fn get<T: FromPropertyValue>(&self, name: &str) -> T {
        let value = self
            .values
            .get(name)
            .unwrap_or_else(|| panic!("unknown property {:?}", name));
        T::from_property_value(value)
            .unwrap_or_else(|| panic!("property {:?} is not a {}", name, T::KIND.name()))
    }

    pub fn path(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(PropertyValue::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DEFAULTS: &[(&str, fn() -> PropertyValue)] = &[
        ("enabled", || PropertyValue::Bool(true)),
        ("color", || PropertyValue::Float3(Vec3::ONE)),
        ("image", || PropertyValue::Empty),
    ];

    #[test]
    fn property_set_rejects_bad_input_without_mutating() {
        let mut set = PropertySet::new(DEFAULTS);

        let result = set.set_all(&properties([
            ("enabled", PropertyValue::Bool(false)),
            ("color", PropertyValue::Float(1.0)),
        ]));

        assert!(matches!(result, Err(RenderError::PropertyType { .. })));
        assert!(set.get::<bool>("enabled"));

        assert!(matches!(
            set.set("missing", PropertyValue::Int(1)),
            Err(RenderError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn empty_restores_default_and_paths_fill_optional_slots() {
        let mut set = PropertySet::new(DEFAULTS);
        set.set("color", Vec3::new(1.0, 0.0, 0.0).into()).unwrap();
        set.set("image", PropertyValue::Path("/images/sky".into()))
            .unwrap();
        assert_eq!(set.path("image"), Some("/images/sky"));

        set.set("color", PropertyValue::Empty).unwrap();
        assert_eq!(set.get::<Vec3>("color"), Vec3::ONE);
    }
}
