use crate::{
    error::RenderError,
    properties::{PropertySet, PropertyValue, Properties},
    shaders::ShaderOptions,
};
use glam::Vec3;

pub const MAX_TRACE_DEPTH: i32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ImportanceSamplingMode {
    Mis = 0,
    Bsdf = 1,
    Environment = 2,
}

impl ImportanceSamplingMode {
    pub fn from_int(value: i32) -> Option<Self> {
        match value {
            0 => Some(ImportanceSamplingMode::Mis),
            1 => Some(ImportanceSamplingMode::Bsdf),
            2 => Some(ImportanceSamplingMode::Environment),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Units {
    Millimeter,
    Centimeter,
    Meter,
    Kilometer,
    Inch,
    Foot,
}

impl Units {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "millimeter" => Some(Units::Millimeter),
            "centimeter" => Some(Units::Centimeter),
            "meter" => Some(Units::Meter),
            "kilometer" => Some(Units::Kilometer),
            "inch" => Some(Units::Inch),
            "foot" => Some(Units::Foot),
            _ => None,
        }
    }

    /// Scene units per meter.
    pub fn per_meter(self) -> f32 {
        match self {
            Units::Millimeter => 1000.0,
            Units::Centimeter => 100.0,
            Units::Meter => 1.0,
            Units::Kilometer => 0.001,
            Units::Inch => 39.3701,
            Units::Foot => 3.28084,
        }
    }
}

static DEFAULTS: &[(&str, fn() -> PropertyValue)] = &[
    ("units", || PropertyValue::String("centimeter".to_owned())),
    ("is_gamma_correction_enabled", || PropertyValue::Bool(true)),
    ("brightness", || PropertyValue::Float3(Vec3::ONE)),
    ("is_tone_mapping_enabled", || PropertyValue::Bool(false)),
    ("max_luminance", || PropertyValue::Float(1000.0)),
    ("is_diffuse_only_enabled", || PropertyValue::Bool(false)),
    ("trace_depth", || PropertyValue::Int(5)),
    ("is_denoising_enabled", || PropertyValue::Bool(false)),
    ("alpha_enabled", || PropertyValue::Bool(false)),
    ("is_reference_bsdf_enabled", || PropertyValue::Bool(false)),
    ("importance_sampling_mode", || PropertyValue::Int(0)),
    ("is_flip_image_y_enabled", || PropertyValue::Bool(true)),
    ("is_reset_history_enabled", || PropertyValue::Bool(false)),
];

/// Named renderer options, applied on the next `render`.
#[derive(Clone, Debug)]
pub struct Options {
    values: PropertySet,
    is_dirty: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            values: PropertySet::new(DEFAULTS),
            is_dirty: true,
        }
    }
}

impl Options {
    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<(), RenderError> {
        let value = value.into();

        match (name, &value) {
            ("units", PropertyValue::String(units)) if Units::from_name(units).is_none() => {
                return Err(RenderError::invalid_argument(format!(
                    "unknown units {:?}",
                    units
                )));
            }
            ("importance_sampling_mode", PropertyValue::Int(mode))
                if ImportanceSamplingMode::from_int(*mode).is_none() =>
            {
                return Err(RenderError::invalid_argument(format!(
                    "unknown importance sampling mode {}",
                    mode
                )));
            }
            _ => {}
        }

        self.values.set(name, value)?;
        self.is_dirty = true;
        Ok(())
    }

    pub fn set_all(&mut self, properties: &Properties) -> Result<(), RenderError> {
        let mut staged = self.clone();
        for (name, value) in properties {
            staged.set(name, value.clone())?;
        }
        *self = staged;
        Ok(())
    }

    pub fn get_value(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get_value(name)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn clear_dirty(&mut self) {
        self.is_dirty = false;
    }

    pub fn units(&self) -> Units {
        Units::from_name(&self.values.get::<String>("units")).unwrap_or(Units::Centimeter)
    }

    pub fn is_gamma_correction_enabled(&self) -> bool {
        self.values.get("is_gamma_correction_enabled")
    }

    pub fn brightness(&self) -> Vec3 {
        self.values.get("brightness")
    }

    pub fn is_tone_mapping_enabled(&self) -> bool {
        self.values.get("is_tone_mapping_enabled")
    }

    pub fn max_luminance(&self) -> f32 {
        self.values.get("max_luminance")
    }

    pub fn is_denoising_enabled(&self) -> bool {
        self.values.get("is_denoising_enabled")
    }

    pub fn is_alpha_enabled(&self) -> bool {
        self.values.get("alpha_enabled")
    }

    pub fn is_flip_image_y_enabled(&self) -> bool {
        self.values.get("is_flip_image_y_enabled")
    }

    pub fn is_reset_history_enabled(&self) -> bool {
        self.values.get("is_reset_history_enabled")
    }

    /// Clears the one-shot history reset without marking options dirty.
    pub fn clear_reset_history(&mut self) {
        let _ = self
            .values
            .set("is_reset_history_enabled", PropertyValue::Bool(false));
    }

    pub fn trace_depth(&self) -> u32 {
        self.values.get::<i32>("trace_depth").clamp(1, MAX_TRACE_DEPTH) as u32
    }

    pub fn importance_sampling_mode(&self) -> ImportanceSamplingMode {
        ImportanceSamplingMode::from_int(self.values.get("importance_sampling_mode"))
            .unwrap_or(ImportanceSamplingMode::Mis)
    }

    pub fn shader_options(&self) -> ShaderOptions {
        ShaderOptions {
            trace_depth: self.trace_depth(),
            is_diffuse_only: self.values.get("is_diffuse_only_enabled"),
            is_reference_bsdf: self.values.get("is_reference_bsdf_enabled"),
            importance_sampling_mode: self.importance_sampling_mode(),
            is_alpha_enabled: self.is_alpha_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_depth_is_clamped() {
        let mut options = Options::default();
        options.set("trace_depth", 42).unwrap();
        assert_eq!(options.trace_depth(), MAX_TRACE_DEPTH as u32);
        options.set("trace_depth", 0).unwrap();
        assert_eq!(options.trace_depth(), 1);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let mut options = Options::default();
        assert!(options.set("units", "parsec").is_err());
        assert!(options.set("importance_sampling_mode", 7).is_err());
        assert!(matches!(
            options.set("trace_depth", 1.5f32),
            Err(RenderError::PropertyType { .. })
        ));
        assert!(matches!(
            options.set("no_such_option", true),
            Err(RenderError::UnknownProperty { .. })
        ));
        assert_eq!(options.units(), Units::Centimeter);
    }

    #[test]
    fn shader_options_follow_values() {
        let mut options = Options::default();
        options.set("is_diffuse_only_enabled", true).unwrap();
        options.set("importance_sampling_mode", 1).unwrap();

        let shader = options.shader_options();
        assert!(shader.is_diffuse_only);
        assert_eq!(shader.importance_sampling_mode, ImportanceSamplingMode::Bsdf);
    }
}
