use crate::{
    error::RenderError,
    properties::{expect_value, Properties},
};
use glam::Vec3;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Capacity of the light array in the per-frame constants.
pub const MAX_DISTANT_LIGHTS: usize = 4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DistantLightData {
    /// Unit vector towards the light.
    pub direction: [f32; 3],
    pub cos_radius: f32,
    pub color_and_intensity: [f32; 4],
}

#[derive(Clone, Debug)]
pub struct DistantLight {
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    /// Radians.
    pub angular_diameter: f32,
}

impl Default for DistantLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-1.0, -0.5, -1.0),
            color: Vec3::ONE,
            intensity: 1.0,
            angular_diameter: 0.1,
        }
    }
}

impl DistantLight {
    pub fn set_properties(&mut self, properties: &Properties) -> Result<(), RenderError> {
        let mut staged = self.clone();
        for (name, value) in properties {
            match name.as_str() {
                "direction" => staged.direction = expect_value(name, value)?,
                "color" => staged.color = expect_value(name, value)?,
                "intensity" => staged.intensity = expect_value(name, value)?,
                "angular_diameter" => staged.angular_diameter = expect_value(name, value)?,
                _ => {
                    return Err(RenderError::UnknownProperty {
                        name: name.clone(),
                    })
                }
            }
        }
        *self = staged;
        Ok(())
    }

    pub fn data(&self) -> DistantLightData {
        let towards_light = (-self.direction).try_normalize().unwrap_or(Vec3::Y);
        DistantLightData {
            direction: towards_light.to_array(),
            cos_radius: (self.angular_diameter * 0.5).cos(),
            color_and_intensity: [self.color.x, self.color.y, self.color.z, self.intensity],
        }
    }
}

pub(crate) struct LightSlot {
    pub(crate) index: u64,
    pub(crate) light: Mutex<DistantLight>,
}

/// A light owned by the caller; it leaves the scene when dropped.
#[derive(Clone)]
pub struct Light {
    slot: Arc<LightSlot>,
}

impl Light {
    pub fn set_properties(&self, properties: &Properties) -> Result<(), RenderError> {
        self.slot.light.lock().set_properties(properties)
    }

    pub fn get(&self) -> DistantLight {
        self.slot.light.lock().clone()
    }
}

/// The scene's view of its lights, ordered by creation.
#[derive(Default)]
pub struct LightList {
    next_index: u64,
    lights: Vec<Weak<LightSlot>>,
}

impl LightList {
    pub fn add(&mut self, light_type: &str) -> Result<Light, RenderError> {
        if light_type != "distant" {
            return Err(RenderError::invalid_argument(format!(
                "unknown light type {:?}",
                light_type
            )));
        }

        let slot = Arc::new(LightSlot {
            index: self.next_index,
            light: Mutex::new(DistantLight::default()),
        });
        self.next_index += 1;
        self.lights.push(Arc::downgrade(&slot));
        Ok(Light { slot })
    }

    /// Packed data of the live lights, oldest first, at most
    /// `MAX_DISTANT_LIGHTS` of them.
    pub fn data(&mut self) -> Vec<DistantLightData> {
        let mut live: Vec<Arc<LightSlot>> = self.lights.iter().filter_map(Weak::upgrade).collect();
        self.lights.retain(|light| light.strong_count() > 0);

        live.sort_by_key(|slot| slot.index);
        live.iter()
            .take(MAX_DISTANT_LIGHTS)
            .map(|slot| slot.light.lock().data())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{properties, PropertyValue};

    #[test]
    fn lights_pack_in_creation_order() {
        let mut list = LightList::default();
        let mut lights: Vec<Light> = (0..6).map(|_| list.add("distant").unwrap()).collect();
        for (i, light) in lights.iter().enumerate() {
            light
                .set_properties(&properties([("intensity", i as f32)]))
                .unwrap();
        }

        // Dropping the caller's handle removes the light.
        lights.remove(1);

        let data = list.data();
        assert_eq!(data.len(), MAX_DISTANT_LIGHTS);
        let intensities: Vec<f32> = data.iter().map(|d| d.color_and_intensity[3]).collect();
        assert_eq!(intensities, vec![0.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn direction_is_negated_and_radius_halved() {
        let mut light = DistantLight::default();
        light
            .set_properties(&properties([
                ("direction", PropertyValue::from(Vec3::new(0.0, -2.0, 0.0))),
                ("angular_diameter", PropertyValue::Float(1.0)),
            ]))
            .unwrap();

        let data = light.data();
        assert_eq!(data.direction, [0.0, 1.0, 0.0]);
        assert!((data.cos_radius - 0.5f32.cos()).abs() < 1e-6);

        assert!(light
            .set_properties(&properties([("radius", 1.0f32)]))
            .is_err());
    }

    #[test]
    fn unknown_light_types_are_rejected() {
        assert!(LightList::default().add("spot").is_err());
    }

    #[test]
    fn layout_matches_shader() {
        assert_eq!(std::mem::size_of::<DistantLightData>(), 32);
    }
}
