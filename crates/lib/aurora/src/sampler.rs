use crate::{
    error::RenderError,
    properties::{expect_value, Properties},
};
use aurora_backend::{ash::vk, SamplerDesc};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Clamp,
    Mirror,
    MirrorOnce,
    Border,
}

impl AddressMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "wrap" | "periodic" => Some(AddressMode::Wrap),
            "clamp" => Some(AddressMode::Clamp),
            "mirror" => Some(AddressMode::Mirror),
            "mirror_once" => Some(AddressMode::MirrorOnce),
            "border" | "black" => Some(AddressMode::Border),
            _ => None,
        }
    }

    fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
            AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
            AddressMode::MirrorOnce => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
            AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Linear,
    Nearest,
}

/// Texture sampling state. Identical samplers share one heap slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Sampler {
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub filter: FilterMode,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            address_mode_u: AddressMode::Wrap,
            address_mode_v: AddressMode::Wrap,
            filter: FilterMode::Linear,
        }
    }
}

impl Sampler {
    pub fn from_properties(properties: &Properties) -> Result<Self, RenderError> {
        let mut sampler = Self::default();

        for (name, value) in properties {
            match name.as_str() {
                "address_mode_u" | "address_mode_v" => {
                    let mode_name: String = expect_value(name, value)?;
                    let mode = AddressMode::from_name(&mode_name).ok_or_else(|| {
                        RenderError::invalid_argument(format!(
                            "unknown address mode {:?} for {}",
                            mode_name, name
                        ))
                    })?;
                    if name == "address_mode_u" {
                        sampler.address_mode_u = mode;
                    } else {
                        sampler.address_mode_v = mode;
                    }
                }
                "filter" => {
                    let filter: String = expect_value(name, value)?;
                    sampler.filter = match filter.as_str() {
                        "linear" => FilterMode::Linear,
                        "nearest" => FilterMode::Nearest,
                        _ => {
                            return Err(RenderError::invalid_argument(format!(
                                "unknown filter {:?}",
                                filter
                            )))
                        }
                    };
                }
                _ => {
                    return Err(RenderError::UnknownProperty {
                        name: name.clone(),
                    })
                }
            }
        }

        Ok(sampler)
    }

    /// Stable across runs, so it can key caches.
    pub fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn desc(&self) -> SamplerDesc {
        SamplerDesc {
            filter: match self.filter {
                FilterMode::Linear => vk::Filter::LINEAR,
                FilterMode::Nearest => vk::Filter::NEAREST,
            },
            address_modes: [self.address_mode_u.to_vk(), self.address_mode_v.to_vk()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{properties, PropertyValue};

    #[test]
    fn identical_samplers_hash_alike() {
        let a = Sampler::from_properties(&properties([
            ("address_mode_u", "clamp"),
            ("address_mode_v", "mirror_once"),
        ]))
        .unwrap();
        let b = Sampler::from_properties(&properties([
            ("address_mode_v", "mirror_once"),
            ("address_mode_u", "clamp"),
        ]))
        .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_ne!(a.hash_value(), Sampler::default().hash_value());
        assert_eq!(
            a.desc().address_modes,
            [
                vk::SamplerAddressMode::CLAMP_TO_EDGE,
                vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE
            ]
        );
    }

    #[test]
    fn bad_properties_are_rejected() {
        assert!(Sampler::from_properties(&properties([("address_mode_u", "sideways")])).is_err());
        assert!(matches!(
            Sampler::from_properties(&properties([("address_mode_u", PropertyValue::Int(1))])),
            Err(RenderError::PropertyType { .. })
        ));
        assert!(matches!(
            Sampler::from_properties(&properties([("anisotropy", PropertyValue::Int(4))])),
            Err(RenderError::UnknownProperty { .. })
        ));
    }
}
