use super::instance::Instance;
use anyhow::Result;
use ash::vk::{self, PhysicalDeviceMemoryProperties, PhysicalDeviceProperties};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{ffi::CStr, os::raw::c_char, sync::Arc};

#[derive(Copy, Clone)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
}

pub struct PhysicalDevice {
    pub instance: Arc<Instance>,
    pub raw: vk::PhysicalDevice,
    pub(crate) queue_families: Vec<QueueFamily>,
    pub properties: PhysicalDeviceProperties,
    pub memory_properties: PhysicalDeviceMemoryProperties,
}

impl PhysicalDevice {
    pub fn name(&self) -> String {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr() as *const c_char)
                .to_string_lossy()
                .into_owned()
        }
    }

    /// A queue family capable of both graphics and compute work.
    pub fn universal_queue_family(&self) -> Option<QueueFamily> {
        self.queue_families
            .iter()
            .filter(|qf| {
                qf.properties
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .copied()
            .next()
    }

    pub fn score(&self) -> u32 {
        match self.properties.device_type {
            vk::PhysicalDeviceType::INTEGRATED_GPU => 200,
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        }
    }
}

impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PhysicalDevice {{ {:?}, {:?} }}",
            self.name(),
            self.properties.device_type
        )
    }
}

pub fn enumerate_physical_devices(instance: &Arc<Instance>) -> Result<Vec<PhysicalDevice>> {
    unsafe {
        let pdevices = instance.raw.enumerate_physical_devices()?;

        Ok(pdevices
            .into_iter()
            .map(|pdevice| {
                let properties = instance.raw.get_physical_device_properties(pdevice);

                let queue_families = instance
                    .raw
                    .get_physical_device_queue_family_properties(pdevice)
                    .into_iter()
                    .enumerate()
                    .map(|(index, properties)| QueueFamily {
                        index: index as _,
                        properties,
                    })
                    .collect();

                let memory_properties = instance.raw.get_physical_device_memory_properties(pdevice);

                PhysicalDevice {
                    raw: pdevice,
                    queue_families,
                    instance: instance.clone(),
                    properties,
                    memory_properties,
                }
            })
            .collect())
    }
}
