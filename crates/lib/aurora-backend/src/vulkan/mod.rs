pub mod barrier;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod instance;
pub mod physical_device;
pub mod pipeline;

use self::{instance::Instance, physical_device::enumerate_physical_devices};
use anyhow::Result;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

pub use device::VulkanDevice;

#[derive(Clone, Copy, Debug)]
pub struct VulkanDeviceConfig {
    /// Enables the validation layer and routes its messages through `log`.
    pub graphics_debugging: bool,
    /// Picks a specific adapter instead of the highest scoring one.
    pub device_index: Option<usize>,
    pub command_allocator_count: usize,
}

impl Default for VulkanDeviceConfig {
    fn default() -> Self {
        Self {
            graphics_debugging: false,
            device_index: None,
            command_allocator_count: 3,
        }
    }
}

pub fn create_device(config: VulkanDeviceConfig) -> Result<Arc<VulkanDevice>> {
    let instance = Instance::builder()
        .graphics_debugging(config.graphics_debugging)
        .build()?;

    let mut physical_devices = enumerate_physical_devices(&instance)?
        .into_iter()
        .filter(|pdevice| pdevice.universal_queue_family().is_some())
        .collect::<Vec<_>>();

    info!("Available physical devices: ");
    for (device_idx, device) in physical_devices.iter().enumerate() {
        info!("  {}: {:?}", device_idx, device);
    }

    let pdevice = if let Some(device_index) = config.device_index {
        if device_index >= physical_devices.len() {
            anyhow::bail!(
                "Device index {} out of range; {} devices available",
                device_index,
                physical_devices.len()
            );
        }
        physical_devices.remove(device_index)
    } else {
        physical_devices.sort_by_key(|pdevice| pdevice.score());
        match physical_devices.pop() {
            Some(pdevice) => pdevice,
            None => anyhow::bail!("No suitable Vulkan device found"),
        }
    };

    info!("Selected physical device: {:?}", pdevice);

    let pdevice = Arc::new(pdevice);
    Ok(Arc::new(VulkanDevice::create(
        &pdevice,
        config.command_allocator_count,
    )?))
}
