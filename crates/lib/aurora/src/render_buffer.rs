use crate::error::RenderError;
use aurora_backend::{ash::vk, Buffer, BufferDesc, Device, Image, ImageDesc};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderBufferFormat {
    Rgba8Unorm,
    /// Stored sRGB encoded; the post-process pass does the encoding.
    Rgba8Srgb,
    Rgba16Float,
    Rgba32Float,
    /// Single channel, used for depth.
    R32Float,
}

impl RenderBufferFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "rgba8_unorm" => Some(Self::Rgba8Unorm),
            "rgba8_srgb" => Some(Self::Rgba8Srgb),
            "rgba16_float" => Some(Self::Rgba16Float),
            "rgba32_float" => Some(Self::Rgba32Float),
            "r32_float" => Some(Self::R32Float),
            _ => None,
        }
    }

    pub fn vk_format(self) -> vk::Format {
        match self {
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::R32Float => vk::Format::R32_SFLOAT,
        }
    }

    /// Format of the storage image the shaders write before the copy into
    /// the target. sRGB formats have no storage view.
    pub fn storage_format(self) -> vk::Format {
        match self {
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_UNORM,
            other => other.vk_format(),
        }
    }

    pub fn is_srgb(self) -> bool {
        self == Self::Rgba8Srgb
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8Unorm | Self::Rgba8Srgb | Self::R32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// A render target the caller can read back on the CPU.
pub struct RenderBuffer {
    width: u32,
    height: u32,
    format: RenderBufferFormat,
    image: Arc<Image>,
    readback: Arc<Buffer>,
}

impl RenderBuffer {
    pub fn new(
        device: &Device,
        width: u32,
        height: u32,
        format: RenderBufferFormat,
    ) -> Result<Self, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::invalid_argument(format!(
                "render buffer of {}x{} pixels",
                width, height
            )));
        }

        let desc = ImageDesc::new_2d(format.vk_format(), [width, height]).usage(
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
        );
        let image = device.create_image(desc, "render buffer")?;
        let readback = device.create_buffer(
            BufferDesc::new_gpu_to_cpu(desc.byte_size(), vk::BufferUsageFlags::TRANSFER_DST),
            "render buffer readback",
        )?;

        Ok(Self {
            width,
            height,
            format,
            image,
            readback,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> RenderBufferFormat {
        self.format
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub(crate) fn readback(&self) -> &Arc<Buffer> {
        &self.readback
    }

    fn row_pitch(&self) -> usize {
        self.image.desc.row_pitch()
    }

    /// Pixels of the last rendered frame, as `(stride, bytes)`. With
    /// `remove_padding` the rows are packed, so the stride is exactly one
    /// row of pixels. Call after `Renderer::wait_for_task`.
    pub fn data(&self, remove_padding: bool) -> (usize, Vec<u8>) {
        let pitch = self.row_pitch();
        let mut bytes = vec![0u8; pitch * self.height as usize];
        self.readback.read_bytes(0, &mut bytes);

        let row = self.width as usize * self.format.bytes_per_pixel();
        if !remove_padding || row == pitch {
            return (pitch, bytes);
        }

        let packed = bytes.chunks_exact(pitch).flat_map(|r| &r[..row]).copied().collect();
        (row, packed)
    }

    /// Handle for zero-copy sharing with another API. No backend exports one.
    pub fn shared_handle(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_backend::headless::HeadlessDevice;

    #[test]
    fn readback_is_row_contiguous() {
        let device = Device::new(Arc::new(HeadlessDevice::new(3)));
        let buffer = RenderBuffer::new(&device, 3, 2, RenderBufferFormat::Rgba8Unorm).unwrap();

        let (stride, bytes) = buffer.data(true);
        assert_eq!(stride, 12);
        assert_eq!(bytes.len(), 24);
        assert!(buffer.shared_handle().is_none());
    }

    #[test]
    fn srgb_targets_are_written_through_a_linear_view() {
        assert_eq!(
            RenderBufferFormat::Rgba8Srgb.storage_format(),
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(RenderBufferFormat::from_name("r32_float"), Some(RenderBufferFormat::R32Float));
        assert!(RenderBuffer::new(
            &Device::new(Arc::new(HeadlessDevice::new(1))),
            0,
            4,
            RenderBufferFormat::R32Float
        )
        .is_err());
    }
}
