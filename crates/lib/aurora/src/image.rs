use crate::{
    alias_map::AliasMap, context::RenderContext, error::RenderError,
    transfer_buffer::TransferBuffer,
};
use anyhow::Context as _;
use aurora_backend::{
    ash::vk, Buffer, BufferDesc, Image as GpuImage, ImageDesc, ResourceState,
};
use exr::prelude::{self as exrs, ReadChannels as _, ReadLayers as _};
use half::f16;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{fs::File, io::BufReader, path::Path, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// 8-bit RGBA, sRGB encoded unless `linearize` is off.
    Rgba8Srgb,
    R32Float,
    /// Widened to RGBA on upload.
    Rgb32Float,
    Rgba32Float,
    Rgba16Float,
    Rgba16Unorm,
    Rg32Uint,
    R8Unorm,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ImageFormat::R8Unorm => 1,
            ImageFormat::Rgba8Srgb | ImageFormat::R32Float => 4,
            ImageFormat::Rgba16Float | ImageFormat::Rgba16Unorm | ImageFormat::Rg32Uint => 8,
            ImageFormat::Rgb32Float => 12,
            ImageFormat::Rgba32Float => 16,
        }
    }
}

pub type ImageDataCallback = Arc<dyn Fn() -> Option<Vec<u8>> + Send + Sync>;
pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// Describes an image whose pixels are pulled from the caller on upload.
#[derive(Clone)]
pub struct ImageDescriptor {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub linearize: bool,
    pub is_environment: bool,
    pub get_data: ImageDataCallback,
    pub complete: Option<CompletionCallback>,
}

impl ImageDescriptor {
    pub fn new(
        format: ImageFormat,
        width: u32,
        height: u32,
        get_data: impl Fn() -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            format,
            width,
            height,
            linearize: format == ImageFormat::Rgba8Srgb,
            is_environment: false,
            get_data: Arc::new(get_data),
            complete: None,
        }
    }

    pub fn from_pixels(format: ImageFormat, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        let pixels = Arc::new(pixels);
        Self::new(format, width, height, move || Some(pixels.as_ref().clone()))
    }

    pub fn linearize(mut self, linearize: bool) -> Self {
        self.linearize = linearize;
        self
    }

    pub fn environment(mut self, is_environment: bool) -> Self {
        self.is_environment = is_environment;
        self
    }

    pub fn on_complete(mut self, complete: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(complete));
        self
    }

    fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

impl std::fmt::Debug for ImageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDescriptor")
            .field("format", &self.format)
            .field("size", &[self.width, self.height])
            .field("linearize", &self.linearize)
            .field("is_environment", &self.is_environment)
            .finish()
    }
}

// Pixel data arrives as plain bytes with no alignment guarantee.
fn read_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_f16s(bytes: &[u8]) -> Vec<f16> {
    bytes
        .chunks_exact(2)
        .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])))
        .collect()
}

fn srgb_to_linear(value: u8) -> f32 {
    let c = value as f32 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Converts source pixels to what the GPU texture holds.
fn texture_data(desc: &ImageDescriptor, pixels: &[u8]) -> (vk::Format, Vec<u8>) {
    match desc.format {
        ImageFormat::Rgba8Srgb if desc.linearize => {
            let data: Vec<f16> = pixels
                .chunks_exact(4)
                .flat_map(|px| {
                    [
                        f16::from_f32(srgb_to_linear(px[0])),
                        f16::from_f32(srgb_to_linear(px[1])),
                        f16::from_f32(srgb_to_linear(px[2])),
                        f16::from_f32(px[3] as f32 / 255.0),
                    ]
                })
                .collect();
            (
                vk::Format::R16G16B16A16_SFLOAT,
                bytemuck::cast_slice(&data).to_vec(),
            )
        }
        ImageFormat::Rgba8Srgb => (vk::Format::R8G8B8A8_UNORM, pixels.to_vec()),
        ImageFormat::Rgb32Float => {
            let data: Vec<f32> = read_f32s(pixels)
                .chunks_exact(3)
                .flat_map(|px| [px[0], px[1], px[2], 1.0])
                .collect();
            (
                vk::Format::R32G32B32A32_SFLOAT,
                bytemuck::cast_slice(&data).to_vec(),
            )
        }
        ImageFormat::R32Float => (vk::Format::R32_SFLOAT, pixels.to_vec()),
        ImageFormat::Rgba32Float => (vk::Format::R32G32B32A32_SFLOAT, pixels.to_vec()),
        ImageFormat::Rgba16Float => (vk::Format::R16G16B16A16_SFLOAT, pixels.to_vec()),
        ImageFormat::Rgba16Unorm => (vk::Format::R16G16B16A16_UNORM, pixels.to_vec()),
        ImageFormat::Rg32Uint => (vk::Format::R32G32_UINT, pixels.to_vec()),
        ImageFormat::R8Unorm => (vk::Format::R8_UNORM, pixels.to_vec()),
    }
}

/// Linear RGBA floats for building an alias map, where the format allows it.
fn linear_rgba(desc: &ImageDescriptor, pixels: &[u8]) -> Option<Vec<f32>> {
    match desc.format {
        ImageFormat::Rgba8Srgb => Some(
            pixels
                .chunks_exact(4)
                .flat_map(|px| {
                    let decode = |c: u8| {
                        if desc.linearize {
                            srgb_to_linear(c)
                        } else {
                            c as f32 / 255.0
                        }
                    };
                    [decode(px[0]), decode(px[1]), decode(px[2]), 1.0]
                })
                .collect(),
        ),
        ImageFormat::Rgb32Float => Some(
            read_f32s(pixels)
                .chunks_exact(3)
                .flat_map(|px| [px[0], px[1], px[2], 1.0])
                .collect(),
        ),
        ImageFormat::Rgba32Float => Some(read_f32s(pixels)),
        ImageFormat::Rgba16Float => Some(
            read_f16s(pixels)
                .iter()
                .map(|c| c.to_f32())
                .collect(),
        ),
        ImageFormat::R32Float => Some(
            read_f32s(pixels)
                .into_iter()
                .flat_map(|c| [c, c, c, 1.0])
                .collect(),
        ),
        ImageFormat::Rgba16Unorm | ImageFormat::Rg32Uint | ImageFormat::R8Unorm => None,
    }
}

/// A GPU-resident image, plus the importance sampling table of environments.
pub struct Image {
    pub name: String,
    pub texture: Arc<GpuImage>,
    pub is_environment: bool,
    pub alias_map: Option<Arc<Buffer>>,
    pub luminance_integral: f32,
}

impl Image {
    /// Pulls the pixels from `desc` and records their upload. `Ok(None)` when
    /// the callback has no data; shaders then see no texture.
    pub fn create(
        ctx: &RenderContext,
        name: &str,
        desc: &ImageDescriptor,
    ) -> Result<Option<Self>, RenderError> {
        let pixels = match (desc.get_data)() {
            Some(pixels) => pixels,
            None => {
                warn!("Image {:?} provided no pixel data", name);
                return Ok(None);
            }
        };

        let result = Self::create_from_pixels(ctx, name, desc, &pixels);
        if let Some(complete) = &desc.complete {
            complete();
        }
        result.map(Some)
    }

    fn create_from_pixels(
        ctx: &RenderContext,
        name: &str,
        desc: &ImageDescriptor,
        pixels: &[u8],
    ) -> Result<Self, RenderError> {
        if desc.width == 0 || desc.height == 0 || pixels.len() < desc.byte_size() {
            return Err(RenderError::invalid_argument(format!(
                "image {:?}: {} bytes of pixel data for {}x{} {:?}",
                name,
                pixels.len(),
                desc.width,
                desc.height,
                desc.format
            )));
        }
        let pixels = &pixels[..desc.byte_size()];

        let (format, data) = texture_data(desc, pixels);
        let texture = ctx.device.create_image(
            ImageDesc::new_2d(format, [desc.width, desc.height])
                .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST),
            name,
        )?;

        let staging = ctx.device.create_buffer(
            BufferDesc::new_cpu_to_gpu(data.len(), vk::BufferUsageFlags::TRANSFER_SRC),
            format!("{} (staging)", name),
        )?;
        staging.write_bytes(0, &data);

        {
            let mut tasks = ctx.tasks.lock();
            let list = tasks.command_list();
            list.transition(&texture, ResourceState::Common, ResourceState::CopyDest);
            list.copy_buffer_to_image(&staging, 0, &texture);
            list.transition(&texture, ResourceState::CopyDest, ResourceState::ShaderResource);
        }

        let mut image = Self {
            name: name.to_owned(),
            texture,
            is_environment: desc.is_environment,
            alias_map: None,
            luminance_integral: 0.0,
        };

        if desc.is_environment {
            let rgba = linear_rgba(desc, pixels).unwrap_or_else(|| {
                warn!(
                    "Environment image {:?} has format {:?}; importance sampling falls back to uniform",
                    name, desc.format
                );
                vec![0.0; desc.width as usize * desc.height as usize * 4]
            });

            let alias_map =
                AliasMap::build(&rgba, desc.width as usize, desc.height as usize, 4);
            trace!(
                "Alias map for {:?}: {} entries, luminance integral {}",
                name,
                alias_map.len(),
                alias_map.luminance_integral
            );

            let mut buffer = TransferBuffer::new(
                &ctx.device,
                alias_map.as_bytes().len(),
                vk::BufferUsageFlags::STORAGE_BUFFER,
                ResourceState::ShaderResource,
                &format!("{} (alias map)", name),
            )?;
            buffer.write(0, alias_map.as_bytes(), &ctx.uploads);

            image.alias_map = Some(buffer.buffer().clone());
            image.luminance_integral = alias_map.luminance_integral;
        }

        Ok(image)
    }
}

/// Decodes an image file into a descriptor. `.hdr` and `.exr` files become
/// float RGB(A); everything else goes through the `image` crate as 8-bit RGBA.
pub fn load_image_file(path: &Path, flip_y: bool) -> anyhow::Result<ImageDescriptor> {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

    let (format, width, height, mut pixels) = match ext.as_deref() {
        Some("hdr") => load_hdr(path)?,
        Some("exr") => load_exr(path)?,
        _ => {
            let image = image::open(path)
                .with_context(|| format!("failed to decode {:?}", path))?
                .to_rgba8();
            let (width, height) = image.dimensions();
            (ImageFormat::Rgba8Srgb, width, height, image.into_raw())
        }
    };

    if flip_y {
        let row = width as usize * format.bytes_per_pixel();
        let flipped: Vec<u8> = pixels.chunks_exact(row).rev().flatten().copied().collect();
        pixels = flipped;
    }

    info!("Loaded image {:?}: {}x{} {:?}", path, width, height, format);
    Ok(ImageDescriptor::from_pixels(format, width, height, pixels))
}

fn load_hdr(path: &Path) -> anyhow::Result<(ImageFormat, u32, u32, Vec<u8>)> {
    let f = File::open(path).context("failed to open specified file")?;
    let image = radiant::load(BufReader::new(f)).context("failed to load image data")?;

    let data: Vec<f32> = image
        .data
        .iter()
        .flat_map(|px| [px.r, px.g, px.b])
        .collect();

    Ok((
        ImageFormat::Rgb32Float,
        image.width as u32,
        image.height as u32,
        bytemuck::cast_slice(&data).to_vec(),
    ))
}

struct ExrPixels {
    width: usize,
    data: Vec<f32>,
}

fn load_exr(path: &Path) -> anyhow::Result<(ImageFormat, u32, u32, Vec<u8>)> {
    let reader = exrs::read()
        .no_deep_data()
        .largest_resolution_level()
        .rgb_channels(
            |resolution, _channels: &exrs::RgbChannels| ExrPixels {
                width: resolution.width(),
                data: vec![0.0; resolution.width() * resolution.height() * 4],
            },
            |output: &mut ExrPixels, position, (r, g, b): (f32, f32, f32)| {
                let offset = (position.1 * output.width + position.0) * 4;
                output.data[offset..offset + 4].copy_from_slice(&[r, g, b, 1.0]);
            },
        )
        .first_valid_layer()
        .all_attributes();

    let image: exrs::Image<exrs::Layer<exrs::SpecificChannels<ExrPixels, exrs::RgbChannels>>> =
        reader.from_file(path)?;
    let pixels = image.layer_data.channel_data.pixels;
    let height = pixels.data.len() / 4 / pixels.width.max(1);

    Ok((
        ImageFormat::Rgba32Float,
        pixels.width as u32,
        height as u32,
        bytemuck::cast_slice(&pixels.data).to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_images_linearize_to_half() {
        let desc = ImageDescriptor::from_pixels(ImageFormat::Rgba8Srgb, 1, 1, vec![255, 0, 188, 255]);
        let (format, data) = texture_data(&desc, &[255, 0, 188, 255]);
        assert_eq!(format, vk::Format::R16G16B16A16_SFLOAT);

        let texels = read_f16s(&data);
        assert_eq!(texels[0].to_f32(), 1.0);
        assert_eq!(texels[1].to_f32(), 0.0);
        assert!((texels[2].to_f32() - 0.5).abs() < 0.01);
        assert_eq!(texels[3].to_f32(), 1.0);

        let (format, _) = texture_data(&desc.linearize(false), &[255, 0, 188, 255]);
        assert_eq!(format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn rgb_float_widens_to_rgba() {
        let rgb = [0.5f32, 1.0, 2.0];
        let desc = ImageDescriptor::from_pixels(
            ImageFormat::Rgb32Float,
            1,
            1,
            bytemuck::cast_slice(&rgb).to_vec(),
        );
        let (format, data) = texture_data(&desc, bytemuck::cast_slice(&rgb));
        assert_eq!(format, vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(read_f32s(&data), vec![0.5, 1.0, 2.0, 1.0]);
    }
}
