use crate::{compute::ComputePass, context::RenderContext, error::RenderError, shaders};
use aurora_backend::{ash::vk, CommandList, DescriptorHeap, Image, ImageDesc, ResourceState};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

/// Heap slot of the first denoising texture, right after the depth outputs.
pub const DENOISING_SLOT: usize = 4;

/// The denoise pass sees the direct image at table index 0.
const DENOISE_TABLE_START: u32 = 2;

const FILTER_RADIUS: u32 = 2;

/// Depth-view, normal/roughness, base color/metalness, diffuse in and out,
/// glossy in and out, in heap order.
const TEXTURES: [(&str, vk::Format); 7] = [
    ("depth view", vk::Format::R32_SFLOAT),
    ("normal roughness", vk::Format::R16G16B16A16_SFLOAT),
    ("base color metalness", vk::Format::R16G16B16A16_SFLOAT),
    ("diffuse in", vk::Format::R16G16B16A16_SFLOAT),
    ("diffuse out", vk::Format::R16G16B16A16_SFLOAT),
    ("glossy in", vk::Format::R16G16B16A16_SFLOAT),
    ("glossy out", vk::Format::R16G16B16A16_SFLOAT),
];

pub const DENOISING_TEXTURE_COUNT: usize = TEXTURES.len();

/// Edge-aware filter of the demodulated lighting AOVs, recombined into the
/// direct image before accumulation.
pub struct Denoiser {
    pass: ComputePass,
    textures: Vec<Arc<Image>>,
    extent: [u32; 2],
    is_initialized: bool,
}

impl Denoiser {
    pub fn new(ctx: &RenderContext, extent: [u32; 2]) -> Result<Self, RenderError> {
        let pass = ComputePass::new(
            ctx,
            "denoise",
            shaders::DENOISE,
            DENOISE_TABLE_START,
            false,
        )?;

        let textures = TEXTURES
            .iter()
            .map(|(name, format)| {
                ctx.device.create_image(
                    ImageDesc::new_2d(*format, extent).usage(vk::ImageUsageFlags::STORAGE),
                    *name,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!("Created denoiser for {}x{}", extent[0], extent[1]);
        Ok(Self {
            pass,
            textures,
            extent,
            is_initialized: false,
        })
    }

    pub fn extent(&self) -> [u32; 2] {
        self.extent
    }

    pub fn textures(&self) -> &[Arc<Image>] {
        &self.textures
    }

    /// Records the filter. Runs after the ray dispatch that wrote the AOVs.
    pub fn record(&mut self, list: &mut CommandList, heap: &Arc<DescriptorHeap>, reset_history: bool) {
        if !self.is_initialized {
            for texture in &self.textures {
                list.transition(texture, ResourceState::Common, ResourceState::UnorderedAccess);
            }
            self.is_initialized = true;
        }

        list.uav_barrier(None);
        self.pass.record(
            list,
            heap,
            [FILTER_RADIUS, reset_history as u32, 0],
            None,
            self.extent,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_backend::{
        headless::{HeadlessDevice, RecordedCommand},
        shader_compiler::PassthroughShaderCompiler,
        DescriptorHeapKind, Device, RenderDevice,
    };

    #[test]
    fn dispatch_reads_the_denoising_window() {
        let headless = Arc::new(HeadlessDevice::new(3));
        let ctx = RenderContext::new(
            Device::new(headless.clone()),
            Arc::new(PassthroughShaderCompiler),
            3,
        );
        let heap = ctx
            .device
            .create_descriptor_heap(DescriptorHeapKind::Resources, 16)
            .unwrap();

        let mut denoiser = Denoiser::new(&ctx, [40, 20]).unwrap();
        assert_eq!(denoiser.textures().len(), DENOISING_TEXTURE_COUNT);

        let mut list = CommandList::new("denoise");
        list.begin();
        denoiser.record(&mut list, &heap, true);
        denoiser.record(&mut list, &heap, false);
        list.close();
        headless.submit(0, &list).unwrap();

        let log = headless.log();
        let dispatches: Vec<_> = log.submissions[0]
            .commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::Dispatch {
                    table_start,
                    root_constants,
                    group_counts,
                    ..
                } => Some((*table_start, root_constants.clone(), *group_counts)),
                _ => None,
            })
            .collect();

        assert_eq!(
            dispatches,
            vec![
                (2, vec![FILTER_RADIUS, 1, 0], [3, 3, 1]),
                (2, vec![FILTER_RADIUS, 0, 0], [3, 3, 1]),
            ]
        );

        let transitions = log.submissions[0]
            .commands
            .iter()
            .filter(|command| matches!(command, RecordedCommand::Transition { .. }))
            .count();
        assert_eq!(transitions, DENOISING_TEXTURE_COUNT);
    }
}
