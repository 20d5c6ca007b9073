use crate::{context::RenderContext, error::RenderError, shaders::compute_source};
use aurora_backend::{
    BufferBinding, CommandList, ComputeArgs, ComputePipeline, ComputePipelineDesc, DescriptorHeap,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

/// Thread-group size of every compute pass.
pub const GROUP_SIZE: [u32; 2] = [16, 8];

/// Table start plus three arguments.
const ROOT_CONSTANT_COUNT: u32 = 4;

pub fn group_counts(extent: [u32; 2]) -> [u32; 3] {
    [
        (extent[0] + GROUP_SIZE[0] - 1) / GROUP_SIZE[0],
        (extent[1] + GROUP_SIZE[1] - 1) / GROUP_SIZE[1],
        1,
    ]
}

/// A full-screen compute shader over a window of the storage-image heap.
pub struct ComputePass {
    pipeline: Arc<ComputePipeline>,
    table_start: u32,
}

impl ComputePass {
    pub fn new(
        ctx: &RenderContext,
        name: &str,
        body: &str,
        table_start: u32,
        uses_constant_buffer: bool,
    ) -> Result<Self, RenderError> {
        let compiled = ctx
            .compiler
            .compile_compute(name, &compute_source(body), "main")
            .map_err(|err| {
                error!("Compute shader {:?} failed to compile: {}", name, err);
                RenderError::ShaderCompilation {
                    name: name.to_owned(),
                    message: err.to_string(),
                }
            })?;

        let pipeline = ctx.device.create_compute_pipeline(ComputePipelineDesc {
            name: name.to_owned(),
            code: compiled.spirv,
            entry_point: "main".to_owned(),
            root_constant_count: ROOT_CONSTANT_COUNT,
            uses_constant_buffer,
        })?;

        debug!("Created compute pass {:?}", name);
        Ok(Self {
            pipeline,
            table_start,
        })
    }

    pub fn table_start(&self) -> u32 {
        self.table_start
    }

    pub fn record(
        &self,
        list: &mut CommandList,
        descriptor_heap: &Arc<DescriptorHeap>,
        args: [u32; 3],
        constant_buffer: Option<BufferBinding>,
        extent: [u32; 2],
    ) {
        list.dispatch(
            &self.pipeline,
            ComputeArgs {
                descriptor_heap: descriptor_heap.clone(),
                table_start: self.table_start,
                root_constants: args.to_vec(),
                constant_buffer,
            },
            group_counts(extent),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_cover_partial_tiles() {
        assert_eq!(group_counts([1920, 1080]), [120, 135, 1]);
        assert_eq!(group_counts([17, 9]), [2, 2, 1]);
        assert_eq!(group_counts([1, 1]), [1, 1, 1]);
    }
}
