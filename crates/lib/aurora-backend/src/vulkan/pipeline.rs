use super::device::VulkanDevice;
use crate::{
    pipeline::{
        ComputePipelineDesc, GeneralShaderKind, ShaderExport, ShaderGroupDesc, ShaderIdentifier,
        RayTracingPipelineDesc, SHADER_IDENTIFIER_SIZE,
    },
    BackendError,
};
use ash::vk;
use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{collections::HashMap, ffi::CString};

fn create_shader_module(
    device: &ash::Device,
    name: &str,
    code: &Bytes,
) -> Result<vk::ShaderModule, BackendError> {
    let spirv = ash::util::read_spv(&mut std::io::Cursor::new(&code[..])).map_err(|err| {
        BackendError::ShaderCompilation {
            name: name.to_owned(),
            message: format!("invalid SPIR-V: {}", err),
        }
    })?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&spirv);
    unsafe { Ok(device.create_shader_module(&create_info, None)?) }
}

fn entry_point_name(name: &str) -> Result<CString, BackendError> {
    CString::new(name).map_err(|_| BackendError::ResourceAccess {
        info: format!("entry point {:?} contains a nul byte", name),
    })
}

struct StageBuilder<'a> {
    desc: &'a RayTracingPipelineDesc,
    modules: &'a [vk::ShaderModule],
    entry_points: Vec<CString>,
    stages: Vec<vk::PipelineShaderStageCreateInfo>,
    indices: HashMap<(usize, String), u32>,
}

impl<'a> StageBuilder<'a> {
    fn stage(
        &mut self,
        export: &ShaderExport,
        stage: vk::ShaderStageFlags,
    ) -> Result<u32, BackendError> {
        let key = (export.library, export.entry_point.clone());
        if let Some(index) = self.indices.get(&key) {
            return Ok(*index);
        }

        let library = self.desc.libraries.get(export.library).ok_or_else(|| {
            BackendError::ResourceAccess {
                info: format!("shader library {} does not exist", export.library),
            }
        })?;

        if !library.entry_points.contains(&export.entry_point) {
            return Err(BackendError::ResourceAccess {
                info: format!(
                    "library {:?} does not export {:?}",
                    library.name, export.entry_point
                ),
            });
        }

        // The CString buffer stays put when the vector grows.
        let entry_point = entry_point_name(&export.entry_point)?;
        let stage_info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.modules[export.library])
            .name(&entry_point)
            .build();
        self.entry_points.push(entry_point);

        let index = self.stages.len() as u32;
        self.stages.push(stage_info);
        self.indices.insert(key, index);
        Ok(index)
    }
}

pub(crate) fn create_ray_tracing_pipeline(
    device: &VulkanDevice,
    desc: &RayTracingPipelineDesc,
) -> Result<(vk::Pipeline, HashMap<String, ShaderIdentifier>), BackendError> {
    let modules = desc
        .libraries
        .iter()
        .map(|library| create_shader_module(&device.raw, &library.name, &library.code))
        .collect::<Result<Vec<_>, _>>()?;

    let result = create_ray_tracing_pipeline_with_modules(device, desc, &modules);

    for module in modules {
        unsafe { device.raw.destroy_shader_module(module, None) };
    }

    result
}

fn create_ray_tracing_pipeline_with_modules(
    device: &VulkanDevice,
    desc: &RayTracingPipelineDesc,
    modules: &[vk::ShaderModule],
) -> Result<(vk::Pipeline, HashMap<String, ShaderIdentifier>), BackendError> {
    let mut stages = StageBuilder {
        desc,
        modules,
        entry_points: Vec::new(),
        stages: Vec::new(),
        indices: HashMap::new(),
    };

    let mut groups = Vec::with_capacity(desc.groups.len());

    for group in &desc.groups {
        let group_info = match group {
            ShaderGroupDesc::General { kind, shader, .. } => {
                let stage = match kind {
                    GeneralShaderKind::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
                    GeneralShaderKind::Miss => vk::ShaderStageFlags::MISS_KHR,
                };

                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(stages.stage(shader, stage)?)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build()
            }
            ShaderGroupDesc::TrianglesHit {
                name,
                closest_hit,
                any_hit,
            } => {
                if closest_hit.is_none() && any_hit.is_none() {
                    return Err(BackendError::ResourceAccess {
                        info: format!("hit group {:?} has no shaders", name),
                    });
                }

                let closest_hit = match closest_hit {
                    Some(export) => stages.stage(export, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?,
                    None => vk::SHADER_UNUSED_KHR,
                };
                let any_hit = match any_hit {
                    Some(export) => stages.stage(export, vk::ShaderStageFlags::ANY_HIT_KHR)?,
                    None => vk::SHADER_UNUSED_KHR,
                };

                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit)
                    .any_hit_shader(any_hit)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build()
            }
        };

        groups.push(group_info);
    }

    let max_recursion_depth = desc
        .max_pipeline_ray_recursion_depth
        .min(device.ray_tracing_pipeline_properties.max_ray_recursion_depth);

    let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
        .stages(&stages.stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(max_recursion_depth)
        .layout(device.layouts.ray_tracing_pipeline_layout)
        .build();

    let pipeline = unsafe {
        device
            .ray_tracing_pipeline_ext
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )?[0]
    };

    let handle_size = device
        .ray_tracing_pipeline_properties
        .shader_group_handle_size as usize;
    let group_count = groups.len() as u32;

    let handles = unsafe {
        device
            .ray_tracing_pipeline_ext
            .get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                group_count as usize * handle_size,
            )
    };

    let handles = match handles {
        Ok(handles) => handles,
        Err(err) => {
            unsafe { device.raw.destroy_pipeline(pipeline, None) };
            return Err(err.into());
        }
    };

    let copy_size = handle_size.min(SHADER_IDENTIFIER_SIZE);
    let shader_identifiers = desc
        .groups
        .iter()
        .enumerate()
        .map(|(i, group)| {
            let mut identifier: ShaderIdentifier = [0; SHADER_IDENTIFIER_SIZE];
            identifier[..copy_size]
                .copy_from_slice(&handles[i * handle_size..i * handle_size + copy_size]);
            (group.name().to_owned(), identifier)
        })
        .collect();

    debug!(
        "Created ray tracing pipeline {:?}: {} stages, {} groups",
        desc.name,
        stages.stages.len(),
        groups.len()
    );

    Ok((pipeline, shader_identifiers))
}

pub(crate) fn create_compute_pipeline(
    device: &VulkanDevice,
    desc: &ComputePipelineDesc,
) -> Result<vk::Pipeline, BackendError> {
    let module = create_shader_module(&device.raw, &desc.name, &desc.code)?;
    let entry_point = entry_point_name(&desc.entry_point)?;

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry_point);

    let create_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage.build())
        .layout(device.layouts.compute_pipeline_layout);

    let pipeline = unsafe {
        let result = device.raw.create_compute_pipelines(
            vk::PipelineCache::null(),
            &[create_info.build()],
            None,
        );
        device.raw.destroy_shader_module(module, None);
        result.map_err(|(_, err)| err)?[0]
    };

    Ok(pipeline)
}
