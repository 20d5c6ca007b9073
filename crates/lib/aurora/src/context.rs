use crate::{
    error::RenderError,
    material::MaterialDefinition,
    materialx::{MaterialType, MaterialXLoader},
    memory_pool::VertexBufferPool,
    shader_library::ShaderLibrary,
    standard_surface,
    task::TaskScheduler,
    transfer_buffer::PendingUploads,
};
use aurora_backend::{shader_compiler::ShaderCompiler, Device};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::{path::Path, sync::Arc};

/// State shared by the renderer and every resource it creates.
///
/// Locks are taken briefly and never nested, except `tasks` which may be
/// held while recording uploads.
pub struct RenderContext {
    pub device: Device,
    pub compiler: Arc<dyn ShaderCompiler>,
    pub uploads: PendingUploads,
    pub vertex_pool: Mutex<VertexBufferPool>,
    pub tasks: Mutex<TaskScheduler>,
    pub library: Mutex<ShaderLibrary>,
    pub materialx: Mutex<MaterialXLoader>,
    pub default_material: Arc<MaterialDefinition>,
}

impl RenderContext {
    pub fn new(device: Device, compiler: Arc<dyn ShaderCompiler>, task_count: usize) -> Arc<Self> {
        Arc::new(Self {
            uploads: PendingUploads::default(),
            vertex_pool: Mutex::new(VertexBufferPool::new(device.clone())),
            tasks: Mutex::new(TaskScheduler::new(device.clone(), task_count)),
            library: Mutex::new(ShaderLibrary::new(device.clone(), compiler.clone())),
            materialx: Mutex::new(MaterialXLoader::default()),
            default_material: Arc::new(standard_surface::material_definition()),
            device,
            compiler,
        })
    }

    /// Records copies for every pending transfer buffer into the open
    /// command list. Returns the number of copies.
    pub fn upload_transfer_buffers(&self) -> usize {
        let mut tasks = self.tasks.lock();
        if self.uploads.is_empty() {
            return 0;
        }
        self.uploads.record(tasks.command_list())
    }

    /// Resolves a material type name and document into a definition.
    ///
    /// MaterialX documents that cannot be turned into a shader fall back to
    /// the built-in material; an unknown type name is an error.
    pub fn material_definition(
        &self,
        type_name: &str,
        document: &str,
    ) -> Result<Arc<MaterialDefinition>, RenderError> {
        let ty = MaterialType::from_name(type_name).ok_or_else(|| {
            RenderError::invalid_argument(format!("unknown material type {:?}", type_name))
        })?;

        let loaded = match ty {
            MaterialType::BuiltIn => return Ok(self.default_material.clone()),
            MaterialType::MaterialX => self.materialx.lock().load(document),
            MaterialType::MaterialXPath => self.materialx.lock().load_path(Path::new(document)),
        };

        Ok(loaded.unwrap_or_else(|err| {
            error!("Falling back to the default material: {}", err);
            self.default_material.clone()
        }))
    }
}
