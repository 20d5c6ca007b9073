use crate::{
    error::RenderError,
    shaders::{material_library_source, ShaderOptions},
    uniform_buffer::UniformBufferDefinition,
};
use aurora_backend::{
    pipeline::{
        GeneralShaderKind, LocalRootAssociation, LocalRootLayout, ShaderExport, ShaderGroupDesc,
        ShaderIdentifier, ShaderLibraryDesc, GLOBAL_ROOT_PARAMETERS,
    },
    shader_compiler::ShaderCompiler,
    Device, RayTracingPipeline, RayTracingPipelineDesc,
};
use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{Arc, Weak},
};

/// Identifier of the shader that also carries ray generation and the
/// built-in miss shaders.
pub const DEFAULT_SHADER_ID: &str = "Default";

pub const RAY_GEN_GROUP: &str = "RayGen";
pub const BACKGROUND_MISS_GROUP: &str = "BackgroundMiss";
pub const RADIANCE_MISS_GROUP: &str = "RadianceMiss";
pub const SHADOW_MISS_GROUP: &str = "ShadowMiss";

const MAX_PAYLOAD_SIZE: u32 = 100;
const MAX_ATTRIBUTE_SIZE: u32 = 8;

pub fn hit_group_name(shader_id: &str) -> String {
    format!("{}:RadianceHitGroup", shader_id)
}

pub fn layer_miss_group_name(shader_id: &str) -> String {
    format!("{}:LayerMiss", shader_id)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    RayGen,
    BackgroundMiss,
    RadianceMiss,
    ShadowMiss,
    RadianceHit,
    ShadowAnyHit,
    LayerMiss,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 7] = [
        EntryPoint::RayGen,
        EntryPoint::BackgroundMiss,
        EntryPoint::RadianceMiss,
        EntryPoint::ShadowMiss,
        EntryPoint::RadianceHit,
        EntryPoint::ShadowAnyHit,
        EntryPoint::LayerMiss,
    ];

    /// Entry points only the default shader provides.
    pub const SHARED: [EntryPoint; 4] = [
        EntryPoint::RayGen,
        EntryPoint::BackgroundMiss,
        EntryPoint::RadianceMiss,
        EntryPoint::ShadowMiss,
    ];

    pub fn export_name(self) -> &'static str {
        match self {
            EntryPoint::RayGen => "RayGenShader",
            EntryPoint::BackgroundMiss => "BackgroundMissShader",
            EntryPoint::RadianceMiss => "RadianceMissShader",
            EntryPoint::ShadowMiss => "ShadowMissShader",
            EntryPoint::RadianceHit => "RadianceHitShader",
            EntryPoint::ShadowAnyHit => "ShadowAnyHitShader",
            EntryPoint::LayerMiss => "LayerMissShader",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileState {
    Invalid,
    PendingCompilation,
    CompiledSuccessfully,
    CompilationFailed,
    PendingRemoval,
}

/// Everything that determines a material shader's code.
#[derive(Debug, PartialEq, Eq)]
pub struct MaterialShaderDefinition {
    pub id: String,
    /// HLSL defining `evaluate_material`.
    pub source: String,
    pub uniforms: Arc<UniformBufferDefinition>,
    pub texture_names: Vec<String>,
    pub is_always_opaque: bool,
}

impl MaterialShaderDefinition {
    /// Identified by a hash of its contents.
    pub fn new(
        source: impl Into<String>,
        uniforms: Arc<UniformBufferDefinition>,
        texture_names: Vec<String>,
        is_always_opaque: bool,
    ) -> Self {
        let source = source.into();

        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        for (field, offset) in uniforms.declared_fields() {
            field.hash(&mut hasher);
            offset.hash(&mut hasher);
        }
        texture_names.hash(&mut hasher);
        is_always_opaque.hash(&mut hasher);

        Self::with_id(
            format!("{:016x}", hasher.finish()),
            source,
            uniforms,
            texture_names,
            is_always_opaque,
        )
    }

    pub fn with_id(
        id: impl Into<String>,
        source: impl Into<String>,
        uniforms: Arc<UniformBufferDefinition>,
        texture_names: Vec<String>,
        is_always_opaque: bool,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            uniforms,
            texture_names,
            is_always_opaque,
        }
    }
}

/// A live material shader. Dropping the last handle queues the shader for
/// removal on the next library rebuild.
#[derive(Debug)]
pub struct MaterialShader {
    pub definition: Arc<MaterialShaderDefinition>,
    slot: usize,
    generation: u64,
}

impl MaterialShader {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct ShaderSlot {
    shader: Weak<MaterialShader>,
    definition: Option<Arc<MaterialShaderDefinition>>,
    state: CompileState,
    generation: u64,
    refcounts: [u32; 7],
    binary: Option<Bytes>,
}

impl ShaderSlot {
    fn empty(generation: u64) -> Self {
        Self {
            shader: Weak::new(),
            definition: None,
            state: CompileState::Invalid,
            generation,
            refcounts: [0; 7],
            binary: None,
        }
    }

    fn is_live(&self) -> bool {
        self.shader.strong_count() > 0
    }

    fn id(&self) -> Option<&str> {
        self.definition.as_ref().map(|def| def.id.as_str())
    }
}

/// Reference-counted material shaders linked into one ray tracing pipeline.
///
/// Shaders are deduplicated by definition id. Each shader carries a refcount
/// per entry point; an entry point with a zero count is left out of the
/// pipeline. Any change that affects the pipeline marks the library dirty, and
/// `rebuild` compiles what is pending and relinks.
pub struct ShaderLibrary {
    device: Device,
    compiler: Arc<dyn ShaderCompiler>,
    options: ShaderOptions,
    slots: Vec<ShaderSlot>,
    free_slots: Vec<usize>,
    by_id: HashMap<String, usize>,
    pipeline: Option<Arc<RayTracingPipeline>>,
    needs_link: bool,
}

impl ShaderLibrary {
    pub fn new(device: Device, compiler: Arc<dyn ShaderCompiler>) -> Self {
        Self {
            device,
            compiler,
            options: ShaderOptions::default(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_id: HashMap::new(),
            pipeline: None,
            needs_link: true,
        }
    }

    pub fn options(&self) -> &ShaderOptions {
        &self.options
    }

    /// Changing options recompiles every live shader on the next rebuild.
    pub fn set_options(&mut self, options: ShaderOptions) {
        if options == self.options {
            return;
        }

        self.options = options;
        for slot in &mut self.slots {
            if slot.definition.is_some() && slot.state != CompileState::PendingRemoval {
                slot.binary = None;
                slot.state = CompileState::PendingCompilation;
            }
        }
        self.needs_link = true;
    }

    /// Returns the live shader with `definition.id`, or registers a new one.
    pub fn acquire(&mut self, definition: Arc<MaterialShaderDefinition>) -> Arc<MaterialShader> {
        if let Some(&slot_index) = self.by_id.get(&definition.id) {
            let slot = &mut self.slots[slot_index];

            if let Some(shader) = slot.shader.upgrade() {
                debug_assert_eq!(
                    shader.definition.source, definition.source,
                    "shader {:?} registered with different source",
                    definition.id
                );
                return shader;
            }

            // Released but not yet removed: revive it, keeping the binary.
            let shader = Arc::new(MaterialShader {
                definition: definition.clone(),
                slot: slot_index,
                generation: slot.generation,
            });
            slot.shader = Arc::downgrade(&shader);
            slot.definition = Some(definition);
            if slot.state == CompileState::PendingRemoval {
                slot.state = if slot.binary.is_some() {
                    CompileState::CompiledSuccessfully
                } else {
                    CompileState::PendingCompilation
                };
            }
            return shader;
        }

        let slot_index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.push(ShaderSlot::empty(0));
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[slot_index];
        let shader = Arc::new(MaterialShader {
            definition: definition.clone(),
            slot: slot_index,
            generation: slot.generation,
        });

        slot.shader = Arc::downgrade(&shader);
        slot.definition = Some(definition.clone());
        slot.state = CompileState::PendingCompilation;
        slot.refcounts = [0; 7];
        slot.binary = None;

        debug!("Acquired material shader {:?} in slot {}", definition.id, slot_index);
        self.by_id.insert(definition.id.clone(), slot_index);
        shader
    }

    pub fn get(&self, id: &str) -> Option<Arc<MaterialShader>> {
        self.by_id
            .get(id)
            .and_then(|&slot| self.slots[slot].shader.upgrade())
    }

    fn slot_of(&self, id: &str) -> usize {
        *self
            .by_id
            .get(id)
            .unwrap_or_else(|| panic!("unknown material shader {:?}", id))
    }

    pub fn refcount(&self, id: &str, entry_point: EntryPoint) -> u32 {
        self.by_id
            .get(id)
            .map(|&slot| self.slots[slot].refcounts[entry_point.index()])
            .unwrap_or(0)
    }

    pub fn increment_refcount(&mut self, id: &str, entry_point: EntryPoint) {
        let slot_index = self.slot_of(id);
        let slot = &mut self.slots[slot_index];
        let count = &mut slot.refcounts[entry_point.index()];
        *count += 1;

        if *count == 1 {
            slot.state = CompileState::PendingCompilation;
            self.needs_link = true;
        }
    }

    pub fn decrement_refcount(&mut self, id: &str, entry_point: EntryPoint) {
        let slot_index = self.slot_of(id);
        let slot = &mut self.slots[slot_index];
        let count = &mut slot.refcounts[entry_point.index()];
        assert!(
            *count > 0,
            "refcount of {:?} on shader {:?} would go negative",
            entry_point,
            id
        );
        *count -= 1;

        if *count == 0 {
            if slot.state != CompileState::PendingRemoval {
                slot.state = CompileState::PendingCompilation;
            }
            self.needs_link = true;
        }
    }

    /// Marks slots whose last handle went away.
    fn collect_released(&mut self) {
        for slot in &mut self.slots {
            if slot.definition.is_some()
                && !slot.is_live()
                && slot.state != CompileState::PendingRemoval
            {
                slot.state = CompileState::PendingRemoval;
                self.needs_link = true;
            }
        }
    }

    pub fn state(&mut self, slot: usize) -> CompileState {
        self.collect_released();
        self.slots
            .get(slot)
            .map(|slot| slot.state)
            .unwrap_or(CompileState::Invalid)
    }

    pub fn is_dirty(&mut self) -> bool {
        self.collect_released();
        self.needs_link
            || self.pipeline.is_none()
            || self.slots.iter().any(|slot| {
                matches!(
                    slot.state,
                    CompileState::PendingCompilation | CompileState::PendingRemoval
                )
            })
    }

    pub fn free_slots(&self) -> &[usize] {
        &self.free_slots
    }

    pub fn live_shader_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }

    /// Compiles pending shaders, removes released ones and links a new
    /// pipeline. The GPU must be idle.
    pub fn rebuild(&mut self) -> Result<(), RenderError> {
        if !self.is_dirty() {
            return Ok(());
        }

        self.remove_released();
        self.compile_pending()?;
        self.link()?;
        self.needs_link = false;
        Ok(())
    }

    fn remove_released(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state != CompileState::PendingRemoval {
                continue;
            }

            if let Some(id) = slot.id() {
                debug!("Removing material shader {:?} from slot {}", id, index);
                self.by_id.remove(id);
            }

            *slot = ShaderSlot::empty(slot.generation + 1);
            self.free_slots.push(index);
        }
    }

    fn compile_pending(&mut self) -> Result<(), RenderError> {
        let jobs: Vec<(usize, Arc<MaterialShaderDefinition>)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.state == CompileState::PendingCompilation && slot.binary.is_none()
            })
            .filter_map(|(index, slot)| slot.definition.clone().map(|def| (index, def)))
            .collect();

        let compiled = {
            let compiler = &self.compiler;
            let options = &self.options;

            easy_parallel::Parallel::new()
                .each(jobs.into_iter(), |(index, definition)| {
                    let source = material_library_source(
                        &definition,
                        options,
                        definition.id == DEFAULT_SHADER_ID,
                    );
                    (index, compiler.compile_library(&definition.id, &source))
                })
                .run()
        };

        let mut first_error = None;
        for (index, result) in compiled {
            let slot = &mut self.slots[index];
            match result {
                Ok(shader) => {
                    info!("Compiled material shader {:?}", slot.id().unwrap_or_default());
                    slot.binary = Some(shader.spirv);
                }
                Err(err) => {
                    error!(
                        "Material shader {:?} failed to compile: {}",
                        slot.id().unwrap_or_default(),
                        err
                    );
                    slot.state = CompileState::CompilationFailed;
                    if first_error.is_none() {
                        first_error = Some(RenderError::ShaderCompilation {
                            name: slot.id().unwrap_or_default().to_owned(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        for slot in &mut self.slots {
            if slot.state == CompileState::PendingCompilation && slot.binary.is_some() {
                slot.state = CompileState::CompiledSuccessfully;
            }
        }
        Ok(())
    }

    fn link(&mut self) -> Result<(), RenderError> {
        let mut libraries = Vec::new();
        let mut groups = Vec::new();
        let mut hit_groups = Vec::new();
        let mut layer_miss_groups = Vec::new();

        for slot in &self.slots {
            let (definition, binary) = match (&slot.definition, &slot.binary) {
                (Some(definition), Some(binary)) if slot.state == CompileState::CompiledSuccessfully => {
                    (definition, binary)
                }
                _ => continue,
            };

            let is_default = definition.id == DEFAULT_SHADER_ID;
            let exports: Vec<EntryPoint> = EntryPoint::ALL
                .iter()
                .copied()
                .filter(|entry| is_default || !EntryPoint::SHARED.contains(entry))
                .collect();

            let library = libraries.len();
            libraries.push(ShaderLibraryDesc {
                name: definition.id.clone(),
                code: binary.clone(),
                entry_points: exports.iter().map(|e| e.export_name().to_owned()).collect(),
            });

            let export = |entry: EntryPoint| ShaderExport {
                library,
                entry_point: entry.export_name().to_owned(),
            };
            let is_referenced = |entry: EntryPoint| slot.refcounts[entry.index()] > 0;

            if is_default {
                for (name, kind, entry) in [
                    (RAY_GEN_GROUP, GeneralShaderKind::RayGen, EntryPoint::RayGen),
                    (BACKGROUND_MISS_GROUP, GeneralShaderKind::Miss, EntryPoint::BackgroundMiss),
                    (RADIANCE_MISS_GROUP, GeneralShaderKind::Miss, EntryPoint::RadianceMiss),
                    (SHADOW_MISS_GROUP, GeneralShaderKind::Miss, EntryPoint::ShadowMiss),
                ] {
                    groups.push(ShaderGroupDesc::General {
                        name: name.to_owned(),
                        kind,
                        shader: export(entry),
                    });
                }
            }

            let closest_hit = is_referenced(EntryPoint::RadianceHit).then(|| export(EntryPoint::RadianceHit));
            let any_hit = is_referenced(EntryPoint::ShadowAnyHit).then(|| export(EntryPoint::ShadowAnyHit));
            if closest_hit.is_some() || any_hit.is_some() {
                let name = hit_group_name(&definition.id);
                groups.push(ShaderGroupDesc::TrianglesHit {
                    name: name.clone(),
                    closest_hit,
                    any_hit,
                });
                hit_groups.push(name);
            }

            if is_referenced(EntryPoint::LayerMiss) {
                let name = layer_miss_group_name(&definition.id);
                groups.push(ShaderGroupDesc::General {
                    name: name.clone(),
                    kind: GeneralShaderKind::Miss,
                    shader: export(EntryPoint::LayerMiss),
                });
                layer_miss_groups.push(name);
            }
        }

        if !groups.iter().any(|group| group.name() == RAY_GEN_GROUP) {
            return Err(RenderError::invalid_argument(
                "the default material shader must be live before the pipeline is built",
            ));
        }

        let mut local_root_associations = vec![LocalRootAssociation {
            layout: LocalRootLayout::RayGen,
            groups: vec![RAY_GEN_GROUP.to_owned()],
        }];
        if !hit_groups.is_empty() {
            local_root_associations.push(LocalRootAssociation {
                layout: LocalRootLayout::RadianceHit,
                groups: hit_groups,
            });
        }
        if !layer_miss_groups.is_empty() {
            local_root_associations.push(LocalRootAssociation {
                layout: LocalRootLayout::LayerMiss,
                groups: layer_miss_groups,
            });
        }

        let max_depth = self.device.properties().max_ray_recursion_depth;
        let desc = RayTracingPipelineDesc {
            name: "material shaders".to_owned(),
            max_pipeline_ray_recursion_depth: (self.options.trace_depth + 1).min(max_depth),
            libraries,
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_attribute_size: MAX_ATTRIBUTE_SIZE,
            global_root_parameters: GLOBAL_ROOT_PARAMETERS.to_vec(),
            groups,
            local_root_associations,
        };

        info!(
            "Linking ray tracing pipeline: {} libraries, {} groups",
            desc.libraries.len(),
            desc.groups.len()
        );

        self.pipeline = Some(self.device.create_ray_tracing_pipeline(desc)?);
        Ok(())
    }

    /// The linked pipeline. Must not be called while the library is dirty.
    pub fn pipeline(&mut self) -> &Arc<RayTracingPipeline> {
        assert!(
            !self.is_dirty(),
            "the shader library must be rebuilt before reading its pipeline"
        );
        self.pipeline
            .as_ref()
            .unwrap_or_else(|| panic!("the shader library has no pipeline"))
    }

    pub fn shader_identifier(&mut self, group: &str) -> Option<ShaderIdentifier> {
        self.pipeline().shader_identifier(group).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standard_surface;
    use aurora_backend::{headless::HeadlessDevice, shader_compiler::PassthroughShaderCompiler};

    fn library() -> (Arc<HeadlessDevice>, ShaderLibrary) {
        let headless = Arc::new(HeadlessDevice::new(3));
        let library = ShaderLibrary::new(
            Device::new(headless.clone()),
            Arc::new(PassthroughShaderCompiler),
        );
        (headless, library)
    }

    fn default_shader(library: &mut ShaderLibrary) -> Arc<MaterialShader> {
        let shader = library.acquire(Arc::new(standard_surface::shader_definition()));
        for entry in EntryPoint::SHARED {
            library.increment_refcount(DEFAULT_SHADER_ID, entry);
        }
        shader
    }

    fn custom_definition(source: &str) -> Arc<MaterialShaderDefinition> {
        let definition = standard_surface::shader_definition();
        Arc::new(MaterialShaderDefinition::new(
            source,
            definition.uniforms.clone(),
            vec![],
            false,
        ))
    }

    #[test]
    fn acquiring_the_same_definition_shares_a_slot() {
        let (_, mut library) = library();
        let definition = custom_definition("void evaluate_material() {}");

        let shaders: Vec<_> = (0..5).map(|_| library.acquire(definition.clone())).collect();
        assert!(shaders.iter().all(|s| Arc::ptr_eq(s, &shaders[0])));
        assert_eq!(library.live_shader_count(), 1);

        let slot = shaders[0].slot();
        drop(shaders);
        assert_eq!(library.state(slot), CompileState::PendingRemoval);
    }

    #[test]
    fn content_hash_distinguishes_sources() {
        let a = custom_definition("a");
        let b = custom_definition("b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, custom_definition("a").id);
    }

    #[test]
    fn refcount_round_trip() {
        let (headless, mut library) = library();
        let _default = default_shader(&mut library);
        library.rebuild().unwrap();

        let shader = library.acquire(custom_definition("shader s"));
        let id = shader.id().to_owned();
        let slot = shader.slot();

        library.increment_refcount(&id, EntryPoint::RadianceHit);
        library.increment_refcount(&id, EntryPoint::ShadowAnyHit);
        assert!(library.is_dirty());

        library.rebuild().unwrap();
        assert_eq!(library.state(slot), CompileState::CompiledSuccessfully);
        assert!(library.shader_identifier(&hit_group_name(&id)).is_some());

        library.decrement_refcount(&id, EntryPoint::RadianceHit);
        assert!(library.is_dirty());

        library.rebuild().unwrap();
        let desc = headless.log().ray_tracing_pipelines.last().cloned().unwrap();
        match desc.group(&hit_group_name(&id)) {
            Some(ShaderGroupDesc::TrianglesHit {
                closest_hit,
                any_hit,
                ..
            }) => {
                assert!(closest_hit.is_none());
                assert!(any_hit.is_some());
            }
            other => panic!("unexpected hit group {:?}", other),
        }
        assert!(desc.libraries.iter().any(|lib| lib.name == id));

        library.decrement_refcount(&id, EntryPoint::ShadowAnyHit);
        drop(shader);
        assert_eq!(library.state(slot), CompileState::PendingRemoval);

        library.rebuild().unwrap();
        assert!(library.free_slots().contains(&slot));
        assert!(library.get(&id).is_none());
        assert!(!library.is_dirty());
    }

    #[test]
    #[should_panic]
    fn refcount_never_goes_negative() {
        let (_, mut library) = library();
        let shader = library.acquire(custom_definition("s"));
        library.decrement_refcount(shader.id(), EntryPoint::RadianceHit);
    }

    #[test]
    #[should_panic]
    fn reading_the_pipeline_while_dirty_panics() {
        let (_, mut library) = library();
        let _default = default_shader(&mut library);
        let _ = library.pipeline();
    }

    #[test]
    fn layer_miss_groups_follow_refcounts() {
        let (headless, mut library) = library();
        let _default = default_shader(&mut library);
        let shader = library.acquire(custom_definition("layer"));
        let id = shader.id().to_owned();

        library.increment_refcount(&id, EntryPoint::LayerMiss);
        library.rebuild().unwrap();

        let desc = headless.log().ray_tracing_pipelines.last().cloned().unwrap();
        assert!(desc.group(&layer_miss_group_name(&id)).is_some());
        assert!(desc.group(&hit_group_name(&id)).is_none());
        assert!(desc
            .local_root_associations
            .iter()
            .any(|a| a.layout == LocalRootLayout::LayerMiss));
    }

    #[test]
    fn option_changes_recompile() {
        let (_, mut library) = library();
        let default = default_shader(&mut library);
        library.rebuild().unwrap();
        assert!(!library.is_dirty());

        library.set_options(ShaderOptions {
            trace_depth: 2,
            ..Default::default()
        });
        assert_eq!(library.state(default.slot()), CompileState::PendingCompilation);
        library.rebuild().unwrap();
        assert_eq!(
            library.pipeline().desc.max_pipeline_ray_recursion_depth,
            3
        );
    }
}
