use crate::{
    context::RenderContext,
    error::RenderError,
    image::Image,
    properties::PropertyValue,
    sampler::Sampler,
    shader_library::{EntryPoint, MaterialShader, MaterialShaderDefinition},
    transfer_buffer::TransferBuffer,
    uniform_buffer::UniformBuffer,
};
use aurora_backend::{ash::vk, Buffer, ResourceState};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

/// Recomputes derived uniforms after a change and returns whether the
/// material is opaque.
pub type MaterialUpdateFn = fn(&mut UniformBuffer, &[TextureBinding]) -> bool;

/// A material type: its shader plus the defaults of its uniforms.
pub struct MaterialDefinition {
    pub shader: Arc<MaterialShaderDefinition>,
    /// Parallel to the shader's declared uniform fields.
    pub defaults: Arc<Vec<PropertyValue>>,
    pub update: Option<MaterialUpdateFn>,
}

/// A named texture slot of a material.
#[derive(Clone)]
pub struct TextureBinding {
    pub name: String,
    pub image: Option<Arc<Image>>,
    pub sampler: Option<Sampler>,
}

impl TextureBinding {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            image: None,
            sampler: None,
        }
    }
}

pub struct Material {
    ctx: Arc<RenderContext>,
    name: String,
    definition: Arc<MaterialDefinition>,
    shader: Arc<MaterialShader>,
    uniforms: UniformBuffer,
    textures: Vec<TextureBinding>,
    is_opaque: bool,
    uses_shadow_any_hit: bool,
    is_dirty: bool,
    constant_buffer: Option<TransferBuffer>,
}

impl Material {
    pub fn new(ctx: Arc<RenderContext>, name: &str, definition: Arc<MaterialDefinition>) -> Self {
        let shader = {
            let mut library = ctx.library.lock();
            let shader = library.acquire(definition.shader.clone());
            library.increment_refcount(shader.id(), EntryPoint::RadianceHit);
            shader
        };

        Self {
            uniforms: UniformBuffer::new(
                definition.shader.uniforms.clone(),
                definition.defaults.clone(),
            ),
            textures: definition
                .shader
                .texture_names
                .iter()
                .map(|name| TextureBinding::new(name))
                .collect(),
            ctx,
            name: name.to_owned(),
            shader,
            definition,
            is_opaque: true,
            uses_shadow_any_hit: false,
            is_dirty: true,
            constant_buffer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shader(&self) -> &Arc<MaterialShader> {
        &self.shader
    }

    pub fn definition(&self) -> &Arc<MaterialDefinition> {
        &self.definition
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn is_opaque(&self) -> bool {
        self.is_opaque
    }

    pub fn uniforms(&self) -> &UniformBuffer {
        &self.uniforms
    }

    pub fn textures(&self) -> &[TextureBinding] {
        &self.textures
    }

    pub fn is_texture_name(&self, name: &str) -> bool {
        self.textures.iter().any(|t| t.name == name)
    }

    fn texture_mut(&mut self, name: &str) -> Result<&mut TextureBinding, RenderError> {
        self.textures
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| RenderError::UnknownProperty {
                name: name.to_owned(),
            })
    }

    /// Fails exactly when `set` would, without changing anything.
    pub fn check(&self, name: &str, value: &PropertyValue) -> Result<(), RenderError> {
        if value.is_empty() {
            if self.uniforms.contains(name) {
                Ok(())
            } else {
                Err(RenderError::UnknownProperty {
                    name: name.to_owned(),
                })
            }
        } else {
            self.uniforms.check(name, value).map(|_| ())
        }
    }

    /// Sets a uniform; `Empty` restores its default.
    pub fn set(&mut self, name: &str, value: &PropertyValue) -> Result<(), RenderError> {
        if value.is_empty() {
            self.uniforms.reset(name)?;
        } else {
            self.uniforms.set(name, value)?;
        }
        self.is_dirty = true;
        Ok(())
    }

    pub fn get<T: crate::properties::FromPropertyValue + Default>(&self, name: &str) -> T {
        self.uniforms.get(name)
    }

    pub fn set_image(&mut self, name: &str, image: Option<Arc<Image>>) -> Result<(), RenderError> {
        self.texture_mut(name)?.image = image;
        self.is_dirty = true;
        Ok(())
    }

    pub fn set_sampler(&mut self, name: &str, sampler: Option<Sampler>) -> Result<(), RenderError> {
        self.texture_mut(name)?.sampler = sampler;
        self.is_dirty = true;
        Ok(())
    }

    /// Flushes changed values to the GPU. Returns `false` when nothing changed.
    pub fn update(&mut self) -> Result<bool, RenderError> {
        if !self.is_dirty {
            return Ok(false);
        }

        if let Some(update) = self.definition.update {
            self.is_opaque = update(&mut self.uniforms, &self.textures);
        }

        // The shadow any-hit entry only runs for materials that let light through.
        let wants_any_hit = !self.is_opaque && !self.definition.shader.is_always_opaque;
        if wants_any_hit != self.uses_shadow_any_hit {
            let mut library = self.ctx.library.lock();
            if wants_any_hit {
                library.increment_refcount(self.shader.id(), EntryPoint::ShadowAnyHit);
            } else {
                library.decrement_refcount(self.shader.id(), EntryPoint::ShadowAnyHit);
            }
            self.uses_shadow_any_hit = wants_any_hit;
        }

        if self.constant_buffer.is_none() {
            self.constant_buffer = Some(TransferBuffer::new(
                &self.ctx.device,
                self.uniforms.size().max(16),
                vk::BufferUsageFlags::STORAGE_BUFFER,
                ResourceState::GenericRead,
                &format!("{} (constants)", self.name),
            )?);
        }

        if let Some(buffer) = &mut self.constant_buffer {
            buffer.write(0, self.uniforms.data(), &self.ctx.uploads);
        }

        trace!("Flushed material {:?}", self.name);
        self.is_dirty = false;
        Ok(true)
    }

    pub fn constant_buffer(&self) -> Option<&Arc<Buffer>> {
        self.constant_buffer.as_ref().map(TransferBuffer::buffer)
    }

    pub fn constant_buffer_address(&self) -> u64 {
        self.constant_buffer()
            .map(|buffer| buffer.device_address())
            .unwrap_or(0)
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        let mut library = self.ctx.library.lock();
        library.decrement_refcount(self.shader.id(), EntryPoint::RadianceHit);
        if self.uses_shadow_any_hit {
            library.decrement_refcount(self.shader.id(), EntryPoint::ShadowAnyHit);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::standard_surface;
    use aurora_backend::{
        headless::HeadlessDevice, shader_compiler::PassthroughShaderCompiler, Device, ImageDesc,
    };
    use glam::Vec3;

    pub(crate) fn dummy_image() -> Arc<Image> {
        let device = Device::new(Arc::new(HeadlessDevice::new(3)));
        let texture = device
            .create_image(
                ImageDesc::new_2d(vk::Format::R8G8B8A8_UNORM, [1, 1]),
                "dummy",
            )
            .unwrap();
        Arc::new(Image {
            name: "dummy".to_owned(),
            texture,
            is_environment: false,
            alias_map: None,
            luminance_integral: 0.0,
        })
    }

    fn context() -> Arc<RenderContext> {
        RenderContext::new(
            Device::new(Arc::new(HeadlessDevice::new(3))),
            Arc::new(PassthroughShaderCompiler),
            3,
        )
    }

    #[test]
    fn dirty_flush_uploads_once() {
        let ctx = context();
        let mut material = Material::new(
            ctx.clone(),
            "/materials/red",
            Arc::new(standard_surface::material_definition()),
        );

        material
            .set("base_color", &Vec3::new(1.0, 0.5, 0.2).into())
            .unwrap();

        assert!(material.update().unwrap());
        let destination = material.constant_buffer().unwrap().id();
        assert_eq!(ctx.uploads.pending_destinations(), vec![destination]);

        let mut list = aurora_backend::CommandList::new("drain");
        list.begin();
        assert_eq!(ctx.uploads.record(&mut list), 1);
        list.close();

        assert!(!material.update().unwrap());
        assert!(ctx.uploads.is_empty());
        assert_eq!(material.get::<Vec3>("base_color"), Vec3::new(1.0, 0.5, 0.2));
    }

    #[test]
    fn transparency_toggles_shadow_any_hit() {
        let ctx = context();
        let mut material = Material::new(
            ctx.clone(),
            "/materials/glass",
            Arc::new(standard_surface::material_definition()),
        );
        let id = material.shader().id().to_owned();

        assert_eq!(ctx.library.lock().refcount(&id, EntryPoint::RadianceHit), 1);

        material.set("transmission", &PropertyValue::Float(1.0)).unwrap();
        material.update().unwrap();
        assert!(!material.is_opaque());
        assert_eq!(ctx.library.lock().refcount(&id, EntryPoint::ShadowAnyHit), 1);

        material.set("transmission", &PropertyValue::Empty).unwrap();
        material.update().unwrap();
        assert!(material.is_opaque());
        assert_eq!(ctx.library.lock().refcount(&id, EntryPoint::ShadowAnyHit), 0);

        drop(material);
        assert_eq!(ctx.library.lock().refcount(&id, EntryPoint::RadianceHit), 0);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let ctx = context();
        let mut material = Material::new(
            ctx,
            "/materials/m",
            Arc::new(standard_surface::material_definition()),
        );
        assert!(material.set("no_such_field", &PropertyValue::Float(1.0)).is_err());
        assert!(material.set("base", &PropertyValue::Int(1)).is_err());
        assert!(material.set_image("no_such_image", None).is_err());
    }
}
