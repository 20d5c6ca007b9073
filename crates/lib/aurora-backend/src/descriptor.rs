use crate::{
    device::RenderDevice,
    resource::{Image, ResourceId, Sampler},
    BackendError,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Storage and sampled images.
    Resources,
    Samplers,
}

/// A single heap slot. `Null` slots read as "no texture" in shaders.
#[derive(Clone, Debug)]
pub enum Descriptor {
    Null,
    StorageImage(Arc<Image>),
    SampledImage(Arc<Image>),
    Sampler(Arc<Sampler>),
}

impl Descriptor {
    pub fn is_null(&self) -> bool {
        matches!(self, Descriptor::Null)
    }
}

/// A shader-visible descriptor heap. Slots are addressed by index; the index of
/// a slot is what shader records carry as a heap handle.
pub struct DescriptorHeap {
    pub kind: DescriptorHeapKind,
    id: ResourceId,
    slots: Mutex<Vec<Descriptor>>,
    device: Arc<dyn RenderDevice>,
}

impl DescriptorHeap {
    pub(crate) fn new(
        device: Arc<dyn RenderDevice>,
        kind: DescriptorHeapKind,
        id: ResourceId,
        len: usize,
    ) -> Self {
        Self {
            kind,
            id,
            slots: Mutex::new(vec![Descriptor::Null; len]),
            device,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slot(&self, index: usize) -> Option<Descriptor> {
        self.slots.lock().get(index).cloned()
    }

    /// Overwrite `descriptors.len()` slots starting at `start`.
    ///
    /// Must not be called while a command list referencing the heap is in flight.
    pub fn write(&self, start: usize, descriptors: &[Descriptor]) -> Result<(), BackendError> {
        let mut slots = self.slots.lock();
        if start + descriptors.len() > slots.len() {
            return Err(BackendError::ResourceAccess {
                info: format!(
                    "descriptor write [{}, {}) exceeds heap of {} slots",
                    start,
                    start + descriptors.len(),
                    slots.len()
                ),
            });
        }

        for descriptor in descriptors {
            let valid = match (self.kind, descriptor) {
                (_, Descriptor::Null) => true,
                (DescriptorHeapKind::Resources, Descriptor::StorageImage(_)) => true,
                (DescriptorHeapKind::Resources, Descriptor::SampledImage(_)) => true,
                (DescriptorHeapKind::Samplers, Descriptor::Sampler(_)) => true,
                _ => false,
            };
            if !valid {
                return Err(BackendError::ResourceAccess {
                    info: format!("{:?} cannot live in a {:?} heap", descriptor, self.kind),
                });
            }
        }

        self.device
            .write_descriptors(self.id, self.kind, start, descriptors)?;
        slots[start..start + descriptors.len()].clone_from_slice(descriptors);
        Ok(())
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

impl std::fmt::Debug for DescriptorHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorHeap")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}
