use aurora_backend::{
    ash::vk, Buffer, BufferDesc, CommandList, Device, ResourceId, ResourceState,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, ops::Range, sync::Arc};

use crate::error::RenderError;

/// A CPU-visible upload buffer paired with the GPU buffer it feeds.
///
/// Writes go through `map`/`unmap`; unmapping enqueues the written range into
/// the renderer's `PendingUploads`, which copies it over on the next drain.
pub struct TransferBuffer {
    upload: Arc<Buffer>,
    gpu: Arc<Buffer>,
    final_state: ResourceState,
    mapped_range: Option<Range<usize>>,
}

impl TransferBuffer {
    pub fn new(
        device: &Device,
        size: usize,
        usage: vk::BufferUsageFlags,
        final_state: ResourceState,
        name: &str,
    ) -> Result<Self, RenderError> {
        let upload = device.create_buffer(
            BufferDesc::new_cpu_to_gpu(size, vk::BufferUsageFlags::TRANSFER_SRC),
            format!("{} (upload)", name),
        )?;
        let gpu = device.create_buffer(
            BufferDesc::new_gpu_only(size, usage | vk::BufferUsageFlags::TRANSFER_DST),
            name,
        )?;

        Ok(Self {
            upload,
            gpu,
            final_state,
            mapped_range: None,
        })
    }

    pub fn size(&self) -> usize {
        self.gpu.size()
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.gpu
    }

    pub fn final_state(&self) -> ResourceState {
        self.final_state
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_range.is_some()
    }

    /// Maps `size` bytes at `offset` for writing.
    pub fn map(&mut self, size: usize, offset: usize) -> &mut [u8] {
        assert!(
            self.mapped_range.is_none(),
            "transfer buffer {:?} is already mapped",
            self.gpu.name
        );
        assert!(offset + size <= self.size());

        self.mapped_range = Some(offset..offset + size);
        // Exclusive through `&mut self` until `unmap`.
        unsafe { self.upload.mapped_slice_mut(offset, size) }
    }

    pub fn unmap(&mut self, uploads: &PendingUploads) {
        let range = self
            .mapped_range
            .take()
            .unwrap_or_else(|| panic!("transfer buffer {:?} is not mapped", self.gpu.name));

        uploads.enqueue(PendingUpload {
            upload: self.upload.clone(),
            gpu: self.gpu.clone(),
            final_state: self.final_state,
            range,
        });
    }

    pub fn write(&mut self, offset: usize, data: &[u8], uploads: &PendingUploads) {
        self.map(data.len(), offset).copy_from_slice(data);
        self.unmap(uploads);
    }
}

struct PendingUpload {
    upload: Arc<Buffer>,
    gpu: Arc<Buffer>,
    final_state: ResourceState,
    range: Range<usize>,
}

/// Dirty transfer buffers waiting for their copy, keyed by destination.
#[derive(Default)]
pub struct PendingUploads {
    pending: Mutex<BTreeMap<ResourceId, PendingUpload>>,
    retained: Mutex<Vec<PendingUpload>>,
}

impl PendingUploads {
    fn enqueue(&self, upload: PendingUpload) {
        let mut pending = self.pending.lock();
        match pending.get_mut(&upload.gpu.id()) {
            Some(existing) => {
                existing.range = existing.range.start.min(upload.range.start)
                    ..existing.range.end.max(upload.range.end);
            }
            None => {
                pending.insert(upload.gpu.id(), upload);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Destination buffers with a pending copy, in drain order.
    pub fn pending_destinations(&self) -> Vec<ResourceId> {
        self.pending.lock().keys().copied().collect()
    }

    /// The merged dirty range of `destination`, if it has a pending copy.
    pub fn pending_range(&self, destination: ResourceId) -> Option<Range<usize>> {
        self.pending
            .lock()
            .get(&destination)
            .map(|upload| upload.range.clone())
    }

    /// Records a copy for every pending destination, bracketed by transitions
    /// out of and back into its final state. The drained buffers stay
    /// retained until the next call. Returns the number of copies recorded.
    pub fn record(&self, list: &mut CommandList) -> usize {
        let drained = std::mem::take(&mut *self.pending.lock());

        for upload in drained.values() {
            let size = (upload.range.end - upload.range.start) as u64;
            if size == 0 {
                continue;
            }

            list.transition(&upload.gpu, upload.final_state, ResourceState::CopyDest);
            list.copy_buffer(
                &upload.upload,
                upload.range.start as u64,
                &upload.gpu,
                upload.range.start as u64,
                size,
            );
            list.transition(&upload.gpu, ResourceState::CopyDest, upload.final_state);
        }

        let count = drained.len();
        *self.retained.lock() = drained.into_values().collect();
        count
    }

    pub fn retained_count(&self) -> usize {
        self.retained.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_backend::headless::{HeadlessDevice, RecordedCommand};

    fn device() -> (Arc<HeadlessDevice>, Device) {
        let headless = Arc::new(HeadlessDevice::new(3));
        (headless.clone(), Device::new(headless))
    }

    #[test]
    fn remapping_merges_dirty_ranges() {
        let (_, device) = device();
        let uploads = PendingUploads::default();
        let mut buffer = TransferBuffer::new(
            &device,
            256,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            ResourceState::ConstantBuffer,
            "constants",
        )
        .unwrap();

        buffer.write(64, &[1; 16], &uploads);
        buffer.write(16, &[2; 8], &uploads);

        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads.pending_range(buffer.buffer().id()), Some(16..80));
    }

    #[test]
    #[should_panic]
    fn double_map_panics() {
        let (_, device) = device();
        let mut buffer = TransferBuffer::new(
            &device,
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            ResourceState::ConstantBuffer,
            "constants",
        )
        .unwrap();

        buffer.map(4, 0);
        buffer.map(4, 0);
    }

    #[test]
    fn drained_uploads_copy_and_are_retained() {
        let (headless, device) = device();
        let uploads = PendingUploads::default();
        let mut buffer = TransferBuffer::new(
            &device,
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            ResourceState::ConstantBuffer,
            "constants",
        )
        .unwrap();

        buffer.write(8, &[7, 7, 7, 7], &uploads);

        let mut list = CommandList::new("upload");
        list.begin();
        assert_eq!(uploads.record(&mut list), 1);
        list.close();
        device.submit(0, &list).unwrap();

        assert!(uploads.is_empty());
        assert_eq!(uploads.retained_count(), 1);
        assert_eq!(
            headless.read_resource(buffer.buffer().id(), 8, 4),
            vec![7, 7, 7, 7]
        );

        let commands = &headless.log().submissions[0].commands;
        assert!(matches!(
            commands[0],
            RecordedCommand::Transition {
                before: ResourceState::ConstantBuffer,
                after: ResourceState::CopyDest,
                ..
            }
        ));
        assert!(matches!(
            commands[1],
            RecordedCommand::CopyBuffer {
                src_offset: 8,
                dst_offset: 8,
                size: 4,
                ..
            }
        ));
    }
}
