use crate::{
    error::RenderError,
    transfer_buffer::{PendingUploads, TransferBuffer},
};
use aurora_backend::{
    ash::vk,
    bytes::{align_up, align_up_usize},
    ray_tracing::ACCELERATION_STRUCTURE_ALIGNMENT,
    Buffer, BufferDesc, Device, ResourceState,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

pub const ARENA_SIZE: usize = 4 * 1024 * 1024;

/// Scratch memory for acceleration structure builds.
pub struct ScratchAllocation {
    pub buffer: Arc<Buffer>,
    pub device_address: u64,
}

/// Hands out acceleration structure scratch memory from 4 MiB arenas.
///
/// Full arenas and oversized dedicated buffers are retired to the task slot
/// that was current when they were handed out, and freed once that slot comes
/// around again.
pub struct ScratchBufferPool {
    device: Device,
    current: Option<Arc<Buffer>>,
    offset: u64,
    task_index: usize,
    retired: Vec<Vec<Arc<Buffer>>>,
}

impl ScratchBufferPool {
    pub fn new(device: Device, task_count: usize) -> Self {
        Self {
            device,
            current: None,
            offset: 0,
            task_index: 0,
            retired: (0..task_count).map(|_| Vec::new()).collect(),
        }
    }

    fn create_arena(&self, size: usize, name: &str) -> Result<Arc<Buffer>, RenderError> {
        Ok(self.device.create_buffer(
            BufferDesc::new_gpu_only(size, vk::BufferUsageFlags::STORAGE_BUFFER)
                .alignment(ACCELERATION_STRUCTURE_ALIGNMENT),
            name,
        )?)
    }

    pub fn get(&mut self, size: u64) -> Result<ScratchAllocation, RenderError> {
        if size > ARENA_SIZE as u64 {
            let buffer = self.create_arena(size as usize, "scratch (dedicated)")?;
            trace!("Dedicated scratch buffer of {} bytes", size);
            self.retired[self.task_index].push(buffer.clone());
            return Ok(ScratchAllocation {
                device_address: buffer.device_address(),
                buffer,
            });
        }

        if self.current.is_some() && self.offset + size > ARENA_SIZE as u64 {
            let full = self.current.take();
            self.retired[self.task_index].extend(full);
        }

        let arena = match &self.current {
            Some(arena) => arena.clone(),
            None => {
                let arena = self.create_arena(ARENA_SIZE, "scratch arena")?;
                self.current = Some(arena.clone());
                self.offset = 0;
                arena
            }
        };

        let device_address = align_up(
            arena.device_address() + self.offset,
            ACCELERATION_STRUCTURE_ALIGNMENT,
        );
        self.offset = device_address - arena.device_address() + size;
        self.offset = align_up(self.offset, ACCELERATION_STRUCTURE_ALIGNMENT);

        Ok(ScratchAllocation {
            buffer: arena,
            device_address,
        })
    }

    /// Frees everything retired to `task_index` and makes it the current slot.
    pub fn advance_task(&mut self, task_index: usize) {
        self.retired[task_index].clear();
        self.task_index = task_index;
    }

    pub fn retired_count(&self, task_index: usize) -> usize {
        self.retired[task_index].len()
    }
}

/// A range of a GPU vertex buffer. Holds the arena alive.
#[derive(Clone, Debug)]
pub struct VertexBufferSlice {
    pub buffer: Arc<Buffer>,
    pub offset: usize,
    pub size: usize,
}

impl VertexBufferSlice {
    pub fn device_address(&self) -> u64 {
        self.buffer.device_address() + self.offset as u64
    }
}

const VERTEX_ALIGNMENT: usize = 16;

fn vertex_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
}

/// Sub-allocates vertex and index data from 4 MiB upload arenas.
pub struct VertexBufferPool {
    device: Device,
    arena: Option<TransferBuffer>,
    offset: usize,
}

impl VertexBufferPool {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            arena: None,
            offset: 0,
        }
    }

    pub fn get(
        &mut self,
        data: &[u8],
        uploads: &PendingUploads,
    ) -> Result<VertexBufferSlice, RenderError> {
        let size = data.len();

        if size > ARENA_SIZE {
            let mut dedicated = TransferBuffer::new(
                &self.device,
                size,
                vertex_usage(),
                ResourceState::GenericRead,
                "vertex buffer (dedicated)",
            )?;
            dedicated.write(0, data, uploads);
            return Ok(VertexBufferSlice {
                buffer: dedicated.buffer().clone(),
                offset: 0,
                size,
            });
        }

        if self.offset + size > ARENA_SIZE {
            self.flush();
        }

        let mut arena = match self.arena.take() {
            Some(arena) => arena,
            None => TransferBuffer::new(
                &self.device,
                ARENA_SIZE,
                vertex_usage(),
                ResourceState::GenericRead,
                "vertex arena",
            )?,
        };

        let offset = self.offset;
        arena.write(offset, data, uploads);
        self.offset = align_up_usize(offset + size, VERTEX_ALIGNMENT);

        let slice = VertexBufferSlice {
            buffer: arena.buffer().clone(),
            offset,
            size,
        };
        self.arena = Some(arena);
        Ok(slice)
    }

    /// Starts a fresh arena for the next allocation. Data already written is
    /// queued for upload and stays alive through the slices handed out.
    pub fn flush(&mut self) {
        if self.arena.take().is_some() {
            trace!("Retiring vertex arena after {} bytes", self.offset);
        }
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_backend::headless::{HeadlessDevice, HeadlessResourceKind};

    #[test]
    fn scratch_arenas_retire_to_their_task() {
        let headless = Arc::new(HeadlessDevice::new(3));
        let mut pool = ScratchBufferPool::new(Device::new(headless.clone()), 3);

        let a = pool.get(1000).unwrap();
        let b = pool.get(1000).unwrap();
        assert_eq!(a.device_address % 256, 0);
        assert_eq!(b.device_address, a.device_address + 1024);
        assert!(Arc::ptr_eq(&a.buffer, &b.buffer));

        // Overflow retires the arena into slot 0.
        let c = pool.get(ARENA_SIZE as u64 - 100).unwrap();
        assert!(!Arc::ptr_eq(&a.buffer, &c.buffer));
        assert_eq!(pool.retired_count(0), 1);

        // Oversized requests get a dedicated buffer attributed to slot 1.
        pool.advance_task(1);
        let big = pool.get(ARENA_SIZE as u64 + 1).unwrap();
        assert_eq!(pool.retired_count(1), 1);

        drop((a, b, c, big));
        pool.advance_task(0);
        assert_eq!(pool.retired_count(0), 0);
        // The current arena stays alive.
        assert_eq!(headless.live_resource_count(HeadlessResourceKind::Buffer), 2);
    }

    #[test]
    fn vertex_slices_share_an_arena_and_are_aligned() {
        let headless = Arc::new(HeadlessDevice::new(3));
        let uploads = PendingUploads::default();
        let mut pool = VertexBufferPool::new(Device::new(headless));

        let a = pool.get(&[1u8; 12], &uploads).unwrap();
        let b = pool.get(&[2u8; 12], &uploads).unwrap();
        assert!(Arc::ptr_eq(&a.buffer, &b.buffer));
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16);

        // Both writes collapse into one pending copy of the arena.
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads.pending_range(a.buffer.id()), Some(0..28));

        pool.flush();
        let c = pool.get(&[3u8; 4], &uploads).unwrap();
        assert!(!Arc::ptr_eq(&a.buffer, &c.buffer));
        assert_eq!(uploads.len(), 2);
    }

    #[test]
    fn oversized_vertex_data_gets_a_dedicated_buffer() {
        let headless = Arc::new(HeadlessDevice::new(3));
        let uploads = PendingUploads::default();
        let mut pool = VertexBufferPool::new(Device::new(headless));

        let data = vec![0u8; ARENA_SIZE + 4];
        let slice = pool.get(&data, &uploads).unwrap();
        assert_eq!(slice.offset, 0);
        assert_eq!(slice.buffer.size(), ARENA_SIZE + 4);
    }
}
