//! Linear Scratch Allocation
//!
//! Per-frame scratch buffers (vertex/index/uniform data that lives for one
//! frame) are bump-allocated out of a few large backing blocks instead of
//! being individually created. One [`LinearScratch`] exists per (memory
//! class, buffer usage, frame slot), held in the per-frame cache; at frame
//! entry every block's cursor is rewound to zero and blocks that sat idle
//! for too long are released back to the device.
//!
//! Host-visible classes are persistently mapped: a sub-allocation's mapped
//! pointer is `block_base + offset` and is the caller's writable pointer.
//! Device-local scratch takes the staging route through the transfer pump.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{GpuDevice, MemoryBlock, MemoryBlockDesc};
use crate::errors::Result;
use crate::types::{Buffer, BufferUsage, MemoryUsage};

/// Key of one linear allocator inside the per-frame cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LinearScratchKey {
    pub memory: MemoryUsage,
    pub usage: BufferUsage,
}

struct ScratchBlock {
    block: MemoryBlock,
    cursor: u64,
    last_use_frame: u64,
}

struct LinearInner {
    memory: MemoryUsage,
    usage: BufferUsage,
    block_size: u64,
    blocks: Vec<ScratchBlock>,
}

/// A bump allocator over large backing blocks of one memory class.
///
/// Clones share state: the per-frame cache clones the allocator out to each
/// acquiring thread, so the interior is a shared mutex.
#[derive(Clone)]
pub struct LinearScratch {
    inner: Arc<Mutex<LinearInner>>,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

impl LinearScratch {
    #[must_use]
    pub fn new(memory: MemoryUsage, usage: BufferUsage, block_size: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinearInner {
                memory,
                usage,
                block_size,
                blocks: Vec::new(),
            })),
        }
    }

    /// Sub-allocates `size` bytes at `alignment` from the first block with
    /// room, requesting a new block from the device when none fits.
    ///
    /// `buffer_id` is the unique id stamped onto the returned [`Buffer`].
    /// Sub-allocations never overlap, and every sub-buffer dies with its
    /// block when the owning frame slot recycles.
    pub fn allocate(
        &self,
        device: &dyn GpuDevice,
        size: u64,
        alignment: u64,
        frame: u64,
        buffer_id: u64,
    ) -> Result<Buffer> {
        let mut inner = self.inner.lock();
        let (memory, usage) = (inner.memory, inner.usage);

        for block in &mut inner.blocks {
            let offset = align_up(block.cursor, alignment);
            if offset + size <= block.block.size {
                block.cursor = offset + size;
                block.last_use_frame = frame;
                return Ok(sub_buffer(block, offset, size, usage, memory, buffer_id));
            }
        }

        // No room: request a fresh block, oversize allocations get a
        // dedicated one.
        let capacity = inner.block_size.max(size);
        let block = device.create_memory_block(&MemoryBlockDesc {
            size: capacity,
            usage,
            memory,
        })?;
        log::debug!(
            "scratch: new {memory:?} block of {capacity} bytes ({} total)",
            inner.blocks.len() + 1
        );
        inner.blocks.push(ScratchBlock { block, cursor: size, last_use_frame: frame });
        let block = inner.blocks.last().expect("just pushed");
        Ok(sub_buffer(block, 0, size, usage, memory, buffer_id))
    }

    /// Rewinds every block cursor and releases blocks unused for more than
    /// `idle_threshold` frames. Called at frame entry for the owning slot.
    pub fn reset(&self, device: &dyn GpuDevice, frame: u64, idle_threshold: u64) {
        let mut inner = self.inner.lock();
        inner.blocks.retain_mut(|block| {
            block.cursor = 0;
            if frame.saturating_sub(block.last_use_frame) > idle_threshold {
                log::debug!("scratch: releasing idle block of {} bytes", block.block.size);
                device.destroy_memory_block(block.block.handle);
                false
            } else {
                true
            }
        });
    }

    /// Releases every backing block. Teardown path.
    pub fn release(&self, device: &dyn GpuDevice) {
        let mut inner = self.inner.lock();
        for block in inner.blocks.drain(..) {
            device.destroy_memory_block(block.block.handle);
        }
    }
}

fn sub_buffer(
    block: &ScratchBlock,
    offset: u64,
    size: u64,
    usage: BufferUsage,
    memory: MemoryUsage,
    buffer_id: u64,
) -> Buffer {
    Buffer {
        block: block.block.handle,
        buffer_id,
        offset,
        size,
        usage,
        memory,
        mapped_ptr: block
            .block
            .mapped_base
            .map(|base| unsafe { base.add(offset as usize) }),
        owns_block: false,
    }
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 256), 256);
    }
}
