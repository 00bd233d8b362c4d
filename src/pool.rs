//! Reusable Object Pools
//!
//! Command buffers, semaphores, fences and per-frame sampled images are
//! consumed in bulk every frame. A [`Pool`] keeps a bank of reusable
//! fixed-size *buckets* so a steady frame performs no GPU-object creation at
//! all: each worker thread takes one bucket per frame, fills it cursor-style,
//! and the bucket is rewound and recycled when the frame slot comes around
//! again.
//!
//! # Structure
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                   Pool<B>                     │
//! │                                               │
//! │  store:  [idle buckets]                       │
//! │  slots:  [in-use buckets; one list per frame  │
//! │           slot, FRAME_COUNT total]            │
//! │                                               │
//! │  take_bucket()        (thread entry)          │
//! │  retire_bucket(slot)  (thread exit)           │
//! │  reset_slot(slot)     (frame-slot re-entry)   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! A bucket is the exclusive property of the thread that took it until the
//! thread's context ends; `reset_slot` is called exactly once per transition
//! into a slot, before any bucket is taken on that slot.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::FRAME_COUNT;
use crate::device::GpuDevice;
use crate::errors::Result;
use crate::types::{
    CommandBufferHandle, CommandPoolHandle, FenceHandle, SampledImage, SemaphoreHandle,
};

// ============================================================================
// Bucket Contract
// ============================================================================

/// A reusable bucket of same-kind objects.
///
/// `reset` rewinds the bucket's cursor (and recycles per-bucket external
/// resources); `release` frees everything the bucket owns at pool teardown.
pub trait PoolBucket: Send {
    fn create(device: &dyn GpuDevice) -> Result<Self>
    where
        Self: Sized;
    fn reset(&mut self, device: &dyn GpuDevice);
    fn release(&mut self, device: &dyn GpuDevice);
}

// ============================================================================
// Pool
// ============================================================================

struct PoolInner<B> {
    store: Vec<B>,
    slots: [Vec<B>; FRAME_COUNT],
}

/// A bank of reusable buckets, parameterized by frame slot.
pub struct Pool<B: PoolBucket> {
    device: Arc<dyn GpuDevice>,
    inner: Mutex<PoolInner<B>>,
}

impl<B: PoolBucket> Pool<B> {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            inner: Mutex::new(PoolInner {
                store: Vec::new(),
                slots: std::array::from_fn(|_| Vec::new()),
            }),
        }
    }

    /// Takes one idle bucket, constructing a new one when the store is
    /// empty. The caller owns the bucket until it retires it.
    pub fn take_bucket(&self) -> Result<B> {
        if let Some(bucket) = self.inner.lock().store.pop() {
            return Ok(bucket);
        }
        B::create(&*self.device)
    }

    /// Returns a bucket into slot `slot`'s in-use list. It stays there,
    /// untouched, until the slot is re-entered and `reset_slot` recycles it.
    pub fn retire_bucket(&self, slot: usize, bucket: B) {
        self.inner.lock().slots[slot].push(bucket);
    }

    /// Resets every bucket held in `slot` and moves them back into the idle
    /// store. Called exactly once per transition into the slot, before any
    /// bucket is taken on it.
    pub fn reset_slot(&self, slot: usize) {
        let mut inner = self.inner.lock();
        let mut retired = std::mem::take(&mut inner.slots[slot]);
        for bucket in &mut retired {
            bucket.reset(&*self.device);
        }
        inner.store.append(&mut retired);
    }

    /// Visits every bucket currently retired into `slot`.
    pub fn for_each_in_slot(&self, slot: usize, mut f: impl FnMut(&B)) {
        let inner = self.inner.lock();
        for bucket in &inner.slots[slot] {
            f(bucket);
        }
    }
}

impl<B: PoolBucket> Drop for Pool<B> {
    fn drop(&mut self) {
        // Every bucket from every slot plus the store is freed exactly once.
        let inner = self.inner.get_mut();
        for bucket in &mut inner.store {
            bucket.release(&*self.device);
        }
        for slot in &mut inner.slots {
            for bucket in slot {
                bucket.release(&*self.device);
            }
        }
    }
}

// ============================================================================
// Command Buffer Buckets
// ============================================================================

/// A bucket of primary command buffers backed by one command pool.
///
/// Rewinding resets the command pool, which recycles every command buffer
/// issued from it in one call; already-allocated buffers are handed out
/// again on the next acquisition.
pub struct CommandBucket {
    pool: CommandPoolHandle,
    values: Vec<CommandBufferHandle>,
    needle: usize,
}

impl CommandBucket {
    /// Acquires `count` fresh primary command buffers.
    pub fn acquire(
        &mut self,
        device: &dyn GpuDevice,
        count: usize,
    ) -> Result<&[CommandBufferHandle]> {
        if self.values.len() < self.needle + count {
            let missing = (self.needle + count - self.values.len()) as u32;
            let mut fresh = device.allocate_command_buffers(self.pool, missing)?;
            self.values.append(&mut fresh);
        }
        let span = &self.values[self.needle..self.needle + count];
        self.needle += count;
        Ok(span)
    }

    /// Acquires a single command buffer.
    pub fn acquire_one(&mut self, device: &dyn GpuDevice) -> Result<CommandBufferHandle> {
        Ok(self.acquire(device, 1)?[0])
    }
}

impl PoolBucket for CommandBucket {
    fn create(device: &dyn GpuDevice) -> Result<Self> {
        Ok(Self { pool: device.create_command_pool()?, values: Vec::new(), needle: 0 })
    }

    fn reset(&mut self, device: &dyn GpuDevice) {
        device.reset_command_pool(self.pool);
        self.needle = 0;
    }

    fn release(&mut self, device: &dyn GpuDevice) {
        device.destroy_command_pool(self.pool);
        self.values.clear();
    }
}

// ============================================================================
// Semaphore & Fence Buckets
// ============================================================================

/// A bucket of binary semaphores.
pub struct SemaphoreBucket {
    values: Vec<SemaphoreHandle>,
    needle: usize,
}

impl SemaphoreBucket {
    pub fn acquire_one(&mut self, device: &dyn GpuDevice) -> Result<SemaphoreHandle> {
        if self.needle == self.values.len() {
            self.values.push(device.create_semaphore()?);
        }
        let value = self.values[self.needle];
        self.needle += 1;
        Ok(value)
    }
}

impl PoolBucket for SemaphoreBucket {
    fn create(_device: &dyn GpuDevice) -> Result<Self> {
        Ok(Self { values: Vec::new(), needle: 0 })
    }

    fn reset(&mut self, _device: &dyn GpuDevice) {
        self.needle = 0;
    }

    fn release(&mut self, device: &dyn GpuDevice) {
        for semaphore in self.values.drain(..) {
            device.destroy_semaphore(semaphore);
        }
    }
}

/// A bucket of fences. Fences issued during a frame are waited on when the
/// frame slot is re-entered, then unsignaled again by the bucket reset.
pub struct FenceBucket {
    values: Vec<FenceHandle>,
    needle: usize,
}

impl FenceBucket {
    pub fn acquire_one(&mut self, device: &dyn GpuDevice) -> Result<FenceHandle> {
        if self.needle == self.values.len() {
            self.values.push(device.create_fence()?);
        }
        let value = self.values[self.needle];
        self.needle += 1;
        Ok(value)
    }

    /// The fences handed out since the last reset.
    #[must_use]
    pub fn issued(&self) -> &[FenceHandle] {
        &self.values[..self.needle]
    }
}

impl PoolBucket for FenceBucket {
    fn create(_device: &dyn GpuDevice) -> Result<Self> {
        Ok(Self { values: Vec::new(), needle: 0 })
    }

    fn reset(&mut self, device: &dyn GpuDevice) {
        for fence in &self.values[..self.needle] {
            device.reset_fence(*fence);
        }
        self.needle = 0;
    }

    fn release(&mut self, device: &dyn GpuDevice) {
        for fence in self.values.drain(..) {
            device.destroy_fence(fence);
        }
    }
}

// ============================================================================
// Sampled Image Buckets
// ============================================================================

/// A bucket of view/sampler pairs registered for the current frame.
///
/// The pairs themselves own nothing (views belong to textures or transient
/// images, samplers to the sampler cache), so reset is a cursor rewind.
pub struct SampledImageBucket {
    values: Vec<SampledImage>,
    needle: usize,
}

impl SampledImageBucket {
    pub fn push(&mut self, sampled: SampledImage) -> SampledImage {
        if self.needle == self.values.len() {
            self.values.push(sampled);
        } else {
            self.values[self.needle] = sampled;
        }
        self.needle += 1;
        sampled
    }
}

impl PoolBucket for SampledImageBucket {
    fn create(_device: &dyn GpuDevice) -> Result<Self> {
        Ok(Self { values: Vec::new(), needle: 0 })
    }

    fn reset(&mut self, _device: &dyn GpuDevice) {
        self.needle = 0;
    }

    fn release(&mut self, _device: &dyn GpuDevice) {
        self.values.clear();
    }
}
