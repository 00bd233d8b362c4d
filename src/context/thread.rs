//! The Thread-Scope Context
//!
//! A [`PerThreadContext`] is the user-facing API: one per worker thread per
//! frame. It owns a pool bucket of each kind exclusively (command buffers,
//! semaphores, fences, sampled images) plus small recycle vectors that are
//! flushed to the frame slot's destroy queues when the context drops.
//!
//! Scratch allocation, uploads, descriptor-set construction and pipeline
//! queries all flow through here.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytemuck::Pod;

use super::inflight::{ImageTransfer, PendingBatch};
use super::{Context, InflightContext, PersistentDescriptorSet, TransferTicket, Unique};
use crate::command::{DescriptorSetDesc, DescriptorSetValue};
use crate::device::{FramebufferDesc, GpuDevice, RenderPassDesc};
use crate::errors::Result;
use crate::graph::{TransientImage, TransientImageDesc};
use crate::per_frame_cache::MAX_THREADS;
use crate::pipeline::{GraphicsPipeline, PipelineBase, PipelineBaseDesc, PipelineInstanceDesc};
use crate::pool::{CommandBucket, FenceBucket, SampledImageBucket, SemaphoreBucket};
use crate::scratch::LinearScratchKey;
use crate::types::{
    Buffer, BufferUsage, Extent3D, FenceHandle, Format, FramebufferHandle, ImageBlit,
    ImageHandle, ImageLayout, ImageSubresourceLayers, ImageViewHandle, MemoryUsage, Offset3D,
    RenderPassHandle, SampledImage, SamplerDesc, SamplerHandle, SemaphoreHandle, Texture,
    mip_level_count,
};
use crate::types::{BufferImageCopy, Filter};

// ============================================================================
// Thread Indexing
// ============================================================================

static NEXT_THREAD_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_INDEX: usize =
        NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed) % MAX_THREADS;
}

/// A small dense index for the calling thread, in `[0, MAX_THREADS)`.
///
/// Indices are handed out from a process counter on first use and wrap into
/// the shard budget; threads past the budget share shards, which costs
/// contention but stays correct.
#[must_use]
pub fn thread_index() -> usize {
    THREAD_INDEX.with(|index| *index)
}

// ============================================================================
// PerThreadContext
// ============================================================================

/// A scoped view of one worker thread inside one frame. See module docs.
pub struct PerThreadContext<'ifc, 'ctx> {
    pub(crate) ctx: &'ctx Context,
    pub ifc: &'ifc InflightContext<'ctx>,
    /// The worker's dense thread index.
    pub tid: usize,

    // Bucket slots are `Some` from construction until drop, when the
    // buckets are retired into their pools' frame colonies.
    command_buffers: Option<CommandBucket>,
    semaphores: Option<SemaphoreBucket>,
    fences: Option<FenceBucket>,
    sampled_images: Option<SampledImageBucket>,

    // Short-term recycle vectors, flushed to the frame slot's destroy
    // queues on drop.
    recycle_buffers: Vec<Buffer>,
    recycle_images: Vec<ImageHandle>,
    recycle_image_views: Vec<ImageViewHandle>,
}

impl<'ifc, 'ctx> PerThreadContext<'ifc, 'ctx> {
    pub(crate) fn new(ifc: &'ifc InflightContext<'ctx>) -> Result<Self> {
        let ctx = ifc.context();
        Ok(Self {
            ctx,
            ifc,
            tid: thread_index(),
            command_buffers: Some(ctx.command_buffer_pool.take_bucket()?),
            semaphores: Some(ctx.semaphore_pool.take_bucket()?),
            fences: Some(ctx.fence_pool.take_bucket()?),
            sampled_images: Some(ctx.sampled_image_pool.take_bucket()?),
            recycle_buffers: Vec::new(),
            recycle_images: Vec::new(),
            recycle_image_views: Vec::new(),
        })
    }

    #[must_use]
    #[inline]
    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    #[must_use]
    #[inline]
    pub(crate) fn device(&self) -> &dyn GpuDevice {
        &**self.ctx.device()
    }

    // ── Pool acquisitions ──────────────────────────────────────────────────

    fn command_bucket(&mut self) -> &mut CommandBucket {
        self.command_buffers.as_mut().expect("bucket present until drop")
    }

    fn fence_bucket(&mut self) -> &mut FenceBucket {
        self.fences.as_mut().expect("bucket present until drop")
    }

    /// Acquires one fresh primary command buffer from the thread's bucket.
    pub fn acquire_command_buffer(&mut self) -> Result<crate::types::CommandBufferHandle> {
        let device = self.ctx.device().clone();
        self.command_bucket().acquire_one(&*device)
    }

    /// Acquires one semaphore valid for this frame.
    pub fn acquire_semaphore(&mut self) -> Result<SemaphoreHandle> {
        let device = self.ctx.device().clone();
        self.semaphores
            .as_mut()
            .expect("bucket present until drop")
            .acquire_one(&*device)
    }

    /// Acquires one fence valid for this frame. Fences acquired here are
    /// waited on when the frame slot is re-entered.
    pub fn acquire_fence(&mut self) -> Result<FenceHandle> {
        let device = self.ctx.device().clone();
        self.fence_bucket().acquire_one(&*device)
    }

    // ── Scratch allocation & uploads ───────────────────────────────────────

    /// Sub-allocates a one-frame scratch buffer. Host-visible classes come
    /// back mapped.
    pub fn allocate_scratch_buffer(
        &self,
        memory: MemoryUsage,
        usage: BufferUsage,
        size: u64,
        alignment: u64,
    ) -> Result<Buffer> {
        let key = LinearScratchKey { memory, usage };
        let frame = self.ifc.absolute_frame;
        let config = *self.ctx.config();
        let allocator = self.ctx.scratch_allocators.acquire(
            self.ifc.frame,
            self.tid,
            frame,
            &key,
            || Ok(crate::scratch::LinearScratch::new(memory, usage, config.scratch_block_size)),
        )?;
        allocator.allocate(self.device(), size, alignment, frame, self.ctx.next_unique_id())
    }

    /// Stages `data` and enqueues a copy into `dst`, returning the ticket
    /// to poll. Empty uploads complete immediately.
    pub fn upload_buffer<T: Pod>(&self, dst: Buffer, data: &[T]) -> Result<TransferTicket> {
        if data.is_empty() {
            return Ok(TransferTicket::READY);
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let staging = self.allocate_scratch_buffer(
            MemoryUsage::CpuOnly,
            BufferUsage::TRANSFER_SRC,
            bytes.len() as u64,
            1,
        )?;
        staging.write_mapped(bytes);
        Ok(self.ifc.enqueue_buffer_transfer(staging, dst))
    }

    /// Stages `data` and enqueues a copy into mip 0 of `dst`, optionally
    /// generating the remaining mip chain.
    pub fn upload_image<T: Pod>(
        &self,
        dst: ImageHandle,
        extent: Extent3D,
        data: &[T],
        generate_mips: bool,
    ) -> Result<TransferTicket> {
        if data.is_empty() {
            return Ok(TransferTicket::READY);
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let staging = self.allocate_scratch_buffer(
            MemoryUsage::CpuOnly,
            BufferUsage::TRANSFER_SRC,
            bytes.len() as u64,
            1,
        )?;
        staging.write_mapped(bytes);
        Ok(self.ifc.enqueue_image_transfer(staging, dst, extent, generate_mips))
    }

    /// Scratch-allocates a buffer that supports `usage` and fills it with
    /// `data` through the transfer pump. The buffer lives for this frame
    /// only.
    pub fn create_scratch_buffer<T: Pod>(
        &self,
        memory: MemoryUsage,
        usage: BufferUsage,
        data: &[T],
    ) -> Result<(Buffer, TransferTicket)> {
        let size = std::mem::size_of_val(data) as u64;
        let dst = self.allocate_scratch_buffer(
            memory,
            usage | BufferUsage::TRANSFER_DST,
            size.max(1),
            1,
        )?;
        let ticket = self.upload_buffer(dst, data)?;
        Ok((dst, ticket))
    }

    /// Allocates a lifetime-managed buffer and fills it through the
    /// transfer pump.
    pub fn create_buffer<T: Pod>(
        &self,
        memory: MemoryUsage,
        usage: BufferUsage,
        data: &[T],
    ) -> Result<(Unique<'ctx, Buffer>, TransferTicket)> {
        let size = (std::mem::size_of_val(data) as u64).max(1);
        let buffer =
            self.ctx
                .allocate_buffer(memory, usage | BufferUsage::TRANSFER_DST, size, 1)?;
        let ticket = self.upload_buffer(*buffer, data)?;
        Ok((buffer, ticket))
    }

    /// Allocates a sampled texture with a full mip chain and uploads
    /// `data` into it, generating mips via blits.
    pub fn create_texture(
        &self,
        format: Format,
        extent: Extent3D,
        data: &[u8],
        generate_mips: bool,
    ) -> Result<(Unique<'ctx, Texture>, TransferTicket)> {
        let mip_levels = if generate_mips { mip_level_count(extent) } else { 1 };
        let texture = self.ctx.allocate_texture(crate::device::ImageDesc {
            format,
            extent,
            mip_levels,
            array_layers: 1,
            samples: crate::types::Samples::X1,
            usage: crate::types::ImageUsage::SAMPLED
                | crate::types::ImageUsage::TRANSFER_DST
                | crate::types::ImageUsage::TRANSFER_SRC,
        })?;
        let ticket = self.upload_image(texture.image, extent, data, generate_mips)?;
        Ok((texture, ticket))
    }

    // ── Transfer pump ──────────────────────────────────────────────────────

    /// Whether `ticket`'s transfer is complete. Does not block.
    #[must_use]
    pub fn is_ready(&self, ticket: TransferTicket) -> bool {
        self.ifc.is_ready(ticket)
    }

    /// Drains the frame's transfer queues into one command buffer, submits
    /// it on the transfer queue and files the batch behind a fence. A no-op
    /// when nothing is queued.
    pub fn dma_task(&mut self) -> Result<()> {
        let (buffers, images) = self.ifc.drain_transfers();
        if buffers.is_empty() && images.is_empty() {
            return Ok(());
        }

        let device = self.ctx.device().clone();
        let cb = self.command_bucket().acquire_one(&*device)?;
        device.begin_command_buffer(cb)?;

        let mut last_ticket = 0_u64;
        for transfer in &buffers {
            device.cmd_copy_buffer(
                cb,
                transfer.src.block,
                transfer.src.offset,
                transfer.dst.block,
                transfer.dst.offset,
                transfer.src.size,
            );
            last_ticket = last_ticket.max(transfer.ticket.id());
        }
        for transfer in &images {
            record_image_upload(&*device, cb, transfer);
            last_ticket = last_ticket.max(transfer.ticket.id());
        }

        device.end_command_buffer(cb)?;
        let fence = self.fence_bucket().acquire_one(&*device)?;
        self.ctx.submit_transfer(&[cb], Some(fence))?;
        self.ifc.push_pending(PendingBatch { last_ticket, fence });
        Ok(())
    }

    /// Flushes the transfer queues, then waits on every pending batch in
    /// FIFO order, advancing the completion watermark after each fence.
    /// A no-op when nothing is pending.
    pub fn wait_all_transfers(&mut self) -> Result<()> {
        self.dma_task()?;
        while let Some(batch) = self.ifc.pop_pending() {
            self.device().wait_fences(&[batch.fence])?;
            self.ifc.advance_watermark(batch.last_ticket);
        }
        Ok(())
    }

    // ── Sampled images & descriptor sets ───────────────────────────────────

    /// Registers a view/sampler pair for this frame and returns it.
    pub fn make_sampled_image(
        &mut self,
        view: ImageViewHandle,
        sampler: SamplerDesc,
    ) -> Result<SampledImage> {
        let sampler = self.acquire_sampler(&sampler)?;
        Ok(self
            .sampled_images
            .as_mut()
            .expect("bucket present until drop")
            .push(SampledImage { view, sampler }))
    }

    /// Creates a persistent descriptor set for set `set_index` of a
    /// pipeline base, backed by its own descriptor pool. Queue writes on
    /// it, then commit them with
    /// [`PerThreadContext::commit_persistent_descriptor_set`].
    pub fn create_persistent_descriptor_set(
        &self,
        base: &PipelineBase,
        set_index: u32,
    ) -> Result<Unique<'ctx, PersistentDescriptorSet>> {
        let (layout, layout_desc) = base
            .set_layouts
            .get(set_index as usize)
            .ok_or(crate::errors::KilnError::InvalidRecording(
                "pipeline base has no such descriptor set",
            ))?
            .clone();
        let device = self.device();
        let pool = device.create_descriptor_pool(&crate::device::DescriptorPoolDesc {
            layout: layout_desc,
            max_sets: 1,
        })?;
        let set = device.allocate_descriptor_set(pool, layout)?;
        Ok(Unique::new(
            self.ctx,
            PersistentDescriptorSet::new(pool, set, layout),
        ))
    }

    /// Flushes the set's queued writes to the device.
    pub fn commit_persistent_descriptor_set(&self, set: &mut PersistentDescriptorSet) {
        let writes = set.take_pending();
        if !writes.is_empty() {
            self.device().write_descriptor_set(set.set, &writes);
        }
    }

    /// The merged reflected interface of a pipeline base.
    pub fn get_pipeline_reflection_info(
        &self,
        desc: &PipelineBaseDesc,
    ) -> Result<std::sync::Arc<crate::device::Program>> {
        self.ctx.get_pipeline_reflection_info(desc)
    }

    // ── Frame-local recycling ──────────────────────────────────────────────

    /// Queues a buffer for destruction when this frame's slot recycles.
    pub fn recycle_buffer(&mut self, buffer: Buffer) {
        self.recycle_buffers.push(buffer);
    }

    /// Queues an image for destruction when this frame's slot recycles.
    pub fn recycle_image(&mut self, image: ImageHandle) {
        self.recycle_images.push(image);
    }

    /// Queues an image view for destruction when this frame's slot
    /// recycles.
    pub fn recycle_image_view(&mut self, view: ImageViewHandle) {
        self.recycle_image_views.push(view);
    }

    // ── Cache acquisitions (frame-stamped) ─────────────────────────────────

    pub(crate) fn acquire_transient_image(
        &self,
        desc: &TransientImageDesc,
    ) -> Result<TransientImage> {
        let device = self.ctx.device().clone();
        self.ctx
            .transient_images
            .acquire(desc, self.ifc.absolute_frame, || {
                TransientImage::create(&*device, desc)
            })
    }

    pub(crate) fn acquire_descriptor_set(
        &self,
        desc: &DescriptorSetDesc,
    ) -> Result<DescriptorSetValue> {
        let device = self.ctx.device().clone();
        let frame = self.ifc.absolute_frame;
        let pool = self
            .ctx
            .acquire_descriptor_pool(&desc.layout_desc, frame)?;
        self.ctx
            .descriptor_sets
            .acquire(self.ifc.frame, self.tid, frame, desc, || {
                let set = device.allocate_descriptor_set(pool, desc.layout)?;
                device.write_descriptor_set(set, &desc.writes);
                Ok(DescriptorSetValue { set, pool })
            })
    }

    pub(crate) fn acquire_pipeline_instance(
        &self,
        desc: &PipelineInstanceDesc,
    ) -> Result<GraphicsPipeline> {
        self.ctx
            .acquire_pipeline_instance(desc, self.ifc.absolute_frame)
    }

    pub(crate) fn acquire_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassHandle> {
        self.ctx.acquire_render_pass(desc, self.ifc.absolute_frame)
    }

    pub(crate) fn acquire_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferHandle> {
        self.ctx.acquire_framebuffer(desc, self.ifc.absolute_frame)
    }

    pub(crate) fn acquire_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        self.ctx.acquire_sampler(desc, self.ifc.absolute_frame)
    }
}

impl Drop for PerThreadContext<'_, '_> {
    fn drop(&mut self) {
        let ctx = self.ctx;
        let slot = self.ifc.frame;
        // Buckets go back to their pools' frame colonies; they are rewound
        // and reused when this slot comes around again.
        if let Some(bucket) = self.command_buffers.take() {
            ctx.command_buffer_pool.retire_bucket(slot, bucket);
        }
        if let Some(bucket) = self.semaphores.take() {
            ctx.semaphore_pool.retire_bucket(slot, bucket);
        }
        if let Some(bucket) = self.fences.take() {
            ctx.fence_pool.retire_bucket(slot, bucket);
        }
        if let Some(bucket) = self.sampled_images.take() {
            ctx.sampled_image_pool.retire_bucket(slot, bucket);
        }

        for buffer in self.recycle_buffers.drain(..) {
            ctx.enqueue_destroy(buffer);
        }
        for image in self.recycle_images.drain(..) {
            ctx.enqueue_destroy(image);
        }
        for view in self.recycle_image_views.drain(..) {
            ctx.enqueue_destroy(view);
        }
    }
}

/// Records one staged image upload: layout transitions around the mip-0
/// copy, then an optional chain of blits from mip i to mip i+1, concluding
/// with every mip in shader-read layout.
fn record_image_upload(
    device: &dyn GpuDevice,
    cb: crate::types::CommandBufferHandle,
    transfer: &ImageTransfer,
) {
    let mips = if transfer.generate_mips { mip_level_count(transfer.extent) } else { 1 };

    device.cmd_transition_image(
        cb,
        transfer.dst,
        0,
        mips,
        ImageLayout::Undefined,
        ImageLayout::TransferDst,
    );
    device.cmd_copy_buffer_to_image(
        cb,
        transfer.src.block,
        transfer.dst,
        ImageLayout::TransferDst,
        &BufferImageCopy {
            buffer_offset: transfer.src.offset,
            image_subresource: ImageSubresourceLayers::default(),
            image_offset: Offset3D::default(),
            image_extent: transfer.extent,
        },
    );

    if mips > 1 {
        for mip in 1..mips {
            let src_extent = transfer.extent.mip(mip - 1);
            let dst_extent = transfer.extent.mip(mip);
            device.cmd_transition_image(
                cb,
                transfer.dst,
                mip - 1,
                1,
                ImageLayout::TransferDst,
                ImageLayout::TransferSrc,
            );
            device.cmd_blit_image(
                cb,
                transfer.dst,
                ImageLayout::TransferSrc,
                transfer.dst,
                ImageLayout::TransferDst,
                &ImageBlit {
                    src_subresource: ImageSubresourceLayers {
                        mip_level: mip - 1,
                        ..Default::default()
                    },
                    src_offsets: [
                        Offset3D::default(),
                        Offset3D {
                            x: src_extent.width as i32,
                            y: src_extent.height as i32,
                            z: src_extent.depth as i32,
                        },
                    ],
                    dst_subresource: ImageSubresourceLayers {
                        mip_level: mip,
                        ..Default::default()
                    },
                    dst_offsets: [
                        Offset3D::default(),
                        Offset3D {
                            x: dst_extent.width as i32,
                            y: dst_extent.height as i32,
                            z: dst_extent.depth as i32,
                        },
                    ],
                },
                Filter::Linear,
            );
        }
        // Mips 0..n-1 ended as transfer sources, the last as a transfer
        // destination.
        device.cmd_transition_image(
            cb,
            transfer.dst,
            0,
            mips - 1,
            ImageLayout::TransferSrc,
            ImageLayout::ShaderReadOnly,
        );
        device.cmd_transition_image(
            cb,
            transfer.dst,
            mips - 1,
            1,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        );
    } else {
        device.cmd_transition_image(
            cb,
            transfer.dst,
            0,
            1,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        );
    }
}
