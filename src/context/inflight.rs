//! The Frame-Scope Context
//!
//! One [`InflightContext`] exists per frame. Constructing it is the frame
//! pipeline's synchronization point: it happens while holding the frame
//! slot's recycle lock, waits on every fence recorded into the slot
//! [`FRAME_COUNT`] frames ago, flushes the per-frame cache shards, drains
//! the slot's destroy queues and rewinds pools and scratch allocators.
//! Waiting here, not at frame submission, is what keeps the pipeline
//! non-blocking on the CPU side while the GPU keeps up.
//!
//! The frame context also owns the transfer pump's command queues: staging
//! uploads enqueued by any worker thread are batched by
//! [`PerThreadContext::dma_task`](super::PerThreadContext::dma_task) into
//! one submission with one fence, filed FIFO with the highest ticket id the
//! batch covers.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use parking_lot::{Mutex, MutexGuard};

use super::{Context, PerThreadContext};
use crate::FRAME_COUNT;
use crate::errors::Result;
use crate::types::{Buffer, Extent3D, FenceHandle, ImageHandle};

// ============================================================================
// Transfer Tickets
// ============================================================================

/// An opaque, monotonically increasing identifier for an enqueued transfer.
///
/// A ticket is complete once the engine's transfer watermark has reached
/// it; completion is observed in weakly monotonic order and never regresses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct TransferTicket {
    pub(crate) id: u64,
}

impl TransferTicket {
    /// A ticket that is already complete (empty uploads).
    pub(crate) const READY: TransferTicket = TransferTicket { id: 0 };

    #[must_use]
    #[inline]
    pub fn id(self) -> u64 {
        self.id
    }
}

pub(crate) struct BufferTransfer {
    pub src: Buffer,
    pub dst: Buffer,
    pub ticket: TransferTicket,
}

pub(crate) struct ImageTransfer {
    pub src: Buffer,
    pub dst: ImageHandle,
    pub extent: Extent3D,
    pub generate_mips: bool,
    pub ticket: TransferTicket,
}

pub(crate) struct PendingBatch {
    pub last_ticket: u64,
    pub fence: FenceHandle,
}

#[derive(Default)]
struct TransferState {
    buffer_transfers: VecDeque<BufferTransfer>,
    image_transfers: VecDeque<ImageTransfer>,
    pending: VecDeque<PendingBatch>,
}

// ============================================================================
// InflightContext
// ============================================================================

/// A scoped view of one frame slot. Holds exclusive rights over the slot
/// (the recycle lock) for its lifetime; dropping it releases the slot but
/// does not affect GPU work already submitted.
pub struct InflightContext<'ctx> {
    pub(crate) ctx: &'ctx Context,
    /// The monotonic index of this frame.
    pub absolute_frame: u64,
    /// The frame slot: `absolute_frame % FRAME_COUNT`.
    pub frame: usize,
    _slot_guard: MutexGuard<'ctx, ()>,
    transfer: Mutex<TransferState>,
}

impl<'ctx> InflightContext<'ctx> {
    pub(crate) fn new(
        ctx: &'ctx Context,
        absolute_frame: u64,
        frame: usize,
        slot_guard: MutexGuard<'ctx, ()>,
    ) -> Result<Self> {
        log::trace!("frame {absolute_frame}: entering slot {frame}");
        let device = &**ctx.device();

        // 1. Wait on every fence submitted for this slot three frames ago.
        let mut fences = Vec::new();
        ctx.fence_pool
            .for_each_in_slot(frame, |bucket| fences.extend_from_slice(bucket.issued()));
        if !fences.is_empty() {
            device.wait_fences(&fences)?;
        }

        // 2. Flush the slot's thread-local cache shards into the main maps;
        //    racing duplicates lost the merge and are destroyed here.
        for scratch in ctx.scratch_allocators.flush(frame, absolute_frame) {
            scratch.release(device);
        }
        for set in ctx.descriptor_sets.flush(frame, absolute_frame) {
            device.free_descriptor_set(set.pool, set.set);
        }

        // 3. Evict entries unused for longer than their collection
        //    thresholds.
        let config = *ctx.config();
        ctx.transient_images.collect(
            absolute_frame,
            config.transient_image_frames,
            |transient| {
                log::debug!("evicting transient image {:?}", transient.image);
                device.destroy_image_view(transient.view);
                device.destroy_image(transient.image);
            },
        );
        ctx.scratch_allocators
            .collect(frame, absolute_frame, config.scratch_frames, |scratch| {
                scratch.release(device);
            });
        ctx.descriptor_sets
            .collect(frame, absolute_frame, config.descriptor_set_frames, |set| {
                device.free_descriptor_set(set.pool, set.set);
            });

        // Surviving scratch allocators rewind their cursors and shed blocks
        // that sat idle past the threshold.
        ctx.scratch_allocators.for_each_value(frame, |scratch| {
            scratch.reset(device, absolute_frame, config.scratch_frames);
        });

        // 4. Physically destroy everything queued on this slot.
        ctx.drain_destroy_queue(frame);

        // 5. Rewind the pools.
        ctx.command_buffer_pool.reset_slot(frame);
        ctx.semaphore_pool.reset_slot(frame);
        ctx.fence_pool.reset_slot(frame);
        ctx.sampled_image_pool.reset_slot(frame);

        Ok(Self {
            ctx,
            absolute_frame,
            frame,
            _slot_guard: slot_guard,
            transfer: Mutex::new(TransferState::default()),
        })
    }

    #[must_use]
    #[inline]
    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    /// Begins a worker-thread view of this frame. One per worker; the
    /// returned context owns its pool buckets exclusively until dropped.
    pub fn begin(&self) -> Result<PerThreadContext<'_, 'ctx>> {
        PerThreadContext::new(self)
    }

    // ── Transfer pump ──────────────────────────────────────────────────────

    /// Enqueues a buffer-to-buffer staging copy, returning its ticket.
    pub fn enqueue_buffer_transfer(&self, src: Buffer, dst: Buffer) -> TransferTicket {
        let mut state = self.transfer.lock();
        // Ticket assignment happens under the queue lock so batch drains
        // observe ids in FIFO order.
        let ticket = TransferTicket { id: self.ctx.transfer_id.fetch_add(1, Ordering::Relaxed) };
        state.buffer_transfers.push_back(BufferTransfer { src, dst, ticket });
        ticket
    }

    /// Enqueues a buffer-to-image staging copy with optional mip-chain
    /// generation, returning its ticket.
    pub fn enqueue_image_transfer(
        &self,
        src: Buffer,
        dst: ImageHandle,
        extent: Extent3D,
        generate_mips: bool,
    ) -> TransferTicket {
        let mut state = self.transfer.lock();
        let ticket = TransferTicket { id: self.ctx.transfer_id.fetch_add(1, Ordering::Relaxed) };
        state
            .image_transfers
            .push_back(ImageTransfer { src, dst, extent, generate_mips, ticket });
        ticket
    }

    /// Whether `ticket`'s transfer has been observed complete. Does not
    /// block. Completion never regresses: once this returns `true` for a
    /// ticket it returns `true` for every lower ticket as well.
    #[must_use]
    pub fn is_ready(&self, ticket: TransferTicket) -> bool {
        ticket.id <= self.ctx.last_transfer_complete.load(Ordering::Acquire)
    }

    pub(crate) fn drain_transfers(&self) -> (Vec<BufferTransfer>, Vec<ImageTransfer>) {
        let mut guard = self.transfer.lock();
        let state = &mut *guard;
        let buffers = state.buffer_transfers.drain(..).collect();
        let images = state.image_transfers.drain(..).collect();
        (buffers, images)
    }

    pub(crate) fn push_pending(&self, batch: PendingBatch) {
        self.transfer.lock().pending.push_back(batch);
    }

    pub(crate) fn pop_pending(&self) -> Option<PendingBatch> {
        self.transfer.lock().pending.pop_front()
    }

    pub(crate) fn advance_watermark(&self, ticket_id: u64) {
        self.ctx
            .last_transfer_complete
            .fetch_max(ticket_id, Ordering::Release);
    }
}

impl Drop for InflightContext<'_> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.frame,
            (self.absolute_frame % FRAME_COUNT as u64) as usize
        );
        log::trace!("frame {}: leaving slot {}", self.absolute_frame, self.frame);
    }
}
