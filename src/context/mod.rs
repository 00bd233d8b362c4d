//! The Context Family
//!
//! Three nested scopes drive the engine:
//!
//! | Scope | Type | Held by |
//! |-------|------|---------|
//! | Process | [`Context`] | the application, for its whole lifetime |
//! | Frame | [`InflightContext`] | one frame in the three-deep pipeline |
//! | Thread | [`PerThreadContext`] | one worker thread inside one frame |
//!
//! The process context owns every cache, every pool, the destroy queues and
//! the named pipeline registries. [`Context::begin`] hands out one frame
//! context per frame; acquiring the frame slot's recycle lock inside
//! `begin` is what guarantees the three-frame safety window: work submitted
//! in absolute frame F has completed (for CPU observation) before the same
//! slot is re-entered at frame F + [`FRAME_COUNT`].
//!
//! Upward references are plain borrows; downward ownership is scoped. No
//! reference counting between the contexts themselves.

mod inflight;
mod thread;

pub use inflight::{InflightContext, TransferTicket};
pub use thread::{PerThreadContext, thread_index};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};

use crate::FRAME_COUNT;
use crate::cache::Cache;
use crate::command::{DescriptorSetDesc, DescriptorSetValue};
use crate::device::{
    CompiledShader, DescriptorPoolDesc, DescriptorSetLayoutDesc, FramebufferDesc, GpuDevice,
    ImageDesc, ImageViewDesc, MemoryBlockDesc, PipelineLayoutDesc, Program, QueueKind,
    RenderPassDesc, SubmitInfo,
};
use crate::errors::{KilnError, Result};
use crate::graph::{TransientImage, TransientImageDesc};
use crate::name::Name;
use crate::per_frame_cache::PerFrameCache;
use crate::pipeline::{
    ComputePipeline, ComputePipelineDesc, GraphicsPipeline, PipelineBase, PipelineBaseData,
    PipelineBaseDesc, PipelineInstanceDesc, ShaderModule, ShaderModuleKey,
};
use crate::pool::{CommandBucket, FenceBucket, Pool, SampledImageBucket, SemaphoreBucket};
use crate::scratch::{LinearScratch, LinearScratchKey};
use crate::device::DescriptorWrite;
use crate::types::{
    Buffer, BufferImageCopy, BufferUsage, CommandBufferHandle, CommandPoolHandle,
    DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, Extent2D, Extent3D,
    FenceHandle, Format, FramebufferHandle, ImageHandle, ImageLayout, ImageSubresourceLayers,
    ImageViewHandle, MemoryUsage, Offset3D, PipelineHandle, PipelineLayoutHandle,
    RenderPassHandle, SamplerDesc, SamplerHandle, Texture,
};

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration. All fields are defaulted; callers override what
/// they need.
#[derive(Clone, Copy, Debug)]
pub struct ContextDesc {
    /// Frames a transient image may go unused before eviction.
    pub transient_image_frames: u64,
    /// Frames a scratch allocator (and its idle blocks) may go unused.
    pub scratch_frames: u64,
    /// Frames a cached descriptor set may go unused before it is freed.
    pub descriptor_set_frames: u64,
    /// Size of one linear scratch backing block, in bytes.
    pub scratch_block_size: u64,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            transient_image_frames: 32,
            scratch_frames: 32,
            descriptor_set_frames: 8,
            scratch_block_size: 4 << 20,
        }
    }
}

// ============================================================================
// Swapchains
// ============================================================================

new_key_type! {
    /// Stable key of a swapchain record in the context's registry.
    pub struct SwapchainKey;
}

/// A registered swapchain. Creation and presentation live outside the core;
/// the record exists so render graphs can reference the current backbuffer
/// images and views.
#[derive(Clone, Debug)]
pub struct Swapchain {
    /// Raw swapchain object id, owned externally.
    pub handle: u64,
    /// Raw surface id, owned externally.
    pub surface: u64,
    pub format: Format,
    pub extent: Extent2D,
    pub images: Vec<ImageHandle>,
    pub views: Vec<ImageViewHandle>,
}

// ============================================================================
// Deferred Destruction
// ============================================================================

/// Resources that can be queued onto a frame slot's destroy queue.
///
/// The set of destroyable kinds is closed; each implementation appends the
/// value to the matching per-kind vector.
pub trait DeferredDelete {
    fn defer(self, queues: &mut DestroyQueues);
}

/// Per-slot vectors of resources awaiting physical destruction.
#[derive(Default)]
pub struct DestroyQueues {
    images: Vec<ImageHandle>,
    image_views: Vec<ImageViewHandle>,
    pipelines: Vec<PipelineHandle>,
    buffers: Vec<Buffer>,
    descriptor_sets: Vec<PersistentDescriptorSet>,
}

impl DeferredDelete for ImageHandle {
    fn defer(self, queues: &mut DestroyQueues) {
        queues.images.push(self);
    }
}

impl DeferredDelete for ImageViewHandle {
    fn defer(self, queues: &mut DestroyQueues) {
        queues.image_views.push(self);
    }
}

impl DeferredDelete for PipelineHandle {
    fn defer(self, queues: &mut DestroyQueues) {
        queues.pipelines.push(self);
    }
}

impl DeferredDelete for Buffer {
    fn defer(self, queues: &mut DestroyQueues) {
        queues.buffers.push(self);
    }
}

impl DeferredDelete for Texture {
    fn defer(self, queues: &mut DestroyQueues) {
        queues.image_views.push(self.view);
        queues.images.push(self.image);
    }
}

impl DeferredDelete for PersistentDescriptorSet {
    fn defer(self, queues: &mut DestroyQueues) {
        queues.descriptor_sets.push(self);
    }
}

/// An owning handle whose drop enqueues destruction on the context's
/// current destroy queue, to be physically freed when the frame slot comes
/// around again.
pub struct Unique<'ctx, T: DeferredDelete> {
    ctx: &'ctx Context,
    value: Option<T>,
}

impl<'ctx, T: DeferredDelete> Unique<'ctx, T> {
    #[must_use]
    pub fn new(ctx: &'ctx Context, value: T) -> Self {
        Self { ctx, value: Some(value) }
    }

    /// Releases ownership without enqueueing destruction.
    #[must_use]
    pub fn take(mut self) -> T {
        self.value.take().expect("value present until drop")
    }
}

impl<T: DeferredDelete> std::ops::Deref for Unique<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("value present until drop")
    }
}

impl<T: DeferredDelete> Drop for Unique<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.ctx.enqueue_destroy(value);
        }
    }
}

// ============================================================================
// Persistent Descriptor Sets
// ============================================================================

/// A descriptor set outside the per-frame pipeline: backed by its own pool,
/// updated explicitly, destroyed through the destroy queues.
pub struct PersistentDescriptorSet {
    pub pool: DescriptorPoolHandle,
    pub set: DescriptorSetHandle,
    pub layout: DescriptorSetLayoutHandle,
    pending_writes: Vec<DescriptorWrite>,
}

impl PersistentDescriptorSet {
    pub(crate) fn new(
        pool: DescriptorPoolHandle,
        set: DescriptorSetHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Self {
        Self { pool, set, layout, pending_writes: Vec::new() }
    }

    /// Queues one descriptor write; flushed by
    /// [`PerThreadContext::commit_persistent_descriptor_set`].
    pub fn queue_write(&mut self, write: DescriptorWrite) {
        self.pending_writes.push(write);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<DescriptorWrite> {
        std::mem::take(&mut self.pending_writes)
    }
}

// ============================================================================
// Fenced Uploads
// ============================================================================

/// One buffer upload outside the frame pipeline.
pub struct BufferUpload<'a> {
    pub dst: Buffer,
    pub data: &'a [u8],
}

/// One image upload outside the frame pipeline.
pub struct ImageUpload<'a> {
    pub dst: ImageHandle,
    pub format: Format,
    pub extent: Extent3D,
    pub data: &'a [u8],
}

/// The handle returned by a fenced upload. When the fence signals, the
/// caller hands the result back to [`Context::free_upload_resources`].
pub struct UploadResult {
    pub fence: FenceHandle,
    pub command_buffer: CommandBufferHandle,
    pub staging: Buffer,
    /// Index of the one-shot pool the command buffer came from.
    pub pool_index: usize,
    /// Whether the upload went to the transfer queue (images go to the
    /// graphics queue for the final layout transition).
    pub on_transfer_queue: bool,
}

// ============================================================================
// Context
// ============================================================================

/// The process-scope engine context. See the module docs.
pub struct Context {
    device: Arc<dyn GpuDevice>,
    desc: ContextDesc,

    // Queue serialization.
    gfx_queue_lock: Mutex<()>,
    xfer_queue_lock: Mutex<()>,

    // Pools.
    pub(crate) command_buffer_pool: Pool<CommandBucket>,
    pub(crate) semaphore_pool: Pool<SemaphoreBucket>,
    pub(crate) fence_pool: Pool<FenceBucket>,
    pub(crate) sampled_image_pool: Pool<SampledImageBucket>,

    // Global caches.
    pipeline_base_cache: Cache<PipelineBaseDesc, PipelineBase>,
    pipeline_cache: Cache<PipelineInstanceDesc, GraphicsPipeline>,
    compute_pipeline_cache: Cache<ComputePipelineDesc, ComputePipeline>,
    render_pass_cache: Cache<RenderPassDesc, RenderPassHandle>,
    framebuffer_cache: Cache<FramebufferDesc, FramebufferHandle>,
    sampler_cache: Cache<SamplerDesc, SamplerHandle>,
    shader_module_cache: Cache<ShaderModuleKey, ShaderModule>,
    set_layout_cache: Cache<DescriptorSetLayoutDesc, DescriptorSetLayoutHandle>,
    pipeline_layout_cache: Cache<PipelineLayoutDesc, PipelineLayoutHandle>,
    descriptor_pool_cache: Cache<DescriptorSetLayoutDesc, DescriptorPoolHandle>,

    // Transient images intern globally: a graph attachment re-requested
    // with the same create-info maps to one physical image across frames,
    // with threshold eviction at frame entry.
    pub(crate) transient_images: Cache<TransientImageDesc, TransientImage>,

    // Per-frame caches.
    pub(crate) scratch_allocators: PerFrameCache<LinearScratchKey, LinearScratch>,
    pub(crate) descriptor_sets: PerFrameCache<DescriptorSetDesc, DescriptorSetValue>,

    // Frame pipeline state.
    begin_frame_lock: Mutex<()>,
    pub(crate) recycle_locks: [Mutex<()>; FRAME_COUNT],
    destroy_queues: [Mutex<DestroyQueues>; FRAME_COUNT],
    frame_counter: AtomicU64,
    unique_handle_id: AtomicU64,

    // Transfer tickets (process-scoped so monotonicity holds globally).
    pub(crate) transfer_id: AtomicU64,
    pub(crate) last_transfer_complete: AtomicU64,

    // Named pipeline registries.
    named_pipelines: RwLock<FxHashMap<Name, (PipelineBaseDesc, PipelineBase)>>,
    named_compute_pipelines: RwLock<FxHashMap<Name, (ComputePipelineDesc, ComputePipeline)>>,

    // Swapchain registry.
    swapchains: RwLock<SlotMap<SwapchainKey, Swapchain>>,

    // One-shot command pools for fenced uploads, one per worker thread per
    // queue, lazily created.
    one_time_pools: Mutex<Vec<Option<CommandPoolHandle>>>,
    xfer_one_time_pools: Mutex<Vec<Option<CommandPoolHandle>>>,
}

impl Context {
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>, desc: ContextDesc) -> Self {
        Self {
            command_buffer_pool: Pool::new(device.clone()),
            semaphore_pool: Pool::new(device.clone()),
            fence_pool: Pool::new(device.clone()),
            sampled_image_pool: Pool::new(device.clone()),
            device,
            desc,
            gfx_queue_lock: Mutex::new(()),
            xfer_queue_lock: Mutex::new(()),
            pipeline_base_cache: Cache::new(),
            pipeline_cache: Cache::new(),
            compute_pipeline_cache: Cache::new(),
            render_pass_cache: Cache::new(),
            framebuffer_cache: Cache::new(),
            sampler_cache: Cache::new(),
            shader_module_cache: Cache::new(),
            set_layout_cache: Cache::new(),
            pipeline_layout_cache: Cache::new(),
            descriptor_pool_cache: Cache::new(),
            transient_images: Cache::new(),
            scratch_allocators: PerFrameCache::new(),
            descriptor_sets: PerFrameCache::new(),
            begin_frame_lock: Mutex::new(()),
            recycle_locks: std::array::from_fn(|_| Mutex::new(())),
            destroy_queues: std::array::from_fn(|_| Mutex::new(DestroyQueues::default())),
            frame_counter: AtomicU64::new(0),
            unique_handle_id: AtomicU64::new(1),
            transfer_id: AtomicU64::new(1),
            last_transfer_complete: AtomicU64::new(0),
            named_pipelines: RwLock::new(FxHashMap::default()),
            named_compute_pipelines: RwLock::new(FxHashMap::default()),
            swapchains: RwLock::new(SlotMap::with_key()),
            one_time_pools: Mutex::new(Vec::new()),
            xfer_one_time_pools: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    #[must_use]
    #[inline]
    pub fn config(&self) -> &ContextDesc {
        &self.desc
    }

    /// The absolute index of the most recently begun frame.
    #[must_use]
    pub fn current_frame(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Hands out a process-wide unique id (buffers, pipeline bases).
    pub(crate) fn next_unique_id(&self) -> u64 {
        self.unique_handle_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── Frame pipeline ─────────────────────────────────────────────────────

    /// Begins the next frame.
    ///
    /// Blocks until the frame's slot is free: the returned
    /// [`InflightContext`] holds the slot's recycle lock for its lifetime,
    /// and construction waits on every fence submitted for the slot
    /// [`FRAME_COUNT`] frames ago, drains the slot's destroy queues, flushes
    /// the per-frame cache shards and rewinds pools and scratch allocators.
    pub fn begin(&self) -> Result<InflightContext<'_>> {
        let _serialize = self.begin_frame_lock.lock();
        let absolute_frame = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        let frame = (absolute_frame % FRAME_COUNT as u64) as usize;
        let slot_guard = self.recycle_locks[frame].lock();
        InflightContext::new(self, absolute_frame, frame, slot_guard)
    }

    /// Appends `value` to the current frame's destroy queue for its kind.
    /// Physical destruction happens when the engine next re-enters the
    /// current frame slot, no earlier than [`FRAME_COUNT`] frames from now.
    pub fn enqueue_destroy<T: DeferredDelete>(&self, value: T) {
        let slot = (self.current_frame() % FRAME_COUNT as u64) as usize;
        value.defer(&mut self.destroy_queues[slot].lock());
    }

    /// Waits for all queues to idle, then drains every destroy queue for
    /// every slot.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()?;
        for slot in 0..FRAME_COUNT {
            self.drain_destroy_queue(slot);
        }
        Ok(())
    }

    /// Physically destroys everything queued on `slot`. Best-effort; the
    /// caller guarantees the slot's GPU work has completed.
    pub(crate) fn drain_destroy_queue(&self, slot: usize) {
        let queues = {
            let mut guard = self.destroy_queues[slot].lock();
            std::mem::take(&mut *guard)
        };
        let device = &*self.device;
        for view in queues.image_views {
            device.destroy_image_view(view);
        }
        for image in queues.images {
            device.destroy_image(image);
        }
        for pipeline in queues.pipelines {
            device.destroy_pipeline(pipeline);
        }
        for buffer in queues.buffers {
            if buffer.owns_block {
                device.destroy_memory_block(buffer.block);
            }
        }
        for set in queues.descriptor_sets {
            device.destroy_descriptor_pool(set.pool);
        }
    }

    // ── Queue submission ───────────────────────────────────────────────────

    pub(crate) fn submit_graphics(
        &self,
        command_buffers: &[CommandBufferHandle],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        let _queue = self.gfx_queue_lock.lock();
        self.device.submit(
            QueueKind::Graphics,
            &SubmitInfo {
                command_buffers,
                wait_semaphores: &[],
                signal_semaphores: &[],
                fence,
            },
        )
    }

    pub(crate) fn submit_transfer(
        &self,
        command_buffers: &[CommandBufferHandle],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        let _queue = self.xfer_queue_lock.lock();
        self.device.submit(
            QueueKind::Transfer,
            &SubmitInfo {
                command_buffers,
                wait_semaphores: &[],
                signal_semaphores: &[],
                fence,
            },
        )
    }

    // ── Named pipelines ────────────────────────────────────────────────────

    /// Registers a pipeline base under `name`. Idempotent when the same
    /// create-info is presented again; a different create-info under an
    /// existing name is an error.
    pub fn create_named_pipeline(
        &self,
        name: impl Into<Name>,
        desc: PipelineBaseDesc,
    ) -> Result<PipelineBase> {
        let name = name.into();
        {
            let registry = self.named_pipelines.read();
            if let Some((existing, base)) = registry.get(&name) {
                if *existing == desc {
                    return Ok(base.clone());
                }
                return Err(KilnError::NamedPipelineConflict(name));
            }
        }
        let base = self.get_pipeline(&desc)?;
        let mut registry = self.named_pipelines.write();
        if let Some((existing, registered)) = registry.get(&name) {
            if *existing == desc {
                return Ok(registered.clone());
            }
            return Err(KilnError::NamedPipelineConflict(name));
        }
        registry.insert(name, (desc, base.clone()));
        Ok(base)
    }

    /// Registers a compute pipeline under `name`; same idempotence rules as
    /// [`Context::create_named_pipeline`].
    pub fn create_named_compute_pipeline(
        &self,
        name: impl Into<Name>,
        desc: ComputePipelineDesc,
    ) -> Result<ComputePipeline> {
        let name = name.into();
        {
            let registry = self.named_compute_pipelines.read();
            if let Some((existing, pipeline)) = registry.get(&name) {
                if *existing == desc {
                    return Ok(pipeline.clone());
                }
                return Err(KilnError::NamedPipelineConflict(name));
            }
        }
        let pipeline = self.get_compute_pipeline(&desc)?;
        let mut registry = self.named_compute_pipelines.write();
        if let Some((existing, registered)) = registry.get(&name) {
            if *existing == desc {
                return Ok(registered.clone());
            }
            return Err(KilnError::NamedPipelineConflict(name));
        }
        registry.insert(name, (desc, pipeline.clone()));
        Ok(pipeline)
    }

    #[must_use]
    pub fn get_named_pipeline(&self, name: impl Into<Name>) -> Option<PipelineBase> {
        self.named_pipelines
            .read()
            .get(&name.into())
            .map(|(_, base)| base.clone())
    }

    #[must_use]
    pub fn get_named_compute_pipeline(&self, name: impl Into<Name>) -> Option<ComputePipeline> {
        self.named_compute_pipelines
            .read()
            .get(&name.into())
            .map(|(_, pipeline)| pipeline.clone())
    }

    /// Anonymous variant of [`Context::create_named_pipeline`]: interns the
    /// base through the cache without registering a name.
    pub fn get_pipeline(&self, desc: &PipelineBaseDesc) -> Result<PipelineBase> {
        let frame = self.current_frame();
        self.pipeline_base_cache
            .acquire(desc, frame, || self.create_pipeline_base(desc))
    }

    pub fn get_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<ComputePipeline> {
        let frame = self.current_frame();
        self.compute_pipeline_cache
            .acquire(desc, frame, || self.create_compute_pipeline(desc))
    }

    /// The merged reflected interface of a pipeline base.
    pub fn get_pipeline_reflection_info(&self, desc: &PipelineBaseDesc) -> Result<Arc<Program>> {
        Ok(self.get_pipeline(desc)?.program.clone())
    }

    // ── Resource creation (cache backends) ─────────────────────────────────

    pub(crate) fn acquire_shader_module(&self, source: &crate::pipeline::ShaderSource) -> Result<ShaderModule> {
        let frame = self.current_frame();
        self.shader_module_cache.acquire(&source.key(), frame, || {
            let CompiledShader { module, stage, program } =
                self.device.compile_shader(&source.source, &source.path)?;
            Ok(ShaderModule { module, stage, program: Arc::new(program) })
        })
    }

    pub(crate) fn acquire_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<DescriptorSetLayoutHandle> {
        let frame = self.current_frame();
        self.set_layout_cache
            .acquire(desc, frame, || self.device.create_descriptor_set_layout(desc))
    }

    pub(crate) fn acquire_pipeline_layout(
        &self,
        desc: &PipelineLayoutDesc,
    ) -> Result<PipelineLayoutHandle> {
        let frame = self.current_frame();
        self.pipeline_layout_cache
            .acquire(desc, frame, || self.device.create_pipeline_layout(desc))
    }

    pub(crate) fn acquire_render_pass(
        &self,
        desc: &RenderPassDesc,
        frame: u64,
    ) -> Result<RenderPassHandle> {
        self.render_pass_cache
            .acquire(desc, frame, || self.device.create_render_pass(desc))
    }

    pub(crate) fn acquire_framebuffer(
        &self,
        desc: &FramebufferDesc,
        frame: u64,
    ) -> Result<FramebufferHandle> {
        self.framebuffer_cache
            .acquire(desc, frame, || self.device.create_framebuffer(desc))
    }

    pub(crate) fn acquire_sampler(&self, desc: &SamplerDesc, frame: u64) -> Result<SamplerHandle> {
        self.sampler_cache
            .acquire(desc, frame, || self.device.create_sampler(desc))
    }

    pub(crate) fn acquire_pipeline_instance(
        &self,
        desc: &PipelineInstanceDesc,
        frame: u64,
    ) -> Result<GraphicsPipeline> {
        self.pipeline_cache.acquire(desc, frame, || {
            let base = &desc.base;
            let pipeline = self.device.create_graphics_pipeline(
                &crate::device::GraphicsPipelineDesc {
                    stages: base.stages.clone(),
                    layout: base.layout,
                    render_pass: desc.render_pass,
                    subpass: desc.subpass,
                    vertex_input: desc.vertex_input.clone(),
                    topology: base.topology,
                    samples: desc.samples,
                    raster: base.raster,
                    depth: base.depth,
                    blend: base.blend,
                },
            )?;
            Ok(GraphicsPipeline { pipeline, layout: base.layout, base_id: base.id })
        })
    }

    pub(crate) fn acquire_descriptor_pool(
        &self,
        layout_desc: &DescriptorSetLayoutDesc,
        frame: u64,
    ) -> Result<DescriptorPoolHandle> {
        self.descriptor_pool_cache.acquire(layout_desc, frame, || {
            self.device.create_descriptor_pool(&DescriptorPoolDesc {
                layout: layout_desc.clone(),
                max_sets: 512,
            })
        })
    }

    /// Builds a pipeline base: compiles (or reuses) each shader module,
    /// merges their reflected programs and derives the layout chain.
    fn create_pipeline_base(&self, desc: &PipelineBaseDesc) -> Result<PipelineBase> {
        let mut modules = Vec::with_capacity(desc.shaders.len());
        for source in &desc.shaders {
            modules.push(self.acquire_shader_module(source)?);
        }
        let program = Arc::new(Program::merge(modules.iter().map(|m| &*m.program)));
        let layout_descs = program.set_layouts();

        let mut set_layouts = smallvec::SmallVec::new();
        let mut layout_handles = smallvec::SmallVec::new();
        for layout_desc in &layout_descs {
            let handle = self.acquire_set_layout(layout_desc)?;
            layout_handles.push(handle);
            set_layouts.push((handle, layout_desc.clone()));
        }
        let layout =
            self.acquire_pipeline_layout(&PipelineLayoutDesc { set_layouts: layout_handles })?;

        Ok(Arc::new(PipelineBaseData {
            id: self.next_unique_id(),
            stages: modules
                .iter()
                .map(|m| crate::device::ShaderStageDesc { module: m.module, stage: m.stage })
                .collect(),
            program,
            set_layouts,
            layout,
            topology: desc
                .topology
                .unwrap_or(crate::device::PrimitiveTopology::TriangleList),
            raster: desc.raster,
            depth: desc.depth,
            blend: desc.blend,
        }))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<ComputePipeline> {
        let module = self.acquire_shader_module(&desc.shader)?;
        let program = module.program.clone();
        let layout_descs = program.set_layouts();

        let mut set_layouts = smallvec::SmallVec::new();
        let mut layout_handles = smallvec::SmallVec::new();
        for layout_desc in &layout_descs {
            let handle = self.acquire_set_layout(layout_desc)?;
            layout_handles.push(handle);
            set_layouts.push((handle, layout_desc.clone()));
        }
        let layout =
            self.acquire_pipeline_layout(&PipelineLayoutDesc { set_layouts: layout_handles })?;
        let pipeline = self.device.create_compute_pipeline(
            &crate::device::ComputePipelineDeviceDesc { shader: module.module, layout },
        )?;
        Ok(ComputePipeline { pipeline, layout, program, set_layouts })
    }

    // ── Lifetime-managed allocations ───────────────────────────────────────

    /// Allocates a lifetime-managed buffer on its own memory block.
    pub fn allocate_buffer(
        &self,
        memory: MemoryUsage,
        usage: BufferUsage,
        size: u64,
        _alignment: u64,
    ) -> Result<Unique<'_, Buffer>> {
        let block = self.device.create_memory_block(&MemoryBlockDesc { size, usage, memory })?;
        Ok(Unique::new(
            self,
            Buffer {
                block: block.handle,
                buffer_id: self.next_unique_id(),
                offset: 0,
                size,
                usage,
                memory,
                mapped_ptr: block.mapped_base,
                owns_block: true,
            },
        ))
    }

    /// Allocates a lifetime-managed texture (image plus whole-image view).
    pub fn allocate_texture(&self, desc: ImageDesc) -> Result<Unique<'_, Texture>> {
        let image = self.device.create_image(&desc)?;
        let view = self
            .device
            .create_image_view(&ImageViewDesc::whole(image, desc.format, desc.mip_levels))?;
        Ok(Unique::new(
            self,
            Texture {
                image,
                view,
                format: desc.format,
                extent: desc.extent,
                mip_levels: desc.mip_levels,
                samples: desc.samples,
            },
        ))
    }

    // ── Swapchains ─────────────────────────────────────────────────────────

    pub fn add_swapchain(&self, swapchain: Swapchain) -> SwapchainKey {
        self.swapchains.write().insert(swapchain)
    }

    #[must_use]
    pub fn swapchain(&self, key: SwapchainKey) -> Option<Swapchain> {
        self.swapchains.read().get(key).cloned()
    }

    pub fn remove_swapchain(&self, key: SwapchainKey) -> Option<Swapchain> {
        self.swapchains.write().remove(key)
    }

    // ── Pipeline cache blob ────────────────────────────────────────────────

    /// Opaque round-trip with the driver pipeline cache.
    pub fn load_pipeline_cache(&self, blob: &[u8]) -> Result<()> {
        self.device.load_pipeline_cache(blob)
    }

    pub fn save_pipeline_cache(&self) -> Result<Vec<u8>> {
        self.device.save_pipeline_cache()
    }

    // ── Fenced uploads ─────────────────────────────────────────────────────

    /// Records and submits buffer copies outside the frame pipeline.
    ///
    /// Returns the fence to poll together with the resources that must stay
    /// alive until it signals; release them through
    /// [`Context::free_upload_resources`].
    pub fn fenced_upload_buffers(&self, uploads: &[BufferUpload<'_>]) -> Result<UploadResult> {
        let total: u64 = uploads.iter().map(|u| u.data.len() as u64).sum();
        let staging = self.create_staging(total.max(1))?;
        let (cb, pool_index) = self.one_time_command_buffer(true)?;
        self.device.begin_command_buffer(cb)?;

        let mut cursor = 0_u64;
        for upload in uploads {
            unsafe {
                let base = staging.mapped_ptr.expect("staging is mapped");
                std::ptr::copy_nonoverlapping(
                    upload.data.as_ptr(),
                    base.add(cursor as usize).as_ptr(),
                    upload.data.len(),
                );
            }
            self.device.cmd_copy_buffer(
                cb,
                staging.block,
                cursor,
                upload.dst.block,
                upload.dst.offset,
                upload.data.len() as u64,
            );
            cursor += upload.data.len() as u64;
        }

        self.device.end_command_buffer(cb)?;
        let fence = self.device.create_fence()?;
        self.submit_transfer(&[cb], Some(fence))?;
        Ok(UploadResult { fence, command_buffer: cb, staging, pool_index, on_transfer_queue: true })
    }

    /// Records and submits image uploads (mip 0 only) outside the frame
    /// pipeline, transitioning each image to shader-read layout.
    pub fn fenced_upload_images(&self, uploads: &[ImageUpload<'_>]) -> Result<UploadResult> {
        let total: u64 = uploads.iter().map(|u| u.data.len() as u64).sum();
        let staging = self.create_staging(total.max(1))?;
        let (cb, pool_index) = self.one_time_command_buffer(false)?;
        self.device.begin_command_buffer(cb)?;

        let mut cursor = 0_u64;
        for upload in uploads {
            unsafe {
                let base = staging.mapped_ptr.expect("staging is mapped");
                std::ptr::copy_nonoverlapping(
                    upload.data.as_ptr(),
                    base.add(cursor as usize).as_ptr(),
                    upload.data.len(),
                );
            }
            self.device.cmd_transition_image(
                cb,
                upload.dst,
                0,
                1,
                ImageLayout::Undefined,
                ImageLayout::TransferDst,
            );
            self.device.cmd_copy_buffer_to_image(
                cb,
                staging.block,
                upload.dst,
                ImageLayout::TransferDst,
                &BufferImageCopy {
                    buffer_offset: staging.offset + cursor,
                    image_subresource: ImageSubresourceLayers::default(),
                    image_offset: Offset3D::default(),
                    image_extent: upload.extent,
                },
            );
            self.device.cmd_transition_image(
                cb,
                upload.dst,
                0,
                1,
                ImageLayout::TransferDst,
                ImageLayout::ShaderReadOnly,
            );
            cursor += upload.data.len() as u64;
        }

        self.device.end_command_buffer(cb)?;
        let fence = self.device.create_fence()?;
        self.submit_graphics(&[cb], Some(fence))?;
        Ok(UploadResult { fence, command_buffer: cb, staging, pool_index, on_transfer_queue: false })
    }

    /// Frees everything a fenced upload kept alive. The caller guarantees
    /// the fence has signaled.
    pub fn free_upload_resources(&self, result: UploadResult) {
        self.device.destroy_fence(result.fence);
        let pools = if result.on_transfer_queue {
            self.xfer_one_time_pools.lock()
        } else {
            self.one_time_pools.lock()
        };
        if let Some(Some(pool)) = pools.get(result.pool_index) {
            self.device.free_command_buffers(*pool, &[result.command_buffer]);
        }
        self.device.destroy_memory_block(result.staging.block);
    }

    fn create_staging(&self, size: u64) -> Result<Buffer> {
        let block = self.device.create_memory_block(&MemoryBlockDesc {
            size,
            usage: BufferUsage::TRANSFER_SRC,
            memory: MemoryUsage::CpuOnly,
        })?;
        Ok(Buffer {
            block: block.handle,
            buffer_id: self.next_unique_id(),
            offset: 0,
            size,
            usage: BufferUsage::TRANSFER_SRC,
            memory: MemoryUsage::CpuOnly,
            mapped_ptr: block.mapped_base,
            owns_block: true,
        })
    }

    fn one_time_command_buffer(&self, transfer: bool) -> Result<(CommandBufferHandle, usize)> {
        let index = thread_index();
        let pool = {
            let mut pools = if transfer {
                self.xfer_one_time_pools.lock()
            } else {
                self.one_time_pools.lock()
            };
            if pools.len() <= index {
                pools.resize(index + 1, None);
            }
            match pools[index] {
                Some(pool) => pool,
                None => {
                    let pool = self.device.create_command_pool()?;
                    pools[index] = Some(pool);
                    pool
                }
            }
        };
        let cb = self
            .device
            .allocate_command_buffers(pool, 1)?
            .pop()
            .expect("requested one command buffer");
        Ok((cb, index))
    }

    // ── Debug utils ────────────────────────────────────────────────────────

    #[must_use]
    pub fn debug(&self) -> DebugUtils<'_> {
        DebugUtils { ctx: self }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Teardown order: device idle first, then queued destruction, then
        // every cache entry exactly once. The pools free themselves when
        // their fields drop afterwards.
        if let Err(err) = self.device.wait_idle() {
            log::warn!("wait_idle failed during context teardown: {err}");
        }
        for slot in 0..FRAME_COUNT {
            self.drain_destroy_queue(slot);
        }

        let device = self.device.clone();
        for pipeline in self.pipeline_cache.drain() {
            device.destroy_pipeline(pipeline.pipeline);
        }
        for pipeline in self.compute_pipeline_cache.drain() {
            device.destroy_pipeline(pipeline.pipeline);
        }
        // Bases only reference modules and layouts owned by their caches.
        drop(self.pipeline_base_cache.drain());
        self.named_pipelines.write().clear();
        self.named_compute_pipelines.write().clear();

        for framebuffer in self.framebuffer_cache.drain() {
            device.destroy_framebuffer(framebuffer);
        }
        for render_pass in self.render_pass_cache.drain() {
            device.destroy_render_pass(render_pass);
        }
        for sampler in self.sampler_cache.drain() {
            device.destroy_sampler(sampler);
        }
        for module in self.shader_module_cache.drain() {
            device.destroy_shader_module(module.module);
        }
        for layout in self.pipeline_layout_cache.drain() {
            device.destroy_pipeline_layout(layout);
        }
        for layout in self.set_layout_cache.drain() {
            device.destroy_descriptor_set_layout(layout);
        }

        for transient in self.transient_images.drain() {
            device.destroy_image_view(transient.view);
            device.destroy_image(transient.image);
        }
        for scratch in self.scratch_allocators.drain_all() {
            scratch.release(&*device);
        }
        // Cached descriptor sets are reclaimed wholesale with their pools.
        drop(self.descriptor_sets.drain_all());
        for pool in self.descriptor_pool_cache.drain() {
            device.destroy_descriptor_pool(pool);
        }

        for pool in self.one_time_pools.lock().drain(..).flatten() {
            device.destroy_command_pool(pool);
        }
        for pool in self.xfer_one_time_pools.lock().drain(..).flatten() {
            device.destroy_command_pool(pool);
        }
        self.swapchains.write().clear();
    }
}

// ============================================================================
// Debug Utils
// ============================================================================

/// Object naming and command-buffer label regions, routed through the
/// device. No-ops when the device does not expose the capability.
pub struct DebugUtils<'ctx> {
    ctx: &'ctx Context,
}

impl DebugUtils<'_> {
    pub fn set_name(&self, texture: &Texture, name: impl Into<Name>) {
        let name = name.into();
        self.ctx.device.set_object_name(texture.image.id(), name.as_str());
        self.ctx.device.set_object_name(texture.view.id(), name.as_str());
    }

    pub fn set_buffer_name(&self, buffer: &Buffer, name: impl Into<Name>) {
        self.ctx
            .device
            .set_object_name(buffer.block.id(), name.into().as_str());
    }

    pub fn begin_region(&self, cb: CommandBufferHandle, name: impl Into<Name>, color: [f32; 4]) {
        self.ctx.device.cmd_begin_label(cb, name.into().as_str(), color);
    }

    pub fn end_region(&self, cb: CommandBufferHandle) {
        self.ctx.device.cmd_end_label(cb);
    }
}
