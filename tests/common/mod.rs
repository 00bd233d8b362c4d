//! Recording Mock Device
//!
//! A `GpuDevice` implementation that hands out sequential ids and records
//! every call into an event trace. Tests drive the engine against it and
//! assert on the trace.
//!
//! Shader "compilation" is directive-based: each line of the source may be
//!
//! - `!error <message>`: compilation fails with the message
//! - `@uniform <set> <binding>`: declares a uniform-buffer binding
//! - `@sampled <set> <binding>`: declares a sampled-image binding
//!
//! The stage is inferred from the path extension (`.vert`, `.frag`,
//! `.comp`).

#![allow(dead_code)]

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use kiln::device::{
    CompiledShader, ComputePipelineDeviceDesc, DescriptorKind, DescriptorPoolDesc,
    DescriptorSetLayoutDesc, DescriptorWrite, FramebufferDesc, GpuDevice, GraphicsPipelineDesc,
    MemoryBlock, MemoryBlockDesc, PipelineBindPoint, PipelineLayoutDesc, Program,
    ProgramBinding, QueueKind, RenderPassDesc, SubmitInfo,
};
use kiln::errors::{KilnError, Result};
use kiln::types::{
    BufferImageCopy, ClearValue, CommandBufferHandle, CommandPoolHandle, DescriptorPoolHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, Extent3D, FenceHandle, Filter,
    FramebufferHandle, ImageBlit, ImageHandle, ImageLayout, ImageViewHandle, IndexType,
    MemoryBlockHandle, PipelineHandle, PipelineLayoutHandle, Rect2D, RenderPassHandle,
    SamplerDesc, SamplerHandle, SemaphoreHandle, ShaderModuleHandle, ShaderStages, Viewport,
};

// ============================================================================
// Trace Events
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Mark(String),

    CreateMemoryBlock { id: u64, size: u64 },
    DestroyMemoryBlock(u64),
    CreateImage { id: u64, mip_levels: u32 },
    DestroyImage(u64),
    CreateImageView(u64),
    DestroyImageView(u64),
    CreateSampler(u64),
    DestroySampler(u64),
    CompileShader { path: String },
    DestroyShaderModule(u64),
    CreateSetLayout(u64),
    DestroySetLayout(u64),
    CreatePipelineLayout(u64),
    DestroyPipelineLayout(u64),
    CreatePipeline(u64),
    DestroyPipeline(u64),
    CreateRenderPass(u64),
    DestroyRenderPass(u64),
    CreateFramebuffer(u64),
    DestroyFramebuffer(u64),
    CreateDescriptorPool(u64),
    DestroyDescriptorPool(u64),
    AllocateDescriptorSet(u64),
    FreeDescriptorSet(u64),
    WriteDescriptorSet { set: u64, writes: usize },
    CreateFence(u64),
    DestroyFence(u64),
    ResetFence(u64),
    WaitFences(Vec<u64>),
    CreateSemaphore(u64),
    DestroySemaphore(u64),
    CreateCommandPool(u64),
    DestroyCommandPool(u64),
    ResetCommandPool(u64),
    AllocateCommandBuffers { pool: u64, count: u32 },
    FreeCommandBuffers { pool: u64, count: usize },
    BeginCommandBuffer(u64),
    EndCommandBuffer(u64),

    BeginRenderPass { cb: u64, render_pass: u64 },
    EndRenderPass { cb: u64 },
    BindPipeline { cb: u64, pipeline: u64 },
    BindDescriptorSet { cb: u64, set_index: u32, set: u64 },
    BindVertexBuffer { cb: u64, binding: u32 },
    BindIndexBuffer { cb: u64 },
    SetViewport { cb: u64 },
    SetScissor { cb: u64 },
    Draw { cb: u64, vertices: u32 },
    DrawIndexed { cb: u64, indices: u32 },
    Dispatch { cb: u64 },
    CopyBuffer { cb: u64, size: u64 },
    CopyBufferToImage { cb: u64, image: u64, extent: Extent3D },
    BlitImage { cb: u64, image: u64, blit: ImageBlit },
    ResolveImage { cb: u64, src: u64, dst: u64 },
    TransitionImage { cb: u64, image: u64, base_mip: u32, mip_count: u32, from: ImageLayout, to: ImageLayout },

    Submit { queue: QueueKind, command_buffers: usize, fence: Option<u64> },
    QueueWaitIdle(QueueKind),
    WaitIdle,
    LoadPipelineCache(usize),
    SavePipelineCache,
}

// ============================================================================
// Mock Device
// ============================================================================

#[derive(Default)]
struct MockState {
    next_id: u64,
    events: Vec<Event>,
    blocks: HashMap<u64, Box<[u8]>>,
    pipeline_blob: Vec<u8>,
}

#[derive(Default)]
pub struct MockGpu {
    state: Mutex<MockState>,
}

impl MockGpu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.next_id
    }

    fn record(&self, event: Event) {
        self.state.lock().events.push(event);
    }

    /// Pushes a caller-defined marker into the trace, so tests can assert
    /// on ordering relative to engine activity.
    pub fn mark(&self, label: impl Into<String>) {
        self.record(Event::Mark(label.into()));
    }

    /// A snapshot of the trace so far.
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }

    /// Index of the first event matching `pred`, if any.
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.state.lock().events.iter().position(|e| pred(e))
    }
}

fn parse_shader(source: &str, path: &str) -> Result<Program> {
    let stage = if path.ends_with(".frag") {
        ShaderStages::FRAGMENT
    } else if path.ends_with(".comp") {
        ShaderStages::COMPUTE
    } else {
        ShaderStages::VERTEX
    };

    let mut bindings = Vec::new();
    for line in source.lines() {
        let line = line.trim();
        if let Some(message) = line.strip_prefix("!error") {
            return Err(KilnError::ShaderCompilation {
                path: path.to_owned(),
                message: message.trim().to_owned(),
            });
        }
        let (kind, rest) = if let Some(rest) = line.strip_prefix("@uniform") {
            (DescriptorKind::UniformBuffer, rest)
        } else if let Some(rest) = line.strip_prefix("@sampled") {
            (DescriptorKind::SampledImage, rest)
        } else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let set = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let binding = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        bindings.push(ProgramBinding { set, binding, kind, count: 1, stages: stage });
    }
    Ok(Program { bindings })
}

impl GpuDevice for MockGpu {
    fn create_memory_block(&self, desc: &MemoryBlockDesc) -> Result<MemoryBlock> {
        let id = self.next_id();
        let mut state = self.state.lock();
        state.events.push(Event::CreateMemoryBlock { id, size: desc.size });
        let mapped_base = if desc.memory.is_mapped() {
            let storage = vec![0_u8; desc.size as usize].into_boxed_slice();
            let base = NonNull::new(storage.as_ptr().cast_mut());
            state.blocks.insert(id, storage);
            base
        } else {
            None
        };
        Ok(MemoryBlock { handle: MemoryBlockHandle::from_raw(id), size: desc.size, mapped_base })
    }

    fn destroy_memory_block(&self, block: MemoryBlockHandle) {
        let mut state = self.state.lock();
        state.blocks.remove(&block.id());
        state.events.push(Event::DestroyMemoryBlock(block.id()));
    }

    fn create_image(&self, desc: &kiln::device::ImageDesc) -> Result<ImageHandle> {
        let id = self.next_id();
        self.record(Event::CreateImage { id, mip_levels: desc.mip_levels });
        Ok(ImageHandle::from_raw(id))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.record(Event::DestroyImage(image.id()));
    }

    fn create_image_view(&self, _desc: &kiln::device::ImageViewDesc) -> Result<ImageViewHandle> {
        let id = self.next_id();
        self.record(Event::CreateImageView(id));
        Ok(ImageViewHandle::from_raw(id))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.record(Event::DestroyImageView(view.id()));
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<SamplerHandle> {
        let id = self.next_id();
        self.record(Event::CreateSampler(id));
        Ok(SamplerHandle::from_raw(id))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.record(Event::DestroySampler(sampler.id()));
    }

    fn compile_shader(&self, source: &str, path: &str) -> Result<CompiledShader> {
        self.record(Event::CompileShader { path: path.to_owned() });
        let program = parse_shader(source, path)?;
        let stage = program
            .bindings
            .first()
            .map_or_else(
                || {
                    if path.ends_with(".frag") {
                        ShaderStages::FRAGMENT
                    } else if path.ends_with(".comp") {
                        ShaderStages::COMPUTE
                    } else {
                        ShaderStages::VERTEX
                    }
                },
                |b| b.stages,
            );
        Ok(CompiledShader {
            module: ShaderModuleHandle::from_raw(self.next_id()),
            stage,
            program,
        })
    }

    fn destroy_shader_module(&self, module: ShaderModuleHandle) {
        self.record(Event::DestroyShaderModule(module.id()));
    }

    fn create_descriptor_set_layout(
        &self,
        _desc: &DescriptorSetLayoutDesc,
    ) -> Result<DescriptorSetLayoutHandle> {
        let id = self.next_id();
        self.record(Event::CreateSetLayout(id));
        Ok(DescriptorSetLayoutHandle::from_raw(id))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        self.record(Event::DestroySetLayout(layout.id()));
    }

    fn create_pipeline_layout(&self, _desc: &PipelineLayoutDesc) -> Result<PipelineLayoutHandle> {
        let id = self.next_id();
        self.record(Event::CreatePipelineLayout(id));
        Ok(PipelineLayoutHandle::from_raw(id))
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        self.record(Event::DestroyPipelineLayout(layout.id()));
    }

    fn create_graphics_pipeline(&self, _desc: &GraphicsPipelineDesc) -> Result<PipelineHandle> {
        let id = self.next_id();
        self.record(Event::CreatePipeline(id));
        Ok(PipelineHandle::from_raw(id))
    }

    fn create_compute_pipeline(
        &self,
        _desc: &ComputePipelineDeviceDesc,
    ) -> Result<PipelineHandle> {
        let id = self.next_id();
        self.record(Event::CreatePipeline(id));
        Ok(PipelineHandle::from_raw(id))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.record(Event::DestroyPipeline(pipeline.id()));
    }

    fn create_render_pass(&self, _desc: &RenderPassDesc) -> Result<RenderPassHandle> {
        let id = self.next_id();
        self.record(Event::CreateRenderPass(id));
        Ok(RenderPassHandle::from_raw(id))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        self.record(Event::DestroyRenderPass(render_pass.id()));
    }

    fn create_framebuffer(&self, _desc: &FramebufferDesc) -> Result<FramebufferHandle> {
        let id = self.next_id();
        self.record(Event::CreateFramebuffer(id));
        Ok(FramebufferHandle::from_raw(id))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        self.record(Event::DestroyFramebuffer(framebuffer.id()));
    }

    fn create_descriptor_pool(&self, _desc: &DescriptorPoolDesc) -> Result<DescriptorPoolHandle> {
        let id = self.next_id();
        self.record(Event::CreateDescriptorPool(id));
        Ok(DescriptorPoolHandle::from_raw(id))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        self.record(Event::DestroyDescriptorPool(pool.id()));
    }

    fn allocate_descriptor_set(
        &self,
        _pool: DescriptorPoolHandle,
        _layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        let id = self.next_id();
        self.record(Event::AllocateDescriptorSet(id));
        Ok(DescriptorSetHandle::from_raw(id))
    }

    fn free_descriptor_set(&self, _pool: DescriptorPoolHandle, set: DescriptorSetHandle) {
        self.record(Event::FreeDescriptorSet(set.id()));
    }

    fn write_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) {
        self.record(Event::WriteDescriptorSet { set: set.id(), writes: writes.len() });
    }

    fn create_fence(&self) -> Result<FenceHandle> {
        let id = self.next_id();
        self.record(Event::CreateFence(id));
        Ok(FenceHandle::from_raw(id))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.record(Event::DestroyFence(fence.id()));
    }

    fn reset_fence(&self, fence: FenceHandle) {
        self.record(Event::ResetFence(fence.id()));
    }

    fn wait_fences(&self, fences: &[FenceHandle]) -> Result<()> {
        self.record(Event::WaitFences(fences.iter().map(|f| f.id()).collect()));
        Ok(())
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        let id = self.next_id();
        self.record(Event::CreateSemaphore(id));
        Ok(SemaphoreHandle::from_raw(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.record(Event::DestroySemaphore(semaphore.id()));
    }

    fn create_command_pool(&self) -> Result<CommandPoolHandle> {
        let id = self.next_id();
        self.record(Event::CreateCommandPool(id));
        Ok(CommandPoolHandle::from_raw(id))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        self.record(Event::DestroyCommandPool(pool.id()));
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) {
        self.record(Event::ResetCommandPool(pool.id()));
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>> {
        self.record(Event::AllocateCommandBuffers { pool: pool.id(), count });
        Ok((0..count)
            .map(|_| CommandBufferHandle::from_raw(self.next_id()))
            .collect())
    }

    fn free_command_buffers(&self, pool: CommandPoolHandle, buffers: &[CommandBufferHandle]) {
        self.record(Event::FreeCommandBuffers { pool: pool.id(), count: buffers.len() });
    }

    fn begin_command_buffer(&self, cb: CommandBufferHandle) -> Result<()> {
        self.record(Event::BeginCommandBuffer(cb.id()));
        Ok(())
    }

    fn end_command_buffer(&self, cb: CommandBufferHandle) -> Result<()> {
        self.record(Event::EndCommandBuffer(cb.id()));
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        cb: CommandBufferHandle,
        render_pass: RenderPassHandle,
        _framebuffer: FramebufferHandle,
        _render_area: Rect2D,
        _clear_values: &[ClearValue],
    ) {
        self.record(Event::BeginRenderPass { cb: cb.id(), render_pass: render_pass.id() });
    }

    fn cmd_end_render_pass(&self, cb: CommandBufferHandle) {
        self.record(Event::EndRenderPass { cb: cb.id() });
    }

    fn cmd_bind_pipeline(
        &self,
        cb: CommandBufferHandle,
        _bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        self.record(Event::BindPipeline { cb: cb.id(), pipeline: pipeline.id() });
    }

    fn cmd_bind_descriptor_set(
        &self,
        cb: CommandBufferHandle,
        _bind_point: PipelineBindPoint,
        _layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    ) {
        self.record(Event::BindDescriptorSet { cb: cb.id(), set_index, set: set.id() });
    }

    fn cmd_bind_vertex_buffer(
        &self,
        cb: CommandBufferHandle,
        binding: u32,
        _block: MemoryBlockHandle,
        _offset: u64,
    ) {
        self.record(Event::BindVertexBuffer { cb: cb.id(), binding });
    }

    fn cmd_bind_index_buffer(
        &self,
        cb: CommandBufferHandle,
        _block: MemoryBlockHandle,
        _offset: u64,
        _index_type: IndexType,
    ) {
        self.record(Event::BindIndexBuffer { cb: cb.id() });
    }

    fn cmd_set_viewport(&self, cb: CommandBufferHandle, _viewport: Viewport) {
        self.record(Event::SetViewport { cb: cb.id() });
    }

    fn cmd_set_scissor(&self, cb: CommandBufferHandle, _scissor: Rect2D) {
        self.record(Event::SetScissor { cb: cb.id() });
    }

    fn cmd_draw(
        &self,
        cb: CommandBufferHandle,
        vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(Event::Draw { cb: cb.id(), vertices: vertex_count });
    }

    fn cmd_draw_indexed(
        &self,
        cb: CommandBufferHandle,
        index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(Event::DrawIndexed { cb: cb.id(), indices: index_count });
    }

    fn cmd_dispatch(&self, cb: CommandBufferHandle, _x: u32, _y: u32, _z: u32) {
        self.record(Event::Dispatch { cb: cb.id() });
    }

    fn cmd_copy_buffer(
        &self,
        cb: CommandBufferHandle,
        _src_block: MemoryBlockHandle,
        _src_offset: u64,
        _dst_block: MemoryBlockHandle,
        _dst_offset: u64,
        size: u64,
    ) {
        self.record(Event::CopyBuffer { cb: cb.id(), size });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: CommandBufferHandle,
        _src_block: MemoryBlockHandle,
        dst: ImageHandle,
        _dst_layout: ImageLayout,
        copy: &BufferImageCopy,
    ) {
        self.record(Event::CopyBufferToImage {
            cb: cb.id(),
            image: dst.id(),
            extent: copy.image_extent,
        });
    }

    fn cmd_blit_image(
        &self,
        cb: CommandBufferHandle,
        src: ImageHandle,
        _src_layout: ImageLayout,
        _dst: ImageHandle,
        _dst_layout: ImageLayout,
        blit: &ImageBlit,
        _filter: Filter,
    ) {
        self.record(Event::BlitImage { cb: cb.id(), image: src.id(), blit: *blit });
    }

    fn cmd_resolve_image(
        &self,
        cb: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
        _extent: Extent3D,
    ) {
        self.record(Event::ResolveImage { cb: cb.id(), src: src.id(), dst: dst.id() });
    }

    fn cmd_transition_image(
        &self,
        cb: CommandBufferHandle,
        image: ImageHandle,
        base_mip: u32,
        mip_count: u32,
        from: ImageLayout,
        to: ImageLayout,
    ) {
        self.record(Event::TransitionImage {
            cb: cb.id(),
            image: image.id(),
            base_mip,
            mip_count,
            from,
            to,
        });
    }

    fn submit(&self, queue: QueueKind, info: &SubmitInfo<'_>) -> Result<()> {
        self.record(Event::Submit {
            queue,
            command_buffers: info.command_buffers.len(),
            fence: info.fence.map(|f| f.id()),
        });
        Ok(())
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> Result<()> {
        self.record(Event::QueueWaitIdle(queue));
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.record(Event::WaitIdle);
        Ok(())
    }

    fn load_pipeline_cache(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.pipeline_blob = data.to_vec();
        state.events.push(Event::LoadPipelineCache(data.len()));
        Ok(())
    }

    fn save_pipeline_cache(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.events.push(Event::SavePipelineCache);
        Ok(state.pipeline_blob.clone())
    }
}
