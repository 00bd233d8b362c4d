//! The Device Contract
//!
//! The engine sits directly above a modern explicit GPU API. That API is an
//! external collaborator; this module names the contract the core uses as a
//! single object-safe trait, [`GpuDevice`], over the handle newtypes of
//! [`crate::types`].
//!
//! The engine is constructed over an `Arc<dyn GpuDevice>`. Production
//! backends bind a real driver; the test suite drives a mock device that
//! records a trace of every call.
//!
//! # Contract notes
//!
//! - Creation methods take plain descriptor structs (the create-info value
//!   types) and are internally synchronized; queue submission order is
//!   serialized by the engine's per-queue locks.
//! - `wait_fences` blocks without timeout; device loss surfaces as
//!   [`KilnError::DeviceLost`](crate::errors::KilnError::DeviceLost).
//! - Shader reflection lives behind the device: `compile_shader` returns the
//!   module together with its reflected [`Program`].
//! - Destruction methods are infallible; the engine treats destroy as
//!   best-effort and logs, never halts, on anomalies.

use smallvec::SmallVec;

use crate::errors::Result;
use crate::types::{
    BufferImageCopy, BufferUsage, ClearValue, CommandBufferHandle, CommandPoolHandle, CompareOp,
    DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, Extent3D, FenceHandle,
    Filter, Format, FramebufferHandle, ImageBlit, ImageHandle, ImageLayout, ImageUsage,
    ImageViewHandle, IndexType, LoadOp, MemoryBlockHandle, MemoryUsage, PipelineHandle,
    PipelineLayoutHandle, Rect2D, RenderPassHandle, SamplerDesc, SamplerHandle, Samples,
    SemaphoreHandle, ShaderModuleHandle, ShaderStages, StoreOp, Viewport,
};

// ============================================================================
// Create-Info Descriptors
// ============================================================================

/// Create-info for a backing memory block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MemoryBlockDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryUsage,
}

/// A created memory block; `mapped_base` is the stable base pointer of the
/// block's persistent mapping for host-visible memory classes.
#[derive(Clone, Copy, Debug)]
pub struct MemoryBlock {
    pub handle: MemoryBlockHandle,
    pub size: u64,
    pub mapped_base: Option<std::ptr::NonNull<u8>>,
}

// Mapped bases point at allocator-owned memory with block lifetime.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

/// Create-info for an image.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ImageDesc {
    pub format: Format,
    pub extent: Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: Samples,
    pub usage: ImageUsage,
}

/// Create-info for an image view.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ImageViewDesc {
    pub image: ImageHandle,
    pub format: Format,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ImageViewDesc {
    /// A view covering the whole image.
    #[must_use]
    pub fn whole(image: ImageHandle, format: Format, mip_count: u32) -> Self {
        Self { image, format, base_mip: 0, mip_count, base_layer: 0, layer_count: 1 }
    }
}

/// One attachment of a render pass.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AttachmentDesc {
    pub format: Format,
    pub samples: Samples,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

/// Create-info for a render pass: color attachments plus an optional
/// depth-stencil attachment, single subpass.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct RenderPassDesc {
    pub color: SmallVec<[AttachmentDesc; 4]>,
    pub depth_stencil: Option<AttachmentDesc>,
}

/// Create-info for a framebuffer.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FramebufferDesc {
    pub render_pass: RenderPassHandle,
    pub attachments: SmallVec<[ImageViewHandle; 5]>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

// ============================================================================
// Descriptors & Programs
// ============================================================================

/// The kind of resource a descriptor binding expects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
}

/// One binding of a descriptor-set layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Create-info for a descriptor-set layout.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: SmallVec<[DescriptorBinding; 8]>,
}

/// Create-info for a pipeline layout.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct PipelineLayoutDesc {
    pub set_layouts: SmallVec<[DescriptorSetLayoutHandle; 4]>,
}

/// Create-info for a descriptor pool serving sets of one layout shape.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DescriptorPoolDesc {
    pub layout: DescriptorSetLayoutDesc,
    pub max_sets: u32,
}

/// The resource written into one descriptor binding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DescriptorResource {
    Buffer { block: MemoryBlockHandle, offset: u64, range: u64 },
    Image { view: ImageViewHandle, sampler: SamplerHandle, layout: ImageLayout },
}

/// One descriptor write.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub resource: DescriptorResource,
}

/// One binding of a shader's reflected interface.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ProgramBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
}

/// The reflected binding interface of one or more shader stages.
///
/// Produced by [`GpuDevice::compile_shader`]; the engine merges the programs
/// of a pipeline's stages and derives descriptor-set layouts from the result.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Program {
    pub bindings: Vec<ProgramBinding>,
}

impl Program {
    /// Merges several stage programs into one, OR-ing the stage visibility
    /// of bindings that appear in more than one stage.
    #[must_use]
    pub fn merge<'a>(programs: impl IntoIterator<Item = &'a Program>) -> Program {
        let mut merged: Vec<ProgramBinding> = Vec::new();
        for program in programs {
            for b in &program.bindings {
                if let Some(existing) = merged
                    .iter_mut()
                    .find(|e| e.set == b.set && e.binding == b.binding)
                {
                    existing.stages |= b.stages;
                } else {
                    merged.push(*b);
                }
            }
        }
        merged.sort_by_key(|b| (b.set, b.binding));
        Program { bindings: merged }
    }

    /// Derives one descriptor-set layout per set index, dense from set 0 to
    /// the highest set referenced.
    #[must_use]
    pub fn set_layouts(&self) -> SmallVec<[DescriptorSetLayoutDesc; 4]> {
        let max_set = self.bindings.iter().map(|b| b.set).max();
        let Some(max_set) = max_set else {
            return SmallVec::new();
        };
        (0..=max_set)
            .map(|set| DescriptorSetLayoutDesc {
                bindings: self
                    .bindings
                    .iter()
                    .filter(|b| b.set == set)
                    .map(|b| DescriptorBinding {
                        binding: b.binding,
                        kind: b.kind,
                        count: b.count,
                        stages: b.stages,
                    })
                    .collect(),
            })
            .collect()
    }
}

/// The result of compiling one shader source.
#[derive(Clone, Debug)]
pub struct CompiledShader {
    pub module: ShaderModuleHandle,
    pub stage: ShaderStages,
    pub program: Program,
}

// ============================================================================
// Pipelines
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct RasterState {
    pub cull: CullMode,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self { test: false, write: false, compare: CompareOp::Always }
    }
}

/// Fixed-function blend presets; per-attachment blend programming is the
/// solver's concern, the core keys pipelines on the preset only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum BlendPreset {
    #[default]
    Opaque,
    AlphaBlend,
    Additive,
}

/// One vertex buffer binding slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
}

/// One vertex attribute inside a binding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

/// The full vertex-input state derived from the packed binding layouts
/// supplied at recording time.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct VertexInputState {
    pub bindings: SmallVec<[VertexBinding; 2]>,
    pub attributes: SmallVec<[VertexAttribute; 8]>,
}

/// One stage of a graphics pipeline, by compiled module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ShaderStageDesc {
    pub module: ShaderModuleHandle,
    pub stage: ShaderStages,
}

/// The exact device-level create-info for a concrete graphics pipeline.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct GraphicsPipelineDesc {
    pub stages: SmallVec<[ShaderStageDesc; 2]>,
    pub layout: PipelineLayoutHandle,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub vertex_input: VertexInputState,
    pub topology: PrimitiveTopology,
    pub samples: Samples,
    pub raster: RasterState,
    pub depth: DepthState,
    pub blend: BlendPreset,
}

/// Device-level create-info for a compute pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ComputePipelineDeviceDesc {
    pub shader: ShaderModuleHandle,
    pub layout: PipelineLayoutHandle,
}

// ============================================================================
// Submission
// ============================================================================

/// The two queues the core submits to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

/// One queue submission.
#[derive(Clone, Copy, Debug)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [CommandBufferHandle],
    pub wait_semaphores: &'a [SemaphoreHandle],
    pub signal_semaphores: &'a [SemaphoreHandle],
    pub fence: Option<FenceHandle>,
}

// ============================================================================
// The Device Trait
// ============================================================================

/// The contract between the core and the underlying explicit GPU API.
pub trait GpuDevice: Send + Sync {
    // ── Memory & buffers ───────────────────────────────────────────────────
    fn create_memory_block(&self, desc: &MemoryBlockDesc) -> Result<MemoryBlock>;
    fn destroy_memory_block(&self, block: MemoryBlockHandle);

    // ── Images, views, samplers ────────────────────────────────────────────
    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle>;
    fn destroy_image(&self, image: ImageHandle);
    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<ImageViewHandle>;
    fn destroy_image_view(&self, view: ImageViewHandle);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle>;
    fn destroy_sampler(&self, sampler: SamplerHandle);

    // ── Shaders & pipelines ────────────────────────────────────────────────
    /// Compiles `source`, returning the module and its reflected program.
    /// `path` identifies the source in diagnostics.
    fn compile_shader(&self, source: &str, path: &str) -> Result<CompiledShader>;
    fn destroy_shader_module(&self, module: ShaderModuleHandle);
    fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);
    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<PipelineLayoutHandle>;
    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle);
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<PipelineHandle>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDeviceDesc)
    -> Result<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    // ── Render passes & framebuffers ───────────────────────────────────────
    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassHandle>;
    fn destroy_render_pass(&self, render_pass: RenderPassHandle);
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferHandle>;
    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    // ── Descriptors ────────────────────────────────────────────────────────
    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<DescriptorPoolHandle>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle>;
    /// Returns `set` to `pool`'s free list.
    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle);
    fn write_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]);

    // ── Synchronization primitives ─────────────────────────────────────────
    fn create_fence(&self) -> Result<FenceHandle>;
    fn destroy_fence(&self, fence: FenceHandle);
    fn reset_fence(&self, fence: FenceHandle);
    /// Blocks until every fence in `fences` is signaled. No timeout.
    fn wait_fences(&self, fences: &[FenceHandle]) -> Result<()>;
    fn create_semaphore(&self) -> Result<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    // ── Command pools & buffers ────────────────────────────────────────────
    fn create_command_pool(&self) -> Result<CommandPoolHandle>;
    fn destroy_command_pool(&self, pool: CommandPoolHandle);
    /// Resets the pool, recycling every command buffer issued from it.
    fn reset_command_pool(&self, pool: CommandPoolHandle);
    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>>;
    fn free_command_buffers(&self, pool: CommandPoolHandle, buffers: &[CommandBufferHandle]);
    fn begin_command_buffer(&self, cb: CommandBufferHandle) -> Result<()>;
    fn end_command_buffer(&self, cb: CommandBufferHandle) -> Result<()>;

    // ── Recording ──────────────────────────────────────────────────────────
    fn cmd_begin_render_pass(
        &self,
        cb: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        render_area: Rect2D,
        clear_values: &[ClearValue],
    );
    fn cmd_end_render_pass(&self, cb: CommandBufferHandle);
    fn cmd_bind_pipeline(
        &self,
        cb: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    );
    fn cmd_bind_descriptor_set(
        &self,
        cb: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    );
    fn cmd_bind_vertex_buffer(
        &self,
        cb: CommandBufferHandle,
        binding: u32,
        block: MemoryBlockHandle,
        offset: u64,
    );
    fn cmd_bind_index_buffer(
        &self,
        cb: CommandBufferHandle,
        block: MemoryBlockHandle,
        offset: u64,
        index_type: IndexType,
    );
    fn cmd_set_viewport(&self, cb: CommandBufferHandle, viewport: Viewport);
    fn cmd_set_scissor(&self, cb: CommandBufferHandle, scissor: Rect2D);
    fn cmd_draw(
        &self,
        cb: CommandBufferHandle,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cb: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, cb: CommandBufferHandle, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(
        &self,
        cb: CommandBufferHandle,
        src_block: MemoryBlockHandle,
        src_offset: u64,
        dst_block: MemoryBlockHandle,
        dst_offset: u64,
        size: u64,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cb: CommandBufferHandle,
        src_block: MemoryBlockHandle,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        copy: &BufferImageCopy,
    );
    fn cmd_blit_image(
        &self,
        cb: CommandBufferHandle,
        src: ImageHandle,
        src_layout: ImageLayout,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        blit: &ImageBlit,
        filter: Filter,
    );
    fn cmd_resolve_image(
        &self,
        cb: CommandBufferHandle,
        src: ImageHandle,
        dst: ImageHandle,
        extent: Extent3D,
    );
    /// Transitions `mip_count` levels of `image` starting at `base_mip`
    /// between layouts, with the implied execution and memory dependencies.
    fn cmd_transition_image(
        &self,
        cb: CommandBufferHandle,
        image: ImageHandle,
        base_mip: u32,
        mip_count: u32,
        from: ImageLayout,
        to: ImageLayout,
    );

    // ── Queues ─────────────────────────────────────────────────────────────
    fn submit(&self, queue: QueueKind, info: &SubmitInfo<'_>) -> Result<()>;
    fn queue_wait_idle(&self, queue: QueueKind) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    // ── Pipeline cache blob ────────────────────────────────────────────────
    /// Feeds an opaque, driver-defined blob into the driver pipeline cache.
    fn load_pipeline_cache(&self, data: &[u8]) -> Result<()>;
    /// Serializes the driver pipeline cache. Byte-for-byte passthrough with
    /// `load_pipeline_cache` is the engine's only persistence contract.
    fn save_pipeline_cache(&self) -> Result<Vec<u8>>;

    // ── Debug utils (optional) ─────────────────────────────────────────────
    /// Attaches a debug name to a raw object id. Default: no-op.
    fn set_object_name(&self, _raw_id: u64, _name: &str) {}
    /// Opens a labeled region in a command buffer. Default: no-op.
    fn cmd_begin_label(&self, _cb: CommandBufferHandle, _label: &str, _color: [f32; 4]) {}
    /// Closes the innermost labeled region. Default: no-op.
    fn cmd_end_label(&self, _cb: CommandBufferHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(set: u32, binding: u32, stages: ShaderStages) -> ProgramBinding {
        ProgramBinding { set, binding, kind: DescriptorKind::UniformBuffer, count: 1, stages }
    }

    #[test]
    fn merge_unions_stage_visibility() {
        let vert = Program { bindings: vec![binding(0, 0, ShaderStages::VERTEX)] };
        let frag = Program {
            bindings: vec![
                binding(0, 0, ShaderStages::FRAGMENT),
                binding(0, 2, ShaderStages::FRAGMENT),
            ],
        };
        let merged = Program::merge([&vert, &frag]);
        assert_eq!(merged.bindings.len(), 2);
        assert_eq!(
            merged.bindings[0].stages,
            ShaderStages::VERTEX | ShaderStages::FRAGMENT
        );
    }

    #[test]
    fn set_layouts_are_dense_up_to_max_set() {
        let program = Program {
            bindings: vec![binding(0, 0, ShaderStages::VERTEX), binding(2, 1, ShaderStages::FRAGMENT)],
        };
        let layouts = program.set_layouts();
        assert_eq!(layouts.len(), 3);
        assert!(layouts[1].bindings.is_empty());
        assert_eq!(layouts[2].bindings[0].binding, 1);
    }
}
