//! The Command Recorder
//!
//! Execute callbacks receive a [`CommandRecorder`]: a state-tracked wrapper
//! over one primary command buffer. Binds are latched and only flushed to
//! the device at draw time, which is when the concrete pipeline is derived
//! (base + render pass + vertex input) and descriptor sets are materialized
//! through the per-frame cache. Redundant pipeline re-binds are elided by
//! id comparison.
//!
//! Vertex buffers are bound with a *packed binding layout*: a token
//! sequence of attribute formats and skipped byte runs from which the
//! recorder derives the binding stride and per-attribute offsets.
//!
//! Inside a render pass only draw-state commands are valid; outside one,
//! only transfer commands (resolve, blit). Violations surface as
//! [`KilnError::InvalidRecording`].

use bytemuck::Pod;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::context::PerThreadContext;
use crate::device::{
    DescriptorKind, DescriptorResource, DescriptorSetLayoutDesc, DescriptorWrite,
    PipelineBindPoint, VertexAttribute, VertexBinding, VertexInputState,
};
use crate::errors::{KilnError, Result};
use crate::name::Name;
use crate::pipeline::{ComputePipeline, PipelineBase, PipelineInstanceDesc};
use crate::types::{
    Area, Buffer, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, Extent2D, Filter, Format, ImageBlit, ImageHandle, ImageLayout,
    ImageViewHandle, IndexType, MemoryUsage, BufferUsage, PipelineHandle, Rect2D, SampledImage,
    SamplerDesc, Samples, Viewport,
};

/// Descriptor sets bound per draw; matches common device minimums.
pub const MAX_DESCRIPTOR_SETS: usize = 4;

// ============================================================================
// Descriptor Set Create-Info
// ============================================================================

/// Create-info of one materialized descriptor set: the layout plus the
/// exact writes. Structurally hashable, so equal bind states re-use one set
/// within the frame slot.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DescriptorSetDesc {
    pub layout: DescriptorSetLayoutHandle,
    pub layout_desc: DescriptorSetLayoutDesc,
    pub writes: SmallVec<[DescriptorWrite; 8]>,
}

/// A cached descriptor set together with the pool it came from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DescriptorSetValue {
    pub set: DescriptorSetHandle,
    pub pool: DescriptorPoolHandle,
}

// ============================================================================
// Packed Vertex Layout
// ============================================================================

/// One token of a packed vertex-binding layout: an attribute of the given
/// format, or a run of bytes to skip.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VertexToken {
    Format(Format),
    Skip(u32),
}

fn derive_vertex_layout(
    binding: u32,
    first_location: u32,
    tokens: &[VertexToken],
) -> (VertexBinding, SmallVec<[VertexAttribute; 8]>) {
    let mut offset = 0_u32;
    let mut location = first_location;
    let mut attributes = SmallVec::new();
    for token in tokens {
        match token {
            VertexToken::Format(format) => {
                attributes.push(VertexAttribute { location, binding, format: *format, offset });
                location += 1;
                offset += format.block_size();
            }
            VertexToken::Skip(bytes) => offset += bytes,
        }
    }
    (VertexBinding { binding, stride: offset }, attributes)
}

// ============================================================================
// Pass-Scoped State
// ============================================================================

/// An attachment resolved to physical resources for this frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedAttachment {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
    pub format: Format,
    pub samples: Samples,
    pub extent: Extent2D,
}

#[derive(Clone, Copy)]
pub(crate) struct RenderPassScope {
    pub render_pass: crate::types::RenderPassHandle,
    pub subpass: u32,
    pub samples: Samples,
    pub extent: Extent2D,
}

#[derive(Clone, Copy)]
enum Bound {
    Uniform(Buffer),
    Sampled(SampledImage),
}

#[derive(Default)]
struct SetState {
    entries: SmallVec<[(u32, Bound); 8]>,
    dirty: bool,
}

// ============================================================================
// CommandRecorder
// ============================================================================

/// The command surface exposed to pass execute callbacks. Methods chain:
///
/// ```ignore
/// cbuf.set_viewport(Area::Framebuffer)?
///     .set_scissor(Area::Framebuffer)?
///     .bind_graphics_pipeline("cube")?
///     .bind_uniform_buffer(0, 0, &ubo)?
///     .draw_indexed(36, 1, 0, 0, 0)?;
/// ```
pub struct CommandRecorder<'a> {
    ptc: &'a PerThreadContext<'a, 'a>,
    cb: CommandBufferHandle,
    attachments: &'a FxHashMap<Name, ResolvedAttachment>,
    pass: Option<RenderPassScope>,

    base: Option<PipelineBase>,
    compute: Option<ComputePipeline>,
    vertex_input: VertexInputState,
    sets: [SetState; MAX_DESCRIPTOR_SETS],
    bound_pipeline: Option<PipelineHandle>,
}

impl<'a> CommandRecorder<'a> {
    pub(crate) fn new(
        ptc: &'a PerThreadContext<'a, 'a>,
        cb: CommandBufferHandle,
        attachments: &'a FxHashMap<Name, ResolvedAttachment>,
        pass: Option<RenderPassScope>,
    ) -> Self {
        Self {
            ptc,
            cb,
            attachments,
            pass,
            base: None,
            compute: None,
            vertex_input: VertexInputState::default(),
            sets: std::array::from_fn(|_| SetState::default()),
            bound_pipeline: None,
        }
    }

    /// The raw command buffer being recorded.
    #[must_use]
    #[inline]
    pub fn handle(&self) -> CommandBufferHandle {
        self.cb
    }

    fn in_pass(&self) -> Result<&RenderPassScope> {
        self.pass
            .as_ref()
            .ok_or(KilnError::InvalidRecording("command requires a render pass"))
    }

    fn outside_pass(&self) -> Result<()> {
        if self.pass.is_some() {
            return Err(KilnError::InvalidRecording(
                "transfer command inside a render pass",
            ));
        }
        Ok(())
    }

    fn attachment(&self, name: Name) -> Result<&ResolvedAttachment> {
        self.attachments
            .get(&name)
            .ok_or(KilnError::UnknownAttachment(name))
    }

    fn resolve_area(&self, area: Area) -> Result<Rect2D> {
        match area {
            Area::Absolute(rect) => Ok(rect),
            Area::Framebuffer => Ok(Rect2D::whole(self.in_pass()?.extent)),
        }
    }

    // ── Fixed state ────────────────────────────────────────────────────────

    pub fn set_viewport(&mut self, area: Area) -> Result<&mut Self> {
        let rect = self.resolve_area(area)?;
        self.ptc.device().cmd_set_viewport(
            self.cb,
            Viewport {
                x: rect.offset.x as f32,
                y: rect.offset.y as f32,
                width: rect.extent.width as f32,
                height: rect.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        Ok(self)
    }

    pub fn set_scissor(&mut self, area: Area) -> Result<&mut Self> {
        let rect = self.resolve_area(area)?;
        self.ptc.device().cmd_set_scissor(self.cb, rect);
        Ok(self)
    }

    // ── Pipeline binds ─────────────────────────────────────────────────────

    /// Binds a graphics pipeline by registry name. The concrete pipeline is
    /// derived lazily at draw time from the base plus the current render
    /// pass and vertex input.
    pub fn bind_graphics_pipeline(&mut self, name: impl Into<Name>) -> Result<&mut Self> {
        let name = name.into();
        let base = self
            .ptc
            .context()
            .get_named_pipeline(name)
            .ok_or(KilnError::UnknownPipeline(name))?;
        self.bind_graphics_pipeline_base(base)
    }

    /// Binds an anonymous pipeline base.
    pub fn bind_graphics_pipeline_base(&mut self, base: PipelineBase) -> Result<&mut Self> {
        if self.base.as_ref().is_none_or(|current| current.id != base.id) {
            self.base = Some(base);
            self.compute = None;
            for set in &mut self.sets {
                set.dirty = true;
            }
        }
        Ok(self)
    }

    /// Binds a compute pipeline by registry name.
    pub fn bind_compute_pipeline(&mut self, name: impl Into<Name>) -> Result<&mut Self> {
        let name = name.into();
        let pipeline = self
            .ptc
            .context()
            .get_named_compute_pipeline(name)
            .ok_or(KilnError::UnknownPipeline(name))?;
        self.compute = Some(pipeline);
        self.base = None;
        for set in &mut self.sets {
            set.dirty = true;
        }
        Ok(self)
    }

    // ── Geometry binds ─────────────────────────────────────────────────────

    /// Binds `buffer` at vertex binding `binding` with a packed layout.
    /// Attribute locations are assigned sequentially from `first_location`;
    /// the stride is the sum of all token sizes.
    pub fn bind_vertex_buffer(
        &mut self,
        binding: u32,
        buffer: &Buffer,
        first_location: u32,
        layout: &[VertexToken],
    ) -> Result<&mut Self> {
        let (vertex_binding, attributes) = derive_vertex_layout(binding, first_location, layout);
        self.vertex_input.bindings.retain(|b| b.binding != binding);
        self.vertex_input.bindings.push(vertex_binding);
        self.vertex_input.attributes.retain(|a| a.binding != binding);
        self.vertex_input.attributes.extend(attributes);
        self.vertex_input.bindings.sort_by_key(|b| b.binding);
        self.vertex_input
            .attributes
            .sort_by_key(|a| (a.binding, a.location));
        self.ptc
            .device()
            .cmd_bind_vertex_buffer(self.cb, binding, buffer.block, buffer.offset);
        Ok(self)
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &Buffer,
        index_type: IndexType,
    ) -> Result<&mut Self> {
        self.ptc
            .device()
            .cmd_bind_index_buffer(self.cb, buffer.block, buffer.offset, index_type);
        Ok(self)
    }

    // ── Descriptor binds ───────────────────────────────────────────────────

    fn bind_resource(&mut self, set: u32, binding: u32, bound: Bound) -> Result<()> {
        let state = self
            .sets
            .get_mut(set as usize)
            .ok_or(KilnError::InvalidRecording("descriptor set index out of range"))?;
        if let Some(entry) = state.entries.iter_mut().find(|(b, _)| *b == binding) {
            entry.1 = bound;
        } else {
            state.entries.push((binding, bound));
        }
        state.dirty = true;
        Ok(())
    }

    /// Binds a uniform buffer at `(set, binding)`.
    pub fn bind_uniform_buffer(
        &mut self,
        set: u32,
        binding: u32,
        buffer: &Buffer,
    ) -> Result<&mut Self> {
        self.bind_resource(set, binding, Bound::Uniform(*buffer))?;
        Ok(self)
    }

    /// Binds a sampled image at `(set, binding)`.
    pub fn bind_sampled_image(
        &mut self,
        set: u32,
        binding: u32,
        sampled: SampledImage,
    ) -> Result<&mut Self> {
        self.bind_resource(set, binding, Bound::Sampled(sampled))?;
        Ok(self)
    }

    /// Binds a graph attachment as a sampled image at `(set, binding)`,
    /// with sampler settings.
    pub fn bind_sampled_image_named(
        &mut self,
        set: u32,
        binding: u32,
        name: impl Into<Name>,
        sampler: SamplerDesc,
    ) -> Result<&mut Self> {
        let view = self.attachment(name.into())?.view;
        let sampler = self.ptc.acquire_sampler(&sampler)?;
        self.bind_resource(set, binding, Bound::Sampled(SampledImage { view, sampler }))?;
        Ok(self)
    }

    /// Scratch-allocates a uniform buffer of `T`, binds it at
    /// `(set, binding)` and returns a zero-initialized writable mapping.
    /// The pointer is valid only within the execute callback.
    pub fn map_scratch_uniform<T: Pod>(&mut self, set: u32, binding: u32) -> Result<&mut T> {
        let buffer = self.ptc.allocate_scratch_buffer(
            MemoryUsage::CpuToGpu,
            BufferUsage::UNIFORM,
            std::mem::size_of::<T>() as u64,
            256,
        )?;
        self.bind_resource(set, binding, Bound::Uniform(buffer))?;
        let ptr = buffer
            .mapped_ptr
            .expect("host-visible scratch is always mapped");
        let value = unsafe { &mut *ptr.as_ptr().cast::<T>() };
        *value = T::zeroed();
        Ok(value)
    }

    // ── Draws & dispatches ─────────────────────────────────────────────────

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<&mut Self> {
        self.flush_graphics_state()?;
        self.ptc
            .device()
            .cmd_draw(self.cb, vertex_count, instance_count, first_vertex, first_instance);
        Ok(self)
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<&mut Self> {
        self.flush_graphics_state()?;
        self.ptc.device().cmd_draw_indexed(
            self.cb,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        Ok(self)
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<&mut Self> {
        self.outside_pass()?;
        let pipeline = self
            .compute
            .clone()
            .ok_or(KilnError::NoPipelineBound)?;
        if self.bound_pipeline != Some(pipeline.pipeline) {
            self.ptc.device().cmd_bind_pipeline(
                self.cb,
                PipelineBindPoint::Compute,
                pipeline.pipeline,
            );
            self.bound_pipeline = Some(pipeline.pipeline);
        }
        self.flush_descriptor_sets(
            PipelineBindPoint::Compute,
            pipeline.layout,
            &pipeline.set_layouts,
        )?;
        self.ptc.device().cmd_dispatch(self.cb, x, y, z);
        Ok(self)
    }

    // ── Transfer commands (outside render passes) ──────────────────────────

    /// Resolves a multisampled attachment into a single-sampled one, by
    /// graph names.
    pub fn resolve_image(
        &mut self,
        src: impl Into<Name>,
        dst: impl Into<Name>,
    ) -> Result<&mut Self> {
        self.outside_pass()?;
        let src = *self.attachment(src.into())?;
        let dst = *self.attachment(dst.into())?;
        self.ptc.device().cmd_resolve_image(
            self.cb,
            src.image,
            dst.image,
            src.extent.into(),
        );
        Ok(self)
    }

    /// Blits a region between two graph attachments with an explicit
    /// filter.
    pub fn blit_image(
        &mut self,
        src: impl Into<Name>,
        dst: impl Into<Name>,
        blit: ImageBlit,
        filter: Filter,
    ) -> Result<&mut Self> {
        self.outside_pass()?;
        let src = *self.attachment(src.into())?;
        let dst = *self.attachment(dst.into())?;
        self.ptc.device().cmd_blit_image(
            self.cb,
            src.image,
            ImageLayout::TransferSrc,
            dst.image,
            ImageLayout::TransferDst,
            &blit,
            filter,
        );
        Ok(self)
    }

    // ── State flush ────────────────────────────────────────────────────────

    /// Derives and binds the concrete pipeline for the current base +
    /// render pass + vertex input, then materializes dirty descriptor sets.
    fn flush_graphics_state(&mut self) -> Result<()> {
        let scope = *self.in_pass()?;
        let base = self.base.clone().ok_or(KilnError::NoPipelineBound)?;

        let pipeline = self.ptc.acquire_pipeline_instance(&PipelineInstanceDesc {
            base: base.clone(),
            render_pass: scope.render_pass,
            subpass: scope.subpass,
            samples: scope.samples,
            vertex_input: self.vertex_input.clone(),
        })?;
        if self.bound_pipeline != Some(pipeline.pipeline) {
            self.ptc.device().cmd_bind_pipeline(
                self.cb,
                PipelineBindPoint::Graphics,
                pipeline.pipeline,
            );
            self.bound_pipeline = Some(pipeline.pipeline);
        }
        self.flush_descriptor_sets(PipelineBindPoint::Graphics, pipeline.layout, &base.set_layouts)
    }

    fn flush_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        pipeline_layout: crate::types::PipelineLayoutHandle,
        set_layouts: &[(DescriptorSetLayoutHandle, DescriptorSetLayoutDesc)],
    ) -> Result<()> {
        for (set_index, (layout, layout_desc)) in set_layouts.iter().enumerate() {
            if layout_desc.bindings.is_empty() {
                continue;
            }
            let state = self
                .sets
                .get_mut(set_index)
                .ok_or(KilnError::InvalidRecording("descriptor set index out of range"))?;
            if !state.dirty {
                continue;
            }

            let mut writes: SmallVec<[DescriptorWrite; 8]> = SmallVec::new();
            for binding in &layout_desc.bindings {
                let bound = state
                    .entries
                    .iter()
                    .find(|(b, _)| *b == binding.binding)
                    .map(|(_, bound)| *bound)
                    .ok_or(KilnError::InvalidRecording(
                        "pipeline expects a binding that was never bound",
                    ))?;
                writes.push(descriptor_write(binding.binding, binding.kind, bound)?);
            }
            writes.sort_by_key(|w| w.binding);

            let value = self.ptc.acquire_descriptor_set(&DescriptorSetDesc {
                layout: *layout,
                layout_desc: layout_desc.clone(),
                writes,
            })?;
            self.ptc.device().cmd_bind_descriptor_set(
                self.cb,
                bind_point,
                pipeline_layout,
                set_index as u32,
                value.set,
            );
            state.dirty = false;
        }
        Ok(())
    }
}

fn descriptor_write(binding: u32, kind: DescriptorKind, bound: Bound) -> Result<DescriptorWrite> {
    let resource = match (kind, bound) {
        (DescriptorKind::UniformBuffer | DescriptorKind::StorageBuffer, Bound::Uniform(buffer)) => {
            DescriptorResource::Buffer {
                block: buffer.block,
                offset: buffer.offset,
                range: buffer.size,
            }
        }
        (DescriptorKind::SampledImage | DescriptorKind::StorageImage, Bound::Sampled(sampled)) => {
            DescriptorResource::Image {
                view: sampled.view,
                sampler: sampled.sampler,
                layout: ImageLayout::ShaderReadOnly,
            }
        }
        _ => {
            return Err(KilnError::InvalidRecording(
                "bound resource does not match the binding's descriptor kind",
            ));
        }
    };
    Ok(DescriptorWrite { binding, kind, resource })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_layout_derives_stride_and_offsets() {
        // position (12 bytes), skip normal (12), uv (8).
        let tokens = [
            VertexToken::Format(Format::R32G32B32Sfloat),
            VertexToken::Skip(12),
            VertexToken::Format(Format::R32G32Sfloat),
        ];
        let (binding, attributes) = derive_vertex_layout(0, 0, &tokens);
        assert_eq!(binding.stride, 32);
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 24);
        assert_eq!(attributes[1].location, 1);
    }

    #[test]
    fn trailing_skip_pads_the_stride() {
        let tokens = [VertexToken::Format(Format::R32G32B32Sfloat), VertexToken::Skip(20)];
        let (binding, attributes) = derive_vertex_layout(0, 0, &tokens);
        assert_eq!(binding.stride, 32);
        assert_eq!(attributes.len(), 1);
    }
}
