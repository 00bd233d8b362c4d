//! Declarative Render Graphs
//!
//! A frame is described as a set of passes with named resource
//! dependencies. The engine materializes transient attachments from the
//! transient-image cache, opens render passes for framebuffer-forming
//! passes, performs layout transitions around transfer passes, and submits
//! the recorded work under the graphics-queue lock with a slot-pooled
//! fence.
//!
//! Passes execute in declaration order here; reordering and barrier
//! minimization belong to an external solver, for which this module is the
//! declared interface and the in-order executor the reference consumer.
//!
//! ```ignore
//! let mut rg = RenderGraph::new();
//! rg.attach_managed("color", Format::B8G8R8A8Srgb,
//!     Dimension::absolute(640, 480), Samples::X1,
//!     Some(ClearValue::Color([0.0; 4])));
//! rg.add_pass(Pass::new().resource("color", ImageAccess::ColorWrite).execute(
//!     |cbuf| {
//!         cbuf.set_viewport(Area::Framebuffer)?
//!             .bind_graphics_pipeline("triangle")?
//!             .draw(3, 1, 0, 0)?;
//!         Ok(())
//!     },
//! ));
//! execute_submit_and_wait(&mut ptc, rg)?;
//! ```

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::command::{CommandRecorder, RenderPassScope, ResolvedAttachment};
use crate::context::{PerThreadContext, Swapchain};
use crate::device::{AttachmentDesc, FramebufferDesc, GpuDevice, ImageDesc, ImageViewDesc, RenderPassDesc};
use crate::errors::{KilnError, Result};
use crate::name::Name;
use crate::types::{
    ClearValue, Extent2D, Extent3D, Format, ImageHandle, ImageLayout, ImageUsage,
    ImageViewHandle, LoadOp, Rect2D, Samples, StoreOp, Texture,
};

// ============================================================================
// Resource Usages
// ============================================================================

/// How a pass uses one named image resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ImageAccess {
    ColorWrite,
    ColorRead,
    ColorRw,
    DepthStencilRw,
    DepthStencilRead,
    TransferSrc,
    TransferDst,
    ShaderRead,
    ShaderSample,
    ComputeWrite,
    ComputeRead,
    ComputeRw,
}

impl ImageAccess {
    /// Whether this usage forms a framebuffer attachment (and so forces the
    /// pass inside a render pass).
    #[must_use]
    pub fn is_framebuffer(self) -> bool {
        matches!(
            self,
            Self::ColorWrite
                | Self::ColorRead
                | Self::ColorRw
                | Self::DepthStencilRw
                | Self::DepthStencilRead
        )
    }

    #[must_use]
    fn is_depth_stencil(self) -> bool {
        matches!(self, Self::DepthStencilRw | Self::DepthStencilRead)
    }

    /// The image usage flags this access implies on the physical image.
    #[must_use]
    pub fn implied_usage(self) -> ImageUsage {
        match self {
            Self::ColorWrite | Self::ColorRead | Self::ColorRw => ImageUsage::COLOR_ATTACHMENT,
            Self::DepthStencilRw | Self::DepthStencilRead => {
                ImageUsage::DEPTH_STENCIL_ATTACHMENT
            }
            Self::TransferSrc => ImageUsage::TRANSFER_SRC,
            Self::TransferDst => ImageUsage::TRANSFER_DST,
            Self::ShaderRead | Self::ShaderSample => ImageUsage::SAMPLED,
            Self::ComputeWrite | Self::ComputeRead | Self::ComputeRw => ImageUsage::STORAGE,
        }
    }

    /// The layout the image must be in while the pass runs.
    #[must_use]
    pub fn layout(self) -> ImageLayout {
        match self {
            Self::ColorWrite | Self::ColorRead | Self::ColorRw => ImageLayout::ColorAttachment,
            Self::DepthStencilRw => ImageLayout::DepthStencilAttachment,
            Self::DepthStencilRead => ImageLayout::DepthStencilRead,
            Self::TransferSrc => ImageLayout::TransferSrc,
            Self::TransferDst => ImageLayout::TransferDst,
            Self::ShaderRead | Self::ShaderSample => ImageLayout::ShaderReadOnly,
            Self::ComputeWrite | Self::ComputeRead | Self::ComputeRw => ImageLayout::General,
        }
    }
}

// ============================================================================
// Transient Images
// ============================================================================

/// Create-info of a transient attachment. Includes the graph name, so two
/// attachments with identical shapes stay distinct physical images within a
/// frame while each interns perfectly across frames.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TransientImageDesc {
    pub name: Name,
    pub format: Format,
    pub extent: Extent3D,
    pub samples: Samples,
    pub usage: ImageUsage,
}

/// A transient attachment's backing image and whole-image view.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TransientImage {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
}

impl TransientImage {
    pub(crate) fn create(device: &dyn GpuDevice, desc: &TransientImageDesc) -> Result<Self> {
        let image = device.create_image(&ImageDesc {
            format: desc.format,
            extent: desc.extent,
            mip_levels: 1,
            array_layers: 1,
            samples: desc.samples,
            usage: desc.usage,
        })?;
        let view = device.create_image_view(&ImageViewDesc::whole(image, desc.format, 1))?;
        Ok(Self { image, view })
    }
}

// ============================================================================
// Graph Declaration
// ============================================================================

/// Size of a managed attachment: absolute pixels, the framebuffer size, or
/// a fraction of it.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Dimension {
    Absolute { width: u32, height: u32 },
    Framebuffer,
    Scaled(f32),
}

impl Dimension {
    #[must_use]
    pub fn absolute(width: u32, height: u32) -> Self {
        Self::Absolute { width, height }
    }
}

/// One `(name, usage)` dependency of a pass.
#[derive(Clone, Copy, Debug)]
pub struct PassResource {
    pub name: Name,
    pub access: ImageAccess,
}

type ExecuteFn<'g> = Box<dyn FnOnce(&mut CommandRecorder<'_>) -> Result<()> + Send + 'g>;

/// One pass: an optional name, its resource dependencies, and the callback
/// that records its commands.
///
/// If any resource forms a framebuffer the callback runs inside a render
/// pass and may only issue draw-state commands; otherwise it runs outside
/// one and may only issue transfer commands.
pub struct Pass<'g> {
    name: Option<Name>,
    resources: SmallVec<[PassResource; 8]>,
    execute: Option<ExecuteFn<'g>>,
}

impl Default for Pass<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'g> Pass<'g> {
    #[must_use]
    pub fn new() -> Self {
        Self { name: None, resources: SmallVec::new(), execute: None }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<Name>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares that the pass uses `name` as `access`.
    #[must_use]
    pub fn resource(mut self, name: impl Into<Name>, access: ImageAccess) -> Self {
        self.resources.push(PassResource { name: name.into(), access });
        self
    }

    /// Sets the execute callback.
    #[must_use]
    pub fn execute(
        mut self,
        f: impl FnOnce(&mut CommandRecorder<'_>) -> Result<()> + Send + 'g,
    ) -> Self {
        self.execute = Some(Box::new(f));
        self
    }
}

enum BoundAttachment {
    Managed {
        format: Format,
        dimension: Dimension,
        samples: Samples,
        clear: Option<ClearValue>,
    },
    External {
        image: ImageHandle,
        view: ImageViewHandle,
        format: Format,
        samples: Samples,
        extent: Extent2D,
        clear: Option<ClearValue>,
    },
}

/// A declarative description of one frame: passes plus named attachments.
#[derive(Default)]
pub struct RenderGraph<'g> {
    passes: Vec<Pass<'g>>,
    attachments: FxHashMap<Name, BoundAttachment>,
}

impl<'g> RenderGraph<'g> {
    #[must_use]
    pub fn new() -> Self {
        Self { passes: Vec::new(), attachments: FxHashMap::default() }
    }

    pub fn add_pass(&mut self, pass: Pass<'g>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    /// Declares a transient attachment whose backing image the engine
    /// allocates from the transient-image cache.
    pub fn attach_managed(
        &mut self,
        name: impl Into<Name>,
        format: Format,
        dimension: Dimension,
        samples: Samples,
        clear: Option<ClearValue>,
    ) -> &mut Self {
        self.attachments.insert(
            name.into(),
            BoundAttachment::Managed { format, dimension, samples, clear },
        );
        self
    }

    /// Binds an application-owned texture under a graph name.
    pub fn attach_image(
        &mut self,
        name: impl Into<Name>,
        texture: &Texture,
        clear: Option<ClearValue>,
    ) -> &mut Self {
        self.attachments.insert(
            name.into(),
            BoundAttachment::External {
                image: texture.image,
                view: texture.view,
                format: texture.format,
                samples: texture.samples,
                extent: Extent2D { width: texture.extent.width, height: texture.extent.height },
                clear,
            },
        );
        self
    }

    /// Binds one backbuffer of a registered swapchain under a graph name.
    pub fn attach_swapchain(
        &mut self,
        name: impl Into<Name>,
        swapchain: &Swapchain,
        image_index: usize,
        clear: Option<ClearValue>,
    ) -> &mut Self {
        self.attachments.insert(
            name.into(),
            BoundAttachment::External {
                image: swapchain.images[image_index],
                view: swapchain.views[image_index],
                format: swapchain.format,
                samples: Samples::X1,
                extent: swapchain.extent,
                clear,
            },
        );
        self
    }
}

// ============================================================================
// In-Order Executor
// ============================================================================

struct AttachmentState {
    resolved: ResolvedAttachment,
    clear: Option<ClearValue>,
    layout: ImageLayout,
}

/// Records the graph into one primary command buffer and submits it on the
/// graphics queue behind a frame-pooled fence.
pub fn execute_submit(ptc: &mut PerThreadContext<'_, '_>, graph: RenderGraph<'_>) -> Result<()> {
    execute_submit_inner(ptc, graph)?;
    Ok(())
}

/// Like [`execute_submit`], then blocks until the submission's fence
/// signals.
pub fn execute_submit_and_wait(
    ptc: &mut PerThreadContext<'_, '_>,
    graph: RenderGraph<'_>,
) -> Result<()> {
    let fence = execute_submit_inner(ptc, graph)?;
    ptc.context().device().wait_fences(&[fence])?;
    Ok(())
}

fn execute_submit_inner(
    ptc: &mut PerThreadContext<'_, '_>,
    graph: RenderGraph<'_>,
) -> Result<crate::types::FenceHandle> {
    let mut states = resolve_attachments(ptc, &graph)?;
    let resolved: FxHashMap<Name, ResolvedAttachment> =
        states.iter().map(|(name, state)| (*name, state.resolved)).collect();

    let cb = ptc.acquire_command_buffer()?;
    let device = ptc.context().device().clone();
    device.begin_command_buffer(cb)?;

    for pass in graph.passes {
        if let Some(name) = pass.name {
            log::trace!("recording pass '{name}'");
        }
        let framebuffer_forming = pass.resources.iter().any(|r| r.access.is_framebuffer());
        if framebuffer_forming {
            record_raster_pass(ptc, &*device, cb, pass, &resolved, &mut states)?;
        } else {
            record_transfer_pass(ptc, &*device, cb, pass, &resolved, &mut states)?;
        }
    }

    device.end_command_buffer(cb)?;
    let fence = ptc.acquire_fence()?;
    ptc.context().submit_graphics(&[cb], Some(fence))?;
    Ok(fence)
}

fn resolve_attachments(
    ptc: &PerThreadContext<'_, '_>,
    graph: &RenderGraph<'_>,
) -> Result<FxHashMap<Name, AttachmentState>> {
    // Usage union per attachment over every pass that references it.
    let mut usages: FxHashMap<Name, ImageUsage> = FxHashMap::default();
    for pass in &graph.passes {
        for resource in &pass.resources {
            if !graph.attachments.contains_key(&resource.name) {
                return Err(KilnError::UnknownAttachment(resource.name));
            }
            *usages.entry(resource.name).or_default() |= resource.access.implied_usage();
        }
    }

    // The reference extent for framebuffer-relative dimensions: the first
    // external attachment, else the largest absolute managed one.
    let reference = graph.attachments.values().find_map(|a| match a {
        BoundAttachment::External { extent, .. } => Some(*extent),
        BoundAttachment::Managed { .. } => None,
    });
    let reference = reference.or_else(|| {
        graph
            .attachments
            .values()
            .filter_map(|a| match a {
                BoundAttachment::Managed {
                    dimension: Dimension::Absolute { width, height },
                    ..
                } => Some(Extent2D { width: *width, height: *height }),
                _ => None,
            })
            .max_by_key(|e| u64::from(e.width) * u64::from(e.height))
    });

    let mut states = FxHashMap::default();
    for (name, bound) in &graph.attachments {
        let state = match bound {
            BoundAttachment::External { image, view, format, samples, extent, clear } => {
                AttachmentState {
                    resolved: ResolvedAttachment {
                        image: *image,
                        view: *view,
                        format: *format,
                        samples: *samples,
                        extent: *extent,
                    },
                    clear: *clear,
                    layout: ImageLayout::Undefined,
                }
            }
            BoundAttachment::Managed { format, dimension, samples, clear } => {
                let extent = match *dimension {
                    Dimension::Absolute { width, height } => Extent2D { width, height },
                    Dimension::Framebuffer => reference.ok_or(KilnError::InvalidRecording(
                        "framebuffer-relative attachment with no reference extent",
                    ))?,
                    Dimension::Scaled(factor) => {
                        let reference = reference.ok_or(KilnError::InvalidRecording(
                            "framebuffer-relative attachment with no reference extent",
                        ))?;
                        Extent2D {
                            width: ((reference.width as f32) * factor).max(1.0) as u32,
                            height: ((reference.height as f32) * factor).max(1.0) as u32,
                        }
                    }
                };
                let usage = usages.get(name).copied().unwrap_or_default();
                let transient = ptc.acquire_transient_image(&TransientImageDesc {
                    name: *name,
                    format: *format,
                    extent: extent.into(),
                    samples: *samples,
                    usage,
                })?;
                AttachmentState {
                    resolved: ResolvedAttachment {
                        image: transient.image,
                        view: transient.view,
                        format: *format,
                        samples: *samples,
                        extent,
                    },
                    clear: *clear,
                    layout: ImageLayout::Undefined,
                }
            }
        };
        states.insert(*name, state);
    }
    Ok(states)
}

fn record_raster_pass(
    ptc: &PerThreadContext<'_, '_>,
    device: &dyn GpuDevice,
    cb: crate::types::CommandBufferHandle,
    pass: Pass<'_>,
    resolved: &FxHashMap<Name, ResolvedAttachment>,
    states: &mut FxHashMap<Name, AttachmentState>,
) -> Result<()> {
    let mut color: SmallVec<[&PassResource; 4]> = SmallVec::new();
    let mut depth_stencil: Option<&PassResource> = None;
    for resource in &pass.resources {
        if resource.access.is_depth_stencil() {
            if depth_stencil.is_some() {
                return Err(KilnError::InvalidRecording(
                    "a pass may form at most one depth-stencil attachment",
                ));
            }
            depth_stencil = Some(resource);
        } else if resource.access.is_framebuffer() {
            color.push(resource);
        }
    }

    // All framebuffer-forming attachments must agree on extent and sample
    // count; both become properties of the render pass scope.
    let mut extent: Option<Extent2D> = None;
    let mut samples: Option<Samples> = None;
    for resource in color.iter().copied().chain(depth_stencil) {
        let state = &states[&resource.name];
        if *extent.get_or_insert(state.resolved.extent) != state.resolved.extent {
            return Err(KilnError::InvalidRecording(
                "framebuffer attachments disagree on extent",
            ));
        }
        if *samples.get_or_insert(state.resolved.samples) != state.resolved.samples {
            return Err(KilnError::InvalidRecording(
                "framebuffer attachments disagree on sample count",
            ));
        }
    }
    let extent = extent.expect("raster pass has at least one attachment");
    let samples = samples.expect("raster pass has at least one attachment");

    let mut attachment_descs: SmallVec<[AttachmentDesc; 4]> = SmallVec::new();
    let mut views: SmallVec<[ImageViewHandle; 5]> = SmallVec::new();
    let mut clear_values: Vec<ClearValue> = Vec::new();
    let mut ds_desc = None;

    for resource in color.iter().copied().chain(depth_stencil) {
        let state = states.get_mut(&resource.name).expect("resolved above");
        let first_use = state.layout == ImageLayout::Undefined;
        let load_op = if first_use && state.clear.is_some() {
            LoadOp::Clear
        } else if first_use {
            LoadOp::DontCare
        } else {
            LoadOp::Load
        };
        let target_layout = resource.access.layout();
        let desc = AttachmentDesc {
            format: state.resolved.format,
            samples,
            load_op,
            store_op: StoreOp::Store,
            initial_layout: state.layout,
            final_layout: target_layout,
        };
        if resource.access.is_depth_stencil() {
            ds_desc = Some(desc);
        } else {
            attachment_descs.push(desc);
        }
        views.push(state.resolved.view);
        clear_values.push(state.clear.unwrap_or(ClearValue::Color([0.0; 4])));
        state.layout = target_layout;
    }

    let render_pass = ptc.acquire_render_pass(&RenderPassDesc {
        color: attachment_descs,
        depth_stencil: ds_desc,
    })?;
    let framebuffer = ptc.acquire_framebuffer(&FramebufferDesc {
        render_pass,
        attachments: views,
        width: extent.width,
        height: extent.height,
        layers: 1,
    })?;

    device.cmd_begin_render_pass(cb, render_pass, framebuffer, Rect2D::whole(extent), &clear_values);
    if let Some(execute) = pass.execute {
        let scope = RenderPassScope { render_pass, subpass: 0, samples, extent };
        let mut recorder = CommandRecorder::new(ptc, cb, resolved, Some(scope));
        execute(&mut recorder)?;
    }
    device.cmd_end_render_pass(cb);
    Ok(())
}

fn record_transfer_pass(
    ptc: &PerThreadContext<'_, '_>,
    device: &dyn GpuDevice,
    cb: crate::types::CommandBufferHandle,
    pass: Pass<'_>,
    resolved: &FxHashMap<Name, ResolvedAttachment>,
    states: &mut FxHashMap<Name, AttachmentState>,
) -> Result<()> {
    // Outside a render pass the engine owns the transitions: bring every
    // declared resource into the layout its usage requires.
    for resource in &pass.resources {
        let state = states.get_mut(&resource.name).expect("resolved above");
        let target = resource.access.layout();
        if state.layout != target {
            device.cmd_transition_image(cb, state.resolved.image, 0, 1, state.layout, target);
            state.layout = target;
        }
    }

    if let Some(execute) = pass.execute {
        let mut recorder = CommandRecorder::new(ptc, cb, resolved, None);
        execute(&mut recorder)?;
    }
    Ok(())
}
