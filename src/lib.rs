//! Kiln: a frame-pipelined rendering core for explicit GPU APIs.
//!
//! Applications describe a frame as a small declarative render graph, a
//! set of passes with named resource dependencies, and the engine
//! schedules the recorded work, allocates and reuses transient GPU
//! resources, inserts the layout transitions it owns, and manages resource
//! lifetime across a three-deep pipeline of in-flight frames.
//!
//! # Architecture
//!
//! | Scope | Type | Role |
//! |-------|------|------|
//! | Process | [`Context`] | caches, pools, destroy queues, registries |
//! | Frame | [`InflightContext`] | one frame slot, transfer queues |
//! | Thread | [`PerThreadContext`] | the user-facing recording API |
//!
//! The GPU API itself is an external collaborator expressed as the
//! [`GpuDevice`](device::GpuDevice) trait; production backends bind a real
//! driver, tests drive a recording mock.
//!
//! ```ignore
//! let ctx = Context::new(device, ContextDesc::default());
//! ctx.create_named_pipeline("cube", pipeline_desc)?;
//!
//! let ifc = ctx.begin()?;
//! let mut ptc = ifc.begin()?;
//! let (verts, t1) = ptc.create_scratch_buffer(
//!     MemoryUsage::GpuOnly, BufferUsage::VERTEX, &vertices)?;
//! ptc.wait_all_transfers()?;
//!
//! let mut rg = RenderGraph::new();
//! rg.attach_managed("color", format, Dimension::absolute(640, 480),
//!     Samples::X1, Some(ClearValue::Color([0.0; 4])));
//! rg.add_pass(Pass::new().resource("color", ImageAccess::ColorWrite)
//!     .execute(move |cbuf| {
//!         cbuf.set_viewport(Area::Framebuffer)?
//!             .bind_vertex_buffer(0, &verts, 0, &layout)?
//!             .bind_graphics_pipeline("cube")?
//!             .draw(36, 1, 0, 0)?;
//!         Ok(())
//!     }));
//! graph::execute_submit(&mut ptc, rg)?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod cache;
pub mod command;
pub mod context;
pub mod device;
pub mod errors;
pub mod graph;
pub mod name;
pub mod per_frame_cache;
pub mod pipeline;
pub mod pool;
pub mod scratch;
pub mod types;

/// The depth of the in-flight frame pipeline. A resource enqueued for
/// destruction at frame F is physically destroyed when its slot is
/// re-entered, no earlier than F + `FRAME_COUNT` frames later.
pub const FRAME_COUNT: usize = 3;

pub use command::{CommandRecorder, VertexToken};
pub use context::{
    Context, ContextDesc, InflightContext, PerThreadContext, PersistentDescriptorSet, Swapchain,
    SwapchainKey, TransferTicket, Unique,
};
pub use errors::{KilnError, Result};
pub use graph::{Dimension, ImageAccess, Pass, RenderGraph, execute_submit, execute_submit_and_wait};
pub use name::Name;
pub use pipeline::{ComputePipelineDesc, PipelineBase, PipelineBaseDesc};
pub use types::{
    Area, Buffer, BufferUsage, ClearValue, Extent2D, Extent3D, Filter, Format, ImageUsage,
    IndexType, MemoryUsage, SampledImage, SamplerDesc, Samples, Texture,
};
