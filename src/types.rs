//! Core Value Types
//!
//! Plain data types shared by the whole engine: formats, extents, usage
//! flags, image layouts, clear values, and the handle newtypes under which
//! the device hands out GPU objects.
//!
//! Every type here is structurally hashable and equality-comparable so it
//! can participate in create-info cache keys, and none carries pointers into
//! caller memory (the one exception, [`Buffer::mapped_ptr`], points at
//! engine-owned mapped memory and is excluded from identity).

use std::num::NonZeroU64;
use std::ptr::NonNull;

use bitflags::bitflags;

// ============================================================================
// Handles
// ============================================================================

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub NonZeroU64);

        impl $name {
            /// Constructs a handle from a raw non-zero id.
            ///
            /// # Panics
            /// Panics if `id` is zero.
            #[must_use]
            pub fn from_raw(id: u64) -> Self {
                Self(NonZeroU64::new(id).expect("handle id must be non-zero"))
            }

            /// Returns the raw id.
            #[must_use]
            #[inline]
            pub fn id(self) -> u64 {
                self.0.get()
            }
        }
    };
}

define_handle!(
    /// A GPU image.
    ImageHandle
);
define_handle!(
    /// A view over a subresource range of an image.
    ImageViewHandle
);
define_handle!(
    /// An immutable sampler object.
    SamplerHandle
);
define_handle!(
    /// A compiled shader module.
    ShaderModuleHandle
);
define_handle!(
    /// A graphics or compute pipeline.
    PipelineHandle
);
define_handle!(
    /// A pipeline layout.
    PipelineLayoutHandle
);
define_handle!(
    /// A descriptor-set layout.
    DescriptorSetLayoutHandle
);
define_handle!(
    /// A descriptor pool.
    DescriptorPoolHandle
);
define_handle!(
    /// A descriptor set.
    DescriptorSetHandle
);
define_handle!(
    /// A render pass object.
    RenderPassHandle
);
define_handle!(
    /// A framebuffer object.
    FramebufferHandle
);
define_handle!(
    /// A CPU-waitable fence.
    FenceHandle
);
define_handle!(
    /// A binary semaphore.
    SemaphoreHandle
);
define_handle!(
    /// A command pool.
    CommandPoolHandle
);
define_handle!(
    /// A primary command buffer.
    CommandBufferHandle
);
define_handle!(
    /// A backing GPU memory block from which buffers are sub-allocated.
    MemoryBlockHandle
);

// ============================================================================
// Formats & Geometry
// ============================================================================

/// Texel and vertex-attribute formats.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Format {
    R8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Srgb,
    R16G16B16A16Sfloat,
    R32Sfloat,
    R32G32Sfloat,
    R32G32B32Sfloat,
    R32G32B32A32Sfloat,
    D32Sfloat,
    D24UnormS8Uint,
}

impl Format {
    /// Byte size of one texel (or one vertex attribute) of this format.
    #[must_use]
    pub fn block_size(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::R8G8B8A8Unorm | Self::R8G8B8A8Srgb | Self::B8G8R8A8Srgb => 4,
            Self::R32Sfloat | Self::D32Sfloat | Self::D24UnormS8Uint => 4,
            Self::R16G16B16A16Sfloat | Self::R32G32Sfloat => 8,
            Self::R32G32B32Sfloat => 12,
            Self::R32G32B32A32Sfloat => 16,
        }
    }

    /// Whether this format carries depth and/or stencil aspects.
    #[must_use]
    pub fn is_depth_stencil(self) -> bool {
        matches!(self, Self::D32Sfloat | Self::D24UnormS8Uint)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    #[must_use]
    #[inline]
    pub fn flat(width: u32, height: u32) -> Self {
        Self { width, height, depth: 1 }
    }

    /// Extent of mip level `level`, clamped to 1 texel per axis.
    #[must_use]
    pub fn mip(self, level: u32) -> Self {
        Self {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
            depth: (self.depth >> level).max(1),
        }
    }
}

impl From<Extent2D> for Extent3D {
    fn from(e: Extent2D) -> Self {
        Self::flat(e.width, e.height)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Offset2D {
    pub x: i32,
    pub y: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Offset3D {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Rect2D {
    pub offset: Offset2D,
    pub extent: Extent2D,
}

impl Rect2D {
    #[must_use]
    pub fn whole(extent: Extent2D) -> Self {
        Self { offset: Offset2D::default(), extent }
    }
}

/// A viewport or scissor area, either absolute or covering the current
/// framebuffer. The framebuffer variant is resolved by the command recorder
/// against the enclosing render pass.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Area {
    Framebuffer,
    Absolute(Rect2D),
}

/// Returns the number of mip levels generated for `extent` by the transfer
/// pump's blit chain: `floor(log2(max_dim))`, at least 1. A 256x256 image
/// yields 8 levels (256 down to 2).
#[must_use]
pub fn mip_level_count(extent: Extent3D) -> u32 {
    let max_dim = extent.width.max(extent.height).max(extent.depth).max(1);
    (31 - max_dim.leading_zeros()).max(1)
}

// ============================================================================
// Usage Flags & Memory
// ============================================================================

bitflags! {
    /// Requested buffer usages.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM      = 1 << 2;
        const STORAGE      = 1 << 3;
        const INDEX        = 1 << 4;
        const VERTEX       = 1 << 5;
        const INDIRECT     = 1 << 6;
    }
}

bitflags! {
    /// Requested image usages.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC             = 1 << 0;
        const TRANSFER_DST             = 1 << 1;
        const SAMPLED                  = 1 << 2;
        const STORAGE                  = 1 << 3;
        const COLOR_ATTACHMENT         = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
    }
}

bitflags! {
    /// Shader stages a binding is visible to.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX   = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE  = 1 << 2;
    }
}

/// The memory class an allocation is served from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryUsage {
    /// Device-local memory; uploads go through the transfer pump.
    GpuOnly,
    /// Host-visible, device-local where available; persistently mapped.
    CpuToGpu,
    /// Host memory; persistently mapped. Used for staging.
    CpuOnly,
}

impl MemoryUsage {
    /// Whether blocks of this class carry a persistent CPU mapping.
    #[must_use]
    #[inline]
    pub fn is_mapped(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

// ============================================================================
// Image State
// ============================================================================

/// Image layouts, transitioned by the engine around transfers and render
/// passes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilRead,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Samples {
    X1,
    X2,
    X4,
    X8,
    X16,
}

impl Samples {
    #[must_use]
    pub fn count(self) -> u32 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
            Self::X16 => 16,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IndexType {
    U16,
    U32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CompareOp {
    Never,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Equal,
    Always,
}

/// A mip level and layer range inside an image, for copies and blits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ImageSubresourceLayers {
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl Default for ImageSubresourceLayers {
    fn default() -> Self {
        Self { mip_level: 0, base_layer: 0, layer_count: 1 }
    }
}

/// One image-to-image blit region.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ImageBlit {
    pub src_subresource: ImageSubresourceLayers,
    pub src_offsets: [Offset3D; 2],
    pub dst_subresource: ImageSubresourceLayers,
    pub dst_offsets: [Offset3D; 2],
}

/// One buffer-to-image copy region.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub image_subresource: ImageSubresourceLayers,
    pub image_offset: Offset3D,
    pub image_extent: Extent3D,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

// ============================================================================
// Samplers
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MipmapMode {
    Nearest,
    Linear,
}

/// Sampler create-info. Fully determines a sampler; used as a cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_mode: MipmapMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    /// Max anisotropy, or `None` to disable anisotropic filtering.
    pub anisotropy: Option<u8>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mipmap_mode: MipmapMode::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            anisotropy: None,
        }
    }
}

// ============================================================================
// Buffers, Textures, Sampled Images
// ============================================================================

/// A sub-region of a GPU memory block.
///
/// Sub-buffers handed out by the scratch allocators share their lifetime
/// with the backing block; buffers with `owns_block` set own the block and
/// release it when destroyed. The `buffer_id` is a process-wide unique id
/// used for state de-duplication in the command recorder.
#[derive(Clone, Copy, Debug)]
pub struct Buffer {
    pub block: MemoryBlockHandle,
    pub buffer_id: u64,
    pub offset: u64,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryUsage,
    /// Pointer to this sub-range inside the block's persistent mapping, when
    /// the memory class is host-visible.
    pub mapped_ptr: Option<NonNull<u8>>,
    /// Whether destroying this buffer releases the backing block.
    pub owns_block: bool,
}

// The mapped pointer targets engine-owned, persistently mapped memory whose
// lifetime is managed by the frame pipeline, not by the thread that created
// the view.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Writes `data` through the persistent mapping.
    ///
    /// # Panics
    /// Panics if the buffer is not mapped or `data` exceeds its size.
    pub fn write_mapped(&self, data: &[u8]) {
        assert!(data.len() as u64 <= self.size, "mapped write out of bounds");
        let ptr = self.mapped_ptr.expect("buffer is not host-visible");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
        }
    }
}

/// An exclusive (image, image view) pair owned by one party.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Texture {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
    pub format: Format,
    pub extent: Extent3D,
    pub mip_levels: u32,
    pub samples: Samples,
}

/// An image view paired with a sampler, ready to bind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SampledImage {
    pub view: ImageViewHandle,
    pub sampler: SamplerHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_counts() {
        assert_eq!(mip_level_count(Extent3D::flat(256, 256)), 8);
        assert_eq!(mip_level_count(Extent3D::flat(300, 300)), 8);
        assert_eq!(mip_level_count(Extent3D::flat(1, 1)), 1);
        assert_eq!(mip_level_count(Extent3D::flat(1024, 512)), 10);
    }

    #[test]
    fn mip_extents_clamp_to_one() {
        let e = Extent3D::flat(256, 64);
        assert_eq!(e.mip(1), Extent3D::flat(128, 32));
        assert_eq!(e.mip(7), Extent3D::flat(2, 1));
    }
}
