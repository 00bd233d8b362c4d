//! Pipelines and Pipeline Derivation
//!
//! A *pipeline base* aggregates shader modules and fixed-function state.
//! Concrete pipelines are derived from a base plus the render-pass-and-
//! subpass state supplied at draw time; one base produces many concrete
//! pipelines, one per render-pass signature it is drawn against, and the
//! cache keys each concrete pipeline by the exact device-level create-info
//! so reuse across frames is perfect.
//!
//! Shader modules are cached by a content hash of their source, so two
//! bases sharing a shader share the compiled module.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use crate::device::{
    BlendPreset, DepthState, DescriptorSetLayoutDesc, PrimitiveTopology, Program, RasterState,
    ShaderStageDesc, VertexInputState,
};
use crate::types::{
    DescriptorSetLayoutHandle, PipelineHandle, PipelineLayoutHandle, RenderPassHandle, Samples,
    ShaderModuleHandle, ShaderStages,
};

// ============================================================================
// Shader Modules
// ============================================================================

/// One shader source as supplied by the application.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ShaderSource {
    pub source: String,
    /// Identifies the source in compiler diagnostics.
    pub path: String,
}

impl ShaderSource {
    #[must_use]
    pub fn new(source: impl Into<String>, path: impl Into<String>) -> Self {
        Self { source: source.into(), path: path.into() }
    }

    /// Cache key for the compiled module: a content hash of the source
    /// plus the diagnostic path.
    #[must_use]
    pub fn key(&self) -> ShaderModuleKey {
        ShaderModuleKey { code_hash: xxh3_64(self.source.as_bytes()), path: self.path.clone() }
    }
}

/// Content-addressed key of a compiled shader module.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ShaderModuleKey {
    pub code_hash: u64,
    pub path: String,
}

/// A compiled shader module together with its reflected interface.
#[derive(Clone, Debug)]
pub struct ShaderModule {
    pub module: ShaderModuleHandle,
    pub stage: ShaderStages,
    pub program: Arc<Program>,
}

// ============================================================================
// Pipeline Bases
// ============================================================================

/// Create-info for a pipeline base: shader sources plus fixed-function
/// state. Structurally hashable; fully determines the base.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct PipelineBaseDesc {
    pub shaders: Vec<ShaderSource>,
    pub topology: Option<PrimitiveTopology>,
    pub raster: RasterState,
    pub depth: DepthState,
    pub blend: BlendPreset,
}

impl PipelineBaseDesc {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one shader stage by source text.
    pub fn add_shader(&mut self, source: impl Into<String>, path: impl Into<String>) -> &mut Self {
        self.shaders.push(ShaderSource::new(source, path));
        self
    }
}

/// The interior of a [`PipelineBase`].
#[derive(Debug)]
pub struct PipelineBaseData {
    /// Process-wide unique id; keys derived concrete pipelines.
    pub id: u64,
    pub stages: SmallVec<[ShaderStageDesc; 2]>,
    /// Merged reflection of all stages.
    pub program: Arc<Program>,
    pub set_layouts: SmallVec<[(DescriptorSetLayoutHandle, DescriptorSetLayoutDesc); 4]>,
    pub layout: PipelineLayoutHandle,
    pub topology: PrimitiveTopology,
    pub raster: RasterState,
    pub depth: DepthState,
    pub blend: BlendPreset,
}

/// A shared pipeline base. Cloning shares the interned instance, so cache
/// interning stays observable through [`Arc::ptr_eq`].
pub type PipelineBase = Arc<PipelineBaseData>;

// ============================================================================
// Concrete Pipelines
// ============================================================================

/// Create-info for a concrete pipeline: a base plus everything only known
/// at draw time. Hashes and compares by the base's unique id.
#[derive(Clone, Debug)]
pub struct PipelineInstanceDesc {
    pub base: PipelineBase,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub samples: Samples,
    pub vertex_input: VertexInputState,
}

impl PartialEq for PipelineInstanceDesc {
    fn eq(&self, other: &Self) -> bool {
        self.base.id == other.base.id
            && self.render_pass == other.render_pass
            && self.subpass == other.subpass
            && self.samples == other.samples
            && self.vertex_input == other.vertex_input
    }
}

impl Eq for PipelineInstanceDesc {}

impl Hash for PipelineInstanceDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base.id.hash(state);
        self.render_pass.hash(state);
        self.subpass.hash(state);
        self.samples.hash(state);
        self.vertex_input.hash(state);
    }
}

/// A concrete graphics pipeline derived from a base.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GraphicsPipeline {
    pub pipeline: PipelineHandle,
    pub layout: PipelineLayoutHandle,
    pub base_id: u64,
}

// ============================================================================
// Compute Pipelines
// ============================================================================

/// Create-info for a compute pipeline: a single compute shader source.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ComputePipelineDesc {
    pub shader: ShaderSource,
}

/// A compute pipeline; carries its reflection for descriptor construction.
#[derive(Clone, Debug)]
pub struct ComputePipeline {
    pub pipeline: PipelineHandle,
    pub layout: PipelineLayoutHandle,
    pub program: Arc<Program>,
    pub set_layouts: SmallVec<[(DescriptorSetLayoutHandle, DescriptorSetLayoutDesc); 4]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_keys_are_content_addressed() {
        let a = ShaderSource::new("void main() {}", "a.vert");
        let b = ShaderSource::new("void main() {}", "a.vert");
        let c = ShaderSource::new("void main() { }", "a.vert");
        assert_eq!(a.key(), b.key(), "same source and path, same module");
        assert_ne!(a.key(), c.key(), "different source, different module");
    }

    #[test]
    fn base_desc_accumulates_shaders() {
        let mut desc = PipelineBaseDesc::new();
        desc.add_shader("vs", "cube.vert").add_shader("fs", "cube.frag");
        assert_eq!(desc.shaders.len(), 2);
        assert_eq!(desc.shaders[1].path, "cube.frag");
    }
}
