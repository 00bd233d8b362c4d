//! Cache Tests
//!
//! Tests for:
//! - Interning: equal create-infos resolve to the same pipeline base
//! - Shader compilation failure: surfaced with path and message, never
//!   negatively cached, recoverable with a corrected source
//! - Named pipeline registration: idempotent, conflicting re-registration
//!   rejected
//! - Transient image recycling across frames with threshold eviction
//! - Pipeline cache blob round-trip

mod common;

use std::sync::Arc;

use common::{Event, MockGpu};
use kiln::graph::{Dimension, ImageAccess, Pass, RenderGraph, execute_submit};
use kiln::{
    ClearValue, CommandRecorder, Context, ContextDesc, Format, KilnError, PipelineBaseDesc,
    Samples,
};

fn cube_pipeline() -> PipelineBaseDesc {
    let mut desc = PipelineBaseDesc::new();
    desc.add_shader("@uniform 0 0\n", "cube.vert")
        .add_shader("@sampled 0 1\n", "cube.frag");
    desc
}

// ============================================================================
// Interning
// ============================================================================

#[test]
fn equal_create_infos_intern_to_one_base() {
    let mock = MockGpu::new();
    let ctx = Context::new(mock.clone(), ContextDesc::default());

    let a = ctx.get_pipeline(&cube_pipeline()).unwrap();
    let b = ctx.get_pipeline(&cube_pipeline()).unwrap();
    assert!(Arc::ptr_eq(&a, &b), "same create-info must return the interned base");
    assert_eq!(
        mock.count(|e| matches!(e, Event::CompileShader { .. })),
        2,
        "each distinct shader compiles once"
    );
}

#[test]
fn shader_modules_are_shared_between_bases() {
    let mock = MockGpu::new();
    let ctx = Context::new(mock.clone(), ContextDesc::default());

    ctx.get_pipeline(&cube_pipeline()).unwrap();

    // A second base sharing the vertex shader but with its own fragment
    // shader only compiles the new stage.
    let mut other = PipelineBaseDesc::new();
    other
        .add_shader("@uniform 0 0\n", "cube.vert")
        .add_shader("@sampled 0 2\n", "other.frag");
    ctx.get_pipeline(&other).unwrap();

    assert_eq!(mock.count(|e| matches!(e, Event::CompileShader { .. })), 3);
}

// ============================================================================
// Shader Compilation Failure
// ============================================================================

#[test]
fn failed_compilation_surfaces_message_and_is_not_cached() {
    let mock = MockGpu::new();
    let ctx = Context::new(mock.clone(), ContextDesc::default());

    let mut broken = PipelineBaseDesc::new();
    broken.add_shader("!error expected ';' on line 12\n", "broken.vert");

    match ctx.get_pipeline(&broken) {
        Err(KilnError::ShaderCompilation { path, message }) => {
            assert_eq!(path, "broken.vert");
            assert!(message.contains("expected ';'"));
        }
        other => panic!("expected a shader compilation error, got {other:?}"),
    }

    // No negative caching: the same create-info re-invokes the compiler.
    assert!(ctx.get_pipeline(&broken).is_err());
    assert_eq!(
        mock.count(|e| matches!(e, Event::CompileShader { path } if path == "broken.vert")),
        2
    );

    // A corrected source succeeds and is cached.
    let mut fixed = PipelineBaseDesc::new();
    fixed.add_shader("@uniform 0 0\n", "broken.vert");
    let a = ctx.get_pipeline(&fixed).unwrap();
    let b = ctx.get_pipeline(&fixed).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

// ============================================================================
// Named Pipelines
// ============================================================================

#[test]
fn named_pipeline_registration_is_idempotent() {
    let mock = MockGpu::new();
    let ctx = Context::new(mock.clone(), ContextDesc::default());

    let a = ctx.create_named_pipeline("cube", cube_pipeline()).unwrap();
    let b = ctx.create_named_pipeline("cube", cube_pipeline()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &ctx.get_named_pipeline("cube").unwrap()));
}

#[test]
fn conflicting_named_pipeline_is_rejected() {
    let mock = MockGpu::new();
    let ctx = Context::new(mock.clone(), ContextDesc::default());

    ctx.create_named_pipeline("cube", cube_pipeline()).unwrap();

    let mut different = PipelineBaseDesc::new();
    different.add_shader("@uniform 1 0\n", "different.vert");
    match ctx.create_named_pipeline("cube", different) {
        Err(KilnError::NamedPipelineConflict(name)) => assert_eq!(name.as_str(), "cube"),
        other => panic!("expected a conflict error, got {other:?}"),
    }

    assert!(ctx.get_named_pipeline("missing").is_none());
}

// ============================================================================
// Transient Image Recycling
// ============================================================================

fn one_pass_graph(name: &str) -> RenderGraph<'static> {
    let mut rg = RenderGraph::new();
    rg.attach_managed(
        name,
        Format::B8G8R8A8Srgb,
        Dimension::absolute(128, 128),
        Samples::X1,
        Some(ClearValue::Color([0.0; 4])),
    );
    rg.add_pass(
        Pass::new()
            .resource(name, ImageAccess::ColorWrite)
            .execute(|_cbuf: &mut CommandRecorder| Ok(())),
    );
    rg
}

#[test]
fn transient_image_interns_across_frames_and_expires_by_threshold() {
    let mock = MockGpu::new();
    let ctx = Context::new(
        mock.clone(),
        ContextDesc { transient_image_frames: 2, ..ContextDesc::default() },
    );

    // Three frames each request the transient image "x" with the same
    // create-info: exactly one physical image, no destruction.
    for _ in 0..3 {
        let ifc = ctx.begin().unwrap();
        let mut ptc = ifc.begin().unwrap();
        execute_submit(&mut ptc, one_pass_graph("x")).unwrap();
        drop(ptc);
        drop(ifc);
    }
    assert_eq!(
        mock.count(|e| matches!(e, Event::CreateImage { .. })),
        1,
        "one physical image serves all three frames"
    );
    assert_eq!(mock.count(|e| matches!(e, Event::DestroyImage(_))), 0);

    // Skip "x" for four more frames with a collection threshold of 2: one
    // destruction once the threshold is exceeded.
    for _ in 0..4 {
        let ifc = ctx.begin().unwrap();
        drop(ifc);
    }
    assert_eq!(
        mock.count(|e| matches!(e, Event::DestroyImage(_))),
        1,
        "exactly one destruction once the image went stale"
    );
}

// ============================================================================
// Pipeline Cache Blob
// ============================================================================

#[test]
fn pipeline_cache_blob_round_trips() {
    let mock = MockGpu::new();
    let ctx = Context::new(mock.clone(), ContextDesc::default());

    let blob = vec![0xAB_u8, 0xCD, 0x01, 0x02, 0x03];
    ctx.load_pipeline_cache(&blob).unwrap();
    assert_eq!(
        ctx.save_pipeline_cache().unwrap(),
        blob,
        "the blob is an opaque byte-for-byte passthrough"
    );
}
