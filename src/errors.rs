//! Error Types
//!
//! This module defines the error types used throughout the engine.
//!
//! # Overview
//!
//! The main error type [`KilnError`] covers all failure modes including:
//! - Shader compilation failures (surfaced with the failing source path)
//! - Device errors reported by the GPU driver
//! - Host or device memory exhaustion
//! - Recording contract violations detected by the command recorder
//!
//! All public APIs return [`Result<T>`], an alias for
//! `std::result::Result<T, KilnError>`.
//!
//! The engine performs no recovery of GPU errors: a device error aborts the
//! frame and is propagated to the caller. Caches never retain a failed entry;
//! a failed creation leaves the owning map unchanged.

use thiserror::Error;

use crate::name::Name;

/// The main error type for the Kiln engine.
#[derive(Error, Debug)]
pub enum KilnError {
    // ========================================================================
    // Shader & Pipeline Errors
    // ========================================================================
    /// Shader compilation failed. Carries the source path handed to the
    /// compiler and the compiler's message. Never cached: retrying the same
    /// create-info re-invokes the compiler.
    #[error("Shader compilation failed for '{path}': {message}")]
    ShaderCompilation {
        /// The source path passed alongside the shader source.
        path: String,
        /// The compiler's diagnostic output.
        message: String,
    },

    /// A named pipeline was re-registered under the same name with a
    /// different create-info.
    #[error("Named pipeline '{0}' already exists with a different create-info")]
    NamedPipelineConflict(Name),

    /// A pipeline was requested by a name that was never registered.
    #[error("No pipeline registered under the name '{0}'")]
    UnknownPipeline(Name),

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// The device or host allocator reported memory exhaustion. Not retried
    /// internally.
    #[error("Out of {0} memory")]
    OutOfMemory(&'static str),

    /// A render graph referenced an attachment name that was never attached.
    #[error("Render graph references unknown attachment '{0}'")]
    UnknownAttachment(Name),

    // ========================================================================
    // Recording Errors
    // ========================================================================
    /// A command invalid for the current render-pass state was recorded,
    /// or a pass's resources were bound inconsistently.
    #[error("Invalid recording: {0}")]
    InvalidRecording(&'static str),

    /// A draw was issued without a bound pipeline.
    #[error("No pipeline bound at draw time")]
    NoPipelineBound,

    // ========================================================================
    // Device Errors
    // ========================================================================
    /// An error returned by the GPU driver. Fatal for the frame.
    #[error("Device error: {0}")]
    Device(String),

    /// The device was lost. Fatal: wait for idle and shut down.
    #[error("Device lost")]
    DeviceLost,
}

/// Alias for `Result<T, KilnError>`.
pub type Result<T> = std::result::Result<T, KilnError>;
