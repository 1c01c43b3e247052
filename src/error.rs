//! Error taxonomy for graph construction, per-frame rendering and sessions

use thiserror::Error;

use crate::render::FramebufferDescriptor;

/// Build-time failure. Fatal to session start, never raised per frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphConfigurationError {
    #[error("stage '{stage}' cannot consume {found}")]
    IncompatibleStage {
        stage: String,
        found: FramebufferDescriptor,
    },

    #[error("stage '{stage}' requires the camera render stage")]
    MissingSource { stage: String },

    #[error("preview is enabled but no preview sink was attached")]
    MissingPreviewSink,

    #[error("render device lacks required capability: {0}")]
    MissingCapability(String),

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// GPU memory exhaustion or context loss. Surfaced to the session owner as fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceExhaustionError {
    #[error("out of framebuffer memory: requested {requested} bytes, budget {budget} bytes")]
    OutOfMemory { requested: u64, budget: u64 },

    #[error("render context lost")]
    ContextLost,
}

/// Per-frame failure. The graph stays usable for the next frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("frame {found_width}x{found_height} {found_format:?} does not match the configured capture {expected_width}x{expected_height} {expected_format:?}")]
    FrameMismatch {
        expected_width: u32,
        expected_height: u32,
        expected_format: crate::capture::PixelFormat,
        found_width: u32,
        found_height: u32,
        found_format: crate::capture::PixelFormat,
    },

    #[error("pixel buffer too short: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("frame timestamp {current:?} does not follow {previous:?}")]
    NonMonotonicTimestamp {
        previous: std::time::Duration,
        current: std::time::Duration,
    },

    #[error("program '{program}' rejected its inputs: {reason}")]
    InvalidInput {
        program: &'static str,
        reason: String,
    },

    #[error("render device error: {0}")]
    Device(String),

    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhaustionError),
}

impl RenderError {
    /// Resource exhaustion ends the session; everything else only costs one frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::ResourceExhausted(_))
    }
}

/// Errors loading or validating [`crate::Config`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Session lifecycle errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Configuration(#[from] GraphConfigurationError),

    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhaustionError),

    #[error("camera already started")]
    AlreadyStarted,

    #[error("failed to spawn render thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("render thread panicked")]
    RenderThreadPanicked,
}

/// Errors from a capture source.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to load source image {path}: {source}")]
    Image {
        path: std::path::PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid capture size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}
