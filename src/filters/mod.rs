//! Filter stages: single GPU transforms with fixed output descriptors

pub mod beautify;
pub mod camera;
pub mod crop;
pub mod exposure;
pub mod luminance;

pub use beautify::BeautifyStage;
pub use camera::CameraRenderStage;
pub use crop::CropStage;
pub use exposure::{ExposureStage, EXPOSURE_RANGE};
pub use luminance::LuminanceReducer;

use crate::error::{GraphConfigurationError, RenderError};
use crate::render::{DeviceCapabilities, Framebuffer, FramebufferDescriptor, RenderDevice};

/// What a stage does, used for naming and topology checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    CameraRender,
    Crop,
    Exposure,
    Beautify,
    Custom,
}

/// A unit transforming one input framebuffer into one output framebuffer.
///
/// `configure` runs once while the graph is built and fixes the output
/// descriptor; `render` then runs once per frame on the render context.
pub trait FilterStage: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind {
        StageKind::Custom
    }

    /// Validate `input` and return the descriptor this stage will produce.
    fn configure(
        &mut self,
        input: FramebufferDescriptor,
        caps: &DeviceCapabilities,
    ) -> Result<FramebufferDescriptor, GraphConfigurationError>;

    fn render(
        &mut self,
        device: &mut dyn RenderDevice,
        input: &Framebuffer,
    ) -> Result<Framebuffer, RenderError>;

    /// Capability accessor for stages whose exposure can be driven.
    fn exposure_adjustable(&mut self) -> Option<&mut dyn ExposureAdjustable> {
        None
    }
}

/// Narrow capability implemented by stages that accept an exposure value.
pub trait ExposureAdjustable {
    /// Set the exposure used from the next render on. Values are clamped to
    /// [`EXPOSURE_RANGE`]; repeating the same value is a no-op.
    fn update_exposure(&mut self, exposure: f32);

    fn exposure(&self) -> f32;
}

/// Shared check for stages that require their input to match `expected`.
pub(crate) fn require_input(
    stage: &str,
    input: FramebufferDescriptor,
    accepts: impl FnOnce(&FramebufferDescriptor) -> bool,
) -> Result<(), GraphConfigurationError> {
    if accepts(&input) {
        Ok(())
    } else {
        Err(GraphConfigurationError::IncompatibleStage {
            stage: stage.to_string(),
            found: input,
        })
    }
}

/// Draw `program` over `input` into a fresh target of `desc`.
///
/// The target is released back to the pool if the draw fails.
pub(crate) fn draw(
    device: &mut dyn RenderDevice,
    program: &crate::render::Program,
    input: &Framebuffer,
    desc: FramebufferDescriptor,
) -> Result<Framebuffer, RenderError> {
    let mut target = device.allocate(desc)?;
    device.render(program, &[input], &mut target)?;
    Ok(target.publish())
}
