//! Exposure adjustment stage

use std::ops::RangeInclusive;

use tracing::trace;

use crate::error::{GraphConfigurationError, RenderError};
use crate::render::{
    DeviceCapabilities, Framebuffer, FramebufferDescriptor, Program, RenderDevice, TextureFormat,
};

use super::{ExposureAdjustable, FilterStage, StageKind};

/// Exposure ranges from -10.0 to 10.0, with 0.0 as the normal level.
pub const EXPOSURE_RANGE: RangeInclusive<f32> = -10.0..=10.0;

/// Clamp `value` into [`EXPOSURE_RANGE`]. NaN maps to neutral.
pub fn clamp_exposure(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(*EXPOSURE_RANGE.start(), *EXPOSURE_RANGE.end())
    }
}

/// Multiplies color by `2^exposure`.
pub struct ExposureStage {
    exposure: f32,
    output: Option<FramebufferDescriptor>,
}

impl ExposureStage {
    pub fn new(exposure: f32) -> Self {
        Self {
            exposure: clamp_exposure(exposure),
            output: None,
        }
    }
}

impl Default for ExposureStage {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl FilterStage for ExposureStage {
    fn name(&self) -> &str {
        "exposure"
    }

    fn kind(&self) -> StageKind {
        StageKind::Exposure
    }

    fn configure(
        &mut self,
        input: FramebufferDescriptor,
        _caps: &DeviceCapabilities,
    ) -> Result<FramebufferDescriptor, GraphConfigurationError> {
        super::require_input(self.name(), input, |d| d.format == TextureFormat::Rgba)?;
        self.output = Some(input);
        Ok(input)
    }

    fn render(
        &mut self,
        device: &mut dyn RenderDevice,
        input: &Framebuffer,
    ) -> Result<Framebuffer, RenderError> {
        let output = self
            .output
            .ok_or_else(|| RenderError::Device("exposure stage used before configure".into()))?;
        let program = Program::Exposure {
            exposure: self.exposure,
        };
        super::draw(device, &program, input, output)
    }

    fn exposure_adjustable(&mut self) -> Option<&mut dyn ExposureAdjustable> {
        Some(self)
    }
}

impl ExposureAdjustable for ExposureStage {
    fn update_exposure(&mut self, exposure: f32) {
        let exposure = clamp_exposure(exposure);
        if exposure != self.exposure {
            trace!(from = self.exposure, to = exposure, "exposure uniform updated");
            self.exposure = exposure;
        }
    }

    fn exposure(&self) -> f32 {
        self.exposure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::SoftwareDevice;

    #[test]
    fn updates_are_clamped_and_idempotent() {
        let mut stage = ExposureStage::default();
        stage.update_exposure(42.0);
        assert_eq!(stage.exposure(), 10.0);
        stage.update_exposure(-42.0);
        assert_eq!(stage.exposure(), -10.0);
        stage.update_exposure(1.5);
        stage.update_exposure(1.5);
        assert_eq!(stage.exposure(), 1.5);
        stage.update_exposure(f32::NAN);
        assert_eq!(stage.exposure(), 0.0);
    }

    #[test]
    fn neutral_exposure_is_identity() {
        let mut device = SoftwareDevice::default();
        let desc = FramebufferDescriptor::new(2, 1, TextureFormat::Rgba);
        let input = device
            .upload(desc, &[0.1, 0.2, 0.3, 1.0, 0.9, 0.8, 0.7, 0.5])
            .unwrap();
        let mut stage = ExposureStage::default();
        stage.configure(desc, &device.capabilities()).unwrap();
        let out = stage.render(&mut device, &input).unwrap();
        assert_eq!(out.texels(), input.texels());
    }
}
