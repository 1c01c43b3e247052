use crate::error::{GraphConfigurationError, RenderError};
use crate::render::{
    DeviceCapabilities, Framebuffer, FramebufferDescriptor, Program, RenderDevice, TextureFormat,
};
use crate::BeautifyConfig;

use super::{FilterStage, StageKind};

/// Skin smoothing: a box blur blended over the source.
pub struct BeautifyStage {
    radius: u32,
    strength: f32,
    output: Option<FramebufferDescriptor>,
}

impl BeautifyStage {
    pub fn new(config: &BeautifyConfig) -> Self {
        Self {
            radius: config.radius,
            strength: config.strength,
            output: None,
        }
    }
}

impl FilterStage for BeautifyStage {
    fn name(&self) -> &str {
        "beautify"
    }

    fn kind(&self) -> StageKind {
        StageKind::Beautify
    }

    fn configure(
        &mut self,
        input: FramebufferDescriptor,
        _caps: &DeviceCapabilities,
    ) -> Result<FramebufferDescriptor, GraphConfigurationError> {
        super::require_input(self.name(), input, |d| d.format == TextureFormat::Rgba)?;
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(GraphConfigurationError::InvalidParameter(format!(
                "beautify strength {} outside [0, 1]",
                self.strength
            )));
        }
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
            .ok_or_else(|| RenderError::Device("beautify stage used before configure".into()))?;
        let program = Program::Smooth {
            radius: self.radius,
            strength: self.strength,
        };
        super::draw(device, &program, input, output)
    }
}
