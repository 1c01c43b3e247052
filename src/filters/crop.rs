//! Center crop to fixed target dimensions

use crate::error::{GraphConfigurationError, RenderError};
use crate::render::{
    DeviceCapabilities, Framebuffer, FramebufferDescriptor, Program, RenderDevice, TextureFormat,
};

use super::{FilterStage, StageKind};

pub struct CropStage {
    width: u32,
    height: u32,
    origin: (u32, u32),
    output: Option<FramebufferDescriptor>,
}

impl CropStage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            origin: (0, 0),
            output: None,
        }
    }
}

impl FilterStage for CropStage {
    fn name(&self) -> &str {
        "crop"
    }

    fn kind(&self) -> StageKind {
        StageKind::Crop
    }

    fn configure(
        &mut self,
        input: FramebufferDescriptor,
        _caps: &DeviceCapabilities,
    ) -> Result<FramebufferDescriptor, GraphConfigurationError> {
        super::require_input(self.name(), input, |d| d.format == TextureFormat::Rgba)?;
        if self.width == 0 || self.height == 0 || self.width > input.width || self.height > input.height
        {
            return Err(GraphConfigurationError::InvalidDimensions(format!(
                "cannot crop {input} to {}x{}",
                self.width, self.height
            )));
        }
        self.origin = ((input.width - self.width) / 2, (input.height - self.height) / 2);
        let output = FramebufferDescriptor::new(self.width, self.height, TextureFormat::Rgba);
        self.output = Some(output);
        Ok(output)
    }

    fn render(
        &mut self,
        device: &mut dyn RenderDevice,
        input: &Framebuffer,
    ) -> Result<Framebuffer, RenderError> {
        let output = self
            .output
            .ok_or_else(|| RenderError::Device("crop stage used before configure".into()))?;
        let (x, y) = self.origin;
        super::draw(device, &Program::Crop { x, y }, input, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::SoftwareDevice;

    #[test]
    fn crops_around_center() {
        let mut device = SoftwareDevice::default();
        let desc = FramebufferDescriptor::new(4, 4, TextureFormat::Rgba);
        let texels: Vec<f32> = (0..16).flat_map(|i| [i as f32, 0.0, 0.0, 1.0]).collect();
        let input = device.upload(desc, &texels).unwrap();

        let mut stage = CropStage::new(2, 2);
        let out_desc = stage.configure(desc, &device.capabilities()).unwrap();
        assert_eq!((out_desc.width, out_desc.height), (2, 2));

        let out = stage.render(&mut device, &input).unwrap();
        let reds: Vec<f32> = out.texels().chunks(4).map(|t| t[0]).collect();
        assert_eq!(reds, vec![5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn larger_target_fails_at_build() {
        let caps = DeviceCapabilities::default();
        let mut stage = CropStage::new(8, 2);
        let err = stage
            .configure(FramebufferDescriptor::new(4, 4, TextureFormat::Rgba), &caps)
            .unwrap_err();
        assert!(matches!(err, GraphConfigurationError::InvalidDimensions(_)));
    }
}
