//! Average scene luminance by repeated 2x2 reduction
//!
//! Each pass halves both dimensions (rounding up) until the target is no
//! larger than the readback size. Only that tiny buffer crosses back to the
//! host, where its texels are averaged into a single value in [0, 1].
//! Intermediate targets are released as soon as the next pass has consumed
//! them, so at most two reduction buffers are live at once.

use tracing::trace;

use crate::error::{GraphConfigurationError, RenderError};
use crate::render::{
    DeviceCapabilities, Framebuffer, FramebufferDescriptor, Program, RenderDevice, TextureFormat,
};

use super::FilterStage;

pub struct LuminanceReducer {
    readback_size: u32,
    passes: Vec<(Program, FramebufferDescriptor)>,
}

impl LuminanceReducer {
    pub fn new(readback_size: u32) -> Self {
        Self {
            readback_size: readback_size.max(1),
            passes: Vec::new(),
        }
    }

    /// Output descriptors of every reduction pass, in order.
    pub fn pass_descriptors(&self) -> impl Iterator<Item = FramebufferDescriptor> + '_ {
        self.passes.iter().map(|(_, desc)| *desc)
    }

    /// Run the reduction and read the result back as one scalar.
    pub fn reduce(
        &mut self,
        device: &mut dyn RenderDevice,
        input: &Framebuffer,
    ) -> Result<f32, RenderError> {
        let reduced = self.render(device, input)?;
        let texels = device.read_pixels(&reduced)?;
        if texels.is_empty() {
            return Err(RenderError::Device("empty luminance readback".into()));
        }
        let mean = texels.iter().sum::<f32>() / texels.len() as f32;
        trace!(luminance = mean, "luminance reduced");
        Ok(mean.clamp(0.0, 1.0))
    }
}

impl FilterStage for LuminanceReducer {
    fn name(&self) -> &str {
        "luminance"
    }

    fn configure(
        &mut self,
        input: FramebufferDescriptor,
        caps: &DeviceCapabilities,
    ) -> Result<FramebufferDescriptor, GraphConfigurationError> {
        super::require_input(self.name(), input, |d| d.format == TextureFormat::Rgba)?;
        if !caps.float_render_targets {
            return Err(GraphConfigurationError::MissingCapability(
                "luminance reduction needs float render targets".into(),
            ));
        }

        self.passes.clear();
        let (mut width, mut height) = (input.width, input.height);
        loop {
            width = width.div_ceil(2);
            height = height.div_ceil(2);
            let program = if self.passes.is_empty() {
                Program::LuminanceDownsample
            } else {
                Program::Downsample
            };
            let desc = FramebufferDescriptor::new(width, height, TextureFormat::Luminance);
            self.passes.push((program, desc));
            if width <= self.readback_size && height <= self.readback_size {
                return Ok(desc);
            }
        }
    }

    fn render(
        &mut self,
        device: &mut dyn RenderDevice,
        input: &Framebuffer,
    ) -> Result<Framebuffer, RenderError> {
        let Some(((first, first_desc), rest)) = self.passes.split_first() else {
            return Err(RenderError::Device(
                "luminance reducer used before configure".into(),
            ));
        };
        let mut current = super::draw(device, first, input, *first_desc)?;
        for (program, desc) in rest {
            current = super::draw(device, program, &current, *desc)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::SoftwareDevice;
    use approx::assert_abs_diff_eq;

    fn constant(device: &mut SoftwareDevice, width: u32, height: u32, l: f32) -> Framebuffer {
        let desc = FramebufferDescriptor::new(width, height, TextureFormat::Rgba);
        let texels: Vec<f32> = (0..width * height).flat_map(|_| [l, l, l, 1.0]).collect();
        device.upload(desc, &texels).unwrap()
    }

    #[test]
    fn constant_frames_reduce_to_their_luminance() {
        let mut device = SoftwareDevice::default();
        for l in [0.0, 0.5, 1.0] {
            let input = constant(&mut device, 37, 21, l);
            let mut reducer = LuminanceReducer::new(1);
            reducer.configure(input.descriptor(), &device.capabilities()).unwrap();
            let measured = reducer.reduce(&mut device, &input).unwrap();
            assert_abs_diff_eq!(measured, l, epsilon = 1e-4);
        }
    }

    #[test]
    fn passes_halve_until_readback_size() {
        let mut reducer = LuminanceReducer::new(4);
        let desc = FramebufferDescriptor::new(64, 20, TextureFormat::Rgba);
        reducer.configure(desc, &DeviceCapabilities::default()).unwrap();
        let sizes: Vec<(u32, u32)> = reducer
            .pass_descriptors()
            .map(|d| (d.width, d.height))
            .collect();
        assert_eq!(sizes, vec![(32, 10), (16, 5), (8, 3), (4, 2)]);
    }

    #[test]
    fn weights_channels_by_rec709() {
        let mut device = SoftwareDevice::default();
        let desc = FramebufferDescriptor::new(2, 2, TextureFormat::Rgba);
        let green: Vec<f32> = (0..4).flat_map(|_| [0.0, 1.0, 0.0, 1.0]).collect();
        let input = device.upload(desc, &green).unwrap();
        let mut reducer = LuminanceReducer::new(1);
        reducer.configure(desc, &device.capabilities()).unwrap();
        assert_abs_diff_eq!(reducer.reduce(&mut device, &input).unwrap(), 0.7154, epsilon = 1e-5);
    }

    #[test]
    fn intermediate_buffers_are_released() {
        let mut device = SoftwareDevice::default();
        let input = constant(&mut device, 16, 16, 0.25);
        let mut reducer = LuminanceReducer::new(1);
        reducer.configure(input.descriptor(), &device.capabilities()).unwrap();
        reducer.reduce(&mut device, &input).unwrap();
        // Only the input is still held.
        assert_eq!(device.pool_stats().live, 1);
    }

    #[test]
    fn requires_float_targets() {
        let caps = DeviceCapabilities {
            float_render_targets: false,
            ..DeviceCapabilities::default()
        };
        let mut reducer = LuminanceReducer::new(1);
        let desc = FramebufferDescriptor::new(8, 8, TextureFormat::Rgba);
        assert!(matches!(
            reducer.configure(desc, &caps),
            Err(GraphConfigurationError::MissingCapability(_))
        ));
    }
}
