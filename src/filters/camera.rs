//! Camera render stage: uploads raw frames and orients them for display

use tracing::trace;

use crate::capture::{DevicePosition, Frame, Orientation, PixelFormat, Rotation};
use crate::error::{GraphConfigurationError, RenderError};
use crate::render::{
    DeviceCapabilities, Framebuffer, FramebufferDescriptor, Program, RenderDevice, TextureFormat,
};
use crate::CaptureConfig;

/// Entry stage of every rendering graph. Consumes each [`Frame`] exactly once.
pub struct CameraRenderStage {
    width: u32,
    height: u32,
    format: PixelFormat,
    orientation: Orientation,
    mirror_front_facing: bool,
    mirror_rear_facing: bool,
    output: Option<FramebufferDescriptor>,
}

impl CameraRenderStage {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            format: config.format,
            orientation: config.orientation,
            mirror_front_facing: config.mirror_front_facing,
            mirror_rear_facing: config.mirror_rear_facing,
            output: None,
        }
    }

    pub fn name(&self) -> &str {
        "camera"
    }

    /// Descriptor of the uploaded, not yet oriented, camera texture.
    pub fn upload_descriptor(&self) -> FramebufferDescriptor {
        FramebufferDescriptor::new(self.width, self.height, TextureFormat::Rgba)
    }

    pub fn configure(
        &mut self,
        caps: &DeviceCapabilities,
    ) -> Result<FramebufferDescriptor, GraphConfigurationError> {
        if self.width == 0 || self.height == 0 {
            return Err(GraphConfigurationError::InvalidDimensions(format!(
                "camera frames must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width.max(self.height) > caps.max_texture_size {
            return Err(GraphConfigurationError::MissingCapability(format!(
                "textures of {}x{} exceed the device limit of {}",
                self.width, self.height, caps.max_texture_size
            )));
        }
        let (width, height) = self.orientation.rotation().apply(self.width, self.height);
        let output = FramebufferDescriptor::new(width, height, TextureFormat::Rgba);
        self.output = Some(output);
        Ok(output)
    }

    fn mirror_for(&self, position: DevicePosition) -> bool {
        match position {
            DevicePosition::Front => self.mirror_front_facing,
            DevicePosition::Rear => self.mirror_rear_facing,
        }
    }

    /// Reject frames that don't match what the graph was built for.
    pub fn check_frame(&self, frame: &Frame) -> Result<(), RenderError> {
        let meta = &frame.meta;
        if meta.width != self.width || meta.height != self.height || meta.format != self.format {
            return Err(RenderError::FrameMismatch {
                expected_width: self.width,
                expected_height: self.height,
                expected_format: self.format,
                found_width: meta.width,
                found_height: meta.height,
                found_format: meta.format,
            });
        }
        let row = (meta.width * meta.format.bytes_per_pixel()) as usize;
        let needed = meta.stride as usize * (meta.height as usize - 1) + row;
        if meta.stride as usize >= row && frame.data.len() >= needed {
            Ok(())
        } else {
            Err(RenderError::TruncatedFrame {
                expected: needed.max(frame.expected_len()),
                actual: frame.data.len(),
            })
        }
    }

    pub fn render(
        &mut self,
        device: &mut dyn RenderDevice,
        frame: &Frame,
    ) -> Result<Framebuffer, RenderError> {
        let output = self
            .output
            .ok_or_else(|| RenderError::Device("camera stage used before configure".into()))?;
        self.check_frame(frame)?;

        let uploaded = device.upload(self.upload_descriptor(), &decode(frame))?;
        let program = Program::Orient {
            rotation: self.orientation.rotation(),
            mirror: self.mirror_for(frame.meta.position),
        };
        trace!(sequence = frame.meta.sequence, ?program, "camera render");
        super::draw(device, &program, &uploaded, output)
    }

    pub fn rotation(&self) -> Rotation {
        self.orientation.rotation()
    }
}

/// Convert the pixel buffer to normalized RGBA texels.
fn decode(frame: &Frame) -> Vec<f32> {
    let meta = &frame.meta;
    let bpp = meta.format.bytes_per_pixel() as usize;
    let mut texels = Vec::with_capacity(meta.width as usize * meta.height as usize * 4);
    for y in 0..meta.height as usize {
        let start = y * meta.stride as usize;
        let row = &frame.data[start..start + meta.width as usize * bpp];
        for px in row.chunks_exact(bpp) {
            let n = |b: u8| b as f32 / 255.0;
            match meta.format {
                PixelFormat::Rgba8 => texels.extend([n(px[0]), n(px[1]), n(px[2]), n(px[3])]),
                PixelFormat::Bgra8 => texels.extend([n(px[2]), n(px[1]), n(px[0]), n(px[3])]),
                PixelFormat::Luma8 => texels.extend([n(px[0]), n(px[0]), n(px[0]), 1.0]),
            }
        }
    }
    texels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameMetadata;
    use crate::render::SoftwareDevice;
    use bytes::Bytes;
    use std::time::Duration;

    fn config() -> CaptureConfig {
        CaptureConfig {
            width: 2,
            height: 1,
            format: PixelFormat::Bgra8,
            orientation: Orientation::LandscapeRight,
            ..CaptureConfig::default()
        }
    }

    fn frame(data: Vec<u8>, format: PixelFormat, width: u32) -> Frame {
        Frame::new(
            Bytes::from(data),
            FrameMetadata {
                sequence: 1,
                width,
                height: 1,
                stride: width * format.bytes_per_pixel(),
                format,
                position: DevicePosition::Rear,
                orientation: Orientation::LandscapeRight,
            },
            Duration::ZERO,
        )
    }

    #[test]
    fn bgra_is_swizzled_to_rgba() {
        let mut device = SoftwareDevice::default();
        let mut stage = CameraRenderStage::new(&config());
        stage.configure(&device.capabilities()).unwrap();
        let out = stage
            .render(
                &mut device,
                &frame(vec![0, 0, 255, 255, 255, 0, 0, 255], PixelFormat::Bgra8, 2),
            )
            .unwrap();
        assert_eq!(out.texel(0, 0), &[1.0, 0.0, 0.0, 1.0]);
        assert_eq!(out.texel(1, 0), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn mismatched_frame_is_rejected() {
        let mut device = SoftwareDevice::default();
        let mut stage = CameraRenderStage::new(&config());
        stage.configure(&device.capabilities()).unwrap();
        let err = stage
            .render(&mut device, &frame(vec![0; 3], PixelFormat::Luma8, 3))
            .unwrap_err();
        assert!(matches!(err, RenderError::FrameMismatch { .. }));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut device = SoftwareDevice::default();
        let mut stage = CameraRenderStage::new(&config());
        stage.configure(&device.capabilities()).unwrap();
        let err = stage
            .render(&mut device, &frame(vec![0; 5], PixelFormat::Bgra8, 2))
            .unwrap_err();
        assert!(matches!(err, RenderError::TruncatedFrame { .. }));
        assert_eq!(device.pool_stats().live, 0);
    }

    #[test]
    fn oversized_capture_needs_capability() {
        let caps = DeviceCapabilities {
            max_texture_size: 1,
            ..DeviceCapabilities::default()
        };
        let mut stage = CameraRenderStage::new(&config());
        assert!(matches!(
            stage.configure(&caps),
            Err(GraphConfigurationError::MissingCapability(_))
        ));
    }
}
