//! Synthetic camera used by the demo binary and tests
//!
//! Produces frames at the configured size and pixel format with evenly
//! spaced timestamps, either from a flat scene or a still image.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use image::{imageops::FilterType, RgbaImage};
use tracing::{info, instrument};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::CaptureError;
use crate::render::LUMINANCE_WEIGHTS;
use crate::CaptureConfig;

enum Scene {
    Uniform(u8),
    Image(RgbaImage),
}

pub struct SyntheticCamera {
    config: CaptureConfig,
    scene: Scene,
    /// Multiplies every channel before quantization
    brightness: f32,
    frame_interval: Duration,
    sequence: u64,
}

impl SyntheticCamera {
    /// Flat grey scene at `luma`.
    pub fn uniform(config: &CaptureConfig, luma: u8) -> Result<Self, CaptureError> {
        Self::with_scene(config, Scene::Uniform(luma))
    }

    /// Scene taken from a still image, scaled to the capture size.
    pub fn from_image(config: &CaptureConfig, path: &Path) -> Result<Self, CaptureError> {
        let image = image::open(path).map_err(|source| CaptureError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "loaded source image"
        );
        let scaled = image
            .resize_exact(config.width, config.height, FilterType::Triangle)
            .to_rgba8();
        Self::with_scene(config, Scene::Image(scaled))
    }

    /// Build from `config.source` when set, otherwise a mid-grey scene.
    pub fn from_config(config: &CaptureConfig) -> Result<Self, CaptureError> {
        match &config.source {
            Some(path) => Self::from_image(config, path),
            None => Self::uniform(config, 128),
        }
    }

    fn with_scene(config: &CaptureConfig, scene: Scene) -> Result<Self, CaptureError> {
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(CaptureError::InvalidSize {
                width: config.width,
                height: config.height,
            });
        }
        Ok(Self {
            config: config.clone(),
            scene,
            brightness: 1.0,
            frame_interval: Duration::from_secs(1) / config.fps,
            sequence: 0,
        })
    }

    /// Scale scene brightness, e.g. to simulate a light change.
    pub fn set_brightness(&mut self, brightness: f32) {
        self.brightness = brightness.max(0.0);
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[instrument(level = "trace", skip(self))]
    pub fn next_frame(&mut self) -> Frame {
        self.sequence += 1;
        let format = self.config.format;
        let (width, height) = (self.config.width, self.config.height);
        let texels = width as usize * height as usize;
        let mut data = Vec::with_capacity(texels * format.bytes_per_pixel() as usize);

        let scale = |v: u8| (v as f32 * self.brightness).round().min(255.0) as u8;
        match &self.scene {
            Scene::Uniform(luma) => {
                let v = scale(*luma);
                match format {
                    PixelFormat::Luma8 => data.resize(texels, v),
                    PixelFormat::Bgra8 | PixelFormat::Rgba8 => {
                        for _ in 0..texels {
                            data.extend_from_slice(&[v, v, v, 255]);
                        }
                    }
                }
            }
            Scene::Image(image) => {
                for pixel in image.pixels() {
                    let [r, g, b, a] = pixel.0;
                    let (r, g, b) = (scale(r), scale(g), scale(b));
                    match format {
                        PixelFormat::Rgba8 => data.extend_from_slice(&[r, g, b, a]),
                        PixelFormat::Bgra8 => data.extend_from_slice(&[b, g, r, a]),
                        PixelFormat::Luma8 => {
                            let [wr, wg, wb] = LUMINANCE_WEIGHTS;
                            let l = wr * r as f32 + wg * g as f32 + wb * b as f32;
                            data.push(l.round().min(255.0) as u8);
                        }
                    }
                }
            }
        }

        let meta = FrameMetadata {
            sequence: self.sequence,
            width,
            height,
            stride: width * format.bytes_per_pixel(),
            format,
            position: self.config.position,
            orientation: self.config.orientation,
        };
        let nanos = self.frame_interval.as_nanos() * u128::from(self.sequence);
        let timestamp = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        Frame::new(Bytes::from(data), meta, timestamp)
    }
}
