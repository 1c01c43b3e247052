use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Raw camera sample with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel buffer - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Presentation timestamp relative to the start of the capture session
    pub timestamp: Duration,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    pub position: DevicePosition,
    pub orientation: Orientation,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata, timestamp: Duration) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp,
        }
    }

    /// Number of bytes a tightly packed frame of this size would need.
    pub fn expected_len(&self) -> usize {
        self.meta.stride as usize * self.meta.height as usize
    }
}

/// Pixel formats the camera adapter can upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Bgra8,
    Rgba8,
    Luma8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Luma8 => 1,
        }
    }
}

/// Which physical camera produced the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePosition {
    Front,
    Rear,
}

/// Interface orientation the output image should be rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

/// Clockwise rotation applied by the camera render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Orientation {
    /// Camera sensors are mounted landscape-right, so portrait output needs a quarter turn.
    pub fn rotation(self) -> Rotation {
        match self {
            Orientation::LandscapeRight => Rotation::None,
            Orientation::Portrait => Rotation::Cw90,
            Orientation::LandscapeLeft => Rotation::Cw180,
            Orientation::PortraitUpsideDown => Rotation::Cw270,
        }
    }
}

impl Rotation {
    fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::Cw90 | Rotation::Cw270)
    }

    /// Output dimensions for a `width` x `height` source.
    pub fn apply(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }
}
