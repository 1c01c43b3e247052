pub mod frame;
pub mod source;

pub use frame::{DevicePosition, Frame, FrameMetadata, Orientation, PixelFormat, Rotation};
pub use source::SyntheticCamera;
