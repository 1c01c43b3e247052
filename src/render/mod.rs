pub mod device;
pub mod framebuffer;

pub use device::{DeviceCapabilities, Program, RenderDevice, SoftwareDevice, LUMINANCE_WEIGHTS};
pub use framebuffer::{
    Framebuffer, FramebufferDescriptor, FramebufferMut, FramebufferPool, PoolStats, TextureFormat,
};
