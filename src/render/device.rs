//! Render device abstraction and the rayon-backed software device
//!
//! The filter graph never talks to a graphics API directly. Each stage asks
//! the device for a render target and issues one [`Program`] draw per pass,
//! which keeps the orchestration layer independent of the GPU engine.

use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::capture::Rotation;
use crate::error::{RenderError, ResourceExhaustionError};
use crate::render::framebuffer::{
    Framebuffer, FramebufferDescriptor, FramebufferMut, FramebufferPool, PoolStats, TextureFormat,
};

/// Rec. 709 luma coefficients.
pub const LUMINANCE_WEIGHTS: [f32; 3] = [0.2125, 0.7154, 0.0721];

/// Feature limits a graph is validated against at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub max_texture_size: u32,
    /// Single-channel float targets, required by luminance reduction.
    pub float_render_targets: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_texture_size: 4096,
            float_render_targets: true,
        }
    }
}

/// GPU programs the filter stages draw with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Program {
    /// Orient a freshly uploaded camera texture.
    Orient { rotation: Rotation, mirror: bool },
    /// Copy the region starting at (`x`, `y`) with the output's size.
    Crop { x: u32, y: u32 },
    /// `rgb * 2^exposure`, clamped to the unit range.
    Exposure { exposure: f32 },
    /// Box blur of `radius` mixed with the source by `strength`.
    Smooth { radius: u32, strength: f32 },
    /// RGBA to luminance while halving each dimension.
    LuminanceDownsample,
    /// 2x2 box average of a luminance target.
    Downsample,
}

impl Program {
    pub fn name(&self) -> &'static str {
        match self {
            Program::Orient { .. } => "orient",
            Program::Crop { .. } => "crop",
            Program::Exposure { .. } => "exposure",
            Program::Smooth { .. } => "smooth",
            Program::LuminanceDownsample => "luminance_downsample",
            Program::Downsample => "downsample",
        }
    }

    /// Input format the program samples from.
    pub fn input_format(&self) -> TextureFormat {
        match self {
            Program::Downsample => TextureFormat::Luminance,
            _ => TextureFormat::Rgba,
        }
    }
}

/// The primitive render operations the filter graph depends on.
///
/// All methods are called from the render context only.
pub trait RenderDevice: Send {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Obtain an exclusively owned render target.
    fn allocate(&mut self, desc: FramebufferDescriptor) -> Result<FramebufferMut, RenderError>;

    /// Upload texels into a new framebuffer.
    fn upload(
        &mut self,
        desc: FramebufferDescriptor,
        texels: &[f32],
    ) -> Result<Framebuffer, RenderError> {
        if texels.len() != desc.texel_count() {
            return Err(RenderError::InvalidInput {
                program: "upload",
                reason: format!("{} texels for {}", texels.len(), desc),
            });
        }
        let mut target = self.allocate(desc)?;
        target.texels_mut().copy_from_slice(texels);
        Ok(target.publish())
    }

    /// Run `program` over `inputs`, writing every texel of `output`.
    fn render(
        &mut self,
        program: &Program,
        inputs: &[&Framebuffer],
        output: &mut FramebufferMut,
    ) -> Result<(), RenderError>;

    /// Copy a framebuffer back to host memory.
    fn read_pixels(&mut self, framebuffer: &Framebuffer) -> Result<Vec<f32>, RenderError>;

    fn pool_stats(&self) -> PoolStats;
}

/// CPU implementation of [`RenderDevice`], parallel across rows.
pub struct SoftwareDevice {
    pool: FramebufferPool,
    caps: DeviceCapabilities,
    context_lost: bool,
}

impl SoftwareDevice {
    pub fn new(budget_bytes: u64, reuse_framebuffers: bool) -> Self {
        Self::with_capabilities(
            budget_bytes,
            reuse_framebuffers,
            DeviceCapabilities::default(),
        )
    }

    pub fn with_capabilities(
        budget_bytes: u64,
        reuse_framebuffers: bool,
        caps: DeviceCapabilities,
    ) -> Self {
        debug!(budget_bytes, reuse_framebuffers, ?caps, "software render device");
        Self {
            pool: FramebufferPool::new(budget_bytes, reuse_framebuffers),
            caps,
            context_lost: false,
        }
    }

    pub fn pool(&self) -> &FramebufferPool {
        &self.pool
    }

    /// Simulate losing the context; every later call fails.
    pub fn lose_context(&mut self) {
        self.context_lost = true;
        self.pool.purge();
    }

    fn check_context(&self) -> Result<(), RenderError> {
        if self.context_lost {
            Err(ResourceExhaustionError::ContextLost.into())
        } else {
            Ok(())
        }
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new(256 * 1024 * 1024, true)
    }
}

impl RenderDevice for SoftwareDevice {
    fn name(&self) -> &'static str {
        "software"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    fn allocate(&mut self, desc: FramebufferDescriptor) -> Result<FramebufferMut, RenderError> {
        self.check_context()?;
        Ok(self.pool.acquire(desc)?)
    }

    #[instrument(level = "trace", skip(self, inputs, output), fields(program = program.name()))]
    fn render(
        &mut self,
        program: &Program,
        inputs: &[&Framebuffer],
        output: &mut FramebufferMut,
    ) -> Result<(), RenderError> {
        self.check_context()?;
        let [source] = inputs else {
            return Err(RenderError::InvalidInput {
                program: program.name(),
                reason: format!("expected 1 input, got {}", inputs.len()),
            });
        };
        if source.format() != program.input_format() {
            return Err(RenderError::InvalidInput {
                program: program.name(),
                reason: format!("cannot sample {}", source.descriptor()),
            });
        }
        let desc = output.descriptor();
        kernels::run(program, source, desc, output.texels_mut())
    }

    fn read_pixels(&mut self, framebuffer: &Framebuffer) -> Result<Vec<f32>, RenderError> {
        self.check_context()?;
        Ok(framebuffer.texels().to_vec())
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

mod kernels {
    use super::*;

    pub(super) fn run(
        program: &Program,
        src: &Framebuffer,
        dst: FramebufferDescriptor,
        out: &mut [f32],
    ) -> Result<(), RenderError> {
        let sw = src.width();
        let sh = src.height();
        let require = |ok: bool, reason: &str| {
            if ok {
                Ok(())
            } else {
                Err(RenderError::InvalidInput {
                    program: program.name(),
                    reason: format!("{reason}: {} -> {}", src.descriptor(), dst),
                })
            }
        };

        match *program {
            Program::Orient { rotation, mirror } => {
                require(
                    rotation.apply(sw, sh) == (dst.width, dst.height),
                    "rotation mismatch",
                )?;
                for_each_rgba(out, dst.width, |x, y| {
                    let x = if mirror { dst.width - 1 - x } else { x };
                    let (sx, sy) = match rotation {
                        Rotation::None => (x, y),
                        Rotation::Cw90 => (y, sh - 1 - x),
                        Rotation::Cw180 => (sw - 1 - x, sh - 1 - y),
                        Rotation::Cw270 => (sw - 1 - y, x),
                    };
                    rgba_at(src, sx, sy)
                });
            }
            Program::Crop { x, y } => {
                require(
                    x + dst.width <= sw && y + dst.height <= sh,
                    "crop outside source",
                )?;
                for_each_rgba(out, dst.width, |dx, dy| rgba_at(src, x + dx, y + dy));
            }
            Program::Exposure { exposure } => {
                require(src.descriptor() == dst, "size mismatch")?;
                let scale = exposure.exp2();
                out.par_chunks_mut(4)
                    .zip(src.texels().par_chunks(4))
                    .for_each(|(o, s)| {
                        o[0] = (s[0] * scale).clamp(0.0, 1.0);
                        o[1] = (s[1] * scale).clamp(0.0, 1.0);
                        o[2] = (s[2] * scale).clamp(0.0, 1.0);
                        o[3] = s[3];
                    });
            }
            Program::Smooth { radius, strength } => {
                require(src.descriptor() == dst, "size mismatch")?;
                let r = radius as i64;
                for_each_rgba(out, dst.width, |x, y| {
                    let mut acc = [0.0f32; 4];
                    let mut n = 0.0f32;
                    for dy in -r..=r {
                        for dx in -r..=r {
                            let sx = (x as i64 + dx).clamp(0, sw as i64 - 1) as u32;
                            let sy = (y as i64 + dy).clamp(0, sh as i64 - 1) as u32;
                            let t = rgba_at(src, sx, sy);
                            for c in 0..4 {
                                acc[c] += t[c];
                            }
                            n += 1.0;
                        }
                    }
                    let orig = rgba_at(src, x, y);
                    let mut px = [0.0f32; 4];
                    for c in 0..3 {
                        px[c] = orig[c] + (acc[c] / n - orig[c]) * strength;
                    }
                    px[3] = orig[3];
                    px
                });
            }
            Program::LuminanceDownsample | Program::Downsample => {
                require(
                    dst.format == TextureFormat::Luminance
                        && dst.width == sw.div_ceil(2)
                        && dst.height == sh.div_ceil(2),
                    "reduction must halve into a luminance target",
                )?;
                let luminance = matches!(program, Program::LuminanceDownsample);
                out.par_chunks_mut(dst.width as usize)
                    .enumerate()
                    .for_each(|(y, row)| {
                        for (x, texel) in row.iter_mut().enumerate() {
                            let (x0, y0) = (x as u32 * 2, y as u32 * 2);
                            let mut sum = 0.0;
                            let mut n = 0.0;
                            for sy in y0..(y0 + 2).min(sh) {
                                for sx in x0..(x0 + 2).min(sw) {
                                    let t = src.texel(sx, sy);
                                    sum += if luminance {
                                        t[0] * LUMINANCE_WEIGHTS[0]
                                            + t[1] * LUMINANCE_WEIGHTS[1]
                                            + t[2] * LUMINANCE_WEIGHTS[2]
                                    } else {
                                        t[0]
                                    };
                                    n += 1.0;
                                }
                            }
                            *texel = sum / n;
                        }
                    });
            }
        }
        Ok(())
    }

    fn rgba_at(src: &Framebuffer, x: u32, y: u32) -> [f32; 4] {
        let t = src.texel(x, y);
        [t[0], t[1], t[2], t[3]]
    }

    fn for_each_rgba<F>(out: &mut [f32], width: u32, shade: F)
    where
        F: Fn(u32, u32) -> [f32; 4] + Sync,
    {
        out.par_chunks_mut(width as usize * 4)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, texel) in row.chunks_mut(4).enumerate() {
                    texel.copy_from_slice(&shade(x as u32, y as u32));
                }
            });
    }
}
