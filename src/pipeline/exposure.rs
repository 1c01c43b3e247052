//! Closed-loop auto exposure
//!
//! Each successful frame the luminance reducer meters the exposure stage's
//! output and the controller integrates the error:
//!
//! ```text
//! exposure' = clamp(exposure + gain * (target - measured), -10, 10)
//! ```
//!
//! Metered luminance is `m(E) = mean(clamp(L * 2^E, 0, 1))`, so
//! `dm/dE <= ln 2`. Any gain below `1 / ln 2` therefore shrinks the error
//! every frame without stepping past the target, and the clamp keeps the
//! value inside the exposure range for scenes that can never reach it.
//! The new value is pushed into the stage after the frame it was measured
//! on, giving exactly one frame of control latency.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::filters::exposure::clamp_exposure;
use crate::filters::ExposureAdjustable;

/// Default integration gain, in EV per unit of luminance error.
pub const DEFAULT_GAIN: f32 = 1.0;

/// Gains at or above this bound may overshoot the target.
pub const MAX_STABLE_GAIN: f32 = std::f32::consts::LOG2_E;

pub const DEFAULT_TARGET_LUMINANCE: f32 = 0.5;

/// Write half of the exposure register. Not cloneable: whoever owns it is
/// the only writer.
pub struct ExposureRegister {
    value: Arc<AtomicU32>,
}

/// Read half of the exposure register. Every read is an atomic snapshot.
#[derive(Clone)]
pub struct ExposureMonitor {
    value: Arc<AtomicU32>,
}

/// Create a register holding `initial` (clamped to the exposure range).
pub fn exposure_state(initial: f32) -> (ExposureRegister, ExposureMonitor) {
    let value = Arc::new(AtomicU32::new(clamp_exposure(initial).to_bits()));
    (
        ExposureRegister {
            value: value.clone(),
        },
        ExposureMonitor { value },
    )
}

impl ExposureRegister {
    pub fn get(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Acquire))
    }

    fn set(&mut self, exposure: f32) {
        self.value.store(exposure.to_bits(), Ordering::Release);
    }

    pub fn monitor(&self) -> ExposureMonitor {
        ExposureMonitor {
            value: self.value.clone(),
        }
    }
}

impl ExposureMonitor {
    pub fn get(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Acquire))
    }
}

/// Integrating controller driving any [`ExposureAdjustable`] stage.
pub struct ExposureController {
    register: ExposureRegister,
    target: f32,
    gain: f32,
}

impl ExposureController {
    pub fn new(register: ExposureRegister, target: f32, gain: f32) -> Self {
        Self {
            register,
            target,
            gain,
        }
    }

    pub fn exposure(&self) -> f32 {
        self.register.get()
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Push the current register value into `stage` without integrating.
    pub fn sync(&self, stage: &mut dyn ExposureAdjustable) {
        stage.update_exposure(self.register.get());
    }

    /// Integrate one measurement and push the result into `stage`.
    ///
    /// Non-finite measurements are ignored so a bad reading can't corrupt
    /// the loop state.
    pub fn update(&mut self, measured: f32, stage: &mut dyn ExposureAdjustable) -> f32 {
        let current = self.register.get();
        if !measured.is_finite() {
            debug!(measured, "ignoring non-finite luminance");
            return current;
        }
        let error = self.target - measured.clamp(0.0, 1.0);
        let next = clamp_exposure(current + self.gain * error);
        self.register.set(next);
        stage.update_exposure(next);
        metrics::gauge!("mpgpu.exposure").set(next as f64);
        metrics::gauge!("mpgpu.luminance").set(measured as f64);
        next
    }
}
