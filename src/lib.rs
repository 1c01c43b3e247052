pub mod capture;
pub mod display;
pub mod error;
pub mod filters;
pub mod pipeline;
pub mod render;

use std::path::{Path, PathBuf};

use capture::frame::{DevicePosition, Orientation, PixelFormat};
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::{
    ConfigError, GraphConfigurationError, RenderError, ResourceExhaustionError, SessionError,
};
pub use pipeline::{
    CaptureHandle, FilterGraph, FrameCounters, GraphBuilder, PipelineConfiguration, StageFlags,
};

use pipeline::exposure::{DEFAULT_GAIN, DEFAULT_TARGET_LUMINANCE, MAX_STABLE_GAIN};

/// Environment variable prefix, e.g. `MPGPU_EXPOSURE__GAIN=0.5`.
pub const ENV_PREFIX: &str = "MPGPU";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub exposure: ExposureConfig,
    pub beautify: BeautifyConfig,
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub position: DevicePosition,
    pub orientation: Orientation,
    pub mirror_front_facing: bool,
    pub mirror_rear_facing: bool,
    /// Still image fed by the synthetic camera instead of a flat scene
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub flags: StageFlags,
    /// Drop frames that arrive while a render is in flight instead of queueing them
    pub drop_all_frames: bool,
    pub queue_depth: usize,
    pub reuse_framebuffers: bool,
    pub memory_budget_mb: u64,
    pub crop: Option<CropConfig>,
    /// How often the idle render thread checks for shutdown
    pub render_poll_ms: u64,
    /// Stop the session after this many failed frames in a row, 0 to never stop
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub target_luminance: f32,
    pub gain: f32,
    /// Reduction stops once both dimensions are at most this size
    pub readback_size: u32,
    pub initial: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeautifyConfig {
    pub radius: u32,
    pub strength: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub report_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Bgra8,
            position: DevicePosition::Front,
            orientation: Orientation::Portrait,
            mirror_front_facing: false,
            mirror_rear_facing: false,
            source: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flags: StageFlags::default(),
            drop_all_frames: false,
            queue_depth: 1,
            reuse_framebuffers: true,
            memory_budget_mb: 256,
            crop: None,
            render_poll_ms: 50,
            max_consecutive_failures: 0,
        }
    }
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            target_luminance: DEFAULT_TARGET_LUMINANCE,
            gain: DEFAULT_GAIN,
            readback_size: 1,
            initial: 0.0,
        }
    }
}

impl Default for BeautifyConfig {
    fn default() -> Self {
        Self {
            radius: 2,
            strength: 0.5,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `MPGPU_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return invalid(format!(
                "capture size {}x{} must be non-zero",
                capture.width, capture.height
            ));
        }
        if capture.fps == 0 {
            return invalid("capture fps must be non-zero".into());
        }
        if self.pipeline.queue_depth == 0 {
            return invalid("pipeline queue_depth must be at least 1".into());
        }
        if self.pipeline.memory_budget_mb == 0 {
            return invalid("pipeline memory_budget_mb must be non-zero".into());
        }
        let exposure = &self.exposure;
        if !(exposure.target_luminance > 0.0 && exposure.target_luminance < 1.0) {
            return invalid(format!(
                "exposure target_luminance {} outside (0, 1)",
                exposure.target_luminance
            ));
        }
        if !(exposure.gain > 0.0 && exposure.gain < MAX_STABLE_GAIN) {
            return invalid(format!(
                "exposure gain {} outside (0, {MAX_STABLE_GAIN})",
                exposure.gain
            ));
        }
        if !filters::EXPOSURE_RANGE.contains(&exposure.initial) {
            return invalid(format!(
                "exposure initial {} outside [-10, 10]",
                exposure.initial
            ));
        }
        if !(0.0..=1.0).contains(&self.beautify.strength) {
            return invalid(format!(
                "beautify strength {} outside [0, 1]",
                self.beautify.strength
            ));
        }
        Ok(())
    }

    pub fn memory_budget_bytes(&self) -> u64 {
        self.pipeline.memory_budget_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
        let loaded = Config::load(None).unwrap();
        assert_eq!(loaded.capture.width, 640);
        assert_eq!(loaded.pipeline.flags, StageFlags::default());
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[capture]
width = 320
height = 240
format = "luma8"
orientation = "landscape_right"

[pipeline]
drop_all_frames = true

[pipeline.flags]
beautify = true
preview = false

[exposure]
gain = 0.5
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!((config.capture.width, config.capture.height), (320, 240));
        assert_eq!(config.capture.format, PixelFormat::Luma8);
        assert_eq!(config.capture.orientation, Orientation::LandscapeRight);
        assert!(config.pipeline.drop_all_frames);
        assert!(config.pipeline.flags.beautify);
        assert!(!config.pipeline.flags.preview);
        assert!(config.pipeline.flags.camera_render);
        assert_eq!(config.exposure.gain, 0.5);
        assert_eq!(config.exposure.target_luminance, DEFAULT_TARGET_LUMINANCE);
    }

    #[test]
    fn unstable_gain_is_invalid() {
        let mut config = Config::default();
        config.exposure.gain = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Load(_))
        ));
    }
}
