//! Filter graph composition and per-frame execution
//!
//! ```text
//! Frame ─► camera ─► [crop] ─► [exposure] ─► [beautify] ─► sinks
//!                                  │    ▲
//!                                  ▼    │ next frame
//!                           luminance ─► controller
//! ```
//!
//! Every stage's output descriptor is fixed by [`GraphBuilder::build`];
//! wiring problems can only surface there. `execute` threads one frame
//! through the chain; intermediate framebuffers are released as soon as the
//! following stage has consumed them, and a failed frame leaves nothing
//! behind except the error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::capture::Frame;
use crate::display::{FrameSink, PreviewFrame};
use crate::error::{GraphConfigurationError, RenderError};
use crate::filters::{
    BeautifyStage, CameraRenderStage, CropStage, ExposureStage, FilterStage, LuminanceReducer,
    StageKind,
};
use crate::pipeline::exposure::{ExposureController, ExposureRegister, MAX_STABLE_GAIN};
use crate::render::{FramebufferDescriptor, PoolStats, RenderDevice};
use crate::{CaptureConfig, Config, ExposureConfig};

/// Which stages participate. Read once when the graph is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageFlags {
    pub camera_render: bool,
    pub exposure_adjust: bool,
    pub beautify: bool,
    pub preview: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self {
            camera_render: true,
            exposure_adjust: true,
            beautify: false,
            preview: true,
        }
    }
}

impl StageFlags {
    /// Human readable configuration name, e.g. `camera+exposure+preview`.
    pub fn name(&self) -> String {
        let parts: Vec<&str> = [
            (self.camera_render, "camera"),
            (self.exposure_adjust, "exposure"),
            (self.beautify, "beautify"),
            (self.preview, "preview"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
        if parts.is_empty() {
            "capture-only".to_string()
        } else {
            parts.join("+")
        }
    }
}

/// Result of rendering one frame.
#[derive(Debug)]
pub struct RenderedFrame {
    /// Final output, `None` for capture-only graphs.
    pub framebuffer: Option<crate::render::Framebuffer>,
    pub sequence: u64,
    pub timestamp: Duration,
    /// Wall time spent in `execute`.
    pub elapsed: Duration,
    /// Metered luminance of the exposure stage's output.
    pub luminance: Option<f32>,
    /// Exposure that will be used for the next frame.
    pub exposure: Option<f32>,
}

struct Metering {
    register: ExposureRegister,
    target: f32,
    gain: f32,
    readback_size: u32,
}

struct AutoExposure {
    /// Index of the exposure stage whose output is metered.
    stage: usize,
    reducer: LuminanceReducer,
    controller: ExposureController,
}

/// Assembles a [`FilterGraph`] and validates it against a render device.
pub struct GraphBuilder {
    capture: CaptureConfig,
    camera_render: bool,
    stages: Vec<Box<dyn FilterStage>>,
    metering: Option<(usize, Metering)>,
    require_preview: bool,
    preview: Option<Arc<dyn FrameSink>>,
    targets: Vec<Arc<dyn FrameSink>>,
}

impl GraphBuilder {
    /// A graph with only the camera render stage.
    pub fn new(capture: &CaptureConfig) -> Self {
        Self {
            capture: capture.clone(),
            camera_render: true,
            stages: Vec::new(),
            metering: None,
            require_preview: false,
            preview: None,
            targets: Vec::new(),
        }
    }

    /// Compose the stages selected by `config.pipeline.flags`.
    pub fn from_config(config: &Config, register: ExposureRegister) -> Self {
        let flags = config.pipeline.flags;
        let mut builder = Self::new(&config.capture);
        builder.camera_render = flags.camera_render;
        builder.require_preview = flags.preview;

        if let Some(crop) = config.pipeline.crop {
            builder = builder.stage(Box::new(CropStage::new(crop.width, crop.height)));
        }
        if flags.exposure_adjust {
            builder = builder.auto_exposure(register, &config.exposure);
        }
        if flags.beautify {
            builder = builder.stage(Box::new(BeautifyStage::new(&config.beautify)));
        }
        builder
    }

    /// Skip the camera render pass. Only valid for graphs with no stages.
    pub fn without_camera_render(mut self) -> Self {
        self.camera_render = false;
        self
    }

    pub fn stage(mut self, stage: Box<dyn FilterStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append an exposure stage driven by closed-loop metering of its output.
    pub fn auto_exposure(mut self, register: ExposureRegister, config: &ExposureConfig) -> Self {
        let index = self.stages.len();
        self.stages.push(Box::new(ExposureStage::new(register.get())));
        self.metering = Some((
            index,
            Metering {
                register,
                target: config.target_luminance,
                gain: config.gain,
                readback_size: config.readback_size,
            },
        ));
        self
    }

    /// Deliver every rendered frame to `sink` as the preview.
    pub fn preview(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.require_preview = true;
        self.preview = Some(sink);
        self
    }

    /// Additional output target, e.g. an encoder.
    pub fn target(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.targets.push(sink);
        self
    }

    #[instrument(skip_all)]
    pub fn build(
        self,
        device: Box<dyn RenderDevice>,
    ) -> Result<FilterGraph, GraphConfigurationError> {
        let caps = device.capabilities();

        if !self.camera_render {
            if let Some(stage) = self.stages.first() {
                return Err(GraphConfigurationError::MissingSource {
                    stage: stage.name().to_string(),
                });
            }
            if self.require_preview || !self.targets.is_empty() {
                return Err(GraphConfigurationError::MissingSource {
                    stage: "preview".to_string(),
                });
            }
            info!(device = device.name(), "capture-only graph built");
            return Ok(FilterGraph {
                device,
                source: None,
                stages: Vec::new(),
                auto_exposure: None,
                sinks: Vec::new(),
                output: None,
                last_timestamp: None,
            });
        }

        if self.require_preview && self.preview.is_none() {
            return Err(GraphConfigurationError::MissingPreviewSink);
        }

        let mut source = CameraRenderStage::new(&self.capture);
        let mut desc = source.configure(&caps)?;
        let mut stages = self.stages;
        let mut auto_exposure = None;
        let mut metering = self.metering;

        for (index, stage) in stages.iter_mut().enumerate() {
            desc = stage.configure(desc, &caps)?;
            debug!(stage = stage.name(), kind = ?stage.kind(), output = %desc, "stage configured");

            if !metering.as_ref().is_some_and(|(at, _)| *at == index) {
                continue;
            }
            let Some((_, m)) = metering.take() else {
                continue;
            };
            validate_control_law(m.target, m.gain)?;
            let Some(adjustable) = stage.exposure_adjustable() else {
                return Err(GraphConfigurationError::MissingCapability(format!(
                    "stage '{}' does not accept exposure updates",
                    stage.name()
                )));
            };
            let mut reducer = LuminanceReducer::new(m.readback_size);
            reducer.configure(desc, &caps)?;
            let controller = ExposureController::new(m.register, m.target, m.gain);
            controller.sync(adjustable);
            debug!(
                stage = stage.name(),
                target_luminance = controller.target(),
                gain = controller.gain(),
                exposure = controller.exposure(),
                "auto exposure attached"
            );
            auto_exposure = Some(AutoExposure {
                stage: index,
                reducer,
                controller,
            });
        }

        let sinks: Vec<Arc<dyn FrameSink>> =
            self.preview.into_iter().chain(self.targets).collect();

        let graph = FilterGraph {
            device,
            source: Some(source),
            stages,
            auto_exposure,
            sinks,
            output: Some(desc),
            last_timestamp: None,
        };
        info!(
            device = graph.device.name(),
            stages = ?graph.stage_names(),
            output = %desc,
            sinks = graph.sinks.len(),
            "filter graph built"
        );
        Ok(graph)
    }
}

fn validate_control_law(target: f32, gain: f32) -> Result<(), GraphConfigurationError> {
    if !(target > 0.0 && target < 1.0) {
        return Err(GraphConfigurationError::InvalidParameter(format!(
            "target luminance {target} outside (0, 1)"
        )));
    }
    if !(gain > 0.0 && gain < MAX_STABLE_GAIN) {
        return Err(GraphConfigurationError::InvalidParameter(format!(
            "exposure gain {gain} outside (0, {MAX_STABLE_GAIN})"
        )));
    }
    Ok(())
}

/// Immutable topology of stages plus the device they render on.
///
/// Owned by the render context; only that context touches GPU resources.
pub struct FilterGraph {
    device: Box<dyn RenderDevice>,
    source: Option<CameraRenderStage>,
    stages: Vec<Box<dyn FilterStage>>,
    auto_exposure: Option<AutoExposure>,
    sinks: Vec<Arc<dyn FrameSink>>,
    output: Option<FramebufferDescriptor>,
    last_timestamp: Option<Duration>,
}

impl FilterGraph {
    /// Render one frame through every stage and deliver the result.
    #[instrument(level = "debug", skip_all, fields(sequence = frame.meta.sequence))]
    pub fn execute(&mut self, frame: Frame) -> Result<RenderedFrame, RenderError> {
        let start = Instant::now();
        let sequence = frame.meta.sequence;
        let timestamp = frame.timestamp;
        if let Some(previous) = self.last_timestamp {
            if timestamp <= previous {
                return Err(RenderError::NonMonotonicTimestamp {
                    previous,
                    current: timestamp,
                });
            }
        }

        let Some(source) = self.source.as_mut() else {
            self.last_timestamp = Some(timestamp);
            return Ok(RenderedFrame {
                framebuffer: None,
                sequence,
                timestamp,
                elapsed: start.elapsed(),
                luminance: None,
                exposure: None,
            });
        };

        let device = self.device.as_mut();
        let mut current = source.render(device, &frame)?;
        drop(frame);

        let mut luminance = None;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            current = stage.render(device, &current)?;
            if let Some(auto) = self.auto_exposure.as_mut().filter(|a| a.stage == index) {
                luminance = Some(auto.reducer.reduce(device, &current)?);
            }
        }

        // Only a fully rendered frame may feed the controller.
        let mut exposure = None;
        if let (Some(auto), Some(measured)) = (self.auto_exposure.as_mut(), luminance) {
            if let Some(stage) = self.stages[auto.stage].exposure_adjustable() {
                exposure = Some(auto.controller.update(measured, stage));
            }
        }

        for sink in &self.sinks {
            sink.accept(PreviewFrame {
                framebuffer: current.clone(),
                timestamp,
                sequence,
            });
        }
        self.last_timestamp = Some(timestamp);

        let elapsed = start.elapsed();
        debug!(?elapsed, ?luminance, ?exposure, "frame rendered");
        Ok(RenderedFrame {
            framebuffer: Some(current),
            sequence,
            timestamp,
            elapsed,
            luminance,
            exposure,
        })
    }

    /// Names of the stages in execution order, camera first.
    pub fn stage_names(&self) -> Vec<String> {
        self.source
            .iter()
            .map(|s| s.name().to_string())
            .chain(self.stages.iter().map(|s| s.name().to_string()))
            .collect()
    }

    /// Stage kinds in execution order, matching [`stage_names`](Self::stage_names).
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.source
            .iter()
            .map(|_| StageKind::CameraRender)
            .chain(self.stages.iter().map(|s| s.kind()))
            .collect()
    }

    pub fn output_descriptor(&self) -> Option<FramebufferDescriptor> {
        self.output
    }

    /// Current controller exposure, if auto exposure is part of the graph.
    pub fn exposure(&self) -> Option<f32> {
        self.auto_exposure.as_ref().map(|a| a.controller.exposure())
    }

    pub fn has_auto_exposure(&self) -> bool {
        self.auto_exposure.is_some()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.device.pool_stats()
    }

    pub fn device_name(&self) -> &'static str {
        self.device.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DevicePosition, FrameMetadata, Orientation, PixelFormat};
    use crate::display::{ChannelSink, LatestFramePreview};
    use crate::pipeline::exposure::exposure_state;
    use crate::render::SoftwareDevice;
    use crate::CropConfig;
    use bytes::Bytes;

    fn config(flags: StageFlags) -> Config {
        let mut config = Config::default();
        config.capture.width = 8;
        config.capture.height = 4;
        config.capture.format = PixelFormat::Luma8;
        config.capture.orientation = Orientation::LandscapeRight;
        config.pipeline.flags = flags;
        config
    }

    fn frame(sequence: u64, luma: u8) -> Frame {
        Frame::new(
            Bytes::from(vec![luma; 32]),
            FrameMetadata {
                sequence,
                width: 8,
                height: 4,
                stride: 8,
                format: PixelFormat::Luma8,
                position: DevicePosition::Rear,
                orientation: Orientation::LandscapeRight,
            },
            Duration::from_millis(sequence * 33),
        )
    }

    fn device() -> Box<dyn RenderDevice> {
        Box::new(SoftwareDevice::default())
    }

    #[test]
    fn flags_select_stages_in_order() {
        let flags = StageFlags {
            camera_render: true,
            exposure_adjust: true,
            beautify: true,
            preview: true,
        };
        let mut config = config(flags);
        config.pipeline.crop = Some(CropConfig {
            width: 4,
            height: 4,
        });
        let (register, _) = exposure_state(0.0);
        let graph = GraphBuilder::from_config(&config, register)
            .preview(Arc::new(LatestFramePreview::new()))
            .build(device())
            .unwrap();
        assert_eq!(
            graph.stage_names(),
            vec!["camera", "crop", "exposure", "beautify"]
        );
        assert_eq!(
            graph.stage_kinds(),
            vec![
                StageKind::CameraRender,
                StageKind::Crop,
                StageKind::Exposure,
                StageKind::Beautify
            ]
        );
        assert!(graph.has_auto_exposure());
        assert_eq!(graph.output_descriptor().map(|d| (d.width, d.height)), Some((4, 4)));
        assert_eq!(flags.name(), "camera+exposure+beautify+preview");
    }

    #[test]
    fn preview_flag_requires_sink() {
        let (register, _) = exposure_state(0.0);
        let err = GraphBuilder::from_config(&config(StageFlags::default()), register)
            .build(device())
            .err()
            .unwrap();
        assert_eq!(err, GraphConfigurationError::MissingPreviewSink);
    }

    #[test]
    fn stages_require_camera_render() {
        let flags = StageFlags {
            camera_render: false,
            exposure_adjust: true,
            beautify: false,
            preview: false,
        };
        let (register, _) = exposure_state(0.0);
        let err = GraphBuilder::from_config(&config(flags), register)
            .build(device())
            .err()
            .unwrap();
        assert!(matches!(err, GraphConfigurationError::MissingSource { .. }));
    }

    #[test]
    fn capture_only_graph_consumes_frames() {
        let flags = StageFlags {
            camera_render: false,
            exposure_adjust: false,
            beautify: false,
            preview: false,
        };
        let (register, _) = exposure_state(0.0);
        let mut graph = GraphBuilder::from_config(&config(flags), register)
            .build(device())
            .unwrap();
        let rendered = graph.execute(frame(1, 10)).unwrap();
        assert!(rendered.framebuffer.is_none());
        assert!(graph.stage_names().is_empty());
        assert_eq!(flags.name(), "capture-only");
    }

    #[test]
    fn builder_without_camera_render_rejects_targets() {
        let (sink, _rx) = ChannelSink::new("encoder", 1);
        let err = GraphBuilder::new(&config(StageFlags::default()).capture)
            .without_camera_render()
            .target(Arc::new(sink))
            .build(device())
            .err()
            .unwrap();
        assert!(matches!(err, GraphConfigurationError::MissingSource { .. }));

        let graph = GraphBuilder::new(&config(StageFlags::default()).capture)
            .without_camera_render()
            .build(device())
            .unwrap();
        assert!(!graph.has_auto_exposure());
        assert_eq!(graph.output_descriptor(), None);
    }

    #[test]
    fn incompatible_wiring_fails_before_any_frame() {
        let (sink, rx) = ChannelSink::new("encoder", 4);
        let err = GraphBuilder::new(&config(StageFlags::default()).capture)
            .stage(Box::new(LuminanceReducer::new(1)))
            .stage(Box::new(ExposureStage::default()))
            .target(Arc::new(sink))
            .build(device())
            .err()
            .unwrap();

        let GraphConfigurationError::IncompatibleStage { stage, found } = err else {
            panic!("expected an incompatible stage, got {err:?}");
        };
        assert_eq!(stage, "exposure");
        assert_eq!(
            found,
            FramebufferDescriptor::new(1, 1, crate::render::TextureFormat::Luminance)
        );
        assert!(rx.is_empty());
    }

    #[test]
    fn unstable_gain_is_rejected_at_build() {
        let flags = StageFlags {
            preview: false,
            ..StageFlags::default()
        };
        let mut config = config(flags);
        config.exposure.gain = 2.0;
        let (register, _) = exposure_state(0.0);
        let err = GraphBuilder::from_config(&config, register)
            .build(device())
            .err()
            .unwrap();
        assert!(matches!(err, GraphConfigurationError::InvalidParameter(_)));
    }

    #[test]
    fn exposure_takes_effect_one_frame_later() {
        let flags = StageFlags {
            preview: false,
            ..StageFlags::default()
        };
        let (register, monitor) = exposure_state(0.0);
        let mut graph = GraphBuilder::from_config(&config(flags), register)
            .build(device())
            .unwrap();

        let first = graph.execute(frame(1, 230)).unwrap();
        let input = 230.0 / 255.0;
        // Frame 1 renders at the initial exposure.
        let out = first.framebuffer.as_ref().unwrap();
        assert!((out.texel(0, 0)[0] - input).abs() < 1e-6);
        let e1 = first.exposure.unwrap();
        assert!(e1 < 0.0);
        assert_eq!(monitor.get(), e1);

        // Frame 2 renders with the value computed after frame 1.
        let second = graph.execute(frame(2, 230)).unwrap();
        let out = second.framebuffer.as_ref().unwrap();
        assert!((out.texel(0, 0)[0] - input * e1.exp2()).abs() < 1e-5);
    }

    #[test]
    fn out_of_order_timestamps_are_rejected_per_frame() {
        let flags = StageFlags {
            preview: false,
            exposure_adjust: false,
            ..StageFlags::default()
        };
        let (register, _) = exposure_state(0.0);
        let mut graph = GraphBuilder::from_config(&config(flags), register)
            .build(device())
            .unwrap();
        graph.execute(frame(2, 100)).unwrap();
        let err = graph.execute(frame(1, 100)).unwrap_err();
        assert!(matches!(err, RenderError::NonMonotonicTimestamp { .. }));
        assert!(graph.execute(frame(3, 100)).is_ok());
    }

    #[test]
    fn intermediates_are_released_after_each_frame() {
        let flags = StageFlags {
            beautify: true,
            ..StageFlags::default()
        };
        let preview = Arc::new(LatestFramePreview::new());
        let (register, _) = exposure_state(0.0);
        let mut graph = GraphBuilder::from_config(&config(flags), register)
            .preview(preview.clone())
            .build(device())
            .unwrap();

        for sequence in 1..=3 {
            let rendered = graph.execute(frame(sequence, 128)).unwrap();
            drop(rendered);
            // Only the preview's copy of the output survives the frame.
            assert_eq!(graph.pool_stats().live, 1);
        }
        preview.clear();
        assert_eq!(graph.pool_stats().live, 0);
        assert!(graph.pool_stats().reused > 0);
    }
}
