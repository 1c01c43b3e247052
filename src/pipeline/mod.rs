pub mod configuration;
pub mod counters;
pub mod exposure;
pub mod graph;
pub mod handoff;

pub use configuration::{PipelineBuilder, PipelineConfiguration};
pub use counters::{FrameCounters, PerformanceTracker};
pub use exposure::{exposure_state, ExposureController, ExposureMonitor, ExposureRegister};
pub use graph::{FilterGraph, GraphBuilder, RenderedFrame, StageFlags};
pub use handoff::{handoff, CaptureHandle, Delivery, FramePolicy, RenderQueue};
