//! Capture session: flags, assembled graph, render thread and live statistics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::io;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::display::FrameSink;
use crate::error::{GraphConfigurationError, RenderError, SessionError};
use crate::pipeline::counters::{FrameCounters, PerformanceTracker};
use crate::pipeline::exposure::{exposure_state, ExposureMonitor};
use crate::pipeline::graph::{FilterGraph, GraphBuilder, StageFlags};
use crate::pipeline::handoff::{handoff, CaptureHandle, FramePolicy, Next, RenderQueue};
use crate::render::RenderDevice;
use crate::Config;

const RENDER_THREAD_NAME: &str = "mpgpu-render";

/// Body of the render thread. Yields the graph unless it was reclaimed.
type RenderJob = Box<dyn FnOnce() -> Option<FilterGraph> + Send>;

/// Builder for [`PipelineConfiguration`].
pub struct PipelineBuilder {
    config: Config,
    name: Option<String>,
    preview: Option<Arc<dyn FrameSink>>,
    targets: Vec<Arc<dyn FrameSink>>,
}

impl PipelineBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Preview sink. Attached to the graph only when the preview flag is set.
    pub fn preview(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.preview = Some(sink);
        self
    }

    pub fn target(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.targets.push(sink);
        self
    }

    pub fn build(
        self,
        device: Box<dyn RenderDevice>,
    ) -> Result<PipelineConfiguration, GraphConfigurationError> {
        let flags = self.config.pipeline.flags;
        let (register, monitor) = exposure_state(self.config.exposure.initial);

        let mut builder = GraphBuilder::from_config(&self.config, register);
        if let Some(sink) = &self.preview {
            if flags.preview {
                builder = builder.preview(sink.clone());
            } else {
                debug!(sink = sink.name(), "preview disabled, sink not attached");
            }
        }
        for target in self.targets {
            builder = builder.target(target);
        }
        let graph = builder.build(device)?;

        let name = self.name.unwrap_or_else(|| flags.name());
        let policy = if self.config.pipeline.drop_all_frames {
            FramePolicy::Drop
        } else {
            FramePolicy::Queue {
                depth: self.config.pipeline.queue_depth,
            }
        };
        info!(%name, ?policy, stages = ?graph.stage_names(), "pipeline configured");

        Ok(PipelineConfiguration {
            name,
            flags,
            policy,
            poll: Duration::from_millis(self.config.pipeline.render_poll_ms.max(1)),
            max_consecutive_failures: self.config.pipeline.max_consecutive_failures,
            stage_names: graph.stage_names(),
            graph: Some(graph),
            preview: self.preview,
            monitor,
            tracker: Arc::new(PerformanceTracker::new()),
            baseline: Mutex::new(Instant::now()),
            session: Arc::new(Session::default()),
            worker: None,
        })
    }
}

#[derive(Default)]
struct Session {
    running: AtomicBool,
    fatal: Mutex<Option<RenderError>>,
}

/// One capture session.
///
/// Owns the [`FilterGraph`] until [`start_camera`](Self::start_camera) moves
/// it onto the render thread; [`stop`](Self::stop) drains the in-flight frame
/// and hands it back.
pub struct PipelineConfiguration {
    name: String,
    flags: StageFlags,
    policy: FramePolicy,
    poll: Duration,
    max_consecutive_failures: u32,
    stage_names: Vec<String>,
    graph: Option<FilterGraph>,
    preview: Option<Arc<dyn FrameSink>>,
    monitor: ExposureMonitor,
    tracker: Arc<PerformanceTracker>,
    /// Start of the stats window. Held across a reset so readers never
    /// pair zeroed counters with the old window.
    baseline: Mutex<Instant>,
    session: Arc<Session>,
    worker: Option<JoinHandle<Option<FilterGraph>>>,
}

impl PipelineConfiguration {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder {
            config,
            name: None,
            preview: None,
            targets: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> StageFlags {
        self.flags
    }

    pub fn policy(&self) -> FramePolicy {
        self.policy
    }

    /// Spawn the render thread and return the handle the capture side
    /// delivers frames through.
    pub fn start_camera(&mut self) -> Result<CaptureHandle, SessionError> {
        self.launch(|job| {
            std::thread::Builder::new()
                .name(RENDER_THREAD_NAME.to_string())
                .spawn(job)
        })
    }

    fn launch<F>(&mut self, spawn: F) -> Result<CaptureHandle, SessionError>
    where
        F: FnOnce(RenderJob) -> io::Result<JoinHandle<Option<FilterGraph>>>,
    {
        if self.worker.is_some() {
            return Err(SessionError::AlreadyStarted);
        }
        let graph = self.graph.take().ok_or(SessionError::AlreadyStarted)?;

        let (capture, queue) = handoff(self.policy, self.tracker.clone());
        *self.session.fatal.lock() = None;
        self.session.running.store(true, Ordering::Release);
        *self.baseline.lock() = Instant::now();

        let worker = RenderWorker {
            graph,
            queue,
            tracker: self.tracker.clone(),
            session: self.session.clone(),
            poll: self.poll,
            max_consecutive_failures: self.max_consecutive_failures,
        };
        // The slot lets the graph come back if the thread never starts.
        let slot = Arc::new(Mutex::new(Some(worker)));
        let job: RenderJob = {
            let slot = slot.clone();
            Box::new(move || slot.lock().take().map(RenderWorker::run))
        };
        match spawn(job) {
            Ok(handle) => self.worker = Some(handle),
            Err(err) => {
                self.session.running.store(false, Ordering::Release);
                if let Some(worker) = slot.lock().take() {
                    self.graph = Some(worker.graph);
                }
                error!(name = %self.name, %err, "render thread failed to start");
                return Err(SessionError::Spawn(err));
            }
        }

        info!(name = %self.name, "camera started");
        Ok(capture)
    }

    /// Stop frame delivery, let the in-flight frame finish and reclaim the graph.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.session.running.store(false, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let graph = worker
            .join()
            .map_err(|_| SessionError::RenderThreadPanicked)?;
        if graph.is_some() {
            self.graph = graph;
        }
        info!(name = %self.name, counters = ?self.counters(), "camera stopped");
        Ok(())
    }

    /// True while the render thread is accepting frames.
    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.session.running.load(Ordering::Acquire)
    }

    /// Error that ended the render thread, if any.
    pub fn fatal_error(&self) -> Option<RenderError> {
        self.session.fatal.lock().clone()
    }

    /// Zero the counters and restart the cpu usage window.
    pub fn reset_stats(&self) {
        let mut baseline = self.baseline.lock();
        self.tracker.reset();
        *baseline = Instant::now();
        drop(baseline);
        debug!(name = %self.name, "stats reset");
    }

    pub fn counters(&self) -> FrameCounters {
        self.tracker.snapshot()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.tracker.dropped()
    }

    pub fn failed_frames(&self) -> u64 {
        self.tracker.failed()
    }

    /// Time since the last reset or start.
    pub fn elapsed(&self) -> Duration {
        self.baseline.lock().elapsed()
    }

    /// Counters and the window they cover, read as one.
    pub fn stats_window(&self) -> (FrameCounters, Duration) {
        let baseline = self.baseline.lock();
        (self.tracker.snapshot(), baseline.elapsed())
    }

    /// Fraction of wall time spent rendering since the last reset.
    pub fn cpu_usage(&self) -> f64 {
        let (counters, elapsed) = self.stats_window();
        if elapsed.is_zero() {
            return 0.0;
        }
        counters.processing_time.as_secs_f64() / elapsed.as_secs_f64()
    }

    /// Fraction of `elapsed` spent rendering.
    pub fn cpu_usage_over(&self, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }
        self.counters().processing_time.as_secs_f64() / elapsed.as_secs_f64()
    }

    /// Rendered frames per second since the last reset.
    pub fn frame_rate(&self) -> f64 {
        let (counters, elapsed) = self.stats_window();
        if elapsed.is_zero() {
            return 0.0;
        }
        counters.count as f64 / elapsed.as_secs_f64()
    }

    /// Exposure the next frame will render with.
    pub fn exposure(&self) -> f32 {
        self.monitor.get()
    }

    pub fn exposure_monitor(&self) -> ExposureMonitor {
        self.monitor.clone()
    }

    pub fn preview(&self) -> Option<&Arc<dyn FrameSink>> {
        self.preview.as_ref()
    }

    /// The graph, while the camera is stopped.
    pub fn graph(&self) -> Option<&FilterGraph> {
        self.graph.as_ref()
    }

    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }
}

impl Drop for PipelineConfiguration {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(name = %self.name, %err, "render thread did not shut down cleanly");
        }
    }
}

struct RenderWorker {
    graph: FilterGraph,
    queue: RenderQueue,
    tracker: Arc<PerformanceTracker>,
    session: Arc<Session>,
    poll: Duration,
    max_consecutive_failures: u32,
}

impl RenderWorker {
    fn run(self) -> FilterGraph {
        let RenderWorker {
            mut graph,
            queue,
            tracker,
            session,
            poll,
            max_consecutive_failures,
        } = self;
        debug!(device = graph.device_name(), "render thread running");

        let mut consecutive = 0u32;
        while session.running.load(Ordering::Acquire) {
            let (frame, _in_flight) = match queue.next(poll) {
                Next::Frame(frame, in_flight) => (frame, in_flight),
                Next::Idle => continue,
                Next::Closed => break,
            };
            let sequence = frame.meta.sequence;
            match graph.execute(frame) {
                Ok(rendered) => {
                    consecutive = 0;
                    tracker.record_frame(rendered.elapsed);
                }
                Err(err) if err.is_fatal() => {
                    tracker.record_failed();
                    error!(sequence, %err, "render context unusable, stopping");
                    *session.fatal.lock() = Some(err);
                    break;
                }
                Err(err) => {
                    tracker.record_failed();
                    consecutive += 1;
                    warn!(sequence, %err, consecutive, "frame failed");
                    if max_consecutive_failures > 0 && consecutive >= max_consecutive_failures {
                        error!(consecutive, "too many consecutive failures, stopping");
                        *session.fatal.lock() = Some(err);
                        break;
                    }
                }
            }
        }

        session.running.store(false, Ordering::Release);
        // Closes the handoff; pending frames are released here.
        drop(queue);
        debug!("render thread exiting");
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Orientation, PixelFormat, SyntheticCamera};
    use crate::display::LatestFramePreview;
    use crate::render::SoftwareDevice;

    fn config() -> Config {
        let mut config = Config::default();
        config.capture.width = 16;
        config.capture.height = 8;
        config.capture.format = PixelFormat::Luma8;
        config.capture.orientation = Orientation::LandscapeRight;
        config.pipeline.render_poll_ms = 5;
        config
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn name_defaults_to_flags() {
        let preview = Arc::new(LatestFramePreview::new());
        let session = PipelineConfiguration::builder(config())
            .preview(preview)
            .build(Box::new(SoftwareDevice::default()))
            .unwrap();
        assert_eq!(session.name(), "camera+exposure+preview");
        assert_eq!(session.policy(), FramePolicy::Queue { depth: 1 });
        assert_eq!(session.stage_names(), ["camera", "exposure"]);
    }

    #[test]
    fn build_errors_prevent_start() {
        let err = PipelineConfiguration::builder(config())
            .build(Box::new(SoftwareDevice::default()))
            .err()
            .unwrap();
        assert_eq!(err, GraphConfigurationError::MissingPreviewSink);
    }

    #[test]
    fn renders_frames_until_stopped() {
        let preview = Arc::new(LatestFramePreview::new());
        let mut session = PipelineConfiguration::builder(config())
            .name("test")
            .preview(preview.clone())
            .build(Box::new(SoftwareDevice::default()))
            .unwrap();
        let capture = session.start_camera().unwrap();
        assert!(session.is_running());
        assert!(session.graph().is_none());
        assert!(matches!(
            session.start_camera(),
            Err(SessionError::AlreadyStarted)
        ));

        let mut camera = SyntheticCamera::uniform(&config().capture, 200).unwrap();
        let mut delivered = 0;
        while delivered < 5 {
            wait_for(|| capture.stats().1 == capture.stats().0);
            capture.deliver(camera.next_frame());
            delivered += 1;
        }
        wait_for(|| session.counters().count + session.dropped_frames() >= 5);

        session.stop().unwrap();
        assert!(!session.is_running());
        assert!(capture.is_closed());
        assert!(session.graph().is_some());
        assert!(preview.received() > 0);
        assert!(session.exposure() < 0.0);
        assert!(session.fatal_error().is_none());

        session.reset_stats();
        assert_eq!(session.counters(), FrameCounters::default());
        assert_eq!(session.cpu_usage_over(Duration::ZERO), 0.0);
    }

    #[test]
    fn cpu_usage_is_processing_time_over_elapsed() {
        let preview = Arc::new(LatestFramePreview::new());
        let session = PipelineConfiguration::builder(config())
            .preview(preview)
            .build(Box::new(SoftwareDevice::default()))
            .unwrap();
        session.tracker.record_frame(Duration::from_millis(250));
        let usage = session.cpu_usage_over(Duration::from_secs(1));
        assert!((usage - 0.25).abs() < 1e-9);
    }

    #[test]
    fn session_can_restart_after_stop() {
        let preview = Arc::new(LatestFramePreview::new());
        let mut session = PipelineConfiguration::builder(config())
            .preview(preview)
            .build(Box::new(SoftwareDevice::default()))
            .unwrap();
        let first = session.start_camera().unwrap();
        session.stop().unwrap();
        assert!(first.is_closed());

        let second = session.start_camera().unwrap();
        assert!(!second.is_closed());
        session.stop().unwrap();
    }

    #[test]
    fn failed_spawn_keeps_the_graph() {
        let preview = Arc::new(LatestFramePreview::new());
        let mut session = PipelineConfiguration::builder(config())
            .preview(preview)
            .build(Box::new(SoftwareDevice::default()))
            .unwrap();
        let err = session
            .launch(|_| Err(io::Error::other("thread limit")))
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Spawn(_)));
        assert!(session.graph().is_some());
        assert!(!session.is_running());

        let capture = session.start_camera().unwrap();
        assert!(session.is_running());
        session.stop().unwrap();
        assert!(capture.is_closed());
        assert!(session.graph().is_some());
    }

    #[test]
    fn reset_starts_a_fresh_window() {
        let preview = Arc::new(LatestFramePreview::new());
        let session = PipelineConfiguration::builder(config())
            .preview(preview)
            .build(Box::new(SoftwareDevice::default()))
            .unwrap();
        session.tracker.record_frame(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        let (_, stale) = session.stats_window();

        session.reset_stats();
        let (counters, elapsed) = session.stats_window();
        assert_eq!(counters, FrameCounters::default());
        assert!(elapsed < stale);
        assert_eq!(session.cpu_usage(), 0.0);
    }

    #[test]
    fn stats_reads_wait_for_a_reset_in_progress() {
        let preview = Arc::new(LatestFramePreview::new());
        let session = PipelineConfiguration::builder(config())
            .preview(preview)
            .build(Box::new(SoftwareDevice::default()))
            .unwrap();
        session.tracker.record_frame(Duration::from_millis(5));

        let locked = std::sync::Barrier::new(2);
        let released = AtomicBool::new(false);
        std::thread::scope(|scope| {
            // Stand in for a reset that has zeroed the tracker but not yet
            // moved the window.
            let (baseline, tracker) = (&session.baseline, &session.tracker);
            scope.spawn(|| {
                let window = baseline.lock();
                tracker.reset();
                locked.wait();
                std::thread::sleep(Duration::from_millis(20));
                released.store(true, Ordering::SeqCst);
                drop(window);
            });
            locked.wait();
            let (counters, _) = session.stats_window();
            assert!(released.load(Ordering::SeqCst));
            assert_eq!(counters, FrameCounters::default());
        });
    }
}
