//! mpgpu demo: synthetic camera through a filter graph with auto exposure

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use mpgpu::capture::SyntheticCamera;
use mpgpu::display::LatestFramePreview;
use mpgpu::pipeline::Delivery;
use mpgpu::render::SoftwareDevice;
use mpgpu::{Config, PipelineConfiguration};

/// Scene brightness cycles through these so the exposure loop has work to do.
const BRIGHTNESS_STEPS: [f32; 4] = [1.0, 1.8, 0.4, 1.0];
const STEP_INTERVAL: Duration = Duration::from_secs(3);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mpgpu=debug"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("mpgpu launching...");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    let device = SoftwareDevice::new(
        config.memory_budget_bytes(),
        config.pipeline.reuse_framebuffers,
    );
    let preview = Arc::new(LatestFramePreview::new());
    let mut session = PipelineConfiguration::builder(config.clone())
        .preview(preview.clone())
        .build(Box::new(device))?;
    info!(name = session.name(), stages = ?session.stage_names(), "session ready");

    let mut camera = SyntheticCamera::from_config(&config.capture)?;
    let capture = session.start_camera()?;

    // Capture side: one frame per interval, never waiting on the renderer
    let capture_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(camera.frame_interval());
        let mut step = tokio::time::interval(STEP_INTERVAL);
        let mut brightness = BRIGHTNESS_STEPS.iter().cycle();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if capture.deliver(camera.next_frame()) == Delivery::Closed {
                        break;
                    }
                }
                _ = step.tick() => {
                    if let Some(&level) = brightness.next() {
                        info!(level, "scene brightness changed");
                        camera.set_brightness(level);
                    }
                }
            }
        }
        camera.sequence()
    });

    let mut report = tokio::time::interval(Duration::from_millis(
        config.stats.report_interval_ms.max(1),
    ));
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = report.tick() => {
                let counters = session.counters();
                info!(
                    fps = format!("{:.1}", session.frame_rate()),
                    cpu = format!("{:.1}%", session.cpu_usage() * 100.0),
                    exposure = format!("{:+.2}", session.exposure()),
                    frames = counters.count,
                    avg = ?counters.average(),
                    dropped = session.dropped_frames(),
                    failed = session.failed_frames(),
                    previewed = preview.received(),
                    "stats"
                );
                session.reset_stats();
                if !session.is_running() {
                    warn!("render thread stopped");
                    break;
                }
            }
        }
    }

    session.stop()?;
    let captured = capture_task.await?;
    info!(captured, "mpgpu shutting down");

    match session.fatal_error() {
        Some(err) => Err(eyre!("session ended with error: {err}")),
        None => Ok(()),
    }
}
