//! Output targets for rendered frames

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use flume::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::render::Framebuffer;

/// A rendered frame as handed to preview and encoder collaborators.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub framebuffer: Framebuffer,
    pub timestamp: Duration,
    pub sequence: u64,
}

/// Anything that accepts a framebuffer for display or encoding.
///
/// Called on the render context once per rendered frame, so implementations
/// must return quickly.
pub trait FrameSink: Send + Sync {
    fn name(&self) -> &str;

    fn accept(&self, frame: PreviewFrame);
}

/// Keeps only the most recent frame. Readers on any thread get a consistent
/// frame without blocking the render context.
#[derive(Default)]
pub struct LatestFramePreview {
    latest: ArcSwapOption<PreviewFrame>,
    received: AtomicU64,
}

impl LatestFramePreview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<PreviewFrame>> {
        self.latest.load_full()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Release the held frame back to its pool.
    pub fn clear(&self) {
        self.latest.store(None);
    }
}

impl FrameSink for LatestFramePreview {
    fn name(&self) -> &str {
        "preview"
    }

    fn accept(&self, frame: PreviewFrame) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.latest.store(Some(Arc::new(frame)));
    }
}

/// Forwards frames to a bounded channel, e.g. an encoder thread.
/// Frames are dropped rather than blocking when the consumer lags.
pub struct ChannelSink {
    name: String,
    tx: Sender<PreviewFrame>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, Receiver<PreviewFrame>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, frame: PreviewFrame) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(sink = %self.name, sequence = frame.sequence, "sink full, frame dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{FramebufferDescriptor, FramebufferPool, TextureFormat};

    fn frame(pool: &FramebufferPool, sequence: u64) -> PreviewFrame {
        let desc = FramebufferDescriptor::new(2, 2, TextureFormat::Rgba);
        PreviewFrame {
            framebuffer: pool.acquire(desc).unwrap().publish(),
            timestamp: Duration::from_millis(sequence * 33),
            sequence,
        }
    }

    #[test]
    fn latest_preview_holds_one_frame() {
        let pool = FramebufferPool::new(1 << 20, true);
        let preview = LatestFramePreview::new();
        preview.accept(frame(&pool, 1));
        preview.accept(frame(&pool, 2));
        assert_eq!(preview.latest().unwrap().sequence, 2);
        assert_eq!(preview.received(), 2);
        assert_eq!(pool.stats().live, 1);

        preview.clear();
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let pool = FramebufferPool::new(1 << 20, true);
        let (sink, rx) = ChannelSink::new("encoder", 1);
        sink.accept(frame(&pool, 1));
        sink.accept(frame(&pool, 2));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().sequence, 1);
    }
}
