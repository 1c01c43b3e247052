//! Frame counters shared between the render thread and stats readers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;

/// Frames rendered and the time spent rendering them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub count: u64,
    pub processing_time: Duration,
}

impl FrameCounters {
    /// Mean render time per frame, if any frame was recorded.
    pub fn average(&self) -> Option<Duration> {
        let nanos = self.processing_time.as_nanos().checked_div(u128::from(self.count))?;
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

/// Tear-free performance bookkeeping.
///
/// `count` and `processing_time` live in one [`AtomicCell`] and are only ever
/// replaced together, so a snapshot can never pair the count of one update
/// with the time of another, and a reset can never split a record.
pub struct PerformanceTracker {
    counters: CachePadded<AtomicCell<FrameCounters>>,
    dropped: CachePadded<AtomicU64>,
    failed: CachePadded<AtomicU64>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            counters: CachePadded::new(AtomicCell::new(FrameCounters::default())),
            dropped: CachePadded::new(AtomicU64::new(0)),
            failed: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Count one completed frame that took `duration` to render.
    pub fn record_frame(&self, duration: Duration) {
        let mut current = self.counters.load();
        loop {
            let next = FrameCounters {
                count: current.count + 1,
                processing_time: current.processing_time.saturating_add(duration),
            };
            match self.counters.compare_exchange(current, next) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        metrics::counter!("mpgpu.frames_rendered").increment(1);
        metrics::histogram!("mpgpu.render_time_us").record(duration.as_micros() as f64);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mpgpu.frames_dropped").increment(1);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mpgpu.frames_failed").increment(1);
    }

    pub fn snapshot(&self) -> FrameCounters {
        self.counters.load()
    }

    /// Zero the frame counters along with the dropped and failed tallies.
    pub fn reset(&self) {
        self.counters.store(FrameCounters::default());
        self.dropped.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}
