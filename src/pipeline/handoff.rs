//! Capture to render handoff
//!
//! The capture callback must never block, and the render context must only
//! ever work on one frame at a time. Frames cross over through a bounded
//! flume channel; what happens when the render context is still busy depends
//! on the [`FramePolicy`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::trace;

use crate::capture::Frame;
use crate::pipeline::counters::PerformanceTracker;

/// What to do with a frame that arrives while the render context is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePolicy {
    /// Drop it. Used when frames only feed background measurement.
    Drop,
    /// Queue up to `depth` frames, evicting the oldest when full.
    Queue { depth: usize },
}

/// Outcome of [`CaptureHandle::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queued after evicting the oldest pending frame.
    Replaced,
    Dropped,
    /// The session has stopped.
    Closed,
}

#[derive(Default)]
struct Stats {
    frames_delivered: AtomicU64,
    frames_taken: AtomicU64,
    frames_dropped: AtomicU64,
}

struct Shared {
    busy: AtomicBool,
    closed: AtomicBool,
    stats: CachePadded<Stats>,
    tracker: Arc<PerformanceTracker>,
}

/// Entry point handed to the capture collaborator. Cheap to clone.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: Sender<Frame>,
    evict: Receiver<Frame>,
    policy: FramePolicy,
    shared: Arc<Shared>,
}

/// Render side of the handoff.
pub struct RenderQueue {
    rx: Receiver<Frame>,
    shared: Arc<Shared>,
}

/// Result of waiting on the [`RenderQueue`].
pub enum Next<'a> {
    Frame(Frame, InFlight<'a>),
    /// Nothing arrived before the timeout.
    Idle,
    /// Every capture handle is gone and the queue is drained.
    Closed,
}

/// Marks the render context busy until dropped.
pub struct InFlight<'a> {
    shared: &'a Shared,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.busy.store(false, Ordering::Release);
    }
}

pub fn handoff(
    policy: FramePolicy,
    tracker: Arc<PerformanceTracker>,
) -> (CaptureHandle, RenderQueue) {
    let capacity = match policy {
        FramePolicy::Drop => 1,
        FramePolicy::Queue { depth } => depth.max(1),
    };
    let (tx, rx) = flume::bounded(capacity);
    let shared = Arc::new(Shared {
        busy: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        stats: CachePadded::new(Stats::default()),
        tracker,
    });
    (
        CaptureHandle {
            tx,
            evict: rx.clone(),
            policy,
            shared: shared.clone(),
        },
        RenderQueue { rx, shared },
    )
}

impl CaptureHandle {
    /// Hand a frame to the render context without blocking.
    pub fn deliver(&self, frame: Frame) -> Delivery {
        let sequence = frame.meta.sequence;
        if self.is_closed() {
            return Delivery::Closed;
        }
        let outcome = match self.policy {
            FramePolicy::Drop => {
                // `busy` covers both a pending and an in-flight frame, so
                // claiming it is what admits a frame.
                let claimed = self
                    .shared
                    .busy
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if !claimed {
                    Delivery::Dropped
                } else {
                    let outcome = self.try_send(frame, Delivery::Queued);
                    if outcome != Delivery::Queued {
                        self.shared.busy.store(false, Ordering::Release);
                    }
                    outcome
                }
            }
            FramePolicy::Queue { .. } => match self.tx.try_send(frame) {
                Ok(()) => Delivery::Queued,
                Err(TrySendError::Disconnected(_)) => Delivery::Closed,
                Err(TrySendError::Full(frame)) => {
                    // Drop oldest
                    if self.evict.try_recv().is_ok() {
                        self.count_dropped();
                    }
                    self.try_send(frame, Delivery::Replaced)
                }
            },
        };

        match outcome {
            Delivery::Queued | Delivery::Replaced => {
                self.shared
                    .stats
                    .frames_delivered
                    .fetch_add(1, Ordering::Relaxed);
            }
            Delivery::Dropped => self.count_dropped(),
            Delivery::Closed => {}
        }
        trace!(sequence, ?outcome, "frame delivered");
        outcome
    }

    fn try_send(&self, frame: Frame, success: Delivery) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => success,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Disconnected(_)) => Delivery::Closed,
        }
    }

    fn count_dropped(&self) {
        self.shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        self.shared.tracker.record_dropped();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// (delivered, taken by the render context, dropped)
    pub fn stats(&self) -> (u64, u64, u64) {
        let stats = &self.shared.stats;
        (
            stats.frames_delivered.load(Ordering::Relaxed),
            stats.frames_taken.load(Ordering::Relaxed),
            stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}

impl RenderQueue {
    /// Wait up to `timeout` for the next frame.
    pub fn next(&self, timeout: Duration) -> Next<'_> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                // Already set by the capture side under the drop policy.
                self.shared.busy.store(true, Ordering::Release);
                self.shared.stats.frames_taken.fetch_add(1, Ordering::Relaxed);
                Next::Frame(
                    frame,
                    InFlight {
                        shared: &self.shared,
                    },
                )
            }
            Err(RecvTimeoutError::Timeout) => Next::Idle,
            Err(RecvTimeoutError::Disconnected) => Next::Closed,
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for RenderQueue {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        // Release frames that will never be rendered
        let abandoned = self.rx.drain().count();
        self.shared.busy.store(false, Ordering::Release);
        if abandoned > 0 {
            trace!(abandoned, "render queue closed with pending frames");
        }
    }
}
