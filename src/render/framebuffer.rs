//! GPU-resident framebuffers and the arena they are allocated from
//!
//! A stage renders into a [`FramebufferMut`] it exclusively owns, then
//! publishes it as a read-only [`Framebuffer`] that any number of downstream
//! consumers may hold. When the last handle drops, the backing storage goes
//! straight back to the [`FramebufferPool`], so release is deterministic and
//! visible through [`FramebufferPool::stats`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::ResourceExhaustionError;

/// Texel layout of a framebuffer. Channels are stored as normalized `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    Rgba,
    Luminance,
}

impl TextureFormat {
    pub fn channels(self) -> usize {
        match self {
            TextureFormat::Rgba => 4,
            TextureFormat::Luminance => 1,
        }
    }
}

/// Dimensions and format of a framebuffer, fixed once a stage is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl FramebufferDescriptor {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.format.channels()
    }

    pub fn size_bytes(&self) -> u64 {
        (self.texel_count() * std::mem::size_of::<f32>()) as u64
    }
}

impl fmt::Display for FramebufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.format)
    }
}

struct Storage {
    id: u64,
    desc: FramebufferDescriptor,
    texels: Vec<f32>,
    pool: Weak<PoolShared>,
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.id, self.desc, std::mem::take(&mut self.texels));
        }
    }
}

/// Render target exclusively owned by the stage drawing into it.
pub struct FramebufferMut {
    storage: Storage,
}

impl FramebufferMut {
    pub fn id(&self) -> u64 {
        self.storage.id
    }

    pub fn descriptor(&self) -> FramebufferDescriptor {
        self.storage.desc
    }

    pub fn texels(&self) -> &[f32] {
        &self.storage.texels
    }

    pub fn texels_mut(&mut self) -> &mut [f32] {
        &mut self.storage.texels
    }

    /// Freeze the contents. No further writes are possible once published.
    pub fn publish(self) -> Framebuffer {
        Framebuffer {
            inner: Arc::new(self.storage),
        }
    }
}

/// Published, immutable framebuffer. Cloning adds a consumer.
#[derive(Clone)]
pub struct Framebuffer {
    inner: Arc<Storage>,
}

impl Framebuffer {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn descriptor(&self) -> FramebufferDescriptor {
        self.inner.desc
    }

    pub fn width(&self) -> u32 {
        self.inner.desc.width
    }

    pub fn height(&self) -> u32 {
        self.inner.desc.height
    }

    pub fn format(&self) -> TextureFormat {
        self.inner.desc.format
    }

    pub fn texels(&self) -> &[f32] {
        &self.inner.texels
    }

    /// Channels of the texel at (`x`, `y`).
    pub fn texel(&self, x: u32, y: u32) -> &[f32] {
        let channels = self.inner.desc.format.channels();
        let start = (y as usize * self.inner.desc.width as usize + x as usize) * channels;
        &self.inner.texels[start..start + channels]
    }

    /// Number of live handles to this framebuffer.
    pub fn consumers(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.inner.id)
            .field("desc", &self.inner.desc)
            .finish()
    }
}

/// Allocation statistics of a [`FramebufferPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Framebuffers currently held by a stage or consumer.
    pub live: u64,
    /// Fresh backing allocations.
    pub allocated: u64,
    /// Allocations served from the free-list.
    pub reused: u64,
    /// Framebuffers whose last handle was dropped.
    pub released: u64,
    /// Bytes backing live and cached framebuffers.
    pub resident_bytes: u64,
}

#[derive(Default)]
struct Counters {
    live: AtomicU64,
    allocated: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
}

#[derive(Default)]
struct FreeLists {
    cached: HashMap<FramebufferDescriptor, Vec<Vec<f32>>>,
    resident_bytes: u64,
}

impl FreeLists {
    fn evict_one(&mut self) -> bool {
        let Some(desc) = self
            .cached
            .iter()
            .find(|(_, list)| !list.is_empty())
            .map(|(desc, _)| *desc)
        else {
            return false;
        };
        if let Some(list) = self.cached.get_mut(&desc) {
            list.pop();
            self.resident_bytes -= desc.size_bytes();
        }
        true
    }
}

struct PoolShared {
    budget_bytes: u64,
    reuse: bool,
    next_id: AtomicU64,
    free: Mutex<FreeLists>,
    counters: CachePadded<Counters>,
}

impl PoolShared {
    fn release(&self, id: u64, desc: FramebufferDescriptor, texels: Vec<f32>) {
        self.counters.live.fetch_sub(1, Ordering::AcqRel);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if self.reuse {
            free.cached.entry(desc).or_default().push(texels);
        } else {
            free.resident_bytes -= desc.size_bytes();
        }
        trace!(id, %desc, "framebuffer released");
    }
}

/// Arena of framebuffer backing storage, owned by the render device.
#[derive(Clone)]
pub struct FramebufferPool {
    shared: Arc<PoolShared>,
}

impl FramebufferPool {
    pub fn new(budget_bytes: u64, reuse: bool) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                budget_bytes,
                reuse,
                next_id: AtomicU64::new(1),
                free: Mutex::new(FreeLists::default()),
                counters: CachePadded::new(Counters::default()),
            }),
        }
    }

    /// Hand out a zeroed render target, reusing cached storage when possible.
    pub fn acquire(
        &self,
        desc: FramebufferDescriptor,
    ) -> Result<FramebufferMut, ResourceExhaustionError> {
        let size = desc.size_bytes();
        let mut free = self.shared.free.lock();

        let texels = match free.cached.get_mut(&desc).and_then(Vec::pop) {
            Some(mut texels) => {
                texels.fill(0.0);
                self.shared.counters.reused.fetch_add(1, Ordering::Relaxed);
                texels
            }
            None => {
                while free.resident_bytes + size > self.shared.budget_bytes {
                    if !free.evict_one() {
                        return Err(ResourceExhaustionError::OutOfMemory {
                            requested: size,
                            budget: self.shared.budget_bytes,
                        });
                    }
                }
                free.resident_bytes += size;
                self.shared.counters.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0.0; desc.texel_count()]
            }
        };
        drop(free);

        self.shared.counters.live.fetch_add(1, Ordering::AcqRel);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(id, %desc, "framebuffer acquired");

        Ok(FramebufferMut {
            storage: Storage {
                id,
                desc,
                texels,
                pool: Arc::downgrade(&self.shared),
            },
        })
    }

    /// Drop all cached storage. Live framebuffers are unaffected.
    pub fn purge(&self) {
        let mut free = self.shared.free.lock();
        let cached: u64 = free
            .cached
            .iter()
            .map(|(desc, list)| desc.size_bytes() * list.len() as u64)
            .sum();
        free.cached.clear();
        free.resident_bytes -= cached;
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            live: counters.live.load(Ordering::Acquire),
            allocated: counters.allocated.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            released: counters.released.load(Ordering::Relaxed),
            resident_bytes: self.shared.free.lock().resident_bytes,
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.shared.budget_bytes
    }
}
