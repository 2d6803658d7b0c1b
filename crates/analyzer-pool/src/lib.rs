//! Reference-counted frame arena for the analyzer pipeline.
//!
//! Decoded frames are written once into a fixed set of pre-allocated slots and then
//! handed between workers as [`FrameRef`] handles. A handle never owns pixel data; the
//! arena does. Each live handle holds exactly one increment of its slot's reference
//! count, so the count can only change through handle construction and `Drop`:
//!
//! ```text
//!   allocate()        write()            checkout()/clone()      drop / release()
//!  Free ──────► Allocated ──────► Busy(rc=1) ──────► Busy(rc+1) ──────► Busy(rc-1)
//!    ▲              │ drop                                               │ rc == 0
//!    └──────────────┴────────────── zeroed, pushed to free list ◄────────┘
//! ```
//!
//! A slot is therefore writable only while it is free, the count never goes negative,
//! and every handle dropped anywhere (including by a queue evicting its oldest item)
//! performs exactly one release.
//!
//! # Example
//!
//! ```
//! use analyzer_pool::{FrameArena, FrameShape, PixelDtype};
//!
//! let arena = FrameArena::new(4, 64 * 64 * 3);
//! let slot = arena.allocate("cam-1").unwrap();
//! let frame = arena
//!     .write(slot, &vec![7u8; 64 * 64 * 3], FrameShape::bgr(64, 64), PixelDtype::U8)
//!     .unwrap();
//!
//! let copy = arena.checkout(&frame).unwrap();
//! assert_eq!(frame.ref_count(), 2);
//! assert_eq!(copy.pixels[0], 7);
//!
//! drop(copy);
//! drop(frame);
//! assert_eq!(arena.stats().free, 4);
//! ```

pub mod frame;
pub mod queue;

pub use frame::{FrameId, FrameMeta, FrameShape, PixelDtype};
pub use queue::{BoundedQueue, OverflowPolicy, QueueStats};

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, error, info};

/// Failures reported by [`FrameArena`] operations.
///
/// None of these are retried by the arena itself; the caller decides whether to drop
/// the frame and continue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// Every slot is in use and the stale-reclaim pass found nothing to recover.
    #[error("frame arena full ({capacity} slots in use)")]
    Full {
        /// Total slot count.
        capacity: usize,
    },

    /// Frame payload exceeds the fixed slot capacity.
    #[error("frame too large: {bytes} bytes exceeds slot capacity of {max_bytes} bytes")]
    TooLarge {
        /// Size of the rejected payload.
        bytes: usize,
        /// Slot capacity.
        max_bytes: usize,
    },

    /// Payload length does not match the declared shape and dtype.
    #[error("frame payload is {actual} bytes but shape requires {expected} bytes")]
    ShapeMismatch {
        /// Bytes implied by shape and dtype.
        expected: usize,
        /// Bytes supplied.
        actual: usize,
    },

    /// Shape dimensions overflow `usize`.
    #[error("frame dimensions overflow")]
    SizeOverflow,

    /// The handle belongs to a different arena.
    #[error("frame handle belongs to a different arena")]
    ForeignFrame,

    /// The slot no longer holds a live frame.
    #[error("slot {slot} no longer holds a live frame")]
    ReleasedSlot {
        /// Slot index.
        slot: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Allocated,
    Busy,
}

struct ArenaSlot {
    data: Box<[u8]>,
    len: usize,
    state: SlotState,
    ref_count: u32,
    owner: Option<Arc<str>>,
}

impl ArenaSlot {
    fn clear(&mut self) {
        self.data[..self.len].fill(0);
        self.len = 0;
        self.state = SlotState::Free;
        self.ref_count = 0;
        self.owner = None;
    }
}

#[derive(Default)]
struct ArenaMetrics {
    allocations: AtomicU64,
    releases: AtomicU64,
    reclaimed: AtomicU64,
    full_rejections: AtomicU64,
}

struct ArenaInner {
    slots: Vec<Mutex<ArenaSlot>>,
    free: SegQueue<usize>,
    slot_capacity: usize,
    next_frame_id: AtomicU64,
    metrics: ArenaMetrics,
}

impl ArenaInner {
    /// Return a slot to the free list. Caller must already have cleared it.
    fn push_free(&self, index: usize) {
        self.free.push(index);
        self.metrics.releases.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, index: usize) {
        let returned = {
            let mut slot = self.slots[index].lock();
            match slot.ref_count.checked_sub(1) {
                None => {
                    error!(slot = index, "release on slot with zero reference count");
                    false
                }
                Some(0) => {
                    slot.clear();
                    true
                }
                Some(remaining) => {
                    slot.ref_count = remaining;
                    false
                }
            }
        };
        if returned {
            self.push_free(index);
        }
    }
}

/// Point-in-time arena counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    /// Total slots.
    pub capacity: usize,
    /// Slots on the free list.
    pub free: usize,
    /// Slots allocated or holding a live frame.
    pub busy: usize,
    /// Successful allocations since creation.
    pub allocations: u64,
    /// Slots returned to the free list since creation.
    pub releases: u64,
    /// Slots recovered by the stale-reclaim pass.
    pub reclaimed: u64,
    /// Allocations rejected because the arena was full.
    pub full_rejections: u64,
}

/// Fixed-capacity pool of frame slots shared by every worker of a pipeline.
///
/// Cloning is cheap and yields another handle to the same slots.
#[derive(Clone)]
pub struct FrameArena {
    inner: Arc<ArenaInner>,
}

impl FrameArena {
    /// Create an arena of `slot_count` slots, each able to hold `slot_capacity` bytes.
    ///
    /// All slot memory is allocated up front; `slot_count` is clamped to at least one.
    pub fn new(slot_count: usize, slot_capacity: usize) -> Self {
        let slot_count = slot_count.max(1);
        let slots = (0..slot_count)
            .map(|_| {
                Mutex::new(ArenaSlot {
                    data: vec![0u8; slot_capacity].into_boxed_slice(),
                    len: 0,
                    state: SlotState::Free,
                    ref_count: 0,
                    owner: None,
                })
            })
            .collect();

        let free = SegQueue::new();
        for i in 0..slot_count {
            free.push(i);
        }

        info!(
            slot_count,
            slot_capacity_kb = slot_capacity / 1024,
            total_mb = (slot_count * slot_capacity) / (1024 * 1024),
            "FrameArena created"
        );

        Self {
            inner: Arc::new(ArenaInner {
                slots,
                free,
                slot_capacity,
                next_frame_id: AtomicU64::new(1),
                metrics: ArenaMetrics::default(),
            }),
        }
    }

    /// Bytes each slot can hold.
    pub fn slot_capacity(&self) -> usize {
        self.inner.slot_capacity
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Take a free slot for `stream_id`. Never blocks.
    ///
    /// When the free list is empty one stale-reclaim pass runs before giving up with
    /// [`ArenaError::Full`].
    pub fn allocate(&self, stream_id: &str) -> Result<SlotHandle, ArenaError> {
        let index = match self.inner.free.pop() {
            Some(index) => index,
            None => {
                self.reclaim_stale();
                match self.inner.free.pop() {
                    Some(index) => index,
                    None => {
                        self.inner
                            .metrics
                            .full_rejections
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(stream_id, capacity = self.capacity(), "arena full");
                        return Err(ArenaError::Full {
                            capacity: self.capacity(),
                        });
                    }
                }
            }
        };

        {
            let mut slot = self.inner.slots[index].lock();
            slot.state = SlotState::Allocated;
            slot.owner = Some(Arc::from(stream_id));
        }
        self.inner.metrics.allocations.fetch_add(1, Ordering::Relaxed);

        Ok(SlotHandle {
            arena: Arc::clone(&self.inner),
            index,
            committed: false,
        })
    }

    /// Copy `bytes` into an allocated slot and publish it as a frame with one reference.
    ///
    /// Consumes the slot handle; on error the slot goes straight back to the free list.
    pub fn write(
        &self,
        mut slot: SlotHandle,
        bytes: &[u8],
        shape: FrameShape,
        dtype: PixelDtype,
    ) -> Result<FrameRef, ArenaError> {
        if !Arc::ptr_eq(&self.inner, &slot.arena) {
            return Err(ArenaError::ForeignFrame);
        }
        let expected = shape.byte_len(dtype).ok_or(ArenaError::SizeOverflow)?;
        if bytes.len() > self.inner.slot_capacity {
            return Err(ArenaError::TooLarge {
                bytes: bytes.len(),
                max_bytes: self.inner.slot_capacity,
            });
        }
        if bytes.len() != expected {
            return Err(ArenaError::ShapeMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let stream_id = {
            let mut guard = self.inner.slots[slot.index].lock();
            guard.data[..bytes.len()].copy_from_slice(bytes);
            guard.len = bytes.len();
            guard.state = SlotState::Busy;
            guard.ref_count = 1;
            guard.owner.clone().unwrap_or_else(|| Arc::from(""))
        };
        slot.committed = true;

        let meta = FrameMeta {
            id: FrameId(self.inner.next_frame_id.fetch_add(1, Ordering::Relaxed)),
            shape,
            dtype,
            stream_id,
            timestamp: SystemTime::now(),
        };

        Ok(FrameRef {
            arena: Arc::clone(&self.inner),
            index: slot.index,
            meta: Arc::new(meta),
        })
    }

    /// Take another reference to `frame` together with a private copy of its pixels.
    ///
    /// The returned [`Checkout`] holds the new reference; dropping it releases.
    pub fn checkout(&self, frame: &FrameRef) -> Result<Checkout, ArenaError> {
        if !Arc::ptr_eq(&self.inner, &frame.arena) {
            return Err(ArenaError::ForeignFrame);
        }
        let pixels = {
            let mut slot = self.inner.slots[frame.index].lock();
            if slot.state != SlotState::Busy || slot.ref_count == 0 {
                return Err(ArenaError::ReleasedSlot { slot: frame.index });
            }
            slot.ref_count += 1;
            Bytes::copy_from_slice(&slot.data[..slot.len])
        };
        Ok(Checkout {
            frame: FrameRef {
                arena: Arc::clone(&self.inner),
                index: frame.index,
                meta: Arc::clone(&frame.meta),
            },
            pixels,
        })
    }

    /// Give up one reference. Equivalent to dropping the handle.
    pub fn release(&self, frame: FrameRef) {
        drop(frame);
    }

    /// Recover slots that are marked busy with a zero reference count.
    ///
    /// Runs synchronously; returns the number of slots put back on the free list.
    pub fn reclaim_stale(&self) -> usize {
        let mut reclaimed = 0;
        for (index, slot) in self.inner.slots.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.state == SlotState::Busy && slot.ref_count == 0 {
                slot.clear();
                drop(slot);
                self.inner.push_free(index);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            self.inner
                .metrics
                .reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
            info!(reclaimed, "reclaimed stale arena slots");
        }
        reclaimed
    }

    /// Current counters.
    pub fn stats(&self) -> ArenaStats {
        let capacity = self.capacity();
        let free = self.inner.free.len();
        let m = &self.inner.metrics;
        ArenaStats {
            capacity,
            free,
            busy: capacity.saturating_sub(free),
            allocations: m.allocations.load(Ordering::Relaxed),
            releases: m.releases.load(Ordering::Relaxed),
            reclaimed: m.reclaimed.load(Ordering::Relaxed),
            full_rejections: m.full_rejections.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FrameArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameArena")
            .field("capacity", &self.capacity())
            .field("slot_capacity", &self.inner.slot_capacity)
            .field("free", &self.inner.free.len())
            .finish()
    }
}

/// Exclusive claim on an allocated but not yet written slot.
///
/// Dropping it without a successful [`FrameArena::write`] frees the slot.
pub struct SlotHandle {
    arena: Arc<ArenaInner>,
    index: usize,
    committed: bool,
}

impl SlotHandle {
    /// Slot index inside the arena.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.arena.slots[self.index].lock().clear();
        self.arena.push_free(self.index);
    }
}

/// Counted handle to a frame living in an arena slot.
///
/// Cloning takes another reference; dropping gives one back. The slot is zeroed and
/// returned to the free list when the last handle goes away.
pub struct FrameRef {
    arena: Arc<ArenaInner>,
    index: usize,
    meta: Arc<FrameMeta>,
}

impl FrameRef {
    /// Frame metadata.
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// Arena-assigned frame id.
    pub fn id(&self) -> FrameId {
        self.meta.id
    }

    /// Frame geometry.
    pub fn shape(&self) -> FrameShape {
        self.meta.shape
    }

    /// Stream that produced this frame.
    pub fn stream_id(&self) -> &str {
        &self.meta.stream_id
    }

    /// Slot index inside the arena.
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Current reference count of the underlying slot.
    pub fn ref_count(&self) -> u32 {
        self.arena.slots[self.index].lock().ref_count
    }

    /// Give up this reference.
    pub fn release(self) {
        drop(self);
    }
}

impl Clone for FrameRef {
    fn clone(&self) -> Self {
        self.arena.slots[self.index].lock().ref_count += 1;
        Self {
            arena: Arc::clone(&self.arena),
            index: self.index,
            meta: Arc::clone(&self.meta),
        }
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        self.arena.release(self.index);
    }
}

impl std::fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRef")
            .field("id", &self.meta.id)
            .field("slot", &self.index)
            .field("shape", &self.meta.shape)
            .field("stream_id", &self.meta.stream_id)
            .finish()
    }
}

/// A frame reference paired with a private copy of its pixels.
#[derive(Debug)]
pub struct Checkout {
    /// Reference taken by the checkout.
    pub frame: FrameRef,
    /// Copied pixel payload.
    pub pixels: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const W: u32 = 8;
    const H: u32 = 4;

    fn payload(fill: u8) -> Vec<u8> {
        vec![fill; (W * H * 3) as usize]
    }

    fn write_frame(arena: &FrameArena, fill: u8) -> FrameRef {
        let slot = arena.allocate("cam").unwrap();
        arena
            .write(slot, &payload(fill), FrameShape::bgr(W, H), PixelDtype::U8)
            .unwrap()
    }

    #[test]
    fn test_write_starts_with_one_reference() {
        let arena = FrameArena::new(2, 1024);
        let frame = write_frame(&arena, 1);
        assert_eq!(frame.ref_count(), 1);
        assert_eq!(frame.stream_id(), "cam");
        assert_eq!(arena.stats().free, 1);
    }

    #[test]
    fn test_allocate_when_full_reports_full() {
        let arena = FrameArena::new(2, 1024);
        let _a = write_frame(&arena, 1);
        let _b = write_frame(&arena, 2);
        let err = arena.allocate("cam").err();
        assert_eq!(err, Some(ArenaError::Full { capacity: 2 }));
        assert_eq!(arena.stats().full_rejections, 1);
    }

    #[test]
    fn test_too_large_returns_slot() {
        let arena = FrameArena::new(1, 16);
        let slot = arena.allocate("cam").unwrap();
        let err = arena
            .write(slot, &payload(0), FrameShape::bgr(W, H), PixelDtype::U8)
            .unwrap_err();
        assert!(matches!(err, ArenaError::TooLarge { max_bytes: 16, .. }));
        assert_eq!(arena.stats().free, 1);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let arena = FrameArena::new(1, 1024);
        let slot = arena.allocate("cam").unwrap();
        let err = arena
            .write(slot, &[0u8; 10], FrameShape::bgr(W, H), PixelDtype::U8)
            .unwrap_err();
        assert!(matches!(err, ArenaError::ShapeMismatch { actual: 10, .. }));
    }

    #[test]
    fn test_unwritten_slot_returns_on_drop() {
        let arena = FrameArena::new(1, 1024);
        let slot = arena.allocate("cam").unwrap();
        assert_eq!(arena.stats().free, 0);
        drop(slot);
        assert_eq!(arena.stats().free, 1);
    }

    #[test]
    fn test_checkout_copies_and_counts() {
        let arena = FrameArena::new(1, 1024);
        let frame = write_frame(&arena, 9);
        let checkout = arena.checkout(&frame).unwrap();
        assert_eq!(frame.ref_count(), 2);
        assert!(checkout.pixels.iter().all(|&b| b == 9));

        drop(frame);
        assert_eq!(checkout.frame.ref_count(), 1);
        assert_eq!(arena.stats().free, 0);

        drop(checkout);
        assert_eq!(arena.stats().free, 1);
    }

    #[test]
    fn test_released_slot_is_zeroed() {
        let arena = FrameArena::new(1, 1024);
        drop(write_frame(&arena, 0xAB));
        let slot = arena.allocate("cam").unwrap();
        let frame = arena
            .write(slot, &payload(0), FrameShape::bgr(W, H), PixelDtype::U8)
            .unwrap();
        let checkout = arena.checkout(&frame).unwrap();
        assert!(checkout.pixels.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_foreign_frame_rejected() {
        let a = FrameArena::new(1, 1024);
        let b = FrameArena::new(1, 1024);
        let frame = write_frame(&a, 1);
        assert_eq!(b.checkout(&frame).err(), Some(ArenaError::ForeignFrame));
    }

    #[test]
    fn test_no_stale_slots_under_normal_release() {
        let arena = FrameArena::new(2, 1024);
        drop(write_frame(&arena, 1));
        assert_eq!(arena.reclaim_stale(), 0);
    }

    #[test]
    fn test_random_cycles_never_leak() {
        let arena = FrameArena::new(8, 1024);
        let mut rng = rand::thread_rng();
        let mut live: Vec<FrameRef> = Vec::new();

        for _ in 0..2_000 {
            match rng.gen_range(0..3) {
                0 => {
                    if let Ok(slot) = arena.allocate("cam") {
                        live.push(
                            arena
                                .write(slot, &payload(3), FrameShape::bgr(W, H), PixelDtype::U8)
                                .unwrap(),
                        );
                    }
                }
                1 if !live.is_empty() => {
                    let idx = rng.gen_range(0..live.len());
                    let checkout = arena.checkout(&live[idx]).unwrap();
                    live.push(checkout.frame);
                }
                _ if !live.is_empty() => {
                    let idx = rng.gen_range(0..live.len());
                    live.swap_remove(idx).release();
                }
                _ => {}
            }
            for frame in &live {
                assert!(frame.ref_count() >= 1);
            }
        }

        live.clear();
        let stats = arena.stats();
        assert_eq!(stats.free, 8);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.allocations, stats.releases);
    }
}
