//! Decoded-surface lifecycle tracking and pipeline occupancy counters.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::vendor::VideoSurfaceHandle;

/// Lifecycle state of a decoded video surface.
///
/// A surface moves `Free -> Referenced` when the decoder picks it as a
/// decode target, `Referenced -> Rendering` when a decoded picture is
/// submitted downstream, and back to `Free` when the last consumer lets
/// go. `Rendering` surfaces must never be handed back to the decoder; the
/// driver may still be sampling them as temporal references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Free,
    Referenced,
    Rendering,
}

struct Slot {
    handle: VideoSurfaceHandle,
    state: SurfaceState,
}

/// Fixed-capacity pool of decoded video surfaces.
///
/// Surfaces are created lazily by the decode path up to `capacity`; the
/// pool only tracks states, never creates or destroys vendor objects.
pub struct SurfacePool {
    capacity: usize,
    slots: Mutex<Vec<Slot>>,
}

impl SurfacePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Registers a freshly created surface, already claimed by the decoder.
    pub fn add(&self, handle: VideoSurfaceHandle) {
        let mut slots = self.slots.lock();
        debug_assert!(slots.len() < self.capacity);
        slots.push(Slot {
            handle,
            state: SurfaceState::Referenced,
        });
    }

    /// Claims a free surface for decoding, if any.
    pub fn get_free(&self) -> Option<VideoSurfaceHandle> {
        let mut slots = self.slots.lock();
        let slot = slots.iter_mut().find(|s| s.state == SurfaceState::Free)?;
        slot.state = SurfaceState::Referenced;
        Some(slot.handle)
    }

    /// Marks a surface as submitted downstream.
    ///
    /// Accepts `Free` as well as `Referenced` so a flush can re-pin
    /// pictures whose surfaces were already released by a racing return.
    pub fn mark_render(&self, handle: VideoSurfaceHandle) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.handle == handle) {
            slot.state = SurfaceState::Rendering;
        }
    }

    /// Releases a surface the downstream consumers are done with.
    pub fn clear_render(&self, handle: VideoSurfaceHandle) {
        self.set_free(handle);
    }

    /// Releases a surface the decoder claimed but never submitted.
    pub fn clear_reference(&self, handle: VideoSurfaceHandle) {
        self.set_free(handle);
    }

    fn set_free(&self, handle: VideoSurfaceHandle) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.handle == handle) {
            slot.state = SurfaceState::Free;
        }
    }

    /// Whether the handle belongs to this pool (and thus this session).
    pub fn is_valid(&self, handle: VideoSurfaceHandle) -> bool {
        self.slots.lock().iter().any(|s| s.handle == handle)
    }

    pub fn state_of(&self, handle: VideoSurfaceHandle) -> Option<SurfaceState> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.handle == handle)
            .map(|s| s.state)
    }

    pub fn has_free(&self) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|s| s.state == SurfaceState::Free)
    }

    /// Removes and returns one surface for teardown.
    ///
    /// With `skip_rendering`, surfaces still submitted downstream are left
    /// in place and `None` is returned once only those remain.
    pub fn remove_next(&self, skip_rendering: bool) -> Option<VideoSurfaceHandle> {
        let mut slots = self.slots.lock();
        let idx = slots
            .iter()
            .position(|s| !skip_rendering || s.state != SurfaceState::Rendering)?;
        Some(slots.remove(idx).handle)
    }

    /// Forgets all surfaces without touching their vendor objects. Used on
    /// display loss, where the driver has already invalidated everything.
    pub fn reset(&self) {
        self.slots.lock().clear();
    }
}

/// Occupancy counters shared by all pipeline stages.
///
/// `decoded` counts pictures between decode submission and mixer pickup,
/// `processed` between mixer output and render-picture handout, `rendered`
/// pictures held by the consumer. The front door reads `decoded` as its
/// sole backpressure signal and the sum as its drain-completion signal.
pub struct BufferStats {
    decoded: AtomicU64,
    processed: AtomicU64,
    rendered: AtomicU64,
    latency: AtomicI64,
    draining: AtomicBool,
    can_skip_deint: AtomicBool,
    no_postproc: AtomicBool,
}

impl BufferStats {
    pub fn new() -> Self {
        Self {
            decoded: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            rendered: AtomicU64::new(0),
            latency: AtomicI64::new(0),
            draining: AtomicBool::new(false),
            can_skip_deint: AtomicBool::new(false),
            no_postproc: AtomicBool::new(false),
        }
    }

    pub fn inc_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_decoded(&self) {
        let _ = self
            .decoded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_processed(&self) {
        let _ = self
            .processed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn inc_rendered(&self) {
        self.rendered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_rendered(&self) {
        let _ = self
            .rendered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    /// (decoded, processed, rendered) at one instant.
    pub fn counts(&self) -> (u64, u64, u64) {
        (
            self.decoded.load(Ordering::SeqCst),
            self.processed.load(Ordering::SeqCst),
            self.rendered.load(Ordering::SeqCst),
        )
    }

    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::SeqCst)
    }

    /// All stages empty; with draining set this means end of stream.
    pub fn is_empty(&self) -> bool {
        let (d, p, r) = self.counts();
        d == 0 && p == 0 && r == 0
    }

    pub fn set_latency_us(&self, us: i64) {
        self.latency.store(us, Ordering::Relaxed);
    }

    pub fn latency_us(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn set_can_skip_deint(&self, can: bool) {
        self.can_skip_deint.store(can, Ordering::SeqCst);
    }

    pub fn can_skip_deint(&self) -> bool {
        self.can_skip_deint.load(Ordering::SeqCst)
    }

    pub fn set_no_postproc(&self, no: bool) {
        self.no_postproc.store(no, Ordering::SeqCst);
    }

    pub fn no_postproc(&self) -> bool {
        self.no_postproc.load(Ordering::SeqCst)
    }

    /// Zeroes the picture counters after a flush.
    pub fn reset(&self) {
        self.decoded.store(0, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.rendered.store(0, Ordering::SeqCst);
        self.draining.store(false, Ordering::SeqCst);
    }
}

impl Default for BufferStats {
    fn default() -> Self {
        Self::new()
    }
}
