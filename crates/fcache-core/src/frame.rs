//! In-memory frames and the RAII guards serializing access to their bytes.
//!
//! Frame metadata transitions follow a strict protocol (violations are
//! engine bugs and abort):
//!
//! - `dirty` implies `ready` and `used`.
//! - the owning page may only change while the frame is neither ready nor
//!   dirty.
//! - `used` may only be cleared once the frame is clean.

use crate::sync::Signal;
use fcache_types::{PAGE_SIZE, PageId};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::error;

/// One page-sized slot of the pool.
#[derive(Debug)]
pub struct Frame {
    data: RwLock<Box<[u8]>>,
    owning_page: AtomicU64,
    last_use: AtomicU64,
    used_size: AtomicUsize,
    used: AtomicBool,
    ready: AtomicBool,
    dirty: AtomicBool,
}

impl Frame {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            data: RwLock::new(vec![0_u8; PAGE_SIZE].into_boxed_slice()),
            owning_page: AtomicU64::new(PageId::NONE.0),
            last_use: AtomicU64::new(0),
            used_size: AtomicUsize::new(0),
            used: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn owning_page(&self) -> PageId {
        PageId(self.owning_page.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn used_size(&self) -> usize {
        self.used_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_use(&self) -> u64 {
        self.last_use.load(Ordering::Acquire)
    }

    pub(crate) fn set_owning_page(&self, page: PageId) {
        if self.is_ready() || self.is_dirty() {
            error!(
                event = "frame_invariant_violation",
                transition = "set_owning_page",
                page = %page,
                ready = self.is_ready(),
                dirty = self.is_dirty()
            );
            panic!("owning page changed on a ready or dirty frame");
        }
        self.owning_page.store(page.0, Ordering::Release);
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        if ready {
            // A frame cannot be dirty before it is ready.
            assert!(
                self.is_ready() || !self.is_dirty(),
                "frame became dirty before it was ready"
            );
        } else {
            assert!(!self.is_dirty(), "ready cleared on a dirty frame");
        }
        self.ready.store(ready, Ordering::Release);
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        assert!(self.is_ready(), "dirty toggled on a frame that is not ready");
        self.dirty.store(dirty, Ordering::Release);
    }

    pub(crate) fn set_used(&self, used: bool) {
        // All pending write-back must have completed first.
        assert!(!self.is_dirty(), "used toggled on a dirty frame");
        self.used.store(used, Ordering::Release);
    }

    pub(crate) fn set_used_size(&self, size: usize) {
        debug_assert!(size <= PAGE_SIZE);
        self.used_size.store(size, Ordering::Release);
    }

    /// Extend `used_size` to at least `end` (capped at the page size).
    pub(crate) fn grow_used_size(&self, end: usize) {
        let end = end.min(PAGE_SIZE);
        self.used_size.fetch_max(end, Ordering::AcqRel);
    }

    pub(crate) fn set_last_use(&self, tick: u64) {
        self.last_use.store(tick, Ordering::Release);
    }

    /// Clear page binding and valid byte count of an unbound frame.
    pub(crate) fn reset(&self) {
        self.set_owning_page(PageId::NONE);
        self.set_used_size(0);
    }

    /// Zero the frame bytes. Only used while the frame is unbound.
    pub(crate) fn wipe(&self) {
        self.data.write().fill(0);
    }
}

/// Shared read access to a frame's bytes.
///
/// Waits for the frame to become ready (on the owning descriptor's
/// readiness signal) before taking the lock, so consumers never observe a
/// partially loaded page.
pub struct FrameRead<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
}

impl<'a> FrameRead<'a> {
    pub(crate) fn acquire(frame: &'a Frame, ready: &Signal) -> Self {
        ready.wait_until(|| frame.is_ready());
        Self {
            guard: frame.data.read(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive write access to a frame's bytes.
pub struct FrameWrite<'a> {
    guard: RwLockWriteGuard<'a, Box<[u8]>>,
}

impl<'a> FrameWrite<'a> {
    /// Consumer write path: wait until the page is loaded, then lock.
    pub(crate) fn acquire(frame: &'a Frame, ready: &Signal) -> Self {
        ready.wait_until(|| frame.is_ready());
        Self {
            guard: frame.data.write(),
        }
    }

    /// I/O path (page load): wait until any pending write-back of the
    /// previous contents has completed, then lock. A load must never
    /// overwrite bytes a store is still flushing.
    pub(crate) fn acquire_io(frame: &'a Frame, clean: &Signal) -> Self {
        clean.wait_until(|| !frame.is_dirty());
        Self {
            guard: frame.data.write(),
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcache_types::Handle;

    fn bound_frame() -> Frame {
        let frame = Frame::new();
        frame.set_used(true);
        frame.set_owning_page(PageId::new(Handle(1), 0));
        frame
    }

    #[test]
    fn fresh_frame_is_unbound() {
        let frame = Frame::new();
        assert_eq!(frame.owning_page(), PageId::NONE);
        assert!(!frame.is_used());
        assert!(!frame.is_ready());
        assert!(!frame.is_dirty());
        assert_eq!(frame.used_size(), 0);
    }

    #[test]
    fn ready_then_dirty_then_clean() {
        let frame = bound_frame();
        frame.set_ready(true);
        frame.set_dirty(true);
        assert!(frame.is_dirty());
        frame.set_dirty(false);
        frame.set_ready(false);
        assert!(!frame.is_ready());
    }

    #[test]
    #[should_panic(expected = "dirty toggled on a frame that is not ready")]
    fn dirty_requires_ready() {
        let frame = bound_frame();
        frame.set_dirty(true);
    }

    #[test]
    #[should_panic(expected = "owning page changed on a ready or dirty frame")]
    fn rebind_requires_not_ready() {
        let frame = bound_frame();
        frame.set_ready(true);
        frame.set_owning_page(PageId::new(Handle(2), 0));
    }

    #[test]
    #[should_panic(expected = "used toggled on a dirty frame")]
    fn release_requires_clean() {
        let frame = bound_frame();
        frame.set_ready(true);
        frame.set_dirty(true);
        frame.set_used(false);
    }

    #[test]
    fn used_size_grows_monotonically_and_caps() {
        let frame = bound_frame();
        frame.grow_used_size(100);
        frame.grow_used_size(50);
        assert_eq!(frame.used_size(), 100);
        frame.grow_used_size(PAGE_SIZE + 5);
        assert_eq!(frame.used_size(), PAGE_SIZE);
    }
}
