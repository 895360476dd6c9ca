#![forbid(unsafe_code)]
//! Paged file cache engine.
//!
//! One `PageCache` instance owns a fixed pool of page-sized frames, keeps
//! a subset of each open file's pages resident according to the file's
//! replacement policy, and issues all backing-store I/O from a single
//! background worker. Reads and writes are served from resident frames;
//! misses stage frames and enqueue loads; dirty frames are written back on
//! eviction, explicit flush, or close.
//!
//! # Concurrency design
//!
//! **Locking strategy:** one `parking_lot::Mutex<EngineState>` guards all
//! structural state (descriptor table, page index, policy tables, prefix
//! pool, tick). The lock is never held across backing-store I/O, and is
//! released (via `MutexGuard::unlocked`) around the only blocking wait a
//! structural update can hit, the wait for a frame's pending write-back.
//! Frame bytes are guarded by one `RwLock` per frame; waiters synchronize
//! on the owning descriptor's readiness/cleanliness signals and re-check
//! their frame's flag after each wake.
//!
//! Consumer threads call the public operations concurrently with the
//! worker; a file is driven by at most one consumer handle at a time.

mod descriptor;
mod frame;
mod policy;
mod queue;
mod sync;
mod worker;

use descriptor::Descriptor;
use fcache_error::{FcError, Result};
use fcache_store::{FsOpener, SourceOpener};
use fcache_types::{
    CachePolicy, DEFAULT_PREFETCH_PAGES, FIFO_THRESHOLD, FrameId, Handle, KEEP_THRESHOLD,
    LRU_THRESHOLD, MAX_HANDLE, NUM_FRAMES, OpenMode, PAGE_OFFSET_MASK, PAGE_SIZE, PAGE_SIZE_U64,
    PageId, Whence, page_align_down, page_remainder,
};
use frame::{Frame, FrameRead, FrameWrite};
use parking_lot::{Mutex as PlMutex, MutexGuard};
use policy::PolicyTables;
use queue::{CtrlOp, CtrlQueue};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub use queue::QueuedOp;

/// Engine tuning knobs.
///
/// `PAGE_SIZE` is fixed; the pool size and the per-policy thresholds are
/// configurable so small caches can be built for tests and tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Resident-page threshold for the `KEEP` policy.
    pub keep_threshold: usize,
    /// Resident-page threshold (and aging window) for the `LRU` policy.
    pub lru_threshold: usize,
    /// Resident-page threshold for the `FIFO` policy.
    pub fifo_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_frames: NUM_FRAMES,
            keep_threshold: KEEP_THRESHOLD,
            lru_threshold: LRU_THRESHOLD,
            fifo_threshold: FIFO_THRESHOLD,
        }
    }
}

impl CacheConfig {
    fn validate(self) -> Result<Self> {
        if self.num_frames == 0 {
            return Err(FcError::InvalidParameter(
                "num_frames must be > 0".to_owned(),
            ));
        }
        if self.keep_threshold == 0 || self.lru_threshold == 0 || self.fifo_threshold == 0 {
            return Err(FcError::InvalidParameter(
                "policy thresholds must be > 0".to_owned(),
            ));
        }
        Ok(self)
    }

    fn threshold_for(&self, policy: CachePolicy) -> usize {
        match policy {
            CachePolicy::Keep => self.keep_threshold,
            CachePolicy::Lru => self.lru_threshold,
            CachePolicy::Fifo => self.fifo_threshold,
        }
    }
}

/// Point-in-time counters of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    /// Lookups satisfied by a resident page.
    pub hits: u64,
    /// Lookups that staged a new frame.
    pub misses: u64,
    /// Resident pages displaced to make room.
    pub evictions: u64,
    /// Pages materialized by inline zero-fill instead of a load.
    pub zero_fills: u64,
    /// Loads completed by the worker.
    pub loads: u64,
    /// Stores completed by the worker.
    pub stores: u64,
    /// Pages currently resident across all files.
    pub resident_pages: usize,
    /// Frames with unflushed writes.
    pub dirty_frames: usize,
    /// Files currently open (valid descriptors).
    pub open_files: usize,
    /// Operations waiting in the control queue.
    pub queue_len: usize,
    /// Monotonic allocation tick.
    pub tick: u64,
    /// Size of the frame pool.
    pub num_frames: usize,
}

impl CacheMetrics {
    /// Hit ratio in `[0.0, 1.0]`; 0.0 before any lookup.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Snapshot of one resident page for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PageState {
    pub page: u64,
    pub frame: Option<u32>,
    pub ready: bool,
    pub dirty: bool,
    pub used_size: usize,
    pub last_use: u64,
}

/// Snapshot of one tracked file.
#[derive(Debug, Clone, Serialize)]
pub struct FileState {
    pub path: String,
    pub handle: u32,
    pub valid: bool,
    pub dirty: bool,
    pub policy: CachePolicy,
    pub offset: u64,
    pub total_size: u64,
    pub last_error: Option<String>,
    pub pages: Vec<PageState>,
}

/// Snapshot of the whole cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheState {
    pub files: Vec<FileState>,
    pub queue: Vec<QueuedOp>,
}

/// Allocator for 24-bit handle prefixes, reusing released values.
#[derive(Debug)]
struct PrefixPool {
    next: u32,
    free: Vec<u32>,
}

impl PrefixPool {
    fn new() -> Self {
        Self {
            next: 1,
            free: Vec::new(),
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        if let Some(prefix) = self.free.pop() {
            return Some(prefix);
        }
        if self.next > MAX_HANDLE {
            return None;
        }
        let prefix = self.next;
        self.next += 1;
        Some(prefix)
    }

    fn release(&mut self, prefix: u32) {
        self.free.push(prefix);
    }
}

/// Structural state guarded by the engine mutex.
#[derive(Debug)]
struct EngineState {
    descriptors: HashMap<Handle, Arc<Descriptor>>,
    paths: HashMap<PathBuf, Handle>,
    page_index: HashMap<PageId, FrameId>,
    policies: PolicyTables,
    prefixes: PrefixPool,
    tick: u64,
    /// Cursor of the round-robin free-frame scan.
    last_alloc: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    zero_fills: u64,
}

/// State shared between consumer threads and the I/O worker.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: CacheConfig,
    pub(crate) frames: Vec<Frame>,
    pub(crate) queue: CtrlQueue,
    pub(crate) state: PlMutex<EngineState>,
    pub(crate) opener: Arc<dyn SourceOpener>,
    pub(crate) loads: AtomicU64,
    pub(crate) stores: AtomicU64,
}

/// Remove a page from the index, the policy tables and its descriptor's
/// resident set, and return its frame to the unbound state.
///
/// Waits (with the engine lock released) for any in-flight write-back of
/// the frame to finish first; the frame stays `used` for the duration so
/// no concurrent allocation can claim it.
pub(crate) fn untrack_locked(
    shared: &Shared,
    state: &mut MutexGuard<'_, EngineState>,
    desc: &Arc<Descriptor>,
    page: PageId,
) {
    state.policies.remove(page);
    desc.state.lock().pages.remove(&page);
    let Some(frame_id) = state.page_index.remove(&page) else {
        return;
    };
    let frame = &shared.frames[frame_id.index()];
    if frame.is_dirty() {
        MutexGuard::unlocked(state, || desc.clean.wait_until(|| !frame.is_dirty()));
    }
    frame.set_ready(false);
    frame.set_used(false);
    frame.reset();
    trace!(event = "page_untracked", page = %page, frame = %frame_id);
}

/// The paged file cache.
///
/// Construction spawns the I/O worker; dropping the cache signals it to
/// quit and joins it. Unflushed writes are discarded on drop; durability
/// is the business of [`flush`](Self::flush) and [`close`](Self::close).
#[derive(Debug)]
pub struct PageCache {
    shared: Arc<Shared>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl PageCache {
    /// Build a cache with the default configuration over the local
    /// filesystem.
    pub fn new() -> Result<Self> {
        Self::with_config(CacheConfig::default())
    }

    /// Build a cache with `config` over the local filesystem.
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        Self::with_opener(config, Arc::new(FsOpener))
    }

    /// Build a cache over an arbitrary backing store.
    pub fn with_opener(config: CacheConfig, opener: Arc<dyn SourceOpener>) -> Result<Self> {
        let config = config.validate()?;
        let frames = (0..config.num_frames).map(|_| Frame::new()).collect();
        let shared = Arc::new(Shared {
            config,
            frames,
            queue: CtrlQueue::new(),
            state: PlMutex::new(EngineState {
                descriptors: HashMap::new(),
                paths: HashMap::new(),
                page_index: HashMap::new(),
                policies: PolicyTables::new(
                    config.keep_threshold,
                    config.lru_threshold,
                    config.fifo_threshold,
                    SmallRng::from_os_rng(),
                ),
                prefixes: PrefixPool::new(),
                tick: 0,
                last_alloc: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                zero_fills: 0,
            }),
            opener,
            loads: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        });
        let worker = worker::spawn(Arc::clone(&shared))?;
        info!(
            event = "cache_started",
            num_frames = config.num_frames,
            page_size = PAGE_SIZE
        );
        Ok(Self {
            shared,
            worker: StdMutex::new(Some(worker)),
        })
    }

    /// Open `path` for cached access.
    ///
    /// A path that is still tracked from an earlier [`close`](Self::close)
    /// is reopened under the same handle with its offset and resident
    /// pages intact (pages are re-charged if the policy changed). Opening
    /// a path that is currently open fails: at most one consumer handle
    /// drives a file at a time.
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        mode: OpenMode,
        policy: CachePolicy,
    ) -> Result<Handle> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(FcError::InvalidParameter("empty path".to_owned()));
        }

        let mut state = self.shared.state.lock();
        if let Some(&handle) = state.paths.get(path) {
            let desc = Arc::clone(&state.descriptors[&handle]);
            if desc.is_valid() {
                return Err(FcError::AlreadyInUse(path.display().to_string()));
            }
            self.reopen_locked(&mut state, &desc, mode, policy)?;
            info!(
                event = "file_reopened",
                handle = %handle,
                path = %path.display(),
                policy = %policy
            );
            return Ok(handle);
        }

        let source = self.shared.opener.open(path, mode)?;
        let total_size = source.len()?;
        let Some(prefix) = state.prefixes.allocate() else {
            return Err(FcError::Unavailable("handle space exhausted".to_owned()));
        };
        let handle = Handle(prefix);
        let max_pages = self.shared.config.threshold_for(policy);
        let desc = Arc::new(Descriptor::new(
            handle,
            path.to_owned(),
            source,
            policy,
            total_size,
            max_pages,
        ));
        state.descriptors.insert(handle, Arc::clone(&desc));
        state.paths.insert(path.to_owned(), handle);
        self.stage_range(&mut state, &desc, 0, max_pages as u64 * PAGE_SIZE_U64);
        info!(
            event = "file_opened",
            handle = %handle,
            path = %path.display(),
            policy = %policy,
            total_size
        );
        Ok(handle)
    }

    fn reopen_locked(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        desc: &Arc<Descriptor>,
        mode: OpenMode,
        policy: CachePolicy,
    ) -> Result<()> {
        let source = self.shared.opener.open(desc.path(), mode)?;
        let backing_size = source.len()?;
        let (offset, max_pages) = {
            let mut desc_state = desc.state.lock();
            desc_state.total_size = desc_state.total_size.max(backing_size);
            desc_state.last_error = None;
            if desc_state.policy != policy {
                // Re-charge resident pages to the new policy.
                let tick = state.tick;
                for page in desc_state.pages.iter().copied().collect::<Vec<_>>() {
                    state.policies.remove(page);
                    state.policies.insert(policy, page, tick);
                }
                desc_state.policy = policy;
                desc_state.max_pages = self.shared.config.threshold_for(policy);
            }
            *desc.source.lock() = Some(source);
            (desc_state.offset, desc_state.max_pages)
        };
        desc.set_valid(true);
        self.stage_range(state, desc, offset, max_pages as u64 * PAGE_SIZE_U64);
        Ok(())
    }

    /// Flush and close the backing handle, keeping the file tracked.
    ///
    /// Blocks until the worker has written back every dirty page and
    /// released the handle. Resident pages stay cached and can serve hits
    /// after a later reopen.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let desc = self.descriptor(handle)?;
        if !desc.is_valid() {
            debug!(event = "close_on_closed_file", handle = %handle);
            return Ok(());
        }

        // The flush-close subsumes every queued op for this file; loads
        // that will never run must also stop being tracked.
        let dropped = self
            .shared
            .queue
            .drain_matching(|op| op.descriptor().is_some_and(|d| Arc::ptr_eq(d, &desc)));
        if !dropped.is_empty() {
            let mut state = self.shared.state.lock();
            for op in &dropped {
                if let CtrlOp::Load { offset, .. } = op {
                    untrack_locked(&self.shared, &mut state, &desc, desc.page_id_at(*offset));
                }
            }
            debug!(
                event = "close_cancelled_ops",
                handle = %handle,
                dropped = dropped.len()
            );
        }

        self.shared
            .queue
            .priority_push(CtrlOp::FlushClose {
                desc: Arc::clone(&desc),
            });
        desc.ready.wait_until(|| !desc.is_valid());
        info!(event = "file_closed", handle = %handle, path = %desc.path().display());
        Ok(())
    }

    /// Close the file and erase every trace of it from the cache.
    pub fn permanent_close(&self, handle: Handle) -> Result<()> {
        self.close(handle)?;

        let mut state = self.shared.state.lock();
        let Some(desc) = state.descriptors.get(&handle).cloned() else {
            return Err(FcError::NoSuchHandle(handle.0));
        };
        let pages: Vec<PageId> = desc.state.lock().pages.iter().copied().collect();
        for page in pages {
            let frame = state.page_index.get(&page).copied();
            untrack_locked(&self.shared, &mut state, &desc, page);
            if let Some(frame) = frame {
                self.shared.frames[frame.index()].wipe();
            }
        }
        state.descriptors.remove(&handle);
        state.paths.remove(desc.path());
        state.prefixes.release(handle.0);
        info!(event = "file_untracked", handle = %handle, path = %desc.path().display());
        Ok(())
    }

    /// Queue a write-back of every dirty page of the file.
    ///
    /// Jumps the queue ahead of pending loads; queued stores for the file
    /// are dropped since the flush subsumes them. Returns without waiting
    /// for completion.
    pub fn flush(&self, handle: Handle) -> Result<()> {
        let desc = self.descriptor(handle)?;
        if !desc.is_valid() {
            return Err(FcError::Unavailable(format!(
                "{} is closed",
                desc.path().display()
            )));
        }
        let dropped = self.shared.queue.drain_matching(
            |op| matches!(op, CtrlOp::Store { desc: d, .. } if Arc::ptr_eq(d, &desc)),
        );
        self.shared.queue.priority_push(CtrlOp::Flush {
            desc: Arc::clone(&desc),
        });
        debug!(
            event = "flush_enqueued",
            handle = %handle,
            absorbed_stores = dropped.len()
        );
        Ok(())
    }

    /// Ensure the pages covering `[offset, offset + length)` are staged,
    /// enqueuing loads for the ones that were not resident.
    ///
    /// `None` prefetches the default window. Idempotent; does not wait for
    /// the loads to complete, since readers block per frame as they touch
    /// it.
    pub fn check_cache(&self, handle: Handle, length: Option<u64>) -> Result<()> {
        let desc = self.descriptor(handle)?;
        if !desc.is_valid() {
            return Err(FcError::Unavailable(format!(
                "{} is closed",
                desc.path().display()
            )));
        }
        let length = length.unwrap_or(DEFAULT_PREFETCH_PAGES * PAGE_SIZE_U64);
        if length == 0 {
            return Ok(());
        }
        let offset = desc.state.lock().offset;
        if offset.saturating_add(length) > PAGE_OFFSET_MASK {
            return Err(FcError::InvalidParameter(
                "range exceeds addressable file size".to_owned(),
            ));
        }
        let mut state = self.shared.state.lock();
        self.stage_range(&mut state, &desc, offset, length);
        Ok(())
    }

    /// Copy up to `buf.len()` bytes at the current offset into `buf`.
    ///
    /// The transfer is clamped at end of file and the remainder of `buf`
    /// is zero-filled; the returned count is the bytes actually read.
    /// Every page the transfer touches must have been staged by
    /// [`check_cache`](Self::check_cache) first.
    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize> {
        let desc = self.descriptor(handle)?;
        if !desc.is_valid() {
            return Err(FcError::CantRead(format!(
                "{} is closed",
                desc.path().display()
            )));
        }
        let (start, total_size) = {
            let desc_state = desc.state.lock();
            (desc_state.offset, desc_state.total_size)
        };
        let read_len = usize::try_from((buf.len() as u64).min(total_size.saturating_sub(start)))
            .map_err(|_| FcError::InvalidParameter("read length overflow".to_owned()))?;

        let mut copied = 0;
        while copied < read_len {
            let pos = start + copied as u64;
            let within = page_remainder(pos);
            let n = (PAGE_SIZE - within).min(read_len - copied);
            let frame = self.resident_frame(&desc, pos);
            let frame = &self.shared.frames[frame.index()];
            {
                let guard = FrameRead::acquire(frame, &desc.ready);
                buf[copied..copied + n].copy_from_slice(&guard.bytes()[within..within + n]);
            }
            copied += n;
        }

        // Reads crossing EOF observe zeros past the end.
        if buf.len() > read_len {
            buf[read_len..].fill(0);
        }

        desc.state.lock().offset = start + copied as u64;
        trace!(
            event = "cache_read",
            handle = %handle,
            offset = start,
            requested = buf.len(),
            copied
        );
        Ok(copied)
    }

    /// Copy `buf` into the cache at the current offset, dirtying the
    /// touched frames. May extend the file; whether the extension sticks
    /// is decided by the backing store at write-back time.
    pub fn write(&self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let desc = self.descriptor(handle)?;
        if !desc.is_valid() {
            return Err(FcError::CantWrite(format!(
                "{} is closed",
                desc.path().display()
            )));
        }
        let start = desc.state.lock().offset;
        if start.saturating_add(buf.len() as u64) > PAGE_OFFSET_MASK {
            return Err(FcError::InvalidParameter(
                "write exceeds addressable file size".to_owned(),
            ));
        }

        let mut copied = 0;
        while copied < buf.len() {
            let pos = start + copied as u64;
            let within = page_remainder(pos);
            let n = (PAGE_SIZE - within).min(buf.len() - copied);
            let frame = self.resident_frame(&desc, pos);
            let frame = &self.shared.frames[frame.index()];
            {
                let mut guard = FrameWrite::acquire(frame, &desc.ready);
                guard.bytes_mut()[within..within + n].copy_from_slice(&buf[copied..copied + n]);
            }
            frame.grow_used_size(within + n);
            frame.set_dirty(true);
            copied += n;
        }

        if copied > 0 {
            desc.set_dirty(true);
        }
        {
            let mut desc_state = desc.state.lock();
            desc_state.offset = start + copied as u64;
            desc_state.total_size = desc_state.total_size.max(start + copied as u64);
        }
        trace!(
            event = "cache_write",
            handle = %handle,
            offset = start,
            copied
        );
        Ok(copied)
    }

    /// Move the file offset.
    ///
    /// Queued prefetch loads whose pages lie far from the new position
    /// (beyond the FIFO threshold, measured around a shifted centre so
    /// both directions count alike) are cancelled and their pages
    /// untracked; near ones are kept as read-ahead.
    pub fn seek(&self, handle: Handle, offset: i64, whence: Whence) -> Result<u64> {
        let desc = self.descriptor(handle)?;
        let (current, end) = {
            let desc_state = desc.state.lock();
            (desc_state.offset, desc_state.total_size)
        };
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => i64::try_from(current)
                .map_err(|_| FcError::InvalidParameter("offset overflow".to_owned()))?,
            Whence::End => i64::try_from(end)
                .map_err(|_| FcError::InvalidParameter("offset overflow".to_owned()))?,
        };
        let effective = base
            .checked_add(offset)
            .ok_or_else(|| FcError::InvalidParameter("offset overflow".to_owned()))?;
        if effective < 0 {
            return Err(FcError::InvalidParameter(format!(
                "seek before start of file: {effective}"
            )));
        }
        let effective = effective as u64;
        if effective > PAGE_OFFSET_MASK {
            return Err(FcError::InvalidParameter(
                "seek exceeds addressable file size".to_owned(),
            ));
        }

        self.cancel_far_prefetch(&desc, effective);
        desc.state.lock().offset = effective;
        trace!(event = "cache_seek", handle = %handle, offset = effective);
        Ok(effective)
    }

    /// Drop queued loads for `desc` whose pages are farther than the FIFO
    /// threshold from the region around `new_offset`. Paying their latency
    /// buys nothing once the consumer has moved elsewhere.
    fn cancel_far_prefetch(&self, desc: &Arc<Descriptor>, new_offset: u64) {
        let window = self.shared.config.fifo_threshold as u64 * PAGE_SIZE_U64;
        let centre = new_offset.saturating_add(window / 2);
        let dropped = self.shared.queue.drain_matching(|op| {
            matches!(
                op,
                CtrlOp::Load { desc: d, offset, .. }
                    if Arc::ptr_eq(d, desc) && centre.abs_diff(*offset) > window
            )
        });
        if dropped.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock();
        for op in &dropped {
            if let CtrlOp::Load { offset, .. } = op {
                untrack_locked(&self.shared, &mut state, desc, desc.page_id_at(*offset));
            }
        }
        debug!(
            event = "prefetch_cancelled",
            handle = %desc.handle(),
            new_offset,
            cancelled = dropped.len()
        );
    }

    /// Current size of the file: the larger of the cached size (which
    /// unflushed writes may have extended) and the backing store's.
    pub fn get_len(&self, handle: Handle) -> Result<u64> {
        let desc = self.descriptor(handle)?;
        let mut desc_state = desc.state.lock();
        if let Some(source) = desc.source.lock().as_ref() {
            let backing = source.len()?;
            if backing > desc_state.total_size {
                desc_state.total_size = backing;
            }
        }
        Ok(desc_state.total_size)
    }

    /// EOF flag of the backing handle, raised by the last short read.
    pub fn eof_reached(&self, handle: Handle) -> Result<bool> {
        let desc = self.descriptor(handle)?;
        let source = desc.source.lock();
        match source.as_ref() {
            Some(source) => Ok(source.eof_reached()),
            None => Err(FcError::Unavailable(format!(
                "{} is closed",
                desc.path().display()
            ))),
        }
    }

    /// Current byte offset of the consumer.
    pub fn position(&self, handle: Handle) -> Result<u64> {
        Ok(self.descriptor(handle)?.state.lock().offset)
    }

    /// Path the handle was opened with.
    pub fn path_of(&self, handle: Handle) -> Result<PathBuf> {
        Ok(self.descriptor(handle)?.path().to_owned())
    }

    /// Whether the handle currently has an open backing handle.
    #[must_use]
    pub fn is_open(&self, handle: Handle) -> bool {
        self.shared
            .state
            .lock()
            .descriptors
            .get(&handle)
            .is_some_and(|desc| desc.is_valid())
    }

    /// Whether `path` names an existing file on the backing store.
    #[must_use]
    pub fn file_exists(&self, path: impl AsRef<Path>) -> bool {
        self.shared.opener.exists(path.as_ref())
    }

    /// Point-in-time counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let state = self.shared.state.lock();
        let dirty_frames = self
            .shared
            .frames
            .iter()
            .filter(|frame| frame.is_dirty())
            .count();
        CacheMetrics {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            zero_fills: state.zero_fills,
            loads: self.shared.loads.load(Ordering::Relaxed),
            stores: self.shared.stores.load(Ordering::Relaxed),
            resident_pages: state.page_index.len(),
            dirty_frames,
            open_files: state
                .descriptors
                .values()
                .filter(|desc| desc.is_valid())
                .count(),
            queue_len: self.shared.queue.len(),
            tick: state.tick,
            num_frames: self.shared.frames.len(),
        }
    }

    /// Full diagnostic snapshot: every tracked file with its resident
    /// pages and frame flags, plus the queued operations.
    #[must_use]
    pub fn state_dump(&self) -> CacheState {
        let state = self.shared.state.lock();
        let mut files = Vec::with_capacity(state.descriptors.len());
        for desc in state.descriptors.values() {
            let desc_state = desc.state.lock();
            let pages = desc_state
                .pages
                .iter()
                .map(|page| {
                    let frame_id = state.page_index.get(page).copied();
                    let (ready, dirty, used_size, last_use) = match frame_id {
                        Some(frame_id) => {
                            let frame = &self.shared.frames[frame_id.index()];
                            (
                                frame.is_ready(),
                                frame.is_dirty(),
                                frame.used_size(),
                                frame.last_use(),
                            )
                        }
                        None => (false, false, 0, 0),
                    };
                    PageState {
                        page: page.0,
                        frame: frame_id.map(|frame_id| frame_id.0),
                        ready,
                        dirty,
                        used_size,
                        last_use,
                    }
                })
                .collect();
            files.push(FileState {
                path: desc.path().display().to_string(),
                handle: desc.handle().0,
                valid: desc.is_valid(),
                dirty: desc.is_dirty(),
                policy: desc_state.policy,
                offset: desc_state.offset,
                total_size: desc_state.total_size,
                last_error: desc_state.last_error.clone(),
                pages,
            });
        }
        files.sort_by_key(|file| file.handle);
        CacheState {
            files,
            queue: self.shared.queue.snapshot(),
        }
    }

    fn descriptor(&self, handle: Handle) -> Result<Arc<Descriptor>> {
        self.shared
            .state
            .lock()
            .descriptors
            .get(&handle)
            .cloned()
            .ok_or(FcError::NoSuchHandle(handle.0))
    }

    /// Look up the frame backing the page at `pos`.
    ///
    /// The page must have been staged by `check_cache`; reaching an
    /// unstaged page on the copy path is an engine-contract violation.
    fn resident_frame(&self, desc: &Arc<Descriptor>, pos: u64) -> FrameId {
        let page = desc.page_id_at(pos);
        let state = self.shared.state.lock();
        match state.page_index.get(&page) {
            Some(&frame) => frame,
            None => {
                error!(
                    event = "page_not_resident",
                    page = %page,
                    handle = %desc.handle()
                );
                panic!("page {page} is not resident; check_cache must cover the transfer");
            }
        }
    }

    /// Stage every page covering `[offset, offset + length)`.
    fn stage_range(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        desc: &Arc<Descriptor>,
        offset: u64,
        length: u64,
    ) {
        debug_assert!(length > 0);
        let first = page_align_down(offset);
        let last = page_align_down(offset + length - 1);
        let mut page_offset = first;
        loop {
            if let Some(frame) = self.get_or_alloc(state, desc, page_offset) {
                self.enqueue_load(state, desc, frame, page_offset);
            }
            if page_offset == last {
                break;
            }
            page_offset += PAGE_SIZE_U64;
        }
    }

    /// Hit-or-allocate for one page. Returns the frame to load on a miss,
    /// `None` on a hit. Advances the global tick.
    fn get_or_alloc(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        desc: &Arc<Descriptor>,
        offset: u64,
    ) -> Option<FrameId> {
        let page = desc.page_id_at(offset);
        let tick = state.tick;
        let policy = desc.state.lock().policy;

        let staged = if let Some(&frame_id) = state.page_index.get(&page) {
            state.policies.touch(policy, page, tick);
            self.shared.frames[frame_id.index()].set_last_use(tick);
            state.hits += 1;
            None
        } else {
            state.misses += 1;
            let frame_id = self.claim_frame(state, policy, page, tick);
            state.page_index.insert(page, frame_id);
            state.policies.insert(policy, page, tick);
            desc.state.lock().pages.insert(page);
            trace!(event = "page_staged", page = %page, frame = %frame_id);
            Some(frame_id)
        };
        state.tick += 1;
        staged
    }

    /// Find a frame for `page`: an unused one if the pool has any, else
    /// the frame of a policy-chosen victim (scheduling its write-back
    /// first when dirty).
    fn claim_frame(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        policy: CachePolicy,
        page: PageId,
        tick: u64,
    ) -> FrameId {
        let frames = &self.shared.frames;
        let pool_size = frames.len();

        let mut index = None;
        for step in 1..=pool_size {
            let candidate = (state.last_alloc + step) % pool_size;
            if !frames[candidate].is_used() {
                index = Some(candidate);
                state.last_alloc = candidate;
                break;
            }
        }

        let index = match index {
            Some(index) => index,
            None => {
                let victim = state.policies.evict(policy, tick);
                let Some(victim_frame) = state.page_index.get(&victim).copied() else {
                    error!(event = "evicted_page_not_resident", page = %victim);
                    panic!("policy tables yielded a non-resident victim page");
                };
                let Some(victim_desc) = state.descriptors.get(&victim.handle()).cloned() else {
                    error!(event = "victim_without_descriptor", page = %victim);
                    panic!("victim page has no owning descriptor");
                };
                if frames[victim_frame.index()].is_dirty() {
                    self.shared.queue.push(CtrlOp::Store {
                        desc: Arc::clone(&victim_desc),
                        frame: victim_frame,
                        offset: victim.offset(),
                    });
                }
                untrack_locked(&self.shared, state, &victim_desc, victim);
                state.evictions += 1;
                debug!(event = "page_evicted", page = %victim, frame = %victim_frame);
                victim_frame.index()
            }
        };

        let frame = &frames[index];
        // An unused frame is clean by protocol; wait anyway in case a
        // recycled frame's write-back is still draining, with the engine
        // lock released. The frame cannot be claimed elsewhere: it is
        // either still marked used (eviction path) or invisible to the
        // scan once `last_alloc` moved past it within this lock scope.
        if frame.is_dirty() {
            let old_page = frame.owning_page();
            if let Some(old_desc) = state.descriptors.get(&old_page.handle()).cloned() {
                MutexGuard::unlocked(state, || old_desc.clean.wait_until(|| !frame.is_dirty()));
            }
        }
        frame.set_ready(false);
        frame.set_used(true);
        frame.set_last_use(tick);
        frame.set_used_size(0);
        frame.set_owning_page(page);
        FrameId(index as u32)
    }

    /// Hand a staged page to the worker, or materialize it inline.
    ///
    /// A page starting at or past end of file has no backing bytes: the
    /// frame is zero-filled and marked ready on the spot, which is how
    /// reads past EOF observe zeros and how fresh tail pages are written
    /// without first loading garbage.
    fn enqueue_load(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        desc: &Arc<Descriptor>,
        frame_id: FrameId,
        offset: u64,
    ) {
        let total_size = desc.state.lock().total_size;
        if offset >= total_size {
            let frame = &self.shared.frames[frame_id.index()];
            {
                let mut guard = FrameWrite::acquire_io(frame, &desc.clean);
                guard.bytes_mut().fill(0);
            }
            frame.set_used_size(0);
            frame.set_ready(true);
            desc.ready.post();
            state.zero_fills += 1;
            trace!(event = "zero_fill", page = %desc.page_id_at(offset));
        } else {
            self.shared.queue.push(CtrlOp::Load {
                desc: Arc::clone(desc),
                frame: frame_id,
                offset,
            });
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        self.shared.queue.signal_quit();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            let _ = worker.join();
        }
        let dirty_frames = self
            .shared
            .frames
            .iter()
            .filter(|frame| frame.is_dirty())
            .count();
        if dirty_frames > 0 {
            warn!(event = "cache_dropped_dirty", dirty_frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcache_types::OpenMode;

    #[test]
    fn prefix_pool_reuses_released_values() {
        let mut pool = PrefixPool::new();
        let first = pool.allocate().expect("allocate");
        let second = pool.allocate().expect("allocate");
        assert_ne!(first, second);
        pool.release(first);
        assert_eq!(pool.allocate(), Some(first));
    }

    #[test]
    fn config_rejects_zero_frames() {
        let config = CacheConfig {
            num_frames: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FcError::InvalidParameter(_))
        ));
    }

    #[test]
    fn open_twice_fails_until_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("twice");
        std::fs::write(&path, b"contents").expect("fixture");
        let cache = PageCache::new().expect("cache");

        let handle = cache
            .open(&path, OpenMode::Read, CachePolicy::Lru)
            .expect("first open");
        assert!(matches!(
            cache.open(&path, OpenMode::Read, CachePolicy::Lru),
            Err(FcError::AlreadyInUse(_))
        ));

        cache.close(handle).expect("close");
        let reopened = cache
            .open(&path, OpenMode::Read, CachePolicy::Lru)
            .expect("reopen");
        assert_eq!(reopened, handle);
    }

    #[test]
    fn permanent_close_releases_the_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gone");
        std::fs::write(&path, b"x").expect("fixture");
        let cache = PageCache::new().expect("cache");

        let handle = cache
            .open(&path, OpenMode::Read, CachePolicy::Keep)
            .expect("open");
        cache.permanent_close(handle).expect("permanent close");
        assert!(matches!(
            cache.position(handle),
            Err(FcError::NoSuchHandle(_))
        ));
        // The prefix is recycled for the next open.
        let again = cache
            .open(&path, OpenMode::Read, CachePolicy::Keep)
            .expect("open again");
        assert_eq!(again, handle);
        cache.permanent_close(again).expect("cleanup");
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let cache = PageCache::new().expect("cache");
        let mut buf = [0_u8; 4];
        assert!(matches!(
            cache.read(Handle(42), &mut buf),
            Err(FcError::NoSuchHandle(42))
        ));
    }

    #[test]
    fn seek_modes_and_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seek");
        std::fs::write(&path, vec![0_u8; 100]).expect("fixture");
        let cache = PageCache::new().expect("cache");
        let handle = cache
            .open(&path, OpenMode::Read, CachePolicy::Fifo)
            .expect("open");

        assert_eq!(cache.seek(handle, 40, Whence::Set).expect("set"), 40);
        assert_eq!(cache.seek(handle, 10, Whence::Cur).expect("cur"), 50);
        assert_eq!(cache.seek(handle, -20, Whence::End).expect("end"), 80);
        assert!(matches!(
            cache.seek(handle, -1, Whence::Set),
            Err(FcError::InvalidParameter(_))
        ));
        cache.permanent_close(handle).expect("cleanup");
    }
}
