//! Per-open-file descriptors.
//!
//! A descriptor ties a backing source to the file's resident pages and
//! replacement policy. Lock order, where multiple locks are taken: engine
//! state mutex, then `state`, then `source`. Frame data locks are never
//! nested with the engine state mutex on the same path.

use crate::sync::Signal;
use fcache_error::FcError;
use fcache_store::ByteSource;
use fcache_types::{CachePolicy, Handle, PageId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Mutable bookkeeping of one open file.
#[derive(Debug)]
pub(crate) struct DescState {
    /// Current byte offset of the consumer.
    pub offset: u64,
    /// File size as the cache believes it, including unflushed extension.
    pub total_size: u64,
    pub policy: CachePolicy,
    /// Pages to keep resident on (re)open.
    pub max_pages: usize,
    /// Resident pages, sorted by page id.
    pub pages: BTreeSet<PageId>,
    /// Message of the most recent backing-store failure, if any.
    pub last_error: Option<String>,
}

/// Per-open-file record.
#[derive(Debug)]
pub struct Descriptor {
    handle: Handle,
    path: PathBuf,
    pub(crate) source: Mutex<Option<Box<dyn ByteSource>>>,
    pub(crate) state: Mutex<DescState>,
    valid: AtomicBool,
    dirty: AtomicBool,
    /// Posted whenever one of this file's frames becomes ready, and on
    /// close completion.
    pub(crate) ready: Signal,
    /// Posted whenever one of this file's frames becomes clean.
    pub(crate) clean: Signal,
}

impl Descriptor {
    pub(crate) fn new(
        handle: Handle,
        path: PathBuf,
        source: Box<dyn ByteSource>,
        policy: CachePolicy,
        total_size: u64,
        max_pages: usize,
    ) -> Self {
        Self {
            handle,
            path,
            source: Mutex::new(Some(source)),
            state: Mutex::new(DescState {
                offset: 0,
                total_size,
                policy,
                max_pages,
                pages: BTreeSet::new(),
                last_error: None,
            }),
            valid: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
            ready: Signal::new(),
            clean: Signal::new(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page id of the page covering `offset` in this file.
    #[must_use]
    pub fn page_id_at(&self, offset: u64) -> PageId {
        PageId::new(self.handle, offset)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub(crate) fn record_error(&self, err: &FcError) {
        self.state.lock().last_error = Some(err.to_string());
    }
}
