//! The single background I/O worker.
//!
//! Drains the control queue and issues backing-store reads and writes.
//! Backing-store failures are recorded on the descriptor and logged; a
//! failed load still marks its frame ready (with whatever bytes arrived)
//! so waiters never hang, and a failed store leaves the frame dirty for
//! the next flush to retry.

use crate::descriptor::Descriptor;
use crate::frame::{FrameRead, FrameWrite};
use crate::queue::CtrlOp;
use crate::{Shared, untrack_locked};
use fcache_error::FcError;
use fcache_types::{FrameId, PageId};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("fcache-io".to_owned())
        .spawn(move || run(&shared))
}

fn run(shared: &Shared) {
    debug!(event = "worker_started");
    loop {
        match shared.queue.pop() {
            CtrlOp::Quit => break,
            CtrlOp::Load {
                desc,
                frame,
                offset,
            } => {
                if desc.is_valid() {
                    do_load(shared, &desc, frame, offset);
                } else {
                    scrub_invalid(shared, &desc, offset);
                }
            }
            CtrlOp::Store {
                desc,
                frame,
                offset,
            } => {
                if desc.is_valid() {
                    do_store(shared, &desc, frame, offset);
                } else {
                    scrub_invalid(shared, &desc, offset);
                }
            }
            CtrlOp::Flush { desc } => {
                if desc.is_valid() {
                    do_flush(shared, &desc);
                } else {
                    warn!(event = "flush_on_invalid_descriptor", handle = %desc.handle());
                }
            }
            CtrlOp::FlushClose { desc } => do_flush_close(shared, &desc),
        }
    }
    debug!(event = "worker_exited");
}

/// Read one page from the backing store into its frame.
fn do_load(shared: &Shared, desc: &Arc<Descriptor>, frame: FrameId, offset: u64) {
    let frame = &shared.frames[frame.index()];
    let loaded = {
        let mut write = FrameWrite::acquire_io(frame, &desc.clean);
        let mut source = desc.source.lock();
        let loaded = match source.as_mut() {
            Some(source) => source
                .seek(offset)
                .and_then(|()| source.read(write.bytes_mut())),
            None => Err(FcError::Unavailable("backing handle is closed".to_owned())),
        };
        if let Ok(read) = loaded {
            // A recycled frame may still hold another page's bytes past
            // the loaded prefix.
            write.bytes_mut()[read..].fill(0);
        }
        loaded
    };
    match loaded {
        Ok(read) => {
            frame.set_used_size(read);
            trace!(
                event = "page_loaded",
                handle = %desc.handle(),
                offset,
                bytes = read
            );
        }
        Err(err) => {
            error!(
                event = "load_failed",
                handle = %desc.handle(),
                path = %desc.path().display(),
                offset,
                error = %err
            );
            desc.record_error(&err);
            frame.set_used_size(0);
        }
    }
    frame.set_ready(true);
    desc.ready.post();
    shared.loads.fetch_add(1, Ordering::Relaxed);
}

/// Write one frame's valid bytes back at its page offset.
fn do_store(shared: &Shared, desc: &Arc<Descriptor>, frame: FrameId, offset: u64) {
    let frame = &shared.frames[frame.index()];
    let stored = {
        let read = FrameRead::acquire(frame, &desc.ready);
        let used = frame.used_size();
        let mut source = desc.source.lock();
        match source.as_mut() {
            Some(source) => source
                .seek(offset)
                .and_then(|()| source.write_all(&read.bytes()[..used])),
            None => Err(FcError::Unavailable("backing handle is closed".to_owned())),
        }
    };
    match stored {
        Ok(()) => {
            frame.set_dirty(false);
            desc.clean.post();
            shared.stores.fetch_add(1, Ordering::Relaxed);
            trace!(
                event = "page_stored",
                handle = %desc.handle(),
                offset,
                bytes = frame.used_size()
            );
        }
        Err(err) => {
            // The frame stays dirty; the next flush retries the write.
            error!(
                event = "store_failed",
                handle = %desc.handle(),
                path = %desc.path().display(),
                offset,
                error = %err
            );
            desc.record_error(&err);
        }
    }
}

/// Store every dirty resident page of the file.
fn do_flush(shared: &Shared, desc: &Arc<Descriptor>) {
    let targets: Vec<(PageId, FrameId)> = {
        let state = shared.state.lock();
        let desc_state = desc.state.lock();
        desc_state
            .pages
            .iter()
            .filter_map(|page| state.page_index.get(page).map(|frame| (*page, *frame)))
            .collect()
    };

    let mut stored = 0_usize;
    for (page, frame) in &targets {
        if shared.frames[frame.index()].is_dirty() {
            do_store(shared, desc, *frame, page.offset());
            stored += 1;
        }
    }

    let still_dirty = targets
        .iter()
        .any(|(_, frame)| shared.frames[frame.index()].is_dirty());
    if !still_dirty {
        desc.set_dirty(false);
    }
    debug!(
        event = "flush_complete",
        handle = %desc.handle(),
        stored,
        still_dirty
    );
}

/// Flush, then close and release the backing handle.
fn do_flush_close(shared: &Shared, desc: &Arc<Descriptor>) {
    if desc.is_valid() {
        do_flush(shared, desc);
    }

    if let Some(mut source) = desc.source.lock().take()
        && let Err(err) = source.close()
    {
        error!(
            event = "source_close_failed",
            handle = %desc.handle(),
            path = %desc.path().display(),
            error = %err
        );
        desc.record_error(&err);
    }

    // Any frame a failed store left dirty can never be written back now;
    // release waiters rather than letting them hang.
    let leftovers: Vec<FrameId> = {
        let state = shared.state.lock();
        let desc_state = desc.state.lock();
        desc_state
            .pages
            .iter()
            .filter_map(|page| state.page_index.get(page).copied())
            .filter(|frame| shared.frames[frame.index()].is_dirty())
            .collect()
    };
    for frame in leftovers {
        warn!(
            event = "dirty_page_dropped_on_close",
            handle = %desc.handle(),
            frame = %frame
        );
        shared.frames[frame.index()].set_dirty(false);
        desc.clean.post();
    }

    desc.set_dirty(false);
    desc.set_valid(false);
    // Unblocks close() callers waiting on the readiness signal.
    desc.ready.post();
    debug!(event = "flush_close_complete", handle = %desc.handle());
}

/// An op reached the worker after its descriptor was invalidated: the page
/// it concerns will never become ready, so stop tracking it.
fn scrub_invalid(shared: &Shared, desc: &Arc<Descriptor>, offset: u64) {
    let page = desc.page_id_at(offset);
    warn!(
        event = "op_on_invalid_descriptor",
        handle = %desc.handle(),
        page = %page
    );
    let mut state = shared.state.lock();
    if let Some(&frame) = state.page_index.get(&page) {
        let frame = &shared.frames[frame.index()];
        if frame.is_dirty() {
            // The write-back can never run; drop the data.
            frame.set_dirty(false);
            desc.clean.post();
        }
    }
    untrack_locked(shared, &mut state, desc, page);
}
