//! Control queue feeding the I/O worker.

use crate::descriptor::Descriptor;
use fcache_types::FrameId;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::sync::Arc;
use tracing::trace;

/// One unit of work for the I/O worker.
#[derive(Debug)]
pub(crate) enum CtrlOp {
    /// Populate `frame` from the backing store at the page `offset`.
    Load {
        desc: Arc<Descriptor>,
        frame: FrameId,
        offset: u64,
    },
    /// Write `frame`'s valid bytes back at the page `offset`.
    Store {
        desc: Arc<Descriptor>,
        frame: FrameId,
        offset: u64,
    },
    /// Write back every dirty resident page of the file.
    Flush { desc: Arc<Descriptor> },
    /// Flush, then close and release the backing handle.
    FlushClose { desc: Arc<Descriptor> },
    /// Terminate the worker.
    Quit,
}

impl CtrlOp {
    pub(crate) fn descriptor(&self) -> Option<&Arc<Descriptor>> {
        match self {
            Self::Load { desc, .. }
            | Self::Store { desc, .. }
            | Self::Flush { desc }
            | Self::FlushClose { desc } => Some(desc),
            Self::Quit => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Store { .. } => "store",
            Self::Flush { .. } => "flush",
            Self::FlushClose { .. } => "flush_close",
            Self::Quit => "quit",
        }
    }
}

/// Snapshot of one queued operation, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedOp {
    pub kind: &'static str,
    pub handle: u32,
    pub offset: Option<u64>,
}

/// FIFO of control operations with a priority head.
///
/// `pop` blocks until an op is available or quit has been signalled.
#[derive(Debug, Default)]
pub(crate) struct CtrlQueue {
    inner: Mutex<VecDeque<CtrlOp>>,
    ready: Condvar,
    sig_quit: AtomicBool,
}

impl CtrlQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append to the back of the queue.
    pub(crate) fn push(&self, op: CtrlOp) {
        trace!(event = "ctrl_push", kind = op.kind());
        let mut queue = self.lock();
        queue.push_back(op);
        drop(queue);
        self.ready.notify_one();
    }

    /// Insert at the head so the op is processed next.
    pub(crate) fn priority_push(&self, op: CtrlOp) {
        trace!(event = "ctrl_priority_push", kind = op.kind());
        let mut queue = self.lock();
        queue.push_front(op);
        drop(queue);
        self.ready.notify_one();
    }

    /// Remove and return the op at the head, blocking while empty.
    ///
    /// Returns [`CtrlOp::Quit`] once quit has been signalled, regardless of
    /// remaining queue contents.
    pub(crate) fn pop(&self) -> CtrlOp {
        let mut queue = self.lock();
        loop {
            if self.sig_quit.load(Ordering::Acquire) {
                return CtrlOp::Quit;
            }
            if let Some(op) = queue.pop_front() {
                return op;
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Ask the worker to exit and wake it if it is parked in `pop`.
    pub(crate) fn signal_quit(&self) {
        self.sig_quit.store(true, Ordering::Release);
        self.ready.notify_all();
    }

    /// Remove every queued op matching `drop_op` and return them in order.
    pub(crate) fn drain_matching(&self, mut drop_op: impl FnMut(&CtrlOp) -> bool) -> Vec<CtrlOp> {
        let mut queue = self.lock();
        let mut kept = VecDeque::with_capacity(queue.len());
        let mut dropped = Vec::new();
        for op in queue.drain(..) {
            if drop_op(&op) {
                dropped.push(op);
            } else {
                kept.push_back(op);
            }
        }
        *queue = kept;
        dropped
    }

    /// Diagnostic snapshot of the queued ops.
    pub(crate) fn snapshot(&self) -> Vec<QueuedOp> {
        self.lock()
            .iter()
            .map(|op| QueuedOp {
                kind: op.kind(),
                handle: op.descriptor().map_or(0, |desc| desc.handle().0),
                offset: match op {
                    CtrlOp::Load { offset, .. } | CtrlOp::Store { offset, .. } => Some(*offset),
                    _ => None,
                },
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<CtrlOp>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcache_store::FileSource;
    use fcache_types::{CachePolicy, Handle, OpenMode};

    fn test_desc(handle: u32) -> Arc<Descriptor> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue-test");
        std::fs::write(&path, b"x").expect("fixture");
        let source = FileSource::open(&path, OpenMode::Read).expect("open");
        Arc::new(Descriptor::new(
            Handle(handle),
            path,
            Box::new(source),
            CachePolicy::Fifo,
            1,
            8,
        ))
    }

    fn load(desc: &Arc<Descriptor>, offset: u64) -> CtrlOp {
        CtrlOp::Load {
            desc: Arc::clone(desc),
            frame: FrameId(0),
            offset,
        }
    }

    #[test]
    fn pop_preserves_fifo_order() {
        let queue = CtrlQueue::new();
        let desc = test_desc(1);
        queue.push(load(&desc, 0));
        queue.push(load(&desc, 4096));
        assert!(matches!(queue.pop(), CtrlOp::Load { offset: 0, .. }));
        assert!(matches!(queue.pop(), CtrlOp::Load { offset: 4096, .. }));
    }

    #[test]
    fn priority_push_jumps_the_queue() {
        let queue = CtrlQueue::new();
        let desc = test_desc(1);
        queue.push(load(&desc, 0));
        queue.priority_push(CtrlOp::Flush {
            desc: Arc::clone(&desc),
        });
        assert!(matches!(queue.pop(), CtrlOp::Flush { .. }));
        assert!(matches!(queue.pop(), CtrlOp::Load { .. }));
    }

    #[test]
    fn quit_wins_over_queued_work() {
        let queue = CtrlQueue::new();
        let desc = test_desc(1);
        queue.push(load(&desc, 0));
        queue.signal_quit();
        assert!(matches!(queue.pop(), CtrlOp::Quit));
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(CtrlQueue::new());
        let desc = test_desc(1);
        let popper = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        queue.push(load(&desc, 8192));
        let op = popper.join().expect("popper join");
        assert!(matches!(op, CtrlOp::Load { offset: 8192, .. }));
    }

    #[test]
    fn drain_matching_removes_only_matches() {
        let queue = CtrlQueue::new();
        let first = test_desc(1);
        let second = test_desc(2);
        queue.push(load(&first, 0));
        queue.push(load(&second, 0));
        queue.push(load(&first, 4096));

        let dropped = queue.drain_matching(|op| {
            op.descriptor().is_some_and(|desc| Arc::ptr_eq(desc, &first))
        });
        assert_eq!(dropped.len(), 2);
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.pop(), CtrlOp::Load { ref desc, .. } if Arc::ptr_eq(desc, &second)));
    }
}
