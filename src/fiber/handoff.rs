//! Multi-producer, single-consumer frame lists.
//!
//! Producers push one frame at a time with a `Release` CAS on the head; the
//! owning runner takes the whole list with a single `Acquire` swap. Every write
//! a producer made before pushing a frame is therefore visible to the runner
//! that drains it. There is no single-element pop, so the list has no ABA
//! hazard.

use std::{
    ptr,
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc,
    },
};

use super::frame::Frame;

pub(crate) struct HandoffList {
    head: AtomicPtr<Frame>,
}

impl HandoffList {
    pub(crate) fn new() -> Self {
        HandoffList {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn push(&self, frame: Arc<Frame>) {
        let node = Arc::into_raw(frame) as *mut Frame;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` came from `Arc::into_raw` above and the list owns
            // that reference until it is drained. A frame sits in at most one
            // list at a time because only the transition into `RUNNABLE`
            // queues it, so nobody else touches `next` concurrently.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Take every queued frame, oldest first.
    pub(crate) fn drain(&self) -> Vec<Arc<Frame>> {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut frames = Vec::new();
        while !node.is_null() {
            // SAFETY: every non-null pointer in the chain was produced by
            // `Arc::into_raw` in `push`, and the swap above made this thread
            // the sole owner of the chain.
            let frame = unsafe { Arc::from_raw(node) };
            node = frame.next.swap(ptr::null_mut(), Ordering::Relaxed);
            frames.push(frame);
        }
        frames.reverse();
        frames
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Drop for HandoffList {
    fn drop(&mut self) {
        drop(self.drain());
    }
}
