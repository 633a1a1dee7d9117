use std::{
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    task::Wake,
};

use futures_util::future::BoxFuture;

use super::runner::Shared;

pub(crate) const UNSCHEDULED: u8 = 0;
pub(crate) const RUNNABLE: u8 = 1;
pub(crate) const RUNNING: u8 = 2;
pub(crate) const SUSPENDED: u8 = 3;
pub(crate) const TERMINATED: u8 = 4;
/// Set on `RUNNING` when a wake arrives during the poll.
const NOTIFIED: u8 = 0x80;

/// What a runner does with a frame after polling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AfterPoll {
    /// Woken during the poll; queue it again.
    Requeue,
    /// Parked until a waker fires.
    Parked,
}

/// A schedulable unit: a boxed future plus its lifecycle state.
pub(crate) struct Frame {
    id: AtomicU64,
    state: AtomicU8,
    /// Runner the frame runs on next.
    home: AtomicUsize,
    resume_immediately: AtomicBool,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    shared: Weak<Shared>,
    /// Link used by [`super::handoff::HandoffList`].
    pub(crate) next: AtomicPtr<Frame>,
}

impl Frame {
    pub(crate) fn new(id: u64, shared: Weak<Shared>) -> Self {
        Frame {
            id: AtomicU64::new(id),
            state: AtomicU8::new(UNSCHEDULED),
            home: AtomicUsize::new(0),
            resume_immediately: AtomicBool::new(false),
            future: Mutex::new(None),
            shared,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: u64) -> Self {
        Frame::new(id, Weak::new())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire) & !NOTIFIED
    }

    pub(crate) fn home(&self) -> usize {
        self.home.load(Ordering::Acquire)
    }

    pub(crate) fn set_home(&self, runner: usize) {
        self.home.store(runner, Ordering::Release);
    }

    pub(crate) fn request_resume_immediately(&self) {
        self.resume_immediately.store(true, Ordering::Release);
    }

    pub(crate) fn take_resume_immediately(&self) -> bool {
        self.resume_immediately.swap(false, Ordering::AcqRel)
    }

    /// Install the entry point and mark the frame runnable. The caller queues it.
    pub(crate) fn install(&self, future: BoxFuture<'static, ()>, home: usize) {
        *self.future.lock().unwrap_or_else(PoisonError::into_inner) = Some(future);
        self.set_home(home);
        let prev = self.state.swap(RUNNABLE, Ordering::AcqRel);
        debug_assert_eq!(prev, UNSCHEDULED, "installing into a live frame");
    }

    /// `RUNNABLE -> RUNNING`. Fails when the frame was abandoned meanwhile.
    pub(crate) fn start_running(&self) -> bool {
        self.state
            .compare_exchange(RUNNABLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leave `RUNNING` after a `Pending` poll.
    pub(crate) fn finish_poll(&self) -> AfterPoll {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (next, outcome) = if current == RUNNING | NOTIFIED {
                (RUNNABLE, AfterPoll::Requeue)
            } else {
                debug_assert_eq!(current, RUNNING);
                (SUSPENDED, AfterPoll::Parked)
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return outcome,
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark the frame terminated and drop its future.
    pub(crate) fn terminate(&self) {
        self.state.store(TERMINATED, Ordering::Release);
        let future = self
            .future
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(future);
    }

    /// `RUNNABLE -> TERMINATED` for a queued frame no runner picked up.
    /// A frame a runner already owns is left alone.
    pub(crate) fn abandon_queued(&self) -> bool {
        if self
            .state
            .compare_exchange(RUNNABLE, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let future = self
            .future
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(future);
        true
    }

    pub(crate) fn future(&self) -> &Mutex<Option<BoxFuture<'static, ()>>> {
        &self.future
    }

    /// Record a wake. Returns `true` when the caller must queue the frame.
    fn notify(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                SUSPENDED => RUNNABLE,
                RUNNING => RUNNING | NOTIFIED,
                _ => return false,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == RUNNABLE,
                Err(actual) => current = actual,
            }
        }
    }

    /// Put a terminated frame back into the unscheduled state under a new id.
    fn reset(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
        self.resume_immediately.store(false, Ordering::Relaxed);
        self.state.store(UNSCHEDULED, Ordering::Release);
    }
}

impl Wake for Frame {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.notify() {
            match self.shared.upgrade() {
                Some(shared) => shared.enqueue_woken(self.clone()),
                // pool is gone; the frame is abandoned
                None => self.terminate(),
            }
        }
    }
}

/// Bounded free list of terminated frames.
pub(crate) struct FramePool {
    frames: Mutex<Vec<Arc<Frame>>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl FramePool {
    pub(crate) fn new(capacity: usize) -> Self {
        FramePool {
            frames: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    /// Reuse a recycled frame or build a new one.
    pub(crate) fn acquire(&self, shared: &Weak<Shared>) -> Arc<Frame> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let recycled = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(frame) => {
                frame.reset(id);
                frame
            }
            None => Arc::new(Frame::new(id, shared.clone())),
        }
    }

    /// Take back a terminated frame if nothing else references it.
    pub(crate) fn release(&self, frame: Arc<Frame>) -> bool {
        if Arc::strong_count(&frame) != 1 || frame.state() != TERMINATED {
            return false;
        }
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if frames.len() >= self.capacity {
            return false;
        }
        frames.push(frame);
        true
    }

    pub(crate) fn idle(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
