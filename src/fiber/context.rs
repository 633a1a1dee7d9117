use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use super::{frame::Frame, runner::Shared, Spawner};

/// Handle a frame's entry point receives: which runner and frame it is on,
/// plus the ways it can give up its runner.
pub struct FiberContext {
    frame: Arc<Frame>,
    shared: Arc<Shared>,
}

impl FiberContext {
    pub(crate) fn new(frame: Arc<Frame>, shared: Arc<Shared>) -> Self {
        FiberContext { frame, shared }
    }

    /// Runner the frame is currently executing on.
    pub fn runner_id(&self) -> usize {
        self.frame.home()
    }

    /// Id of the running frame.
    pub fn frame_id(&self) -> u64 {
        self.frame.id()
    }

    /// Number of runners in the pool.
    pub fn runner_count(&self) -> usize {
        self.shared.runner_count()
    }

    /// Spawner whose frames default to this frame's runner.
    pub fn spawner(&self) -> Spawner {
        Spawner::new(self.shared.clone(), Some(self.runner_id()))
    }

    /// Let the other ready frames of this runner run first.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow::new()
    }

    /// Yield, but ask to be placed at the front of the ready queue.
    pub fn resume_immediately(&self) -> YieldNow {
        self.frame.request_resume_immediately();
        YieldNow::new()
    }

    /// Continue on `runner`. The frame is handed over through that runner's
    /// inbound list for this runner.
    ///
    /// # Panics
    ///
    /// Panics if `runner` is not a runner of this pool.
    pub fn switch_to(&self, runner: usize) -> YieldNow {
        assert!(
            runner < self.shared.runner_count(),
            "runner {runner} out of range"
        );
        self.frame.set_home(runner);
        YieldNow::new()
    }

    /// Hand this frame's waker to `register` and suspend until it fires.
    ///
    /// Spurious wakes resume the frame as well, so callers re-check whatever
    /// condition they suspended on.
    pub fn suspend<F>(&self, register: F) -> Suspend<F>
    where
        F: FnOnce(Waker),
    {
        Suspend {
            register: Some(register),
        }
    }
}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext")
            .field("runner", &self.runner_id())
            .field("frame", &self.frame_id())
            .finish()
    }
}

/// Returns `Pending` once after waking itself.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    fn new() -> Self {
        YieldNow { yielded: false }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Future returned by [`FiberContext::suspend`].
#[must_use = "futures do nothing unless polled"]
pub struct Suspend<F> {
    register: Option<F>,
}

impl<F> Unpin for Suspend<F> {}

impl<F> Future for Suspend<F>
where
    F: FnOnce(Waker),
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.get_mut().register.take() {
            Some(register) => {
                register(cx.waker().clone());
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}
