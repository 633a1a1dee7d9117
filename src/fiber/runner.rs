use std::{
    collections::{HashMap, VecDeque},
    iter,
    sync::{
        atomic::{fence, AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, OnceLock, PoisonError, Weak,
    },
    task::{Context, Poll, Waker},
    thread::{self, Thread},
    time::Duration,
};

use futures_util::future::BoxFuture;

use super::{
    backoff::Backoff,
    frame::{AfterPoll, Frame, FramePool},
    handoff::HandoffList,
};
use crate::{
    observability::{log_debug, log_info},
    option::EngineOption,
};

/// Inbound side of one runner.
struct RunnerSlot {
    /// One list per source runner.
    peers: Vec<HandoffList>,
    /// Frames pushed from threads that are not runners (wakers, spawns
    /// from outside the pool).
    external: HandoffList,
    thread: OnceLock<Thread>,
    idle: AtomicBool,
}

impl RunnerSlot {
    fn new(runners: usize) -> Self {
        RunnerSlot {
            peers: (0..runners).map(|_| HandoffList::new()).collect(),
            external: HandoffList::new(),
            thread: OnceLock::new(),
            idle: AtomicBool::new(false),
        }
    }

    fn lists(&self) -> impl Iterator<Item = &HandoffList> {
        self.peers.iter().chain(iter::once(&self.external))
    }

    fn has_work(&self) -> bool {
        self.lists().any(|list| !list.is_empty())
    }
}

/// State shared by the runner threads, spawners, frames and wakers.
pub(crate) struct Shared {
    me: Weak<Shared>,
    slots: Vec<RunnerSlot>,
    stopping: AtomicBool,
    round_robin: AtomicUsize,
    pub(crate) pool: FramePool,
    live: Mutex<HashMap<u64, Weak<Frame>>>,
    idle_spins: usize,
    idle_sleep_min: Duration,
    idle_sleep_max: Duration,
}

impl Shared {
    pub(crate) fn new(option: &EngineOption) -> Arc<Self> {
        let runners = option.runners.max(1);
        Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            slots: (0..runners).map(|_| RunnerSlot::new(runners)).collect(),
            stopping: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
            pool: FramePool::new(option.frame_pool_capacity),
            live: Mutex::new(HashMap::new()),
            idle_spins: option.idle_spins,
            idle_sleep_min: option.idle_sleep_min,
            idle_sleep_max: option.idle_sleep_max,
        })
    }

    pub(crate) fn runner_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_frame(&self) -> Arc<Frame> {
        self.pool.acquire(&self.me)
    }

    /// Queue a freshly installed frame on `target`, or on the origin runner,
    /// or round-robin when neither is given.
    pub(crate) fn launch(
        &self,
        frame: Arc<Frame>,
        future: BoxFuture<'static, ()>,
        origin: Option<usize>,
        target: Option<usize>,
    ) {
        let count = self.runner_count();
        let target = match (target, origin) {
            (Some(target), _) => target % count,
            (None, Some(origin)) => origin,
            (None, None) => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        };
        frame.install(future, target);
        if self.is_stopping() {
            frame.terminate();
            return;
        }
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(frame.id(), Arc::downgrade(&frame));

        let slot = &self.slots[target];
        let queued = frame.clone();
        match origin {
            Some(origin) => slot.peers[origin].push(frame),
            None => slot.external.push(frame),
        }
        self.unpark(target);
        self.recheck_stopping(&queued);
    }

    /// Queue a frame whose waker fired.
    pub(crate) fn enqueue_woken(&self, frame: Arc<Frame>) {
        if self.is_stopping() {
            frame.terminate();
            return;
        }
        let home = frame.home();
        let queued = frame.clone();
        self.slots[home].external.push(frame);
        self.unpark(home);
        self.recheck_stopping(&queued);
    }

    /// A shutdown may have drained the lists between the first stop check and
    /// the push. Runners poll nothing once stopping, so a frame still
    /// `RUNNABLE` here would never be terminated.
    fn recheck_stopping(&self, frame: &Frame) {
        if self.is_stopping() && frame.abandon_queued() {
            self.live
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&frame.id());
            log_debug!(component = "fiber", event = "late_frame_abandoned", frame = frame.id());
        }
    }

    fn hand_off(&self, from: usize, frame: Arc<Frame>) {
        let home = frame.home();
        self.slots[home].peers[from].push(frame);
        self.unpark(home);
    }

    fn unpark(&self, runner: usize) {
        fence(Ordering::SeqCst);
        let slot = &self.slots[runner];
        if slot.idle.load(Ordering::SeqCst) {
            if let Some(thread) = slot.thread.get() {
                thread.unpark();
            }
        }
    }

    fn retire(&self, frame: Arc<Frame>) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&frame.id());
        self.pool.release(frame);
    }

    pub(crate) fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        for slot in &self.slots {
            if let Some(thread) = slot.thread.get() {
                thread.unpark();
            }
        }
    }

    /// Drop every frame that has not terminated. Runs after the runner threads
    /// have exited, so no frame is being polled.
    pub(crate) fn abandon_all(&self) -> usize {
        for slot in &self.slots {
            for list in slot.lists() {
                for frame in list.drain() {
                    frame.terminate();
                }
            }
        }
        let live: Vec<_> = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, frame)| frame)
            .collect();
        let mut abandoned = 0;
        for frame in live.iter().filter_map(Weak::upgrade) {
            frame.terminate();
            abandoned += 1;
        }
        abandoned
    }

    pub(crate) fn live_frames(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One OS thread draining its inbound lists and polling ready frames.
pub(crate) struct Runner {
    id: usize,
    shared: Arc<Shared>,
    ready: VecDeque<Arc<Frame>>,
    backoff: Backoff,
}

impl Runner {
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> Self {
        let backoff = Backoff::new(
            shared.idle_spins,
            shared.idle_sleep_min,
            shared.idle_sleep_max,
        );
        Runner {
            id,
            shared,
            ready: VecDeque::new(),
            backoff,
        }
    }

    pub(crate) fn run(mut self) {
        let _ = self.shared.slots[self.id].thread.set(thread::current());
        log_debug!(component = "fiber", event = "runner_started", runner = self.id);

        while !self.shared.is_stopping() {
            let received = self.drain_inbound();
            let ran = self.run_pass();
            if received + ran > 0 {
                self.backoff.reset();
                continue;
            }
            match self.backoff.idle() {
                Some(timeout) => self.park(timeout),
                None => std::hint::spin_loop(),
            }
        }

        let abandoned = self.ready.len();
        for frame in self.ready.drain(..) {
            frame.terminate();
        }
        log_debug!(
            component = "fiber",
            event = "runner_stopped",
            runner = self.id,
            abandoned,
        );
    }

    /// Move every inbound frame to the ready queue; frames that asked to
    /// resume immediately go to the front.
    fn drain_inbound(&mut self) -> usize {
        let slot = &self.shared.slots[self.id];
        let mut urgent = Vec::new();
        let mut received = 0;
        for list in slot.lists() {
            for frame in list.drain() {
                received += 1;
                if frame.take_resume_immediately() {
                    urgent.push(frame);
                } else {
                    self.ready.push_back(frame);
                }
            }
        }
        for frame in urgent.into_iter().rev() {
            self.ready.push_front(frame);
        }
        received
    }

    fn run_pass(&mut self) -> usize {
        let budget = self.ready.len();
        let mut ran = 0;
        while ran < budget && !self.shared.is_stopping() {
            let Some(frame) = self.ready.pop_front() else {
                break;
            };
            self.poll(frame);
            ran += 1;
        }
        ran
    }

    fn poll(&mut self, frame: Arc<Frame>) {
        if !frame.start_running() {
            return;
        }
        frame.set_home(self.id);

        let waker = Waker::from(frame.clone());
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let mut future = frame.future().lock().unwrap_or_else(PoisonError::into_inner);
            match future.as_mut() {
                Some(future) => future.as_mut().poll(&mut cx),
                None => Poll::Ready(()),
            }
        };
        drop(waker);

        match poll {
            Poll::Ready(()) => {
                frame.terminate();
                self.shared.retire(frame);
            }
            Poll::Pending => match frame.finish_poll() {
                AfterPoll::Requeue => self.requeue(frame),
                AfterPoll::Parked => {}
            },
        }
    }

    fn requeue(&mut self, frame: Arc<Frame>) {
        if frame.home() != self.id {
            self.shared.hand_off(self.id, frame);
        } else if frame.take_resume_immediately() {
            self.ready.push_front(frame);
        } else {
            self.ready.push_back(frame);
        }
    }

    fn park(&self, timeout: Duration) {
        let slot = &self.shared.slots[self.id];
        slot.idle.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if !slot.has_work() && !self.shared.is_stopping() {
            thread::park_timeout(timeout);
        }
        slot.idle.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn log_shutdown(runners: usize, abandoned: usize) {
    log_info!(
        component = "fiber",
        event = "pool_stopped",
        runners,
        abandoned,
    );
}
