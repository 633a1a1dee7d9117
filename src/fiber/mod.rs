//! Cooperative M:N runtime.
//!
//! Frames are boxed futures multiplexed onto a fixed set of runner threads.
//! A frame gives up its runner whenever its future returns `Pending` (disk
//! I/O, a [`CompletionTrigger`], an explicit yield) and is queued again by its
//! waker. Frames move between runners through lock-free hand-off lists, one
//! per (source, destination) pair plus one per runner for producers that are
//! not runners.

mod backoff;
mod completion;
mod context;
mod frame;
mod handoff;
mod runner;

use std::{
    any::Any,
    fmt::Display,
    future::Future,
    io,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use futures_util::FutureExt;
use thiserror::Error;

pub use completion::{CompletionStatus, CompletionTrigger, WaitCompletion};
pub use context::{FiberContext, Suspend, YieldNow};

use crate::{
    error::StorageError,
    observability::{log_error, log_warn},
    option::EngineOption,
};
use runner::{Runner, Shared};

/// Why a frame produced no output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// The pool stopped before the frame finished.
    #[error("fiber shutdown error: runner pool stopped before the frame finished")]
    Shutdown,
    /// The frame's future panicked; carries the panic message.
    #[error("fiber panic error: {0}")]
    Panicked(String),
}

impl From<FiberError> for StorageError {
    fn from(err: FiberError) -> Self {
        match err {
            FiberError::Shutdown => StorageError::Shutdown,
            FiberError::Panicked(message) => StorageError::Logic(message),
        }
    }
}

/// Fixed pool of runner threads.
pub struct RunnerPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RunnerPool {
    /// Start `option.runners` runner threads.
    pub fn new(option: &EngineOption) -> io::Result<Self> {
        let shared = Shared::new(option);
        let mut threads = Vec::with_capacity(shared.runner_count());
        for id in 0..shared.runner_count() {
            let runner = Runner::new(id, shared.clone());
            let spawned = thread::Builder::new()
                .name(format!("stratum-runner-{id}"))
                .spawn(move || runner.run());
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    shared.begin_shutdown();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }
        Ok(RunnerPool {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Number of runner threads.
    pub fn runners(&self) -> usize {
        self.shared.runner_count()
    }

    /// Spawner that distributes frames round-robin.
    pub fn spawner(&self) -> Spawner {
        Spawner::new(self.shared.clone(), None)
    }

    /// Run `future` as a frame and block the calling thread until it ends.
    ///
    /// Must not be called from a runner thread: the runner would block on a
    /// frame that may be queued behind it.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, FiberError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawner().spawn(future).wait()
    }

    /// Frames scheduled and not yet terminated.
    pub fn live_frames(&self) -> usize {
        self.shared.live_frames()
    }

    /// Frames parked in the recycle pool.
    pub fn pooled_frames(&self) -> usize {
        self.shared.pool.idle()
    }

    /// Whether the pool started stopping.
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Stop every runner and abandon frames that have not terminated; their
    /// handles resolve to [`FiberError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        self.shared.begin_shutdown();
        let threads = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            if handle.join().is_err() {
                log_error!(component = "fiber", event = "runner_panicked");
            }
        }
        let abandoned = self.shared.abandon_all();
        runner::log_shutdown(self.shared.runner_count(), abandoned);
    }
}

impl Drop for RunnerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Schedules new frames onto a [`RunnerPool`].
#[derive(Clone)]
pub struct Spawner {
    shared: Arc<Shared>,
    origin: Option<usize>,
}

impl Spawner {
    pub(crate) fn new(shared: Arc<Shared>, origin: Option<usize>) -> Self {
        Spawner { shared, origin }
    }

    /// Number of runner threads.
    pub fn runners(&self) -> usize {
        self.shared.runner_count()
    }

    /// Whether the pool started stopping.
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Start `entry` on the spawning runner, or round-robin from outside the
    /// pool.
    pub fn schedule<E, Fut>(&self, entry: E) -> FrameHandle<Fut::Output>
    where
        E: FnOnce(FiberContext) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.launch(None, entry)
    }

    /// Start `entry` on a specific runner.
    pub fn schedule_on<E, Fut>(&self, target: usize, entry: E) -> FrameHandle<Fut::Output>
    where
        E: FnOnce(FiberContext) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.launch(Some(target), entry)
    }

    /// Start a future that does not need its [`FiberContext`].
    pub fn spawn<F>(&self, future: F) -> FrameHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.launch(None, move |_| future)
    }

    /// Start a frame nobody joins. An `Err` is logged and ends only that frame.
    pub fn schedule_detached<E, Fut, Err>(&self, name: &'static str, entry: E)
    where
        E: FnOnce(FiberContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Err>> + Send + 'static,
        Err: Display + Send + 'static,
    {
        drop(self.launch(None, move |ctx| async move {
            if let Err(err) = entry(ctx).await {
                log_warn!(
                    component = "fiber",
                    event = "frame_failed",
                    frame = name,
                    error = %err,
                );
            }
        }));
    }

    fn launch<E, Fut>(&self, target: Option<usize>, entry: E) -> FrameHandle<Fut::Output>
    where
        E: FnOnce(FiberContext) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        let frame = self.shared.acquire_frame();
        let id = frame.id();
        let ctx = FiberContext::new(frame.clone(), self.shared.clone());
        let future = async move {
            let outcome = AssertUnwindSafe(async move { entry(ctx).await })
                .catch_unwind()
                .await;
            let result = outcome.map_err(|payload| {
                let message = panic_message(payload.as_ref());
                log_error!(
                    component = "fiber",
                    event = "frame_panicked",
                    frame = id,
                    message = %message,
                );
                FiberError::Panicked(message)
            });
            let _ = tx.send(result);
        }
        .boxed();
        self.shared.launch(frame, future, self.origin, target);
        FrameHandle { id, rx }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Result of a scheduled frame.
pub struct FrameHandle<T> {
    id: u64,
    rx: flume::Receiver<Result<T, FiberError>>,
}

impl<T> FrameHandle<T> {
    /// Id of the frame running the future.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Suspend until the frame terminates.
    pub async fn join(self) -> Result<T, FiberError> {
        self.rx
            .recv_async()
            .await
            .unwrap_or(Err(FiberError::Shutdown))
    }

    /// Block the calling OS thread until the frame terminates.
    pub fn wait(self) -> Result<T, FiberError> {
        self.rx.recv().unwrap_or(Err(FiberError::Shutdown))
    }

    /// The result if the frame has already terminated.
    pub fn try_take(&self) -> Option<Result<T, FiberError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => Some(Err(FiberError::Shutdown)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::error::ErrorKind;

    fn pool(runners: usize) -> RunnerPool {
        RunnerPool::new(
            &EngineOption::default()
                .runners(runners)
                .idle_spins(4)
                .idle_sleep(Duration::from_micros(50), Duration::from_millis(2)),
        )
        .unwrap()
    }

    #[test]
    fn block_on_returns_output() {
        let pool = pool(2);
        assert_eq!(pool.block_on(async { 40 + 2 }), Ok(42));
    }

    #[test]
    fn schedule_on_target_runner() {
        let pool = pool(3);
        let handle = pool.spawner().schedule_on(2, |ctx| async move { ctx.runner_id() });
        assert_eq!(handle.wait(), Ok(2));
    }

    #[test]
    fn switch_to_migrates() {
        let pool = pool(2);
        let handle = pool.spawner().schedule_on(0, |ctx| async move {
            let before = ctx.runner_id();
            ctx.switch_to(1).await;
            (before, ctx.runner_id())
        });
        assert_eq!(handle.wait(), Ok((0, 1)));
    }

    #[test]
    fn panic_terminates_only_its_frame() {
        let pool = pool(1);
        let spawner = pool.spawner();
        let bad = spawner.spawn(async { panic!("boom") });
        let good = spawner.spawn(async { 7 });
        assert_eq!(bad.wait(), Err(FiberError::Panicked("boom".into())));
        assert_eq!(good.wait(), Ok(7));
    }

    #[test]
    fn panicked_frame_surfaces_as_logic_error() {
        let pool = pool(1);
        let bad = pool.spawner().spawn(async { panic!("bad layer") });
        let err = StorageError::from(bad.wait().unwrap_err());
        assert_eq!(err.kind(), ErrorKind::Logic);
        assert!(err.to_string().contains("bad layer"));
        assert_eq!(StorageError::from(FiberError::Shutdown).kind(), ErrorKind::Shutdown);
    }

    #[test]
    fn suspended_frame_resumes_on_wake() {
        let pool = pool(2);
        let (tx, rx) = flume::bounded(1);
        let handle = pool.spawner().schedule(|ctx| async move {
            ctx.suspend(move |waker| tx.send(waker).unwrap()).await;
            "resumed"
        });
        let waker: std::task::Waker = rx.recv().unwrap();
        waker.wake();
        assert_eq!(handle.wait(), Ok("resumed"));
    }

    #[test]
    fn nested_schedule_from_frame() {
        let pool = pool(2);
        let (parent, child) = pool
            .spawner()
            .schedule(|ctx| async move {
                let runner = ctx.runner_id();
                let child = ctx.spawner().schedule(|inner| async move { inner.runner_id() });
                (runner, child.join().await)
            })
            .wait()
            .unwrap();
        assert_eq!(child, Ok(parent));
    }

    #[test]
    fn resume_immediately_runs_first() {
        let pool = pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let spawner = pool.spawner();
        let log = order.clone();
        let handle = spawner.schedule(move |ctx| async move {
            let spawner = ctx.spawner();
            let mut others = Vec::new();
            for i in 0..3 {
                let log = log.clone();
                others.push(spawner.spawn(async move { log.lock().unwrap().push(i) }));
            }
            ctx.resume_immediately().await;
            log.lock().unwrap().push(100);
            for other in others {
                other.join().await.unwrap();
            }
        });
        handle.wait().unwrap();
        assert_eq!(order.lock().unwrap()[0], 100);
    }

    #[test]
    fn shutdown_abandons_suspended_frames() {
        let pool = pool(2);
        let parked = Arc::new(Mutex::new(None));
        let slot = parked.clone();
        let handle = pool.spawner().schedule(|ctx| async move {
            ctx.suspend(move |waker| *slot.lock().unwrap() = Some(waker))
                .await;
            std::future::pending::<()>().await
        });
        while parked.lock().unwrap().is_none() {
            thread::yield_now();
        }
        pool.shutdown();
        assert_eq!(handle.wait(), Err(FiberError::Shutdown));
        assert!(pool.is_shutdown());

        let late = pool.spawner().spawn(async { 1 });
        assert_eq!(late.wait(), Err(FiberError::Shutdown));
    }

    #[test]
    fn frames_are_recycled() {
        let pool = pool(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.block_on(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        while pool.live_frames() != 0 {
            thread::yield_now();
        }
    }

    #[test]
    fn detached_error_is_contained() {
        let pool = pool(1);
        pool.spawner()
            .schedule_detached("failing", |_| async { Err::<(), _>("nope") });
        assert_eq!(pool.block_on(async { 5 }), Ok(5));
    }
}
