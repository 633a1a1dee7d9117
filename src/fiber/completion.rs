use std::{
    future::Future,
    pin::Pin,
    sync::{Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

use crate::error::StorageError;

/// Outcome reported by one sub-operation.
#[derive(Debug)]
pub enum CompletionStatus {
    /// Succeeded.
    Success,
    /// Failed; the error is passed to every waiter.
    Error(StorageError),
    /// Device failure.
    DiskFailure(String),
    /// Abandoned by a stopping pool.
    Shutdown,
}

impl From<Result<(), StorageError>> for CompletionStatus {
    fn from(result: Result<(), StorageError>) -> Self {
        match result {
            Ok(()) => CompletionStatus::Success,
            Err(StorageError::DiskFailure(reason)) => CompletionStatus::DiskFailure(reason),
            Err(StorageError::Shutdown) => CompletionStatus::Shutdown,
            Err(err) => CompletionStatus::Error(err),
        }
    }
}

#[derive(Debug)]
struct TriggerState {
    pending: usize,
    failure: Option<StorageError>,
    waiters: Vec<Waker>,
}

impl TriggerState {
    fn outcome(&self) -> Option<Result<(), StorageError>> {
        match &self.failure {
            Some(failure) => Some(Err(failure.duplicate())),
            None if self.pending == 0 => Some(Ok(())),
            None => None,
        }
    }
}

/// Joins N outstanding sub-operations.
///
/// The trigger resolves once every sub-operation has reported, or as soon as
/// one of them fails. The first failure is latched: every waiter, present or
/// future, observes it.
#[derive(Debug)]
pub struct CompletionTrigger {
    state: Mutex<TriggerState>,
}

impl CompletionTrigger {
    /// Trigger expecting `pending` sub-operations.
    pub fn new(pending: usize) -> Self {
        CompletionTrigger {
            state: Mutex::new(TriggerState {
                pending,
                failure: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Expect `count` additional sub-operations.
    pub fn wait_for_more(&self, count: usize) {
        self.lock().pending += count;
    }

    /// Report one successful sub-operation.
    pub fn complete(&self) {
        self.finish(CompletionStatus::Success);
    }

    /// Report the outcome of one sub-operation.
    ///
    /// # Panics
    ///
    /// Panics if more sub-operations report than were announced.
    pub fn finish(&self, status: CompletionStatus) {
        let waiters = {
            let mut state = self.lock();
            assert!(
                state.pending > 0,
                "completion trigger finished more often than announced"
            );
            state.pending -= 1;
            let failure = match status {
                CompletionStatus::Success => None,
                CompletionStatus::Error(err) => Some(err),
                CompletionStatus::DiskFailure(reason) => Some(StorageError::DiskFailure(reason)),
                CompletionStatus::Shutdown => Some(StorageError::Shutdown),
            };
            if state.failure.is_none() {
                state.failure = failure;
            }
            if state.outcome().is_some() {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            }
        };
        for waker in waiters {
            waker.wake();
        }
    }

    /// Sub-operations that have not reported yet.
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// `None` while sub-operations are outstanding and none has failed.
    pub fn outcome(&self) -> Option<Result<(), StorageError>> {
        self.lock().outcome()
    }

    /// Resolves once every sub-operation succeeded or the first one failed.
    pub fn wait(&self) -> WaitCompletion<'_> {
        WaitCompletion { trigger: self }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TriggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Future returned by [`CompletionTrigger::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct WaitCompletion<'a> {
    trigger: &'a CompletionTrigger,
}

impl Future for WaitCompletion<'_> {
    type Output = Result<(), StorageError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.trigger.lock();
        if let Some(outcome) = state.outcome() {
            return Poll::Ready(outcome);
        }
        if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            state.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc, thread};

    use futures::executor::block_on;

    use super::*;

    #[test]
    fn resolves_after_all_complete() {
        let trigger = Arc::new(CompletionTrigger::new(2));
        trigger.wait_for_more(1);
        assert_eq!(trigger.pending(), 3);
        assert!(trigger.outcome().is_none());

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let trigger = trigger.clone();
                thread::spawn(move || trigger.complete())
            })
            .collect();
        block_on(trigger.wait()).unwrap();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(trigger.pending(), 0);
    }

    #[test]
    fn first_failure_is_latched() {
        let trigger = CompletionTrigger::new(3);
        trigger.finish(CompletionStatus::DiskFailure("sector".into()));
        trigger.finish(CompletionStatus::Shutdown);
        assert!(matches!(
            block_on(trigger.wait()),
            Err(StorageError::DiskFailure(reason)) if reason == "sector"
        ));
        trigger.complete();
        // later waiters still see the latched failure
        assert!(matches!(
            trigger.outcome(),
            Some(Err(StorageError::DiskFailure(_)))
        ));
    }

    #[test]
    fn status_from_result() {
        let status: CompletionStatus =
            Err(StorageError::Disk(io::Error::new(io::ErrorKind::Other, "eio"))).into();
        assert!(matches!(status, CompletionStatus::Error(StorageError::Disk(_))));
        assert!(matches!(
            CompletionStatus::from(Ok(())),
            CompletionStatus::Success
        ));
    }

    #[test]
    #[should_panic(expected = "more often")]
    fn over_completion_panics() {
        let trigger = CompletionTrigger::new(0);
        trigger.complete();
    }
}
