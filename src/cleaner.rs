use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use flume::{Receiver, Sender, TryRecvError};
use thiserror::Error;

use crate::{
    id::FileId,
    io::{BlockStore, IoError},
    observability::{log_debug, log_info, log_warn},
};

/// Message sent to the cleaner.
pub enum CleanTag {
    /// Remove the file of a retired generation.
    Remove(FileId),
    /// Stop the listening frame.
    Shutdown,
}

/// Removes the files of retired generations once their last reader is gone.
pub(crate) struct Cleaner {
    tag_recv: Receiver<CleanTag>,
    store: Arc<dyn BlockStore>,
    // files whose removal failed, retried by the next collect
    backlog: Mutex<Vec<FileId>>,
}

impl Cleaner {
    pub(crate) fn new(store: Arc<dyn BlockStore>) -> (Self, Sender<CleanTag>) {
        // unbounded: a retired generation must never lose its tag
        let (tag_send, tag_recv) = flume::unbounded();

        (
            Cleaner {
                tag_recv,
                store,
                backlog: Mutex::new(Vec::new()),
            },
            tag_send,
        )
    }

    /// Serve tags until every sender is gone or a shutdown tag arrives, then
    /// sweep what is left. A failed removal is logged and kept for later.
    pub(crate) async fn listen(&self) -> Result<(), CleanerError> {
        while let Ok(tag) = self.tag_recv.recv_async().await {
            match tag {
                CleanTag::Remove(id) => {
                    if let Err(err) = self.remove(id).await {
                        self.defer(id, &err);
                    }
                }
                CleanTag::Shutdown => break,
            }
        }
        let swept = self.collect().await;
        log_info!(
            component = "cleaner",
            event = "cleaner_stopped",
            backlog = self.backlog_len(),
        );
        swept.map(|_| ())
    }

    /// Serve pending tags and the backlog without waiting; returns the number
    /// of files removed, or the first failure once everything was tried.
    pub(crate) async fn collect(&self) -> Result<usize, CleanerError> {
        let mut pending = mem::take(&mut *self.backlog());
        loop {
            match self.tag_recv.try_recv() {
                Ok(CleanTag::Remove(id)) => pending.push(id),
                Ok(CleanTag::Shutdown) | Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                    break
                }
            }
        }

        let mut removed = 0;
        let mut first = None;
        for id in pending {
            match self.remove(id).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    self.defer(id, &err);
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(removed), Err)
    }

    /// Files waiting for another removal attempt.
    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog().len()
    }

    async fn remove(&self, id: FileId) -> Result<(), CleanerError> {
        match self.store.remove(id).await {
            // already gone, e.g. removed by an earlier run
            Ok(()) | Err(IoError::NotFound(_)) => {
                log_debug!(component = "cleaner", event = "generation_removed", file = %id);
                Ok(())
            }
            Err(err) => Err(CleanerError::Remove { file: id, source: err }),
        }
    }

    fn defer(&self, id: FileId, err: &CleanerError) {
        log_warn!(
            component = "cleaner",
            event = "generation_remove_failed",
            file = %id,
            error = %err,
        );
        self.backlog().push(id);
    }

    fn backlog(&self) -> MutexGuard<'_, Vec<FileId>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Failure to remove a retired generation file.
#[derive(Debug, Error)]
pub enum CleanerError {
    /// The block store refused the removal.
    #[error("cleaner remove error: {file}: {source}")]
    Remove {
        /// File that is still on disk.
        file: FileId,
        /// Store error.
        #[source]
        source: IoError,
    },
}
