use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use bytes::Bytes;
use flume::{Receiver, Sender};
use futures_util::{future::BoxFuture, FutureExt};

use super::{BlockFile, BlockStore, IoError};
use crate::id::FileId;

/// Kind of failure injected by [`MemStore::fail_next_reads`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Retryable I/O error.
    Disk,
    /// Non-retryable device failure.
    Failure,
}

#[derive(Debug, Default)]
struct Faults {
    remaining: AtomicUsize,
    kind: Mutex<Option<Fault>>,
    reads: AtomicUsize,
    // reads wait on the receiver until the sender is dropped
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    stalled: AtomicUsize,
}

impl Faults {
    async fn pass_gate(&self) {
        let gate = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, rx)| rx.clone());
        if let Some(rx) = gate {
            self.stalled.fetch_add(1, Ordering::AcqRel);
            let _ = rx.recv_async().await;
            self.stalled.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn on_read(&self) -> Result<(), IoError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let armed = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !armed {
            return Ok(());
        }
        match *self.kind.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(Fault::Failure) => Err(IoError::Failure("injected device failure".into())),
            _ => Err(IoError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected read error",
            ))),
        }
    }
}

struct MemFile {
    data: RwLock<Vec<u8>>,
    faults: Arc<Faults>,
}

impl BlockFile for MemFile {
    fn read_at(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Bytes, IoError>> {
        async move {
            self.faults.pass_gate().await;
            self.faults.on_read()?;
            let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
            let start = offset as usize;
            match start.checked_add(len) {
                Some(end) if end <= data.len() => Ok(Bytes::copy_from_slice(&data[start..end])),
                _ => Err(IoError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {len} bytes at {offset} past end {}", data.len()),
                ))),
            }
        }
        .boxed()
    }

    fn write_at(&self, offset: u64, bytes: Bytes) -> BoxFuture<'_, Result<(), IoError>> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(&bytes);
        async { Ok(()) }.boxed()
    }

    fn sync(&self) -> BoxFuture<'_, Result<(), IoError>> {
        async { Ok(()) }.boxed()
    }

    fn len(&self) -> u64 {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len() as u64
    }
}

/// In-memory block store with fault injection for tests.
#[derive(Default)]
pub struct MemStore {
    files: Mutex<HashMap<FileId, Arc<MemFile>>>,
    faults: Arc<Faults>,
    failing_removes: AtomicUsize,
}

impl MemStore {
    /// Empty store without faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` reads on any file of this store.
    pub fn fail_next_reads(&self, count: usize, fault: Fault) {
        *self.faults.kind.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
        self.faults.remaining.store(count, Ordering::Release);
    }

    /// Hold every read until [`MemStore::resume_reads`].
    pub fn pause_reads(&self) {
        let mut gate = self.faults.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.is_none() {
            *gate = Some(flume::bounded(0));
        }
    }

    /// Release held reads.
    pub fn resume_reads(&self) {
        self.faults
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Reads currently held by [`MemStore::pause_reads`].
    pub fn stalled_reads(&self) -> usize {
        self.faults.stalled.load(Ordering::Acquire)
    }

    /// Fail the next `count` removals with a retryable I/O error.
    pub fn fail_next_removes(&self, count: usize) {
        self.failing_removes.store(count, Ordering::Release);
    }

    /// Flip every bit of the byte at `offset`.
    pub fn corrupt(&self, id: FileId, offset: u64) -> bool {
        match self.file(id) {
            Some(file) => {
                let mut data = file.data.write().unwrap_or_else(PoisonError::into_inner);
                match data.get_mut(offset as usize) {
                    Some(byte) => {
                        *byte = !*byte;
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    /// Cut the file to `len` bytes.
    pub fn truncate(&self, id: FileId, len: u64) -> bool {
        match self.file(id) {
            Some(file) => {
                file.data
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .truncate(len as usize);
                true
            }
            None => false,
        }
    }

    /// Whether a file for `id` exists.
    pub fn contains(&self, id: FileId) -> bool {
        self.file(id).is_some()
    }

    /// Number of files.
    pub fn file_count(&self) -> usize {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Reads served (or failed) so far.
    pub fn reads(&self) -> usize {
        self.faults.reads.load(Ordering::Relaxed)
    }

    fn file(&self, id: FileId) -> Option<Arc<MemFile>> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl BlockStore for MemStore {
    fn create(&self, id: FileId) -> BoxFuture<'_, Result<Arc<dyn BlockFile>, IoError>> {
        let file = Arc::new(MemFile {
            data: RwLock::new(Vec::new()),
            faults: self.faults.clone(),
        });
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, file.clone());
        async move { Ok(file as Arc<dyn BlockFile>) }.boxed()
    }

    fn open(&self, id: FileId) -> BoxFuture<'_, Result<Arc<dyn BlockFile>, IoError>> {
        let file = self.file(id);
        async move {
            file.map(|file| file as Arc<dyn BlockFile>)
                .ok_or(IoError::NotFound(id))
        }
        .boxed()
    }

    fn remove(&self, id: FileId) -> BoxFuture<'_, Result<(), IoError>> {
        let failing = self
            .failing_removes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return async {
                Err(IoError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "injected remove error",
                )))
            }
            .boxed();
        }
        let removed = self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        async move { removed.map(|_| ()).ok_or(IoError::NotFound(id)) }.boxed()
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<FileId>, IoError>> {
        let mut ids: Vec<_> = self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        async move { Ok(ids) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;

    #[test]
    fn write_then_read() {
        block_on(async {
            let store = MemStore::new();
            let id = FileId::new();
            let file = store.create(id).await.unwrap();
            file.write_at(4, Bytes::from_static(b"tail")).await.unwrap();
            file.write_at(0, Bytes::from_static(b"head")).await.unwrap();
            assert_eq!(file.len(), 8);
            assert_eq!(file.read_at(2, 4).await.unwrap().as_ref(), b"adta");
            assert!(file.read_at(6, 4).await.is_err());

            let reopened = store.open(id).await.unwrap();
            assert_eq!(reopened.read_at(0, 8).await.unwrap().as_ref(), b"headtail");
            assert_eq!(store.list().await.unwrap(), vec![id]);
            store.remove(id).await.unwrap();
            assert!(matches!(store.open(id).await, Err(IoError::NotFound(_))));
        });
    }

    #[test]
    fn injected_faults() {
        block_on(async {
            let store = MemStore::new();
            let id = FileId::new();
            let file = store.create(id).await.unwrap();
            file.write_at(0, Bytes::from_static(b"abc")).await.unwrap();

            store.fail_next_reads(1, Fault::Failure);
            assert!(matches!(file.read_at(0, 1).await, Err(IoError::Failure(_))));
            assert!(file.read_at(0, 1).await.is_ok());

            store.fail_next_reads(1, Fault::Disk);
            assert!(matches!(file.read_at(0, 1).await, Err(IoError::Io(_))));

            assert!(store.corrupt(id, 1));
            assert_eq!(file.read_at(1, 1).await.unwrap()[0], !b'b');
            assert!(store.truncate(id, 1));
            assert_eq!(file.len(), 1);
            assert_eq!(store.reads(), 4);

            store.pause_reads();
            let mut held = file.read_at(0, 1);
            assert!((&mut held).now_or_never().is_none());
            assert_eq!(store.stalled_reads(), 1);
            store.resume_reads();
            assert!(held.await.is_ok());
            assert_eq!(store.stalled_reads(), 0);

            store.fail_next_removes(1);
            assert!(matches!(store.remove(id).await, Err(IoError::Io(_))));
            store.remove(id).await.unwrap();
        });
    }
}
