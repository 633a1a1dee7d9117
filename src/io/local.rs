use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};

use bytes::Bytes;
use flume::{Receiver, Sender};
use futures_util::{future::BoxFuture, FutureExt};

use super::{parse_file_id, BlockFile, BlockStore, IoError, GENERATION_SUFFIX};
use crate::{id::FileId, observability::log_debug};

type Reply<T> = Sender<io::Result<T>>;
type SharedFile = Arc<Mutex<File>>;

enum Request {
    Create {
        path: PathBuf,
        reply: Reply<(File, u64)>,
    },
    Open {
        path: PathBuf,
        reply: Reply<(File, u64)>,
    },
    Remove {
        path: PathBuf,
        reply: Reply<()>,
    },
    List {
        dir: PathBuf,
        reply: Reply<Vec<FileId>>,
    },
    Read {
        file: SharedFile,
        offset: u64,
        len: usize,
        reply: Reply<Bytes>,
    },
    Write {
        file: SharedFile,
        offset: u64,
        data: Bytes,
        reply: Reply<()>,
    },
    Sync {
        file: SharedFile,
        reply: Reply<()>,
    },
}

impl Request {
    fn serve(self) {
        match self {
            Request::Create { path, reply } => {
                let _ = reply.send(with_len(
                    OpenOptions::new()
                        .create(true)
                        .truncate(true)
                        .read(true)
                        .write(true)
                        .open(path),
                ));
            }
            Request::Open { path, reply } => {
                let _ = reply.send(with_len(
                    OpenOptions::new().read(true).write(true).open(path),
                ));
            }
            Request::Remove { path, reply } => {
                let _ = reply.send(fs::remove_file(path));
            }
            Request::List { dir, reply } => {
                let _ = reply.send(list_dir(&dir));
            }
            Request::Read {
                file,
                offset,
                len,
                reply,
            } => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                let result = file.seek(SeekFrom::Start(offset)).and_then(|_| {
                    let mut buf = vec![0u8; len];
                    file.read_exact(&mut buf)?;
                    Ok(Bytes::from(buf))
                });
                let _ = reply.send(result);
            }
            Request::Write {
                file,
                offset,
                data,
                reply,
            } => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                let result = file
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| file.write_all(&data));
                let _ = reply.send(result);
            }
            Request::Sync { file, reply } => {
                let file = file.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = reply.send(file.sync_data());
            }
        }
    }
}

fn with_len(file: io::Result<File>) -> io::Result<(File, u64)> {
    let file = file?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

fn list_dir(dir: &Path) -> io::Result<Vec<FileId>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_file_id) {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

/// Sends a request to the I/O workers and suspends until they answer.
#[derive(Clone)]
struct Submitter {
    tx: Sender<Request>,
}

impl Submitter {
    async fn submit<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, IoError> {
        let (reply, done) = flume::bounded(1);
        self.tx
            .send_async(build(reply))
            .await
            .map_err(|_| IoError::Shutdown)?;
        let result = done.recv_async().await.map_err(|_| IoError::Shutdown)?;
        Ok(result?)
    }
}

struct LocalFile {
    file: SharedFile,
    len: AtomicU64,
    submitter: Submitter,
}

impl BlockFile for LocalFile {
    fn read_at(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Bytes, IoError>> {
        let file = self.file.clone();
        async move {
            self.submitter
                .submit(|reply| Request::Read {
                    file,
                    offset,
                    len,
                    reply,
                })
                .await
        }
        .boxed()
    }

    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), IoError>> {
        let file = self.file.clone();
        let end = offset + data.len() as u64;
        async move {
            self.submitter
                .submit(|reply| Request::Write {
                    file,
                    offset,
                    data,
                    reply,
                })
                .await?;
            self.len.fetch_max(end, Ordering::AcqRel);
            Ok(())
        }
        .boxed()
    }

    fn sync(&self) -> BoxFuture<'_, Result<(), IoError>> {
        let file = self.file.clone();
        async move { self.submitter.submit(|reply| Request::Sync { file, reply }).await }.boxed()
    }

    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }
}

/// Block store keeping one file per id under a directory.
///
/// Blocking system calls run on dedicated I/O worker threads; callers only
/// await channel replies.
pub struct LocalStore {
    dir: PathBuf,
    submitter: Submitter,
}

impl LocalStore {
    /// Store rooted at `dir` with one I/O thread.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_workers(dir, 1)
    }

    /// Store rooted at `dir` serving blocking calls from `workers` threads.
    pub fn with_workers(dir: impl Into<PathBuf>, workers: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (tx, rx) = flume::unbounded();
        for worker in 0..workers.max(1) {
            let rx: Receiver<Request> = rx.clone();
            thread::Builder::new()
                .name(format!("stratum-io-{worker}"))
                .spawn(move || {
                    while let Ok(request) = rx.recv() {
                        request.serve();
                    }
                    log_debug!(component = "io", event = "worker_stopped", worker);
                })?;
        }
        Ok(LocalStore {
            dir,
            submitter: Submitter { tx },
        })
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: FileId) -> PathBuf {
        self.dir.join(format!("{id}.{GENERATION_SUFFIX}"))
    }

    fn wrap(&self, (file, len): (File, u64)) -> Arc<dyn BlockFile> {
        Arc::new(LocalFile {
            file: Arc::new(Mutex::new(file)),
            len: AtomicU64::new(len),
            submitter: self.submitter.clone(),
        })
    }
}

impl BlockStore for LocalStore {
    fn create(&self, id: FileId) -> BoxFuture<'_, Result<Arc<dyn BlockFile>, IoError>> {
        let path = self.path(id);
        async move {
            let file = self
                .submitter
                .submit(|reply| Request::Create { path, reply })
                .await?;
            Ok(self.wrap(file))
        }
        .boxed()
    }

    fn open(&self, id: FileId) -> BoxFuture<'_, Result<Arc<dyn BlockFile>, IoError>> {
        let path = self.path(id);
        async move {
            let file = self
                .submitter
                .submit(|reply| Request::Open { path, reply })
                .await
                .map_err(|err| match err {
                    IoError::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                        IoError::NotFound(id)
                    }
                    err => err,
                })?;
            Ok(self.wrap(file))
        }
        .boxed()
    }

    fn remove(&self, id: FileId) -> BoxFuture<'_, Result<(), IoError>> {
        let path = self.path(id);
        async move {
            self.submitter
                .submit(|reply| Request::Remove { path, reply })
                .await
                .map_err(|err| match err {
                    IoError::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                        IoError::NotFound(id)
                    }
                    err => err,
                })
        }
        .boxed()
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<FileId>, IoError>> {
        let dir = self.dir.clone();
        async move {
            self.submitter
                .submit(|reply| Request::List { dir, reply })
                .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn files_round_trip_through_workers() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::with_workers(dir.path(), 2).unwrap();
        block_on(async {
            let id = FileId::new();
            let file = store.create(id).await.unwrap();
            file.write_at(0, Bytes::from_static(b"stratum")).await.unwrap();
            file.sync().await.unwrap();
            assert_eq!(file.len(), 7);

            let reopened = store.open(id).await.unwrap();
            assert_eq!(reopened.len(), 7);
            assert_eq!(reopened.read_at(3, 4).await.unwrap().as_ref(), b"atum");
            assert_eq!(store.list().await.unwrap(), vec![id]);

            store.remove(id).await.unwrap();
            assert!(matches!(store.open(id).await, Err(IoError::NotFound(_))));
            assert!(matches!(store.remove(id).await, Err(IoError::NotFound(_))));
        });
    }
}
