//! Block I/O consumed by generations.
//!
//! A [`BlockStore`] maps file ids to [`BlockFile`]s supporting positioned
//! reads and writes. Every operation returns a boxed future so that a frame
//! waiting on a device suspends instead of blocking its runner.

mod codec;
mod local;
mod mem;

use std::{io, sync::Arc};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;

pub use codec::{BlockCodec, CodecError, Uncompressed};
pub use local::LocalStore;
pub use mem::{Fault, MemStore};

use crate::{error::StorageError, id::FileId};

/// Positioned reads and writes on one file.
pub trait BlockFile: Send + Sync {
    /// Read exactly `len` bytes at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Bytes, IoError>>;

    /// Write `data` at `offset`, growing the file as needed.
    fn write_at(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), IoError>>;

    /// Flush written data to the device.
    fn sync(&self) -> BoxFuture<'_, Result<(), IoError>>;

    /// Current length in bytes.
    fn len(&self) -> u64;

    /// Whether the file holds no byte.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Directory of block files keyed by [`FileId`].
pub trait BlockStore: Send + Sync {
    /// Create (or truncate) the file for `id`.
    fn create(&self, id: FileId) -> BoxFuture<'_, Result<Arc<dyn BlockFile>, IoError>>;

    /// Open an existing file.
    fn open(&self, id: FileId) -> BoxFuture<'_, Result<Arc<dyn BlockFile>, IoError>>;

    /// Remove a file; [`IoError::NotFound`] if it does not exist.
    fn remove(&self, id: FileId) -> BoxFuture<'_, Result<(), IoError>>;

    /// Ids of every stored file.
    fn list(&self) -> BoxFuture<'_, Result<Vec<FileId>, IoError>>;
}

/// Failure of a block store operation.
#[derive(Debug, Error)]
pub enum IoError {
    /// Retryable I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The device failed.
    #[error("io device failure: {0}")]
    Failure(String),
    /// No file exists for the id.
    #[error("io error: file {0} not found")]
    NotFound(FileId),
    /// The store's I/O threads are gone.
    #[error("io error: block store is shut down")]
    Shutdown,
}

impl From<IoError> for StorageError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Io(err) => StorageError::Disk(err),
            IoError::Failure(reason) => StorageError::DiskFailure(reason),
            IoError::NotFound(id) => StorageError::Disk(io::Error::new(
                io::ErrorKind::NotFound,
                format!("file {id} not found"),
            )),
            IoError::Shutdown => StorageError::Shutdown,
        }
    }
}

pub(crate) const GENERATION_SUFFIX: &str = "gen";

pub(crate) fn parse_file_id(file_name: &str) -> Option<FileId> {
    file_name
        .strip_suffix(&format!(".{GENERATION_SUFFIX}"))
        .and_then(|stem| stem.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn io_errors_map_to_storage_kinds() {
        let disk: StorageError = IoError::Io(io::Error::new(io::ErrorKind::Other, "eio")).into();
        assert_eq!(disk.kind(), ErrorKind::Disk);
        let failure: StorageError = IoError::Failure("dead".into()).into();
        assert_eq!(failure.kind(), ErrorKind::DiskFailure);
        let shutdown: StorageError = IoError::Shutdown.into();
        assert_eq!(shutdown.kind(), ErrorKind::Shutdown);
    }

    #[test]
    fn file_names() {
        let id = FileId::new();
        assert_eq!(parse_file_id(&format!("{id}.gen")), Some(id));
        assert_eq!(parse_file_id("notes.txt"), None);
    }
}
