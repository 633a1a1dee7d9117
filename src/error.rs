use std::io;

use thiserror::Error;

use crate::id::FileId;

/// Classification of a [`StorageError`] used by callers to decide on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recoverable I/O failure, including corrupt or truncated disk data.
    Disk,
    /// Device-level failure; the operation will not succeed on retry.
    DiskFailure,
    /// The engine is stopping.
    Shutdown,
    /// A bug: a frame panicked or an internal invariant broke.
    Logic,
}

/// Errors surfaced by walkers, the sort manager and repositories.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Retryable I/O failure.
    #[error("storage disk error: {0}")]
    Disk(#[from] io::Error),
    /// A generation failed checksum or decode validation.
    #[error("storage corrupt generation {file}: {reason}")]
    Corrupt {
        /// Generation file that failed validation.
        file: FileId,
        /// Human readable description of the failure.
        reason: String,
    },
    /// Non-retryable device failure.
    #[error("storage disk failure: {0}")]
    DiskFailure(String),
    /// The engine is shutting down.
    #[error("storage service is shutting down")]
    Shutdown,
    /// A frame doing the work panicked.
    #[error("storage logic error: {0}")]
    Logic(String),
}

impl StorageError {
    /// Coarse classification of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Disk(_) | StorageError::Corrupt { .. } => ErrorKind::Disk,
            StorageError::DiskFailure(_) => ErrorKind::DiskFailure,
            StorageError::Shutdown => ErrorKind::Shutdown,
            StorageError::Logic(_) => ErrorKind::Logic,
        }
    }

    /// Whether the failed read may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Disk
    }

    /// Build a duplicate of the error for fan-out to several waiters.
    ///
    /// `io::Error` is not `Clone`, so the copy keeps the kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            StorageError::Disk(err) => StorageError::Disk(io::Error::new(err.kind(), err.to_string())),
            StorageError::Corrupt { file, reason } => StorageError::Corrupt {
                file: *file,
                reason: reason.clone(),
            },
            StorageError::DiskFailure(reason) => StorageError::DiskFailure(reason.clone()),
            StorageError::Shutdown => StorageError::Shutdown,
            StorageError::Logic(reason) => StorageError::Logic(reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let disk = StorageError::Disk(io::Error::new(io::ErrorKind::Other, "eio"));
        assert!(disk.is_retryable());
        let corrupt = StorageError::Corrupt {
            file: FileId::nil(),
            reason: "bad crc".into(),
        };
        assert_eq!(corrupt.kind(), ErrorKind::Disk);
        assert!(!StorageError::DiskFailure("gone".into()).is_retryable());
        assert_eq!(StorageError::Shutdown.kind(), ErrorKind::Shutdown);
        let logic = StorageError::Logic("frame panicked".into());
        assert_eq!(logic.kind(), ErrorKind::Logic);
        assert!(!logic.is_retryable());
    }

    #[test]
    fn duplicate_keeps_kind() {
        let err = StorageError::Disk(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        match err.duplicate() {
            StorageError::Disk(copy) => assert_eq!(copy.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other:?}"),
        }
    }
}
