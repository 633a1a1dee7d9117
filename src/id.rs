use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use ulid::{Generator, Ulid};

/// Identifier used for generation files and other persisted artifacts.
pub type FileId = Ulid;

/// Identifier of one secondary index; keys of different indexes never interleave.
pub type IndexId = Ulid;

/// Thread-safe ULID generator scoped to a single engine instance.
pub struct FileIdGenerator {
    inner: Mutex<Generator>,
}

impl FileIdGenerator {
    /// Create a new generator seeded with the current time.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Produce the next [`FileId`] in a monotonic, time-ordered sequence.
    pub fn generate(&self) -> FileId {
        let mut guard = self
            .inner
            .lock()
            .expect("file id generator mutex should not be poisoned");
        guard
            .generate()
            .expect("file id generator should advance without error")
    }
}

impl Default for FileIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileIdGenerator").finish_non_exhaustive()
    }
}

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Allocate a process-unique identifier.
            pub fn next() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            /// Raw value of the identifier.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

counter_id!(
    /// Identity of a repository inside one process.
    RepoId
);

counter_id!(
    /// Identity of a layer; used as the registry and cursor-ownership key.
    LayerId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ids_are_monotonic() {
        let gen = FileIdGenerator::new();
        let a = gen.generate();
        let b = gen.generate();
        assert!(a < b);
    }

    #[test]
    fn counter_ids_are_unique() {
        let a = RepoId::next();
        let b = RepoId::next();
        assert_ne!(a, b);
        assert!(LayerId::next().get() > 0);
    }
}
