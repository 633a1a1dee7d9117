#![deny(missing_docs)]

//! Storage core of a layered, multi-versioned key-value engine.
//!
//! Writes land in a repository's memory layer and are pushed through a
//! bounded-memory external sort into immutable disk layers. Reads merge every
//! layer of a snapshot with a K-way [`heap::MinHeap`], keeping per key the
//! newest entry visible at the snapshot's sequence bound. Disk work runs in
//! frames of a cooperative [`fiber::RunnerPool`], so waiting on a block read
//! never parks a runner thread.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stratum::{io::MemStore, key, key::IndexKey, Context, Engine, EngineOption};
//! use ulid::Ulid;
//!
//! let engine = Engine::open(Arc::new(MemStore::new()), EngineOption::default()).unwrap();
//! let repo = engine.create_repo(None);
//! let name = IndexKey::new(Ulid::nil(), key!["ada"]);
//! repo.commit(name.clone(), "lovelace").unwrap();
//!
//! let context = Context::new(&repo, engine.spawner());
//! let value = futures::executor::block_on(context.get(&name)).unwrap();
//! assert_eq!(value.as_deref(), Some(&b"lovelace"[..]));
//! ```

mod observability;

/// Deferred removal of retired generation files.
pub mod cleaner;
/// Queries over a repository chain.
pub mod context;
/// Repository management: runner pool, generation store, registry.
pub mod engine;
/// Versioned entries and their orderings.
pub mod entry;
/// Storage error taxonomy.
pub mod error;
/// Cooperative M:N runtime.
pub mod fiber;
/// Fixed-capacity K-way merge heap.
pub mod heap;
/// Identifiers.
pub mod id;
/// Block storage.
pub mod io;
/// Typed keys, patterns and ranges.
pub mod key;
/// Memory and disk layers.
pub mod layer;
/// Sequence numbers.
pub mod mvcc;
/// Engine tunables.
pub mod option;
/// Non-owning lookup registry.
pub mod registry;
/// Repositories and their views.
pub mod repo;
/// Record encoding.
pub mod serdes;
/// External sort into generations.
pub mod sort;
/// Memory layer seal triggers.
pub mod trigger;
/// Present and update walkers.
pub mod walker;

pub use crate::{
    context::{Context, ContextWalker},
    engine::{Engine, EngineError},
    entry::Entry,
    error::{ErrorKind, StorageError},
    fiber::{RunnerPool, Spawner},
    key::{Field, IndexKey, Key, KeyPattern, KeyRange, PatternField},
    mvcc::SequenceNumber,
    option::EngineOption,
    repo::{CommitError, RepoView, Repository},
    walker::{PresentWalker, UpdateWalker, WalkOptions},
};
