//! Repositories: the layer set of one keyspace and its commit path.
//!
//! Commits land in the unsealed memory layer. When the seal trigger fires the
//! layer is sealed and replaced; sealed layers are later pushed through a
//! sort manager into disk layers, and disk layers are merged once enough of
//! them pile up. Every change to the layer set is a single swap under the
//! set's lock, so a [`RepoView`] always sees each entry exactly once.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    entry::Entry,
    error::StorageError,
    id::{LayerId, RepoId},
    key::IndexKey,
    layer::{DiskLayer, Layer, MemoryLayer, SealedLayer},
    mvcc::{SequenceClock, SequenceNumber},
    observability::{log_debug, log_info},
    option::EngineOption,
    sort::{abandon_writer, Comparator, Generation, GenerationStore, SortCursor, SortManager},
    trigger::{FreezeTrigger, TriggerFactory},
};

/// Rejected commit.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitError {
    /// The sequence does not advance the repository.
    #[error("repo commit error: sequence {seq} is not above the high-water mark {high_water:?}")]
    OutOfOrder {
        /// Rejected sequence.
        seq: SequenceNumber,
        /// Last accepted sequence.
        high_water: Option<SequenceNumber>,
    },
    /// The target memory layer was sealed meanwhile.
    #[error(transparent)]
    Sealed(#[from] SealedLayer),
}

/// The layers of a repository captured at one sequence bound.
#[derive(Debug, Clone)]
pub struct RepoView {
    repo: RepoId,
    bound: SequenceNumber,
    layers: Vec<Layer>,
}

impl RepoView {
    pub(crate) fn new(repo: RepoId, bound: SequenceNumber, layers: Vec<Layer>) -> Self {
        RepoView {
            repo,
            bound,
            layers,
        }
    }

    /// Repository the view was taken from.
    pub fn repo(&self) -> RepoId {
        self.repo
    }

    /// Entries with a greater sequence are invisible through this view.
    pub fn bound(&self) -> SequenceNumber {
        self.bound
    }

    /// Layers, newest first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Ids of [`RepoView::layers`], in the same order.
    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.iter().map(Layer::id).collect()
    }
}

struct LayerSet {
    memory: Arc<MemoryLayer>,
    sealed: Vec<Arc<MemoryLayer>>,
    disk: Vec<Arc<DiskLayer>>,
}

impl LayerSet {
    fn layers(&self) -> Vec<Layer> {
        let mut layers = Vec::with_capacity(1 + self.sealed.len() + self.disk.len());
        layers.push(Layer::Memory(self.memory.clone()));
        layers.extend(self.sealed.iter().cloned().map(Layer::Memory));
        layers.extend(self.disk.iter().cloned().map(Layer::Disk));
        layers
    }
}

/// An ordered, multi-versioned key space: one active memory layer, sealed
/// layers waiting for a flush, and immutable disk layers.
pub struct Repository {
    id: RepoId,
    parent: Option<Arc<Repository>>,
    clock: SequenceClock,
    commit: Mutex<()>,
    layers: RwLock<LayerSet>,
    trigger: Arc<dyn FreezeTrigger>,
    generations: Arc<GenerationStore>,
    option: EngineOption,
    maintenance: async_lock::Mutex<()>,
}

impl Repository {
    /// Empty repository stacked on `parent`.
    pub fn new(
        id: RepoId,
        parent: Option<Arc<Repository>>,
        option: &EngineOption,
        generations: Arc<GenerationStore>,
    ) -> Self {
        Repository {
            id,
            parent,
            clock: SequenceClock::default(),
            commit: Mutex::new(()),
            layers: RwLock::new(LayerSet {
                memory: Arc::new(MemoryLayer::new()),
                sealed: Vec::new(),
                disk: Vec::new(),
            }),
            trigger: TriggerFactory::create(option.seal_trigger),
            generations,
            option: option.clone(),
            maintenance: async_lock::Mutex::new(()),
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> RepoId {
        self.id
    }

    /// Repository this one is stacked on.
    pub fn parent(&self) -> Option<&Arc<Repository>> {
        self.parent.as_ref()
    }

    /// Commit a value under the next sequence number.
    pub fn commit(
        &self,
        key: IndexKey,
        value: impl Into<Bytes>,
    ) -> Result<SequenceNumber, CommitError> {
        let value = value.into();
        self.append_next(|seq| Entry::put(key, value, seq))
    }

    /// Commit a tombstone under the next sequence number.
    pub fn remove(&self, key: IndexKey) -> Result<SequenceNumber, CommitError> {
        self.append_next(|seq| Entry::tombstone(key, seq))
    }

    /// Accept an entry whose sequence number was assigned elsewhere, e.g. by a
    /// replication feed. The sequence must be above the high-water mark.
    pub fn apply(&self, entry: Entry) -> Result<(), CommitError> {
        let exceeded = {
            let _commit = self.lock_commit();
            if !self.clock.observe(entry.seq) {
                return Err(CommitError::OutOfOrder {
                    seq: entry.seq,
                    high_water: self.clock.high_water_mark(),
                });
            }
            self.append(entry)?
        };
        if exceeded {
            self.seal_memory();
        }
        Ok(())
    }

    fn append_next(
        &self,
        build: impl FnOnce(SequenceNumber) -> Entry,
    ) -> Result<SequenceNumber, CommitError> {
        let (seq, exceeded) = {
            let _commit = self.lock_commit();
            let entry = build(self.clock.allocate());
            let seq = entry.seq;
            (seq, self.append(entry)?)
        };
        if exceeded {
            self.seal_memory();
        }
        Ok(seq)
    }

    fn append(&self, entry: Entry) -> Result<bool, SealedLayer> {
        let exceeded = self.trigger.check_if_exceed(&entry);
        self.read_layers().memory.append(entry)?;
        Ok(exceeded)
    }

    /// Sequence of the last commit, `None` before the first.
    pub fn high_water_mark(&self) -> Option<SequenceNumber> {
        self.clock.high_water_mark()
    }

    /// View at the current high-water mark.
    pub fn snapshot(&self) -> RepoView {
        let _commit = self.lock_commit();
        let bound = self.clock.high_water_mark().unwrap_or(SequenceNumber::MIN);
        self.view(bound)
    }

    /// Layers as of now, with visibility capped at `bound`.
    pub fn view(&self, bound: SequenceNumber) -> RepoView {
        RepoView::new(self.id, bound, self.read_layers().layers())
    }

    /// Memory, sealed and disk layers together.
    pub fn layer_count(&self) -> usize {
        let set = self.read_layers();
        1 + set.sealed.len() + set.disk.len()
    }

    /// Number of disk layers.
    pub fn disk_layer_count(&self) -> usize {
        self.read_layers().disk.len()
    }

    /// Seal the memory layer and install a fresh one. Returns `false` when
    /// the memory layer is empty.
    pub fn seal_memory(&self) -> bool {
        let mut set = self.write_layers();
        if set.memory.is_empty() {
            return false;
        }
        let fresh = Arc::new(MemoryLayer::new());
        let sealed = std::mem::replace(&mut set.memory, fresh);
        sealed.seal();
        self.trigger.reset();
        log_info!(
            component = "repo",
            event = "memory_layer_sealed",
            repo = %self.id,
            layer = %sealed.id(),
            entries = sealed.len(),
            bytes = sealed.approx_bytes(),
        );
        set.sealed.push(sealed);
        true
    }

    /// Seal the memory layer and turn every sealed layer into a disk layer.
    pub async fn flush_memory(&self) -> Result<(), StorageError> {
        let _maintenance = self.maintenance.lock().await;
        self.seal_memory();
        self.flush_sealed().await
    }

    /// Merge the disk layers into one once `disk_merge_threshold` of them
    /// exist. Returns whether a merge happened.
    pub async fn merge_disk_layers(&self) -> Result<bool, StorageError> {
        let _maintenance = self.maintenance.lock().await;
        self.merge_disk().await
    }

    /// Flush sealed layers and merge disk layers when due.
    pub async fn maybe_flush(&self) -> Result<(), StorageError> {
        let _maintenance = self.maintenance.lock().await;
        self.flush_sealed().await?;
        self.merge_disk().await?;
        Ok(())
    }

    async fn flush_sealed(&self) -> Result<(), StorageError> {
        let sealed = self.read_layers().sealed.clone();
        for layer in sealed {
            let disk = self.spill(&layer).await?;
            {
                let mut set = self.write_layers();
                set.sealed.retain(|other| other.id() != layer.id());
                if let Some(disk) = &disk {
                    set.disk.push(disk.clone());
                }
            }
            log_info!(
                component = "repo",
                event = "memory_layer_flushed",
                repo = %self.id,
                layer = %layer.id(),
                disk_layer = ?disk.as_ref().map(|disk| disk.id()),
                entries = layer.len(),
            );
        }
        Ok(())
    }

    async fn spill(&self, layer: &MemoryLayer) -> Result<Option<Arc<DiskLayer>>, StorageError> {
        if layer.is_empty() {
            return Ok(None);
        }
        let entries: Vec<Entry> = layer.entries().collect();
        let mut manager = SortManager::new(self.generations.clone(), &self.option, Entry::key_order);
        match spill_into(entries, &mut manager).await {
            Ok(generations) => Ok(Some(Arc::new(DiskLayer::new(
                generations,
                self.generations.clone(),
                &self.option,
            )))),
            Err(err) => {
                manager.clear();
                Err(err)
            }
        }
    }

    async fn merge_disk(&self) -> Result<bool, StorageError> {
        let inputs = self.read_layers().disk.clone();
        if inputs.len() < self.option.disk_merge_threshold.max(2) {
            return Ok(false);
        }
        let sources: Vec<Arc<Generation>> = inputs
            .iter()
            .flat_map(|layer| layer.generations().iter().cloned())
            .collect();
        let cmp: Comparator<Entry> = Arc::new(Entry::key_order);
        let mut cursor = SortCursor::open(
            Arc::new(Vec::new()),
            &sources,
            cmp,
            self.option.read_ahead_frames,
            None,
        )
        .await?;
        let mut writer = self.generations.writer().await?;
        loop {
            let pushed = match cursor.next().await {
                Ok(Some(entry)) => writer.push(&entry).await,
                Ok(None) => break,
                Err(err) => Err(err),
            };
            if let Err(err) = pushed {
                abandon_writer(writer).await;
                return Err(err);
            }
        }
        let merged = writer.finish().await?;
        let merged = Arc::new(DiskLayer::new(
            vec![merged],
            self.generations.clone(),
            &self.option,
        ));

        {
            let mut set = self.write_layers();
            set.disk
                .retain(|layer| !inputs.iter().any(|input| input.id() == layer.id()));
            set.disk.push(merged.clone());
        }
        // views taken before the swap keep the inputs readable
        for input in &inputs {
            input.retire();
        }
        log_info!(
            component = "repo",
            event = "disk_layers_merged",
            repo = %self.id,
            inputs = inputs.len(),
            layer = %merged.id(),
            entries = merged.len(),
        );
        Ok(true)
    }

    fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.commit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_layers(&self) -> RwLockReadGuard<'_, LayerSet> {
        self.layers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_layers(&self) -> RwLockWriteGuard<'_, LayerSet> {
        self.layers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn spill_into(
    entries: Vec<Entry>,
    manager: &mut SortManager<Entry>,
) -> Result<Vec<Arc<Generation>>, StorageError> {
    for entry in entries {
        manager.emplace(entry).await?;
    }
    manager.seal().await
}

impl Drop for Repository {
    fn drop(&mut self) {
        log_debug!(component = "repo", event = "repository_dropped", repo = %self.id);
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|parent| parent.id))
            .field("high_water_mark", &self.high_water_mark())
            .field("layers", &self.layer_count())
            .finish()
    }
}
