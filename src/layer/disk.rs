use std::{fmt, sync::Arc};

use crate::{
    entry::Entry,
    error::StorageError,
    id::LayerId,
    key::IndexKey,
    mvcc::{SeqBounds, SequenceNumber},
    option::EngineOption,
    sort::{Comparator, Generation, GenerationStore, SortCursor, SortManager},
};

/// An immutable layer made of the generations a sort manager sealed.
pub struct DiskLayer {
    id: LayerId,
    generations: Vec<Arc<Generation>>,
    bounds: Option<SeqBounds>,
    count: u64,
    store: Arc<GenerationStore>,
    option: EngineOption,
}

impl DiskLayer {
    /// Disk layer over sealed generations.
    pub fn new(
        generations: Vec<Arc<Generation>>,
        store: Arc<GenerationStore>,
        option: &EngineOption,
    ) -> Self {
        let bounds = generations
            .iter()
            .fold(None, |acc, generation| SeqBounds::union(acc, generation.bounds()));
        let count = generations.iter().map(|generation| generation.count()).sum();
        DiskLayer {
            id: LayerId::next(),
            generations,
            bounds,
            count,
            store,
            option: option.clone(),
        }
    }

    /// Process-unique layer id.
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Sequence bounds over every generation.
    pub fn bounds(&self) -> Option<SeqBounds> {
        self.bounds
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Whether the layer holds no entry.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Generations holding the entries.
    pub fn generations(&self) -> &[Arc<Generation>] {
        &self.generations
    }

    /// Hand the layer's files to the cleaner once the last reader is gone.
    pub fn retire(&self) {
        for generation in &self.generations {
            generation.retire();
        }
    }

    /// Merge cursor over every generation in layer order, positioned at the
    /// first entry not less than `probe`.
    pub(crate) async fn key_cursor(
        &self,
        probe: Option<&Entry>,
    ) -> Result<SortCursor<Entry>, StorageError> {
        let cmp: Comparator<Entry> = Arc::new(Entry::key_order);
        SortCursor::open(
            Arc::new(Vec::new()),
            &self.generations,
            cmp,
            self.option.read_ahead_frames,
            probe,
        )
        .await
    }
}

impl fmt::Debug for DiskLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskLayer")
            .field("id", &self.id)
            .field("generations", &self.generations.len())
            .field("count", &self.count)
            .field("bounds", &self.bounds)
            .finish()
    }
}

/// Key-order cursor over a disk layer.
pub struct DiskCursor {
    inner: SortCursor<Entry>,
}

impl DiskCursor {
    pub(crate) async fn seek(layer: &DiskLayer, key: &IndexKey) -> Result<Self, StorageError> {
        // the newest possible version sorts first among the versions of a key
        let probe = Entry::tombstone(key.clone(), SequenceNumber::MAX);
        let inner = layer.key_cursor(Some(&probe)).await?;
        Ok(DiskCursor { inner })
    }

    /// Entry under the cursor.
    pub fn current(&self) -> Option<&Entry> {
        self.inner.current()
    }

    /// Move to the next entry.
    pub async fn advance(&mut self) -> Result<(), StorageError> {
        self.inner.advance().await
    }
}

/// Sequence-order cursor over a disk layer.
///
/// Generations are sorted by key, so the layer's entries from `from` on are
/// re-sorted by sequence through a private sort manager. Its spill files are
/// retired when the cursor is dropped.
pub struct DiskUpdateCursor {
    manager: SortManager<Entry>,
    inner: SortCursor<Entry>,
}

impl DiskUpdateCursor {
    pub(crate) async fn seek(layer: &DiskLayer, from: SequenceNumber) -> Result<Self, StorageError> {
        let mut manager = SortManager::new(layer.store.clone(), &layer.option, Entry::seq_order);
        match Self::fill(layer, from, &mut manager).await {
            Ok(inner) => Ok(DiskUpdateCursor { manager, inner }),
            Err(err) => {
                manager.clear();
                Err(err)
            }
        }
    }

    async fn fill(
        layer: &DiskLayer,
        from: SequenceNumber,
        manager: &mut SortManager<Entry>,
    ) -> Result<SortCursor<Entry>, StorageError> {
        let mut source = layer.key_cursor(None).await?;
        while let Some(entry) = source.next().await? {
            if entry.seq >= from {
                manager.emplace(entry).await?;
            }
        }
        manager.cursor().await
    }

    /// Entry under the cursor.
    pub fn current(&self) -> Option<&Entry> {
        self.inner.current()
    }

    /// Move to the next entry.
    pub async fn advance(&mut self) -> Result<(), StorageError> {
        self.inner.advance().await
    }
}

impl Drop for DiskUpdateCursor {
    fn drop(&mut self) {
        self.manager.clear();
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use ulid::Ulid;

    use super::*;
    use crate::{cleaner::Cleaner, io::MemStore, key};

    fn ik(a: i64) -> IndexKey {
        IndexKey::new(Ulid::from_parts(3, 3), key![a])
    }

    async fn layer(entries: Vec<Entry>) -> (DiskLayer, Arc<MemStore>, Cleaner) {
        let mem = Arc::new(MemStore::new());
        let option = EngineOption::default()
            .sort_buffer_capacity(3)
            .consolidation_threshold(4);
        let (cleaner, clean_tx) = Cleaner::new(mem.clone());
        let store = Arc::new(GenerationStore::new(mem.clone(), 96).with_cleaner(clean_tx));
        let mut manager = SortManager::new(store.clone(), &option, Entry::key_order);
        for entry in entries {
            manager.emplace(entry).await.unwrap();
        }
        let generations = manager.seal().await.unwrap();
        (DiskLayer::new(generations, store, &option), mem, cleaner)
    }

    fn sample() -> Vec<Entry> {
        (0..10)
            .map(|i| Entry::put(ik(i % 4), format!("v{i}"), SequenceNumber::new(10 - i as u64)))
            .collect()
    }

    #[test]
    fn seek_lands_on_newest_version() {
        block_on(async {
            let (layer, _, _) = layer(sample()).await;
            assert_eq!(layer.len(), 10);
            assert_eq!(
                layer.bounds(),
                Some(SeqBounds {
                    lowest: SequenceNumber::new(1),
                    highest: SequenceNumber::new(10)
                })
            );

            let mut cursor = DiskCursor::seek(&layer, &ik(2)).await.unwrap();
            let mut seen = Vec::new();
            while let Some(entry) = cursor.current() {
                seen.push((entry.key.key.fields()[0].as_int().unwrap(), entry.seq.get()));
                cursor.advance().await.unwrap();
            }
            // key 2 holds i = 2, 6; key 3 holds i = 3, 7
            assert_eq!(seen, vec![(2, 8), (2, 4), (3, 7), (3, 3)]);
        });
    }

    #[test]
    fn update_cursor_resorts_by_sequence() {
        block_on(async {
            let (layer, mem, cleaner) = layer(sample()).await;
            // drop the files of the consolidated inputs first
            cleaner.collect().await.unwrap();
            let files = mem.file_count();
            let mut cursor = DiskUpdateCursor::seek(&layer, SequenceNumber::new(4))
                .await
                .unwrap();
            let mut seqs = Vec::new();
            while let Some(entry) = cursor.current() {
                seqs.push(entry.seq.get());
                cursor.advance().await.unwrap();
            }
            assert_eq!(seqs, (4..=10).collect::<Vec<_>>());
            // seven entries through a buffer of three spill two generations
            assert_eq!(mem.file_count(), files + 2);
            drop(cursor);
            assert_eq!(cleaner.collect().await.unwrap(), 2);
            assert_eq!(mem.file_count(), files);
        });
    }
}
