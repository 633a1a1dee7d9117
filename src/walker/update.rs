use futures_core::Stream;
use futures_util::stream;

use super::EntryOrder;
use crate::{
    entry::Entry,
    error::StorageError,
    fiber::Spawner,
    heap::MinHeap,
    layer::UpdateCursor,
    mvcc::SequenceNumber,
    observability::log_warn,
    repo::RepoView,
};

/// Yields every entry of a view with a sequence in `[from, to]`, in strictly
/// increasing sequence order, shadowed or not.
///
/// Fails with [`StorageError::Shutdown`] once the runner pool stops.
pub struct UpdateWalker {
    limit: SequenceNumber,
    spawner: Spawner,
    cursors: Vec<UpdateCursor>,
    heap: MinHeap<Entry, usize, EntryOrder>,
    current: Option<Entry>,
}

impl UpdateWalker {
    /// `to` is capped at the view's bound.
    pub async fn new(
        view: &RepoView,
        from: SequenceNumber,
        to: SequenceNumber,
        spawner: &Spawner,
    ) -> Result<Self, StorageError> {
        if spawner.is_shutdown() {
            return Err(StorageError::Shutdown);
        }
        let limit = to.min(view.bound());
        let mut cursors = Vec::new();
        if from <= limit {
            for layer in view.layers() {
                if layer.overlaps(from, limit) {
                    cursors.push(layer.update_cursor(from).await?);
                }
            }
        }
        let mut heap = MinHeap::with_capacity(cursors.len(), Entry::seq_order as EntryOrder);
        for (source, cursor) in cursors.iter().enumerate() {
            if let Some(entry) = cursor.current() {
                heap.insert(entry.clone(), source);
            }
        }
        let mut walker = UpdateWalker {
            limit,
            spawner: spawner.clone(),
            cursors,
            heap,
            current: None,
        };
        walker.settle().await?;
        Ok(walker)
    }

    /// Entry under the walker, `None` once exhausted or failed.
    pub fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    /// Whether the walker sits on an entry.
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    /// Move to the next sequence number in range.
    pub async fn advance(&mut self) -> Result<(), StorageError> {
        let Some(previous) = self.current.take() else {
            return Ok(());
        };
        if self.spawner.is_shutdown() {
            self.heap.clear();
            return Err(StorageError::Shutdown);
        }
        self.settle().await?;
        if let Some(entry) = &self.current {
            debug_assert!(
                previous.seq < entry.seq,
                "update walk went from {} to {}",
                previous.seq,
                entry.seq
            );
        }
        Ok(())
    }

    /// Stream of the remaining entries; ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Entry, StorageError>> + Send {
        stream::unfold(Some((self, false)), |state| async move {
            let (mut walker, started) = state?;
            if started {
                if let Err(err) = walker.advance().await {
                    return Some((Err(err), None));
                }
            }
            let entry = walker.current.clone()?;
            Some((Ok(entry), Some((walker, true))))
        })
    }

    async fn settle(&mut self) -> Result<(), StorageError> {
        let result = self.next_entry().await;
        if let Err(err) = &result {
            log_warn!(component = "walker", event = "update_walk_failed", error = %err);
            self.heap.clear();
            self.current = None;
        }
        result
    }

    async fn next_entry(&mut self) -> Result<(), StorageError> {
        match self.heap.peek() {
            Some((top, _)) if top.seq <= self.limit => {}
            _ => {
                self.heap.clear();
                return Ok(());
            }
        }
        let (entry, source) = self.heap.pop();
        let cursor = &mut self.cursors[source];
        cursor.advance().await?;
        if let Some(next) = cursor.current() {
            self.heap.insert(next.clone(), source);
        }
        self.current = Some(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::{executor::block_on, StreamExt};
    use ulid::Ulid;

    use super::*;
    use crate::{
        fiber::RunnerPool,
        id::RepoId,
        io::MemStore,
        key,
        key::IndexKey,
        layer::{DiskLayer, Layer, MemoryLayer},
        option::EngineOption,
        sort::{GenerationStore, SortManager},
    };

    fn put(k: i64, seq: u64) -> Entry {
        Entry::put(
            IndexKey::new(Ulid::from_parts(2, 2), key![k]),
            "v",
            SequenceNumber::new(seq),
        )
    }

    async fn layers(mut rng: fastrand::Rng) -> (Vec<Layer>, Vec<u64>) {
        let option = EngineOption::default()
            .sort_buffer_capacity(8)
            .block_size(128);
        let store = Arc::new(GenerationStore::new(Arc::new(MemStore::new()), 128));
        let mut seqs = Vec::new();
        let mut layers = Vec::new();
        let mut seq = 0;
        for _ in 0..3 {
            let mut manager = SortManager::new(store.clone(), &option, Entry::key_order);
            for _ in 0..25 {
                seq += 1;
                seqs.push(seq);
                manager.emplace(put(rng.i64(0..10), seq)).await.unwrap();
            }
            let generations = manager.seal().await.unwrap();
            layers.push(Layer::Disk(Arc::new(DiskLayer::new(
                generations,
                store.clone(),
                &option,
            ))));
        }
        let memory = MemoryLayer::new();
        for _ in 0..10 {
            seq += 1;
            seqs.push(seq);
            memory.append(put(rng.i64(0..10), seq)).unwrap();
        }
        layers.push(Layer::Memory(Arc::new(memory)));
        // interleave layers so their order carries no meaning
        rng.shuffle(&mut layers);
        (layers, seqs)
    }

    fn pool() -> RunnerPool {
        RunnerPool::new(&EngineOption::default().runners(1)).unwrap()
    }

    #[test]
    fn yields_every_entry_once_in_order() {
        let pool = pool();
        let spawner = pool.spawner();
        block_on(async {
            let (layers, seqs) = layers(fastrand::Rng::with_seed(11)).await;
            let view = RepoView::new(RepoId::next(), SequenceNumber::new(1000), layers);
            let walker =
                UpdateWalker::new(&view, SequenceNumber::new(20), SequenceNumber::MAX, &spawner)
                    .await
                    .unwrap();
            let seen: Vec<u64> = walker
                .into_stream()
                .map(|entry| entry.unwrap().seq.get())
                .collect()
                .await;
            let expected: Vec<u64> = seqs.into_iter().filter(|seq| *seq >= 20).collect();
            assert_eq!(seen, expected);
        });
    }

    #[test]
    fn range_is_capped_by_bound() {
        let pool = pool();
        let spawner = pool.spawner();
        block_on(async {
            let (layers, _) = layers(fastrand::Rng::with_seed(5)).await;
            let view = RepoView::new(RepoId::next(), SequenceNumber::new(60), layers);
            let from = SequenceNumber::new(50);
            let mut walker = UpdateWalker::new(&view, from, SequenceNumber::new(70), &spawner)
                .await
                .unwrap();
            let mut seen = Vec::new();
            while let Some(entry) = walker.current() {
                seen.push(entry.seq.get());
                walker.advance().await.unwrap();
            }
            assert_eq!(seen, (50..=60).collect::<Vec<_>>());

            let from = SequenceNumber::new(61);
            let empty = UpdateWalker::new(&view, from, SequenceNumber::new(70), &spawner)
                .await
                .unwrap();
            assert!(!empty.is_valid());
        });
    }

    #[test]
    fn shutdown_stops_a_running_walk() {
        let pool = pool();
        let spawner = pool.spawner();
        block_on(async {
            let (layers, _) = layers(fastrand::Rng::with_seed(7)).await;
            let view = RepoView::new(RepoId::next(), SequenceNumber::new(1000), layers);
            let mut walker =
                UpdateWalker::new(&view, SequenceNumber::MIN, SequenceNumber::MAX, &spawner)
                    .await
                    .unwrap();
            assert_eq!(walker.current().map(|entry| entry.seq.get()), Some(1));

            pool.shutdown();
            assert!(matches!(walker.advance().await, Err(StorageError::Shutdown)));
            assert!(!walker.is_valid());
            // exhausted walkers stay quiet
            assert!(walker.advance().await.is_ok());
            assert!(matches!(
                UpdateWalker::new(&view, SequenceNumber::MIN, SequenceNumber::MAX, &spawner).await,
                Err(StorageError::Shutdown)
            ));
        });
    }
}
