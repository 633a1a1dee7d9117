//! Bounded-memory external sort.
//!
//! Records are emplaced into an in-memory buffer. A full buffer is sorted
//! (in parallel above a size threshold) and spilled as a generation at index
//! 0. Once an index holds `consolidation_threshold` generations they are
//! merged into a single generation at the next index, which bounds the number
//! of runs a cursor has to merge. At most one group is consolidated per flush.

mod cursor;
mod generation;

use std::{cmp::Ordering, collections::BTreeMap, fmt, sync::Arc};

use rayon::slice::ParallelSliceMut;

pub use cursor::SortCursor;
pub use generation::{Generation, GenerationStore, GenerationWriter};

use crate::{
    error::StorageError,
    mvcc::SequenceNumber,
    observability::{log_debug, log_info, log_warn},
    option::EngineOption,
    serdes::{Decode, Encode},
};

/// A record that can be spilled into generations.
pub trait GenerationRecord: Encode + Decode + Clone + Send + Sync + 'static {
    /// Sequence number used for the generation's `[lowest, highest]` bounds.
    fn sequence(&self) -> Option<SequenceNumber> {
        None
    }
}

/// Shared record ordering.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Sorts an unbounded stream of records with a bounded buffer, spilling
/// sorted runs into generations.
pub struct SortManager<T: GenerationRecord> {
    store: Arc<GenerationStore>,
    cmp: Comparator<T>,
    buffer: Arc<Vec<T>>,
    sorted: bool,
    capacity: usize,
    parallel_sort_threshold: usize,
    consolidation_threshold: usize,
    read_ahead_frames: usize,
    groups: BTreeMap<usize, Vec<Arc<Generation>>>,
}

impl<T: GenerationRecord> SortManager<T> {
    /// # Panics
    ///
    /// Panics if the consolidation threshold or buffer capacity is zero.
    pub fn new<C>(store: Arc<GenerationStore>, option: &EngineOption, cmp: C) -> Self
    where
        C: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        assert!(
            option.consolidation_threshold > 0,
            "consolidation threshold must be positive"
        );
        assert!(
            option.sort_buffer_capacity > 0,
            "sort buffer capacity must be positive"
        );
        SortManager {
            store,
            cmp: Arc::new(cmp),
            buffer: Arc::new(Vec::with_capacity(option.sort_buffer_capacity)),
            sorted: true,
            capacity: option.sort_buffer_capacity,
            parallel_sort_threshold: option.parallel_sort_threshold,
            consolidation_threshold: option.consolidation_threshold,
            read_ahead_frames: option.read_ahead_frames,
            groups: BTreeMap::new(),
        }
    }

    /// Add one record. A full buffer is flushed first.
    pub async fn emplace(&mut self, value: T) -> Result<(), StorageError> {
        if self.buffer.len() >= self.capacity {
            self.flush().await?;
        }
        Arc::make_mut(&mut self.buffer).push(value);
        self.sorted = false;
        Ok(())
    }

    /// Total records: buffered plus spilled.
    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
            + self
                .groups
                .values()
                .flatten()
                .map(|generation| generation.count())
                .sum::<u64>()
    }

    /// Whether nothing was emplaced.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records not yet spilled.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of generations per consolidation index.
    pub fn generation_summary(&self) -> BTreeMap<usize, usize> {
        self.groups
            .iter()
            .map(|(index, generations)| (*index, generations.len()))
            .collect()
    }

    /// All generations, lowest index first.
    pub fn generations(&self) -> Vec<Arc<Generation>> {
        self.groups.values().flatten().cloned().collect()
    }

    /// Ordered view over everything emplaced so far.
    pub async fn cursor(&mut self) -> Result<SortCursor<T>, StorageError> {
        self.open_cursor(None).await
    }

    /// Ordered view starting at the first record not less than `probe`.
    pub async fn cursor_from(&mut self, probe: &T) -> Result<SortCursor<T>, StorageError> {
        self.open_cursor(Some(probe)).await
    }

    /// Spill the buffer and hand out every generation.
    pub async fn seal(&mut self) -> Result<Vec<Arc<Generation>>, StorageError> {
        self.flush().await?;
        Ok(self.generations())
    }

    /// Drop the buffer and retire every generation.
    pub fn clear(&mut self) {
        self.buffer = Arc::new(Vec::with_capacity(self.capacity));
        self.sorted = true;
        for generation in self.groups.values().flatten() {
            generation.retire();
        }
        self.groups.clear();
    }

    async fn open_cursor(&mut self, probe: Option<&T>) -> Result<SortCursor<T>, StorageError> {
        self.sort_buffer();
        SortCursor::open(
            self.buffer.clone(),
            &self.generations(),
            self.cmp.clone(),
            self.read_ahead_frames,
            probe,
        )
        .await
    }

    fn sort_buffer(&mut self) {
        if self.sorted {
            return;
        }
        let cmp = self.cmp.clone();
        let buffer = Arc::make_mut(&mut self.buffer);
        if buffer.len() > self.parallel_sort_threshold {
            buffer.par_sort_by(|a, b| cmp(a, b));
        } else {
            buffer.sort_by(|a, b| cmp(a, b));
        }
        self.sorted = true;
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.sort_buffer();
        let mut writer = self.store.writer().await?;
        for record in self.buffer.iter() {
            if let Err(err) = writer.push(record).await {
                abandon_writer(writer).await;
                return Err(err);
            }
        }
        let generation = writer.finish().await?;
        log_debug!(
            component = "sort",
            event = "buffer_flushed",
            file = %generation.id(),
            records = generation.count(),
        );
        self.buffer = Arc::new(Vec::with_capacity(self.capacity));
        self.groups.entry(0).or_default().push(generation);
        self.consolidate_once().await
    }

    async fn consolidate_once(&mut self) -> Result<(), StorageError> {
        let Some(index) = self
            .groups
            .iter()
            .find(|(_, generations)| generations.len() >= self.consolidation_threshold)
            .map(|(index, _)| *index)
        else {
            return Ok(());
        };
        let Some(inputs) = self.groups.remove(&index) else {
            return Ok(());
        };
        let merged = match self.merge(&inputs).await {
            Ok(merged) => merged,
            Err(err) => {
                self.groups.insert(index, inputs);
                return Err(err);
            }
        };
        for generation in &inputs {
            generation.retire();
        }
        log_info!(
            component = "sort",
            event = "generations_consolidated",
            index,
            inputs = inputs.len(),
            file = %merged.id(),
            records = merged.count(),
        );
        self.groups.entry(index + 1).or_default().push(merged);
        Ok(())
    }

    async fn merge(&self, inputs: &[Arc<Generation>]) -> Result<Arc<Generation>, StorageError> {
        let mut cursor = SortCursor::open(
            Arc::new(Vec::new()),
            inputs,
            self.cmp.clone(),
            self.read_ahead_frames,
            None,
        )
        .await?;
        let mut writer = self.store.writer().await?;
        loop {
            let pushed = match cursor.next().await {
                Ok(Some(record)) => writer.push(&record).await,
                Ok(None) => break,
                Err(err) => Err(err),
            };
            if let Err(err) = pushed {
                abandon_writer(writer).await;
                return Err(err);
            }
        }
        writer.finish().await
    }
}

/// Discard a half-written generation after a failed write.
pub(crate) async fn abandon_writer(writer: GenerationWriter) {
    let file = writer.id();
    if let Err(err) = writer.discard().await {
        log_warn!(
            component = "sort",
            event = "generation_discard_failed",
            file = %file,
            error = %err,
        );
    }
}

impl<T: GenerationRecord> fmt::Debug for SortManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortManager")
            .field("buffered", &self.buffer.len())
            .field("capacity", &self.capacity)
            .field("groups", &self.generation_summary())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::{
        io::MemStore,
        serdes::DecodeError,
    };

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    struct Item(u32, u32);

    impl Encode for Item {
        fn encode(&self, buf: &mut Vec<u8>) {
            self.0.encode(buf);
            self.1.encode(buf);
        }

        fn size(&self) -> usize {
            8
        }
    }

    impl Decode for Item {
        fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
            Ok(Item(u32::decode(reader)?, u32::decode(reader)?))
        }
    }

    impl GenerationRecord for Item {}

    fn manager(capacity: usize, threshold: usize) -> SortManager<Item> {
        let store = Arc::new(GenerationStore::new(Arc::new(MemStore::new()), 64));
        let option = EngineOption::default()
            .sort_buffer_capacity(capacity)
            .consolidation_threshold(threshold)
            .parallel_sort_threshold(8);
        SortManager::new(store, &option, |a: &Item, b: &Item| a.cmp(b))
    }

    async fn drain(cursor: &mut SortCursor<Item>) -> Vec<Item> {
        let mut out = Vec::new();
        while let Some(item) = cursor.next().await.unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn cursor_yields_sorted_multiset() {
        block_on(async {
            let mut rng = fastrand::Rng::with_seed(42);
            let mut manager = manager(16, 3);
            let mut expected = Vec::new();
            for i in 0..500 {
                let item = Item(rng.u32(0..50), i);
                expected.push(item.clone());
                manager.emplace(item).await.unwrap();
            }
            expected.sort();
            assert_eq!(manager.len(), 500);

            let mut cursor = manager.cursor().await.unwrap();
            assert_eq!(drain(&mut cursor).await, expected);
            assert!(!cursor.is_valid());
        });
    }

    #[test]
    fn consolidation_counts() {
        block_on(async {
            let mut manager = manager(4, 3);
            for i in 0..12 {
                manager.emplace(Item(i, 0)).await.unwrap();
            }
            // two flushes so far, one generation each, buffer full
            assert_eq!(manager.generation_summary(), BTreeMap::from([(0, 2)]));
            assert_eq!(manager.buffered(), 4);

            manager.emplace(Item(12, 0)).await.unwrap();
            // third flush reaches the threshold and merges index 0
            assert_eq!(manager.generation_summary(), BTreeMap::from([(1, 1)]));
            let merged = manager.generations();
            assert_eq!(merged[0].count(), 12);
            assert_eq!(manager.len(), 13);

            let sealed = manager.seal().await.unwrap();
            assert_eq!(sealed.len(), 2);
            assert_eq!(sealed.iter().map(|g| g.count()).sum::<u64>(), 13);
        });
    }

    #[test]
    fn one_consolidation_per_flush() {
        block_on(async {
            let mut manager = manager(1, 2);
            for i in 0..8 {
                manager.emplace(Item(i, 0)).await.unwrap();
            }
            manager.seal().await.unwrap();
            let summary = manager.generation_summary();
            let total: u64 = manager.generations().iter().map(|g| g.count()).sum();
            assert_eq!(total, 8);
            assert!(summary.values().all(|count| *count <= 2));
            let mut cursor = manager.cursor().await.unwrap();
            let items = drain(&mut cursor).await;
            assert_eq!(items, (0..8).map(|i| Item(i, 0)).collect::<Vec<_>>());
        });
    }

    #[test]
    fn cursor_is_isolated_from_later_emplace() {
        block_on(async {
            let mut manager = manager(8, 4);
            for i in [5, 1, 3] {
                manager.emplace(Item(i, 0)).await.unwrap();
            }
            let mut cursor = manager.cursor().await.unwrap();
            manager.emplace(Item(0, 0)).await.unwrap();
            manager.emplace(Item(2, 0)).await.unwrap();

            assert_eq!(
                drain(&mut cursor).await,
                vec![Item(1, 0), Item(3, 0), Item(5, 0)]
            );
            let mut fresh = manager.cursor().await.unwrap();
            assert_eq!(drain(&mut fresh).await.len(), 5);
        });
    }

    #[test]
    fn cursor_outlives_consolidation_and_cleanup() {
        use crate::cleaner::Cleaner;

        block_on(async {
            let mem = Arc::new(MemStore::new());
            let (cleaner, clean_tx) = Cleaner::new(mem.clone());
            let store = Arc::new(GenerationStore::new(mem.clone(), 64).with_cleaner(clean_tx));
            let option = EngineOption::default()
                .sort_buffer_capacity(4)
                .consolidation_threshold(3)
                .read_ahead_frames(1);
            let mut manager = SortManager::new(store, &option, |a: &Item, b: &Item| a.cmp(b));

            let mut rng = fastrand::Rng::with_seed(11);
            let mut expected: Vec<_> = (0..9).map(|i| Item(rng.u32(0..20), i)).collect();
            for item in &expected {
                manager.emplace(item.clone()).await.unwrap();
            }
            // two spilled generations plus one buffered record
            assert_eq!(manager.generation_summary(), BTreeMap::from([(0, 2)]));
            let mut cursor = manager.cursor().await.unwrap();

            for i in 9..13 {
                manager.emplace(Item(rng.u32(0..20), i)).await.unwrap();
            }
            // the third spill consolidated index 0 and retired its inputs;
            // only the one the cursor never saw is gone
            assert_eq!(manager.generation_summary(), BTreeMap::from([(1, 1)]));
            assert_eq!(cleaner.collect().await.unwrap(), 1);
            assert_eq!(mem.file_count(), 3);

            expected.sort();
            assert_eq!(drain(&mut cursor).await, expected);
            drop(cursor);
            assert_eq!(cleaner.collect().await.unwrap(), 2);
            assert_eq!(mem.file_count(), 1);
        });
    }

    #[test]
    fn cursor_from_probe() {
        block_on(async {
            let mut manager = manager(5, 10);
            for i in (0..40).rev() {
                manager.emplace(Item(i / 2, i)).await.unwrap();
            }
            let mut cursor = manager.cursor_from(&Item(7, 0)).await.unwrap();
            assert_eq!(cursor.current(), Some(&Item(7, 14)));
            let items = drain(&mut cursor).await;
            assert_eq!(items.len(), 26);
            assert_eq!(items.last(), Some(&Item(19, 39)));
        });
    }

    #[test]
    fn parallel_sort_matches_sequential() {
        block_on(async {
            let mut rng = fastrand::Rng::with_seed(3);
            let mut manager = manager(1000, 10);
            let mut expected: Vec<_> = (0..600).map(|i| Item(rng.u32(..), i)).collect();
            for item in &expected {
                manager.emplace(item.clone()).await.unwrap();
            }
            expected.sort();
            let mut cursor = manager.cursor().await.unwrap();
            assert_eq!(drain(&mut cursor).await, expected);
        });
    }

    #[test]
    fn clear_retires_everything() {
        block_on(async {
            let mut manager = manager(2, 10);
            for i in 0..5 {
                manager.emplace(Item(i, 0)).await.unwrap();
            }
            let held = manager.generations();
            manager.clear();
            assert!(manager.is_empty());
            assert!(held.iter().all(|g| g.is_retired()));
        });
    }

    #[test]
    #[should_panic(expected = "consolidation threshold")]
    fn zero_threshold_is_rejected() {
        let _ = manager(4, 0);
    }
}
