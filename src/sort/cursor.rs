use std::{cmp::Ordering, collections::VecDeque, sync::Arc};

use super::{generation::Generation, Comparator, GenerationRecord};
use crate::{error::StorageError, heap::MinHeap};

/// Sequential reader over one generation, reading `batch` frames per I/O.
pub(crate) struct GenerationCursor<T> {
    generation: Arc<Generation>,
    next_frame: usize,
    batch: usize,
    records: VecDeque<T>,
}

impl<T: GenerationRecord> GenerationCursor<T> {
    pub(crate) async fn open(
        generation: Arc<Generation>,
        batch: usize,
        probe: Option<(&T, &Comparator<T>)>,
    ) -> Result<Self, StorageError> {
        let next_frame = match probe {
            Some((probe, cmp)) => generation.seek_frame(probe, cmp.as_ref())?,
            None => 0,
        };
        let mut cursor = GenerationCursor {
            generation,
            next_frame,
            batch: batch.max(1),
            records: VecDeque::new(),
        };
        if let Some((probe, cmp)) = probe {
            loop {
                if cursor.records.is_empty() && !cursor.fill().await? {
                    break;
                }
                match cursor.records.front() {
                    Some(front) if cmp(front, probe) == Ordering::Less => {
                        cursor.records.pop_front();
                    }
                    _ => break,
                }
            }
        }
        Ok(cursor)
    }

    async fn fill(&mut self) -> Result<bool, StorageError> {
        if self.next_frame >= self.generation.frame_count() {
            return Ok(false);
        }
        let records = self
            .generation
            .read_frames(self.next_frame, self.batch)
            .await?;
        self.next_frame += self.batch;
        self.records.extend(records);
        Ok(true)
    }

    pub(crate) async fn next(&mut self) -> Result<Option<T>, StorageError> {
        while self.records.is_empty() {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        Ok(self.records.pop_front())
    }
}

type HeapCmp<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Buffer,
    Generation(usize),
}

/// Lazy ordered merge of a sort manager's buffer snapshot and generations.
///
/// The cursor holds its own snapshot of the buffer and references to the
/// generations, so records emplaced after it was opened are not observed.
pub struct SortCursor<T: GenerationRecord> {
    buffer: Arc<Vec<T>>,
    buffer_pos: usize,
    generations: Vec<GenerationCursor<T>>,
    heap: MinHeap<T, Source, HeapCmp<T>>,
}

impl<T: GenerationRecord> SortCursor<T> {
    /// `buffer` must be sorted by `cmp`.
    pub(crate) async fn open(
        buffer: Arc<Vec<T>>,
        generations: &[Arc<Generation>],
        cmp: Comparator<T>,
        read_ahead_frames: usize,
        probe: Option<&T>,
    ) -> Result<Self, StorageError> {
        let batch = (read_ahead_frames / generations.len().max(1)).max(1);
        let mut cursors = Vec::with_capacity(generations.len());
        for generation in generations {
            let probe = probe.map(|probe| (probe, &cmp));
            cursors.push(GenerationCursor::open(generation.clone(), batch, probe).await?);
        }
        let buffer_pos = match probe {
            Some(probe) => buffer.partition_point(|record| cmp(record, probe) == Ordering::Less),
            None => 0,
        };

        let heap_cmp: HeapCmp<T> = Box::new(move |a: &T, b: &T| cmp(a, b));
        let mut cursor = SortCursor {
            buffer,
            buffer_pos,
            generations: cursors,
            heap: MinHeap::with_capacity(generations.len() + 1, heap_cmp),
        };
        cursor.refill(Source::Buffer).await?;
        for index in 0..cursor.generations.len() {
            cursor.refill(Source::Generation(index)).await?;
        }
        Ok(cursor)
    }

    async fn refill(&mut self, source: Source) -> Result<(), StorageError> {
        let next = match source {
            Source::Buffer => {
                let next = self.buffer.get(self.buffer_pos).cloned();
                self.buffer_pos += 1;
                next
            }
            Source::Generation(index) => self.generations[index].next().await?,
        };
        if let Some(record) = next {
            self.heap.insert(record, source);
        }
        Ok(())
    }

    /// Smallest record not yet taken.
    pub fn current(&self) -> Option<&T> {
        self.heap.peek().map(|(record, _)| record)
    }

    /// Whether a record is left.
    pub fn is_valid(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Take the current record and move to the next one.
    pub async fn next(&mut self) -> Result<Option<T>, StorageError> {
        let Some((record, source)) = self.heap.try_pop() else {
            return Ok(None);
        };
        self.refill(source).await?;
        Ok(Some(record))
    }

    /// Drop the current record.
    pub async fn advance(&mut self) -> Result<(), StorageError> {
        self.next().await.map(drop)
    }
}
