use std::sync::{Arc, Mutex, PoisonError};

use futures_core::Stream;
use futures_util::stream;

use super::{EntryOrder, WalkOptions};
use crate::{
    entry::Entry,
    error::StorageError,
    fiber::{CompletionStatus, CompletionTrigger, FiberError, FrameHandle, Spawner},
    heap::MinHeap,
    key::{IndexKey, KeyScope},
    layer::{Layer, LayerCursor, LayerKind},
    mvcc::SequenceNumber,
    observability::{log_debug, log_warn},
    repo::RepoView,
};

/// Yields, per key in scope, the newest entry visible at the view's bound.
///
/// Older versions of a key, in the same or in other layers, are consumed
/// without being yielded. The walker stops at the first error.
pub struct PresentWalker {
    scope: KeyScope,
    bound: SequenceNumber,
    options: WalkOptions,
    spawner: Spawner,
    cursors: Vec<LayerCursor>,
    heap: MinHeap<Entry, usize, EntryOrder>,
    current: Option<Entry>,
}

impl PresentWalker {
    /// Seek every layer of `view` to the start of `scope`.
    pub async fn new(
        view: &RepoView,
        scope: impl Into<KeyScope>,
        spawner: &Spawner,
        options: WalkOptions,
    ) -> Result<Self, StorageError> {
        if spawner.is_shutdown() {
            return Err(StorageError::Shutdown);
        }
        let scope = scope.into();
        let bound = view.bound();
        let layers: Vec<Layer> = view
            .layers()
            .iter()
            .filter(|layer| layer.overlaps(SequenceNumber::MIN, bound))
            .cloned()
            .collect();
        let cursors = seek_all(&layers, &scope.seek_key(), spawner).await?;

        let mut heap = MinHeap::with_capacity(cursors.len(), Entry::key_order as EntryOrder);
        for (source, cursor) in cursors.iter().enumerate() {
            if let Some(entry) = cursor.current() {
                heap.insert(entry.clone(), source);
            }
        }
        let mut walker = PresentWalker {
            scope,
            bound,
            options,
            spawner: spawner.clone(),
            cursors,
            heap,
            current: None,
        };
        walker.settle().await?;
        Ok(walker)
    }

    /// Winner under the walker, `None` once exhausted or failed.
    pub fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    /// Whether the walker sits on a winner.
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    /// Move to the next key in scope.
    pub async fn advance(&mut self) -> Result<(), StorageError> {
        if self.current.take().is_none() {
            return Ok(());
        }
        if self.spawner.is_shutdown() {
            self.heap.clear();
            return Err(StorageError::Shutdown);
        }
        self.settle().await
    }

    /// Stream of the remaining winners; ends after the first error.
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
        let result = self.next_winner().await;
        if let Err(err) = &result {
            log_warn!(component = "walker", event = "present_walk_failed", error = %err);
            self.heap.clear();
            self.current = None;
        }
        result
    }

    async fn next_winner(&mut self) -> Result<(), StorageError> {
        loop {
            let Some((top, _)) = self.heap.peek() else {
                return Ok(());
            };
            if self.scope.is_past(&top.key) {
                self.heap.clear();
                return Ok(());
            }
            let key = top.key.clone();
            let mut winner: Option<Entry> = None;
            let mut last_seq = None;
            // versions of one key pop newest first
            while self.heap.peek().is_some_and(|(entry, _)| entry.key == key) {
                let (entry, source) = self.heap.pop();
                self.refill(source).await?;
                debug_assert_ne!(
                    last_seq,
                    Some(entry.seq),
                    "sequence {} appears twice for {:?}",
                    entry.seq,
                    entry.key
                );
                last_seq = Some(entry.seq);
                if winner.is_none() && entry.seq <= self.bound {
                    winner = Some(entry);
                }
            }
            let Some(entry) = winner else {
                continue;
            };
            if !self.scope.admits(&entry.key) {
                continue;
            }
            if self.options.skip_tombstones && entry.is_tombstone() {
                continue;
            }
            self.current = Some(entry);
            return Ok(());
        }
    }

    async fn refill(&mut self, source: usize) -> Result<(), StorageError> {
        let cursor = &mut self.cursors[source];
        cursor.advance().await?;
        if let Some(entry) = cursor.current() {
            self.heap.insert(entry.clone(), source);
        }
        Ok(())
    }
}

/// Reports a seek frame's outcome to the trigger exactly once. A frame
/// dropped before reporting (abandoned at shutdown, or panicked) reports
/// shutdown.
struct SeekReport {
    trigger: Arc<CompletionTrigger>,
    reported: bool,
}

impl SeekReport {
    fn finish(mut self, status: CompletionStatus) {
        self.reported = true;
        self.trigger.finish(status);
    }
}

impl Drop for SeekReport {
    fn drop(&mut self) {
        if !self.reported {
            self.trigger.finish(CompletionStatus::Shutdown);
        }
    }
}

type Slots = Arc<Mutex<Vec<Option<LayerCursor>>>>;

fn fill_slot(slots: &Slots, slot: usize, cursor: LayerCursor) {
    slots.lock().unwrap_or_else(PoisonError::into_inner)[slot] = Some(cursor);
}

/// Seek every layer to `key`. Disk layers seek in their own frames, joined
/// through a completion trigger; memory layers seek inline meanwhile.
async fn seek_all(
    layers: &[Layer],
    key: &IndexKey,
    spawner: &Spawner,
) -> Result<Vec<LayerCursor>, StorageError> {
    let slots: Slots = Arc::new(Mutex::new((0..layers.len()).map(|_| None).collect()));
    let disk = layers
        .iter()
        .filter(|layer| layer.kind() == LayerKind::Disk)
        .count();
    let trigger = Arc::new(CompletionTrigger::new(disk));
    let mut handles: Vec<FrameHandle<()>> = Vec::with_capacity(disk);

    for (slot, layer) in layers.iter().enumerate() {
        if layer.kind() != LayerKind::Disk {
            continue;
        }
        let report = SeekReport {
            trigger: trigger.clone(),
            reported: false,
        };
        let (layer, key, slots) = (layer.clone(), key.clone(), slots.clone());
        handles.push(spawner.schedule(move |_| async move {
            let sought = layer
                .seek(&key)
                .await
                .map(|cursor| fill_slot(&slots, slot, cursor));
            report.finish(sought.into());
        }));
    }
    for (slot, layer) in layers.iter().enumerate() {
        if layer.kind() == LayerKind::Memory {
            let cursor = layer.seek(key).await?;
            fill_slot(&slots, slot, cursor);
        }
    }

    if let Err(err) = trigger.wait().await {
        for handle in handles {
            if let Err(panic @ FiberError::Panicked(_)) = handle.join().await {
                return Err(panic.into());
            }
        }
        return Err(err);
    }
    log_debug!(component = "walker", event = "layers_sought", layers = layers.len(), disk);
    let cursors = std::mem::take(&mut *slots.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(cursors.into_iter().flatten().collect())
}
