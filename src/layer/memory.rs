use std::{
    cmp::Ordering,
    fmt,
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use thiserror::Error;

use crate::{
    entry::Entry,
    id::LayerId,
    key::IndexKey,
    mvcc::{SeqBounds, SequenceNumber},
};

/// Key of the memory layer map: key ascending, then sequence descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VersionedKey {
    pub(crate) key: IndexKey,
    pub(crate) seq: SequenceNumber,
}

impl VersionedKey {
    fn newest(key: IndexKey) -> Self {
        VersionedKey {
            key,
            seq: SequenceNumber::MAX,
        }
    }
}

impl PartialOrd for VersionedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Append to a layer that was sealed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("layer sealed error: layer {0} no longer accepts entries")]
pub struct SealedLayer(pub LayerId);

/// The append-only in-memory layer of a repository.
///
/// Entries are kept twice: by versioned key for present walks and by
/// sequence number for update walks.
pub struct MemoryLayer {
    id: LayerId,
    data: SkipMap<VersionedKey, Option<Bytes>>,
    by_seq: SkipMap<SequenceNumber, Entry>,
    sealed: AtomicBool,
    approx_bytes: AtomicUsize,
}

impl MemoryLayer {
    /// Empty, unsealed layer.
    pub fn new() -> Self {
        MemoryLayer {
            id: LayerId::next(),
            data: SkipMap::new(),
            by_seq: SkipMap::new(),
            sealed: AtomicBool::new(false),
            approx_bytes: AtomicUsize::new(0),
        }
    }

    /// Process-unique layer id.
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Insert `entry`; fails once the layer is sealed.
    pub fn append(&self, entry: Entry) -> Result<(), SealedLayer> {
        if self.is_sealed() {
            return Err(SealedLayer(self.id));
        }
        self.approx_bytes
            .fetch_add(entry.heap_size(), AtomicOrdering::Relaxed);
        self.data.insert(
            VersionedKey {
                key: entry.key.clone(),
                seq: entry.seq,
            },
            entry.value.clone(),
        );
        self.by_seq.insert(entry.seq, entry);
        Ok(())
    }

    /// Stop accepting entries. Returns `false` if the layer was already sealed.
    pub fn seal(&self) -> bool {
        !self.sealed.swap(true, AtomicOrdering::AcqRel)
    }

    /// Whether appends are refused.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(AtomicOrdering::Acquire)
    }

    /// Lowest and highest sequence held.
    pub fn bounds(&self) -> Option<SeqBounds> {
        let lowest = *self.by_seq.front()?.key();
        let highest = *self.by_seq.back()?.key();
        Some(SeqBounds { lowest, highest })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    /// Whether the layer holds no entry.
    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Heap bytes of keys and values appended so far.
    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes.load(AtomicOrdering::Relaxed)
    }

    /// Every entry in layer order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.data.iter().map(|item| to_entry(item.key(), item.value()))
    }

    fn first_at_or_after(&self, bound: Bound<&VersionedKey>) -> Option<Entry> {
        self.data
            .lower_bound(bound)
            .map(|item| to_entry(item.key(), item.value()))
    }

    fn first_seq_from(&self, bound: Bound<&SequenceNumber>) -> Option<Entry> {
        self.by_seq.lower_bound(bound).map(|item| item.value().clone())
    }
}

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLayer")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

fn to_entry(key: &VersionedKey, value: &Option<Bytes>) -> Entry {
    Entry {
        key: key.key.clone(),
        value: value.clone(),
        seq: key.seq,
    }
}

/// Key-order cursor over a memory layer.
///
/// The cursor re-seeks the skiplist after the entry it returned last, so it
/// keeps working while commits land in the layer.
pub struct MemoryCursor {
    layer: Arc<MemoryLayer>,
    current: Option<Entry>,
}

impl MemoryCursor {
    pub(crate) fn seek(layer: Arc<MemoryLayer>, key: &IndexKey) -> Self {
        let current = layer.first_at_or_after(Bound::Included(&VersionedKey::newest(key.clone())));
        MemoryCursor { layer, current }
    }

    /// Entry under the cursor.
    pub fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    /// Move to the next entry.
    pub fn advance(&mut self) {
        if let Some(entry) = self.current.take() {
            let after = VersionedKey {
                key: entry.key,
                seq: entry.seq,
            };
            self.current = self.layer.first_at_or_after(Bound::Excluded(&after));
        }
    }
}

/// Sequence-order cursor over a memory layer.
pub struct MemoryUpdateCursor {
    layer: Arc<MemoryLayer>,
    current: Option<Entry>,
}

impl MemoryUpdateCursor {
    pub(crate) fn seek(layer: Arc<MemoryLayer>, from: SequenceNumber) -> Self {
        let current = layer.first_seq_from(Bound::Included(&from));
        MemoryUpdateCursor { layer, current }
    }

    /// Entry under the cursor.
    pub fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    /// Move to the next entry.
    pub fn advance(&mut self) {
        if let Some(entry) = self.current.take() {
            self.current = self.layer.first_seq_from(Bound::Excluded(&entry.seq));
        }
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::key;

    fn ik(a: i64, b: i64) -> IndexKey {
        IndexKey::new(Ulid::from_parts(7, 7), key![a, b])
    }

    fn put(layer: &MemoryLayer, a: i64, b: i64, seq: u64) {
        layer
            .append(Entry::put(ik(a, b), format!("{a}/{b}@{seq}"), SequenceNumber::new(seq)))
            .unwrap();
    }

    #[test]
    fn cursor_walks_key_then_newest_first() {
        let layer = Arc::new(MemoryLayer::new());
        put(&layer, 2, 0, 5);
        put(&layer, 1, 0, 3);
        put(&layer, 1, 0, 9);
        put(&layer, 3, 0, 1);

        let mut cursor = MemoryCursor::seek(layer.clone(), &ik(1, 0));
        let mut seen = Vec::new();
        while let Some(entry) = cursor.current() {
            seen.push((entry.key.key.fields()[0].as_int().unwrap(), entry.seq.get()));
            cursor.advance();
        }
        assert_eq!(seen, vec![(1, 9), (1, 3), (2, 5), (3, 1)]);

        let cursor = MemoryCursor::seek(layer.clone(), &ik(2, -1));
        assert_eq!(cursor.current().map(|e| e.seq.get()), Some(5));
        let cursor = MemoryCursor::seek(layer, &ik(4, 0));
        assert!(cursor.current().is_none());
    }

    #[test]
    fn update_cursor_follows_sequence() {
        let layer = Arc::new(MemoryLayer::new());
        put(&layer, 9, 0, 4);
        put(&layer, 1, 0, 6);
        put(&layer, 5, 0, 2);

        let mut cursor = MemoryUpdateCursor::seek(layer.clone(), SequenceNumber::new(3));
        let mut seqs = Vec::new();
        while let Some(entry) = cursor.current() {
            seqs.push(entry.seq.get());
            cursor.advance();
        }
        assert_eq!(seqs, vec![4, 6]);
        assert_eq!(
            layer.bounds(),
            Some(SeqBounds {
                lowest: SequenceNumber::new(2),
                highest: SequenceNumber::new(6)
            })
        );
    }

    #[test]
    fn sealed_layer_rejects_appends() {
        let layer = MemoryLayer::new();
        put(&layer, 1, 1, 1);
        assert!(layer.approx_bytes() > 0);
        assert!(layer.seal());
        assert!(!layer.seal());
        let err = layer
            .append(Entry::tombstone(ik(1, 1), SequenceNumber::new(2)))
            .unwrap_err();
        assert_eq!(err, SealedLayer(layer.id()));
        assert_eq!(layer.len(), 1);
        assert_eq!(layer.entries().count(), 1);
    }
}
