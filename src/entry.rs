use std::cmp::Ordering;

use bytes::Bytes;

use crate::{
    key::IndexKey,
    mvcc::SequenceNumber,
    serdes::{Decode, DecodeError, Encode},
    sort::GenerationRecord,
};

/// A versioned write. `value == None` marks a deletion.
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    /// Written key.
    pub key: IndexKey,
    /// `None` for a tombstone.
    pub value: Option<Bytes>,
    /// Commit sequence inside the owning repository.
    pub seq: SequenceNumber,
}

impl Entry {
    /// Write of `value` to `key` at `seq`.
    pub fn put(key: IndexKey, value: impl Into<Bytes>, seq: SequenceNumber) -> Self {
        Entry {
            key,
            value: Some(value.into()),
            seq,
        }
    }

    /// Deletion of `key` at `seq`.
    pub fn tombstone(key: IndexKey, seq: SequenceNumber) -> Self {
        Entry {
            key,
            value: None,
            seq,
        }
    }

    /// Whether the entry deletes its key.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Layer order: key ascending, then sequence descending, so the newest
    /// version of a key comes first.
    pub fn key_order(a: &Entry, b: &Entry) -> Ordering {
        a.key.cmp(&b.key).then_with(|| b.seq.cmp(&a.seq))
    }

    /// Update order: sequence ascending.
    pub fn seq_order(a: &Entry, b: &Entry) -> Ordering {
        a.seq.cmp(&b.seq).then_with(|| a.key.cmp(&b.key))
    }

    /// Approximate memory footprint.
    pub fn heap_size(&self) -> usize {
        self.key.heap_size() + self.value.as_ref().map_or(0, Bytes::len) + 8
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{:?}@{} = {:?}", self.key, self.seq, value),
            None => write!(f, "{:?}@{} deleted", self.key, self.seq),
        }
    }
}

impl Encode for Entry {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.key.encode(buf);
        self.seq.encode(buf);
        self.value.encode(buf);
    }

    fn size(&self) -> usize {
        self.key.size() + self.seq.size() + self.value.size()
    }
}

impl Decode for Entry {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        let key = IndexKey::decode(reader)?;
        let seq = SequenceNumber::decode(reader)?;
        let value = Option::<Bytes>::decode(reader)?;
        Ok(Entry { key, value, seq })
    }
}

impl GenerationRecord for Entry {
    fn sequence(&self) -> Option<SequenceNumber> {
        Some(self.seq)
    }
}
