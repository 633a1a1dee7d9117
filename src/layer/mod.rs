//! Layers of a repository and their cursors.
//!
//! A repository holds one unsealed [`MemoryLayer`], memory layers sealed but
//! not yet flushed, and any number of immutable [`DiskLayer`]s. Every layer
//! offers a key-order cursor for present walks and a sequence-order cursor
//! for update walks.

mod disk;
mod memory;

use std::sync::Arc;

pub use disk::{DiskCursor, DiskLayer, DiskUpdateCursor};
pub use memory::{MemoryCursor, MemoryLayer, MemoryUpdateCursor, SealedLayer};

use crate::{
    entry::Entry,
    error::StorageError,
    id::LayerId,
    key::IndexKey,
    mvcc::{SeqBounds, SequenceNumber},
};

/// Where a layer keeps its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// In a skip list.
    Memory,
    /// In generation files.
    Disk,
}

/// Shared handle to one layer.
#[derive(Debug, Clone)]
pub enum Layer {
    /// Active or sealed memory layer.
    Memory(Arc<MemoryLayer>),
    /// Immutable disk layer.
    Disk(Arc<DiskLayer>),
}

impl Layer {
    /// Memory or disk.
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Memory(_) => LayerKind::Memory,
            Layer::Disk(_) => LayerKind::Disk,
        }
    }

    /// Id of the wrapped layer.
    pub fn id(&self) -> LayerId {
        match self {
            Layer::Memory(layer) => layer.id(),
            Layer::Disk(layer) => layer.id(),
        }
    }

    /// Sequence bounds, `None` for an empty layer.
    pub fn bounds(&self) -> Option<SeqBounds> {
        match self {
            Layer::Memory(layer) => layer.bounds(),
            Layer::Disk(layer) => layer.bounds(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        match self {
            Layer::Memory(layer) => layer.len() as u64,
            Layer::Disk(layer) => layer.len(),
        }
    }

    /// Whether the layer holds no entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the layer holds any entry with a sequence in `[from, to]`.
    pub fn overlaps(&self, from: SequenceNumber, to: SequenceNumber) -> bool {
        self.bounds()
            .is_some_and(|bounds| bounds.lowest <= to && bounds.highest >= from)
    }

    /// Key-order cursor positioned at the first entry whose key is not less
    /// than `key`.
    pub async fn seek(&self, key: &IndexKey) -> Result<LayerCursor, StorageError> {
        match self {
            Layer::Memory(layer) => Ok(LayerCursor::Memory(MemoryCursor::seek(layer.clone(), key))),
            Layer::Disk(layer) => Ok(LayerCursor::Disk(DiskCursor::seek(layer, key).await?)),
        }
    }

    /// Sequence-order cursor positioned at the first entry with a sequence
    /// not less than `from`.
    pub async fn update_cursor(&self, from: SequenceNumber) -> Result<UpdateCursor, StorageError> {
        match self {
            Layer::Memory(layer) => Ok(UpdateCursor::Memory(MemoryUpdateCursor::seek(
                layer.clone(),
                from,
            ))),
            Layer::Disk(layer) => Ok(UpdateCursor::Disk(
                DiskUpdateCursor::seek(layer, from).await?,
            )),
        }
    }
}

/// Key-order cursor over one layer.
pub enum LayerCursor {
    /// Over a memory layer.
    Memory(MemoryCursor),
    /// Over a disk layer.
    Disk(DiskCursor),
}

impl LayerCursor {
    /// Entry under the cursor.
    pub fn current(&self) -> Option<&Entry> {
        match self {
            LayerCursor::Memory(cursor) => cursor.current(),
            LayerCursor::Disk(cursor) => cursor.current(),
        }
    }

    /// Move to the next entry.
    pub async fn advance(&mut self) -> Result<(), StorageError> {
        match self {
            LayerCursor::Memory(cursor) => {
                cursor.advance();
                Ok(())
            }
            LayerCursor::Disk(cursor) => cursor.advance().await,
        }
    }
}

/// Sequence-order cursor over one layer.
pub enum UpdateCursor {
    /// Over a memory layer.
    Memory(MemoryUpdateCursor),
    /// Over a disk layer.
    Disk(DiskUpdateCursor),
}

impl UpdateCursor {
    /// Entry under the cursor.
    pub fn current(&self) -> Option<&Entry> {
        match self {
            UpdateCursor::Memory(cursor) => cursor.current(),
            UpdateCursor::Disk(cursor) => cursor.current(),
        }
    }

    /// Move to the next entry.
    pub async fn advance(&mut self) -> Result<(), StorageError> {
        match self {
            UpdateCursor::Memory(cursor) => {
                cursor.advance();
                Ok(())
            }
            UpdateCursor::Disk(cursor) => cursor.advance().await,
        }
    }
}
