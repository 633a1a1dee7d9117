//! Walkers merge the cursors of every layer of a view with a [`MinHeap`].
//!
//! A [`PresentWalker`] yields, per key, the newest entry visible at the view's
//! bound. An [`UpdateWalker`] yields every entry in commit order.
//!
//! [`MinHeap`]: crate::heap::MinHeap

mod present;
mod update;

use std::cmp::Ordering;

pub use present::PresentWalker;
pub use update::UpdateWalker;

use crate::entry::Entry;

type EntryOrder = fn(&Entry, &Entry) -> Ordering;

/// Knobs of a [`PresentWalker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOptions {
    /// Drop keys whose newest visible entry is a tombstone.
    pub skip_tombstones: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        WalkOptions {
            skip_tombstones: true,
        }
    }
}

impl WalkOptions {
    /// Yield winning tombstones instead of dropping them.
    pub fn keep_tombstones(self) -> Self {
        WalkOptions {
            skip_tombstones: false,
        }
    }
}
