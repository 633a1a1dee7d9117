use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::entry::Entry;

/// Decides when a memory layer has grown enough to be sealed.
pub trait FreezeTrigger: Send + Sync {
    /// Account for `entry`; returns `true` once the threshold is reached.
    fn check_if_exceed(&self, entry: &Entry) -> bool;

    /// Start counting from zero again.
    fn reset(&self);
}

/// Fires once the entries' heap size reaches a byte threshold.
#[derive(Debug)]
pub struct SizeOfMemTrigger {
    threshold: usize,
    current_size: AtomicUsize,
}

impl SizeOfMemTrigger {
    /// Trigger firing at `threshold`.
    pub fn new(max_size: usize) -> Self {
        Self {
            threshold: max_size,
            current_size: AtomicUsize::new(0),
        }
    }
}

impl FreezeTrigger for SizeOfMemTrigger {
    fn check_if_exceed(&self, entry: &Entry) -> bool {
        let size = entry.heap_size();
        self.current_size.fetch_add(size, Ordering::SeqCst) + size >= self.threshold
    }

    fn reset(&self) {
        self.current_size.store(0, Ordering::SeqCst);
    }
}

/// Fires once a number of entries was appended.
#[derive(Debug)]
pub struct LengthTrigger {
    threshold: usize,
    count: AtomicUsize,
}

impl LengthTrigger {
    /// Trigger firing at `threshold`.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            count: AtomicUsize::new(0),
        }
    }
}

impl FreezeTrigger for LengthTrigger {
    fn check_if_exceed(&self, _: &Entry) -> bool {
        self.count.fetch_add(1, Ordering::SeqCst) + 1 >= self.threshold
    }

    fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

/// Configured [`FreezeTrigger`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerType {
    /// Threshold in bytes.
    SizeOfMem(usize),
    /// Threshold in entries.
    Length(usize),
}

pub(crate) struct TriggerFactory;

impl TriggerFactory {
    pub(crate) fn create(trigger_type: TriggerType) -> Arc<dyn FreezeTrigger> {
        match trigger_type {
            TriggerType::SizeOfMem(threshold) => Arc::new(SizeOfMemTrigger::new(threshold)),
            TriggerType::Length(threshold) => Arc::new(LengthTrigger::new(threshold)),
        }
    }
}
