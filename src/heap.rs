//! Fixed-capacity binary min-heap used for K-way merges.
//!
//! Every value carries the source it came from (`R`), so a merge can pop the
//! smallest value and then refill from the same source. The heap is not
//! stable: among equal values, pop order is unspecified.

use std::{cmp::Ordering, fmt};

/// Binary min-heap with a capacity fixed at construction, ordered by `C`.
pub struct MinHeap<T, R, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    slots: Vec<(T, R)>,
    capacity: usize,
    cmp: C,
}

impl<T, R, C> MinHeap<T, R, C>
where
    C: Fn(&T, &T) -> Ordering,
{
    /// Empty heap holding at most `capacity` values.
    pub fn with_capacity(capacity: usize, cmp: C) -> Self {
        MinHeap {
            slots: Vec::with_capacity(capacity),
            capacity,
            cmp,
        }
    }

    /// Number of values held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the heap holds no value.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// # Panics
    ///
    /// Panics if the heap is full.
    pub fn insert(&mut self, value: T, source: R) {
        assert!(
            self.slots.len() < self.capacity,
            "min heap overflow: capacity {}",
            self.capacity
        );
        self.slots.push((value, source));
        self.sift_up(self.slots.len() - 1);
    }

    /// Smallest value and its source, without removing it.
    pub fn peek(&self) -> Option<(&T, &R)> {
        self.slots.first().map(|(value, source)| (value, source))
    }

    /// Remove the smallest value.
    ///
    /// # Panics
    ///
    /// Panics if the heap is empty.
    pub fn pop(&mut self) -> (T, R) {
        self.try_pop().expect("pop from an empty min heap")
    }

    /// Like [`MinHeap::pop`], returning `None` on an empty heap.
    pub fn try_pop(&mut self) -> Option<(T, R)> {
        if self.slots.is_empty() {
            return None;
        }
        let top = self.slots.swap_remove(0);
        if !self.slots.is_empty() {
            self.sift_down(0);
        }
        Some(top)
    }

    /// Drop every value.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Remove every slot, in no particular order.
    pub fn drain(&mut self) -> impl Iterator<Item = (T, R)> + '_ {
        self.slots.drain(..)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.cmp)(&self.slots[a].0, &self.slots[b].0) == Ordering::Less
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.slots.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.slots.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, pos) {
                break;
            }
            self.slots.swap(pos, child);
            pos = child;
        }
    }
}

impl<T, R, C> fmt::Debug for MinHeap<T, R, C>
where
    T: fmt::Debug,
    R: fmt::Debug,
    C: Fn(&T, &T) -> Ordering,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinHeap")
            .field("len", &self.slots.len())
            .field("capacity", &self.capacity)
            .field("top", &self.peek())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_order_with_duplicates() {
        let mut rng = fastrand::Rng::with_seed(7);
        let values: Vec<u32> = (0..200).map(|_| rng.u32(0..20)).collect();
        let mut heap = MinHeap::with_capacity(values.len(), u32::cmp);
        for (source, value) in values.iter().enumerate() {
            heap.insert(*value, source);
        }
        let mut popped = Vec::new();
        while let Some((value, source)) = heap.try_pop() {
            assert_eq!(values[source], value);
            popped.push(value);
        }
        let mut expected = values.clone();
        expected.sort_unstable();
        assert_eq!(popped, expected);
    }

    #[test]
    fn custom_comparator() {
        let mut heap = MinHeap::with_capacity(3, |a: &i32, b: &i32| b.cmp(a));
        heap.insert(1, 'a');
        heap.insert(5, 'b');
        heap.insert(3, 'c');
        assert_eq!(heap.peek(), Some((&5, &'b')));
        assert_eq!(heap.pop(), (5, 'b'));
        assert_eq!(heap.pop(), (3, 'c'));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn refill_after_pop() {
        let mut heap = MinHeap::with_capacity(2, u8::cmp);
        heap.insert(4, 0usize);
        heap.insert(2, 1usize);
        let (value, source) = heap.pop();
        assert_eq!((value, source), (2, 1));
        heap.insert(9, source);
        assert_eq!(heap.pop(), (4, 0));
        assert_eq!(heap.pop(), (9, 1));
        assert!(heap.is_empty());
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn insert_past_capacity() {
        let mut heap = MinHeap::with_capacity(1, u8::cmp);
        heap.insert(1, ());
        heap.insert(2, ());
    }

    #[test]
    #[should_panic(expected = "empty")]
    fn pop_empty() {
        let mut heap: MinHeap<u8, (), _> = MinHeap::with_capacity(1, u8::cmp);
        heap.pop();
    }
}
