//! Binary max-heap over ranked entries
//!
//! `std::collections::BinaryHeap` orders by `Ord` on the element type, which
//! `f64` values don't have and which can't be swapped per call site. This heap
//! takes the ordering as a plain function instead.

use std::cmp::Ordering;

use crate::models::RankedEntry;

/// Ordering used by the heap: `Greater` means `a` ranks above `b`
pub type Comparator = fn(&RankedEntry, &RankedEntry) -> Ordering;

/// Default ranking: higher value first, ties broken by ascending key
pub fn descending_by_value(a: &RankedEntry, b: &RankedEntry) -> Ordering {
    a.value
        .partial_cmp(&b.value)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.key.cmp(&a.key))
}

/// Max-ordered heap built in O(n) and drained one entry at a time
///
/// Entries with non-finite values are dropped on the way in; they can't be
/// placed consistently and never take part in ranking.
#[derive(Debug, Clone)]
pub struct RankedHeap {
    items: Vec<RankedEntry>,
    rank: Comparator,
}

impl RankedHeap {
    /// Create an empty heap with the default ordering
    pub fn new() -> Self {
        Self::with_comparator(descending_by_value)
    }

    /// Create an empty heap with a custom ordering
    pub fn with_comparator(rank: Comparator) -> Self {
        Self {
            items: Vec::new(),
            rank,
        }
    }

    /// Build a heap from entries in linear time
    pub fn from_entries<I>(entries: I, rank: Comparator) -> Self
    where
        I: IntoIterator<Item = RankedEntry>,
    {
        let items: Vec<RankedEntry> = entries
            .into_iter()
            .filter(|entry| entry.value.is_finite())
            .collect();

        let mut heap = Self { items, rank };
        heap.heapify();
        heap
    }

    fn heapify(&mut self) {
        let len = self.items.len();
        for idx in (0..len / 2).rev() {
            self.sift_down(idx);
        }
    }

    /// Insert an entry, ignoring it if its value is not finite
    pub fn push(&mut self, entry: RankedEntry) {
        if !entry.value.is_finite() {
            return;
        }
        self.items.push(entry);
        self.sift_up(self.items.len() - 1);
    }

    /// Remove and return the highest-ranked entry, or `None` when empty
    pub fn pop_max(&mut self) -> Option<RankedEntry> {
        if self.items.is_empty() {
            return None;
        }

        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();

        if !self.items.is_empty() {
            self.sift_down(0);
        }

        top
    }

    pub fn peek(&self) -> Option<&RankedEntry> {
        self.items.first()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drain the whole heap into a vector in rank order
    pub fn into_sorted_vec(mut self) -> Vec<RankedEntry> {
        let mut sorted = Vec::with_capacity(self.items.len());
        while let Some(entry) = self.pop_max() {
            sorted.push(entry);
        }
        sorted
    }

    fn ranks_above(&self, a: usize, b: usize) -> bool {
        (self.rank)(&self.items[a], &self.items[b]) == Ordering::Greater
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.ranks_above(idx, parent) {
                break;
            }
            self.items.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut best = idx;

            if left < len && self.ranks_above(left, best) {
                best = left;
            }
            if right < len && self.ranks_above(right, best) {
                best = right;
            }
            if best == idx {
                break;
            }

            self.items.swap(idx, best);
            idx = best;
        }
    }
}

impl Default for RankedHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Draining iterator: yields entries in rank order
impl Iterator for RankedHeap {
    type Item = RankedEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop_max()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.items.len(), Some(self.items.len()))
    }
}
