//! Top-K selection over keyed snapshots
//!
//! Each cycle builds a throwaway heap over either the raw per-interval counts
//! (for reports) or the smoothed averages (for alarm evaluation). Building is
//! O(n) and extracting the top `k` is O(k log n), so small `k` never pays for a
//! full sort.

mod heap;

pub use heap::{descending_by_value, Comparator, RankedHeap};

use crate::models::RankedEntry;

/// Build a heap over `data` for incremental draining in descending order
pub fn to_ranked<I, K>(data: I) -> RankedHeap
where
    I: IntoIterator<Item = (K, f64)>,
    K: Into<String>,
{
    RankedHeap::from_entries(
        data.into_iter().map(|(key, value)| RankedEntry::new(key, value)),
        descending_by_value,
    )
}

/// Return the `min(k, n)` highest entries, highest first, ties by ascending key
pub fn top_k<I, K>(data: I, k: usize) -> Vec<RankedEntry>
where
    I: IntoIterator<Item = (K, f64)>,
    K: Into<String>,
{
    top_k_by(data, k, descending_by_value)
}

/// Like [`top_k`] with a caller-supplied ordering
pub fn top_k_by<I, K>(data: I, k: usize, rank: Comparator) -> Vec<RankedEntry>
where
    I: IntoIterator<Item = (K, f64)>,
    K: Into<String>,
{
    let heap = RankedHeap::from_entries(
        data.into_iter().map(|(key, value)| RankedEntry::new(key, value)),
        rank,
    );
    heap.take(k).collect()
}
