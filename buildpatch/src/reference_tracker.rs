//! Chunk reference tracking.
//!
//! The install plan consumes chunks in a known order. The tracker
//! holds that order and counts the remaining uses of each chunk, so
//! sources know when a chunk can be dropped from memory.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::chunk::ChunkId;

/// Per-chunk remaining use counts for an install plan.
pub trait ReferenceTracker: Send + Sync {
    /// Returns every chunk that still has at least one use.
    fn referenced_chunks(&self) -> HashSet<ChunkId>;

    /// Returns the remaining number of uses of a chunk.
    fn reference_count(&self, id: &ChunkId) -> u32;

    /// Returns up to `count` upcoming distinct chunks, in use order.
    fn next_references(&self, count: usize) -> Vec<ChunkId>;

    /// Records one use of a chunk.
    ///
    /// Returns false if `id` is not the next expected use, in which case
    /// nothing changes.
    fn pop_reference(&self, id: &ChunkId) -> bool;
}

/// Reference tracker built from an ordered use list.
#[derive(Debug, Default)]
pub struct OrderedReferenceTracker {
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    uses: VecDeque<ChunkId>,
    counts: HashMap<ChunkId, u32>,
}

impl OrderedReferenceTracker {
    pub fn new(uses: impl IntoIterator<Item = ChunkId>) -> Self {
        let uses: VecDeque<ChunkId> = uses.into_iter().collect();
        let mut counts = HashMap::new();
        for id in &uses {
            *counts.entry(*id).or_insert(0) += 1;
        }

        Self {
            state: Mutex::new(TrackerState { uses, counts }),
        }
    }

    /// Returns the number of uses left in the plan.
    pub fn remaining(&self) -> usize {
        self.state.lock().uses.len()
    }
}

impl ReferenceTracker for OrderedReferenceTracker {
    fn referenced_chunks(&self) -> HashSet<ChunkId> {
        self.state.lock().counts.keys().copied().collect()
    }

    fn reference_count(&self, id: &ChunkId) -> u32 {
        self.state.lock().counts.get(id).copied().unwrap_or(0)
    }

    fn next_references(&self, count: usize) -> Vec<ChunkId> {
        let state = self.state.lock();
        let mut seen = HashSet::new();

        state
            .uses
            .iter()
            .filter(|id| seen.insert(**id))
            .take(count)
            .copied()
            .collect()
    }

    fn pop_reference(&self, id: &ChunkId) -> bool {
        let mut state = self.state.lock();

        if state.uses.front() != Some(id) {
            tracing::warn!(
                "Chunk {} popped out of order (next expected {:?})",
                id,
                state.uses.front().map(|id| id.to_string())
            );
            return false;
        }

        state.uses.pop_front();
        if let Some(count) = state.counts.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                state.counts.remove(id);
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_pops() {
        let (a, b) = (ChunkId::new_random(), ChunkId::new_random());
        let tracker = OrderedReferenceTracker::new([a, b, a]);

        assert_eq!(2, tracker.reference_count(&a));
        assert_eq!(vec![a, b], tracker.next_references(10));

        assert!(!tracker.pop_reference(&b));
        assert_eq!(3, tracker.remaining());

        assert!(tracker.pop_reference(&a));
        assert!(tracker.pop_reference(&b));
        assert_eq!(0, tracker.reference_count(&b));
        assert_eq!(HashSet::from([a]), tracker.referenced_chunks());

        assert!(tracker.pop_reference(&a));
        assert!(!tracker.pop_reference(&a));
        assert!(tracker.referenced_chunks().is_empty());
    }
}
