//! History buffer for reverse hypergradient computation.
//!
//! Stores the inner states visited during the forward pass so the backward
//! pass can pin each step to the state it consumed.

use std::collections::VecDeque;

use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::reverse::traits::Snapshot;

/// Forward-pass snapshot store with optional truncation.
///
/// In truncated mode the buffer holds at most `max_steps + 1` snapshots and
/// evicts the oldest one first. The extra slot is for the final state, which
/// is dropped before the backward replay, so at most `max_steps` steps are
/// replayed.
#[derive(Debug, Clone)]
pub struct HistoryBuffer<R: Runtime> {
    /// Stored snapshots in forward order.
    entries: VecDeque<Snapshot<R>>,
    /// Maximum number of snapshots, `None` for unbounded.
    capacity: Option<usize>,
    /// Snapshots evicted since the last clear.
    evicted: usize,
}

impl<R: Runtime> HistoryBuffer<R> {
    /// Create an unbounded history.
    pub fn unbounded() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: None,
            evicted: 0,
        }
    }

    /// Create a history replaying at most `max_steps` backward steps.
    pub fn truncated(max_steps: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_steps + 1),
            capacity: Some(max_steps + 1),
            evicted: 0,
        }
    }

    /// Create a history for an optional truncation length.
    pub fn with_truncation(truncate_iter: Option<usize>) -> Self {
        match truncate_iter {
            Some(max_steps) => Self::truncated(max_steps),
            None => Self::unbounded(),
        }
    }

    /// Append a snapshot, evicting the oldest one when full.
    ///
    /// Returns `true` if a snapshot was evicted.
    pub fn push(&mut self, snapshot: Snapshot<R>) -> bool {
        let mut evicted = false;
        if let Some(cap) = self.capacity
            && self.entries.len() == cap
        {
            self.entries.pop_front();
            self.evicted += 1;
            evicted = true;
        }
        self.entries.push_back(snapshot);
        evicted
    }

    /// Record a state produced by step `produced_by`.
    pub fn record(&mut self, produced_by: Option<usize>, state: Vec<Tensor<R>>) -> bool {
        self.push(Snapshot::new(produced_by, state))
    }

    /// Remove and return the newest snapshot.
    pub fn pop_last(&mut self) -> Option<Snapshot<R>> {
        self.entries.pop_back()
    }

    /// Newest snapshot.
    pub fn last(&self) -> Option<&Snapshot<R>> {
        self.entries.back()
    }

    /// Remove all snapshots.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.evicted = 0;
    }

    /// Iterate snapshots in forward order.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot<R>> {
        self.entries.iter()
    }

    /// Iterate snapshots newest first (for the backward pass).
    pub fn iter_reverse(&self) -> impl Iterator<Item = &Snapshot<R>> {
        self.entries.iter().rev()
    }

    /// Get the snapshot at position `index` in forward order.
    pub fn get(&self, index: usize) -> Option<&Snapshot<R>> {
        self.entries.get(index)
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no snapshot is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of snapshots, `None` for unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Maximum number of backward steps a full buffer can feed.
    pub fn max_replay_steps(&self) -> Option<usize> {
        self.capacity.map(|c| c.saturating_sub(1))
    }

    /// Snapshots evicted since the last clear.
    pub fn evicted(&self) -> usize {
        self.evicted
    }
}
