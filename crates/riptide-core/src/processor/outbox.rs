//! Per-edge output buckets with backpressure signaling.

use std::collections::VecDeque;

use super::Item;

/// A processor's output buffer: one bounded bucket per outbound edge,
/// addressed by source ordinal.
///
/// The high-water `limit` is the advisory backpressure signal; cooperative
/// processors check [`has_reached_limit`](Self::has_reached_limit) and stop
/// producing for the rest of the call when it reports `true`. A bucket
/// refuses items outright at twice the limit, so a processor that ignores
/// the signal is stopped rather than allowed to grow the bucket without
/// bound.
#[derive(Debug)]
pub struct Outbox<T> {
    buckets: Vec<VecDeque<Item<T>>>,
    limit: usize,
}

impl<T> Outbox<T> {
    pub(crate) fn new(bucket_count: usize, limit: usize) -> Self {
        Self {
            buckets: (0..bucket_count)
                .map(|_| VecDeque::with_capacity(limit.min(64)))
                .collect(),
            limit: limit.max(1),
        }
    }

    /// Number of buckets (outbound edges).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Adds an item to the bucket with the given ordinal.
    ///
    /// Returns `false` without adding when the bucket is at its hard cap.
    pub fn add(&mut self, ordinal: usize, item: Item<T>) -> bool {
        let cap = self.hard_cap();
        let bucket = &mut self.buckets[ordinal];
        if bucket.len() >= cap {
            return false;
        }
        bucket.push_back(item);
        true
    }

    /// Adds a watermark to every bucket.
    ///
    /// All-or-nothing: if any bucket is at its hard cap, nothing is added
    /// and `false` is returned.
    pub fn forward_watermark(&mut self, wm: crate::processor::Watermark) -> bool {
        let cap = self.hard_cap();
        if self.buckets.iter().any(|b| b.len() >= cap) {
            return false;
        }
        for bucket in &mut self.buckets {
            bucket.push_back(Item::Watermark(wm));
        }
        true
    }

    /// Whether the bucket with the given ordinal has reached its high-water
    /// mark. Cooperative processors should stop producing when it has.
    #[must_use]
    pub fn has_reached_limit(&self, ordinal: usize) -> bool {
        self.buckets[ordinal].len() >= self.limit
    }

    /// Whether any bucket has reached its high-water mark.
    #[must_use]
    pub fn has_reached_any_limit(&self) -> bool {
        self.buckets.iter().any(|b| b.len() >= self.limit)
    }

    /// Whether every bucket is empty.
    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub(crate) fn bucket_mut(&mut self, ordinal: usize) -> &mut VecDeque<Item<T>> {
        &mut self.buckets[ordinal]
    }

    fn hard_cap(&self) -> usize {
        self.limit * 2
    }
}

impl<T: Clone> Outbox<T> {
    /// Adds a clone of the item to every bucket.
    ///
    /// All-or-nothing: if any bucket is at its hard cap, nothing is added
    /// and `false` is returned.
    pub fn broadcast(&mut self, item: &Item<T>) -> bool {
        let cap = self.hard_cap();
        if self.buckets.iter().any(|b| b.len() >= cap) {
            return false;
        }
        for bucket in &mut self.buckets {
            bucket.push_back(item.clone());
        }
        true
    }
}
