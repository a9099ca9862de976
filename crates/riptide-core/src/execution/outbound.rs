//! Outbound edge streams: forwarding-pattern routing into consumer queues.
//!
//! One outbound stream serves one (edge, producer instance) pair and holds
//! that producer's queue into every consumer instance. Regular events route
//! per the edge's forwarding pattern; watermarks and end-of-stream markers
//! go to every queue so downstream coherence holds whatever the pattern.

use std::sync::Arc;

use crate::dag::Forwarding;
use crate::processor::Item;

use super::queue::SpscQueue;

/// Routes one producer instance's output across an edge.
pub struct OutboundEdgeStream<T> {
    queues: Vec<Arc<SpscQueue<Item<T>>>>,
    forwarding: Forwarding<T>,
    round_robin: usize,
    /// Queues already reached by the in-flight broadcast item; a retry
    /// resumes here instead of duplicating deliveries.
    broadcast_pos: usize,
}

impl<T: Clone> OutboundEdgeStream<T> {
    pub(crate) fn new(queues: Vec<Arc<SpscQueue<Item<T>>>>, forwarding: Forwarding<T>) -> Self {
        Self {
            queues,
            forwarding,
            round_robin: 0,
            broadcast_pos: 0,
        }
    }

    /// Offers an item to the edge. Returns `false` when the destination
    /// queue (or, for broadcast items, some destination queue) is full; the
    /// caller must retry with the same item later.
    pub fn offer(&mut self, item: &Item<T>) -> bool {
        match item {
            // Control items reach every instance regardless of pattern.
            Item::Watermark(_) | Item::Done => self.offer_to_all(item),
            Item::Event(event) => match &self.forwarding {
                Forwarding::Broadcast => self.offer_to_all(item),
                Forwarding::AllToOne => self.queues[0].push(item.clone()).is_ok(),
                Forwarding::Unicast => {
                    let n = self.queues.len();
                    for probe in 0..n {
                        let idx = (self.round_robin + probe) % n;
                        if self.queues[idx].push(item.clone()).is_ok() {
                            self.round_robin = (idx + 1) % n;
                            return true;
                        }
                    }
                    false
                }
                Forwarding::Partitioned {
                    key_fn,
                    partition_fn,
                } => {
                    let key = key_fn(event);
                    let n = self.queues.len();
                    let idx = partition_fn.as_ref().map_or_else(
                        || {
                            #[allow(clippy::cast_possible_truncation)]
                            {
                                (key % n as u64) as usize
                            }
                        },
                        |f| f(key, n) % n,
                    );
                    self.queues[idx].push(item.clone()).is_ok()
                }
            },
        }
    }

    fn offer_to_all(&mut self, item: &Item<T>) -> bool {
        while self.broadcast_pos < self.queues.len() {
            if self.queues[self.broadcast_pos].push(item.clone()).is_err() {
                return false;
            }
            self.broadcast_pos += 1;
        }
        self.broadcast_pos = 0;
        true
    }
}

impl<T> std::fmt::Debug for OutboundEdgeStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundEdgeStream")
            .field("consumers", &self.queues.len())
            .field("forwarding", &self.forwarding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Watermark;

    fn queues(n: usize, capacity: usize) -> Vec<Arc<SpscQueue<Item<i64>>>> {
        (0..n).map(|_| Arc::new(SpscQueue::new(capacity))).collect()
    }

    #[test]
    fn unicast_round_robins() {
        let qs = queues(2, 16);
        let mut stream = OutboundEdgeStream::new(qs.clone(), Forwarding::Unicast);
        for i in 0..4 {
            assert!(stream.offer(&Item::Event(i)));
        }
        assert_eq!(qs[0].len(), 2);
        assert_eq!(qs[1].len(), 2);
    }

    #[test]
    fn broadcast_reaches_every_queue() {
        let qs = queues(3, 16);
        let mut stream = OutboundEdgeStream::new(qs.clone(), Forwarding::Broadcast);
        assert!(stream.offer(&Item::Event(7)));
        for q in &qs {
            assert_eq!(q.len(), 1);
        }
    }

    #[test]
    fn partitioned_routes_by_key() {
        let qs = queues(2, 16);
        let mut stream = OutboundEdgeStream::new(
            qs.clone(),
            Forwarding::Partitioned {
                key_fn: Arc::new(|v: &i64| u64::try_from(*v).unwrap()),
                partition_fn: None,
            },
        );
        for i in 0..10 {
            assert!(stream.offer(&Item::Event(i)));
        }
        // Evens to instance 0, odds to instance 1, order preserved.
        let evens: Vec<_> = std::iter::from_fn(|| qs[0].pop()).collect();
        let odds: Vec<_> = std::iter::from_fn(|| qs[1].pop()).collect();
        assert_eq!(evens, (0..10).step_by(2).map(Item::Event).collect::<Vec<_>>());
        assert_eq!(odds, (1..10).step_by(2).map(Item::Event).collect::<Vec<_>>());
    }

    #[test]
    fn watermarks_broadcast_on_any_pattern() {
        let qs = queues(2, 16);
        let mut stream = OutboundEdgeStream::new(qs.clone(), Forwarding::Unicast);
        assert!(stream.offer(&Item::Watermark(Watermark::new(5))));
        assert_eq!(qs[0].len(), 1);
        assert_eq!(qs[1].len(), 1);
    }

    #[test]
    fn broadcast_retry_does_not_duplicate() {
        // Queue 1 full: broadcast stalls mid-way, then resumes where it
        // stopped once space frees up.
        let qs = queues(2, 2);
        qs[1].push(Item::Event(99)).unwrap();
        let mut stream = OutboundEdgeStream::new(qs.clone(), Forwarding::Broadcast);

        assert!(!stream.offer(&Item::Event(1)));
        assert_eq!(qs[0].len(), 1);

        qs[1].pop();
        assert!(stream.offer(&Item::Event(1)));
        assert_eq!(qs[0].len(), 1, "first queue must not see a duplicate");
        assert_eq!(qs[1].len(), 1);
    }
}
