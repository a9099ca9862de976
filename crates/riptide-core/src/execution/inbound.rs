//! Inbound edge streams with watermark coherence.
//!
//! One inbound stream serves one (edge, consumer instance) pair and owns one
//! SPSC queue per upstream producer instance. Regular events drain through
//! freely; watermarks are barriers: a watermark is released downstream only
//! once every live producer has reported the identical value, and a
//! disagreeing producer aborts the job.

use std::sync::Arc;

use crate::processor::{Item, Watermark};

use super::error::ExecError;
use super::progress::{ProgressState, ProgressTracker};
use super::queue::SpscQueue;

/// Per-producer drain budget per call, so one chatty producer cannot starve
/// the others.
const DRAIN_BUDGET: usize = 1024;

/// Fan-in stream over the per-producer queues of one edge.
pub struct InboundEdgeStream<T> {
    /// `None` marks a producer that has delivered its end-of-stream marker.
    queues: Vec<Option<Arc<SpscQueue<Item<T>>>>>,
    dest_ordinal: usize,
    priority: i32,
    live: usize,
    /// The watermark currently being aligned across producers.
    pending_wm: Option<Watermark>,
    wm_found: Vec<bool>,
    wm_found_count: usize,
}

impl<T> InboundEdgeStream<T> {
    pub(crate) fn new(
        queues: Vec<Arc<SpscQueue<Item<T>>>>,
        dest_ordinal: usize,
        priority: i32,
    ) -> Self {
        let live = queues.len();
        let wm_found = vec![false; queues.len()];
        Self {
            queues: queues.into_iter().map(Some).collect(),
            dest_ordinal,
            priority,
            live,
            pending_wm: None,
            wm_found,
            wm_found_count: 0,
        }
    }

    /// The ordinal this stream enters its consumer through.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.dest_ordinal
    }

    /// The edge's fan-in priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Drains available items into `dest`.
    ///
    /// Events are appended as they come; a watermark is appended only after
    /// every live producer has reported it. Producers that delivered their
    /// end-of-stream marker drop out of the alignment set.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::WatermarkMisorder`] when a producer emits a
    /// watermark different from the one pending.
    pub fn drain_to(&mut self, dest: &mut Vec<Item<T>>) -> Result<ProgressState, ExecError> {
        let mut tracker = ProgressTracker::new();

        let mut i = 0;
        while i < self.queues.len() {
            // Skip producers that already reported the pending watermark.
            if self.queues[i].is_none() || (self.pending_wm.is_some() && self.wm_found[i]) {
                i += 1;
                continue;
            }
            if self.pending_wm.is_some() {
                tracker.mark_not_done();
            }

            let mut barrier = false;
            for _ in 0..DRAIN_BUDGET {
                let Some(queue) = &self.queues[i] else { break };
                match queue.pop() {
                    None => break,
                    Some(Item::Event(event)) => {
                        dest.push(Item::Event(event));
                        tracker.mark_progress();
                        tracker.mark_not_done();
                    }
                    Some(Item::Watermark(wm)) => {
                        if let Some(pending) = self.pending_wm {
                            if wm != pending {
                                return Err(ExecError::WatermarkMisorder {
                                    expected: pending.seq(),
                                    found: wm.seq(),
                                });
                            }
                        }
                        self.pending_wm = Some(wm);
                        self.wm_found[i] = true;
                        self.wm_found_count += 1;
                        tracker.mark_progress();
                        tracker.mark_not_done();
                        barrier = true;
                    }
                    Some(Item::Done) => {
                        self.queues[i] = None;
                        self.live -= 1;
                        if self.wm_found[i] {
                            self.wm_found[i] = false;
                            self.wm_found_count -= 1;
                        }
                        tracker.mark_progress();
                        barrier = true;
                    }
                }
                if barrier {
                    break;
                }
            }

            if barrier && self.release_aligned_watermark(dest) {
                // Alignment complete: every producer may hold items behind
                // the barrier now, so start the sweep over.
                i = 0;
                continue;
            }
            i += 1;
        }

        if self.live > 0 {
            tracker.mark_not_done();
        }
        Ok(tracker.state())
    }

    /// Appends the pending watermark once all live producers agree (or none
    /// are left). Returns whether a watermark was released.
    fn release_aligned_watermark(&mut self, dest: &mut Vec<Item<T>>) -> bool {
        let Some(pending) = self.pending_wm else {
            return false;
        };
        if self.live > 0 && self.wm_found_count < self.live {
            return false;
        }
        dest.push(Item::Watermark(pending));
        self.pending_wm = None;
        self.wm_found_count = 0;
        self.wm_found.fill(false);
        true
    }
}

impl<T> std::fmt::Debug for InboundEdgeStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundEdgeStream")
            .field("ordinal", &self.dest_ordinal)
            .field("priority", &self.priority)
            .field("producers", &self.queues.len())
            .field("live", &self.live)
            .field("pending_wm", &self.pending_wm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with(
        scripts: Vec<Vec<Item<i64>>>,
    ) -> (InboundEdgeStream<i64>, Vec<Arc<SpscQueue<Item<i64>>>>) {
        let queues: Vec<Arc<SpscQueue<Item<i64>>>> = scripts
            .iter()
            .map(|_| Arc::new(SpscQueue::new(64)))
            .collect();
        for (q, script) in queues.iter().zip(scripts) {
            for item in script {
                q.push(item).unwrap();
            }
        }
        (InboundEdgeStream::new(queues.clone(), 0, 0), queues)
    }

    #[test]
    fn events_drain_without_barriers() {
        let (mut stream, _) = stream_with(vec![
            vec![Item::Event(1), Item::Event(2)],
            vec![Item::Event(3)],
        ]);
        let mut dest = Vec::new();
        let state = stream.drain_to(&mut dest).unwrap();
        assert_eq!(state, ProgressState::MadeProgress);
        assert_eq!(dest.len(), 3);
    }

    #[test]
    fn watermark_waits_for_all_producers() {
        let (mut stream, queues) = stream_with(vec![
            vec![Item::Event(1), Item::Watermark(Watermark::new(5))],
            vec![Item::Event(2)],
        ]);
        let mut dest = Vec::new();
        stream.drain_to(&mut dest).unwrap();
        // Producer 1 has not reported wm(5) yet: no watermark downstream.
        assert!(dest
            .iter()
            .all(|i| !matches!(i, Item::Watermark(_))));

        queues[1].push(Item::Watermark(Watermark::new(5))).unwrap();
        queues[0].push(Item::Event(10)).unwrap();
        dest.clear();
        stream.drain_to(&mut dest).unwrap();

        // Alignment completes, wm(5) is released, and draining resumes past
        // the barrier.
        let wm_pos = dest
            .iter()
            .position(|i| matches!(i, Item::Watermark(_)))
            .expect("watermark released");
        assert_eq!(dest[wm_pos], Item::Watermark(Watermark::new(5)));
        assert!(dest[wm_pos + 1..].contains(&Item::Event(10)));
    }

    #[test]
    fn disagreeing_watermark_is_a_misorder() {
        let (mut stream, _) = stream_with(vec![
            vec![Item::Watermark(Watermark::new(5))],
            vec![Item::Watermark(Watermark::new(7))],
        ]);
        let mut dest = Vec::new();
        let err = stream.drain_to(&mut dest).unwrap_err();
        assert!(matches!(
            err,
            ExecError::WatermarkMisorder {
                expected: 5,
                found: 7
            }
        ));
    }

    #[test]
    fn done_producer_counts_as_aligned() {
        let (mut stream, _) = stream_with(vec![
            vec![Item::Watermark(Watermark::new(5)), Item::Event(1)],
            vec![Item::Done],
        ]);
        let mut dest = Vec::new();
        stream.drain_to(&mut dest).unwrap();
        assert!(dest.contains(&Item::Watermark(Watermark::new(5))));
        assert!(dest.contains(&Item::Event(1)));
    }

    #[test]
    fn all_done_reports_done() {
        let (mut stream, _) = stream_with(vec![vec![Item::Done], vec![Item::Done]]);
        let mut dest = Vec::new();
        let state = stream.drain_to(&mut dest).unwrap();
        assert_eq!(state, ProgressState::Done);
        assert!(dest.is_empty());

        // A done stream stays done.
        let state = stream.drain_to(&mut dest).unwrap();
        assert_eq!(state, ProgressState::Done);
    }

    #[test]
    fn items_between_watermarks_stay_between_them() {
        let (mut stream, _) = stream_with(vec![
            vec![
                Item::Event(11),
                Item::Watermark(Watermark::new(5)),
                Item::Event(12),
                Item::Watermark(Watermark::new(10)),
            ],
            vec![
                Item::Event(21),
                Item::Watermark(Watermark::new(5)),
                Item::Event(22),
                Item::Watermark(Watermark::new(10)),
            ],
        ]);
        let mut dest = Vec::new();
        while stream.drain_to(&mut dest).unwrap() != ProgressState::Done {}

        let positions: Vec<usize> = dest
            .iter()
            .enumerate()
            .filter_map(|(i, item)| matches!(item, Item::Watermark(_)).then_some(i))
            .collect();
        assert_eq!(positions.len(), 2);
        let (first_wm, second_wm) = (positions[0], positions[1]);
        assert_eq!(dest[first_wm], Item::Watermark(Watermark::new(5)));
        assert_eq!(dest[second_wm], Item::Watermark(Watermark::new(10)));

        let firsts: Vec<&Item<i64>> = dest[..first_wm].iter().collect();
        assert!(firsts.contains(&&Item::Event(11)));
        assert!(firsts.contains(&&Item::Event(21)));
        let seconds: Vec<&Item<i64>> = dest[first_wm + 1..second_wm].iter().collect();
        assert!(seconds.contains(&&Item::Event(12)));
        assert!(seconds.contains(&&Item::Event(22)));
    }
}
