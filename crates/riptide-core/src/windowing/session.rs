//! Session windows: per-key dynamically merging event-time intervals.
//!
//! Events are grouped per key into intervals of maximum inter-event gap
//! `G`. An event with timestamp `ts` probes with the interval
//! `[ts, ts + G)`; existing windows it *touches* (overlaps or abuts) absorb
//! it, and an event that touches two windows bridges them into one, merging
//! their accumulators. Since every stored window is at least `G` long, at
//! most two can touch a probe.
//!
//! Emission is watermark-driven: a watermark `w` proves every window with
//! `beyond_end <= w` can no longer grow, so those are finished and emitted.
//! The deadline index maps window ends to the keys owning them, making
//! expiry a prefix cut instead of a full scan.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};

use crate::dag::ProcessorSupplier;
use crate::processor::{Item, Outbox, Processor, ProcessorError, Watermark};

use super::Collector;

/// A half-open event-time interval `[start, beyond_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// First instant covered.
    pub start: i64,
    /// First instant no longer covered.
    pub beyond_end: i64,
}

impl Interval {
    /// Creates the interval `[start, beyond_end)`.
    #[must_use]
    pub fn new(start: i64, beyond_end: i64) -> Self {
        Self { start, beyond_end }
    }

    /// Whether two intervals overlap or abut.
    ///
    /// This relation is not transitive; it is only ever evaluated between a
    /// probe and members of a pairwise non-touching set.
    #[must_use]
    pub fn touches(self, other: Self) -> bool {
        self.beyond_end >= other.start && other.beyond_end >= self.start
    }

    fn encompasses(self, inner: Self) -> bool {
        self.start <= inner.start && self.beyond_end >= inner.beyond_end
    }
}

/// A finished session window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<K, R> {
    /// Grouping key.
    pub key: K,
    /// Finished aggregation result.
    pub result: R,
    /// First event-time instant of the window.
    pub start: i64,
    /// First instant beyond the window.
    pub beyond_end: i64,
}

struct IntervalEntry<A> {
    beyond_end: i64,
    acc: A,
}

/// Stored windows of one key: start -> entry. Stored windows are pairwise
/// non-touching, so starts and ends are both strictly increasing and the
/// map order is a total order over them.
type IntervalMap<A> = BTreeMap<i64, IntervalEntry<A>>;

/// Session-window processor.
///
/// Late events (`ts <=` the last watermark) are dropped. Finished sessions
/// are mapped into the job's payload type by `emit_fn` and emitted when a
/// watermark expires them; the watermark itself is forwarded after the
/// sessions it released.
pub struct SessionWindowProcessor<T, K, C>
where
    C: Collector<T>,
{
    gap: i64,
    ts_fn: Arc<dyn Fn(&T) -> i64 + Send + Sync>,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
    collector: C,
    emit_fn: Arc<dyn Fn(Session<K, C::Output>) -> T + Send + Sync>,
    key_to_intervals: FxHashMap<K, IntervalMap<C::Acc>>,
    deadline_to_keys: BTreeMap<i64, FxHashSet<K>>,
    last_watermark: i64,
    /// Finished sessions not yet accepted by the outbox.
    pending: VecDeque<T>,
    /// Watermark to forward once `pending` is drained.
    pending_wm: Option<Watermark>,
    late_events: u64,
}

impl<T, K, C> SessionWindowProcessor<T, K, C>
where
    K: Clone + Eq + std::hash::Hash + Send,
    C: Collector<T>,
{
    /// Creates a session-window processor with inter-event gap `gap`.
    ///
    /// # Panics
    ///
    /// Panics if `gap` is not positive.
    pub fn new(
        gap: i64,
        ts_fn: impl Fn(&T) -> i64 + Send + Sync + 'static,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        collector: C,
        emit_fn: impl Fn(Session<K, C::Output>) -> T + Send + Sync + 'static,
    ) -> Self {
        assert!(gap > 0, "session gap must be positive");
        Self {
            gap,
            ts_fn: Arc::new(ts_fn),
            key_fn: Arc::new(key_fn),
            collector,
            emit_fn: Arc::new(emit_fn),
            key_to_intervals: FxHashMap::default(),
            deadline_to_keys: BTreeMap::new(),
            last_watermark: i64::MIN,
            pending: VecDeque::new(),
            pending_wm: None,
            late_events: 0,
        }
    }

    /// Number of open windows across all keys.
    #[must_use]
    pub fn open_window_count(&self) -> usize {
        self.key_to_intervals.values().map(BTreeMap::len).sum()
    }

    /// Open windows of one key, in start order.
    #[must_use]
    pub fn windows_for(&self, key: &K) -> Vec<Interval> {
        self.key_to_intervals.get(key).map_or_else(Vec::new, |map| {
            map.iter()
                .map(|(&start, entry)| Interval::new(start, entry.beyond_end))
                .collect()
        })
    }

    /// Keys currently holding open windows.
    #[must_use]
    pub fn open_key_count(&self) -> usize {
        self.key_to_intervals.len()
    }

    /// Distinct deadlines currently indexed.
    #[must_use]
    pub fn deadline_count(&self) -> usize {
        self.deadline_to_keys.len()
    }

    /// Events dropped for arriving at or below the watermark.
    #[must_use]
    pub fn late_event_count(&self) -> u64 {
        self.late_events
    }

    fn add_deadline(&mut self, deadline: i64, key: &K) {
        self.deadline_to_keys
            .entry(deadline)
            .or_default()
            .insert(key.clone());
    }

    fn remove_deadline(&mut self, deadline: i64, key: &K) {
        if let Some(keys) = self.deadline_to_keys.get_mut(&deadline) {
            keys.remove(key);
            if keys.is_empty() {
                self.deadline_to_keys.remove(&deadline);
            }
        }
    }

    fn on_event(&mut self, event: &T) {
        let ts = (self.ts_fn)(event);
        if ts <= self.last_watermark {
            self.late_events += 1;
            return;
        }
        let key = (self.key_fn)(event);
        let probe = Interval::new(ts, ts + self.gap);

        // Touching candidates, by descending start. Stored windows are
        // pairwise non-touching and at least gap long, so at most two can
        // touch the probe: `upper` and, before it, `lower`.
        let map = self.key_to_intervals.entry(key.clone()).or_default();
        let touching: Vec<Interval> = map
            .range(..=probe.beyond_end)
            .rev()
            .take_while(|(_, entry)| entry.beyond_end >= probe.start)
            .map(|(&start, entry)| Interval::new(start, entry.beyond_end))
            .collect();
        debug_assert!(touching.len() <= 2, "probe touches {} windows", touching.len());

        match touching.as_slice() {
            [] => {
                let mut acc = self.collector.supply();
                self.collector.accumulate(&mut acc, event);
                self.key_to_intervals.get_mut(&key).expect("just inserted").insert(
                    probe.start,
                    IntervalEntry {
                        beyond_end: probe.beyond_end,
                        acc,
                    },
                );
                self.add_deadline(probe.beyond_end, &key);
            }
            [only] => {
                let only = *only;
                if only.encompasses(probe) {
                    let map = self.key_to_intervals.get_mut(&key).expect("window present");
                    let entry = map.get_mut(&only.start).expect("window present");
                    self.collector.accumulate(&mut entry.acc, event);
                } else {
                    let map = self.key_to_intervals.get_mut(&key).expect("window present");
                    let mut entry = map.remove(&only.start).expect("window present");
                    let merged = Interval::new(
                        only.start.min(probe.start),
                        only.beyond_end.max(probe.beyond_end),
                    );
                    self.collector.accumulate(&mut entry.acc, event);
                    entry.beyond_end = merged.beyond_end;
                    self.key_to_intervals
                        .get_mut(&key)
                        .expect("window present")
                        .insert(merged.start, entry);
                    if merged.beyond_end != only.beyond_end {
                        self.remove_deadline(only.beyond_end, &key);
                        self.add_deadline(merged.beyond_end, &key);
                    }
                }
            }
            [upper, lower] => {
                let (upper, lower) = (*upper, *lower);
                let map = self.key_to_intervals.get_mut(&key).expect("window present");
                let lower_entry = map.remove(&lower.start).expect("window present");
                let upper_entry = map.remove(&upper.start).expect("window present");
                let mut acc = self.collector.combine(lower_entry.acc, upper_entry.acc);
                self.collector.accumulate(&mut acc, event);
                self.key_to_intervals.get_mut(&key).expect("window present").insert(
                    lower.start,
                    IntervalEntry {
                        beyond_end: upper.beyond_end,
                        acc,
                    },
                );
                // The merged window keeps the upper deadline.
                self.remove_deadline(lower.beyond_end, &key);
            }
            _ => unreachable!("at most two windows touch a probe"),
        }
    }

    /// Expires every window provably complete at `wm` into the pending
    /// emission queue.
    fn expire(&mut self, wm: i64) {
        let kept = self.deadline_to_keys.split_off(&(wm + 1));
        let expired = std::mem::replace(&mut self.deadline_to_keys, kept);
        let keys: FxHashSet<K> = expired.into_values().flatten().collect();

        for key in keys {
            let Some(map) = self.key_to_intervals.get_mut(&key) else {
                continue;
            };
            loop {
                match map.first_key_value() {
                    Some((_, entry)) if entry.beyond_end <= wm => {
                        let (start, entry) = map.pop_first().expect("entry present");
                        let session = Session {
                            key: key.clone(),
                            result: self.collector.finish(entry.acc),
                            start,
                            beyond_end: entry.beyond_end,
                        };
                        self.pending.push_back((self.emit_fn)(session));
                    }
                    _ => break,
                }
            }
            if map.is_empty() {
                self.key_to_intervals.remove(&key);
            }
        }
    }
}

impl<T, K, C> SessionWindowProcessor<T, K, C>
where
    T: Clone + Send + 'static,
    K: Clone + Eq + std::hash::Hash + Send + 'static,
    C: Collector<T> + Clone + Send + Sync + 'static,
{
    /// Supplier creating one processor per vertex instance.
    pub fn supplier(
        gap: i64,
        ts_fn: impl Fn(&T) -> i64 + Send + Sync + 'static,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        collector: C,
        emit_fn: impl Fn(Session<K, C::Output>) -> T + Send + Sync + 'static,
    ) -> ProcessorSupplier<T> {
        let ts_fn: Arc<dyn Fn(&T) -> i64 + Send + Sync> = Arc::new(ts_fn);
        let key_fn: Arc<dyn Fn(&T) -> K + Send + Sync> = Arc::new(key_fn);
        let emit_fn: Arc<dyn Fn(Session<K, C::Output>) -> T + Send + Sync> = Arc::new(emit_fn);
        ProcessorSupplier::new(move || {
            let (ts_fn, key_fn, emit_fn) =
                (Arc::clone(&ts_fn), Arc::clone(&key_fn), Arc::clone(&emit_fn));
            let collector = collector.clone();
            Box::new(Self {
                gap,
                ts_fn,
                key_fn,
                collector,
                emit_fn,
                key_to_intervals: FxHashMap::default(),
                deadline_to_keys: BTreeMap::new(),
                last_watermark: i64::MIN,
                pending: VecDeque::new(),
                pending_wm: None,
                late_events: 0,
            })
        })
    }
}

impl<T, K, C> Processor<T> for SessionWindowProcessor<T, K, C>
where
    T: Clone + Send,
    K: Clone + Eq + std::hash::Hash + Send,
    C: Collector<T>,
{
    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &T,
        _outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError> {
        self.on_event(item);
        Ok(true)
    }

    fn try_process_watermark(
        &mut self,
        _ordinal: usize,
        wm: Watermark,
        outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError> {
        if wm.seq() > self.last_watermark {
            self.last_watermark = wm.seq();
            self.expire(wm.seq());
            self.pending_wm = Some(wm);
        }

        // Drain resumably: a refused emission re-presents this watermark on
        // a later call, which skips expiry and continues here.
        while let Some(front) = self.pending.front() {
            if outbox.has_reached_any_limit() || !outbox.broadcast(&Item::Event(front.clone())) {
                return Ok(false);
            }
            self.pending.pop_front();
        }
        if let Some(pending_wm) = self.pending_wm {
            if !outbox.broadcast(&Item::Watermark(pending_wm)) {
                return Ok(false);
            }
            self.pending_wm = None;
        }
        Ok(true)
    }
}

impl<T, K, C> std::fmt::Debug for SessionWindowProcessor<T, K, C>
where
    C: Collector<T>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWindowProcessor")
            .field("gap", &self.gap)
            .field("open_keys", &self.key_to_intervals.len())
            .field("deadlines", &self.deadline_to_keys.len())
            .field("last_watermark", &self.last_watermark)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windowing::FnCollector;

    /// Test payload: raw points in, finished sessions out.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ev {
        Point { ts: i64, key: &'static str },
        Session(Session<String, Vec<i64>>),
    }

    fn point(ts: i64, key: &'static str) -> Ev {
        Ev::Point { ts, key }
    }

    fn processor(gap: i64) -> SessionWindowProcessor<Ev, String, FnCollector<Ev, Vec<i64>, Vec<i64>>>
    {
        let collector = FnCollector::new(
            Vec::new,
            |acc: &mut Vec<i64>, ev: &Ev| {
                if let Ev::Point { ts, .. } = ev {
                    acc.push(*ts);
                }
            },
            |mut a, mut b| {
                a.append(&mut b);
                a
            },
            |acc| acc,
        );
        SessionWindowProcessor::new(
            gap,
            |ev: &Ev| match ev {
                Ev::Point { ts, .. } => *ts,
                Ev::Session(s) => s.beyond_end,
            },
            |ev: &Ev| match ev {
                Ev::Point { key, .. } => (*key).to_string(),
                Ev::Session(s) => s.key.clone(),
            },
            collector,
            Ev::Session,
        )
    }

    fn feed(p: &mut SessionWindowProcessor<Ev, String, FnCollector<Ev, Vec<i64>, Vec<i64>>>, ev: Ev) {
        let mut outbox = Outbox::new(1, 64);
        assert!(p.try_process(0, &ev, &mut outbox).unwrap());
    }

    /// Advances the watermark and returns the emitted sessions.
    fn advance(
        p: &mut SessionWindowProcessor<Ev, String, FnCollector<Ev, Vec<i64>, Vec<i64>>>,
        wm: i64,
    ) -> Vec<Session<String, Vec<i64>>> {
        let mut outbox = Outbox::new(1, 64);
        assert!(p.try_process_watermark(0, Watermark::new(wm), &mut outbox).unwrap());
        let items: Vec<Item<Ev>> = outbox.bucket_mut(0).drain(..).collect();
        let mut sessions = Vec::new();
        for item in &items {
            if let Item::Event(Ev::Session(s)) = item {
                sessions.push(s.clone());
            }
        }
        // The watermark is forwarded after the sessions it released.
        assert_eq!(items.last(), Some(&Item::Watermark(Watermark::new(wm))));
        sessions
    }

    #[test]
    fn gap_splits_events_into_two_sessions() {
        let mut p = processor(10);
        for ts in [1, 5, 20, 25] {
            feed(&mut p, point(ts, "A"));
        }
        assert_eq!(p.open_window_count(), 2);

        // Watermark 30 proves only the first session complete.
        let sessions = advance(&mut p, 30);
        assert_eq!(
            sessions,
            vec![Session {
                key: "A".to_string(),
                result: vec![1, 5],
                start: 1,
                beyond_end: 15,
            }]
        );
        assert_eq!(p.open_window_count(), 1);

        let sessions = advance(&mut p, 40);
        assert_eq!(
            sessions,
            vec![Session {
                key: "A".to_string(),
                result: vec![20, 25],
                start: 20,
                beyond_end: 35,
            }]
        );
        assert_eq!(p.open_window_count(), 0);
        assert_eq!(p.open_key_count(), 0);
        assert_eq!(p.deadline_count(), 0);
    }

    #[test]
    fn bridging_event_merges_two_windows() {
        let mut p = processor(10);
        feed(&mut p, point(1, "A"));
        feed(&mut p, point(18, "A"));
        assert_eq!(p.open_window_count(), 2);

        // [10, 20) touches both [1, 11) and [18, 28): one window remains,
        // its accumulator is combine(lower, upper) plus the bridging event.
        feed(&mut p, point(10, "A"));
        assert_eq!(p.windows_for(&"A".to_string()), vec![Interval::new(1, 28)]);

        assert!(advance(&mut p, 27).is_empty());
        let sessions = advance(&mut p, 28);
        assert_eq!(
            sessions,
            vec![Session {
                key: "A".to_string(),
                result: vec![1, 18, 10],
                start: 1,
                beyond_end: 28,
            }]
        );
    }

    #[test]
    fn encompassed_event_only_accumulates() {
        let mut p = processor(10);
        feed(&mut p, point(1, "A"));
        feed(&mut p, point(5, "A"));
        let windows = p.windows_for(&"A".to_string());
        assert_eq!(windows, vec![Interval::new(1, 15)]);

        // ts 3 probes [3, 13), encompassed by [1, 15): no boundary change.
        feed(&mut p, point(3, "A"));
        assert_eq!(p.windows_for(&"A".to_string()), windows);

        let sessions = advance(&mut p, 50);
        assert_eq!(sessions[0].result, vec![1, 5, 3]);
    }

    #[test]
    fn event_extends_window_backwards() {
        let mut p = processor(10);
        feed(&mut p, point(20, "A"));
        // [12, 22) touches [20, 30) and reaches further back.
        feed(&mut p, point(12, "A"));
        assert_eq!(p.windows_for(&"A".to_string()), vec![Interval::new(12, 30)]);
    }

    #[test]
    fn late_events_change_nothing() {
        let mut p = processor(10);
        feed(&mut p, point(100, "A"));
        advance(&mut p, 50);

        let before = p.windows_for(&"A".to_string());
        feed(&mut p, point(50, "A"));
        feed(&mut p, point(49, "A"));
        assert_eq!(p.windows_for(&"A".to_string()), before);
        assert_eq!(p.late_event_count(), 2);
        assert_eq!(p.open_window_count(), 1);
    }

    #[test]
    fn keys_are_independent() {
        let mut p = processor(10);
        feed(&mut p, point(1, "A"));
        feed(&mut p, point(3, "B"));
        feed(&mut p, point(8, "A"));
        assert_eq!(p.open_key_count(), 2);
        assert_eq!(p.windows_for(&"A".to_string()), vec![Interval::new(1, 18)]);
        assert_eq!(p.windows_for(&"B".to_string()), vec![Interval::new(3, 13)]);

        let mut sessions = advance(&mut p, 100);
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].key, "A");
        assert_eq!(sessions[0].result, vec![1, 8]);
        assert_eq!(sessions[1].key, "B");
        assert_eq!(sessions[1].result, vec![3]);
    }

    #[test]
    fn open_windows_stay_pairwise_non_touching() {
        let mut p = processor(10);
        let key = "A".to_string();
        // A scripted sequence that creates, extends, and bridges windows.
        for ts in [5, 40, 80, 18, 52, 30, 95, 7, 64, 17] {
            feed(&mut p, point(ts, "A"));
            let windows = p.windows_for(&key);
            for (i, a) in windows.iter().enumerate() {
                for b in &windows[i + 1..] {
                    assert!(
                        !a.touches(*b),
                        "windows {a:?} and {b:?} touch after ts {ts}"
                    );
                }
            }
            // Every open window has a deadline entry.
            assert!(p.deadline_count() >= 1);
        }
    }

    #[test]
    fn emission_resumes_through_backpressure() {
        let mut p = processor(5);
        // Many separate sessions for distinct keys, all expiring at once.
        let keys: Vec<&'static str> = vec!["a", "b", "c", "d", "e", "f"];
        for (i, key) in keys.iter().enumerate() {
            feed(&mut p, point(10 * i64::try_from(i).unwrap() + 1, key));
        }

        // Outbox with limit 1 refuses most of the burst per call.
        let mut outbox = Outbox::new(1, 1);
        let mut emitted = Vec::new();
        let mut calls = 0;
        loop {
            calls += 1;
            let done = p
                .try_process_watermark(0, Watermark::new(1000), &mut outbox)
                .unwrap();
            emitted.extend(outbox.bucket_mut(0).drain(..));
            if done {
                break;
            }
            assert!(calls < 100, "emission did not converge");
        }
        assert!(calls > 1, "backpressure never engaged");

        let sessions = emitted
            .iter()
            .filter(|i| matches!(i, Item::Event(Ev::Session(_))))
            .count();
        assert_eq!(sessions, keys.len());
        assert_eq!(
            emitted.last(),
            Some(&Item::Watermark(Watermark::new(1000)))
        );
        assert_eq!(p.open_key_count(), 0);
    }

    #[test]
    fn session_pipeline_runs_in_a_dag() {
        use crate::dag::{Dag, Edge};
        use crate::execution::{ExecutionService, ExecutorConfig};
        use crate::processor::CollectSink;
        use crate::windowing::CountingCollector;

        let script = vec![
            Item::Event(point(1, "A")),
            Item::Event(point(5, "A")),
            Item::Event(point(20, "A")),
            Item::Event(point(25, "A")),
            Item::Watermark(Watermark::new(30)),
            Item::Watermark(Watermark::new(40)),
        ];
        let supplier = crate::dag::ProcessorSupplier::new(move || {
            Box::new(crate::processor::IterSource::new(script.clone()))
                as Box<dyn Processor<Ev>>
        });

        let mut dag: Dag<Ev> = Dag::new();
        dag.vertex("events", supplier, 1).unwrap();
        dag.vertex(
            "sessions",
            SessionWindowProcessor::supplier(
                10,
                |ev: &Ev| match ev {
                    Ev::Point { ts, .. } => *ts,
                    Ev::Session(s) => s.beyond_end,
                },
                |ev: &Ev| match ev {
                    Ev::Point { key, .. } => (*key).to_string(),
                    Ev::Session(s) => s.key.clone(),
                },
                CountingCollector,
                |s: Session<String, i64>| {
                    Ev::Session(Session {
                        key: s.key,
                        result: vec![s.result],
                        start: s.start,
                        beyond_end: s.beyond_end,
                    })
                },
            ),
            1,
        )
        .unwrap();
        let slots = CollectSink::slots(1);
        dag.vertex("collect", CollectSink::supplier(&slots), 1)
            .unwrap();
        dag.edge(Edge::between("events", "sessions")).unwrap();
        dag.edge(Edge::between("sessions", "collect")).unwrap();

        ExecutionService::new(ExecutorConfig::default())
            .submit(dag)
            .unwrap()
            .join()
            .unwrap();

        let recorded = slots[0].lock().unwrap().clone();
        let sessions: Vec<Session<String, Vec<i64>>> = recorded
            .iter()
            .filter_map(|item| match item {
                Item::Event(Ev::Session(s)) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(sessions.len(), 2);
        assert_eq!((sessions[0].start, sessions[0].beyond_end), (1, 15));
        assert_eq!(sessions[0].result, vec![2]);
        assert_eq!((sessions[1].start, sessions[1].beyond_end), (20, 35));
        assert_eq!(sessions[1].result, vec![2]);
    }
}
