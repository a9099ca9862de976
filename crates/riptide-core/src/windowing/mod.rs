//! # Windowing
//!
//! Event-time windowing operators and the collector contract they aggregate
//! with.
//!
//! A [`Collector`] is the capability set `{supply, accumulate, combine,
//! finish}`: create per-group state, fold events into it, merge two states
//! when windows merge, and produce the final result on emission. `combine`
//! must be associative; window merging applies it in arbitrary grouping
//! order.

pub mod session;

pub use session::{Interval, Session, SessionWindowProcessor};

use std::sync::Arc;

/// Aggregation contract for windowed state.
pub trait Collector<T>: Send {
    /// Per-group accumulated state.
    type Acc: Send;
    /// Final result produced from an accumulator.
    type Output;

    /// Creates a fresh accumulator.
    fn supply(&self) -> Self::Acc;

    /// Folds one event into an accumulator.
    fn accumulate(&self, acc: &mut Self::Acc, item: &T);

    /// Merges two accumulators. Must be associative.
    fn combine(&self, a: Self::Acc, b: Self::Acc) -> Self::Acc;

    /// Finishes an accumulator into the result value.
    fn finish(&self, acc: Self::Acc) -> Self::Output;
}

/// Counts events per group.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountingCollector;

impl<T> Collector<T> for CountingCollector {
    type Acc = i64;
    type Output = i64;

    fn supply(&self) -> i64 {
        0
    }

    fn accumulate(&self, acc: &mut i64, _item: &T) {
        *acc += 1;
    }

    fn combine(&self, a: i64, b: i64) -> i64 {
        a + b
    }

    fn finish(&self, acc: i64) -> i64 {
        acc
    }
}

/// Sums an `i64` drawn from each event.
pub struct SummingCollector<T> {
    value_fn: Arc<dyn Fn(&T) -> i64 + Send + Sync>,
}

impl<T> SummingCollector<T> {
    /// Creates a summing collector over the given value extraction.
    pub fn new<F>(value_fn: F) -> Self
    where
        F: Fn(&T) -> i64 + Send + Sync + 'static,
    {
        Self {
            value_fn: Arc::new(value_fn),
        }
    }
}

impl<T> Clone for SummingCollector<T> {
    fn clone(&self) -> Self {
        Self {
            value_fn: Arc::clone(&self.value_fn),
        }
    }
}

impl<T> Collector<T> for SummingCollector<T> {
    type Acc = i64;
    type Output = i64;

    fn supply(&self) -> i64 {
        0
    }

    fn accumulate(&self, acc: &mut i64, item: &T) {
        *acc += (self.value_fn)(item);
    }

    fn combine(&self, a: i64, b: i64) -> i64 {
        a + b
    }

    fn finish(&self, acc: i64) -> i64 {
        acc
    }
}

/// Closure-based collector for ad-hoc aggregations.
pub struct FnCollector<T, A, R> {
    supply: Arc<dyn Fn() -> A + Send + Sync>,
    accumulate: Arc<dyn Fn(&mut A, &T) + Send + Sync>,
    combine: Arc<dyn Fn(A, A) -> A + Send + Sync>,
    finish: Arc<dyn Fn(A) -> R + Send + Sync>,
}

impl<T, A, R> FnCollector<T, A, R> {
    /// Builds a collector from its four capabilities. `combine` must be
    /// associative.
    pub fn new(
        supply: impl Fn() -> A + Send + Sync + 'static,
        accumulate: impl Fn(&mut A, &T) + Send + Sync + 'static,
        combine: impl Fn(A, A) -> A + Send + Sync + 'static,
        finish: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            supply: Arc::new(supply),
            accumulate: Arc::new(accumulate),
            combine: Arc::new(combine),
            finish: Arc::new(finish),
        }
    }
}

impl<T, A, R> Clone for FnCollector<T, A, R> {
    fn clone(&self) -> Self {
        Self {
            supply: Arc::clone(&self.supply),
            accumulate: Arc::clone(&self.accumulate),
            combine: Arc::clone(&self.combine),
            finish: Arc::clone(&self.finish),
        }
    }
}

impl<T, A: Send, R> Collector<T> for FnCollector<T, A, R> {
    type Acc = A;
    type Output = R;

    fn supply(&self) -> A {
        (self.supply)()
    }

    fn accumulate(&self, acc: &mut A, item: &T) {
        (self.accumulate)(acc, item);
    }

    fn combine(&self, a: A, b: A) -> A {
        (self.combine)(a, b)
    }

    fn finish(&self, acc: A) -> R {
        (self.finish)(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_collector_counts() {
        let c = CountingCollector;
        let mut acc = Collector::<i64>::supply(&c);
        c.accumulate(&mut acc, &10);
        c.accumulate(&mut acc, &20);
        let merged = Collector::<i64>::combine(&c, acc, 5);
        assert_eq!(Collector::<i64>::finish(&c, merged), 7);
    }

    #[test]
    fn summing_collector_sums() {
        let c = SummingCollector::new(|v: &i64| *v);
        let mut acc = c.supply();
        c.accumulate(&mut acc, &40);
        c.accumulate(&mut acc, &2);
        assert_eq!(c.finish(acc), 42);
    }

    #[test]
    fn fn_collector_composes() {
        let c = FnCollector::new(
            Vec::new,
            |acc: &mut Vec<i64>, item: &i64| acc.push(*item),
            |mut a, mut b| {
                a.append(&mut b);
                a
            },
            |acc| acc.len(),
        );
        let mut acc = c.supply();
        c.accumulate(&mut acc, &1);
        c.accumulate(&mut acc, &2);
        let merged = c.combine(acc, vec![3]);
        assert_eq!(c.finish(merged), 3);
    }
}
