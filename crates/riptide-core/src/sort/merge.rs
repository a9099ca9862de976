//! K-way merge cursor over sorted runs.
//!
//! Runs are either in-memory sorted partitions (slot vectors over block
//! storage) or spilled runs streamed back from disk; the cursor treats both
//! uniformly. A min-heap of run indices is keyed on each run's front record,
//! with ties broken by run index so that equal keys come out in insertion
//! order (earlier spills before resident data).

use std::cmp::Ordering;

use crate::storage::binary::Partition;
use crate::storage::{Accumulator, Comparator, SortOrder, StorageError};

use super::spill::SpillRunReader;

/// One source feeding the merge.
pub(crate) enum RunCursor<'a> {
    /// A sorted in-memory partition, walked by slot position.
    Mem {
        /// The partition holding the records.
        partition: &'a Partition,
        /// Current position in the sorted slot vector.
        pos: usize,
    },
    /// A spilled run streamed from disk.
    Spilled(SpillRunReader),
}

impl RunCursor<'_> {
    fn is_exhausted(&self) -> bool {
        match self {
            RunCursor::Mem { partition, pos } => *pos >= partition.slots().len(),
            RunCursor::Spilled(reader) => reader.is_exhausted(),
        }
    }

    fn key(&self) -> &[u8] {
        match self {
            RunCursor::Mem { partition, pos } => partition.key_at(partition.slots()[*pos]),
            RunCursor::Spilled(reader) => reader.key(),
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            RunCursor::Mem { partition, pos } => partition.value_at(partition.slots()[*pos]),
            RunCursor::Spilled(reader) => reader.value(),
        }
    }

    fn advance(&mut self) -> Result<(), StorageError> {
        match self {
            RunCursor::Mem { pos, .. } => {
                *pos += 1;
                Ok(())
            }
            RunCursor::Spilled(reader) => {
                reader.advance()?;
                Ok(())
            }
        }
    }
}

/// Forward-only cursor over the merged, fully ordered record set.
///
/// Restartable only by rebuilding via
/// [`SortedAggregator::cursor`](super::SortedAggregator::cursor).
pub struct PairCursor<'a> {
    runs: Vec<RunCursor<'a>>,
    heap: Vec<usize>,
    comparator: &'a dyn Comparator,
    order: SortOrder,
    accumulator: Option<&'a dyn Accumulator>,
    key: Vec<u8>,
    value: Vec<u8>,
    scratch: Vec<u8>,
}

impl<'a> PairCursor<'a> {
    pub(crate) fn new(
        runs: Vec<RunCursor<'a>>,
        comparator: &'a dyn Comparator,
        order: SortOrder,
        accumulator: Option<&'a dyn Accumulator>,
    ) -> Self {
        let mut cursor = Self {
            runs,
            heap: Vec::new(),
            comparator,
            order,
            accumulator,
            key: Vec::new(),
            value: Vec::new(),
            scratch: Vec::new(),
        };
        for idx in 0..cursor.runs.len() {
            if !cursor.runs[idx].is_exhausted() {
                let (heap, runs) = (&mut cursor.heap, &cursor.runs);
                heap_push(heap, idx, &mut |a, b| {
                    run_less(runs, comparator, order, a, b)
                });
            }
        }
        cursor
    }

    /// Moves to the next pair. Returns `false` when the set is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SpillIo`] if a spilled run fails to read.
    pub fn advance(&mut self) -> Result<bool, StorageError> {
        let comparator = self.comparator;
        let order = self.order;

        let Some(front) = ({
            let (heap, runs) = (&mut self.heap, &self.runs);
            heap_pop(heap, &mut |a, b| run_less(runs, comparator, order, a, b))
        }) else {
            return Ok(false);
        };

        self.key.clear();
        self.key.extend_from_slice(self.runs[front].key());
        self.value.clear();
        self.value.extend_from_slice(self.runs[front].value());
        self.reinsert(front)?;

        if let Some(acc) = self.accumulator {
            // Equal keys can straddle runs after a spill; fold them here so
            // each key emerges exactly once, in insertion order.
            loop {
                let Some(&next) = self.heap.first() else { break };
                if self.comparator.compare(self.runs[next].key(), &self.key) != Ordering::Equal {
                    break;
                }
                let (heap, runs) = (&mut self.heap, &self.runs);
                let next = heap_pop(heap, &mut |a, b| run_less(runs, comparator, order, a, b))
                    .expect("peeked entry present");
                self.scratch.clear();
                acc.combine(&self.value, self.runs[next].value(), &mut self.scratch);
                std::mem::swap(&mut self.value, &mut self.scratch);
                self.reinsert(next)?;
            }
        }
        Ok(true)
    }

    /// Key bytes of the current pair.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value bytes of the current pair.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    fn reinsert(&mut self, run: usize) -> Result<(), StorageError> {
        self.runs[run].advance()?;
        if !self.runs[run].is_exhausted() {
            let comparator = self.comparator;
            let order = self.order;
            let (heap, runs) = (&mut self.heap, &self.runs);
            heap_push(heap, run, &mut |a, b| {
                run_less(runs, comparator, order, a, b)
            });
        }
        Ok(())
    }
}

fn run_less(
    runs: &[RunCursor<'_>],
    comparator: &dyn Comparator,
    order: SortOrder,
    a: usize,
    b: usize,
) -> bool {
    let ord = comparator.compare(runs[a].key(), runs[b].key());
    let ord = match order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
    };
    ord.then(a.cmp(&b)) == Ordering::Less
}

fn heap_push(heap: &mut Vec<usize>, item: usize, less: &mut impl FnMut(usize, usize) -> bool) {
    heap.push(item);
    let mut i = heap.len() - 1;
    while i > 0 {
        let parent = (i - 1) / 2;
        if less(heap[i], heap[parent]) {
            heap.swap(i, parent);
            i = parent;
        } else {
            break;
        }
    }
}

fn heap_pop(heap: &mut Vec<usize>, less: &mut impl FnMut(usize, usize) -> bool) -> Option<usize> {
    if heap.is_empty() {
        return None;
    }
    let last = heap.len() - 1;
    heap.swap(0, last);
    let top = heap.pop();
    let mut i = 0;
    loop {
        let (l, r) = (2 * i + 1, 2 * i + 2);
        let mut smallest = i;
        if l < heap.len() && less(heap[l], heap[smallest]) {
            smallest = l;
        }
        if r < heap.len() && less(heap[r], heap[smallest]) {
            smallest = r;
        }
        if smallest == i {
            break;
        }
        heap.swap(i, smallest);
        i = smallest;
    }
    top
}
