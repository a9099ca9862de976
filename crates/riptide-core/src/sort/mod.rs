//! # Sorted Aggregator
//!
//! A memory-bounded external sort over [`BinaryStorage`]: records are
//! accepted into partitioned block storage (optionally collapsing equal keys
//! through an [`Accumulator`]), partitions are sorted one cooperative slice
//! at a time, and a k-way merge cursor yields the fully ordered result.
//!
//! Under memory pressure with spilling enabled, each partition's sorted run
//! is written to disk and the partition is reset; the merge treats resident
//! partitions and spilled runs uniformly. With spilling disabled, pressure
//! surfaces as [`accept`](SortedAggregator::accept) returning `false`.

mod merge;
mod spill;

pub use merge::PairCursor;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::memory::{MemoryContext, MemoryError};
use crate::storage::binary::Partition;
use crate::storage::{
    Accumulator, BinaryStorage, Comparator, SortOrder, StorageConfig, StorageError,
};

use merge::RunCursor;
use spill::{SpillRun, SpillRunReader, SpillWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Insert,
    Sorting { next: usize },
    Sorted,
}

/// Partitioned, spilling external sorter with grouped accumulation.
///
/// Call sequence: [`accept`](Self::accept) any number of times, then
/// [`prepare_to_sort`](Self::prepare_to_sort), then loop
/// [`sort`](Self::sort) until it returns `true`, then
/// [`cursor`](Self::cursor).
pub struct SortedAggregator {
    storage: BinaryStorage,
    comparator: Arc<dyn Comparator>,
    accumulator: Option<Arc<dyn Accumulator>>,
    order: SortOrder,
    spilling_enabled: bool,
    spill_dir: PathBuf,
    spilling_buffer_size: usize,
    spilling_chunk_size: usize,
    spilled: Vec<SpillRun>,
    phase: Phase,
}

impl SortedAggregator {
    /// Creates an aggregator drawing blocks from `ctx` per `config`.
    ///
    /// # Panics
    ///
    /// Panics if `config.partition_count` is not a power of two.
    #[must_use]
    pub fn new(
        ctx: &MemoryContext,
        config: &StorageConfig,
        comparator: Arc<dyn Comparator>,
        accumulator: Option<Arc<dyn Accumulator>>,
    ) -> Self {
        Self {
            storage: BinaryStorage::new(ctx, config),
            comparator,
            accumulator,
            order: config.sort_order,
            spilling_enabled: config.spilling_enabled,
            spill_dir: config.spill_dir.clone(),
            spilling_buffer_size: config.spilling_buffer_size,
            spilling_chunk_size: config.spilling_chunk_size,
            spilled: Vec::new(),
            phase: Phase::Insert,
        }
    }

    /// Accepts one key/value pair.
    ///
    /// Returns `false` when a new record is needed, no block is available,
    /// and spilling is disabled; the dataset is then complete as-is and the
    /// caller decides whether to sort what fits or fail.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SpillIo`] if writing a spill run fails, or
    /// [`StorageError::MemoryExhausted`] if a single record cannot fit in a
    /// fresh block even after spilling.
    ///
    /// # Panics
    ///
    /// Panics if called after [`prepare_to_sort`](Self::prepare_to_sort).
    pub fn accept(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StorageError> {
        assert_eq!(self.phase, Phase::Insert, "accept after prepare_to_sort");

        match self
            .storage
            .put_with(key, value, self.accumulator.as_deref())
        {
            Ok(()) => Ok(true),
            Err(StorageError::MemoryExhausted(MemoryError::PoolExhausted { .. }))
                if self.spilling_enabled =>
            {
                self.spill_partitions()?;
                self.storage
                    .put_with(key, value, self.accumulator.as_deref())?;
                Ok(true)
            }
            Err(StorageError::MemoryExhausted(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Freezes insertion. The data is already partitioned by key hash.
    pub fn prepare_to_sort(&mut self) {
        if self.phase == Phase::Insert {
            self.phase = Phase::Sorting { next: 0 };
        }
    }

    /// Performs one bounded slice of sort work: orders a single partition's
    /// slot vector. Returns `true` once every partition is sorted and the
    /// dataset is ready for [`cursor`](Self::cursor).
    ///
    /// # Panics
    ///
    /// Panics if called before [`prepare_to_sort`](Self::prepare_to_sort).
    pub fn sort(&mut self) -> bool {
        match self.phase {
            Phase::Insert => panic!("sort before prepare_to_sort"),
            Phase::Sorted => true,
            Phase::Sorting { next } => {
                if next >= self.storage.partition_count() {
                    self.phase = Phase::Sorted;
                    return true;
                }
                sort_partition(
                    self.storage.partition_mut(next),
                    self.comparator.as_ref(),
                    self.order,
                );
                let next = next + 1;
                if next >= self.storage.partition_count() {
                    self.phase = Phase::Sorted;
                    true
                } else {
                    self.phase = Phase::Sorting { next };
                    false
                }
            }
        }
    }

    /// Opens a forward-only cursor over the merged, ordered record set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SpillIo`] if a spilled run cannot be opened.
    ///
    /// # Panics
    ///
    /// Panics if the sort loop has not completed.
    pub fn cursor(&self) -> Result<PairCursor<'_>, StorageError> {
        assert_eq!(self.phase, Phase::Sorted, "cursor before sort completion");

        let mut runs = Vec::with_capacity(self.spilled.len() + self.storage.partition_count());
        for run in &self.spilled {
            let reader = SpillRunReader::open(run, self.spilling_buffer_size, self.storage.codec())?;
            if !reader.is_exhausted() {
                runs.push(RunCursor::Spilled(reader));
            }
        }
        for p in 0..self.storage.partition_count() {
            let partition = self.storage.partition(p);
            if partition.record_count() > 0 {
                runs.push(RunCursor::Mem { partition, pos: 0 });
            }
        }
        Ok(PairCursor::new(
            runs,
            self.comparator.as_ref(),
            self.order,
            self.accumulator.as_deref(),
        ))
    }

    /// Records currently resident in memory (spilled records excluded).
    #[must_use]
    pub fn resident_record_count(&self) -> usize {
        self.storage.record_count()
    }

    /// Number of spilled runs written so far.
    #[must_use]
    pub fn spilled_run_count(&self) -> usize {
        self.spilled.len()
    }

    /// Sorts every non-empty partition, writes each as a spilled run, and
    /// resets the partitions so their blocks return to the pool.
    fn spill_partitions(&mut self) -> Result<(), StorageError> {
        let codec = self.storage.codec();
        for p in 0..self.storage.partition_count() {
            if self.storage.partition(p).record_count() == 0 {
                continue;
            }
            sort_partition(
                self.storage.partition_mut(p),
                self.comparator.as_ref(),
                self.order,
            );
            let partition = self.storage.partition(p);
            let mut writer = SpillWriter::create(
                &self.spill_dir,
                self.spilling_buffer_size,
                self.spilling_chunk_size,
                codec,
            )?;
            for &addr in partition.slots() {
                writer.write_record(partition.key_at(addr), partition.value_at(addr))?;
            }
            self.spilled.push(writer.finish()?);
            self.storage.partition_mut(p).reset();
        }
        debug!(runs = self.spilled.len(), "spilled partitions to disk");
        Ok(())
    }
}

impl std::fmt::Debug for SortedAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedAggregator")
            .field("phase", &self.phase)
            .field("resident_records", &self.storage.record_count())
            .field("spilled_runs", &self.spilled.len())
            .finish()
    }
}

/// Stable sort of one partition's slot vector by key.
///
/// `Vec::sort_by` is stable, so equal keys keep insertion order in both
/// directions.
fn sort_partition(partition: &mut Partition, comparator: &dyn Comparator, order: SortOrder) {
    let mut slots = partition.take_slots();
    slots.sort_by(|&a, &b| {
        let ord = comparator.compare(partition.key_at(a), partition.key_at(b));
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
    partition.put_slots(slots);
}
