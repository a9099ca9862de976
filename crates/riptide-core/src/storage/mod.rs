//! # Binary Storage
//!
//! Key/value records packed into pooled memory blocks, with per-partition
//! hashed lookup, insertion-order scans, and per-key accumulation on insert.
//!
//! Keys are assigned to partitions by a stable 64-bit hash of their bytes;
//! each partition owns its block chain, its open-addressed hash index, and
//! its insertion-order slot vector. Partitioning is what lets the sorter
//! sort and spill partitions independently.

pub mod accumulator;
pub mod binary;
pub mod comparator;

pub use accumulator::{Accumulator, IntSumAccumulator};
pub use binary::{BinaryStorage, Slot};
pub use comparator::{BytewiseComparator, Comparator, StringComparator};

use std::path::PathBuf;

use crate::memory::{ChainingRule, MemoryError, DEFAULT_BLOCK_BYTES};

/// Direction of a sorted cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Ascending key order.
    #[default]
    Asc,
    /// Descending key order.
    Desc,
}

/// Errors raised by binary storage and the sorted aggregator.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No block could be acquired for a new record.
    #[error("store memory exhausted: {0}")]
    MemoryExhausted(#[from] MemoryError),

    /// A spill file could not be written or read back.
    #[error("spill I/O failed: {0}")]
    SpillIo(#[from] std::io::Error),
}

/// Configuration for binary storage and the sorted aggregator.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Size of blocks in the heap pool.
    pub heap_block_bytes: usize,
    /// Size of blocks in the native pool.
    pub native_block_bytes: usize,
    /// Maximum blocks the heap pool may create.
    pub heap_pool_blocks: usize,
    /// Maximum blocks the native pool may create.
    pub native_pool_blocks: usize,
    /// Number of partitions; must be a power of two.
    pub partition_count: usize,
    /// Size of the spill writer's in-memory buffer, in bytes.
    pub spilling_buffer_size: usize,
    /// Flush granularity of spilled runs, in bytes.
    pub spilling_chunk_size: usize,
    /// Which pools serve a store's block chains, and in what order.
    pub chaining_rule: ChainingRule,
    /// Direction of the sorted cursor.
    pub sort_order: SortOrder,
    /// Encode record length fields big-endian instead of little-endian.
    pub use_big_endian: bool,
    /// Spill sorted runs to disk under memory pressure instead of failing.
    pub spilling_enabled: bool,
    /// Directory spilled runs are written to.
    pub spill_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            heap_block_bytes: DEFAULT_BLOCK_BYTES,
            native_block_bytes: DEFAULT_BLOCK_BYTES,
            heap_pool_blocks: 1024,
            native_pool_blocks: 1024,
            partition_count: 2,
            spilling_buffer_size: 64 * 1024,
            spilling_chunk_size: 16 * 1024,
            chaining_rule: ChainingRule::default(),
            sort_order: SortOrder::default(),
            use_big_endian: false,
            spilling_enabled: false,
            spill_dir: std::env::temp_dir(),
        }
    }
}

impl StorageConfig {
    pub(crate) fn assert_valid(&self) {
        assert!(
            self.partition_count.is_power_of_two(),
            "partition_count must be a power of two"
        );
    }
}

/// Fixed-endianness integer codec for record fields.
///
/// The endianness of a store is chosen once at construction and every length
/// and link field in its records and spill files uses it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Codec {
    big_endian: bool,
}

impl Codec {
    pub(crate) fn new(big_endian: bool) -> Self {
        Self { big_endian }
    }

    pub(crate) fn write_u32(self, out: &mut [u8], value: u32) {
        let bytes = if self.big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        out[..4].copy_from_slice(&bytes);
    }

    pub(crate) fn read_u32(self, bytes: &[u8]) -> u32 {
        let arr: [u8; 4] = bytes[..4].try_into().expect("4 bytes");
        if self.big_endian {
            u32::from_be_bytes(arr)
        } else {
            u32::from_le_bytes(arr)
        }
    }

    pub(crate) fn write_u64(self, out: &mut [u8], value: u64) {
        let bytes = if self.big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        out[..8].copy_from_slice(&bytes);
    }

    pub(crate) fn read_u64(self, bytes: &[u8]) -> u64 {
        let arr: [u8; 8] = bytes[..8].try_into().expect("8 bytes");
        if self.big_endian {
            u64::from_be_bytes(arr)
        } else {
            u64::from_le_bytes(arr)
        }
    }

    pub(crate) fn write_i64(self, out: &mut [u8], value: i64) {
        #[allow(clippy::cast_sign_loss)]
        self.write_u64(out, value as u64);
    }

    pub(crate) fn read_i64(self, bytes: &[u8]) -> i64 {
        #[allow(clippy::cast_possible_wrap)]
        {
            self.read_u64(bytes) as i64
        }
    }
}
