//! # Block-Based Memory Management
//!
//! Fixed-size memory blocks drawn from bounded pools, chained per logical
//! store. A block is a contiguous byte region with a bump cursor; records are
//! addressed by `(block, offset)` pairs and are never moved or overwritten
//! once committed.
//!
//! Blocks are owned exclusively by one chain at a time and are returned to
//! their pool when the chain is dropped, so a pool's `in_use` count going
//! back to zero is the leak check for a whole store.

pub mod block;
pub mod pool;

pub use block::{BlockChain, MemoryBlock, SlotAddr};
pub use pool::{BlockPool, ChainingRule, MemoryContext, PoolKind};

/// Default block size: 128 KiB.
pub const DEFAULT_BLOCK_BYTES: usize = 128 * 1024;

/// Errors raised by block allocation.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Every pool the chaining rule allows is out of blocks.
    #[error("block pool exhausted: {in_use} of {capacity} blocks in use")]
    PoolExhausted {
        /// Blocks currently handed out by the pool that was tried last.
        in_use: usize,
        /// Maximum number of blocks the pool may create.
        capacity: usize,
    },

    /// A single allocation request exceeds the block size.
    #[error("allocation of {requested} bytes exceeds block size of {block_bytes} bytes")]
    RequestTooLarge {
        /// Bytes requested in one allocation.
        requested: usize,
        /// Fixed size of the blocks serving the chain.
        block_bytes: usize,
    },
}
