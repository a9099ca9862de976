//! # Riptide Core
//!
//! The core of the Riptide stream-and-batch compute engine: a cooperative
//! dataflow executor over a processor DAG, event-time session windowing,
//! and a memory-bounded external-sort aggregator.
//!
//! This crate provides:
//! - **DAG model**: vertices, edges, forwarding patterns, ordinals, priorities
//! - **Execution**: processor tasklets driven to quiescence by a small worker
//!   pool, connected by lock-free SPSC edge queues with watermark coherence
//! - **Windowing**: per-key session windows with merge-on-bridge semantics
//! - **Storage & sort**: block-based binary storage with grouped accumulation
//!   and a partitioned, spilling external sort
//!
//! ## Design Principles
//!
//! 1. **Cooperative scheduling** - a tasklet's `call` is the only suspension
//!    point; cooperative code paths never block
//! 2. **No locks on the hot path** - cross-tasklet communication goes through
//!    single-producer single-consumer queues only
//! 3. **Bounded memory** - storage draws fixed-size blocks from pools and
//!    spills sorted runs under pressure
//!
//! ## Example
//!
//! ```rust,ignore
//! use riptide_core::dag::{Dag, Edge, ProcessorSupplier};
//! use riptide_core::execution::ExecutionService;
//!
//! let mut dag = Dag::new();
//! let src = dag.vertex("numbers", source_supplier, 1)?;
//! let sink = dag.vertex("collect", sink_supplier, 4)?;
//! dag.edge(Edge::between("numbers", "collect"))?;
//!
//! let service = ExecutionService::default();
//! service.submit(dag)?.join()?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Allow unsafe in the SPSC edge queue for lock-free slot access
#![allow(unsafe_code)]

pub mod dag;
pub mod execution;
pub mod memory;
pub mod processor;
pub mod sort;
pub mod storage;
pub mod windowing;

// Re-export key types
pub use execution::{ExecutionService, ExecutorConfig, Job};

/// Result type for riptide-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for riptide-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DAG topology errors
    #[error("DAG error: {0}")]
    Dag(#[from] dag::DagError),

    /// Execution errors
    #[error("Execution error: {0}")]
    Exec(#[from] execution::ExecError),

    /// Processor errors
    #[error("Processor error: {0}")]
    Processor(#[from] processor::ProcessorError),

    /// Memory pool errors
    #[error("Memory error: {0}")]
    Memory(#[from] memory::MemoryError),

    /// Binary storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),
}
