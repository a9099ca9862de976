//! # DAG Model
//!
//! Vertices, edges, and forwarding patterns for dataflow jobs.
//!
//! A [`Dag`] is built mutably (vertices first, then edges) and frozen
//! before submission. Freezing validates the topology (unique names, ordinal
//! uniqueness and contiguity, no dangling endpoints, no cycles) and computes
//! a deterministic topological order; a frozen DAG is immutable.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut dag = Dag::new();
//! dag.vertex("tokenize", tokenizer_supplier, 1)?;
//! dag.vertex("count", counter_supplier, 4)?;
//! dag.edge(Edge::between("tokenize", "count").partitioned(|word| hash(word)))?;
//! dag.freeze()?;
//! ```

pub mod error;
pub mod topology;

pub use error::DagError;
pub use topology::{
    Dag, DagEdge, Edge, Forwarding, KeyFn, PartitionFn, ProcessorSupplier, Vertex, VertexId,
};
