//! Error types for DAG construction and validation.

/// Errors that can occur while building or freezing a DAG.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// A vertex with the same name already exists.
    #[error("duplicate vertex name: {0}")]
    DuplicateVertex(String),

    /// An edge references a vertex that does not exist.
    #[error("vertex not found: {0}")]
    VertexNotFound(String),

    /// The DAG contains a cycle involving the named vertex.
    #[error("cycle detected involving vertex: {0}")]
    CycleDetected(String),

    /// Two edges leave the same vertex through the same ordinal.
    #[error("source ordinal {ordinal} of vertex '{vertex}' is already connected")]
    SourceOrdinalInUse {
        /// Vertex the edges leave from.
        vertex: String,
        /// The contested ordinal.
        ordinal: usize,
    },

    /// Two edges enter the same vertex through the same ordinal.
    #[error("destination ordinal {ordinal} of vertex '{vertex}' is already connected")]
    DestOrdinalInUse {
        /// Vertex the edges enter.
        vertex: String,
        /// The contested ordinal.
        ordinal: usize,
    },

    /// A vertex's inbound or outbound ordinals do not form `0..n`.
    #[error("ordinals of vertex '{vertex}' are not contiguous from zero")]
    NonContiguousOrdinals {
        /// The offending vertex.
        vertex: String,
    },

    /// A vertex was declared with zero parallelism.
    #[error("vertex '{vertex}' has invalid local parallelism 0")]
    InvalidParallelism {
        /// The offending vertex.
        vertex: String,
    },

    /// The DAG has no vertices.
    #[error("empty DAG: no vertices")]
    EmptyDag,

    /// Mutation was attempted after the DAG was frozen.
    #[error("DAG is frozen")]
    Frozen,
}
