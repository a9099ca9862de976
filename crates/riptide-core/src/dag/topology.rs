//! DAG topology data structures.
//!
//! Defines [`Vertex`], [`Edge`], and [`Dag`] with freeze-time validation and
//! deterministic topological ordering via Kahn's algorithm.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::processor::Processor;

use super::error::DagError;

/// Unique identifier for a vertex in the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexId(pub u32);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VertexId({})", self.0)
    }
}

/// Factory producing one processor instance per vertex instance.
pub struct ProcessorSupplier<T>(Arc<dyn Fn() -> Box<dyn Processor<T>> + Send + Sync>);

impl<T> ProcessorSupplier<T> {
    /// Wraps a factory closure.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn Processor<T>> + Send + Sync + 'static,
    {
        Self(Arc::new(factory))
    }

    /// Creates a fresh processor instance.
    #[must_use]
    pub fn create(&self) -> Box<dyn Processor<T>> {
        (self.0)()
    }
}

impl<T> Clone for ProcessorSupplier<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for ProcessorSupplier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProcessorSupplier(..)")
    }
}

/// Extracts a partitioning key from an event.
pub type KeyFn<T> = Arc<dyn Fn(&T) -> u64 + Send + Sync>;

/// Maps a partitioning key and instance count to an instance index.
pub type PartitionFn = Arc<dyn Fn(u64, usize) -> usize + Send + Sync>;

/// How events on an edge are routed across the destination's instances.
///
/// Watermarks and end-of-stream markers always go to every instance,
/// whatever the pattern; only regular events are routed.
pub enum Forwarding<T> {
    /// Each event goes to one instance, round-robin.
    Unicast,
    /// Each event is delivered to every instance.
    Broadcast,
    /// Each event goes to the instance its key hashes to.
    Partitioned {
        /// Key extraction function.
        key_fn: KeyFn<T>,
        /// Optional custom key-to-instance mapping; defaults to `key % n`.
        partition_fn: Option<PartitionFn>,
    },
    /// Every event goes to instance zero.
    AllToOne,
}

impl<T> Clone for Forwarding<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Unicast => Self::Unicast,
            Self::Broadcast => Self::Broadcast,
            Self::AllToOne => Self::AllToOne,
            Self::Partitioned {
                key_fn,
                partition_fn,
            } => Self::Partitioned {
                key_fn: Arc::clone(key_fn),
                partition_fn: partition_fn.as_ref().map(Arc::clone),
            },
        }
    }
}

impl<T> fmt::Debug for Forwarding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unicast => write!(f, "Unicast"),
            Self::Broadcast => write!(f, "Broadcast"),
            Self::Partitioned { .. } => write!(f, "Partitioned(..)"),
            Self::AllToOne => write!(f, "AllToOne"),
        }
    }
}

/// A vertex: a named processor factory with a local parallelism.
pub struct Vertex<T> {
    /// Unique vertex identifier.
    pub id: VertexId,
    /// Unique human-readable name.
    pub name: String,
    /// Factory for this vertex's processor instances.
    pub supplier: ProcessorSupplier<T>,
    /// Number of parallel instances on this member.
    pub local_parallelism: usize,
    /// Outbound edges, by position in the DAG's edge list.
    pub(crate) outputs: SmallVec<[usize; 4]>,
    /// Inbound edges, by position in the DAG's edge list.
    pub(crate) inputs: SmallVec<[usize; 4]>,
}

impl<T> fmt::Debug for Vertex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("local_parallelism", &self.local_parallelism)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}

/// Builder for an edge between two named vertices.
///
/// ```rust,ignore
/// Edge::between("words", "count")
///     .priority(1)
///     .partitioned(|w: &String| fxhash::hash64(w))
/// ```
pub struct Edge<T> {
    source_name: String,
    dest_name: String,
    source_ordinal: usize,
    dest_ordinal: usize,
    priority: i32,
    forwarding: Forwarding<T>,
    distributed: bool,
}

impl<T> Edge<T> {
    /// An edge from ordinal 0 of `source` to ordinal 0 of `dest`, unicast,
    /// priority 0, local.
    #[must_use]
    pub fn between(source: &str, dest: &str) -> Self {
        Self {
            source_name: source.to_string(),
            dest_name: dest.to_string(),
            source_ordinal: 0,
            dest_ordinal: 0,
            priority: 0,
            forwarding: Forwarding::Unicast,
            distributed: false,
        }
    }

    /// Sets the ordinal the edge leaves the source through.
    #[must_use]
    pub fn source_ordinal(mut self, ordinal: usize) -> Self {
        self.source_ordinal = ordinal;
        self
    }

    /// Sets the ordinal the edge enters the destination through.
    #[must_use]
    pub fn dest_ordinal(mut self, ordinal: usize) -> Self {
        self.dest_ordinal = ordinal;
        self
    }

    /// Sets the fan-in priority; lower values are drained first.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delivers every event to every destination instance.
    #[must_use]
    pub fn broadcast(mut self) -> Self {
        self.forwarding = Forwarding::Broadcast;
        self
    }

    /// Routes every event to destination instance zero.
    #[must_use]
    pub fn all_to_one(mut self) -> Self {
        self.forwarding = Forwarding::AllToOne;
        self
    }

    /// Routes events by key hash across destination instances.
    #[must_use]
    pub fn partitioned<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&T) -> u64 + Send + Sync + 'static,
    {
        self.forwarding = Forwarding::Partitioned {
            key_fn: Arc::new(key_fn),
            partition_fn: None,
        };
        self
    }

    /// Routes events by key with a custom key-to-instance mapping.
    #[must_use]
    pub fn partitioned_with<F, P>(mut self, key_fn: F, partition_fn: P) -> Self
    where
        F: Fn(&T) -> u64 + Send + Sync + 'static,
        P: Fn(u64, usize) -> usize + Send + Sync + 'static,
    {
        self.forwarding = Forwarding::Partitioned {
            key_fn: Arc::new(key_fn),
            partition_fn: Some(Arc::new(partition_fn)),
        };
        self
    }

    /// Marks the edge as crossing members.
    ///
    /// The single-member executor routes distributed edges locally; the flag
    /// exists for the cluster transport collaborator.
    #[must_use]
    pub fn distributed(mut self) -> Self {
        self.distributed = true;
        self
    }
}

/// A resolved edge in a frozen DAG.
pub struct DagEdge<T> {
    /// Source vertex.
    pub source: VertexId,
    /// Destination vertex.
    pub dest: VertexId,
    /// Ordinal on the source side.
    pub source_ordinal: usize,
    /// Ordinal on the destination side.
    pub dest_ordinal: usize,
    /// Fan-in priority; lower values are drained first.
    pub priority: i32,
    /// Routing pattern for regular events.
    pub forwarding: Forwarding<T>,
    /// Whether the edge crosses members.
    pub distributed: bool,
}

impl<T> fmt::Debug for DagEdge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DagEdge")
            .field("source", &self.source)
            .field("dest", &self.dest)
            .field("source_ordinal", &self.source_ordinal)
            .field("dest_ordinal", &self.dest_ordinal)
            .field("priority", &self.priority)
            .field("forwarding", &self.forwarding)
            .field("distributed", &self.distributed)
            .finish()
    }
}

/// A dataflow graph of vertices and edges.
pub struct Dag<T> {
    vertices: Vec<Vertex<T>>,
    edges: Vec<DagEdge<T>>,
    name_index: FxHashMap<String, VertexId>,
    topo_order: Vec<VertexId>,
    frozen: bool,
}

impl<T> Dag<T> {
    /// Creates an empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
            name_index: FxHashMap::default(),
            topo_order: Vec::new(),
            frozen: false,
        }
    }

    /// Adds a vertex.
    ///
    /// # Errors
    ///
    /// Returns [`DagError::DuplicateVertex`] for a reused name,
    /// [`DagError::InvalidParallelism`] for zero parallelism, or
    /// [`DagError::Frozen`] after freezing.
    pub fn vertex(
        &mut self,
        name: impl Into<String>,
        supplier: ProcessorSupplier<T>,
        local_parallelism: usize,
    ) -> Result<VertexId, DagError> {
        if self.frozen {
            return Err(DagError::Frozen);
        }
        let name = name.into();
        if self.name_index.contains_key(&name) {
            return Err(DagError::DuplicateVertex(name));
        }
        if local_parallelism == 0 {
            return Err(DagError::InvalidParallelism { vertex: name });
        }

        #[allow(clippy::cast_possible_truncation)]
        let id = VertexId(self.vertices.len() as u32);
        self.vertices.push(Vertex {
            id,
            name: name.clone(),
            supplier,
            local_parallelism,
            outputs: SmallVec::new(),
            inputs: SmallVec::new(),
        });
        self.name_index.insert(name, id);
        Ok(id)
    }

    /// Adds an edge, resolving its endpoint names.
    ///
    /// # Errors
    ///
    /// Returns [`DagError::VertexNotFound`] for an unknown endpoint,
    /// [`DagError::CycleDetected`] for a self-loop,
    /// [`DagError::SourceOrdinalInUse`] / [`DagError::DestOrdinalInUse`] for
    /// a reused ordinal, or [`DagError::Frozen`] after freezing.
    pub fn edge(&mut self, edge: Edge<T>) -> Result<(), DagError> {
        if self.frozen {
            return Err(DagError::Frozen);
        }
        let source = *self
            .name_index
            .get(&edge.source_name)
            .ok_or_else(|| DagError::VertexNotFound(edge.source_name.clone()))?;
        let dest = *self
            .name_index
            .get(&edge.dest_name)
            .ok_or_else(|| DagError::VertexNotFound(edge.dest_name.clone()))?;
        if source == dest {
            return Err(DagError::CycleDetected(edge.source_name));
        }

        let source_vertex = &self.vertices[source.0 as usize];
        if source_vertex
            .outputs
            .iter()
            .any(|&e| self.edges[e].source_ordinal == edge.source_ordinal)
        {
            return Err(DagError::SourceOrdinalInUse {
                vertex: source_vertex.name.clone(),
                ordinal: edge.source_ordinal,
            });
        }
        let dest_vertex = &self.vertices[dest.0 as usize];
        if dest_vertex
            .inputs
            .iter()
            .any(|&e| self.edges[e].dest_ordinal == edge.dest_ordinal)
        {
            return Err(DagError::DestOrdinalInUse {
                vertex: dest_vertex.name.clone(),
                ordinal: edge.dest_ordinal,
            });
        }

        let pos = self.edges.len();
        self.edges.push(DagEdge {
            source,
            dest,
            source_ordinal: edge.source_ordinal,
            dest_ordinal: edge.dest_ordinal,
            priority: edge.priority,
            forwarding: edge.forwarding,
            distributed: edge.distributed,
        });
        self.vertices[source.0 as usize].outputs.push(pos);
        self.vertices[dest.0 as usize].inputs.push(pos);
        Ok(())
    }

    /// Validates the topology and freezes the DAG.
    ///
    /// # Errors
    ///
    /// Returns [`DagError::EmptyDag`] with no vertices,
    /// [`DagError::CycleDetected`] for a cyclic graph, or
    /// [`DagError::NonContiguousOrdinals`] when a vertex's ordinals on
    /// either side do not form `0..n`.
    pub fn freeze(&mut self) -> Result<(), DagError> {
        if self.frozen {
            return Ok(());
        }
        if self.vertices.is_empty() {
            return Err(DagError::EmptyDag);
        }
        self.check_ordinal_contiguity()?;
        self.topo_order = self.kahn_topo_sort()?;
        self.frozen = true;
        Ok(())
    }

    /// Whether [`freeze`](Self::freeze) has run.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// All vertices, indexed by `VertexId.0`.
    #[must_use]
    pub fn vertices(&self) -> &[Vertex<T>] {
        &self.vertices
    }

    /// All edges.
    #[must_use]
    pub fn edges(&self) -> &[DagEdge<T>] {
        &self.edges
    }

    /// Looks up a vertex by id.
    #[must_use]
    pub fn vertex_at(&self, id: VertexId) -> &Vertex<T> {
        &self.vertices[id.0 as usize]
    }

    /// Looks up a vertex id by name.
    #[must_use]
    pub fn vertex_id(&self, name: &str) -> Option<VertexId> {
        self.name_index.get(name).copied()
    }

    /// Outbound edges of a vertex.
    pub fn outbound_edges(&self, id: VertexId) -> impl Iterator<Item = &DagEdge<T>> {
        self.vertices[id.0 as usize]
            .outputs
            .iter()
            .map(|&e| &self.edges[e])
    }

    /// Inbound edges of a vertex.
    pub fn inbound_edges(&self, id: VertexId) -> impl Iterator<Item = &DagEdge<T>> {
        self.vertices[id.0 as usize]
            .inputs
            .iter()
            .map(|&e| &self.edges[e])
    }

    /// Vertices in topological order (dependencies first). Empty until
    /// frozen.
    #[must_use]
    pub fn topological_order(&self) -> &[VertexId] {
        &self.topo_order
    }

    fn check_ordinal_contiguity(&self) -> Result<(), DagError> {
        for vertex in &self.vertices {
            for (list, is_output) in [(&vertex.outputs, true), (&vertex.inputs, false)] {
                let ordinals: FxHashSet<usize> = list
                    .iter()
                    .map(|&e| {
                        if is_output {
                            self.edges[e].source_ordinal
                        } else {
                            self.edges[e].dest_ordinal
                        }
                    })
                    .collect();
                if (0..list.len()).any(|o| !ordinals.contains(&o)) {
                    return Err(DagError::NonContiguousOrdinals {
                        vertex: vertex.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm with sorted tie-breaking for a deterministic order.
    fn kahn_topo_sort(&self) -> Result<Vec<VertexId>, DagError> {
        let mut in_degree = vec![0usize; self.vertices.len()];
        for edge in &self.edges {
            in_degree[edge.dest.0 as usize] += 1;
        }

        let mut queue: VecDeque<VertexId> = (0..self.vertices.len())
            .filter(|&i| in_degree[i] == 0)
            .map(|i| {
                #[allow(clippy::cast_possible_truncation)]
                VertexId(i as u32)
            })
            .collect();

        let mut order = Vec::with_capacity(self.vertices.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            let mut unblocked: Vec<VertexId> = Vec::new();
            for &e in &self.vertices[id.0 as usize].outputs {
                let dest = self.edges[e].dest;
                let deg = &mut in_degree[dest.0 as usize];
                *deg -= 1;
                if *deg == 0 {
                    unblocked.push(dest);
                }
            }
            unblocked.sort_by_key(|v| v.0);
            queue.extend(unblocked);
        }

        if order.len() < self.vertices.len() {
            let ordered: FxHashSet<VertexId> = order.iter().copied().collect();
            let culprit = self
                .vertices
                .iter()
                .find(|v| !ordered.contains(&v.id))
                .map_or_else(|| "unknown".to_string(), |v| v.name.clone());
            return Err(DagError::CycleDetected(culprit));
        }
        Ok(order)
    }
}

impl<T> Default for Dag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Dag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("vertices", &self.vertices.len())
            .field("edges", &self.edges.len())
            .field("frozen", &self.frozen)
            .field("topo_order", &self.topo_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::noop_supplier;

    fn two_vertex_dag() -> Dag<i64> {
        let mut dag = Dag::new();
        dag.vertex("a", noop_supplier(), 1).unwrap();
        dag.vertex("b", noop_supplier(), 1).unwrap();
        dag
    }

    #[test]
    fn duplicate_vertex_name_is_rejected() {
        let mut dag: Dag<i64> = Dag::new();
        dag.vertex("a", noop_supplier(), 1).unwrap();
        assert!(matches!(
            dag.vertex("a", noop_supplier(), 1),
            Err(DagError::DuplicateVertex(_))
        ));
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let mut dag: Dag<i64> = Dag::new();
        assert!(matches!(
            dag.vertex("a", noop_supplier(), 0),
            Err(DagError::InvalidParallelism { .. })
        ));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut dag = two_vertex_dag();
        assert!(matches!(
            dag.edge(Edge::between("a", "missing")),
            Err(DagError::VertexNotFound(_))
        ));
    }

    #[test]
    fn self_loop_is_rejected() {
        let mut dag = two_vertex_dag();
        assert!(matches!(
            dag.edge(Edge::between("a", "a")),
            Err(DagError::CycleDetected(_))
        ));
    }

    #[test]
    fn reused_ordinals_are_rejected() {
        let mut dag: Dag<i64> = Dag::new();
        dag.vertex("a", noop_supplier(), 1).unwrap();
        dag.vertex("b", noop_supplier(), 1).unwrap();
        dag.vertex("c", noop_supplier(), 1).unwrap();
        dag.edge(Edge::between("a", "b")).unwrap();
        assert!(matches!(
            dag.edge(Edge::between("a", "c")),
            Err(DagError::SourceOrdinalInUse { .. })
        ));
        dag.edge(Edge::between("a", "c").source_ordinal(1)).unwrap();
        assert!(matches!(
            dag.edge(Edge::between("c", "b")),
            Err(DagError::DestOrdinalInUse { .. })
        ));
    }

    #[test]
    fn cycle_is_detected_at_freeze() {
        let mut dag: Dag<i64> = Dag::new();
        dag.vertex("a", noop_supplier(), 1).unwrap();
        dag.vertex("b", noop_supplier(), 1).unwrap();
        dag.vertex("c", noop_supplier(), 1).unwrap();
        dag.edge(Edge::between("a", "b")).unwrap();
        dag.edge(Edge::between("b", "c")).unwrap();
        dag.edge(Edge::between("c", "a")).unwrap();
        assert!(matches!(dag.freeze(), Err(DagError::CycleDetected(_))));
    }

    #[test]
    fn freeze_computes_topological_order() {
        let mut dag: Dag<i64> = Dag::new();
        let a = dag.vertex("a", noop_supplier(), 1).unwrap();
        let b = dag.vertex("b", noop_supplier(), 1).unwrap();
        let c = dag.vertex("c", noop_supplier(), 1).unwrap();
        dag.edge(Edge::between("a", "c")).unwrap();
        dag.edge(Edge::between("b", "c")).unwrap();
        dag.freeze().unwrap();

        assert_eq!(dag.topological_order(), &[a, b, c]);
        assert!(dag.is_frozen());
        assert!(matches!(
            dag.vertex("d", noop_supplier(), 1),
            Err(DagError::Frozen)
        ));
    }

    #[test]
    fn empty_dag_cannot_freeze() {
        let mut dag: Dag<i64> = Dag::new();
        assert!(matches!(dag.freeze(), Err(DagError::EmptyDag)));
    }

    #[test]
    fn non_contiguous_ordinals_fail_freeze() {
        let mut dag = two_vertex_dag();
        dag.edge(Edge::between("a", "b").source_ordinal(1).dest_ordinal(2))
            .unwrap();
        assert!(matches!(
            dag.freeze(),
            Err(DagError::NonContiguousOrdinals { .. })
        ));
    }
}
