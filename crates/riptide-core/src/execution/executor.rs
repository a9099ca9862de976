//! The execution service: wiring, worker pool, and job lifecycle.
//!
//! [`ExecutionService::submit`] freezes the DAG, instantiates processors per
//! vertex parallelism, wires every edge as a matrix of SPSC queues wrapped in
//! inbound/outbound streams, and hands the resulting tasklets to a small
//! worker pool. Cooperative tasklets round-robin through a shared run queue
//! with bounded spin and brief parking; non-cooperative tasklets each get a
//! dedicated thread and may block freely.
//!
//! The first failure latches, cancels the job, and every processor is closed
//! exactly once. In-flight items in edge queues are discarded on cancel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::dag::{Dag, DagError, VertexId};
use crate::processor::{Item, Outbox, ProcessorContext};

use super::error::ExecError;
use super::inbound::InboundEdgeStream;
use super::outbound::OutboundEdgeStream;
use super::progress::ProgressState;
use super::queue::SpscQueue;
use super::tasklet::{ProcessorTasklet, Tasklet};

/// Consecutive empty polls a worker tolerates before parking briefly.
const SPIN_LIMIT: u32 = 16;

/// Configuration for the execution service.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker threads driving cooperative tasklets.
    pub worker_threads: usize,
    /// Capacity of each edge queue (rounded up to a power of two).
    pub queue_capacity: usize,
    /// Outbox bucket high-water mark.
    pub outbox_limit: usize,
    /// How long an idle worker parks between polls.
    pub idle_park: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: thread::available_parallelism().map_or(2, |n| n.get().min(4)),
            queue_capacity: 1024,
            outbox_limit: 512,
            idle_park: Duration::from_micros(200),
        }
    }
}

/// Submits frozen DAGs for execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionService {
    config: ExecutorConfig,
}

impl ExecutionService {
    /// Creates a service with the given configuration.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Freezes the DAG, wires it, and starts running it.
    ///
    /// Returns a [`Job`] handle immediately; completion and failure surface
    /// through [`Job::join`].
    ///
    /// # Errors
    ///
    /// Returns a [`DagError`] when the topology is invalid; this rejects the
    /// submission before anything runs.
    pub fn submit<T: Clone + Send + 'static>(&self, mut dag: Dag<T>) -> Result<Job, DagError> {
        dag.freeze()?;
        let (cooperative, dedicated) = wire(&dag, &self.config);
        debug!(
            tasklets = cooperative.len() + dedicated.len(),
            workers = self.config.worker_threads,
            "job submitted"
        );

        let state = Arc::new(JobState {
            run_queue: Mutex::new(cooperative.into_iter().collect()),
            available: Condvar::new(),
            active: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
        });
        let total = state.run_queue.lock().expect("run queue poisoned").len() + dedicated.len();
        state.active.store(total, Ordering::SeqCst);

        let mut handles = Vec::new();
        for worker in 0..self.config.worker_threads.max(1) {
            let state = Arc::clone(&state);
            let idle_park = self.config.idle_park;
            handles.push(
                thread::Builder::new()
                    .name(format!("riptide-worker-{worker}"))
                    .spawn(move || worker_loop(&state, idle_park))
                    .expect("spawn worker thread"),
            );
        }
        for (i, tasklet) in dedicated.into_iter().enumerate() {
            let state = Arc::clone(&state);
            let idle_park = self.config.idle_park;
            handles.push(
                thread::Builder::new()
                    .name(format!("riptide-blocking-{i}"))
                    .spawn(move || dedicated_loop(tasklet, &state, idle_park))
                    .expect("spawn dedicated thread"),
            );
        }

        Ok(Job { state, handles })
    }
}

/// Handle to a running job.
pub struct Job {
    state: Arc<JobState>,
    handles: Vec<JoinHandle<()>>,
}

impl Job {
    /// Requests cancellation: in-flight items are discarded and every
    /// processor is closed.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.available.notify_all();
    }

    /// Waits for the job to finish.
    ///
    /// # Errors
    ///
    /// Returns the failure that aborted the job, or
    /// [`ExecError::Cancelled`] after an external [`cancel`](Self::cancel).
    ///
    /// # Panics
    ///
    /// Panics if a worker thread itself panicked.
    pub fn join(mut self) -> Result<(), ExecError> {
        for handle in self.handles.drain(..) {
            handle.join().expect("worker thread panicked");
        }
        let failure = self
            .state
            .failure
            .lock()
            .expect("failure latch poisoned")
            .take();
        match failure {
            Some(error) => Err(error),
            None if self.state.cancelled.load(Ordering::SeqCst) => Err(ExecError::Cancelled),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("active", &self.state.active.load(Ordering::Relaxed))
            .field("cancelled", &self.state.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

struct JobState {
    run_queue: Mutex<VecDeque<Box<dyn Tasklet>>>,
    available: Condvar,
    /// Tasklets not yet done (cooperative and dedicated combined).
    active: AtomicUsize,
    cancelled: AtomicBool,
    failure: Mutex<Option<ExecError>>,
}

impl JobState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn finish_tasklet(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.available.notify_all();
        }
    }

    fn fail(&self, error: ExecError) {
        warn!(%error, "job failed");
        let mut latch = self.failure.lock().expect("failure latch poisoned");
        if latch.is_none() {
            *latch = Some(error);
        }
        drop(latch);
        self.cancelled.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }

    fn requeue(&self, tasklet: Box<dyn Tasklet>) {
        self.run_queue
            .lock()
            .expect("run queue poisoned")
            .push_back(tasklet);
        self.available.notify_one();
    }

    /// Pops the next runnable tasklet, or returns `None` when the job has no
    /// active tasklets left.
    fn acquire(&self) -> Option<Box<dyn Tasklet>> {
        let mut queue = self.run_queue.lock().expect("run queue poisoned");
        loop {
            if let Some(tasklet) = queue.pop_front() {
                return Some(tasklet);
            }
            if self.active.load(Ordering::SeqCst) == 0 {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(queue, Duration::from_millis(1))
                .expect("run queue poisoned");
            queue = guard;
        }
    }
}

fn worker_loop(state: &JobState, idle_park: Duration) {
    trace!("worker started");
    let mut consecutive_idle: u32 = 0;
    while let Some(mut tasklet) = state.acquire() {
        if state.is_cancelled() {
            tasklet.close();
            state.finish_tasklet();
            continue;
        }
        match tasklet.call() {
            Ok(ProgressState::Done) => {
                trace!(tasklet = tasklet.name(), "tasklet done");
                tasklet.close();
                state.finish_tasklet();
                consecutive_idle = 0;
            }
            Ok(ProgressState::MadeProgress) => {
                state.requeue(tasklet);
                consecutive_idle = 0;
            }
            Ok(ProgressState::NoProgress) => {
                state.requeue(tasklet);
                consecutive_idle += 1;
                if consecutive_idle > SPIN_LIMIT {
                    thread::park_timeout(idle_park);
                    consecutive_idle = 0;
                }
            }
            Err(error) => {
                state.fail(error);
                tasklet.close();
                state.finish_tasklet();
            }
        }
    }
    trace!("worker exiting");
}

fn dedicated_loop(mut tasklet: Box<dyn Tasklet>, state: &JobState, idle_park: Duration) {
    trace!(tasklet = tasklet.name(), "dedicated thread started");
    loop {
        if state.is_cancelled() {
            tasklet.close();
            state.finish_tasklet();
            return;
        }
        match tasklet.call() {
            Ok(ProgressState::Done) => {
                tasklet.close();
                state.finish_tasklet();
                return;
            }
            Ok(ProgressState::MadeProgress) => {}
            Ok(ProgressState::NoProgress) => thread::sleep(idle_park),
            Err(error) => {
                state.fail(error);
                tasklet.close();
                state.finish_tasklet();
                return;
            }
        }
    }
}

/// Instantiates processors, wires every edge as SPSC queue matrices, and
/// builds one tasklet per vertex instance.
///
/// Returns `(cooperative, dedicated)` tasklets. Distributed edges are wired
/// like local ones; the cluster transport is outside the core.
fn wire<T: Clone + Send + 'static>(
    dag: &Dag<T>,
    config: &ExecutorConfig,
) -> (Vec<Box<dyn Tasklet>>, Vec<Box<dyn Tasklet>>) {
    let vertex_count = dag.vertices().len();
    let parallelism = |id: VertexId| dag.vertex_at(id).local_parallelism;

    // Per (vertex, instance) stream holders, filled edge by edge.
    let mut inbound: Vec<Vec<Vec<InboundEdgeStream<T>>>> = (0..vertex_count)
        .map(|v| {
            #[allow(clippy::cast_possible_truncation)]
            let p = parallelism(VertexId(v as u32));
            (0..p).map(|_| Vec::new()).collect()
        })
        .collect();
    let mut outbound: Vec<Vec<Vec<Option<OutboundEdgeStream<T>>>>> = (0..vertex_count)
        .map(|v| {
            #[allow(clippy::cast_possible_truncation)]
            let id = VertexId(v as u32);
            let buckets = dag.outbound_edges(id).count();
            (0..parallelism(id))
                .map(|_| (0..buckets).map(|_| None).collect())
                .collect()
        })
        .collect();

    for edge in dag.edges() {
        let producers = parallelism(edge.source);
        let consumers = parallelism(edge.dest);
        // queue[i][j]: producer instance i into consumer instance j.
        let queues: Vec<Vec<Arc<SpscQueue<Item<T>>>>> = (0..producers)
            .map(|_| {
                (0..consumers)
                    .map(|_| Arc::new(SpscQueue::new(config.queue_capacity)))
                    .collect()
            })
            .collect();

        for (i, row) in queues.iter().enumerate() {
            outbound[edge.source.0 as usize][i][edge.source_ordinal] =
                Some(OutboundEdgeStream::new(row.clone(), edge.forwarding.clone()));
        }
        for j in 0..consumers {
            let column: Vec<Arc<SpscQueue<Item<T>>>> =
                (0..producers).map(|i| Arc::clone(&queues[i][j])).collect();
            inbound[edge.dest.0 as usize][j].push(InboundEdgeStream::new(
                column,
                edge.dest_ordinal,
                edge.priority,
            ));
        }
    }

    let mut cooperative: Vec<Box<dyn Tasklet>> = Vec::new();
    let mut dedicated: Vec<Box<dyn Tasklet>> = Vec::new();
    for vertex in dag.vertices() {
        let v = vertex.id.0 as usize;
        let instance_outbound = std::mem::take(&mut outbound[v]);
        let instance_inbound = std::mem::take(&mut inbound[v]);
        for (i, (streams_out, streams_in)) in instance_outbound
            .into_iter()
            .zip(instance_inbound)
            .enumerate()
        {
            let streams_out: Vec<OutboundEdgeStream<T>> = streams_out
                .into_iter()
                .map(|s| s.expect("every source ordinal wired"))
                .collect();
            let outbox = Outbox::new(streams_out.len(), config.outbox_limit);
            let context = ProcessorContext {
                vertex_name: vertex.name.clone(),
                global_parallelism: vertex.local_parallelism,
                local_parallelism: vertex.local_parallelism,
                instance_index: i,
            };
            let tasklet = Box::new(ProcessorTasklet::new(
                vertex.name.clone(),
                i,
                vertex.supplier.create(),
                context,
                streams_in,
                streams_out,
                outbox,
            ));
            if tasklet.is_cooperative() {
                cooperative.push(tasklet);
            } else {
                dedicated.push(tasklet);
            }
        }
    }
    (cooperative, dedicated)
}
