//! # Processor SPI
//!
//! The contract between the execution core and user computations.
//!
//! A [`Processor`] consumes events and watermarks from its inbound edges and
//! produces into an [`Outbox`] with one bucket per outbound edge. Every
//! `try_*` method returns a flow-control boolean: `Ok(false)` means "call me
//! again with the same input later" and is how cooperative processors yield
//! under backpressure. Errors fail the job.

pub mod outbox;
pub mod util;

pub use outbox::Outbox;
pub use util::{noop_supplier, CollectSink, IterSource, MapProcessor};

/// A monotonic event-time signal: no future event has a timestamp below
/// `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark {
    seq: i64,
}

impl Watermark {
    /// Creates a watermark at `seq`.
    #[must_use]
    pub fn new(seq: i64) -> Self {
        Self { seq }
    }

    /// The watermark's sequence value.
    #[must_use]
    pub fn seq(self) -> i64 {
        self.seq
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wm({})", self.seq)
    }
}

/// One unit travelling through an edge queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item<T> {
    /// A user payload.
    Event(T),
    /// An event-time watermark.
    Watermark(Watermark),
    /// End-of-stream marker, enqueued once per queue by a finished producer.
    Done,
}

/// Static facts about the processor's placement, passed to
/// [`Processor::init`].
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    /// Name of the vertex this processor belongs to.
    pub vertex_name: String,
    /// Total parallel instances of the vertex across the job.
    pub global_parallelism: usize,
    /// Parallel instances of the vertex on this member.
    pub local_parallelism: usize,
    /// Index of this instance within the local instances.
    pub instance_index: usize,
}

/// Errors surfaced by processors; any of these fails the job.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The processor's own computation failed.
    #[error("processing failed: {0}")]
    Failed(String),

    /// A storage-backed processor ran into a storage failure.
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// A user computation hosted by one tasklet.
///
/// All methods are invoked from a single thread at a time; the instance owns
/// its state without synchronization. Cooperative processors must not block
/// in any method.
pub trait Processor<T>: Send {
    /// Called once before any other method.
    fn init(&mut self, _ctx: &ProcessorContext) {}

    /// Processes one event from the inbound edge with the given ordinal.
    ///
    /// Returning `Ok(false)` re-presents the same event on a later call.
    ///
    /// # Errors
    ///
    /// Any error fails the job.
    fn try_process(
        &mut self,
        ordinal: usize,
        item: &T,
        outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError>;

    /// Processes a coherent watermark.
    ///
    /// The default forwards the watermark to every outbox bucket, yielding
    /// if a bucket refuses it.
    ///
    /// # Errors
    ///
    /// Any error fails the job.
    fn try_process_watermark(
        &mut self,
        _ordinal: usize,
        wm: Watermark,
        outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError> {
        Ok(outbox.forward_watermark(wm))
    }

    /// Called repeatedly once every inbound edge is exhausted; `Ok(true)`
    /// means the processor is finished. Sources live entirely in here.
    ///
    /// # Errors
    ///
    /// Any error fails the job.
    fn complete(&mut self, _outbox: &mut Outbox<T>) -> Result<bool, ProcessorError> {
        Ok(true)
    }

    /// Whether the processor honors the cooperative contract (never blocks).
    /// Non-cooperative processors run on dedicated threads.
    fn is_cooperative(&self) -> bool {
        true
    }

    /// Called exactly once after the job finishes, fails, or is cancelled.
    fn close(&mut self) {}
}
