//! Processor tasklets: the cooperative scheduling unit.
//!
//! One tasklet wraps one processor instance. A `call` drains inbound edge
//! streams in priority order (lower priority values are exhausted first),
//! feeds pending items to the processor with the flow-control protocol,
//! flushes the outbox into outbound edge streams, and drives `complete()`
//! once every inbound stream is exhausted. The call is the only suspension
//! point; cooperative tasklets never block inside it.
//!
//! Watermarks arriving on different inbound edges are coalesced with min
//! semantics: the processor sees a watermark only once every live inbound
//! stream has reached it, so a multi-edge vertex observes a single coherent
//! watermark sequence.

use std::collections::VecDeque;

use crate::processor::{Item, Outbox, Processor, ProcessorContext, Watermark};

use super::error::ExecError;
use super::inbound::InboundEdgeStream;
use super::outbound::OutboundEdgeStream;
use super::progress::ProgressState;

/// Sentinel: no watermark observed on a stream yet.
const WM_UNSET: i64 = i64::MIN;
/// Sentinel: stream is done and no longer constrains the coalesced minimum.
const WM_DONE: i64 = i64::MAX;

/// A unit of cooperative work driven by the executor.
pub(crate) trait Tasklet: Send {
    fn name(&self) -> &str;
    fn is_cooperative(&self) -> bool;
    fn call(&mut self) -> Result<ProgressState, ExecError>;
    fn close(&mut self);
}

/// Tasklet wrapping one processor instance.
pub(crate) struct ProcessorTasklet<T: Clone + Send + 'static> {
    name: String,
    vertex_name: String,
    processor: Box<dyn Processor<T>>,
    context: ProcessorContext,
    cooperative: bool,
    /// Inbound streams sorted by `(priority, ordinal)`.
    inbound: Vec<InboundEdgeStream<T>>,
    /// Outbound streams indexed by source ordinal.
    outbound: Vec<OutboundEdgeStream<T>>,
    outbox: Outbox<T>,
    /// Items drained but not yet accepted by the processor.
    pending: VecDeque<(usize, Item<T>)>,
    drain_buf: Vec<Item<T>>,
    /// Last watermark per inbound stream, `WM_UNSET` / `WM_DONE` sentinels.
    stream_wms: Vec<i64>,
    forwarded_wm: i64,
    inbox_done: bool,
    initialized: bool,
    completed: bool,
    done_sent: Vec<bool>,
    closed: bool,
}

impl<T: Clone + Send + 'static> ProcessorTasklet<T> {
    pub(crate) fn new(
        vertex_name: String,
        instance_index: usize,
        processor: Box<dyn Processor<T>>,
        context: ProcessorContext,
        mut inbound: Vec<InboundEdgeStream<T>>,
        outbound: Vec<OutboundEdgeStream<T>>,
        outbox: Outbox<T>,
    ) -> Self {
        inbound.sort_by_key(|s| (s.priority(), s.ordinal()));
        let cooperative = processor.is_cooperative();
        let stream_wms = vec![WM_UNSET; inbound.len()];
        let done_sent = vec![false; outbound.len()];
        let inbox_done = inbound.is_empty();
        Self {
            name: format!("{vertex_name}#{instance_index}"),
            vertex_name,
            processor,
            context,
            cooperative,
            inbound,
            outbound,
            outbox,
            pending: VecDeque::new(),
            drain_buf: Vec::new(),
            stream_wms,
            forwarded_wm: WM_UNSET,
            inbox_done,
            initialized: false,
            completed: false,
            done_sent,
            closed: false,
        }
    }

    /// Drains inbound streams into the pending queue.
    ///
    /// Streams are visited in priority order; a priority group is only
    /// drained once every lower-valued group is done.
    fn drain_inbound(&mut self, made_progress: &mut bool) -> Result<(), ExecError> {
        let mut idx = 0;
        while idx < self.inbound.len() {
            let group_priority = self.inbound[idx].priority();
            let mut group_done = true;
            while idx < self.inbound.len() && self.inbound[idx].priority() == group_priority {
                if self.stream_wms[idx] != WM_DONE {
                    self.drain_buf.clear();
                    let state = self.inbound[idx].drain_to(&mut self.drain_buf)?;
                    if state.made_progress() {
                        *made_progress = true;
                    }
                    let ordinal = self.inbound[idx].ordinal();
                    let mut buf = std::mem::take(&mut self.drain_buf);
                    for item in buf.drain(..) {
                        match item {
                            Item::Event(event) => {
                                self.pending.push_back((ordinal, Item::Event(event)));
                            }
                            Item::Watermark(wm) => self.observe_watermark(idx, ordinal, wm),
                            // Inbound streams consume Done markers internally.
                            Item::Done => {}
                        }
                    }
                    self.drain_buf = buf;
                    if state.is_done() {
                        self.stream_wms[idx] = WM_DONE;
                        self.release_coalesced(ordinal);
                    } else {
                        group_done = false;
                    }
                }
                idx += 1;
            }
            if !group_done {
                break;
            }
        }
        if self.stream_wms.iter().all(|&wm| wm == WM_DONE) {
            self.inbox_done = true;
        }
        Ok(())
    }

    fn observe_watermark(&mut self, stream_idx: usize, ordinal: usize, wm: Watermark) {
        if wm.seq() > self.stream_wms[stream_idx] {
            self.stream_wms[stream_idx] = wm.seq();
        }
        self.release_coalesced(ordinal);
    }

    /// Presents the coalesced (minimum) watermark to the processor when it
    /// advanced past the last one forwarded.
    fn release_coalesced(&mut self, ordinal: usize) {
        let min = self.stream_wms.iter().copied().min().unwrap_or(WM_DONE);
        if min != WM_UNSET && min != WM_DONE && min > self.forwarded_wm {
            self.forwarded_wm = min;
            self.pending
                .push_back((ordinal, Item::Watermark(Watermark::new(min))));
        }
    }

    fn process_pending(&mut self, made_progress: &mut bool) -> Result<(), ExecError> {
        while let Some((ordinal, item)) = self.pending.front() {
            let ordinal = *ordinal;
            let accepted = match item {
                Item::Event(event) => self.processor.try_process(ordinal, event, &mut self.outbox),
                Item::Watermark(wm) => {
                    self.processor
                        .try_process_watermark(ordinal, *wm, &mut self.outbox)
                }
                Item::Done => unreachable!("Done never enters the pending queue"),
            }
            .map_err(|source| ExecError::ProcessorFailed {
                vertex: self.vertex_name.clone(),
                source,
            })?;

            if !accepted {
                break;
            }
            self.pending.pop_front();
            *made_progress = true;
            if self.outbox.has_reached_any_limit() {
                break;
            }
        }
        Ok(())
    }

    fn flush_outbox(&mut self, made_progress: &mut bool) {
        for ordinal in 0..self.outbound.len() {
            let stream = &mut self.outbound[ordinal];
            let bucket = self.outbox.bucket_mut(ordinal);
            while let Some(front) = bucket.front() {
                if stream.offer(front) {
                    bucket.pop_front();
                    *made_progress = true;
                } else {
                    break;
                }
            }
        }
    }

    /// Drives `complete()` and, once the outbox is fully flushed, emits the
    /// end-of-stream marker on every outbound edge. Returns whether the
    /// tasklet is finished.
    fn drive_completion(&mut self, made_progress: &mut bool) -> Result<bool, ExecError> {
        if !self.completed {
            let before = self.outbox.is_empty();
            let finished = self
                .processor
                .complete(&mut self.outbox)
                .map_err(|source| ExecError::ProcessorFailed {
                    vertex: self.vertex_name.clone(),
                    source,
                })?;
            if finished || (before && !self.outbox.is_empty()) {
                *made_progress = true;
            }
            self.completed = finished;
            self.flush_outbox(made_progress);
        }

        if self.completed && self.outbox.is_empty() {
            let mut all_sent = true;
            for (i, stream) in self.outbound.iter_mut().enumerate() {
                if !self.done_sent[i] {
                    if stream.offer(&Item::Done) {
                        self.done_sent[i] = true;
                        *made_progress = true;
                    } else {
                        all_sent = false;
                    }
                }
            }
            return Ok(all_sent);
        }
        Ok(false)
    }
}

impl<T: Clone + Send + 'static> Tasklet for ProcessorTasklet<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    fn call(&mut self) -> Result<ProgressState, ExecError> {
        if !self.initialized {
            self.processor.init(&self.context);
            self.initialized = true;
        }
        let mut made_progress = false;

        if self.pending.is_empty() && !self.inbox_done {
            self.drain_inbound(&mut made_progress)?;
        }
        self.process_pending(&mut made_progress)?;
        self.flush_outbox(&mut made_progress);

        if self.inbox_done && self.pending.is_empty() && self.drive_completion(&mut made_progress)? {
            return Ok(ProgressState::Done);
        }

        Ok(if made_progress {
            ProgressState::MadeProgress
        } else {
            ProgressState::NoProgress
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.processor.close();
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for ProcessorTasklet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorTasklet")
            .field("name", &self.name)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .field("pending", &self.pending.len())
            .field("inbox_done", &self.inbox_done)
            .field("completed", &self.completed)
            .finish()
    }
}
