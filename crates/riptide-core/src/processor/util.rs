//! Stock processors: scripted sources, mapping, and collecting sinks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::dag::ProcessorSupplier;

use super::{Item, Outbox, Processor, ProcessorContext, ProcessorError};

/// A processor that accepts and discards everything.
struct NoopProcessor;

impl<T: Clone + Send> Processor<T> for NoopProcessor {
    fn try_process(
        &mut self,
        _ordinal: usize,
        _item: &T,
        _outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError> {
        Ok(true)
    }
}

/// Supplier of processors that accept and discard everything.
#[must_use]
pub fn noop_supplier<T: Clone + Send + 'static>() -> ProcessorSupplier<T> {
    ProcessorSupplier::new(|| Box::new(NoopProcessor))
}

/// A source that emits a fixed sequence of items, then completes.
///
/// Events and watermarks are broadcast to every outbox bucket; emission
/// yields at the outbox high-water mark.
pub struct IterSource<T> {
    items: VecDeque<Item<T>>,
}

impl<T> IterSource<T> {
    /// Creates a source over the given item sequence.
    pub fn new(items: impl IntoIterator<Item = Item<T>>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    /// Convenience supplier emitting the same event sequence from every
    /// instance.
    pub fn supplier(events: Vec<T>) -> ProcessorSupplier<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        ProcessorSupplier::new(move || {
            Box::new(Self::new(events.iter().cloned().map(Item::Event)))
        })
    }
}

impl<T: Clone + Send> Processor<T> for IterSource<T> {
    fn try_process(
        &mut self,
        _ordinal: usize,
        _item: &T,
        _outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError> {
        Ok(true)
    }

    fn complete(&mut self, outbox: &mut Outbox<T>) -> Result<bool, ProcessorError> {
        while let Some(item) = self.items.front() {
            if outbox.has_reached_any_limit() || !outbox.broadcast(item) {
                return Ok(false);
            }
            self.items.pop_front();
        }
        Ok(true)
    }
}

/// Applies a function to each event, dropping it on `None`.
pub struct MapProcessor<T, F> {
    map_fn: F,
    _marker: std::marker::PhantomData<fn(&T) -> T>,
}

impl<T, F> MapProcessor<T, F>
where
    F: Fn(&T) -> Option<T>,
{
    /// Creates a mapping processor.
    pub fn new(map_fn: F) -> Self {
        Self {
            map_fn,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> MapProcessor<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> Option<T> + Clone + Send + Sync + 'static,
{
    /// Convenience supplier cloning the function into every instance.
    pub fn supplier(map_fn: F) -> ProcessorSupplier<T> {
        ProcessorSupplier::new(move || Box::new(Self::new(map_fn.clone())))
    }
}

impl<T, F> Processor<T> for MapProcessor<T, F>
where
    T: Clone + Send,
    F: Fn(&T) -> Option<T> + Send,
{
    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &T,
        outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError> {
        match (self.map_fn)(item) {
            Some(mapped) => Ok(outbox.broadcast(&Item::Event(mapped))),
            None => Ok(true),
        }
    }
}

/// Shared per-instance output slots for [`CollectSink`].
pub type SinkSlots<T> = Arc<Vec<Mutex<Vec<Item<T>>>>>;

/// A sink that records its full inbound item sequence (events and
/// watermarks) into a shared slot per instance.
pub struct CollectSink<T> {
    slots: SinkSlots<T>,
    instance: usize,
}

impl<T> CollectSink<T> {
    /// Allocates one slot per sink instance.
    #[must_use]
    pub fn slots(parallelism: usize) -> SinkSlots<T> {
        Arc::new((0..parallelism).map(|_| Mutex::new(Vec::new())).collect())
    }

    /// Supplier writing into `slots`; the instance picks its slot at init.
    pub fn supplier(slots: &SinkSlots<T>) -> ProcessorSupplier<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let slots = Arc::clone(slots);
        ProcessorSupplier::new(move || {
            Box::new(Self {
                slots: Arc::clone(&slots),
                instance: 0,
            })
        })
    }

    fn push(&self, item: Item<T>) {
        self.slots[self.instance]
            .lock()
            .expect("sink slot poisoned")
            .push(item);
    }
}

impl<T: Clone + Send> Processor<T> for CollectSink<T> {
    fn init(&mut self, ctx: &ProcessorContext) {
        self.instance = ctx.instance_index;
    }

    fn try_process(
        &mut self,
        _ordinal: usize,
        item: &T,
        _outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError> {
        self.push(Item::Event(item.clone()));
        Ok(true)
    }

    fn try_process_watermark(
        &mut self,
        _ordinal: usize,
        wm: super::Watermark,
        _outbox: &mut Outbox<T>,
    ) -> Result<bool, ProcessorError> {
        self.push(Item::Watermark(wm));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Watermark;

    #[test]
    fn iter_source_drains_through_backpressure() {
        let mut source: IterSource<i64> =
            IterSource::new((0..5).map(Item::Event).collect::<Vec<_>>());
        let mut outbox = Outbox::new(1, 2);

        // First call stops at the high-water mark.
        assert!(!source.complete(&mut outbox).unwrap());
        assert_eq!(outbox.bucket_mut(0).len(), 2);

        outbox.bucket_mut(0).clear();
        assert!(!source.complete(&mut outbox).unwrap());
        outbox.bucket_mut(0).clear();
        assert!(source.complete(&mut outbox).unwrap());
        assert_eq!(outbox.bucket_mut(0).len(), 1);
    }

    #[test]
    fn map_processor_filters_and_maps() {
        let mut map = MapProcessor::new(|v: &i64| (v % 2 == 0).then(|| v * 10));
        let mut outbox = Outbox::new(1, 8);

        assert!(map.try_process(0, &2, &mut outbox).unwrap());
        assert!(map.try_process(0, &3, &mut outbox).unwrap());

        let bucket: Vec<_> = outbox.bucket_mut(0).drain(..).collect();
        assert_eq!(bucket, vec![Item::Event(20)]);
    }

    #[test]
    fn collect_sink_records_events_and_watermarks() {
        let slots = CollectSink::<i64>::slots(1);
        let mut sink = CollectSink {
            slots: Arc::clone(&slots),
            instance: 0,
        };
        let mut outbox = Outbox::new(0, 8);

        sink.try_process(0, &1, &mut outbox).unwrap();
        sink.try_process_watermark(0, Watermark::new(5), &mut outbox)
            .unwrap();

        let recorded = slots[0].lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![Item::Event(1), Item::Watermark(Watermark::new(5))]
        );
    }
}
