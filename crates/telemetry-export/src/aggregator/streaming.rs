// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::item::TelemetryKind;
use crate::metrics::{HealthReporter, Supportability};
use crate::queue::PartitionedQueue;
use crate::streaming::StreamConsumer;

/// Feeds high-volume telemetry into a [`PartitionedQueue`] drained by a
/// streaming consumer.
///
/// Admission takes a read lock on the queue slot; reconfiguration swaps the
/// queue under the write lock, so a resize never loses an item outside of the
/// truncation it reports.
///
/// Items are buffered from the first [`apply_config`](Self::apply_config) on,
/// but the consumer only drains the queue after
/// [`start_consuming`](Self::start_consuming).
pub struct StreamingAggregator<I> {
    kind: TelemetryKind,
    queue: RwLock<Option<Arc<PartitionedQueue<I>>>>,
    consumer: Arc<dyn StreamConsumer<I>>,
    reporter: Arc<dyn HealthReporter>,
    consuming: AtomicBool,
    reconfiguring: tokio::sync::Mutex<()>,
}

impl<I: Send + 'static> std::fmt::Debug for StreamingAggregator<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingAggregator")
            .field("kind", &self.kind)
            .field("queue", &self.queue())
            .finish_non_exhaustive()
    }
}

impl<I: Send + 'static> StreamingAggregator<I> {
    pub fn new(
        kind: TelemetryKind,
        consumer: Arc<dyn StreamConsumer<I>>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            kind,
            queue: RwLock::new(None),
            consumer,
            reporter,
            consuming: AtomicBool::new(false),
            reconfiguring: tokio::sync::Mutex::new(()),
        }
    }

    pub fn queue(&self) -> Option<Arc<PartitionedQueue<I>>> {
        #[allow(clippy::expect_used)]
        let queue = self.queue.read().expect("lock poisoned").clone();
        queue
    }

    pub fn is_enabled(&self) -> bool {
        self.consumer.is_enabled() && self.queue().is_some()
    }

    pub fn len(&self) -> usize {
        self.queue().map_or(0, |queue| queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers one item. Never blocks; a full or missing queue drops it, and
    /// so does a consumer that has been disabled.
    pub fn collect(&self, item: I) -> bool {
        let enabled = self.consumer.is_enabled();
        let admitted = enabled && {
            #[allow(clippy::expect_used)]
            let slot = self.queue.read().expect("lock poisoned");
            slot.as_ref().is_some_and(|queue| queue.try_add(item))
        };
        self.report_admission(u64::from(admitted), u64::from(!admitted));
        admitted
    }

    /// Offers a run of items and returns how many were admitted.
    pub fn collect_all(&self, items: impl IntoIterator<Item = I>) -> usize {
        let (admitted, rejected) = if !self.consumer.is_enabled() {
            (0, items.into_iter().count())
        } else {
            #[allow(clippy::expect_used)]
            let slot = self.queue.read().expect("lock poisoned");
            items
                .into_iter()
                .fold((0usize, 0usize), |(admitted, rejected), item| {
                    if slot.as_ref().is_some_and(|queue| queue.try_add(item)) {
                        (admitted + 1, rejected)
                    } else {
                        (admitted, rejected + 1)
                    }
                })
        };
        self.report_admission(admitted as u64, rejected as u64);
        admitted
    }

    /// Applies a queue capacity and partition count.
    ///
    /// Consumers stop first. A zero capacity drops everything and leaves
    /// collection off; otherwise the oldest `min(len, capacity)` items move to
    /// the new queue in order, the rest are reported dropped, and consumers
    /// that were running restart against the new queue.
    pub async fn apply_config(&self, capacity: usize, partition_count: usize) -> usize {
        let _reconfiguring = self.reconfiguring.lock().await;
        self.consumer.stop().await;

        let (queue, dropped) = {
            #[allow(clippy::expect_used)]
            let mut slot = self.queue.write().expect("lock poisoned");
            let (next, dropped) = match slot.as_ref() {
                Some(current) => current.resize(capacity, partition_count),
                None => (PartitionedQueue::new(capacity, partition_count), 0),
            };
            *slot = next.map(Arc::new);
            (slot.clone(), dropped)
        };

        if dropped > 0 {
            self.reporter.report(Supportability::Dropped {
                kind: self.kind,
                count: dropped as u64,
            });
        }

        match queue {
            Some(queue) => {
                debug!(
                    kind = %self.kind,
                    capacity,
                    partitions = queue.partition_count(),
                    dropped,
                    "Streaming queue configured"
                );
                if self.consuming.load(Ordering::Acquire) && self.consumer.is_enabled() {
                    self.consumer.start(queue).await;
                }
            }
            None => info!(kind = %self.kind, dropped, "Streaming queue disabled"),
        }
        dropped
    }

    /// Starts the consumer against the current queue, or restarts it when it
    /// is already running so new streams pick up fresh credentials.
    pub async fn start_consuming(&self) {
        let _reconfiguring = self.reconfiguring.lock().await;
        if self.consuming.swap(true, Ordering::AcqRel) {
            self.consumer.stop().await;
        }
        let Some(queue) = self.queue() else {
            return;
        };
        if self.consumer.is_enabled() {
            debug!(kind = %self.kind, "Starting streaming consumers");
            self.consumer.start(queue).await;
        }
    }

    /// Reports the current queue depth.
    pub fn report_queue_size(&self) {
        self.reporter
            .report(Supportability::StreamQueueSize(self.len() as u64));
    }

    /// Waits for the consumer to drain the queue.
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.consumer.wait(timeout).await
    }

    /// Stops the consumer for good and drops whatever is still queued.
    pub async fn shutdown(&self) -> usize {
        let _reconfiguring = self.reconfiguring.lock().await;
        self.consuming.store(false, Ordering::Release);
        self.consumer.shutdown().await;
        let queue = {
            #[allow(clippy::expect_used)]
            let mut slot = self.queue.write().expect("lock poisoned");
            slot.take()
        };
        let dropped = queue.map_or(0, |queue| queue.drain().len());
        if dropped > 0 {
            self.reporter.report(Supportability::Dropped {
                kind: self.kind,
                count: dropped as u64,
            });
        }
        dropped
    }

    fn report_admission(&self, admitted: u64, rejected: u64) {
        if admitted > 0 {
            self.reporter.report(Supportability::Seen {
                kind: self.kind,
                count: admitted,
            });
        }
        if rejected > 0 {
            self.reporter.report(Supportability::Dropped {
                kind: self.kind,
                count: rejected,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CountingHealthReporter;
    use async_trait::async_trait;
    use duplicate::duplicate_item;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FakeConsumer {
        enabled: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        shutdowns: AtomicUsize,
        current: Mutex<Option<Arc<PartitionedQueue<u32>>>>,
    }

    impl FakeConsumer {
        fn new() -> Self {
            Self {
                enabled: AtomicBool::new(true),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                current: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl StreamConsumer<u32> for FakeConsumer {
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        async fn start(&self, queue: Arc<PartitionedQueue<u32>>) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.current.lock().unwrap() = Some(queue);
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.current.lock().unwrap().take();
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.enabled.store(false, Ordering::SeqCst);
        }

        async fn wait(&self, _timeout: Duration) -> bool {
            let queue = self.current.lock().unwrap().clone();
            queue.map_or(true, |queue| queue.is_empty())
        }
    }

    struct Harness {
        consumer: Arc<FakeConsumer>,
        reporter: Arc<CountingHealthReporter>,
        aggregator: StreamingAggregator<u32>,
    }

    fn harness() -> Harness {
        let consumer = Arc::new(FakeConsumer::new());
        let reporter = Arc::new(CountingHealthReporter::new());
        let aggregator =
            StreamingAggregator::new(TelemetryKind::Span, consumer.clone(), reporter.clone());
        aggregator.consuming.store(true, Ordering::SeqCst);
        Harness {
            consumer,
            reporter,
            aggregator,
        }
    }

    fn queued(aggregator: &StreamingAggregator<u32>) -> Vec<u32> {
        aggregator.queue().map(|queue| queue.drain()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_collect_without_queue_drops() {
        let h = harness();
        assert!(!h.aggregator.collect(1));
        assert!(!h.aggregator.is_enabled());
        assert_eq!(h.reporter.total("Supportability/SpanEvent/Dropped"), 1);
        assert_eq!(h.reporter.total("Supportability/SpanEvent/Seen"), 0);
    }

    #[tokio::test]
    async fn test_collect_counts_exactly() {
        let h = harness();
        h.aggregator.apply_config(5, 2).await;

        assert_eq!(h.aggregator.collect_all(1..=7), 5);
        assert!(!h.aggregator.collect(8));

        assert_eq!(h.reporter.total("Supportability/SpanEvent/Seen"), 5);
        assert_eq!(h.reporter.total("Supportability/SpanEvent/Dropped"), 3);
        assert_eq!(h.consumer.starts.load(Ordering::SeqCst), 1);
    }

    #[duplicate_item(
        test_name                     start   added   resized   kept      dropped;
        [test_shrink_keeps_oldest]    [5]     [5]     [3]       [1..=3]   [2];
        [test_grow_keeps_all]         [5]     [5]     [10]      [1..=5]   [0];
        [test_same_capacity]          [5]     [3]     [5]       [1..=3]   [0];
        [test_shrink_below_count]     [10]    [7]     [2]       [1..=2]   [5];
        [test_shrink_above_count]     [10]    [4]     [6]       [1..=4]   [0];
    )]
    #[tokio::test]
    async fn test_name() {
        let h = harness();
        h.aggregator.apply_config(start, 4).await;
        h.aggregator.collect_all(1..=added);

        assert_eq!(h.aggregator.apply_config(resized, 4).await, dropped);

        assert_eq!(queued(&h.aggregator), (kept).collect::<Vec<u32>>());
        assert_eq!(
            h.reporter.total("Supportability/SpanEvent/Dropped"),
            dropped as u64
        );
        assert_eq!(h.consumer.stops.load(Ordering::SeqCst), 2);
        assert_eq!(h.consumer.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_drops_everything() {
        let h = harness();
        h.aggregator.apply_config(5, 2).await;
        h.aggregator.collect_all(1..=4);

        assert_eq!(h.aggregator.apply_config(0, 2).await, 4);

        assert!(h.aggregator.queue().is_none());
        assert_eq!(h.consumer.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.reporter.total("Supportability/SpanEvent/Dropped"), 4);
        assert!(!h.aggregator.collect(5));
        assert_eq!(h.reporter.total("Supportability/SpanEvent/Dropped"), 5);
    }

    #[tokio::test]
    async fn test_consumer_restarts_against_new_queue() {
        let h = harness();
        h.aggregator.apply_config(5, 2).await;
        let first = h.aggregator.queue().unwrap();

        h.aggregator.apply_config(8, 2).await;

        let current = h.consumer.current.lock().unwrap().clone().unwrap();
        assert!(!Arc::ptr_eq(&first, &current));
        assert!(Arc::ptr_eq(&current, &h.aggregator.queue().unwrap()));
        assert_eq!(current.capacity(), 8);
    }

    #[tokio::test]
    async fn test_disabled_consumer_is_not_started() {
        let h = harness();
        h.consumer.enabled.store(false, Ordering::SeqCst);
        h.aggregator.apply_config(5, 2).await;

        assert_eq!(h.consumer.starts.load(Ordering::SeqCst), 0);
        assert!(!h.aggregator.is_enabled());
    }

    #[tokio::test]
    async fn test_buffers_until_consuming_starts() {
        let consumer = Arc::new(FakeConsumer::new());
        let reporter = Arc::new(CountingHealthReporter::new());
        let aggregator =
            StreamingAggregator::new(TelemetryKind::Span, consumer.clone(), reporter.clone());

        aggregator.apply_config(5, 2).await;
        assert!(aggregator.collect(1));
        assert_eq!(consumer.starts.load(Ordering::SeqCst), 0);

        aggregator.start_consuming().await;
        assert_eq!(consumer.starts.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.stops.load(Ordering::SeqCst), 1);
        assert_eq!(aggregator.len(), 1);
    }

    #[tokio::test]
    async fn test_start_consuming_again_restarts_consumer() {
        let h = harness();
        h.aggregator.apply_config(5, 2).await;

        h.aggregator.start_consuming().await;

        assert_eq!(h.consumer.stops.load(Ordering::SeqCst), 2);
        assert_eq!(h.consumer.starts.load(Ordering::SeqCst), 2);
        let current = h.consumer.current.lock().unwrap().clone().unwrap();
        assert!(Arc::ptr_eq(&current, &h.aggregator.queue().unwrap()));
    }

    #[tokio::test]
    async fn test_disabled_consumer_rejects_items() {
        let h = harness();
        h.aggregator.apply_config(5, 2).await;
        assert!(h.aggregator.collect(1));

        h.consumer.enabled.store(false, Ordering::SeqCst);

        assert!(!h.aggregator.collect(2));
        assert_eq!(h.aggregator.collect_all([3, 4]), 0);
        assert_eq!(h.aggregator.len(), 1);
        assert_eq!(h.reporter.total("Supportability/SpanEvent/Seen"), 1);
        assert_eq!(h.reporter.total("Supportability/SpanEvent/Dropped"), 3);
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_items() {
        let h = harness();
        h.aggregator.apply_config(5, 2).await;
        h.aggregator.collect_all(1..=3);
        h.aggregator.report_queue_size();

        assert_eq!(h.aggregator.shutdown().await, 3);

        assert_eq!(h.consumer.shutdowns.load(Ordering::SeqCst), 1);
        assert!(h.aggregator.queue().is_none());
        assert_eq!(h.reporter.total("Supportability/SpanEvent/Dropped"), 3);
        assert_eq!(
            h.reporter
                .get("Supportability/Streaming/Span/QueueSize")
                .last,
            3
        );
    }

    #[tokio::test]
    async fn test_concurrent_collect_during_resize() {
        let h = Arc::new(harness());
        h.aggregator.apply_config(1_000, 4).await;

        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let h = h.clone();
                tokio::spawn(async move {
                    for i in 0..200 {
                        h.aggregator.collect(p * 1_000 + i);
                        if i % 50 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        let resizer = {
            let h = h.clone();
            tokio::spawn(async move { h.aggregator.apply_config(2_000, 8).await })
        };
        for producer in producers {
            producer.await.unwrap();
        }
        let dropped = resizer.await.unwrap();

        assert_eq!(dropped, 0);
        assert_eq!(h.aggregator.len(), 800);
    }
}
