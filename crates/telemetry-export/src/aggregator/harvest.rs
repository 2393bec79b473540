// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reservoir::keep_highest;
use super::{HarvestInfo, HarvestSink, HarvestWindow, OverflowPolicy, Reservoir, SendOutcome};
use crate::config::HarvestLimits;
use crate::item::{TelemetryItem, TelemetryKind};
use crate::metrics::{HealthReporter, Supportability};

/// Harvest interval and the instant the next harvest fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestCycle {
    interval: Duration,
    next_fire: Instant,
}

impl HarvestCycle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_fire: Instant::now() + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_fire(&self) -> Instant {
        self.next_fire
    }

    fn advance(&mut self) {
        self.next_fire += self.interval;
    }
}

struct Window<T> {
    reservoir: Reservoir<T>,
    started: SystemTime,
}

struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Buffers one telemetry type and sends it on every harvest cycle.
///
/// Producers only ever take the window lock for the duration of one
/// reservoir insert. A harvest swaps in a fresh reservoir before it starts
/// sending, so collection continues while the previous window is in flight.
pub struct HarvestAggregator<T: TelemetryItem> {
    kind: TelemetryKind,
    policy: OverflowPolicy,
    limits: RwLock<HarvestLimits>,
    window: Mutex<Window<T>>,
    cycle: Mutex<Option<HarvestCycle>>,
    sink: Arc<dyn HarvestSink<T>>,
    reporter: Arc<dyn HealthReporter>,
    timer: tokio::sync::Mutex<Option<Timer>>,
    // One harvest at a time, so outcomes are applied in order.
    harvesting: tokio::sync::Mutex<()>,
}

impl<T: TelemetryItem> std::fmt::Debug for HarvestAggregator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestAggregator")
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<T: TelemetryItem> HarvestAggregator<T> {
    pub fn new(
        kind: TelemetryKind,
        limits: HarvestLimits,
        sink: Arc<dyn HarvestSink<T>>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self::with_policy(kind, limits, OverflowPolicy::default(), sink, reporter)
    }

    pub fn with_policy(
        kind: TelemetryKind,
        limits: HarvestLimits,
        policy: OverflowPolicy,
        sink: Arc<dyn HarvestSink<T>>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            kind,
            policy,
            limits: RwLock::new(limits),
            window: Mutex::new(Window {
                reservoir: Reservoir::new(limits.capacity, policy),
                started: SystemTime::now(),
            }),
            cycle: Mutex::new(None),
            sink,
            reporter,
            timer: tokio::sync::Mutex::new(None),
            harvesting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn kind(&self) -> TelemetryKind {
        self.kind
    }

    pub fn limits(&self) -> HarvestLimits {
        #[allow(clippy::expect_used)]
        let limits = *self.limits.read().expect("lock poisoned");
        limits
    }

    pub fn is_enabled(&self) -> bool {
        self.limits().is_enabled()
    }

    /// Items buffered for the next harvest.
    pub fn len(&self) -> usize {
        self.lock_window().reservoir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The running harvest cycle, if the timer is started.
    pub fn cycle(&self) -> Option<HarvestCycle> {
        *self.lock_cycle()
    }

    pub fn collect(&self, item: T) {
        if !self.is_enabled() {
            return;
        }
        let admission = self.lock_window().reservoir.add(item);
        self.reporter.report(Supportability::Seen {
            kind: self.kind,
            count: 1,
        });
        if admission.dropped() {
            self.reporter.report(Supportability::Dropped {
                kind: self.kind,
                count: 1,
            });
        }
    }

    pub fn collect_all(&self, items: impl IntoIterator<Item = T>) {
        if !self.is_enabled() {
            return;
        }
        let (seen, dropped) = {
            let mut window = self.lock_window();
            items.into_iter().fold((0, 0), |(seen, dropped), item| {
                let lost = window.reservoir.add(item).dropped();
                (seen + 1, dropped + u64::from(lost))
            })
        };
        if seen > 0 {
            self.reporter.report(Supportability::Seen {
                kind: self.kind,
                count: seen,
            });
        }
        if dropped > 0 {
            self.reporter.report(Supportability::Dropped {
                kind: self.kind,
                count: dropped,
            });
        }
    }

    /// Sends the current window. Returns the outcome, or `None` when there
    /// was nothing to send.
    pub async fn harvest(&self) -> Option<SendOutcome> {
        self.harvest_at(SystemTime::now()).await
    }

    pub(crate) async fn harvest_at(&self, end: SystemTime) -> Option<SendOutcome> {
        let _harvesting = self.harvesting.lock().await;
        let limits = self.limits();
        if !limits.is_enabled() {
            return None;
        }

        let previous = {
            let mut window = self.lock_window();
            std::mem::replace(
                &mut *window,
                Window {
                    reservoir: Reservoir::new(limits.capacity, self.policy),
                    started: end,
                },
            )
        };
        if previous.reservoir.is_empty() {
            return None;
        }

        let info = HarvestInfo {
            kind: self.kind,
            window: HarvestWindow {
                start: previous.started,
                end,
            },
            reservoir_size: previous.reservoir.capacity(),
            seen: previous.reservoir.seen(),
        };
        let items = previous.reservoir.into_items();

        if self.kind == TelemetryKind::Metric && info.window.start >= info.window.end {
            warn!(
                kind = %self.kind,
                count = items.len(),
                "Harvest window is empty or reversed, discarding it"
            );
            self.reporter.report(Supportability::Discarded {
                kind: self.kind,
                count: items.len() as u64,
            });
            return Some(SendOutcome::Discard);
        }

        debug!(kind = %self.kind, count = items.len(), "Harvesting");
        let outcome = self.sink.send(&info, &items).await;
        self.apply_outcome(outcome, items);
        Some(outcome)
    }

    fn apply_outcome(&self, outcome: SendOutcome, items: Vec<T>) {
        let count = items.len() as u64;
        match outcome {
            SendOutcome::Success => {
                self.reporter.report(Supportability::Sent {
                    kind: self.kind,
                    count,
                });
            }
            SendOutcome::Retain | SendOutcome::ConnectionError => {
                let dropped = self.lock_window().reservoir.retain_front(items) as u64;
                debug!(kind = %self.kind, count, dropped, "Retaining unsent items");
                self.reporter.report(Supportability::Recollected {
                    kind: self.kind,
                    count: count - dropped,
                });
                if dropped > 0 {
                    self.reporter.report(Supportability::Dropped {
                        kind: self.kind,
                        count: dropped,
                    });
                }
            }
            SendOutcome::Discard | SendOutcome::PayloadTooLarge | SendOutcome::Fatal => {
                debug!(kind = %self.kind, count, ?outcome, "Discarding harvest");
                self.reporter.report(Supportability::Discarded {
                    kind: self.kind,
                    count,
                });
            }
            SendOutcome::ReduceAndRetry => {
                let half = items.len() / 2;
                let kept = keep_highest(items, half);
                let (evicted, overflow) = {
                    let mut window = self.lock_window();
                    let evicted = if half < window.reservoir.capacity() {
                        window.reservoir.set_capacity(half)
                    } else {
                        0
                    };
                    (evicted, window.reservoir.retain_front(kept))
                };
                info!(kind = %self.kind, capacity = half, "Payload too large, reducing reservoir");
                self.reporter.report(Supportability::ReservoirResized {
                    kind: self.kind,
                    capacity: half as u64,
                });
                let recollected = (half - overflow) as u64;
                if recollected > 0 {
                    self.reporter.report(Supportability::Recollected {
                        kind: self.kind,
                        count: recollected,
                    });
                }
                let lost = count - half as u64 + (evicted + overflow) as u64;
                if lost > 0 {
                    self.reporter.report(Supportability::Dropped {
                        kind: self.kind,
                        count: lost,
                    });
                }
            }
        }
    }

    /// Starts, or restarts, the harvest timer.
    pub async fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.token.cancel();
        }

        let limits = self.limits();
        if !limits.is_enabled() {
            *self.lock_cycle() = None;
            return;
        }
        if limits.interval().is_zero() {
            warn!(kind = %self.kind, "Harvest interval is zero, not starting the harvest timer");
            *self.lock_cycle() = None;
            return;
        }

        *self.lock_cycle() = Some(HarvestCycle::new(limits.interval()));
        let token = CancellationToken::new();
        let aggregator = Arc::clone(self);
        let handle = tokio::spawn(aggregator.run_timer(token.clone()));
        *timer = Some(Timer { token, handle });
    }

    /// Stops the harvest timer, waiting for a harvest in flight.
    pub async fn stop(&self) {
        let timer = self.timer.lock().await.take();
        if let Some(timer) = timer {
            timer.token.cancel();
            if let Err(e) = timer.handle.await {
                debug!(kind = %self.kind, "Harvest timer task failed: {}", e);
            }
        }
        *self.lock_cycle() = None;
    }

    /// Applies new limits. Disabling drops what is buffered and stops the
    /// timer; a new interval restarts it.
    pub async fn update_config(self: &Arc<Self>, limits: HarvestLimits) {
        let previous = {
            #[allow(clippy::expect_used)]
            let mut current = self.limits.write().expect("lock poisoned");
            std::mem::replace(&mut *current, limits)
        };

        if !limits.is_enabled() {
            self.stop().await;
            let dropped = self.discard();
            info!(kind = %self.kind, dropped, "Collection disabled");
            return;
        }

        let dropped = self.lock_window().reservoir.set_capacity(limits.capacity);
        if dropped > 0 {
            self.reporter.report(Supportability::Dropped {
                kind: self.kind,
                count: dropped as u64,
            });
        }

        if !previous.is_enabled() || previous.interval_ms != limits.interval_ms {
            self.start().await;
        }
    }

    /// Drops everything buffered and reports it. Returns the count.
    pub fn discard(&self) -> usize {
        let dropped = {
            let mut window = self.lock_window();
            let capacity = window.reservoir.capacity();
            std::mem::replace(&mut window.reservoir, Reservoir::new(capacity, self.policy)).len()
        };
        if dropped > 0 {
            self.reporter.report(Supportability::Dropped {
                kind: self.kind,
                count: dropped as u64,
            });
        }
        dropped
    }

    async fn run_timer(self: Arc<Self>, token: CancellationToken) {
        loop {
            let Some(deadline) = self.cycle().map(|cycle| cycle.next_fire()) else {
                return;
            };
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep_until(deadline) => {}
            }
            if let Some(cycle) = self.lock_cycle().as_mut() {
                cycle.advance();
            }
            self.harvest().await;
        }
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, Window<T>> {
        #[allow(clippy::expect_used)]
        let window = self.window.lock().expect("lock poisoned");
        window
    }

    fn lock_cycle(&self) -> std::sync::MutexGuard<'_, Option<HarvestCycle>> {
        #[allow(clippy::expect_used)]
        let cycle = self.cycle.lock().expect("lock poisoned");
        cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::test_support::{ids, TestItem};
    use crate::metrics::CountingHealthReporter;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSink {
        outcomes: Mutex<VecDeque<SendOutcome>>,
        batches: Mutex<Vec<Vec<u32>>>,
        infos: Mutex<Vec<HarvestInfo>>,
        gate: Option<Arc<Notify>>,
    }

    impl RecordingSink {
        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn script(&self, outcomes: &[SendOutcome]) {
            self.outcomes.lock().unwrap().extend(outcomes.iter().copied());
        }

        fn batches(&self) -> Vec<Vec<u32>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HarvestSink<TestItem> for RecordingSink {
        async fn send(&self, info: &HarvestInfo, items: &[TestItem]) -> SendOutcome {
            self.batches.lock().unwrap().push(ids(items));
            self.infos.lock().unwrap().push(*info);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.outcomes.lock().unwrap().pop_front();
            next.unwrap_or(SendOutcome::Success)
        }
    }

    struct Harness {
        sink: Arc<RecordingSink>,
        reporter: Arc<CountingHealthReporter>,
        aggregator: Arc<HarvestAggregator<TestItem>>,
    }

    fn harness_with(kind: TelemetryKind, capacity: usize, sink: RecordingSink) -> Harness {
        let sink = Arc::new(sink);
        let reporter = Arc::new(CountingHealthReporter::new());
        let aggregator = Arc::new(HarvestAggregator::new(
            kind,
            HarvestLimits::new(capacity, Duration::from_secs(60)),
            sink.clone(),
            reporter.clone(),
        ));
        Harness {
            sink,
            reporter,
            aggregator,
        }
    }

    fn harness(capacity: usize) -> Harness {
        harness_with(TelemetryKind::Custom, capacity, RecordingSink::default())
    }

    fn collect_ids(aggregator: &HarvestAggregator<TestItem>, ids: impl IntoIterator<Item = u32>) {
        aggregator.collect_all(ids.into_iter().map(TestItem::new));
    }

    #[tokio::test]
    async fn test_collect_counts_seen_and_dropped() {
        let h = harness(2);
        h.aggregator.collect(TestItem::with_priority(1, 0.2));
        h.aggregator.collect(TestItem::with_priority(2, 0.3));
        h.aggregator.collect(TestItem::with_priority(3, 0.9));
        collect_ids(&h.aggregator, [4, 5]);

        assert_eq!(h.aggregator.len(), 2);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Seen"), 5);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Dropped"), 3);
    }

    #[tokio::test]
    async fn test_drop_newest_policy() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Arc::new(CountingHealthReporter::new());
        let aggregator = HarvestAggregator::with_policy(
            TelemetryKind::Error,
            HarvestLimits::new(1, Duration::from_secs(60)),
            OverflowPolicy::DropNewest,
            sink.clone(),
            reporter.clone(),
        );
        aggregator.collect(TestItem::with_priority(1, 0.1));
        aggregator.collect(TestItem::with_priority(2, 1.0));

        aggregator.harvest().await;

        assert_eq!(sink.batches(), vec![vec![1]]);
        assert_eq!(reporter.total("Supportability/ErrorEvent/Dropped"), 1);
    }

    #[tokio::test]
    async fn test_successful_harvest() {
        let h = harness(10);
        collect_ids(&h.aggregator, 1..=3);

        assert_eq!(h.aggregator.harvest().await, Some(SendOutcome::Success));

        assert_eq!(h.sink.batches(), vec![vec![1, 2, 3]]);
        assert!(h.aggregator.is_empty());
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Sent"), 3);

        let info = h.sink.infos.lock().unwrap()[0];
        assert_eq!(info.kind, TelemetryKind::Custom);
        assert_eq!(info.reservoir_size, 10);
        assert_eq!(info.seen, 3);
    }

    #[tokio::test]
    async fn test_empty_harvest_sends_nothing() {
        let h = harness(10);
        assert_eq!(h.aggregator.harvest().await, None);
        assert!(h.sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_collection_continues_during_send() {
        let gate = Arc::new(Notify::new());
        let h = harness_with(TelemetryKind::Custom, 3, RecordingSink::gated(gate.clone()));
        h.sink.script(&[SendOutcome::Retain]);
        collect_ids(&h.aggregator, 1..=3);

        let aggregator = h.aggregator.clone();
        let harvest = tokio::spawn(async move { aggregator.harvest().await });
        while h.sink.batches().is_empty() {
            tokio::task::yield_now().await;
        }

        // The send is parked; producers write to the new reservoir.
        collect_ids(&h.aggregator, [4, 5]);
        assert_eq!(h.aggregator.len(), 2);

        gate.notify_one();
        assert_eq!(harvest.await.unwrap(), Some(SendOutcome::Retain));

        // Retained items go to the head; the oldest ones fall off.
        assert_eq!(h.aggregator.len(), 3);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Recollected"), 1);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Dropped"), 2);

        gate.notify_one();
        h.aggregator.harvest().await;
        assert_eq!(h.sink.batches()[1], vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_retain_requeues_unsent_items() {
        let h = harness(10);
        h.sink
            .script(&[SendOutcome::Retain, SendOutcome::ConnectionError]);
        collect_ids(&h.aggregator, 1..=3);

        h.aggregator.harvest().await;
        collect_ids(&h.aggregator, [4]);
        h.aggregator.harvest().await;
        h.aggregator.harvest().await;

        assert_eq!(
            h.sink.batches(),
            vec![vec![1, 2, 3], vec![1, 2, 3, 4], vec![1, 2, 3, 4]]
        );
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Recollected"), 7);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Sent"), 4);
    }

    #[duplicate::duplicate_item(
        test_name                               outcome;
        [test_discard_drops_items]              [SendOutcome::Discard];
        [test_payload_too_large_drops_items]    [SendOutcome::PayloadTooLarge];
        [test_fatal_drops_items]                [SendOutcome::Fatal];
    )]
    #[tokio::test]
    async fn test_name() {
        let h = harness(10);
        h.sink.script(&[outcome]);
        collect_ids(&h.aggregator, 1..=4);

        assert_eq!(h.aggregator.harvest().await, Some(outcome));
        assert_eq!(h.aggregator.harvest().await, None);

        assert_eq!(h.sink.batches().len(), 1);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Discarded"), 4);
    }

    #[tokio::test]
    async fn test_reduce_and_retry_keeps_half() {
        let h = harness(10);
        h.sink.script(&[SendOutcome::ReduceAndRetry]);
        h.aggregator.collect(TestItem::with_priority(1, 0.2));
        h.aggregator.collect(TestItem::with_priority(2, 0.8));

        h.aggregator.harvest().await;
        assert_eq!(h.aggregator.len(), 1);
        h.aggregator.harvest().await;

        assert_eq!(h.sink.batches(), vec![vec![1, 2], vec![2]]);
        assert_eq!(
            h.reporter.get("Supportability/CustomEvent/ReservoirResize").last,
            1
        );
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Dropped"), 1);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Recollected"), 1);
    }

    #[tokio::test]
    async fn test_reduce_and_retry_reports_recollected_half() {
        let h = harness(10);
        h.sink.script(&[SendOutcome::ReduceAndRetry]);
        collect_ids(&h.aggregator, 1..=4);

        h.aggregator.harvest().await;

        assert_eq!(h.aggregator.len(), 2);
        assert_eq!(h.reporter.calls("Supportability/CustomEvent/Recollected"), 1);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Recollected"), 2);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Dropped"), 2);
    }

    #[tokio::test]
    async fn test_reduce_and_retry_converges_to_zero() {
        let h = harness(10);
        h.sink.script(&[SendOutcome::ReduceAndRetry; 4]);
        collect_ids(&h.aggregator, 1..=4);

        h.aggregator.harvest().await;
        h.aggregator.harvest().await;
        h.aggregator.harvest().await;

        assert_eq!(
            h.sink.batches().iter().map(Vec::len).collect::<Vec<_>>(),
            vec![4, 2, 1]
        );
        assert!(h.aggregator.is_empty());
        assert_eq!(h.aggregator.harvest().await, None);
    }

    #[tokio::test]
    async fn test_reversed_metric_window_is_discarded() {
        let h = harness_with(TelemetryKind::Metric, 10, RecordingSink::default());
        collect_ids(&h.aggregator, 1..=2);

        let outcome = h
            .aggregator
            .harvest_at(SystemTime::UNIX_EPOCH)
            .await;

        assert_eq!(outcome, Some(SendOutcome::Discard));
        assert!(h.sink.batches().is_empty());
        assert_eq!(h.reporter.total("Supportability/Metric/Discarded"), 2);
    }

    #[tokio::test]
    async fn test_window_boundaries() {
        let h = harness_with(TelemetryKind::Metric, 10, RecordingSink::default());
        collect_ids(&h.aggregator, [1]);
        let end = SystemTime::now() + Duration::from_secs(60);

        h.aggregator.harvest_at(end).await;
        collect_ids(&h.aggregator, [2]);
        h.aggregator
            .harvest_at(end + Duration::from_secs(60))
            .await;

        let infos = h.sink.infos.lock().unwrap().clone();
        assert_eq!(infos[0].window.end, end);
        assert_eq!(infos[1].window.start, end);
    }

    #[tokio::test]
    async fn test_disable_drops_items_and_stops_timer() {
        let h = harness(10);
        h.aggregator.start().await;
        collect_ids(&h.aggregator, 1..=3);

        h.aggregator
            .update_config(HarvestLimits {
                enabled: false,
                ..HarvestLimits::new(10, Duration::from_secs(60))
            })
            .await;

        assert!(!h.aggregator.is_enabled());
        assert!(h.aggregator.is_empty());
        assert!(h.aggregator.cycle().is_none());
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Dropped"), 3);

        collect_ids(&h.aggregator, [4]);
        assert!(h.aggregator.is_empty());
        assert_eq!(h.aggregator.harvest().await, None);
    }

    #[tokio::test]
    async fn test_zero_capacity_disables() {
        let h = harness(0);
        assert!(!h.aggregator.is_enabled());
        collect_ids(&h.aggregator, [1]);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Seen"), 0);
    }

    #[tokio::test]
    async fn test_capacity_change_resizes() {
        let h = harness(5);
        for (id, priority) in [(1, 0.9), (2, 0.1), (3, 0.5), (4, 0.2), (5, 0.7)] {
            h.aggregator.collect(TestItem::with_priority(id, priority));
        }

        h.aggregator
            .update_config(HarvestLimits::new(3, Duration::from_secs(60)))
            .await;
        h.aggregator.harvest().await;

        assert_eq!(h.sink.batches(), vec![vec![1, 3, 5]]);
        assert_eq!(h.reporter.total("Supportability/CustomEvent/Dropped"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_harvests_every_interval() {
        let h = harness(10);
        h.aggregator.start().await;
        collect_ids(&h.aggregator, [1]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        collect_ids(&h.aggregator, [2]);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.sink.batches(), vec![vec![1], vec![2]]);
        h.aggregator.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_restarts_timer() {
        let h = harness(10);
        h.aggregator.start().await;
        let first = h.aggregator.cycle().unwrap();
        assert_eq!(first.interval(), Duration::from_secs(60));

        h.aggregator
            .update_config(HarvestLimits::new(10, Duration::from_secs(5)))
            .await;
        collect_ids(&h.aggregator, [1]);

        let cycle = h.aggregator.cycle().unwrap();
        assert_eq!(cycle.interval(), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(h.sink.batches(), vec![vec![1]]);
        assert!(h.aggregator.cycle().unwrap().next_fire() > cycle.next_fire());
        h.aggregator.stop().await;
    }
}
