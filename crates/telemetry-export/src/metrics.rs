// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Supportability metrics describing the pipeline's own health.
//!
//! Components report through the [`HealthReporter`] trait. Two
//! implementations ship with the crate: [`CountingHealthReporter`] keeps
//! totals in memory so they can be exported elsewhere (and asserted in tests),
//! [`TracingHealthReporter`] emits each metric as a debug event.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use tracing::debug;

use crate::item::TelemetryKind;
use crate::transport::StatusCode;

const STREAMING_PREFIX: &str = "Supportability/Streaming/Span";

/// One supportability observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Supportability {
    /// Items offered to an aggregator or queue.
    Seen { kind: TelemetryKind, count: u64 },
    /// Items acknowledged by the collector.
    Sent { kind: TelemetryKind, count: u64 },
    /// Items dropped for capacity reasons (overflow, resize, shutdown).
    Dropped { kind: TelemetryKind, count: u64 },
    /// Items put back into a reservoir after a retryable failure.
    Recollected { kind: TelemetryKind, count: u64 },
    /// Items dropped after the collector rejected them.
    Discarded { kind: TelemetryKind, count: u64 },
    /// Reservoir capacity reduced after a payload-too-large response.
    ReservoirResized { kind: TelemetryKind, capacity: u64 },
    /// Payload exceeded the maximum size and was never sent.
    PayloadDroppedMaxSize { method: String },
    /// Collector returned an error status for a method.
    CollectorError { method: String, status: u16 },
    /// Size of a batch written to the stream.
    StreamBatchSize(u64),
    /// Items currently waiting in the streaming queue.
    StreamQueueSize(u64),
    /// Acknowledgements received on the response stream.
    StreamReceived(u64),
    /// Error received on the response stream.
    StreamResponseError,
    /// Transport status observed by the streaming service.
    StreamStatus(StatusCode),
    /// Stream call exceeded its deadline.
    StreamTimeout,
    /// Streaming compression setting at service start.
    StreamCompression(bool),
}

impl Supportability {
    /// Metric name the observation is recorded under.
    pub fn name(&self) -> String {
        match self {
            Supportability::Seen { kind, .. } => format!("Supportability/{kind}/Seen"),
            Supportability::Sent { kind, .. } => format!("Supportability/{kind}/Sent"),
            Supportability::Dropped { kind, .. } => format!("Supportability/{kind}/Dropped"),
            Supportability::Recollected { kind, .. } => {
                format!("Supportability/{kind}/Recollected")
            }
            Supportability::Discarded { kind, .. } => format!("Supportability/{kind}/Discarded"),
            Supportability::ReservoirResized { kind, .. } => {
                format!("Supportability/{kind}/ReservoirResize")
            }
            Supportability::PayloadDroppedMaxSize { method } => {
                format!("Supportability/Collector/MaxPayloadSizeLimit/{method}")
            }
            Supportability::CollectorError { method, status } => {
                format!("Supportability/Collector/{method}/Error/{status}")
            }
            Supportability::StreamBatchSize(_) => format!("{STREAMING_PREFIX}/BatchSize"),
            Supportability::StreamQueueSize(_) => format!("{STREAMING_PREFIX}/QueueSize"),
            Supportability::StreamReceived(_) => format!("{STREAMING_PREFIX}/Received"),
            Supportability::StreamResponseError => format!("{STREAMING_PREFIX}/Response/Error"),
            Supportability::StreamStatus(status) => format!("{STREAMING_PREFIX}/gRPC/{status}"),
            Supportability::StreamTimeout => format!("{STREAMING_PREFIX}/gRPC/Timeout"),
            Supportability::StreamCompression(true) => {
                "Supportability/Streaming/Compression/enabled".to_string()
            }
            Supportability::StreamCompression(false) => {
                "Supportability/Streaming/Compression/disabled".to_string()
            }
        }
    }

    /// Value accumulated for the metric. Event style metrics count as one.
    pub fn value(&self) -> u64 {
        match self {
            Supportability::Seen { count, .. }
            | Supportability::Sent { count, .. }
            | Supportability::Dropped { count, .. }
            | Supportability::Recollected { count, .. }
            | Supportability::Discarded { count, .. } => *count,
            Supportability::ReservoirResized { capacity, .. } => *capacity,
            Supportability::StreamBatchSize(value)
            | Supportability::StreamQueueSize(value)
            | Supportability::StreamReceived(value) => *value,
            _ => 1,
        }
    }
}

/// Sink for supportability metrics.
pub trait HealthReporter: Send + Sync + fmt::Debug {
    fn report(&self, metric: Supportability);
}

/// Accumulated totals for one metric name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricTotals {
    /// Number of times the metric was reported.
    pub calls: u64,
    /// Sum of reported values.
    pub total: u64,
    /// Most recently reported value.
    pub last: u64,
}

/// Reporter that keeps per-name totals in memory.
#[derive(Debug, Default)]
pub struct CountingHealthReporter {
    metrics: Mutex<BTreeMap<String, MetricTotals>>,
}

impl CountingHealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of values reported under `name`, zero if never reported.
    pub fn total(&self, name: &str) -> u64 {
        self.get(name).total
    }

    /// Number of reports made under `name`.
    pub fn calls(&self, name: &str) -> u64 {
        self.get(name).calls
    }

    pub fn get(&self, name: &str) -> MetricTotals {
        #[allow(clippy::expect_used)]
        let metrics = self.metrics.lock().expect("lock poisoned");
        metrics.get(name).copied().unwrap_or_default()
    }

    /// Point-in-time copy of every metric.
    pub fn snapshot(&self) -> BTreeMap<String, MetricTotals> {
        #[allow(clippy::expect_used)]
        let metrics = self.metrics.lock().expect("lock poisoned");
        metrics.clone()
    }
}

impl HealthReporter for CountingHealthReporter {
    fn report(&self, metric: Supportability) {
        let value = metric.value();
        #[allow(clippy::expect_used)]
        let mut metrics = self.metrics.lock().expect("lock poisoned");
        let totals = metrics.entry(metric.name()).or_default();
        totals.calls += 1;
        totals.total += value;
        totals.last = value;
    }
}

/// Reporter that logs every metric at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHealthReporter;

impl HealthReporter for TracingHealthReporter {
    fn report(&self, metric: Supportability) {
        debug!(metric = %metric.name(), value = metric.value(), "supportability metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert_eq!(
            Supportability::Seen {
                kind: TelemetryKind::Span,
                count: 1
            }
            .name(),
            "Supportability/SpanEvent/Seen"
        );
        assert_eq!(
            Supportability::PayloadDroppedMaxSize {
                method: "analytic_event_data".to_string()
            }
            .name(),
            "Supportability/Collector/MaxPayloadSizeLimit/analytic_event_data"
        );
        assert_eq!(
            Supportability::StreamStatus(StatusCode::FailedPrecondition).name(),
            "Supportability/Streaming/Span/gRPC/FAILED_PRECONDITION"
        );
        assert_eq!(
            Supportability::StreamCompression(false).name(),
            "Supportability/Streaming/Compression/disabled"
        );
    }

    #[test]
    fn test_counting_reporter_accumulates() {
        let reporter = CountingHealthReporter::new();
        reporter.report(Supportability::Dropped {
            kind: TelemetryKind::Custom,
            count: 2,
        });
        reporter.report(Supportability::Dropped {
            kind: TelemetryKind::Custom,
            count: 3,
        });
        reporter.report(Supportability::StreamResponseError);

        let dropped = reporter.get("Supportability/CustomEvent/Dropped");
        assert_eq!(
            dropped,
            MetricTotals {
                calls: 2,
                total: 5,
                last: 3
            }
        );
        assert_eq!(
            reporter.total("Supportability/Streaming/Span/Response/Error"),
            1
        );
        assert_eq!(reporter.total("never/reported"), 0);
        assert_eq!(reporter.snapshot().len(), 2);
    }
}
