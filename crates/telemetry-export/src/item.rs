// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::SystemTime;

/// A unit of telemetry handed to the pipeline by a producer.
///
/// The pipeline never looks inside an item beyond its priority, which ranks
/// it during reservoir sampling, and its timestamp.
pub trait TelemetryItem: Send + Sync + 'static {
    fn priority(&self) -> f32;

    fn timestamp(&self) -> SystemTime;
}

/// The telemetry types the pipeline knows how to harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TelemetryKind {
    Span,
    Transaction,
    Error,
    Custom,
    Log,
    Metric,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 6] = [
        TelemetryKind::Span,
        TelemetryKind::Transaction,
        TelemetryKind::Error,
        TelemetryKind::Custom,
        TelemetryKind::Log,
        TelemetryKind::Metric,
    ];

    /// Collector method used to deliver a harvest of this kind.
    pub fn collector_method(self) -> &'static str {
        match self {
            TelemetryKind::Span => "span_event_data",
            TelemetryKind::Transaction => "analytic_event_data",
            TelemetryKind::Error => "error_event_data",
            TelemetryKind::Custom => "custom_event_data",
            TelemetryKind::Log => "log_event_data",
            TelemetryKind::Metric => "metric_data",
        }
    }

    /// Segment used in supportability metric names.
    pub fn metric_segment(self) -> &'static str {
        match self {
            TelemetryKind::Span => "SpanEvent",
            TelemetryKind::Transaction => "TransactionEvent",
            TelemetryKind::Error => "ErrorEvent",
            TelemetryKind::Custom => "CustomEvent",
            TelemetryKind::Log => "LogEvent",
            TelemetryKind::Metric => "Metric",
        }
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_segment())
    }
}
