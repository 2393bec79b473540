// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-windowed aggregation of telemetry.
//!
//! A [`HarvestAggregator`] buffers one telemetry type in a bounded
//! [`Reservoir`] and hands it to a [`HarvestSink`] on every harvest cycle.
//! High-volume types go through a [`StreamingAggregator`] instead, which
//! feeds a partitioned queue drained by a streaming consumer.

mod harvest;
mod reservoir;
mod streaming;

pub use harvest::{HarvestAggregator, HarvestCycle};
pub use reservoir::{Admission, OverflowPolicy, Reservoir};
pub use streaming::StreamingAggregator;

use std::time::SystemTime;

use async_trait::async_trait;

use crate::item::TelemetryKind;

/// Result of handing a harvest to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// Keep the items for the next harvest.
    Retain,
    /// Drop the items.
    Discard,
    /// The payload was too big: keep half of it for the next harvest.
    ReduceAndRetry,
    /// The collector could not be reached; behaves like `Retain`.
    ConnectionError,
    PayloadTooLarge,
    /// The session is over; behaves like `Discard`.
    Fatal,
}

/// Time range covered by a harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestWindow {
    pub start: SystemTime,
    pub end: SystemTime,
}

/// What the sink knows about the batch it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestInfo {
    pub kind: TelemetryKind,
    pub window: HarvestWindow,
    pub reservoir_size: usize,
    /// Items offered during the window, including the ones sampled out.
    pub seen: u64,
}

/// Destination of a harvest.
///
/// Implementations never fail: every error is folded into a [`SendOutcome`].
#[async_trait]
pub trait HarvestSink<T: Send + Sync>: Send + Sync {
    async fn send(&self, info: &HarvestInfo, items: &[T]) -> SendOutcome;
}
