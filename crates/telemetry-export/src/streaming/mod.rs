// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Long-lived streaming export.
//!
//! [`StreamingExportService`] drains a [`PartitionedQueue`] over a
//! bidirectional stream with one stream per consumer task. Connection
//! failures follow the reconnect state machine described on
//! [`ConnectionState`].

mod metadata;
mod service;

pub use metadata::{build_metadata, Credentials};
pub use service::{ConnectionState, StreamingExportService};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::queue::PartitionedQueue;

/// Consumer side of a streaming queue, as seen by the aggregator that feeds it.
#[async_trait]
pub trait StreamConsumer<I>: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Starts draining `queue`, replacing any queue consumed before.
    async fn start(&self, queue: Arc<PartitionedQueue<I>>);

    /// Stops every consumer. Items in flight go back to the queue.
    async fn stop(&self);

    /// Stops for good and releases the transport.
    async fn shutdown(&self);

    /// Waits until the queue is drained and nothing is in flight.
    async fn wait(&self, timeout: Duration) -> bool;
}
