// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle signals shared between the session, the collector transport and
//! the pipeline.
//!
//! Components receive a [`LifecycleController`] at construction and either
//! publish to it or subscribe to it. There is no process-wide bus.

use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 16;

/// Events announced to the rest of the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The session completed its handshake.
    Connected { run_id: String },
    /// The session was torn down and will reconnect.
    Disconnected,
    /// The collector asked for a new session.
    RestartRequested(String),
    /// Data collection must stop for good. The application keeps running.
    Shutdown(String),
}

#[derive(Debug, Clone)]
pub struct LifecycleController {
    events_tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        let (events_tx, _events_rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { events_tx }
    }

    /// Get a receiver for lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events_tx.subscribe()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        debug!(?event, "Publishing lifecycle event");
        // No subscriber is not an error: nobody is interested yet.
        let _ = self.events_tx.send(event);
    }

    pub fn request_restart(&self, reason: impl Into<String>) {
        self.publish(LifecycleEvent::RestartRequested(reason.into()));
    }

    pub fn request_shutdown(&self, reason: impl Into<String>) {
        self.publish(LifecycleEvent::Shutdown(reason.into()));
    }
}
