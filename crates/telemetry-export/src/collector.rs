// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Harvest delivery over the collector session.
//!
//! [`CollectorTransport`] serializes a harvest for its collector method and
//! turns whatever happens to the request into a [`SendOutcome`]. Statuses that
//! invalidate the session are also announced on the lifecycle controller.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::aggregator::{HarvestInfo, HarvestSink, SendOutcome};
use crate::errors::{SendError, SessionError, TransportError};
use crate::item::{TelemetryItem, TelemetryKind};
use crate::lifecycle::LifecycleController;
use crate::session::SessionManager;

/// Follow-up the session needs after a collector status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    None,
    Restart,
    Shutdown,
}

fn classify_status(status: u16) -> (SendOutcome, Signal) {
    match status {
        413 => (SendOutcome::ReduceAndRetry, Signal::None),
        408 | 429 | 500 | 502 | 503 | 504 => (SendOutcome::Retain, Signal::None),
        401 | 409 => (SendOutcome::Discard, Signal::Restart),
        410 => (SendOutcome::Fatal, Signal::Shutdown),
        _ => (SendOutcome::Discard, Signal::None),
    }
}

fn classify_transport(err: &TransportError) -> SendOutcome {
    match err {
        TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Io(_) => {
            SendOutcome::ConnectionError
        }
        TransportError::Cancelled => SendOutcome::Retain,
        TransportError::Request(_) => SendOutcome::Discard,
    }
}

/// [`HarvestSink`] that posts harvests to the collector.
#[derive(Debug, Clone)]
pub struct CollectorTransport {
    session: Arc<SessionManager>,
    lifecycle: LifecycleController,
}

impl CollectorTransport {
    pub fn new(session: Arc<SessionManager>, lifecycle: LifecycleController) -> Self {
        Self { session, lifecycle }
    }

    fn outcome_for(&self, method: &str, err: SessionError) -> SendOutcome {
        match err {
            SessionError::NotConnected => SendOutcome::Retain,
            SessionError::Send(SendError::Status { status, .. }) => {
                let (outcome, signal) = classify_status(status);
                warn!(method, status, ?outcome, "Collector rejected the harvest");
                match signal {
                    Signal::Restart => self
                        .lifecycle
                        .request_restart(format!("status {status} on {method}")),
                    Signal::Shutdown => self
                        .lifecycle
                        .request_shutdown(format!("status {status} on {method}")),
                    Signal::None => {}
                }
                outcome
            }
            SessionError::Send(SendError::Transport(e)) => {
                let outcome = classify_transport(&e);
                warn!(method, error = %e, ?outcome, "Harvest request failed");
                outcome
            }
            other => {
                error!(method, error = %other, "Unexpected harvest failure, discarding");
                SendOutcome::Discard
            }
        }
    }
}

#[async_trait]
impl<T> HarvestSink<T> for CollectorTransport
where
    T: TelemetryItem + Serialize,
{
    async fn send(&self, info: &HarvestInfo, items: &[T]) -> SendOutcome {
        let Some(run_id) = self.session.run_id() else {
            debug!(kind = %info.kind, "No collector session yet, keeping the harvest");
            return SendOutcome::Retain;
        };
        let method = info.kind.collector_method();

        let payload = match encode_payload(&run_id, info, items) {
            Ok(payload) => payload,
            Err(e) => {
                error!(method, "Failed to serialize harvest: {}", e);
                return SendOutcome::Discard;
            }
        };

        match self.session.send_data_request(method, &payload).await {
            Ok(response) if response.payload_dropped => SendOutcome::PayloadTooLarge,
            Ok(_) => SendOutcome::Success,
            Err(e) => self.outcome_for(method, e),
        }
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Builds the wire payload for `info.kind`.
fn encode_payload<T: Serialize>(
    run_id: &str,
    info: &HarvestInfo,
    items: &[T],
) -> Result<Vec<u8>, serde_json::Error> {
    let items = serde_json::to_value(items)?;
    let payload = match info.kind {
        TelemetryKind::Metric => json!([
            run_id,
            unix_secs(info.window.start),
            unix_secs(info.window.end),
            items
        ]),
        TelemetryKind::Log => json!([{ "logs": items }]),
        TelemetryKind::Span
        | TelemetryKind::Transaction
        | TelemetryKind::Error
        | TelemetryKind::Custom => json!([
            run_id,
            {
                "reservoir_size": info.reservoir_size,
                "events_seen": info.seen,
            },
            items
        ]),
    };
    serde_json::to_vec(&payload)
}
