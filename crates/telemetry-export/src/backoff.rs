// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backoff policies used by the exporters.
//!
//! Two policies exist side by side: the streaming reconnect sequence, a fixed
//! table of delays, and the exponential policy used by the session manager and
//! the request sender.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Streaming reconnect delays in seconds. The last entry repeats.
const STREAMING_SEQUENCE_SECS: [u64; 6] = [15, 15, 30, 60, 120, 300];

/// Fixed delay before a batch that failed to send is written again.
pub const POST_SEND_ERROR_DELAY: Duration = Duration::from_secs(15);

/// Position in the streaming reconnect sequence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamingBackoff {
    attempt: usize,
}

impl StreamingBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a failure and returns the delay before the next attempt.
    pub fn register_failure(&mut self) -> Duration {
        let index = self.attempt.min(STREAMING_SEQUENCE_SECS.len() - 1);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs(STREAMING_SEQUENCE_SECS[index])
    }

    /// Delay the next failure would produce, without registering it.
    pub fn current_delay(&self) -> Duration {
        let index = self.attempt.min(STREAMING_SEQUENCE_SECS.len() - 1);
        Duration::from_secs(STREAMING_SEQUENCE_SECS[index])
    }

    /// Number of failures registered since the last reset.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Configuration for the exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max_backoff: Duration,
    /// Exponential factor applied on error count increments.
    pub factor: f64,
}

impl BackoffConfig {
    /// Reconnect policy of the session manager: 5s, 10s, 20s ... capped at 5 minutes.
    pub fn session() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

/// Tracks the state of the exponential backoff algorithm.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    error_count: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            error_count: 0,
        }
    }

    /// Registers a failure and returns the recommended delay before retrying.
    pub fn register_error(&mut self) -> Duration {
        let delay = delay_for_attempt(&self.config, self.error_count);
        self.error_count = self.error_count.saturating_add(1);
        delay
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
    }
}

/// Delay for the zero-based `attempt`, without jitter.
pub fn delay_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
    // Exponents past 64 are far beyond any sensible cap.
    let exponent = attempt.min(64) as i32;
    let secs = config.base.as_secs_f64() * config.factor.powi(exponent);
    Duration::from_secs_f64(secs.min(config.max_backoff.as_secs_f64()))
}

/// Adds up to `fraction` of `delay` as random jitter.
pub fn with_jitter(delay: Duration, fraction: f64) -> Duration {
    let extra = delay.as_secs_f64() * fraction * fastrand::f64();
    delay + Duration::from_secs_f64(extra)
}

/// Issues the delays chosen by the reconnect logic.
///
/// Returns `false` when the wait was interrupted by cancellation.
#[async_trait]
pub trait Delayer: Send + Sync + std::fmt::Debug {
    async fn delay(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// [`Delayer`] backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDelayer;

#[async_trait]
impl Delayer for TokioDelayer {
    async fn delay(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if duration.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}
