// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::transport::StatusCode;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value '{value}' for environment variable {name}")]
    Env { name: &'static str, value: String },
}

/// Errors surfaced by a transport implementation.
///
/// Variants are grouped the way the retry logic needs to see them: timeouts
/// and connection failures are transient, cancellation is caller-driven and
/// never retried, anything else is a programming or protocol problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    Request(String),
}

impl TransportError {
    /// Whether the request may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Io(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_request() || err.is_body() {
            TransportError::Io(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Error raised by the streaming transport. The status drives the reconnect
/// state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream call failed with status {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("stream call timed out after {0} ms")]
    Timeout(u64),

    #[error("stream is not available")]
    NotAvailable,

    #[error("stream call cancelled")]
    Cancelled,
}

impl StreamError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        StreamError::Status {
            status,
            message: message.into(),
        }
    }

    /// Status code carried by the error, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            StreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors returned by [`crate::sender::RetryingRequestSender::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("collector responded with status {status}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl SendError {
    /// Transport failures that indicate the collector could not be reached.
    pub fn is_network(&self) -> bool {
        matches!(self, SendError::Transport(err) if err.is_retryable())
    }
}

/// Errors raised by the session manager during connect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("collector requested a restart: {0}")]
    RestartRequested(String),

    #[error("connection to the collector failed: {0}")]
    ConnectionFailed(String),

    #[error("collector forced a disconnect: {0}")]
    ForceDisconnect(String),

    #[error("license key rejected by the collector")]
    LicenseRejected,

    #[error("malformed collector response: {0}")]
    InvalidResponse(String),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Send(#[from] SendError),
}

impl SessionError {
    /// Errors the session manager recovers from by reconnecting later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::RestartRequested(_) | SessionError::ConnectionFailed(_) => true,
            SessionError::Send(err) => err.is_network(),
            _ => false,
        }
    }
}
