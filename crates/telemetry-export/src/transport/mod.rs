// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Narrow contracts over the network libraries.
//!
//! The pipeline talks to the collector through two traits: [`RequestTransport`]
//! for request/response calls and [`StreamingTransport`] for the long-lived
//! bidirectional stream. Their implementations are chosen once at
//! construction.

mod http;
mod status;
mod streaming;

pub use http::{build_client, HttpRequest, HttpResponse, ReqwestTransport};
pub use status::StatusCode;
pub use streaming::{Endpoint, Metadata, StreamingBatch, StreamingTransport};
pub(crate) use streaming::{obfuscate, LICENSE_KEY};

use async_trait::async_trait;

use crate::errors::TransportError;

/// Request/response transport.
///
/// The request is consumed by the call; callers that retry keep their own
/// copy and clone it per attempt.
#[async_trait]
pub trait RequestTransport: Send + Sync + std::fmt::Debug {
    async fn send_request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}
