// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request/response delivery to the collector.
//!
//! [`RetryingRequestSender`] compresses a serialized payload, refuses payloads
//! above the configured size, and retries transient failures a fixed number of
//! times before handing the result back.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{delay_for_attempt, with_jitter, BackoffConfig, Delayer, TokioDelayer};
use crate::config::{CollectorConfig, Compression};
use crate::errors::{SendError, TransportError};
use crate::metrics::{HealthReporter, Supportability};
use crate::transport::{obfuscate, HttpRequest, HttpResponse, RequestTransport};
use crate::MAX_SEND_ATTEMPTS;

const INVOKE_PATH: &str = "/agent_listener/invoke_raw_method";
const PROTOCOL_VERSION: u32 = 17;
const EMPTY_OBJECT: &[u8] = b"{}";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.1;

/// HTTP statuses worth another attempt.
const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

pub(crate) fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Session values added to every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Collector host, replaced by the preconnect redirect.
    pub host: String,
    pub run_id: Option<String>,
    /// Headers the collector asked to see on every data request.
    pub headers: BTreeMap<String, String>,
}

/// Decoded collector response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorResponse {
    pub status: u16,
    /// Always valid JSON text; an empty reply reads as `{}`.
    pub body: String,
    /// The payload was too large and never left the process.
    pub payload_dropped: bool,
}

impl CollectorResponse {
    fn dropped() -> Self {
        Self {
            status: 200,
            body: String::from_utf8_lossy(EMPTY_OBJECT).into_owned(),
            payload_dropped: true,
        }
    }
}

#[derive(Debug)]
pub struct RetryingRequestSender {
    transport: Arc<dyn RequestTransport>,
    reporter: Arc<dyn HealthReporter>,
    delayer: Arc<dyn Delayer>,
    config: CollectorConfig,
    backoff: BackoffConfig,
    cancel: CancellationToken,
}

impl RetryingRequestSender {
    pub fn new(
        transport: Arc<dyn RequestTransport>,
        reporter: Arc<dyn HealthReporter>,
        config: CollectorConfig,
    ) -> Self {
        let backoff = BackoffConfig {
            base: config.retry_base_delay(),
            max_backoff: MAX_RETRY_DELAY,
            factor: 2.0,
        };
        Self {
            transport,
            reporter,
            delayer: Arc::new(TokioDelayer),
            config,
            backoff,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_delayer(mut self, delayer: Arc<dyn Delayer>) -> Self {
        self.delayer = delayer;
        self
    }

    /// Cancelling `cancel` aborts in-flight requests and pending retries.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Sends a request, retrying transient failures.
    ///
    /// A retryable status that is still returned on the last attempt comes
    /// back as a response; only transport errors are raised.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            // The transport consumes the request, so every attempt gets its own.
            let result = tokio::select! {
                () = self.cancel.cancelled() => Err(TransportError::Cancelled),
                result = self.transport.send_request(request.clone()) => result,
            };

            match result {
                Ok(response) if is_retryable_status(response.status) => {
                    if attempts >= MAX_SEND_ATTEMPTS {
                        warn!(
                            status = response.status,
                            attempts, "Collector request failed after all attempts"
                        );
                        return Ok(response);
                    }
                    debug!(
                        status = response.status,
                        attempts, "Retrying collector request after retryable status"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempts < MAX_SEND_ATTEMPTS => {
                    debug!(error = %e, attempts, "Retrying collector request after transport error");
                }
                Err(e) => return Err(e),
            }

            let delay = with_jitter(
                delay_for_attempt(&self.backoff, attempts - 1),
                JITTER_FRACTION,
            );
            if !self.delayer.delay(delay, &self.cancel).await {
                return Err(TransportError::Cancelled);
            }
        }
    }

    /// Invokes a collector method with a serialized JSON payload.
    pub async fn send(
        &self,
        method: &str,
        payload: &[u8],
        context: &RequestContext,
    ) -> Result<CollectorResponse, SendError> {
        let body = compress(payload, self.config.compression)
            .map_err(|e| SendError::Encode(e.to_string()))?;

        if body.len() > self.config.max_payload_bytes {
            warn!(
                method,
                size = body.len(),
                max = self.config.max_payload_bytes,
                "Payload exceeds the maximum size, dropping it"
            );
            self.reporter.report(Supportability::PayloadDroppedMaxSize {
                method: method.to_string(),
            });
            return Ok(CollectorResponse::dropped());
        }

        let mut request = HttpRequest::post(self.method_url(method, context, false), body)
            .with_header("Content-Type", "application/json")
            .with_header(
                "Content-Encoding",
                self.config.compression.content_encoding(),
            );
        for (name, value) in &context.headers {
            request = request.with_header(name.clone(), value.clone());
        }

        if self.config.audit_log {
            info!(
                target: "audit",
                url = %self.method_url(method, context, true),
                body = %String::from_utf8_lossy(payload),
                "Outgoing collector request"
            );
        }

        let response = self.execute(request).await?;
        let body = decode_body(&response)?;

        if self.config.audit_log {
            info!(
                target: "audit",
                method,
                status = response.status,
                body = %body,
                "Incoming collector response"
            );
        }

        if !response.is_success() {
            self.reporter.report(Supportability::CollectorError {
                method: method.to_string(),
                status: response.status,
            });
            return Err(SendError::Status {
                status: response.status,
                body,
            });
        }

        Ok(CollectorResponse {
            status: response.status,
            body,
            payload_dropped: false,
        })
    }

    fn method_url(&self, method: &str, context: &RequestContext, redact: bool) -> String {
        let scheme = if self.config.ssl { "https" } else { "http" };
        let host = if context.host.is_empty() {
            &self.config.host
        } else {
            &context.host
        };
        let license_key = if redact {
            obfuscate(&self.config.license_key)
        } else {
            self.config.license_key.clone()
        };
        let mut url = format!(
            "{scheme}://{host}:{}{INVOKE_PATH}?method={method}&license_key={license_key}&marshal_format=json&protocol_version={PROTOCOL_VERSION}",
            self.config.port
        );
        if let Some(run_id) = &context.run_id {
            url.push_str("&run_id=");
            url.push_str(run_id);
        }
        url
    }
}

fn compress(payload: &[u8], compression: Compression) -> std::io::Result<Bytes> {
    let compressed = match compression {
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload)?;
            encoder.finish()?
        }
        Compression::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload)?;
            encoder.finish()?
        }
        Compression::None => payload.to_vec(),
    };
    Ok(Bytes::from(compressed))
}

fn decode_body(response: &HttpResponse) -> Result<String, SendError> {
    let is_gzip = response
        .header("content-encoding")
        .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"));

    let raw = if is_gzip {
        let mut decoder = flate2::read::GzDecoder::new(response.body.as_ref());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| SendError::Decode(e.to_string()))?;
        decompressed
    } else {
        response.body.to_vec()
    };

    let text = String::from_utf8_lossy(&raw);
    let text = text.trim();
    if text.is_empty() || text == "null" {
        return Ok(String::from_utf8_lossy(EMPTY_OBJECT).into_owned());
    }
    Ok(text.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted results and records every request it receives.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedRequestTransport {
        script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedRequestTransport {
        pub(crate) fn push(&self, result: Result<HttpResponse, TransportError>) {
            self.script.lock().expect("lock poisoned").push_back(result);
        }

        pub(crate) fn push_status(&self, status: u16, body: &str) {
            self.push(Ok(HttpResponse::new(status, body.to_string())));
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().expect("lock poisoned").clone()
        }

        pub(crate) fn methods(&self) -> Vec<String> {
            self.requests()
                .iter()
                .filter_map(|request| {
                    request
                        .url
                        .split(['?', '&'])
                        .find_map(|part| part.strip_prefix("method="))
                        .map(str::to_string)
                })
                .collect()
        }
    }

    #[async_trait]
    impl RequestTransport for ScriptedRequestTransport {
        async fn send_request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().expect("lock poisoned").push(request);
            let next = self.script.lock().expect("lock poisoned").pop_front();
            next.unwrap_or_else(|| Ok(HttpResponse::new(200, "{}")))
        }
    }

    pub(crate) fn gunzip(body: &[u8]) -> Vec<u8> {
        let mut decoder = flate2::read::GzDecoder::new(body);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).expect("valid gzip");
        out
    }
}
