// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::StreamError;

/// Key of the metadata entry carrying the license key.
pub(crate) const LICENSE_KEY: &str = "license_key";

/// Address of the streaming collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
}

impl Endpoint {
    pub fn uri(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Key/value metadata attached to channel and stream creation.
///
/// The `Debug` output never shows the license key in full.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.entries {
            if key == LICENSE_KEY {
                map.entry(key, &obfuscate(value));
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// Keeps the first and last four characters of a secret.
pub(crate) fn obfuscate(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}

/// Message built from a run of queued items.
pub trait StreamingBatch: Send + Sync + 'static {
    type Item: Send + 'static;

    fn from_items(items: &[Self::Item]) -> Self;
}

/// Bidirectional streaming RPC transport.
///
/// One channel is shared by every consumer; each consumer owns the writer and
/// reader of its own stream. Callers race every future against their
/// cancellation token, so implementations only need to honor the timeout.
#[async_trait]
pub trait StreamingTransport: Send + Sync + 'static {
    /// Batch message written to the stream.
    type Batch: StreamingBatch;
    /// Request half of an open stream.
    type Writer: Send + 'static;
    /// Response half of an open stream.
    type Reader: Send + 'static;

    /// Opens the shared channel. `Ok(false)` means the channel could not be
    /// established without a more specific status.
    async fn create_channel(
        &self,
        endpoint: &Endpoint,
        metadata: &Metadata,
        timeout: Duration,
    ) -> Result<bool, StreamError>;

    async fn create_stream(
        &self,
        metadata: &Metadata,
        timeout: Duration,
    ) -> Result<(Self::Writer, Self::Reader), StreamError>;

    /// Writes one batch. `Ok(false)` means the write was not accepted.
    async fn try_send(
        &self,
        writer: &mut Self::Writer,
        batch: &Self::Batch,
        timeout: Duration,
    ) -> Result<bool, StreamError>;

    /// Next acknowledgement from the server: the number of items it has seen,
    /// `None` when the server closed the stream.
    async fn next_response(&self, reader: &mut Self::Reader) -> Result<Option<u64>, StreamError>;

    async fn close_stream(&self, writer: Self::Writer);

    /// Releases the channel.
    async fn shutdown(&self);
}
