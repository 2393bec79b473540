// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::item::TelemetryKind;
use crate::transport::Endpoint;

/// Largest partition count the streaming queue accepts.
pub const MAX_PARTITIONS: usize = 64;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Request body compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Deflate,
    None,
}

impl Compression {
    /// Value sent in the `Content-Encoding` header.
    pub fn content_encoding(self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
            Compression::None => "identity",
        }
    }
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gzip" => Ok(Compression::Gzip),
            "deflate" => Ok(Compression::Deflate),
            "none" | "identity" => Ok(Compression::None),
            other => Err(ConfigError::Invalid(format!(
                "unknown compression encoding '{other}'"
            ))),
        }
    }
}

/// Proxy settings, passed through to the HTTP client untouched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Hosts reached without the proxy.
    #[serde(default)]
    pub bypass: Vec<String>,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        if self.host.contains("://") {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

/// Request/response collector settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub license_key: String,
    /// Application name reported on connect.
    pub app_name: String,
    /// Largest compressed payload the sender will transmit.
    pub max_payload_bytes: usize,
    pub compression: Compression,
    pub request_timeout_ms: u64,
    /// First retry delay; doubled on every further attempt.
    pub retry_base_delay_ms: u64,
    pub proxy: Option<ProxyConfig>,
    /// Log request and response bodies under the `audit` target.
    pub audit_log: bool,
    /// Connect synchronously when the session starts.
    pub sync_startup: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 443,
            ssl: true,
            license_key: String::new(),
            app_name: "My Application".to_string(),
            max_payload_bytes: 1_000_000,
            compression: Compression::Gzip,
            request_timeout_ms: 120_000,
            retry_base_delay_ms: 500,
            proxy: None,
            audit_log: false,
            sync_startup: false,
        }
    }
}

impl CollectorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Streaming export settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Bare host name; an empty host leaves streaming disabled.
    pub host: String,
    /// Kept as text so a non-numeric value can be rejected by validation.
    pub port: String,
    pub ssl: bool,
    pub batch_size: usize,
    /// Number of concurrent consumer tasks.
    pub consumers: usize,
    pub partition_count: usize,
    pub queue_capacity: usize,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub compression: bool,
    /// Percentage of requests the collector should fail (test knob).
    pub flaky: Option<f32>,
    /// Status code used for artificial failures (test knob).
    pub flaky_code: Option<i32>,
    /// Artificial server-side delay (test knob).
    pub delay_ms: Option<i64>,
    /// User supplied headers added to the stream metadata.
    pub request_headers: BTreeMap<String, String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: "443".to_string(),
            ssl: true,
            batch_size: 700,
            consumers: 1,
            partition_count: 62,
            queue_capacity: 100_000,
            connect_timeout_ms: 10_000,
            send_timeout_ms: 10_000,
            compression: true,
            flaky: None,
            flaky_code: None,
            delay_ms: None,
            request_headers: BTreeMap::new(),
        }
    }
}

impl StreamingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Checks every setting the streaming service depends on and returns the
    /// endpoint to connect to.
    pub fn validate(&self) -> Result<Endpoint, ConfigError> {
        let host = self.host.trim();
        if !is_bare_host(host) {
            return Err(ConfigError::Invalid(format!(
                "streaming host '{}' must be a bare host name",
                self.host
            )));
        }

        let port = match self.port.trim().parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "streaming port '{}' must be a number between 1 and 65535",
                    self.port
                )))
            }
        };

        if self.batch_size < 1 {
            return Err(ConfigError::Invalid(
                "streaming batch size must be at least 1".to_string(),
            ));
        }
        if self.consumers < 1 {
            return Err(ConfigError::Invalid(
                "streaming consumers must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "streaming timeouts must be greater than 0".to_string(),
            ));
        }
        if !(1..=MAX_PARTITIONS).contains(&self.partition_count) {
            return Err(ConfigError::Invalid(format!(
                "partition count {} must be between 1 and {MAX_PARTITIONS}",
                self.partition_count
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "streaming queue capacity must be greater than 0".to_string(),
            ));
        }
        if let Some(flaky) = self.flaky {
            if !(0.0..=100.0).contains(&flaky) {
                return Err(ConfigError::Invalid(format!(
                    "flaky percentage {flaky} must be between 0 and 100"
                )));
            }
        }
        if let Some(code) = self.flaky_code {
            if !(0..=16).contains(&code) {
                return Err(ConfigError::Invalid(format!(
                    "flaky code {code} must be between 0 and 16"
                )));
            }
        }
        if let Some(delay) = self.delay_ms {
            if delay < 0 {
                return Err(ConfigError::Invalid(format!(
                    "delay {delay} must not be negative"
                )));
            }
        }

        Ok(Endpoint {
            host: host.to_string(),
            port,
            ssl: self.ssl,
        })
    }
}

/// A host without scheme, port or path. IPv6 literals are accepted.
fn is_bare_host(host: &str) -> bool {
    if host.is_empty() || host.contains("://") || host.contains('/') {
        return false;
    }
    if host.chars().any(char::is_whitespace) {
        return false;
    }
    match host.matches(':').count() {
        0 => true,
        // A single colon can only be a host:port pair.
        1 => false,
        _ => !host.starts_with('['),
    }
}

/// Harvest settings for one telemetry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HarvestLimits {
    pub enabled: bool,
    pub capacity: usize,
    pub interval_ms: u64,
}

impl HarvestLimits {
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            enabled: true,
            capacity,
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Collection runs only when the feature is on and there is room to buffer.
    pub fn is_enabled(&self) -> bool {
        self.enabled && self.capacity > 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for HarvestLimits {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub spans: HarvestLimits,
    pub transactions: HarvestLimits,
    pub errors: HarvestLimits,
    pub custom: HarvestLimits,
    pub logs: HarvestLimits,
    pub metrics: HarvestLimits,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            spans: HarvestLimits::new(2_000, minute),
            transactions: HarvestLimits::new(10_000, minute),
            errors: HarvestLimits::new(100, minute),
            custom: HarvestLimits::new(30_000, minute),
            logs: HarvestLimits::new(10_000, minute),
            metrics: HarvestLimits::new(100_000, minute),
        }
    }
}

impl HarvestConfig {
    pub fn limits(&self, kind: TelemetryKind) -> HarvestLimits {
        match kind {
            TelemetryKind::Span => self.spans,
            TelemetryKind::Transaction => self.transactions,
            TelemetryKind::Error => self.errors,
            TelemetryKind::Custom => self.custom,
            TelemetryKind::Log => self.logs,
            TelemetryKind::Metric => self.metrics,
        }
    }

    fn limits_mut(&mut self, kind: TelemetryKind) -> &mut HarvestLimits {
        match kind {
            TelemetryKind::Span => &mut self.spans,
            TelemetryKind::Transaction => &mut self.transactions,
            TelemetryKind::Error => &mut self.errors,
            TelemetryKind::Custom => &mut self.custom,
            TelemetryKind::Log => &mut self.logs,
            TelemetryKind::Metric => &mut self.metrics,
        }
    }
}

/// Configuration of the whole export pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub collector: CollectorConfig,
    pub streaming: StreamingConfig,
    pub harvest: HarvestConfig,
    /// Flush buffered telemetry once at shutdown.
    pub send_on_exit: bool,
    /// Upper bound on the flush performed at shutdown.
    pub send_on_exit_timeout_ms: u64,
    pub log_level: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            streaming: StreamingConfig::default(),
            harvest: HarvestConfig::default(),
            send_on_exit: false,
            send_on_exit_timeout_ms: 2_000,
            log_level: "info".to_string(),
        }
    }
}

impl ExportConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(key) = env_string("TELEMETRY_LICENSE_KEY") {
            config.collector.license_key = key;
        }
        if let Some(app_name) = env_string("TELEMETRY_APP_NAME") {
            config.collector.app_name = app_name;
        }
        if let Some(host) = env_string("TELEMETRY_HOST") {
            config.collector.host = host;
        }
        if let Some(port) = env_parse("TELEMETRY_PORT")? {
            config.collector.port = port;
        }
        if let Some(ssl) = env_bool("TELEMETRY_SSL")? {
            config.collector.ssl = ssl;
        }
        if let Some(max) = env_parse("TELEMETRY_MAX_PAYLOAD_BYTES")? {
            config.collector.max_payload_bytes = max;
        }
        if let Some(compression) = env_parse("TELEMETRY_COMPRESSION")? {
            config.collector.compression = compression;
        }
        if let Some(timeout) = env_parse("TELEMETRY_REQUEST_TIMEOUT_MS")? {
            config.collector.request_timeout_ms = timeout;
        }
        if let Some(audit) = env_bool("TELEMETRY_AUDIT_LOG")? {
            config.collector.audit_log = audit;
        }
        if let Some(sync) = env_bool("TELEMETRY_SYNC_STARTUP")? {
            config.collector.sync_startup = sync;
        }
        if let Some(host) = env_string("TELEMETRY_PROXY_HOST") {
            config.collector.proxy = Some(ProxyConfig {
                host,
                port: env_parse("TELEMETRY_PROXY_PORT")?.unwrap_or(8080),
                user: env_string("TELEMETRY_PROXY_USER"),
                password: env_string("TELEMETRY_PROXY_PASSWORD"),
                bypass: env_string("TELEMETRY_PROXY_BYPASS")
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|host| !host.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            });
        }

        if let Some(host) = env_string("TELEMETRY_STREAMING_HOST") {
            config.streaming.host = host;
        }
        if let Some(port) = env_string("TELEMETRY_STREAMING_PORT") {
            config.streaming.port = port;
        }
        if let Some(ssl) = env_bool("TELEMETRY_STREAMING_SSL")? {
            config.streaming.ssl = ssl;
        }
        if let Some(batch_size) = env_parse("TELEMETRY_STREAMING_BATCH_SIZE")? {
            config.streaming.batch_size = batch_size;
        }
        if let Some(consumers) = env_parse("TELEMETRY_STREAMING_CONSUMERS")? {
            config.streaming.consumers = consumers;
        }
        if let Some(partitions) = env_parse("TELEMETRY_STREAMING_PARTITIONS")? {
            config.streaming.partition_count = partitions;
        }
        if let Some(capacity) = env_parse("TELEMETRY_STREAMING_QUEUE_SIZE")? {
            config.streaming.queue_capacity = capacity;
        }
        if let Some(compression) = env_bool("TELEMETRY_STREAMING_COMPRESSION")? {
            config.streaming.compression = compression;
        }

        for (kind, samples_var, enabled_var) in [
            (
                TelemetryKind::Span,
                "TELEMETRY_SPAN_EVENTS_MAX_SAMPLES",
                "TELEMETRY_SPAN_EVENTS_ENABLED",
            ),
            (
                TelemetryKind::Transaction,
                "TELEMETRY_TRANSACTION_EVENTS_MAX_SAMPLES",
                "TELEMETRY_TRANSACTION_EVENTS_ENABLED",
            ),
            (
                TelemetryKind::Error,
                "TELEMETRY_ERROR_EVENTS_MAX_SAMPLES",
                "TELEMETRY_ERROR_EVENTS_ENABLED",
            ),
            (
                TelemetryKind::Custom,
                "TELEMETRY_CUSTOM_EVENTS_MAX_SAMPLES",
                "TELEMETRY_CUSTOM_EVENTS_ENABLED",
            ),
            (
                TelemetryKind::Log,
                "TELEMETRY_LOG_EVENTS_MAX_SAMPLES",
                "TELEMETRY_LOG_EVENTS_ENABLED",
            ),
        ] {
            let limits = config.harvest.limits_mut(kind);
            if let Some(capacity) = env_parse(samples_var)? {
                limits.capacity = capacity;
            }
            if let Some(enabled) = env_bool(enabled_var)? {
                limits.enabled = enabled;
            }
        }

        if let Some(send_on_exit) = env_bool("TELEMETRY_SEND_ON_EXIT")? {
            config.send_on_exit = send_on_exit;
        }
        if let Some(timeout) = env_parse("TELEMETRY_SEND_ON_EXIT_TIMEOUT_MS")? {
            config.send_on_exit_timeout_ms = timeout;
        }
        if let Some(level) = env_string("TELEMETRY_LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the settings that are required regardless of streaming.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collector.host.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "collector host cannot be empty".to_string(),
            ));
        }
        if self.collector.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max payload size must be greater than 0".to_string(),
            ));
        }
        if self.collector.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request timeout must be greater than 0".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn send_on_exit_timeout(&self) -> Duration {
        Duration::from_millis(self.send_on_exit_timeout_ms)
    }
}

fn env_string(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env { name, value }),
        None => Ok(None),
    }
}

fn env_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match env_string(name) {
        Some(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::Env { name, value }),
        },
        None => Ok(None),
    }
}
