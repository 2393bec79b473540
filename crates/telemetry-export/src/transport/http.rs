// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tracing::{debug, error};

use super::RequestTransport;
use crate::config::ProxyConfig;
use crate::errors::TransportError;

/// An owned request. Cloning is cheap since the body is reference counted.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Builds a reqwest client with optional proxy configuration and timeout.
pub fn build_client(
    proxy: Option<&ProxyConfig>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(270))
        .tcp_keepalive(Duration::from_secs(120));
    if let Some(proxy) = proxy {
        let mut settings = reqwest::Proxy::all(proxy.url())?;
        if let Some(user) = &proxy.user {
            settings = settings.basic_auth(user, proxy.password.as_deref().unwrap_or_default());
        }
        if !proxy.bypass.is_empty() {
            settings = settings.no_proxy(reqwest::NoProxy::from_string(&proxy.bypass.join(",")));
        }
        builder = builder.proxy(settings);
    }
    builder.build()
}

/// [`RequestTransport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds the client from proxy settings, falling back to a direct
    /// connection when the proxy cannot be parsed.
    pub fn from_settings(proxy: Option<&ProxyConfig>, timeout: Duration) -> Self {
        let client = match build_client(proxy, timeout) {
            Ok(client) => client,
            Err(e) => {
                error!(
                    "Unable to parse proxy configuration: {}, falling back to direct connection",
                    e
                );
                build_client(None, timeout).unwrap_or_else(|_| reqwest::Client::new())
            }
        };
        Self::new(client)
    }
}

#[async_trait]
impl RequestTransport for ReqwestTransport {
    async fn send_request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Request(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| TransportError::Request(e.to_string()))?;
            headers.append(name, value);
        }

        debug!(method = %request.method, url = %request.url, "Sending collector request");
        let response = self
            .client
            .request(request.method, &request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_header_lookup_ignores_case() {
        let response = HttpResponse::new(200, "{}").with_header("Content-Encoding", "gzip");
        assert_eq!(response.header("content-encoding"), Some("gzip"));
        assert_eq!(response.header("content-type"), None);
        assert!(response.is_success());
        assert!(!HttpResponse::new(503, "").is_success());
    }

    #[test]
    fn test_build_client_with_proxy() {
        let proxy = ProxyConfig {
            host: "proxy.internal".to_string(),
            port: 3128,
            user: Some("user".to_string()),
            password: Some("secret".to_string()),
            bypass: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        };
        assert!(build_client(Some(&proxy), Duration::from_secs(5)).is_ok());
        assert!(build_client(None, Duration::from_secs(5)).is_ok());
    }
}
