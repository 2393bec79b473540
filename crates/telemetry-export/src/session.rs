// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector session: handshake, reconnect scheduling and error
//! classification.
//!
//! A session starts with `preconnect`, which names the collector host to use,
//! followed by `connect`, which returns the run id, the headers every data
//! request must carry and the harvest limits granted by the server. Retryable
//! failures reconnect on the session backoff; anything else tears the session
//! down and asks the agent to stop collecting.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffConfig, Delayer, ExponentialBackoff, TokioDelayer};
use crate::config::HarvestLimits;
use crate::errors::{SendError, SessionError};
use crate::item::TelemetryKind;
use crate::lifecycle::{LifecycleController, LifecycleEvent};
use crate::sender::{is_retryable_status, CollectorResponse, RequestContext, RetryingRequestSender};

const PRECONNECT: &str = "preconnect";
const CONNECT: &str = "connect";
const SHUTDOWN: &str = "shutdown";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    return_value: T,
}

#[derive(Debug, Deserialize)]
struct PreconnectReply {
    redirect_host: String,
}

#[derive(Debug, Deserialize)]
struct ConnectReply {
    agent_run_id: serde_json::Value,
    #[serde(default)]
    request_headers_map: BTreeMap<String, String>,
    #[serde(default)]
    event_harvest_config: Option<EventHarvestConfig>,
}

#[derive(Debug, Deserialize)]
struct EventHarvestConfig {
    report_period_ms: u64,
    #[serde(default)]
    harvest_limits: BTreeMap<String, usize>,
}

/// State of an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub run_id: String,
    pub context: RequestContext,
    /// Limits granted by the collector, keyed by telemetry type.
    pub harvest_limits: BTreeMap<TelemetryKind, HarvestLimits>,
}

#[derive(Debug)]
pub struct SessionManager {
    sender: Arc<RetryingRequestSender>,
    lifecycle: LifecycleController,
    delayer: Arc<dyn Delayer>,
    backoff: BackoffConfig,
    session: RwLock<Option<SessionInfo>>,
    // Serializes handshakes so a restart never races the initial connect.
    connecting: Mutex<()>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(sender: Arc<RetryingRequestSender>, lifecycle: LifecycleController) -> Self {
        Self {
            sender,
            lifecycle,
            delayer: Arc::new(TokioDelayer),
            backoff: BackoffConfig::session(),
            session: RwLock::new(None),
            connecting: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_delayer(mut self, delayer: Arc<dyn Delayer>) -> Self {
        self.delayer = delayer;
        self
    }

    /// Connects right away when the collector config asks for a synchronous
    /// startup, otherwise schedules the connect and returns its handle.
    pub async fn start(self: &Arc<Self>) -> Option<JoinHandle<bool>> {
        if self.sender.config().sync_startup {
            self.connect().await;
            return None;
        }
        let session = Arc::clone(self);
        Some(tokio::spawn(async move { session.connect().await }))
    }

    /// Reconnects whenever a [`LifecycleEvent::RestartRequested`] is published.
    pub fn watch_restarts(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let mut events = self.lifecycle.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = session.cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(LifecycleEvent::RestartRequested(reason)) => {
                        info!(%reason, "Collector requested a new session");
                        session.reconnect().await;
                    }
                    Ok(LifecycleEvent::Shutdown(_)) | Err(broadcast::error::RecvError::Closed) => {
                        return
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Session restart watcher lagged behind");
                    }
                }
            }
        })
    }

    /// Runs the handshake until it succeeds, backing off on retryable errors.
    ///
    /// Returns `false` when the session was torn down or cancelled.
    pub async fn connect(&self) -> bool {
        let _guard = self.connecting.lock().await;
        let mut backoff = ExponentialBackoff::new(self.backoff);

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }

            match self.handshake().await {
                Ok(info) => {
                    info!(run_id = %info.run_id, host = %info.context.host, "Connected to the collector");
                    let run_id = info.run_id.clone();
                    self.store(Some(info));
                    self.lifecycle.publish(LifecycleEvent::Connected { run_id });
                    return true;
                }
                Err(_) if self.cancel.is_cancelled() => return false,
                Err(e) if e.is_retryable() => {
                    let delay = backoff.register_error();
                    warn!(error = %e, delay_secs = delay.as_secs(), "Collector connect failed, retrying");
                    if !self.delayer.delay(delay, &self.cancel).await {
                        return false;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Unrecoverable collector error, stopping data collection");
                    self.store(None);
                    self.cancel.cancel();
                    self.lifecycle.request_shutdown(e.to_string());
                    return false;
                }
            }
        }
    }

    /// Drops the current session and runs the handshake again.
    pub async fn reconnect(&self) -> bool {
        if self.store(None).is_some() {
            self.lifecycle.publish(LifecycleEvent::Disconnected);
        }
        self.connect().await
    }

    /// Sends a data request within the current session.
    pub async fn send_data_request(
        &self,
        method: &str,
        payload: &[u8],
    ) -> Result<CollectorResponse, SessionError> {
        let context = self
            .current()
            .map(|info| info.context)
            .ok_or(SessionError::NotConnected)?;
        Ok(self.sender.send(method, payload, &context).await?)
    }

    pub fn current(&self) -> Option<SessionInfo> {
        #[allow(clippy::expect_used)]
        let session = self.session.read().expect("lock poisoned").clone();
        session
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    pub fn run_id(&self) -> Option<String> {
        self.current().map(|info| info.run_id)
    }

    /// Tells the collector the session ends and stops any pending reconnect.
    pub async fn shutdown(&self) {
        if self.is_connected() {
            if let Err(e) = self.send_data_request(SHUTDOWN, b"[]").await {
                debug!(error = %e, "Failed to notify the collector of the shutdown");
            }
        }
        self.store(None);
        self.cancel.cancel();
    }

    fn store(&self, info: Option<SessionInfo>) -> Option<SessionInfo> {
        #[allow(clippy::expect_used)]
        let mut session = self.session.write().expect("lock poisoned");
        std::mem::replace(&mut *session, info)
    }

    async fn handshake(&self) -> Result<SessionInfo, SessionError> {
        let config = self.sender.config();

        let preconnect = self
            .sender
            .send(PRECONNECT, b"[]", &RequestContext::default())
            .await
            .map_err(classify)?;
        let redirect: PreconnectReply = parse(&preconnect)?;
        debug!(host = %redirect.redirect_host, "Collector redirect");

        let settings = json!([{
            "pid": std::process::id(),
            "language": "rust",
            "agent_version": env!("CARGO_PKG_VERSION"),
            "app_name": [config.app_name],
        }]);
        let payload = serde_json::to_vec(&settings).map_err(|e| SendError::Encode(e.to_string()))?;
        let context = RequestContext {
            host: redirect.redirect_host,
            ..Default::default()
        };
        let connect = self
            .sender
            .send(CONNECT, &payload, &context)
            .await
            .map_err(classify)?;
        let reply: ConnectReply = parse(&connect)?;

        let run_id = match reply.agent_run_id {
            serde_json::Value::String(id) => id,
            serde_json::Value::Number(id) => id.to_string(),
            other => {
                return Err(SessionError::InvalidResponse(format!(
                    "unexpected run id {other}"
                )))
            }
        };

        Ok(SessionInfo {
            context: RequestContext {
                host: context.host,
                run_id: Some(run_id.clone()),
                headers: reply.request_headers_map,
            },
            harvest_limits: reply
                .event_harvest_config
                .map(harvest_limits)
                .unwrap_or_default(),
            run_id,
        })
    }
}

fn parse<T: for<'de> Deserialize<'de>>(response: &CollectorResponse) -> Result<T, SessionError> {
    serde_json::from_str::<Envelope<T>>(&response.body)
        .map(|envelope| envelope.return_value)
        .map_err(|e| SessionError::InvalidResponse(e.to_string()))
}

fn harvest_limits(config: EventHarvestConfig) -> BTreeMap<TelemetryKind, HarvestLimits> {
    let interval = Duration::from_millis(config.report_period_ms);
    TelemetryKind::ALL
        .into_iter()
        .filter_map(|kind| {
            config
                .harvest_limits
                .get(kind.collector_method())
                .map(|&capacity| (kind, HarvestLimits::new(capacity, interval)))
        })
        .collect()
}

/// Maps a failed handshake request to the session taxonomy.
fn classify(err: SendError) -> SessionError {
    match err {
        SendError::Status {
            status: 401 | 403, ..
        } => SessionError::LicenseRejected,
        SendError::Status { status: 409, body } => SessionError::RestartRequested(body),
        SendError::Status { status: 410, body } => SessionError::ForceDisconnect(body),
        SendError::Status { status, .. } if is_retryable_status(status) || status >= 500 => {
            SessionError::ConnectionFailed(format!("collector responded with status {status}"))
        }
        SendError::Status { status, .. } => {
            SessionError::InvalidResponse(format!("unexpected status {status}"))
        }
        other => SessionError::Send(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::test_support::RecordingDelayer;
    use crate::config::{CollectorConfig, Compression};
    use crate::errors::TransportError;
    use crate::metrics::CountingHealthReporter;
    use crate::sender::test_support::ScriptedRequestTransport;
    use crate::transport::HttpResponse;

    const PRECONNECT_REPLY: &str = r#"{"return_value":{"redirect_host":"collector-002.local"}}"#;
    const CONNECT_REPLY: &str = r#"{"return_value":{
        "agent_run_id":"run-42",
        "request_headers_map":{"X-Request-Metadata":"token"},
        "event_harvest_config":{
            "report_period_ms":5000,
            "harvest_limits":{"analytic_event_data":833,"span_event_data":166,"error_event_data":8}
        }
    }}"#;

    struct Harness {
        transport: Arc<ScriptedRequestTransport>,
        delayer: Arc<RecordingDelayer>,
        lifecycle: LifecycleController,
        session: Arc<SessionManager>,
    }

    fn harness(sync_startup: bool) -> Harness {
        let transport = Arc::new(ScriptedRequestTransport::default());
        let config = CollectorConfig {
            host: "collector.local".to_string(),
            license_key: "0123456789abcdef".to_string(),
            compression: Compression::None,
            sync_startup,
            ..Default::default()
        };
        let sender = RetryingRequestSender::new(
            transport.clone(),
            Arc::new(CountingHealthReporter::new()),
            config,
        )
        .with_delayer(Arc::new(RecordingDelayer::default()));
        let delayer = Arc::new(RecordingDelayer::default());
        let lifecycle = LifecycleController::new();
        let session = Arc::new(
            SessionManager::new(Arc::new(sender), lifecycle.clone()).with_delayer(delayer.clone()),
        );
        Harness {
            transport,
            delayer,
            lifecycle,
            session,
        }
    }

    fn script_handshake(transport: &ScriptedRequestTransport) {
        transport.push_status(200, PRECONNECT_REPLY);
        transport.push_status(200, CONNECT_REPLY);
    }

    #[tokio::test]
    async fn test_handshake() {
        let h = harness(true);
        let mut events = h.lifecycle.subscribe();
        script_handshake(&h.transport);

        assert!(h.session.start().await.is_none());

        let info = h.session.current().unwrap();
        assert_eq!(info.run_id, "run-42");
        assert_eq!(info.context.host, "collector-002.local");
        assert_eq!(
            info.harvest_limits.get(&TelemetryKind::Span),
            Some(&HarvestLimits::new(166, Duration::from_secs(5)))
        );
        assert_eq!(
            info.harvest_limits.get(&TelemetryKind::Transaction),
            Some(&HarvestLimits::new(833, Duration::from_secs(5)))
        );
        assert!(!info.harvest_limits.contains_key(&TelemetryKind::Custom));
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Connected {
                run_id: "run-42".to_string()
            }
        );

        let requests = h.transport.requests();
        assert!(requests[0].url.starts_with("https://collector.local:443/"));
        assert!(requests[1].url.starts_with("https://collector-002.local:443/"));
        assert_eq!(h.transport.methods(), vec!["preconnect", "connect"]);
    }

    #[tokio::test]
    async fn test_data_requests_carry_session_values() {
        let h = harness(true);
        script_handshake(&h.transport);
        h.session.start().await;

        h.session
            .send_data_request("metric_data", b"[]")
            .await
            .unwrap();

        let request = h.transport.requests().pop().unwrap();
        assert!(request.url.starts_with("https://collector-002.local:443/"));
        assert!(request.url.contains("method=metric_data"));
        assert!(request.url.ends_with("&run_id=run-42"));
        assert!(request
            .headers
            .contains(&("X-Request-Metadata".to_string(), "token".to_string())));
    }

    #[tokio::test]
    async fn test_numeric_run_id() {
        let h = harness(true);
        h.transport.push_status(200, PRECONNECT_REPLY);
        h.transport
            .push_status(200, r#"{"return_value":{"agent_run_id":1234}}"#);

        h.session.start().await;

        assert_eq!(h.session.run_id().as_deref(), Some("1234"));
        assert!(h.session.current().unwrap().harvest_limits.is_empty());
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let h = harness(true);
        let err = h
            .session
            .send_data_request("metric_data", b"[]")
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotConnected);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_retryable_errors_back_off() {
        let h = harness(true);
        h.transport.push_status(409, "restart");
        h.transport
            .push(Err(TransportError::Connect("refused".to_string())));
        h.transport
            .push(Err(TransportError::Connect("refused".to_string())));
        h.transport
            .push(Err(TransportError::Connect("refused".to_string())));
        script_handshake(&h.transport);

        assert!(h.session.connect().await);

        assert_eq!(h.delayer.secs(), vec![5, 10]);
        assert_eq!(h.session.run_id().as_deref(), Some("run-42"));
    }

    #[tokio::test]
    async fn test_session_backoff_is_capped() {
        let h = harness(true);
        for _ in 0..8 {
            h.transport.push_status(409, "restart");
        }
        script_handshake(&h.transport);

        assert!(h.session.connect().await);

        assert_eq!(
            h.delayer.secs(),
            vec![5, 10, 20, 40, 80, 160, 300, 300]
        );
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        let h = harness(true);
        for _ in 0..3 {
            h.transport.push_status(503, "");
        }
        script_handshake(&h.transport);

        assert!(h.session.connect().await);
        assert_eq!(h.delayer.secs(), vec![5]);
    }

    #[tokio::test]
    async fn test_license_rejection_shuts_down() {
        let h = harness(true);
        let mut events = h.lifecycle.subscribe();
        h.transport.push_status(401, "invalid license");

        assert!(!h.session.connect().await);

        assert!(!h.session.is_connected());
        assert!(h.delayer.delays().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Shutdown(SessionError::LicenseRejected.to_string())
        );

        // A torn down session never connects again.
        script_handshake(&h.transport);
        assert!(!h.session.connect().await);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_force_disconnect_shuts_down() {
        let h = harness(true);
        let mut events = h.lifecycle.subscribe();
        h.transport.push_status(200, PRECONNECT_REPLY);
        h.transport.push_status(410, "gone");

        assert!(!h.session.connect().await);

        assert!(matches!(
            events.recv().await.unwrap(),
            LifecycleEvent::Shutdown(reason) if reason.contains("gone")
        ));
    }

    #[tokio::test]
    async fn test_malformed_reply_shuts_down() {
        let h = harness(true);
        let mut events = h.lifecycle.subscribe();
        h.transport.push_status(200, r#"{"unexpected":true}"#);

        assert!(!h.session.connect().await);
        assert!(matches!(
            events.recv().await.unwrap(),
            LifecycleEvent::Shutdown(_)
        ));
    }

    #[tokio::test]
    async fn test_async_startup() {
        let h = harness(false);
        script_handshake(&h.transport);

        let handle = h.session.start().await.unwrap();

        assert!(handle.await.unwrap());
        assert!(h.session.is_connected());
    }

    #[tokio::test]
    async fn test_restart_request_reconnects() {
        let h = harness(true);
        let mut events = h.lifecycle.subscribe();
        script_handshake(&h.transport);
        h.session.start().await;
        let watcher = h.session.watch_restarts();
        assert!(matches!(
            events.recv().await.unwrap(),
            LifecycleEvent::Connected { .. }
        ));

        h.transport.push_status(200, PRECONNECT_REPLY);
        h.transport.push(Ok(HttpResponse::new(
            200,
            r#"{"return_value":{"agent_run_id":"run-43"}}"#,
        )));
        h.lifecycle.request_restart("401 on metric_data");

        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::RestartRequested("401 on metric_data".to_string())
        );
        assert_eq!(events.recv().await.unwrap(), LifecycleEvent::Disconnected);
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Connected {
                run_id: "run-43".to_string()
            }
        );

        h.session.shutdown().await;
        watcher.await.unwrap();
        assert_eq!(h.transport.methods().last().map(String::as_str), Some("shutdown"));
        assert!(!h.session.is_connected());
    }
}
