// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring and lifecycle of the export pipeline.
//!
//! [`ExportPipeline`] owns the collector session, every harvest aggregator and
//! every streaming aggregator. It applies the limits granted on connect and
//! runs the shutdown sequence:
//!
//! 1. stop the harvest timers
//! 2. when `send_on_exit` is set, run a final harvest and wait for the
//!    streaming queues to drain, bounded by `send_on_exit_timeout`
//! 3. shut the streaming consumers down
//! 4. discard whatever is left, reporting it as dropped
//! 5. end the collector session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{HarvestAggregator, SendOutcome, StreamingAggregator};
use crate::backoff::TokioDelayer;
use crate::collector::CollectorTransport;
use crate::config::{ExportConfig, HarvestLimits};
use crate::errors::ConfigError;
use crate::item::{TelemetryItem, TelemetryKind};
use crate::lifecycle::{LifecycleController, LifecycleEvent};
use crate::metrics::{HealthReporter, TracingHealthReporter};
use crate::sender::RetryingRequestSender;
use crate::session::SessionManager;
use crate::streaming::{Credentials, StreamingExportService};
use crate::transport::{ReqwestTransport, StreamingBatch, StreamingTransport};

/// Type-erased view of a [`HarvestAggregator`].
#[async_trait]
pub trait Harvester: Send + Sync {
    fn kind(&self) -> TelemetryKind;

    fn limits(&self) -> HarvestLimits;

    async fn start(&self);

    async fn stop(&self);

    async fn harvest(&self) -> Option<SendOutcome>;

    async fn update_config(&self, limits: HarvestLimits);

    fn discard(&self) -> usize;
}

#[async_trait]
impl<T: TelemetryItem> Harvester for Arc<HarvestAggregator<T>> {
    fn kind(&self) -> TelemetryKind {
        HarvestAggregator::kind(self)
    }

    fn limits(&self) -> HarvestLimits {
        HarvestAggregator::limits(self)
    }

    async fn start(&self) {
        HarvestAggregator::start(self).await;
    }

    async fn stop(&self) {
        HarvestAggregator::stop(self).await;
    }

    async fn harvest(&self) -> Option<SendOutcome> {
        HarvestAggregator::harvest(self).await
    }

    async fn update_config(&self, limits: HarvestLimits) {
        HarvestAggregator::update_config(self, limits).await;
    }

    fn discard(&self) -> usize {
        HarvestAggregator::discard(self)
    }
}

/// Type-erased view of a [`StreamingAggregator`].
#[async_trait]
pub trait StreamDrain: Send + Sync {
    /// Waits until the queue is drained.
    async fn wait(&self, timeout: Duration) -> bool;

    /// Stops the consumers and returns how many queued items were dropped.
    async fn shutdown(&self) -> usize;
}

#[async_trait]
impl<I: Send + 'static> StreamDrain for StreamingAggregator<I> {
    async fn wait(&self, timeout: Duration) -> bool {
        StreamingAggregator::wait(self, timeout).await
    }

    async fn shutdown(&self) -> usize {
        StreamingAggregator::shutdown(self).await
    }
}

/// A streaming service bound to the collector session.
#[async_trait]
trait SessionStream: Send + Sync {
    /// Called on every connect. Streams open with `credentials` from here on.
    async fn connected(&self, credentials: Credentials);
}

struct StreamBinding<T: StreamingTransport> {
    service: Arc<StreamingExportService<T>>,
    aggregator: Arc<StreamingAggregator<<T::Batch as StreamingBatch>::Item>>,
    run_token: tokio::sync::Mutex<Option<String>>,
}

#[async_trait]
impl<T: StreamingTransport> SessionStream for StreamBinding<T> {
    async fn connected(&self, credentials: Credentials) {
        let mut run_token = self.run_token.lock().await;
        if run_token.as_deref() == Some(credentials.run_token.as_str()) {
            return;
        }
        debug!("Run token changed, restarting streaming consumers");
        *run_token = Some(credentials.run_token.clone());
        self.service.update_credentials(credentials);
        self.aggregator.start_consuming().await;
    }
}

pub struct ExportPipeline {
    config: ExportConfig,
    lifecycle: LifecycleController,
    reporter: Arc<dyn HealthReporter>,
    session: Arc<SessionManager>,
    harvesters: Vec<Arc<dyn Harvester>>,
    streams: Vec<Arc<dyn StreamDrain>>,
    session_streams: Vec<Arc<dyn SessionStream>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ExportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportPipeline")
            .field("harvesters", &self.harvesters.len())
            .field("streams", &self.streams.len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl ExportPipeline {
    pub fn new(
        config: ExportConfig,
        session: Arc<SessionManager>,
        lifecycle: LifecycleController,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            config,
            lifecycle,
            reporter,
            session,
            harvesters: Vec::new(),
            streams: Vec::new(),
            session_streams: Vec::new(),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Builds a pipeline talking to the configured collector over `reqwest`.
    pub fn from_config(config: ExportConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let reporter: Arc<dyn HealthReporter> = Arc::new(TracingHealthReporter);
        let lifecycle = LifecycleController::new();
        let transport = Arc::new(ReqwestTransport::from_settings(
            config.collector.proxy.as_ref(),
            config.collector.request_timeout(),
        ));
        let sender =
            RetryingRequestSender::new(transport, reporter.clone(), config.collector.clone());
        let session = Arc::new(SessionManager::new(Arc::new(sender), lifecycle.clone()));

        Ok(Self::new(config, session, lifecycle, reporter))
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Creates an aggregator for `kind` that delivers through the collector
    /// session, using the configured limits.
    pub fn harvest_aggregator<T>(&mut self, kind: TelemetryKind) -> Arc<HarvestAggregator<T>>
    where
        T: TelemetryItem + Serialize,
    {
        let sink = Arc::new(CollectorTransport::new(
            self.session.clone(),
            self.lifecycle.clone(),
        ));
        let aggregator = Arc::new(HarvestAggregator::new(
            kind,
            self.config.harvest.limits(kind),
            sink,
            self.reporter.clone(),
        ));
        self.register_harvester(Arc::new(aggregator.clone()));
        aggregator
    }

    pub fn register_harvester(&mut self, harvester: Arc<dyn Harvester>) {
        self.harvesters.push(harvester);
    }

    /// Creates the streaming service over `transport` and the aggregator
    /// feeding it, sized from the streaming config.
    ///
    /// Items are queued right away. Consumers start once the session is
    /// connected and restart whenever the run token changes.
    pub async fn streaming_aggregator<T>(
        &mut self,
        transport: Arc<T>,
    ) -> Arc<StreamingAggregator<<T::Batch as StreamingBatch>::Item>>
    where
        T: StreamingTransport,
    {
        let service = Arc::new(StreamingExportService::new(
            self.config.streaming.clone(),
            self.credentials(self.session.run_id().unwrap_or_default()),
            transport,
            self.reporter.clone(),
            Arc::new(TokioDelayer),
        ));
        let aggregator = Arc::new(StreamingAggregator::new(
            TelemetryKind::Span,
            service.clone(),
            self.reporter.clone(),
        ));
        aggregator
            .apply_config(
                self.config.streaming.queue_capacity,
                self.config.streaming.partition_count,
            )
            .await;

        let binding = Arc::new(StreamBinding {
            service,
            aggregator: aggregator.clone(),
            run_token: tokio::sync::Mutex::new(None),
        });
        if let Some(run_id) = self.session.run_id() {
            binding.connected(self.credentials(run_id)).await;
        }
        self.session_streams.push(binding);
        self.register_stream(aggregator.clone());
        aggregator
    }

    fn credentials(&self, run_token: String) -> Credentials {
        Credentials {
            license_key: self.config.collector.license_key.clone(),
            run_token,
        }
    }

    pub fn register_stream(&mut self, stream: Arc<dyn StreamDrain>) {
        self.streams.push(stream);
    }

    /// Starts the session, the harvest timers and the lifecycle watchers.
    pub async fn start(self: &Arc<Self>) {
        // Subscribe before connecting so the first Connected event is seen.
        self.watch_lifecycle();
        self.session.watch_restarts();

        if self.session.start().await.is_some() {
            debug!("Collector connect scheduled");
        }
        for harvester in &self.harvesters {
            harvester.start().await;
        }
        info!(
            harvesters = self.harvesters.len(),
            streams = self.streams.len(),
            "Export pipeline started"
        );
    }

    fn watch_lifecycle(self: &Arc<Self>) {
        let mut events = self.lifecycle.subscribe();
        let pipeline = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(LifecycleEvent::Connected { run_id }) => {
                        if let Some(pipeline) = pipeline.upgrade() {
                            pipeline.apply_session(&run_id).await;
                        }
                    }
                    Ok(LifecycleEvent::Shutdown(reason)) => {
                        info!(%reason, "Shutdown requested");
                        if let Some(pipeline) = pipeline.upgrade() {
                            pipeline.shutdown().await;
                        }
                        return;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Pipeline lifecycle watcher lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Applies the limits granted by the collector and binds the streaming
    /// services to the run token. Types disabled locally stay disabled.
    async fn apply_session(&self, run_id: &str) {
        for stream in &self.session_streams {
            stream.connected(self.credentials(run_id.to_string())).await;
        }

        let Some(session) = self.session.current() else {
            return;
        };
        for harvester in &self.harvesters {
            let Some(granted) = session.harvest_limits.get(&harvester.kind()) else {
                continue;
            };
            if !harvester.limits().enabled {
                continue;
            }
            debug!(
                kind = %harvester.kind(),
                capacity = granted.capacity,
                interval_ms = granted.interval_ms,
                "Applying collector harvest limits"
            );
            harvester.update_config(*granted).await;
        }
    }

    /// Runs the shutdown sequence once. Returns how many items were dropped.
    pub async fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        info!("Shutting down the export pipeline");
        self.cancel.cancel();

        for harvester in &self.harvesters {
            harvester.stop().await;
        }

        if self.config.send_on_exit {
            let timeout = self.config.send_on_exit_timeout();
            if tokio::time::timeout(timeout, self.flush(timeout))
                .await
                .is_err()
            {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Flush on exit did not complete in time"
                );
            }
        }

        let mut dropped = 0;
        for stream in &self.streams {
            dropped += stream.shutdown().await;
        }
        for harvester in &self.harvesters {
            dropped += harvester.discard();
        }

        self.session.shutdown().await;
        info!(dropped, "Export pipeline stopped");
        dropped
    }

    async fn flush(&self, timeout: Duration) {
        join_all(self.harvesters.iter().map(|harvester| harvester.harvest())).await;
        for stream in &self.streams {
            if !stream.wait(timeout).await {
                debug!("Streaming queue not drained before exit");
            }
        }
    }
}
