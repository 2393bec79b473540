// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::metadata::{build_metadata, Credentials};
use super::StreamConsumer;
use crate::backoff::{Delayer, StreamingBackoff, POST_SEND_ERROR_DELAY};
use crate::config::StreamingConfig;
use crate::errors::StreamError;
use crate::item::TelemetryKind;
use crate::metrics::{HealthReporter, Supportability};
use crate::queue::PartitionedQueue;
use crate::transport::{Endpoint, Metadata, StatusCode, StreamingBatch, StreamingTransport};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

type ItemOf<T> = <<T as StreamingTransport>::Batch as StreamingBatch>::Item;
type Queue<T> = PartitionedQueue<ItemOf<T>>;

/// Connection state of a [`StreamingExportService`].
///
/// `Disconnected → Connecting → StreamEstablished → Streaming ⇄ Backoff`,
/// with `Shutdown` terminal once the service is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    StreamEstablished,
    Streaming,
    Backoff,
    Shutdown,
}

/// Reaction to a failed transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Feature unsupported by the collector; never try again.
    Disable,
    /// Status OK used as a "reconnect now" signal.
    RetryNow,
    /// Expected transient condition; reconnect the channel without delay.
    Restart,
    /// Anything else.
    Backoff,
}

fn classify(err: &StreamError) -> Disposition {
    match err.status_code() {
        Some(StatusCode::Unimplemented) => Disposition::Disable,
        Some(StatusCode::Ok) => Disposition::RetryNow,
        Some(StatusCode::Unavailable | StatusCode::FailedPrecondition) => Disposition::Restart,
        _ => Disposition::Backoff,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    Restart,
    Disable,
}

enum Connect {
    Established,
    Cancelled,
    Disable,
}

enum SendResult {
    RetryNow,
    Failed,
    Exit(Exit),
}

/// Tokens handed to each consumer: `service` ends the run, `restart` ends the
/// current connection cycle.
#[derive(Clone)]
struct Control {
    service: CancellationToken,
    restart: CancellationToken,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner<T: StreamingTransport> {
    transport: Arc<T>,
    config: StreamingConfig,
    endpoint: Option<Endpoint>,
    credentials: RwLock<Credentials>,
    reporter: Arc<dyn HealthReporter>,
    delayer: Arc<dyn Delayer>,
    state: watch::Sender<ConnectionState>,
    disabled: AtomicBool,
    held: AtomicUsize,
    connect_attempts: AtomicU64,
    queue: RwLock<Option<Arc<Queue<T>>>>,
}

/// Streams queued items to the collector over one stream per consumer.
pub struct StreamingExportService<T: StreamingTransport> {
    inner: Arc<Inner<T>>,
    running: Mutex<Option<Running>>,
}

impl<T: StreamingTransport> StreamingExportService<T> {
    /// Validates `config` up front. An invalid configuration leaves the
    /// service disabled in the `Shutdown` state without any connect attempt.
    pub fn new(
        config: StreamingConfig,
        credentials: Credentials,
        transport: Arc<T>,
        reporter: Arc<dyn HealthReporter>,
        delayer: Arc<dyn Delayer>,
    ) -> Self {
        let endpoint = match config.validate() {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!("Streaming export disabled: {}", e);
                None
            }
        };
        let initial = if endpoint.is_some() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Shutdown
        };
        let (state, _) = watch::channel(initial);

        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                endpoint,
                credentials: RwLock::new(credentials),
                reporter,
                delayer,
                state,
                disabled: AtomicBool::new(false),
                held: AtomicUsize::new(0),
                connect_attempts: AtomicU64::new(0),
                queue: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.endpoint.is_some() && !self.inner.disabled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Channel connect attempts made since construction.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    /// Credentials used from the next connection cycle on.
    pub fn update_credentials(&self, credentials: Credentials) {
        #[allow(clippy::expect_used)]
        let mut current = self.inner.credentials.write().expect("lock poisoned");
        *current = credentials;
    }

    pub async fn start(&self, queue: Arc<Queue<T>>) {
        if !self.is_enabled() {
            debug!("Streaming export is disabled, not consuming");
            return;
        }

        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.token.cancel();
            let _ = previous.handle.await;
        }

        self.inner.set_queue(Some(Arc::clone(&queue)));
        self.inner
            .reporter
            .report(Supportability::StreamCompression(self.inner.config.compression));

        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(inner.run(queue, token.clone()));
        *running = Some(Running { token, handle });
    }

    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.token.cancel();
            if let Err(e) = previous.handle.await {
                error!("Streaming control loop ended abnormally: {}", e);
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub async fn shutdown(&self) {
        self.stop().await;
        if !self.inner.disabled.swap(true, Ordering::AcqRel) {
            info!("Shutting down streaming export");
            self.inner.state.send_replace(ConnectionState::Shutdown);
            self.inner.transport.shutdown().await;
        }
    }

    pub async fn wait(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let queued = self.inner.queued();
                let held = self.inner.held.load(Ordering::Acquire);
                if queued == 0 && held == 0 {
                    return;
                }
                debug!(queued, held, "Waiting for streaming export to drain");
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

#[async_trait]
impl<T: StreamingTransport> StreamConsumer<ItemOf<T>> for StreamingExportService<T> {
    fn is_enabled(&self) -> bool {
        StreamingExportService::is_enabled(self)
    }

    async fn start(&self, queue: Arc<Queue<T>>) {
        StreamingExportService::start(self, queue).await;
    }

    async fn stop(&self) {
        StreamingExportService::stop(self).await;
    }

    async fn shutdown(&self) {
        StreamingExportService::shutdown(self).await;
    }

    async fn wait(&self, timeout: Duration) -> bool {
        StreamingExportService::wait(self, timeout).await
    }
}

impl<T: StreamingTransport> Inner<T> {
    fn set_state(&self, state: ConnectionState) {
        if self.disabled.load(Ordering::Acquire) {
            return;
        }
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "Streaming connection state changed");
        }
    }

    fn set_queue(&self, queue: Option<Arc<Queue<T>>>) {
        #[allow(clippy::expect_used)]
        let mut current = self.queue.write().expect("lock poisoned");
        *current = queue;
    }

    fn queued(&self) -> usize {
        #[allow(clippy::expect_used)]
        let queue = self.queue.read().expect("lock poisoned");
        queue.as_ref().map_or(0, |queue| queue.len())
    }

    fn metadata(&self) -> Metadata {
        #[allow(clippy::expect_used)]
        let credentials = self.credentials.read().expect("lock poisoned");
        build_metadata(&self.config, &credentials)
    }

    fn report_error(&self, err: &StreamError) {
        match err {
            StreamError::Status { status, .. } => {
                self.reporter.report(Supportability::StreamStatus(*status));
            }
            StreamError::Timeout(_) => self.reporter.report(Supportability::StreamTimeout),
            StreamError::NotAvailable | StreamError::Cancelled => {}
        }
    }

    /// Disables the service for good. Only the first call has an effect.
    async fn disable(&self) {
        if self.disabled.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("The collector does not support streaming export, disabling it");
        self.state.send_replace(ConnectionState::Shutdown);
        self.transport.shutdown().await;
    }

    async fn run(self: Arc<Self>, queue: Arc<Queue<T>>, service: CancellationToken) {
        while !service.is_cancelled() && !self.disabled.load(Ordering::Acquire) {
            let restart = service.child_token();
            match self.connect_channel(&restart).await {
                Connect::Established => {}
                Connect::Cancelled => break,
                Connect::Disable => {
                    self.disable().await;
                    break;
                }
            }

            let consumers: Vec<_> = (0..self.config.consumers)
                .map(|index| {
                    let inner = Arc::clone(&self);
                    let queue = Arc::clone(&queue);
                    let control = Control {
                        service: service.clone(),
                        restart: restart.clone(),
                    };
                    tokio::spawn(inner.consume(queue, index, control))
                })
                .collect();

            let mut disable = false;
            for result in futures::future::join_all(consumers).await {
                match result {
                    Ok(Exit::Disable) => disable = true,
                    Ok(_) => {}
                    Err(e) => error!("Streaming consumer ended abnormally: {}", e),
                }
            }
            if disable {
                self.disable().await;
                break;
            }
            if !service.is_cancelled() {
                debug!("Restarting streaming export");
            }
        }
    }

    async fn connect_channel(&self, cancel: &CancellationToken) -> Connect {
        let Some(endpoint) = &self.endpoint else {
            return Connect::Disable;
        };
        let mut backoff = StreamingBackoff::new();

        loop {
            self.set_state(ConnectionState::Connecting);
            self.connect_attempts.fetch_add(1, Ordering::Relaxed);
            let metadata = self.metadata();
            debug!(endpoint = %endpoint.uri(), ?metadata, "Opening streaming channel");

            let result = tokio::select! {
                () = cancel.cancelled() => return Connect::Cancelled,
                result = self.transport.create_channel(
                    endpoint,
                    &metadata,
                    self.config.connect_timeout(),
                ) => result,
            };

            let delay = match result {
                Ok(true) => {
                    info!(endpoint = %endpoint.uri(), "Streaming channel established");
                    self.set_state(ConnectionState::StreamEstablished);
                    return Connect::Established;
                }
                Ok(false) => {
                    warn!(endpoint = %endpoint.uri(), "Unable to open streaming channel");
                    backoff.register_failure()
                }
                Err(err) => {
                    self.report_error(&err);
                    match classify(&err) {
                        Disposition::Disable => return Connect::Disable,
                        Disposition::RetryNow | Disposition::Restart => {
                            debug!(error = %err, "Reconnecting streaming channel immediately");
                            Duration::ZERO
                        }
                        Disposition::Backoff => {
                            warn!(error = %err, "Failed to open streaming channel");
                            backoff.register_failure()
                        }
                    }
                }
            };

            if !delay.is_zero() {
                self.set_state(ConnectionState::Backoff);
            }
            if !self.delayer.delay(delay, cancel).await {
                return Connect::Cancelled;
            }
        }
    }

    async fn consume(self: Arc<Self>, queue: Arc<Queue<T>>, index: usize, control: Control) -> Exit {
        let mut backoff = StreamingBackoff::new();
        let mut pending = Vec::new();

        let exit = loop {
            let (mut writer, reader) = match self.open_stream(&mut backoff, &control.restart).await {
                Ok(stream) => stream,
                Err(exit) => break exit,
            };
            let stream = control.restart.child_token();
            spawn_response_reader(Arc::clone(&self), reader, stream.clone(), control.restart.clone());

            let result = self
                .stream_batches(&queue, index, &mut writer, &mut pending, &mut backoff, &stream)
                .await;
            stream.cancel();
            self.transport.close_stream(writer).await;

            match result {
                SendResult::RetryNow => {
                    if !self.delayer.delay(Duration::ZERO, &control.restart).await {
                        break Exit::Cancelled;
                    }
                }
                SendResult::Failed => {
                    self.set_state(ConnectionState::Backoff);
                    if !self.delayer.delay(POST_SEND_ERROR_DELAY, &control.restart).await {
                        break Exit::Cancelled;
                    }
                }
                SendResult::Exit(exit) => break exit,
            }
        };

        self.requeue(&queue, index, &mut pending);
        match exit {
            Exit::Restart => {
                self.delayer.delay(Duration::ZERO, &control.service).await;
                control.restart.cancel();
            }
            Exit::Disable => control.restart.cancel(),
            Exit::Cancelled => {}
        }
        exit
    }

    async fn open_stream(
        &self,
        backoff: &mut StreamingBackoff,
        cancel: &CancellationToken,
    ) -> Result<(T::Writer, T::Reader), Exit> {
        loop {
            let metadata = self.metadata();
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(Exit::Cancelled),
                result = self.transport.create_stream(&metadata, self.config.connect_timeout()) => result,
            };

            let delay = match result {
                Ok(stream) => {
                    debug!("Streaming request stream opened");
                    return Ok(stream);
                }
                Err(err) => {
                    self.report_error(&err);
                    match classify(&err) {
                        Disposition::Disable => return Err(Exit::Disable),
                        Disposition::Restart => {
                            debug!(error = %err, "Stream creation refused, reconnecting");
                            return Err(Exit::Restart);
                        }
                        Disposition::RetryNow => Duration::ZERO,
                        Disposition::Backoff => {
                            warn!(error = %err, "Failed to open streaming request stream");
                            backoff.register_failure()
                        }
                    }
                }
            };

            if !delay.is_zero() {
                self.set_state(ConnectionState::Backoff);
            }
            if !self.delayer.delay(delay, cancel).await {
                return Err(Exit::Cancelled);
            }
        }
    }

    async fn stream_batches(
        &self,
        queue: &Queue<T>,
        index: usize,
        writer: &mut T::Writer,
        pending: &mut Vec<ItemOf<T>>,
        backoff: &mut StreamingBackoff,
        cancel: &CancellationToken,
    ) -> SendResult {
        loop {
            if pending.is_empty() {
                let batch = queue.take_batch(index, self.config.batch_size, cancel).await;
                if batch.is_empty() {
                    return SendResult::Exit(Exit::Cancelled);
                }
                self.held.fetch_add(batch.len(), Ordering::AcqRel);
                *pending = batch;
            }

            let batch = T::Batch::from_items(pending);
            let result = tokio::select! {
                () = cancel.cancelled() => return SendResult::Exit(Exit::Cancelled),
                result = self.transport.try_send(writer, &batch, self.config.send_timeout()) => result,
            };

            match result {
                Ok(true) => {
                    let count = pending.len();
                    pending.clear();
                    self.held.fetch_sub(count, Ordering::AcqRel);
                    backoff.reset();
                    self.set_state(ConnectionState::Streaming);
                    self.reporter.report(Supportability::Sent {
                        kind: TelemetryKind::Span,
                        count: count as u64,
                    });
                    self.reporter
                        .report(Supportability::StreamBatchSize(count as u64));
                }
                Ok(false) => {
                    warn!(count = pending.len(), "Streaming batch was not accepted in time");
                    self.reporter.report(Supportability::StreamTimeout);
                    return SendResult::Failed;
                }
                Err(err) => {
                    self.report_error(&err);
                    return match classify(&err) {
                        Disposition::Disable => SendResult::Exit(Exit::Disable),
                        Disposition::RetryNow => SendResult::RetryNow,
                        Disposition::Restart => SendResult::Exit(Exit::Restart),
                        Disposition::Backoff => {
                            warn!(error = %err, count = pending.len(), "Failed to send streaming batch");
                            SendResult::Failed
                        }
                    };
                }
            }
        }
    }

    fn requeue(&self, queue: &Queue<T>, index: usize, pending: &mut Vec<ItemOf<T>>) {
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        let dropped = queue.requeue_front(index, std::mem::take(pending));
        self.held.fetch_sub(count, Ordering::AcqRel);
        if dropped > 0 {
            warn!(dropped, "Queue full, dropping unsent streaming items");
            self.reporter.report(Supportability::Dropped {
                kind: TelemetryKind::Span,
                count: dropped as u64,
            });
        }
    }
}

/// Reads acknowledgements until the stream ends. A refused stream restarts
/// the connection cycle.
fn spawn_response_reader<T: StreamingTransport>(
    inner: Arc<Inner<T>>,
    mut reader: T::Reader,
    stream: CancellationToken,
    restart: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let response = tokio::select! {
                () = stream.cancelled() => break,
                response = inner.transport.next_response(&mut reader) => response,
            };
            match response {
                Ok(Some(seen)) => inner.reporter.report(Supportability::StreamReceived(seen)),
                Ok(None) => {
                    debug!("Response stream closed by the collector");
                    break;
                }
                Err(err) => {
                    inner.reporter.report(Supportability::StreamResponseError);
                    inner.report_error(&err);
                    if matches!(
                        err.status_code(),
                        Some(StatusCode::FailedPrecondition | StatusCode::Unavailable)
                    ) {
                        debug!(error = %err, "Response stream refused, reconnecting");
                        restart.cancel();
                    } else {
                        warn!(error = %err, "Response stream failed");
                    }
                    break;
                }
            }
        }
    });
}
