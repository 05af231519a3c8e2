//! Host-side facade over a rendering context.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use flight_core::{
    CallId, ChannelConfig, ClientEntriesSource, FlightError, RenderInput, WorkerEvent, WorkerRequest,
};
use flight_observability::{ChannelMetrics, MetricsSnapshot};
use flight_streaming::{flight_stream, FlightStream};
use futures::Stream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::RenderContext;
use crate::router::{CallSink, Router, RouterCommand};

/// Correlated request/stream channel to a rendering context.
///
/// Every call takes the next correlation id, is registered with the router
/// before its request is sent, and resolves exactly once. A call that goes
/// longer than the configured timeout without a frame is failed by its
/// watchdog; render calls can also be cancelled.
#[derive(Debug)]
pub struct RenderWorkerChannel {
    requests: mpsc::Sender<WorkerRequest>,
    commands: mpsc::UnboundedSender<RouterCommand>,
    next_id: Arc<AtomicU64>,
    reload: broadcast::Sender<()>,
    metrics: Arc<ChannelMetrics>,
    config: ChannelConfig,
    context: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RenderWorkerChannel {
    /// Run `context` on its own task and connect to it.
    pub fn spawn(context: RenderContext, config: ChannelConfig) -> Self {
        let buffer = config.request_buffer.max(1);
        let (requests_tx, requests_rx) = mpsc::channel(buffer);
        let (events_tx, events_rx) = mpsc::channel(buffer);

        let handle = tokio::spawn(context.run(requests_rx, events_tx));
        let channel = Self::connect(requests_tx, events_rx, config);
        if let Ok(mut slot) = channel.context.lock() {
            *slot = Some(handle);
        }
        channel
    }

    /// Connect to a rendering context reachable through a pair of queues.
    pub fn connect(
        requests: mpsc::Sender<WorkerRequest>,
        events: mpsc::Receiver<WorkerEvent>,
        config: ChannelConfig,
    ) -> Self {
        let next_id = Arc::new(AtomicU64::new(0));
        let (reload, _) = broadcast::channel(16);
        let metrics = Arc::new(ChannelMetrics::new());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let router = Router::new(Arc::clone(&next_id), reload.clone(), Arc::clone(&metrics));
        tokio::spawn(router.run(commands_rx, events));

        Self {
            requests,
            commands: commands_tx,
            next_id,
            reload,
            metrics,
            config,
            context: std::sync::Mutex::new(None),
        }
    }

    /// Configure which component references are client boundaries.
    pub async fn set_client_entries(&self, source: ClientEntriesSource) -> Result<(), FlightError> {
        self.call(|id| WorkerRequest::SetClientEntries { id, input: source })
            .await
            .map(drop)
    }

    /// Start a render and return its ordered output stream.
    pub async fn render(&self, input: RenderInput) -> Result<RenderCall, FlightError> {
        let id = self.allocate_id()?;
        let (assembler, stream) = flight_stream(id, self.config.stream_buffer);
        let cancel = CancellationToken::new();

        self.dispatch(
            WorkerRequest::Render { id, input },
            CallSink::Stream(assembler),
            Some(cancel.clone()),
        )
        .await?;

        Ok(RenderCall { id, stream, cancel })
    }

    /// Custom modules known to the rendering context.
    pub async fn get_custom_modules(&self) -> Result<BTreeMap<String, String>, FlightError> {
        let bytes = self.call(|id| WorkerRequest::GetCustomModules { id }).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| FlightError::Decode(format!("custom modules: {}", e)))
    }

    /// Run the rendering context's build step.
    pub async fn build(&self) -> Result<(), FlightError> {
        self.call(|id| WorkerRequest::Build { id }).await.map(drop)
    }

    /// Stop the rendering context. Later calls fail with `ChannelClosed`.
    pub async fn shutdown(&self) -> Result<(), FlightError> {
        let result = self.call(|id| WorkerRequest::Shutdown { id }).await.map(drop);

        let handle = self.context.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "rendering context task failed");
            }
        }
        tracing::info!("render channel shut down");
        result
    }

    /// Subscribe to `full-reload` broadcasts.
    pub fn subscribe_reload(&self) -> broadcast::Receiver<()> {
        self.reload.subscribe()
    }

    /// Ids of calls still waiting for a terminal frame.
    pub async fn pending_ids(&self) -> Vec<CallId> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RouterCommand::Pending(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Current call counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    #[cfg(test)]
    fn with_next_id(self, id: CallId) -> Self {
        self.next_id.store(id, Ordering::Release);
        self
    }

    /// Take the next correlation id. Ids never wrap.
    fn allocate_id(&self) -> Result<CallId, FlightError> {
        self.next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .map_err(|_| FlightError::Protocol("correlation ids exhausted".to_string()))
    }

    async fn call<F>(&self, request: F) -> Result<Vec<u8>, FlightError>
    where
        F: FnOnce(CallId) -> WorkerRequest,
    {
        let id = self.allocate_id()?;
        let (reply, response) = oneshot::channel();
        let sink = CallSink::Collect {
            buffer: Vec::new(),
            reply,
        };

        self.dispatch(request(id), sink, None).await?;
        response.await.map_err(|_| FlightError::ChannelClosed)?
    }

    async fn dispatch(
        &self,
        request: WorkerRequest,
        sink: CallSink,
        cancel: Option<CancellationToken>,
    ) -> Result<(), FlightError> {
        let id = request.id();
        let kind = request.kind();
        let done = CancellationToken::new();
        let interrupt = CancellationToken::new();
        let progress = Arc::new(Notify::new());

        self.commands
            .send(RouterCommand::Register {
                id,
                kind,
                sink,
                done: done.clone(),
                interrupt: interrupt.clone(),
                progress: Arc::clone(&progress),
            })
            .map_err(|_| FlightError::ChannelClosed)?;
        self.metrics.record_started();
        self.spawn_watchdog(id, Watch { done, interrupt, progress }, cancel);

        if self.requests.send(request).await.is_err() {
            tracing::debug!(call_id = id, kind = %kind, "rendering context is gone");
            let _ = self.commands.send(RouterCommand::Fail {
                id,
                error: FlightError::ChannelClosed,
            });
        }
        Ok(())
    }

    /// Fail the call on cancellation, or once it has gone a whole timeout
    /// without a frame, unless it finishes first.
    fn spawn_watchdog(&self, id: CallId, watch: Watch, cancel: Option<CancellationToken>) {
        let timeout = self.config.call_timeout();
        if timeout.is_none() && cancel.is_none() {
            return;
        }

        let commands = self.commands.clone();
        let cancel = cancel.unwrap_or_default();
        tokio::spawn(async move {
            let error = loop {
                tokio::select! {
                    biased;
                    _ = watch.done.cancelled() => return,
                    _ = cancel.cancelled() => break FlightError::Cancelled(id),
                    _ = watch.progress.notified() => continue,
                    _ = idle(timeout) => break FlightError::Timeout {
                        id,
                        after: timeout.unwrap_or_default(),
                    },
                }
            };

            watch.interrupt.cancel();
            let _ = commands.send(RouterCommand::Fail { id, error });
        });
    }
}

/// Signals shared between a call's watchdog and the router.
struct Watch {
    /// Cancelled by the router once the call is retired.
    done: CancellationToken,
    /// Cancelled by the watchdog to abandon a blocked write.
    interrupt: CancellationToken,
    /// Notified by the router on every frame for the call.
    progress: Arc<Notify>,
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending::<()>().await,
    }
}

/// A render in progress.
///
/// Yields the payload bytes in order, then ends or yields one error.
/// Dropping it stops delivery but does not cancel the render.
#[derive(Debug)]
pub struct RenderCall {
    id: CallId,
    stream: FlightStream,
    cancel: CancellationToken,
}

impl RenderCall {
    /// Correlation id of this call.
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Cancel the call. The stream ends with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling this call.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Collect the whole payload.
    pub async fn collect_bytes(self) -> Result<Vec<u8>, FlightError> {
        self.stream.collect_bytes().await
    }

    pub fn into_stream(self) -> FlightStream {
        self.stream
    }
}

impl Stream for RenderCall {
    type Item = Result<Vec<u8>, FlightError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().stream).poll_next(cx)
    }
}
