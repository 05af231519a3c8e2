//! Routing of worker events to pending calls.
//!
//! A single task owns the pending table. Every id registered here is
//! removed exactly once: on its terminal frame, on timeout, on
//! cancellation, or when the rendering context goes away.
//!
//! The router never waits on a consumer. Each streaming call gets its own
//! forwarder task that owns the call's assembler, so a stalled reader only
//! holds up its own call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flight_core::{CallId, FlightError, RequestKind, WorkerEvent};
use flight_observability::ChannelMetrics;
use flight_streaming::FlightStreamAssembler;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// Where a call's bytes go.
#[derive(Debug)]
pub(crate) enum CallSink {
    /// Streaming call: chunks are forwarded as they arrive.
    Stream(FlightStreamAssembler),
    /// Request/response call: chunks are collected until the end.
    Collect {
        buffer: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, FlightError>>,
    },
}

impl CallSink {
    fn finish(self, outcome: Result<(), FlightError>) {
        match (self, outcome) {
            (Self::Stream(assembler), Ok(())) => assembler.end(),
            (Self::Stream(assembler), Err(err)) => assembler.destroy(err),
            (Self::Collect { buffer, reply }, outcome) => {
                let _ = reply.send(outcome.map(|()| buffer));
            }
        }
    }
}

/// Messages from channel handles and watchdogs to the router.
#[derive(Debug)]
pub(crate) enum RouterCommand {
    Register {
        id: CallId,
        kind: RequestKind,
        sink: CallSink,
        done: CancellationToken,
        interrupt: CancellationToken,
        progress: Arc<Notify>,
    },
    Fail {
        id: CallId,
        error: FlightError,
    },
    Pending(oneshot::Sender<Vec<CallId>>),
}

/// Work handed to a streaming call's forwarder.
#[derive(Debug)]
enum Forward {
    Chunk {
        bytes: Vec<u8>,
        offset: usize,
        length: usize,
    },
    Finish(Result<(), FlightError>),
}

/// Router-side end of a pending call.
#[derive(Debug)]
enum Delivery {
    Forward(mpsc::UnboundedSender<Forward>),
    Collect {
        buffer: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, FlightError>>,
    },
}

impl Delivery {
    fn finish(self, outcome: Result<(), FlightError>) {
        match self {
            // A gone forwarder means the consumer is gone too.
            Self::Forward(queue) => {
                let _ = queue.send(Forward::Finish(outcome));
            }
            Self::Collect { buffer, reply } => {
                let _ = reply.send(outcome.map(|()| buffer));
            }
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    kind: RequestKind,
    delivery: Delivery,
    /// Stops the call's watchdog.
    done: CancellationToken,
    /// Fired by the watchdog to abandon a blocked write.
    interrupt: CancellationToken,
    /// Tells the watchdog a frame arrived.
    progress: Arc<Notify>,
}

pub(crate) struct Router {
    pending: HashMap<CallId, PendingCall>,
    next_id: Arc<AtomicU64>,
    reload: broadcast::Sender<()>,
    metrics: Arc<ChannelMetrics>,
    closed: bool,
}

impl Router {
    pub(crate) fn new(
        next_id: Arc<AtomicU64>,
        reload: broadcast::Sender<()>,
        metrics: Arc<ChannelMetrics>,
    ) -> Self {
        Self {
            pending: HashMap::new(),
            next_id,
            reload,
            metrics,
            closed: false,
        }
    }

    /// Route until every channel handle is gone.
    ///
    /// Commands are drained before events so a call is always registered
    /// before any frame for it can be routed.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RouterCommand>,
        mut events: mpsc::Receiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = events.recv(), if !self.closed => match event {
                    Some(event) => self.route(event),
                    None => self.close(),
                },
            }
        }

        if !self.pending.is_empty() {
            self.close();
        }
        tracing::debug!("router stopped");
    }

    fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Register {
                id,
                kind,
                sink,
                done,
                interrupt,
                progress,
            } => {
                if self.closed {
                    done.cancel();
                    self.metrics.record_outcome(&Err(FlightError::ChannelClosed));
                    sink.finish(Err(FlightError::ChannelClosed));
                    return;
                }
                tracing::debug!(call_id = id, kind = %kind, "call registered");
                let delivery = match sink {
                    CallSink::Stream(assembler) => {
                        let (queue, work) = mpsc::unbounded_channel();
                        tokio::spawn(forward(assembler, work, interrupt.clone(), Arc::clone(&self.metrics)));
                        Delivery::Forward(queue)
                    }
                    CallSink::Collect { buffer, reply } => Delivery::Collect { buffer, reply },
                };
                self.pending.insert(
                    id,
                    PendingCall {
                        kind,
                        delivery,
                        done,
                        interrupt,
                        progress,
                    },
                );
            }
            RouterCommand::Fail { id, error } => {
                if self.pending.contains_key(&id) {
                    match &error {
                        FlightError::Timeout { after, .. } => {
                            tracing::warn!(call_id = id, after = ?after, "call timed out")
                        }
                        FlightError::Cancelled(_) => tracing::debug!(call_id = id, "call cancelled"),
                        other => tracing::debug!(call_id = id, error = %other, "call failed"),
                    }
                    self.retire(id, Err(error));
                }
            }
            RouterCommand::Pending(reply) => {
                let mut ids: Vec<CallId> = self.pending.keys().copied().collect();
                ids.sort_unstable();
                let _ = reply.send(ids);
            }
        }
    }

    fn route(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::FullReload => {
                tracing::info!("full reload broadcast");
                let _ = self.reload.send(());
            }
            WorkerEvent::Chunk {
                id,
                bytes,
                offset,
                length,
            } => {
                let Some(call) = self.pending.get_mut(&id) else {
                    self.stray(id, "chunk");
                    return;
                };
                call.progress.notify_one();

                if slice(&bytes, offset, length).is_none() {
                    let err = FlightError::Protocol(format!(
                        "chunk for call {} claims {}+{} of a {}-byte buffer",
                        id,
                        offset,
                        length,
                        bytes.len()
                    ));
                    tracing::warn!(call_id = id, error = %err, "malformed chunk frame");
                    self.retire(id, Err(err));
                    return;
                }

                match &mut call.delivery {
                    Delivery::Forward(queue) => {
                        let _ = queue.send(Forward::Chunk {
                            bytes,
                            offset,
                            length,
                        });
                    }
                    Delivery::Collect { buffer, .. } => {
                        buffer.extend_from_slice(&bytes[offset..offset + length]);
                        self.metrics.record_bytes(length);
                    }
                }
            }
            WorkerEvent::End { id } => {
                if self.pending.contains_key(&id) {
                    self.retire(id, Ok(()));
                } else {
                    self.stray(id, "end");
                }
            }
            WorkerEvent::Error { id, error } => {
                if self.pending.contains_key(&id) {
                    tracing::debug!(call_id = id, error = %error, "call failed in rendering context");
                    self.retire(id, Err(FlightError::from_serialized(error)));
                } else {
                    self.stray(id, "error");
                }
            }
        }
    }

    /// Remove a call and deliver its outcome.
    fn retire(&mut self, id: CallId, outcome: Result<(), FlightError>) {
        let Some(call) = self.pending.remove(&id) else {
            return;
        };
        call.done.cancel();
        self.metrics.record_outcome(&outcome);
        tracing::debug!(call_id = id, kind = %call.kind, ok = outcome.is_ok(), "call finished");
        call.delivery.finish(outcome);
    }

    /// Fail every pending call: the rendering context is gone.
    fn close(&mut self) {
        self.closed = true;
        if !self.pending.is_empty() {
            tracing::warn!(pending = self.pending.len(), "rendering context went away with calls pending");
        }
        let ids: Vec<CallId> = self.pending.keys().copied().collect();
        for id in ids {
            self.retire(id, Err(FlightError::ChannelClosed));
        }
    }

    fn stray(&self, id: CallId, frame: &'static str) {
        if id < self.next_id.load(Ordering::Acquire) {
            tracing::debug!(call_id = id, frame, "frame for retired call dropped");
        } else {
            tracing::warn!(call_id = id, frame, "protocol error: frame for unknown call id");
        }
    }
}

/// Feed one streaming call's assembler in frame order.
///
/// Once `interrupt` fires the remaining chunks are dropped uncounted and only
/// the terminal outcome is delivered.
async fn forward(
    mut assembler: FlightStreamAssembler,
    mut work: mpsc::UnboundedReceiver<Forward>,
    interrupt: CancellationToken,
    metrics: Arc<ChannelMetrics>,
) {
    let id = assembler.id();
    while let Some(item) = work.recv().await {
        match item {
            Forward::Chunk {
                bytes,
                offset,
                length,
            } => {
                if interrupt.is_cancelled() {
                    continue;
                }
                let written = tokio::select! {
                    biased;
                    _ = interrupt.cancelled() => None,
                    result = assembler.write(&bytes, offset, length) => Some(result),
                };
                match written {
                    Some(Ok(())) => metrics.record_bytes(length),
                    Some(Err(err)) => tracing::warn!(call_id = id, error = %err, "chunk not delivered"),
                    None => tracing::debug!(call_id = id, "blocked write abandoned"),
                }
            }
            Forward::Finish(outcome) => {
                CallSink::Stream(assembler).finish(outcome);
                return;
            }
        }
    }
    tracing::debug!(call_id = id, "forwarder stopped without a terminal outcome");
}

fn slice(bytes: &[u8], offset: usize, length: usize) -> Option<&[u8]> {
    let end = offset.checked_add(length)?;
    bytes.get(offset..end)
}
