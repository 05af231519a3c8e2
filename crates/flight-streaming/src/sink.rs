//! Driving an assembled payload into an outgoing body sink.

use std::fmt::Display;

use flight_core::FlightError;
use futures::{Sink, SinkExt, Stream, StreamExt};

use crate::error_trailer;
use crate::flush::{FlushController, FlushPolicy};

/// State of the payload sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    /// Nothing written to the inner sink yet.
    Initial,
    /// At least one write reached the inner sink.
    Streaming,
    /// Payload finished, successfully or with a trailer.
    Completed,
}

/// Summary of a finished pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeSummary {
    /// Bytes written to the inner sink, trailer included.
    pub bytes_sent: u64,
    /// Number of writes to the inner sink.
    pub flushes: usize,
    /// Failure reported through an error trailer, if any.
    pub trailer: Option<FlightError>,
}

/// Sink adapter that writes a flight payload to any `Sink<Vec<u8>>`.
///
/// Failures before the first write are returned to the caller, who can still
/// pick an error status. Failures after that are appended as an error row.
pub struct PayloadSink<S, E>
where
    S: Sink<Vec<u8>, Error = E> + Unpin,
    E: Display,
{
    inner: S,
    state: SinkState,
    flush: FlushController,
    bytes_sent: u64,
}

impl<S, E> PayloadSink<S, E>
where
    S: Sink<Vec<u8>, Error = E> + Unpin,
    E: Display,
{
    /// Create a new payload sink.
    pub fn new(sink: S, policy: FlushPolicy) -> Self {
        Self {
            inner: sink,
            state: SinkState::Initial,
            flush: FlushController::new(policy),
            bytes_sent: 0,
        }
    }

    /// Queue a chunk, writing it out as the flush policy allows.
    pub async fn send_chunk(&mut self, chunk: Vec<u8>) -> Result<(), FlightError> {
        if self.state == SinkState::Completed {
            return Err(FlightError::Protocol("payload sink already completed".to_string()));
        }
        if let Some(bytes) = self.flush.push(chunk) {
            self.write(bytes).await?;
        }
        Ok(())
    }

    /// Flush what is pending and mark the payload complete.
    pub async fn complete(&mut self) -> Result<(), FlightError> {
        if let Some(bytes) = self.flush.take() {
            self.write(bytes).await?;
        }
        self.inner
            .flush()
            .await
            .map_err(|e| FlightError::Transport(e.to_string()))?;
        self.state = SinkState::Completed;
        Ok(())
    }

    /// Flush what is pending, then append an error row.
    pub async fn fail(&mut self, err: &FlightError) -> Result<(), FlightError> {
        if let Some(bytes) = self.flush.take() {
            self.write(bytes).await?;
        }
        self.write(error_trailer(err)).await?;
        self.state = SinkState::Completed;
        Ok(())
    }

    /// Pipe a whole payload stream into the sink.
    pub async fn pipe<St>(mut self, mut stream: St) -> Result<PipeSummary, FlightError>
    where
        St: Stream<Item = Result<Vec<u8>, FlightError>> + Unpin,
    {
        let mut trailer = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => self.send_chunk(chunk).await?,
                Err(err) if self.state == SinkState::Initial => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, "payload failed after streaming started");
                    self.fail(&err).await?;
                    trailer = Some(err);
                    break;
                }
            }
        }

        if trailer.is_none() {
            self.complete().await?;
        }

        Ok(PipeSummary {
            bytes_sent: self.bytes_sent,
            flushes: self.flush.flushes(),
            trailer,
        })
    }

    async fn write(&mut self, bytes: Vec<u8>) -> Result<(), FlightError> {
        let len = bytes.len() as u64;
        self.inner
            .send(bytes)
            .await
            .map_err(|e| FlightError::Transport(e.to_string()))?;
        self.bytes_sent += len;
        self.state = SinkState::Streaming;
        Ok(())
    }

    /// Whether any byte reached the inner sink.
    pub fn has_started(&self) -> bool {
        self.state != SinkState::Initial
    }

    /// Bytes written so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Consume the sink and return the inner value.
    pub fn into_inner(self) -> S {
        self.inner
    }
}
