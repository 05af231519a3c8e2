//! Reassembly of chunk frames into one ordered output stream.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use flight_core::{CallId, FlightError};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

/// Create the two halves of a call's output stream.
///
/// At most `buffer` chunks are queued; past that, `write` waits for the
/// consumer. Terminal outcomes travel out of band so they never wait behind
/// a full queue.
pub fn flight_stream(id: CallId, buffer: usize) -> (FlightStreamAssembler, FlightStream) {
    let (data_tx, data_rx) = mpsc::channel(buffer.max(1));
    let (outcome_tx, outcome_rx) = oneshot::channel();

    (
        FlightStreamAssembler {
            id,
            data: Some(data_tx),
            outcome: Some(outcome_tx),
            bytes_written: 0,
            chunks_written: 0,
            detached: false,
        },
        FlightStream {
            id,
            data: data_rx,
            outcome: Some(outcome_rx),
            done: false,
        },
    )
}

/// Producer half: receives `write`, `end` and `destroy` from the channel.
#[derive(Debug)]
pub struct FlightStreamAssembler {
    id: CallId,
    data: Option<mpsc::Sender<Vec<u8>>>,
    outcome: Option<oneshot::Sender<Result<(), FlightError>>>,
    bytes_written: u64,
    chunks_written: usize,
    detached: bool,
}

impl FlightStreamAssembler {
    /// Call this stream belongs to.
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Append `bytes[offset..offset + length]`.
    ///
    /// Waits while the consumer is behind. Once the consumer is gone the
    /// bytes are discarded, since nobody can observe them.
    pub async fn write(&mut self, bytes: &[u8], offset: usize, length: usize) -> Result<(), FlightError> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                FlightError::Protocol(format!(
                    "chunk for call {} claims {}..{}+{} of a {}-byte buffer",
                    self.id,
                    offset,
                    offset,
                    length,
                    bytes.len()
                ))
            })?;

        if length == 0 || self.detached {
            return Ok(());
        }

        let Some(data) = self.data.as_ref() else {
            return Err(FlightError::Protocol(format!(
                "write after terminal frame on call {}",
                self.id
            )));
        };

        if data.send(bytes[offset..end].to_vec()).await.is_err() {
            tracing::debug!(call_id = self.id, "consumer dropped, discarding remaining chunks");
            self.detached = true;
            return Ok(());
        }

        self.bytes_written += length as u64;
        self.chunks_written += 1;
        Ok(())
    }

    /// Finish successfully.
    pub fn end(mut self) {
        self.finish(Ok(()));
    }

    /// Finish with an error. Chunks already written stay readable ahead of it.
    pub fn destroy(mut self, error: FlightError) {
        self.finish(Err(error));
    }

    fn finish(&mut self, outcome: Result<(), FlightError>) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
        self.data = None;
    }

    /// Whether the consumer has gone away.
    pub fn is_detached(&self) -> bool {
        self.detached || self.data.as_ref().map_or(true, |d| d.is_closed())
    }

    /// Bytes handed to the consumer so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Chunks handed to the consumer so far.
    pub fn chunks_written(&self) -> usize {
        self.chunks_written
    }
}

/// Consumer half: the ordered bytes of one call.
///
/// Yields every chunk in arrival order, then either ends or yields exactly
/// one error. A producer dropped without a terminal frame surfaces as a
/// protocol error.
#[derive(Debug)]
pub struct FlightStream {
    id: CallId,
    data: mpsc::Receiver<Vec<u8>>,
    outcome: Option<oneshot::Receiver<Result<(), FlightError>>>,
    done: bool,
}

impl FlightStream {
    /// Call this stream belongs to.
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Collect every byte, failing if the call failed.
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>, FlightError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl Stream for FlightStream {
    type Item = Result<Vec<u8>, FlightError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.data.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => return Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }

        let Some(outcome) = this.outcome.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };

        let result = match Pin::new(outcome).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(Ok(()))) => None,
            Poll::Ready(Ok(Err(err))) => Some(Err(err)),
            Poll::Ready(Err(_)) => Some(Err(FlightError::Protocol(format!(
                "call {} ended without a terminal frame",
                this.id
            )))),
        };
        this.done = true;
        this.outcome = None;
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flight_core::{ErrorKind, SerializedError};

    #[tokio::test]
    async fn test_chunks_assemble_in_order() {
        let (mut asm, stream) = flight_stream(1, 8);

        asm.write(b"<html>", 0, 6).await.unwrap();
        asm.write(b"<body>", 0, 6).await.unwrap();
        asm.write(b"</body></html>", 0, 14).await.unwrap();
        assert_eq!(asm.bytes_written(), 26);
        asm.end();

        let bytes = stream.collect_bytes().await.unwrap();
        assert_eq!(bytes, b"<html><body></body></html>".to_vec());
    }

    #[tokio::test]
    async fn test_offset_and_length_select_a_slice() {
        let (mut asm, stream) = flight_stream(1, 8);
        asm.write(b"xxhelloxx", 2, 5).await.unwrap();
        asm.end();

        assert_eq!(stream.collect_bytes().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_out_of_range_chunk_is_a_protocol_error() {
        let (mut asm, _stream) = flight_stream(1, 8);
        let err = asm.write(b"abc", 2, 5).await.unwrap_err();
        assert!(matches!(err, FlightError::Protocol(_)));

        let err = asm.write(b"abc", usize::MAX, 1).await.unwrap_err();
        assert!(matches!(err, FlightError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_destroy_surfaces_after_buffered_chunks() {
        let (mut asm, mut stream) = flight_stream(9, 8);
        asm.write(b"partial", 0, 7).await.unwrap();
        asm.destroy(FlightError::Render(SerializedError::new(ErrorKind::Render, "boom")));

        assert_eq!(stream.next().await.unwrap().unwrap(), b"partial".to_vec());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_producer_is_a_protocol_error() {
        let (asm, stream) = flight_stream(4, 8);
        drop(asm);

        let err = stream.collect_bytes().await.unwrap_err();
        assert!(matches!(err, FlightError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_full_buffer_applies_backpressure() {
        let (mut asm, mut stream) = flight_stream(1, 1);
        asm.write(b"a", 0, 1).await.unwrap();

        // Second write must wait until the consumer reads.
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            asm.write(b"b", 0, 1),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(stream.next().await.unwrap().unwrap(), b"a".to_vec());
        asm.write(b"b", 0, 1).await.unwrap();
        asm.end();
        assert_eq!(stream.collect_bytes().await.unwrap(), b"b".to_vec());
    }

    #[tokio::test]
    async fn test_dropped_consumer_detaches_producer() {
        let (mut asm, stream) = flight_stream(1, 1);
        drop(stream);

        asm.write(b"ignored", 0, 7).await.unwrap();
        assert!(asm.is_detached());
        assert_eq!(asm.bytes_written(), 0);
        asm.end();
    }
}
