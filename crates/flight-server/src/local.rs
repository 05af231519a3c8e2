//! In-process transport: the client talks to a handler without a socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flight_client::{FlightResponse, FlightTransport};
use flight_core::FlightError;
use http::Request;

use crate::FlightHandler;

/// Client transport backed by a `FlightHandler` in the same process.
#[derive(Debug)]
pub struct LocalTransport {
    handler: FlightHandler,
    requests: AtomicUsize,
}

impl LocalTransport {
    pub fn new(handler: FlightHandler) -> Arc<Self> {
        Arc::new(Self {
            handler,
            requests: AtomicUsize::new(0),
        })
    }

    /// Requests sent so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn handler(&self) -> &FlightHandler {
        &self.handler
    }
}

#[async_trait]
impl FlightTransport for LocalTransport {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<FlightResponse, FlightError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(method = %request.method(), uri = %request.uri(), "local flight request");

        let (parts, body) = self.handler.handle(request).await.into_parts();
        Ok(FlightResponse::new(parts.status, body).with_headers(parts.headers))
    }
}
