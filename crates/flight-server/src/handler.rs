//! HTTP-facing flight handler.
//!
//! The status is chosen only after the first payload chunk arrives, so a
//! render that fails up front still gets a proper error response. Failures
//! after that are appended to the payload as an error row.

use std::sync::Arc;

use flight_client::BodyStream;
use flight_core::{ClientConfig, FlightError, SerializedError, FLIGHT_CONTENT_TYPE};
use flight_observability::{report_detached, TelemetryReport, TelemetrySink};
use flight_streaming::{FlushPolicy, PayloadSink};
use flight_worker::RenderWorkerChannel;
use futures::channel::mpsc;
use futures::{stream, StreamExt};
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode};
use serde_json::json;

use crate::{parse_request, FlightRoute, RequestError};

/// Frames buffered between the render and the response body.
const BODY_BUFFER: usize = 16;

/// Serves flight requests from a render channel.
#[derive(Clone)]
pub struct FlightHandler {
    channel: Arc<RenderWorkerChannel>,
    base_path: String,
    flush: FlushPolicy,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl FlightHandler {
    /// Create a handler mounted at the configured base path.
    pub fn new(channel: Arc<RenderWorkerChannel>, config: &ClientConfig) -> Self {
        Self {
            channel,
            base_path: config.base_path.clone(),
            flush: FlushPolicy::Immediate,
            telemetry: None,
        }
    }

    /// Set how payload chunks are coalesced into body writes.
    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush = policy;
        self
    }

    /// Report every completed payload to `sink`.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn channel(&self) -> &Arc<RenderWorkerChannel> {
        &self.channel
    }

    /// Serve one request.
    pub async fn handle(&self, request: Request<Vec<u8>>) -> Response<BodyStream> {
        let route = match parse_request(&self.base_path, &request) {
            Ok(route) => route,
            Err(err) => {
                tracing::debug!(
                    method = %request.method(),
                    path = request.uri().path(),
                    error = %err,
                    "flight request rejected"
                );
                return rejection(&err);
            }
        };

        let component = route.component_id().map(str::to_string);
        let action = route.action_id().map(str::to_string);
        tracing::debug!(component = ?component, action = ?action, "serving flight request");

        let mut call = match self.start(route).await {
            Ok(call) => call,
            Err(err) => return error_response(&err),
        };
        let cancel = call.cancel_token();

        let first = match call.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                tracing::warn!(component = ?component, action = ?action, error = %err, "flight render failed");
                return error_response(&err);
            }
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel::<Vec<u8>>(BODY_BUFFER);
        let sink = PayloadSink::new(tx, self.flush);
        let telemetry = self.telemetry.clone();

        tokio::spawn(async move {
            let mut payload = Vec::new();
            let collect = telemetry.is_some();
            let tee = stream::iter([Ok(first)]).chain(call).inspect(|item| {
                if let (true, Ok(bytes)) = (collect, item) {
                    payload.extend_from_slice(bytes);
                }
            });

            let summary = match sink.pipe(tee).await {
                Ok(summary) => summary,
                Err(err) => {
                    tracing::debug!(error = %err, "flight response abandoned, cancelling render");
                    cancel.cancel();
                    return;
                }
            };
            tracing::debug!(
                component = ?component,
                action = ?action,
                bytes = summary.bytes_sent,
                flushes = summary.flushes,
                failed = summary.trailer.is_some(),
                "flight response complete"
            );

            if let Some(sink) = telemetry {
                let metadata = json!({
                    "componentId": component,
                    "actionId": action,
                    "bytes": summary.bytes_sent,
                    "error": summary.trailer.as_ref().map(|e| e.to_string()),
                });
                report_detached(sink, TelemetryReport::new(&payload, &metadata));
            }
        });

        flight_response(StatusCode::OK, rx.map(Ok).boxed())
    }

    async fn start(&self, route: FlightRoute) -> Result<flight_worker::RenderCall, FlightError> {
        let input = route.into_input()?;
        self.channel.render(input).await
    }
}

impl std::fmt::Debug for FlightHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightHandler")
            .field("base_path", &self.base_path)
            .field("flush", &self.flush)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

/// Status of a failure that happened before any byte was sent.
pub fn error_status(err: &FlightError) -> StatusCode {
    match err {
        FlightError::InvalidRequest(_) | FlightError::Encoding { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection(err: &RequestError) -> Response<BodyStream> {
    let mut response = json_response(err.status(), &err.to_serialized());
    if matches!(err, RequestError::MethodNotAllowed(_)) {
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET, POST"));
    }
    response
}

fn error_response(err: &FlightError) -> Response<BodyStream> {
    json_response(error_status(err), &err.to_serialized())
}

fn json_response(status: StatusCode, err: &SerializedError) -> Response<BodyStream> {
    let body = serde_json::to_vec(err).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(stream::iter([Ok(body)]).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn flight_response(status: StatusCode, body: BodyStream) -> Response<BodyStream> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(FLIGHT_CONTENT_TYPE));
    response
}
