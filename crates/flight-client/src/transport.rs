//! HTTP seam between the client and a flight endpoint.

use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use flight_core::{
    build_query, url_encode, FlightError, FlightKey, MultipartBody, SerializedError, FLIGHT_CONTENT_TYPE,
    RSC_HEADER,
};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use tokio::sync::{mpsc, oneshot};

/// Path segment used for actions that re-render nothing.
pub const NO_COMPONENT: &str = "_";

/// Body of a flight response, delivered as it arrives.
pub type BodyStream = BoxStream<'static, Result<Vec<u8>, FlightError>>;

/// Response of a flight endpoint.
pub struct FlightResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl FlightResponse {
    /// Create a response with a streamed body.
    pub fn new(status: StatusCode, body: BodyStream) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Create a response with a body already in memory.
    pub fn from_bytes(status: StatusCode, bytes: Vec<u8>) -> Self {
        Self::new(status, stream::iter([Ok(bytes)]).boxed())
    }

    /// Set the headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// The payload stream of a successful response.
    ///
    /// Error responses carrying a serialized error become that error;
    /// anything else is a transport error.
    pub async fn into_payload(self) -> Result<BodyStream, FlightError> {
        if self.status.is_success() {
            return Ok(self.body);
        }

        let status = self.status;
        let chunks: Vec<Vec<u8>> = self.body.try_collect().await?;
        let bytes = chunks.concat();
        match serde_json::from_slice::<SerializedError>(&bytes) {
            Ok(err) => Err(FlightError::from_serialized(err)),
            Err(_) => Err(FlightError::Transport(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&bytes)
            ))),
        }
    }
}

impl std::fmt::Debug for FlightResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Sends flight requests.
#[async_trait]
pub trait FlightTransport: Send + Sync {
    /// Send a request. Network failures are `FlightError::Transport`.
    async fn send(&self, request: Request<Vec<u8>>) -> Result<FlightResponse, FlightError>;
}

/// `GET <base>/<componentId>?props=<json>` for a rendering request.
pub fn render_request(base_path: &str, key: &FlightKey) -> Result<Request<Vec<u8>>, FlightError> {
    let uri = format!(
        "{}/{}?{}",
        base_path.trim_end_matches('/'),
        url_encode(&key.component_id),
        build_query(&[("props", &key.props)])
    );

    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(RSC_HEADER, "1")
        .header(header::ACCEPT, FLIGHT_CONTENT_TYPE)
        .body(Vec::new())
        .map_err(|e| FlightError::InvalidRequest(e.to_string()))
}

/// `POST <base>/<"_"|componentId>?action_id=<id>&props=<json>` for an action.
pub fn action_request(
    base_path: &str,
    action_id: &str,
    target: Option<&FlightKey>,
    body: MultipartBody,
) -> Result<Request<Vec<u8>>, FlightError> {
    let (component, query) = match target {
        Some(key) => (
            url_encode(&key.component_id),
            build_query(&[("action_id", action_id), ("props", &key.props)]),
        ),
        None => (NO_COMPONENT.to_string(), build_query(&[("action_id", action_id)])),
    };
    let uri = format!("{}/{}?{}", base_path.trim_end_matches('/'), component, query);

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(RSC_HEADER, "1")
        .header(header::ACCEPT, FLIGHT_CONTENT_TYPE)
        .header(header::CONTENT_TYPE, body.content_type())
        .body(body.into_bytes())
        .map_err(|e| FlightError::InvalidRequest(e.to_string()))
}

/// Transport over a blocking HTTP client running on the blocking pool.
///
/// The body is read incrementally and forwarded as it arrives.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    origin: String,
    agent: ureq::Agent,
}

impl UreqTransport {
    /// Create a transport for `origin`, e.g. `http://localhost:8910`.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(5))
                .build(),
        }
    }

    /// Set the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(timeout)
            .build();
        self
    }
}

#[async_trait]
impl FlightTransport for UreqTransport {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<FlightResponse, FlightError> {
        let url = format!("{}{}", self.origin.trim_end_matches('/'), request.uri());
        let agent = self.agent.clone();
        let (parts, body) = request.into_parts();

        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(16);

        tokio::task::spawn_blocking(move || {
            let mut req = agent.request(parts.method.as_str(), &url);
            for (name, value) in parts.headers.iter() {
                if let Ok(value) = value.to_str() {
                    req = req.set(name.as_str(), value);
                }
            }

            let sent = if body.is_empty() && parts.method == Method::GET {
                req.call()
            } else {
                req.send_bytes(&body)
            };
            let response = match sent {
                Ok(response) => response,
                Err(ureq::Error::Status(_, response)) => response,
                Err(ureq::Error::Transport(err)) => {
                    let _ = head_tx.send(Err(FlightError::Transport(format!("{url}: {err}"))));
                    return;
                }
            };

            let mut headers = HeaderMap::new();
            for name in response.headers_names() {
                if let (Ok(name), Some(value)) = (
                    header::HeaderName::from_bytes(name.as_bytes()),
                    response.header(&name).and_then(|v| v.parse::<HeaderValue>().ok()),
                ) {
                    headers.insert(name, value);
                }
            }
            if head_tx.send(Ok((response.status(), headers))).is_err() {
                return;
            }

            let mut reader = response.into_reader();
            let mut buf = vec![0u8; 8 * 1024];
            loop {
                let item = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) => Err(FlightError::Transport(e.to_string())),
                };
                let failed = item.is_err();
                if body_tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
        });

        let (status, headers) = head_rx
            .await
            .map_err(|_| FlightError::Transport("request task ended without a response".to_string()))??;
        let status = StatusCode::from_u16(status)
            .map_err(|e| FlightError::Transport(format!("invalid status: {}", e)))?;

        let body = stream::unfold(body_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(FlightResponse::new(status, body).with_headers(headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flight_core::{ActionArg, ErrorKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_request_shape() {
        let key = FlightKey::new("Page", r#"{"id":1}"#);
        let request = render_request("/rw-rsc/", &key).unwrap();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/rw-rsc/Page");
        assert_eq!(request.uri().query(), Some("props=%7B%22id%22%3A1%7D"));
        assert_eq!(request.headers().get(RSC_HEADER).unwrap(), "1");
    }

    #[test]
    fn test_action_request_without_target() {
        let body = MultipartBody::encode(&[ActionArg::value(serde_json::json!(1))]).unwrap();
        let request = action_request("/rw-rsc", "counter#increment", None, body).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().path(), "/rw-rsc/_");
        assert_eq!(request.uri().query(), Some("action_id=counter%23increment"));
        assert!(request.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("multipart/form-data"));
    }

    #[test]
    fn test_action_request_with_target_carries_props() {
        let body = MultipartBody::encode(&[]).unwrap();
        let key = FlightKey::new("Counter", "{}");
        let request = action_request("/rw-rsc", "inc", Some(&key), body).unwrap();

        assert_eq!(request.uri().path(), "/rw-rsc/Counter");
        assert_eq!(request.uri().query(), Some("action_id=inc&props=%7B%7D"));
    }

    #[tokio::test]
    async fn test_error_response_with_serialized_error() {
        let err = SerializedError::new(ErrorKind::Action, "nope");
        let response = FlightResponse::from_bytes(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::to_vec(&err).unwrap(),
        );
        let result = response.into_payload().await;
        assert!(matches!(result, Err(FlightError::Action(e)) if e.message == "nope"));
    }

    #[tokio::test]
    async fn test_error_response_without_body_is_transport() {
        let response = FlightResponse::from_bytes(StatusCode::BAD_GATEWAY, b"upstream".to_vec());
        let result = response.into_payload().await;
        assert!(matches!(result, Err(FlightError::Transport(msg)) if msg.contains("502")));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_transport_error() {
        let transport = UreqTransport::new("http://127.0.0.1:9");
        let request = render_request("/rw-rsc", &FlightKey::new("Page", "{}")).unwrap();
        let result = transport.send(request).await;
        assert!(matches!(result, Err(FlightError::Transport(_))));
    }
}
