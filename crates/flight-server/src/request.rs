//! Parsing of flight endpoint requests.
//!
//! - `GET <base>/<componentId>?props=<json>` with `rw-rsc: 1` renders a component.
//! - `POST <base>/<"_"|componentId>?action_id=<id>&props=<json>` runs an action,
//!   with its arguments in a multipart body.

use flight_core::{
    decode_multipart, parse_query, url_decode, ActionArg, ErrorKind, FlightError, FlightKey, RenderInput,
    SerializedError, RSC_HEADER,
};
use http::{header, Method, Request, StatusCode};

/// Path segment of an action that re-renders nothing.
const NO_COMPONENT: &str = "_";

/// A request the handler can serve.
#[derive(Debug, Clone, PartialEq)]
pub enum FlightRoute {
    /// Render a component.
    Render(FlightKey),
    /// Run a server action, optionally re-rendering a component.
    Action {
        action_id: String,
        target: Option<FlightKey>,
        args: Vec<ActionArg>,
    },
}

impl FlightRoute {
    /// Input for the rendering context.
    pub fn into_input(self) -> Result<RenderInput, FlightError> {
        match self {
            Self::Render(key) => RenderInput::for_key(&key),
            Self::Action {
                action_id,
                target,
                args,
            } => {
                let input = RenderInput::action(action_id, args);
                match target {
                    Some(key) => {
                        let props = key.props_value()?;
                        Ok(input.with_component(key.component_id, props))
                    }
                    None => Ok(input),
                }
            }
        }
    }

    /// Component this request renders, if any.
    pub fn component_id(&self) -> Option<&str> {
        match self {
            Self::Render(key) => Some(&key.component_id),
            Self::Action { target, .. } => target.as_ref().map(|k| k.component_id.as_str()),
        }
    }

    /// Action this request runs, if any.
    pub fn action_id(&self) -> Option<&str> {
        match self {
            Self::Render(_) => None,
            Self::Action { action_id, .. } => Some(action_id),
        }
    }
}

/// Why a request was rejected before reaching the rendering context.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("no flight route for '{0}'")]
    NotFound(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    #[error("missing 'rw-rsc: 1' header")]
    MissingHeader,

    #[error(transparent)]
    Invalid(#[from] FlightError),
}

impl RequestError {
    /// HTTP status of the rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingHeader | Self::Invalid(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Body of the rejection.
    pub fn to_serialized(&self) -> SerializedError {
        SerializedError::new(ErrorKind::InvalidRequest, self.to_string())
    }
}

/// Parse a request addressed to the flight endpoint at `base_path`.
pub fn parse_request(base_path: &str, request: &Request<Vec<u8>>) -> Result<FlightRoute, RequestError> {
    let path = request.uri().path();
    let segment = route_segment(base_path, path).ok_or_else(|| RequestError::NotFound(path.to_string()))?;
    let component = url_decode(segment)?;
    let query = parse_query(request.uri().query().unwrap_or(""))?;
    let props = query.get("props").cloned().unwrap_or_else(|| "{}".to_string());

    match *request.method() {
        Method::GET => {
            let marked = request
                .headers()
                .get(RSC_HEADER)
                .is_some_and(|value| value.as_bytes() == b"1");
            if !marked {
                return Err(RequestError::MissingHeader);
            }

            let key = FlightKey::new(component, props);
            key.props_value()?;
            Ok(FlightRoute::Render(key))
        }
        Method::POST => {
            let action_id = query
                .get("action_id")
                .filter(|id| !id.is_empty())
                .cloned()
                .ok_or_else(|| FlightError::InvalidRequest("missing action_id".to_string()))?;

            let target = if component == NO_COMPONENT {
                None
            } else {
                let key = FlightKey::new(component, props);
                key.props_value()?;
                Some(key)
            };

            let args = if request.body().is_empty() {
                Vec::new()
            } else {
                let content_type = request
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| FlightError::InvalidRequest("action body without content type".to_string()))?;
                decode_multipart(content_type, request.body())?
            };

            Ok(FlightRoute::Action {
                action_id,
                target,
                args,
            })
        }
        ref other => Err(RequestError::MethodNotAllowed(other.clone())),
    }
}

/// The single path segment following `base_path`.
fn route_segment<'a>(base_path: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(base_path.trim_end_matches('/'))?;
    let segment = rest.strip_prefix('/')?;
    if segment.is_empty() || segment.contains('/') {
        return None;
    }
    Some(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flight_core::MultipartBody;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn get(uri: &str) -> Request<Vec<u8>> {
        Request::get(uri).header(RSC_HEADER, "1").body(Vec::new()).unwrap()
    }

    #[test]
    fn test_parse_render() {
        let route = parse_request("/rw-rsc", &get("/rw-rsc/Page?props=%7B%22id%22%3A1%7D")).unwrap();
        assert_eq!(route, FlightRoute::Render(FlightKey::new("Page", r#"{"id":1}"#)));
        assert_eq!(
            route.into_input().unwrap(),
            RenderInput::component("Page", json!({ "id": 1 }))
        );
    }

    #[test]
    fn test_get_requires_rsc_header() {
        let request = Request::get("/rw-rsc/Page").body(Vec::new()).unwrap();
        let err = parse_request("/rw-rsc", &request).unwrap_err();
        assert!(matches!(err, RequestError::MissingHeader));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_outside_base_path_is_not_found() {
        for uri in ["/other/Page", "/rw-rsc", "/rw-rsc/", "/rw-rsc/a/b", "/rw-rscPage"] {
            let err = parse_request("/rw-rsc", &get(uri)).unwrap_err();
            assert_eq!(err.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[test]
    fn test_other_methods_rejected() {
        let request = Request::delete("/rw-rsc/Page").body(Vec::new()).unwrap();
        let err = parse_request("/rw-rsc", &request).unwrap_err();
        assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_invalid_props_rejected() {
        let err = parse_request("/rw-rsc", &get("/rw-rsc/Page?props=%7Bnope")).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_serialized().kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_parse_action_with_target_and_args() {
        let body = MultipartBody::encode(&[
            ActionArg::value(json!({ "qty": 2 })),
            ActionArg::file("a.txt", "text/plain", b"hi\r\n--x".to_vec()),
        ])
        .unwrap();
        let request = Request::post("/rw-rsc/Cart?action_id=cart%23add&props=%7B%7D")
            .header(header::CONTENT_TYPE, body.content_type())
            .body(body.into_bytes())
            .unwrap();

        let route = parse_request("/rw-rsc", &request).unwrap();
        let FlightRoute::Action {
            action_id,
            target,
            args,
        } = route.clone()
        else {
            panic!("expected an action route");
        };
        assert_eq!(action_id, "cart#add");
        assert_eq!(target, Some(FlightKey::new("Cart", "{}")));
        assert_eq!(args.len(), 2);

        let input = route.into_input().unwrap();
        assert_eq!(input.component_id.as_deref(), Some("Cart"));
        assert_eq!(input.action_id.as_deref(), Some("cart#add"));
    }

    #[test]
    fn test_parse_action_without_target() {
        let request = Request::post("/rw-rsc/_?action_id=ping").body(Vec::new()).unwrap();
        let route = parse_request("/rw-rsc", &request).unwrap();
        assert_eq!(route.component_id(), None);
        assert_eq!(route.action_id(), Some("ping"));
    }

    #[test]
    fn test_action_requires_action_id() {
        let request = Request::post("/rw-rsc/_").body(Vec::new()).unwrap();
        let err = parse_request("/rw-rsc", &request).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
