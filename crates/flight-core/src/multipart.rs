//! Binary-safe multipart encoding of server action arguments.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlightError;

const JSON_CONTENT_TYPE: &str = "application/json";
const BOUNDARY_LEN: usize = 32;
const BOUNDARY_ATTEMPTS: usize = 8;

/// A single decoded action argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ActionArg {
    /// A JSON value.
    Value { value: Value },
    /// An embedded file-like payload.
    #[serde(rename_all = "camelCase")]
    File {
        name: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

impl ActionArg {
    /// A JSON argument.
    pub fn value(value: Value) -> Self {
        Self::Value { value }
    }

    /// A file argument.
    pub fn file(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::File {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// The JSON value, if this is a value argument.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value { value } => Some(value),
            Self::File { .. } => None,
        }
    }
}

/// Builder collecting action arguments.
///
/// Serialization failures are kept until [`ActionArgs::into_args`], which
/// fails the whole call instead of dropping the argument.
#[derive(Debug, Default)]
pub struct ActionArgs {
    args: Vec<Result<ActionArg, String>>,
}

impl ActionArgs {
    /// Create an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a serializable argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.args.push(
            serde_json::to_value(value)
                .map(ActionArg::value)
                .map_err(|e| e.to_string()),
        );
        self
    }

    /// Append a file argument.
    pub fn file(mut self, name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.args.push(Ok(ActionArg::file(name, content_type, bytes)));
        self
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether no argument was added.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Resolve the arguments, failing on the first one that did not encode.
    pub fn into_args(self) -> Result<Vec<ActionArg>, FlightError> {
        self.args
            .into_iter()
            .enumerate()
            .map(|(index, arg)| arg.map_err(|reason| FlightError::Encoding { index, reason }))
            .collect()
    }
}

impl From<Vec<ActionArg>> for ActionArgs {
    fn from(args: Vec<ActionArg>) -> Self {
        Self {
            args: args.into_iter().map(Ok).collect(),
        }
    }
}

/// An encoded multipart body.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    boundary: String,
    bytes: Vec<u8>,
}

impl MultipartBody {
    /// Encode arguments as `multipart/form-data`.
    pub fn encode(args: &[ActionArg]) -> Result<Self, FlightError> {
        let mut parts = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let (headers, content) = match arg {
                ActionArg::Value { value } => {
                    let content = serde_json::to_vec(value).map_err(|e| FlightError::Encoding {
                        index,
                        reason: e.to_string(),
                    })?;
                    (
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"\r\nContent-Type: {}",
                            index, JSON_CONTENT_TYPE
                        ),
                        content,
                    )
                }
                ActionArg::File {
                    name,
                    content_type,
                    bytes,
                } => (
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}",
                        index,
                        escape_quoted(name),
                        content_type
                    ),
                    bytes.clone(),
                ),
            };
            parts.push((headers, content));
        }

        let boundary = pick_boundary(&parts)?;
        let mut bytes = Vec::new();
        for (headers, content) in &parts {
            bytes.extend_from_slice(format!("--{}\r\n{}\r\n\r\n", boundary, headers).as_bytes());
            bytes.extend_from_slice(content);
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        Ok(Self { boundary, bytes })
    }

    /// `Content-Type` header value for this body.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// The boundary string.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// The encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn pick_boundary(parts: &[(String, Vec<u8>)]) -> Result<String, FlightError> {
    let mut rng = rand::thread_rng();
    for _ in 0..BOUNDARY_ATTEMPTS {
        let candidate: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(BOUNDARY_LEN)
            .map(char::from)
            .collect();
        let boundary = format!("----flight{}", candidate);
        if parts
            .iter()
            .all(|(_, content)| find(content, boundary.as_bytes(), 0).is_none())
        {
            return Ok(boundary);
        }
    }
    Err(FlightError::Encoding {
        index: 0,
        reason: "could not pick a boundary absent from the payload".to_string(),
    })
}

/// Decode a `multipart/form-data` body into action arguments.
pub fn decode_multipart(content_type: &str, body: &[u8]) -> Result<Vec<ActionArg>, FlightError> {
    let boundary = boundary_from_content_type(content_type)?;
    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = [b"\r\n".as_slice(), &delimiter].concat();

    let mut pos = find(body, &delimiter, 0)
        .ok_or_else(|| FlightError::Decode("multipart body has no opening boundary".into()))?
        + delimiter.len();

    let mut parts: Vec<(usize, ActionArg)> = Vec::new();
    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        if !rest.starts_with(b"\r\n") {
            return Err(FlightError::Decode("malformed multipart boundary line".into()));
        }
        pos += 2;

        let header_end = find(body, b"\r\n\r\n", pos)
            .ok_or_else(|| FlightError::Decode("multipart part without headers".into()))?;
        let headers = std::str::from_utf8(&body[pos..header_end])
            .map_err(|e| FlightError::Decode(format!("multipart headers: {}", e)))?;
        let content_start = header_end + 4;
        let content_end = find(body, &separator, content_start)
            .ok_or_else(|| FlightError::Decode("multipart part is not terminated".into()))?;

        parts.push(parse_part(headers, &body[content_start..content_end])?);
        pos = content_end + separator.len();
    }

    parts.sort_by_key(|(index, _)| *index);
    Ok(parts.into_iter().map(|(_, arg)| arg).collect())
}

fn parse_part(headers: &str, content: &[u8]) -> Result<(usize, ActionArg), FlightError> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "content-disposition" => {
                for param in value.split(';').skip(1) {
                    if let Some((k, v)) = param.trim().split_once('=') {
                        let v = unescape_quoted(v.trim().trim_matches('"'));
                        match k {
                            "name" => name = Some(v),
                            "filename" => filename = Some(v),
                            _ => {}
                        }
                    }
                }
            }
            "content-type" => content_type = Some(value.to_string()),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| FlightError::Decode("multipart part without a name".into()))?;
    let index = name
        .parse::<usize>()
        .map_err(|_| FlightError::Decode(format!("multipart part name '{}' is not an index", name)))?;

    let arg = match (filename, content_type) {
        (Some(filename), content_type) => ActionArg::file(
            filename,
            content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            content.to_vec(),
        ),
        (None, Some(ct)) if ct.starts_with(JSON_CONTENT_TYPE) => ActionArg::value(
            serde_json::from_slice(content)
                .map_err(|e| FlightError::Decode(format!("argument {}: {}", index, e)))?,
        ),
        (None, _) => ActionArg::value(Value::String(
            String::from_utf8(content.to_vec())
                .map_err(|e| FlightError::Decode(format!("argument {}: {}", index, e)))?,
        )),
    };

    Ok((index, arg))
}

fn boundary_from_content_type(content_type: &str) -> Result<String, FlightError> {
    let mut params = content_type.split(';');
    let mime = params.next().unwrap_or_default().trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return Err(FlightError::Decode(format!(
            "expected multipart/form-data, got '{}'",
            mime
        )));
    }
    params
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| FlightError::Decode("multipart content type has no boundary".into()))
}

fn escape_quoted(s: &str) -> String {
    s.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

fn unescape_quoted(s: &str) -> String {
    s.replace("%22", "\"").replace("%0D", "\r").replace("%0A", "\n")
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
