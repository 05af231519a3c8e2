//! Error taxonomy shared by every layer of the transport.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::CallId;

/// Which stage produced a serialized failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Exception while rendering a component.
    #[default]
    Render,
    /// Exception inside a server action.
    Action,
    /// Module reference missing from the entry map.
    EntryMapping,
    /// Malformed request handed to the rendering context.
    InvalidRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render => write!(f, "render"),
            Self::Action => write!(f, "action"),
            Self::EntryMapping => write!(f, "entry-mapping"),
            Self::InvalidRequest => write!(f, "invalid-request"),
        }
    }
}

/// Error description that can cross the channel or HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    /// Stage that failed.
    #[serde(default)]
    pub kind: ErrorKind,
    /// Top-level message.
    pub message: String,
    /// Underlying causes, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl SerializedError {
    /// Create a serialized error without a cause chain.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Capture an `anyhow` error and its whole cause chain.
    ///
    /// A `FlightError` anywhere in the chain keeps its own kind, so an entry
    /// mapping miss raised inside a component stays an entry mapping error.
    pub fn from_anyhow(kind: ErrorKind, err: &anyhow::Error) -> Self {
        let kind = err
            .chain()
            .find_map(|e| e.downcast_ref::<FlightError>())
            .and_then(FlightError::kind)
            .unwrap_or(kind);

        Self {
            kind,
            message: err.to_string(),
            causes: err.chain().skip(1).map(|e| e.to_string()).collect(),
        }
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for SerializedError {}

/// Errors produced by the transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlightError {
    /// Malformed or out-of-order frame on the channel.
    #[error("channel protocol error: {0}")]
    Protocol(String),

    /// Exception during rendering.
    #[error("render failed: {0}")]
    Render(SerializedError),

    /// Exception during a server action.
    #[error("server action failed: {0}")]
    Action(SerializedError),

    /// Module reference has no entry in the named table.
    #[error("no {table} entry for module '{module_id}'")]
    EntryMapping { table: String, module_id: String },

    /// Client to server network failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The watchdog expired before a terminal frame arrived.
    #[error("call {id} timed out after {after:?}")]
    Timeout { id: CallId, after: Duration },

    /// The caller cancelled the call.
    #[error("call {0} was cancelled")]
    Cancelled(CallId),

    /// The channel or the rendering context is gone.
    #[error("render channel closed")]
    ChannelClosed,

    /// An action argument could not be encoded.
    #[error("failed to encode action argument {index}: {reason}")]
    Encoding { index: usize, reason: String },

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A request did not describe a valid rendering call.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FlightError {
    /// Rebuild a typed error from its serialized form.
    pub fn from_serialized(err: SerializedError) -> Self {
        match err.kind {
            ErrorKind::Render => Self::Render(err),
            ErrorKind::Action => Self::Action(err),
            ErrorKind::InvalidRequest => Self::InvalidRequest(err.message),
            ErrorKind::EntryMapping => Self::Render(err),
        }
    }

    /// Serialize for transmission across a boundary.
    pub fn to_serialized(&self) -> SerializedError {
        match self {
            Self::Render(err) | Self::Action(err) => err.clone(),
            other => SerializedError::new(other.kind().unwrap_or_default(), other.to_string()),
        }
    }

    /// Serialized kind this error maps to, if it has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Render(err) | Self::Action(err) => Some(err.kind),
            Self::EntryMapping { .. } => Some(ErrorKind::EntryMapping),
            Self::InvalidRequest(_) => Some(ErrorKind::InvalidRequest),
            _ => None,
        }
    }

    /// Whether a later retry of the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::ChannelClosed | Self::Cancelled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("boom").context("rendering Page");
        let serialized = SerializedError::from_anyhow(ErrorKind::Render, &err);

        assert_eq!(serialized.message, "rendering Page");
        assert_eq!(serialized.causes, vec!["boom".to_string()]);
        assert!(serialized.to_string().contains("boom"));
    }

    #[test]
    fn test_entry_mapping_kind_survives_anyhow() {
        let err = anyhow::Error::new(FlightError::EntryMapping {
            table: "client".into(),
            module_id: "/src/Counter.tsx".into(),
        })
        .context("rendering Page");

        let serialized = SerializedError::from_anyhow(ErrorKind::Render, &err);
        assert_eq!(serialized.kind, ErrorKind::EntryMapping);
    }

    #[test]
    fn test_from_serialized_routes_by_kind() {
        let action = SerializedError::new(ErrorKind::Action, "nope");
        assert!(matches!(
            FlightError::from_serialized(action),
            FlightError::Action(_)
        ));

        let render = SerializedError::new(ErrorKind::Render, "boom");
        let err = FlightError::from_serialized(render);
        assert!(matches!(err, FlightError::Render(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_serialized_error_json_shape() {
        let err = SerializedError::new(ErrorKind::EntryMapping, "missing");
        let json = serde_json::to_value(&err).unwrap();

        assert_eq!(json["kind"], "entry-mapping");
        assert_eq!(json["message"], "missing");
        assert!(json.get("causes").is_none());
    }

    #[test]
    fn test_retryable() {
        assert!(FlightError::Transport("reset".into()).is_retryable());
        assert!(FlightError::ChannelClosed.is_retryable());
        assert!(!FlightError::Decode("bad".into()).is_retryable());
    }
}
