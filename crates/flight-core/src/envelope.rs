//! Channel envelopes exchanged between the host and the rendering context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SerializedError;
use crate::identity::RenderInput;

/// Correlation id of a single channel call.
pub type CallId = u64;

/// Where the rendering context should take its client entries from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientEntriesSource {
    /// Read `clientEntries` from the generated entries artifact.
    LoadDefault,
    /// Use an explicit server-module-id to client-asset mapping.
    Mapping(BTreeMap<String, String>),
}

/// Request sent from the host to the rendering context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    Render { id: CallId, input: RenderInput },
    Build { id: CallId },
    SetClientEntries { id: CallId, input: ClientEntriesSource },
    GetCustomModules { id: CallId },
    Shutdown { id: CallId },
}

impl WorkerRequest {
    /// Correlation id of this request.
    pub fn id(&self) -> CallId {
        match self {
            Self::Render { id, .. }
            | Self::Build { id }
            | Self::SetClientEntries { id, .. }
            | Self::GetCustomModules { id }
            | Self::Shutdown { id } => *id,
        }
    }

    /// Discriminator of this request.
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Render { .. } => RequestKind::Render,
            Self::Build { .. } => RequestKind::Build,
            Self::SetClientEntries { .. } => RequestKind::SetClientEntries,
            Self::GetCustomModules { .. } => RequestKind::GetCustomModules,
            Self::Shutdown { .. } => RequestKind::Shutdown,
        }
    }
}

/// Request discriminator, used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Render,
    Build,
    SetClientEntries,
    GetCustomModules,
    Shutdown,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Render => write!(f, "render"),
            Self::Build => write!(f, "build"),
            Self::SetClientEntries => write!(f, "setClientEntries"),
            Self::GetCustomModules => write!(f, "getCustomModules"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Message sent from the rendering context back to the host.
///
/// Responses carry the id of the call they belong to; the `full-reload`
/// broadcast carries none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    #[serde(rename = "chunk")]
    Chunk {
        id: CallId,
        bytes: Vec<u8>,
        offset: usize,
        length: usize,
    },
    #[serde(rename = "end")]
    End { id: CallId },
    #[serde(rename = "error")]
    Error { id: CallId, error: SerializedError },
    #[serde(rename = "full-reload")]
    FullReload,
}

impl WorkerEvent {
    /// A chunk frame covering the whole buffer.
    pub fn chunk(id: CallId, bytes: Vec<u8>) -> Self {
        let length = bytes.len();
        Self::Chunk {
            id,
            bytes,
            offset: 0,
            length,
        }
    }

    /// Correlation id, `None` for broadcasts.
    pub fn id(&self) -> Option<CallId> {
        match self {
            Self::Chunk { id, .. } | Self::End { id } | Self::Error { id, .. } => Some(*id),
            Self::FullReload => None,
        }
    }

    /// Whether this frame finalizes its call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_request_wire_shape() {
        let req = WorkerRequest::SetClientEntries {
            id: 7,
            input: ClientEntriesSource::LoadDefault,
        };
        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["type"], "setClientEntries");
        assert_eq!(json["id"], 7);
        assert_eq!(json["input"], "load-default");
        assert_eq!(req.kind(), RequestKind::SetClientEntries);
    }

    #[test]
    fn test_event_wire_shape() {
        let reload = serde_json::to_value(WorkerEvent::FullReload).unwrap();
        assert_eq!(reload, serde_json::json!({ "type": "full-reload" }));

        let err = WorkerEvent::Error {
            id: 3,
            error: SerializedError::new(ErrorKind::Render, "boom"),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["message"], "boom");
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let chunk = WorkerEvent::chunk(1, b"<html>".to_vec());
        let text = serde_json::to_string(&chunk).unwrap();
        let back: WorkerEvent = serde_json::from_str(&text).unwrap();

        assert_eq!(back, chunk);
        assert_eq!(back.id(), Some(1));
        assert!(!back.is_terminal());
    }

    #[test]
    fn test_terminal_frames() {
        assert!(WorkerEvent::End { id: 1 }.is_terminal());
        assert!(!WorkerEvent::FullReload.is_terminal());
        assert_eq!(WorkerEvent::FullReload.id(), None);
    }
}
