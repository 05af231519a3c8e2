//! Identity of a rendering request.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlightError;
use crate::multipart::ActionArg;

/// Cache identity of a rendering request.
///
/// Keyed by the pair of component id and serialized props. Two components
/// that happen to serialize identical props must never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlightKey {
    /// Component identifier.
    pub component_id: String,
    /// Props exactly as serialized by the caller.
    pub props: String,
}

impl FlightKey {
    /// Create a key from a component id and its serialized props.
    pub fn new(component_id: impl Into<String>, props: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            props: props.into(),
        }
    }

    /// Parse the serialized props.
    pub fn props_value(&self) -> Result<Value, FlightError> {
        if self.props.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&self.props)
            .map_err(|e| FlightError::InvalidRequest(format!("props are not valid JSON: {}", e)))
    }
}

impl fmt::Display for FlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?{}", self.component_id, self.props)
    }
}

/// Input of a `render` call on the rendering context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderInput {
    /// Component to render.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    /// Props for the component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Value>,
    /// Server action to invoke before rendering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// Decoded action arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ActionArg>,
}

impl RenderInput {
    /// Input rendering a component.
    pub fn component(component_id: impl Into<String>, props: Value) -> Self {
        Self {
            component_id: Some(component_id.into()),
            props: Some(props),
            ..Default::default()
        }
    }

    /// Input rendering the component a key identifies.
    pub fn for_key(key: &FlightKey) -> Result<Self, FlightError> {
        Ok(Self::component(key.component_id.clone(), key.props_value()?))
    }

    /// Input invoking a server action.
    pub fn action(action_id: impl Into<String>, args: Vec<ActionArg>) -> Self {
        Self {
            action_id: Some(action_id.into()),
            args,
            ..Default::default()
        }
    }

    /// Attach the component to re-render after the action.
    pub fn with_component(mut self, component_id: impl Into<String>, props: Value) -> Self {
        self.component_id = Some(component_id.into());
        self.props = Some(props);
        self
    }

    /// Whether this input invokes a server action.
    pub fn is_action(&self) -> bool {
        self.action_id.is_some()
    }
}
