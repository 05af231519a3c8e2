//! Build output descriptions consumed by the entry mapper.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths::{normalize_path, same_file};

/// One named output unit of a bundle build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputUnit {
    /// Emitted asset file, relative to the build's output directory.
    pub file_name: String,

    /// Unit name assigned by the bundler.
    pub name: String,

    /// Source module the unit was generated for, if it is an entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facade_module_id: Option<String>,

    /// Every source module included in the unit.
    #[serde(default)]
    pub module_ids: Vec<String>,
}

impl OutputUnit {
    /// Create a unit with no modules.
    pub fn new(name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the facade module.
    pub fn with_facade(mut self, source: impl Into<String>) -> Self {
        self.facade_module_id = Some(source.into());
        self
    }

    /// Add an included source module.
    pub fn with_module(mut self, source: impl Into<String>) -> Self {
        self.module_ids.push(source.into());
        self
    }

    /// Whether `source` is among the included modules.
    pub fn includes(&self, source: &str) -> bool {
        let wanted = normalize_path(source);
        self.module_ids.iter().any(|m| normalize_path(m) == wanted)
    }

    /// Whether the unit was generated for `source`.
    pub fn is_facade_of(&self, source: &str) -> bool {
        self.facade_module_id
            .as_deref()
            .is_some_and(|facade| same_file(facade, source))
    }
}

/// All output units of one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub units: Vec<OutputUnit>,
}

impl BuildOutput {
    /// Create an output from units.
    pub fn new(units: Vec<OutputUnit>) -> Self {
        Self { units }
    }

    /// Load a build description written as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read build output: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse build output: {}", path.display()))
    }

    /// First unit that includes `source`.
    pub fn unit_including(&self, source: &str) -> Option<&OutputUnit> {
        self.units.iter().find(|unit| unit.includes(source))
    }

    /// Unit generated exactly for `source`.
    pub fn unit_for_facade(&self, source: &str) -> Option<&OutputUnit> {
        self.units.iter().find(|unit| unit.is_facade_of(source))
    }
}
