//! Transport configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration file for the flight transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightConfig {
    /// Host-side channel configuration.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Client-side configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Build artifact configuration.
    #[serde(default)]
    pub manifest: ManifestConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl FlightConfig {
    /// Load config from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        if is_json(path) {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
        }
    }

    /// Save config to a file, format chosen by extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            toml::to_string_pretty(self)?
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Host-side channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Per-call watchdog in milliseconds: the longest a call may go without
    /// a frame from the rendering context. `0` disables it.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Chunks buffered ahead of a streaming call's consumer. Past that,
    /// later chunks queue on the host for that call alone.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Requests queued towards the rendering context.
    #[serde(default = "default_request_buffer")]
    pub request_buffer: usize,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_stream_buffer() -> usize {
    64
}

fn default_request_buffer() -> usize {
    128
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            stream_buffer: default_stream_buffer(),
            request_buffer: default_request_buffer(),
        }
    }
}

impl ChannelConfig {
    /// The watchdog duration, if enabled.
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    /// Set the watchdog duration.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-call frame buffer.
    pub fn with_stream_buffer(mut self, frames: usize) -> Self {
        self.stream_buffer = frames.max(1);
        self
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base path of the flight endpoint.
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

fn default_base_path() -> String {
    "/rw-rsc".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
        }
    }
}

/// Build artifact configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Generated module the entry tables are appended to.
    #[serde(default = "default_manifest_output")]
    pub output: PathBuf,
}

fn default_manifest_output() -> PathBuf {
    PathBuf::from("dist/rsc/entries.mjs")
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            output: default_manifest_output(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether payloads are reported.
    #[serde(default)]
    pub enabled: bool,

    /// Observability endpoint receiving reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Endpoint to report to, if telemetry is on.
    pub fn active_endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().filter(|_| self.enabled)
    }
}
