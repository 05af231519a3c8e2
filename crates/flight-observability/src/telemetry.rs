//! Optional reporting of finished payloads to an observability endpoint.
//!
//! Reports are fire-and-forget: a failing sink is logged and never affects
//! the response it describes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Encoding tag written into every report.
pub const PAYLOAD_ENCODING: &str = "base64";

/// Body posted to the observability endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub flight: FlightTelemetry,
}

/// Encoded payload and request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightTelemetry {
    /// The streamed payload, base64.
    pub encoded_payload: String,
    /// How the two encoded fields are encoded.
    pub encoding: String,
    /// JSON metadata about the request, base64.
    pub encoded_metadata: String,
}

impl TelemetryReport {
    /// Build a report for a payload and its request metadata.
    pub fn new(payload: &[u8], metadata: &serde_json::Value) -> Self {
        Self {
            flight: FlightTelemetry {
                encoded_payload: STANDARD.encode(payload),
                encoding: PAYLOAD_ENCODING.to_string(),
                encoded_metadata: STANDARD.encode(metadata.to_string()),
            },
        }
    }

    /// Decode the payload bytes.
    pub fn payload(&self) -> anyhow::Result<Vec<u8>> {
        Ok(STANDARD.decode(&self.flight.encoded_payload)?)
    }

    /// Decode the metadata.
    pub fn metadata(&self) -> anyhow::Result<serde_json::Value> {
        let bytes = STANDARD.decode(&self.flight.encoded_metadata)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Receiver of telemetry reports.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver one report.
    async fn report(&self, report: TelemetryReport) -> anyhow::Result<()>;
}

/// Spawn delivery of a report, logging failures.
pub fn report_detached(sink: Arc<dyn TelemetrySink>, report: TelemetryReport) {
    tokio::spawn(async move {
        if let Err(e) = sink.report(report).await {
            tracing::warn!(error = %e, "telemetry report failed");
        }
    });
}

/// Posts reports as JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTelemetrySink {
    endpoint: String,
    timeout: Duration,
}

impl HttpTelemetrySink {
    /// Create a sink posting to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn report(&self, report: TelemetryReport) -> anyhow::Result<()> {
        let body = serde_json::to_string(&report)?;
        let endpoint = self.endpoint.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let agent = ureq::AgentBuilder::new().timeout(timeout).build();
            agent
                .post(&endpoint)
                .set("content-type", "application/json")
                .send_string(&body)
                .map_err(|e| anyhow::anyhow!("POST {endpoint}: {e}"))?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemoryTelemetrySink {
    reports: Mutex<Vec<TelemetryReport>>,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far.
    pub fn reports(&self) -> Vec<TelemetryReport> {
        self.reports
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetrySink {
    async fn report(&self, report: TelemetryReport) -> anyhow::Result<()> {
        self.reports
            .lock()
            .map_err(|_| anyhow::anyhow!("telemetry buffer poisoned"))?
            .push(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_report_shape() {
        let report = TelemetryReport::new(b"0:\"hi\"\n", &json!({"componentId": "Page"}));
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["flight"]["encoding"], "base64");
        assert_eq!(value["flight"]["encodedPayload"], "MDoiaGkiCg==");
        assert_eq!(report.payload().unwrap(), b"0:\"hi\"\n".to_vec());
        assert_eq!(report.metadata().unwrap(), json!({"componentId": "Page"}));
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = Arc::new(MemoryTelemetrySink::new());
        sink.report(TelemetryReport::new(b"x", &json!(null)))
            .await
            .unwrap();
        assert_eq!(sink.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let sink = HttpTelemetrySink::new("http://127.0.0.1:9/flight")
            .with_timeout(Duration::from_millis(200));
        let result = sink.report(TelemetryReport::new(b"x", &json!(null))).await;
        assert!(result.is_err());
    }
}
