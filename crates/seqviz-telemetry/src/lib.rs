#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use seqviz_core::{DateTimeUtc, Payload, Step};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryStatus {
    Success,
    Error,
}

impl TelemetryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One step transition as seen by an external logging collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub source: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    pub status: TelemetryStatus,
    pub recorded_at: DateTimeUtc,
}

impl TelemetryEvent {
    #[must_use]
    pub fn from_step(step: &Step, status: TelemetryStatus) -> Self {
        Self {
            source: step.source.clone(),
            action: step.action.clone(),
            payload: step.payload.clone(),
            status,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }

    /// Replace the authored payload with what was observed at execution time.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Fire-and-forget destination for [`TelemetryEvent`]s.
///
/// Implementations report delivery problems as `Err`; callers are expected to
/// log and drop them.
pub trait TelemetrySink: Send + Sync {
    fn sink_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn record(&self, event: &TelemetryEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn sink_name(&self) -> &'static str {
        "null"
    }

    fn record(&self, _event: &TelemetryEvent) -> Result<()> {
        Ok(())
    }
}

/// Writes each event as a structured `tracing` record under `seqviz::telemetry`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn sink_name(&self) -> &'static str {
        "tracing"
    }

    fn record(&self, event: &TelemetryEvent) -> Result<()> {
        let payload = match &event.payload {
            Some(payload) if !payload.is_empty() => serde_json::to_string(payload)?,
            _ => String::new(),
        };
        match event.status {
            TelemetryStatus::Success => tracing::info!(
                target: "seqviz::telemetry",
                source = %event.source,
                action = %event.action,
                payload = %payload,
                "⚡ {}",
                event.action
            ),
            TelemetryStatus::Error => tracing::warn!(
                target: "seqviz::telemetry",
                source = %event.source,
                action = %event.action,
                payload = %payload,
                "❌ {}",
                event.action
            ),
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpTelemetrySink {
    url: String,
    agent: ureq::Agent,
}

impl HttpTelemetrySink {
    /// Build a sink for `url` with a per-request timeout.
    ///
    /// # Errors
    /// Returns an error when `url` is not an absolute http(s) URL.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!(
                "telemetry url must start with http:// or https://, got '{url}'"
            ));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            url: url.to_string(),
            agent,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TelemetrySink for HttpTelemetrySink {
    fn sink_name(&self) -> &'static str {
        "http_json"
    }

    fn record(&self, event: &TelemetryEvent) -> Result<()> {
        let body = serde_json::to_value(event)?;
        match self
            .agent
            .post(&self.url)
            .set("content-type", "application/json")
            .send_json(body)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_json::<Value>().unwrap_or(Value::Null);
                Err(anyhow!("telemetry collector returned http status {code}: {body}"))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(anyhow!("telemetry transport failure: {err}"))
            }
        }
    }
}

/// Keeps every event in memory; can be switched into a failing mode to model
/// an unreachable collector.
#[derive(Debug, Default)]
pub struct RecordingTelemetrySink {
    events: Mutex<Vec<TelemetryEvent>>,
    unavailable: bool,
}

impl RecordingTelemetrySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            unavailable: true,
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }
}

impl TelemetrySink for RecordingTelemetrySink {
    fn sink_name(&self) -> &'static str {
        "recording"
    }

    fn record(&self, event: &TelemetryEvent) -> Result<()> {
        if self.unavailable {
            return Err(anyhow!("telemetry collector unreachable"));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}
