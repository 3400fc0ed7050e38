//! Core domain types shared across the agent.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use mote_link::InboundMessage;

// ── Device lifecycle states ──────────────────────────────────────────

/// Top-level device state, owned by the lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceState {
    Booting,
    Connecting,
    Operating,
    /// A critical component (connectivity, or a quorum of sensors) is
    /// unhealthy; recovers back to `Operating` on its own.
    Degraded,
    /// Terminal for the process lifetime; the external supervisor takes
    /// over from here.
    Restarting,
    /// Fatal error with auto-restart disabled: publish-only, no
    /// recovery action.
    AwaitingIntervention,
}

// ── Sensor health ────────────────────────────────────────────────────

/// Per-unit health derived from consecutive operation failures,
/// independent of connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Health {
    Ok,
    Degraded,
    Failed,
}

// ── Error records ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// One error event flowing into the reporter. Transient — consumed and
/// optionally forwarded, never persisted by the core.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Component that produced the record (`"link"`, `"router"`,
    /// `"sensor:<id>"`, ...).
    pub source: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(source: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, Severity::Warning, message)
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, Severity::Error, message)
    }

    pub fn fatal(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, Severity::Fatal, message)
    }
}

// ── Messages ─────────────────────────────────────────────────────────

/// A (channel, payload) pair flowing in either direction. The payload
/// is opaque bytes; structural decoding happens at the route boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl From<InboundMessage> for Message {
    fn from(inbound: InboundMessage) -> Self {
        Self {
            channel: inbound.topic,
            payload: inbound.payload,
        }
    }
}

// ── Samples ──────────────────────────────────────────────────────────

/// One poll result: a value per `read` capability plus the read time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSet {
    #[serde(flatten)]
    pub values: IndexMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl SampleSet {
    pub fn new(values: IndexMap<String, serde_json::Value>) -> Self {
        Self {
            values,
            timestamp: Utc::now(),
        }
    }
}

// ── Parameter values ─────────────────────────────────────────────────

/// Parameter maps are ordered (configuration order) and JSON-valued —
/// values cross straight into message payloads.
pub type ParameterMap = IndexMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn severity_orders_by_escalation() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);
    }

    #[test]
    fn states_render_snake_case() {
        assert_eq!(DeviceState::AwaitingIntervention.to_string(), "awaiting_intervention");
        assert_eq!(Health::Ok.to_string(), "ok");
        assert_eq!(Severity::Fatal.to_string(), "fatal");
    }

    #[test]
    fn sample_set_serializes_flat() {
        let mut values = IndexMap::new();
        values.insert("temperature".to_string(), serde_json::json!(21.5));
        let sample = SampleSet::new(values);

        let json = serde_json::to_value(&sample).expect("serialize");
        assert_eq!(json["temperature"], 21.5);
        assert!(json["timestamp"].is_string());
    }
}
