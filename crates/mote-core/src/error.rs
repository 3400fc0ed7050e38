// ── Core error types ──
//
// Device-level errors from mote-core. Consumers never see raw transport
// failures directly; the `From<mote_link::Error>` impl translates the
// link layer into domain-appropriate variants, and `severity()` decides
// how each variant enters the error reporter.

use thiserror::Error;

use crate::model::Severity;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connectivity ────────────────────────────────────────────────
    #[error("Not connected")]
    NotConnected,

    #[error("Link error: {0}")]
    Link(#[from] mote_link::Error),

    // ── Routing ─────────────────────────────────────────────────────
    /// Inbound message on a channel with no registered handler.
    /// Dropped and logged, never fatal.
    #[error("unroutable_message: no handler for channel '{channel}'")]
    UnroutableMessage { channel: String },

    /// Payload on a known channel failed structural decoding.
    #[error("Malformed payload on '{channel}': {reason}")]
    MalformedPayload { channel: String, reason: String },

    // ── Registry ────────────────────────────────────────────────────
    #[error("Unknown sensor type '{type_tag}' for '{id}'")]
    UnknownSensorType { id: String, type_tag: String },

    #[error("Sensor not found: {id}")]
    SensorNotFound { id: String },

    #[error("Driver construction failed for '{id}': {message}")]
    DriverConstruction { id: String, message: String },

    #[error("Read failed for '{id}': {cause}")]
    ReadError { id: String, cause: String },

    /// Parameter rejected: not in the descriptor's editable set.
    #[error("Parameter '{key}' of '{id}' is not editable")]
    NotEditable { id: String, key: String },

    /// Control op rejected: not in the descriptor's control set.
    #[error("Operation '{op}' is not permitted on '{id}'")]
    NotPermitted { id: String, op: String },

    /// A permitted driver operation failed in the driver itself.
    #[error("Driver op '{op}' failed for '{id}': {cause}")]
    DriverOp { id: String, op: String, cause: String },

    /// A descriptor declared a capability its driver does not accept.
    #[error("Invalid descriptor for '{id}': {reason}")]
    InvalidDescriptor { id: String, reason: String },

    // ── Configuration ───────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// Severity with which this error enters the reporter.
    pub fn severity(&self) -> Severity {
        match self {
            // Retry exhaustion is the terminal connectivity escalation;
            // everything else on the link is retried per policy.
            Self::Link(e) if e.is_terminal() => Severity::Fatal,
            Self::Link(_) | Self::NotConnected => Severity::Warning,

            Self::UnroutableMessage { .. }
            | Self::MalformedPayload { .. }
            | Self::ReadError { .. }
            | Self::NotEditable { .. }
            | Self::NotPermitted { .. }
            | Self::DriverOp { .. }
            | Self::SensorNotFound { .. } => Severity::Error,

            Self::UnknownSensorType { .. }
            | Self::DriverConstruction { .. }
            | Self::InvalidDescriptor { .. } => Severity::Error,

            // Malformed configuration is fatal at boot.
            Self::Config { .. } => Severity::Fatal,
        }
    }

    /// Returns `true` if this failure can be retried once the link or
    /// session recovers.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::Link(e) => e.is_transient(),
            _ => false,
        }
    }
}
