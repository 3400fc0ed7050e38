use thiserror::Error;

use crate::link::FailureAction;

/// Top-level error type for the `mote-link` crate.
///
/// Covers the link layer (association, reconnect policy) and the broker
/// session. `mote-core` maps these into device-level error records.
#[derive(Debug, Error)]
pub enum Error {
    // ── Link layer ──────────────────────────────────────────────────
    /// A single association attempt failed (wrong credentials, no AP in
    /// range, DHCP failure, etc.). Retried per policy.
    #[error("Link association failed: {message}")]
    Association { message: String },

    /// The transport reported the link down while a session was active.
    #[error("Network link lost")]
    LinkDown,

    /// The reconnect policy ran out of attempts. Terminal until an
    /// external restart; carries the configured escalation.
    #[error("Link retries exhausted after {attempts} attempts (action: {action})")]
    RetriesExhausted {
        attempts: u32,
        action: FailureAction,
    },

    // ── Broker session ──────────────────────────────────────────────
    /// An operation requires a connected session and there is none.
    #[error("Not connected to broker")]
    NotConnected,

    /// The broker session handshake failed.
    #[error("Broker connect failed: {message}")]
    BrokerConnect { message: String },

    /// A publish, subscribe, or poll operation failed mid-session.
    /// The session is marked disconnected when this is returned.
    #[error("Broker session error: {message}")]
    Broker { message: String },
}

impl Error {
    /// Returns `true` if this is a transient failure worth retrying
    /// once connectivity is (re)established.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Association { .. }
            | Self::LinkDown
            | Self::NotConnected
            | Self::BrokerConnect { .. }
            | Self::Broker { .. } => true,
            Self::RetriesExhausted { .. } => false,
        }
    }

    /// Returns `true` for the terminal retry-exhaustion escalation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}
