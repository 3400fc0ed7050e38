//! Link lifecycle with bounded-retry reconnect.
//!
//! `Disconnected → Connecting → Connected`; on link loss
//! `Connected → Reconnecting`; on exhausting the retry budget
//! `Reconnecting → Failed`, which is terminal until an external restart.
//! The current state lives in a [`tokio::sync::watch`] channel so the
//! lifecycle controller can observe transitions without mutating them.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Error;
use crate::transport::LinkTransport;

// ── ConnectionState ──────────────────────────────────────────────────

/// Link state observable by consumers. Owned exclusively by
/// [`LinkManager`]; everything else holds a read-only receiver.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

// ── Reconnect policy ─────────────────────────────────────────────────

/// What to do when the retry budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureAction {
    /// Full process restart via the external restart primitive.
    Restart,
    /// Power the node down.
    Shutdown,
    /// Keep running without the network. Telemetry is lost until the
    /// link recovers on its own.
    Continue,
}

/// Bounded-retry reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay between attempts.
    pub interval: Duration,
    /// Attempt budget per connect/reconnect episode.
    pub max_retries: u32,
    /// Escalation once the budget is exhausted.
    pub failure_action: FailureAction,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_retries: 10,
            failure_action: FailureAction::Restart,
        }
    }
}

/// Network credentials, loaded once at boot.
#[derive(Debug, Clone)]
pub struct LinkCredentials {
    pub ssid: String,
    pub password: SecretString,
}

// ── LinkManager ──────────────────────────────────────────────────────

/// Owns the link lifecycle for the underlying network transport.
///
/// Leaf dependency for everything that needs the network: the broker
/// session rides on top, and the lifecycle controller observes
/// [`ConnectionState`] through [`LinkManager::state`].
pub struct LinkManager<T: LinkTransport> {
    transport: T,
    credentials: LinkCredentials,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    // Per-attempt failure messages from the most recent episode,
    // drained by the caller into Warning-severity error records.
    attempt_warnings: Vec<String>,
}

impl<T: LinkTransport> LinkManager<T> {
    pub fn new(transport: T, credentials: LinkCredentials, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            credentials,
            policy,
            state,
            attempt_warnings: Vec::new(),
        }
    }

    /// Subscribe to connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Current state snapshot.
    pub fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Drain the per-attempt failure messages accumulated by the most
    /// recent connect episode.
    pub fn take_attempt_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.attempt_warnings)
    }

    /// Access the transport (tests and teardown).
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Run one connect episode: up to `max_retries` association
    /// attempts, `interval` apart.
    ///
    /// On success the state becomes `Connected`. On exhaustion the state
    /// becomes `Failed` and the returned [`Error::RetriesExhausted`]
    /// carries the configured [`FailureAction`] — the caller executes it
    /// exactly once; this manager never retries past the budget.
    pub async fn connect(&mut self) -> Result<(), Error> {
        let reconnecting = matches!(
            *self.state.borrow(),
            ConnectionState::Connected | ConnectionState::Reconnecting { .. }
        );
        if !reconnecting {
            let _ = self.state.send_replace(ConnectionState::Connecting);
        }

        let max = self.policy.max_retries.max(1);
        for attempt in 1..=max {
            match self
                .transport
                .associate(&self.credentials.ssid, &self.credentials.password)
                .await
            {
                Ok(()) => {
                    info!(ssid = %self.credentials.ssid, attempt, "link associated");
                    let _ = self.state.send_replace(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(attempt, max_retries = max, error = %message, "association attempt failed");
                    self.attempt_warnings.push(format!(
                        "association attempt {attempt}/{max} failed: {message}"
                    ));

                    if attempt < max {
                        let _ = self.state.send_replace(ConnectionState::Reconnecting { attempt });
                        tokio::time::sleep(self.policy.interval).await;
                    }
                }
            }
        }

        let _ = self.state.send_replace(ConnectionState::Failed);
        Err(Error::RetriesExhausted {
            attempts: max,
            action: self.policy.failure_action,
        })
    }

    /// Link-loss notification from the transport or the maintenance
    /// check. Moves `Connected → Reconnecting` and resets the retry
    /// counter; a loss that fires while a reconnect is pending simply
    /// supersedes it (there is no concurrent attempt to cancel).
    pub fn on_link_lost(&mut self) {
        if *self.state.borrow() == ConnectionState::Connected {
            warn!("link lost, entering reconnect");
        }
        let _ = self.state.send_replace(ConnectionState::Reconnecting { attempt: 0 });
    }

    /// Per-cycle connectivity check. If the transport reports the link
    /// down while we believe we are connected, runs a full reconnect
    /// episode. Returns `true` when a reconnect happened.
    pub async fn maintain(&mut self) -> Result<bool, Error> {
        if *self.state.borrow() == ConnectionState::Connected && !self.transport.is_up() {
            self.on_link_lost();
            self.connect().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Tear the link down and return to `Disconnected`.
    pub async fn disconnect(&mut self) {
        self.transport.disassociate().await;
        let _ = self.state.send_replace(ConnectionState::Disconnected);
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimLink;
    use pretty_assertions::assert_eq;

    fn manager(link: SimLink, max_retries: u32) -> LinkManager<SimLink> {
        LinkManager::new(
            link,
            LinkCredentials {
                ssid: "testnet".into(),
                password: SecretString::from("hunter2".to_string()),
            },
            ReconnectPolicy {
                interval: Duration::from_secs(5),
                max_retries,
                failure_action: FailureAction::Restart,
            },
        )
    }

    #[tokio::test]
    async fn connect_success_first_attempt() {
        let link = SimLink::new();
        let mut mgr = manager(link.clone(), 3);

        mgr.connect().await.expect("connect should succeed");

        assert_eq!(mgr.current_state(), ConnectionState::Connected);
        assert_eq!(link.associate_calls(), 1);
        assert!(mgr.take_attempt_warnings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_then_succeeds() {
        let link = SimLink::new();
        link.fail_next_associations(2);
        let mut mgr = manager(link.clone(), 5);

        mgr.connect().await.expect("third attempt should succeed");

        assert_eq!(mgr.current_state(), ConnectionState::Connected);
        assert_eq!(link.associate_calls(), 3);
        assert_eq!(mgr.take_attempt_warnings().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_terminal_and_carries_action() {
        let link = SimLink::new();
        link.fail_next_associations(u32::MAX);
        let mut mgr = manager(link.clone(), 3);

        let err = mgr.connect().await.expect_err("must exhaust retries");

        assert!(matches!(
            err,
            Error::RetriesExhausted {
                attempts: 3,
                action: FailureAction::Restart
            }
        ));
        assert!(err.is_terminal());
        assert_eq!(mgr.current_state(), ConnectionState::Failed);
        // Exactly max_retries attempts, never more.
        assert_eq!(link.associate_calls(), 3);
        assert_eq!(mgr.take_attempt_warnings().len(), 3);
    }

    #[tokio::test]
    async fn link_loss_resets_counter_and_supersedes() {
        let link = SimLink::new();
        let mut mgr = manager(link.clone(), 3);
        mgr.connect().await.expect("connect");

        mgr.on_link_lost();
        assert_eq!(
            mgr.current_state(),
            ConnectionState::Reconnecting { attempt: 0 }
        );

        // A second loss while reconnect is pending is absorbed.
        mgr.on_link_lost();
        assert_eq!(
            mgr.current_state(),
            ConnectionState::Reconnecting { attempt: 0 }
        );
    }

    #[tokio::test]
    async fn maintain_reconnects_when_link_drops() {
        let link = SimLink::new();
        let mut mgr = manager(link.clone(), 3);
        mgr.connect().await.expect("connect");

        link.drop_link();
        let reconnected = mgr.maintain().await.expect("maintain should reconnect");

        assert!(reconnected);
        assert_eq!(mgr.current_state(), ConnectionState::Connected);
        assert_eq!(link.associate_calls(), 2);
    }

    #[tokio::test]
    async fn maintain_is_noop_while_connected() {
        let link = SimLink::new();
        let mut mgr = manager(link.clone(), 3);
        mgr.connect().await.expect("connect");

        let reconnected = mgr.maintain().await.expect("maintain");
        assert!(!reconnected);
        assert_eq!(link.associate_calls(), 1);
    }
}
