//! In-memory transports for tests and simulation runs.
//!
//! `SimLink` and `SimBroker` are scriptable stand-ins for the hardware
//! network stack and the broker wire protocol. Both hand out cheap
//! clones sharing one inner state, so a test can keep a handle while
//! the agent owns "the transport". `LogBroker` turns every publish into
//! a log line — useful for running the agent without any broker at all.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use tracing::info;

use crate::transport::{
    BrokerTransport, Endpoint, InboundMessage, LinkTransport, SessionOptions,
};

// ── SimLink ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimLinkInner {
    up: bool,
    associate_calls: u32,
    fail_next: u32,
}

/// Scriptable link transport. `fail_next_associations(n)` makes the
/// next `n` association attempts fail; `drop_link()` simulates a loss
/// the maintenance check will notice.
#[derive(Debug, Clone, Default)]
pub struct SimLink {
    inner: Arc<Mutex<SimLinkInner>>,
}

impl SimLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_associations(&self, count: u32) {
        self.lock().fail_next = count;
    }

    pub fn drop_link(&self) {
        self.lock().up = false;
    }

    pub fn associate_calls(&self) -> u32 {
        self.lock().associate_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimLinkInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl LinkTransport for SimLink {
    type Err = String;

    async fn associate(&mut self, _ssid: &str, _password: &SecretString) -> Result<(), Self::Err> {
        let mut inner = self.lock();
        inner.associate_calls += 1;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err("no response from access point".into());
        }
        inner.up = true;
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.lock().up
    }

    async fn disassociate(&mut self) {
        self.lock().up = false;
    }
}

// ── SimBroker ────────────────────────────────────────────────────────

/// A publish captured by [`SimBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct SimBrokerInner {
    connected: bool,
    fail_next_connects: u32,
    fail_publishes: bool,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<String>,
    inbound: VecDeque<InboundMessage>,
    last_will: Option<(String, Vec<u8>)>,
}

/// Scriptable broker transport backed by in-memory queues.
#[derive(Debug, Clone, Default)]
pub struct SimBroker {
    inner: Arc<Mutex<SimBrokerInner>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for the agent to receive on its next poll.
    pub fn push_inbound(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.lock().inbound.push_back(InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.lock().fail_next_connects = count;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Simulate the broker dropping the session from its side.
    pub fn drop_session(&self) {
        self.lock().connected = false;
    }

    /// All publishes captured so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Drain captured publishes.
    pub fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut self.lock().published)
    }

    /// Publishes captured for one topic, payloads only.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    /// The last-will registered at session setup, if any.
    pub fn last_will(&self) -> Option<(String, Vec<u8>)> {
        self.lock().last_will.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimBrokerInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl BrokerTransport for SimBroker {
    type Err = String;

    async fn connect(
        &mut self,
        _endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<(), Self::Err> {
        let mut inner = self.lock();
        if inner.fail_next_connects > 0 {
            inner.fail_next_connects -= 1;
            return Err("connection refused".into());
        }
        inner.connected = true;
        inner.last_will = options
            .last_will
            .as_ref()
            .map(|w| (w.topic.clone(), w.payload.clone()));
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), Self::Err> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err("session closed".into());
        }
        if inner.fail_publishes {
            return Err("publish rejected".into());
        }
        inner.published.push(PublishedMessage {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Err> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err("session closed".into());
        }
        inner.subscriptions.push(topic.to_owned());
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, Self::Err> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err("session closed".into());
        }
        Ok(inner.inbound.pop_front())
    }

    async fn disconnect(&mut self) {
        self.lock().connected = false;
    }
}

// ── LogBroker ────────────────────────────────────────────────────────

/// Log-only broker transport: publishes become log lines, nothing is
/// ever received. Lets the agent run end-to-end without a broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogBroker;

impl BrokerTransport for LogBroker {
    type Err = Infallible;

    async fn connect(
        &mut self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<(), Self::Err> {
        info!(endpoint = %endpoint, client_id = %options.client_id, "broker(LOG): session opened");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), Self::Err> {
        info!(
            topic,
            len = payload.len(),
            retain,
            payload = %String::from_utf8_lossy(payload),
            "broker(LOG): publish"
        );
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Err> {
        info!(topic, "broker(LOG): subscribe");
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, Self::Err> {
        Ok(None)
    }

    async fn disconnect(&mut self) {
        info!("broker(LOG): session closed");
    }
}
