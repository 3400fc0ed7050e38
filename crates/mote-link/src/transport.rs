//! Transport seams for the link and broker layers.
//!
//! The physical network stack and the broker wire protocol are external
//! collaborators. These traits are the narrow interface the rest of the
//! agent consumes; [`crate::sim`] provides in-memory implementations
//! for tests and simulation runs.

use std::fmt::Display;

use secrecy::SecretString;

// ── Link transport ───────────────────────────────────────────────────

/// The network hardware stack (station interface).
///
/// `associate` performs the full join (auth + address assignment) and
/// returns once the link is usable. `is_up` is a cheap status read the
/// maintenance cycle calls every tick.
#[allow(async_fn_in_trait)]
pub trait LinkTransport {
    type Err: Display;

    /// Join the configured network. Returns when the link is usable.
    async fn associate(&mut self, ssid: &str, password: &SecretString) -> Result<(), Self::Err>;

    /// Current link status as reported by the hardware.
    fn is_up(&self) -> bool;

    /// Tear the link down.
    async fn disassociate(&mut self);
}

// ── Broker transport ─────────────────────────────────────────────────

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            server: server.into(),
            port,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.server, self.port)
    }
}

/// Last-will message registered at session setup; the broker publishes
/// it on our behalf if the session drops uncleanly.
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Session handshake parameters.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub username: String,
    pub password: SecretString,
    pub keep_alive_secs: u16,
    pub last_will: Option<LastWill>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            username: String::new(),
            password: SecretString::from(String::new()),
            keep_alive_secs: 60,
            last_will: None,
        }
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The broker wire protocol (packet encode/decode, QoS, keep-alive).
///
/// Publish is best-effort fire-and-forget beyond the transport's own
/// QoS handling. `poll` is the non-blocking inbound check the single
/// task loop calls each cycle; it returns at most one message so
/// dispatch stays in arrival order.
#[allow(async_fn_in_trait)]
pub trait BrokerTransport {
    type Err: Display;

    /// Open a session with the broker.
    async fn connect(&mut self, endpoint: &Endpoint, options: &SessionOptions)
    -> Result<(), Self::Err>;

    /// Publish a binary payload to `topic`.
    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool)
    -> Result<(), Self::Err>;

    /// Register interest in `topic`.
    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Err>;

    /// Fetch the next pending inbound message, if any.
    async fn poll(&mut self) -> Result<Option<InboundMessage>, Self::Err>;

    /// Close the session.
    async fn disconnect(&mut self);
}
