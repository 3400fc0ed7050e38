// mote-link: the wire-facing layer of the mote agent.
//
// Owns the network link lifecycle (association, reconnect, backoff) and
// the session to the message broker. Everything above this crate talks
// to the network exclusively through `LinkManager` and `BrokerSession`;
// the actual hardware stack and wire protocol live behind the
// `LinkTransport` / `BrokerTransport` traits.

pub mod error;
pub mod link;
pub mod session;
pub mod sim;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use error::Error;
pub use link::{ConnectionState, FailureAction, LinkCredentials, LinkManager, ReconnectPolicy};
pub use session::BrokerSession;
pub use sim::{LogBroker, PublishedMessage, SimBroker, SimLink};
pub use transport::{
    BrokerTransport, Endpoint, InboundMessage, LastWill, LinkTransport, SessionOptions,
};
