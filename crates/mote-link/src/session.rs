//! Broker session on top of an established link.
//!
//! Owns the one session to the message broker. All publishes in the
//! process funnel through this object (single-writer), and inbound
//! messages are pulled one at a time so dispatch stays in arrival
//! order. Operations fail with [`Error::NotConnected`] when no session
//! is up; mid-session transport failures mark the session disconnected
//! so the lifecycle controller can drive a reconnect.

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::transport::{BrokerTransport, Endpoint, InboundMessage, SessionOptions};

pub struct BrokerSession<T: BrokerTransport> {
    transport: T,
    endpoint: Endpoint,
    options: SessionOptions,
    connected: bool,
}

impl<T: BrokerTransport> BrokerSession<T> {
    pub fn new(transport: T, endpoint: Endpoint, options: SessionOptions) -> Self {
        Self {
            transport,
            endpoint,
            options,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open the session. Safe to call again after a drop; the transport
    /// performs a fresh handshake.
    pub async fn connect(&mut self) -> Result<(), Error> {
        info!(endpoint = %self.endpoint, client_id = %self.options.client_id, "broker: connecting");

        self.transport
            .connect(&self.endpoint, &self.options)
            .await
            .map_err(|e| Error::BrokerConnect {
                message: e.to_string(),
            })?;

        self.connected = true;
        info!("broker: connected");
        Ok(())
    }

    /// Publish a payload. Best-effort fire-and-forget beyond the
    /// transport's own QoS.
    pub async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        debug!(topic, len = payload.len(), retain, "broker: publish");
        match self.transport.publish(topic, payload, retain).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(topic, error = %e, "broker: publish failed, session marked down");
                self.connected = false;
                Err(Error::Broker {
                    message: e.to_string(),
                })
            }
        }
    }

    pub async fn subscribe(&mut self, topic: &str) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        debug!(topic, "broker: subscribe");
        match self.transport.subscribe(topic).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.connected = false;
                Err(Error::Broker {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Non-blocking inbound check; at most one message per call.
    pub async fn poll(&mut self) -> Result<Option<InboundMessage>, Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        match self.transport.poll().await {
            Ok(message) => Ok(message),
            Err(e) => {
                warn!(error = %e, "broker: poll failed, session marked down");
                self.connected = false;
                Err(Error::Broker {
                    message: e.to_string(),
                })
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if self.connected {
            self.transport.disconnect().await;
            self.connected = false;
            info!("broker: disconnected");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
