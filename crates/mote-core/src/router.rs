//! Channel routing over the broker session.
//!
//! The router owns the session and the binding table built from
//! configuration. Inbound messages resolve to a [`Route`]; the
//! lifecycle controller decides what the route means. Outbound traffic
//! goes through the typed publish helpers, which silently skip
//! channels the configuration leaves unbound.

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use mote_link::{BrokerSession, BrokerTransport};

use crate::config::{SensorDescriptor, SensorPublishTopics, SystemPublishTopics, SystemTopics};
use crate::error::CoreError;
use crate::model::{DeviceState, ErrorRecord, Message, ParameterMap, SampleSet};
use crate::registry::UnitStatus;

// ── Routes ───────────────────────────────────────────────────────────

/// Destination of an inbound message. Payload decoding happens after
/// routing, at this boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    SystemCommand,
    SystemPowerConfig,
    SensorCommand { id: String },
    SensorConfig { id: String },
}

// ── Inbound payloads ─────────────────────────────────────────────────

/// Command envelope on a commands channel: `{"command": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandPayload {
    pub command: String,
}

/// Runtime power overrides on the system power-config channel.
/// Absent fields leave the current value in place.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct PowerConfigPayload {
    pub deep_sleep_interval: Option<u64>,
    pub watchdog_timeout: Option<u64>,
}

impl CommandPayload {
    pub fn decode(channel: &str, payload: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(payload).map_err(|e| CoreError::MalformedPayload {
            channel: channel.to_owned(),
            reason: e.to_string(),
        })
    }
}

impl PowerConfigPayload {
    pub fn decode(channel: &str, payload: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(payload).map_err(|e| CoreError::MalformedPayload {
            channel: channel.to_owned(),
            reason: e.to_string(),
        })
    }
}

/// Config channels carry a flat JSON object of parameter writes.
pub fn decode_parameter_writes(channel: &str, payload: &[u8]) -> Result<ParameterMap, CoreError> {
    serde_json::from_slice(payload).map_err(|e| CoreError::MalformedPayload {
        channel: channel.to_owned(),
        reason: e.to_string(),
    })
}

// ── Router ───────────────────────────────────────────────────────────

pub struct Router<T: BrokerTransport> {
    session: BrokerSession<T>,
    routes: IndexMap<String, Route>,
    system_publish: SystemPublishTopics,
    sensor_publish: IndexMap<String, SensorPublishTopics>,
}

impl<T: BrokerTransport> Router<T> {
    /// Build the binding table from the system topics and sensor
    /// descriptors. Binding is last-write-wins: a later descriptor
    /// claiming an already-bound channel takes it over with a warning
    /// (configuration load rejects duplicates up front, so this only
    /// fires for hand-built configs).
    pub fn from_config(
        session: BrokerSession<T>,
        system: &SystemTopics,
        sensors: &[SensorDescriptor],
    ) -> Self {
        let mut router = Self {
            session,
            routes: IndexMap::new(),
            system_publish: system.publish.clone(),
            sensor_publish: IndexMap::new(),
        };

        if let Some(topic) = &system.subscribe.commands {
            router.bind(topic, Route::SystemCommand);
        }
        if let Some(topic) = &system.subscribe.power_config {
            router.bind(topic, Route::SystemPowerConfig);
        }

        for descriptor in sensors {
            let id = &descriptor.id;
            if let Some(topic) = &descriptor.topics.subscribe.commands {
                router.bind(topic, Route::SensorCommand { id: id.clone() });
            }
            if let Some(topic) = &descriptor.topics.subscribe.config {
                router.bind(topic, Route::SensorConfig { id: id.clone() });
            }
            router
                .sensor_publish
                .insert(id.clone(), descriptor.topics.publish.clone());
        }

        router
    }

    fn bind(&mut self, topic: &str, route: Route) {
        if let Some(previous) = self.routes.insert(topic.to_owned(), route.clone()) {
            warn!(%topic, ?previous, ?route, "channel binding replaced");
        } else {
            debug!(%topic, ?route, "channel bound");
        }
    }

    pub fn session(&self) -> &BrokerSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut BrokerSession<T> {
        &mut self.session
    }

    /// Subscribe to every bound inbound channel.
    pub async fn subscribe_all(&mut self) -> Result<(), CoreError> {
        // collect to end the borrow of the route table
        let topics: Vec<String> = self.routes.keys().cloned().collect();
        for topic in topics {
            self.session.subscribe(&topic).await?;
        }
        Ok(())
    }

    /// Resolve an inbound message to its route. Unroutable messages
    /// are dropped by the caller; the error carries the channel for
    /// the reporter.
    pub fn dispatch(&self, message: &Message) -> Result<Route, CoreError> {
        match self.routes.get(&message.channel) {
            Some(route) => {
                trace!(channel = %message.channel, ?route, "message routed");
                Ok(route.clone())
            }
            None => Err(CoreError::UnroutableMessage {
                channel: message.channel.clone(),
            }),
        }
    }

    /// Drain one inbound message from the session, if any.
    pub async fn poll_inbound(&mut self) -> Result<Option<Message>, CoreError> {
        Ok(self.session.poll().await?.map(Message::from))
    }

    // ── Outbound: sensors ───────────────────────────────────────────

    pub async fn publish_sensor_data(
        &mut self,
        id: &str,
        sample: &SampleSet,
    ) -> Result<(), CoreError> {
        let Some(topic) = self.sensor_topic(id, |t| t.data.clone()) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(sample).map_err(|e| CoreError::Config {
            message: format!("sample serialization: {e}"),
        })?;
        self.session.publish(&topic, &payload, false).await?;
        Ok(())
    }

    pub async fn publish_sensor_state(
        &mut self,
        id: &str,
        state: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let Some(topic) = self.sensor_topic(id, |t| t.state.clone()) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(state).map_err(|e| CoreError::Config {
            message: format!("state serialization: {e}"),
        })?;
        // state channels are retained so late subscribers see the
        // latest value
        self.session.publish(&topic, &payload, true).await?;
        Ok(())
    }

    pub async fn publish_sensor_info(
        &mut self,
        id: &str,
        info: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let Some(topic) = self.sensor_topic(id, |t| t.info.clone()) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(info).map_err(|e| CoreError::Config {
            message: format!("info serialization: {e}"),
        })?;
        self.session.publish(&topic, &payload, true).await?;
        Ok(())
    }

    pub async fn publish_sensor_error(
        &mut self,
        id: &str,
        record: &ErrorRecord,
    ) -> Result<(), CoreError> {
        let Some(topic) = self.sensor_topic(id, |t| t.errors.clone()) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(record).map_err(|e| CoreError::Config {
            message: format!("error serialization: {e}"),
        })?;
        self.session.publish(&topic, &payload, false).await?;
        Ok(())
    }

    // ── Outbound: system ────────────────────────────────────────────

    /// Publish the aggregate device state and per-unit health summary.
    pub async fn publish_system_state(
        &mut self,
        state: DeviceState,
        sensors: &[UnitStatus],
    ) -> Result<(), CoreError> {
        let Some(topic) = self.system_publish.state.clone() else {
            return Ok(());
        };
        let body = serde_json::json!({
            "state": state,
            "sensors": sensors,
        });
        let payload = serde_json::to_vec(&body).map_err(|e| CoreError::Config {
            message: format!("state serialization: {e}"),
        })?;
        self.session.publish(&topic, &payload, true).await?;
        Ok(())
    }

    pub async fn publish_system_error(&mut self, record: &ErrorRecord) -> Result<(), CoreError> {
        let Some(topic) = self.system_publish.errors.clone() else {
            return Ok(());
        };
        let payload = serde_json::to_vec(record).map_err(|e| CoreError::Config {
            message: format!("error serialization: {e}"),
        })?;
        self.session.publish(&topic, &payload, false).await?;
        Ok(())
    }

    fn sensor_topic(
        &self,
        id: &str,
        pick: impl Fn(&SensorPublishTopics) -> Option<String>,
    ) -> Option<String> {
        self.sensor_publish.get(id).and_then(|topics| pick(topics))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
