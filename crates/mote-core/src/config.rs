// ── Runtime device configuration ──
//
// These types describe the device as the agent runs it: link
// credentials, broker session, policies, and the sensor descriptors.
// Immutable after boot and shared by reference; `mote-config` builds a
// `DeviceConfig` from the TOML document — core never reads files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mote_link::{Endpoint, LinkCredentials, ReconnectPolicy, SessionOptions};

use crate::model::ParameterMap;

// ── Top level ────────────────────────────────────────────────────────

/// Immutable configuration handle, loaded once at boot and passed
/// explicitly into each component at construction.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub credentials: LinkCredentials,
    pub reconnect: ReconnectPolicy,
    pub endpoint: Endpoint,
    pub session: SessionOptions,
    pub system: SystemSettings,
    pub health: HealthPolicy,
    pub sensors: Vec<SensorDescriptor>,
}

/// System-level behavior: topics, error handling, power.
#[derive(Debug, Clone)]
pub struct SystemSettings {
    pub enable_factory_reset: bool,
    pub topics: SystemTopics,
    pub error_handling: ErrorPolicy,
    pub power: PowerPolicy,
}

/// System channel bindings. Missing topics disable the corresponding
/// publish/subscribe rather than failing the boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemTopics {
    pub publish: SystemPublishTopics,
    pub subscribe: SystemSubscribeTopics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemPublishTopics {
    pub state: Option<String>,
    pub errors: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSubscribeTopics {
    pub commands: Option<String>,
    pub power_config: Option<String>,
}

/// How errors escalate.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    /// Forward Warning+ records to the system errors channel.
    pub post_global_errors: bool,
    /// Fatal records trigger a restart instead of awaiting intervention.
    pub auto_restart_on_error: bool,
    /// Bound on the in-memory error ring.
    pub ring_capacity: usize,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            post_global_errors: false,
            auto_restart_on_error: true,
            ring_capacity: 32,
        }
    }
}

/// Sleep/watchdog policy. A zero watchdog timeout disables the timer.
#[derive(Debug, Clone)]
pub struct PowerPolicy {
    /// Interval between operating cycles.
    pub deep_sleep_interval: Duration,
    pub watchdog_timeout: Duration,
}

impl Default for PowerPolicy {
    fn default() -> Self {
        Self {
            deep_sleep_interval: Duration::from_secs(15),
            watchdog_timeout: Duration::ZERO,
        }
    }
}

/// Health ladder policy. The thresholds count *consecutive* poll
/// failures; `auto_recover` decides whether a successful poll restores
/// a `Failed` unit (recovery from `Degraded` is always automatic).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    pub degraded_after: u32,
    pub failed_after: u32,
    pub auto_recover: bool,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            failed_after: 5,
            auto_recover: false,
        }
    }
}

// ── Sensor descriptors ───────────────────────────────────────────────

/// Declarative, static definition of one sensor unit: identity,
/// construction args, channel bindings, parameters, and capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// Unique unit id.
    pub id: String,
    /// Driver type tag, resolved against the registered driver set.
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Opaque construction arguments handed to the driver constructor.
    #[serde(default)]
    pub args: ParameterMap,
    #[serde(default)]
    pub topics: SensorTopics,
    #[serde(default)]
    pub parameters: ParameterSets,
    #[serde(default)]
    pub capabilities: CapabilitySets,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorTopics {
    pub publish: SensorPublishTopics,
    pub subscribe: SensorSubscribeTopics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorPublishTopics {
    pub state: Option<String>,
    pub info: Option<String>,
    pub data: Option<String>,
    pub errors: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSubscribeTopics {
    pub commands: Option<String>,
    pub config: Option<String>,
}

/// Per-unit parameter sets. `editable` keys must be a subset of
/// `defaults` keys (validated at configuration load).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSets {
    pub editable: ParameterMap,
    pub read_only: ParameterMap,
    pub defaults: ParameterMap,
}

/// The named operations a unit exposes to the rest of the system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySets {
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub control: Vec<String>,
}

impl SensorDescriptor {
    /// All channel names this descriptor binds, publish and subscribe.
    pub fn bound_topics(&self) -> impl Iterator<Item = &str> {
        let p = &self.topics.publish;
        let s = &self.topics.subscribe;
        [
            p.state.as_deref(),
            p.info.as_deref(),
            p.data.as_deref(),
            p.errors.as_deref(),
            s.commands.as_deref(),
            s.config.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

impl SystemTopics {
    /// All channel names bound at the system level.
    pub fn bound_topics(&self) -> impl Iterator<Item = &str> {
        [
            self.publish.state.as_deref(),
            self.publish.errors.as_deref(),
            self.subscribe.commands.as_deref(),
            self.subscribe.power_config.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}
