//! Configuration for the mote agent.
//!
//! TOML document + environment overrides (`MOTE_` prefix, `__` section
//! separator), structural validation, and translation to
//! `mote_core::DeviceConfig`. The agent binary is the only consumer —
//! core components never read files or environment variables.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mote_core::config::{ErrorPolicy, PowerPolicy, SystemSettings};
use mote_core::{DeviceConfig, HealthPolicy, SensorDescriptor, SystemTopics};
use mote_link::{
    Endpoint, FailureAction, LastWill, LinkCredentials, ReconnectPolicy, SessionOptions,
};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("topic '{topic}' is bound more than once")]
    DuplicateTopic { topic: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML document ───────────────────────────────────────────────────

/// Top-level TOML document. Every section has working defaults except
/// `[network]` and `[broker]`, which carry required fields.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigDocument {
    pub device: DeviceSection,
    pub network: NetworkSection,
    pub broker: BrokerSection,
    pub system: SystemSection,
    pub error_handling: ErrorHandlingSection,
    pub power: PowerSection,
    pub health: HealthPolicy,
    pub sensors: Vec<SensorDescriptor>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Broker client id, also the node's identity in log output.
    pub client_id: String,
    /// Accept the system-level `factory_reset` command.
    pub enable_factory_reset: bool,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            client_id: "mote".into(),
            enable_factory_reset: false,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkSection {
    pub ssid: String,
    /// Plaintext in the file — prefer `MOTE_NETWORK__PASSWORD`.
    pub password: String,
    pub reconnect: ReconnectSection,
}

/// Bounded-retry policy, shared by link association and broker
/// connects.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub interval_secs: u64,
    pub max_retries: u32,
    pub failure_action: FailureAction,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_retries: 10,
            failure_action: FailureAction::Restart,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerSection {
    pub server: String,
    pub port: u16,
    pub username: String,
    /// Plaintext in the file — prefer `MOTE_BROKER__PASSWORD`.
    pub password: String,
    pub keep_alive_secs: u16,
    pub last_will: Option<LastWillSection>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            keep_alive_secs: 60,
            last_will: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LastWillSection {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemSection {
    pub topics: SystemTopics,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorHandlingSection {
    pub post_global_errors: bool,
    pub auto_restart_on_error: bool,
    pub ring_capacity: usize,
}

impl Default for ErrorHandlingSection {
    fn default() -> Self {
        Self {
            post_global_errors: false,
            auto_restart_on_error: true,
            ring_capacity: 32,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PowerSection {
    pub deep_sleep_interval_secs: u64,
    /// Zero disables the watchdog.
    pub watchdog_timeout_secs: u64,
}

impl Default for PowerSection {
    fn default() -> Self {
        Self {
            deep_sleep_interval_secs: 15,
            watchdog_timeout_secs: 0,
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load and validate the configuration: defaults, then the TOML file,
/// then `MOTE_`-prefixed environment overrides (`__` separates
/// sections, e.g. `MOTE_BROKER__PASSWORD`).
pub fn load(path: &Path) -> Result<ConfigDocument, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(ConfigDocument::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("MOTE_").split("__"));

    let document: ConfigDocument = figment.extract()?;
    document.validate()?;
    Ok(document)
}

// ── Validation ──────────────────────────────────────────────────────

impl ConfigDocument {
    /// Structural validation beyond what serde enforces. Called by
    /// [`load`]; exposed for hand-built documents in tests and tools.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.client_id.is_empty() {
            return Err(invalid("device.client_id", "must not be empty"));
        }
        if self.network.ssid.is_empty() {
            return Err(invalid("network.ssid", "must not be empty"));
        }
        if self.broker.server.is_empty() {
            return Err(invalid("broker.server", "must not be empty"));
        }
        if self.network.reconnect.max_retries == 0 {
            return Err(invalid("network.reconnect.max_retries", "must be at least 1"));
        }
        if self.power.deep_sleep_interval_secs == 0 {
            return Err(invalid("power.deep_sleep_interval_secs", "must be at least 1"));
        }
        if self.error_handling.ring_capacity == 0 {
            return Err(invalid("error_handling.ring_capacity", "must be at least 1"));
        }
        if self.health.degraded_after == 0 {
            return Err(invalid("health.degraded_after", "must be at least 1"));
        }
        if self.health.failed_after < self.health.degraded_after {
            return Err(invalid(
                "health.failed_after",
                "must be >= health.degraded_after",
            ));
        }

        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if sensor.id.is_empty() {
                return Err(invalid("sensors.id", "must not be empty"));
            }
            if !ids.insert(sensor.id.as_str()) {
                return Err(invalid(
                    "sensors.id",
                    format!("duplicate sensor id '{}'", sensor.id),
                ));
            }
            for key in sensor.parameters.editable.keys() {
                if !sensor.parameters.defaults.contains_key(key) {
                    return Err(invalid(
                        "sensors.parameters",
                        format!(
                            "editable parameter '{key}' of '{}' has no default",
                            sensor.id
                        ),
                    ));
                }
            }
        }

        self.check_topic_uniqueness()
    }

    /// Every bound topic must be unique across the whole document —
    /// system channels, sensor channels, and the last-will topic all
    /// share one namespace.
    fn check_topic_uniqueness(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let mut bind = |topic: &str| -> Result<(), ConfigError> {
            if seen.insert(topic.to_owned()) {
                Ok(())
            } else {
                Err(ConfigError::DuplicateTopic {
                    topic: topic.to_owned(),
                })
            }
        };

        if let Some(will) = &self.broker.last_will {
            bind(&will.topic)?;
        }
        for topic in self.system.topics.bound_topics() {
            bind(topic)?;
        }
        for sensor in &self.sensors {
            for topic in sensor.bound_topics() {
                bind(topic)?;
            }
        }
        Ok(())
    }

    // ── Translation ─────────────────────────────────────────────────

    /// Build the runtime [`DeviceConfig`]. Assumes [`validate`] passed;
    /// secrets are wrapped here and never appear in the runtime config's
    /// `Debug` output.
    ///
    /// [`validate`]: ConfigDocument::validate
    pub fn into_device_config(self) -> DeviceConfig {
        let reconnect = ReconnectPolicy {
            interval: Duration::from_secs(self.network.reconnect.interval_secs),
            max_retries: self.network.reconnect.max_retries,
            failure_action: self.network.reconnect.failure_action,
        };

        let last_will = self.broker.last_will.map(|will| LastWill {
            topic: will.topic,
            payload: will.payload.into_bytes(),
            retain: will.retain,
        });

        DeviceConfig {
            credentials: LinkCredentials {
                ssid: self.network.ssid,
                password: SecretString::from(self.network.password),
            },
            reconnect,
            endpoint: Endpoint::new(self.broker.server, self.broker.port),
            session: SessionOptions {
                client_id: self.device.client_id,
                username: self.broker.username,
                password: SecretString::from(self.broker.password),
                keep_alive_secs: self.broker.keep_alive_secs,
                last_will,
            },
            system: SystemSettings {
                enable_factory_reset: self.device.enable_factory_reset,
                topics: self.system.topics,
                error_handling: ErrorPolicy {
                    post_global_errors: self.error_handling.post_global_errors,
                    auto_restart_on_error: self.error_handling.auto_restart_on_error,
                    ring_capacity: self.error_handling.ring_capacity,
                },
                power: PowerPolicy {
                    deep_sleep_interval: Duration::from_secs(
                        self.power.deep_sleep_interval_secs,
                    ),
                    watchdog_timeout: Duration::from_secs(self.power.watchdog_timeout_secs),
                },
            },
            health: self.health,
            sensors: self.sensors,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [device]
        client_id = "greenhouse-01"

        [network]
        ssid = "glasshouse"
        password = "hunter2"

        [broker]
        server = "broker.lan"
        port = 1883
    "#;

    const FULL: &str = r#"
        [device]
        client_id = "greenhouse-01"
        enable_factory_reset = true

        [network]
        ssid = "glasshouse"
        password = "hunter2"

        [network.reconnect]
        interval_secs = 2
        max_retries = 4
        failure_action = "continue"

        [broker]
        server = "broker.lan"
        port = 8883
        username = "mote"
        password = "s3cret"
        keep_alive_secs = 30

        [broker.last_will]
        topic = "nodes/greenhouse-01/status"
        payload = "offline"
        retain = true

        [system.topics.publish]
        state = "nodes/greenhouse-01/state"
        errors = "nodes/greenhouse-01/errors"

        [system.topics.subscribe]
        commands = "nodes/greenhouse-01/commands"
        power_config = "nodes/greenhouse-01/power"

        [error_handling]
        post_global_errors = true
        ring_capacity = 16

        [power]
        deep_sleep_interval_secs = 30

        [health]
        degraded_after = 2
        failed_after = 4

        [[sensors]]
        id = "air_01"
        type = "temperature_humidity"

        [sensors.args]
        pin = 4

        [sensors.topics.publish]
        data = "nodes/greenhouse-01/air_01/data"
        state = "nodes/greenhouse-01/air_01/state"

        [sensors.topics.subscribe]
        commands = "nodes/greenhouse-01/air_01/cmd"

        [sensors.parameters.editable]
        report_interval = 60

        [sensors.parameters.defaults]
        report_interval = 60

        [sensors.capabilities]
        read = ["temperature", "humidity"]
        control = ["enable", "disable"]
    "#;

    fn load_str(toml: &str) -> Result<ConfigDocument, ConfigError> {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").expect("tempfile");
        file.write_all(toml.as_bytes()).expect("write");
        load(file.path())
    }

    #[test]
    fn minimal_document_gets_defaults() {
        let doc = load_str(MINIMAL).expect("load");

        assert_eq!(doc.device.client_id, "greenhouse-01");
        assert!(!doc.device.enable_factory_reset);
        assert_eq!(doc.network.reconnect.max_retries, 10);
        assert_eq!(doc.power.deep_sleep_interval_secs, 15);
        assert_eq!(doc.health.degraded_after, 3);
        assert!(doc.sensors.is_empty());
    }

    #[test]
    fn full_document_translates() {
        let doc = load_str(FULL).expect("load");
        let config = doc.into_device_config();

        assert_eq!(config.session.client_id, "greenhouse-01");
        assert_eq!(config.endpoint.port, 8883);
        assert_eq!(config.reconnect.failure_action, FailureAction::Continue);
        assert_eq!(config.reconnect.interval, Duration::from_secs(2));
        assert_eq!(
            config.session.last_will.as_ref().expect("last will").payload,
            b"offline"
        );
        assert_eq!(
            config.system.power.deep_sleep_interval,
            Duration::from_secs(30)
        );
        assert!(config.system.error_handling.post_global_errors);
        assert_eq!(config.health.failed_after, 4);
        assert_eq!(config.sensors.len(), 1);
        assert_eq!(config.sensors[0].type_tag, "temperature_humidity");
        assert_eq!(config.sensors[0].args["pin"], serde_json::json!(4));
    }

    #[test]
    fn missing_ssid_is_rejected() {
        let err = load_str(
            r#"
            [device]
            client_id = "n1"
            [broker]
            server = "broker.lan"
        "#,
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("network.ssid"));
    }

    #[test]
    fn duplicate_topic_across_sensors_is_rejected() {
        let err = load_str(
            r#"
            [device]
            client_id = "n1"
            [network]
            ssid = "net"
            [broker]
            server = "broker.lan"

            [[sensors]]
            id = "a"
            type = "x"
            [sensors.topics.publish]
            data = "nodes/n1/shared"

            [[sensors]]
            id = "b"
            type = "x"
            [sensors.topics.subscribe]
            commands = "nodes/n1/shared"
        "#,
        )
        .expect_err("must fail");
        assert!(matches!(err, ConfigError::DuplicateTopic { .. }));
    }

    #[test]
    fn duplicate_sensor_id_is_rejected() {
        let err = load_str(
            r#"
            [device]
            client_id = "n1"
            [network]
            ssid = "net"
            [broker]
            server = "broker.lan"

            [[sensors]]
            id = "a"
            type = "x"

            [[sensors]]
            id = "a"
            type = "y"
        "#,
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("duplicate sensor id"));
    }

    #[test]
    fn editable_without_default_is_rejected() {
        let err = load_str(
            r#"
            [device]
            client_id = "n1"
            [network]
            ssid = "net"
            [broker]
            server = "broker.lan"

            [[sensors]]
            id = "a"
            type = "x"
            [sensors.parameters.editable]
            gain = 2
        "#,
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("has no default"));
    }

    #[test]
    fn failed_threshold_below_degraded_is_rejected() {
        let err = load_str(
            r#"
            [device]
            client_id = "n1"
            [network]
            ssid = "net"
            [broker]
            server = "broker.lan"
            [health]
            degraded_after = 5
            failed_after = 3
        "#,
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("failed_after"));
    }
}
