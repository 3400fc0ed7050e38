//! Sensor registry: instantiation from descriptors, capability-gated
//! operations, and the per-unit health ladder.
//!
//! Units are exclusively owned here; every other component goes through
//! lookup-by-id. The registry is the sole authority on whether a write
//! or control operation is permitted — the router forwards without
//! validating capability membership.

use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::config::{HealthPolicy, SensorDescriptor};
use crate::driver::{BUILTIN_CONTROL_OPS, DriverSet, SensorDriver};
use crate::error::CoreError;
use crate::model::{Health, ParameterMap, SampleSet};

// ── SensorUnit ───────────────────────────────────────────────────────

/// Runtime instance bound to one descriptor. Created at boot, destroyed
/// only at teardown; `factory_reset` is the only way its live state is
/// rebuilt.
pub struct SensorUnit {
    descriptor: SensorDescriptor,
    driver: Option<Box<dyn SensorDriver>>,
    /// Live parameter values: `defaults` restricted to `editable` keys.
    params: ParameterMap,
    health: Health,
    enabled: bool,
    consecutive_failures: u32,
    last_sample: Option<SampleSet>,
}

impl SensorUnit {
    fn new(descriptor: SensorDescriptor, driver: Option<Box<dyn SensorDriver>>) -> Self {
        let params = initial_params(&descriptor);
        let health = if driver.is_some() { Health::Ok } else { Health::Failed };
        Self {
            descriptor,
            driver,
            params,
            health,
            enabled: true,
            consecutive_failures: 0,
            last_sample: None,
        }
    }

    pub fn descriptor(&self) -> &SensorDescriptor {
        &self.descriptor
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Live parameter values.
    pub fn params(&self) -> &ParameterMap {
        &self.params
    }

    pub fn last_sample(&self) -> Option<&SampleSet> {
        self.last_sample.as_ref()
    }

    /// The unit's `report_interval` parameter, if set and numeric.
    pub fn report_interval(&self) -> Option<Duration> {
        self.params
            .get("report_interval")
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_secs)
    }

    fn reset(&mut self) {
        self.params = initial_params(&self.descriptor);
        self.health = Health::Ok;
        self.enabled = true;
        self.consecutive_failures = 0;
        self.last_sample = None;
    }

    fn record_failure(&mut self, policy: &HealthPolicy) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let previous = self.health;
        if self.consecutive_failures >= policy.failed_after {
            self.health = Health::Failed;
        } else if self.consecutive_failures >= policy.degraded_after {
            self.health = Health::Degraded;
        }
        if self.health != previous {
            warn!(
                id = %self.descriptor.id,
                failures = self.consecutive_failures,
                from = %previous,
                to = %self.health,
                "sensor health degraded"
            );
        }
    }

    fn record_success(&mut self, policy: &HealthPolicy) {
        self.consecutive_failures = 0;
        match self.health {
            Health::Degraded => {
                info!(id = %self.descriptor.id, "sensor recovered");
                self.health = Health::Ok;
            }
            // Failed is sticky unless the policy says otherwise; an
            // explicit factory_reset is the normal way back.
            Health::Failed if policy.auto_recover => {
                info!(id = %self.descriptor.id, "sensor auto-recovered from failed");
                self.health = Health::Ok;
            }
            _ => {}
        }
    }
}

/// Live parameters start from `defaults`, constrained to `editable`
/// keys — never from a previous run (state must be reconstructible
/// from configuration alone).
fn initial_params(descriptor: &SensorDescriptor) -> ParameterMap {
    descriptor
        .parameters
        .editable
        .keys()
        .filter_map(|key| {
            descriptor
                .parameters
                .defaults
                .get(key)
                .map(|value| (key.clone(), value.clone()))
        })
        .collect()
}

// ── Status and outcomes ──────────────────────────────────────────────

/// One row of [`SensorRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UnitStatus {
    pub id: String,
    pub health: Health,
    pub enabled: bool,
}

/// Result of a control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Done,
    SelfTest { passed: bool },
}

// ── SensorRegistry ───────────────────────────────────────────────────

pub struct SensorRegistry {
    units: IndexMap<String, SensorUnit>,
    policy: HealthPolicy,
}

impl SensorRegistry {
    /// Instantiate every descriptor against the registered driver set.
    ///
    /// A failure for one unit (unknown type tag, constructor error,
    /// invalid capability declaration) marks that unit `Failed` and
    /// moves on — it stays addressable for `factory_reset` but is
    /// excluded from polling. The collected errors are returned for the
    /// reporter.
    pub fn instantiate(
        drivers: &DriverSet,
        descriptors: &[SensorDescriptor],
        policy: HealthPolicy,
    ) -> (Self, Vec<CoreError>) {
        let mut units = IndexMap::with_capacity(descriptors.len());
        let mut failures = Vec::new();

        for descriptor in descriptors {
            let id = descriptor.id.clone();
            let (driver, error) = construct_unit_driver(drivers, descriptor);
            if let Some(error) = error {
                warn!(id = %id, error = %error, "sensor instantiation failed");
                failures.push(error);
            } else {
                debug!(id = %id, type_tag = %descriptor.type_tag, "sensor instantiated");
            }
            let mut unit = SensorUnit::new(descriptor.clone(), driver);
            // Hand the driver its starting parameter values.
            if let Some(driver) = unit.driver.as_mut() {
                for (key, value) in &unit.params {
                    if let Err(e) = driver.write(key, value) {
                        debug!(id = %id, key = %key, error = %e, "initial parameter ignored");
                    }
                }
            }
            units.insert(id, unit);
        }

        (Self { units, policy }, failures)
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Lookup by id.
    pub fn unit(&self, id: &str) -> Option<&SensorUnit> {
        self.units.get(id)
    }

    /// All unit ids with current health, in descriptor order.
    pub fn list(&self) -> Vec<UnitStatus> {
        self.units
            .values()
            .map(|unit| UnitStatus {
                id: unit.descriptor.id.clone(),
                health: unit.health,
                enabled: unit.enabled,
            })
            .collect()
    }

    /// Read every capability in the unit's `read` set.
    ///
    /// Disabled units and units without a driver are a no-op
    /// (`Ok(None)`). A failed read feeds the health ladder and returns
    /// `ReadError`; a successful read resets the consecutive-failure
    /// counter and applies the recovery policy.
    pub fn poll(&mut self, id: &str) -> Result<Option<SampleSet>, CoreError> {
        let policy = self.policy;
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| CoreError::SensorNotFound { id: id.to_owned() })?;

        if !unit.enabled {
            return Ok(None);
        }
        let Some(driver) = unit.driver.as_mut() else {
            return Ok(None);
        };

        let mut values = ParameterMap::new();
        for capability in &unit.descriptor.capabilities.read {
            match driver.read(capability) {
                Ok(value) => {
                    values.insert(capability.clone(), value);
                }
                Err(e) => {
                    unit.record_failure(&policy);
                    return Err(CoreError::ReadError {
                        id: id.to_owned(),
                        cause: e.to_string(),
                    });
                }
            }
        }

        unit.record_success(&policy);
        let sample = SampleSet::new(values);
        unit.last_sample = Some(sample.clone());
        Ok(Some(sample))
    }

    /// Update a live parameter value. Permitted only for keys in the
    /// descriptor's `editable` set; rejection leaves live parameters
    /// untouched, and success never touches `defaults`.
    pub fn write(
        &mut self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| CoreError::SensorNotFound { id: id.to_owned() })?;

        if !unit.descriptor.parameters.editable.contains_key(key) {
            return Err(CoreError::NotEditable {
                id: id.to_owned(),
                key: key.to_owned(),
            });
        }

        if let Some(driver) = unit.driver.as_mut() {
            driver.write(key, &value).map_err(|e| CoreError::DriverOp {
                id: id.to_owned(),
                op: format!("write {key}"),
                cause: e.to_string(),
            })?;
        }

        info!(id = %id, key = %key, value = %value, "parameter updated");
        unit.params.insert(key.to_owned(), value);
        Ok(())
    }

    /// Run a control operation. Permitted only for ops in the
    /// descriptor's `control` set.
    pub fn control(&mut self, id: &str, op: &str) -> Result<ControlOutcome, CoreError> {
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| CoreError::SensorNotFound { id: id.to_owned() })?;

        if !unit.descriptor.capabilities.control.iter().any(|c| c == op) {
            return Err(CoreError::NotPermitted {
                id: id.to_owned(),
                op: op.to_owned(),
            });
        }

        match op {
            "enable" => {
                unit.enabled = true;
                info!(id = %id, "sensor enabled");
                Ok(ControlOutcome::Done)
            }
            "disable" => {
                unit.enabled = false;
                info!(id = %id, "sensor disabled");
                Ok(ControlOutcome::Done)
            }
            "factory_reset" => {
                unit.reset();
                info!(id = %id, "factory reset complete");
                Ok(ControlOutcome::Done)
            }
            "self_test" => {
                let passed = match unit.driver.as_mut() {
                    Some(driver) => driver.self_test().map_err(|e| CoreError::DriverOp {
                        id: id.to_owned(),
                        op: op.to_owned(),
                        cause: e.to_string(),
                    })?,
                    // No driver means the diagnostic cannot pass.
                    None => false,
                };
                info!(id = %id, passed, "self test");
                Ok(ControlOutcome::SelfTest { passed })
            }
            custom => {
                let Some(driver) = unit.driver.as_mut() else {
                    return Err(CoreError::DriverOp {
                        id: id.to_owned(),
                        op: custom.to_owned(),
                        cause: "unit has no driver".into(),
                    });
                };
                driver.control(custom).map_err(|e| CoreError::DriverOp {
                    id: id.to_owned(),
                    op: custom.to_owned(),
                    cause: e.to_string(),
                })?;
                Ok(ControlOutcome::Done)
            }
        }
    }

    /// Factory-reset every unit (the system-level `factory_reset`).
    pub fn reset_all(&mut self) {
        for unit in self.units.values_mut() {
            unit.reset();
        }
        info!("all sensors factory reset");
    }
}

/// Construct the driver for one descriptor, validating its declared
/// capabilities against what the driver accepts.
fn construct_unit_driver(
    drivers: &DriverSet,
    descriptor: &SensorDescriptor,
) -> (Option<Box<dyn SensorDriver>>, Option<CoreError>) {
    let id = &descriptor.id;

    // write capabilities must name editable parameters
    for key in &descriptor.capabilities.write {
        if !descriptor.parameters.editable.contains_key(key) {
            return (
                None,
                Some(CoreError::InvalidDescriptor {
                    id: id.clone(),
                    reason: format!("write capability '{key}' is not an editable parameter"),
                }),
            );
        }
    }

    let driver = match drivers.construct(&descriptor.type_tag, &descriptor.args) {
        None => {
            return (
                None,
                Some(CoreError::UnknownSensorType {
                    id: id.clone(),
                    type_tag: descriptor.type_tag.clone(),
                }),
            );
        }
        Some(Err(e)) => {
            return (
                None,
                Some(CoreError::DriverConstruction {
                    id: id.clone(),
                    message: e.to_string(),
                }),
            );
        }
        Some(Ok(driver)) => driver,
    };

    // control capabilities must be builtin or accepted by the driver
    let driver_ops = driver.control_ops();
    for op in &descriptor.capabilities.control {
        let known = BUILTIN_CONTROL_OPS.contains(&op.as_str())
            || driver_ops.contains(&op.as_str());
        if !known {
            return (
                None,
                Some(CoreError::InvalidDescriptor {
                    id: id.clone(),
                    reason: format!("control op '{op}' is not accepted by the driver"),
                }),
            );
        }
    }

    (Some(driver), None)
}

// ── Tests ────────────────────────────────────────────────────────────
