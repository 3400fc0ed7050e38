//! The driver seam and the startup driver set.
//!
//! Register-level sensor I/O is an external collaborator behind
//! [`SensorDriver`]. Drivers are registered explicitly at startup under
//! a type tag — descriptors resolve against this closed set, never
//! against runtime class lookup.

use thiserror::Error;

use crate::model::ParameterMap;

// ── Driver errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("construction failed: {0}")]
    Construction(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("unsupported operation '{0}'")]
    Unsupported(String),
}

// ── Driver interface ─────────────────────────────────────────────────

/// One sensor driver instance: the register/pin-level read and control
/// surface behind a unit.
///
/// `read` is called once per capability in the descriptor's `read` set.
/// `control` receives only driver-specific ops — `enable`, `disable`,
/// `self_test`, and `factory_reset` are handled by the unit itself.
pub trait SensorDriver: Send {
    fn read(&mut self, capability: &str) -> Result<serde_json::Value, DriverError>;

    /// Push an updated parameter value down to the hardware, if the
    /// driver cares. The default accepts silently — most parameters
    /// only affect host-side processing.
    fn write(&mut self, _key: &str, _value: &serde_json::Value) -> Result<(), DriverError> {
        Ok(())
    }

    /// Driver-specific control op.
    fn control(&mut self, op: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported(op.to_owned()))
    }

    /// Diagnostic pass/fail; must not mutate parameters.
    fn self_test(&mut self) -> Result<bool, DriverError> {
        Ok(true)
    }

    /// Driver-specific control ops this driver accepts, used to
    /// validate descriptor `control` sets at instantiation.
    fn control_ops(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Control ops every unit accepts regardless of driver.
pub const BUILTIN_CONTROL_OPS: [&str; 4] = ["enable", "disable", "self_test", "factory_reset"];

// ── Driver set ───────────────────────────────────────────────────────

type Constructor = Box<dyn Fn(&ParameterMap) -> Result<Box<dyn SensorDriver>, DriverError>>;

/// The registrable set of driver constructors, keyed by type tag.
/// Populated once at startup by the binary.
#[derive(Default)]
pub struct DriverSet {
    constructors: indexmap::IndexMap<String, Constructor>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `type_tag`. Re-registering a tag
    /// replaces the previous constructor.
    pub fn register<F>(&mut self, type_tag: impl Into<String>, constructor: F)
    where
        F: Fn(&ParameterMap) -> Result<Box<dyn SensorDriver>, DriverError> + 'static,
    {
        self.constructors
            .insert(type_tag.into(), Box::new(constructor));
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.constructors.contains_key(type_tag)
    }

    /// Construct a driver for `type_tag`, or `None` if the tag is not
    /// registered.
    pub fn construct(
        &self,
        type_tag: &str,
        args: &ParameterMap,
    ) -> Option<Result<Box<dyn SensorDriver>, DriverError>> {
        self.constructors.get(type_tag).map(|ctor| ctor(args))
    }
}

impl std::fmt::Debug for DriverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSet")
            .field("type_tags", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;
    impl SensorDriver for NullDriver {
        fn read(&mut self, _capability: &str) -> Result<serde_json::Value, DriverError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn register_and_construct() {
        let mut set = DriverSet::new();
        set.register("null", |_args| Ok(Box::new(NullDriver) as Box<dyn SensorDriver>));

        assert!(set.contains("null"));
        assert!(!set.contains("dht11"));

        let driver = set.construct("null", &ParameterMap::new());
        assert!(matches!(driver, Some(Ok(_))));
        assert!(set.construct("dht11", &ParameterMap::new()).is_none());
    }

    #[test]
    fn reregistering_replaces() {
        let mut set = DriverSet::new();
        set.register("x", |_| Err(DriverError::Construction("first".into())));
        set.register("x", |_| Ok(Box::new(NullDriver) as Box<dyn SensorDriver>));

        let driver = set.construct("x", &ParameterMap::new());
        assert!(matches!(driver, Some(Ok(_))));
    }
}
