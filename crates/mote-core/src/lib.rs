//! Orchestration core of the mote sensor-node agent.
//!
//! This crate owns the device-side business logic between `mote-link`
//! (connectivity) and the binary (drivers, configuration, supervision):
//!
//! - **[`DeviceAgent`]** — Single-task lifecycle controller:
//!   [`run()`](DeviceAgent::run) connects, subscribes, then drives the
//!   operating cycle (watchdog, link maintenance, inbound dispatch,
//!   sensor polling, state publishing) until it returns a [`RunExit`]
//!   for the process supervisor.
//!
//! - **[`SensorRegistry`]** — Exclusive owner of the sensor units
//!   instantiated from configuration descriptors. Capability-gated
//!   reads, parameter writes, and control operations; per-unit health
//!   ladder driven by consecutive failures.
//!
//! - **[`Router`]** — The binding table from broker channels to
//!   [`Route`]s plus the typed publish surface. Payloads stay opaque
//!   bytes until they cross a route boundary.
//!
//! - **[`Reporter`]** — Bounded in-memory error ring with escalation
//!   decisions ([`ReportOutcome`]); the lifecycle controller acts on
//!   them, the reporter never touches the session itself.
//!
//! - **Domain model** ([`model`]) — [`DeviceState`], [`Health`],
//!   [`Severity`], [`ErrorRecord`], [`SampleSet`].

pub mod config;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod registry;
pub mod reporter;
pub mod router;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{
    DeviceConfig, ErrorPolicy, HealthPolicy, PowerPolicy, SensorDescriptor, SystemSettings,
    SystemTopics,
};
pub use driver::{BUILTIN_CONTROL_OPS, DriverError, DriverSet, SensorDriver};
pub use error::CoreError;
pub use lifecycle::{DeviceAgent, NoopWatchdog, RunExit, WatchdogTimer};
pub use model::{DeviceState, ErrorRecord, Health, Message, ParameterMap, SampleSet, Severity};
pub use registry::{ControlOutcome, SensorRegistry, UnitStatus};
pub use reporter::{ReportOutcome, Reporter};
pub use router::{CommandPayload, PowerConfigPayload, Route, Router};
