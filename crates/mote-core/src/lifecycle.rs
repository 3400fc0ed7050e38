//! Device lifecycle: the single task that owns every component and
//! drives the operating cycle.
//!
//! [`DeviceAgent::run`] is the whole agent: connect, subscribe, then
//! loop (feed watchdog, maintain link, drain inbound, poll due sensors,
//! publish state, sleep). Restart authority is externalized — the agent
//! never restarts itself, it returns a [`RunExit`] and the process
//! supervisor acts on the exit status.

use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mote_link::{
    BrokerSession, BrokerTransport, Error as LinkError, FailureAction, LinkManager, LinkTransport,
};

use crate::config::DeviceConfig;
use crate::driver::DriverSet;
use crate::model::{DeviceState, ErrorRecord, Health};
use crate::registry::{ControlOutcome, SensorRegistry};
use crate::reporter::Reporter;
use crate::router::{
    CommandPayload, PowerConfigPayload, Route, Router, decode_parameter_writes,
};

/// Fallback poll cadence for units without a `report_interval`
/// parameter.
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

// ── Watchdog seam ────────────────────────────────────────────────────

/// Hardware watchdog behind a trait so host builds run without one.
/// `start` with a zero timeout disables the timer.
pub trait WatchdogTimer: Send {
    fn start(&mut self, timeout: Duration);
    fn feed(&mut self);
}

/// No-op watchdog for host and test builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl WatchdogTimer for NoopWatchdog {
    fn start(&mut self, _timeout: Duration) {}
    fn feed(&mut self) {}
}

// ── Exit status ──────────────────────────────────────────────────────

/// Why the agent stopped. The binary maps this onto an exit code the
/// supervisor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Restart requested (fatal error with auto-restart, or an explicit
    /// reboot command).
    Restart,
    /// Clean power-down requested.
    Shutdown,
    /// The cancellation token fired.
    Cancelled,
}

// ── DeviceAgent ──────────────────────────────────────────────────────

pub struct DeviceAgent<L: LinkTransport, B: BrokerTransport> {
    config: DeviceConfig,
    link: LinkManager<L>,
    router: Router<B>,
    registry: SensorRegistry,
    reporter: Reporter,
    state: watch::Sender<DeviceState>,
    watchdog: Box<dyn WatchdogTimer>,
    cancel: CancellationToken,
    /// Runtime-adjustable copy of the configured sleep interval.
    deep_sleep_interval: Duration,
    /// Next due time per unit, keyed by id in descriptor order.
    next_poll: IndexMap<String, Instant>,
    /// Operating without connectivity (`FailureAction::Continue`).
    offline: bool,
    /// A fatal record arrived through the generic report path; the
    /// cycle ends with the fatal transition.
    fatal_pending: bool,
}

impl<L: LinkTransport, B: BrokerTransport> DeviceAgent<L, B> {
    /// Wire up every component from the configuration. Sensor
    /// instantiation failures are recorded, not fatal — the failed
    /// units stay addressable.
    pub fn new(
        config: DeviceConfig,
        link_transport: L,
        broker_transport: B,
        drivers: &DriverSet,
        watchdog: Box<dyn WatchdogTimer>,
        cancel: CancellationToken,
    ) -> Self {
        let link = LinkManager::new(
            link_transport,
            config.credentials.clone(),
            config.reconnect.clone(),
        );
        let session = BrokerSession::new(
            broker_transport,
            config.endpoint.clone(),
            config.session.clone(),
        );
        let (registry, failures) =
            SensorRegistry::instantiate(drivers, &config.sensors, config.health);
        let router = Router::from_config(session, &config.system.topics, &config.sensors);

        let mut reporter = Reporter::new(config.system.error_handling.clone());
        for failure in failures {
            let severity = failure.severity();
            reporter.record(ErrorRecord::new("registry", severity, failure.to_string()));
        }

        let (state, _) = watch::channel(DeviceState::Booting);
        let deep_sleep_interval = config.system.power.deep_sleep_interval;

        Self {
            config,
            link,
            router,
            registry,
            reporter,
            state,
            watchdog,
            cancel,
            deep_sleep_interval,
            next_poll: IndexMap::new(),
            offline: false,
            fatal_pending: false,
        }
    }

    /// Subscribe to device state transitions.
    pub fn state(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.reporter.recent().cloned().collect()
    }

    fn set_state(&self, state: DeviceState) {
        if *self.state.borrow() != state {
            info!(%state, "device state");
        }
        let _ = self.state.send_replace(state);
    }

    /// Run the agent to completion.
    pub async fn run(mut self) -> RunExit {
        info!(
            sensors = self.registry.len(),
            endpoint = %self.router.session().endpoint(),
            "agent starting"
        );

        let timeout = self.config.system.power.watchdog_timeout;
        if !timeout.is_zero() {
            self.watchdog.start(timeout);
        }

        self.set_state(DeviceState::Connecting);
        if let Some(exit) = self.bring_up().await {
            return self.finish(exit).await;
        }

        loop {
            self.watchdog.feed();

            if let Some(exit) = self.operating_cycle().await {
                return self.finish(exit).await;
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    return self.finish(RunExit::Cancelled).await;
                }
                () = tokio::time::sleep(self.deep_sleep_interval) => {}
            }
        }
    }

    async fn finish(mut self, exit: RunExit) -> RunExit {
        info!(?exit, "agent stopping");
        self.router.session_mut().disconnect().await;
        self.link.disconnect().await;
        exit
    }

    // ── Bring-up ────────────────────────────────────────────────────

    /// Link + session + subscriptions + initial publishes. Returns an
    /// exit when the retry budget runs out with a terminal action.
    async fn bring_up(&mut self) -> Option<RunExit> {
        let result = self.link.connect().await;
        self.drain_link_warnings();
        if let Err(error) = result {
            return self.handle_link_failure(error).await;
        }

        if let Some(exit) = self.connect_session().await {
            return exit.into_exit();
        }

        None
    }

    /// Session connect with the same bounded-retry policy as the link.
    async fn connect_session(&mut self) -> Option<SessionOutcome> {
        let policy = self.config.reconnect.clone();
        let max = policy.max_retries.max(1);

        for attempt in 1..=max {
            let failure = match self.router.session_mut().connect().await {
                Ok(()) => match self.router.subscribe_all().await {
                    Ok(()) => None,
                    Err(e) => Some(e.to_string()),
                },
                Err(e) => Some(e.to_string()),
            };

            match failure {
                None => {
                    self.publish_sensor_info().await;
                    self.set_state(DeviceState::Operating);
                    self.publish_device_state().await;
                    return None;
                }
                Some(message) => {
                    self.reporter.record(ErrorRecord::warning(
                        "broker",
                        format!("connect attempt {attempt}/{max} failed: {message}"),
                    ));
                    if attempt < max {
                        tokio::time::sleep(policy.interval).await;
                    }
                }
            }
        }

        let error = LinkError::RetriesExhausted {
            attempts: max,
            action: policy.failure_action,
        };
        Some(match self.handle_link_failure(error).await {
            Some(exit) => SessionOutcome::Exit(exit),
            None => SessionOutcome::Offline,
        })
    }

    /// Execute the configured failure action for a terminal
    /// connectivity error. `Continue` switches to offline operation.
    async fn handle_link_failure(&mut self, error: LinkError) -> Option<RunExit> {
        let action = match &error {
            LinkError::RetriesExhausted { action, .. } => *action,
            _ => FailureAction::Restart,
        };
        self.reporter
            .record(ErrorRecord::fatal("link", error.to_string()));

        match action {
            FailureAction::Restart => Some(self.escalate_fatal().await),
            FailureAction::Shutdown => {
                self.set_state(DeviceState::Restarting);
                Some(RunExit::Shutdown)
            }
            FailureAction::Continue => {
                warn!("continuing without connectivity");
                self.offline = true;
                self.set_state(DeviceState::Degraded);
                None
            }
        }
    }

    /// Fatal transition: restart when policy allows it, otherwise park
    /// until the operator steps in.
    async fn escalate_fatal(&mut self) -> RunExit {
        if self.config.system.error_handling.auto_restart_on_error {
            self.set_state(DeviceState::Restarting);
            RunExit::Restart
        } else {
            self.await_intervention().await;
            RunExit::Cancelled
        }
    }

    /// Publish-only terminal state: no recovery action, wait for the
    /// operator (or cancellation).
    async fn await_intervention(&mut self) {
        self.set_state(DeviceState::AwaitingIntervention);
        self.publish_device_state().await;
        loop {
            self.watchdog.feed();
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.deep_sleep_interval) => {
                    self.publish_device_state().await;
                }
            }
        }
    }

    // ── Operating cycle ─────────────────────────────────────────────

    async fn operating_cycle(&mut self) -> Option<RunExit> {
        if self.offline {
            // Waiting for the link to come back on its own.
            if self.link.transport_mut().is_up() {
                info!("link recovered, leaving offline mode");
                let result = self.link.connect().await;
                self.drain_link_warnings();
                if result.is_ok() && self.connect_session().await.is_none() {
                    self.offline = false;
                }
            }
        } else {
            match self.link.maintain().await {
                Ok(false) => {}
                Ok(true) => {
                    // Fresh link invalidates the broker session.
                    self.drain_link_warnings();
                    if let Some(outcome) = self.connect_session().await {
                        if let Some(exit) = outcome.into_exit() {
                            return Some(exit);
                        }
                    }
                }
                Err(error) => {
                    self.drain_link_warnings();
                    if let Some(exit) = self.handle_link_failure(error).await {
                        return Some(exit);
                    }
                }
            }

            if !self.offline && !self.router.session().is_connected() {
                if let Some(outcome) = self.connect_session().await {
                    if let Some(exit) = outcome.into_exit() {
                        return Some(exit);
                    }
                }
            }

            if let Some(exit) = self.drain_inbound().await {
                return Some(exit);
            }
        }

        self.poll_due_sensors().await;

        let aggregate = self.aggregate_state();
        self.set_state(aggregate);
        if !self.offline {
            self.publish_device_state().await;
        }

        if self.fatal_pending {
            self.fatal_pending = false;
            return Some(self.escalate_fatal().await);
        }

        None
    }

    /// Handle every message already queued, in arrival order.
    async fn drain_inbound(&mut self) -> Option<RunExit> {
        loop {
            let message = match self.router.poll_inbound().await {
                Ok(Some(message)) => message,
                Ok(None) => return None,
                Err(e) => {
                    self.report(ErrorRecord::warning("broker", e.to_string())).await;
                    return None;
                }
            };

            let route = match self.router.dispatch(&message) {
                Ok(route) => route,
                Err(e) => {
                    // Dropped, reported, never fatal.
                    self.report(ErrorRecord::error("router", e.to_string())).await;
                    continue;
                }
            };

            if let Some(exit) = self.handle_route(route, &message.channel, &message.payload).await
            {
                return Some(exit);
            }
        }
    }

    async fn handle_route(
        &mut self,
        route: Route,
        channel: &str,
        payload: &[u8],
    ) -> Option<RunExit> {
        match route {
            Route::SystemCommand => {
                let command = match CommandPayload::decode(channel, payload) {
                    Ok(p) => p.command,
                    Err(e) => {
                        self.report(ErrorRecord::error("router", e.to_string())).await;
                        return None;
                    }
                };
                self.handle_system_command(&command).await
            }
            Route::SystemPowerConfig => {
                match PowerConfigPayload::decode(channel, payload) {
                    Ok(update) => self.apply_power_config(update),
                    Err(e) => {
                        self.report(ErrorRecord::error("router", e.to_string())).await;
                    }
                }
                None
            }
            Route::SensorCommand { id } => {
                match CommandPayload::decode(channel, payload) {
                    Ok(p) => self.handle_sensor_command(&id, &p.command).await,
                    Err(e) => {
                        self.report_sensor_error(&id, &e.to_string()).await;
                    }
                }
                None
            }
            Route::SensorConfig { id } => {
                match decode_parameter_writes(channel, payload) {
                    Ok(writes) => self.handle_sensor_config(&id, writes).await,
                    Err(e) => {
                        self.report_sensor_error(&id, &e.to_string()).await;
                    }
                }
                None
            }
        }
    }

    async fn handle_system_command(&mut self, command: &str) -> Option<RunExit> {
        info!(command, "system command");
        match command {
            "reboot" | "restart" => {
                self.set_state(DeviceState::Restarting);
                self.publish_device_state().await;
                Some(RunExit::Restart)
            }
            "shutdown" => {
                self.set_state(DeviceState::Restarting);
                self.publish_device_state().await;
                Some(RunExit::Shutdown)
            }
            "info" => {
                self.publish_sensor_info().await;
                None
            }
            "factory_reset" => {
                if self.config.system.enable_factory_reset {
                    self.registry.reset_all();
                    self.next_poll.clear();
                    self.publish_device_state().await;
                } else {
                    self.report(ErrorRecord::error(
                        "system",
                        "factory_reset rejected: disabled by configuration",
                    ))
                    .await;
                }
                None
            }
            other => {
                self.report(ErrorRecord::error(
                    "system",
                    format!("unknown command '{other}'"),
                ))
                .await;
                None
            }
        }
    }

    async fn handle_sensor_command(&mut self, id: &str, command: &str) {
        match self.registry.control(id, command) {
            Ok(ControlOutcome::Done) => {
                self.publish_sensor_state(id).await;
            }
            Ok(ControlOutcome::SelfTest { passed }) => {
                let body = serde_json::json!({ "self_test": passed });
                if let Err(e) = self.router.publish_sensor_state(id, &body).await {
                    self.report(ErrorRecord::warning("router", e.to_string())).await;
                }
            }
            Err(e) => {
                self.report_sensor_error(id, &e.to_string()).await;
            }
        }
    }

    async fn handle_sensor_config(&mut self, id: &str, writes: crate::model::ParameterMap) {
        let mut changed = false;
        for (key, value) in writes {
            match self.registry.write(id, &key, value) {
                Ok(()) => changed = true,
                Err(e) => self.report_sensor_error(id, &e.to_string()).await,
            }
        }
        if changed {
            self.publish_sensor_state(id).await;
        }
    }

    fn apply_power_config(&mut self, update: PowerConfigPayload) {
        if let Some(secs) = update.deep_sleep_interval {
            let interval = Duration::from_secs(secs.max(1));
            info!(seconds = interval.as_secs(), "deep sleep interval updated");
            self.deep_sleep_interval = interval;
        }
        if let Some(secs) = update.watchdog_timeout {
            info!(seconds = secs, "watchdog timeout updated");
            self.watchdog.start(Duration::from_secs(secs));
        }
    }

    // ── Sensor polling ──────────────────────────────────────────────

    async fn poll_due_sensors(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .map(|status| status.id)
            .filter(|id| self.next_poll.get(id).is_none_or(|at| *at <= now))
            .collect();

        for id in due {
            let interval = self
                .registry
                .unit(&id)
                .and_then(|unit| unit.report_interval())
                .unwrap_or(DEFAULT_REPORT_INTERVAL);
            self.next_poll.insert(id.clone(), now + interval);

            match self.registry.poll(&id) {
                Ok(None) => {}
                Ok(Some(sample)) => {
                    let health = self
                        .registry
                        .unit(&id)
                        .map_or(Health::Failed, |unit| unit.health());
                    // A sticky-failed unit keeps polling but its samples
                    // stay local.
                    if health != Health::Failed && !self.offline {
                        if let Err(e) = self.router.publish_sensor_data(&id, &sample).await {
                            self.report(ErrorRecord::warning("router", e.to_string())).await;
                        }
                    }
                    debug!(id = %id, values = sample.values.len(), "sample collected");
                }
                Err(e) => {
                    self.report_sensor_error(&id, &e.to_string()).await;
                }
            }
        }
    }

    /// Aggregate device state: connectivity problems or an unhealthy
    /// quorum (more than half of units) degrade the device.
    fn aggregate_state(&self) -> DeviceState {
        if self.offline {
            return DeviceState::Degraded;
        }

        let statuses = self.registry.list();
        let unhealthy = statuses
            .iter()
            .filter(|s| s.health != Health::Ok)
            .count();
        if !statuses.is_empty() && unhealthy * 2 > statuses.len() {
            DeviceState::Degraded
        } else {
            DeviceState::Operating
        }
    }

    // ── Reporting and publishing ────────────────────────────────────

    fn drain_link_warnings(&mut self) {
        for message in self.link.take_attempt_warnings() {
            self.reporter.record(ErrorRecord::warning("link", message));
        }
    }

    /// Record an error and forward it per policy. A fatal record ends
    /// the current cycle with the fatal transition, regardless of the
    /// publish gate (link failures have their own path, carrying the
    /// configured action).
    async fn report(&mut self, record: ErrorRecord) {
        let outcome = self.reporter.record(record.clone());
        if outcome.publish && !self.offline {
            if let Err(e) = self.router.publish_system_error(&record).await {
                warn!(error = %e, "error publish failed");
            }
        }
        if outcome.fatal {
            self.fatal_pending = true;
        }
    }

    async fn report_sensor_error(&mut self, id: &str, message: &str) {
        let record = ErrorRecord::error(format!("sensor:{id}"), message);
        self.report(record.clone()).await;
        if !self.offline {
            if let Err(e) = self.router.publish_sensor_error(id, &record).await {
                warn!(error = %e, "sensor error publish failed");
            }
        }
    }

    async fn publish_device_state(&mut self) {
        let state = *self.state.borrow();
        let statuses = self.registry.list();
        if let Err(e) = self.router.publish_system_state(state, &statuses).await {
            warn!(error = %e, "state publish failed");
        }
    }

    async fn publish_sensor_state(&mut self, id: &str) {
        let Some(unit) = self.registry.unit(id) else {
            return;
        };
        let body = serde_json::json!({
            "health": unit.health(),
            "enabled": unit.is_enabled(),
            "params": unit.params(),
        });
        if let Err(e) = self.router.publish_sensor_state(id, &body).await {
            self.report(ErrorRecord::warning("router", e.to_string())).await;
        }
    }

    /// One-time identity publish per unit after connect: type, fixed
    /// parameters, and what the unit can do.
    async fn publish_sensor_info(&mut self) {
        let infos: Vec<(String, serde_json::Value)> = self
            .registry
            .list()
            .into_iter()
            .filter_map(|status| {
                self.registry.unit(&status.id).map(|unit| {
                    let d = unit.descriptor();
                    let body = serde_json::json!({
                        "type": d.type_tag,
                        "read_only": d.parameters.read_only,
                        "defaults": d.parameters.defaults,
                        "capabilities": {
                            "read": d.capabilities.read,
                            "write": d.capabilities.write,
                            "control": d.capabilities.control,
                        },
                    });
                    (status.id, body)
                })
            })
            .collect();

        for (id, body) in infos {
            if let Err(e) = self.router.publish_sensor_info(&id, &body).await {
                self.report(ErrorRecord::warning("router", e.to_string())).await;
            }
        }
    }
}

/// Result of a session connect episode that did not succeed cleanly.
enum SessionOutcome {
    Exit(RunExit),
    Offline,
}

impl SessionOutcome {
    fn into_exit(self) -> Option<RunExit> {
        match self {
            Self::Exit(exit) => Some(exit),
            Self::Offline => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DeviceConfig, SystemPublishTopics, SystemSettings, SystemSubscribeTopics, SystemTopics,
    };
    use crate::config::{ErrorPolicy, HealthPolicy, PowerPolicy};
    use crate::driver::{DriverError, SensorDriver};
    use mote_link::{
        Endpoint, LinkCredentials, ReconnectPolicy, SessionOptions, SimBroker, SimLink,
    };
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    struct StaticDriver;
    impl SensorDriver for StaticDriver {
        fn read(&mut self, capability: &str) -> Result<serde_json::Value, DriverError> {
            Ok(serde_json::json!(format!("{capability}-ok")))
        }
    }

    fn drivers() -> DriverSet {
        let mut set = DriverSet::new();
        set.register("static", |_| Ok(Box::new(StaticDriver) as Box<dyn SensorDriver>));
        set
    }

    fn config(action: FailureAction, sensors: Vec<crate::config::SensorDescriptor>) -> DeviceConfig {
        DeviceConfig {
            credentials: LinkCredentials {
                ssid: "net".into(),
                password: SecretString::from("pw".to_string()),
            },
            reconnect: ReconnectPolicy {
                interval: Duration::from_millis(10),
                max_retries: 2,
                failure_action: action,
            },
            endpoint: Endpoint::new("broker.local", 1883),
            session: SessionOptions {
                client_id: "node-1".into(),
                ..SessionOptions::default()
            },
            system: SystemSettings {
                enable_factory_reset: true,
                topics: SystemTopics {
                    publish: SystemPublishTopics {
                        state: Some("nodes/n1/state".into()),
                        errors: Some("nodes/n1/errors".into()),
                    },
                    subscribe: SystemSubscribeTopics {
                        commands: Some("nodes/n1/commands".into()),
                        power_config: Some("nodes/n1/power".into()),
                    },
                },
                error_handling: ErrorPolicy {
                    post_global_errors: true,
                    auto_restart_on_error: true,
                    ring_capacity: 16,
                },
                power: PowerPolicy {
                    deep_sleep_interval: Duration::from_secs(15),
                    watchdog_timeout: Duration::ZERO,
                },
            },
            health: HealthPolicy::default(),
            sensors,
        }
    }

    fn sensor(id: &str) -> crate::config::SensorDescriptor {
        use crate::config::{
            CapabilitySets, ParameterSets, SensorDescriptor, SensorPublishTopics,
            SensorSubscribeTopics, SensorTopics,
        };
        SensorDescriptor {
            id: id.into(),
            type_tag: "static".into(),
            args: crate::model::ParameterMap::new(),
            topics: SensorTopics {
                publish: SensorPublishTopics {
                    state: Some(format!("nodes/n1/{id}/state")),
                    info: Some(format!("nodes/n1/{id}/info")),
                    data: Some(format!("nodes/n1/{id}/data")),
                    errors: Some(format!("nodes/n1/{id}/errors")),
                },
                subscribe: SensorSubscribeTopics {
                    commands: Some(format!("nodes/n1/{id}/cmd")),
                    config: Some(format!("nodes/n1/{id}/cfg")),
                },
            },
            parameters: ParameterSets {
                editable: [("report_interval".to_string(), serde_json::json!(60))]
                    .into_iter()
                    .collect(),
                read_only: crate::model::ParameterMap::new(),
                defaults: [("report_interval".to_string(), serde_json::json!(60))]
                    .into_iter()
                    .collect(),
            },
            capabilities: CapabilitySets {
                read: vec!["value".into()],
                write: vec!["report_interval".into()],
                control: vec!["enable".into(), "disable".into(), "self_test".into(), "factory_reset".into()],
            },
        }
    }

    fn agent(
        cfg: DeviceConfig,
        link: SimLink,
        broker: SimBroker,
        cancel: CancellationToken,
    ) -> DeviceAgent<SimLink, SimBroker> {
        DeviceAgent::new(cfg, link, broker, &drivers(), Box::new(NoopWatchdog), cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn boots_connects_and_publishes() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Restart, vec![sensor("s1")]),
            link,
            broker.clone(),
            cancel.clone(),
        );
        let states = a.state();

        let handle = tokio::spawn(a.run());

        // Two cycles, then stop.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(*states.borrow(), DeviceState::Operating);
        cancel.cancel();
        let exit = handle.await.expect("join");
        assert_eq!(exit, RunExit::Cancelled);

        assert!(!broker.published_on("nodes/n1/s1/data").is_empty());
        assert!(!broker.published_on("nodes/n1/s1/info").is_empty());
        assert!(!broker.published_on("nodes/n1/state").is_empty());
        assert!(broker.subscriptions().contains(&"nodes/n1/commands".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_with_restart_action_exits_restart() {
        let link = SimLink::new();
        link.fail_next_associations(u32::MAX);
        let broker = SimBroker::new();
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Restart, vec![]),
            link,
            broker,
            cancel,
        );

        let exit = a.run().await;
        assert_eq!(exit, RunExit::Restart);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_with_shutdown_action_exits_shutdown() {
        let link = SimLink::new();
        link.fail_next_associations(u32::MAX);
        let broker = SimBroker::new();
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Shutdown, vec![]),
            link,
            broker,
            cancel,
        );

        assert_eq!(a.run().await, RunExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn continue_action_operates_offline() {
        let link = SimLink::new();
        link.fail_next_associations(u32::MAX);
        let broker = SimBroker::new();
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Continue, vec![sensor("s1")]),
            link,
            broker.clone(),
            cancel.clone(),
        );
        let states = a.state();

        let handle = tokio::spawn(a.run());
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(*states.borrow(), DeviceState::Degraded);
        // Nothing reaches the broker while offline.
        assert!(broker.published().is_empty());

        cancel.cancel();
        assert_eq!(handle.await.expect("join"), RunExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn system_reboot_command_exits_restart() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        broker.push_inbound("nodes/n1/commands", br#"{"command":"reboot"}"#.to_vec());
        let cancel = CancellationToken::new();
        let a = agent(config(FailureAction::Restart, vec![]), link, broker, cancel);

        assert_eq!(a.run().await, RunExit::Restart);
    }

    #[tokio::test(start_paused = true)]
    async fn unroutable_message_is_reported_not_fatal() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        broker.push_inbound("nodes/other/commands", b"{}".to_vec());
        let cancel = CancellationToken::new();
        let a = agent(config(FailureAction::Restart, vec![]), link, broker.clone(), cancel.clone());

        let handle = tokio::spawn(a.run());
        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        assert_eq!(handle.await.expect("join"), RunExit::Cancelled);

        // The drop was forwarded to the errors channel.
        let errors = broker.published_on("nodes/n1/errors");
        assert!(
            errors
                .iter()
                .any(|p| String::from_utf8_lossy(p).contains("unroutable_message"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_config_write_updates_parameter() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        broker.push_inbound("nodes/n1/s1/cfg", br#"{"report_interval": 30}"#.to_vec());
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Restart, vec![sensor("s1")]),
            link,
            broker.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(a.run());
        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        handle.await.expect("join");

        let states = broker.published_on("nodes/n1/s1/state");
        let last: serde_json::Value =
            serde_json::from_slice(states.last().expect("state published")).expect("json");
        assert_eq!(last["params"]["report_interval"], 30);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_write_is_published_on_sensor_errors() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        broker.push_inbound("nodes/n1/s1/cfg", br#"{"model": "hacked"}"#.to_vec());
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Restart, vec![sensor("s1")]),
            link,
            broker.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(a.run());
        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        handle.await.expect("join");

        let errors = broker.published_on("nodes/n1/s1/errors");
        assert!(
            errors
                .iter()
                .any(|p| String::from_utf8_lossy(p).contains("not editable"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn power_config_updates_sleep_interval() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        broker.push_inbound("nodes/n1/power", br#"{"deep_sleep_interval": 2}"#.to_vec());
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Restart, vec![sensor("s1")]),
            link,
            broker.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(a.run());
        // With a 2s cycle the agent gets many more cycles into 60s than
        // the configured 15s interval would allow.
        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        handle.await.expect("join");

        let state_publishes = broker.published_on("nodes/n1/state").len();
        assert!(state_publishes > 10, "got {state_publishes} state publishes");
    }

    #[tokio::test(start_paused = true)]
    async fn link_drop_triggers_reconnect_and_resubscribe() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Restart, vec![]),
            link.clone(),
            broker.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(a.run());
        tokio::time::sleep(Duration::from_secs(20)).await;

        let before = broker.subscriptions().len();
        link.drop_link();
        broker.drop_session();
        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        handle.await.expect("join");

        assert!(link.associate_calls() >= 2);
        assert!(broker.subscriptions().len() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn instantiation_failure_reported_but_agent_runs() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        let mut bad = sensor("ghost");
        bad.type_tag = "unknown".into();
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Restart, vec![sensor("s1"), bad]),
            link,
            broker.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(a.run());
        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        handle.await.expect("join");

        // Healthy unit keeps publishing; device state lists both.
        assert!(!broker.published_on("nodes/n1/s1/data").is_empty());
        let states = broker.published_on("nodes/n1/state");
        let last: serde_json::Value =
            serde_json::from_slice(states.last().expect("state")).expect("json");
        assert_eq!(last["sensors"].as_array().expect("array").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_report_escalates_even_when_publishing_is_off() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        let cancel = CancellationToken::new();
        let mut cfg = config(FailureAction::Restart, vec![]);
        cfg.system.error_handling.post_global_errors = false;
        let mut a = agent(cfg, link, broker.clone(), cancel);
        let states = a.state();

        a.report(ErrorRecord::fatal("system", "unrecoverable fault")).await;
        let exit = a.operating_cycle().await;

        assert_eq!(exit, Some(RunExit::Restart));
        assert_eq!(*states.borrow(), DeviceState::Restarting);
        // Suppressed from the errors channel, escalated all the same.
        assert!(broker.published_on("nodes/n1/errors").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_report_without_auto_restart_parks_for_intervention() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        let cancel = CancellationToken::new();
        let mut cfg = config(FailureAction::Restart, vec![]);
        cfg.system.error_handling.auto_restart_on_error = false;
        let mut a = agent(cfg, link, broker, cancel.clone());
        let states = a.state();

        a.report(ErrorRecord::fatal("system", "unrecoverable fault")).await;
        let handle = tokio::spawn(async move { a.operating_cycle().await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*states.borrow(), DeviceState::AwaitingIntervention);

        cancel.cancel();
        assert_eq!(handle.await.expect("join"), Some(RunExit::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn info_command_republishes_sensor_info() {
        let link = SimLink::new();
        let broker = SimBroker::new();
        let cancel = CancellationToken::new();
        let a = agent(
            config(FailureAction::Restart, vec![sensor("s1")]),
            link,
            broker.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(a.run());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(broker.published_on("nodes/n1/s1/info").len(), 1);

        broker.push_inbound("nodes/n1/commands", br#"{"command":"info"}"#.to_vec());
        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();
        assert_eq!(handle.await.expect("join"), RunExit::Cancelled);

        assert_eq!(broker.published_on("nodes/n1/s1/info").len(), 2);
    }
}
