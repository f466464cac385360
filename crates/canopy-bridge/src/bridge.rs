//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Owned bridge instance routing backend traffic to its components."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::sync::Arc;

use canopy_common::ConsoleConfig;
use canopy_msg::{
    ActuatorRequest, ActuatorResponse, ActuatorValue, EventClass, GoalRequest, SettingsFields,
    SettingsSnapshot, StatusResponse,
};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::autosave::SettingsAutosave;
use crate::dispatcher::CommandDispatcher;
use crate::error::{CommandError, CommandRejection, PersistenceError, RpcError};
use crate::events::{BridgeEvent, EventBus, Subscription};
use crate::metrics::BridgeMetrics;
use crate::overrides::{ActuatorRegistry, OverrideConfirmation, TelemetryOutcome};
use crate::rpc::{BackendRpc, HttpBackend};
use crate::transport::{ConnectionState, TransportConnection, TransportSignal};
use crate::watchdog::{HeartbeatRecord, HeartbeatWatchdog};

/// Outcome of an accepted actuator command.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorAck {
    /// Actuator name.
    pub name: String,
    /// Value the backend confirmed.
    pub value: ActuatorValue,
    /// Whether the override was newly engaged.
    pub confirmation: OverrideConfirmation,
}

struct Router {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The console's single connection to the backend.
///
/// Owns the streaming channel, the liveness watchdog, the override registry and
/// the settings pipeline. Renderers subscribe to [`BridgeEvent`]s and call the
/// operator methods; they hold no state of their own.
pub struct TelemetryBridge {
    transport: TransportConnection,
    watchdog: Arc<HeartbeatWatchdog>,
    registry: Arc<ActuatorRegistry>,
    dispatcher: CommandDispatcher,
    autosave: SettingsAutosave,
    rpc: Arc<dyn BackendRpc>,
    events: EventBus,
    router: Mutex<Option<Router>>,
}

impl TelemetryBridge {
    /// Assemble a bridge for `config`, using `rpc` for request/response calls.
    pub fn new(
        config: &ConsoleConfig,
        rpc: Arc<dyn BackendRpc>,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let url = config.backend.websocket_url()?;
        let events = EventBus::new(config.events.capacity);
        let transport = TransportConnection::new(
            url.as_str(),
            config.backend.reconnect_delay,
            metrics.clone(),
        );
        let watchdog = Arc::new(HeartbeatWatchdog::new(
            config.watchdog.window,
            events.clone(),
            metrics.clone(),
        ));
        let dispatcher = CommandDispatcher::new(transport.clone(), metrics.clone());
        let autosave = SettingsAutosave::new(
            Arc::clone(&rpc),
            config.autosave.debounce,
            events.clone(),
            metrics,
        );

        Ok(Self {
            transport,
            watchdog,
            registry: Arc::new(ActuatorRegistry::new()),
            dispatcher,
            autosave,
            rpc,
            events,
            router: Mutex::new(None),
        })
    }

    /// Assemble a bridge talking HTTP to the configured backend.
    pub fn with_http_backend(
        config: &ConsoleConfig,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> anyhow::Result<Self> {
        let rpc = HttpBackend::from_config(&config.backend)?;
        Self::new(config, Arc::new(rpc), metrics)
    }

    /// Arm the watchdog, start routing and open the channel. No-op when running.
    pub fn start(&self) {
        {
            let mut router = self.router.lock();
            if router.is_some() {
                return;
            }
            self.watchdog.start();
            let signals = self.transport.subscribe();
            let (shutdown, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(route_signals(
                signals,
                shutdown_rx,
                Arc::clone(&self.watchdog),
                Arc::clone(&self.registry),
                self.events.clone(),
            ));
            *router = Some(Router { shutdown, task });
        }
        self.transport.connect();
        info!(url = %self.transport.url(), "bridge started");
    }

    /// Save pending drafts, then close the channel and stop all background tasks.
    pub async fn stop(&self) {
        for (section, result) in self.close_all_settings().await {
            if result.is_err() {
                warn!(section = %section, "unsaved settings discarded at shutdown");
            }
        }
        self.transport.stop().await;

        let router = self.router.lock().take();
        if let Some(router) = router {
            let _ = router.shutdown.send(true);
            if let Err(err) = router.task.await {
                warn!(error = %err, "bridge router ended abnormally");
            }
        }
        self.watchdog.stop().await;
        info!("bridge stopped");
    }

    /// Register a renderer.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Streaming channel state.
    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Backend liveness.
    pub fn liveness(&self) -> HeartbeatRecord {
        self.watchdog.record()
    }

    /// Arbitrated actuator state.
    pub fn registry(&self) -> &ActuatorRegistry {
        &self.registry
    }

    /// Send a fire-and-forget command over the streaming channel.
    pub async fn submit_command(
        &self,
        command: &str,
        payload: JsonValue,
    ) -> Result<u64, CommandError> {
        Ok(self.dispatcher.submit(command, payload).await?)
    }

    /// Probe the backend over the streaming channel.
    pub async fn ping(&self) -> Result<u64, CommandError> {
        Ok(self.dispatcher.ping().await?)
    }

    /// Force `name` to `value`. The registry changes only once the backend accepts.
    pub async fn set_actuator(
        &self,
        name: &str,
        value: ActuatorValue,
    ) -> Result<ActuatorAck, CommandError> {
        let response = self.actuator_call(ActuatorRequest::set(name, value)).await?;
        Ok(self.engage(name, response.value.unwrap_or(value)))
    }

    /// Invert `name`. Unknown actuators count as off.
    pub async fn toggle_actuator(&self, name: &str) -> Result<ActuatorAck, CommandError> {
        let expected = self.registry.toggled_value(name);
        let response = self
            .actuator_call(ActuatorRequest::toggle(name, expected))
            .await?;
        Ok(self.engage(name, response.value.unwrap_or(expected)))
    }

    /// Hand `name` back to autonomous control. Returns whether it was overridden.
    pub async fn clear_override(&self, name: &str) -> Result<bool, CommandError> {
        self.actuator_call(ActuatorRequest::clear_override(name))
            .await?;
        let released = self.registry.clear_override(name);
        if released {
            info!(actuator = name, "manual override released");
            self.events.publish(BridgeEvent::OverrideReleased {
                name: name.to_owned(),
            });
        }
        Ok(released)
    }

    /// Hand every actuator back to autonomous control. Returns the released names.
    pub async fn clear_all_overrides(&self) -> Result<Vec<String>, CommandError> {
        self.actuator_call(ActuatorRequest::clear_all()).await?;
        let released = self.registry.clear_all();
        info!(count = released.len(), "all manual overrides released");
        for name in &released {
            self.events.publish(BridgeEvent::OverrideReleased { name: name.clone() });
        }
        Ok(released)
    }

    /// Hand a free-form goal to the backend planner.
    pub async fn submit_goal(&self, goal: &str) -> Result<Option<JsonValue>, CommandError> {
        let request = GoalRequest {
            goal: goal.to_owned(),
        };
        let response = self.rpc.submit_goal(&request).await.map_err(|err| {
            warn!(error = %err, "goal submission failed");
            err
        })?;
        if let Some(reason) = response.rejection() {
            return Err(self.reject("goal", Some(goal.to_owned()), reason).into());
        }
        info!(goal, "goal accepted");
        Ok(response.result)
    }

    /// Coarse backend health.
    pub async fn backend_status(&self) -> Result<StatusResponse, RpcError> {
        self.rpc.status().await
    }

    /// Persisted settings of every section.
    pub async fn load_settings(&self) -> Result<SettingsSnapshot, RpcError> {
        self.rpc.load_settings().await
    }

    /// Record a settings edit; it is saved once edits to the section go quiet.
    pub fn edit_setting(&self, section: &str, field: &str, value: JsonValue) {
        self.autosave.edit(section, field, value);
    }

    /// The editing surface for `section` closed: save now.
    pub async fn close_settings(&self, section: &str) -> Result<Option<String>, PersistenceError> {
        self.autosave.close(section).await
    }

    /// Save every section with unsaved edits now.
    pub async fn close_all_settings(
        &self,
    ) -> Vec<(String, Result<Option<String>, PersistenceError>)> {
        self.autosave.close_all().await
    }

    /// Unsaved fields of `section`.
    pub fn pending_settings(&self, section: &str) -> Option<SettingsFields> {
        self.autosave.draft(section)
    }

    /// Sections with unsaved edits.
    pub fn pending_sections(&self) -> Vec<String> {
        self.autosave.pending_sections()
    }

    async fn actuator_call(&self, request: ActuatorRequest) -> Result<ActuatorResponse, CommandError> {
        let response = self.rpc.actuator(&request).await.map_err(|err| {
            warn!(action = request.action.as_str(), actuator = ?request.name, error = %err, "actuator command failed");
            err
        })?;
        if response.is_success() {
            return Ok(response);
        }
        Err(self
            .reject(request.action.as_str(), request.name.clone(), response.rejection_reason())
            .into())
    }

    fn reject(&self, command: &str, target: Option<String>, reason: String) -> CommandRejection {
        let rejection = CommandRejection {
            command: command.to_owned(),
            target,
            reason,
        };
        warn!(%rejection, "backend rejected command");
        self.events
            .publish(BridgeEvent::CommandRejected(rejection.clone()));
        rejection
    }

    fn engage(&self, name: &str, value: ActuatorValue) -> ActuatorAck {
        let confirmation = self.registry.set_override(name, value);
        info!(actuator = name, value = %value, ?confirmation, "manual override applied");
        if confirmation == OverrideConfirmation::Engaged {
            self.events.publish(BridgeEvent::OverrideEngaged {
                name: name.to_owned(),
                value,
            });
        }
        ActuatorAck {
            name: name.to_owned(),
            value,
            confirmation,
        }
    }
}

async fn route_signals(
    mut signals: broadcast::Receiver<TransportSignal>,
    mut shutdown: watch::Receiver<bool>,
    watchdog: Arc<HeartbeatWatchdog>,
    registry: Arc<ActuatorRegistry>,
    events: EventBus,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            signal = signals.recv() => match signal {
                Ok(signal) => route(signal, &watchdog, &registry, &events),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bridge router lagged behind the channel; frames lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    // Deliver what the channel emitted while shutting down, e.g. the final Closed.
    while let Ok(signal) = signals.try_recv() {
        route(signal, &watchdog, &registry, &events);
    }
}

fn route(
    signal: TransportSignal,
    watchdog: &HeartbeatWatchdog,
    registry: &ActuatorRegistry,
    events: &EventBus,
) {
    match signal {
        TransportSignal::State(state) => {
            events.publish(BridgeEvent::Connection(state));
        }
        TransportSignal::Inbound(event) => {
            match event.classify() {
                EventClass::Heartbeat(beat) => watchdog.observe(beat),
                EventClass::Telemetry => {
                    for (name, value) in event.actuator_readings() {
                        if registry.apply_telemetry(&name, value) == TelemetryOutcome::Shadowed {
                            debug!(actuator = %name, reading = %value, "telemetry shadowed by manual override");
                        }
                    }
                }
                EventClass::Workflow | EventClass::Other => {}
            }
            events.publish(BridgeEvent::Telemetry(event));
        }
    }
}
