//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Telemetry/control bridge between the operator console and the backend."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Keeps the console synchronised with the backend controller: one self-healing
//! streaming channel, a heartbeat watchdog, actuator override arbitration, and
//! debounced settings persistence.

pub mod autosave;
pub mod bridge;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod metrics;
pub mod overrides;
pub mod rpc;
pub mod transport;
pub mod watchdog;

pub use autosave::SettingsAutosave;
pub use bridge::{ActuatorAck, TelemetryBridge};
pub use dispatcher::CommandDispatcher;
pub use error::{CommandError, CommandRejection, PersistenceError, RpcError, TransportError};
pub use events::{BridgeEvent, EventBus, Subscription};
pub use metrics::BridgeMetrics;
pub use overrides::{
    Actuator, ActuatorMode, ActuatorRegistry, OverrideConfirmation, TelemetryOutcome,
};
pub use rpc::{BackendRpc, HttpBackend};
pub use transport::{ConnectionState, TransportConnection, TransportSignal};
pub use watchdog::{HeartbeatRecord, HeartbeatWatchdog, LivenessState, LivenessTracker};
