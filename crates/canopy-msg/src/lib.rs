//! ---
//! canopy_section: "02-wire-protocol"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Wire envelopes exchanged with the greenhouse backend."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Streaming envelopes and HTTP bodies shared by the bridge and the test backend.

pub mod api;
pub mod logging;
pub mod types;

/// Shared result type for wire encoding and decoding.
pub type Result<T> = std::result::Result<T, WireError>;

/// Reasons an inbound frame cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Payload was not valid JSON or did not match the envelope shape.
    #[error("invalid json frame: {0}")]
    Json(#[from] serde_json::Error),
    /// Payload was JSON but not an object.
    #[error("frame is not a json object")]
    NotAnObject,
    /// Object carried neither `event` nor `type`.
    #[error("frame names no event or type")]
    MissingEvent,
}

pub use api::{
    ActuatorAction, ActuatorRequest, ActuatorResponse, BackendStatus, GoalRequest, GoalResponse,
    SettingsFields, SettingsRequest, SettingsResponse, SettingsSnapshot, StatusResponse,
    STATUS_SUCCESS,
};
pub use logging::{log_command, log_event, FrameDirection};
pub use types::{
    ActuatorValue, BackendHealth, EventClass, Heartbeat, OutboundCommand, TelemetryEvent,
    GREENHOUSE_TELEMETRY, HEARTBEAT_EVENT, WORKFLOW_UPDATE,
};
