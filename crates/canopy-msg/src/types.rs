//! ---
//! canopy_section: "02-wire-protocol"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Streaming envelopes exchanged over the backend websocket."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use serde_with::{serde_as, DefaultOnError, DefaultOnNull};

use crate::{Result, WireError};

/// Event name carried by backend liveness heartbeats.
pub const HEARTBEAT_EVENT: &str = "SYSTEM_HEARTBEAT";
/// Envelope `type` used by actuator/sensor telemetry frames.
pub const GREENHOUSE_TELEMETRY: &str = "GREENHOUSE_TELEMETRY";
/// Workflow progress event forwarded untouched to renderers.
pub const WORKFLOW_UPDATE: &str = "WORKFLOW_UPDATE";

const TELEMETRY_EVENTS: [&str; 3] = [GREENHOUSE_TELEMETRY, "ACTUATOR_TELEMETRY", "TELEMETRY"];

/// Value reported for, or commanded to, an actuator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActuatorValue {
    /// On/off actuators such as pumps and lights.
    Bool(bool),
    /// Proportional actuators such as dosers.
    Number(f64),
}

impl ActuatorValue {
    /// Interpret a JSON scalar as an actuator value.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Bool(flag) => Some(Self::Bool(*flag)),
            JsonValue::Number(number) => number.as_f64().map(Self::Number),
            _ => None,
        }
    }

    /// Whether the actuator is currently energised.
    pub fn is_on(&self) -> bool {
        match self {
            Self::Bool(flag) => *flag,
            Self::Number(level) => *level != 0.0,
        }
    }
}

impl From<bool> for ActuatorValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for ActuatorValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl fmt::Display for ActuatorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("on"),
            Self::Bool(false) => f.write_str("off"),
            Self::Number(level) => write!(f, "{level}"),
        }
    }
}

/// Inbound envelope pushed by the backend over the streaming channel.
///
/// Only `type` and `event` decide whether a frame is usable. A null `event`
/// reads as absent, and a `timestamp` or `agent_id` of the wrong JSON type is
/// discarded rather than failing the frame.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Optional frame family, e.g. `GREENHOUSE_TELEMETRY`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Event name, e.g. `SYSTEM_HEARTBEAT` or `AGENT_UPDATE`.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: JsonValue,
    /// Backend timestamp, kept verbatim when it is a string.
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Originating agent, when the backend attributes the event.
    #[serde_as(deserialize_as = "DefaultOnError")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// How the bridge routes an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum EventClass {
    /// Liveness signal for the watchdog.
    Heartbeat(Heartbeat),
    /// Actuator/sensor readings for the override registry.
    Telemetry,
    /// Agent or workflow progress, forwarded as-is.
    Workflow,
    /// Anything else, forwarded as-is.
    Other,
}

/// Health the backend reports about itself in a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    /// Backend loop is running normally.
    Alive,
    /// Backend is reachable but its control loop is not progressing.
    Stalled,
}

/// Decoded heartbeat payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    /// Self-reported health.
    pub health: BackendHealth,
    /// Backend uptime in seconds, when reported.
    pub uptime: Option<f64>,
}

impl Heartbeat {
    /// Heartbeat reporting a healthy backend.
    pub fn alive() -> Self {
        Self {
            health: BackendHealth::Alive,
            uptime: None,
        }
    }

    /// Heartbeat reporting a stalled backend.
    pub fn stalled() -> Self {
        Self {
            health: BackendHealth::Stalled,
            uptime: None,
        }
    }
}

impl TelemetryEvent {
    /// Build an envelope for `event` carrying `data`, stamped with the current time.
    pub fn new(event: impl Into<String>, data: JsonValue) -> Self {
        Self {
            kind: None,
            event: event.into(),
            data,
            timestamp: Some(Utc::now().to_rfc3339()),
            agent_id: None,
        }
    }

    /// Heartbeat envelope in the shape the backend emits.
    pub fn heartbeat(health: BackendHealth, uptime: f64) -> Self {
        let status = match health {
            BackendHealth::Alive => "alive",
            BackendHealth::Stalled => "stalled",
        };
        Self::new(
            HEARTBEAT_EVENT,
            serde_json::json!({ "status": status, "uptime": uptime }),
        )
    }

    /// Actuator telemetry envelope carrying `actuators` under `data.actuators`.
    pub fn greenhouse_telemetry(actuators: JsonValue) -> Self {
        let mut event = Self::new(GREENHOUSE_TELEMETRY, serde_json::json!({ "actuators": actuators }));
        event.kind = Some(GREENHOUSE_TELEMETRY.to_owned());
        event
    }

    /// Decode one text frame. Requires a JSON object naming an `event` or `type`.
    pub fn parse(text: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(WireError::NotAnObject);
        }
        let event: TelemetryEvent = serde_json::from_value(value)?;
        if event.event.is_empty() && event.kind.is_none() {
            return Err(WireError::MissingEvent);
        }
        Ok(event)
    }

    /// Encode as a single text frame.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Event name, falling back to the frame `type` for type-only frames.
    pub fn name(&self) -> &str {
        if self.event.is_empty() {
            self.kind.as_deref().unwrap_or_default()
        } else {
            &self.event
        }
    }

    /// Parsed backend timestamp.
    ///
    /// Accepts RFC 3339 as well as naive ISO-8601 timestamps, which are taken as UTC.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Route this envelope.
    pub fn classify(&self) -> EventClass {
        if self.event.eq_ignore_ascii_case(HEARTBEAT_EVENT) || self.event.eq_ignore_ascii_case("heartbeat") {
            return EventClass::Heartbeat(self.decode_heartbeat());
        }
        let is_telemetry = self.kind.as_deref() == Some(GREENHOUSE_TELEMETRY)
            || TELEMETRY_EVENTS.contains(&self.event.as_str());
        if is_telemetry {
            return EventClass::Telemetry;
        }
        if self.event.starts_with("AGENT_") || self.event == WORKFLOW_UPDATE {
            return EventClass::Workflow;
        }
        EventClass::Other
    }

    fn data_object(&self) -> Option<&Map<String, JsonValue>> {
        self.data.as_object()
    }

    fn decode_heartbeat(&self) -> Heartbeat {
        let data = self.data_object();
        let health = match data.and_then(|d| d.get("status")).and_then(JsonValue::as_str) {
            Some(status) if status.eq_ignore_ascii_case("stalled") => BackendHealth::Stalled,
            _ => BackendHealth::Alive,
        };
        let uptime = data.and_then(|d| d.get("uptime")).and_then(JsonValue::as_f64);
        Heartbeat { health, uptime }
    }

    /// Actuator readings carried by a telemetry frame.
    ///
    /// Uses every boolean or numeric entry of `data.actuators` when present.
    /// Flat packets mix sensor readings in with actuator states, so without
    /// `data.actuators` only boolean top-level entries of `data` count.
    pub fn actuator_readings(&self) -> Vec<(String, ActuatorValue)> {
        let Some(data) = self.data_object() else {
            return Vec::new();
        };
        if let Some(actuators) = data.get("actuators").and_then(JsonValue::as_object) {
            return actuators
                .iter()
                .filter_map(|(name, value)| {
                    ActuatorValue::from_json(value).map(|v| (name.clone(), v))
                })
                .collect();
        }
        data.iter()
            .filter_map(|(name, value)| value.as_bool().map(|flag| (name.clone(), flag.into())))
            .collect()
    }
}

/// Outbound operator command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    /// Command verb understood by the backend, e.g. `PING`.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub payload: JsonValue,
}

impl OutboundCommand {
    /// Build a command envelope.
    pub fn new(command: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }

    /// Encode as a single text frame.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
