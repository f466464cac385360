//! ---
//! canopy_section: "02-wire-protocol"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Request/response bodies for the backend HTTP endpoints."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::types::ActuatorValue;

/// Status string the backend uses for accepted requests.
pub const STATUS_SUCCESS: &str = "success";

/// Field values of one settings section, in edit order.
pub type SettingsFields = IndexMap<String, JsonValue>;

/// All persisted settings keyed by section.
pub type SettingsSnapshot = IndexMap<String, SettingsFields>;

/// Verb carried by `POST /api/actuator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorAction {
    /// Force a value and engage the override.
    Set,
    /// Invert the current state and engage the override.
    Toggle,
    /// Return one actuator to autonomous control.
    ClearOverride,
    /// Return every actuator to autonomous control.
    ClearAll,
}

impl ActuatorAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Toggle => "toggle",
            Self::ClearOverride => "clear_override",
            Self::ClearAll => "clear_all",
        }
    }
}

/// Body of `POST /api/actuator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorRequest {
    /// Target actuator. Absent for [`ActuatorAction::ClearAll`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Requested value for `set`, expected value for `toggle`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ActuatorValue>,
    /// Requested action.
    pub action: ActuatorAction,
}

impl ActuatorRequest {
    /// Force `name` to `value`.
    pub fn set(name: impl Into<String>, value: ActuatorValue) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(value),
            action: ActuatorAction::Set,
        }
    }

    /// Toggle `name`, announcing the value the console expects to land on.
    pub fn toggle(name: impl Into<String>, expected: ActuatorValue) -> Self {
        Self {
            name: Some(name.into()),
            value: Some(expected),
            action: ActuatorAction::Toggle,
        }
    }

    /// Release the override on `name`.
    pub fn clear_override(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            value: None,
            action: ActuatorAction::ClearOverride,
        }
    }

    /// Release every override.
    pub fn clear_all() -> Self {
        Self {
            name: None,
            value: None,
            action: ActuatorAction::ClearAll,
        }
    }
}

/// Response of `POST /api/actuator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorResponse {
    /// `success` when the backend applied the command.
    #[serde(default)]
    pub status: String,
    /// Value the backend applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ActuatorValue>,
    /// Whether the actuator is now under manual override.
    #[serde(default)]
    pub override_active: bool,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActuatorResponse {
    /// Whether the backend accepted the command.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS && self.error.is_none()
    }

    /// Human readable rejection reason.
    pub fn rejection_reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("backend answered status '{}'", self.status))
    }
}

/// Body of `POST /api/settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRequest {
    /// Settings section (modal type).
    #[serde(rename = "type")]
    pub section: String,
    /// Full accumulated draft of the section.
    pub settings: SettingsFields,
}

/// Response of `POST /api/settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsResponse {
    /// `success` when the backend persisted the section.
    #[serde(default)]
    pub status: String,
    /// Backend-computed checksum confirming what was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<String>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SettingsResponse {
    /// Checksum of a successful save. `None` unless the save is verified.
    pub fn verified_bcc(&self) -> Option<&str> {
        if self.status != STATUS_SUCCESS {
            return None;
        }
        self.bcc.as_deref().filter(|bcc| !bcc.trim().is_empty())
    }
}

/// Body of `POST /api/goal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalRequest {
    /// Free-form operator goal.
    pub goal: String,
}

/// Response of `POST /api/goal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalResponse {
    /// `success` when the backend accepted the goal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Planner output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GoalResponse {
    /// Rejection reason, if the backend refused the goal.
    pub fn rejection(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        match self.status.as_deref() {
            Some(STATUS_SUCCESS) | None => None,
            Some(other) => Some(format!("backend answered status '{other}'")),
        }
    }
}

/// Coarse backend health from `GET /api/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Control loop running.
    Online,
    /// Partially functional.
    Degraded,
    /// Not serving.
    Offline,
}

/// Response of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Coarse health.
    pub status: BackendStatus,
    /// Backend uptime as reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<JsonValue>,
}
