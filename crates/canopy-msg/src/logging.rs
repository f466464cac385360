//! ---
//! canopy_section: "02-wire-protocol"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Structured trace records for streaming frames."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use tracing::debug;

use crate::types::{OutboundCommand, TelemetryEvent};

/// Direction of a frame, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// Frame written to the backend.
    Outbound,
    /// Frame read from the backend.
    Inbound,
}

/// Emit a structured log entry for an inbound envelope.
pub fn log_event(event: &TelemetryEvent) {
    debug!(
        event = event.name(),
        agent_id = event.agent_id.as_deref().unwrap_or("-"),
        timestamp = event.timestamp.as_deref().unwrap_or("-"),
        direction = ?FrameDirection::Inbound,
        "streaming frame"
    );
}

/// Emit a structured log entry for an outbound command.
pub fn log_command(command: &OutboundCommand, sequence: u64) {
    debug!(
        command = %command.command,
        sequence,
        direction = ?FrameDirection::Outbound,
        "streaming frame"
    );
}
