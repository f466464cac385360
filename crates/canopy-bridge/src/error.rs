//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Error taxonomy for the telemetry/control bridge."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::fmt;

use serde::Serialize;

/// Failures writing to the streaming channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No open channel; the frame was not queued.
    #[error("streaming channel is not open")]
    NotOpen,
    /// The channel went away before the frame reached the socket.
    #[error("streaming channel closed before the frame was written")]
    Closed,
    /// The frame could not be serialised.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Failures on the HTTP request/response channel.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Connection, timeout or protocol failure.
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Backend answered with a non-success HTTP status.
    #[error("backend answered {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// Response body did not match the expected shape.
    #[error("unexpected backend response: {0}")]
    Decode(String),
    /// Endpoint URL could not be built from the configured base.
    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// A settings flush that did not end in a verified save. The draft is retained.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The save request itself failed.
    #[error("settings save for '{section}' failed: {source}")]
    Rpc {
        /// Section being saved.
        section: String,
        /// Underlying failure.
        #[source]
        source: RpcError,
    },
    /// The backend answered without a successful status and checksum.
    #[error("settings save for '{section}' not confirmed: {reason}")]
    Unverified {
        /// Section being saved.
        section: String,
        /// Backend status or error text.
        reason: String,
    },
}

impl PersistenceError {
    /// Section the failed flush belonged to.
    pub fn section(&self) -> &str {
        match self {
            Self::Rpc { section, .. } | Self::Unverified { section, .. } => section,
        }
    }
}

/// The backend refused an operator command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRejection {
    /// Command verb, e.g. `set` or `goal`.
    pub command: String,
    /// Actuator or goal text the command targeted.
    pub target: Option<String>,
    /// Backend-supplied reason.
    pub reason: String,
}

impl fmt::Display for CommandRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} {} rejected: {}", self.command, target, self.reason),
            None => write!(f, "{} rejected: {}", self.command, self.reason),
        }
    }
}

impl std::error::Error for CommandRejection {}

/// Failures of operator commands issued through the bridge.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Fire-and-forget command could not be handed to the channel.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Request/response command failed in transit.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// Backend refused the command; no local state changed.
    #[error(transparent)]
    Rejected(#[from] CommandRejection),
}
