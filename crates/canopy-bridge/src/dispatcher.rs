//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Fire-and-forget operator commands over the streaming channel."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canopy_msg::{log_command, OutboundCommand};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::TransportError;
use crate::metrics::BridgeMetrics;
use crate::transport::TransportConnection;

/// Serialises operator commands onto the [`TransportConnection`].
///
/// Commands go out in submission order. There is no deduplication and no retry:
/// a command submitted while the channel is down is dropped and reported.
pub struct CommandDispatcher {
    transport: TransportConnection,
    sequence: AtomicU64,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl CommandDispatcher {
    /// Dispatcher writing to `transport`.
    pub fn new(transport: TransportConnection, metrics: Option<Arc<BridgeMetrics>>) -> Self {
        Self {
            transport,
            sequence: AtomicU64::new(0),
            metrics,
        }
    }

    /// Send `{command, payload}`. Resolves once the frame is written, not when the
    /// backend acts on it. Returns the console-local sequence number.
    pub async fn submit(&self, command: &str, payload: JsonValue) -> Result<u64, TransportError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = OutboundCommand::new(command, payload);
        let text = envelope
            .to_wire()
            .map_err(|err| TransportError::Encode(err.to_string()))?;

        match self.transport.send(text).await {
            Ok(()) => {
                log_command(&envelope, sequence);
                if let Some(metrics) = &self.metrics {
                    metrics.observe_command_sent();
                }
                Ok(sequence)
            }
            Err(err) => {
                warn!(command, sequence, error = %err, "command dropped");
                if let Some(metrics) = &self.metrics {
                    metrics.observe_command_dropped();
                }
                Err(err)
            }
        }
    }

    /// Liveness probe; the backend answers with a `PONG` event.
    pub async fn ping(&self) -> Result<u64, TransportError> {
        self.submit("PING", JsonValue::Object(Default::default()))
            .await
    }
}
