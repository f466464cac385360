//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Typed publish/subscribe bus between the bridge and renderers."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::sync::Arc;

use canopy_msg::{ActuatorValue, TelemetryEvent};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::CommandRejection;
use crate::transport::ConnectionState;
use crate::watchdog::HeartbeatRecord;

/// State change announced by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Streaming channel changed state.
    Connection(ConnectionState),
    /// Watchdog changed liveness state.
    Liveness(HeartbeatRecord),
    /// An inbound envelope, after the bridge has routed it.
    Telemetry(Arc<TelemetryEvent>),
    /// An actuator newly entered manual override.
    OverrideEngaged {
        /// Actuator name.
        name: String,
        /// Forced value.
        value: ActuatorValue,
    },
    /// An actuator returned to autonomous control.
    OverrideReleased {
        /// Actuator name.
        name: String,
    },
    /// A settings section was persisted and verified.
    SettingsSaved {
        /// Section name.
        section: String,
        /// Checksum returned by the backend.
        bcc: String,
    },
    /// A settings flush failed; the draft is still pending.
    SettingsFailed {
        /// Section name.
        section: String,
        /// Failure description.
        reason: String,
    },
    /// The backend refused an operator command.
    CommandRejected(CommandRejection),
}

/// Fan-out of [`BridgeEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Register a new subscriber. It sees events published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A registered listener. Dropping it, or calling [`Subscription::unsubscribe`],
/// detaches it from the bus.
pub struct Subscription {
    rx: broadcast::Receiver<BridgeEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the overwritten events and keeps going.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged behind; dropping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged behind; dropping events");
                }
                Err(_) => return None,
            }
        }
    }

    /// Detach from the bus.
    pub fn unsubscribe(self) {}
}
