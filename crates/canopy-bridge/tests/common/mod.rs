//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "tests"
//! canopy_type: "source"
//! canopy_scope: "test"
//! canopy_description: "Shared helpers for bridge integration tests."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::time::Duration;

use canopy_bridge::{
    BridgeEvent, ConnectionState, Subscription, TelemetryBridge, TransportSignal,
};
use canopy_common::ConsoleConfig;
use canopy_testharness::MockBackend;
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config_for(backend: &MockBackend) -> ConsoleConfig {
    let mut config = ConsoleConfig::default();
    config.backend.base_url = backend.base_url();
    config.backend.reconnect_delay = Duration::from_millis(100);
    config.autosave.debounce = Duration::from_millis(200);
    config
}

/// Start a bridge against `backend` and wait until the backend sees the client.
pub async fn started_bridge(
    backend: &MockBackend,
    config: &ConsoleConfig,
) -> (TelemetryBridge, Subscription) {
    let bridge = TelemetryBridge::with_http_backend(config, None).expect("bridge");
    let mut events = bridge.subscribe();
    bridge.start();
    next_event(&mut events, |event| {
        matches!(event, BridgeEvent::Connection(ConnectionState::Open))
    })
    .await;
    assert!(backend.wait_for_connections(1, WAIT).await);
    (bridge, events)
}

/// Skip events until one matches.
pub async fn next_event(
    events: &mut Subscription,
    wanted: impl Fn(&BridgeEvent) -> bool,
) -> BridgeEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event before timeout")
}

/// Skip transport signals until a state change matches `target`.
pub async fn next_state(
    signals: &mut broadcast::Receiver<TransportSignal>,
    target: ConnectionState,
) {
    timeout(WAIT, async {
        loop {
            if let TransportSignal::State(state) = signals.recv().await.expect("signals open") {
                if state == target {
                    return;
                }
            }
        }
    })
    .await
    .expect("expected state before timeout")
}

/// The next routed telemetry event named `name`.
pub async fn next_telemetry(events: &mut Subscription, name: &str) {
    next_event(events, |event| {
        matches!(event, BridgeEvent::Telemetry(telemetry) if telemetry.name() == name)
    })
    .await;
}
