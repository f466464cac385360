//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "tests"
//! canopy_type: "source"
//! canopy_scope: "test"
//! canopy_description: "End-to-end bridge flows against a live mock backend."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
mod common;

use std::time::Duration;

use canopy_bridge::{
    ActuatorMode, BridgeEvent, CommandError, ConnectionState, LivenessState,
    OverrideConfirmation, RpcError, TelemetryBridge,
};
use canopy_msg::{ActuatorValue, BackendHealth, BackendStatus, GREENHOUSE_TELEMETRY};
use canopy_testharness::{settings_checksum, MockBackend};
use common::{config_for, next_event, next_telemetry, started_bridge, WAIT};
use serde_json::json;

#[tokio::test]
async fn heartbeat_and_telemetry_reach_bridge_state() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, mut events) = started_bridge(&backend, &config_for(&backend)).await;
    assert_eq!(bridge.connection_state(), ConnectionState::Open);
    assert_eq!(bridge.liveness().state, LivenessState::Connecting);

    backend.heartbeat(BackendHealth::Alive);
    let event = next_event(&mut events, |e| matches!(e, BridgeEvent::Liveness(_))).await;
    let BridgeEvent::Liveness(record) = event else {
        unreachable!()
    };
    assert_eq!(record.state, LivenessState::Connected);
    assert!(record.last_seen.is_some());

    backend.telemetry(json!({"water_pump": true, "nutrient_a": 0.3}));
    next_telemetry(&mut events, GREENHOUSE_TELEMETRY).await;
    assert_eq!(
        bridge.registry().value("water_pump"),
        Some(ActuatorValue::Bool(true))
    );
    assert_eq!(
        bridge.registry().value("nutrient_a"),
        Some(ActuatorValue::Number(0.3))
    );

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn operator_override_outlasts_contradicting_telemetry() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, mut events) = started_bridge(&backend, &config_for(&backend)).await;

    let ack = bridge
        .set_actuator("pump_active", ActuatorValue::Bool(true))
        .await
        .unwrap();
    assert_eq!(ack.confirmation, OverrideConfirmation::Engaged);
    assert_eq!(
        next_event(&mut events, |e| matches!(e, BridgeEvent::OverrideEngaged { .. })).await,
        BridgeEvent::OverrideEngaged {
            name: "pump_active".into(),
            value: ActuatorValue::Bool(true),
        }
    );
    assert_eq!(
        backend.actuator("pump_active"),
        Some((ActuatorValue::Bool(true), true))
    );

    backend.telemetry(json!({"pump_active": false}));
    next_telemetry(&mut events, GREENHOUSE_TELEMETRY).await;
    let pump = bridge.registry().get("pump_active").unwrap();
    assert_eq!(pump.value, ActuatorValue::Bool(true));
    assert_eq!(pump.mode, ActuatorMode::Override);

    assert!(bridge.clear_override("pump_active").await.unwrap());
    assert_eq!(
        bridge.registry().value("pump_active"),
        Some(ActuatorValue::Bool(false))
    );
    backend.telemetry(json!({"pump_active": true}));
    next_telemetry(&mut events, GREENHOUSE_TELEMETRY).await;
    assert_eq!(
        bridge.registry().value("pump_active"),
        Some(ActuatorValue::Bool(true))
    );

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_actuator_command_changes_nothing_locally() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, mut events) = started_bridge(&backend, &config_for(&backend)).await;
    backend.lock_actuator("lights");

    let err = bridge
        .set_actuator("lights", ActuatorValue::Bool(true))
        .await
        .unwrap_err();
    let CommandError::Rejected(rejection) = err else {
        panic!("expected rejection, got {err:?}");
    };
    assert_eq!(rejection.command, "set");
    assert_eq!(rejection.target.as_deref(), Some("lights"));
    assert!(rejection.reason.contains("interlock"));

    assert_eq!(
        next_event(&mut events, |e| matches!(e, BridgeEvent::CommandRejected(_))).await,
        BridgeEvent::CommandRejected(rejection)
    );
    assert!(bridge.registry().get("lights").is_none());

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn toggle_and_clear_all_round_trip_through_backend() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, _events) = started_bridge(&backend, &config_for(&backend)).await;

    let first = bridge.toggle_actuator("lights").await.unwrap();
    assert_eq!(first.value, ActuatorValue::Bool(true));
    let second = bridge.toggle_actuator("lights").await.unwrap();
    assert_eq!(second.value, ActuatorValue::Bool(false));
    assert_eq!(second.confirmation, OverrideConfirmation::Updated);

    bridge
        .set_actuator("nutrient_b", ActuatorValue::Number(0.6))
        .await
        .unwrap();
    let mut released = bridge.clear_all_overrides().await.unwrap();
    released.sort();
    assert_eq!(released, vec!["lights".to_owned(), "nutrient_b".to_owned()]);
    assert!(bridge.registry().overridden().is_empty());
    assert_eq!(backend.actuator("lights"), Some((ActuatorValue::Bool(false), false)));

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn streaming_commands_reach_backend_in_order() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, mut events) = started_bridge(&backend, &config_for(&backend)).await;

    for zone in ["north", "south", "east", "west"] {
        bridge
            .submit_command("START_IRRIGATION", json!({ "zone": zone }))
            .await
            .unwrap();
    }
    bridge.ping().await.unwrap();

    let commands = backend.wait_for_commands(5, WAIT).await;
    let zones: Vec<&str> = commands[..4]
        .iter()
        .map(|command| command.payload["zone"].as_str().unwrap())
        .collect();
    assert_eq!(zones, ["north", "south", "east", "west"]);
    assert_eq!(commands[4].command, "PING");
    next_telemetry(&mut events, "PONG").await;

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn settings_edits_are_debounced_into_one_verified_save() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, mut events) = started_bridge(&backend, &config_for(&backend)).await;

    bridge.edit_setting("nutrients", "target_ph", json!(5.8));
    bridge.edit_setting("nutrients", "target_ph", json!(6.1));
    bridge.edit_setting("nutrients", "dose_ml", json!(12));

    let saved = next_event(&mut events, |e| matches!(e, BridgeEvent::SettingsSaved { .. })).await;
    let requests = backend.settings_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].settings["target_ph"], json!(6.1));
    assert_eq!(
        saved,
        BridgeEvent::SettingsSaved {
            section: "nutrients".into(),
            bcc: settings_checksum(&requests[0].settings),
        }
    );
    assert!(bridge.pending_settings("nutrients").is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(backend.settings_requests().len(), 1);

    let persisted = bridge.load_settings().await.unwrap();
    assert_eq!(persisted["nutrients"]["dose_ml"], json!(12));

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_save_keeps_draft_until_close_resubmits() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, mut events) = started_bridge(&backend, &config_for(&backend)).await;
    backend.fail_settings(true);

    bridge.edit_setting("lighting", "photoperiod_h", json!(18));
    next_event(&mut events, |e| matches!(e, BridgeEvent::SettingsFailed { .. })).await;
    assert_eq!(
        bridge.pending_settings("lighting").unwrap()["photoperiod_h"],
        json!(18)
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(backend.settings_requests().len(), 1);

    backend.fail_settings(false);
    let bcc = bridge.close_settings("lighting").await.unwrap();
    assert!(bcc.is_some());
    assert_eq!(backend.settings_requests().len(), 2);
    assert!(bridge.pending_sections().is_empty());

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_flushes_pending_drafts() {
    let backend = MockBackend::spawn().await.unwrap();
    let mut config = config_for(&backend);
    config.autosave.debounce = Duration::from_secs(60);
    let (bridge, _events) = started_bridge(&backend, &config).await;

    bridge.edit_setting("climate", "max_temp_c", json!(29));
    bridge.stop().await;

    let requests = backend.settings_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].section, "climate");
    assert_eq!(bridge.connection_state(), ConnectionState::Closed);
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn goals_and_status_use_request_channel() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, mut events) = started_bridge(&backend, &config_for(&backend)).await;

    let result = bridge.submit_goal("raise humidity to 70%").await.unwrap();
    assert_eq!(
        result,
        Some(json!({"plan": "accepted: raise humidity to 70%"}))
    );

    let err = bridge.submit_goal("   ").await.unwrap_err();
    assert!(matches!(err, CommandError::Rejected(ref r) if r.reason == "No goal provided"));
    next_event(&mut events, |e| matches!(e, BridgeEvent::CommandRejected(_))).await;

    let status = bridge.backend_status().await.unwrap();
    assert_eq!(status.status, BackendStatus::Online);

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn goal_answered_by_bare_server_error_is_not_accepted() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, _events) = started_bridge(&backend, &config_for(&backend)).await;

    backend.fail_goals(true);
    let err = bridge.submit_goal("raise humidity").await.unwrap_err();
    match err {
        CommandError::Rpc(RpcError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert!(body.contains("Internal Server Error"));
        }
        other => panic!("expected http status error, got {other:?}"),
    }

    backend.fail_goals(false);
    assert!(bridge.submit_goal("raise humidity").await.unwrap().is_some());

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn silent_backend_is_reported_disconnected_and_recovers() {
    let backend = MockBackend::spawn().await.unwrap();
    let mut config = config_for(&backend);
    config.watchdog.window = Duration::from_millis(300);
    let (bridge, mut events) = started_bridge(&backend, &config).await;

    backend.heartbeat(BackendHealth::Alive);
    next_event(&mut events, |e| {
        matches!(e, BridgeEvent::Liveness(r) if r.state == LivenessState::Connected)
    })
    .await;

    next_event(&mut events, |e| {
        matches!(e, BridgeEvent::Liveness(r) if r.state == LivenessState::Disconnected)
    })
    .await;
    assert_eq!(bridge.connection_state(), ConnectionState::Open);

    backend.heartbeat(BackendHealth::Stalled);
    next_event(&mut events, |e| {
        matches!(e, BridgeEvent::Liveness(r) if r.state == LivenessState::Stalled)
    })
    .await;

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn bridge_reconnects_and_keeps_overrides() {
    let backend = MockBackend::spawn().await.unwrap();
    let (bridge, mut events) = started_bridge(&backend, &config_for(&backend)).await;
    bridge
        .set_actuator("water_pump", ActuatorValue::Bool(true))
        .await
        .unwrap();

    backend.disconnect_clients();
    next_event(&mut events, |e| {
        matches!(e, BridgeEvent::Connection(ConnectionState::Closed))
    })
    .await;
    next_event(&mut events, |e| {
        matches!(e, BridgeEvent::Connection(ConnectionState::Open))
    })
    .await;
    assert!(backend.wait_for_connections(1, WAIT).await);

    backend.telemetry(json!({"water_pump": false}));
    next_telemetry(&mut events, GREENHOUSE_TELEMETRY).await;
    assert_eq!(
        bridge.registry().value("water_pump"),
        Some(ActuatorValue::Bool(true))
    );

    bridge.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn commands_while_disconnected_fail_fast() {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = reserved.local_addr().unwrap();
    drop(reserved);

    let mut config = canopy_common::ConsoleConfig::default();
    config.backend.base_url = format!("http://{address}");
    let bridge = TelemetryBridge::with_http_backend(&config, None).unwrap();
    bridge.start();

    let err = bridge
        .submit_command("START_IRRIGATION", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Transport(canopy_bridge::TransportError::NotOpen)
    ));

    bridge.stop().await;
}
