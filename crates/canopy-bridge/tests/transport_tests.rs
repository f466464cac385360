//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "tests"
//! canopy_type: "source"
//! canopy_scope: "test"
//! canopy_description: "Streaming channel behaviour against a live mock backend."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
mod common;

use std::time::Duration;

use canopy_bridge::{
    CommandDispatcher, ConnectionState, TransportConnection, TransportError, TransportSignal,
};
use canopy_msg::{BackendHealth, EventClass};
use canopy_testharness::{MockBackend, MockBackendBuilder};
use common::{next_state, WAIT};
use serde_json::json;
use tokio::time::timeout;

#[tokio::test]
async fn reconnects_after_unexpected_close() {
    let backend = MockBackend::spawn().await.unwrap();
    let transport = TransportConnection::new(backend.ws_url(), Duration::from_millis(100), None);
    let mut signals = transport.subscribe();

    transport.connect();
    next_state(&mut signals, ConnectionState::Open).await;
    assert!(backend.wait_for_connections(1, WAIT).await);

    backend.disconnect_clients();
    next_state(&mut signals, ConnectionState::Closed).await;
    assert_eq!(
        transport.send("{}".to_owned()).await,
        Err(TransportError::NotOpen)
    );

    next_state(&mut signals, ConnectionState::Open).await;
    assert!(backend.wait_for_accepted(2, WAIT).await);
    assert!(transport.is_open());

    transport.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_frame_is_dropped_without_closing_channel() {
    let backend = MockBackend::spawn().await.unwrap();
    let transport = TransportConnection::new(backend.ws_url(), Duration::from_millis(100), None);
    let mut signals = transport.subscribe();
    transport.connect();
    next_state(&mut signals, ConnectionState::Open).await;
    assert!(backend.wait_for_connections(1, WAIT).await);

    backend.push_raw("{\"event\": truncated");
    backend.push_raw("[\"not\", \"an\", \"envelope\"]");
    backend.heartbeat(BackendHealth::Alive);

    let signal = timeout(WAIT, signals.recv()).await.unwrap().unwrap();
    match signal {
        TransportSignal::Inbound(event) => {
            assert!(matches!(event.classify(), EventClass::Heartbeat(_)));
        }
        other => panic!("expected heartbeat, got {other:?}"),
    }
    assert_eq!(transport.state(), ConnectionState::Open);
    assert_eq!(backend.accepted_count(), 1);

    transport.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn commands_arrive_in_submission_order() {
    let backend = MockBackend::spawn().await.unwrap();
    let transport = TransportConnection::new(backend.ws_url(), Duration::from_millis(100), None);
    let mut signals = transport.subscribe();
    transport.connect();
    next_state(&mut signals, ConnectionState::Open).await;

    let dispatcher = CommandDispatcher::new(transport.clone(), None);
    for step in 0..20 {
        let sequence = dispatcher
            .submit("DOSE_STEP", json!({ "step": step }))
            .await
            .unwrap();
        assert_eq!(sequence, step + 1);
    }

    let received = backend.wait_for_commands(20, WAIT).await;
    let steps: Vec<u64> = received
        .iter()
        .map(|command| command.payload["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, (0..20).collect::<Vec<u64>>());

    transport.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn connect_while_connecting_or_open_is_a_no_op() {
    let backend = MockBackend::spawn().await.unwrap();
    let transport = TransportConnection::new(backend.ws_url(), Duration::from_millis(100), None);
    let mut signals = transport.subscribe();

    transport.connect();
    next_state(&mut signals, ConnectionState::Connecting).await;
    transport.connect();
    next_state(&mut signals, ConnectionState::Open).await;
    transport.connect();
    transport.connect();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.accepted_count(), 1);
    assert_eq!(transport.state(), ConnectionState::Open);
    while let Ok(signal) = signals.try_recv() {
        assert!(
            !matches!(signal, TransportSignal::State(_)),
            "unexpected state change {signal:?}"
        );
    }

    transport.stop().await;
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn connect_while_closed_skips_remaining_delay() {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = reserved.local_addr().unwrap();
    drop(reserved);

    let transport = TransportConnection::new(
        format!("ws://{address}/ws"),
        Duration::from_secs(60),
        None,
    );
    let mut signals = transport.subscribe();
    transport.connect();
    next_state(&mut signals, ConnectionState::Closed).await;

    let backend = MockBackendBuilder::new(address).spawn().await.unwrap();
    transport.connect();
    next_state(&mut signals, ConnectionState::Open).await;
    assert!(backend.wait_for_connections(1, WAIT).await);

    transport.stop().await;
    assert_eq!(transport.state(), ConnectionState::Closed);
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_cancels_pending_reconnect() {
    let backend = MockBackend::spawn().await.unwrap();
    let transport = TransportConnection::new(backend.ws_url(), Duration::from_millis(100), None);
    let mut signals = transport.subscribe();
    transport.connect();
    next_state(&mut signals, ConnectionState::Open).await;

    transport.stop().await;
    assert!(backend.wait_for_connections(0, WAIT).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(backend.accepted_count(), 1);
    assert_eq!(transport.state(), ConnectionState::Closed);

    backend.shutdown().await.unwrap();
}
