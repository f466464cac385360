//! ---
//! canopy_section: "05-testing"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Mock backend speaking the console's websocket and HTTP contract."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use canopy_msg::{
    ActuatorAction, ActuatorRequest, ActuatorResponse, ActuatorValue, BackendHealth,
    GoalRequest, GoalResponse, OutboundCommand, SettingsRequest, SettingsResponse,
    SettingsSnapshot, StatusResponse, TelemetryEvent, BackendStatus, STATUS_SUCCESS,
};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::settings_checksum;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq)]
struct ActuatorSlot {
    value: ActuatorValue,
    override_active: bool,
}

struct BackendState {
    frames: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
    commands: Mutex<Vec<OutboundCommand>>,
    connections: AtomicUsize,
    accepted: AtomicUsize,
    actuators: Mutex<BTreeMap<String, ActuatorSlot>>,
    locked: Mutex<HashSet<String>>,
    actuator_requests: Mutex<Vec<ActuatorRequest>>,
    settings: Mutex<SettingsSnapshot>,
    settings_requests: Mutex<Vec<SettingsRequest>>,
    fail_settings: AtomicBool,
    fail_goals: AtomicBool,
    started: Instant,
}

/// Builder for the mock backend.
#[derive(Clone)]
pub struct MockBackendBuilder {
    listen: SocketAddr,
}

impl Default for MockBackendBuilder {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

impl MockBackendBuilder {
    /// Builder bound to `listen`.
    pub fn new(listen: SocketAddr) -> Self {
        Self { listen }
    }

    /// Spawn the server and return a handle for driving it.
    pub async fn spawn(self) -> anyhow::Result<MockBackend> {
        let listener = TcpListener::bind(self.listen).await?;
        let address = listener.local_addr()?;
        info!(%address, "mock backend listening");

        let (frames, _) = broadcast::channel(256);
        let (kick, _) = broadcast::channel(4);
        let state = Arc::new(BackendState {
            frames,
            kick,
            commands: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            actuators: Mutex::new(BTreeMap::new()),
            locked: Mutex::new(HashSet::new()),
            actuator_requests: Mutex::new(Vec::new()),
            settings: Mutex::new(SettingsSnapshot::new()),
            settings_requests: Mutex::new(Vec::new()),
            fail_settings: AtomicBool::new(false),
            fail_goals: AtomicBool::new(false),
            started: Instant::now(),
        });

        let app = Router::new()
            .route("/ws", get(upgrade_handler))
            .route("/api/actuator", post(post_actuator))
            .route("/api/settings", get(get_settings).post(post_settings))
            .route("/api/goal", post(post_goal))
            .route("/api/status", get(get_status))
            .with_state(Arc::clone(&state));

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "mock backend exited with error");
            }
        });

        Ok(MockBackend {
            address,
            shutdown,
            task,
            state,
        })
    }
}

/// Running mock backend.
pub struct MockBackend {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    state: Arc<BackendState>,
}

impl MockBackend {
    /// Spawn on an ephemeral loopback port.
    pub async fn spawn() -> anyhow::Result<Self> {
        MockBackendBuilder::default().spawn().await
    }

    /// Bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// `http://` base URL for the request/response channel.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// `ws://` URL of the streaming endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.address)
    }

    /// Push an envelope to every connected client. Returns the number reached.
    pub fn push(&self, event: &TelemetryEvent) -> usize {
        match event.to_wire() {
            Ok(text) => self.push_raw(text),
            Err(err) => {
                warn!(error = %err, "unable to encode mock frame");
                0
            }
        }
    }

    /// Push a raw text frame, valid or not.
    pub fn push_raw(&self, text: impl Into<String>) -> usize {
        self.state.frames.send(text.into()).unwrap_or(0)
    }

    /// Push a heartbeat.
    pub fn heartbeat(&self, health: BackendHealth) -> usize {
        let uptime = self.state.started.elapsed().as_secs_f64();
        self.push(&TelemetryEvent::heartbeat(health, uptime))
    }

    /// Push greenhouse telemetry carrying `actuators`.
    pub fn telemetry(&self, actuators: JsonValue) -> usize {
        self.push(&TelemetryEvent::greenhouse_telemetry(actuators))
    }

    /// Close every client connection from the server side.
    pub fn disconnect_clients(&self) {
        let _ = self.state.kick.send(());
    }

    /// Currently connected websocket clients.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Websocket connections accepted since start.
    pub fn accepted_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` connections have been accepted since start.
    pub async fn wait_for_accepted(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.accepted_count() >= count).await
    }

    /// Wait until exactly `count` clients are connected.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.connection_count() == count).await
    }

    /// Commands received over the websocket, in arrival order.
    pub fn commands(&self) -> Vec<OutboundCommand> {
        self.state.commands.lock().clone()
    }

    /// Wait for at least `count` commands and return everything received.
    pub async fn wait_for_commands(&self, count: usize, timeout: Duration) -> Vec<OutboundCommand> {
        poll_until(timeout, || self.state.commands.lock().len() >= count).await;
        self.commands()
    }

    /// Actuator requests received, in arrival order.
    pub fn actuator_requests(&self) -> Vec<ActuatorRequest> {
        self.state.actuator_requests.lock().clone()
    }

    /// Backend-side value and override flag of an actuator.
    pub fn actuator(&self, name: &str) -> Option<(ActuatorValue, bool)> {
        self.state
            .actuators
            .lock()
            .get(name)
            .map(|slot| (slot.value, slot.override_active))
    }

    /// Refuse further commands targeting `name`.
    pub fn lock_actuator(&self, name: &str) {
        self.state.locked.lock().insert(name.to_owned());
    }

    /// Settings save requests received, in arrival order.
    pub fn settings_requests(&self) -> Vec<SettingsRequest> {
        self.state.settings_requests.lock().clone()
    }

    /// Wait for at least `count` settings saves and return everything received.
    pub async fn wait_for_settings_requests(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<SettingsRequest> {
        poll_until(timeout, || self.state.settings_requests.lock().len() >= count).await;
        self.settings_requests()
    }

    /// Persisted settings.
    pub fn settings(&self) -> SettingsSnapshot {
        self.state.settings.lock().clone()
    }

    /// Make settings saves fail with HTTP 500.
    pub fn fail_settings(&self, fail: bool) {
        self.state.fail_settings.store(fail, Ordering::SeqCst);
    }

    /// Make goal submissions fail with a bare HTTP 500 whose body names no
    /// failure field, the way the web framework answers an unhandled error.
    pub fn fail_goals(&self, fail: bool) {
        self.state.fail_goals.store(fail, Ordering::SeqCst);
    }

    /// Trigger graceful shutdown and await completion.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.disconnect_clients();
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|err| anyhow::anyhow!(err))
    }
}

async fn poll_until(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if ready() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BackendState>>,
) -> axum::response::Response {
    ws.on_upgrade(|socket| client_loop(socket, state))
}

async fn client_loop(mut socket: WebSocket, state: Arc<BackendState>) {
    let mut frames = state.frames.subscribe();
    let mut kick = state.kick.subscribe();
    state.accepted.fetch_add(1, Ordering::SeqCst);
    state.connections.fetch_add(1, Ordering::SeqCst);
    debug!("mock backend client connected");

    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            frame = frames.recv() => {
                let text = match frame {
                    Ok(text) => text,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "mock client lagged behind; dropping frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                let Some(Ok(message)) = message else {
                    break;
                };
                match message {
                    Message::Text(text) => {
                        if let Some(reply) = record_command(&state, &text) {
                            if socket.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    state.connections.fetch_sub(1, Ordering::SeqCst);
    debug!("mock backend client disconnected");
}

fn record_command(state: &BackendState, text: &str) -> Option<String> {
    let command = match serde_json::from_str::<OutboundCommand>(text) {
        Ok(command) => command,
        Err(err) => {
            warn!(error = %err, "mock backend received invalid command");
            return None;
        }
    };
    let reply = (command.command == "PING")
        .then(|| TelemetryEvent::new("PONG", json!({})).to_wire().ok())
        .flatten();
    state.commands.lock().push(command);
    reply
}

fn actuator_error(status: StatusCode, message: String) -> (StatusCode, Json<ActuatorResponse>) {
    (
        status,
        Json(ActuatorResponse {
            status: "error".into(),
            value: None,
            override_active: false,
            error: Some(message),
        }),
    )
}

async fn post_actuator(
    State(state): State<Arc<BackendState>>,
    Json(request): Json<ActuatorRequest>,
) -> (StatusCode, Json<ActuatorResponse>) {
    state.actuator_requests.lock().push(request.clone());

    if let Some(name) = &request.name {
        if state.locked.lock().contains(name) {
            return actuator_error(
                StatusCode::CONFLICT,
                format!("actuator {name} is held by an interlock"),
            );
        }
    }

    let mut actuators = state.actuators.lock();
    if request.action == ActuatorAction::ClearAll {
        for slot in actuators.values_mut() {
            slot.override_active = false;
        }
        return (
            StatusCode::OK,
            Json(ActuatorResponse {
                status: STATUS_SUCCESS.into(),
                value: None,
                override_active: false,
                error: None,
            }),
        );
    }

    let Some(name) = request.name.clone() else {
        return actuator_error(StatusCode::BAD_REQUEST, "actuator name required".into());
    };
    let slot = actuators.entry(name).or_insert(ActuatorSlot {
        value: ActuatorValue::Bool(false),
        override_active: false,
    });
    match request.action {
        ActuatorAction::Set => {
            let Some(value) = request.value else {
                return actuator_error(StatusCode::BAD_REQUEST, "value required".into());
            };
            slot.value = value;
            slot.override_active = true;
        }
        ActuatorAction::Toggle => {
            slot.value = ActuatorValue::Bool(!slot.value.is_on());
            slot.override_active = true;
        }
        ActuatorAction::ClearOverride => slot.override_active = false,
        ActuatorAction::ClearAll => {}
    }

    (
        StatusCode::OK,
        Json(ActuatorResponse {
            status: STATUS_SUCCESS.into(),
            value: Some(slot.value),
            override_active: slot.override_active,
            error: None,
        }),
    )
}

async fn get_settings(State(state): State<Arc<BackendState>>) -> Json<SettingsSnapshot> {
    Json(state.settings.lock().clone())
}

async fn post_settings(
    State(state): State<Arc<BackendState>>,
    Json(request): Json<SettingsRequest>,
) -> (StatusCode, Json<SettingsResponse>) {
    state.settings_requests.lock().push(request.clone());

    if state.fail_settings.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SettingsResponse {
                status: "error".into(),
                bcc: None,
                error: Some("settings store unavailable".into()),
            }),
        );
    }

    let bcc = settings_checksum(&request.settings);
    state
        .settings
        .lock()
        .entry(request.section)
        .or_default()
        .extend(request.settings);
    (
        StatusCode::OK,
        Json(SettingsResponse {
            status: STATUS_SUCCESS.into(),
            bcc: Some(bcc),
            error: None,
        }),
    )
}

async fn post_goal(
    State(state): State<Arc<BackendState>>,
    Json(request): Json<GoalRequest>,
) -> Response {
    if state.fail_goals.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "Internal Server Error" })),
        )
            .into_response();
    }
    let goal = request.goal.trim();
    if goal.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(GoalResponse {
                status: None,
                result: None,
                error: Some("No goal provided".into()),
            }),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        Json(GoalResponse {
            status: Some(STATUS_SUCCESS.into()),
            result: Some(json!({ "plan": format!("accepted: {goal}") })),
            error: None,
        }),
    )
        .into_response()
}

async fn get_status(State(state): State<Arc<BackendState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: BackendStatus::Online,
        uptime: Some(json!(state.started.elapsed().as_secs_f64())),
    })
}
