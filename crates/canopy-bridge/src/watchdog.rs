//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Dead-man's-switch liveness detection over backend heartbeats."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use canopy_msg::{BackendHealth, Heartbeat};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::events::{BridgeEvent, EventBus};
use crate::metrics::BridgeMetrics;

/// Backend liveness as judged from heartbeat arrivals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LivenessState {
    /// No heartbeat seen since the watchdog started.
    Connecting,
    /// Heartbeats arriving and the backend reports itself alive.
    Connected,
    /// Heartbeats arriving but the backend reports its loop stalled.
    Stalled,
    /// No heartbeat within the window.
    Disconnected,
}

/// Observable liveness record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    /// Current liveness state.
    pub state: LivenessState,
    /// Arrival time of the latest heartbeat.
    pub last_seen: Option<DateTime<Utc>>,
    /// Backend-reported uptime in seconds from the latest heartbeat.
    pub uptime: Option<f64>,
}

impl Default for HeartbeatRecord {
    fn default() -> Self {
        Self {
            state: LivenessState::Connecting,
            last_seen: None,
            uptime: None,
        }
    }
}

/// Liveness state machine without timers.
///
/// Each method returns the new record when the state changed, and `None` when it
/// did not.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    record: HeartbeatRecord,
}

impl LivenessTracker {
    /// Start in [`LivenessState::Connecting`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A heartbeat arrived at `received_at`.
    pub fn observe(
        &mut self,
        beat: &Heartbeat,
        received_at: DateTime<Utc>,
    ) -> Option<HeartbeatRecord> {
        self.record.last_seen = Some(received_at);
        self.record.uptime = beat.uptime;
        let next = match beat.health {
            BackendHealth::Alive => LivenessState::Connected,
            BackendHealth::Stalled => LivenessState::Stalled,
        };
        self.transition(next)
    }

    /// The window elapsed without a heartbeat.
    pub fn expire(&mut self) -> Option<HeartbeatRecord> {
        self.transition(LivenessState::Disconnected)
    }

    /// Current record.
    pub fn record(&self) -> &HeartbeatRecord {
        &self.record
    }

    fn transition(&mut self, next: LivenessState) -> Option<HeartbeatRecord> {
        if self.record.state == next {
            return None;
        }
        self.record.state = next;
        Some(self.record.clone())
    }
}

struct Running {
    beats: mpsc::UnboundedSender<Heartbeat>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Timer-driven liveness detector.
///
/// Every heartbeat re-arms a `window` timer. If the timer fires, the state becomes
/// [`LivenessState::Disconnected`] once and the timer stays disarmed until the next
/// heartbeat. The timer is first armed by [`HeartbeatWatchdog::start`].
pub struct HeartbeatWatchdog {
    window: Duration,
    events: EventBus,
    metrics: Option<Arc<BridgeMetrics>>,
    record: Arc<watch::Sender<HeartbeatRecord>>,
    running: Mutex<Option<Running>>,
}

impl HeartbeatWatchdog {
    /// Create a stopped watchdog publishing transitions on `events`.
    pub fn new(window: Duration, events: EventBus, metrics: Option<Arc<BridgeMetrics>>) -> Self {
        let (record, _) = watch::channel(HeartbeatRecord::default());
        Self {
            window,
            events,
            metrics,
            record: Arc::new(record),
            running: Mutex::new(None),
        }
    }

    /// Arm the timer and begin accepting heartbeats. No-op when already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let (beats, beat_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            self.window,
            beat_rx,
            shutdown_rx,
            Arc::clone(&self.record),
            self.events.clone(),
            self.metrics.clone(),
        ));
        *running = Some(Running {
            beats,
            shutdown,
            task,
        });
    }

    /// Feed one heartbeat. Ignored while stopped.
    pub fn observe(&self, beat: Heartbeat) {
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.beats.send(beat);
        }
    }

    /// Latest liveness record.
    pub fn record(&self) -> HeartbeatRecord {
        self.record.borrow().clone()
    }

    /// Current liveness state.
    pub fn state(&self) -> LivenessState {
        self.record.borrow().state
    }

    /// Observe record updates, including heartbeats that do not change the state.
    pub fn watch(&self) -> watch::Receiver<HeartbeatRecord> {
        self.record.subscribe()
    }

    /// Disarm the timer and stop accepting heartbeats.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(err) = running.task.await {
                warn!(error = %err, "watchdog task ended abnormally");
            }
        }
    }
}

async fn supervise(
    window: Duration,
    mut beats: mpsc::UnboundedReceiver<Heartbeat>,
    mut shutdown: watch::Receiver<bool>,
    record: Arc<watch::Sender<HeartbeatRecord>>,
    events: EventBus,
    metrics: Option<Arc<BridgeMetrics>>,
) {
    let mut tracker = LivenessTracker::new();
    record.send_replace(tracker.record().clone());
    let mut deadline = Some(Instant::now() + window);

    loop {
        let expiry = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            beat = beats.recv() => {
                let Some(beat) = beat else { break };
                deadline = Some(Instant::now() + window);
                let change = tracker.observe(&beat, Utc::now());
                record.send_replace(tracker.record().clone());
                if let Some(changed) = change {
                    info!(state = ?changed.state, uptime = ?changed.uptime, "backend liveness changed");
                    events.publish(BridgeEvent::Liveness(changed));
                }
            }
            _ = expiry => {
                deadline = None;
                if let Some(changed) = tracker.expire() {
                    warn!(
                        window_ms = window.as_millis() as u64,
                        last_seen = ?changed.last_seen,
                        "no heartbeat within window; backend considered disconnected"
                    );
                    if let Some(metrics) = &metrics {
                        metrics.observe_liveness_timeout();
                    }
                    record.send_replace(changed.clone());
                    events.publish(BridgeEvent::Liveness(changed));
                }
            }
        }
    }
}
