//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Self-healing websocket channel to the backend controller."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use canopy_msg::{log_event, TelemetryEvent};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::metrics::BridgeMetrics;

const SIGNAL_CAPACITY: usize = 1024;

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the streaming channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Frames flow in both directions.
    Open,
    /// No channel; a reconnect is pending unless stopped.
    Closed,
}

/// Ordered stream of channel activity delivered to subscribers.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    /// The channel changed state.
    State(ConnectionState),
    /// A decoded inbound envelope.
    Inbound(Arc<TelemetryEvent>),
}

struct OutboundFrame {
    text: String,
    written: oneshot::Sender<Result<(), TransportError>>,
}

struct Inner {
    url: String,
    reconnect_delay: Duration,
    state: watch::Sender<ConnectionState>,
    signals: broadcast::Sender<TransportSignal>,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    retry_now: Notify,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<Arc<BridgeMetrics>>,
}

/// One full-duplex channel to the backend that reconnects on loss.
///
/// A single supervisor task owns the socket. Writers hand frames to it through an
/// ordered queue, so frames are written in the order [`TransportConnection::send`]
/// was called. After any loss the supervisor waits `reconnect_delay` and tries
/// again, indefinitely, until [`TransportConnection::stop`].
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<Inner>,
}

impl TransportConnection {
    /// Create a connection to `url`. Nothing happens until [`Self::connect`].
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                reconnect_delay,
                state,
                signals,
                outbound: Mutex::new(None),
                retry_now: Notify::new(),
                shutdown,
                task: Mutex::new(None),
                metrics,
            }),
        }
    }

    /// Endpoint this connection dials.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Start the supervisor. No-op while connecting or open; while closed with a
    /// reconnect pending, retries immediately instead of waiting out the delay.
    pub fn connect(&self) {
        let mut task = self.inner.task.lock();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                if self.state() == ConnectionState::Closed {
                    debug!(url = %self.inner.url, "connect requested while closed; retrying now");
                    self.inner.retry_now.notify_one();
                }
                return;
            }
        }
        self.inner.shutdown.send_replace(false);
        *task = Some(tokio::spawn(supervise(Arc::clone(&self.inner))));
    }

    /// Close the channel and cancel any pending reconnect.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "transport supervisor ended abnormally");
            }
        }
        self.inner.outbound.lock().take();
        self.inner.set_state(ConnectionState::Closed);
    }

    /// Queue one text frame and wait until it has been written to the socket.
    ///
    /// Fails with [`TransportError::NotOpen`] when there is no open channel.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        let (written, done) = oneshot::channel();
        {
            let outbound = self.inner.outbound.lock();
            let queue = outbound.as_ref().ok_or(TransportError::NotOpen)?;
            queue
                .send(OutboundFrame { text, written })
                .map_err(|_| TransportError::NotOpen)?;
        }
        done.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Current channel state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether frames can currently be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && self.inner.outbound.lock().is_some()
    }

    /// Observe state changes without consuming inbound frames.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to state changes and inbound envelopes, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportSignal> {
        self.inner.signals.subscribe()
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(url = %self.url, from = ?previous, to = ?next, "channel state changed");
            let _ = self.signals.send(TransportSignal::State(next));
        }
    }

    fn dispatch(&self, text: &str) {
        match TelemetryEvent::parse(text) {
            Ok(event) => {
                log_event(&event);
                if let Some(metrics) = &self.metrics {
                    metrics.observe_frame();
                }
                let _ = self.signals.send(TransportSignal::Inbound(Arc::new(event)));
            }
            Err(err) => {
                warn!(error = %err, frame_len = text.len(), "dropping malformed frame");
                if let Some(metrics) = &self.metrics {
                    metrics.observe_malformed();
                }
            }
        }
    }
}

async fn supervise(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }

        inner.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            result = connect_async(inner.url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok((stream, _response)) => {
                let stopped = run_session(&inner, stream, &mut shutdown).await;
                inner.outbound.lock().take();
                inner.set_state(ConnectionState::Closed);
                if stopped {
                    break;
                }
            }
            Err(err) => {
                warn!(url = %inner.url, error = %err, "backend connection attempt failed");
                inner.set_state(ConnectionState::Closed);
            }
        }

        if let Some(metrics) = &inner.metrics {
            metrics.observe_reconnect();
        }
        info!(
            url = %inner.url,
            delay_ms = inner.reconnect_delay.as_millis() as u64,
            "reconnect scheduled"
        );
        tokio::select! {
            _ = tokio::time::sleep(inner.reconnect_delay) => {}
            _ = inner.retry_now.notified() => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!(url = %inner.url, "transport supervisor stopped");
}

/// Pump one established session. Returns `true` when it ended because of `stop`.
async fn run_session(
    inner: &Inner,
    stream: BackendStream,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (mut sink, mut source) = stream.split();
    let (queue_tx, mut queue) = mpsc::unbounded_channel::<OutboundFrame>();
    *inner.outbound.lock() = Some(queue_tx);
    inner.set_state(ConnectionState::Open);
    info!(url = %inner.url, "backend channel open");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if let Err(err) = sink.send(Message::Close(None)).await {
                    debug!(error = %err, "close frame not delivered");
                }
                return true;
            }
            Some(frame) = queue.recv() => {
                match sink.send(Message::Text(frame.text)).await {
                    Ok(()) => {
                        let _ = frame.written.send(Ok(()));
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to write frame; dropping channel");
                        let _ = frame.written.send(Err(TransportError::Closed));
                        return false;
                    }
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.dispatch(&text),
                Some(Ok(Message::Binary(bytes))) => {
                    warn!(len = bytes.len(), "binary frames are not supported; dropping");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(reason = ?frame, "backend closed the channel");
                    return false;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "backend channel failed");
                    return false;
                }
                None => {
                    info!("backend channel ended");
                    return false;
                }
            },
        }
    }
}
