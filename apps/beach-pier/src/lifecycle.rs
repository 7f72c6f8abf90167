use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, timeout, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::RelayConfig,
    envelope::DecodeError,
    peer::{PeerConnection, PeerHandle},
    registry::PeerRegistry,
    router::{Disposition, MessageRouter},
};

/// State shared by every session accepted by this relay.
#[derive(Clone)]
pub struct RelayState {
    router: MessageRouter,
    config: Arc<RelayConfig>,
    shutdown: Arc<watch::Sender<bool>>,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            router: MessageRouter::new(PeerRegistry::new()),
            config: Arc::new(config),
            shutdown: Arc::new(shutdown),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn registry(&self) -> &PeerRegistry {
        self.router.registry()
    }

    pub fn metrics(&self) -> Option<&PrometheusHandle> {
        self.metrics.as_ref()
    }

    /// Signals every running session loop to finish and clean up.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Why a session's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ClientClosed,
    TransportError,
    IdleTimeout,
    WriterFailed,
    Rejected,
    Shutdown,
}

impl SessionEnd {
    fn metric_label(&self) -> &'static str {
        match self {
            SessionEnd::ClientClosed => "client_closed",
            SessionEnd::TransportError => "transport_error",
            SessionEnd::IdleTimeout => "idle_timeout",
            SessionEnd::WriterFailed => "writer_failed",
            SessionEnd::Rejected => "rejected",
            SessionEnd::Shutdown => "shutdown",
        }
    }
}

enum Inbound {
    Frame(Message),
    Ended,
    Failed(axum::Error),
    IdleTimeout,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Some(remote_addr)))
}

/// Drives one accepted session from upgrade to cleanup.
pub async fn handle_socket(socket: WebSocket, state: RelayState, remote_addr: Option<SocketAddr>) {
    let connection_id = Uuid::new_v4();
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(state.config.outbound_buffer);
    let mut peer = PeerConnection::new(PeerHandle::new(connection_id, tx), remote_addr);

    counter!("beach_pier_connections_total", 1);
    increment_gauge!("beach_pier_connections_active", 1.0);
    debug!(
        connection_id = %connection_id,
        remote_addr = ?remote_addr,
        "websocket connected"
    );

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        state.config.ping_interval,
        state.config.write_timeout,
        connection_id,
    ));
    let mut writer_finished = false;
    let mut shutdown = state.shutdown.subscribe();

    let end = loop {
        let inbound = tokio::select! {
            inbound = next_frame(&mut ws_rx, state.config.idle_timeout) => inbound,
            _ = &mut writer => {
                writer_finished = true;
                break SessionEnd::WriterFailed;
            }
            _ = shutdown_requested(&mut shutdown) => break SessionEnd::Shutdown,
        };

        let message = match inbound {
            Inbound::Frame(message) => message,
            Inbound::Ended => break SessionEnd::ClientClosed,
            Inbound::IdleTimeout => break SessionEnd::IdleTimeout,
            Inbound::Failed(err) => {
                debug!(connection_id = %connection_id, error = %err, "error receiving frame");
                break SessionEnd::TransportError;
            }
        };

        let disposition = match message {
            Message::Text(text) => state.router.dispatch(&mut peer, &text),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => state.router.dispatch(&mut peer, text),
                Err(_) => {
                    debug!(
                        connection_id = %connection_id,
                        len = bytes.len(),
                        "dropping non-UTF8 binary frame"
                    );
                    counter!(
                        "beach_pier_frames_malformed_total",
                        1,
                        "reason" => DecodeError::NotUtf8.metric_label()
                    );
                    Disposition::Continue
                }
            },
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break SessionEnd::ClientClosed;
            }
            Message::Ping(_) | Message::Pong(_) => Disposition::Continue,
        };

        if disposition == Disposition::Terminate {
            break SessionEnd::Rejected;
        }
    };

    if let Some(identity) = peer.close() {
        let registry = state.registry();
        if !registry.unregister(&identity, connection_id) {
            warn!(
                connection_id = %connection_id,
                identity = %identity,
                "registered identity was already gone at cleanup"
            );
        }
        registry.broadcast_roster();
        info!(
            connection_id = %connection_id,
            identity = %identity,
            reason = end.metric_label(),
            "peer unregistered"
        );
    }

    // Dropping the last handle lets the writer flush what is queued (such as
    // a rejection notice) and send a close frame.
    drop(peer);
    if !writer_finished && timeout(state.config.write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }

    counter!("beach_pier_session_end_total", 1, "reason" => end.metric_label());
    decrement_gauge!("beach_pier_connections_active", 1.0);
    debug!(
        connection_id = %connection_id,
        reason = end.metric_label(),
        "websocket disconnected"
    );
}

async fn next_frame(
    ws_rx: &mut futures_util::stream::SplitStream<WebSocket>,
    idle_timeout: Option<Duration>,
) -> Inbound {
    let next = match idle_timeout {
        Some(limit) => match timeout(limit, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::IdleTimeout,
        },
        None => ws_rx.next().await,
    };
    match next {
        Some(Ok(message)) => Inbound::Frame(message),
        Some(Err(err)) => Inbound::Failed(err),
        None => Inbound::Ended,
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drains the peer's outbound queue into its socket, interleaving keepalive
/// pings. Returns when the queue closes or a write fails or stalls.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    ping_interval: Option<Duration>,
    write_timeout: Duration,
    connection_id: Uuid,
) {
    let mut keepalive = ping_interval.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let outbound = tokio::select! {
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = next_tick(&mut keepalive) => Message::Ping(Vec::new()),
        };

        match timeout(write_timeout, ws_tx.send(outbound)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(connection_id = %connection_id, error = %err, "websocket write failed");
                return;
            }
            Err(_) => {
                warn!(
                    connection_id = %connection_id,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "websocket write stalled; dropping peer"
                );
                counter!("beach_pier_outbound_dropped_total", 1, "reason" => "write_timeout");
                return;
            }
        }
    }

    let _ = timeout(write_timeout, ws_tx.send(Message::Close(None))).await;
    debug!(connection_id = %connection_id, "writer task finished");
}

async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
