//! Subscriber session lifecycle, from accepted upgrade to cleanup.
//!
//! One session per connection:
//! 1. `Connecting`: send `connection.established`, move to `Open`, register
//! 2. spawn the writer (sole owner of the socket sink) and the heartbeat
//! 3. read until the peer closes, the transport fails or a close is requested
//! 4. `Closing`: unregister, then a close handshake bounded by the close
//!    timeout
//! 5. `Closed`

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use fanout_core::{ConnectionId, ConnectionIdAllocator, HandshakeFailure, WireMessage};
use fanout_settings::ServerSettings;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{Connection, Frame};
use super::heartbeat::{HeartbeatResult, run_heartbeat, ticker};
use super::lifecycle::LifecycleState;
use super::registry::ConnectionRegistry;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Timing and sizing knobs for subscriber sessions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on queueing one frame and on writing one frame to the socket.
    pub send_timeout: Duration,
    /// Bound on each phase of the close handshake.
    pub close_timeout: Duration,
    /// Ping cadence.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is closed.
    pub heartbeat_timeout: Duration,
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Upgrades beyond this many registered connections are refused.
    pub max_connections: usize,
}

impl From<&ServerSettings> for SessionConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            send_timeout: settings.send_timeout(),
            close_timeout: settings.close_timeout(),
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            queue_capacity: settings.send_queue_capacity,
            max_connections: settings.max_connections,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

/// Why a session left the `Open` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseCause {
    /// The peer sent a Close frame.
    PeerClosed,
    /// The stream ended without a Close frame.
    PeerGone,
    /// Reading from the socket failed.
    TransportError,
    /// Close requested locally: heartbeat, send failure or shutdown.
    Requested,
}

impl CloseCause {
    fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::PeerGone => "peer_gone",
            Self::TransportError => "transport_error",
            Self::Requested => "requested",
        }
    }
}

/// Admits subscriber upgrades and drives each connection through its
/// lifecycle.
pub struct LifecycleSupervisor {
    registry: Arc<ConnectionRegistry>,
    ids: ConnectionIdAllocator,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl LifecycleSupervisor {
    /// Create a supervisor. Cancelling `shutdown` closes every session it
    /// runs.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            ids: ConnectionIdAllocator::new(),
            config,
            shutdown,
        }
    }

    /// The registry sessions register into.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Decide whether a new upgrade may proceed.
    pub fn admit(&self) -> Result<(), HandshakeFailure> {
        if self.shutdown.is_cancelled() || !self.registry.is_available() {
            return Err(HandshakeFailure::ShuttingDown);
        }
        if self.registry.count() >= self.config.max_connections {
            return Err(HandshakeFailure::CapacityReached {
                max: self.config.max_connections,
            });
        }
        Ok(())
    }

    /// Run a subscriber session on an upgraded socket until it is closed.
    pub async fn serve(&self, ws: WebSocket) {
        let id = self.ids.next_id();
        self.run_session(ws, id).await;
    }

    #[instrument(skip_all, fields(conn_id = %id))]
    async fn run_session(&self, ws: WebSocket, id: ConnectionId) {
        let (mut sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::channel::<Frame>(self.config.queue_capacity);
        let conn = Arc::new(Connection::new(id, tx, self.shutdown.child_token()));

        // The greeting is written before registration so it always precedes
        // broadcast frames.
        if let Err(e) = self.send_greeting(&mut sink, id).await {
            warn!(error = %e, "failed to send greeting, aborting handshake");
            let _ = conn.transition(LifecycleState::Closed);
            return;
        }

        let _ = conn.transition(LifecycleState::Open);
        if let Err(e) = self.registry.register(conn.clone()) {
            warn!(error = %e, "registration refused");
            let _ = conn.begin_closing();
            let _ = conn.transition(LifecycleState::Closed);
            let _ = timeout(
                self.config.close_timeout,
                close_sink(&mut sink, close_code::AWAY, "server unavailable"),
            )
            .await;
            return;
        }

        let started = Instant::now();
        info!("subscriber connected");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

        let mut writer = tokio::spawn(run_writer(
            sink,
            rx,
            conn.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        ));
        let heartbeat = self.spawn_heartbeat(&conn);

        let cause = read_until_close(&mut stream, &conn).await;

        let _ = conn.begin_closing();
        let _ = self.registry.unregister(id);
        conn.request_close();
        debug!(cause = cause.as_str(), "closing");

        if cause == CloseCause::Requested {
            // Our Close frame is on its way; give the peer time to answer.
            if timeout(self.config.close_timeout, await_peer_close(&mut stream))
                .await
                .is_err()
            {
                debug!("peer did not complete close handshake in time");
            }
        }
        drop(stream);

        if timeout(self.config.close_timeout, &mut writer).await.is_err() {
            warn!("writer did not finish within close timeout, aborting");
            writer.abort();
        }
        heartbeat.abort();

        let _ = conn.transition(LifecycleState::Closed);

        counter!(WS_DISCONNECTIONS_TOTAL, "cause" => cause.as_str()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            cause = cause.as_str(),
            accepted_at = %conn.accepted_at(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "subscriber disconnected"
        );
    }

    async fn send_greeting(
        &self,
        sink: &mut SplitSink<WebSocket, Message>,
        id: ConnectionId,
    ) -> Result<(), String> {
        let json = serde_json::to_string(&WireMessage::established(id)).map_err(|e| e.to_string())?;
        match timeout(self.config.send_timeout, sink.send(Message::Text(json.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timed out".to_string()),
        }
    }

    fn spawn_heartbeat(&self, conn: &Arc<Connection>) -> JoinHandle<()> {
        let conn = conn.clone();
        let interval = self.config.heartbeat_interval;
        let limit = self.config.heartbeat_timeout;
        tokio::spawn(async move {
            let result = run_heartbeat(conn.clone(), interval, limit, conn.close_token()).await;
            if result == HeartbeatResult::TimedOut {
                warn!(
                    conn_id = %conn.id(),
                    idle_ms = u64::try_from(conn.idle_for().as_millis()).unwrap_or(u64::MAX),
                    "heartbeat timed out"
                );
                conn.request_close();
            }
        })
    }

    /// Periodically drop registry entries whose session is gone without
    /// having unregistered. Stops on shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = ticker(every);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for conn in this.registry.remove_where(Connection::is_stale) {
                            warn!(conn_id = %conn.id(), state = %conn.state(), "reaped stale connection");
                            conn.request_close();
                        }
                    }
                }
            }
        })
    }
}

async fn read_until_close(stream: &mut SplitStream<WebSocket>, conn: &Connection) -> CloseCause {
    loop {
        tokio::select! {
            biased;
            () = conn.closed() => return CloseCause::Requested,
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    debug!(code = frame.as_ref().map(|f| f.code), "peer sent close frame");
                    return CloseCause::PeerClosed;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.mark_alive(),
                Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                    // Subscribers have nothing to say; the frame only counts
                    // as activity.
                    conn.mark_alive();
                }
                Some(Err(e)) => {
                    debug!(error = %e, "read failed");
                    return CloseCause::TransportError;
                }
                None => return CloseCause::PeerGone,
            },
        }
    }
}

async fn await_peer_close(stream: &mut SplitStream<WebSocket>) {
    while let Some(Ok(msg)) = stream.next().await {
        if matches!(msg, Message::Close(_)) {
            return;
        }
    }
}

/// Sole writer for one socket: drains the outbound queue, sends pings and
/// finishes with a Close frame.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    conn: Arc<Connection>,
    config: SessionConfig,
    shutdown: CancellationToken,
) {
    let mut ping = ticker(config.heartbeat_interval);
    let _ = ping.tick().await;

    loop {
        let outgoing = tokio::select! {
            biased;
            () = conn.closed() => break,
            frame = rx.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => break,
            },
            _ = ping.tick() => Message::Ping(vec![].into()),
        };
        match timeout(config.send_timeout, sink.send(outgoing)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "socket write failed");
                conn.request_close();
                break;
            }
            Err(_) => {
                warn!(
                    conn_id = %conn.id(),
                    timeout_ms = u64::try_from(config.send_timeout.as_millis()).unwrap_or(u64::MAX),
                    "socket write timed out"
                );
                conn.request_close();
                break;
            }
        }
    }

    let (code, reason) = if shutdown.is_cancelled() {
        (close_code::AWAY, "server shutting down")
    } else {
        (close_code::NORMAL, "closing")
    };
    let _ = timeout(config.close_timeout, close_sink(&mut sink, code, reason)).await;
}

/// Send a Close frame and flush. If the peer already closed, this only
/// flushes the automatic close reply.
async fn close_sink(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
