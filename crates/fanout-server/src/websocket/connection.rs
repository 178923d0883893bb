//! Per-connection state shared between the session tasks, the registry and
//! the broadcast engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use fanout_core::{ConnectionId, SendFailure};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{InvalidTransition, LifecycleState};

/// An encoded text frame. Clones share the underlying buffer, so one
/// serialized event can be queued on every connection without copying.
pub type Frame = Utf8Bytes;

/// A subscriber connection as seen by the rest of the server.
///
/// The socket itself is owned by the session's writer task; everything else
/// talks to it through the bounded outbound queue.
pub struct Connection {
    id: ConnectionId,
    accepted_at: DateTime<Utc>,
    state: Mutex<LifecycleState>,
    tx: mpsc::Sender<Frame>,
    close: CancellationToken,
    /// Whether the peer has answered since the last heartbeat tick.
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    ///
    /// `close` is cancelled to ask the session to shut this connection down;
    /// pass a child of the server shutdown token so shutdown reaches it.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Frame>, close: CancellationToken) -> Self {
        Self {
            id,
            accepted_at: Utc::now(),
            state: Mutex::new(LifecycleState::Connecting),
            tx,
            close,
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Server-assigned id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wall-clock accept time.
    pub fn accepted_at(&self) -> DateTime<Utc> {
        self.accepted_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: LifecycleState) -> Result<LifecycleState, InvalidTransition> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        *state = next;
        Ok(from)
    }

    /// Enter `Closing` if the connection is still `Open`.
    ///
    /// Returns `true` if this call made the transition.
    pub fn begin_closing(&self) -> bool {
        self.transition(LifecycleState::Closing).is_ok()
    }

    /// Queue a frame for the writer task, waiting at most `timeout` for room.
    ///
    /// A close requested while waiting ends the send with
    /// [`SendFailure::Closed`].
    pub async fn send(&self, frame: Frame, timeout: Duration) -> Result<(), SendFailure> {
        if !self.state().accepts_sends() || self.close.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        let sent = tokio::select! {
            biased;
            () = self.close.cancelled() => return Err(SendFailure::Closed),
            sent = self.tx.send_timeout(frame, timeout) => sent,
        };
        match sent {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SendFailure::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(SendTimeoutError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    /// Ask the session to close this connection. Idempotent.
    pub fn request_close(&self) {
        self.close.cancel();
    }

    /// Whether a close has been requested (locally or by shutdown).
    pub fn close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once a close has been requested.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }

    /// The connection's close token.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Whether the connection is dead but still referenced: terminal state,
    /// or the writer task has dropped its end of the queue.
    pub fn is_stale(&self) -> bool {
        self.state().is_terminal() || self.tx.is_closed()
    }

    /// Record inbound traffic (pong or any frame) from the peer.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the peer was heard from since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the peer was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("accepted_at", &self.accepted_at)
            .field("close_requested", &self.close_requested())
            .finish_non_exhaustive()
    }
}
