//! Fan-out of value-change events to every live connection.
//!
//! Each publish:
//! 1. takes the ordering lock and stamps the next sequence number
//! 2. serializes the event once into a shared [`Frame`]
//! 3. snapshots the registry
//! 4. hands the frame to every snapshot member concurrently, each bounded by
//!    the send timeout
//! 5. removes and closes members that failed
//!
//! The ordering lock is held until step 5 finishes, so every connection sees
//! events in the order they were published.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fanout_core::{ConnectionId, FanoutError, Result, SendFailure, ValueChangeEvent};
use futures::future::join_all;
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::connection::Frame;
use super::lifecycle::LifecycleState;
use super::registry::ConnectionRegistry;
use crate::metrics::{
    BROADCAST_DELIVERED_TOTAL, BROADCAST_DURATION_SECONDS, BROADCAST_EVENTS_TOTAL,
    BROADCAST_FAILED_TOTAL,
};

/// Outcome of one publish.
///
/// Every member of the snapshot ends up in exactly one of `delivered` or
/// `failed`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Sequence number assigned to the event.
    pub sequence: u64,
    /// Connections the frame was handed to.
    pub delivered: BTreeSet<ConnectionId>,
    /// Connections that could not take the frame, with the reason.
    pub failed: BTreeMap<ConnectionId, SendFailure>,
}

impl BroadcastResult {
    /// Snapshot size: delivered plus failed.
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    /// Whether every snapshot member received the frame.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Publishes events to the connections in a [`ConnectionRegistry`].
pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
    /// Last assigned sequence; the lock serializes publishes.
    sequence: Mutex<u64>,
    last_sequence: AtomicU64,
}

impl BroadcastEngine {
    /// Create an engine over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
            sequence: Mutex::new(0),
            last_sequence: AtomicU64::new(0),
        }
    }

    /// The registry this engine reads from.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Sequence of the most recently published event, `0` if none.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Publish `event` to every currently registered connection.
    ///
    /// Per-connection failures never fail the publish; they are reported in
    /// the result and the affected connections are unregistered and asked to
    /// close. Only an unavailable registry or an encoding error is returned
    /// as `Err`, and in that case no sequence number is consumed.
    pub async fn publish(&self, event: ValueChangeEvent) -> Result<BroadcastResult> {
        let mut last = self.sequence.lock().await;
        if !self.registry.is_available() {
            return Err(FanoutError::RegistryUnavailable);
        }

        let sequence = *last + 1;
        let event = event.with_sequence(sequence);
        let frame = Frame::from(event.to_wire_json()?);
        *last = sequence;
        self.last_sequence.store(sequence, Ordering::Release);

        let started = Instant::now();
        let targets = self.registry.snapshot_live();
        let timeout = self.send_timeout;
        let outcomes = join_all(targets.iter().map(|conn| {
            let frame = frame.clone();
            async move { conn.send(frame, timeout).await }
        }))
        .await;

        let mut result = BroadcastResult {
            sequence,
            ..BroadcastResult::default()
        };
        for (conn, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    let _ = result.delivered.insert(conn.id());
                }
                Err(failure) => {
                    if failure == SendFailure::Closed && conn.state() != LifecycleState::Open {
                        debug!(conn_id = %conn.id(), sequence, state = %conn.state(), "connection closing, skipped");
                    } else {
                        warn!(conn_id = %conn.id(), sequence, error = %failure, "delivery failed, dropping connection");
                    }
                    let _ = self.registry.unregister(conn.id());
                    conn.request_close();
                    counter!(BROADCAST_FAILED_TOTAL, "reason" => failure_label(&failure))
                        .increment(1);
                    let _ = result.failed.insert(conn.id(), failure);
                }
            }
        }
        drop(last);

        counter!(BROADCAST_EVENTS_TOTAL).increment(1);
        counter!(BROADCAST_DELIVERED_TOTAL).increment(result.delivered.len() as u64);
        histogram!(BROADCAST_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(
            sequence,
            recipients = result.recipients(),
            delivered = result.delivered.len(),
            failed = result.failed.len(),
            "broadcast complete"
        );
        Ok(result)
    }
}

fn failure_label(failure: &SendFailure) -> &'static str {
    match failure {
        SendFailure::Closed => "closed",
        SendFailure::Timeout { .. } => "timeout",
    }
}
