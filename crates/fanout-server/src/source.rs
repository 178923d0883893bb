//! Event sources feeding the broadcast engine.

use std::sync::Arc;

use fanout_core::{FanoutError, ValueChangeEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::websocket::broadcast::BroadcastEngine;

/// Something that produces value changes.
///
/// `emit` is fire-and-forget: it never blocks on delivery and never reports
/// per-subscriber outcomes.
pub trait EventSource: Send + Sync {
    /// Announce that the value changed to `value`.
    fn emit(&self, value: String);
}

/// In-process source backed by an unbounded queue.
///
/// Values are timestamped on `emit` and published by [`run_event_pump`] in
/// the order they were emitted.
#[derive(Clone, Debug)]
pub struct ChannelEventSource {
    tx: mpsc::UnboundedSender<ValueChangeEvent>,
}

impl ChannelEventSource {
    /// Create a source and the receiver its pump drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ValueChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Whether the pump is still draining this source.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl EventSource for ChannelEventSource {
    fn emit(&self, value: String) {
        if self.tx.send(ValueChangeEvent::new(value)).is_err() {
            debug!("event pump stopped, dropping value");
        }
    }
}

/// Drain `rx` into `engine` until the channel closes or `cancel` fires.
///
/// Returns the number of events published.
pub async fn run_event_pump(
    mut rx: mpsc::UnboundedReceiver<ValueChangeEvent>,
    engine: Arc<BroadcastEngine>,
    cancel: CancellationToken,
) -> u64 {
    let mut published = 0;
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match engine.publish(event).await {
            Ok(result) => {
                published += 1;
                if !result.is_complete() {
                    warn!(
                        sequence = result.sequence,
                        failed = result.failed.len(),
                        "broadcast dropped connections"
                    );
                }
            }
            Err(FanoutError::RegistryUnavailable) => {
                debug!("registry closed, stopping event pump");
                break;
            }
            Err(e) => warn!(error = %e, "failed to publish event"),
        }
    }
    info!(published, "event pump stopped");
    published
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fanout_core::ConnectionId;

    use crate::websocket::connection::{Connection, Frame};
    use crate::websocket::lifecycle::LifecycleState;
    use crate::websocket::registry::ConnectionRegistry;

    fn engine_with_subscriber() -> (Arc<BroadcastEngine>, mpsc::Receiver<Frame>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(Connection::new(
            ConnectionId::from_raw(1),
            tx,
            CancellationToken::new(),
        ));
        registry.register(conn.clone()).unwrap();
        let _ = conn.transition(LifecycleState::Open).unwrap();
        let engine = Arc::new(BroadcastEngine::new(registry, Duration::from_secs(1)));
        (engine, rx)
    }

    fn value_of(frame: &Frame) -> String {
        let json: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
        json["value"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn pump_publishes_in_emission_order() {
        let (engine, mut rx) = engine_with_subscriber();
        let (source, events) = ChannelEventSource::new();
        for value in ["one", "two", "three"] {
            source.emit(value.to_string());
        }
        drop(source);

        let published = run_event_pump(events, engine.clone(), CancellationToken::new()).await;
        assert_eq!(published, 3);
        assert_eq!(engine.last_sequence(), 3);

        let mut seen = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            seen.push(value_of(&frame));
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn pump_stops_on_cancel() {
        let (engine, _rx) = engine_with_subscriber();
        let (source, events) = ChannelEventSource::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_event_pump(events, engine, cancel.clone()));

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 0);
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn pump_stops_when_registry_closes() {
        let (engine, _rx) = engine_with_subscriber();
        engine.registry().close();
        let (source, events) = ChannelEventSource::new();
        source.emit("late".to_string());

        let published = run_event_pump(events, engine, CancellationToken::new()).await;
        assert_eq!(published, 0);
    }

    #[test]
    fn emit_after_pump_gone_is_silent() {
        let (source, events) = ChannelEventSource::new();
        drop(events);
        assert!(!source.is_open());
        source.emit("nobody listening".to_string());
    }

    #[test]
    fn source_is_object_safe() {
        let (source, _events) = ChannelEventSource::new();
        let boxed: Arc<dyn EventSource> = Arc::new(source);
        boxed.emit("x".to_string());
    }
}
