//! Ingest endpoint: a publisher pushes values as text frames.
//!
//! Ingest sockets are never registered as subscribers and receive nothing
//! but control frames.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::SinkExt;
use metrics::counter;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::metrics::INGEST_VALUES_TOTAL;
use crate::source::EventSource;

/// Convert one inbound frame into a value, if it carries one.
///
/// Text frames are taken verbatim; binary frames only if they are UTF-8.
pub(crate) fn frame_value(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.as_str().to_owned()),
        Message::Binary(data) => std::str::from_utf8(data).ok().map(str::to_owned),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

/// Read values from a publisher socket into `source` until the publisher
/// disconnects or `shutdown` fires.
#[instrument(skip_all)]
pub async fn run_ingest_session(
    mut ws: WebSocket,
    source: Arc<dyn EventSource>,
    shutdown: CancellationToken,
    close_timeout: Duration,
) {
    info!("publisher connected");
    let mut received: u64 = 0;

    let shutting_down = loop {
        let msg = tokio::select! {
            biased;
            () = shutdown.cancelled() => break true,
            msg = ws.recv() => msg,
        };

        match msg {
            Some(Ok(Message::Close(_))) | None => break false,
            Some(Ok(msg)) => match frame_value(&msg) {
                Some(value) => {
                    received += 1;
                    counter!(INGEST_VALUES_TOTAL).increment(1);
                    source.emit(value);
                }
                None if matches!(msg, Message::Binary(_)) => {
                    warn!("ignoring non-UTF-8 binary frame from publisher");
                }
                None => {}
            },
            Some(Err(e)) => {
                debug!(error = %e, "publisher read failed");
                break false;
            }
        }
    };

    let closing = async {
        if shutting_down {
            let frame = CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            };
            let _ = ws.send(Message::Close(Some(frame))).await;
        }
        // Flushes our Close frame or the reply to the publisher's.
        let _ = SinkExt::close(&mut ws).await;
    };
    if timeout(close_timeout, closing).await.is_err() {
        debug!("publisher close handshake timed out");
    }

    info!(received, "publisher disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_is_a_value() {
        let msg = Message::Text("42".into());
        assert_eq!(frame_value(&msg).as_deref(), Some("42"));
    }

    #[test]
    fn utf8_binary_frame_is_a_value() {
        let msg = Message::Binary(b"hello".to_vec().into());
        assert_eq!(frame_value(&msg).as_deref(), Some("hello"));
    }

    #[test]
    fn invalid_binary_frame_is_ignored() {
        let msg = Message::Binary(vec![0xff, 0xfe].into());
        assert_eq!(frame_value(&msg), None);
    }

    #[test]
    fn control_frames_are_ignored() {
        assert_eq!(frame_value(&Message::Ping(vec![].into())), None);
        assert_eq!(frame_value(&Message::Pong(vec![].into())), None);
        assert_eq!(frame_value(&Message::Close(None)), None);
    }

    #[test]
    fn empty_text_is_still_a_value() {
        assert_eq!(frame_value(&Message::Text("".into())).as_deref(), Some(""));
    }
}
