//! Publisher client: connects to an ingest endpoint and emits values.
//!
//! The client does not reconnect. Once the connection drops, further
//! `emit` calls are logged and discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::source::EventSource;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for the server to answer the Close frame.
const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors from the publisher client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connect or WebSocket handshake failed.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying transport error.
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    /// Connect + handshake did not finish in time.
    #[error("connecting to {url} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target URL.
        url: String,
        /// The bound that was exceeded.
        timeout_ms: u64,
    },

    /// The connection is already gone.
    #[error("publisher connection closed")]
    Closed,
}

enum Command {
    Emit(String),
    Close(oneshot::Sender<()>),
}

/// A connected publisher.
pub struct PublisherClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
    handler: JoinHandle<()>,
}

impl PublisherClient {
    /// Connect to `url` (a `ws://` or `wss://` ingest endpoint).
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, ClientError> {
        let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| ClientError::Timeout {
                url: url.to_string(),
                timeout_ms: u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|e| ClientError::Connect {
                url: url.to_string(),
                source: Box::new(e),
            })?;
        info!(url, "publisher connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let handler = tokio::spawn(publisher_loop(ws, cmd_rx, connected.clone()));

        Ok(Self {
            url: url.to_string(),
            cmd_tx,
            connected,
            handler,
        })
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Flush values already emitted, send a Close frame and wait for the
    /// connection to wind down.
    pub async fn close(self) -> Result<(), ClientError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close(done_tx))
            .map_err(|_| ClientError::Closed)?;
        let acknowledged = done_rx.await.is_ok();
        let _ = self.handler.await;
        if acknowledged {
            Ok(())
        } else {
            Err(ClientError::Closed)
        }
    }
}

impl EventSource for PublisherClient {
    fn emit(&self, value: String) {
        if self.cmd_tx.send(Command::Emit(value)).is_err() {
            warn!(url = %self.url, "publisher connection closed, dropping value");
        }
    }
}

impl std::fmt::Debug for PublisherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherClient")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

async fn publisher_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    connected: Arc<AtomicBool>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Emit(value)) => {
                    if let Err(e) = ws_tx.send(Message::text(value)).await {
                        warn!(error = %e, "failed to send value");
                        break;
                    }
                }
                Some(Command::Close(done)) => {
                    let _ = ws_tx.close().await;
                    let _ = tokio::time::timeout(CLOSE_REPLY_TIMEOUT, async {
                        while let Some(Ok(msg)) = ws_rx.next().await {
                            if msg.is_close() {
                                break;
                            }
                        }
                    })
                    .await;
                    let _ = done.send(());
                    break;
                }
                None => {
                    let _ = ws_tx.close().await;
                    break;
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    info!(reason = ?frame.map(|f| f.reason.as_str().to_owned()), "server closed publisher connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "publisher connection failed");
                    break;
                }
                None => {
                    debug!("publisher stream ended");
                    break;
                }
            },
        }
    }

    connected.store(false, Ordering::Relaxed);
}
