//! # fanout-server
//!
//! Axum HTTP + `WebSocket` server that fans value-change events out to every
//! connected subscriber.
//!
//! - Connection registry with snapshot reads for broadcast
//! - Broadcast engine: one encode per event, per-connection send timeout,
//!   failed connections dropped without affecting the rest
//! - Lifecycle supervisor: `Connecting → Open → Closing → Closed`, heartbeat,
//!   bounded close handshake
//! - Ingest endpoint and publisher client for feeding values in
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod client;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod source;
pub mod websocket;

pub use client::{ClientError, PublisherClient};
pub use server::FanoutServer;
pub use source::{ChannelEventSource, EventSource};
pub use websocket::broadcast::{BroadcastEngine, BroadcastResult};
pub use websocket::registry::ConnectionRegistry;
